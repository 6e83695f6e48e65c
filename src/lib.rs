//! A namespaced key-value credential vault.
//!
//! Every value is stored under exactly one protection scheme, picked at write
//! time and recorded with the entry:
//!
//! - **OS**: the value goes into the platform secret store, which seals it
//!   under a per-user key.
//! - **TPM**: the value is first encrypted under an RSA key that lives in the
//!   TPM, then stored. If the TPM cannot be used for any reason, the write
//!   falls back to OS protection.
//!
//! Keys are namespaced by a caller-supplied prefix, so several applications
//! can share one store and wipe only their own entries.
//!
//! ```no_run
//! use credvault::{VaultConfig, WriteOptions};
//! use secrecy::ExposeSecret;
//!
//! let vault = VaultConfig::from_env().open()?;
//! vault.set("token", "hunter2", Some("my.app"), WriteOptions::default().prefer_tpm(true))?;
//! if let Some(token) = vault.get("token", Some("my.app")) {
//!     assert_eq!(token.expose_secret(), "hunter2");
//! }
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

pub mod channel;
pub mod codec;
pub mod config;
pub mod crypt;
pub mod engine;
pub mod error;
pub mod kv;
pub mod memory;
pub mod secret;
pub mod store;
pub mod tpm;

pub use channel::{MethodCall, Reply, handle};
pub use codec::Protection;
pub use config::{DefaultVault, VaultConfig};
pub use engine::{DEFAULT_NAMESPACE, VaultEngine, WriteOptions};
pub use error::{ErrorKind, Result, VaultError};
pub use kv::SledSecretStore;
pub use secret::Persistence;
pub use store::{PlatformSecretStore, StoreError};
pub use tpm::{NoTpm, TpmKeyProvider};
