//! The platform secret store contract.
//!
//! A secret store is a name-keyed blob + metadata vault. The engine only ever
//! talks to it through [`PlatformSecretStore`]; the durable implementation
//! lives in [`crate::kv`] and an in-memory one in [`crate::memory`].

use crate::secret::{CredentialSummary, StoredCredential};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// No slot exists under this name.
    #[error("credential not found: {name}")]
    NotFound { name: String },

    #[error("store backend error: {0}")]
    Backend(#[from] sled::Error),

    #[error("failed to encode credential record: {0}")]
    Encode(#[from] bincode::error::EncodeError),

    #[error("failed to decode credential record: {0}")]
    Decode(#[from] bincode::error::DecodeError),

    /// Sealing or unsealing the blob under the per-user key failed.
    #[error("at-rest protection failed for {name}")]
    Protection { name: String },

    /// The per-user protection key could not be loaded or created.
    #[error("user key error: {0}")]
    UserKey(#[from] crate::crypt::CryptError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("store lock poisoned")]
    Poisoned,

    /// The store cannot service requests right now.
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

impl StoreError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound { .. })
    }
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Operational contract over the host credential vault.
///
/// Implementations must make each call atomic per name. The engine adds no
/// locking of its own.
pub trait PlatformSecretStore {
    /// Writes (or replaces) the slot named `credential.name`.
    fn write(&self, credential: &StoredCredential) -> StoreResult<()>;

    /// Reads a slot. Returns [`StoreError::NotFound`] when absent.
    fn read(&self, name: &str) -> StoreResult<StoredCredential>;

    /// Whether a slot exists, without unsealing or decoding it.
    fn contains(&self, name: &str) -> StoreResult<bool>;

    /// Deletes a slot. Returns [`StoreError::NotFound`] when absent.
    fn delete(&self, name: &str) -> StoreResult<()>;

    /// Lists every slot in the store, unfiltered.
    fn enumerate(&self) -> StoreResult<Vec<CredentialSummary>>;
}

impl<S: PlatformSecretStore + ?Sized> PlatformSecretStore for &S {
    fn write(&self, credential: &StoredCredential) -> StoreResult<()> {
        (**self).write(credential)
    }

    fn read(&self, name: &str) -> StoreResult<StoredCredential> {
        (**self).read(name)
    }

    fn contains(&self, name: &str) -> StoreResult<bool> {
        (**self).contains(name)
    }

    fn delete(&self, name: &str) -> StoreResult<()> {
        (**self).delete(name)
    }

    fn enumerate(&self) -> StoreResult<Vec<CredentialSummary>> {
        (**self).enumerate()
    }
}
