//! Runtime configuration and construction of the production vault.

use std::ffi::OsString;
use std::path::{Path, PathBuf};

use tracing::info;

use crate::engine::VaultEngine;
use crate::kv::SledSecretStore;
use crate::store::StoreResult;

#[cfg(feature = "tpm")]
use tss_esapi::TctiNameConf;

/// Overrides the store directory.
pub const DIR_ENV: &str = "CREDVAULT_DIR";
const APP_DIR: &str = "credvault";

#[cfg(feature = "tpm")]
pub type DefaultKeyProvider = crate::tpm::EsapiKeyProvider;
#[cfg(not(feature = "tpm"))]
pub type DefaultKeyProvider = crate::tpm::NoTpm;

/// The engine [`VaultConfig::open`] builds.
pub type DefaultVault = VaultEngine<SledSecretStore, DefaultKeyProvider>;

#[derive(Debug, Clone)]
pub struct VaultConfig {
    pub store_dir: PathBuf,
    /// How to reach the TPM.
    #[cfg(feature = "tpm")]
    pub tcti: TctiNameConf,
}

impl VaultConfig {
    pub fn new(store_dir: impl Into<PathBuf>) -> Self {
        Self {
            store_dir: store_dir.into(),
            #[cfg(feature = "tpm")]
            tcti: crate::tpm::default_tcti_handle(),
        }
    }

    /// Reads the configuration from the environment.
    ///
    /// The store lives in `$CREDVAULT_DIR`, falling back to
    /// `$XDG_DATA_HOME/credvault` and then `~/.local/share/credvault`. The
    /// TCTI comes from the usual tss variables and defaults to tabrmd.
    pub fn from_env() -> Self {
        Self::new(store_dir_from(|name| std::env::var_os(name)))
    }

    #[cfg(feature = "tpm")]
    pub fn with_tcti(mut self, tcti: TctiNameConf) -> Self {
        self.tcti = tcti;
        self
    }

    pub fn store_dir(&self) -> &Path {
        &self.store_dir
    }

    /// Opens the durable store and the key provider.
    pub fn open(&self) -> StoreResult<DefaultVault> {
        let store = SledSecretStore::open(&self.store_dir)?;
        #[cfg(feature = "tpm")]
        let tpm = crate::tpm::EsapiKeyProvider::new(self.tcti.clone());
        #[cfg(not(feature = "tpm"))]
        let tpm = crate::tpm::NoTpm;

        info!(path = %self.store_dir.display(), "Opened credential vault");
        Ok(VaultEngine::new(store, tpm))
    }
}

fn store_dir_from(lookup: impl Fn(&str) -> Option<OsString>) -> PathBuf {
    let non_empty = |name: &str| lookup(name).filter(|v| !v.is_empty());

    if let Some(dir) = non_empty(DIR_ENV) {
        return PathBuf::from(dir);
    }
    if let Some(data) = non_empty("XDG_DATA_HOME") {
        return PathBuf::from(data).join(APP_DIR);
    }
    match non_empty("HOME") {
        Some(home) => PathBuf::from(home).join(".local/share").join(APP_DIR),
        None => PathBuf::from(".").join(APP_DIR),
    }
}
