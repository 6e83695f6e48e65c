//! Error types for the credential vault.
//!
//! Only [`VaultError`] crosses the public engine surface. TPM and codec
//! failures are absorbed inside the engine (fallback on write, "no value" on
//! read) and exist as types so the absorbing code can log what happened.

use crate::store::StoreError;

/// Errors surfaced by [`VaultEngine`](crate::engine::VaultEngine) and the
/// boundary dispatcher.
#[derive(Debug, thiserror::Error)]
pub enum VaultError {
    /// Malformed or missing caller input. Raised before any platform call.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The platform secret store refused a write, delete or enumeration.
    #[error("credential store error: {0}")]
    CredentialStore(#[from] StoreError),

    /// A bulk delete matched entries that could not all be removed.
    /// Every match was still attempted.
    #[error("failed to delete {} of {} matching credentials", failed.len(), failed.len() + deleted)]
    PartialDelete {
        /// Qualified names whose deletion failed.
        failed: Vec<String>,
        /// How many matches were removed.
        deleted: usize,
    },

    /// The requested operation name is not recognised.
    #[error("method not implemented: {0}")]
    NotImplemented(String),
}

/// Failure kinds reported to the caller of the boundary dispatcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    InvalidArgument,
    CredentialError,
    NotImplemented,
}

impl ErrorKind {
    /// The wire code for this failure kind.
    pub fn code(self) -> &'static str {
        match self {
            ErrorKind::InvalidArgument => "INVALID_ARGUMENT",
            ErrorKind::CredentialError => "CREDENTIAL_ERROR",
            ErrorKind::NotImplemented => "NOT_IMPLEMENTED",
        }
    }
}

impl VaultError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            VaultError::InvalidArgument(_) => ErrorKind::InvalidArgument,
            VaultError::CredentialStore(_) | VaultError::PartialDelete { .. } => {
                ErrorKind::CredentialError
            }
            VaultError::NotImplemented(_) => ErrorKind::NotImplemented,
        }
    }
}

pub type Result<T> = std::result::Result<T, VaultError>;
