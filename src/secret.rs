use bincode::{Decode, Encode};
use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::codec::Protection;

/// Retention and visibility scope of a stored credential.
#[derive(Serialize, Deserialize, Encode, Decode, Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "camelCase")]
pub enum Persistence {
    /// Lives only as long as the current session.
    Session,
    /// Persists on this machine for the current user (default).
    #[default]
    LocalMachine,
    /// Persists and is visible to enterprise roaming.
    Enterprise,
}

impl Persistence {
    /// Parses a caller-supplied persistence name.
    ///
    /// Unknown names resolve to [`Persistence::LocalMachine`].
    pub fn from_name(name: &str) -> Self {
        match name {
            "session" => Persistence::Session,
            "enterprise" => Persistence::Enterprise,
            _ => Persistence::LocalMachine,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Persistence::Session => "session",
            Persistence::LocalMachine => "localMachine",
            Persistence::Enterprise => "enterprise",
        }
    }
}

/// Metadata stored next to a credential blob.
///
/// This is readable without unsealing the blob, which is what lets
/// enumeration and protection-marker lookups stay cheap.
#[derive(Serialize, Deserialize, Encode, Decode, Debug, Clone, PartialEq, Eq)]
pub struct CredentialMeta {
    /// Which backend produced the blob. Fixed at write time.
    pub protection: Protection,
    pub persistence: Persistence,
    /// Human-readable description, e.g. "credvault secure storage".
    pub comment: String,
    /// Label of the writer, distinguishing the two protection paths.
    pub owner: String,
    /// Seconds since the Unix epoch of the last write.
    pub last_written: u64,
}

impl CredentialMeta {
    /// Creates metadata for a write happening now.
    pub fn new(protection: Protection, persistence: Persistence) -> Self {
        let last_written = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or_default();
        Self {
            protection,
            persistence,
            comment: protection.comment().to_string(),
            owner: protection.owner_label().to_string(),
            last_written,
        }
    }
}

/// A credential as handed to and returned from a platform secret store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredCredential {
    /// The qualified name of the slot.
    pub name: String,
    /// Ciphertext produced by the codec. Its encoding depends on
    /// `meta.protection`.
    pub blob: Vec<u8>,
    pub meta: CredentialMeta,
}

impl StoredCredential {
    pub fn new(name: impl Into<String>, blob: Vec<u8>, meta: CredentialMeta) -> Self {
        Self {
            name: name.into(),
            blob,
            meta,
        }
    }
}

/// A name and its metadata, as yielded by enumeration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CredentialSummary {
    pub name: String,
    /// `None` when the stored record is unreadable. The name is still
    /// reported so the slot can be deleted.
    pub meta: Option<CredentialMeta>,
}
