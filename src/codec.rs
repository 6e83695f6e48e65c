//! Credential encoding.
//!
//! A stored credential is either OS-protected or TPM-protected. The choice is
//! made once, at encode time, and travels with the record as a
//! [`Protection`] marker. Decoding branches on that marker before looking at
//! a single ciphertext byte.
//!
//! - OS: the plaintext is stored as UTF-16LE; the platform store is
//!   responsible for wrapping it under the user's protection.
//! - TPM: the UTF-8 plaintext is encrypted under the vault key with PKCS#1
//!   v1.5 padding.

use bincode::{Decode, Encode};
use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};
use zeroize::Zeroizing;

use crate::tpm::{TpmError, TpmKeyProvider};

/// Which backend protects a stored credential.
#[derive(Serialize, Deserialize, Encode, Decode, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Protection {
    /// Per-user protection applied by the platform store.
    Os,
    /// Asymmetric encryption under the TPM-resident vault key.
    Tpm,
}

impl Protection {
    /// Owner label recorded with the credential.
    pub fn owner_label(&self) -> &'static str {
        match self {
            Protection::Os => "credvault",
            Protection::Tpm => "credvault_tpm",
        }
    }

    pub fn comment(&self) -> &'static str {
        match self {
            Protection::Os => "credvault secure storage",
            Protection::Tpm => "credvault TPM-protected storage",
        }
    }
}

/// Ciphertext together with the marker saying how to read it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ciphertext {
    pub protection: Protection,
    pub bytes: Vec<u8>,
}

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    /// OS-path bytes are not a whole number of UTF-16 code units.
    #[error("wide text has odd length {0}")]
    OddLength(usize),

    #[error("wide text is not valid UTF-16")]
    InvalidWide,

    #[error("TPM plaintext is not valid UTF-8")]
    InvalidUtf8,

    #[error(transparent)]
    Tpm(#[from] TpmError),
}

/// OS path: UTF-8 in, UTF-16LE bytes out.
pub fn encode_os(plaintext: &str) -> Ciphertext {
    let bytes = plaintext
        .encode_utf16()
        .flat_map(|unit| unit.to_le_bytes())
        .collect();
    Ciphertext {
        protection: Protection::Os,
        bytes,
    }
}

/// OS path: UTF-16LE bytes back to UTF-8.
pub fn decode_os(bytes: &[u8]) -> Result<SecretString, CodecError> {
    if bytes.len() % 2 != 0 {
        return Err(CodecError::OddLength(bytes.len()));
    }
    let units: Zeroizing<Vec<u16>> = Zeroizing::new(
        bytes
            .chunks_exact(2)
            .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
            .collect(),
    );
    let text = String::from_utf16(&units).map_err(|_| CodecError::InvalidWide)?;
    Ok(SecretString::from(text))
}

/// Encodes and decodes credential values for both protection paths.
pub struct CredentialCodec<'a, T> {
    tpm: &'a T,
}

impl<'a, T: TpmKeyProvider> CredentialCodec<'a, T> {
    pub fn new(tpm: &'a T) -> Self {
        Self { tpm }
    }

    /// TPM path: provisions or opens the vault key and encrypts the UTF-8
    /// plaintext under it. The key is released before returning.
    #[instrument(level = "debug", skip_all)]
    pub fn encode_tpm(&self, plaintext: &str) -> Result<Ciphertext, CodecError> {
        let mut key = self.tpm.provision_or_open()?;
        let bytes = self.tpm.encrypt(&mut key, plaintext.as_bytes())?;
        debug!(len = bytes.len(), "Encrypted credential under TPM key");
        Ok(Ciphertext {
            protection: Protection::Tpm,
            bytes,
        })
    }

    /// Decodes `bytes` according to `protection`.
    pub fn decode(&self, protection: Protection, bytes: &[u8]) -> Result<SecretString, CodecError> {
        match protection {
            Protection::Os => decode_os(bytes),
            Protection::Tpm => self.decode_tpm(bytes),
        }
    }

    #[instrument(level = "debug", skip_all)]
    fn decode_tpm(&self, bytes: &[u8]) -> Result<SecretString, CodecError> {
        let mut key = self.tpm.open()?;
        let plaintext = self.tpm.decrypt(&mut key, bytes)?;
        let text = std::str::from_utf8(&plaintext).map_err(|_| CodecError::InvalidUtf8)?;
        Ok(SecretString::from(text.to_owned()))
    }
}
