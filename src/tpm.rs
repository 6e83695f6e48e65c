//! Hardware-backed key provider.
//!
//! The vault shares a single persistent asymmetric key between every
//! TPM-protected credential. [`TpmKeyProvider`] is the contract the codec
//! drives: open or provision that key, then run encrypt/decrypt through a
//! size-probe-then-fill protocol. Key handles are RAII guards; dropping one
//! releases every resource it acquired.

use std::convert::Infallible;
use std::fmt;

use tracing::trace;

#[cfg(feature = "tpm")]
mod esapi;

#[cfg(feature = "tpm")]
pub use esapi::{EsapiKey, EsapiKeyProvider, VAULT_KEY_HANDLE, default_tcti_handle};

/// Direction of an asymmetric transform.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyOp {
    Encrypt,
    Decrypt,
}

impl fmt::Display for KeyOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeyOp::Encrypt => f.write_str("encrypt"),
            KeyOp::Decrypt => f.write_str("decrypt"),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TpmError {
    #[error("TPM not available: {0}")]
    Unavailable(String),

    /// Neither creating nor opening the vault key succeeded.
    #[error("failed to create or open the vault key: {0}")]
    Provision(String),

    /// The vault key does not exist yet.
    #[error("vault key not found")]
    KeyMissing,

    #[error("failed to finalize the vault key: {0}")]
    Finalize(String),

    #[error("{op} size probe failed: {reason}")]
    Probe { op: KeyOp, reason: String },

    #[error("{op} failed: {reason}")]
    Transform { op: KeyOp, reason: String },

    #[error("output buffer too small: need {needed} bytes, have {available}")]
    BufferTooSmall { needed: usize, available: usize },

    #[error("message of {len} bytes exceeds the {max} byte limit")]
    MessageTooLarge { len: usize, max: usize },

    #[cfg(feature = "tpm")]
    #[error("tss error: {0}")]
    Esapi(#[from] tss_esapi::Error),
}

/// Usage protocol of the platform key store.
///
/// `Key` owns whatever handles the provider acquired and must release them in
/// `Drop`, so every exit path (including `?`) gives them back.
pub trait TpmKeyProvider {
    type Key;

    /// Whether the hardware key store can be opened right now.
    fn is_available(&self) -> bool;

    /// Creates the vault key if it does not exist, otherwise opens it.
    /// The returned key is finalized and ready for use.
    fn provision_or_open(&self) -> Result<Self::Key, TpmError>;

    /// Opens the existing vault key without ever creating one.
    /// The returned key is finalized and ready for use.
    fn open(&self) -> Result<Self::Key, TpmError>;

    /// Size-probe phase: the output buffer length `transform` needs for `input`.
    fn output_len(&self, key: &mut Self::Key, op: KeyOp, input: &[u8])
    -> Result<usize, TpmError>;

    /// Fill phase: transforms `input` into `output` and returns the number of
    /// bytes written.
    fn transform(
        &self,
        key: &mut Self::Key,
        op: KeyOp,
        input: &[u8],
        output: &mut [u8],
    ) -> Result<usize, TpmError>;

    /// PKCS#1 v1.5 encryption under the vault key.
    fn encrypt(&self, key: &mut Self::Key, plaintext: &[u8]) -> Result<Vec<u8>, TpmError> {
        two_phase(self, key, KeyOp::Encrypt, plaintext)
    }

    /// PKCS#1 v1.5 decryption under the vault key.
    fn decrypt(
        &self,
        key: &mut Self::Key,
        ciphertext: &[u8],
    ) -> Result<zeroize::Zeroizing<Vec<u8>>, TpmError> {
        two_phase(self, key, KeyOp::Decrypt, ciphertext).map(zeroize::Zeroizing::new)
    }
}

fn two_phase<P: TpmKeyProvider + ?Sized>(
    provider: &P,
    key: &mut P::Key,
    op: KeyOp,
    input: &[u8],
) -> Result<Vec<u8>, TpmError> {
    let needed = provider.output_len(key, op, input)?;
    trace!(%op, needed, "size probe complete");

    let mut output = vec![0u8; needed];
    let written = provider.transform(key, op, input, &mut output)?;
    if written > needed {
        return Err(TpmError::BufferTooSmall {
            needed: written,
            available: needed,
        });
    }
    output.truncate(written);
    Ok(output)
}

/// A provider for hosts without a TPM. Never available.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoTpm;

impl TpmKeyProvider for NoTpm {
    type Key = Infallible;

    fn is_available(&self) -> bool {
        false
    }

    fn provision_or_open(&self) -> Result<Self::Key, TpmError> {
        Err(TpmError::Unavailable("built without TPM support".into()))
    }

    fn open(&self) -> Result<Self::Key, TpmError> {
        Err(TpmError::Unavailable("built without TPM support".into()))
    }

    fn output_len(&self, key: &mut Self::Key, _: KeyOp, _: &[u8]) -> Result<usize, TpmError> {
        match *key {}
    }

    fn transform(
        &self,
        key: &mut Self::Key,
        _: KeyOp,
        _: &[u8],
        _: &mut [u8],
    ) -> Result<usize, TpmError> {
        match *key {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{FailurePoint, MemoryKeyProvider};

    #[test]
    fn test_no_tpm_is_never_available() {
        assert!(!NoTpm.is_available());
        assert!(matches!(
            NoTpm.provision_or_open(),
            Err(TpmError::Unavailable(_))
        ));
        assert!(NoTpm.open().is_err());
    }

    #[test]
    fn test_two_phase_round_trip() {
        let provider = MemoryKeyProvider::new();
        let mut key = provider.provision_or_open().unwrap();

        let ciphertext = provider.encrypt(&mut key, b"hunter2").unwrap();
        assert_eq!(ciphertext.len(), MemoryKeyProvider::MODULUS_LEN);

        let plaintext = provider.decrypt(&mut key, &ciphertext).unwrap();
        assert_eq!(plaintext.as_slice(), b"hunter2");
    }

    #[test]
    fn test_two_phase_fails_at_either_phase() {
        let provider = MemoryKeyProvider::new();

        provider.fail_at(Some(FailurePoint::Probe));
        let mut key = provider.provision_or_open().unwrap();
        assert!(matches!(
            provider.encrypt(&mut key, b"x"),
            Err(TpmError::Probe { .. })
        ));

        provider.fail_at(Some(FailurePoint::Fill));
        assert!(matches!(
            provider.encrypt(&mut key, b"x"),
            Err(TpmError::Transform { .. })
        ));
    }

    #[test]
    fn test_oversized_message_rejected_by_probe() {
        let provider = MemoryKeyProvider::new();
        let mut key = provider.provision_or_open().unwrap();
        let big = vec![b'a'; MemoryKeyProvider::MODULUS_LEN];
        assert!(matches!(
            provider.encrypt(&mut key, &big),
            Err(TpmError::MessageTooLarge { .. })
        ));
    }
}
