//! Per-user at-rest protection for the durable store.
//!
//! The [`UserKey`] is 32 random bytes kept in a file only the owning user can
//! read. Each credential blob is sealed with AES-256-GCM under a
//! [`SealingKey`] derived from the user key and the credential's qualified
//! name, so a blob copied to another slot will not unseal.

use std::fs;
use std::io::Write;
use std::path::Path;

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use hkdf::Hkdf;
use rand::RngCore;
use secrecy::{ExposeSecret, SecretSlice};
use tracing::{debug, info};
use zeroize::{Zeroize, ZeroizeOnDrop};

const KEY_LEN: usize = 32;
const NONCE_LEN: usize = 12;
const SEAL_INFO_PREFIX: &[u8] = b"credvault:seal:v1:";

#[derive(Debug, thiserror::Error)]
pub enum CryptError {
    #[error("user key file is corrupted: expected {KEY_LEN} bytes, found {0}")]
    BadKeyFile(usize),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("sealed blob is too short")]
    Truncated,

    #[error("AEAD operation failed")]
    Aead,

    #[error("failed to derive sealing key")]
    KeyDerivation,
}

/// Root of the at-rest key hierarchy for one user's store.
pub struct UserKey {
    key: SecretSlice<u8>,
}

impl UserKey {
    pub fn generate() -> Self {
        let mut bytes = [0u8; KEY_LEN];
        rand::rng().fill_bytes(&mut bytes);
        let key = Self::from_slice(&bytes);
        bytes.zeroize();
        key
    }

    fn from_slice(bytes: &[u8]) -> Self {
        Self {
            key: SecretSlice::new(bytes.to_vec().into()),
        }
    }

    /// Loads the key at `path`, creating it (mode 0600 on Unix) if missing.
    pub fn load_or_create(path: &Path) -> Result<Self, CryptError> {
        if path.exists() {
            let mut bytes = fs::read(path)?;
            if bytes.len() != KEY_LEN {
                let len = bytes.len();
                bytes.zeroize();
                return Err(CryptError::BadKeyFile(len));
            }
            let key = Self::from_slice(&bytes);
            bytes.zeroize();
            debug!(path = %path.display(), "Loaded user key");
            return Ok(key);
        }

        let key = Self::generate();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let mut options = fs::OpenOptions::new();
        options.write(true).create_new(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(0o600);
        }
        let mut file = options.open(path)?;
        file.write_all(key.key.expose_secret())?;
        file.sync_all()?;

        info!(path = %path.display(), "Created user key");
        Ok(key)
    }

    /// Derives the key that seals the credential stored under `name`.
    pub fn sealing_key(&self, name: &str) -> Result<SealingKey, CryptError> {
        let mut okm = [0u8; KEY_LEN];
        let hkdf = Hkdf::<sha2::Sha256>::new(None, self.key.expose_secret());
        let mut info = Vec::with_capacity(SEAL_INFO_PREFIX.len() + name.len());
        info.extend_from_slice(SEAL_INFO_PREFIX);
        info.extend_from_slice(name.as_bytes());
        if hkdf.expand(&info, &mut okm).is_err() {
            return Err(CryptError::KeyDerivation);
        }

        let sealing_key = SealingKey {
            key: SecretSlice::new(okm.to_vec().into()),
        };
        okm.zeroize();
        Ok(sealing_key)
    }
}

impl Zeroize for UserKey {
    fn zeroize(&mut self) {
        self.key.zeroize();
    }
}

impl ZeroizeOnDrop for UserKey {}

/// Per-credential AES-256-GCM key.
pub struct SealingKey {
    key: SecretSlice<u8>,
}

impl SealingKey {
    fn cipher(&self) -> Result<Aes256Gcm, CryptError> {
        Aes256Gcm::new_from_slice(self.key.expose_secret()).map_err(|_| CryptError::Aead)
    }

    /// Returns `nonce || ciphertext || tag`.
    pub fn seal(&self, plaintext: &[u8]) -> Result<Vec<u8>, CryptError> {
        let mut nonce = [0u8; NONCE_LEN];
        rand::rng().fill_bytes(&mut nonce);
        let ciphertext = self
            .cipher()?
            .encrypt(Nonce::from_slice(&nonce), plaintext)
            .map_err(|_| CryptError::Aead)?;

        let mut sealed = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        sealed.extend_from_slice(&nonce);
        sealed.extend_from_slice(&ciphertext);
        Ok(sealed)
    }

    pub fn unseal(&self, sealed: &[u8]) -> Result<Vec<u8>, CryptError> {
        if sealed.len() < NONCE_LEN {
            return Err(CryptError::Truncated);
        }
        let (nonce, ciphertext) = sealed.split_at(NONCE_LEN);
        self.cipher()?
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| CryptError::Aead)
    }
}

impl Zeroize for SealingKey {
    fn zeroize(&mut self) {
        self.key.zeroize();
    }
}

impl ZeroizeOnDrop for SealingKey {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_seal_round_trip() {
        let user_key = UserKey::generate();
        let sealing = user_key.sealing_key("ns:token").unwrap();
        let sealed = sealing.seal(b"\x68\x00\x69\x00").unwrap();
        assert_eq!(sealed.len(), NONCE_LEN + 4 + 16);
        assert_eq!(sealing.unseal(&sealed).unwrap(), b"\x68\x00\x69\x00");
    }

    #[test]
    fn test_sealed_blob_is_bound_to_name() {
        let user_key = UserKey::generate();
        let sealed = user_key.sealing_key("ns:a").unwrap().seal(b"secret").unwrap();
        assert!(user_key.sealing_key("ns:b").unwrap().unseal(&sealed).is_err());
    }

    #[test]
    fn test_sealing_keys_are_derived_per_name() {
        let user_key = UserKey::generate();
        let a = user_key.sealing_key("ns:a").unwrap();
        let b = user_key.sealing_key("ns:b").unwrap();
        let a_again = user_key.sealing_key("ns:a").unwrap();

        assert_eq!(a.key.expose_secret().len(), KEY_LEN);
        assert!(a.key.expose_secret().iter().any(|byte| *byte != 0));
        assert_ne!(a.key.expose_secret(), b.key.expose_secret());
        assert_eq!(a.key.expose_secret(), a_again.key.expose_secret());
    }

    #[test]
    fn test_tampered_blob_rejected() {
        let user_key = UserKey::generate();
        let sealing = user_key.sealing_key("ns:a").unwrap();
        let mut sealed = sealing.seal(b"secret").unwrap();
        let last = sealed.len() - 1;
        sealed[last] ^= 0x01;
        assert!(matches!(sealing.unseal(&sealed), Err(CryptError::Aead)));
        assert!(matches!(sealing.unseal(&[0u8; 4]), Err(CryptError::Truncated)));
    }

    #[test]
    fn test_user_key_persists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("user.key");

        let first = UserKey::load_or_create(&path).unwrap();
        let sealed = first.sealing_key("n").unwrap().seal(b"x").unwrap();

        let second = UserKey::load_or_create(&path).unwrap();
        assert_eq!(second.sealing_key("n").unwrap().unseal(&sealed).unwrap(), b"x");

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = fs::metadata(&path).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o600);
        }
    }

    #[test]
    fn test_corrupted_key_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("user.key");
        fs::write(&path, b"short").unwrap();
        assert!(matches!(
            UserKey::load_or_create(&path),
            Err(CryptError::BadKeyFile(5))
        ));
    }
}
