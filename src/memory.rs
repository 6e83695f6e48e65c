//! In-memory implementations of the platform collaborators.
//!
//! These are NOT secure. They exist so the engine and codec can be exercised
//! without a credential vault or TPM, and they let tests inject failures at
//! each step and check that every acquired handle is released.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use rand::{Rng, RngCore};
use sha2::{Digest, Sha256};
use zeroize::{Zeroize, Zeroizing};

use crate::secret::{CredentialSummary, StoredCredential};
use crate::store::{PlatformSecretStore, StoreError, StoreResult};
use crate::tpm::{KeyOp, TpmError, TpmKeyProvider};

// =============================================================================
// Memory secret store
// =============================================================================

#[derive(Default)]
struct StoreState {
    slots: BTreeMap<String, StoredCredential>,
    fail_writes: bool,
    fail_reads: bool,
    fail_enumerate: bool,
    failing_deletes: BTreeSet<String>,
}

/// A [`PlatformSecretStore`] backed by a `BTreeMap`.
#[derive(Default)]
pub struct MemorySecretStore {
    state: Mutex<StoreState>,
}

impl MemorySecretStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> StoreResult<MutexGuard<'_, StoreState>> {
        self.state.lock().map_err(|_| StoreError::Poisoned)
    }

    /// Makes every subsequent write fail.
    pub fn fail_writes(&self, fail: bool) {
        if let Ok(mut state) = self.state() {
            state.fail_writes = fail;
        }
    }

    /// Makes every subsequent lookup fail.
    pub fn fail_reads(&self, fail: bool) {
        if let Ok(mut state) = self.state() {
            state.fail_reads = fail;
        }
    }

    /// Makes enumeration fail.
    pub fn fail_enumerate(&self, fail: bool) {
        if let Ok(mut state) = self.state() {
            state.fail_enumerate = fail;
        }
    }

    /// Makes deletion of `name` fail until cleared.
    pub fn fail_delete_of(&self, name: impl Into<String>) {
        if let Ok(mut state) = self.state() {
            state.failing_deletes.insert(name.into());
        }
    }

    /// Returns the raw stored record, bypassing the engine.
    pub fn raw(&self, name: &str) -> Option<StoredCredential> {
        self.state().ok()?.slots.get(name).cloned()
    }

    /// Rewrites the stored blob of `name` in place.
    pub fn tamper(&self, name: &str, f: impl FnOnce(&mut Vec<u8>)) -> bool {
        match self.state() {
            Ok(mut state) => match state.slots.get_mut(name) {
                Some(credential) => {
                    f(&mut credential.blob);
                    true
                }
                None => false,
            },
            Err(_) => false,
        }
    }

    pub fn len(&self) -> usize {
        self.state().map(|s| s.slots.len()).unwrap_or_default()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl PlatformSecretStore for MemorySecretStore {
    fn write(&self, credential: &StoredCredential) -> StoreResult<()> {
        let mut state = self.state()?;
        if state.fail_writes {
            return Err(StoreError::Unavailable("writes disabled".into()));
        }
        state
            .slots
            .insert(credential.name.clone(), credential.clone());
        Ok(())
    }

    fn read(&self, name: &str) -> StoreResult<StoredCredential> {
        let state = self.state()?;
        if state.fail_reads {
            return Err(StoreError::Unavailable("reads disabled".into()));
        }
        state
            .slots
            .get(name)
            .cloned()
            .ok_or_else(|| StoreError::NotFound { name: name.into() })
    }

    fn contains(&self, name: &str) -> StoreResult<bool> {
        let state = self.state()?;
        if state.fail_reads {
            return Err(StoreError::Unavailable("reads disabled".into()));
        }
        Ok(state.slots.contains_key(name))
    }

    fn delete(&self, name: &str) -> StoreResult<()> {
        let mut state = self.state()?;
        if state.failing_deletes.contains(name) {
            return Err(StoreError::Unavailable(format!("delete of {name} refused")));
        }
        state
            .slots
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| StoreError::NotFound { name: name.into() })
    }

    fn enumerate(&self) -> StoreResult<Vec<CredentialSummary>> {
        let state = self.state()?;
        if state.fail_enumerate {
            return Err(StoreError::Unavailable("enumeration disabled".into()));
        }
        Ok(state
            .slots
            .values()
            .map(|c| CredentialSummary {
                name: c.name.clone(),
                meta: Some(c.meta.clone()),
            })
            .collect())
    }
}

// =============================================================================
// Memory key provider
// =============================================================================

/// A step of the TPM usage protocol that can be made to fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailurePoint {
    /// Creating the key fails; provisioning falls back to opening it.
    Create,
    /// Opening an existing key fails.
    Open,
    Finalize,
    /// The size-probe phase of encrypt/decrypt.
    Probe,
    /// The fill phase of encrypt/decrypt.
    Fill,
}

#[derive(Default)]
struct KeyState {
    secret: Option<Zeroizing<[u8; 32]>>,
    fail_at: Option<FailurePoint>,
}

/// Counts a live provider or key handle until dropped.
struct HandleGuard(Arc<AtomicUsize>);

impl HandleGuard {
    fn acquire(counter: &Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(Arc::clone(counter))
    }
}

impl Drop for HandleGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Simulated key store with a single persistent key.
///
/// "Encryption" is PKCS#1 v1.5 type 2 framing XORed with a keystream derived
/// from the key secret, so a wrong key or corrupted ciphertext is detected on
/// decrypt the way a real padding check would.
pub struct MemoryKeyProvider {
    available: AtomicBool,
    state: Mutex<KeyState>,
    handles: Arc<AtomicUsize>,
}

/// A finalized key: holds a provider handle and a key handle.
pub struct MemoryKey {
    secret: [u8; 32],
    _provider: HandleGuard,
    _key: HandleGuard,
}

impl Drop for MemoryKey {
    fn drop(&mut self) {
        self.secret.zeroize();
    }
}

impl Default for MemoryKeyProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryKeyProvider {
    pub const MODULUS_LEN: usize = 256;
    const MIN_PADDING: usize = 8;

    pub fn new() -> Self {
        Self {
            available: AtomicBool::new(true),
            state: Mutex::new(KeyState::default()),
            handles: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// A provider whose key store cannot be opened.
    pub fn unavailable() -> Self {
        let provider = Self::new();
        provider.set_available(false);
        provider
    }

    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    pub fn fail_at(&self, point: Option<FailurePoint>) {
        if let Ok(mut state) = self.state.lock() {
            state.fail_at = point;
        }
    }

    pub fn has_key(&self) -> bool {
        self.state
            .lock()
            .map(|s| s.secret.is_some())
            .unwrap_or_default()
    }

    /// Destroys the persistent key, as a TPM clear would.
    pub fn clear_key(&self) {
        if let Ok(mut state) = self.state.lock() {
            state.secret = None;
        }
    }

    /// Provider and key handles currently held.
    pub fn open_handles(&self) -> usize {
        self.handles.load(Ordering::SeqCst)
    }

    fn failing(&self, point: FailurePoint) -> bool {
        self.state
            .lock()
            .map(|s| s.fail_at == Some(point))
            .unwrap_or(true)
    }

    fn open_provider(&self) -> Result<HandleGuard, TpmError> {
        if !self.available.load(Ordering::SeqCst) {
            return Err(TpmError::Unavailable("simulated key store is offline".into()));
        }
        Ok(HandleGuard::acquire(&self.handles))
    }

    fn load_secret(&self) -> Result<[u8; 32], TpmError> {
        let state = self
            .state
            .lock()
            .map_err(|_| TpmError::Unavailable("key state poisoned".into()))?;
        if state.fail_at == Some(FailurePoint::Open) {
            return Err(TpmError::Unavailable("simulated open failure".into()));
        }
        state.secret.as_deref().copied().ok_or(TpmError::KeyMissing)
    }

    fn create_secret(&self) -> Result<[u8; 32], TpmError> {
        let mut state = self
            .state
            .lock()
            .map_err(|_| TpmError::Unavailable("key state poisoned".into()))?;
        if state.fail_at == Some(FailurePoint::Create) {
            return Err(TpmError::Provision("simulated create failure".into()));
        }
        if state.secret.is_some() {
            return Err(TpmError::Provision("key already exists".into()));
        }
        let mut secret = Zeroizing::new([0u8; 32]);
        rand::rng().fill_bytes(&mut secret[..]);
        let copy = *secret;
        state.secret = Some(secret);
        Ok(copy)
    }

    fn finalize(&self, provider: HandleGuard, mut secret: [u8; 32]) -> Result<MemoryKey, TpmError> {
        let key_handle = HandleGuard::acquire(&self.handles);
        if self.failing(FailurePoint::Finalize) {
            secret.zeroize();
            return Err(TpmError::Finalize("simulated finalize failure".into()));
        }
        let key = MemoryKey {
            secret,
            _provider: provider,
            _key: key_handle,
        };
        secret.zeroize();
        Ok(key)
    }

    fn keystream(secret: &[u8; 32]) -> Zeroizing<Vec<u8>> {
        let mut stream = Zeroizing::new(Vec::with_capacity(Self::MODULUS_LEN));
        let mut counter = 0u32;
        while stream.len() < Self::MODULUS_LEN {
            let block = Sha256::new()
                .chain_update(secret)
                .chain_update(counter.to_be_bytes())
                .finalize();
            stream.extend_from_slice(&block);
            counter += 1;
        }
        stream.truncate(Self::MODULUS_LEN);
        stream
    }
}

impl TpmKeyProvider for MemoryKeyProvider {
    type Key = MemoryKey;

    fn is_available(&self) -> bool {
        self.open_provider().is_ok()
    }

    fn provision_or_open(&self) -> Result<MemoryKey, TpmError> {
        let provider = self.open_provider()?;
        let secret = match self.create_secret() {
            Ok(secret) => secret,
            Err(create_err) => self.load_secret().map_err(|open_err| {
                TpmError::Provision(format!("create: {create_err}; open: {open_err}"))
            })?,
        };
        self.finalize(provider, secret)
    }

    fn open(&self) -> Result<MemoryKey, TpmError> {
        let provider = self.open_provider()?;
        let secret = self.load_secret()?;
        self.finalize(provider, secret)
    }

    fn output_len(&self, _key: &mut MemoryKey, op: KeyOp, input: &[u8]) -> Result<usize, TpmError> {
        if self.failing(FailurePoint::Probe) {
            return Err(TpmError::Probe {
                op,
                reason: "simulated probe failure".into(),
            });
        }
        match op {
            KeyOp::Encrypt => {
                let max = Self::MODULUS_LEN - 3 - Self::MIN_PADDING;
                if input.len() > max {
                    return Err(TpmError::MessageTooLarge {
                        len: input.len(),
                        max,
                    });
                }
            }
            KeyOp::Decrypt => {
                if input.len() != Self::MODULUS_LEN {
                    return Err(TpmError::Probe {
                        op,
                        reason: format!("ciphertext is {} bytes", input.len()),
                    });
                }
            }
        }
        Ok(Self::MODULUS_LEN)
    }

    fn transform(
        &self,
        key: &mut MemoryKey,
        op: KeyOp,
        input: &[u8],
        output: &mut [u8],
    ) -> Result<usize, TpmError> {
        if self.failing(FailurePoint::Fill) {
            return Err(TpmError::Transform {
                op,
                reason: "simulated fill failure".into(),
            });
        }
        if output.len() < Self::MODULUS_LEN {
            return Err(TpmError::BufferTooSmall {
                needed: Self::MODULUS_LEN,
                available: output.len(),
            });
        }
        let stream = Self::keystream(&key.secret);

        match op {
            KeyOp::Encrypt => {
                let max = Self::MODULUS_LEN - 3 - Self::MIN_PADDING;
                if input.len() > max {
                    return Err(TpmError::MessageTooLarge {
                        len: input.len(),
                        max,
                    });
                }
                let mut block = Zeroizing::new(vec![0u8; Self::MODULUS_LEN]);
                let separator = Self::MODULUS_LEN - input.len() - 1;
                block[1] = 0x02;
                let mut rng = rand::rng();
                for byte in &mut block[2..separator] {
                    *byte = rng.random_range(1..=u8::MAX);
                }
                block[separator + 1..].copy_from_slice(input);
                for (out, (b, k)) in output.iter_mut().zip(block.iter().zip(stream.iter())) {
                    *out = b ^ k;
                }
                Ok(Self::MODULUS_LEN)
            }
            KeyOp::Decrypt => {
                if input.len() != Self::MODULUS_LEN {
                    return Err(TpmError::Transform {
                        op,
                        reason: format!("ciphertext is {} bytes", input.len()),
                    });
                }
                let block: Zeroizing<Vec<u8>> =
                    Zeroizing::new(input.iter().zip(stream.iter()).map(|(c, k)| c ^ k).collect());
                let separator = block
                    .iter()
                    .skip(2)
                    .position(|b| *b == 0)
                    .map(|p| p + 2);
                match separator {
                    Some(sep) if block[0] == 0 && block[1] == 0x02 && sep >= 2 + Self::MIN_PADDING => {
                        let message = &block[sep + 1..];
                        output[..message.len()].copy_from_slice(message);
                        Ok(message.len())
                    }
                    _ => Err(TpmError::Transform {
                        op,
                        reason: "padding check failed".into(),
                    }),
                }
            }
        }
    }
}
