//! `tss-esapi` implementation of [`TpmKeyProvider`].
//!
//! The vault key is an unrestricted RSA-2048 decryption key created under an
//! RSA primary in the owner hierarchy and made persistent at
//! [`VAULT_KEY_HANDLE`]. That handle is the key's name: every TPM-protected
//! credential on the host is encrypted under whatever lives there.

use tracing::{debug, info, instrument, trace, warn};
use tss_esapi::attributes::ObjectAttributesBuilder;
use tss_esapi::constants::CapabilityType;
use tss_esapi::handles::{KeyHandle, ObjectHandle, PersistentTpmHandle, TpmHandle};
use tss_esapi::interface_types::algorithm::{HashingAlgorithm, PublicAlgorithm};
use tss_esapi::interface_types::dynamic_handles::Persistent;
use tss_esapi::interface_types::key_bits::RsaKeyBits;
use tss_esapi::interface_types::resource_handles::{Hierarchy, Provision};
use tss_esapi::structures::{
    CapabilityData, Data, Public, PublicBuilder, PublicKeyRsa, PublicRsaParametersBuilder,
    RsaDecryptionScheme, RsaExponent, RsaScheme, SymmetricDefinitionObject,
};
use tss_esapi::{Context, TctiNameConf, tcti_ldr::TabrmdConfig};

use super::{KeyOp, TpmError, TpmKeyProvider};

/// Persistent handle the vault key is stored at.
pub const VAULT_KEY_HANDLE: u32 = 0x8101_C7A5;

const RSA_KEY_BITS: RsaKeyBits = RsaKeyBits::Rsa2048;
/// PKCS#1 v1.5 encryption padding overhead.
const PKCS1_OVERHEAD: usize = 11;

pub fn default_tcti_handle() -> TctiNameConf {
    TctiNameConf::from_environment_variable()
        .unwrap_or(TctiNameConf::Tabrmd(TabrmdConfig::default()))
}

#[derive(Debug, Clone)]
pub struct EsapiKeyProvider {
    tcti: TctiNameConf,
    persistent_handle: u32,
}

impl EsapiKeyProvider {
    pub fn new(tcti: TctiNameConf) -> Self {
        Self {
            tcti,
            persistent_handle: VAULT_KEY_HANDLE,
        }
    }

    fn context(&self) -> Result<Context, TpmError> {
        Context::new(self.tcti.clone()).map_err(|e| TpmError::Unavailable(e.to_string()))
    }
}

impl Default for EsapiKeyProvider {
    fn default() -> Self {
        Self::new(default_tcti_handle())
    }
}

/// An open TSS context holding the vault key's ESYS resource.
///
/// Dropping it closes the resource and then the context.
pub struct EsapiKey {
    ctx: Context,
    object: ObjectHandle,
    modulus_len: usize,
}

impl EsapiKey {
    fn new(ctx: Context, object: ObjectHandle) -> Self {
        Self {
            ctx,
            object,
            modulus_len: 0,
        }
    }

    /// Verifies the object at the persistent handle is usable as the vault
    /// key and records its modulus length.
    fn finalize(&mut self) -> Result<(), TpmError> {
        let handle = KeyHandle::from(self.object);
        let (public, _name, _qualified_name) = self
            .ctx
            .execute_without_session(|ctx| ctx.read_public(handle))
            .map_err(|e| TpmError::Finalize(e.to_string()))?;

        match public {
            Public::Rsa {
                object_attributes,
                unique,
                ..
            } if object_attributes.decrypt() && !object_attributes.restricted() => {
                self.modulus_len = unique.value().len();
                if self.modulus_len <= PKCS1_OVERHEAD {
                    return Err(TpmError::Finalize(format!(
                        "implausible modulus length {}",
                        self.modulus_len
                    )));
                }
                trace!(modulus_len = self.modulus_len, "vault key finalized");
                Ok(())
            }
            other => Err(TpmError::Finalize(format!(
                "object at vault key handle is not an unrestricted RSA decryption key: {other:?}"
            ))),
        }
    }
}

impl Drop for EsapiKey {
    fn drop(&mut self) {
        if let Err(e) = self.ctx.tr_close(&mut self.object) {
            warn!(error = %e, "Failed to close vault key handle");
        }
    }
}

impl TpmKeyProvider for EsapiKeyProvider {
    type Key = EsapiKey;

    fn is_available(&self) -> bool {
        match self.context() {
            Ok(_ctx) => true,
            Err(e) => {
                debug!(error = %e, "TPM is not available");
                false
            }
        }
    }

    #[instrument(level = "debug", skip(self))]
    fn provision_or_open(&self) -> Result<EsapiKey, TpmError> {
        let mut ctx = self.context()?;
        let object = match create_persistent(&mut ctx, self.persistent_handle) {
            Ok(object) => {
                info!(handle = self.persistent_handle, "Provisioned vault key in TPM");
                object
            }
            Err(create_err) => {
                debug!(error = %create_err, "Could not create vault key, opening existing one");
                open_persistent(&mut ctx, self.persistent_handle).map_err(|open_err| {
                    TpmError::Provision(format!("create: {create_err}; open: {open_err}"))
                })?
            }
        };

        let mut key = EsapiKey::new(ctx, object);
        key.finalize()?;
        Ok(key)
    }

    #[instrument(level = "debug", skip(self))]
    fn open(&self) -> Result<EsapiKey, TpmError> {
        let mut ctx = self.context()?;
        if !is_persistent_handle_in_use(&mut ctx, self.persistent_handle)? {
            return Err(TpmError::KeyMissing);
        }
        let object = open_persistent(&mut ctx, self.persistent_handle)?;
        let mut key = EsapiKey::new(ctx, object);
        key.finalize()?;
        Ok(key)
    }

    fn output_len(&self, key: &mut EsapiKey, op: KeyOp, input: &[u8]) -> Result<usize, TpmError> {
        match op {
            KeyOp::Encrypt => {
                let max = key.modulus_len - PKCS1_OVERHEAD;
                if input.len() > max {
                    return Err(TpmError::MessageTooLarge {
                        len: input.len(),
                        max,
                    });
                }
            }
            KeyOp::Decrypt => {
                if input.len() != key.modulus_len {
                    return Err(TpmError::Probe {
                        op,
                        reason: format!(
                            "ciphertext is {} bytes, key modulus is {}",
                            input.len(),
                            key.modulus_len
                        ),
                    });
                }
            }
        }
        Ok(key.modulus_len)
    }

    fn transform(
        &self,
        key: &mut EsapiKey,
        op: KeyOp,
        input: &[u8],
        output: &mut [u8],
    ) -> Result<usize, TpmError> {
        let handle = KeyHandle::from(key.object);
        let message = PublicKeyRsa::try_from(input.to_vec())?;

        let result = key
            .ctx
            .execute_with_nullauth_session(|ctx| match op {
                KeyOp::Encrypt => {
                    ctx.rsa_encrypt(handle, message, RsaDecryptionScheme::RsaEs, Data::default())
                }
                KeyOp::Decrypt => {
                    ctx.rsa_decrypt(handle, message, RsaDecryptionScheme::RsaEs, Data::default())
                }
            })
            .map_err(|e| TpmError::Transform {
                op,
                reason: e.to_string(),
            })?;

        let bytes = zeroize::Zeroizing::new(result.value().to_vec());
        if bytes.len() > output.len() {
            return Err(TpmError::BufferTooSmall {
                needed: bytes.len(),
                available: output.len(),
            });
        }
        output[..bytes.len()].copy_from_slice(&bytes);
        Ok(bytes.len())
    }
}

fn is_persistent_handle_in_use(ctx: &mut Context, address: u32) -> Result<bool, TpmError> {
    let (data, _more) = ctx.get_capability(CapabilityType::Handles, address, 1)?;
    match data {
        CapabilityData::Handles(handles) => Ok(handles
            .iter()
            .any(|handle| u32::from(*handle) == address)),
        other => {
            debug!(?other, "Unexpected capability data while probing handles");
            Ok(false)
        }
    }
}

fn open_persistent(ctx: &mut Context, address: u32) -> Result<ObjectHandle, TpmError> {
    let persistent = PersistentTpmHandle::new(address)?;
    Ok(ctx.tr_from_tpm_public(TpmHandle::Persistent(persistent))?)
}

/// Creates the vault key and evicts it to `address`.
///
/// Fails fast if something already occupies the address.
fn create_persistent(ctx: &mut Context, address: u32) -> Result<ObjectHandle, TpmError> {
    if is_persistent_handle_in_use(ctx, address)? {
        return Err(TpmError::Provision(format!(
            "persistent handle {address:#x} is already in use"
        )));
    }

    let primary = create_rsa_primary(ctx)?;
    let result = create_child_at(ctx, primary, address);
    flush(ctx, primary);
    result
}

fn create_child_at(
    ctx: &mut Context,
    primary: KeyHandle,
    address: u32,
) -> Result<ObjectHandle, TpmError> {
    let template = rsa_decryption_template()?;
    let created = ctx.execute_with_nullauth_session(|ctx| {
        ctx.create(primary, template, None, None, None, None)
    })?;
    let child = ctx.execute_with_nullauth_session(|ctx| {
        ctx.load(primary, created.out_private, created.out_public)
    })?;

    let persistent = Persistent::from(PersistentTpmHandle::new(address)?);
    let result = ctx.execute_with_nullauth_session(|ctx| {
        ctx.evict_control(Provision::Owner, ObjectHandle::from(child), persistent)
    });
    flush(ctx, child);
    Ok(result?)
}

fn flush(ctx: &mut Context, handle: KeyHandle) {
    if let Err(e) = ctx.flush_context(ObjectHandle::from(handle)) {
        warn!(error = %e, "Failed to flush transient TPM handle");
    }
}

/// Restricted RSA storage primary in the owner hierarchy.
fn create_rsa_primary(ctx: &mut Context) -> Result<KeyHandle, TpmError> {
    let object_attributes = ObjectAttributesBuilder::new()
        .with_fixed_tpm(true)
        .with_fixed_parent(true)
        .with_sensitive_data_origin(true)
        .with_user_with_auth(true)
        .with_restricted(true)
        .with_decrypt(true)
        .build()?;

    let rsa_params = PublicRsaParametersBuilder::new_restricted_decryption_key(
        SymmetricDefinitionObject::AES_128_CFB,
        RSA_KEY_BITS,
        RsaExponent::default(),
    )
    .build()?;

    let public = PublicBuilder::new()
        .with_public_algorithm(PublicAlgorithm::Rsa)
        .with_name_hashing_algorithm(HashingAlgorithm::Sha256)
        .with_object_attributes(object_attributes)
        .with_rsa_parameters(rsa_params)
        .with_rsa_unique_identifier(PublicKeyRsa::default())
        .build()?;

    trace!(?public, "Creating RSA primary key");
    let primary = ctx.execute_with_nullauth_session(|ctx| {
        ctx.create_primary(Hierarchy::Owner, public, None, None, None, None)
    })?;
    Ok(primary.key_handle)
}

/// Unrestricted RSA decryption key. The NULL scheme lets each call pick
/// its padding; the vault always asks for PKCS#1 v1.5.
fn rsa_decryption_template() -> Result<Public, TpmError> {
    let rsa_params = PublicRsaParametersBuilder::new()
        .with_scheme(RsaScheme::Null)
        .with_key_bits(RSA_KEY_BITS)
        .with_exponent(RsaExponent::default())
        .with_symmetric(SymmetricDefinitionObject::Null)
        .with_is_signing_key(false)
        .with_is_decryption_key(true)
        .with_restricted(false)
        .build()?;

    let object_attributes = ObjectAttributesBuilder::new()
        .with_fixed_tpm(true)
        .with_fixed_parent(true)
        .with_sensitive_data_origin(true)
        .with_user_with_auth(true)
        .with_decrypt(true)
        .build()?;

    Ok(PublicBuilder::new()
        .with_public_algorithm(PublicAlgorithm::Rsa)
        .with_name_hashing_algorithm(HashingAlgorithm::Sha256)
        .with_object_attributes(object_attributes)
        .with_rsa_parameters(rsa_params)
        .with_rsa_unique_identifier(PublicKeyRsa::default())
        .build()?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::str::FromStr;
    use tracing_test::traced_test;
    use tss_esapi::tcti_ldr::NetworkTPMConfig;

    fn get_test_tcti() -> TctiNameConf {
        TctiNameConf::from_environment_variable()
            .unwrap_or(TctiNameConf::Swtpm(NetworkTPMConfig::default()))
    }

    #[test]
    fn test_unreachable_tcti_is_unavailable() {
        let tcti =
            TctiNameConf::Swtpm(NetworkTPMConfig::from_str("host=127.0.0.1,port=1").unwrap());
        let provider = EsapiKeyProvider::new(tcti);
        assert!(!provider.is_available());
        assert!(provider.provision_or_open().is_err());
    }

    #[test]
    #[serial]
    #[traced_test]
    #[ignore = "requires a TPM or swtpm simulator"]
    fn test_provision_encrypt_decrypt() {
        let provider = EsapiKeyProvider::new(get_test_tcti());
        assert!(provider.is_available());

        let mut key = provider.provision_or_open().expect("provisioning failed");
        let ciphertext = provider
            .encrypt(&mut key, b"Short test string")
            .expect("RSA encryption failed");
        assert_eq!(ciphertext.len(), 256);
        drop(key);

        // A second provider call must reuse the persisted key.
        let mut reopened = provider.open().expect("opening existing key failed");
        let plaintext = provider
            .decrypt(&mut reopened, &ciphertext)
            .expect("RSA decryption failed");
        assert_eq!(plaintext.as_slice(), b"Short test string");

        let mut again = provider.provision_or_open().expect("second provision failed");
        let plaintext = provider.decrypt(&mut again, &ciphertext).unwrap();
        assert_eq!(plaintext.as_slice(), b"Short test string");
    }

    #[test]
    #[serial]
    #[ignore = "requires a TPM or swtpm simulator"]
    fn test_oversized_plaintext_rejected() {
        let provider = EsapiKeyProvider::new(get_test_tcti());
        let mut key = provider.provision_or_open().unwrap();
        let big = vec![0x41u8; 246];
        assert!(matches!(
            provider.encrypt(&mut key, &big),
            Err(TpmError::MessageTooLarge { len: 246, max: 245 })
        ));
    }
}
