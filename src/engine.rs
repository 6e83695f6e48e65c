//! The vault engine.
//!
//! [`VaultEngine`] owns key namespacing, picks the protection path for each
//! write and absorbs TPM failures: a failed TPM write silently falls back to
//! OS protection, and a failed decode reads as "no value".

use secrecy::SecretString;
use tracing::{debug, info, instrument, warn};

use crate::codec::{CredentialCodec, Protection, encode_os};
use crate::error::{Result, VaultError};
use crate::secret::{CredentialMeta, Persistence, StoredCredential};
use crate::store::PlatformSecretStore;
use crate::tpm::TpmKeyProvider;

/// Namespace used when the caller supplies no prefix.
pub const DEFAULT_NAMESPACE: &str = "com.fyralabs.credvault";
const SEPARATOR: char = ':';

/// `"{prefix}:"`, or the default namespace's equivalent for an absent or
/// empty prefix. Every name a prefix owns starts with this string.
pub fn namespace_prefix(prefix: Option<&str>) -> String {
    let namespace = match prefix {
        Some(p) if !p.is_empty() => p,
        _ => DEFAULT_NAMESPACE,
    };
    format!("{namespace}{SEPARATOR}")
}

/// The slot name a logical key occupies in the platform store.
pub fn qualified_name(key: &str, prefix: Option<&str>) -> String {
    let mut name = namespace_prefix(prefix);
    name.push_str(key);
    name
}

/// How a value should be written.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WriteOptions {
    pub persistence: Persistence,
    /// Encrypt under the TPM key when one is usable.
    pub prefer_tpm: bool,
}

impl WriteOptions {
    pub fn with_persistence(mut self, persistence: Persistence) -> Self {
        self.persistence = persistence;
        self
    }

    pub fn prefer_tpm(mut self, prefer_tpm: bool) -> Self {
        self.prefer_tpm = prefer_tpm;
        self
    }
}

pub struct VaultEngine<S, T> {
    store: S,
    tpm: T,
}

impl<S: PlatformSecretStore, T: TpmKeyProvider> VaultEngine<S, T> {
    pub fn new(store: S, tpm: T) -> Self {
        Self { store, tpm }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn tpm(&self) -> &T {
        &self.tpm
    }

    /// Whether a slot exists for `key`. The stored value is never unsealed
    /// or decrypted. Lookup errors read as `false`.
    #[instrument(level = "debug", skip(self))]
    pub fn exists(&self, key: &str, prefix: Option<&str>) -> bool {
        let name = qualified_name(key, prefix);
        match self.store.contains(&name) {
            Ok(found) => found,
            Err(e) => {
                debug!(error = %e, slot = %name, "Lookup failed, reporting absent");
                false
            }
        }
    }

    /// Reads and decodes the value for `key`.
    ///
    /// Absence, lookup failure and decode failure all come back as `None`.
    #[instrument(level = "debug", skip(self))]
    pub fn get(&self, key: &str, prefix: Option<&str>) -> Option<SecretString> {
        let name = qualified_name(key, prefix);
        let credential = match self.store.read(&name) {
            Ok(credential) => credential,
            Err(e) if e.is_not_found() => return None,
            Err(e) => {
                warn!(error = %e, slot = %name, "Failed to read credential");
                return None;
            }
        };

        let codec = CredentialCodec::new(&self.tpm);
        match codec.decode(credential.meta.protection, &credential.blob) {
            Ok(value) => Some(value),
            Err(e) => {
                warn!(
                    error = %e,
                    slot = %name,
                    protection = ?credential.meta.protection,
                    "Failed to decode credential, reporting no value"
                );
                None
            }
        }
    }

    /// Stores `value` under `key` and returns the protection actually used.
    ///
    /// With `prefer_tpm` set, the TPM path is tried first; if the TPM is
    /// unavailable or any step of it fails, the value is stored under OS
    /// protection instead. Only a failed store write is an error.
    #[instrument(level = "debug", skip(self, value))]
    pub fn set(
        &self,
        key: &str,
        value: &str,
        prefix: Option<&str>,
        options: WriteOptions,
    ) -> Result<Protection> {
        let name = qualified_name(key, prefix);
        let codec = CredentialCodec::new(&self.tpm);

        let ciphertext = if options.prefer_tpm && self.tpm.is_available() {
            match codec.encode_tpm(value) {
                Ok(ciphertext) => ciphertext,
                Err(e) => {
                    warn!(error = %e, slot = %name, "TPM encryption failed, falling back to OS protection");
                    encode_os(value)
                }
            }
        } else {
            if options.prefer_tpm {
                info!(slot = %name, "TPM unavailable, using OS protection");
            }
            encode_os(value)
        };

        let protection = ciphertext.protection;
        let credential = StoredCredential::new(
            name,
            ciphertext.bytes,
            CredentialMeta::new(protection, options.persistence),
        );
        self.store.write(&credential)?;
        debug!(?protection, persistence = options.persistence.as_str(), "Stored credential");
        Ok(protection)
    }

    /// Deletes `key`. Deleting something that is not there succeeds.
    #[instrument(level = "debug", skip(self))]
    pub fn delete(&self, key: &str, prefix: Option<&str>) -> Result<()> {
        let name = qualified_name(key, prefix);
        match self.store.delete(&name) {
            Ok(()) => Ok(()),
            Err(e) if e.is_not_found() => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Deletes every credential under `prefix` and returns how many were
    /// removed.
    ///
    /// Every match is attempted even after a failure. If any deletion fails
    /// the call reports [`VaultError::PartialDelete`] naming the survivors.
    /// Entries written after enumeration are not seen.
    #[instrument(level = "debug", skip(self))]
    pub fn delete_all(&self, prefix: Option<&str>) -> Result<usize> {
        let namespace = namespace_prefix(prefix);
        let matches: Vec<String> = self
            .store
            .enumerate()?
            .into_iter()
            .map(|summary| summary.name)
            .filter(|name| name.starts_with(&namespace))
            .collect();

        let mut deleted = 0;
        let mut failed = Vec::new();
        for name in matches {
            match self.store.delete(&name) {
                Ok(()) => deleted += 1,
                // removed concurrently; the goal is met
                Err(e) if e.is_not_found() => deleted += 1,
                Err(e) => {
                    warn!(error = %e, slot = %name, "Failed to delete credential");
                    failed.push(name);
                }
            }
        }

        if failed.is_empty() {
            debug!(deleted, namespace, "Deleted all credentials in namespace");
            Ok(deleted)
        } else {
            Err(VaultError::PartialDelete { failed, deleted })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::SledSecretStore;
    use crate::memory::{FailurePoint, MemoryKeyProvider, MemorySecretStore};
    use proptest::prelude::*;
    use secrecy::ExposeSecret;
    use tracing_test::traced_test;

    fn engine() -> VaultEngine<MemorySecretStore, MemoryKeyProvider> {
        VaultEngine::new(MemorySecretStore::new(), MemoryKeyProvider::new())
    }

    fn tpm() -> WriteOptions {
        WriteOptions::default().prefer_tpm(true)
    }

    fn get(engine: &VaultEngine<impl PlatformSecretStore, impl TpmKeyProvider>, key: &str, prefix: Option<&str>) -> Option<String> {
        engine
            .get(key, prefix)
            .map(|v| v.expose_secret().to_string())
    }

    #[test]
    fn test_qualified_names() {
        assert_eq!(qualified_name("token", Some("app")), "app:token");
        assert_eq!(
            qualified_name("token", None),
            format!("{DEFAULT_NAMESPACE}:token")
        );
        assert_eq!(qualified_name("token", Some("")), qualified_name("token", None));
        assert!(qualified_name("k", Some("p")).starts_with(&namespace_prefix(Some("p"))));
    }

    #[test]
    fn test_os_round_trip() {
        let engine = engine();
        for value in ["", "simple", "ünïcödé", "emoji 🗝️ and 中文", "line\nbreak"] {
            let protection = engine
                .set("k", value, Some("p"), WriteOptions::default())
                .unwrap();
            assert_eq!(protection, Protection::Os);
            assert_eq!(get(&engine, "k", Some("p")).as_deref(), Some(value));
        }
    }

    #[test]
    #[traced_test]
    fn test_tpm_round_trip_marks_entry() {
        let engine = engine();
        let protection = engine.set("k", "hunter2", None, tpm()).unwrap();
        assert_eq!(protection, Protection::Tpm);

        let raw = engine.store().raw(&qualified_name("k", None)).unwrap();
        assert_eq!(raw.meta.protection, Protection::Tpm);
        assert_eq!(raw.meta.comment, Protection::Tpm.comment());
        assert_eq!(get(&engine, "k", None).as_deref(), Some("hunter2"));
        assert_eq!(engine.tpm().open_handles(), 0);
    }

    #[test]
    #[traced_test]
    fn test_unavailable_tpm_falls_back_to_os() {
        let engine = VaultEngine::new(MemorySecretStore::new(), MemoryKeyProvider::unavailable());
        let protection = engine.set("k", "v", None, tpm()).unwrap();
        assert_eq!(protection, Protection::Os);
        assert_eq!(
            engine.store().raw(&qualified_name("k", None)).unwrap().meta.protection,
            Protection::Os
        );
        assert_eq!(get(&engine, "k", None).as_deref(), Some("v"));
        assert!(logs_contain("TPM unavailable"));
    }

    #[test]
    fn test_tpm_failure_at_any_step_falls_back() {
        for point in [
            FailurePoint::Finalize,
            FailurePoint::Probe,
            FailurePoint::Fill,
        ] {
            let engine = engine();
            engine.tpm().fail_at(Some(point));
            let protection = engine.set("k", "v", None, tpm()).unwrap();
            assert_eq!(protection, Protection::Os, "no fallback at {point:?}");
            engine.tpm().fail_at(None);
            assert_eq!(get(&engine, "k", None).as_deref(), Some("v"));
            assert_eq!(engine.tpm().open_handles(), 0);
        }

        // both create and open failing
        let engine = engine();
        engine.tpm().fail_at(Some(FailurePoint::Create));
        assert_eq!(engine.set("k", "v", None, tpm()).unwrap(), Protection::Os);
    }

    #[test]
    fn test_oversized_value_falls_back_to_os() {
        let engine = engine();
        let big = "x".repeat(4096);
        assert_eq!(engine.set("k", &big, None, tpm()).unwrap(), Protection::Os);
        assert_eq!(get(&engine, "k", None), Some(big));
    }

    #[test]
    fn test_prefer_tpm_false_never_touches_tpm() {
        let engine = engine();
        engine.set("k", "v", None, WriteOptions::default()).unwrap();
        assert!(!engine.tpm().has_key());
    }

    #[test]
    fn test_store_write_failure_is_an_error() {
        let engine = engine();
        engine.store().fail_writes(true);
        let err = engine
            .set("k", "v", None, WriteOptions::default())
            .unwrap_err();
        assert_eq!(err.kind().code(), "CREDENTIAL_ERROR");
        // also when the TPM path succeeded
        assert!(engine.set("k", "v", None, tpm()).is_err());
    }

    #[test]
    fn test_absent_and_corrupted_are_indistinguishable() {
        let engine = engine();
        assert!(get(&engine, "never", None).is_none());

        engine.set("os", "value", None, WriteOptions::default()).unwrap();
        assert!(engine.store().tamper(&qualified_name("os", None), |b| b.push(0)));
        assert!(get(&engine, "os", None).is_none());

        engine.set("hw", "value", None, tpm()).unwrap();
        assert!(engine.store().tamper(&qualified_name("hw", None), |b| b[0] ^= 0xFF));
        assert!(get(&engine, "hw", None).is_none());
    }

    #[test]
    fn test_tpm_entry_reads_absent_when_tpm_gone() {
        let engine = engine();
        engine.set("k", "v", None, tpm()).unwrap();

        engine.tpm().set_available(false);
        assert!(get(&engine, "k", None).is_none());
        // the slot itself is still there
        assert!(engine.exists("k", None));

        engine.tpm().set_available(true);
        engine.tpm().clear_key();
        assert!(get(&engine, "k", None).is_none());
        assert_eq!(engine.tpm().open_handles(), 0);
    }

    #[test]
    fn test_lookup_failure_reads_absent() {
        let engine = engine();
        engine.set("k", "v", None, WriteOptions::default()).unwrap();
        engine.set("hw", "v", None, tpm()).unwrap();

        engine.store().fail_reads(true);
        assert!(!engine.exists("k", None));
        assert!(get(&engine, "k", None).is_none());
        assert!(get(&engine, "hw", None).is_none());

        engine.store().fail_reads(false);
        assert!(engine.exists("k", None));
        assert_eq!(get(&engine, "hw", None).as_deref(), Some("v"));
    }

    #[test]
    fn test_delete_is_idempotent() {
        let engine = engine();
        engine.delete("missing", None).unwrap();
        engine.delete("missing", None).unwrap();

        engine.set("k", "v", None, WriteOptions::default()).unwrap();
        engine.delete("k", None).unwrap();
        engine.delete("k", None).unwrap();
        assert!(get(&engine, "k", None).is_none());
    }

    #[test]
    fn test_delete_reports_other_failures() {
        let engine = engine();
        engine.set("k", "v", None, WriteOptions::default()).unwrap();
        engine.store().fail_delete_of(qualified_name("k", None));
        assert!(matches!(
            engine.delete("k", None),
            Err(VaultError::CredentialStore(_))
        ));
    }

    #[test]
    fn test_exists_tracks_state() {
        let engine = engine();
        assert!(!engine.exists("k", Some("p")));
        engine
            .set("k", "v", Some("p"), WriteOptions::default())
            .unwrap();
        assert!(engine.exists("k", Some("p")));
        assert!(!engine.exists("k", Some("other")));
        engine.delete("k", Some("p")).unwrap();
        assert!(!engine.exists("k", Some("p")));
    }

    #[test]
    fn test_prefix_isolation() {
        let engine = engine();
        engine.set("a", "x", Some("p1"), WriteOptions::default()).unwrap();
        engine.set("a", "y", Some("p2"), tpm()).unwrap();
        engine.set("a", "z", None, WriteOptions::default()).unwrap();

        assert_eq!(get(&engine, "a", Some("p1")).as_deref(), Some("x"));
        assert_eq!(get(&engine, "a", Some("p2")).as_deref(), Some("y"));

        assert_eq!(engine.delete_all(Some("p1")).unwrap(), 1);
        assert!(get(&engine, "a", Some("p1")).is_none());
        assert_eq!(get(&engine, "a", Some("p2")).as_deref(), Some("y"));
        assert_eq!(get(&engine, "a", None).as_deref(), Some("z"));
    }

    #[test]
    fn test_delete_all_matches_whole_prefix_segment() {
        let engine = engine();
        engine.set("a", "1", Some("app"), WriteOptions::default()).unwrap();
        engine.set("b", "2", Some("app"), WriteOptions::default()).unwrap();
        engine.set("a", "3", Some("apple"), WriteOptions::default()).unwrap();

        assert_eq!(engine.delete_all(Some("app")).unwrap(), 2);
        assert_eq!(get(&engine, "a", Some("apple")).as_deref(), Some("3"));
    }

    #[test]
    fn test_delete_all_default_namespace() {
        let engine = engine();
        engine.set("a", "1", None, WriteOptions::default()).unwrap();
        engine.set("b", "2", Some(""), WriteOptions::default()).unwrap();
        engine.set("c", "3", Some("mine"), WriteOptions::default()).unwrap();

        assert_eq!(engine.delete_all(None).unwrap(), 2);
        assert_eq!(engine.store().len(), 1);
        assert_eq!(engine.delete_all(Some("")).unwrap(), 0);
    }

    #[test]
    #[traced_test]
    fn test_delete_all_attempts_every_match() {
        let engine = engine();
        for key in ["a", "b", "c", "d"] {
            engine.set(key, "v", Some("p"), WriteOptions::default()).unwrap();
        }
        engine.store().fail_delete_of(qualified_name("b", Some("p")));

        match engine.delete_all(Some("p")) {
            Err(VaultError::PartialDelete { failed, deleted }) => {
                assert_eq!(failed, vec![qualified_name("b", Some("p"))]);
                assert_eq!(deleted, 3);
            }
            other => panic!("expected partial delete, got {other:?}"),
        }
        // only the refused entry is left
        assert_eq!(engine.store().len(), 1);
        assert!(engine.exists("b", Some("p")));
    }

    #[test]
    fn test_delete_all_enumeration_failure() {
        let engine = engine();
        engine.store().fail_enumerate(true);
        assert!(matches!(
            engine.delete_all(None),
            Err(VaultError::CredentialStore(_))
        ));
    }

    #[test]
    fn test_persistence_recorded() {
        let engine = engine();
        engine
            .set(
                "k",
                "v",
                None,
                WriteOptions::default().with_persistence(Persistence::Enterprise),
            )
            .unwrap();
        let raw = engine.store().raw(&qualified_name("k", None)).unwrap();
        assert_eq!(raw.meta.persistence, Persistence::Enterprise);
    }

    #[test]
    #[traced_test]
    fn test_against_sled_store() {
        let dir = tempfile::tempdir().unwrap();
        let engine = VaultEngine::new(
            SledSecretStore::open(dir.path()).unwrap(),
            MemoryKeyProvider::new(),
        );

        engine.set("a", "x", Some("p1"), WriteOptions::default()).unwrap();
        engine.set("a", "y", Some("p2"), tpm()).unwrap();
        engine
            .set(
                "s",
                "session-only",
                Some("p2"),
                WriteOptions::default().with_persistence(Persistence::Session),
            )
            .unwrap();

        assert_eq!(get(&engine, "a", Some("p1")).as_deref(), Some("x"));
        assert_eq!(get(&engine, "a", Some("p2")).as_deref(), Some("y"));
        assert_eq!(get(&engine, "s", Some("p2")).as_deref(), Some("session-only"));

        assert_eq!(engine.delete_all(Some("p2")).unwrap(), 2);
        assert!(engine.exists("a", Some("p1")));
        assert!(!engine.exists("a", Some("p2")));
        assert!(!engine.exists("s", Some("p2")));
    }

    proptest! {
        #[test]
        fn os_round_trip_any_value(
            key in any::<String>(),
            prefix in proptest::option::of(any::<String>()),
            value in any::<String>(),
        ) {
            let engine = engine();
            let protection = engine
                .set(&key, &value, prefix.as_deref(), WriteOptions::default())
                .unwrap();
            prop_assert_eq!(protection, Protection::Os);
            prop_assert!(engine.exists(&key, prefix.as_deref()));
            prop_assert_eq!(get(&engine, &key, prefix.as_deref()), Some(value));
        }

        #[test]
        fn tpm_round_trip_any_value_within_modulus(
            key in "[a-zA-Z0-9_.]{1,24}",
            value in prop_oneof!["\\PC{0,61}", "[ -~]{0,245}"],
        ) {
            prop_assume!(value.len() <= 245);
            let engine = engine();
            prop_assert_eq!(engine.set(&key, &value, Some("hw"), tpm()).unwrap(), Protection::Tpm);
            prop_assert_eq!(get(&engine, &key, Some("hw")), Some(value));
            prop_assert_eq!(engine.tpm().open_handles(), 0);
        }

        #[test]
        fn prefixes_are_isolated(
            first in "[^:]{0,12}",
            second in "[^:]{0,12}",
            key in any::<String>(),
        ) {
            prop_assume!(namespace_prefix(Some(&first)) != namespace_prefix(Some(&second)));
            let engine = engine();
            engine.set(&key, "x", Some(&first), WriteOptions::default()).unwrap();
            engine.set(&key, "y", Some(&second), tpm()).unwrap();

            let got_first = get(&engine, &key, Some(&first));
            prop_assert_eq!(got_first.as_deref(), Some("x"));
            let got_second = get(&engine, &key, Some(&second));
            prop_assert_eq!(got_second.as_deref(), Some("y"));

            prop_assert_eq!(engine.delete_all(Some(&first)).unwrap(), 1);
            prop_assert!(!engine.exists(&key, Some(&first)));
            let got_second = get(&engine, &key, Some(&second));
            prop_assert_eq!(got_second.as_deref(), Some("y"));
        }
    }
}
