//! Durable platform secret store.
//!
//! This module manages the on-disk credential store using sled. Slots are
//! keyed by qualified name. Each persistence class gets its own tree:
//!
//! - `localMachine` lives in the default tree of `<dir>/credentials`
//! - `enterprise` lives in the `enterprise` tree of the same database
//! - `session` lives in a temporary database that disappears with the store
//!
//! A name occupies at most one class at a time. Blobs are sealed under the
//! per-user key before they touch disk; metadata stays in the clear so
//! enumeration never needs to unseal anything.

use bincode::{Decode, Encode};
use serde::{Deserialize, Serialize};
use sled::{Db, Tree};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, instrument, warn};

use crate::crypt::UserKey;
use crate::secret::{CredentialMeta, CredentialSummary, Persistence, StoredCredential};
use crate::store::{PlatformSecretStore, StoreError, StoreResult};

pub const USER_KEY_FILE: &str = "user.key";
const DB_DIR: &str = "credentials";
const ENTERPRISE_TREE: &str = "enterprise";

/// What actually gets written into sled for a slot.
#[derive(Serialize, Deserialize, Encode, Decode, Debug, Clone)]
struct SealedRecord {
    meta: CredentialMeta,
    sealed_blob: Vec<u8>,
}

struct Trees {
    machine: Tree,
    enterprise: Tree,
    session: Tree,
    // keep the databases open for as long as the trees are in use
    _db: Db,
    _session_db: Db,
}

impl Trees {
    fn for_class(&self, persistence: Persistence) -> &Tree {
        match persistence {
            Persistence::Session => &self.session,
            Persistence::LocalMachine => &self.machine,
            Persistence::Enterprise => &self.enterprise,
        }
    }

    fn all(&self) -> [(Persistence, &Tree); 3] {
        [
            (Persistence::Session, &self.session),
            (Persistence::LocalMachine, &self.machine),
            (Persistence::Enterprise, &self.enterprise),
        ]
    }
}

/// A [`PlatformSecretStore`] on top of sled.
#[derive(Clone)]
pub struct SledSecretStore {
    trees: Arc<Mutex<Trees>>,
    user_key: Arc<UserKey>,
    path: PathBuf,
}

impl SledSecretStore {
    /// Opens (or creates) the store rooted at `dir`.
    pub fn open(dir: impl AsRef<Path>) -> StoreResult<Self> {
        let dir = dir.as_ref();
        std::fs::create_dir_all(dir)?;

        let user_key = UserKey::load_or_create(&dir.join(USER_KEY_FILE))?;
        let db = sled::open(dir.join(DB_DIR))?;
        let enterprise = db.open_tree(ENTERPRISE_TREE)?;
        let session_db = sled::Config::new().temporary(true).open()?;

        debug!(path = %dir.display(), "Opened credential store");
        Ok(Self {
            trees: Arc::new(Mutex::new(Trees {
                machine: (*db).clone(),
                enterprise,
                session: (*session_db).clone(),
                _db: db,
                _session_db: session_db,
            })),
            user_key: Arc::new(user_key),
            path: dir.to_path_buf(),
        })
    }

    /// Directory the store lives in.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn trees(&self) -> StoreResult<MutexGuard<'_, Trees>> {
        self.trees.lock().map_err(|_| StoreError::Poisoned)
    }

    fn decode_record(bytes: &[u8]) -> StoreResult<SealedRecord> {
        let (record, _): (SealedRecord, usize) =
            bincode::decode_from_slice(bytes, bincode::config::standard())?;
        Ok(record)
    }
}

impl PlatformSecretStore for SledSecretStore {
    #[instrument(level = "debug", skip(self, credential), fields(name = %credential.name))]
    fn write(&self, credential: &StoredCredential) -> StoreResult<()> {
        let sealed_blob = self
            .user_key
            .sealing_key(&credential.name)
            .and_then(|key| key.seal(&credential.blob))
            .map_err(|_| StoreError::Protection {
                name: credential.name.clone(),
            })?;
        let record = SealedRecord {
            meta: credential.meta.clone(),
            sealed_blob,
        };
        let encoded = bincode::encode_to_vec(&record, bincode::config::standard())?;

        let trees = self.trees()?;
        let target = credential.meta.persistence;
        trees
            .for_class(target)
            .insert(credential.name.as_bytes(), encoded)?;
        if target != Persistence::Session {
            trees.for_class(target).flush()?;
        }
        for (class, tree) in trees.all() {
            if class != target && tree.remove(credential.name.as_bytes())?.is_some() {
                debug!(from = class.as_str(), to = target.as_str(), "Moved credential between persistence classes");
                if class != Persistence::Session {
                    tree.flush()?;
                }
            }
        }
        Ok(())
    }

    fn read(&self, name: &str) -> StoreResult<StoredCredential> {
        let trees = self.trees()?;
        for (_, tree) in trees.all() {
            if let Some(bytes) = tree.get(name.as_bytes())? {
                let record = Self::decode_record(&bytes)?;
                let blob = self
                    .user_key
                    .sealing_key(name)
                    .and_then(|key| key.unseal(&record.sealed_blob))
                    .map_err(|_| StoreError::Protection { name: name.into() })?;
                return Ok(StoredCredential::new(name, blob, record.meta));
            }
        }
        Err(StoreError::NotFound { name: name.into() })
    }

    fn contains(&self, name: &str) -> StoreResult<bool> {
        let trees = self.trees()?;
        for (_, tree) in trees.all() {
            if tree.contains_key(name.as_bytes())? {
                return Ok(true);
            }
        }
        Ok(false)
    }

    #[instrument(level = "debug", skip(self))]
    fn delete(&self, name: &str) -> StoreResult<()> {
        let trees = self.trees()?;
        let mut removed = false;
        for (class, tree) in trees.all() {
            if tree.remove(name.as_bytes())?.is_some() {
                removed = true;
                if class != Persistence::Session {
                    tree.flush()?;
                }
            }
        }
        if removed {
            Ok(())
        } else {
            Err(StoreError::NotFound { name: name.into() })
        }
    }

    fn enumerate(&self) -> StoreResult<Vec<CredentialSummary>> {
        let trees = self.trees()?;
        let mut summaries = Vec::new();
        for (_, tree) in trees.all() {
            for entry in tree.iter() {
                let (key, value) = entry?;
                let Ok(name) = String::from_utf8(key.to_vec()) else {
                    warn!(key = ?key, "Skipping credential with a non-UTF-8 name");
                    continue;
                };
                let meta = match Self::decode_record(&value) {
                    Ok(record) => Some(record.meta),
                    Err(e) => {
                        warn!(error = %e, slot = %name, "Credential record is unreadable");
                        None
                    }
                };
                summaries.push(CredentialSummary { name, meta });
            }
        }
        Ok(summaries)
    }
}
