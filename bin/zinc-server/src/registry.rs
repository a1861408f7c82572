//! Datastore registry
//!
//! Maps datastore names to their [`DatastoreOperations`]. Lookups clone the
//! current map pointer; creating an entry copies the map under a mutex and
//! swaps the new map in.
//!
//! The global configuration lives in the `.config` datastore and
//! per-datastore overrides in `<name>.config`. Both are loaded with their
//! JSON entries parsed into a [`VarMap`].

use parking_lot::{Mutex, RwLock};
use rand::Rng;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use zinc_common::checksum::hash_secret;
use zinc_common::config::{default_global_config, keys};
use zinc_common::{DatastoreConfigSnapshot, Error, Result, VarMap};
use zinc_storage::{DatastoreOperations, Entry, WriteOptions, serialize_entries};

/// Name of the global configuration datastore
pub const GLOBAL_CONFIG_DATASTORE: &str = ".config";

const CONFIG_SUFFIX: &str = ".config";
const MAX_NAME_LEN: usize = 128;

/// Suffixes used by temporary siblings of datastore files
const RESERVED_SUFFIXES: [&str; 4] = [".partial-", ".old-", ".deleted-", ".corrupted-"];

/// Whether `name` may be used as a datastore name
#[must_use]
pub fn is_valid_datastore_name(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= MAX_NAME_LEN
        && name
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'.' | b'-' | b'_'))
        && !name.bytes().all(|b| b == b'.')
        && !RESERVED_SUFFIXES.iter().any(|s| name.contains(s))
}

/// Whether `name` is a configuration datastore (global or per-datastore)
#[must_use]
pub fn is_config_datastore(name: &str) -> bool {
    name.ends_with(CONFIG_SUFFIX)
}

/// Serialize `(key JSON, value JSON)` pairs as configuration entries
#[must_use]
pub fn config_entries(pairs: &[(String, String)]) -> Vec<u8> {
    let entries: Vec<Entry> = pairs
        .iter()
        .map(|(key, value)| Entry::json(key.as_bytes(), value.as_bytes()))
        .collect();
    serialize_entries(&entries)
}

/// Configuration writes are synced before they are acknowledged
fn config_write_options() -> WriteOptions {
    WriteOptions {
        flush: true,
        max_flush_delay: Duration::ZERO,
        max_size: None,
        max_entry_size: None,
    }
}

pub struct ServerRegistry {
    storage_path: PathBuf,
    datastores: RwLock<Arc<HashMap<String, Arc<DatastoreOperations>>>>,
    create_lock: Mutex<()>,
}

impl ServerRegistry {
    /// Open the registry over `storage_path`, creating the directory and a
    /// default global configuration if they do not exist yet
    pub fn open(storage_path: impl Into<PathBuf>) -> Result<Self> {
        let storage_path = storage_path.into();
        fs::create_dir_all(&storage_path)?;

        let registry = Self {
            storage_path,
            datastores: RwLock::new(Arc::new(HashMap::new())),
            create_lock: Mutex::new(()),
        };
        registry.bootstrap_global_config()?;
        Ok(registry)
    }

    fn bootstrap_global_config(&self) -> Result<()> {
        let ops = self.get_or_create(GLOBAL_CONFIG_DATASTORE)?;
        match ops.load_if_needed() {
            Ok(state) => {
                info!(
                    "Loaded global configuration ({} bytes)",
                    state.total_size()
                );
                Ok(())
            }
            Err(e) if e.is_not_found() => {
                ops.create_if_missing()?;
                let defaults = config_entries(&default_global_config().to_json_entries());
                ops.append_transaction(defaults, &config_write_options())?;
                info!("Wrote default global configuration");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    #[must_use]
    pub fn storage_path(&self) -> &Path {
        &self.storage_path
    }

    /// Operations for `name` if they were created already
    #[must_use]
    pub fn get(&self, name: &str) -> Option<Arc<DatastoreOperations>> {
        self.datastores.read().get(name).cloned()
    }

    /// Operations for `name`, created on first use. The datastore file itself
    /// is not created.
    pub fn get_or_create(&self, name: &str) -> Result<Arc<DatastoreOperations>> {
        if let Some(ops) = self.get(name) {
            return Ok(ops);
        }
        if !is_valid_datastore_name(name) {
            return Err(Error::validation(format!("invalid datastore name {name:?}")));
        }

        let _create = self.create_lock.lock();
        let current = Arc::clone(&self.datastores.read());
        if let Some(ops) = current.get(name) {
            return Ok(Arc::clone(ops));
        }

        let ops = Arc::new(DatastoreOperations::new(
            name,
            self.storage_path.join(name),
            is_config_datastore(name),
        ));
        let mut next = HashMap::clone(&current);
        next.insert(name.to_string(), Arc::clone(&ops));
        *self.datastores.write() = Arc::new(next);
        Ok(ops)
    }

    /// Forget `name` and close its state
    pub fn release(&self, name: &str) {
        let _create = self.create_lock.lock();
        let current = Arc::clone(&self.datastores.read());
        if !current.contains_key(name) {
            return;
        }
        let mut next = HashMap::clone(&current);
        if let Some(ops) = next.remove(name) {
            ops.close();
        }
        *self.datastores.write() = Arc::new(next);
    }

    /// Number of datastores with live operations
    #[must_use]
    pub fn len(&self) -> usize {
        self.datastores.read().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Parsed global configuration
    pub fn global_config(&self) -> Result<Arc<VarMap>> {
        self.get_or_create(GLOBAL_CONFIG_DATASTORE)?.config()
    }

    /// Configuration for `name`: its own `<name>.config` if present, falling
    /// back to the global configuration
    pub fn datastore_config(&self, name: &str) -> Result<DatastoreConfigSnapshot> {
        let global = self.global_config()?;
        if is_config_datastore(name) {
            return Ok(DatastoreConfigSnapshot::new(None, global));
        }

        let specific_name = format!("{name}{CONFIG_SUFFIX}");
        let specific = if is_valid_datastore_name(&specific_name) {
            let ops = self.get_or_create(&specific_name)?;
            if ops.exists() {
                Some(ops.config()?)
            } else {
                None
            }
        } else {
            None
        };
        Ok(DatastoreConfigSnapshot::new(specific, global))
    }

    /// Make sure a master key is configured. Returns the new key when one had
    /// to be generated; only its hash is stored.
    pub fn ensure_master_key(&self) -> Result<Option<String>> {
        if self.global_config()?.get(keys::MASTER_KEY_HASH).is_some() {
            return Ok(None);
        }

        let mut raw = [0u8; 16];
        rand::thread_rng().fill(&mut raw);
        let key = hex::encode(raw);

        let mut update = VarMap::new();
        update.set(keys::MASTER_KEY_HASH, hash_secret(&key));
        let entries = config_entries(&update.to_json_entries());
        self.get_or_create(GLOBAL_CONFIG_DATASTORE)?
            .append_transaction(entries, &config_write_options())?;
        Ok(Some(key))
    }
}

impl std::fmt::Debug for ServerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerRegistry")
            .field("storage_path", &self.storage_path)
            .field("datastores", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;
    use zinc_common::checksum::is_valid_access_key;

    #[test]
    fn test_name_validation() {
        assert!(is_valid_datastore_name("d1"));
        assert!(is_valid_datastore_name("my-store_2.config"));
        assert!(is_valid_datastore_name(".config"));
        assert!(!is_valid_datastore_name(""));
        assert!(!is_valid_datastore_name(".."));
        assert!(!is_valid_datastore_name("a/b"));
        assert!(!is_valid_datastore_name("d1.corrupted-123"));
        assert!(!is_valid_datastore_name(&"x".repeat(129)));

        assert!(is_config_datastore(".config"));
        assert!(is_config_datastore("d1.config"));
        assert!(!is_config_datastore("d1"));
    }

    #[test]
    fn test_bootstrap_writes_default_config() {
        let dir = tempdir().unwrap();
        let registry = ServerRegistry::open(dir.path().join("storage")).unwrap();

        assert!(registry.storage_path().join(".config").is_file());
        let config = registry.global_config().unwrap();
        assert_eq!(
            config.get_int64(keys::COMPACTION_MIN_SIZE).unwrap(),
            512 * 1024
        );
        assert!(config.get_bool(&keys::method_allowed("Anonymous", "GET")).unwrap());
        drop(registry);

        // Reopening loads the existing configuration instead of rewriting it
        let size = fs::metadata(dir.path().join("storage/.config")).unwrap().len();
        let registry = ServerRegistry::open(dir.path().join("storage")).unwrap();
        assert_eq!(registry.global_config().unwrap().len(), config.len());
        assert_eq!(
            fs::metadata(dir.path().join("storage/.config")).unwrap().len(),
            size
        );
    }

    #[test]
    fn test_get_or_create_is_shared() {
        let dir = tempdir().unwrap();
        let registry = ServerRegistry::open(dir.path()).unwrap();

        let a = registry.get_or_create("d1").unwrap();
        let b = registry.get_or_create("d1").unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert!(!a.is_cached());
        assert!(registry.get_or_create("d1.config").unwrap().is_cached());
        assert!(registry.get_or_create("../etc").is_err());

        registry.release("d1");
        assert!(registry.get("d1").is_none());
        assert!(!Arc::ptr_eq(&a, &registry.get_or_create("d1").unwrap()));
    }

    #[test]
    fn test_datastore_config_falls_back_to_global() {
        let dir = tempdir().unwrap();
        let registry = ServerRegistry::open(dir.path()).unwrap();

        let config = registry.datastore_config("d1").unwrap();
        assert!(config.get_bool(keys::FLUSH_ENABLED).unwrap());

        let specific = registry.get_or_create("d1.config").unwrap();
        specific.create_if_missing().unwrap();
        let mut update = VarMap::new();
        update.set(keys::FLUSH_ENABLED, false);
        specific
            .append_transaction(
                config_entries(&update.to_json_entries()),
                &config_write_options(),
            )
            .unwrap();

        let config = registry.datastore_config("d1").unwrap();
        assert!(!config.get_bool(keys::FLUSH_ENABLED).unwrap());
        assert_eq!(
            config.get_int64(keys::FLUSH_MAX_DELAY).unwrap(),
            1000
        );
    }

    #[test]
    fn test_master_key_is_generated_once() {
        let dir = tempdir().unwrap();
        let registry = ServerRegistry::open(dir.path()).unwrap();

        let key = registry.ensure_master_key().unwrap().unwrap();
        assert!(is_valid_access_key(&key));
        assert_eq!(
            registry
                .global_config()
                .unwrap()
                .get_string(keys::MASTER_KEY_HASH)
                .unwrap(),
            hash_secret(&key)
        );
        assert!(registry.ensure_master_key().unwrap().is_none());
    }
}
