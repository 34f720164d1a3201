//! Per-plugin persistent key-value storage
//!
//! The store is strictly partitioned by plugin id: one plugin can never read
//! or write another's keys. Two backends: an in-memory map for tests and
//! ephemeral deployments, and a file-backed store keeping each namespace in
//! `<base>/<plugin_id>/data.json`.

use std::collections::HashMap;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

use parking_lot::RwLock;
use tracing::warn;

use crate::error::{PluginError, PluginResult};
use crate::manifest::PluginId;

type Namespace = HashMap<String, Vec<u8>>;

/// Per-plugin key-value storage. All operations are thread-safe. Backend
/// failures surface to the caller; nothing is retried.
pub trait Storage: Send + Sync {
    /// Value for `key` in the plugin's namespace, `None` when absent.
    fn get(&self, plugin: &PluginId, key: &str) -> PluginResult<Option<Vec<u8>>>;
    fn set(&self, plugin: &PluginId, key: &str, value: Vec<u8>) -> PluginResult<()>;
    fn delete(&self, plugin: &PluginId, key: &str) -> PluginResult<()>;
    /// Remove the plugin's entire namespace.
    fn clear(&self, plugin: &PluginId) -> PluginResult<()>;
    fn close(&self) -> PluginResult<()>;
}

/// Zero-persistence backend backed by nested maps.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    data: RwLock<HashMap<String, Namespace>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Storage for MemoryStorage {
    fn get(&self, plugin: &PluginId, key: &str) -> PluginResult<Option<Vec<u8>>> {
        Ok(self
            .data
            .read()
            .get(plugin.as_str())
            .and_then(|ns| ns.get(key).cloned()))
    }

    fn set(&self, plugin: &PluginId, key: &str, value: Vec<u8>) -> PluginResult<()> {
        self.data
            .write()
            .entry(plugin.as_str().to_string())
            .or_default()
            .insert(key.to_string(), value);
        Ok(())
    }

    fn delete(&self, plugin: &PluginId, key: &str) -> PluginResult<()> {
        if let Some(ns) = self.data.write().get_mut(plugin.as_str()) {
            ns.remove(key);
        }
        Ok(())
    }

    fn clear(&self, plugin: &PluginId) -> PluginResult<()> {
        self.data.write().remove(plugin.as_str());
        Ok(())
    }

    fn close(&self) -> PluginResult<()> {
        Ok(())
    }
}

/// File-backed storage: one JSON object per plugin namespace, written with
/// write-temp-then-rename inside the namespace directory so a crash leaves
/// either the old or the new file, never a torn one.
pub struct FileStorage {
    base: PathBuf,
    data: RwLock<HashMap<String, Namespace>>,
}

impl FileStorage {
    /// Open the store rooted at `base`, loading every existing namespace.
    /// Files other than `data.json` inside a namespace are ignored.
    pub fn open(base: &Path) -> PluginResult<Self> {
        fs::create_dir_all(base)?;

        let mut data = HashMap::new();
        for entry in fs::read_dir(base)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let plugin_id = entry.file_name().to_string_lossy().into_owned();
            let path = entry.path().join("data.json");
            let text = match fs::read(&path) {
                Ok(text) => text,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(PluginError::storage("open", e)),
            };
            let namespace: Namespace = serde_json::from_slice(&text)
                .map_err(|e| PluginError::storage("open", format!("{plugin_id}: {e}")))?;
            data.insert(plugin_id, namespace);
        }

        Ok(Self {
            base: base.to_path_buf(),
            data: RwLock::new(data),
        })
    }

    /// Flush one namespace to disk. Called with the write lock held, which
    /// serializes writers per the storage contract.
    fn persist(&self, plugin_id: &str, namespace: &Namespace) -> PluginResult<()> {
        let dir = self.base.join(plugin_id);
        fs::create_dir_all(&dir).map_err(|e| PluginError::storage("persist", e))?;

        let bytes =
            serde_json::to_vec(namespace).map_err(|e| PluginError::storage("persist", e))?;

        let tmp = dir.join("data.json.tmp");
        let mut file = File::create(&tmp).map_err(|e| PluginError::storage("persist", e))?;
        file.write_all(&bytes)
            .map_err(|e| PluginError::storage("persist", e))?;
        file.sync_all()
            .map_err(|e| PluginError::storage("persist", e))?;
        fs::rename(&tmp, dir.join("data.json")).map_err(|e| PluginError::storage("persist", e))?;
        Ok(())
    }
}

impl Storage for FileStorage {
    fn get(&self, plugin: &PluginId, key: &str) -> PluginResult<Option<Vec<u8>>> {
        Ok(self
            .data
            .read()
            .get(plugin.as_str())
            .and_then(|ns| ns.get(key).cloned()))
    }

    fn set(&self, plugin: &PluginId, key: &str, value: Vec<u8>) -> PluginResult<()> {
        let mut data = self.data.write();
        let namespace = data.entry(plugin.as_str().to_string()).or_default();
        namespace.insert(key.to_string(), value);
        let namespace = namespace.clone();
        self.persist(plugin.as_str(), &namespace)
    }

    fn delete(&self, plugin: &PluginId, key: &str) -> PluginResult<()> {
        let mut data = self.data.write();
        let Some(namespace) = data.get_mut(plugin.as_str()) else {
            return Ok(());
        };
        namespace.remove(key);
        let namespace = namespace.clone();
        self.persist(plugin.as_str(), &namespace)
    }

    fn clear(&self, plugin: &PluginId) -> PluginResult<()> {
        self.data.write().remove(plugin.as_str());
        let dir = self.base.join(plugin.as_str());
        match fs::remove_dir_all(&dir) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(PluginError::storage("clear", e)),
        }
    }

    fn close(&self) -> PluginResult<()> {
        let data = self.data.read();
        for (plugin_id, namespace) in data.iter() {
            if let Err(e) = self.persist(plugin_id, namespace) {
                warn!(plugin = %plugin_id, error = %e, "failed to persist namespace on close");
                return Err(e);
            }
        }
        Ok(())
    }
}
