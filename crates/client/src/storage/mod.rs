//! Persistence for the Gatelink client.
//!
//! This module provides:
//! - The `Storage` capability trait (string key/value, injected by the host)
//! - `MemoryStorage` for tests and hosts with their own persistence
//! - `FileStorage`, a single versioned JSON document on disk
//! - The device identity store (`identity`)
//! - The device auth token cache (`auth_cache`)

mod auth_cache;
mod identity;

pub use auth_cache::{DeviceAuthCache, DeviceAuthEntry};
pub use identity::{IdentityStore, DEVICE_IDENTITY_KEY};

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use serde::{Deserialize, Serialize};

use protocol::error::{ProtocolError, Result};

/// Key/value persistence capability injected by the embedding host.
///
/// All keys and values are strings; structured records are stored as JSON.
/// Errors from the backing store are fatal to the caller, there is no
/// in-memory fallback.
pub trait Storage: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>>;
    fn set(&self, key: &str, value: &str) -> Result<()>;
    fn remove(&self, key: &str) -> Result<()>;
}

/// In-memory storage, for tests and embedding hosts that persist elsewhere.
#[derive(Default)]
pub struct MemoryStorage {
    entries: RwLock<BTreeMap<String, String>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Storage for MemoryStorage {
    fn get(&self, key: &str) -> Result<Option<String>> {
        let entries = self
            .entries
            .read()
            .map_err(|_| ProtocolError::Storage("storage lock poisoned".to_string()))?;
        Ok(entries.get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        let mut entries = self
            .entries
            .write()
            .map_err(|_| ProtocolError::Storage("storage lock poisoned".to_string()))?;
        entries.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<()> {
        let mut entries = self
            .entries
            .write()
            .map_err(|_| ProtocolError::Storage("storage lock poisoned".to_string()))?;
        entries.remove(key);
        Ok(())
    }
}

/// Current on-disk document version.
const FILE_STORAGE_VERSION: u32 = 1;

/// On-disk document shape for `FileStorage`.
#[derive(Debug, Serialize, Deserialize)]
struct FileDocument {
    version: u32,
    entries: BTreeMap<String, String>,
}

impl Default for FileDocument {
    fn default() -> Self {
        Self {
            version: FILE_STORAGE_VERSION,
            entries: BTreeMap::new(),
        }
    }
}

/// File-backed storage: one versioned JSON document, loaded eagerly and
/// rewritten on every mutation.
pub struct FileStorage {
    path: PathBuf,
    document: RwLock<FileDocument>,
}

impl FileStorage {
    /// Opens (or initializes) the storage document at `path`.
    ///
    /// The parent directory is created if missing. A document with an
    /// unknown version tag is an error, never silently discarded.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| ProtocolError::Storage(format!("create storage dir: {e}")))?;
        }
        let document = if path.exists() {
            let text = std::fs::read_to_string(&path)
                .map_err(|e| ProtocolError::Storage(format!("read storage file: {e}")))?;
            let document: FileDocument = serde_json::from_str(&text)
                .map_err(|e| ProtocolError::Storage(format!("parse storage file: {e}")))?;
            if document.version != FILE_STORAGE_VERSION {
                return Err(ProtocolError::Storage(format!(
                    "unsupported storage version {}",
                    document.version
                )));
            }
            document
        } else {
            FileDocument::default()
        };
        Ok(Self {
            path,
            document: RwLock::new(document),
        })
    }

    fn save(&self, document: &FileDocument) -> Result<()> {
        let text = serde_json::to_string_pretty(document)
            .map_err(|e| ProtocolError::Storage(format!("encode storage file: {e}")))?;
        std::fs::write(&self.path, text)
            .map_err(|e| ProtocolError::Storage(format!("write storage file: {e}")))
    }
}

impl Storage for FileStorage {
    fn get(&self, key: &str) -> Result<Option<String>> {
        let document = self
            .document
            .read()
            .map_err(|_| ProtocolError::Storage("storage lock poisoned".to_string()))?;
        Ok(document.entries.get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        let mut document = self
            .document
            .write()
            .map_err(|_| ProtocolError::Storage("storage lock poisoned".to_string()))?;
        document.entries.insert(key.to_string(), value.to_string());
        self.save(&document)
    }

    fn remove(&self, key: &str) -> Result<()> {
        let mut document = self
            .document
            .write()
            .map_err(|_| ProtocolError::Storage("storage lock poisoned".to_string()))?;
        if document.entries.remove(key).is_some() {
            self.save(&document)?;
        }
        Ok(())
    }
}
