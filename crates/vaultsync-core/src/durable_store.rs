//! Durable key/value persistence for non-secret state.
//!
//! Entries are addressed as `{scope}:{key}`. Every `User(id)` entry lives in
//! its own scope bucket so an account can be wiped without knowing its key
//! names. Reads that fail to deserialize degrade to "absent".

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use crate::error::{Result, SessionError};
use crate::types::{StateScope, UserId};

const DOCUMENT_VERSION: u32 = 1;

#[async_trait]
pub trait DurableStateStore: Send + Sync {
    async fn read_raw(&self, key: &str, scope: &StateScope) -> Result<Option<Value>>;
    async fn write_raw(&self, key: &str, scope: &StateScope, value: Value) -> Result<()>;
    async fn remove(&self, key: &str, scope: &StateScope) -> Result<()>;
    async fn keys(&self, scope: &StateScope) -> Result<BTreeSet<String>>;
    async fn remove_all_for_user(&self, user_id: &UserId) -> Result<()>;
}

/// Typed access on top of [`DurableStateStore`].
#[async_trait]
pub trait DurableStateExt: DurableStateStore {
    async fn read<T>(&self, key: &str, scope: &StateScope) -> Option<T>
    where
        T: DeserializeOwned + Send,
    {
        let raw = match self.read_raw(key, scope).await {
            Ok(Some(raw)) => raw,
            Ok(None) => return None,
            Err(err) => {
                warn!(key = %scope.storage_key(key), error = %err, "state read failed; treating as absent");
                return None;
            }
        };
        match serde_json::from_value(raw) {
            Ok(value) => Some(value),
            Err(err) => {
                warn!(key = %scope.storage_key(key), error = %err, "stored state did not deserialize; treating as absent");
                None
            }
        }
    }

    async fn write<T>(&self, key: &str, scope: &StateScope, value: &T) -> Result<()>
    where
        T: Serialize + Sync,
    {
        let raw = serde_json::to_value(value)?;
        self.write_raw(key, scope, raw).await
    }
}

impl<S: DurableStateStore + ?Sized> DurableStateExt for S {}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct Document {
    #[serde(default)]
    version: u32,
    #[serde(default)]
    scopes: BTreeMap<String, BTreeMap<String, Value>>,
}

impl Document {
    fn empty() -> Self {
        Self {
            version: DOCUMENT_VERSION,
            scopes: BTreeMap::new(),
        }
    }

    fn get(&self, key: &str, scope: &StateScope) -> Option<Value> {
        self.scopes
            .get(&scope.prefix())
            .and_then(|bucket| bucket.get(key))
            .cloned()
    }

    fn insert(&mut self, key: &str, scope: &StateScope, value: Value) {
        self.scopes
            .entry(scope.prefix())
            .or_default()
            .insert(key.to_string(), value);
    }

    fn remove(&mut self, key: &str, scope: &StateScope) -> bool {
        let prefix = scope.prefix();
        let Some(bucket) = self.scopes.get_mut(&prefix) else {
            return false;
        };
        let removed = bucket.remove(key).is_some();
        if bucket.is_empty() {
            self.scopes.remove(&prefix);
        }
        removed
    }

    fn keys(&self, scope: &StateScope) -> BTreeSet<String> {
        self.scopes
            .get(&scope.prefix())
            .map(|bucket| bucket.keys().cloned().collect())
            .unwrap_or_default()
    }

    fn remove_scope(&mut self, scope: &StateScope) -> bool {
        self.scopes.remove(&scope.prefix()).is_some()
    }
}

#[derive(Debug, Default)]
pub struct MemoryStateStore {
    doc: RwLock<Document>,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self {
            doc: RwLock::new(Document::empty()),
        }
    }
}

#[async_trait]
impl DurableStateStore for MemoryStateStore {
    async fn read_raw(&self, key: &str, scope: &StateScope) -> Result<Option<Value>> {
        Ok(self.doc.read().get(key, scope))
    }

    async fn write_raw(&self, key: &str, scope: &StateScope, value: Value) -> Result<()> {
        self.doc.write().insert(key, scope, value);
        Ok(())
    }

    async fn remove(&self, key: &str, scope: &StateScope) -> Result<()> {
        self.doc.write().remove(key, scope);
        Ok(())
    }

    async fn keys(&self, scope: &StateScope) -> Result<BTreeSet<String>> {
        Ok(self.doc.read().keys(scope))
    }

    async fn remove_all_for_user(&self, user_id: &UserId) -> Result<()> {
        self.doc.write().remove_scope(&StateScope::User(user_id.clone()));
        Ok(())
    }
}

/// JSON document on disk, replaced atomically on every write.
///
/// Writers are serialized and the file I/O runs on the blocking pool; readers
/// keep seeing the previous document until the new one is on disk.
#[derive(Debug)]
pub struct FileStateStore {
    path: PathBuf,
    doc: RwLock<Document>,
    writes: tokio::sync::Mutex<()>,
}

impl FileStateStore {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let doc = Self::load(&path)?;
        Ok(Self {
            path,
            doc: RwLock::new(doc),
            writes: tokio::sync::Mutex::new(()),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn load(path: &Path) -> Result<Document> {
        if !path.exists() {
            return Ok(Document::empty());
        }
        let data = fs::read(path)?;
        match serde_json::from_slice::<Document>(&data) {
            Ok(doc) => Ok(doc),
            Err(err) => {
                let quarantine = path.with_extension("corrupt");
                warn!(
                    path = %path.display(),
                    moved_to = %quarantine.display(),
                    error = %err,
                    "state file corrupt; starting empty"
                );
                let _ = fs::rename(path, &quarantine);
                Ok(Document::empty())
            }
        }
    }

    /// Apply `change` to a copy of the document and swap it in only after it is on disk.
    async fn mutate<F>(&self, change: F) -> Result<()>
    where
        F: FnOnce(&mut Document) -> bool,
    {
        let _writes = self.writes.lock().await;
        let mut next = self.doc.read().clone();
        if !change(&mut next) {
            return Ok(());
        }
        next.version = DOCUMENT_VERSION;
        let path = self.path.clone();
        let next = tokio::task::spawn_blocking(move || persist(&path, &next).map(|()| next))
            .await
            .map_err(|e| SessionError::Storage(format!("state writer task: {e}")))??;
        *self.doc.write() = next;
        Ok(())
    }
}

fn persist(path: &Path, doc: &Document) -> Result<()> {
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    };
    let bytes = serde_json::to_vec_pretty(doc)?;
    let mut staging = tempfile::NamedTempFile::new_in(&dir)?;
    staging.write_all(&bytes)?;
    staging.flush()?;
    staging.as_file().sync_all()?;
    staging
        .persist(path)
        .map_err(|e| SessionError::Storage(format!("persist state file: {}", e.error)))?;
    debug!(path = %path.display(), bytes = bytes.len(), "state file written");
    Ok(())
}

#[async_trait]
impl DurableStateStore for FileStateStore {
    async fn read_raw(&self, key: &str, scope: &StateScope) -> Result<Option<Value>> {
        Ok(self.doc.read().get(key, scope))
    }

    async fn write_raw(&self, key: &str, scope: &StateScope, value: Value) -> Result<()> {
        self.mutate(|doc| {
            doc.insert(key, scope, value);
            true
        })
        .await
    }

    async fn remove(&self, key: &str, scope: &StateScope) -> Result<()> {
        self.mutate(|doc| doc.remove(key, scope)).await
    }

    async fn keys(&self, scope: &StateScope) -> Result<BTreeSet<String>> {
        Ok(self.doc.read().keys(scope))
    }

    async fn remove_all_for_user(&self, user_id: &UserId) -> Result<()> {
        let scope = StateScope::User(user_id.clone());
        self.mutate(|doc| doc.remove_scope(&scope)).await
    }
}
