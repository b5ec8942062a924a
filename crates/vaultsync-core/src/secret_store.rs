//! In-memory holder of decrypted per-user vault keys.
//!
//! Nothing in here is ever serialized. A [`SecretHandle`] wraps the 32-byte
//! user key in a zeroizing buffer that is wiped once the last clone is
//! dropped, which happens when the store replaces or clears it and any
//! in-flight borrower finishes its operation.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::debug;
use zeroize::Zeroizing;

use crate::crypto::{constant_time_eq, generate_key, KEY_LEN};
use crate::error::{Result, SessionError};
use crate::types::UserId;

static NEXT_HANDLE_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HandleId(u64);

struct HandleInner {
    id: HandleId,
    user_id: UserId,
    key: Zeroizing<[u8; KEY_LEN]>,
}

#[derive(Clone)]
pub struct SecretHandle {
    inner: Arc<HandleInner>,
}

impl SecretHandle {
    pub fn new(user_id: UserId, key: Zeroizing<[u8; KEY_LEN]>) -> Self {
        let id = HandleId(NEXT_HANDLE_ID.fetch_add(1, Ordering::Relaxed));
        Self {
            inner: Arc::new(HandleInner { id, user_id, key }),
        }
    }

    pub fn from_slice(user_id: UserId, key: &[u8]) -> Result<Self> {
        if key.len() != KEY_LEN {
            return Err(SessionError::Crypto("user key length invalid".to_string()));
        }
        let mut bytes = Zeroizing::new([0u8; KEY_LEN]);
        bytes.copy_from_slice(key);
        Ok(Self::new(user_id, bytes))
    }

    /// Fresh random key for `user_id`.
    pub fn generate(user_id: UserId) -> Self {
        Self::new(user_id, generate_key())
    }

    pub fn id(&self) -> HandleId {
        self.inner.id
    }

    pub fn user_id(&self) -> &UserId {
        &self.inner.user_id
    }

    pub fn key_bytes(&self) -> &[u8] {
        &self.inner.key[..]
    }

    pub fn same_key(&self, other: &SecretHandle) -> bool {
        constant_time_eq(self.key_bytes(), other.key_bytes())
    }
}

impl PartialEq for SecretHandle {
    fn eq(&self, other: &Self) -> bool {
        self.inner.id == other.inner.id
    }
}

impl Eq for SecretHandle {}

impl fmt::Debug for SecretHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SecretHandle")
            .field("id", &self.inner.id)
            .field("user_id", &self.inner.user_id)
            .field("key", &"<redacted>")
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SecretEvent {
    Available(UserId),
    Cleared(UserId),
}

pub type SecretListener = Arc<dyn Fn(&SecretEvent) + Send + Sync>;

#[derive(Default)]
pub struct SecretStore {
    handles: RwLock<HashMap<UserId, SecretHandle>>,
    listeners: RwLock<Vec<SecretListener>>,
}

impl SecretStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, user_id: &UserId, handle: SecretHandle) {
        let previous = self.handles.write().insert(user_id.clone(), handle);
        if let Some(old) = previous {
            debug!(user = %user_id, handle = ?old.id(), "replaced user key");
            drop(old);
        }
        self.notify(&SecretEvent::Available(user_id.clone()));
    }

    pub fn get(&self, user_id: &UserId) -> Option<SecretHandle> {
        self.handles.read().get(user_id).cloned()
    }

    pub fn contains(&self, user_id: &UserId) -> bool {
        self.handles.read().contains_key(user_id)
    }

    pub fn clear(&self, user_id: &UserId) {
        let removed = self.handles.write().remove(user_id);
        if removed.is_some() {
            drop(removed);
            self.notify(&SecretEvent::Cleared(user_id.clone()));
        }
    }

    pub fn clear_all(&self) {
        let drained: Vec<UserId> = {
            let mut guard = self.handles.write();
            guard.drain().map(|(id, _)| id).collect()
        };
        for user_id in drained {
            self.notify(&SecretEvent::Cleared(user_id));
        }
    }

    pub fn users(&self) -> Vec<UserId> {
        self.handles.read().keys().cloned().collect()
    }

    pub fn subscribe(&self, listener: SecretListener) {
        self.listeners.write().push(listener);
    }

    fn notify(&self, event: &SecretEvent) {
        let listeners = self.listeners.read().clone();
        for listener in listeners {
            listener(event);
        }
    }
}
