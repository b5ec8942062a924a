//! Keeps one named piece of state consistent across contexts.
//!
//! Exactly one context defines a key as authoritative; it persists and
//! broadcasts every mutation as a [`StateEnvelope`] with a strictly increasing
//! revision. Mirror contexts cold-start from a snapshot (or the durable store
//! when the owner is unreachable) and then apply only envelopes newer than
//! the one they hold, so duplicate or reordered deliveries never regress them.

use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tracing::{debug, trace, warn};

use crate::channel::{CrossContextChannel, DEFAULT_SNAPSHOT_TIMEOUT};
use crate::durable_store::{DurableStateExt, DurableStateStore};
use crate::error::{Result, SessionError};
use crate::types::{state_topic, StateEnvelope, StateScope, UserId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ClearEvent {
    Lock,
    Logout,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Authoritative,
    Mirror,
}

#[derive(Debug, Clone)]
struct Entry {
    role: Role,
    value: Option<Value>,
    revision: u64,
    // false until a mirror has applied its first envelope
    synced: bool,
    clear_on: BTreeSet<ClearEvent>,
}

type EntryKey = (StateScope, String);

struct BrokerInner {
    channel: Arc<dyn CrossContextChannel>,
    store: Arc<dyn DurableStateStore>,
    snapshot_timeout: Duration,
    entries: RwLock<HashMap<EntryKey, Entry>>,
}

/// Per-context broker. Cheap to clone.
#[derive(Clone)]
pub struct SessionStateBroker {
    inner: Arc<BrokerInner>,
}

impl SessionStateBroker {
    pub fn new(channel: Arc<dyn CrossContextChannel>, store: Arc<dyn DurableStateStore>) -> Self {
        Self::with_snapshot_timeout(channel, store, DEFAULT_SNAPSHOT_TIMEOUT)
    }

    pub fn with_snapshot_timeout(
        channel: Arc<dyn CrossContextChannel>,
        store: Arc<dyn DurableStateStore>,
        snapshot_timeout: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(BrokerInner {
                channel,
                store,
                snapshot_timeout,
                entries: RwLock::new(HashMap::new()),
            }),
        }
    }

    pub fn context_id(&self) -> &str {
        self.inner.channel.context_id()
    }

    pub fn store(&self) -> &Arc<dyn DurableStateStore> {
        &self.inner.store
    }

    pub fn role(&self, key: &str, scope: &StateScope) -> Option<Role> {
        self.inner
            .entries
            .read()
            .get(&(scope.clone(), key.to_string()))
            .map(|e| e.role)
    }

    /// Marks this context as the owner of `key`.
    ///
    /// A previously persisted envelope wins over `initial_value` so the
    /// revision sequence keeps increasing across restarts.
    pub async fn define_authoritative<T: Serialize>(
        &self,
        key: &str,
        scope: StateScope,
        initial_value: Option<T>,
        clear_on: &[ClearEvent],
    ) -> Result<()> {
        let entry_key = (scope.clone(), key.to_string());
        if let Some(existing) = self.inner.entries.read().get(&entry_key) {
            if existing.role == Role::Authoritative {
                return Ok(());
            }
        }
        let persisted: Option<StateEnvelope<Value>> = self.inner.store.read(key, &scope).await;
        let (value, revision) = match persisted {
            Some(envelope) => (envelope.value, envelope.revision),
            None => {
                let initial = initial_value.map(serde_json::to_value).transpose()?;
                (initial, 0)
            }
        };
        self.inner.entries.write().insert(
            entry_key,
            Entry {
                role: Role::Authoritative,
                value,
                revision,
                synced: true,
                clear_on: clear_on.iter().copied().collect(),
            },
        );

        let weak = Arc::downgrade(&self.inner);
        let responder_scope = scope.clone();
        let responder_key = key.to_string();
        self.inner.channel.serve_snapshots(
            &state_topic(key, &scope),
            Arc::new(move || {
                let inner = weak.upgrade()?;
                let envelope = snapshot_of(&inner, &responder_key, &responder_scope)?;
                serde_json::to_value(envelope).ok()
            }),
        );
        debug!(key, scope = %scope.prefix(), revision, "defined authoritative state");
        Ok(())
    }

    /// Marks this context as a follower of `key` and rehydrates it.
    pub async fn define_mirror(&self, key: &str, scope: StateScope) -> Result<()> {
        let entry_key = (scope.clone(), key.to_string());
        {
            let mut entries = self.inner.entries.write();
            if entries.contains_key(&entry_key) {
                return Ok(());
            }
            entries.insert(
                entry_key,
                Entry {
                    role: Role::Mirror,
                    value: None,
                    revision: 0,
                    synced: false,
                    clear_on: BTreeSet::new(),
                },
            );
        }

        // Subscribe before asking for the snapshot so nothing sent in between is lost.
        let topic = state_topic(key, &scope);
        let weak: Weak<BrokerInner> = Arc::downgrade(&self.inner);
        self.inner.channel.on(
            &topic,
            Arc::new(move |payload| {
                let Some(inner) = weak.upgrade() else { return };
                match serde_json::from_value::<StateEnvelope<Value>>(payload) {
                    Ok(envelope) => {
                        apply(&inner, envelope);
                    }
                    Err(err) => warn!(error = %err, "dropping malformed state envelope"),
                }
            }),
        );

        let snapshot = self
            .inner
            .channel
            .request_snapshot(&topic, self.inner.snapshot_timeout)
            .await
            .and_then(|raw| serde_json::from_value::<StateEnvelope<Value>>(raw).map_err(Into::into));
        match snapshot {
            Ok(envelope) => {
                apply(&self.inner, envelope);
            }
            Err(err) => {
                debug!(key, error = %err, "snapshot unavailable; falling back to durable state");
                if let Some(envelope) = self
                    .inner
                    .store
                    .read::<StateEnvelope<Value>>(key, &scope)
                    .await
                {
                    apply(&self.inner, envelope);
                }
            }
        }
        Ok(())
    }

    pub fn current_value(&self, key: &str, scope: &StateScope) -> Option<Value> {
        self.inner
            .entries
            .read()
            .get(&(scope.clone(), key.to_string()))
            .and_then(|e| e.value.clone())
    }

    pub fn current<T: DeserializeOwned>(&self, key: &str, scope: &StateScope) -> Option<T> {
        self.current_value(key, scope)
            .and_then(|v| serde_json::from_value(v).ok())
    }

    pub fn revision(&self, key: &str, scope: &StateScope) -> Option<u64> {
        self.inner
            .entries
            .read()
            .get(&(scope.clone(), key.to_string()))
            .map(|e| e.revision)
    }

    pub fn envelope(&self, key: &str, scope: &StateScope) -> Option<StateEnvelope<Value>> {
        snapshot_of(&self.inner, key, scope)
    }

    /// Applies `mutator` on the owning context, then persists and broadcasts.
    pub async fn update_authoritative<F>(
        &self,
        key: &str,
        scope: &StateScope,
        mutator: F,
    ) -> Result<StateEnvelope<Value>>
    where
        F: FnOnce(Option<Value>) -> Option<Value> + Send,
    {
        let envelope = {
            let mut entries = self.inner.entries.write();
            let entry = entries
                .get_mut(&(scope.clone(), key.to_string()))
                .ok_or_else(|| SessionError::UnknownState {
                    key: scope.storage_key(key),
                })?;
            if entry.role != Role::Authoritative {
                return Err(SessionError::NotAuthoritative {
                    key: scope.storage_key(key),
                });
            }
            entry.value = mutator(entry.value.take());
            entry.revision += 1;
            StateEnvelope::new(key, scope.clone(), entry.value.clone(), entry.revision)
        };
        self.publish(&envelope).await?;
        Ok(envelope)
    }

    pub async fn set_authoritative<T: Serialize>(
        &self,
        key: &str,
        scope: &StateScope,
        value: Option<T>,
    ) -> Result<StateEnvelope<Value>> {
        let value = value.map(serde_json::to_value).transpose()?;
        self.update_authoritative(key, scope, move |_| value).await
    }

    /// Mirror application rule: only strictly newer revisions are applied.
    pub fn apply_envelope(&self, envelope: StateEnvelope<Value>) -> bool {
        apply(&self.inner, envelope)
    }

    /// Resets every owned state of `user_id` that is declared to clear on `event`.
    pub async fn clear_user_state(&self, user_id: &UserId, event: ClearEvent) -> Result<usize> {
        let scope = StateScope::User(user_id.clone());
        let keys: Vec<String> = self
            .inner
            .entries
            .read()
            .iter()
            .filter(|((s, _), e)| {
                *s == scope && e.role == Role::Authoritative && e.clear_on.contains(&event)
            })
            .map(|((_, k), _)| k.clone())
            .collect();
        for key in &keys {
            self.update_authoritative(key, &scope, |_| None).await?;
        }
        if !keys.is_empty() {
            debug!(user = %user_id, ?event, cleared = keys.len(), "cleared user state");
        }
        Ok(keys.len())
    }

    /// Drops local definitions for `user_id`; used once the account's durable state is gone.
    pub fn forget_user(&self, user_id: &UserId) {
        let scope = StateScope::User(user_id.clone());
        self.inner.entries.write().retain(|(s, _), _| *s != scope);
    }

    async fn publish(&self, envelope: &StateEnvelope<Value>) -> Result<()> {
        self.inner
            .store
            .write(&envelope.key, &envelope.scope, envelope)
            .await?;
        let payload = serde_json::to_value(envelope)?;
        if let Err(err) = self.inner.channel.broadcast(&envelope.topic(), payload).await {
            // mirrors recover through snapshot or durable state
            warn!(topic = %envelope.topic(), error = %err, "state broadcast failed");
        }
        Ok(())
    }
}

fn snapshot_of(inner: &BrokerInner, key: &str, scope: &StateScope) -> Option<StateEnvelope<Value>> {
    inner
        .entries
        .read()
        .get(&(scope.clone(), key.to_string()))
        .map(|e| StateEnvelope::new(key, scope.clone(), e.value.clone(), e.revision))
}

fn apply(inner: &BrokerInner, envelope: StateEnvelope<Value>) -> bool {
    let mut entries = inner.entries.write();
    let Some(entry) = entries.get_mut(&(envelope.scope.clone(), envelope.key.clone())) else {
        trace!(key = %envelope.key, "envelope for undefined state ignored");
        return false;
    };
    if entry.role != Role::Mirror {
        return false;
    }
    if entry.synced && envelope.revision <= entry.revision {
        trace!(
            key = %envelope.key,
            incoming = envelope.revision,
            held = entry.revision,
            "stale envelope dropped"
        );
        return false;
    }
    entry.value = envelope.value;
    entry.revision = envelope.revision;
    entry.synced = true;
    true
}
