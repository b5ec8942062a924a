//! User key rotation.
//!
//! Every registered provider re-encrypts its data under a fresh key entirely
//! in memory. Only when all of them succeed is the batch submitted to the
//! server, and only a confirmed submission replaces the live key. Until then
//! the old key stays authoritative and a failure simply drops the new one.
//! Once the server has confirmed, the live key is swapped before any local
//! follow-up runs; follow-up failures are retried and then reported as
//! [`SessionError::RotationIncomplete`].

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};
use zeroize::Zeroizing;

use crate::crypto::{KdfParams, SealedBlob};
use crate::durable_store::{DurableStateExt, DurableStateStore};
use crate::error::{Result, SessionError};
use crate::rpc::{Method, RpcClient};
use crate::secret_store::{SecretHandle, SecretStore};
use crate::types::{StateScope, UserId};
use crate::unlock::{WrappedUserKey, WRAPPED_USER_KEY};

pub const ROTATE_USER_KEYS_PATH: &str = "/accounts/key-management/rotate-user-account-keys";
pub const ROTATION_MARKER: &str = "key_rotation.last";
pub const LOCAL_ITEMS: &str = "vault.items";

const SERVER_STAGE: &str = "server";
const KEY_WRAPPER_STAGE: &str = "key_wrapper";
const MARKER_STAGE: &str = "marker";
const FOLLOW_UP_ATTEMPTS: u32 = 3;
const FOLLOW_UP_BACKOFF: Duration = Duration::from_millis(20);

/// One re-encrypted object; the server matches it by `id` or `organizationId`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReEncryptedRecord {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub organization_id: Option<String>,
    pub data: Value,
}

impl ReEncryptedRecord {
    pub fn new(id: impl Into<String>, data: Value) -> Self {
        Self {
            id: Some(id.into()),
            organization_id: None,
            data,
        }
    }

    pub fn for_organization(organization_id: impl Into<String>, data: Value) -> Self {
        Self {
            id: None,
            organization_id: Some(organization_id.into()),
            data,
        }
    }

    fn is_addressable(&self) -> bool {
        self.id.as_deref().map_or(false, |id| !id.is_empty())
            || self
                .organization_id
                .as_deref()
                .map_or(false, |id| !id.is_empty())
    }
}

#[async_trait]
pub trait RotatableDataProvider: Send + Sync {
    fn id(&self) -> &str;

    async fn rotated_data(
        &self,
        old_key: &SecretHandle,
        new_key: &SecretHandle,
        user_id: &UserId,
    ) -> Result<Vec<ReEncryptedRecord>>;

    /// Called once the server has accepted the rotation and the live key is `new_key`.
    /// May run more than once if it fails.
    async fn committed(
        &self,
        _user_id: &UserId,
        _old_key: &SecretHandle,
        _new_key: &SecretHandle,
        _records: &[ReEncryptedRecord],
    ) -> Result<()> {
        Ok(())
    }
}

/// Produces the server-side wrapping of the new user key and installs it locally after commit.
#[async_trait]
pub trait KeyWrapper: Send + Sync {
    async fn wrap(&self, user_id: &UserId, old_key: &SecretHandle, new_key: &SecretHandle) -> Result<Value>;

    async fn install(&self, user_id: &UserId, wrapped: &Value) -> Result<()>;
}

/// Re-wraps the new key under the account's current master password.
pub struct RewrapKeyWrapper {
    store: Arc<dyn DurableStateStore>,
    kdf: KdfParams,
    password: Zeroizing<String>,
}

impl RewrapKeyWrapper {
    pub fn new(store: Arc<dyn DurableStateStore>, password: impl Into<String>) -> Self {
        Self::with_params(store, password, KdfParams::default())
    }

    pub fn with_params(store: Arc<dyn DurableStateStore>, password: impl Into<String>, kdf: KdfParams) -> Self {
        Self {
            store,
            kdf,
            password: Zeroizing::new(password.into()),
        }
    }
}

#[async_trait]
impl KeyWrapper for RewrapKeyWrapper {
    async fn wrap(&self, user_id: &UserId, old_key: &SecretHandle, new_key: &SecretHandle) -> Result<Value> {
        let current: WrappedUserKey = self
            .store
            .read(WRAPPED_USER_KEY, &StateScope::User(user_id.clone()))
            .await
            .ok_or(SessionError::InvalidUnlockFactor)?;
        let unwrapped = current.unwrap_key(user_id, &self.password)?;
        if !unwrapped.same_key(old_key) {
            return Err(SessionError::InvalidUnlockFactor);
        }
        let wrapped = WrappedUserKey::wrap(&self.password, new_key, self.kdf)?;
        Ok(serde_json::to_value(wrapped)?)
    }

    async fn install(&self, user_id: &UserId, wrapped: &Value) -> Result<()> {
        self.store
            .write_raw(WRAPPED_USER_KEY, &StateScope::User(user_id.clone()), wrapped.clone())
            .await
    }
}

/// Locally cached encrypted vault items (`vault.items`, id -> sealed blob).
///
/// Writes and the post-rotation re-seal share one lock so an item written
/// while a rotation is in flight is carried over to the new key.
pub struct LocalItemsProvider {
    store: Arc<dyn DurableStateStore>,
    writes: tokio::sync::Mutex<()>,
}

impl LocalItemsProvider {
    pub const ID: &'static str = "local_items";

    pub fn new(store: Arc<dyn DurableStateStore>) -> Self {
        Self {
            store,
            writes: tokio::sync::Mutex::new(()),
        }
    }

    async fn items(&self, user_id: &UserId) -> BTreeMap<String, SealedBlob> {
        self.store
            .read(LOCAL_ITEMS, &StateScope::User(user_id.clone()))
            .await
            .unwrap_or_default()
    }

    pub async fn put_item(&self, key: &SecretHandle, id: &str, plaintext: &[u8]) -> Result<()> {
        let user_id = key.user_id();
        let _writes = self.writes.lock().await;
        let mut items = self.items(user_id).await;
        items.insert(id.to_string(), SealedBlob::seal(key.key_bytes(), plaintext)?);
        self.store
            .write(LOCAL_ITEMS, &StateScope::User(user_id.clone()), &items)
            .await
    }

    pub async fn get_item(&self, key: &SecretHandle, id: &str) -> Result<Option<Zeroizing<Vec<u8>>>> {
        let items = self.items(key.user_id()).await;
        items.get(id).map(|blob| blob.open(key.key_bytes())).transpose()
    }
}

#[async_trait]
impl RotatableDataProvider for LocalItemsProvider {
    fn id(&self) -> &str {
        Self::ID
    }

    async fn rotated_data(
        &self,
        old_key: &SecretHandle,
        new_key: &SecretHandle,
        user_id: &UserId,
    ) -> Result<Vec<ReEncryptedRecord>> {
        let mut records = Vec::new();
        for (id, blob) in self.items(user_id).await {
            let plaintext = blob.open(old_key.key_bytes())?;
            let resealed = SealedBlob::seal(new_key.key_bytes(), &plaintext)?;
            records.push(ReEncryptedRecord::new(id, serde_json::to_value(resealed)?));
        }
        Ok(records)
    }

    /// Re-seals the items as they are now, not as they were collected, so
    /// writes made during the server round trip survive.
    async fn committed(
        &self,
        user_id: &UserId,
        old_key: &SecretHandle,
        new_key: &SecretHandle,
        _records: &[ReEncryptedRecord],
    ) -> Result<()> {
        let _writes = self.writes.lock().await;
        let mut items = self.items(user_id).await;
        for (id, blob) in items.iter_mut() {
            match blob.open(old_key.key_bytes()) {
                Ok(plaintext) => *blob = SealedBlob::seal(new_key.key_bytes(), &plaintext)?,
                // already under the new key, e.g. a retried hook
                Err(_) if blob.open(new_key.key_bytes()).is_ok() => {}
                Err(err) => warn!(user = %user_id, item = %id, error = %err, "item opens under neither key; left as is"),
            }
        }
        self.store
            .write(LOCAL_ITEMS, &StateScope::User(user_id.clone()), &items)
            .await
    }
}

#[derive(Debug)]
pub struct RotationPlan {
    pub user_id: UserId,
    pub old_key: SecretHandle,
    pub new_key: SecretHandle,
    pub pending_providers: BTreeSet<String>,
    pub committed: bool,
}

impl RotationPlan {
    fn new(user_id: UserId, old_key: SecretHandle, providers: &[Arc<dyn RotatableDataProvider>]) -> Self {
        Self {
            new_key: SecretHandle::generate(user_id.clone()),
            user_id,
            old_key,
            pending_providers: providers.iter().map(|p| p.id().to_string()).collect(),
            committed: false,
        }
    }
}

/// Durable note of the last successful rotation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RotationMarker {
    pub rotated_at: DateTime<Utc>,
    pub providers: Vec<String>,
}

/// Holds a user's slot in the in-flight set until dropped.
struct RotationSlot {
    registry: Arc<Mutex<HashSet<UserId>>>,
    user_id: UserId,
}

impl RotationSlot {
    fn acquire(registry: &Arc<Mutex<HashSet<UserId>>>, user_id: &UserId) -> Result<Self> {
        if !registry.lock().insert(user_id.clone()) {
            return Err(SessionError::RotationInProgress);
        }
        Ok(Self {
            registry: registry.clone(),
            user_id: user_id.clone(),
        })
    }
}

impl Drop for RotationSlot {
    fn drop(&mut self) {
        self.registry.lock().remove(&self.user_id);
    }
}

pub struct KeyRotationCoordinator {
    secrets: Arc<SecretStore>,
    store: Arc<dyn DurableStateStore>,
    rpc: Arc<dyn RpcClient>,
    providers: Vec<Arc<dyn RotatableDataProvider>>,
    in_flight: Arc<Mutex<HashSet<UserId>>>,
}

impl KeyRotationCoordinator {
    pub fn new(secrets: Arc<SecretStore>, store: Arc<dyn DurableStateStore>, rpc: Arc<dyn RpcClient>) -> Self {
        Self {
            secrets,
            store,
            rpc,
            providers: Vec::new(),
            in_flight: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    pub fn with_provider(mut self, provider: Arc<dyn RotatableDataProvider>) -> Self {
        self.providers.push(provider);
        self
    }

    pub fn is_rotating(&self, user_id: &UserId) -> bool {
        self.in_flight.lock().contains(user_id)
    }

    pub async fn last_rotation(&self, user_id: &UserId) -> Option<RotationMarker> {
        self.store
            .read(ROTATION_MARKER, &StateScope::User(user_id.clone()))
            .await
    }

    pub async fn rotate(&self, user_id: &UserId, wrapper: &dyn KeyWrapper) -> Result<RotationMarker> {
        let old_key = self.secrets.get(user_id).ok_or(SessionError::VaultLocked)?;
        let _slot = RotationSlot::acquire(&self.in_flight, user_id)?;
        let mut plan = RotationPlan::new(user_id.clone(), old_key, &self.providers);
        debug!(user = %user_id, providers = plan.pending_providers.len(), "key rotation started");

        let mut collected = Vec::with_capacity(self.providers.len());
        for provider in &self.providers {
            let records = provider
                .rotated_data(&plan.old_key, &plan.new_key, user_id)
                .await
                .map_err(|err| aborted(user_id, provider.id(), err.to_string()))?;
            if records.iter().any(|r| !r.is_addressable()) {
                return Err(aborted(
                    user_id,
                    provider.id(),
                    "record without id or organizationId".to_string(),
                ));
            }
            plan.pending_providers.remove(provider.id());
            collected.push((provider.clone(), records));
        }

        let wrapped = wrapper
            .wrap(user_id, &plan.old_key, &plan.new_key)
            .await
            .map_err(|err| aborted(user_id, KEY_WRAPPER_STAGE, err.to_string()))?;
        let account_data: Map<String, Value> = collected
            .iter()
            .map(|(provider, records)| -> Result<(String, Value)> {
                Ok((provider.id().to_string(), serde_json::to_value(records)?))
            })
            .collect::<Result<_>>()?;
        let body = json!({
            "userKey": wrapped,
            "accountData": account_data,
        });

        let response = self
            .rpc
            .send(Method::Post, ROTATE_USER_KEYS_PATH, Some(body), true, true)
            .await
            .map_err(|err| aborted(user_id, SERVER_STAGE, err.to_string()))?;
        if let Some(response) = response {
            if response.get("success").and_then(Value::as_bool) != Some(true) {
                return Err(aborted(
                    user_id,
                    SERVER_STAGE,
                    "server did not confirm the rotation".to_string(),
                ));
            }
        }

        // Server holds the new key from here on; no early return past this point.
        plan.committed = true;
        match self.secrets.get(user_id) {
            Some(live) if live == plan.old_key => self.secrets.set(user_id, plan.new_key.clone()),
            _ => warn!(user = %user_id, "account locked during rotation; new key applies on next unlock"),
        }
        let marker = RotationMarker {
            rotated_at: Utc::now(),
            providers: collected.iter().map(|(p, _)| p.id().to_string()).collect(),
        };

        let scope = StateScope::User(user_id.clone());
        let mut failed = Vec::new();
        let mut reasons = Vec::new();
        let mut note = |stage: &str, result: Result<()>| {
            if let Err(err) = result {
                error!(user = %user_id, stage, error = %err, "post-rotation step failed");
                failed.push(stage.to_string());
                reasons.push(err.to_string());
            }
        };
        note(
            MARKER_STAGE,
            with_retries(|| self.store.write(ROTATION_MARKER, &scope, &marker)).await,
        );
        note(
            KEY_WRAPPER_STAGE,
            with_retries(|| wrapper.install(user_id, &wrapped)).await,
        );
        for (provider, records) in &collected {
            let result =
                with_retries(|| provider.committed(user_id, &plan.old_key, &plan.new_key, records)).await;
            note(provider.id(), result);
        }
        if !failed.is_empty() {
            return Err(SessionError::RotationIncomplete {
                stages: failed,
                reason: reasons.join("; "),
            });
        }
        info!(user = %user_id, providers = marker.providers.len(), "user key rotated");
        Ok(marker)
    }
}

async fn with_retries<F, Fut>(mut step: F) -> Result<()>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<()>>,
{
    let mut attempt = 1;
    loop {
        match step().await {
            Ok(()) => return Ok(()),
            Err(err) if attempt >= FOLLOW_UP_ATTEMPTS => return Err(err),
            Err(err) => {
                debug!(attempt, error = %err, "retrying post-rotation step");
                tokio::time::sleep(FOLLOW_UP_BACKOFF * attempt).await;
                attempt += 1;
            }
        }
    }
}

fn aborted(user_id: &UserId, stage: &str, reason: String) -> SessionError {
    warn!(user = %user_id, stage, reason = %reason, "key rotation aborted");
    SessionError::RotationAborted {
        stage: stage.to_string(),
        reason,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::durable_store::MemoryStateStore;
    use crate::unlock::{MasterPasswordVerifier, UnlockFactor, UnlockVerifier};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::Notify;

    #[derive(Default)]
    struct RecordingRpc {
        calls: Mutex<Vec<Value>>,
        reply: Mutex<Option<Value>>,
        fail: bool,
    }

    #[async_trait]
    impl RpcClient for RecordingRpc {
        async fn send(
            &self,
            method: Method,
            path: &str,
            body: Option<Value>,
            authenticated: bool,
            _return_response: bool,
        ) -> Result<Option<Value>> {
            assert_eq!(method, Method::Post);
            assert_eq!(path, ROTATE_USER_KEYS_PATH);
            assert!(authenticated);
            self.calls.lock().push(body.unwrap_or(Value::Null));
            if self.fail {
                return Err(SessionError::Transport("503 Service Unavailable".into()));
            }
            Ok(self.reply.lock().clone())
        }
    }

    struct FixedProvider {
        id: &'static str,
        records: Vec<ReEncryptedRecord>,
        fail: bool,
        calls: AtomicUsize,
    }

    impl FixedProvider {
        fn ok(id: &'static str) -> Self {
            Self {
                id,
                records: vec![ReEncryptedRecord::new(format!("{id}-1"), json!("cipher"))],
                fail: false,
                calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl RotatableDataProvider for FixedProvider {
        fn id(&self) -> &str {
            self.id
        }

        async fn rotated_data(
            &self,
            _old_key: &SecretHandle,
            _new_key: &SecretHandle,
            _user_id: &UserId,
        ) -> Result<Vec<ReEncryptedRecord>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(SessionError::Crypto("decrypt failed".into()));
            }
            Ok(self.records.clone())
        }
    }

    struct Setup {
        user: UserId,
        old_key: SecretHandle,
        secrets: Arc<SecretStore>,
        store: Arc<dyn DurableStateStore>,
        wrapper: RewrapKeyWrapper,
    }

    async fn setup() -> Setup {
        let user = UserId::new("u1");
        let store: Arc<dyn DurableStateStore> = Arc::new(MemoryStateStore::new());
        let old_key = SecretHandle::generate(user.clone());
        MasterPasswordVerifier::with_params(store.clone(), KdfParams::insecure_fast())
            .enroll(&user, "pw", &old_key)
            .await
            .unwrap();
        let secrets = Arc::new(SecretStore::new());
        secrets.set(&user, old_key.clone());
        let wrapper = RewrapKeyWrapper::with_params(store.clone(), "pw", KdfParams::insecure_fast());
        Setup {
            user,
            old_key,
            secrets,
            store,
            wrapper,
        }
    }

    #[tokio::test]
    async fn successful_rotation_swaps_key_and_rewraps() {
        let s = setup().await;
        let rpc = Arc::new(RecordingRpc::default());
        *rpc.reply.lock() = Some(json!({"success": true}));
        let items = Arc::new(LocalItemsProvider::new(s.store.clone()));
        items.put_item(&s.old_key, "login-1", b"secret note").await.unwrap();
        let coordinator = KeyRotationCoordinator::new(s.secrets.clone(), s.store.clone(), rpc.clone())
            .with_provider(items.clone())
            .with_provider(Arc::new(FixedProvider::ok("sends")));

        let marker = coordinator.rotate(&s.user, &s.wrapper).await.unwrap();
        assert_eq!(marker.providers, vec!["local_items".to_string(), "sends".to_string()]);
        assert_eq!(coordinator.last_rotation(&s.user).await, Some(marker));
        assert!(!coordinator.is_rotating(&s.user));

        let live = s.secrets.get(&s.user).unwrap();
        assert!(!live.same_key(&s.old_key));
        assert_eq!(
            items.get_item(&live, "login-1").await.unwrap().unwrap().as_slice(),
            b"secret note"
        );

        let verifier = MasterPasswordVerifier::with_params(s.store.clone(), KdfParams::insecure_fast());
        let unlocked = verifier
            .derive_key(&s.user, &UnlockFactor::master_password("pw"))
            .await
            .unwrap();
        assert!(unlocked.same_key(&live));

        let calls = rpc.calls.lock();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0]["accountData"]["sends"][0]["id"], "sends-1");
    }

    #[tokio::test]
    async fn provider_failure_keeps_old_key_and_submits_nothing() {
        let s = setup().await;
        let rpc = Arc::new(RecordingRpc::default());
        let third = Arc::new(FixedProvider::ok("third"));
        let coordinator = KeyRotationCoordinator::new(s.secrets.clone(), s.store.clone(), rpc.clone())
            .with_provider(Arc::new(FixedProvider::ok("first")))
            .with_provider(Arc::new(FixedProvider {
                fail: true,
                ..FixedProvider::ok("second")
            }))
            .with_provider(third.clone());

        let err = coordinator.rotate(&s.user, &s.wrapper).await.unwrap_err();
        assert_eq!(err.rotation_stage(), Some("second"));
        assert_eq!(third.calls.load(Ordering::SeqCst), 0);
        assert!(rpc.calls.lock().is_empty());
        assert_eq!(s.secrets.get(&s.user), Some(s.old_key.clone()));
        assert!(coordinator.last_rotation(&s.user).await.is_none());
        assert!(!coordinator.is_rotating(&s.user));
    }

    #[tokio::test]
    async fn record_without_identity_aborts() {
        let s = setup().await;
        let rpc = Arc::new(RecordingRpc::default());
        let coordinator = KeyRotationCoordinator::new(s.secrets.clone(), s.store.clone(), rpc.clone())
            .with_provider(Arc::new(FixedProvider {
                records: vec![ReEncryptedRecord {
                    id: None,
                    organization_id: None,
                    data: json!({}),
                }],
                ..FixedProvider::ok("orgs")
            }));
        let err = coordinator.rotate(&s.user, &s.wrapper).await.unwrap_err();
        assert_eq!(err.rotation_stage(), Some("orgs"));
        assert!(rpc.calls.lock().is_empty());
    }

    #[tokio::test]
    async fn server_rejection_keeps_old_key() {
        let s = setup().await;
        for rpc in [
            RecordingRpc {
                fail: true,
                ..Default::default()
            },
            RecordingRpc {
                reply: Mutex::new(Some(json!({"success": false}))),
                ..Default::default()
            },
        ] {
            let coordinator = KeyRotationCoordinator::new(s.secrets.clone(), s.store.clone(), Arc::new(rpc))
                .with_provider(Arc::new(FixedProvider::ok("a")));
            let err = coordinator.rotate(&s.user, &s.wrapper).await.unwrap_err();
            assert_eq!(err.rotation_stage(), Some("server"));
            assert_eq!(s.secrets.get(&s.user), Some(s.old_key.clone()));
        }
    }

    #[tokio::test]
    async fn wrong_password_fails_before_submission() {
        let s = setup().await;
        let rpc = Arc::new(RecordingRpc::default());
        let coordinator = KeyRotationCoordinator::new(s.secrets.clone(), s.store.clone(), rpc.clone());
        let wrapper = RewrapKeyWrapper::with_params(s.store.clone(), "not-pw", KdfParams::insecure_fast());
        let err = coordinator.rotate(&s.user, &wrapper).await.unwrap_err();
        assert_eq!(err.rotation_stage(), Some("key_wrapper"));
        assert!(rpc.calls.lock().is_empty());
    }

    struct GatedProvider {
        started: Notify,
        release: Notify,
    }

    #[async_trait]
    impl RotatableDataProvider for GatedProvider {
        fn id(&self) -> &str {
            "gated"
        }

        async fn rotated_data(
            &self,
            _old_key: &SecretHandle,
            _new_key: &SecretHandle,
            _user_id: &UserId,
        ) -> Result<Vec<ReEncryptedRecord>> {
            self.started.notify_one();
            self.release.notified().await;
            Ok(Vec::new())
        }
    }

    #[tokio::test]
    async fn concurrent_rotation_fails_fast() {
        let s = setup().await;
        let gate = Arc::new(GatedProvider {
            started: Notify::new(),
            release: Notify::new(),
        });
        let rpc = Arc::new(RecordingRpc::default());
        let coordinator = Arc::new(
            KeyRotationCoordinator::new(s.secrets.clone(), s.store.clone(), rpc)
                .with_provider(gate.clone()),
        );
        let wrapper = Arc::new(s.wrapper);

        let first = {
            let coordinator = coordinator.clone();
            let wrapper = wrapper.clone();
            let user = s.user.clone();
            tokio::spawn(async move { coordinator.rotate(&user, wrapper.as_ref()).await })
        };
        gate.started.notified().await;
        assert!(coordinator.is_rotating(&s.user));
        let err = coordinator.rotate(&s.user, wrapper.as_ref()).await.unwrap_err();
        assert!(matches!(err, SessionError::RotationInProgress));

        gate.release.notify_one();
        first.await.unwrap().unwrap();
        assert!(!coordinator.is_rotating(&s.user));
    }

    struct GatedRpc {
        started: Notify,
        release: Notify,
    }

    #[async_trait]
    impl RpcClient for GatedRpc {
        async fn send(
            &self,
            _method: Method,
            _path: &str,
            _body: Option<Value>,
            _authenticated: bool,
            _return_response: bool,
        ) -> Result<Option<Value>> {
            self.started.notify_one();
            self.release.notified().await;
            Ok(Some(json!({"success": true})))
        }
    }

    #[tokio::test]
    async fn item_written_during_submission_survives_rotation() {
        let s = setup().await;
        let rpc = Arc::new(GatedRpc {
            started: Notify::new(),
            release: Notify::new(),
        });
        let items = Arc::new(LocalItemsProvider::new(s.store.clone()));
        items.put_item(&s.old_key, "a", b"first").await.unwrap();
        let coordinator = Arc::new(
            KeyRotationCoordinator::new(s.secrets.clone(), s.store.clone(), rpc.clone())
                .with_provider(items.clone()),
        );
        let wrapper = Arc::new(s.wrapper);

        let running = {
            let coordinator = coordinator.clone();
            let wrapper = wrapper.clone();
            let user = s.user.clone();
            tokio::spawn(async move { coordinator.rotate(&user, wrapper.as_ref()).await })
        };
        rpc.started.notified().await;
        items.put_item(&s.old_key, "b", b"written mid-flight").await.unwrap();
        rpc.release.notify_one();
        running.await.unwrap().unwrap();

        let live = s.secrets.get(&s.user).unwrap();
        assert!(!live.same_key(&s.old_key));
        assert_eq!(items.get_item(&live, "a").await.unwrap().unwrap().as_slice(), b"first");
        assert_eq!(
            items.get_item(&live, "b").await.unwrap().unwrap().as_slice(),
            b"written mid-flight"
        );
    }

    /// Wrapper whose local install fails for the first `failures` attempts.
    struct FlakyInstall {
        failures: usize,
        attempts: AtomicUsize,
    }

    #[async_trait]
    impl KeyWrapper for FlakyInstall {
        async fn wrap(&self, _user_id: &UserId, _old_key: &SecretHandle, _new_key: &SecretHandle) -> Result<Value> {
            Ok(json!("wrapped"))
        }

        async fn install(&self, _user_id: &UserId, _wrapped: &Value) -> Result<()> {
            if self.attempts.fetch_add(1, Ordering::SeqCst) < self.failures {
                return Err(SessionError::Storage("disk full".into()));
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn failed_install_after_acceptance_still_swaps_key() {
        let s = setup().await;
        let rpc = Arc::new(RecordingRpc::default());
        *rpc.reply.lock() = Some(json!({"success": true}));
        let items = Arc::new(LocalItemsProvider::new(s.store.clone()));
        items.put_item(&s.old_key, "a", b"note").await.unwrap();
        let coordinator = KeyRotationCoordinator::new(s.secrets.clone(), s.store.clone(), rpc.clone())
            .with_provider(items.clone());
        let wrapper = FlakyInstall {
            failures: usize::MAX,
            attempts: AtomicUsize::new(0),
        };

        let err = coordinator.rotate(&s.user, &wrapper).await.unwrap_err();
        assert!(err.rotation_committed());
        assert!(matches!(
            &err,
            SessionError::RotationIncomplete { stages, .. } if stages == &vec!["key_wrapper".to_string()]
        ));
        assert_eq!(wrapper.attempts.load(Ordering::SeqCst), FOLLOW_UP_ATTEMPTS as usize);
        assert_eq!(rpc.calls.lock().len(), 1);

        let live = s.secrets.get(&s.user).unwrap();
        assert!(!live.same_key(&s.old_key));
        assert!(coordinator.last_rotation(&s.user).await.is_some());
        assert_eq!(items.get_item(&live, "a").await.unwrap().unwrap().as_slice(), b"note");
        assert!(!coordinator.is_rotating(&s.user));
    }

    #[tokio::test]
    async fn transient_install_failure_is_retried() {
        let s = setup().await;
        let rpc = Arc::new(RecordingRpc::default());
        let coordinator = KeyRotationCoordinator::new(s.secrets.clone(), s.store.clone(), rpc);
        let wrapper = FlakyInstall {
            failures: 1,
            attempts: AtomicUsize::new(0),
        };
        coordinator.rotate(&s.user, &wrapper).await.unwrap();
        assert_eq!(wrapper.attempts.load(Ordering::SeqCst), 2);
        assert!(!s.secrets.get(&s.user).unwrap().same_key(&s.old_key));
    }

    #[tokio::test]
    async fn locked_account_cannot_rotate() {
        let s = setup().await;
        s.secrets.clear(&s.user);
        let coordinator =
            KeyRotationCoordinator::new(s.secrets.clone(), s.store.clone(), Arc::new(RecordingRpc::default()));
        let err = coordinator.rotate(&s.user, &s.wrapper).await.unwrap_err();
        assert!(matches!(err, SessionError::VaultLocked));
    }
}
