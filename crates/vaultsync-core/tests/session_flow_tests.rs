use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::Notify;
use vaultsync_core::broker::{ClearEvent, SessionStateBroker};
use vaultsync_core::channel::LocalHub;
use vaultsync_core::crypto::KdfParams;
use vaultsync_core::durable_store::{DurableStateStore, FileStateStore, MemoryStateStore};
use vaultsync_core::lock::{LockReason, LockStateMachine, LockStatus, LOCK_STATUS};
use vaultsync_core::rotation::{
    KeyRotationCoordinator, KeyWrapper, ReEncryptedRecord, RotatableDataProvider,
};
use vaultsync_core::rpc::{Method, RpcClient};
use vaultsync_core::secret_store::{SecretHandle, SecretStore};
use vaultsync_core::unlock::{UnlockFactor, UnlockMethod, UnlockVerifier};
use vaultsync_core::{Result, SessionError, StateEnvelope, StateScope, UserId};

/// Hands out pre-made keys in order, whatever the factor.
struct ScriptedVerifier {
    keys: Mutex<VecDeque<SecretHandle>>,
}

impl ScriptedVerifier {
    fn new(keys: Vec<SecretHandle>) -> Arc<Self> {
        Arc::new(Self {
            keys: Mutex::new(keys.into()),
        })
    }
}

#[async_trait]
impl UnlockVerifier for ScriptedVerifier {
    fn method(&self) -> UnlockMethod {
        UnlockMethod::MasterPassword
    }

    async fn derive_key(&self, _user_id: &UserId, _factor: &UnlockFactor) -> Result<SecretHandle> {
        self.keys
            .lock()
            .pop_front()
            .ok_or(SessionError::InvalidUnlockFactor)
    }
}

struct AcceptingRpc {
    calls: Mutex<usize>,
}

#[async_trait]
impl RpcClient for AcceptingRpc {
    async fn send(
        &self,
        _method: Method,
        _path: &str,
        _body: Option<Value>,
        _authenticated: bool,
        _return_response: bool,
    ) -> Result<Option<Value>> {
        *self.calls.lock() += 1;
        Ok(Some(json!({"success": true})))
    }
}

struct PassThroughWrapper;

#[async_trait]
impl KeyWrapper for PassThroughWrapper {
    async fn wrap(&self, _user_id: &UserId, _old: &SecretHandle, _new: &SecretHandle) -> Result<Value> {
        Ok(json!("wrapped"))
    }

    async fn install(&self, _user_id: &UserId, _wrapped: &Value) -> Result<()> {
        Ok(())
    }
}

struct StepProvider {
    id: &'static str,
    fail: bool,
    gate: Option<Arc<(Notify, Notify)>>,
}

#[async_trait]
impl RotatableDataProvider for StepProvider {
    fn id(&self) -> &str {
        self.id
    }

    async fn rotated_data(
        &self,
        _old_key: &SecretHandle,
        _new_key: &SecretHandle,
        _user_id: &UserId,
    ) -> Result<Vec<ReEncryptedRecord>> {
        if let Some(gate) = &self.gate {
            gate.0.notify_one();
            gate.1.notified().await;
        }
        if self.fail {
            return Err(SessionError::Crypto(format!("{} could not re-encrypt", self.id)));
        }
        Ok(vec![ReEncryptedRecord::new(format!("{}-item", self.id), json!("c"))])
    }
}

fn step(id: &'static str) -> Arc<StepProvider> {
    Arc::new(StepProvider {
        id,
        fail: false,
        gate: None,
    })
}

fn user_scope(user: &UserId) -> StateScope {
    StateScope::User(user.clone())
}

#[tokio::test]
async fn mirror_revision_is_monotonic_under_reordering() {
    let hub = LocalHub::new();
    let store = Arc::new(MemoryStateStore::new());
    let mirror = SessionStateBroker::new(Arc::new(hub.connect("popup")), store);
    mirror.define_mirror("counter", StateScope::Global).await.unwrap();

    let deliveries = [1u64, 3, 2, 3, 1, 4, 2];
    let mut last = 0;
    for revision in deliveries {
        mirror.apply_envelope(StateEnvelope::new(
            "counter",
            StateScope::Global,
            Some(json!(revision)),
            revision,
        ));
        let seen = mirror.revision("counter", &StateScope::Global).unwrap();
        assert!(seen >= last);
        last = seen;
    }
    assert_eq!(last, 4);
    assert_eq!(mirror.current::<u64>("counter", &StateScope::Global), Some(4));
}

#[tokio::test]
async fn mirror_cold_start_uses_snapshot_without_broadcast() {
    let hub = LocalHub::new();
    let store: Arc<dyn DurableStateStore> = Arc::new(MemoryStateStore::new());
    let owner = SessionStateBroker::new(Arc::new(hub.connect("background")), store.clone());
    owner
        .define_authoritative("filter", StateScope::Global, Some("all"), &[])
        .await
        .unwrap();
    for value in ["a", "b", "c", "d", "e"] {
        owner
            .set_authoritative("filter", &StateScope::Global, Some(value))
            .await
            .unwrap();
    }

    // Separate store so the value can only have come from the snapshot.
    let mirror = SessionStateBroker::new(
        Arc::new(hub.connect("popup")),
        Arc::new(MemoryStateStore::new()),
    );
    mirror.define_mirror("filter", StateScope::Global).await.unwrap();
    assert_eq!(mirror.current::<String>("filter", &StateScope::Global).as_deref(), Some("e"));
    assert_eq!(mirror.revision("filter", &StateScope::Global), Some(5));
}

#[tokio::test]
async fn lock_clears_secret_and_clear_on_lock_state() {
    let hub = LocalHub::new();
    let store: Arc<dyn DurableStateStore> = Arc::new(MemoryStateStore::new());
    let broker = SessionStateBroker::new(Arc::new(hub.connect("background")), store.clone());
    let secrets = Arc::new(SecretStore::new());
    let user = UserId::new("u1");
    let machine = LockStateMachine::new(broker.clone(), secrets.clone())
        .with_verifier(ScriptedVerifier::new(vec![SecretHandle::generate(user.clone())]));

    machine
        .authenticate(&user, &UnlockFactor::master_password("pw"))
        .await
        .unwrap();
    broker
        .define_authoritative("search.recent", user_scope(&user), Some(vec!["bank"]), &[ClearEvent::Lock])
        .await
        .unwrap();

    machine.lock(&user, LockReason::Manual).await.unwrap();
    assert!(secrets.get(&user).is_none());
    assert!(matches!(machine.with_key(&user, |_| ()), Err(SessionError::VaultLocked)));
    assert!(broker.current_value("search.recent", &user_scope(&user)).is_none());
}

#[tokio::test]
async fn logout_requires_reauthentication() {
    let hub = LocalHub::new();
    let store: Arc<dyn DurableStateStore> = Arc::new(MemoryStateStore::new());
    let broker = SessionStateBroker::new(Arc::new(hub.connect("background")), store.clone());
    let user = UserId::new("u1");
    let machine = LockStateMachine::new(broker, Arc::new(SecretStore::new())).with_verifier(
        ScriptedVerifier::new(vec![
            SecretHandle::generate(user.clone()),
            SecretHandle::generate(user.clone()),
            SecretHandle::generate(user.clone()),
        ]),
    );
    let factor = UnlockFactor::master_password("pw");
    machine.authenticate(&user, &factor).await.unwrap();
    machine.logout(&user, LockReason::Manual).await.unwrap();

    let err = machine.unlock(&user, &factor).await.unwrap_err();
    assert!(matches!(err, SessionError::LoggedOut));
    assert_eq!(machine.status(&user), LockStatus::LoggedOut);

    machine.authenticate(&user, &factor).await.unwrap();
    assert_eq!(machine.status(&user), LockStatus::Unlocked);
}

#[tokio::test]
async fn rotation_failure_at_provider_keeps_old_key() {
    let user = UserId::new("u1");
    let secrets = Arc::new(SecretStore::new());
    let old = SecretHandle::generate(user.clone());
    secrets.set(&user, old.clone());
    let rpc = Arc::new(AcceptingRpc { calls: Mutex::new(0) });
    let coordinator = KeyRotationCoordinator::new(
        secrets.clone(),
        Arc::new(MemoryStateStore::new()),
        rpc.clone(),
    )
    .with_provider(step("ciphers"))
    .with_provider(Arc::new(StepProvider {
        id: "folders",
        fail: true,
        gate: None,
    }))
    .with_provider(step("sends"));

    let err = coordinator.rotate(&user, &PassThroughWrapper).await.unwrap_err();
    assert_eq!(err.rotation_stage(), Some("folders"));
    assert_eq!(*rpc.calls.lock(), 0);
    assert_eq!(secrets.get(&user), Some(old));

    let ok = KeyRotationCoordinator::new(secrets.clone(), Arc::new(MemoryStateStore::new()), rpc.clone())
        .with_provider(step("ciphers"));
    ok.rotate(&user, &PassThroughWrapper).await.unwrap();
    assert_eq!(*rpc.calls.lock(), 1);
}

/// Background unlocks with H1, replaces it with H2, races a rotation, then locks.
#[tokio::test]
async fn single_account_session_walkthrough() {
    let hub = LocalHub::new();
    let store: Arc<dyn DurableStateStore> = Arc::new(MemoryStateStore::new());
    let user = UserId::new("u1");
    let h1 = SecretHandle::generate(user.clone());
    let h2 = SecretHandle::generate(user.clone());

    let secrets = Arc::new(SecretStore::new());
    let background = SessionStateBroker::new(Arc::new(hub.connect("background")), store.clone());
    let machine = LockStateMachine::new(background, secrets.clone())
        .with_verifier(ScriptedVerifier::new(vec![h1.clone(), h2.clone()]));
    let factor = UnlockFactor::master_password("pw");

    machine.authenticate(&user, &factor).await.unwrap();
    assert_eq!(secrets.get(&user), Some(h1.clone()));

    let popup = SessionStateBroker::new(Arc::new(hub.connect("popup")), store.clone());
    popup.define_mirror(LOCK_STATUS, user_scope(&user)).await.unwrap();
    assert_eq!(
        popup.current::<LockStatus>(LOCK_STATUS, &user_scope(&user)),
        Some(LockStatus::Unlocked)
    );

    machine.unlock(&user, &factor).await.unwrap();
    assert_eq!(secrets.get(&user), Some(h2.clone()));

    let gate = Arc::new((Notify::new(), Notify::new()));
    let coordinator = Arc::new(
        KeyRotationCoordinator::new(
            secrets.clone(),
            store.clone(),
            Arc::new(AcceptingRpc { calls: Mutex::new(0) }),
        )
        .with_provider(Arc::new(StepProvider {
            id: "ciphers",
            fail: false,
            gate: Some(gate.clone()),
        })),
    );
    let running = {
        let coordinator = coordinator.clone();
        let user = user.clone();
        tokio::spawn(async move { coordinator.rotate(&user, &PassThroughWrapper).await })
    };
    gate.0.notified().await;
    let err = coordinator.rotate(&user, &PassThroughWrapper).await.unwrap_err();
    assert!(matches!(err, SessionError::RotationInProgress));
    gate.1.notify_one();
    running.await.unwrap().unwrap();
    let rotated = secrets.get(&user).unwrap();
    assert!(!rotated.same_key(&h2));

    machine.lock(&user, LockReason::Manual).await.unwrap();
    assert!(secrets.get(&user).is_none());
    assert_eq!(
        popup.current::<LockStatus>(LOCK_STATUS, &user_scope(&user)),
        Some(LockStatus::Locked)
    );

    let err = coordinator.rotate(&user, &PassThroughWrapper).await.unwrap_err();
    assert!(matches!(err, SessionError::VaultLocked));
}

#[tokio::test]
async fn restarted_background_resumes_from_file_store() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("state.json");
    let hub = LocalHub::new();
    let user = UserId::new("u1");
    {
        let store: Arc<dyn DurableStateStore> = Arc::new(FileStateStore::open(&path).unwrap());
        let broker = SessionStateBroker::new(Arc::new(hub.connect("bg-1")), store);
        let machine = LockStateMachine::new(broker, Arc::new(SecretStore::new()))
            .with_verifier(ScriptedVerifier::new(vec![SecretHandle::generate(user.clone())]));
        machine
            .authenticate(&user, &UnlockFactor::master_password("pw"))
            .await
            .unwrap();
    }

    let store: Arc<dyn DurableStateStore> = Arc::new(FileStateStore::open(&path).unwrap());
    let broker = SessionStateBroker::new(Arc::new(hub.connect("bg-2")), store);
    let machine = LockStateMachine::new(broker.clone(), Arc::new(SecretStore::new()));
    machine.resume().await.unwrap();
    assert_eq!(machine.status(&user), LockStatus::Locked);
    assert_eq!(broker.revision(LOCK_STATUS, &user_scope(&user)), Some(2));
}

#[cfg(unix)]
#[tokio::test]
async fn lock_status_mirrors_over_socket() {
    use std::time::Duration;
    use vaultsync_core::ipc::IpcHub;
    use vaultsync_core::ipc_client::IpcChannel;

    let dir = tempfile::tempdir().unwrap();
    let socket = dir.path().join("hub.ipc");
    let secret = b"0123456789abcdef0123456789abcdef".to_vec();
    let hub = Arc::new(IpcHub::new("background", secret.clone(), socket.clone()));
    let _server = hub.spawn().unwrap();

    let store: Arc<dyn DurableStateStore> = Arc::new(MemoryStateStore::new());
    let user = UserId::new("u1");
    let machine = LockStateMachine::new(SessionStateBroker::new(hub.clone(), store), Arc::new(SecretStore::new()))
        .with_verifier(ScriptedVerifier::new(vec![SecretHandle::generate(user.clone())]));
    machine
        .authenticate(&user, &UnlockFactor::master_password("pw"))
        .await
        .unwrap();

    let client = IpcChannel::connect(socket, &secret, "popup").await.unwrap();
    let popup = SessionStateBroker::new(Arc::new(client), Arc::new(MemoryStateStore::new()));
    popup.define_mirror(LOCK_STATUS, user_scope(&user)).await.unwrap();
    assert_eq!(
        popup.current::<LockStatus>(LOCK_STATUS, &user_scope(&user)),
        Some(LockStatus::Unlocked)
    );

    machine.lock(&user, LockReason::Manual).await.unwrap();
    let mut seen = None;
    for _ in 0..100 {
        seen = popup.current::<LockStatus>(LOCK_STATUS, &user_scope(&user));
        if seen == Some(LockStatus::Locked) {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(seen, Some(LockStatus::Locked));
}
