//! Per-account lock lifecycle: `LoggedOut -> Unlocked <-> Locked -> LoggedOut`.
//!
//! The live user key only ever sits in the [`SecretStore`]; the broker carries
//! the secret-free [`LockStatus`] to every other context.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tracing::{debug, info};

use crate::broker::{ClearEvent, SessionStateBroker};
use crate::durable_store::{DurableStateExt, DurableStateStore};
use crate::error::{Result, SessionError};
use crate::secret_store::{SecretHandle, SecretStore};
use crate::settings::{TimeoutTrigger, VaultTimeoutAction, VaultTimeoutSettings, VAULT_TIMEOUT_SETTINGS};
use crate::types::{StateScope, UserId};
use crate::unlock::{UnlockFactor, UnlockMethod, UnlockVerifier};

pub const LOCK_STATUS: &str = "lock_status";
/// Global key listing every account that has authenticated on this device.
pub const ACCOUNTS: &str = "accounts";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LockStatus {
    Unlocked,
    Locked,
    LoggedOut,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LockState {
    Unlocked(SecretHandle),
    Locked,
    LoggedOut,
}

impl LockState {
    pub fn status(&self) -> LockStatus {
        match self {
            LockState::Unlocked(_) => LockStatus::Unlocked,
            LockState::Locked => LockStatus::Locked,
            LockState::LoggedOut => LockStatus::LoggedOut,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockReason {
    Manual,
    Timeout,
    /// Something the session depended on (e.g. the platform key) went away.
    PrerequisiteLost,
}

pub struct LockStateMachine {
    broker: SessionStateBroker,
    secrets: Arc<SecretStore>,
    verifiers: HashMap<UnlockMethod, Arc<dyn UnlockVerifier>>,
    activity: Mutex<HashMap<UserId, DateTime<Utc>>>,
    transitions: tokio::sync::Mutex<()>,
}

impl LockStateMachine {
    pub fn new(broker: SessionStateBroker, secrets: Arc<SecretStore>) -> Self {
        Self {
            broker,
            secrets,
            verifiers: HashMap::new(),
            activity: Mutex::new(HashMap::new()),
            transitions: tokio::sync::Mutex::new(()),
        }
    }

    pub fn with_verifier(mut self, verifier: Arc<dyn UnlockVerifier>) -> Self {
        self.verifiers.insert(verifier.method(), verifier);
        self
    }

    pub fn broker(&self) -> &SessionStateBroker {
        &self.broker
    }

    pub fn secrets(&self) -> &Arc<SecretStore> {
        &self.secrets
    }

    pub async fn accounts(&self) -> BTreeSet<UserId> {
        self.broker
            .store()
            .read(ACCOUNTS, &StateScope::Global)
            .await
            .unwrap_or_default()
    }

    /// Defines the status of every known account after a restart.
    ///
    /// Keys never survive a restart, so an account persisted as `Unlocked`
    /// is republished as `Locked`.
    pub async fn resume(&self) -> Result<()> {
        let _guard = self.transitions.lock().await;
        for user_id in self.accounts().await {
            self.ensure_defined(&user_id).await?;
            if self.secrets.contains(&user_id) {
                continue;
            }
            let scope = StateScope::User(user_id.clone());
            if self.broker.current::<LockStatus>(LOCK_STATUS, &scope) == Some(LockStatus::Unlocked) {
                self.publish(&user_id, LockStatus::Locked).await?;
                info!(user = %user_id, "session restored as locked");
            }
        }
        Ok(())
    }

    pub fn state(&self, user_id: &UserId) -> LockState {
        if let Some(handle) = self.secrets.get(user_id) {
            return LockState::Unlocked(handle);
        }
        let scope = StateScope::User(user_id.clone());
        match self.broker.current::<LockStatus>(LOCK_STATUS, &scope) {
            Some(LockStatus::Locked) | Some(LockStatus::Unlocked) => LockState::Locked,
            Some(LockStatus::LoggedOut) | None => LockState::LoggedOut,
        }
    }

    pub fn status(&self, user_id: &UserId) -> LockStatus {
        self.state(user_id).status()
    }

    /// `LoggedOut -> Unlocked`. Also accepted from `Locked`, where it behaves like [`Self::unlock`].
    pub async fn authenticate(&self, user_id: &UserId, factor: &UnlockFactor) -> Result<()> {
        let _guard = self.transitions.lock().await;
        let handle = self.verify(user_id, factor).await?;
        if self.is_live(user_id, &handle) {
            debug!(user = %user_id, "authenticate with the live handle is a no-op");
            return Ok(());
        }
        self.ensure_defined(user_id).await?;
        self.install(user_id, handle).await?;
        self.register_account(user_id).await?;
        self.record_activity(user_id, Utc::now());
        info!(user = %user_id, method = ?factor.method(), "account authenticated");
        Ok(())
    }

    pub async fn unlock(&self, user_id: &UserId, factor: &UnlockFactor) -> Result<()> {
        let _guard = self.transitions.lock().await;
        let current = self.state(user_id);
        if current == LockState::LoggedOut {
            return Err(SessionError::LoggedOut);
        }
        let handle = self.verify(user_id, factor).await?;
        if self.is_live(user_id, &handle) {
            debug!(user = %user_id, "unlock with the live handle is a no-op");
            return Ok(());
        }
        self.install(user_id, handle).await?;
        self.record_activity(user_id, Utc::now());
        info!(user = %user_id, method = ?factor.method(), "vault unlocked");
        Ok(())
    }

    pub async fn lock(&self, user_id: &UserId, reason: LockReason) -> Result<()> {
        let _guard = self.transitions.lock().await;
        self.lock_inner(user_id, reason).await
    }

    async fn lock_inner(&self, user_id: &UserId, reason: LockReason) -> Result<()> {
        let scope = StateScope::User(user_id.clone());
        let published = self.broker.current::<LockStatus>(LOCK_STATUS, &scope);
        let had_key = self.secrets.contains(user_id);
        if !had_key && published != Some(LockStatus::Unlocked) {
            return Ok(());
        }
        self.secrets.clear(user_id);
        self.publish(user_id, LockStatus::Locked).await?;
        self.broker.clear_user_state(user_id, ClearEvent::Lock).await?;
        info!(user = %user_id, ?reason, "vault locked");
        Ok(())
    }

    /// Drops the key and every durable trace of the account. Only `authenticate` leads back.
    pub async fn logout(&self, user_id: &UserId, reason: LockReason) -> Result<()> {
        let _guard = self.transitions.lock().await;
        self.logout_inner(user_id, reason).await
    }

    async fn logout_inner(&self, user_id: &UserId, reason: LockReason) -> Result<()> {
        self.secrets.clear(user_id);
        self.activity.lock().remove(user_id);
        self.ensure_defined(user_id).await?;
        self.broker.clear_user_state(user_id, ClearEvent::Logout).await?;
        self.broker.store().remove_all_for_user(user_id).await?;
        // republished after the wipe so the revision sequence survives it
        self.publish(user_id, LockStatus::LoggedOut).await?;
        self.broker.forget_user(user_id);
        self.forget_account(user_id).await?;
        info!(user = %user_id, ?reason, "account logged out");
        Ok(())
    }

    /// Runs `f` with the live key; the key stays valid for the call even if a lock races it.
    pub fn with_key<R>(&self, user_id: &UserId, f: impl FnOnce(&SecretHandle) -> R) -> Result<R> {
        let handle = self.secrets.get(user_id).ok_or(SessionError::VaultLocked)?;
        Ok(f(&handle))
    }

    pub async fn timeout_settings(&self, user_id: &UserId) -> VaultTimeoutSettings {
        self.broker
            .store()
            .read(VAULT_TIMEOUT_SETTINGS, &StateScope::User(user_id.clone()))
            .await
            .unwrap_or_default()
    }

    pub async fn set_timeout_settings(&self, user_id: &UserId, settings: VaultTimeoutSettings) -> Result<()> {
        self.broker
            .store()
            .write(VAULT_TIMEOUT_SETTINGS, &StateScope::User(user_id.clone()), &settings)
            .await
    }

    pub fn record_activity(&self, user_id: &UserId, at: DateTime<Utc>) {
        self.activity.lock().insert(user_id.clone(), at);
    }

    /// Applies the configured timeout action to every unlocked account that is due.
    pub async fn evaluate_timeouts(
        &self,
        now: DateTime<Utc>,
        trigger: TimeoutTrigger,
    ) -> Result<Vec<(UserId, VaultTimeoutAction)>> {
        let _guard = self.transitions.lock().await;
        let mut applied = Vec::new();
        for user_id in self.secrets.users() {
            let settings = self.timeout_settings(&user_id).await;
            let last_active = self.activity.lock().get(&user_id).copied().unwrap_or(now);
            if !settings.is_due(trigger, now - last_active) {
                continue;
            }
            match settings.action {
                VaultTimeoutAction::Lock => self.lock_inner(&user_id, LockReason::Timeout).await?,
                VaultTimeoutAction::LogOut => self.logout_inner(&user_id, LockReason::Timeout).await?,
            }
            applied.push((user_id, settings.action));
        }
        if !applied.is_empty() {
            debug!(?trigger, count = applied.len(), "vault timeouts applied");
        }
        Ok(applied)
    }

    pub async fn lock_all(&self, reason: LockReason) -> Result<()> {
        let _guard = self.transitions.lock().await;
        for user_id in self.secrets.users() {
            self.lock_inner(&user_id, reason).await?;
        }
        Ok(())
    }

    pub async fn logout_all(&self, reason: LockReason) -> Result<()> {
        let _guard = self.transitions.lock().await;
        for user_id in self.accounts().await {
            self.logout_inner(&user_id, reason).await?;
        }
        Ok(())
    }

    async fn verify(&self, user_id: &UserId, factor: &UnlockFactor) -> Result<SecretHandle> {
        let method = factor.method();
        let verifier = self
            .verifiers
            .get(&method)
            .ok_or(SessionError::UnsupportedUnlockMethod(method))?;
        verifier.derive_key(user_id, factor).await
    }

    async fn ensure_defined(&self, user_id: &UserId) -> Result<()> {
        self.broker
            .define_authoritative(
                LOCK_STATUS,
                StateScope::User(user_id.clone()),
                Some(LockStatus::LoggedOut),
                &[],
            )
            .await
    }

    fn is_live(&self, user_id: &UserId, handle: &SecretHandle) -> bool {
        self.secrets.get(user_id).as_ref() == Some(handle)
    }

    /// Replaces the live handle. `Unlocked` is only republished when it is not already the published status.
    async fn install(&self, user_id: &UserId, handle: SecretHandle) -> Result<()> {
        self.secrets.set(user_id, handle);
        let scope = StateScope::User(user_id.clone());
        if self.broker.current::<LockStatus>(LOCK_STATUS, &scope) != Some(LockStatus::Unlocked) {
            self.publish(user_id, LockStatus::Unlocked).await?;
        }
        Ok(())
    }

    async fn publish(&self, user_id: &UserId, status: LockStatus) -> Result<()> {
        let scope = StateScope::User(user_id.clone());
        let envelope = self
            .broker
            .set_authoritative(LOCK_STATUS, &scope, Some(status))
            .await?;
        debug!(user = %user_id, ?status, revision = envelope.revision, "lock status published");
        Ok(())
    }

    async fn register_account(&self, user_id: &UserId) -> Result<()> {
        let mut accounts = self.accounts().await;
        if accounts.insert(user_id.clone()) {
            self.broker
                .store()
                .write(ACCOUNTS, &StateScope::Global, &accounts)
                .await?;
        }
        Ok(())
    }

    async fn forget_account(&self, user_id: &UserId) -> Result<()> {
        let mut accounts = self.accounts().await;
        if accounts.remove(user_id) {
            self.broker
                .store()
                .write(ACCOUNTS, &StateScope::Global, &accounts)
                .await?;
        }
        Ok(())
    }
}
