//! Versioned upgrades of the durable state layout, run once at startup.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{debug, info};

use crate::durable_store::{DurableStateExt, DurableStateStore};
use crate::error::{Result, SessionError};
use crate::lock::ACCOUNTS;
use crate::settings::{VaultTimeout, VaultTimeoutAction, VaultTimeoutSettings, VAULT_TIMEOUT_SETTINGS};
use crate::types::{StateScope, UserId};

pub const STATE_VERSION: &str = "state_version";
pub const LEGACY_VAULT_TIMEOUT: &str = "vault_timeout";
pub const LEGACY_VAULT_TIMEOUT_ACTION: &str = "vault_timeout_action";

#[async_trait]
pub trait Migration: Send + Sync {
    fn from_version(&self) -> u32;
    fn to_version(&self) -> u32;
    async fn migrate(&self, store: &dyn DurableStateStore) -> Result<()>;
}

pub struct MigrationRunner {
    migrations: Vec<Box<dyn Migration>>,
}

impl Default for MigrationRunner {
    fn default() -> Self {
        Self::new().with(Box::new(VaultTimeoutPerAccount))
    }
}

impl MigrationRunner {
    pub fn new() -> Self {
        Self { migrations: Vec::new() }
    }

    pub fn with(mut self, migration: Box<dyn Migration>) -> Self {
        self.migrations.push(migration);
        self.migrations.sort_by_key(|m| m.from_version());
        self
    }

    pub fn latest_version(&self) -> u32 {
        self.migrations.iter().map(|m| m.to_version()).max().unwrap_or(1)
    }

    pub async fn current_version(store: &dyn DurableStateStore) -> u32 {
        store.read(STATE_VERSION, &StateScope::Global).await.unwrap_or(1)
    }

    /// Applies every pending migration in order and returns the resulting version.
    pub async fn run(&self, store: Arc<dyn DurableStateStore>) -> Result<u32> {
        let store = store.as_ref();
        let mut version = Self::current_version(store).await;
        for migration in &self.migrations {
            if migration.from_version() != version {
                continue;
            }
            if migration.to_version() <= version {
                return Err(SessionError::Storage(format!(
                    "migration {} -> {} does not advance the state version",
                    migration.from_version(),
                    migration.to_version()
                )));
            }
            migration.migrate(store).await?;
            version = migration.to_version();
            store.write(STATE_VERSION, &StateScope::Global, &version).await?;
            info!(version, "state migrated");
        }
        Ok(version)
    }
}

/// 1 -> 2: the single global vault timeout becomes a per-account setting.
pub struct VaultTimeoutPerAccount;

#[async_trait]
impl Migration for VaultTimeoutPerAccount {
    fn from_version(&self) -> u32 {
        1
    }

    fn to_version(&self) -> u32 {
        2
    }

    async fn migrate(&self, store: &dyn DurableStateStore) -> Result<()> {
        let global = StateScope::Global;
        let timeout = store.read_raw(LEGACY_VAULT_TIMEOUT, &global).await?;
        let action = store.read_raw(LEGACY_VAULT_TIMEOUT_ACTION, &global).await?;
        if timeout.is_none() && action.is_none() {
            debug!("no legacy vault timeout to migrate");
            return Ok(());
        }

        let defaults = VaultTimeoutSettings::default();
        let settings = VaultTimeoutSettings {
            timeout: match timeout {
                Some(Value::Null) => VaultTimeout::Never,
                Some(value) => value
                    .as_i64()
                    .map(|n| VaultTimeout::from_legacy(Some(n)))
                    .unwrap_or(defaults.timeout),
                None => defaults.timeout,
            },
            action: action
                .and_then(|value| serde_json::from_value::<VaultTimeoutAction>(value).ok())
                .unwrap_or(defaults.action),
        };

        let accounts: BTreeSet<UserId> = store.read(ACCOUNTS, &global).await.unwrap_or_default();
        for user_id in &accounts {
            let scope = StateScope::User(user_id.clone());
            if store
                .read::<VaultTimeoutSettings>(VAULT_TIMEOUT_SETTINGS, &scope)
                .await
                .is_some()
            {
                continue;
            }
            store.write(VAULT_TIMEOUT_SETTINGS, &scope, &settings).await?;
        }
        store.remove(LEGACY_VAULT_TIMEOUT, &global).await?;
        store.remove(LEGACY_VAULT_TIMEOUT_ACTION, &global).await?;
        info!(accounts = accounts.len(), ?settings, "moved vault timeout to accounts");
        Ok(())
    }
}
