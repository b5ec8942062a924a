use chrono::Duration;
use serde::{Deserialize, Serialize};

pub const VAULT_TIMEOUT_SETTINGS: &str = "vault_timeout.settings";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VaultTimeout {
    Minutes(u32),
    Immediately,
    OnIdle,
    OnSleep,
    OnLocked,
    OnRestart,
    Never,
}

impl VaultTimeout {
    /// Decodes the numeric form older releases stored globally.
    pub fn from_legacy(value: Option<i64>) -> Self {
        match value {
            None => VaultTimeout::Never,
            Some(0) => VaultTimeout::Immediately,
            Some(-1) => VaultTimeout::OnRestart,
            Some(-2) => VaultTimeout::OnLocked,
            Some(-3) => VaultTimeout::OnSleep,
            Some(-4) => VaultTimeout::OnIdle,
            Some(m) if m > 0 => VaultTimeout::Minutes(u32::try_from(m).unwrap_or(u32::MAX)),
            Some(_) => VaultTimeout::Never,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum VaultTimeoutAction {
    Lock,
    LogOut,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VaultTimeoutSettings {
    pub timeout: VaultTimeout,
    pub action: VaultTimeoutAction,
}

impl Default for VaultTimeoutSettings {
    fn default() -> Self {
        Self {
            timeout: VaultTimeout::Minutes(15),
            action: VaultTimeoutAction::Lock,
        }
    }
}

/// What prompted a timeout evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutTrigger {
    Tick,
    SystemIdle,
    SystemSleep,
    SystemLocked,
    Restart,
}

impl VaultTimeoutSettings {
    pub fn is_due(&self, trigger: TimeoutTrigger, idle_for: Duration) -> bool {
        match self.timeout {
            VaultTimeout::Never => false,
            VaultTimeout::Immediately => true,
            VaultTimeout::Minutes(minutes) => {
                trigger == TimeoutTrigger::Tick && idle_for >= Duration::minutes(i64::from(minutes))
            }
            VaultTimeout::OnIdle => trigger == TimeoutTrigger::SystemIdle,
            VaultTimeout::OnSleep => trigger == TimeoutTrigger::SystemSleep,
            VaultTimeout::OnLocked => trigger == TimeoutTrigger::SystemLocked,
            VaultTimeout::OnRestart => trigger == TimeoutTrigger::Restart,
        }
    }
}
