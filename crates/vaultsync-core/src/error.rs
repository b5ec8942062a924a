use thiserror::Error;

use crate::unlock::UnlockMethod;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("state {key} is not owned by this context")]
    NotAuthoritative { key: String },

    #[error("state {key} has not been defined in this context")]
    UnknownState { key: String },

    #[error("authoritative context unavailable: {0}")]
    ChannelUnavailable(String),

    #[error("Invalid unlock factor")]
    InvalidUnlockFactor,

    #[error("no verifier registered for {0:?} unlock")]
    UnsupportedUnlockMethod(UnlockMethod),

    #[error("Vault is locked; unlock first")]
    VaultLocked,

    #[error("Account is logged out; authenticate again")]
    LoggedOut,

    #[error("key rotation aborted at {stage}: {reason}")]
    RotationAborted { stage: String, reason: String },

    /// The server accepted the new key and the live key was swapped, but a
    /// local follow-up step kept failing.
    #[error("key rotation committed but local follow-up failed at {}: {reason}", stages.join(", "))]
    RotationIncomplete { stages: Vec<String>, reason: String },

    #[error("key rotation already in progress for this account")]
    RotationInProgress,

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Serialisation error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Crypto error: {0}")]
    Crypto(String),

    #[error("Transport error: {0}")]
    Transport(String),
}

impl SessionError {
    /// Name of the failing rotation stage, if this is a rotation abort.
    pub fn rotation_stage(&self) -> Option<&str> {
        match self {
            SessionError::RotationAborted { stage, .. } => Some(stage),
            _ => None,
        }
    }

    /// True when the server already holds the rotated key.
    pub fn rotation_committed(&self) -> bool {
        matches!(self, SessionError::RotationIncomplete { .. })
    }
}

pub type Result<T> = std::result::Result<T, SessionError>;
