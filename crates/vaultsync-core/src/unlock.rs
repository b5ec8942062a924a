//! Unlock factors and the verifiers that turn them into a live user key.

use async_trait::async_trait;
use base64::{engine::general_purpose, Engine as _};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tracing::debug;
use zeroize::Zeroizing;

use crate::crypto::{derive_key, generate_salt, KdfParams, SealedBlob, KEY_LEN};
use crate::durable_store::{DurableStateExt, DurableStateStore};
use crate::error::{Result, SessionError};
use crate::secret_store::SecretHandle;
use crate::types::{StateScope, UserId};

pub const WRAPPED_USER_KEY: &str = "crypto.wrapped_user_key";
pub const PLATFORM_WRAPPED_USER_KEY: &str = "crypto.platform_wrapped_user_key";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnlockMethod {
    MasterPassword,
    Biometric,
    DeviceApproval,
}

pub enum UnlockFactor {
    MasterPassword(Zeroizing<String>),
    Biometric,
    /// Key material released by an approving device.
    DeviceApproval(Zeroizing<Vec<u8>>),
}

impl UnlockFactor {
    pub fn master_password(password: impl Into<String>) -> Self {
        UnlockFactor::MasterPassword(Zeroizing::new(password.into()))
    }

    pub fn method(&self) -> UnlockMethod {
        match self {
            UnlockFactor::MasterPassword(_) => UnlockMethod::MasterPassword,
            UnlockFactor::Biometric => UnlockMethod::Biometric,
            UnlockFactor::DeviceApproval(_) => UnlockMethod::DeviceApproval,
        }
    }
}

impl fmt::Debug for UnlockFactor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "UnlockFactor::{:?}(<redacted>)", self.method())
    }
}

#[async_trait]
pub trait UnlockVerifier: Send + Sync {
    fn method(&self) -> UnlockMethod;

    /// Derives the user key from `factor`; a factor that does not verify is
    /// [`SessionError::InvalidUnlockFactor`].
    async fn derive_key(&self, user_id: &UserId, factor: &UnlockFactor) -> Result<SecretHandle>;
}

/// User key wrapped under a password-derived key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WrappedUserKey {
    pub salt: String,
    pub kdf: KdfParams,
    #[serde(flatten)]
    pub sealed: SealedBlob,
}

impl WrappedUserKey {
    pub fn wrap(password: &str, key: &SecretHandle, kdf: KdfParams) -> Result<Self> {
        let salt = generate_salt();
        let master = derive_key(password, &salt, &kdf)?;
        let sealed = SealedBlob::seal(&master, key.key_bytes())?;
        Ok(Self {
            salt: general_purpose::STANDARD.encode(salt),
            kdf,
            sealed,
        })
    }

    pub fn unwrap_key(&self, user_id: &UserId, password: &str) -> Result<SecretHandle> {
        let salt = general_purpose::STANDARD
            .decode(&self.salt)
            .map_err(|e| SessionError::Crypto(format!("decode salt: {e}")))?;
        let master = derive_key(password, &salt, &self.kdf)?;
        let key = self
            .sealed
            .open(&master)
            .map_err(|_| SessionError::InvalidUnlockFactor)?;
        SecretHandle::from_slice(user_id.clone(), &key)
    }
}

pub struct MasterPasswordVerifier {
    store: Arc<dyn DurableStateStore>,
    kdf: KdfParams,
}

impl MasterPasswordVerifier {
    pub fn new(store: Arc<dyn DurableStateStore>) -> Self {
        Self::with_params(store, KdfParams::default())
    }

    pub fn with_params(store: Arc<dyn DurableStateStore>, kdf: KdfParams) -> Self {
        Self { store, kdf }
    }

    /// Stores `key` wrapped under `password`, replacing any previous wrapper.
    pub async fn enroll(&self, user_id: &UserId, password: &str, key: &SecretHandle) -> Result<()> {
        let wrapped = WrappedUserKey::wrap(password, key, self.kdf)?;
        self.store
            .write(WRAPPED_USER_KEY, &StateScope::User(user_id.clone()), &wrapped)
            .await?;
        debug!(user = %user_id, "master password wrapper written");
        Ok(())
    }

    pub async fn is_enrolled(&self, user_id: &UserId) -> bool {
        self.store
            .read::<WrappedUserKey>(WRAPPED_USER_KEY, &StateScope::User(user_id.clone()))
            .await
            .is_some()
    }
}

#[async_trait]
impl UnlockVerifier for MasterPasswordVerifier {
    fn method(&self) -> UnlockMethod {
        UnlockMethod::MasterPassword
    }

    async fn derive_key(&self, user_id: &UserId, factor: &UnlockFactor) -> Result<SecretHandle> {
        let UnlockFactor::MasterPassword(password) = factor else {
            return Err(SessionError::InvalidUnlockFactor);
        };
        let wrapped: WrappedUserKey = self
            .store
            .read(WRAPPED_USER_KEY, &StateScope::User(user_id.clone()))
            .await
            .ok_or(SessionError::InvalidUnlockFactor)?;
        wrapped.unwrap_key(user_id, password)
    }
}

/// OS keystore or approving device that can release a per-user unwrap key.
#[async_trait]
pub trait PlatformKeySource: Send + Sync {
    async fn unwrap_key(
        &self,
        user_id: &UserId,
        factor: &UnlockFactor,
    ) -> Result<Option<Zeroizing<[u8; KEY_LEN]>>>;
}

pub struct PlatformKeyVerifier {
    method: UnlockMethod,
    source: Arc<dyn PlatformKeySource>,
    store: Arc<dyn DurableStateStore>,
}

impl PlatformKeyVerifier {
    pub fn new(
        method: UnlockMethod,
        source: Arc<dyn PlatformKeySource>,
        store: Arc<dyn DurableStateStore>,
    ) -> Self {
        Self {
            method,
            source,
            store,
        }
    }

    /// Wraps `key` under the platform key so later unlocks skip the password.
    pub async fn enroll(&self, user_id: &UserId, factor: &UnlockFactor, key: &SecretHandle) -> Result<()> {
        let platform_key = self
            .source
            .unwrap_key(user_id, factor)
            .await?
            .ok_or(SessionError::InvalidUnlockFactor)?;
        let sealed = SealedBlob::seal(&platform_key[..], key.key_bytes())?;
        self.store
            .write(PLATFORM_WRAPPED_USER_KEY, &StateScope::User(user_id.clone()), &sealed)
            .await
    }
}

#[async_trait]
impl UnlockVerifier for PlatformKeyVerifier {
    fn method(&self) -> UnlockMethod {
        self.method
    }

    async fn derive_key(&self, user_id: &UserId, factor: &UnlockFactor) -> Result<SecretHandle> {
        if factor.method() != self.method {
            return Err(SessionError::InvalidUnlockFactor);
        }
        let sealed: SealedBlob = self
            .store
            .read(PLATFORM_WRAPPED_USER_KEY, &StateScope::User(user_id.clone()))
            .await
            .ok_or(SessionError::InvalidUnlockFactor)?;
        let platform_key = self
            .source
            .unwrap_key(user_id, factor)
            .await?
            .ok_or(SessionError::InvalidUnlockFactor)?;
        let key = sealed
            .open(&platform_key[..])
            .map_err(|_| SessionError::InvalidUnlockFactor)?;
        SecretHandle::from_slice(user_id.clone(), &key)
    }
}
