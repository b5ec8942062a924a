use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(String);

impl UserId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for UserId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for UserId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "user_id", rename_all = "lowercase")]
pub enum StateScope {
    Global,
    User(UserId),
}

impl StateScope {
    /// Prefix used both for storage keys and channel topics.
    pub fn prefix(&self) -> String {
        match self {
            StateScope::Global => "global".to_string(),
            StateScope::User(id) => format!("user_{id}"),
        }
    }

    pub fn storage_key(&self, key: &str) -> String {
        format!("{}:{}", self.prefix(), key)
    }

    pub fn user_id(&self) -> Option<&UserId> {
        match self {
            StateScope::Global => None,
            StateScope::User(id) => Some(id),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateEnvelope<T> {
    pub key: String,
    pub scope: StateScope,
    pub value: Option<T>,
    pub revision: u64,
}

impl<T> StateEnvelope<T> {
    pub fn new(key: impl Into<String>, scope: StateScope, value: Option<T>, revision: u64) -> Self {
        Self {
            key: key.into(),
            scope,
            value,
            revision,
        }
    }

    pub fn topic(&self) -> String {
        state_topic(&self.key, &self.scope)
    }
}

pub fn state_topic(key: &str, scope: &StateScope) -> String {
    format!("state:{}", scope.storage_key(key))
}
