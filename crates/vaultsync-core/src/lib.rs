pub mod broker;
pub mod channel;
pub mod crypto;
pub mod durable_store;
pub mod error;
pub mod ipc;
pub mod ipc_client;
pub mod lock;
pub mod migrations;
pub mod paths;
pub mod rotation;
pub mod rpc;
pub mod secret_store;
pub mod settings;
pub mod types;
pub mod unlock;

pub use error::{Result, SessionError};
pub use types::{StateEnvelope, StateScope, UserId};
