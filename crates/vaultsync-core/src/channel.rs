//! Message passing between isolated execution contexts.
//!
//! A context broadcasts state on a topic and every other connected context
//! receives it in send order. A context that owns a topic registers a
//! snapshot responder so newly connected mirrors can rehydrate without
//! waiting for the next broadcast.

use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::trace;

use crate::error::{Result, SessionError};

pub const DEFAULT_SNAPSHOT_TIMEOUT: Duration = Duration::from_secs(3);

pub type TopicHandler = Arc<dyn Fn(Value) + Send + Sync>;
pub type SnapshotResponder = Arc<dyn Fn() -> Option<Value> + Send + Sync>;

#[async_trait]
pub trait CrossContextChannel: Send + Sync {
    fn context_id(&self) -> &str;

    /// Fire-and-forget delivery to the currently connected contexts.
    async fn broadcast(&self, topic: &str, payload: Value) -> Result<()>;

    fn on(&self, topic: &str, handler: TopicHandler);

    fn serve_snapshots(&self, topic: &str, responder: SnapshotResponder);

    async fn request_snapshot(&self, topic: &str, timeout: Duration) -> Result<Value>;
}

/// Handlers and snapshot responders registered by one context.
#[derive(Default)]
pub struct TopicRegistry {
    handlers: RwLock<HashMap<String, Vec<TopicHandler>>>,
    responders: RwLock<HashMap<String, SnapshotResponder>>,
}

impl TopicRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_handler(&self, topic: &str, handler: TopicHandler) {
        self.handlers
            .write()
            .entry(topic.to_string())
            .or_default()
            .push(handler);
    }

    pub fn set_responder(&self, topic: &str, responder: SnapshotResponder) {
        self.responders.write().insert(topic.to_string(), responder);
    }

    pub fn dispatch(&self, topic: &str, payload: &Value) -> usize {
        let handlers = self.handlers.read().get(topic).cloned().unwrap_or_default();
        for handler in &handlers {
            handler(payload.clone());
        }
        trace!(topic, delivered = handlers.len(), "dispatched broadcast");
        handlers.len()
    }

    pub fn respond(&self, topic: &str) -> Option<Value> {
        let responder = self.responders.read().get(topic).cloned()?;
        responder()
    }
}

struct LocalEndpoint {
    id: String,
    connected: AtomicBool,
    registry: TopicRegistry,
}

/// In-process hub linking several [`LocalChannel`] endpoints.
#[derive(Default)]
pub struct LocalHub {
    endpoints: RwLock<Vec<Arc<LocalEndpoint>>>,
}

impl LocalHub {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn connect(self: &Arc<Self>, context_id: impl Into<String>) -> LocalChannel {
        let endpoint = Arc::new(LocalEndpoint {
            id: context_id.into(),
            connected: AtomicBool::new(true),
            registry: TopicRegistry::new(),
        });
        self.endpoints.write().push(endpoint.clone());
        LocalChannel {
            hub: self.clone(),
            endpoint,
        }
    }

    fn peers_of(&self, endpoint: &Arc<LocalEndpoint>) -> Vec<Arc<LocalEndpoint>> {
        self.endpoints
            .read()
            .iter()
            .filter(|peer| !Arc::ptr_eq(peer, endpoint))
            .filter(|peer| peer.connected.load(Ordering::SeqCst))
            .cloned()
            .collect()
    }
}

pub struct LocalChannel {
    hub: Arc<LocalHub>,
    endpoint: Arc<LocalEndpoint>,
}

impl LocalChannel {
    /// Simulates the context going away (e.g. a background process restart).
    pub fn disconnect(&self) {
        self.endpoint.connected.store(false, Ordering::SeqCst);
    }

    pub fn reconnect(&self) {
        self.endpoint.connected.store(true, Ordering::SeqCst);
    }

    pub fn is_connected(&self) -> bool {
        self.endpoint.connected.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CrossContextChannel for LocalChannel {
    fn context_id(&self) -> &str {
        &self.endpoint.id
    }

    async fn broadcast(&self, topic: &str, payload: Value) -> Result<()> {
        if !self.is_connected() {
            return Err(SessionError::Transport(format!(
                "context {} is disconnected",
                self.endpoint.id
            )));
        }
        for peer in self.hub.peers_of(&self.endpoint) {
            peer.registry.dispatch(topic, &payload);
        }
        Ok(())
    }

    fn on(&self, topic: &str, handler: TopicHandler) {
        self.endpoint.registry.add_handler(topic, handler);
    }

    fn serve_snapshots(&self, topic: &str, responder: SnapshotResponder) {
        self.endpoint.registry.set_responder(topic, responder);
    }

    async fn request_snapshot(&self, topic: &str, _timeout: Duration) -> Result<Value> {
        if !self.is_connected() {
            return Err(SessionError::ChannelUnavailable(format!(
                "context {} is disconnected",
                self.endpoint.id
            )));
        }
        self.hub
            .peers_of(&self.endpoint)
            .iter()
            .find_map(|peer| peer.registry.respond(topic))
            .ok_or_else(|| SessionError::ChannelUnavailable(format!("no authoritative context for {topic}")))
    }
}
