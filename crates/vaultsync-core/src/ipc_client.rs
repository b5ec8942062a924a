use async_trait::async_trait;
use parking_lot::Mutex;
use rand::RngCore;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::BufReader;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::channel::{
    CrossContextChannel, SnapshotResponder, TopicHandler, TopicRegistry, DEFAULT_SNAPSHOT_TIMEOUT,
};
use crate::error::{Result, SessionError};
use crate::ipc::{
    compute_proof, read_frame, write_frame, AuthOk, ChannelMessage, ClientAuth, ClientHello,
    IpcEnvelope, RequestEnvelope, ServerChallenge, IPC_PROTOCOL_VERSION,
};

#[cfg(unix)]
use tokio::net::UnixStream;

type PendingSnapshots = Arc<Mutex<HashMap<u64, oneshot::Sender<std::result::Result<Value, String>>>>>;

/// Mirror-side channel connected to an [`crate::ipc::IpcHub`] over a local socket.
pub struct IpcChannel {
    context_id: String,
    session_id: String,
    nonce: AtomicU64,
    next_request: AtomicU64,
    outbound: mpsc::UnboundedSender<IpcEnvelope>,
    registry: Arc<TopicRegistry>,
    pending: PendingSnapshots,
    connected: Arc<AtomicBool>,
    tasks: Vec<JoinHandle<()>>,
}

impl IpcChannel {
    #[cfg(unix)]
    pub async fn connect(
        socket_path: std::path::PathBuf,
        secret: &[u8],
        context_id: impl Into<String>,
    ) -> Result<Self> {
        Self::connect_with_timeout(socket_path, secret, context_id, DEFAULT_SNAPSHOT_TIMEOUT).await
    }

    /// Connects and authenticates. A hub that does not finish the handshake
    /// within `timeout` is reported as [`SessionError::ChannelUnavailable`].
    #[cfg(unix)]
    pub async fn connect_with_timeout(
        socket_path: std::path::PathBuf,
        secret: &[u8],
        context_id: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self> {
        let context_id = context_id.into();
        let (mut reader, mut writer, session_id) =
            match tokio::time::timeout(timeout, handshake(&socket_path, secret, &context_id)).await {
                Ok(result) => result?,
                Err(_) => {
                    return Err(SessionError::ChannelUnavailable(format!(
                        "handshake with {} timed out after {timeout:?}",
                        socket_path.display()
                    )))
                }
            };
        debug!(context = %context_id, session = %session_id, "ipc channel authenticated");
        let mut line = String::new();

        let registry = Arc::new(TopicRegistry::new());
        let pending: PendingSnapshots = Arc::new(Mutex::new(HashMap::new()));
        let connected = Arc::new(AtomicBool::new(true));
        let (outbound, mut rx) = mpsc::unbounded_channel::<IpcEnvelope>();

        let writer_connected = connected.clone();
        let writer_task = tokio::spawn(async move {
            while let Some(envelope) = rx.recv().await {
                if let Err(err) = write_frame(&mut writer, &envelope).await {
                    warn!(error = %err, "ipc channel write failed");
                    writer_connected.store(false, Ordering::SeqCst);
                    break;
                }
            }
        });

        let reader_registry = registry.clone();
        let reader_pending = pending.clone();
        let reader_connected = connected.clone();
        let reader_task = tokio::spawn(async move {
            loop {
                match read_frame(&mut reader, &mut line).await {
                    Ok(Some(IpcEnvelope::Push(message))) => {
                        dispatch_push(message, &reader_registry, &reader_pending)
                    }
                    Ok(Some(IpcEnvelope::Error { message })) => {
                        warn!(%message, "ipc hub reported error");
                    }
                    Ok(Some(_)) => warn!("unexpected frame from ipc hub"),
                    Ok(None) => break,
                    Err(err) => {
                        warn!(error = %err, "ipc channel read failed");
                        break;
                    }
                }
            }
            reader_connected.store(false, Ordering::SeqCst);
            for (_, waiter) in reader_pending.lock().drain() {
                let _ = waiter.send(Err("hub disconnected".to_string()));
            }
            debug!("ipc channel reader stopped");
        });

        Ok(Self {
            context_id,
            session_id,
            nonce: AtomicU64::new(0),
            next_request: AtomicU64::new(1),
            outbound,
            registry,
            pending,
            connected,
            tasks: vec![writer_task, reader_task],
        })
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn send(&self, message: ChannelMessage) -> Result<()> {
        if !self.is_connected() {
            return Err(SessionError::ChannelUnavailable("hub disconnected".to_string()));
        }
        let nonce = self.nonce.fetch_add(1, Ordering::SeqCst) + 1;
        self.outbound
            .send(IpcEnvelope::Request(RequestEnvelope {
                session_id: self.session_id.clone(),
                nonce,
                message,
            }))
            .map_err(|_| SessionError::ChannelUnavailable("hub disconnected".to_string()))
    }
}

fn dispatch_push(message: ChannelMessage, registry: &TopicRegistry, pending: &PendingSnapshots) {
    match message {
        ChannelMessage::Broadcast { topic, payload } => {
            registry.dispatch(&topic, &payload);
        }
        ChannelMessage::SnapshotResponse { id, payload, error } => {
            let Some(waiter) = pending.lock().remove(&id) else {
                debug!(id, "snapshot response arrived after timeout");
                return;
            };
            let outcome = match (payload, error) {
                (Some(payload), None) => Ok(payload),
                (_, Some(error)) => Err(error),
                (None, None) => Err("empty snapshot response".to_string()),
            };
            let _ = waiter.send(outcome);
        }
        ChannelMessage::SnapshotRequest { .. } => {
            warn!("ipc hub sent a snapshot request; ignoring");
        }
    }
}

impl Drop for IpcChannel {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

#[async_trait]
impl CrossContextChannel for IpcChannel {
    fn context_id(&self) -> &str {
        &self.context_id
    }

    async fn broadcast(&self, topic: &str, payload: Value) -> Result<()> {
        self.send(ChannelMessage::Broadcast {
            topic: topic.to_string(),
            payload,
        })
    }

    fn on(&self, topic: &str, handler: TopicHandler) {
        self.registry.add_handler(topic, handler);
    }

    /// Only the hub answers snapshot requests; a responder registered here
    /// is kept for local lookups by this context.
    fn serve_snapshots(&self, topic: &str, responder: SnapshotResponder) {
        self.registry.set_responder(topic, responder);
    }

    async fn request_snapshot(&self, topic: &str, timeout: Duration) -> Result<Value> {
        let id = self.next_request.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(id, tx);
        if let Err(err) = self.send(ChannelMessage::SnapshotRequest {
            id,
            topic: topic.to_string(),
        }) {
            self.pending.lock().remove(&id);
            return Err(err);
        }
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(Ok(payload))) => Ok(payload),
            Ok(Ok(Err(message))) => Err(SessionError::ChannelUnavailable(message)),
            Ok(Err(_)) => Err(SessionError::ChannelUnavailable("hub disconnected".to_string())),
            Err(_) => {
                self.pending.lock().remove(&id);
                Err(SessionError::ChannelUnavailable(format!(
                    "snapshot request for {topic} timed out after {timeout:?}"
                )))
            }
        }
    }
}

#[cfg(unix)]
type HandshakeStreams = (
    BufReader<tokio::io::ReadHalf<UnixStream>>,
    tokio::io::WriteHalf<UnixStream>,
    String,
);

#[cfg(unix)]
async fn handshake(socket_path: &std::path::Path, secret: &[u8], context_id: &str) -> Result<HandshakeStreams> {
    let stream = UnixStream::connect(socket_path).await.map_err(|e| {
        SessionError::ChannelUnavailable(format!("connect {}: {e}", socket_path.display()))
    })?;
    let (read_half, mut writer) = tokio::io::split(stream);
    let mut reader = BufReader::new(read_half);
    let mut line = String::new();

    write_frame(
        &mut writer,
        &IpcEnvelope::ClientHello(ClientHello {
            protocol_version: IPC_PROTOCOL_VERSION,
            client_id: context_id.to_string(),
        }),
    )
    .await?;

    let ServerChallenge {
        session_id,
        server_nonce,
    } = match read_frame(&mut reader, &mut line).await? {
        Some(IpcEnvelope::ServerChallenge(c)) => c,
        Some(IpcEnvelope::Error { message }) => return Err(SessionError::Transport(message)),
        _ => return Err(SessionError::Transport("expected ServerChallenge".to_string())),
    };

    let mut nonce_bytes = [0u8; 16];
    rand::rngs::OsRng.fill_bytes(&mut nonce_bytes);
    let client_nonce = hex::encode(nonce_bytes);
    let proof = compute_proof(secret, &server_nonce, &client_nonce)?;
    write_frame(
        &mut writer,
        &IpcEnvelope::ClientAuth(ClientAuth {
            session_id,
            client_nonce,
            proof,
        }),
    )
    .await?;

    match read_frame(&mut reader, &mut line).await? {
        Some(IpcEnvelope::AuthOk(AuthOk { session_id })) => Ok((reader, writer, session_id)),
        Some(IpcEnvelope::Error { message }) => Err(SessionError::Transport(message)),
        _ => Err(SessionError::Transport("expected AuthOk".to_string())),
    }
}
