use async_trait::async_trait;
use hmac::{Hmac, Mac};
use parking_lot::Mutex;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::Sha256;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::channel::{CrossContextChannel, SnapshotResponder, TopicHandler, TopicRegistry};
use crate::crypto::constant_time_eq;
use crate::error::{Result, SessionError};

pub const IPC_PROTOCOL_VERSION: u32 = 1;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientHello {
    pub protocol_version: u32,
    pub client_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerChallenge {
    pub session_id: String,
    pub server_nonce: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientAuth {
    pub session_id: String,
    pub client_nonce: String,
    pub proof: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthOk {
    pub session_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum IpcEnvelope {
    ClientHello(ClientHello),
    ServerChallenge(ServerChallenge),
    ClientAuth(ClientAuth),
    AuthOk(AuthOk),
    Error { message: String },
    Request(RequestEnvelope),
    Push(ChannelMessage),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestEnvelope {
    pub session_id: String,
    pub nonce: u64,
    pub message: ChannelMessage,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "message", content = "data")]
pub enum ChannelMessage {
    Broadcast {
        topic: String,
        payload: Value,
    },
    SnapshotRequest {
        id: u64,
        topic: String,
    },
    SnapshotResponse {
        id: u64,
        payload: Option<Value>,
        error: Option<String>,
    },
}

#[derive(Debug, Clone)]
pub struct SessionState {
    pub last_nonce: u64,
}

pub struct IpcAuthContext {
    shared_secret: Vec<u8>,
    sessions: Mutex<HashMap<String, SessionState>>,
}

impl IpcAuthContext {
    pub fn new(shared_secret: Vec<u8>) -> Self {
        Self {
            shared_secret,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    pub fn compute_proof(&self, server_nonce: &str, client_nonce: &str) -> Result<String> {
        compute_proof(&self.shared_secret, server_nonce, client_nonce)
    }

    pub fn register_session(&self, session_id: String) {
        self.sessions
            .lock()
            .insert(session_id, SessionState { last_nonce: 0 });
    }

    pub fn end_session(&self, session_id: &str) {
        self.sessions.lock().remove(session_id);
    }

    pub fn verify_and_update_nonce(&self, session_id: &str, nonce: u64) -> Result<()> {
        let mut sessions = self.sessions.lock();
        let session = sessions
            .get_mut(session_id)
            .ok_or_else(|| SessionError::Transport("unknown session".to_string()))?;
        if nonce <= session.last_nonce {
            return Err(SessionError::Transport(
                "replay detected: nonce not increasing".to_string(),
            ));
        }
        session.last_nonce = nonce;
        Ok(())
    }
}

pub(crate) fn compute_proof(secret: &[u8], server_nonce: &str, client_nonce: &str) -> Result<String> {
    let mut mac = Hmac::<Sha256>::new_from_slice(secret)
        .map_err(|e| SessionError::Crypto(format!("mac init: {e}")))?;
    mac.update(server_nonce.as_bytes());
    mac.update(client_nonce.as_bytes());
    Ok(hex::encode(mac.finalize().into_bytes()))
}

pub(crate) async fn write_frame<W>(writer: &mut W, envelope: &IpcEnvelope) -> Result<()>
where
    W: tokio::io::AsyncWrite + Unpin,
{
    writer
        .write_all(serde_json::to_string(envelope)?.as_bytes())
        .await?;
    writer.write_all(b"\n").await?;
    writer.flush().await?;
    Ok(())
}

pub(crate) async fn read_frame<R>(reader: &mut R, line: &mut String) -> Result<Option<IpcEnvelope>>
where
    R: tokio::io::AsyncBufRead + Unpin,
{
    line.clear();
    let n = reader.read_line(line).await?;
    if n == 0 {
        return Ok(None);
    }
    Ok(Some(serde_json::from_str(line.trim_end())?))
}

/// Socket side of the channel, hosted by the authoritative (background) context.
///
/// Broadcasts from a connected client are relayed to every other client and
/// to the hub's own handlers. Snapshot requests are answered from the hub's
/// responders only.
pub struct IpcHub {
    context_id: String,
    auth: Arc<IpcAuthContext>,
    socket_path: PathBuf,
    registry: Arc<TopicRegistry>,
    peers: Arc<Mutex<HashMap<String, mpsc::UnboundedSender<IpcEnvelope>>>>,
}

impl IpcHub {
    pub fn new(context_id: impl Into<String>, auth_secret: Vec<u8>, socket_path: PathBuf) -> Self {
        Self {
            context_id: context_id.into(),
            auth: Arc::new(IpcAuthContext::new(auth_secret)),
            socket_path,
            registry: Arc::new(TopicRegistry::new()),
            peers: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn connected_peers(&self) -> usize {
        self.peers.lock().len()
    }

    /// Binds the socket and spawns the accept loop.
    #[cfg(unix)]
    pub fn spawn(self: &Arc<Self>) -> Result<tokio::task::JoinHandle<()>> {
        use tokio::net::UnixListener;
        if self.socket_path.exists() {
            let _ = std::fs::remove_file(&self.socket_path);
        }
        let listener = UnixListener::bind(&self.socket_path)?;
        info!(path = %self.socket_path.display(), "ipc hub listening");
        let hub = self.clone();
        Ok(tokio::spawn(async move {
            loop {
                let (stream, _addr) = match listener.accept().await {
                    Ok(conn) => conn,
                    Err(err) => {
                        warn!(error = %err, "ipc accept failed");
                        continue;
                    }
                };
                let hub = hub.clone();
                tokio::spawn(async move {
                    if let Err(e) = hub.handle_connection(stream).await {
                        warn!(error = %e, "ipc connection error");
                    }
                });
            }
        }))
    }

    async fn handle_connection<S>(&self, stream: S) -> Result<()>
    where
        S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send + 'static,
    {
        let (read_half, mut writer) = tokio::io::split(stream);
        let mut reader = BufReader::new(read_half);
        let mut line = String::new();

        let hello = match read_frame(&mut reader, &mut line).await? {
            Some(IpcEnvelope::ClientHello(h)) => h,
            Some(_) => return Err(SessionError::Transport("expected ClientHello".to_string())),
            None => return Err(SessionError::Transport("empty hello".to_string())),
        };
        if hello.protocol_version != IPC_PROTOCOL_VERSION {
            write_frame(
                &mut writer,
                &IpcEnvelope::Error {
                    message: "protocol version mismatch".to_string(),
                },
            )
            .await?;
            return Err(SessionError::Transport("protocol version mismatch".to_string()));
        }
        if hello.client_id.is_empty() || hello.client_id == self.context_id {
            write_frame(
                &mut writer,
                &IpcEnvelope::Error {
                    message: "unauthorized client".to_string(),
                },
            )
            .await?;
            return Err(SessionError::Transport("unauthorized client".to_string()));
        }

        let session_id = uuid::Uuid::new_v4().to_string();
        let mut server_nonce_bytes = [0u8; 32];
        rand::rngs::OsRng.fill_bytes(&mut server_nonce_bytes);
        let server_nonce = hex::encode(server_nonce_bytes);
        write_frame(
            &mut writer,
            &IpcEnvelope::ServerChallenge(ServerChallenge {
                session_id: session_id.clone(),
                server_nonce: server_nonce.clone(),
            }),
        )
        .await?;

        let auth_msg = match read_frame(&mut reader, &mut line).await? {
            Some(IpcEnvelope::ClientAuth(m)) => m,
            Some(_) => return Err(SessionError::Transport("expected ClientAuth".to_string())),
            None => return Err(SessionError::Transport("missing client auth".to_string())),
        };
        if auth_msg.session_id != session_id {
            return Err(SessionError::Transport("session id mismatch".to_string()));
        }
        let expected = self.auth.compute_proof(&server_nonce, &auth_msg.client_nonce)?;
        if !constant_time_eq(expected.as_bytes(), auth_msg.proof.as_bytes()) {
            write_frame(
                &mut writer,
                &IpcEnvelope::Error {
                    message: "invalid proof".to_string(),
                },
            )
            .await?;
            return Err(SessionError::Transport("invalid proof".to_string()));
        }

        self.auth.register_session(session_id.clone());
        write_frame(
            &mut writer,
            &IpcEnvelope::AuthOk(AuthOk {
                session_id: session_id.clone(),
            }),
        )
        .await?;

        let (tx, mut rx) = mpsc::unbounded_channel::<IpcEnvelope>();
        self.peers.lock().insert(session_id.clone(), tx.clone());
        debug!(client = %hello.client_id, session = %session_id, "ipc client attached");

        let writer_task = tokio::spawn(async move {
            while let Some(envelope) = rx.recv().await {
                if let Err(err) = write_frame(&mut writer, &envelope).await {
                    debug!(error = %err, "ipc writer closed");
                    break;
                }
            }
        });

        let outcome = self.serve_requests(&mut reader, &mut line, &session_id, &tx).await;

        self.peers.lock().remove(&session_id);
        self.auth.end_session(&session_id);
        drop(tx);
        let _ = writer_task.await;
        debug!(client = %hello.client_id, session = %session_id, "ipc client detached");
        outcome
    }

    async fn serve_requests<R>(
        &self,
        reader: &mut R,
        line: &mut String,
        session_id: &str,
        reply: &mpsc::UnboundedSender<IpcEnvelope>,
    ) -> Result<()>
    where
        R: tokio::io::AsyncBufRead + Unpin,
    {
        while let Some(envelope) = read_frame(reader, line).await? {
            let request = match envelope {
                IpcEnvelope::Request(r) => r,
                _ => return Err(SessionError::Transport("expected Request envelope".to_string())),
            };
            if request.session_id != session_id {
                return Err(SessionError::Transport("session mismatch".to_string()));
            }
            self.auth.verify_and_update_nonce(session_id, request.nonce)?;
            match request.message {
                ChannelMessage::Broadcast { topic, payload } => {
                    self.relay(Some(session_id), &topic, &payload);
                    self.registry.dispatch(&topic, &payload);
                }
                ChannelMessage::SnapshotRequest { id, topic } => {
                    let response = match self.registry.respond(&topic) {
                        Some(payload) => ChannelMessage::SnapshotResponse {
                            id,
                            payload: Some(payload),
                            error: None,
                        },
                        None => ChannelMessage::SnapshotResponse {
                            id,
                            payload: None,
                            error: Some(format!("no authoritative state for {topic}")),
                        },
                    };
                    let _ = reply.send(IpcEnvelope::Push(response));
                }
                ChannelMessage::SnapshotResponse { .. } => {
                    warn!(session = %session_id, "unexpected snapshot response from client");
                }
            }
        }
        Ok(())
    }

    fn relay(&self, origin: Option<&str>, topic: &str, payload: &Value) {
        let peers = self.peers.lock();
        for (session, tx) in peers.iter() {
            if Some(session.as_str()) == origin {
                continue;
            }
            let _ = tx.send(IpcEnvelope::Push(ChannelMessage::Broadcast {
                topic: topic.to_string(),
                payload: payload.clone(),
            }));
        }
    }
}

#[async_trait]
impl CrossContextChannel for IpcHub {
    fn context_id(&self) -> &str {
        &self.context_id
    }

    async fn broadcast(&self, topic: &str, payload: Value) -> Result<()> {
        self.relay(None, topic, &payload);
        Ok(())
    }

    fn on(&self, topic: &str, handler: TopicHandler) {
        self.registry.add_handler(topic, handler);
    }

    fn serve_snapshots(&self, topic: &str, responder: SnapshotResponder) {
        self.registry.set_responder(topic, responder);
    }

    async fn request_snapshot(&self, topic: &str, _timeout: Duration) -> Result<Value> {
        self.registry
            .respond(topic)
            .ok_or_else(|| SessionError::ChannelUnavailable(format!("no authoritative state for {topic}")))
    }
}
