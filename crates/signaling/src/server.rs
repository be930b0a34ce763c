//! WebSocket signaling server.
//!
//! Accepts client connections, assigns each a connection id, and routes
//! their messages: `register` allocates a session, `join` pairs the
//! second peer, and offer/answer/candidate/control messages are relayed
//! byte-for-byte to the other party; the server never looks inside
//! their payloads. A disconnect notifies the surviving peer and removes
//! the session. Every failure path answers with an `error` frame; no
//! exception ever reaches the transport.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{Mutex, mpsc};
use tokio_tungstenite::tungstenite;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use pindrop_protocol::signaling::{ClientEnvelope, ClientKind, ErrorCode, ServerMessage};

use crate::registry::{Registry, RegistryError};
use crate::store::SessionStore;

/// Maximum accepted signaling message size (64 KiB). Signaling carries
/// handshake blobs and short control records, never file data.
pub const MAX_SIGNALING_MESSAGE_SIZE: usize = 64 * 1024;

/// Outbound queue depth per connection.
const SEND_BUFFER_SIZE: usize = 64;

/// Errors from running the server.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tungstenite::Error),
}

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Listen address (port 0 = OS-assigned).
    pub addr: SocketAddr,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            addr: ([0, 0, 0, 0], 0).into(),
        }
    }
}

/// The rendezvous/relay server.
pub struct SignalingServer<S: SessionStore> {
    registry: Registry<S>,
    connections: Mutex<HashMap<String, mpsc::Sender<tungstenite::Message>>>,
    cancel: CancellationToken,
    local_addr: Mutex<Option<SocketAddr>>,
    addr: SocketAddr,
}

impl<S: SessionStore> SignalingServer<S> {
    pub fn new(config: ServerConfig, registry: Registry<S>) -> Arc<Self> {
        Arc::new(Self {
            registry,
            connections: Mutex::new(HashMap::new()),
            cancel: CancellationToken::new(),
            local_addr: Mutex::new(None),
            addr: config.addr,
        })
    }

    /// The bound address, available once [`run`](Self::run) has started.
    pub async fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock().await
    }

    /// Gracefully shuts down the accept loop and all connections.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    /// Runs the accept loop until cancellation.
    pub async fn run(self: &Arc<Self>) -> Result<(), ServerError> {
        let listener = TcpListener::bind(self.addr).await?;
        let local_addr = listener.local_addr()?;
        *self.local_addr.lock().await = Some(local_addr);
        info!("signaling server listening on {local_addr}");

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    info!("signaling server shutting down");
                    break Ok(());
                }

                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, peer_addr)) => {
                            let server = Arc::clone(self);
                            tokio::spawn(async move {
                                if let Err(e) = server.handle_connection(stream, peer_addr).await {
                                    debug!(%peer_addr, "connection ended with error: {e}");
                                }
                            });
                        }
                        Err(e) => warn!("accept error: {e}"),
                    }
                }
            }
        }
    }

    /// Serves one client connection to completion.
    async fn handle_connection(
        self: Arc<Self>,
        stream: TcpStream,
        peer_addr: SocketAddr,
    ) -> Result<(), ServerError> {
        let mut ws_config = tungstenite::protocol::WebSocketConfig::default();
        ws_config.max_message_size = Some(MAX_SIGNALING_MESSAGE_SIZE);
        ws_config.max_frame_size = Some(MAX_SIGNALING_MESSAGE_SIZE);
        let ws_stream =
            tokio_tungstenite::accept_async_with_config(stream, Some(ws_config)).await?;

        let conn_id = uuid::Uuid::new_v4().to_string();
        debug!(%peer_addr, conn = %conn_id, "connection established");

        let (mut write, mut read) = ws_stream.split();
        let (write_tx, mut write_rx) = mpsc::channel::<tungstenite::Message>(SEND_BUFFER_SIZE);

        // Writer task: drains this connection's queue onto the socket.
        // A write failure only ends this connection; the queue sender side
        // observes it as a closed channel.
        let write_task = {
            let conn = conn_id.clone();
            let cancel = self.cancel.clone();
            tokio::spawn(async move {
                while let Some(msg) = tokio::select! {
                    _ = cancel.cancelled() => None,
                    msg = write_rx.recv() => msg,
                } {
                    if let Err(e) = write.send(msg).await {
                        debug!(conn = %conn, "write failed, closing connection: {e}");
                        return;
                    }
                }
                // Graceful path: send a close frame and flush it.
                let _ = write.close().await;
            })
        };

        self.connections
            .lock()
            .await
            .insert(conn_id.clone(), write_tx.clone());

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,

                msg = read.next() => match msg {
                    Some(Ok(tungstenite::Message::Text(text))) => {
                        self.dispatch(&conn_id, &text).await;
                    }
                    Some(Ok(tungstenite::Message::Ping(data))) => {
                        let _ = write_tx.send(tungstenite::Message::Pong(data)).await;
                    }
                    Some(Ok(tungstenite::Message::Close(_))) | None => break,
                    Some(Ok(_)) => {
                        // Binary frames belong on the data pipe, not here.
                    }
                    Some(Err(e)) => {
                        debug!(conn = %conn_id, "read error: {e}");
                        break;
                    }
                }
            }
        }

        self.connections.lock().await.remove(&conn_id);
        self.handle_disconnect(&conn_id).await;
        write_task.abort();
        debug!(conn = %conn_id, "connection closed");
        Ok(())
    }

    /// Routes one inbound text frame.
    async fn dispatch(&self, conn_id: &str, text: &str) {
        let envelope = match ClientEnvelope::parse(text) {
            Ok(envelope) => envelope,
            Err(e) => {
                debug!(conn = %conn_id, "unparseable message: {e}");
                self.send_error(conn_id, ErrorCode::MalformedMessage, "unparseable message")
                    .await;
                return;
            }
        };

        match envelope.kind() {
            None => {
                self.send_error(conn_id, ErrorCode::MalformedMessage, "missing routing key")
                    .await;
            }
            Some(ClientKind::Register) => self.handle_register(conn_id).await,
            Some(ClientKind::Join) => self.handle_join(conn_id, envelope.pin.as_deref()).await,
            Some(
                ClientKind::Offer | ClientKind::Answer | ClientKind::Candidate | ClientKind::Control,
            ) => self.relay(conn_id, text).await,
            Some(ClientKind::Other) => {
                debug!(conn = %conn_id, "unhandled message kind, dropping");
            }
        }
    }

    async fn handle_register(&self, conn_id: &str) {
        match self.registry.create_session(conn_id).await {
            Ok(pin) => {
                info!(conn = %conn_id, "session registered");
                self.post_message(conn_id, &ServerMessage::Register { pin })
                    .await;
            }
            Err(e) => self.send_registry_error(conn_id, e).await,
        }
    }

    async fn handle_join(&self, conn_id: &str, pin: Option<&str>) {
        let Some(pin) = pin else {
            self.send_error(conn_id, ErrorCode::MalformedMessage, "join requires a pin")
                .await;
            return;
        };

        match self.registry.join_session(pin, conn_id).await {
            Ok(record) => {
                info!(conn = %conn_id, "session paired");
                self.post_message(&record.sender_conn_id, &ServerMessage::PeerJoined)
                    .await;
                self.post_message(conn_id, &ServerMessage::Joined).await;
            }
            Err(e) => self.send_registry_error(conn_id, e).await,
        }
    }

    /// Forwards a peer message verbatim to the other party.
    ///
    /// The payload is opaque: it is never parsed beyond the routing key,
    /// and the original text goes out byte-for-byte. Absent or broken
    /// sessions drop the message silently.
    async fn relay(&self, from_conn_id: &str, text: &str) {
        let pin = match self.registry.pin_for_connection(from_conn_id).await {
            Ok(Some(pin)) => pin,
            _ => {
                debug!(conn = %from_conn_id, "relay from connection without a session, dropping");
                return;
            }
        };
        let session = match self.registry.get_session(&pin).await {
            Ok(Some(session)) => session,
            _ => return,
        };

        let target = if session.sender_conn_id == from_conn_id {
            session.receiver_conn_id
        } else {
            Some(session.sender_conn_id)
        };
        let Some(target) = target else {
            debug!(conn = %from_conn_id, "no peer to relay to yet, dropping");
            return;
        };
        self.post_raw(&target, text.to_string()).await;
    }

    /// Tears down the departed connection's session and tells its peer.
    async fn handle_disconnect(&self, conn_id: &str) {
        self.registry.forget_connection(conn_id);

        let pin = match self.registry.pin_for_connection(conn_id).await {
            Ok(Some(pin)) => pin,
            _ => return,
        };

        if let Ok(Some(session)) = self.registry.get_session(&pin).await {
            let other = if session.sender_conn_id == conn_id {
                session.receiver_conn_id
            } else {
                Some(session.sender_conn_id)
            };
            if let Some(other) = other {
                self.post_message(&other, &ServerMessage::PeerLeft).await;
            }
        }

        if let Err(e) = self.registry.remove_session(&pin).await {
            warn!(conn = %conn_id, "failed to remove session: {e}");
        }
        debug!(conn = %conn_id, "session removed on disconnect");
    }

    async fn post_message(&self, conn_id: &str, msg: &ServerMessage) {
        match msg.to_text() {
            Ok(text) => self.post_raw(conn_id, text).await,
            Err(e) => warn!("failed to serialize server message: {e}"),
        }
    }

    async fn post_raw(&self, conn_id: &str, text: String) {
        let tx = self.connections.lock().await.get(conn_id).cloned();
        match tx {
            Some(tx) => {
                if tx.send(tungstenite::Message::Text(text.into())).await.is_err() {
                    debug!(conn = %conn_id, "connection gone, message dropped");
                }
            }
            None => debug!(conn = %conn_id, "no such connection, message dropped"),
        }
    }

    async fn send_error(&self, conn_id: &str, code: ErrorCode, message: &str) {
        self.post_message(
            conn_id,
            &ServerMessage::Error {
                message: message.to_string(),
                code,
            },
        )
        .await;
    }

    async fn send_registry_error(&self, conn_id: &str, err: RegistryError) {
        debug!(conn = %conn_id, "registry error: {err}");
        let message = err.to_string();
        self.send_error(conn_id, error_code(&err), &message).await;
    }
}

/// Maps registry failures onto the wire error-code set.
fn error_code(err: &RegistryError) -> ErrorCode {
    match err {
        RegistryError::InvalidPin | RegistryError::SessionNotFound => ErrorCode::InvalidPin,
        RegistryError::SessionFull => ErrorCode::SessionFull,
        RegistryError::SelfJoin => ErrorCode::MalformedMessage,
        RegistryError::RateLimited => ErrorCode::RateLimited,
        RegistryError::CapacityExceeded | RegistryError::Store(_) => ErrorCode::CapacityExceeded,
    }
}
