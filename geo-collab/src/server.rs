//! WebSocket collaboration server.
//!
//! Architecture:
//! ```text
//! Client A ──┐                         ┌── Room "R1" ── features / annotations
//!             ├── connection task ──► RoomBroker        members ── outbound queues
//! Client B ──┘   (one per socket)      └── Room "R2" ── …
//!                        ▲                                   │
//!                        └────────── encoded frames ◄────────┘
//! ```
//!
//! Each connection task owns its socket and an outbound queue. The room
//! is chosen by the first `join` envelope, not by the URL path, so a
//! reconnect uses the same address and simply joins again.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use futures_util::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, RwLock};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_tungstenite::tungstenite::{self, Message};

use crate::broadcast::{BrokerError, Frame, RoomBroker};
use crate::config::ServerConfig;
use crate::model::SessionInfo;
use crate::protocol::{Envelope, ErrorCode, Payload, SERVER_USER_ID};

/// Server statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub total_messages: u64,
    pub total_bytes: u64,
    /// Inbound envelopes discarded as malformed.
    pub protocol_errors: u64,
    pub active_rooms: usize,
}

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("websocket error: {0}")]
    WebSocket(#[from] tungstenite::Error),
}

/// Per-socket state.
struct Connection {
    addr: SocketAddr,
    session: Option<SessionInfo>,
    out_tx: mpsc::Sender<Frame>,
}

impl Connection {
    /// Queue a server-originated envelope for this socket only.
    fn reply(&self, envelope: &Envelope) {
        match envelope.encode() {
            Ok(text) => {
                if self.out_tx.try_send(Arc::from(text)).is_err() {
                    log::debug!("Outbound queue full for {}, reply dropped", self.addr);
                }
            }
            Err(e) => log::error!("Failed to encode reply: {e}"),
        }
    }
}

/// The collaboration server.
pub struct CollabServer {
    config: ServerConfig,
    broker: RoomBroker,
    stats: Arc<RwLock<ServerStats>>,
}

impl CollabServer {
    pub fn new(config: ServerConfig) -> Self {
        let broker = RoomBroker::from_config(&config);
        Self {
            config,
            broker,
            stats: Arc::new(RwLock::new(ServerStats::default())),
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(ServerConfig::default())
    }

    /// Bind the configured address and serve forever.
    pub async fn run(&self) -> Result<(), ServerError> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        log::info!("Collaboration server listening on {}", self.config.bind_addr);
        self.serve(listener).await
    }

    /// Serve connections from an already bound listener.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), ServerError> {
        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("New TCP connection from {addr}");

            let broker = self.broker.clone();
            let stats = self.stats.clone();
            let config = self.config.clone();

            tokio::spawn(async move {
                if let Err(e) = Self::handle_connection(stream, addr, broker, stats, config).await {
                    log::error!("Connection error from {addr}: {e}");
                }
            });
        }
    }

    async fn handle_connection(
        stream: TcpStream,
        addr: SocketAddr,
        broker: RoomBroker,
        stats: Arc<RwLock<ServerStats>>,
        config: ServerConfig,
    ) -> Result<(), ServerError> {
        let ws_stream = tokio_tungstenite::accept_async(stream).await?;
        log::info!("WebSocket connection established from {addr}");

        {
            let mut s = stats.write().await;
            s.total_connections += 1;
            s.active_connections += 1;
        }

        let (out_tx, out_rx) = mpsc::channel(config.outbound_capacity.max(1));
        let mut conn = Connection {
            addr,
            session: None,
            out_tx,
        };

        let result =
            Self::connection_loop(ws_stream, out_rx, &mut conn, &broker, &stats, &config).await;

        // Cleanup runs on every exit path, including write errors.
        if let Some(session) = conn.session.take() {
            broker.leave(&session.session_id).await;
        }
        {
            let mut s = stats.write().await;
            s.active_connections = s.active_connections.saturating_sub(1);
        }
        log::info!("Connection closed from {addr}");
        result
    }

    async fn connection_loop(
        ws_stream: tokio_tungstenite::WebSocketStream<TcpStream>,
        mut out_rx: mpsc::Receiver<Frame>,
        conn: &mut Connection,
        broker: &RoomBroker,
        stats: &Arc<RwLock<ServerStats>>,
        config: &ServerConfig,
    ) -> Result<(), ServerError> {
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();

        let interval = config.heartbeat_interval().max(Duration::from_millis(10));
        let dead_after = interval * 2;
        let mut liveness = tokio::time::interval(interval);
        liveness.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut last_inbound = Instant::now();

        loop {
            tokio::select! {
                msg = ws_receiver.next() => {
                    last_inbound = Instant::now();
                    match msg {
                        Some(Ok(Message::Text(text))) => {
                            {
                                let mut s = stats.write().await;
                                s.total_messages += 1;
                                s.total_bytes += text.len() as u64;
                            }
                            match Envelope::decode(text.as_str()) {
                                Ok(envelope) => Self::dispatch(envelope, conn, broker).await,
                                Err(e) => {
                                    log::warn!("Discarding envelope from {}: {e}", conn.addr);
                                    stats.write().await.protocol_errors += 1;
                                    conn.reply(&Envelope::error("", ErrorCode::Protocol, e.to_string()));
                                }
                            }
                        }

                        Some(Ok(Message::Binary(_))) => {
                            log::warn!("Discarding binary frame from {}", conn.addr);
                            stats.write().await.protocol_errors += 1;
                        }

                        Some(Ok(Message::Ping(data))) => {
                            ws_sender.send(Message::Pong(data)).await?;
                        }

                        Some(Ok(Message::Close(_))) | None => break,

                        Some(Err(e)) => {
                            log::error!("WebSocket error from {}: {e}", conn.addr);
                            break;
                        }

                        _ => {}
                    }
                }

                frame = out_rx.recv() => {
                    match frame {
                        Some(frame) => ws_sender.send(Message::text(frame.to_string())).await?,
                        None => break,
                    }
                }

                _ = liveness.tick() => {
                    if last_inbound.elapsed() > dead_after {
                        log::warn!("No traffic from {} for {:?}, closing", conn.addr, dead_after);
                        let _ = ws_sender.send(Message::Close(None)).await;
                        break;
                    }
                }
            }
        }

        Ok(())
    }

    async fn dispatch(envelope: Envelope, conn: &mut Connection, broker: &RoomBroker) {
        match &envelope.payload {
            Payload::Join(info) => {
                if info.session_id.is_empty() {
                    conn.reply(&Envelope::error(
                        &envelope.room_id,
                        ErrorCode::Protocol,
                        "join requires a sessionId",
                    ));
                    return;
                }
                if let Some(previous) = &conn.session {
                    if previous.session_id != info.session_id {
                        broker.leave(&previous.session_id).await;
                    }
                }
                match broker.join(info.clone(), &envelope.room_id, conn.out_tx.clone()).await {
                    Ok(_) => conn.session = Some(info.clone()),
                    Err(e @ BrokerError::Capacity { .. }) => {
                        conn.session = None;
                        conn.reply(&Envelope::error(&envelope.room_id, ErrorCode::Capacity, e.to_string()));
                    }
                    Err(e @ BrokerError::SessionInUse(_)) => {
                        conn.session = None;
                        conn.reply(&Envelope::error(&envelope.room_id, ErrorCode::Protocol, e.to_string()));
                    }
                    Err(e) => log::error!("Join of {} failed: {e}", info.session_id),
                }
            }

            Payload::Leave => {
                if let Some(session) = conn.session.take() {
                    broker.leave(&session.session_id).await;
                }
            }

            Payload::Heartbeat => {
                let room = match &conn.session {
                    Some(session) => broker.room_of(&session.session_id).await,
                    None => None,
                };
                let room_id = room.unwrap_or_else(|| envelope.room_id.clone());
                conn.reply(&Envelope::heartbeat(room_id, SERVER_USER_ID));
            }

            Payload::Cursor(_)
            | Payload::FeatureCreate(_)
            | Payload::FeatureUpdate(_)
            | Payload::FeatureDelete(_)
            | Payload::AnnotationCreate(_)
            | Payload::AnnotationUpdate(_)
            | Payload::AnnotationDelete(_) => {
                let Some(session) = &conn.session else {
                    conn.reply(&Envelope::error(
                        &envelope.room_id,
                        ErrorCode::NotJoined,
                        "join a room first",
                    ));
                    return;
                };
                match broker.route(&session.session_id, &envelope).await {
                    Ok(outcome) => log::trace!("Routed {} in {}: {outcome:?}", envelope.kind(), envelope.room_id),
                    Err(e @ BrokerError::NotJoined { .. }) => {
                        conn.reply(&Envelope::error(&envelope.room_id, ErrorCode::NotJoined, e.to_string()));
                    }
                    Err(e) => log::error!("Route failed in {}: {e}", envelope.room_id),
                }
            }

            Payload::PresenceJoined(_)
            | Payload::PresenceLeft(_)
            | Payload::Sync(_)
            | Payload::Error(_) => {
                log::warn!("Discarding server-only {} from {}", envelope.kind(), conn.addr);
            }
        }
    }

    /// Get server statistics.
    pub async fn stats(&self) -> ServerStats {
        let mut stats = self.stats.read().await.clone();
        stats.active_rooms = self.broker.room_count().await;
        stats
    }

    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn broker(&self) -> &RoomBroker {
        &self.broker
    }
}
