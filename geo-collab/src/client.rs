//! WebSocket connection manager for one collaborating session.
//!
//! Provides:
//! - Connection lifecycle (connect, close, automatic reconnect with backoff)
//! - Join/leave of a room, re-joined with a fresh session after reconnect
//! - Heartbeats and dead-peer detection
//! - Change submission through the state reconciler
//! - Throttled cursor updates and presence sweeping
//!
//! There is no outbound buffering across disconnects: `send` returns
//! `false` while offline and the envelope is gone. A reconnecting client
//! converges through the `sync` it receives on rejoin.

use std::sync::Arc;
use std::time::Duration;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use crate::config::ClientConfig;
use crate::model::{LatLng, SessionInfo};
use crate::observer::CollabObserver;
use crate::presence::{CursorThrottle, PresenceTracker};
use crate::protocol::{
    Activity, CursorPayload, Envelope, ErrorCode, ErrorPayload, Payload, ProtocolError,
};
use crate::reconciler::{LocalChange, StateReconciler};
use crate::reconnect::{BackoffPolicy, ConnectionState, ReconnectMachine, Transition};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsReader = SplitStream<WsStream>;
type WsWriter = SplitSink<WsStream, Message>;

/// Events emitted to the application.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    StateChanged(ConnectionState),
    /// The `sync` catch-up for a room was applied; the room is ready.
    Synced { room_id: String },
    /// The server refused or rejected something we sent.
    ServerError(ErrorPayload),
    /// Reconnect attempts are exhausted. Emitted once per outage.
    Disconnected,
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("connect to {endpoint} timed out after {timeout:?}")]
    Timeout { endpoint: String, timeout: Duration },
    #[error("websocket error: {0}")]
    WebSocket(#[from] tungstenite::Error),
    #[error("a connection is already open or in progress")]
    AlreadyConnected,
    #[error("connection was closed locally while connecting")]
    Closed,
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

/// State shared between the manager and its background tasks.
struct Inner {
    user_id: String,
    display_name: String,
    config: ClientConfig,
    machine: Mutex<ReconnectMachine>,
    endpoint: Mutex<Option<String>>,
    session: Mutex<Option<SessionInfo>>,
    room: Mutex<Option<String>>,
    outbound: Mutex<Option<mpsc::Sender<String>>>,
    writer: Mutex<Option<JoinHandle<()>>>,
    reconciler: Arc<Mutex<StateReconciler>>,
    presence: Arc<Mutex<PresenceTracker>>,
    throttle: Mutex<CursorThrottle>,
    events: mpsc::Sender<ClientEvent>,
}

impl Inner {
    fn emit(&self, event: ClientEvent) {
        if self.events.try_send(event).is_err() {
            log::trace!("Event channel full or closed, event dropped");
        }
    }

    async fn state(&self) -> ConnectionState {
        self.machine.lock().await.state()
    }

    async fn send(&self, envelope: &Envelope) -> bool {
        if !self.state().await.is_online() {
            return false;
        }
        let Some(tx) = self.outbound.lock().await.clone() else {
            return false;
        };
        match envelope.encode() {
            Ok(text) => tx.try_send(text).is_ok(),
            Err(e) => {
                log::warn!("Failed to encode {}: {e}", envelope.kind());
                false
            }
        }
    }

    async fn dial(&self, endpoint: &str) -> Result<WsStream, TransportError> {
        let timeout = self.config.connect_timeout();
        match tokio::time::timeout(timeout, tokio_tungstenite::connect_async(endpoint)).await {
            Ok(Ok((ws, _response))) => Ok(ws),
            Ok(Err(e)) => Err(TransportError::WebSocket(e)),
            Err(_) => Err(TransportError::Timeout {
                endpoint: endpoint.to_string(),
                timeout,
            }),
        }
    }

    /// Install a freshly opened socket: writer task, new session, rejoin.
    ///
    /// Holds the state machine for the whole install so a concurrent
    /// `close` either lands first (the socket is dropped) or tears down
    /// what was installed.
    async fn attach(&self, ws: WsStream) -> Result<(SessionInfo, WsReader), TransportError> {
        let mut machine = self.machine.lock().await;
        if machine.state() != ConnectionState::Connecting {
            return Err(TransportError::Closed);
        }
        let room = self.room.lock().await.clone();

        let (writer, reader) = ws.split();
        let (tx, rx) = mpsc::channel(self.config.outbound_capacity.max(1));
        let handle = tokio::spawn(write_loop(writer, rx));

        let session = SessionInfo::new(self.user_id.clone(), self.display_name.clone());
        *self.session.lock().await = Some(session.clone());
        {
            let mut reconciler = self.reconciler.lock().await;
            reconciler.set_session(session.session_id.clone());
            reconciler.set_online(true);
            if room.is_some() {
                reconciler.await_sync();
            }
        }
        self.presence
            .lock()
            .await
            .set_local_session(session.session_id.clone());
        self.throttle.lock().await.reset();

        *self.outbound.lock().await = Some(tx.clone());
        if let Some(previous) = self.writer.lock().await.replace(handle) {
            previous.abort();
        }
        machine.connected();
        self.emit(ClientEvent::StateChanged(ConnectionState::Connected));

        if let Some(room_id) = room {
            match Envelope::join(&room_id, &session).encode() {
                Ok(text) => {
                    let _ = tx.try_send(text);
                }
                Err(e) => log::error!("Failed to encode join: {e}"),
            }
        }
        log::info!("Connected as {} ({})", session.session_id, self.display_name);
        Ok((session, reader))
    }

    async fn go_offline(&self) {
        self.outbound.lock().await.take();
        self.reconciler.lock().await.set_online(false);
    }

    /// Handle one inbound frame. Called from a single task, in arrival order.
    async fn handle_inbound(&self, text: &str) {
        let envelope = match Envelope::decode(text) {
            Ok(envelope) => envelope,
            Err(e) => {
                log::warn!("Discarding inbound envelope: {e}");
                return;
            }
        };

        let room_scoped = !matches!(
            envelope.payload,
            Payload::Heartbeat | Payload::Error(_) | Payload::Join(_) | Payload::Leave
        );
        if room_scoped && self.room.lock().await.as_deref() != Some(envelope.room_id.as_str()) {
            log::debug!("Discarding {} for room {}, not ours", envelope.kind(), envelope.room_id);
            return;
        }

        match &envelope.payload {
            Payload::Sync(state) => {
                self.reconciler.lock().await.apply_remote(&envelope);
                self.presence.lock().await.sync_members(&state.members);
                self.emit(ClientEvent::Synced {
                    room_id: envelope.room_id.clone(),
                });
            }
            Payload::FeatureCreate(_)
            | Payload::FeatureUpdate(_)
            | Payload::FeatureDelete(_)
            | Payload::AnnotationCreate(_)
            | Payload::AnnotationUpdate(_)
            | Payload::AnnotationDelete(_) => {
                let outcome = self.reconciler.lock().await.apply_remote(&envelope);
                log::trace!("{} {:?}: {outcome:?}", envelope.kind(), envelope.entity_id());
            }
            Payload::Cursor(cursor) => {
                self.presence.lock().await.update(
                    &cursor.session_id,
                    &envelope.user_id,
                    cursor.position,
                    cursor.activity,
                );
            }
            Payload::PresenceJoined(session) => {
                self.presence.lock().await.member_joined(session.clone());
            }
            Payload::PresenceLeft(left) => {
                self.presence.lock().await.member_left(&left.session_id);
            }
            Payload::Error(error) => {
                log::warn!("Server error ({:?}): {}", error.code, error.message);
                if error.code == ErrorCode::Capacity {
                    // Connected but unjoined; do not rejoin on reconnect.
                    self.room.lock().await.take();
                }
                self.emit(ClientEvent::ServerError(error.clone()));
            }
            Payload::Heartbeat => log::trace!("Heartbeat reply"),
            Payload::Join(_) | Payload::Leave => {
                log::debug!("Ignoring client-only {} from server", envelope.kind());
            }
        }
    }

    /// Read until the socket closes, errors, or goes silent.
    async fn read_until_lost(&self, reader: &mut WsReader) {
        let interval = self.config.heartbeat_interval().max(Duration::from_millis(10));
        let dead_after = interval * 2;
        let mut liveness = tokio::time::interval(interval);
        liveness.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut last_inbound = Instant::now();

        loop {
            tokio::select! {
                msg = reader.next() => {
                    last_inbound = Instant::now();
                    match msg {
                        Some(Ok(Message::Text(text))) => self.handle_inbound(text.as_str()).await,
                        Some(Ok(Message::Close(_))) | None => return,
                        Some(Err(e)) => {
                            log::warn!("Connection error: {e}");
                            return;
                        }
                        _ => {}
                    }
                }
                _ = liveness.tick() => {
                    if last_inbound.elapsed() > dead_after {
                        log::warn!("No traffic from server for {dead_after:?}, treating as lost");
                        return;
                    }
                }
            }
        }
    }
}

async fn write_loop(mut writer: WsWriter, mut rx: mpsc::Receiver<String>) {
    while let Some(text) = rx.recv().await {
        if let Err(e) = writer.send(Message::text(text)).await {
            log::debug!("Writer stopped: {e}");
            return;
        }
    }
    // Sender dropped: flush and close deterministically.
    let _ = writer.send(Message::Close(None)).await;
    let _ = writer.close().await;
}

/// Keeps one live connection, reconnecting after unexpected loss.
async fn supervise(inner: Arc<Inner>, mut reader: WsReader) {
    loop {
        inner.read_until_lost(&mut reader).await;
        inner.go_offline().await;

        let mut transition = inner.machine.lock().await.connection_lost();
        if transition == Transition::Stay {
            // Deliberate close.
            return;
        }
        inner.emit(ClientEvent::StateChanged(ConnectionState::Reconnecting));

        reader = loop {
            match transition {
                Transition::Stay => return,
                Transition::GaveUp => {
                    log::warn!("Reconnect attempts exhausted, collaboration unavailable");
                    inner.presence.lock().await.clear();
                    inner.emit(ClientEvent::StateChanged(ConnectionState::Disconnected));
                    inner.emit(ClientEvent::Disconnected);
                    return;
                }
                Transition::Schedule { attempt, delay } => {
                    log::info!("Reconnect attempt {attempt} in {delay:?}");
                    tokio::time::sleep(delay).await;
                    if !inner.machine.lock().await.retry_due() {
                        return;
                    }
                    inner.emit(ClientEvent::StateChanged(ConnectionState::Connecting));

                    let Some(endpoint) = inner.endpoint.lock().await.clone() else {
                        return;
                    };
                    match inner.dial(&endpoint).await {
                        Ok(ws) => match inner.attach(ws).await {
                            Ok((_, reader)) => break reader,
                            Err(_) => return,
                        },
                        Err(e) => {
                            log::warn!("Reconnect attempt {attempt} failed: {e}");
                            transition = inner.machine.lock().await.attempt_failed();
                            if matches!(transition, Transition::Schedule { .. }) {
                                inner.emit(ClientEvent::StateChanged(ConnectionState::Reconnecting));
                            }
                        }
                    }
                }
            }
        };
    }
}

/// The connection manager.
///
/// Owns one transport connection at a time and routes inbound envelopes
/// to its [`StateReconciler`] and [`PresenceTracker`].
pub struct ConnectionManager {
    inner: Arc<Inner>,
    event_rx: Option<mpsc::Receiver<ClientEvent>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl ConnectionManager {
    pub fn new(
        user_id: impl Into<String>,
        display_name: impl Into<String>,
        config: ClientConfig,
        observer: Arc<dyn CollabObserver>,
    ) -> Self {
        let user_id = user_id.into();
        let (events, event_rx) = mpsc::channel(256);
        let reconciler = StateReconciler::with_max_pending(
            String::new(),
            user_id.clone(),
            observer.clone(),
            config.max_pending_echoes,
        );
        let presence = PresenceTracker::with_config(&config.presence, observer);

        let inner = Inner {
            display_name: display_name.into(),
            machine: Mutex::new(ReconnectMachine::new(BackoffPolicy::from(&config.reconnect))),
            endpoint: Mutex::new(None),
            session: Mutex::new(None),
            room: Mutex::new(None),
            outbound: Mutex::new(None),
            writer: Mutex::new(None),
            reconciler: Arc::new(Mutex::new(reconciler)),
            presence: Arc::new(Mutex::new(presence)),
            throttle: Mutex::new(CursorThrottle::new(config.cursor_throttle())),
            events,
            user_id,
            config,
        };

        Self {
            inner: Arc::new(inner),
            event_rx: Some(event_rx),
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Take the event receiver (can only be called once).
    pub fn take_event_rx(&mut self) -> Option<mpsc::Receiver<ClientEvent>> {
        self.event_rx.take()
    }

    /// Open the transport and, if `room_id` is given, join it.
    ///
    /// Suspends until the handshake completes or the connect timeout
    /// elapses. A failed initial connect leaves the manager DISCONNECTED
    /// without scheduling retries. A `close` that lands while the
    /// handshake is in flight wins: the socket is dropped and this
    /// returns [`TransportError::Closed`].
    pub async fn connect(
        &self,
        endpoint: &str,
        room_id: Option<&str>,
    ) -> Result<SessionInfo, TransportError> {
        if !self.inner.machine.lock().await.begin_connect() {
            return Err(TransportError::AlreadyConnected);
        }
        self.stop_tasks().await;
        self.inner.emit(ClientEvent::StateChanged(ConnectionState::Connecting));

        let ws = match self.inner.dial(endpoint).await {
            Ok(ws) => ws,
            Err(e) => {
                log::warn!("Connect to {endpoint} failed: {e}");
                {
                    let mut machine = self.inner.machine.lock().await;
                    if machine.state() != ConnectionState::Connecting {
                        return Err(TransportError::Closed);
                    }
                    machine.attempt_failed();
                }
                self.inner.emit(ClientEvent::StateChanged(ConnectionState::Disconnected));
                return Err(e);
            }
        };

        *self.inner.endpoint.lock().await = Some(endpoint.to_string());
        if let Some(room_id) = room_id {
            self.switch_room(Some(room_id.to_string())).await;
        }

        let (session, reader) = self.inner.attach(ws).await.inspect_err(|_| {
            log::info!("Closed while connecting to {endpoint}, dropping the socket");
        })?;

        let mut tasks = self.tasks.lock().await;
        if !self.inner.state().await.is_online() {
            return Err(TransportError::Closed);
        }
        tasks.push(tokio::spawn(supervise(self.inner.clone(), reader)));
        tasks.push(self.spawn_heartbeat());
        tasks.push(self.spawn_presence_sweep());
        Ok(session)
    }

    fn spawn_heartbeat(&self) -> JoinHandle<()> {
        let inner = self.inner.clone();
        let period = inner.config.heartbeat_interval().max(Duration::from_millis(10));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            loop {
                ticker.tick().await;
                let room_id = inner.room.lock().await.clone().unwrap_or_default();
                inner
                    .send(&Envelope::heartbeat(room_id, inner.user_id.clone()))
                    .await;
            }
        })
    }

    fn spawn_presence_sweep(&self) -> JoinHandle<()> {
        let presence = self.inner.presence.clone();
        let period = self
            .inner
            .config
            .presence
            .sweep_interval()
            .max(Duration::from_millis(10));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                presence.lock().await.sweep();
            }
        })
    }

    async fn stop_tasks(&self) {
        let handles: Vec<_> = self.tasks.lock().await.drain(..).collect();
        for handle in &handles {
            handle.abort();
        }
        for handle in handles {
            let _ = handle.await;
        }
    }

    /// Reset room-scoped state when moving to a different room.
    async fn switch_room(&self, room_id: Option<String>) {
        let mut room = self.inner.room.lock().await;
        if *room != room_id {
            if room.is_some() {
                self.inner.reconciler.lock().await.reset();
            }
            self.inner.presence.lock().await.clear();
        }
        *room = room_id;
    }

    /// Send an envelope. Returns `false` (dropped, not queued) unless connected.
    pub async fn send(&self, envelope: &Envelope) -> bool {
        self.inner.send(envelope).await
    }

    /// Emit a heartbeat now. Normally done on a fixed interval.
    pub async fn heartbeat(&self) -> bool {
        let room_id = self.room_id().await.unwrap_or_default();
        self.send(&Envelope::heartbeat(room_id, self.inner.user_id.clone()))
            .await
    }

    /// Join `room_id`, leaving the current room first.
    pub async fn join(&self, room_id: &str) -> bool {
        if self.room_id().await.as_deref() == Some(room_id) {
            return false;
        }
        self.leave().await;
        *self.inner.room.lock().await = Some(room_id.to_string());

        let Some(session) = self.session().await else {
            return false;
        };
        self.inner.reconciler.lock().await.await_sync();
        self.send(&Envelope::join(room_id, &session)).await
    }

    /// Leave the current room and drop its local state. Returns whether
    /// a `leave` was sent.
    pub async fn leave(&self) -> bool {
        let Some(room_id) = self.inner.room.lock().await.take() else {
            return false;
        };
        self.inner.reconciler.lock().await.reset();
        self.inner.presence.lock().await.clear();
        self.send(&Envelope::leave(room_id, self.inner.user_id.clone()))
            .await
    }

    /// Apply a local change and send it. The change is applied locally
    /// even when it cannot be sent.
    pub async fn submit_change(&self, change: LocalChange) -> bool {
        let room_id = self.room_id().await;
        let envelope = self
            .inner
            .reconciler
            .lock()
            .await
            .prepare_local(room_id.as_deref().unwrap_or_default(), change);
        room_id.is_some() && self.send(&envelope).await
    }

    /// Send a cursor update, subject to the outbound rate limit.
    ///
    /// Returns `false` if throttled, offline or not in a room.
    pub async fn send_cursor(&self, position: Option<LatLng>, activity: Activity) -> bool {
        if !self.state().await.is_online() {
            return false;
        }
        let (Some(room_id), Some(session)) = (self.room_id().await, self.session().await) else {
            return false;
        };
        if !self.inner.throttle.lock().await.allow() {
            return false;
        }
        let cursor = CursorPayload {
            session_id: session.session_id,
            position,
            activity,
        };
        self.send(&Envelope::cursor(room_id, self.inner.user_id.clone(), cursor))
            .await
    }

    /// Leave the room and tear the connection down.
    ///
    /// Never triggers a reconnect. Once this returns no background task
    /// is left to fire further notifications.
    pub async fn close(&self) {
        self.inner.machine.lock().await.close();

        if let Some(tx) = self.inner.outbound.lock().await.take() {
            if let Some(room_id) = self.inner.room.lock().await.clone() {
                let leave = Envelope::leave(room_id, self.inner.user_id.clone());
                if let Ok(text) = leave.encode() {
                    let _ = tx.try_send(text);
                }
            }
        }

        if let Some(writer) = self.inner.writer.lock().await.take() {
            if tokio::time::timeout(Duration::from_secs(1), writer).await.is_err() {
                log::debug!("Writer did not flush within 1s");
            }
        }
        self.stop_tasks().await;

        self.inner.reconciler.lock().await.set_online(false);
        self.inner.presence.lock().await.clear();
        self.inner.session.lock().await.take();
        self.inner.emit(ClientEvent::StateChanged(ConnectionState::Disconnected));
        log::info!("Connection closed by {}", self.inner.user_id);
    }

    pub async fn state(&self) -> ConnectionState {
        self.inner.state().await
    }

    pub async fn session(&self) -> Option<SessionInfo> {
        self.inner.session.lock().await.clone()
    }

    pub async fn room_id(&self) -> Option<String> {
        self.inner.room.lock().await.clone()
    }

    pub fn user_id(&self) -> &str {
        &self.inner.user_id
    }

    pub fn reconciler(&self) -> Arc<Mutex<StateReconciler>> {
        self.inner.reconciler.clone()
    }

    pub fn presence(&self) -> Arc<Mutex<PresenceTracker>> {
        self.inner.presence.clone()
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        for handle in self.tasks.get_mut().drain(..) {
            handle.abort();
        }
        if let Ok(mut writer) = self.inner.writer.try_lock() {
            if let Some(handle) = writer.take() {
                handle.abort();
            }
        }
    }
}
