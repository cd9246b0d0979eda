//! Room-scoped membership, canonical state and fan-out.
//!
//! Every room owns one `Mutex` around its members and its feature and
//! annotation maps, so a merge and the broadcast that follows it are
//! strictly ordered against every other operation on that room. Rooms
//! never share mutable state; different rooms proceed concurrently.
//!
//! Deliveries use `try_send` into each member's bounded outbound queue.
//! A full or closed queue means the delivery is dropped and counted; the
//! member catches up from `sync` on its next join.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::{Mutex, RwLock};

use crate::config::ServerConfig;
use crate::model::{Annotation, EntityStore, Feature, MergeOutcome, SessionInfo, Version};
use crate::protocol::{Envelope, Payload, ProtocolError, SyncPayload};

/// One encoded envelope, shared by every recipient of a fan-out.
pub type Frame = Arc<str>;

/// Statistics for monitoring broadcast health.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BroadcastStats {
    pub messages_sent: u64,
    pub messages_dropped: u64,
    pub active_rooms: usize,
    pub active_members: usize,
}

/// Lock-free counters updated on the fan-out path.
#[derive(Default)]
struct AtomicBroadcastStats {
    messages_sent: AtomicU64,
    messages_dropped: AtomicU64,
}

/// Result of a successful join.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinAck {
    pub room_id: String,
    /// Members after the join, including the joiner.
    pub members: usize,
}

/// What [`RoomBroker::route`] did with an envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteOutcome {
    /// Merged (if a change) and fanned out to `delivered` peers.
    Routed { delivered: usize },
    /// A change that lost the merge; nothing was broadcast.
    Rejected(MergeOutcome),
    /// Not a routable type.
    Ignored,
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum BrokerError {
    #[error("room {room_id} is full ({max} members)")]
    Capacity { room_id: String, max: usize },
    #[error("session {session_id} has not joined room {room_id}")]
    NotJoined { session_id: String, room_id: String },
    #[error("session {0} is held by another connection")]
    SessionInUse(String),
    #[error("room {0} not found")]
    RoomNotFound(String),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

struct Member {
    session: SessionInfo,
    tx: mpsc::Sender<Frame>,
}

struct RoomState {
    members: HashMap<String, Member>,
    features: EntityStore<Feature>,
    annotations: EntityStore<Annotation>,
    pinned: bool,
    /// Set once the room has been removed from the registry.
    retired: bool,
    /// Bumped every time the room empties; a pending collection only
    /// fires if the epoch it captured is still current.
    epoch: u64,
}

impl RoomState {
    fn new() -> Self {
        Self {
            members: HashMap::new(),
            features: EntityStore::new(),
            annotations: EntityStore::new(),
            pinned: false,
            retired: false,
            epoch: 0,
        }
    }

    fn sync_payload(&self) -> SyncPayload {
        let mut members: Vec<SessionInfo> =
            self.members.values().map(|m| m.session.clone()).collect();
        members.sort_by(|a, b| a.session_id.cmp(&b.session_id));
        SyncPayload {
            features: self.features.to_map(),
            annotations: self.annotations.to_map(),
            deleted_features: self.features.tombstones(),
            deleted_annotations: self.annotations.tombstones(),
            members,
        }
    }

    fn fan_out(&self, frame: &Frame, exclude: Option<&str>, stats: &AtomicBroadcastStats) -> usize {
        let mut delivered = 0;
        for (session_id, member) in &self.members {
            if exclude == Some(session_id.as_str()) {
                continue;
            }
            if deliver(member, frame, stats) {
                delivered += 1;
            }
        }
        delivered
    }
}

fn deliver(member: &Member, frame: &Frame, stats: &AtomicBroadcastStats) -> bool {
    match member.tx.try_send(frame.clone()) {
        Ok(()) => {
            stats.messages_sent.fetch_add(1, Ordering::Relaxed);
            true
        }
        Err(TrySendError::Full(_)) | Err(TrySendError::Closed(_)) => {
            log::debug!("Dropped delivery to {}", member.session.session_id);
            stats.messages_dropped.fetch_add(1, Ordering::Relaxed);
            false
        }
    }
}

fn encode(envelope: &Envelope) -> Result<Frame, BrokerError> {
    Ok(Arc::from(envelope.encode()?))
}

struct Room {
    state: Mutex<RoomState>,
}

/// Maps room ids to rooms and sessions to the room they joined.
#[derive(Clone)]
pub struct RoomBroker {
    rooms: Arc<RwLock<HashMap<String, Arc<Room>>>>,
    sessions: Arc<RwLock<HashMap<String, String>>>,
    max_members: Option<usize>,
    grace_period: Duration,
    stats: Arc<AtomicBroadcastStats>,
}

impl RoomBroker {
    pub fn new(max_members: Option<usize>, grace_period: Duration) -> Self {
        Self {
            rooms: Arc::new(RwLock::new(HashMap::new())),
            sessions: Arc::new(RwLock::new(HashMap::new())),
            max_members,
            grace_period,
            stats: Arc::new(AtomicBroadcastStats::default()),
        }
    }

    pub fn from_config(config: &ServerConfig) -> Self {
        Self::new(config.max_members_per_room, config.room_grace_period())
    }

    async fn get_or_create(&self, room_id: &str) -> Arc<Room> {
        // Fast path: read lock
        {
            let rooms = self.rooms.read().await;
            if let Some(room) = rooms.get(room_id) {
                return room.clone();
            }
        }

        let mut rooms = self.rooms.write().await;
        if let Some(room) = rooms.get(room_id) {
            return room.clone();
        }

        log::info!("Created room {room_id}");
        let room = Arc::new(Room {
            state: Mutex::new(RoomState::new()),
        });
        rooms.insert(room_id.to_string(), room.clone());
        room
    }

    async fn room(&self, room_id: &str) -> Option<Arc<Room>> {
        self.rooms.read().await.get(room_id).cloned()
    }

    /// Room the session is currently joined to.
    pub async fn room_of(&self, session_id: &str) -> Option<String> {
        self.sessions.read().await.get(session_id).cloned()
    }

    /// Whether `session_id`, joined to `room_id`, is delivered through `tx`.
    async fn held_by(&self, room_id: &str, session_id: &str, tx: &mpsc::Sender<Frame>) -> bool {
        let Some(room) = self.room(room_id).await else {
            return true;
        };
        let state = room.state.lock().await;
        state
            .members
            .get(session_id)
            .map_or(true, |member| member.tx.same_channel(tx))
    }

    /// Add `session` to `room_id`, send it a `sync` and announce it.
    ///
    /// Joining a different room leaves the current one first. Rejoining
    /// the same room resends `sync`. A session id is owned by the queue
    /// that joined with it; a join through any other queue is refused
    /// until the owner leaves.
    pub async fn join(
        &self,
        session: SessionInfo,
        room_id: &str,
        tx: mpsc::Sender<Frame>,
    ) -> Result<JoinAck, BrokerError> {
        if let Some(current) = self.room_of(&session.session_id).await {
            if !self.held_by(&current, &session.session_id, &tx).await {
                log::warn!("Refused {} in {room_id}: session in use", session.session_id);
                return Err(BrokerError::SessionInUse(session.session_id));
            }
            if current != room_id {
                self.leave(&session.session_id).await;
            }
        }

        let ack = loop {
            let room = self.get_or_create(room_id).await;
            let mut state = room.state.lock().await;
            if state.retired {
                // Collected between lookup and lock; the next lookup creates a fresh room.
                continue;
            }

            let rejoin = match state.members.get(&session.session_id) {
                Some(member) if !member.tx.same_channel(&tx) => {
                    return Err(BrokerError::SessionInUse(session.session_id));
                }
                Some(_) => true,
                None => false,
            };
            if let Some(max) = self.max_members {
                if !rejoin && state.members.len() >= max {
                    log::warn!("Refused {} in {room_id}: room full", session.session_id);
                    if state.members.is_empty() {
                        self.arm_collection(room_id, &mut state);
                    }
                    return Err(BrokerError::Capacity {
                        room_id: room_id.to_string(),
                        max,
                    });
                }
            }

            let member = Member {
                session: session.clone(),
                tx,
            };
            state.members.insert(session.session_id.clone(), member);

            let sync = encode(&Envelope::sync(room_id, state.sync_payload()))?;
            if let Some(member) = state.members.get(&session.session_id) {
                deliver(member, &sync, &self.stats);
            }
            if !rejoin {
                let joined = encode(&Envelope::presence_joined(room_id, &session))?;
                state.fan_out(&joined, Some(&session.session_id), &self.stats);
            }

            break JoinAck {
                room_id: room_id.to_string(),
                members: state.members.len(),
            };
        };

        self.sessions
            .write()
            .await
            .insert(session.session_id.clone(), room_id.to_string());
        log::info!(
            "{} ({}) joined {room_id}, {} members",
            session.session_id,
            session.display_name,
            ack.members
        );
        Ok(ack)
    }

    /// Remove a session from its room and announce it.
    ///
    /// Returns the room left, or `None` if the session was not joined.
    pub async fn leave(&self, session_id: &str) -> Option<String> {
        let room_id = self.sessions.write().await.remove(session_id)?;
        let room = self.room(&room_id).await?;
        let mut state = room.state.lock().await;

        let member = state.members.remove(session_id)?;
        match encode(&Envelope::presence_left(&room_id, &member.session)) {
            Ok(frame) => {
                state.fan_out(&frame, None, &self.stats);
            }
            Err(e) => log::error!("Failed to encode presence_left: {e}"),
        }
        log::info!(
            "{session_id} left {room_id}, {} members",
            state.members.len()
        );

        if state.members.is_empty() && !state.pinned {
            self.arm_collection(&room_id, &mut state);
        }
        Some(room_id)
    }

    /// Schedule deletion of an empty room after the grace period.
    fn arm_collection(&self, room_id: &str, state: &mut RoomState) {
        state.epoch += 1;
        let epoch = state.epoch;
        let broker = self.clone();
        let room_id = room_id.to_string();
        log::debug!("Room {room_id} empty, collecting in {:?}", self.grace_period);

        tokio::spawn(async move {
            tokio::time::sleep(broker.grace_period).await;
            broker.collect(&room_id, epoch).await;
        });
    }

    async fn collect(&self, room_id: &str, epoch: u64) -> bool {
        let mut rooms = self.rooms.write().await;
        let Some(room) = rooms.get(room_id).cloned() else {
            return false;
        };
        let mut state = room.state.lock().await;
        if state.epoch != epoch || !state.members.is_empty() || state.pinned {
            return false;
        }
        state.retired = true;
        rooms.remove(room_id);
        log::info!("Deleted room {room_id} after grace period");
        true
    }

    /// Deliver `envelope` to every member of `room_id` except `exclude`.
    pub async fn broadcast(
        &self,
        room_id: &str,
        envelope: &Envelope,
        exclude: Option<&str>,
    ) -> Result<usize, BrokerError> {
        let room = self
            .room(room_id)
            .await
            .ok_or_else(|| BrokerError::RoomNotFound(room_id.to_string()))?;
        let frame = encode(envelope)?;
        let state = room.state.lock().await;
        Ok(state.fan_out(&frame, exclude, &self.stats))
    }

    /// Merge a change into the sender's room, then fan it out to the others.
    ///
    /// Only changes that win the merge are broadcast. Cursor updates are
    /// relayed as-is.
    pub async fn route(&self, session_id: &str, envelope: &Envelope) -> Result<RouteOutcome, BrokerError> {
        let not_joined = || BrokerError::NotJoined {
            session_id: session_id.to_string(),
            room_id: envelope.room_id.clone(),
        };
        match self.room_of(session_id).await {
            Some(room_id) if room_id == envelope.room_id => {}
            _ => return Err(not_joined()),
        }
        let room = self.room(&envelope.room_id).await.ok_or_else(not_joined)?;
        let mut state = room.state.lock().await;

        let merged = match &envelope.payload {
            Payload::FeatureCreate(f) | Payload::FeatureUpdate(f) => state.features.upsert(f.clone()),
            Payload::AnnotationCreate(a) | Payload::AnnotationUpdate(a) => {
                state.annotations.upsert(a.clone())
            }
            Payload::FeatureDelete(d) => state
                .features
                .remove(&d.id, Version::new(d.updated_at, envelope.user_id.clone())),
            Payload::AnnotationDelete(d) => state
                .annotations
                .remove(&d.id, Version::new(d.updated_at, envelope.user_id.clone())),
            Payload::Cursor(_) => MergeOutcome::Unchanged,
            _ => return Ok(RouteOutcome::Ignored),
        };

        if envelope.is_change() && !merged.accepted() {
            log::debug!(
                "Dropped {} for {:?} in {}: {merged:?}",
                envelope.kind(),
                envelope.entity_id(),
                envelope.room_id
            );
            return Ok(RouteOutcome::Rejected(merged));
        }

        let frame = encode(envelope)?;
        let delivered = state.fan_out(&frame, Some(session_id), &self.stats);
        Ok(RouteOutcome::Routed { delivered })
    }

    /// Create a room that survives being empty until [`unpin_room`](Self::unpin_room).
    pub async fn create_room(&self, room_id: &str) {
        loop {
            let room = self.get_or_create(room_id).await;
            let mut state = room.state.lock().await;
            if !state.retired {
                state.pinned = true;
                return;
            }
        }
    }

    pub async fn unpin_room(&self, room_id: &str) -> Result<(), BrokerError> {
        let room = self
            .room(room_id)
            .await
            .ok_or_else(|| BrokerError::RoomNotFound(room_id.to_string()))?;
        let mut state = room.state.lock().await;
        state.pinned = false;
        if state.members.is_empty() {
            self.arm_collection(room_id, &mut state);
        }
        Ok(())
    }

    pub async fn room_exists(&self, room_id: &str) -> bool {
        self.rooms.read().await.contains_key(room_id)
    }

    pub async fn room_count(&self) -> usize {
        self.rooms.read().await.len()
    }

    pub async fn active_rooms(&self) -> Vec<String> {
        self.rooms.read().await.keys().cloned().collect()
    }

    /// Current members of a room, ordered by session id.
    pub async fn members(&self, room_id: &str) -> Vec<SessionInfo> {
        match self.room(room_id).await {
            Some(room) => room.state.lock().await.sync_payload().members,
            None => Vec::new(),
        }
    }

    /// Canonical state of a room, as a joiner would receive it.
    pub async fn snapshot(&self, room_id: &str) -> Option<SyncPayload> {
        let room = self.room(room_id).await?;
        let state = room.state.lock().await;
        Some(state.sync_payload())
    }

    pub async fn stats(&self) -> BroadcastStats {
        let rooms: Vec<Arc<Room>> = self.rooms.read().await.values().cloned().collect();
        let mut active_members = 0;
        for room in &rooms {
            active_members += room.state.lock().await.members.len();
        }
        BroadcastStats {
            messages_sent: self.stats.messages_sent.load(Ordering::Relaxed),
            messages_dropped: self.stats.messages_dropped.load(Ordering::Relaxed),
            active_rooms: rooms.len(),
            active_members,
        }
    }
}
