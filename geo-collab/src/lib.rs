//! # geo-collab: Real-time collaboration layer for shared map rooms
//!
//! Sessions editing the same map room exchange cursors, drawn features
//! and annotations over a persistent WebSocket, survive disconnects, and
//! converge on one state without re-applying their own edits.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────────┐     WebSocket      ┌───────────────────┐
//! │ ConnectionManager │ ◄────────────────► │ CollabServer      │
//! │ (per session)     │    JSON envelopes  │ (central)         │
//! └────────┬──────────┘                    └────────┬──────────┘
//!          │                                        │
//!    ┌─────┴──────────────┐                 ┌───────┴───────┐
//!    ▼                    ▼                 │ RoomBroker    │
//! ┌─────────────────┐ ┌─────────────────┐   │ (per-room LWW │
//! │ StateReconciler │ │ PresenceTracker │   │  + fan-out)   │
//! └────────┬────────┘ └────────┬────────┘   └───────────────┘
//!          └────────┬──────────┘
//!                   ▼
//!           CollabObserver (map surface)
//! ```
//!
//! ## Modules
//!
//! - [`protocol`]: JSON wire envelope, validated once into a closed [`Payload`] enum
//! - [`model`]: features, annotations, sessions and the last-writer-wins store
//! - [`reconnect`]: reconnection state machine with capped exponential backoff
//! - [`client`]: connection manager: handshake, heartbeats, reconnect, dispatch
//! - [`broadcast`]: room broker: membership, canonical state, fan-out
//! - [`server`]: WebSocket server
//! - [`reconciler`]: echo suppression and local merge
//! - [`presence`]: cursor/activity tracking with staleness eviction
//! - [`observer`]: rendering-agnostic notification interface
//! - [`config`]: TOML configuration

pub mod protocol;
pub mod model;
pub mod reconnect;
pub mod config;
pub mod observer;
pub mod broadcast;
pub mod server;
pub mod client;
pub mod reconciler;
pub mod presence;

// Re-exports for convenience
pub use protocol::{
    change_id, Activity, CursorPayload, DeletePayload, Envelope, ErrorCode, ErrorPayload,
    MessageType, Payload, ProtocolError, SyncPayload,
};
pub use model::{
    identity_color, Annotation, AnnotationType, EntityStore, Feature, GeometryType, LatLng,
    MergeOutcome, SessionInfo, Version, Versioned,
};
pub use reconnect::{BackoffPolicy, ConnectionState, ReconnectMachine, Transition};
pub use config::{
    ClientConfig, CollabConfig, ConfigError, PresenceConfig, ReconnectConfig, ServerConfig,
};
pub use observer::{CollabObserver, CursorChange, EntityChange, NoopObserver, PresenceEvent};
pub use broadcast::{BroadcastStats, BrokerError, Frame, JoinAck, RoomBroker, RouteOutcome};
pub use server::{CollabServer, ServerError, ServerStats};
pub use client::{ClientEvent, ConnectionManager, TransportError};
pub use reconciler::{ApplyOutcome, LocalChange, StateReconciler};
pub use presence::{CursorThrottle, PresenceEntry, PresenceTracker, RemoteCursor, SweepReport};
