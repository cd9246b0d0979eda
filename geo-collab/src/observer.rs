//! Narrow, rendering-agnostic notification interface.
//!
//! Any map surface subscribes by implementing [`CollabObserver`]; the
//! collaboration core never knows which rendering backend is listening.
//! All methods default to no-ops so observers implement only what they draw.

use crate::model::{Annotation, Feature, LatLng, SessionInfo};
use crate::protocol::Activity;

/// Change to a feature or annotation as seen by the local replica.
#[derive(Debug, Clone, PartialEq)]
pub enum EntityChange<T> {
    Added(T),
    Updated(T),
    Removed { id: String },
}

/// Remote cursor moved, or expired (`position == None`).
#[derive(Debug, Clone, PartialEq)]
pub struct CursorChange {
    pub session_id: String,
    pub user_id: String,
    pub position: Option<LatLng>,
    pub activity: Activity,
}

#[derive(Debug, Clone, PartialEq)]
pub enum PresenceEvent {
    Joined(SessionInfo),
    Left { session_id: String },
    /// Evicted by the staleness sweep.
    Expired { session_id: String },
}

pub trait CollabObserver: Send + Sync {
    fn on_feature_changed(&self, _change: &EntityChange<Feature>) {}
    fn on_annotation_changed(&self, _change: &EntityChange<Annotation>) {}
    fn on_cursor_changed(&self, _change: &CursorChange) {}
    fn on_presence_changed(&self, _event: &PresenceEvent) {}
}

/// Observer that ignores everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopObserver;

impl CollabObserver for NoopObserver {}
