//! Shared map entities and the last-writer-wins entity store.
//!
//! Both the room broker (canonical room state) and the client-side
//! reconciler (local replica) hold their features and annotations in an
//! [`EntityStore`], so the merge rule is written exactly once.
//!
//! ## Merge rule
//!
//! ```text
//! incoming.version  >  current.version   → incoming wins
//! incoming.version  <  current.version   → stale, dropped
//! incoming.version  == current.version   → identical: no-op
//!                                          differing: greater canonical JSON wins
//! ```
//!
//! A [`Version`] orders on `(updated_at, writer)`: the logical timestamp
//! first, then the writer id lexically. Deletions leave a tombstone that
//! wins exact ties against upserts, so a late stale update can never
//! resurrect a deleted entity.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap};
use uuid::Uuid;

/// Open key/value mapping carried by features and annotations.
pub type Properties = BTreeMap<String, Value>;

/// Geographic position.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LatLng {
    pub lat: f64,
    pub lng: f64,
}

impl LatLng {
    pub fn new(lat: f64, lng: f64) -> Self {
        Self { lat, lng }
    }

    /// Finite and inside the WGS84 range.
    pub fn is_valid(&self) -> bool {
        self.lat.is_finite()
            && self.lng.is_finite()
            && (-90.0..=90.0).contains(&self.lat)
            && (-180.0..=180.0).contains(&self.lng)
    }
}

/// Kind of drawn geometry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GeometryType {
    Point,
    Line,
    Polygon,
    Rectangle,
    Circle,
}

impl GeometryType {
    /// Accepted number of coordinate pairs as `(min, max)`.
    ///
    /// Rectangles are two opposite corners; circles carry their center
    /// (radius lives in `properties`).
    pub fn coordinate_bounds(&self) -> (usize, Option<usize>) {
        match self {
            GeometryType::Point => (1, Some(1)),
            GeometryType::Line => (2, None),
            GeometryType::Polygon => (3, None),
            GeometryType::Rectangle => (2, Some(2)),
            GeometryType::Circle => (1, Some(1)),
        }
    }
}

/// A drawn geometry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Feature {
    pub id: String,
    pub geometry_type: GeometryType,
    /// `[lng, lat]` pairs, GeoJSON order.
    pub coordinates: Vec<[f64; 2]>,
    /// Writer of this version; the tie-break key for equal `updated_at`.
    pub owner_id: String,
    #[serde(default)]
    pub properties: Properties,
    /// Logical timestamp, never wall clock.
    pub updated_at: u64,
}

impl Feature {
    pub fn new(
        id: impl Into<String>,
        geometry_type: GeometryType,
        coordinates: Vec<[f64; 2]>,
        owner_id: impl Into<String>,
        updated_at: u64,
    ) -> Self {
        Self {
            id: id.into(),
            geometry_type,
            coordinates,
            owner_id: owner_id.into(),
            properties: Properties::new(),
            updated_at,
        }
    }

    /// Shape check performed once at the wire boundary.
    pub fn validate(&self) -> Result<(), String> {
        if self.id.is_empty() {
            return Err("feature id is empty".into());
        }
        let (min, max) = self.geometry_type.coordinate_bounds();
        let n = self.coordinates.len();
        if n < min || max.is_some_and(|m| n > m) {
            return Err(format!(
                "{:?} expects {}{} coordinate pairs, got {n}",
                self.geometry_type,
                min,
                match max {
                    Some(m) if m == min => String::new(),
                    Some(m) => format!("..={m}"),
                    None => "+".into(),
                }
            ));
        }
        if self
            .coordinates
            .iter()
            .any(|[lng, lat]| !lng.is_finite() || !lat.is_finite())
        {
            return Err("coordinates must be finite".into());
        }
        Ok(())
    }
}

/// Annotation content kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AnnotationType {
    Marker,
    Text,
    Measurement,
    Image,
}

/// User-authored content pinned at a geographic position.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Annotation {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: AnnotationType,
    pub position: LatLng,
    #[serde(default)]
    pub content: String,
    pub created_by: String,
    pub created_at: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_by: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<u64>,
    #[serde(default)]
    pub styling: Properties,
}

impl Annotation {
    pub fn new(
        id: impl Into<String>,
        kind: AnnotationType,
        position: LatLng,
        content: impl Into<String>,
        created_by: impl Into<String>,
        created_at: u64,
    ) -> Self {
        Self {
            id: id.into(),
            kind,
            position,
            content: content.into(),
            created_by: created_by.into(),
            created_at,
            updated_by: None,
            updated_at: None,
            styling: Properties::new(),
        }
    }

    /// Stamp an edit by `writer` at logical time `at`.
    pub fn touch(&mut self, writer: impl Into<String>, at: u64) {
        self.updated_by = Some(writer.into());
        self.updated_at = Some(at);
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.id.is_empty() {
            return Err("annotation id is empty".into());
        }
        if !self.position.is_valid() {
            return Err(format!(
                "position out of range: {}, {}",
                self.position.lat, self.position.lng
            ));
        }
        Ok(())
    }
}

/// One participant's live connection identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionInfo {
    pub session_id: String,
    pub user_id: String,
    pub display_name: String,
    /// `#rrggbb`, stable per user id.
    pub color: String,
}

impl SessionInfo {
    /// Fresh session for `user_id` with a newly generated session id.
    pub fn new(user_id: impl Into<String>, display_name: impl Into<String>) -> Self {
        Self::with_id(Uuid::new_v4().to_string(), user_id, display_name)
    }

    /// Create with an explicit session id (for testing).
    pub fn with_id(
        session_id: impl Into<String>,
        user_id: impl Into<String>,
        display_name: impl Into<String>,
    ) -> Self {
        let user_id = user_id.into();
        Self {
            session_id: session_id.into(),
            color: identity_color(&user_id),
            user_id,
            display_name: display_name.into(),
        }
    }
}

/// Derive a stable `#rrggbb` color from a user id.
///
/// The hue comes from a SHA-256 digest so the same user gets the same
/// color in every session and every process.
pub fn identity_color(user_id: &str) -> String {
    let digest = Sha256::digest(user_id.as_bytes());
    let seed = u16::from_be_bytes([digest[0], digest[1]]);
    let hue = (seed % 360) as f32 / 360.0;
    let (r, g, b) = hsl_to_rgb(hue, 0.7, 0.55);
    format!(
        "#{:02x}{:02x}{:02x}",
        (r * 255.0).round() as u8,
        (g * 255.0).round() as u8,
        (b * 255.0).round() as u8
    )
}

fn hsl_to_rgb(h: f32, s: f32, l: f32) -> (f32, f32, f32) {
    if s == 0.0 {
        return (l, l, l);
    }

    let q = if l < 0.5 { l * (1.0 + s) } else { l + s - l * s };
    let p = 2.0 * l - q;

    (
        hue_to_rgb(p, q, h + 1.0 / 3.0),
        hue_to_rgb(p, q, h),
        hue_to_rgb(p, q, h - 1.0 / 3.0),
    )
}

fn hue_to_rgb(p: f32, q: f32, mut t: f32) -> f32 {
    if t < 0.0 {
        t += 1.0;
    }
    if t > 1.0 {
        t -= 1.0;
    }
    if t < 1.0 / 6.0 {
        return p + (q - p) * 6.0 * t;
    }
    if t < 1.0 / 2.0 {
        return q;
    }
    if t < 2.0 / 3.0 {
        return p + (q - p) * (2.0 / 3.0 - t) * 6.0;
    }
    p
}

// ───────────────────────────────────────────────────────────────────
// Last-writer-wins store
// ───────────────────────────────────────────────────────────────────

/// Logical version of an entity write. Orders on `updated_at`, then `writer`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Version {
    pub updated_at: u64,
    pub writer: String,
}

impl Version {
    pub fn new(updated_at: u64, writer: impl Into<String>) -> Self {
        Self {
            updated_at,
            writer: writer.into(),
        }
    }
}

/// An entity that participates in last-writer-wins merging.
pub trait Versioned: Clone + PartialEq + Serialize {
    fn id(&self) -> &str;
    fn version(&self) -> Version;
}

impl Versioned for Feature {
    fn id(&self) -> &str {
        &self.id
    }

    fn version(&self) -> Version {
        Version::new(self.updated_at, self.owner_id.clone())
    }
}

impl Versioned for Annotation {
    fn id(&self) -> &str {
        &self.id
    }

    fn version(&self) -> Version {
        Version::new(
            self.updated_at.unwrap_or(self.created_at),
            self.updated_by.clone().unwrap_or_else(|| self.created_by.clone()),
        )
    }
}

/// Result of merging one write into an [`EntityStore`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeOutcome {
    /// A new live entity appeared.
    Inserted,
    /// A live entity was replaced by a newer version.
    Updated,
    /// A live entity was deleted.
    Removed,
    /// A delete advanced the tombstone of an entity that was not live.
    Tombstoned,
    /// The exact same write was already applied.
    Unchanged,
    /// The write lost against a newer version and was dropped.
    Stale,
}

impl MergeOutcome {
    /// Whether the write advanced stored state.
    pub fn accepted(&self) -> bool {
        matches!(
            self,
            MergeOutcome::Inserted
                | MergeOutcome::Updated
                | MergeOutcome::Removed
                | MergeOutcome::Tombstoned
        )
    }
}

#[derive(Debug, Clone)]
enum Slot<T> {
    Live(T),
    Deleted(Version),
}

/// Id-keyed entity map with deterministic last-writer-wins merging.
///
/// Every operation is a pure function of the stored slot and the
/// incoming write, so applying the same write twice is a no-op and the
/// final state does not depend on arrival order.
#[derive(Debug, Clone)]
pub struct EntityStore<T> {
    slots: HashMap<String, Slot<T>>,
}

impl<T> Default for EntityStore<T> {
    fn default() -> Self {
        Self {
            slots: HashMap::new(),
        }
    }
}

impl<T: Versioned> EntityStore<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Merge a create or update.
    pub fn upsert(&mut self, incoming: T) -> MergeOutcome {
        let id = incoming.id().to_string();
        let outcome = match self.slots.get(&id) {
            None => MergeOutcome::Inserted,
            Some(Slot::Deleted(tombstone)) => {
                if incoming.version() > *tombstone {
                    MergeOutcome::Inserted
                } else {
                    MergeOutcome::Stale
                }
            }
            Some(Slot::Live(current)) => {
                match incoming.version().cmp(&current.version()) {
                    std::cmp::Ordering::Greater => MergeOutcome::Updated,
                    std::cmp::Ordering::Less => MergeOutcome::Stale,
                    std::cmp::Ordering::Equal if incoming == *current => MergeOutcome::Unchanged,
                    std::cmp::Ordering::Equal => {
                        if canonical_bytes(&incoming) > canonical_bytes(current) {
                            MergeOutcome::Updated
                        } else {
                            MergeOutcome::Stale
                        }
                    }
                }
            }
        };

        if outcome.accepted() {
            self.slots.insert(id, Slot::Live(incoming));
        }
        outcome
    }

    /// Merge a delete stamped with `version`. Exact ties go to the delete.
    pub fn remove(&mut self, id: &str, version: Version) -> MergeOutcome {
        let outcome = match self.slots.get(id) {
            None => MergeOutcome::Tombstoned,
            Some(Slot::Live(current)) => {
                if version >= current.version() {
                    MergeOutcome::Removed
                } else {
                    MergeOutcome::Stale
                }
            }
            Some(Slot::Deleted(tombstone)) => match version.cmp(tombstone) {
                std::cmp::Ordering::Greater => MergeOutcome::Tombstoned,
                std::cmp::Ordering::Equal => MergeOutcome::Unchanged,
                std::cmp::Ordering::Less => MergeOutcome::Stale,
            },
        };

        if outcome.accepted() {
            self.slots.insert(id.to_string(), Slot::Deleted(version));
        }
        outcome
    }

    /// Live entity by id.
    pub fn get(&self, id: &str) -> Option<&T> {
        match self.slots.get(id) {
            Some(Slot::Live(entity)) => Some(entity),
            _ => None,
        }
    }

    pub fn contains(&self, id: &str) -> bool {
        self.get(id).is_some()
    }

    /// Iterate live entities.
    pub fn live(&self) -> impl Iterator<Item = &T> {
        self.slots.values().filter_map(|slot| match slot {
            Slot::Live(entity) => Some(entity),
            Slot::Deleted(_) => None,
        })
    }

    /// Number of live entities.
    pub fn len(&self) -> usize {
        self.live().count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Live entities keyed by id.
    pub fn to_map(&self) -> BTreeMap<String, T> {
        self.live()
            .map(|entity| (entity.id().to_string(), entity.clone()))
            .collect()
    }

    /// Tombstone versions keyed by id.
    pub fn tombstones(&self) -> BTreeMap<String, Version> {
        self.slots
            .iter()
            .filter_map(|(id, slot)| match slot {
                Slot::Deleted(version) => Some((id.clone(), version.clone())),
                Slot::Live(_) => None,
            })
            .collect()
    }

    pub fn clear(&mut self) {
        self.slots.clear();
    }
}

/// Deterministic byte form used to break exact version ties.
fn canonical_bytes<T: Serialize>(entity: &T) -> Vec<u8> {
    serde_json::to_vec(entity).unwrap_or_default()
}
