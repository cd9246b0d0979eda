//! Client-side state reconciliation with echo suppression.
//!
//! ```text
//! local edit ──► prepare_local() ──► pending echo set ──► Envelope ──► send
//!                     │
//!                     └──► local store + observer (exactly once)
//!
//! inbound ──► apply_remote()
//!               ├─ changeId in pending set → drop (our own write came back)
//!               └─ otherwise              → LWW merge → observer
//! ```
//!
//! Merging is delegated to [`EntityStore`], so applying the same remote
//! change twice (say once from `sync` and once from a late broadcast)
//! leaves state identical to applying it once. A `sync` replaces the
//! replica outright: it is the room's word on what exists.

use std::collections::{BTreeMap, HashSet, VecDeque};
use std::sync::Arc;

use crate::model::{Annotation, EntityStore, Feature, MergeOutcome, Version, Versioned};
use crate::observer::{CollabObserver, EntityChange};
use crate::protocol::{change_id, DeletePayload, Envelope, MessageType, Payload, SyncPayload};

/// A change produced by the local application.
///
/// A zero (or not newer than current) logical timestamp is replaced with
/// the next value of the reconciler's clock.
#[derive(Debug, Clone, PartialEq)]
pub enum LocalChange {
    CreateFeature(Feature),
    UpdateFeature(Feature),
    DeleteFeature { id: String },
    CreateAnnotation(Annotation),
    UpdateAnnotation(Annotation),
    DeleteAnnotation { id: String },
}

/// Result of handing one inbound envelope to the reconciler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// The envelope confirmed one of our own writes and was discarded.
    EchoSuppressed,
    /// A remote change went through the LWW merge.
    Merged(MergeOutcome),
    /// A full-state catch-up was merged.
    Synced { features: usize, annotations: usize },
    /// Not a state-bearing envelope.
    Ignored,
}

/// Insertion-ordered set of change ids awaiting their echo.
///
/// Bounded because the broker normally excludes the sender, so most
/// entries are never confirmed; the oldest is evicted first.
#[derive(Debug, Clone)]
struct PendingEchoes {
    order: VecDeque<String>,
    ids: HashSet<String>,
    capacity: usize,
}

impl PendingEchoes {
    fn new(capacity: usize) -> Self {
        Self {
            order: VecDeque::new(),
            ids: HashSet::new(),
            capacity,
        }
    }

    fn insert(&mut self, id: String) {
        if self.ids.insert(id.clone()) {
            self.order.push_back(id);
        }
        while self.order.len() > self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.ids.remove(&oldest);
            }
        }
    }

    fn take(&mut self, id: &str) -> bool {
        if self.ids.remove(id) {
            self.order.retain(|pending| pending != id);
            true
        } else {
            false
        }
    }

    fn len(&self) -> usize {
        self.ids.len()
    }

    fn clear(&mut self) {
        self.order.clear();
        self.ids.clear();
    }
}

/// Local replica of one room's features and annotations.
pub struct StateReconciler {
    session_id: String,
    user_id: String,
    features: EntityStore<Feature>,
    annotations: EntityStore<Annotation>,
    pending: PendingEchoes,
    /// Lamport clock over `updatedAt` values.
    clock: u64,
    online: bool,
    /// Local changes prepared after our `join` went out; the next `sync` predates them.
    in_flight: Option<Vec<Envelope>>,
    observer: Arc<dyn CollabObserver>,
}

impl StateReconciler {
    pub const DEFAULT_MAX_PENDING: usize = 1024;

    pub fn new(
        session_id: impl Into<String>,
        user_id: impl Into<String>,
        observer: Arc<dyn CollabObserver>,
    ) -> Self {
        Self::with_max_pending(session_id, user_id, observer, Self::DEFAULT_MAX_PENDING)
    }

    pub fn with_max_pending(
        session_id: impl Into<String>,
        user_id: impl Into<String>,
        observer: Arc<dyn CollabObserver>,
        max_pending: usize,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            user_id: user_id.into(),
            features: EntityStore::new(),
            annotations: EntityStore::new(),
            pending: PendingEchoes::new(max_pending),
            clock: 0,
            online: false,
            in_flight: None,
            observer,
        }
    }

    /// Switch to a new session after a reconnect. State is kept.
    pub fn set_session(&mut self, session_id: impl Into<String>) {
        self.session_id = session_id.into();
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    /// Advance the logical clock and return the new value.
    pub fn next_timestamp(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }

    pub fn clock(&self) -> u64 {
        self.clock
    }

    fn observe(&mut self, at: u64) {
        self.clock = self.clock.max(at);
    }

    /// Use `requested` if it is newer than `floor`, otherwise tick the clock.
    fn stamp(&mut self, requested: u64, floor: Option<u64>) -> u64 {
        if requested == 0 || floor.is_some_and(|f| requested <= f) {
            self.next_timestamp()
        } else {
            self.observe(requested);
            requested
        }
    }

    /// "You are now offline/online" signal from the connection layer.
    pub fn set_online(&mut self, online: bool) {
        if self.online != online {
            log::debug!("Reconciler for {} is now {}", self.session_id, if online { "online" } else { "offline" });
        }
        self.online = online;
        if !online {
            self.in_flight = None;
        }
    }

    pub fn is_online(&self) -> bool {
        self.online
    }

    /// Apply a local change, record its echo id and build the envelope to send.
    pub fn prepare_local(&mut self, room_id: &str, change: LocalChange) -> Envelope {
        match change {
            LocalChange::CreateFeature(feature) => {
                self.local_feature(room_id, MessageType::FeatureCreate, feature)
            }
            LocalChange::UpdateFeature(feature) => {
                self.local_feature(room_id, MessageType::FeatureUpdate, feature)
            }
            LocalChange::CreateAnnotation(annotation) => {
                self.local_annotation(room_id, MessageType::AnnotationCreate, annotation)
            }
            LocalChange::UpdateAnnotation(annotation) => {
                self.local_annotation(room_id, MessageType::AnnotationUpdate, annotation)
            }
            LocalChange::DeleteFeature { id } => {
                let version = Version::new(self.next_timestamp(), self.user_id.clone());
                if self.features.remove(&id, version.clone()) == MergeOutcome::Removed {
                    self.observer
                        .on_feature_changed(&EntityChange::Removed { id: id.clone() });
                }
                self.local_envelope(
                    room_id,
                    MessageType::FeatureDelete,
                    &id,
                    version.updated_at,
                    Payload::FeatureDelete(DeletePayload {
                        id: id.clone(),
                        updated_at: version.updated_at,
                    }),
                )
            }
            LocalChange::DeleteAnnotation { id } => {
                let version = Version::new(self.next_timestamp(), self.user_id.clone());
                if self.annotations.remove(&id, version.clone()) == MergeOutcome::Removed {
                    self.observer
                        .on_annotation_changed(&EntityChange::Removed { id: id.clone() });
                }
                self.local_envelope(
                    room_id,
                    MessageType::AnnotationDelete,
                    &id,
                    version.updated_at,
                    Payload::AnnotationDelete(DeletePayload {
                        id: id.clone(),
                        updated_at: version.updated_at,
                    }),
                )
            }
        }
    }

    fn local_feature(&mut self, room_id: &str, action: MessageType, mut feature: Feature) -> Envelope {
        let floor = self.features.get(&feature.id).map(|f| f.updated_at);
        feature.updated_at = self.stamp(feature.updated_at, floor);
        if feature.owner_id.is_empty() {
            feature.owner_id = self.user_id.clone();
        }

        let outcome = self.features.upsert(feature.clone());
        if let Some(change) = entity_change(outcome, &feature) {
            self.observer.on_feature_changed(&change);
        }

        let (id, at) = (feature.id.clone(), feature.updated_at);
        let payload = if action == MessageType::FeatureCreate {
            Payload::FeatureCreate(feature)
        } else {
            Payload::FeatureUpdate(feature)
        };
        self.local_envelope(room_id, action, &id, at, payload)
    }

    fn local_annotation(
        &mut self,
        room_id: &str,
        action: MessageType,
        mut annotation: Annotation,
    ) -> Envelope {
        let floor = self
            .annotations
            .get(&annotation.id)
            .map(|a| a.version().updated_at);
        if action == MessageType::AnnotationCreate && floor.is_none() {
            annotation.created_at = self.stamp(annotation.created_at, None);
            if annotation.created_by.is_empty() {
                annotation.created_by = self.user_id.clone();
            }
        } else {
            let at = self.stamp(annotation.updated_at.unwrap_or(0), floor);
            annotation.touch(self.user_id.clone(), at);
        }

        let outcome = self.annotations.upsert(annotation.clone());
        if let Some(change) = entity_change(outcome, &annotation) {
            self.observer.on_annotation_changed(&change);
        }

        let (id, at) = (annotation.id.clone(), annotation.version().updated_at);
        let payload = if action == MessageType::AnnotationCreate {
            Payload::AnnotationCreate(annotation)
        } else {
            Payload::AnnotationUpdate(annotation)
        };
        self.local_envelope(room_id, action, &id, at, payload)
    }

    fn local_envelope(
        &mut self,
        room_id: &str,
        action: MessageType,
        entity_id: &str,
        at: u64,
        payload: Payload,
    ) -> Envelope {
        let cid = change_id(&self.session_id, action, entity_id, at);
        self.pending.insert(cid.clone());
        let envelope = Envelope::change(room_id, self.user_id.clone(), cid, payload);
        if let Some(sent) = self.in_flight.as_mut() {
            sent.push(envelope.clone());
        }
        envelope
    }

    /// Apply one inbound envelope.
    pub fn apply_remote(&mut self, envelope: &Envelope) -> ApplyOutcome {
        if let Some(cid) = envelope.change_id.as_deref() {
            if self.pending.take(cid) {
                log::debug!("Suppressed echo of own change {cid}");
                return ApplyOutcome::EchoSuppressed;
            }
        }

        match &envelope.payload {
            Payload::Sync(state) => self.apply_sync(state),
            _ => self.merge_change(envelope),
        }
    }

    fn merge_change(&mut self, envelope: &Envelope) -> ApplyOutcome {
        match &envelope.payload {
            Payload::FeatureCreate(feature) | Payload::FeatureUpdate(feature) => {
                ApplyOutcome::Merged(self.merge_feature(feature))
            }
            Payload::AnnotationCreate(annotation) | Payload::AnnotationUpdate(annotation) => {
                ApplyOutcome::Merged(self.merge_annotation(annotation))
            }
            Payload::FeatureDelete(delete) => ApplyOutcome::Merged(self.delete_feature(
                &delete.id,
                Version::new(delete.updated_at, envelope.user_id.clone()),
            )),
            Payload::AnnotationDelete(delete) => ApplyOutcome::Merged(self.delete_annotation(
                &delete.id,
                Version::new(delete.updated_at, envelope.user_id.clone()),
            )),
            _ => ApplyOutcome::Ignored,
        }
    }

    /// A `join` is going out; local changes prepared from now on are
    /// replayed over the `sync` that answers it. No-op while offline.
    pub fn await_sync(&mut self) {
        if self.online {
            self.in_flight = Some(Vec::new());
        }
    }

    /// Adopt a full-state catch-up as the replica.
    ///
    /// The room is authoritative on join: local entities it does not know
    /// (offline edits that were never sent, or state of a collected room)
    /// are removed. Only the logical clock and changes prepared after the
    /// `join` survive.
    pub fn apply_sync(&mut self, state: &SyncPayload) -> ApplyOutcome {
        for feature in state.features.values() {
            self.observe(feature.updated_at);
        }
        for annotation in state.annotations.values() {
            self.observe(annotation.version().updated_at);
        }
        for version in state
            .deleted_features
            .values()
            .chain(state.deleted_annotations.values())
        {
            self.observe(version.updated_at);
        }

        for change in replace_store(&mut self.features, &state.features, &state.deleted_features) {
            self.observer.on_feature_changed(&change);
        }
        for change in replace_store(
            &mut self.annotations,
            &state.annotations,
            &state.deleted_annotations,
        ) {
            self.observer.on_annotation_changed(&change);
        }
        for envelope in self.in_flight.take().unwrap_or_default() {
            self.merge_change(&envelope);
        }

        log::debug!(
            "Adopted sync: {} features, {} annotations",
            self.features.len(),
            self.annotations.len()
        );
        ApplyOutcome::Synced {
            features: self.features.len(),
            annotations: self.annotations.len(),
        }
    }

    fn merge_feature(&mut self, feature: &Feature) -> MergeOutcome {
        self.observe(feature.updated_at);
        let outcome = self.features.upsert(feature.clone());
        if let Some(change) = entity_change(outcome, feature) {
            self.observer.on_feature_changed(&change);
        }
        outcome
    }

    fn merge_annotation(&mut self, annotation: &Annotation) -> MergeOutcome {
        self.observe(annotation.version().updated_at);
        let outcome = self.annotations.upsert(annotation.clone());
        if let Some(change) = entity_change(outcome, annotation) {
            self.observer.on_annotation_changed(&change);
        }
        outcome
    }

    fn delete_feature(&mut self, id: &str, version: Version) -> MergeOutcome {
        self.observe(version.updated_at);
        let outcome = self.features.remove(id, version);
        if outcome == MergeOutcome::Removed {
            self.observer
                .on_feature_changed(&EntityChange::Removed { id: id.to_string() });
        }
        outcome
    }

    fn delete_annotation(&mut self, id: &str, version: Version) -> MergeOutcome {
        self.observe(version.updated_at);
        let outcome = self.annotations.remove(id, version);
        if outcome == MergeOutcome::Removed {
            self.observer
                .on_annotation_changed(&EntityChange::Removed { id: id.to_string() });
        }
        outcome
    }

    pub fn feature(&self, id: &str) -> Option<&Feature> {
        self.features.get(id)
    }

    pub fn features(&self) -> impl Iterator<Item = &Feature> {
        self.features.live()
    }

    pub fn annotation(&self, id: &str) -> Option<&Annotation> {
        self.annotations.get(id)
    }

    pub fn annotations(&self) -> impl Iterator<Item = &Annotation> {
        self.annotations.live()
    }

    pub fn pending_echoes(&self) -> usize {
        self.pending.len()
    }

    /// Serializable local snapshot; feed it back through [`apply_sync`](Self::apply_sync).
    pub fn snapshot(&self) -> SyncPayload {
        SyncPayload {
            features: self.features.to_map(),
            annotations: self.annotations.to_map(),
            deleted_features: self.features.tombstones(),
            deleted_annotations: self.annotations.tombstones(),
            members: Vec::new(),
        }
    }

    /// Drop all state, e.g. when switching rooms.
    pub fn reset(&mut self) {
        self.features.clear();
        self.annotations.clear();
        self.pending.clear();
        self.in_flight = None;
    }
}

/// Swap `store` for the state described by `live` and `tombstones`,
/// returning what changed from the observer's point of view.
fn replace_store<T: Versioned>(
    store: &mut EntityStore<T>,
    live: &BTreeMap<String, T>,
    tombstones: &BTreeMap<String, Version>,
) -> Vec<EntityChange<T>> {
    let mut next = EntityStore::new();
    for entity in live.values() {
        next.upsert(entity.clone());
    }
    for (id, version) in tombstones {
        next.remove(id, version.clone());
    }

    let mut changes: Vec<EntityChange<T>> = store
        .to_map()
        .into_keys()
        .filter(|id| !next.contains(id))
        .map(|id| EntityChange::Removed { id })
        .collect();
    for entity in next.to_map().into_values() {
        match store.get(entity.id()) {
            None => changes.push(EntityChange::Added(entity)),
            Some(current) if *current != entity => changes.push(EntityChange::Updated(entity)),
            Some(_) => {}
        }
    }

    *store = next;
    changes
}

fn entity_change<T: Clone>(outcome: MergeOutcome, entity: &T) -> Option<EntityChange<T>> {
    match outcome {
        MergeOutcome::Inserted => Some(EntityChange::Added(entity.clone())),
        MergeOutcome::Updated => Some(EntityChange::Updated(entity.clone())),
        _ => None,
    }
}
