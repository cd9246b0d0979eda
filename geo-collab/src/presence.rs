//! Ephemeral cursor and activity awareness.
//!
//! ## Architecture
//!
//! ```text
//! Local pointer move
//!       │
//!       ▼
//! CursorThrottle::allow()      (≤ 1 per 100ms, excess dropped)
//!       │
//!       ▼   cursor envelope, fanned out by the room broker
//! Remote PresenceTracker::update()
//!       │
//!       ├──► CollabObserver::on_cursor_changed
//!       ▼
//! sweep() every second
//!       ├─ cursor silent > 5s    → cursor hidden
//!       └─ activity silent > 5m  → entry expired
//! ```
//!
//! Nothing here is persisted. Entries are keyed by session id so two tabs
//! of the same user show up as two cursors.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

use crate::config::PresenceConfig;
use crate::model::{LatLng, SessionInfo};
use crate::observer::{CollabObserver, CursorChange, PresenceEvent};
use crate::protocol::Activity;

// ───────────────────────────────────────────────────────────────────
// Remote presence entries
// ───────────────────────────────────────────────────────────────────

/// Presence of one remote session.
#[derive(Debug, Clone)]
pub struct PresenceEntry {
    pub session: SessionInfo,
    /// Last reported pointer position; `None` once hidden or off-map.
    pub cursor: Option<LatLng>,
    pub activity: Activity,
    cursor_seen: Instant,
    last_seen: Instant,
    /// Cursor went stale; inactive until the session reports again.
    stale: bool,
}

impl PresenceEntry {
    fn new(session: SessionInfo, now: Instant) -> Self {
        Self {
            session,
            cursor: None,
            activity: Activity::default(),
            cursor_seen: now,
            last_seen: now,
            stale: false,
        }
    }

    /// Time of the last update of any kind.
    pub fn last_seen(&self) -> Instant {
        self.last_seen
    }

    fn cursor_change(&self) -> CursorChange {
        CursorChange {
            session_id: self.session.session_id.clone(),
            user_id: self.session.user_id.clone(),
            position: self.cursor,
            activity: self.activity,
        }
    }
}

/// A visible remote cursor.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteCursor {
    pub session_id: String,
    pub user_id: String,
    pub display_name: String,
    pub color: String,
    pub position: LatLng,
    pub activity: Activity,
}

/// What one sweep evicted.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Sessions whose cursor went stale and was hidden.
    pub cursors_hidden: Vec<String>,
    /// Sessions removed for inactivity.
    pub expired: Vec<String>,
}

impl SweepReport {
    pub fn is_empty(&self) -> bool {
        self.cursors_hidden.is_empty() && self.expired.is_empty()
    }
}

// ───────────────────────────────────────────────────────────────────
// Tracker
// ───────────────────────────────────────────────────────────────────

/// Tracks remote sessions of the current room.
pub struct PresenceTracker {
    local_session_id: Option<String>,
    entries: HashMap<String, PresenceEntry>,
    cursor_staleness: Duration,
    activity_staleness: Duration,
    observer: Arc<dyn CollabObserver>,
}

impl PresenceTracker {
    pub fn new(observer: Arc<dyn CollabObserver>) -> Self {
        Self::with_config(&PresenceConfig::default(), observer)
    }

    pub fn with_config(config: &PresenceConfig, observer: Arc<dyn CollabObserver>) -> Self {
        Self {
            local_session_id: None,
            entries: HashMap::new(),
            cursor_staleness: config.cursor_staleness(),
            activity_staleness: config.activity_staleness(),
            observer,
        }
    }

    /// Our own session; updates for it are ignored.
    pub fn set_local_session(&mut self, session_id: impl Into<String>) {
        let session_id = session_id.into();
        self.entries.remove(&session_id);
        self.local_session_id = Some(session_id);
    }

    fn is_local(&self, session_id: &str) -> bool {
        self.local_session_id.as_deref() == Some(session_id)
    }

    pub fn member_joined(&mut self, session: SessionInfo) {
        self.member_joined_at(session, Instant::now());
    }

    pub fn member_joined_at(&mut self, session: SessionInfo, now: Instant) {
        if self.is_local(&session.session_id) {
            return;
        }
        match self.entries.get_mut(&session.session_id) {
            Some(entry) => {
                entry.session = session;
                entry.last_seen = now;
            }
            None => {
                log::debug!("Presence: {} joined", session.session_id);
                self.observer
                    .on_presence_changed(&PresenceEvent::Joined(session.clone()));
                self.entries
                    .insert(session.session_id.clone(), PresenceEntry::new(session, now));
            }
        }
    }

    /// Returns `false` if the session was unknown.
    pub fn member_left(&mut self, session_id: &str) -> bool {
        if self.entries.remove(session_id).is_none() {
            return false;
        }
        log::debug!("Presence: {session_id} left");
        self.observer.on_presence_changed(&PresenceEvent::Left {
            session_id: session_id.to_string(),
        });
        true
    }

    /// Replace membership with the authoritative list from a `sync`.
    pub fn sync_members(&mut self, members: &[SessionInfo]) {
        let now = Instant::now();
        let gone: Vec<String> = self
            .entries
            .keys()
            .filter(|id| !members.iter().any(|m| &m.session_id == *id))
            .cloned()
            .collect();
        for session_id in gone {
            self.member_left(&session_id);
        }
        for member in members {
            self.member_joined_at(member.clone(), now);
        }
    }

    /// Overwrite a session's cursor and activity.
    pub fn update(
        &mut self,
        session_id: &str,
        user_id: &str,
        cursor: Option<LatLng>,
        activity: Activity,
    ) {
        self.update_at(session_id, user_id, cursor, activity, Instant::now());
    }

    pub fn update_at(
        &mut self,
        session_id: &str,
        user_id: &str,
        cursor: Option<LatLng>,
        activity: Activity,
        now: Instant,
    ) {
        if self.is_local(session_id) {
            return;
        }

        // A cursor can outrun its presence_joined; track a placeholder.
        if !self.entries.contains_key(session_id) {
            self.member_joined_at(SessionInfo::with_id(session_id, user_id, user_id), now);
        }
        let Some(entry) = self.entries.get_mut(session_id) else {
            return;
        };

        entry.cursor = cursor;
        entry.activity = activity;
        entry.cursor_seen = now;
        entry.last_seen = now;
        entry.stale = false;
        self.observer.on_cursor_changed(&entry.cursor_change());
    }

    /// Evict stale cursors and inactive sessions.
    pub fn sweep(&mut self) -> SweepReport {
        self.sweep_at(Instant::now())
    }

    pub fn sweep_at(&mut self, now: Instant) -> SweepReport {
        let mut report = SweepReport::default();

        for (session_id, entry) in self.entries.iter_mut() {
            if now.saturating_duration_since(entry.last_seen) > self.activity_staleness {
                report.expired.push(session_id.clone());
            } else if entry.cursor.is_some()
                && now.saturating_duration_since(entry.cursor_seen) > self.cursor_staleness
            {
                entry.cursor = None;
                entry.stale = true;
                report.cursors_hidden.push(session_id.clone());
                self.observer.on_cursor_changed(&entry.cursor_change());
            }
        }

        for session_id in &report.expired {
            self.entries.remove(session_id);
            self.observer.on_presence_changed(&PresenceEvent::Expired {
                session_id: session_id.clone(),
            });
        }

        if !report.is_empty() {
            log::debug!(
                "Presence sweep: {} cursors hidden, {} sessions expired",
                report.cursors_hidden.len(),
                report.expired.len()
            );
        }
        report
    }

    /// Every tracked remote session, ordered by session id. Includes
    /// sessions whose cursor went stale but which have not yet expired.
    pub fn members(&self) -> Vec<&PresenceEntry> {
        let mut users: Vec<_> = self.entries.values().collect();
        users.sort_by(|a, b| a.session.session_id.cmp(&b.session.session_id));
        users
    }

    /// Remote sessions currently active, ordered by session id.
    ///
    /// A session drops out once a sweep hides its stale cursor and comes
    /// back with its next cursor update.
    pub fn active_users(&self) -> Vec<&PresenceEntry> {
        self.members().into_iter().filter(|entry| !entry.stale).collect()
    }

    /// Remote cursors currently visible, ordered by session id.
    pub fn active_cursors(&self) -> Vec<RemoteCursor> {
        self.active_users()
            .into_iter()
            .filter_map(|entry| {
                entry.cursor.map(|position| RemoteCursor {
                    session_id: entry.session.session_id.clone(),
                    user_id: entry.session.user_id.clone(),
                    display_name: entry.session.display_name.clone(),
                    color: entry.session.color.clone(),
                    position,
                    activity: entry.activity,
                })
            })
            .collect()
    }

    pub fn get(&self, session_id: &str) -> Option<&PresenceEntry> {
        self.entries.get(session_id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Forget everyone, e.g. after leaving the room or going offline.
    pub fn clear(&mut self) {
        let sessions: Vec<String> = self.entries.keys().cloned().collect();
        for session_id in sessions {
            self.member_left(&session_id);
        }
    }
}

// ───────────────────────────────────────────────────────────────────
// Outbound rate limit
// ───────────────────────────────────────────────────────────────────

/// Rate limit for outbound cursor updates. Not a queue: refused updates
/// are meant to be dropped.
#[derive(Debug, Clone)]
pub struct CursorThrottle {
    interval: Duration,
    last_sent: Option<Instant>,
}

impl CursorThrottle {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last_sent: None,
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Whether an update may go out now; records the send if so.
    pub fn allow(&mut self) -> bool {
        self.allow_at(Instant::now())
    }

    pub fn allow_at(&mut self, now: Instant) -> bool {
        match self.last_sent {
            Some(last) if now.saturating_duration_since(last) < self.interval => false,
            _ => {
                self.last_sent = Some(now);
                true
            }
        }
    }

    /// Let the next update through immediately.
    pub fn reset(&mut self) {
        self.last_sent = None;
    }
}

impl Default for CursorThrottle {
    fn default() -> Self {
        Self::new(Duration::from_millis(100))
    }
}

// ===================================================================
// Tests
// ===================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recorder {
        cursors: Mutex<Vec<CursorChange>>,
        presence: Mutex<Vec<PresenceEvent>>,
    }

    impl CollabObserver for Recorder {
        fn on_cursor_changed(&self, change: &CursorChange) {
            self.cursors.lock().unwrap().push(change.clone());
        }

        fn on_presence_changed(&self, event: &PresenceEvent) {
            self.presence.lock().unwrap().push(event.clone());
        }
    }

    fn tracker() -> (PresenceTracker, Arc<Recorder>) {
        let recorder = Arc::new(Recorder::default());
        let mut tracker = PresenceTracker::new(recorder.clone());
        tracker.set_local_session("me");
        (tracker, recorder)
    }

    fn session(id: &str) -> SessionInfo {
        SessionInfo::with_id(id, format!("user-{id}"), format!("User {id}"))
    }

    fn berlin() -> LatLng {
        LatLng::new(52.52, 13.405)
    }

    // ── Membership ───────────────────────────────────────────────

    #[test]
    fn test_member_joined_and_left() {
        let (mut t, recorder) = tracker();
        t.member_joined(session("s1"));
        t.member_joined(session("s1"));
        assert_eq!(t.len(), 1);

        assert!(t.member_left("s1"));
        assert!(!t.member_left("s1"));
        assert!(t.is_empty());

        let events = recorder.presence.lock().unwrap();
        assert_eq!(
            *events,
            vec![
                PresenceEvent::Joined(session("s1")),
                PresenceEvent::Left { session_id: "s1".into() },
            ]
        );
    }

    #[test]
    fn test_ignores_local_session() {
        let (mut t, recorder) = tracker();
        t.member_joined(session("me"));
        t.update("me", "user-me", Some(berlin()), Activity::Drawing);
        assert!(t.is_empty());
        assert!(recorder.cursors.lock().unwrap().is_empty());
    }

    #[test]
    fn test_sync_members_replaces_roster() {
        let (mut t, _) = tracker();
        t.member_joined(session("s1"));
        t.member_joined(session("s2"));

        t.sync_members(&[session("me"), session("s2"), session("s3")]);

        let ids: Vec<_> = t.active_users().iter().map(|e| e.session.session_id.clone()).collect();
        assert_eq!(ids, vec!["s2", "s3"]);
    }

    #[test]
    fn test_clear_emits_left() {
        let (mut t, recorder) = tracker();
        t.member_joined(session("s1"));
        t.member_joined(session("s2"));
        t.clear();
        assert!(t.is_empty());
        assert_eq!(recorder.presence.lock().unwrap().len(), 4);
    }

    // ── Cursor updates ───────────────────────────────────────────

    #[test]
    fn test_update_overwrites_cursor() {
        let (mut t, recorder) = tracker();
        t.member_joined(session("s1"));
        t.update("s1", "user-s1", Some(berlin()), Activity::Viewing);
        t.update("s1", "user-s1", Some(LatLng::new(48.85, 2.35)), Activity::Drawing);

        let cursors = t.active_cursors();
        assert_eq!(cursors.len(), 1);
        assert_eq!(cursors[0].position, LatLng::new(48.85, 2.35));
        assert_eq!(cursors[0].activity, Activity::Drawing);
        assert_eq!(cursors[0].display_name, "User s1");
        assert_eq!(recorder.cursors.lock().unwrap().len(), 2);
    }

    #[test]
    fn test_cursor_from_unknown_session_creates_placeholder() {
        let (mut t, recorder) = tracker();
        t.update("s9", "bob", Some(berlin()), Activity::Viewing);

        let entry = t.get("s9").unwrap();
        assert_eq!(entry.session.user_id, "bob");
        assert_eq!(entry.cursor, Some(berlin()));
        assert!(matches!(
            recorder.presence.lock().unwrap()[0],
            PresenceEvent::Joined(_)
        ));
    }

    #[test]
    fn test_cursor_off_map_hides_cursor() {
        let (mut t, _) = tracker();
        t.update("s1", "u", Some(berlin()), Activity::Viewing);
        t.update("s1", "u", None, Activity::Viewing);
        assert!(t.active_cursors().is_empty());
        assert_eq!(t.active_users().len(), 1);
    }

    // ── Sweep ────────────────────────────────────────────────────

    #[test]
    fn test_stale_cursor_hidden_by_sweep() {
        let (mut t, recorder) = tracker();
        let start = Instant::now();
        t.update_at("s1", "u1", Some(berlin()), Activity::Viewing, start);
        t.update_at("s2", "u2", Some(berlin()), Activity::Viewing, start + Duration::from_secs(3));

        let report = t.sweep_at(start + Duration::from_millis(5001));
        assert_eq!(report.cursors_hidden, vec!["s1".to_string()]);
        assert!(report.expired.is_empty());

        let cursors = t.active_cursors();
        assert_eq!(cursors.len(), 1);
        assert_eq!(cursors[0].session_id, "s2");

        let last = recorder.cursors.lock().unwrap().last().cloned().unwrap();
        assert_eq!(last.session_id, "s1");
        assert_eq!(last.position, None);
    }

    #[test]
    fn test_stale_session_leaves_active_users() {
        let (mut t, _) = tracker();
        let start = Instant::now();
        t.member_joined_at(session("s0"), start);
        t.update_at("s1", "u1", Some(berlin()), Activity::Viewing, start);
        t.update_at("s2", "u2", Some(berlin()), Activity::Viewing, start + Duration::from_secs(3));

        t.sweep_at(start + Duration::from_millis(5001));
        let active: Vec<_> = t.active_users().iter().map(|e| e.session.session_id.clone()).collect();
        assert_eq!(active, vec!["s0", "s2"]);
        assert_eq!(t.members().len(), 3);
        assert_eq!(t.len(), 3);

        // Reporting again makes it active.
        t.update_at("s1", "u1", None, Activity::Viewing, start + Duration::from_secs(6));
        assert_eq!(t.active_users().len(), 3);
    }

    #[test]
    fn test_cursor_exactly_at_window_survives() {
        let (mut t, _) = tracker();
        let start = Instant::now();
        t.update_at("s1", "u1", Some(berlin()), Activity::Viewing, start);
        assert!(t.sweep_at(start + Duration::from_secs(5)).is_empty());
        assert_eq!(t.active_cursors().len(), 1);
    }

    #[test]
    fn test_inactive_session_expires() {
        let (mut t, recorder) = tracker();
        let start = Instant::now();
        t.member_joined_at(session("s1"), start);
        t.update_at("s2", "u2", Some(berlin()), Activity::Editing, start + Duration::from_secs(200));

        let report = t.sweep_at(start + Duration::from_secs(301));
        assert_eq!(report.expired, vec!["s1".to_string()]);
        assert!(t.get("s1").is_none());
        assert!(t.get("s2").is_some());
        assert!(recorder
            .presence
            .lock()
            .unwrap()
            .contains(&PresenceEvent::Expired { session_id: "s1".into() }));
    }

    #[test]
    fn test_sweep_repeated_is_quiet() {
        let (mut t, recorder) = tracker();
        let start = Instant::now();
        t.update_at("s1", "u1", Some(berlin()), Activity::Viewing, start);
        t.sweep_at(start + Duration::from_secs(6));
        let notified = recorder.cursors.lock().unwrap().len();

        assert!(t.sweep_at(start + Duration::from_secs(7)).is_empty());
        assert_eq!(recorder.cursors.lock().unwrap().len(), notified);
    }

    // ── CursorThrottle ───────────────────────────────────────────

    #[test]
    fn test_throttle_first_update_passes() {
        let mut throttle = CursorThrottle::default();
        assert!(throttle.allow());
    }

    #[test]
    fn test_throttle_drops_within_interval() {
        let mut throttle = CursorThrottle::new(Duration::from_millis(100));
        let start = Instant::now();
        assert!(throttle.allow_at(start));
        assert!(!throttle.allow_at(start + Duration::from_millis(40)));
        assert!(!throttle.allow_at(start + Duration::from_millis(99)));
        assert!(throttle.allow_at(start + Duration::from_millis(100)));
        assert!(!throttle.allow_at(start + Duration::from_millis(150)));
    }

    #[test]
    fn test_throttle_at_most_ten_per_second() {
        let mut throttle = CursorThrottle::new(Duration::from_millis(100));
        let start = Instant::now();
        let sent = (0..1000u64)
            .filter(|ms| throttle.allow_at(start + Duration::from_millis(*ms)))
            .count();
        assert_eq!(sent, 10);
    }

    #[test]
    fn test_throttle_reset() {
        let mut throttle = CursorThrottle::new(Duration::from_secs(10));
        assert!(throttle.allow());
        assert!(!throttle.allow());
        throttle.reset();
        assert!(throttle.allow());
    }
}
