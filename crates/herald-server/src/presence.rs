use std::collections::{HashMap, VecDeque};

use metrics::counter;
use parking_lot::Mutex;
use tracing::debug;

use herald_core::presence::{PresenceEvent, PresenceKind};

use crate::metrics::PRESENCE_EVENTS_TOTAL;

/// Ring capacity for the in-memory presence log.
pub const PRESENCE_LOG_CAPACITY: usize = 100;

#[derive(Default)]
struct PresenceState {
    /// Live-session count per identity (external id).
    refcounts: HashMap<String, usize>,
    /// Most recent transitions, oldest first.
    log: VecDeque<PresenceEvent>,
}

/// Reference-counted presence over identities.
///
/// An identity with several live sessions is online exactly once:
/// the first session up emits `online`, the last session down emits
/// `offline`, and every transition in between is silent. Both counters
/// and the bounded event log mutate under one lock so the log order
/// matches the order observers saw the transitions.
pub struct PresenceTracker {
    inner: Mutex<PresenceState>,
}

impl PresenceTracker {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(PresenceState::default()),
        }
    }

    /// Record a session coming up for `user_id`. Returns the `online`
    /// event to broadcast if this was the identity's first live session.
    pub fn session_online(&self, user_id: &str) -> Option<PresenceEvent> {
        let mut state = self.inner.lock();
        let count = state.refcounts.entry(user_id.to_owned()).or_insert(0);
        *count += 1;
        let first = *count == 1;
        debug!(user_id, sessions = *count, "presence session up");

        first.then(|| Self::record(&mut state, PresenceKind::Online, user_id))
    }

    /// Record a session going down for `user_id`. Returns the `offline`
    /// event to broadcast if this was the identity's last live session.
    /// Inert when no sessions are tracked for the identity.
    pub fn session_offline(&self, user_id: &str) -> Option<PresenceEvent> {
        let mut state = self.inner.lock();
        let count = match state.refcounts.get_mut(user_id) {
            Some(count) => count,
            None => return None,
        };
        *count -= 1;
        let last = *count == 0;
        if last {
            state.refcounts.remove(user_id);
        }
        debug!(user_id, last, "presence session down");

        last.then(|| Self::record(&mut state, PresenceKind::Offline, user_id))
    }

    fn record(state: &mut PresenceState, kind: PresenceKind, user_id: &str) -> PresenceEvent {
        let event = PresenceEvent::now(kind, user_id);
        if state.log.len() == PRESENCE_LOG_CAPACITY {
            state.log.pop_front();
        }
        state.log.push_back(event.clone());
        counter!(PRESENCE_EVENTS_TOTAL, "kind" => kind.to_string()).increment(1);
        event
    }

    /// Identities with at least one live session.
    pub fn online_user_ids(&self) -> Vec<String> {
        self.inner.lock().refcounts.keys().cloned().collect()
    }

    pub fn online_count(&self) -> usize {
        self.inner.lock().refcounts.len()
    }

    /// Snapshot of the event log, oldest first.
    pub fn recent_events(&self) -> Vec<PresenceEvent> {
        self.inner.lock().log.iter().cloned().collect()
    }

    pub fn recent_event_count(&self) -> usize {
        self.inner.lock().log.len()
    }
}

impl Default for PresenceTracker {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_session_emits_online() {
        let tracker = PresenceTracker::new();
        let event = tracker.session_online("appA:alice");

        assert_eq!(event.map(|e| e.kind), Some(PresenceKind::Online));
        assert_eq!(tracker.online_count(), 1);
    }

    #[test]
    fn second_session_is_silent() {
        let tracker = PresenceTracker::new();
        assert!(tracker.session_online("appA:alice").is_some());
        assert!(tracker.session_online("appA:alice").is_none());

        assert_eq!(tracker.online_count(), 1);
        assert_eq!(tracker.recent_event_count(), 1);
    }

    #[test]
    fn offline_emits_only_after_last_session() {
        let tracker = PresenceTracker::new();
        tracker.session_online("appA:alice");
        tracker.session_online("appA:alice");

        assert!(tracker.session_offline("appA:alice").is_none());
        let event = tracker.session_offline("appA:alice");
        assert_eq!(event.map(|e| e.kind), Some(PresenceKind::Offline));
        assert_eq!(tracker.online_count(), 0);
    }

    #[test]
    fn offline_without_sessions_is_inert() {
        let tracker = PresenceTracker::new();
        assert!(tracker.session_offline("appA:ghost").is_none());
        assert_eq!(tracker.recent_event_count(), 0);
    }

    #[test]
    fn log_keeps_transitions_in_order() {
        let tracker = PresenceTracker::new();
        tracker.session_online("appA:alice");
        tracker.session_online("appB:bob");
        tracker.session_offline("appA:alice");

        let events = tracker.recent_events();
        let kinds: Vec<PresenceKind> = events.iter().map(|e| e.kind).collect();
        assert_eq!(
            kinds,
            vec![PresenceKind::Online, PresenceKind::Online, PresenceKind::Offline]
        );
        assert_eq!(events[2].user_id, "appA:alice");
    }

    #[test]
    fn log_is_bounded_to_capacity() {
        let tracker = PresenceTracker::new();
        // Each iteration logs one online and one offline transition.
        for i in 0..PRESENCE_LOG_CAPACITY {
            let id = format!("appA:user{i}");
            tracker.session_online(&id);
            tracker.session_offline(&id);
        }

        assert_eq!(tracker.recent_event_count(), PRESENCE_LOG_CAPACITY);
        let events = tracker.recent_events();
        // The oldest half was evicted; the survivor set starts mid-stream.
        assert_eq!(events[0].user_id, "appA:user50");
        assert_eq!(events[0].kind, PresenceKind::Online);
        assert_eq!(
            events.last().map(|e| e.user_id.clone()),
            Some("appA:user99".to_owned())
        );
    }

    #[test]
    fn distinct_identities_tracked_separately() {
        let tracker = PresenceTracker::new();
        tracker.session_online("appA:alice");
        tracker.session_online("appB:bob");

        let mut ids = tracker.online_user_ids();
        ids.sort();
        assert_eq!(ids, vec!["appA:alice", "appB:bob"]);

        tracker.session_offline("appA:alice");
        assert_eq!(tracker.online_user_ids(), vec!["appB:bob"]);
    }
}
