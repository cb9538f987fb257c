use std::sync::Arc;

use chrono::Duration;

use super::client::HistorySource;
use super::timeline::Timeline;
use crate::common::ChatMessage;
use crate::error::{HistoryError, HistoryResult};

/// How far apart an id-less observation and a history message may be sent
/// and still count as the same message.
const SAME_MESSAGE_WINDOW_SECS: i64 = 60;

/// Result of finishing a history load.
#[derive(Debug)]
pub struct MergeOutcome {
    pub timeline: Timeline,
    /// Set when history could not be fetched; the timeline then only holds
    /// messages observed live.
    pub history_error: Option<HistoryError>,
}

/// Keeps one room's timeline consistent across a history fetch and the
/// live stream that may race with it.
pub struct HistoryReconciler<H> {
    source: Arc<H>,
    timeline: Option<Timeline>,
    /// Epoch of the fetch currently allowed to land.
    in_flight: Option<u64>,
    next_epoch: u64,
}

impl<H: HistorySource> HistoryReconciler<H> {
    pub fn new(source: H) -> Self {
        Self::with_shared(Arc::new(source))
    }

    pub fn with_shared(source: Arc<H>) -> Self {
        Self {
            source,
            timeline: None,
            in_flight: None,
            next_epoch: 1,
        }
    }

    pub fn source(&self) -> Arc<H> {
        Arc::clone(&self.source)
    }

    pub fn room_id(&self) -> Option<&str> {
        self.timeline.as_ref().map(Timeline::room_id)
    }

    pub fn timeline(&self) -> Option<&Timeline> {
        self.timeline.as_ref()
    }

    pub fn is_loading(&self) -> bool {
        self.in_flight.is_some()
    }

    /// Fetch history for `room_id` and merge it with everything observed so
    /// far. A failed fetch degrades to the live-only timeline.
    pub async fn load_and_merge(&mut self, room_id: &str) -> Timeline {
        let epoch = self.begin_load(room_id);
        let result = self.source.fetch_history(room_id).await;
        match self.complete_load(epoch, result) {
            Some(outcome) => outcome.timeline,
            None => self.timeline.clone().unwrap_or_else(|| Timeline::new(room_id)),
        }
    }

    /// Start a load for `room_id`, switching rooms if needed. Live messages
    /// keep accumulating until [`complete_load`](Self::complete_load).
    pub fn begin_load(&mut self, room_id: &str) -> u64 {
        if self.room_id() != Some(room_id) {
            self.reset(Some(room_id));
        }
        let epoch = self.next_epoch;
        self.next_epoch += 1;
        self.in_flight = Some(epoch);
        log::debug!("Loading history for room {room_id} (epoch {epoch})");
        epoch
    }

    /// Merge a finished fetch. Returns `None` for a fetch superseded by a
    /// newer load or a room change.
    pub fn complete_load(
        &mut self,
        epoch: u64,
        result: HistoryResult<Vec<ChatMessage>>,
    ) -> Option<MergeOutcome> {
        if self.in_flight != Some(epoch) {
            log::debug!("Discarding stale history result (epoch {epoch})");
            return None;
        }
        self.in_flight = None;
        let observed = self.timeline.take()?;
        let room_id = observed.room_id().to_string();

        match result {
            Ok(history) => {
                let mut merged = Timeline::new(room_id.as_str());
                let fetched = history.len();
                let mut unclaimed: Vec<ChatMessage> = history.clone();
                for message in history {
                    merged.absorb(message);
                }
                for entry in observed.into_entries() {
                    if !entry.message.has_id() && claim_copy(&mut unclaimed, &entry.message) {
                        continue;
                    }
                    if entry.pending {
                        merged.push_pending(entry.message);
                    } else {
                        merged.absorb(entry.message);
                    }
                }
                log::info!(
                    "Room {room_id}: merged {fetched} history message(s) into {} entries",
                    merged.len()
                );
                self.timeline = Some(merged.clone());
                Some(MergeOutcome {
                    timeline: merged,
                    history_error: None,
                })
            }
            Err(err) => {
                log::warn!("History for room {room_id} unavailable: {err}");
                self.timeline = Some(observed.clone());
                Some(MergeOutcome {
                    timeline: observed,
                    history_error: Some(err),
                })
            }
        }
    }

    /// Apply a live message. Returns whether the caller should publish the
    /// timeline: `false` for duplicates, other rooms, or while a load is
    /// still buffering.
    pub fn push_live(&mut self, message: ChatMessage) -> bool {
        let loading = self.is_loading();
        match self.timeline.as_mut() {
            Some(timeline) => timeline.absorb(message) && !loading,
            None => false,
        }
    }

    /// Show a local send immediately; its server echo replaces it later.
    pub fn record_local_send(&mut self, message: ChatMessage) -> bool {
        let loading = self.is_loading();
        match self.timeline.as_mut() {
            Some(timeline) => timeline.push_pending(message) && !loading,
            None => false,
        }
    }

    /// Drop the current timeline and any in-flight load; start over for
    /// `room_id` when given.
    pub fn reset(&mut self, room_id: Option<&str>) {
        self.in_flight = None;
        self.timeline = room_id.map(Timeline::new);
    }
}

/// Remove and report the first history message that `message` is an
/// id-less copy of. Each history message stands in for one copy only.
fn claim_copy(unclaimed: &mut Vec<ChatMessage>, message: &ChatMessage) -> bool {
    let window = Duration::seconds(SAME_MESSAGE_WINDOW_SECS);
    let found = unclaimed.iter().position(|candidate| {
        candidate.echo_key() == message.echo_key()
            && (candidate.sent_at - message.sent_at).abs() <= window
    });
    match found {
        Some(index) => {
            unclaimed.remove(index);
            true
        }
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::sync::Mutex;

    use async_trait::async_trait;
    use chrono::{Duration, TimeZone, Utc};

    use super::*;

    #[derive(Default)]
    struct FixedHistory {
        responses: Mutex<Vec<HistoryResult<Vec<ChatMessage>>>>,
    }

    impl FixedHistory {
        fn returning(result: HistoryResult<Vec<ChatMessage>>) -> Self {
            Self {
                responses: Mutex::new(vec![result]),
            }
        }
    }

    #[async_trait]
    impl HistorySource for FixedHistory {
        async fn fetch_history(&self, _room_id: &str) -> HistoryResult<Vec<ChatMessage>> {
            self.responses
                .lock()
                .unwrap()
                .pop()
                .unwrap_or_else(|| Ok(Vec::new()))
        }
    }

    fn message(seconds: i64, id: Option<&str>, sender: &str, content: &str) -> ChatMessage {
        let mut message = ChatMessage::outgoing("policy", sender, sender, content, false);
        message.id = id.map(str::to_string);
        message.sent_at =
            Utc.with_ymd_and_hms(2024, 3, 1, 10, 0, 0).unwrap() + Duration::seconds(seconds);
        message
    }

    fn contents(timeline: &Timeline) -> Vec<&str> {
        timeline.messages().map(|m| m.content.as_str()).collect()
    }

    #[tokio::test]
    async fn history_then_live_message() {
        let history = vec![message(0, Some("1"), "u1", "hi")];
        let mut reconciler = HistoryReconciler::new(FixedHistory::returning(Ok(history)));

        let timeline = reconciler.load_and_merge("policy").await;
        assert_eq!(contents(&timeline), vec!["hi"]);

        assert!(reconciler.push_live(message(1, Some("2"), "u2", "yo")));
        let timeline = reconciler.timeline().unwrap();
        assert_eq!(contents(timeline), vec!["hi", "yo"]);
    }

    #[test]
    fn live_messages_during_fetch_are_merged_without_duplicates() {
        let mut reconciler = HistoryReconciler::new(FixedHistory::default());
        let epoch = reconciler.begin_load("policy");

        // Arrived while the fetch was in flight; one of them is also in history.
        assert!(!reconciler.push_live(message(2, Some("2"), "u2", "b")));
        assert!(!reconciler.push_live(message(4, Some("4"), "u2", "d")));

        let history = vec![
            message(1, Some("1"), "u1", "a"),
            message(2, Some("2"), "u2", "b"),
            message(3, Some("3"), "u1", "c"),
        ];
        let outcome = reconciler.complete_load(epoch, Ok(history)).unwrap();
        assert!(outcome.history_error.is_none());
        assert_eq!(contents(&outcome.timeline), vec!["a", "b", "c", "d"]);

        let ids: HashSet<_> = outcome
            .timeline
            .messages()
            .filter_map(|m| m.id.clone())
            .collect();
        assert_eq!(ids.len(), outcome.timeline.len());
    }

    #[test]
    fn equal_timestamps_put_history_before_live() {
        let mut reconciler = HistoryReconciler::new(FixedHistory::default());
        let epoch = reconciler.begin_load("policy");
        reconciler.push_live(message(5, Some("live"), "u2", "live"));
        let outcome = reconciler
            .complete_load(epoch, Ok(vec![message(5, Some("hist"), "u1", "hist")]))
            .unwrap();
        assert_eq!(contents(&outcome.timeline), vec!["hist", "live"]);
    }

    #[test]
    fn pending_send_collapses_with_history_copy() {
        let mut reconciler = HistoryReconciler::new(FixedHistory::default());
        let epoch = reconciler.begin_load("policy");
        reconciler.record_local_send(message(10, None, "me", "on my way"));

        let history = vec![message(9, Some("77"), "me", "on my way")];
        let outcome = reconciler.complete_load(epoch, Ok(history)).unwrap();

        assert_eq!(outcome.timeline.len(), 1);
        assert!(!outcome.timeline.entries()[0].pending);
    }

    #[test]
    fn id_less_live_copy_is_merged_once() {
        let mut reconciler = HistoryReconciler::new(FixedHistory::default());
        let epoch = reconciler.begin_load("policy");
        // Same message seen live without an id, then a genuine repeat.
        reconciler.push_live(message(5, None, "u2", "ok"));
        reconciler.push_live(message(6, None, "u2", "ok"));
        reconciler.push_live(message(3600, None, "u2", "ok"));

        let history = vec![message(5, Some("1"), "u2", "ok")];
        let outcome = reconciler.complete_load(epoch, Ok(history)).unwrap();
        assert_eq!(contents(&outcome.timeline), vec!["ok", "ok", "ok"]);
        assert_eq!(outcome.timeline.entries()[0].message.id.as_deref(), Some("1"));
    }

    #[test]
    fn id_less_live_message_after_load_is_shown() {
        let mut reconciler = HistoryReconciler::new(FixedHistory::default());
        let epoch = reconciler.begin_load("policy");
        let result = Ok(vec![message(0, Some("1"), "u2", "ok")]);
        reconciler.complete_load(epoch, result).unwrap();

        assert!(reconciler.push_live(message(1, None, "u2", "ok")));
        assert_eq!(contents(reconciler.timeline().unwrap()), vec!["ok", "ok"]);
    }

    #[test]
    fn failed_fetch_keeps_live_messages() {
        let mut reconciler = HistoryReconciler::new(FixedHistory::default());
        let epoch = reconciler.begin_load("policy");
        reconciler.push_live(message(1, Some("1"), "u2", "before"));

        let outcome = reconciler
            .complete_load(epoch, Err(HistoryError::Status { status: 503 }))
            .unwrap();
        assert!(matches!(
            outcome.history_error,
            Some(HistoryError::Status { status: 503 })
        ));
        assert_eq!(contents(&outcome.timeline), vec!["before"]);

        assert!(reconciler.push_live(message(2, Some("2"), "u2", "after")));
        assert_eq!(contents(reconciler.timeline().unwrap()), vec!["before", "after"]);
    }

    #[test]
    fn stale_results_are_discarded() {
        let mut reconciler = HistoryReconciler::new(FixedHistory::default());
        let first = reconciler.begin_load("policy");
        reconciler.reset(None);
        assert!(reconciler.complete_load(first, Ok(Vec::new())).is_none());

        let second = reconciler.begin_load("policy");
        let third = reconciler.begin_load("policy");
        assert!(reconciler.complete_load(second, Ok(Vec::new())).is_none());
        assert!(reconciler.complete_load(third, Ok(Vec::new())).is_some());
    }

    #[test]
    fn switching_rooms_rebuilds_the_timeline() {
        let mut reconciler = HistoryReconciler::new(FixedHistory::default());
        let epoch = reconciler.begin_load("policy");
        reconciler.complete_load(epoch, Ok(vec![message(1, Some("1"), "u1", "a")]));

        reconciler.begin_load("lobby");
        assert_eq!(reconciler.room_id(), Some("lobby"));
        assert!(reconciler.timeline().unwrap().is_empty());
        // Late message for the previous room is not shown in the new one.
        assert!(!reconciler.push_live(message(2, Some("2"), "u1", "b")));
    }
}
