//! Request tracking
//!
//! Keeps one record per message id of how many requests were answered
//! (ack), rejected or unanswered (nack), and whether one is still in flight
//! (waiting). At most one request per id is tracked at a time.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::time::{Duration, Instant};

use super::{MessageId, DEFAULT_TIMEOUT_MS};

/// Request counters for a single message id
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestStatus {
    /// Requested and acknowledged
    pub ack: u32,
    /// Requested and not acknowledged
    pub nack: u32,
    /// Outstanding replies (0 or 1)
    pub waiting: u32,
}

/// Outcome of matching an incoming message against outstanding requests
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyMatch {
    /// The id was waiting and has been credited
    Matched,
    /// Nothing was waiting for this id
    Unsolicited,
}

#[derive(Debug, Default)]
struct Entry {
    status: RequestStatus,
    deadline: Option<Instant>,
}

/// Per-id request lifecycle tracker
#[derive(Debug)]
pub struct RequestTracker {
    entries: HashMap<MessageId, Entry>,
    timeout: Duration,
    lost_messages: u32,
}

impl Default for RequestTracker {
    fn default() -> Self {
        Self::new(Duration::from_millis(DEFAULT_TIMEOUT_MS))
    }
}

impl RequestTracker {
    /// Create a tracker with the given reply window
    pub fn new(timeout: Duration) -> Self {
        Self {
            entries: HashMap::new(),
            timeout,
            lost_messages: 0,
        }
    }

    /// Reply window after which a request counts as lost
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Mark `id` as requested.
    ///
    /// Returns `false` without touching any counter or deadline when a request
    /// for `id` is already outstanding; the caller must not transmit in that
    /// case.
    pub fn request(&mut self, id: MessageId, now: Instant) -> bool {
        let entry = self.entries.entry(id).or_default();
        if entry.status.waiting > 0 {
            return false;
        }
        entry.status.waiting = 1;
        entry.deadline = Some(now + self.timeout);
        true
    }

    /// Credit a reply for `id`
    pub fn on_ack(&mut self, id: MessageId) -> ReplyMatch {
        match self.entries.get_mut(&id) {
            Some(entry) if entry.status.waiting > 0 => {
                entry.status.waiting = 0;
                entry.status.ack += 1;
                entry.deadline = None;
                ReplyMatch::Matched
            }
            _ => ReplyMatch::Unsolicited,
        }
    }

    /// Record an explicit rejection from the device for `id`.
    ///
    /// Rejections clear the outstanding request but are not lost messages.
    pub fn on_nack(&mut self, id: MessageId) -> ReplyMatch {
        match self.entries.get_mut(&id) {
            Some(entry) if entry.status.waiting > 0 => {
                entry.status.waiting = 0;
                entry.status.nack += 1;
                entry.deadline = None;
                ReplyMatch::Matched
            }
            _ => ReplyMatch::Unsolicited,
        }
    }

    /// Record that no reply for `id` arrived within the window
    pub fn on_timeout(&mut self, id: MessageId) {
        let entry = self.entries.entry(id).or_default();
        entry.status.waiting = 0;
        entry.status.nack += 1;
        entry.deadline = None;
        self.lost_messages += 1;
    }

    /// Time out every request whose deadline has passed, returning their ids
    pub fn expire(&mut self, now: Instant) -> Vec<MessageId> {
        let mut expired: Vec<MessageId> = self
            .entries
            .iter()
            .filter(|(_, e)| e.deadline.is_some_and(|d| d <= now))
            .map(|(id, _)| *id)
            .collect();
        expired.sort();
        for id in &expired {
            self.on_timeout(*id);
        }
        expired
    }

    /// Whether a request for `id` is outstanding
    pub fn is_waiting(&self, id: MessageId) -> bool {
        self.entries
            .get(&id)
            .is_some_and(|e| e.status.waiting > 0)
    }

    /// Counters for `id`, if it was ever requested
    pub fn status(&self, id: MessageId) -> Option<RequestStatus> {
        self.entries.get(&id).map(|e| e.status)
    }

    /// Counters for every id seen this session
    pub fn snapshot(&self) -> BTreeMap<MessageId, RequestStatus> {
        self.entries.iter().map(|(id, e)| (*id, e.status)).collect()
    }

    /// Total number of requests that timed out
    pub fn lost_messages(&self) -> u32 {
        self.lost_messages
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_request_sets_waiting_once() {
        let mut tracker = RequestTracker::default();
        let now = Instant::now();
        assert!(tracker.request(MessageId::Voltage5, now));
        assert!(!tracker.request(MessageId::Voltage5, now));

        let status = tracker.status(MessageId::Voltage5).unwrap();
        assert_eq!(status, RequestStatus { ack: 0, nack: 0, waiting: 1 });
    }

    #[test]
    fn test_duplicate_request_keeps_first_deadline() {
        let mut tracker = RequestTracker::new(Duration::from_millis(100));
        let start = Instant::now();
        tracker.request(MessageId::Range, start);
        tracker.request(MessageId::Range, start + Duration::from_millis(90));

        let expired = tracker.expire(start + Duration::from_millis(100));
        assert_eq!(expired, vec![MessageId::Range]);
    }

    #[test]
    fn test_ack_clears_waiting() {
        let mut tracker = RequestTracker::default();
        tracker.request(MessageId::Range, Instant::now());
        assert_eq!(tracker.on_ack(MessageId::Range), ReplyMatch::Matched);

        let status = tracker.status(MessageId::Range).unwrap();
        assert_eq!(status, RequestStatus { ack: 1, nack: 0, waiting: 0 });
        assert_eq!(tracker.lost_messages(), 0);
    }

    #[test]
    fn test_unsolicited_reply_changes_nothing() {
        let mut tracker = RequestTracker::default();
        assert_eq!(tracker.on_ack(MessageId::Distance), ReplyMatch::Unsolicited);
        assert_eq!(tracker.status(MessageId::Distance), None);

        tracker.request(MessageId::Range, Instant::now());
        tracker.on_ack(MessageId::Range);
        assert_eq!(tracker.on_ack(MessageId::Range), ReplyMatch::Unsolicited);
        assert_eq!(tracker.status(MessageId::Range).unwrap().ack, 1);
    }

    #[test]
    fn test_timeout_counts_lost_once() {
        let mut tracker = RequestTracker::default();
        tracker.request(MessageId::PcbTemperature, Instant::now());
        tracker.on_timeout(MessageId::PcbTemperature);

        let status = tracker.status(MessageId::PcbTemperature).unwrap();
        assert_eq!(status, RequestStatus { ack: 0, nack: 1, waiting: 0 });
        assert_eq!(tracker.lost_messages(), 1);
    }

    #[test]
    fn test_device_nack_is_not_lost() {
        let mut tracker = RequestTracker::default();
        tracker.request(MessageId::GainIndex, Instant::now());
        assert_eq!(tracker.on_nack(MessageId::GainIndex), ReplyMatch::Matched);
        assert_eq!(tracker.status(MessageId::GainIndex).unwrap().nack, 1);
        assert_eq!(tracker.lost_messages(), 0);
    }

    #[test]
    fn test_expire_only_past_deadlines() {
        let mut tracker = RequestTracker::new(Duration::from_millis(500));
        let start = Instant::now();
        tracker.request(MessageId::Voltage5, start);
        tracker.request(MessageId::ProcessorTemperature, start + Duration::from_millis(300));

        let expired = tracker.expire(start + Duration::from_millis(600));
        assert_eq!(expired, vec![MessageId::Voltage5]);
        assert!(tracker.is_waiting(MessageId::ProcessorTemperature));
        assert_eq!(tracker.lost_messages(), 1);
    }

    #[test]
    fn test_waiting_never_exceeds_one() {
        let mut tracker = RequestTracker::default();
        let now = Instant::now();
        for _ in 0..5 {
            tracker.request(MessageId::ModeAuto, now);
        }
        tracker.on_ack(MessageId::ModeAuto);
        tracker.request(MessageId::ModeAuto, now);
        assert!(tracker.snapshot().values().all(|s| s.waiting <= 1));
    }
}
