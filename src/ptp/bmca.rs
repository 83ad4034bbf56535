//! Announce store and Best Master Clock Algorithm (§4.C).
//!
//! Grounded on `PtpAnnounceMessage`/`PtpAnnounceSender`/`compare_announce_message`/
//! `select_best_master_clock` in the original GStreamer PTP clock source.

use std::cmp::Ordering;
use std::collections::VecDeque;

use super::identity::ClockIdentity;
use super::timestamp::Nanos;
use super::wire::AnnounceBody;

/// Per-sender history is capped at this many retained announces (§3 `AnnounceSender`).
const MAX_HISTORY: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AnnounceMessage {
    pub receive_time: Nanos,
    pub sequence_id: u16,
    pub source: ClockIdentity,
    pub grandmaster_identity: u64,
    pub priority_1: u8,
    pub clock_class: u8,
    pub clock_accuracy: u8,
    pub offset_scaled_log_variance: u16,
    pub priority_2: u8,
    pub steps_removed: u16,
    pub time_source: u8,
}

impl AnnounceMessage {
    pub fn from_body(source: ClockIdentity, sequence_id: u16, receive_time: Nanos, body: &AnnounceBody) -> Self {
        AnnounceMessage {
            receive_time,
            sequence_id,
            source,
            grandmaster_identity: body.grandmaster_identity,
            priority_1: body.grandmaster_priority_1,
            clock_class: body.grandmaster_clock_class,
            clock_accuracy: body.grandmaster_clock_accuracy,
            offset_scaled_log_variance: body.grandmaster_offset_scaled_log_variance,
            priority_2: body.grandmaster_priority_2,
            steps_removed: body.steps_removed,
            time_source: body.time_source,
        }
    }
}

/// IEEE 1588 Figure 27 ordering: `Less` means `a` is the better (more preferred) clock.
pub fn compare_announce_message(a: &AnnounceMessage, b: &AnnounceMessage) -> Ordering {
    if a.grandmaster_identity == b.grandmaster_identity {
        // Dead-band: a difference of <= 1 in steps_removed is a tie, resolved below.
        if a.steps_removed + 1 < b.steps_removed {
            return Ordering::Less;
        }
        if a.steps_removed > b.steps_removed + 1 {
            return Ordering::Greater;
        }
        a.steps_removed.cmp(&b.steps_removed).then_with(|| a.source.cmp(&b.source))
    } else {
        a.priority_1
            .cmp(&b.priority_1)
            .then_with(|| a.clock_class.cmp(&b.clock_class))
            .then_with(|| a.clock_accuracy.cmp(&b.clock_accuracy))
            .then_with(|| a.offset_scaled_log_variance.cmp(&b.offset_scaled_log_variance))
            .then_with(|| a.priority_2.cmp(&b.priority_2))
            .then_with(|| a.grandmaster_identity.cmp(&b.grandmaster_identity))
    }
}

/// Per-(domain, source) bookkeeping: the sender's identity, its last observed
/// announce interval, and a bounded history of recent announces.
#[derive(Debug, Clone)]
pub struct AnnounceSender {
    pub identity: ClockIdentity,
    pub announce_interval: Nanos,
    history: VecDeque<AnnounceMessage>,
}

impl AnnounceSender {
    pub fn new(identity: ClockIdentity, announce_interval: Nanos) -> Self {
        AnnounceSender { identity, announce_interval, history: VecDeque::with_capacity(MAX_HISTORY) }
    }

    /// Duplicate sequence ids within the retained history are dropped (invariant 2).
    pub fn has_sequence(&self, sequence_id: u16) -> bool {
        self.history.iter().any(|m| m.sequence_id == sequence_id)
    }

    pub fn push(&mut self, announce_interval: Nanos, message: AnnounceMessage) {
        self.announce_interval = announce_interval;
        if self.history.len() == MAX_HISTORY {
            self.history.pop_front();
        }
        self.history.push_back(message);
    }

    /// Drops announces older than `timeout_intervals * announce_interval`.
    pub fn age(&mut self, now: Nanos, timeout_intervals: u32) {
        let window = self.announce_interval.saturating_mul(timeout_intervals as i64);
        self.history.retain(|m| now.saturating_sub(m.receive_time) <= window);
    }

    pub fn is_empty(&self) -> bool {
        self.history.is_empty()
    }

    /// A sender only counts toward BMCA once it has sent at least 2 announces within
    /// the timeout window (§4.C step 2).
    pub fn qualifies(&self) -> bool {
        self.history.len() >= 2
    }

    pub fn newest(&self) -> Option<&AnnounceMessage> {
        self.history.back()
    }
}

/// Runs BMCA over all qualified senders and returns the winner, if any.
pub fn select_best_master<'a>(senders: impl Iterator<Item = &'a AnnounceSender>) -> Option<&'a AnnounceMessage> {
    senders
        .filter(|s| s.qualifies())
        .filter_map(|s| s.newest())
        .min_by(|a, b| compare_announce_message(a, b))
}
