//! Pending-sync tracker (§4.D): correlates SYNC/FOLLOW_UP/DELAY_REQ/DELAY_RESP by
//! sequence id into a completed four-timestamp tuple.
//!
//! Grounded on `PtpPendingSync` and `handle_sync_message`/`handle_follow_up_message`/
//! `handle_delay_resp_message` in the original GStreamer PTP clock source.

use super::timestamp::Nanos;

/// One in-flight SYNC awaiting its matching FOLLOW_UP (if two-step) and DELAY_REQ/DELAY_RESP
/// round trip. `None` fields are represented as `Option` rather than a sentinel time value.
#[derive(Debug, Clone)]
pub struct PendingSync {
    pub sync_seqnum: u16,
    /// t2: local receive time of the SYNC.
    pub sync_recv_time_local: Nanos,
    /// t1: remote send time of the SYNC (origin timestamp, or FOLLOW_UP's precise origin).
    pub sync_send_time_remote: Option<Nanos>,
    pub follow_up_recv_time_local: Option<Nanos>,
    /// 48.16 fixed-point correction accumulated from SYNC (+ FOLLOW_UP if two-step).
    pub correction_field_sync: i64,
    pub delay_req_seqnum: Option<u16>,
    /// t3: local send time of the DELAY_REQ, refined by the helper's SEND_TIME_ACK.
    pub delay_req_send_time_local: Option<Nanos>,
    /// t4: remote receive time of the DELAY_REQ, from DELAY_RESP.
    pub delay_req_recv_time_remote: Option<Nanos>,
    pub delay_resp_recv_time_local: Option<Nanos>,
    pub correction_field_delay: i64,
    /// Deadline after which this pending sync is dropped even if incomplete (§4.D, §4.G).
    pub expires_at: Nanos,
}

impl PendingSync {
    pub fn new(sync_seqnum: u16, sync_recv_time_local: Nanos, expires_at: Nanos) -> Self {
        PendingSync {
            sync_seqnum,
            sync_recv_time_local,
            sync_send_time_remote: None,
            follow_up_recv_time_local: None,
            correction_field_sync: 0,
            delay_req_seqnum: None,
            delay_req_send_time_local: None,
            delay_req_recv_time_remote: None,
            delay_resp_recv_time_local: None,
            correction_field_delay: 0,
            expires_at,
        }
    }

    pub fn has_t1(&self) -> bool {
        self.sync_send_time_remote.is_some()
    }

    /// One-step SYNC: t1 is the origin timestamp carried in the SYNC itself.
    pub fn set_t1_from_sync(&mut self, t1: Nanos, correction_field: i64) {
        self.sync_send_time_remote = Some(t1);
        self.correction_field_sync = correction_field;
    }

    /// Two-step: t1 arrives later via FOLLOW_UP. Rejects if t1 is already known (duplicate
    /// or repeat FOLLOW_UP) or if the bogus-timestamp invariant (3) would be violated.
    pub fn apply_follow_up(&mut self, t1: Nanos, correction_field: i64, receive_time: Nanos) -> Result<(), FollowUpRejection> {
        if self.has_t1() {
            return Err(FollowUpRejection::Repeat);
        }
        if self.sync_recv_time_local >= receive_time {
            return Err(FollowUpRejection::Bogus);
        }
        self.correction_field_sync += correction_field;
        self.sync_send_time_remote = Some(t1);
        self.follow_up_recv_time_local = Some(receive_time);
        Ok(())
    }

    pub fn schedule_delay_req(&mut self, seqnum: u16) {
        self.delay_req_seqnum = Some(seqnum);
    }

    pub fn ack_delay_req_send_time(&mut self, seqnum: u16, send_time: Nanos) -> bool {
        if self.delay_req_seqnum != Some(seqnum) {
            return false;
        }
        self.delay_req_send_time_local = Some(send_time);
        true
    }

    /// Completes the tuple from a matching DELAY_RESP. Enforces invariant 4
    /// (t3 <= t4's local arrival) before accepting.
    pub fn apply_delay_resp(
        &mut self,
        t4: Nanos,
        correction_field: i64,
        receive_time: Nanos,
    ) -> Result<(), DelayRespRejection> {
        let t3 = match self.delay_req_send_time_local {
            Some(t3) => t3,
            None => return Err(DelayRespRejection::NoDelayReqSentYet),
        };
        if t3 > receive_time {
            return Err(DelayRespRejection::Bogus);
        }
        self.delay_req_recv_time_remote = Some(t4);
        self.delay_resp_recv_time_local = Some(receive_time);
        self.correction_field_delay = correction_field;
        Ok(())
    }

    /// All four timestamps are present: ready for §4.E/§4.F.
    pub fn is_complete(&self) -> bool {
        self.sync_send_time_remote.is_some()
            && self.delay_req_send_time_local.is_some()
            && self.delay_req_recv_time_remote.is_some()
            && self.delay_resp_recv_time_local.is_some()
    }

    pub fn is_expired(&self, now: Nanos) -> bool {
        now >= self.expires_at
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FollowUpRejection {
    /// t1 was already set by an earlier SYNC or FOLLOW_UP; this one is a duplicate.
    Repeat,
    /// `follow_up_recv_time_local <= sync_recv_time_local`: impossible per invariant 3.
    Bogus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DelayRespRejection {
    /// DELAY_RESP arrived before our DELAY_REQ's send time was even recorded.
    NoDelayReqSentYet,
    /// `delay_req_send_time_local > delay_resp_recv_time_local`: impossible per invariant 4.
    Bogus,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn one_step_sets_t1_immediately() {
        let mut sync = PendingSync::new(1, 100, 10_000);
        sync.set_t1_from_sync(50, 0);
        assert!(sync.has_t1());
    }

    #[test]
    fn two_step_follow_up_sets_t1_and_accumulates_correction() {
        let mut sync = PendingSync::new(1, 100, 10_000);
        assert!(!sync.has_t1());
        sync.apply_follow_up(50, 65536, 150).unwrap();
        assert_eq!(sync.sync_send_time_remote, Some(50));
        assert_eq!(sync.correction_field_sync, 65536);
    }

    #[test]
    fn repeat_follow_up_is_rejected() {
        let mut sync = PendingSync::new(1, 100, 10_000);
        sync.apply_follow_up(50, 0, 150).unwrap();
        assert_eq!(sync.apply_follow_up(60, 0, 200), Err(FollowUpRejection::Repeat));
    }

    #[test]
    fn bogus_follow_up_ordering_is_rejected() {
        let mut sync = PendingSync::new(1, 100, 10_000);
        assert_eq!(sync.apply_follow_up(50, 0, 90), Err(FollowUpRejection::Bogus));
    }

    #[test]
    fn delay_resp_without_delay_req_sent_is_rejected() {
        let mut sync = PendingSync::new(1, 100, 10_000);
        assert_eq!(sync.apply_delay_resp(500, 0, 600), Err(DelayRespRejection::NoDelayReqSentYet));
    }

    #[test]
    fn delay_resp_completes_the_tuple() {
        let mut sync = PendingSync::new(1, 1_000, 10_000);
        sync.set_t1_from_sync(900, 0);
        sync.schedule_delay_req(7);
        assert!(sync.ack_delay_req_send_time(7, 1_010));
        sync.apply_delay_resp(1_011, 0, 1_020).unwrap();
        assert!(sync.is_complete());
    }

    #[test]
    fn invariant_4_violation_is_rejected() {
        let mut sync = PendingSync::new(1, 1_000, 10_000);
        sync.set_t1_from_sync(900, 0);
        sync.schedule_delay_req(7);
        sync.ack_delay_req_send_time(7, 2_000);
        assert_eq!(sync.apply_delay_resp(2_100, 0, 1_500), Err(DelayRespRejection::Bogus));
    }

    #[test]
    fn expiry_check() {
        let sync = PendingSync::new(1, 0, 1_000);
        assert!(!sync.is_expired(999));
        assert!(sync.is_expired(1_000));
    }
}
