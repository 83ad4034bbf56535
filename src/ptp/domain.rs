//! Per-domain state (§3 `DomainState`) and the message handlers that tie the wire codec,
//! BMCA, pending-sync tracker, path-delay filter, and time-update engine together.
//!
//! Grounded on `PtpDomainData` and `handle_announce_message`/`handle_sync_message`/
//! `handle_follow_up_message`/`handle_delay_resp_message` in the original GStreamer PTP
//! clock source.

use std::collections::{HashMap, VecDeque};

use super::bmca::{self, AnnounceMessage, AnnounceSender};
use super::calibration::CalibratedClock;
use super::delay::{self, FilterMode, PathDelayFilter, PathDelayOutcome};
use super::engine;
use super::identity::ClockIdentity;
use super::pending::PendingSync;
use super::stats::PtpStatisticsEvent;
use super::timestamp::Nanos;
use super::wire::{self, AnnounceBody, DelayRespBody, FollowUpBody, Header, SyncBody, FLAG_ALTERNATE_MASTER, FLAG_TWO_STEP};

/// Knobs §10's `PtpConfig` exposes that domain-level logic needs directly.
#[derive(Debug, Clone, Copy)]
pub struct DomainConfig {
    pub filter_mode: FilterMode,
    pub opportunistic_master_selection: bool,
    pub announce_receipt_timeout_intervals: u32,
    pub min_pending_sync_timeout: Nanos,
}

impl Default for DomainConfig {
    fn default() -> Self {
        DomainConfig {
            filter_mode: FilterMode::Filtered,
            opportunistic_master_selection: true,
            announce_receipt_timeout_intervals: 4,
            min_pending_sync_timeout: 10_000_000_000,
        }
    }
}

pub struct DomainState {
    pub domain: u8,
    config: DomainConfig,
    senders: HashMap<ClockIdentity, AnnounceSender>,
    master: Option<ClockIdentity>,
    /// False while `master` was set opportunistically from a bare SYNC and has not yet been
    /// confirmed by a winning BMCA run over an ANNOUNCE from that same source (§4.C step 5).
    master_confirmed: bool,
    grandmaster_identity: u64,
    sync_interval: Nanos,
    min_delay_req_interval: Nanos,
    last_ptp_sync_time: Nanos,
    delay_filter: PathDelayFilter,
    last_delay_req_seqnum: u16,
    last_delay_req: Option<Nanos>,
    pending_syncs: VecDeque<PendingSync>,
    has_observation: bool,
    last_ptp_time: Nanos,
    last_local_time: Nanos,
    skipped_updates: u32,
    clock: Box<dyn CalibratedClock>,
    warned_log_interval_sentinel: bool,
}

impl DomainState {
    pub fn new(domain: u8, config: DomainConfig, clock: Box<dyn CalibratedClock>) -> Self {
        DomainState {
            domain,
            config,
            senders: HashMap::new(),
            master: None,
            master_confirmed: false,
            grandmaster_identity: 0,
            sync_interval: 1_000_000_000,
            min_delay_req_interval: 0,
            last_ptp_sync_time: 0,
            delay_filter: PathDelayFilter::new(config.filter_mode),
            last_delay_req_seqnum: 0,
            last_delay_req: None,
            pending_syncs: VecDeque::new(),
            has_observation: false,
            last_ptp_time: 0,
            last_local_time: 0,
            skipped_updates: 0,
            clock,
            warned_log_interval_sentinel: false,
        }
    }

    pub fn master(&self) -> Option<ClockIdentity> {
        self.master
    }

    pub fn grandmaster_identity(&self) -> u64 {
        self.grandmaster_identity
    }

    pub fn is_synced(&self) -> bool {
        self.has_observation
    }

    pub fn min_delay_req_interval(&self) -> Nanos {
        self.min_delay_req_interval
    }

    pub fn now_ptp(&self) -> Option<Nanos> {
        if !self.has_observation {
            return None;
        }
        Some(self.clock.get_calibration().adjust(self.last_local_time))
    }

    fn is_own_echo(&self, source: ClockIdentity, own_identity: ClockIdentity) -> bool {
        // Invariant 5: own identity never mutates state.
        source == own_identity
    }

    fn log_interval_nanos(&mut self, log_message_interval: i8) -> Nanos {
        let (nanos, is_sentinel) = wire::log_interval_to_nanos(log_message_interval);
        if is_sentinel && !self.warned_log_interval_sentinel {
            log::warn!(
                "domain {}: peer sent broken logMessageInterval 0x7f, treating as 1s",
                self.domain
            );
            self.warned_log_interval_sentinel = true;
        }
        nanos
    }

    /// §4.C step 1-4, driven by an admitted ANNOUNCE. Returns statistics events to emit.
    pub fn handle_announce(
        &mut self,
        source: ClockIdentity,
        own_identity: ClockIdentity,
        header: &Header,
        body: &AnnounceBody,
        now: Nanos,
    ) -> Vec<PtpStatisticsEvent> {
        if self.is_own_echo(source, own_identity) {
            return Vec::new();
        }
        if header.flag_field & FLAG_ALTERNATE_MASTER != 0 {
            return Vec::new();
        }
        // Invariant 7: stepsRemoved >= 255 is dropped.
        if body.steps_removed >= 255 {
            return Vec::new();
        }

        let interval = self.log_interval_nanos(header.log_message_interval);

        let mut events = Vec::new();
        let is_new_domain = self.senders.is_empty() && self.master.is_none();
        if is_new_domain {
            events.push(PtpStatisticsEvent::NewDomainFound { domain: self.domain });
        }

        let sender = self
            .senders
            .entry(source)
            .or_insert_with(|| AnnounceSender::new(source, interval));

        // Invariant 2: duplicate (domain, sequence id) is dropped.
        if sender.has_sequence(header.sequence_id) {
            return events;
        }

        let message = AnnounceMessage::from_body(source, header.sequence_id, now, body);
        sender.push(interval, message);

        events.extend(self.run_bmca(now));
        events
    }

    /// §4.C: age senders, qualify, select the winner, reset derived state on a change.
    pub fn run_bmca(&mut self, now: Nanos) -> Vec<PtpStatisticsEvent> {
        for sender in self.senders.values_mut() {
            sender.age(now, self.config.announce_receipt_timeout_intervals);
        }

        let aged_out_master = match self.master {
            Some(id) => self.senders.get(&id).map(|s| s.is_empty()).unwrap_or(true),
            None => false,
        };
        if aged_out_master {
            log::warn!("domain {}: current master clock aged out", self.domain);
            self.master = None;
        }
        self.senders.retain(|_, s| !s.is_empty());

        let winner = bmca::select_best_master(self.senders.values()).map(|m| (m.source, m.grandmaster_identity));

        let mut events = Vec::new();
        if let Some((winner_id, gm_id)) = winner {
            // Re-runs even when `winner_id` already equals `self.master`: that can be a
            // provisional adoption from `handle_sync` still awaiting its confirming ANNOUNCE,
            // in which case `grandmaster_identity` and the event are still outstanding.
            if self.master != Some(winner_id) || !self.master_confirmed {
                self.select_master(winner_id, gm_id);
                events.push(PtpStatisticsEvent::BestMasterClockSelected {
                    domain: self.domain,
                    master: winner_id,
                    grandmaster_identity: gm_id,
                });
            }
        }
        events
    }

    fn select_master(&mut self, master: ClockIdentity, grandmaster_identity: u64) {
        self.master = Some(master);
        self.master_confirmed = true;
        self.grandmaster_identity = grandmaster_identity;
        self.delay_filter = PathDelayFilter::new(self.config.filter_mode);
        self.last_delay_req = None;
        self.last_ptp_sync_time = 0;
        self.skipped_updates = 0;
        self.pending_syncs.clear();
    }

    /// §4.C step 5: provisionally adopt `source` as master from a bare SYNC, before any
    /// ANNOUNCE has been seen from it. Until the BMCA confirms it, `grandmaster_identity` is
    /// the source's own clock identity, the best guess available without an ANNOUNCE body.
    fn select_master_provisional(&mut self, source: ClockIdentity) -> Vec<PtpStatisticsEvent> {
        let mut events = Vec::new();
        let is_new_domain = self.senders.is_empty() && self.master.is_none();
        if is_new_domain {
            events.push(PtpStatisticsEvent::NewDomainFound { domain: self.domain });
        }
        self.select_master(source, source.clock_identity);
        self.master_confirmed = false;
        events.push(PtpStatisticsEvent::BestMasterClockSelected {
            domain: self.domain,
            master: source,
            grandmaster_identity: source.clock_identity,
        });
        events
    }

    fn accepts_from(&self, source: ClockIdentity) -> bool {
        match self.master {
            Some(master) => master == source,
            None => false,
        }
    }

    /// §4.D on SYNC. `opportunistic_first_sync` lets the very first SYNC from an
    /// as-yet-unselected source provisionally act as master (§4.C step 5).
    pub fn handle_sync(
        &mut self,
        source: ClockIdentity,
        own_identity: ClockIdentity,
        header: &Header,
        body: &SyncBody,
        now: Nanos,
    ) -> Vec<PtpStatisticsEvent> {
        if self.is_own_echo(source, own_identity) {
            return Vec::new();
        }
        if header.flag_field & FLAG_ALTERNATE_MASTER != 0 {
            return Vec::new();
        }

        let mut events = Vec::new();
        if self.master.is_none() {
            if self.config.opportunistic_master_selection {
                events.extend(self.select_master_provisional(source));
            } else {
                return Vec::new();
            }
        }
        if !self.accepts_from(source) {
            return events;
        }

        self.sync_interval = self.log_interval_nanos(header.log_message_interval);

        // Invariant 2: duplicate sync sequence ids are dropped.
        if self.pending_syncs.iter().any(|p| p.sync_seqnum == header.sequence_id) {
            return events;
        }

        let expires_at = now + self.sync_timeout();
        let mut pending = PendingSync::new(header.sequence_id, now, expires_at);

        if header.flag_field & FLAG_TWO_STEP == 0 {
            let t1 = match body.origin_timestamp.to_nanos() {
                Some(t1) => t1,
                None => return events,
            };
            // Invariant 1: t1 strictly non-decreasing.
            if self.last_ptp_sync_time != 0 && self.last_ptp_sync_time >= t1 {
                log::warn!("domain {}: backwards PTP time in SYNC, dropping", self.domain);
                return events;
            }
            self.last_ptp_sync_time = t1;
            pending.set_t1_from_sync(t1, header.correction_field);
        }

        self.pending_syncs.push_back(pending);
        events
    }

    /// §4.D on FOLLOW_UP.
    pub fn handle_follow_up(
        &mut self,
        source: ClockIdentity,
        own_identity: ClockIdentity,
        header: &Header,
        body: &FollowUpBody,
        now: Nanos,
    ) -> Vec<PtpStatisticsEvent> {
        if self.is_own_echo(source, own_identity) {
            return Vec::new();
        }
        if header.flag_field & FLAG_ALTERNATE_MASTER != 0 {
            return Vec::new();
        }
        if !self.accepts_from(source) {
            return Vec::new();
        }

        let t1 = match body.precise_origin_timestamp.to_nanos() {
            Some(t1) => t1,
            None => return Vec::new(),
        };

        let idx = self.pending_syncs.iter().position(|p| p.sync_seqnum == header.sequence_id);
        let idx = match idx {
            Some(idx) => idx,
            None => return Vec::new(),
        };

        if self.last_ptp_sync_time != 0 && self.last_ptp_sync_time >= t1 {
            log::warn!("domain {}: backwards PTP time in FOLLOW_UP, dropping", self.domain);
            self.pending_syncs.remove(idx);
            return Vec::new();
        }

        let result = self.pending_syncs[idx].apply_follow_up(t1, header.correction_field, now);
        if result.is_err() {
            self.pending_syncs.remove(idx);
            return Vec::new();
        }
        self.last_ptp_sync_time = t1;
        Vec::new()
    }

    /// Eligibility check before a DELAY_REQ may be sent for a given pending sync: t1 must
    /// be known and no DELAY_REQ sent yet for it.
    pub fn delay_req_eligible_seqnums(&self) -> Vec<u16> {
        self.pending_syncs
            .iter()
            .filter(|p| p.has_t1() && p.delay_req_seqnum.is_none())
            .map(|p| p.sync_seqnum)
            .collect()
    }

    /// §4.G: minimum-spacing gate (IEEE 1588 §9.5.11.2), seqnum assignment, and DELAY_REQ
    /// encoding. Returns `None` (and sends nothing) if the spacing requirement is violated.
    pub fn attempt_send_delay_req(
        &mut self,
        sync_seqnum: u16,
        own_identity: ClockIdentity,
        now: Nanos,
    ) -> Option<[u8; wire::DELAY_REQ_MESSAGE_LEN]> {
        if let Some(last) = self.last_delay_req {
            if last + self.min_delay_req_interval > now {
                return None;
            }
        }

        let idx = self.pending_syncs.iter().position(|p| p.sync_seqnum == sync_seqnum)?;

        self.last_delay_req = Some(now);
        let seqnum = self.last_delay_req_seqnum;
        self.last_delay_req_seqnum = self.last_delay_req_seqnum.wrapping_add(1);

        self.pending_syncs[idx].schedule_delay_req(seqnum);
        Some(wire::encode_delay_req(own_identity, seqnum, self.domain))
    }

    /// Refines a pending sync's t3 once the helper acks the send (§4.B SEND_TIME_ACK).
    pub fn handle_send_time_ack(&mut self, domain: u8, sequence_id: u16, helper_send_time: Nanos) {
        if domain != self.domain {
            return;
        }
        for pending in self.pending_syncs.iter_mut() {
            if pending.ack_delay_req_send_time(sequence_id, helper_send_time) {
                return;
            }
        }
    }

    /// §4.D on DELAY_RESP. Runs §4.E then §4.F on completion and removes the pending sync.
    pub fn handle_delay_resp(
        &mut self,
        source: ClockIdentity,
        own_identity: ClockIdentity,
        header: &Header,
        body: &DelayRespBody,
        now: Nanos,
    ) -> Vec<PtpStatisticsEvent> {
        if body.requesting_port_identity != own_identity {
            return Vec::new();
        }
        if header.flag_field & FLAG_ALTERNATE_MASTER != 0 {
            return Vec::new();
        }
        if !self.accepts_from(source) {
            return Vec::new();
        }

        let log_interval = self.log_interval_nanos(header.log_message_interval);
        self.min_delay_req_interval = log_interval;

        let t4 = match body.receive_timestamp.to_nanos() {
            Some(t4) => t4,
            None => return Vec::new(),
        };

        let idx = match self.pending_syncs.iter().position(|p| p.sync_seqnum == header.sequence_id) {
            Some(idx) => idx,
            None => return Vec::new(),
        };

        if self.pending_syncs[idx].apply_delay_resp(t4, header.correction_field, now).is_err() {
            self.pending_syncs.remove(idx);
            return Vec::new();
        }

        if !self.pending_syncs[idx].is_complete() {
            return Vec::new();
        }

        let pending = self.pending_syncs.remove(idx).expect("index just checked");
        self.complete_sync(pending, now)
    }

    fn complete_sync(&mut self, pending: PendingSync, _now: Nanos) -> Vec<PtpStatisticsEvent> {
        let t1 = pending.sync_send_time_remote.expect("complete sync has t1");
        let t2 = pending.sync_recv_time_local;
        let t3 = pending.delay_req_send_time_local.expect("complete sync has t3");
        let t4 = pending.delay_req_recv_time_remote.expect("complete sync has t4");

        let d_raw = delay::raw_sample(t1, t2, t3, t4, pending.correction_field_sync, pending.correction_field_delay);
        let follow_up_delay = pending
            .follow_up_recv_time_local
            .map(|fu| fu - pending.sync_recv_time_local);
        let delay_req_rtt = t4 - t3;

        let outcome = self.delay_filter.process(d_raw, follow_up_delay, delay_req_rtt);

        let mut events = vec![PtpStatisticsEvent::PathDelayMeasured {
            domain: self.domain,
            mean_path_delay_avg: self.delay_filter.mean_path_delay,
            mean_path_delay: d_raw,
            delay_request_delay: delay_req_rtt,
        }];

        let feed_engine = match outcome {
            PathDelayOutcome::RejectedByMedian => false,
            PathDelayOutcome::Accepted { feed_engine, .. } => feed_engine,
        };
        if !feed_engine {
            return events;
        }

        let first_observation = !self.has_observation;
        let outcome = engine::update_ptp_time(
            &mut *self.clock,
            first_observation,
            self.delay_filter.mean_path_delay,
            &mut self.skipped_updates,
            t1,
            t2,
            pending.correction_field_sync,
        );
        self.has_observation = true;
        self.last_ptp_time = outcome.ptp_time;
        self.last_local_time = outcome.local_time;

        events.push(PtpStatisticsEvent::TimeUpdated {
            domain: self.domain,
            mean_path_delay_avg: outcome.mean_path_delay_avg,
            local_time: outcome.local_time,
            ptp_time: outcome.ptp_time,
            estimated_ptp_time: outcome.estimated_ptp_time,
            discontinuity: outcome.discontinuity,
            synced: outcome.synced,
            r_squared: outcome.r_squared,
            internal_time: outcome.internal_time,
            external_time: outcome.external_time,
            rate_num: outcome.rate_num,
            rate_den: outcome.rate_den,
            rate: outcome.rate(),
        });
        events
    }

    fn sync_timeout(&self) -> Nanos {
        (4 * self.sync_interval).max(self.config.min_pending_sync_timeout)
    }

    /// §4.G periodic cleanup: time out stale pending syncs (`expires_at`, set when the
    /// SYNC first created the entry), then re-run BMCA.
    pub fn cleanup(&mut self, now: Nanos) -> Vec<PtpStatisticsEvent> {
        self.pending_syncs.retain(|p| !p.is_expired(now));
        self.run_bmca(now)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ptp::calibration::RegressionClock;
    use crate::ptp::wire::{AnnounceBody, Header, MessageType, SyncBody};
    use crate::ptp::timestamp::PtpTimestamp;

    const OWN: ClockIdentity = ClockIdentity { clock_identity: 0xFFFF, port_number: 1 };
    const MASTER_A: ClockIdentity = ClockIdentity { clock_identity: 0xAAAA, port_number: 1 };

    fn domain() -> DomainState {
        DomainState::new(0, DomainConfig::default(), Box::new(RegressionClock::new()))
    }

    fn announce_header(source: ClockIdentity, seq: u16) -> Header {
        Header {
            transport_specific: 0,
            message_type: MessageType::Announce,
            version: 2,
            message_length: 64,
            domain_number: 0,
            flag_field: 0,
            correction_field: 0,
            source_port_identity: source,
            sequence_id: seq,
            control_field: 0,
            log_message_interval: 0,
        }
    }

    fn announce_body(gm: u64, steps: u16) -> AnnounceBody {
        AnnounceBody {
            origin_timestamp: PtpTimestamp::default(),
            current_utc_offset: 0,
            grandmaster_priority_1: 128,
            grandmaster_clock_class: 6,
            grandmaster_clock_accuracy: 0x21,
            grandmaster_offset_scaled_log_variance: 0x4000,
            grandmaster_priority_2: 128,
            grandmaster_identity: gm,
            steps_removed: steps,
            time_source: 0xa0,
        }
    }

    #[test]
    fn scenario_1_cold_start_selects_master_after_fourth_announce() {
        let mut d = domain();
        let body = announce_body(0xA, 0);
        let mut events = Vec::new();
        for seq in 1..=4u16 {
            let header = announce_header(MASTER_A, seq);
            events = d.handle_announce(MASTER_A, OWN, &header, &body, seq as i64 * 1_000_000_000);
        }
        assert!(events.iter().any(|e| matches!(e, PtpStatisticsEvent::BestMasterClockSelected { master, .. } if *master == MASTER_A)));
        assert_eq!(d.master(), Some(MASTER_A));
    }

    #[test]
    fn scenario_5_non_monotone_t1_is_rejected() {
        let mut d = domain();
        d.select_master(MASTER_A, 0xA);

        let header1 = Header { sequence_id: 1, ..announce_header(MASTER_A, 1) };
        let sync1 = SyncBody { origin_timestamp: PtpTimestamp::from_nanos(2_000_000_000) };
        d.handle_sync(MASTER_A, OWN, &header1, &sync1, 10);
        assert_eq!(d.last_ptp_sync_time, 2_000_000_000);

        let header2 = Header { sequence_id: 2, ..announce_header(MASTER_A, 2) };
        let sync2 = SyncBody { origin_timestamp: PtpTimestamp::from_nanos(1_900_000_000) };
        let events = d.handle_sync(MASTER_A, OWN, &header2, &sync2, 20);
        assert!(events.is_empty());
        assert_eq!(d.last_ptp_sync_time, 2_000_000_000);
        assert!(!d.pending_syncs.iter().any(|p| p.sync_seqnum == 2));
    }

    #[test]
    fn scenario_6_delay_resp_from_wrong_requester_does_not_close_pending_sync() {
        let mut d = domain();
        d.select_master(MASTER_A, 0xA);

        let sync_header = Header { sequence_id: 10, flag_field: 0, ..announce_header(MASTER_A, 10) };
        let sync_body = SyncBody { origin_timestamp: PtpTimestamp::from_nanos(1_000_000_000) };
        d.handle_sync(MASTER_A, OWN, &sync_header, &sync_body, 1_000_001_000);
        d.attempt_send_delay_req(10, OWN, 1_000_002_000);

        let wrong_requester = ClockIdentity::new(0xDEAD, 9);
        let resp_header = Header { sequence_id: 10, ..announce_header(MASTER_A, 10) };
        let resp_body = DelayRespBody {
            receive_timestamp: PtpTimestamp::from_nanos(1_000_003_000),
            requesting_port_identity: wrong_requester,
        };
        let events = d.handle_delay_resp(MASTER_A, OWN, &resp_header, &resp_body, 1_000_004_000);
        assert!(events.is_empty());
        assert!(d.pending_syncs.iter().any(|p| p.sync_seqnum == 10));
    }

    #[test]
    fn own_echo_never_mutates_state() {
        let mut d = domain();
        let header = announce_header(OWN, 1);
        let body = announce_body(0xA, 0);
        let events = d.handle_announce(OWN, OWN, &header, &body, 0);
        assert!(events.is_empty());
        assert!(d.senders.is_empty());
    }

    #[test]
    fn opportunistic_sync_then_confirming_announce_updates_grandmaster() {
        let mut d = domain();
        let sync_header = Header { sequence_id: 1, flag_field: 0, ..announce_header(MASTER_A, 1) };
        let sync_body = SyncBody { origin_timestamp: PtpTimestamp::from_nanos(1_000_000_000) };

        let events = d.handle_sync(MASTER_A, OWN, &sync_header, &sync_body, 1);
        assert_eq!(d.master(), Some(MASTER_A));
        assert!(events.iter().any(|e| matches!(e, PtpStatisticsEvent::NewDomainFound { .. })));
        assert!(events.iter().any(|e|
            matches!(e, PtpStatisticsEvent::BestMasterClockSelected { master, grandmaster_identity, .. }
                if *master == MASTER_A && *grandmaster_identity == MASTER_A.clock_identity)
        ));

        let body = announce_body(0xA, 0);
        let mut confirm_events = Vec::new();
        for seq in 1..=4u16 {
            let header = announce_header(MASTER_A, seq);
            confirm_events = d.handle_announce(MASTER_A, OWN, &header, &body, seq as i64 * 1_000_000_000);
        }
        assert!(confirm_events.iter().any(|e|
            matches!(e, PtpStatisticsEvent::BestMasterClockSelected { master, grandmaster_identity, .. }
                if *master == MASTER_A && *grandmaster_identity == 0xA)
        ));
        assert_eq!(d.grandmaster_identity(), 0xA);
    }

    #[test]
    fn steps_removed_255_is_dropped() {
        let mut d = domain();
        let header = announce_header(MASTER_A, 1);
        let body = announce_body(0xA, 255);
        let events = d.handle_announce(MASTER_A, OWN, &header, &body, 0);
        assert!(events.is_empty());
        assert!(d.senders.is_empty());
    }
}
