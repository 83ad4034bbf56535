use serde::{Deserialize, Serialize};

use crate::ptp::identity::ClockIdentity;

/// One PTP domain's sync state, shared via IPC: a snapshot struct written by the sync loop
/// and read by a status client, one entry per PTP domain.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
pub struct PtpDomainStatus {
    pub domain: u8,

    /// True once this domain has selected a master and completed one time update.
    pub synced: bool,

    /// Port identity of the currently selected master, if any.
    pub master_clock_id: Option<ClockIdentity>,

    /// Grandmaster clock identity as carried in the selected master's ANNOUNCE messages.
    pub grandmaster_identity: u64,

    /// This domain's current estimated PTP time, nanoseconds. `None` before first sync.
    pub ptp_time_ns: Option<i64>,
}

/// Sync status shared via IPC between the service and a status client.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct SyncStatus {
    /// Unix timestamp of last status update.
    pub updated_ts: u64,

    /// Last NTP offset measurement (microseconds), for the NTP fallback path.
    pub ntp_offset_us: i64,

    /// True when NTP sync has failed (can't reach server).
    pub ntp_failed: bool,

    /// One entry per configured PTP domain.
    pub domains: Vec<PtpDomainStatus>,
}

impl Default for SyncStatus {
    fn default() -> Self {
        SyncStatus { updated_ts: 0, ntp_offset_us: 0, ntp_failed: false, domains: Vec::new() }
    }
}

impl SyncStatus {
    pub fn domain(&self, domain: u8) -> Option<&PtpDomainStatus> {
        self.domains.iter().find(|d| d.domain == domain)
    }

    /// Replaces the entry for `status.domain`, inserting it if not already present.
    pub fn set_domain(&mut self, status: PtpDomainStatus) {
        match self.domains.iter_mut().find(|d| d.domain == status.domain) {
            Some(existing) => *existing = status,
            None => self.domains.push(status),
        }
    }
}
