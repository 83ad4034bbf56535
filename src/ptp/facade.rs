//! Per-domain facade (§4.I): the clock object handed out by `ptp::clock_new`.
//!
//! The reactor thread is the sole owner of `DomainState` (§5 "no nested locking"), so the
//! facade never reaches into it directly. Instead the reactor publishes a small
//! `DomainSnapshot` into a shared, mutex-protected registry after every state transition;
//! the facade reads that registry from whatever thread calls `now()`. This mirrors the
//! teacher's `status.rs` pattern of a worker thread publishing a snapshot struct for other
//! threads to read, generalised from one global snapshot to one per domain.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::clock::SystemClock;

use super::identity::ClockIdentity;
use super::stats::{HookId, PtpStatisticsEvent, StatisticsBus};
use super::timestamp::Nanos;

/// What the reactor publishes about a domain after each state transition.
#[derive(Debug, Clone, Copy, Default)]
pub struct DomainSnapshot {
    pub master: Option<ClockIdentity>,
    pub grandmaster_identity: u64,
    pub now_ptp: Option<Nanos>,
}

pub type DomainRegistry = Arc<Mutex<HashMap<u8, DomainSnapshot>>>;

pub fn new_registry() -> DomainRegistry {
    Arc::new(Mutex::new(HashMap::new()))
}

/// The facade clock exposed by `ptp::clock_new` (§6). `domain` is fixed at construction.
/// `now()` reports `None` ("GST_CLOCK_TIME_NONE") until the domain has selected a master
/// and completed one time update.
pub struct Clock {
    domain: u8,
    registry: DomainRegistry,
    stats: Arc<StatisticsBus>,
    bound: Arc<AtomicBool>,
    hook_id: Mutex<Option<HookId>>,
}

impl Clock {
    /// Subscribes to `time-updated` to lazily bind on this domain's first time update,
    /// then unsubscribes (§4.I) — after that the registry read in `now()` is enough.
    pub fn new(domain: u8, registry: DomainRegistry, stats: Arc<StatisticsBus>) -> Self {
        let bound = Arc::new(AtomicBool::new(false));
        let hook_bound = bound.clone();
        let hook_id = stats.subscribe(Box::new(move |event| match event {
            PtpStatisticsEvent::TimeUpdated { domain: event_domain, .. } if *event_domain == domain => {
                hook_bound.store(true, Ordering::SeqCst);
                false
            }
            _ => true,
        }));
        Clock { domain, registry, stats, bound, hook_id: Mutex::new(Some(hook_id)) }
    }

    pub fn domain(&self) -> u8 {
        self.domain
    }

    fn snapshot(&self) -> DomainSnapshot {
        self.registry
            .lock()
            .expect("domain registry mutex poisoned")
            .get(&self.domain)
            .copied()
            .unwrap_or_default()
    }

    /// `None` until bound; the domain's current estimated PTP time after.
    pub fn now(&self) -> Option<Nanos> {
        if !self.bound.load(Ordering::SeqCst) {
            return None;
        }
        self.snapshot().now_ptp
    }

    pub fn is_synced(&self) -> bool {
        self.now().is_some()
    }

    pub fn master_clock_id(&self) -> Option<ClockIdentity> {
        self.snapshot().master
    }

    pub fn grandmaster_clock_id(&self) -> Option<u64> {
        let snapshot = self.snapshot();
        snapshot.master.map(|_| snapshot.grandmaster_identity)
    }
}

impl Drop for Clock {
    fn drop(&mut self) {
        if let Some(id) = self.hook_id.lock().expect("facade hook id mutex poisoned").take() {
            self.stats.unsubscribe(id);
        }
    }
}

/// Subscribes permanently to `time-updated` for `domain` and disciplines `clock`
/// accordingly (§12 "the facade forwards to this layer once a domain is synced"): a
/// synced update adjusts the running rate, an unsynced one steps the clock by the
/// reported discontinuity instead. Returns the `HookId` so the caller can detach this
/// from `deinit`-equivalent teardown.
pub fn discipline_system_clock(stats: &StatisticsBus, domain: u8, mut clock: Box<dyn SystemClock + Send>) -> HookId {
    stats.subscribe(Box::new(move |event| {
        if let PtpStatisticsEvent::TimeUpdated { domain: event_domain, synced, discontinuity, rate, .. } = event {
            if *event_domain == domain {
                let result = if *synced {
                    clock.adjust_frequency(*rate)
                } else {
                    let offset = Duration::from_nanos(discontinuity.unsigned_abs());
                    let sign = if *discontinuity >= 0 { 1 } else { -1 };
                    clock.step_clock(offset, sign)
                };
                if let Err(e) = result {
                    log::warn!("domain {domain}: failed to discipline system clock: {e}");
                }
            }
        }
        true
    }))
}
