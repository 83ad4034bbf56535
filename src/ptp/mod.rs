//! Public API surface: process-wide `init`/`deinit`, facade clock construction, and the
//! statistics callback registry.
//!
//! The runtime is an explicit process-wide object built at `init()` and dropped at
//! `deinit()`, guarded by a mutex, never lazy-initialized behind an unsynchronized flag
//! check, mirroring `main.rs`'s single-instance guard and `status.rs`'s shared-snapshot
//! publishing.

pub mod bmca;
pub mod calibration;
pub mod config;
pub mod delay;
pub mod domain;
pub mod engine;
pub mod facade;
pub mod framing;
pub mod identity;
pub mod pending;
pub mod scheduler;
pub mod stats;
pub mod timestamp;
pub mod wire;

use std::sync::Mutex;

use crate::clock::SystemClock;

use self::config::PtpConfig;
use self::facade::Clock;
use self::identity::ClockIdentity;
use self::scheduler::PtpRuntime;
use self::stats::{HookId, PtpStatisticsEvent};

/// Built by `init()`, torn down by `deinit()`. `None` before the first successful `init()`
/// or after `deinit()` — there is no lazily-initialized path into `Some`.
static RUNTIME: Mutex<Option<PtpRuntime>> = Mutex::new(None);

/// This crate's helper-process architecture only has a unix and a windows leg.
pub fn is_supported() -> bool {
    cfg!(any(unix, windows))
}

pub fn is_initialized() -> bool {
    RUNTIME.lock().expect("ptp runtime mutex poisoned").as_ref().is_some_and(|r| r.is_initialized())
}

/// Spawns the PTP helper and starts the reactor if not already running, blocking until the
/// helper's clock id is known or it fails to start (§6 `init`). Idempotent: calling again
/// while already running is a no-op success. A prior failed call is not retried — `deinit`
/// (a no-op in that state) followed by `init` is the way to try again.
pub fn init(config: PtpConfig, domains: Vec<u8>) -> bool {
    if !is_supported() {
        return false;
    }
    let mut guard = RUNTIME.lock().expect("ptp runtime mutex poisoned");
    if guard.is_some() {
        return true;
    }
    match PtpRuntime::init(config, domains) {
        Ok(runtime) => {
            *guard = Some(runtime);
            true
        }
        Err(e) => {
            log::error!("PTP init failed: {e}");
            false
        }
    }
}

/// Tears down the helper process and reactor thread. Safe from any thread, including
/// after a failed `init()`, in which case it is a no-op.
pub fn deinit() {
    let mut guard = RUNTIME.lock().expect("ptp runtime mutex poisoned");
    *guard = None; // PtpRuntime::drop joins the reactor thread and kills the helper.
}

pub fn own_identity() -> Option<ClockIdentity> {
    RUNTIME.lock().expect("ptp runtime mutex poisoned").as_ref().map(|r| r.own_identity())
}

/// Creates a facade clock for `domain`, implicitly calling `init` with a default config
/// restricted to this one domain if the runtime isn't already running (§6 `clock_new`).
/// If the runtime is already running for a different set of domains, `domain` must have
/// been among them; this crate fixes its domain set at `init` time rather than growing it
/// on demand, matching how a Dante PTP deployment declares its domain upfront.
pub fn clock_new(domain: u8) -> Option<Clock> {
    if !is_initialized() && !init(PtpConfig::default(), vec![domain]) {
        return None;
    }
    let guard = RUNTIME.lock().expect("ptp runtime mutex poisoned");
    let runtime = guard.as_ref()?;
    Some(Clock::new(domain, runtime.registry(), runtime.statistics()))
}

pub fn statistics_callback_add(cb: impl FnMut(&PtpStatisticsEvent) -> bool + Send + 'static) -> Option<HookId> {
    let guard = RUNTIME.lock().expect("ptp runtime mutex poisoned");
    Some(guard.as_ref()?.statistics().subscribe(Box::new(cb)))
}

pub fn statistics_callback_remove(id: HookId) {
    if let Some(runtime) = RUNTIME.lock().expect("ptp runtime mutex poisoned").as_ref() {
        runtime.statistics().unsubscribe(id);
    }
}

/// Hands `clock` to the facade layer (§12 "the facade forwards to this layer once a domain
/// is synced") so it gets disciplined on every `time-updated` event for `domain`. `None` if
/// the runtime isn't running. The returned `HookId` can be passed to
/// `statistics_callback_remove` to stop disciplining before `deinit`.
pub fn discipline_system_clock(domain: u8, clock: Box<dyn SystemClock + Send>) -> Option<HookId> {
    let guard = RUNTIME.lock().expect("ptp runtime mutex poisoned");
    let runtime = guard.as_ref()?;
    Some(facade::discipline_system_clock(&runtime.statistics(), domain, clock))
}
