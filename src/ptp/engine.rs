//! Time-update engine (§4.F): turns a completed four-timestamp `PendingSync` into an
//! observation against the domain's calibrated clock, with a synced gate and a
//! discontinuity clamp so a single bad sample can't step the clock arbitrarily far.
//!
//! Grounded on `update_ptp_time` in the original GStreamer PTP clock source. Per §9's
//! "Regression engine coupling" note, this module only ever talks to the `CalibratedClock`
//! trait (§4.F/§11.L) — it never touches regression numerics directly.

use super::calibration::{CalibratedClock, Calibration};
use super::timestamp::Nanos;

/// Samples classified unsynced are tolerated this many times in a row before the engine
/// applies the new calibration unconditionally anyway (§4.F step 6).
pub const MAX_SKIPPED_UPDATES: u32 = 5;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TimeUpdateOutcome {
    pub mean_path_delay_avg: Nanos,
    pub local_time: Nanos,
    pub ptp_time: Nanos,
    pub estimated_ptp_time: Nanos,
    pub discontinuity: Nanos,
    pub synced: bool,
    pub r_squared: f64,
    pub internal_time: Nanos,
    pub external_time: Nanos,
    pub rate_num: i64,
    pub rate_den: i64,
}

impl TimeUpdateOutcome {
    pub fn rate(&self) -> f64 {
        self.rate_num as f64 / self.rate_den as f64
    }
}

/// Runs one time update. `first_observation` must be true exactly once per domain clock,
/// for the very first accepted observation (§4.F's "pure offset snap" initialisation).
pub fn update_ptp_time<C: CalibratedClock>(
    clock: &mut C,
    first_observation: bool,
    mean_path_delay: Nanos,
    skipped_updates: &mut u32,
    t1: Nanos,
    t2: Nanos,
    correction_field_sync: i64,
) -> TimeUpdateOutcome {
    let corrected_ptp_time = t1 + (correction_field_sync + 32768) / 65536;
    let corrected_local_time = t2 - mean_path_delay;

    if first_observation {
        clock.set_calibration(Calibration::identity(corrected_local_time, corrected_ptp_time));
    }

    let old_calibration = clock.get_calibration();
    let max_discont = (3 * mean_path_delay) / 2;

    let synced = is_within_window(&old_calibration, t2, max_discont, corrected_ptp_time);
    let estimated_ptp_time = old_calibration.adjust(t2);

    let mut proposed = clock.add_observation_unapplied(corrected_local_time, corrected_ptp_time);

    let new_estimate_at_t2 = proposed.adjust(t2);
    let discontinuity = new_estimate_at_t2 - estimated_ptp_time;

    if synced && discontinuity.abs() > max_discont {
        let clamped = estimated_ptp_time + max_discont * discontinuity.signum();
        proposed.internal = t2;
        proposed.external = clamped;
    }

    let now_synced = is_within_window(&proposed, t2, max_discont, corrected_ptp_time);

    let applied = synced || now_synced || *skipped_updates > MAX_SKIPPED_UPDATES;
    let final_calibration = if applied {
        clock.set_calibration(proposed);
        *skipped_updates = 0;
        proposed
    } else {
        *skipped_updates += 1;
        old_calibration
    };

    TimeUpdateOutcome {
        mean_path_delay_avg: mean_path_delay,
        local_time: corrected_local_time,
        ptp_time: corrected_ptp_time,
        estimated_ptp_time,
        discontinuity,
        synced,
        r_squared: clock.r_squared(),
        internal_time: final_calibration.internal,
        external_time: final_calibration.external,
        rate_num: final_calibration.rate_num,
        rate_den: final_calibration.rate_den,
    }
}

fn is_within_window(calibration: &Calibration, t2: Nanos, max_discont: Nanos, sample: Nanos) -> bool {
    let lo = calibration.adjust(t2 - max_discont);
    let hi = calibration.adjust(t2 + max_discont);
    let (lo, hi) = if lo <= hi { (lo, hi) } else { (hi, lo) };
    sample >= lo && sample <= hi
}
