//! Path-delay filter (§4.E): median pre-filter plus running average of the mean path delay.
//!
//! Grounded on `update_mean_path_delay` in the original GStreamer PTP clock source, including
//! its somewhat counterintuitive ordering: the running average is updated before the
//! measurement-filtering gates run, so a rejected sample (by the gates, not the median
//! pre-filter) still nudges the average — only the feed to the time-update engine is skipped.
//! See DESIGN.md for the grounding note on this ordering.

use std::collections::VecDeque;

use super::timestamp::Nanos;

const RING_CAPACITY: usize = 9;
const MIN_FILTER_WINDOW_NS: Nanos = 100_000_000; // 100ms
const FILTER_WINDOW_MULTIPLIER: Nanos = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterMode {
    /// Median pre-filter + running average + measurement-filtering gates. Default.
    Filtered,
    /// Raw IEEE 1588 §11.3 sample used directly as the mean path delay, no filtering.
    StrictIeee,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PathDelayOutcome {
    /// The median pre-filter rejected this sample outright; the running average is untouched
    /// and the sample never reaches the time-update engine.
    RejectedByMedian,
    Accepted {
        mean_path_delay: Nanos,
        /// Whether this sample should be handed to §4.F. False when a measurement-filtering
        /// gate rejected it even though the running average was already updated.
        feed_engine: bool,
    },
}

/// Computes the raw one-way delay sample from a completed four-timestamp tuple.
/// Correction fields are 48.16 fixed-point nanoseconds (raw subunits).
pub fn raw_sample(t1: Nanos, t2: Nanos, t3: Nanos, t4: Nanos, corr_sync: i64, corr_delay: i64) -> Nanos {
    let corr = (corr_sync + corr_delay + 32768) / 65536;
    ((t4 - t1) + (t2 - t3) - corr) / 2
}

fn median_of(ring: &VecDeque<Nanos>) -> Nanos {
    let mut sorted: Vec<Nanos> = ring.iter().copied().collect();
    sorted.sort_unstable();
    sorted[sorted.len() / 2]
}

pub struct PathDelayFilter {
    mode: FilterMode,
    ring: VecDeque<Nanos>,
    missing: u8,
    initialized: bool,
    pub mean_path_delay: Nanos,
}

impl PathDelayFilter {
    pub fn new(mode: FilterMode) -> Self {
        PathDelayFilter {
            mode,
            ring: VecDeque::with_capacity(RING_CAPACITY),
            missing: RING_CAPACITY as u8,
            initialized: false,
            mean_path_delay: 0,
        }
    }

    /// Processes one raw sample. `follow_up_delay` is `follow_up_recv_time_local - t2`
    /// (absent for one-step SYNCs); `delay_req_rtt` is `t4 - t3`.
    pub fn process(&mut self, d_raw: Nanos, follow_up_delay: Option<Nanos>, delay_req_rtt: Nanos) -> PathDelayOutcome {
        if self.mode == FilterMode::StrictIeee {
            self.mean_path_delay = d_raw;
            return PathDelayOutcome::Accepted { mean_path_delay: self.mean_path_delay, feed_engine: true };
        }

        if self.ring.len() == RING_CAPACITY {
            self.ring.pop_front();
        }
        self.ring.push_back(d_raw);

        if self.missing > 0 {
            self.missing -= 1;
        } else {
            let median = median_of(&self.ring);
            if d_raw > 2 * median {
                return PathDelayOutcome::RejectedByMedian;
            }
        }

        if !self.initialized {
            self.mean_path_delay = d_raw;
            self.initialized = true;
        } else if d_raw < self.mean_path_delay {
            self.mean_path_delay = (3 * self.mean_path_delay + d_raw) / 4;
        } else {
            self.mean_path_delay = (15 * self.mean_path_delay + d_raw) / 16;
        }

        let gate_window = (FILTER_WINDOW_MULTIPLIER * self.mean_path_delay).max(MIN_FILTER_WINDOW_NS);
        let mut feed_engine = true;
        if let Some(fu_delay) = follow_up_delay {
            if fu_delay > gate_window {
                feed_engine = false;
            }
        }
        if feed_engine && d_raw > 2 * self.mean_path_delay {
            feed_engine = false;
        }
        if feed_engine && delay_req_rtt > gate_window {
            feed_engine = false;
        }

        PathDelayOutcome::Accepted { mean_path_delay: self.mean_path_delay, feed_engine }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn raw_sample_matches_scenario_3() {
        let t1 = 1_000_000_000i64;
        let t2 = t1 + 1_000;
        let t3 = t1 + 10_000;
        let t4 = t1 + 11_000;
        assert_eq!(raw_sample(t1, t2, t3, t4, 0, 0), 1_000);
    }

    #[test]
    fn first_sample_initializes_mean() {
        let mut filter = PathDelayFilter::new(FilterMode::Filtered);
        match filter.process(1_000, None, 500) {
            PathDelayOutcome::Accepted { mean_path_delay, feed_engine } => {
                assert_eq!(mean_path_delay, 1_000);
                assert!(feed_engine);
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[test]
    fn running_average_pulls_toward_smaller_samples_faster() {
        let mut filter = PathDelayFilter::new(FilterMode::Filtered);
        filter.process(1_000, None, 500);
        match filter.process(500, None, 500) {
            PathDelayOutcome::Accepted { mean_path_delay, .. } => {
                assert_eq!(mean_path_delay, (3 * 1_000 + 500) / 4);
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[test]
    fn running_average_pulls_toward_larger_samples_slower() {
        let mut filter = PathDelayFilter::new(FilterMode::Filtered);
        filter.process(1_000, None, 500);
        match filter.process(2_000, None, 500) {
            PathDelayOutcome::Accepted { mean_path_delay, .. } => {
                assert_eq!(mean_path_delay, (15 * 1_000 + 2_000) / 16);
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[test]
    fn median_pre_filter_accepts_unconditionally_before_nine_samples() {
        let mut filter = PathDelayFilter::new(FilterMode::Filtered);
        for _ in 0..8 {
            filter.process(1_000, None, 500);
        }
        // A huge spike is still accepted by the median gate (only 8 samples collected so far).
        match filter.process(1_000_000, None, 500) {
            PathDelayOutcome::Accepted { .. } => {}
            other => panic!("expected acceptance during warmup, got {other:?}"),
        }
    }

    #[test]
    fn median_pre_filter_rejects_spike_once_warmed_up() {
        let mut filter = PathDelayFilter::new(FilterMode::Filtered);
        for _ in 0..9 {
            filter.process(1_000, None, 500);
        }
        assert_eq!(filter.process(1_000_000, None, 500), PathDelayOutcome::RejectedByMedian);
    }

    #[test]
    fn strict_ieee_mode_uses_raw_sample_directly() {
        let mut filter = PathDelayFilter::new(FilterMode::StrictIeee);
        filter.process(5_000, None, 500);
        match filter.process(50_000, None, 500) {
            PathDelayOutcome::Accepted { mean_path_delay, feed_engine } => {
                assert_eq!(mean_path_delay, 50_000);
                assert!(feed_engine);
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[test]
    fn measurement_filtering_gate_on_slow_delay_resp_blocks_feed_but_keeps_average() {
        let mut filter = PathDelayFilter::new(FilterMode::Filtered);
        filter.process(1_000, None, 500);
        let before = filter.mean_path_delay;
        match filter.process(1_100, None, 1_000_000_000) {
            PathDelayOutcome::Accepted { mean_path_delay, feed_engine } => {
                assert!(!feed_engine);
                assert_ne!(mean_path_delay, before);
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
    }
}
