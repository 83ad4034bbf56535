//! The abstract calibrated-clock service the time-update engine drives (§4.F, §9
//! "Regression engine coupling", §11.L).
//!
//! The engine treats this purely as policy glue: it never performs the least-squares
//! fit itself. `RegressionClock` is the one concrete implementation this crate ships;
//! engine tests exercise the policy against a hand-fed mock instead.

use super::timestamp::Nanos;

/// A linear relation `external = external0 + (internal - internal0) * rate_num / rate_den`
/// between two monotonic time streams.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Calibration {
    pub internal: Nanos,
    pub external: Nanos,
    pub rate_num: i64,
    pub rate_den: i64,
}

impl Calibration {
    pub fn identity(internal: Nanos, external: Nanos) -> Self {
        Calibration { internal, external, rate_num: 1, rate_den: 1 }
    }

    /// Extrapolates `external` at a given `internal` time using this calibration.
    pub fn adjust(&self, internal: Nanos) -> Nanos {
        let delta = internal - self.internal;
        // rate_den is always > 0 by construction (see RegressionClock::fit).
        self.external + (delta as i128 * self.rate_num as i128 / self.rate_den as i128) as Nanos
    }
}

/// Abstract service the time-update engine (§4.F) drives. Implementations own the actual
/// regression numerics; the engine only reads/writes calibrations and asks for extrapolated
/// points, never touching the fit itself.
pub trait CalibratedClock: Send {
    fn get_calibration(&self) -> Calibration;
    fn set_calibration(&mut self, calibration: Calibration);

    /// Feeds an observation into the regression without committing it as the clock's
    /// active calibration. Returns the calibration that *would* result.
    fn add_observation_unapplied(&mut self, internal: Nanos, external: Nanos) -> Calibration;

    /// R² of the most recent `add_observation_unapplied` call's fit, if one has run.
    fn r_squared(&self) -> f64;
}

/// A windowed ordinary-least-squares regressor: the one concrete `CalibratedClock`.
/// Fits `external ~ internal` over the last `WINDOW` observations.
const WINDOW: usize = 32;

pub struct RegressionClock {
    calibration: Calibration,
    observations: Vec<(Nanos, Nanos)>,
    last_r_squared: f64,
}

impl RegressionClock {
    pub fn new() -> Self {
        RegressionClock {
            calibration: Calibration::identity(0, 0),
            observations: Vec::with_capacity(WINDOW),
            last_r_squared: 0.0,
        }
    }

    /// Ordinary least squares over the current observation window, expressed as a
    /// rational rate (num/den) to avoid floating point drift in the applied calibration.
    fn fit(&self, pivot_internal: Nanos, pivot_external: Nanos) -> (Calibration, f64) {
        let n = self.observations.len() as f64;
        if n < 2.0 {
            return (Calibration::identity(pivot_internal, pivot_external), 0.0);
        }

        let mean_x = self.observations.iter().map(|(x, _)| *x as f64).sum::<f64>() / n;
        let mean_y = self.observations.iter().map(|(_, y)| *y as f64).sum::<f64>() / n;

        let mut cov_xy = 0.0;
        let mut var_x = 0.0;
        for (x, y) in &self.observations {
            let dx = *x as f64 - mean_x;
            let dy = *y as f64 - mean_y;
            cov_xy += dx * dy;
            var_x += dx * dx;
        }

        if var_x <= f64::EPSILON {
            return (Calibration::identity(pivot_internal, pivot_external), 0.0);
        }

        let rate = cov_xy / var_x;
        let intercept = mean_y - rate * mean_x;

        let mut ss_res = 0.0;
        let mut ss_tot = 0.0;
        for (x, y) in &self.observations {
            let predicted = intercept + rate * *x as f64;
            ss_res += (*y as f64 - predicted).powi(2);
            ss_tot += (*y as f64 - mean_y).powi(2);
        }
        let r_squared = if ss_tot <= f64::EPSILON { 1.0 } else { 1.0 - ss_res / ss_tot };

        // Represent the fitted rate as a rational with a fixed denominator; this keeps
        // Calibration::adjust exact integer arithmetic rather than re-floating every call.
        const RATE_DEN: i64 = 1 << 20;
        let rate_num = (rate * RATE_DEN as f64).round() as i64;

        let external_at_pivot = intercept + rate * pivot_internal as f64;
        let calibration = Calibration {
            internal: pivot_internal,
            external: external_at_pivot.round() as Nanos,
            rate_num,
            rate_den: RATE_DEN,
        };

        (calibration, r_squared)
    }
}

impl Default for RegressionClock {
    fn default() -> Self {
        Self::new()
    }
}

impl CalibratedClock for RegressionClock {
    fn get_calibration(&self) -> Calibration {
        self.calibration
    }

    fn set_calibration(&mut self, calibration: Calibration) {
        self.calibration = calibration;
    }

    fn add_observation_unapplied(&mut self, internal: Nanos, external: Nanos) -> Calibration {
        if self.observations.len() == WINDOW {
            self.observations.remove(0);
        }
        self.observations.push((internal, external));

        let (calibration, r_squared) = self.fit(internal, external);
        self.last_r_squared = r_squared;
        calibration
    }

    fn r_squared(&self) -> f64 {
        self.last_r_squared
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_calibration_is_pass_through() {
        let cal = Calibration::identity(1_000, 1_000);
        assert_eq!(cal.adjust(1_500), 1_500);
    }

    #[test]
    fn adjust_applies_rate() {
        let cal = Calibration { internal: 0, external: 0, rate_num: 3, rate_den: 2 };
        assert_eq!(cal.adjust(1000), 1500);
    }

    #[test]
    fn single_observation_snaps_to_identity() {
        let mut clock = RegressionClock::new();
        let cal = clock.add_observation_unapplied(10, 20);
        assert_eq!(cal.internal, 10);
        assert_eq!(cal.external, 20);
    }

    #[test]
    fn fits_a_perfect_linear_relation() {
        let mut clock = RegressionClock::new();
        let mut cal = Calibration::identity(0, 0);
        for i in 0..10i64 {
            let internal = i * 1_000_000_000;
            let external = internal + 500; // constant +500ns offset, rate 1
            cal = clock.add_observation_unapplied(internal, external);
        }
        assert!((clock.r_squared() - 1.0).abs() < 1e-6);
        // predicted external at internal=9e9 should be close to 9_000_000_500
        assert!((cal.adjust(9_000_000_000) - 9_000_000_500).abs() < 1000);
    }
}
