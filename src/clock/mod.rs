//! The OS clock discipline layer: frequency/step control of the local system clock.
//!
//! Split by platform the way the rest of the crate is; the facade (`ptp::facade`) drives
//! this once a domain has synced, per SPEC_FULL.md §12.

use anyhow::Result;
use std::time::Duration;

#[cfg(unix)]
mod linux;
#[cfg(windows)]
mod windows;

#[cfg(unix)]
pub use linux::LinuxClock as PlatformClock;
#[cfg(windows)]
pub use windows::WindowsClock as PlatformClock;

#[cfg_attr(test, mockall::automock)]
pub trait SystemClock {
    /// Sets the clock's running rate. `factor` is a ratio: 1.0 is nominal speed.
    fn adjust_frequency(&mut self, factor: f64) -> Result<()>;

    /// Steps the clock by `offset` in the direction `sign` (positive = forward).
    fn step_clock(&mut self, offset: Duration, sign: i8) -> Result<()>;
}
