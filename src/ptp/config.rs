//! `PtpConfig` (§10): runtime-tunable knobs, nested into the crate's `SystemConfig` the way
//! `ServoConfig`/`FilterConfig` already are.
//!
//! Grounded on `config.rs`'s `SystemConfig`/`FilterConfig` nesting and per-platform `Default`
//! split.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::delay::FilterMode as DelayFilterMode;

/// Mirrors `ptp::delay::FilterMode` in a serde-friendly shape (the delay module's enum has
/// no dependency on serde, so configuration owns the conversion at the boundary).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FilterMode {
    Filtered,
    StrictIeee,
}

impl From<FilterMode> for DelayFilterMode {
    fn from(mode: FilterMode) -> Self {
        match mode {
            FilterMode::Filtered => DelayFilterMode::Filtered,
            FilterMode::StrictIeee => DelayFilterMode::StrictIeee,
        }
    }
}

fn default_announce_receipt_timeout_intervals() -> u32 {
    4
}

fn default_cleanup_tick() -> Duration {
    Duration::from_secs(5)
}

fn default_min_pending_sync_timeout() -> Duration {
    Duration::from_secs(10)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PtpConfig {
    #[serde(default = "default_filter_mode")]
    pub filter_mode: FilterMode,

    #[serde(default = "default_opportunistic")]
    pub opportunistic_master_selection: bool,

    #[serde(default = "default_announce_receipt_timeout_intervals")]
    pub announce_receipt_timeout_intervals: u32,

    #[serde(default = "default_cleanup_tick")]
    pub cleanup_tick: Duration,

    #[serde(default = "default_min_pending_sync_timeout")]
    pub min_pending_sync_timeout: Duration,

    #[serde(default)]
    pub helper_path_override: Option<PathBuf>,

    #[serde(default)]
    pub helper_verbose: bool,

    #[serde(default)]
    pub interfaces: Vec<String>,

    /// Pins the helper's own clock identity instead of letting it derive one from a MAC
    /// address (§6 `init`'s optional `clock_id`), passed to the helper as `-c 0x{:016x}`.
    #[serde(default)]
    pub clock_id: Option<u64>,
}

fn default_filter_mode() -> FilterMode {
    FilterMode::Filtered
}

fn default_opportunistic() -> bool {
    true
}

impl Default for PtpConfig {
    fn default() -> Self {
        #[cfg(windows)]
        let helper_path_override = None;
        #[cfg(not(windows))]
        let helper_path_override = None;

        PtpConfig {
            filter_mode: default_filter_mode(),
            opportunistic_master_selection: default_opportunistic(),
            announce_receipt_timeout_intervals: default_announce_receipt_timeout_intervals(),
            cleanup_tick: default_cleanup_tick(),
            min_pending_sync_timeout: default_min_pending_sync_timeout(),
            helper_path_override,
            helper_verbose: false,
            interfaces: Vec::new(),
            clock_id: None,
        }
    }
}

impl PtpConfig {
    /// The order §6 specifies for resolving the helper binary: explicit override first,
    /// then the two environment variables, finally a platform install path.
    pub fn resolve_helper_path(&self) -> PathBuf {
        if let Some(path) = &self.helper_path_override {
            return path.clone();
        }
        if let Ok(path) = std::env::var("GST_PTP_HELPER_1_0") {
            return PathBuf::from(path);
        }
        if let Ok(path) = std::env::var("GST_PTP_HELPER") {
            return PathBuf::from(path);
        }
        #[cfg(windows)]
        {
            PathBuf::from(r"C:\ProgramData\DanteSync\gst-ptp-helper.exe")
        }
        #[cfg(not(windows))]
        {
            PathBuf::from("/usr/libexec/gst-ptp-helper")
        }
    }

    pub fn verbose_from_env(&self) -> bool {
        if self.helper_verbose {
            return true;
        }
        match std::env::var("GST_PTP_HELPER_VERBOSE") {
            Ok(v) => v != "no",
            Err(_) => false,
        }
    }
}
