use serde::{Deserialize, Serialize};

use crate::ptp::config::PtpConfig;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemConfig {
    #[serde(default)]
    pub ptp: PtpConfig,
}

impl Default for SystemConfig {
    fn default() -> Self {
        SystemConfig { ptp: PtpConfig::default() }
    }
}
