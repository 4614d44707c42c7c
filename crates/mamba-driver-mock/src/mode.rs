//! Operational modes for simulated devices.
//!
//! - **Instant**: moves and exposures complete without delay, for unit tests
//! - **Realistic**: motors travel at their configured velocity and exposures
//!   take their configured time

use serde::Deserialize;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MockMode {
    #[default]
    Instant,
    Realistic,
}

impl MockMode {
    /// Delay to simulate for an operation nominally taking `secs`.
    pub fn delay(&self, secs: f64) -> Option<Duration> {
        match self {
            MockMode::Instant => None,
            MockMode::Realistic if secs > 0.0 && secs.is_finite() => {
                Some(Duration::from_secs_f64(secs))
            }
            MockMode::Realistic => None,
        }
    }
}

/// Motor update interval in realistic mode.
pub const MOTION_TICK: Duration = Duration::from_millis(10);
