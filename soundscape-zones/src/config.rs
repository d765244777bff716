//! Zone tuning.

use std::time::Duration;

#[derive(Debug, Clone, PartialEq)]
pub struct ZoneConfig {
    /// Radius around the listener inside which non-containing zones are
    /// audible, in metres.
    pub proximity_threshold_m: f64,
    /// Minimum time between two proximity recomputations.
    pub recompute_interval: Duration,
    /// Spatial hash cell edge, in degrees.
    pub cell_size_deg: f64,
}

impl Default for ZoneConfig {
    fn default() -> Self {
        Self {
            proximity_threshold_m: 50.0,
            recompute_interval: Duration::from_millis(500),
            cell_size_deg: 0.001,
        }
    }
}

impl ZoneConfig {
    /// No throttling, so every update recomputes.
    pub fn for_testing() -> Self {
        Self {
            recompute_interval: Duration::ZERO,
            ..Self::default()
        }
    }

    pub fn with_proximity_threshold(mut self, metres: f64) -> Self {
        self.proximity_threshold_m = metres;
        self
    }

    pub fn with_recompute_interval(mut self, interval: Duration) -> Self {
        self.recompute_interval = interval;
        self
    }

    pub fn validated(mut self) -> Self {
        if !self.proximity_threshold_m.is_finite() || self.proximity_threshold_m < 0.0 {
            self.proximity_threshold_m = 50.0;
        }
        if !self.cell_size_deg.is_finite() || self.cell_size_deg <= 0.0 {
            self.cell_size_deg = 0.001;
        }
        self
    }
}
