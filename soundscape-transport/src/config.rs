//! Transport tuning.

use std::time::Duration;

/// Transport configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct TransportConfig {
    /// Base cadence of the drift corrector.
    pub corrector_interval: Duration,
    /// Random spread applied to each corrector delay, as a fraction of the
    /// base interval (0.3 = ±30%).  Keeps peers from ticking in lockstep.
    pub jitter_ratio: f64,
    /// Drift beyond which the engine position is snapped, in seconds.
    pub drift_threshold_secs: f64,
    pub min_bpm: f64,
    pub max_bpm: f64,
    pub default_bpm: f64,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            corrector_interval: Duration::from_millis(375),
            jitter_ratio: 0.3,
            drift_threshold_secs: 0.05,
            min_bpm: 20.0,
            max_bpm: 400.0,
            default_bpm: soundscape_core::DEFAULT_BPM,
        }
    }
}

impl TransportConfig {
    /// Fast, jitter-free cadence for tests.
    pub fn for_testing() -> Self {
        Self {
            corrector_interval: Duration::from_millis(10),
            jitter_ratio: 0.0,
            ..Self::default()
        }
    }

    pub fn with_corrector_interval(mut self, interval: Duration) -> Self {
        self.corrector_interval = interval;
        self
    }

    pub fn with_jitter_ratio(mut self, ratio: f64) -> Self {
        self.jitter_ratio = ratio;
        self
    }

    /// Clamp every field into a usable range.
    pub fn validated(mut self) -> Self {
        if self.corrector_interval.is_zero() {
            self.corrector_interval = Duration::from_millis(1);
        }
        self.jitter_ratio = if self.jitter_ratio.is_finite() {
            self.jitter_ratio.clamp(0.0, 0.9)
        } else {
            0.0
        };
        if !self.drift_threshold_secs.is_finite() || self.drift_threshold_secs < 0.0 {
            self.drift_threshold_secs = 0.05;
        }
        if !(self.min_bpm.is_finite() && self.min_bpm > 0.0) {
            self.min_bpm = 20.0;
        }
        if !(self.max_bpm.is_finite() && self.max_bpm >= self.min_bpm) {
            self.max_bpm = self.min_bpm.max(400.0);
        }
        self.default_bpm = if self.default_bpm.is_finite() {
            self.default_bpm.clamp(self.min_bpm, self.max_bpm)
        } else {
            soundscape_core::DEFAULT_BPM.clamp(self.min_bpm, self.max_bpm)
        };
        self
    }

    /// Clamp a finite tempo into the supported range.  `None` for NaN/∞.
    pub fn clamp_bpm(&self, bpm: f64) -> Option<f64> {
        bpm.is_finite().then(|| bpm.clamp(self.min_bpm, self.max_bpm))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = TransportConfig::default();
        assert_eq!(config.drift_threshold_secs, 0.05);
        assert_eq!(config.default_bpm, 120.0);
        assert_eq!(config.clone().validated(), config);
    }

    #[test]
    fn test_validated_clamps() {
        let config = TransportConfig {
            corrector_interval: Duration::ZERO,
            jitter_ratio: 5.0,
            drift_threshold_secs: f64::NAN,
            ..TransportConfig::default()
        }
        .validated();
        assert_eq!(config.corrector_interval, Duration::from_millis(1));
        assert_eq!(config.jitter_ratio, 0.9);
        assert_eq!(config.drift_threshold_secs, 0.05);
    }

    #[test]
    fn test_builders_go_through_validation() {
        let config = TransportConfig::default()
            .with_corrector_interval(Duration::from_millis(250))
            .with_jitter_ratio(0.2);
        assert_eq!(config.corrector_interval, Duration::from_millis(250));
        assert_eq!(config.jitter_ratio, 0.2);
        assert_eq!(config.clone().validated(), config);

        let config = TransportConfig::default().with_jitter_ratio(-1.0).validated();
        assert_eq!(config.jitter_ratio, 0.0);
    }

    #[test]
    fn test_clamp_bpm() {
        let config = TransportConfig::default();
        assert_eq!(config.clamp_bpm(10.0), Some(20.0));
        assert_eq!(config.clamp_bpm(1_000.0), Some(400.0));
        assert_eq!(config.clamp_bpm(-5.0), Some(20.0));
        assert_eq!(config.clamp_bpm(f64::INFINITY), None);
        assert_eq!(config.clamp_bpm(140.0), Some(140.0));
    }
}
