//! Calibration settings.

use log::warn;

/// Number of back-to-back read pairs averaged by the overhead calibration. Large enough to
/// wash out scheduling noise and branch predictor warm-up
pub const DEFAULT_OVERHEAD_ITERATIONS: u64 = 10_000_000;

/// Length (in seconds) of the sleep used to match TSC ticks against wall-clock time. One
/// second keeps the scheduler's wake-up granularity a small fraction of the interval
pub const DEFAULT_CALIBRATION_SECS: f64 = 1.0;

/// Number of sleep-based frequency samples combined by the averaged estimator
pub const FREQUENCY_SAMPLE_COUNT: usize = 5;

/// Time conversion modulus (in seconds) used by the integer TSC-to-nanoseconds converter.
/// Bigger values allow smaller multipliers and hence lower accuracy
pub const TIME_CONVERSION_MODULUS_SECS: u64 = 10;

pub const NANOS_PER_SEC: f64 = 1e9;
pub const MICROS_PER_SEC: f64 = 1e6;
pub const MILLIS_PER_SEC: f64 = 1e3;

pub const ENV_OVERHEAD_ITERATIONS: &str = "TSCBENCH_OVERHEAD_ITERATIONS";
pub const ENV_CALIBRATION_SECS: &str = "TSCBENCH_CALIBRATION_SECS";
pub const ENV_FREQUENCY_SAMPLES: &str = "TSCBENCH_FREQUENCY_SAMPLES";

/// Settings for a full calibration run ([`crate::Calibration::run`]).
#[derive(Debug, Clone, PartialEq)]
pub struct CalibrationConfig {
    /// Read pairs per overhead measurement (default: 10,000,000).
    pub overhead_iterations: u64,

    /// Sleep interval per frequency sample, in seconds (default: 1.0).
    pub calibration_secs: f64,

    /// Frequency samples to combine (default: 5).
    pub frequency_samples: usize,
}

impl Default for CalibrationConfig {
    fn default() -> Self {
        Self {
            overhead_iterations: DEFAULT_OVERHEAD_ITERATIONS,
            calibration_secs: DEFAULT_CALIBRATION_SECS,
            frequency_samples: FREQUENCY_SAMPLE_COUNT,
        }
    }
}

impl CalibrationConfig {
    /// Defaults overridden by `TSCBENCH_*` environment variables. Values that don't parse
    /// (or make no sense, like a non-positive interval) are reported and ignored
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(raw) = lookup(ENV_OVERHEAD_ITERATIONS) {
            match raw.trim().parse::<u64>() {
                Ok(n) if n > 0 => config.overhead_iterations = n,
                _ => warn!("Ignoring {}={:?}: expected a positive integer", ENV_OVERHEAD_ITERATIONS, raw),
            }
        }

        if let Some(raw) = lookup(ENV_CALIBRATION_SECS) {
            match raw.trim().parse::<f64>() {
                Ok(secs) if secs.is_finite() && secs > 0.0 => config.calibration_secs = secs,
                _ => warn!("Ignoring {}={:?}: expected a positive number of seconds", ENV_CALIBRATION_SECS, raw),
            }
        }

        if let Some(raw) = lookup(ENV_FREQUENCY_SAMPLES) {
            match raw.trim().parse::<usize>() {
                Ok(n) if n > 0 => config.frequency_samples = n,
                _ => warn!("Ignoring {}={:?}: expected a positive integer", ENV_FREQUENCY_SAMPLES, raw),
            }
        }

        config
    }

    pub fn with_overhead_iterations(mut self, iterations: u64) -> Self {
        self.overhead_iterations = iterations;
        self
    }

    pub fn with_calibration_secs(mut self, secs: f64) -> Self {
        self.calibration_secs = secs;
        self
    }

    pub fn with_frequency_samples(mut self, samples: usize) -> Self {
        self.frequency_samples = samples;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key: &str| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = CalibrationConfig::default();
        assert_eq!(config.overhead_iterations, 10_000_000);
        assert_eq!(config.calibration_secs, 1.0);
        assert_eq!(config.frequency_samples, FREQUENCY_SAMPLE_COUNT);
    }

    #[test]
    fn test_env_overrides() {
        let config = CalibrationConfig::from_lookup(lookup_from(&[
            (ENV_OVERHEAD_ITERATIONS, "1000"),
            (ENV_CALIBRATION_SECS, " 0.25 "),
            (ENV_FREQUENCY_SAMPLES, "3"),
        ]));
        assert_eq!(config.overhead_iterations, 1000);
        assert_eq!(config.calibration_secs, 0.25);
        assert_eq!(config.frequency_samples, 3);
    }

    #[test]
    fn test_bad_env_values_are_ignored() {
        let config = CalibrationConfig::from_lookup(lookup_from(&[
            (ENV_OVERHEAD_ITERATIONS, "lots"),
            (ENV_CALIBRATION_SECS, "-1"),
            (ENV_FREQUENCY_SAMPLES, "0"),
        ]));
        assert_eq!(config, CalibrationConfig::default());
    }

    #[test]
    fn test_setters() {
        let config = CalibrationConfig::default()
            .with_overhead_iterations(42)
            .with_calibration_secs(0.5)
            .with_frequency_samples(2);
        assert_eq!(config.overhead_iterations, 42);
        assert_eq!(config.calibration_secs, 0.5);
        assert_eq!(config.frequency_samples, 2);
    }
}
