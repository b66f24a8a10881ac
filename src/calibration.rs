use anyhow::{bail, Context, Result};
use log::info;

use crate::config::CalibrationConfig;
use crate::frequency::calibration_interval;
use crate::{estimate_frequency_averaged, ClockFrequency, CycleCount, ReadMode, ReadOverhead};

/// Result of a full calibration: read overhead for both modes plus the clock frequency
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Calibration {
    pub overhead: ReadOverhead,
    pub frequency: ClockFrequency,
}

impl Calibration {
    /// Measure everything `config` asks for. Blocks for roughly
    /// `config.frequency_samples * config.calibration_secs` seconds
    pub fn run(config: &CalibrationConfig) -> Result<Self> {
        calibration_interval(config.calibration_secs).context("Invalid calibration settings")?;
        if config.frequency_samples == 0 {
            bail!("Invalid calibration settings: at least one frequency sample is required");
        }

        info!(
            "Calibrating: {} overhead iterations, {} x {} s frequency samples",
            config.overhead_iterations, config.frequency_samples, config.calibration_secs
        );

        let overhead = ReadOverhead::measure(config.overhead_iterations);
        let frequency = estimate_frequency_averaged(config.calibration_secs, config.frequency_samples)
            .context("Error while estimating clock frequency")?;

        let calibration = Self { overhead, frequency };
        info!(
            "Read overhead: rdtsc {:.2} cycles ({:.2} ns), rdtscp {:.2} cycles ({:.2} ns)",
            overhead.unserialized,
            calibration.overhead_ns(ReadMode::Unserialized),
            overhead.serialized,
            calibration.overhead_ns(ReadMode::Serialized),
        );

        Ok(calibration)
    }

    /// Read overhead of `mode` in nanoseconds
    pub fn overhead_ns(&self, mode: ReadMode) -> f64 {
        self.overhead.for_mode(mode) / self.frequency.ticks_per_ns()
    }

    /// `delta` minus the read overhead of `mode`, in nanoseconds, clamped at zero
    pub fn net_ns(&self, delta: CycleCount, mode: ReadMode) -> f64 {
        (delta.to_ns(self.frequency) - self.overhead_ns(mode)).max(0.0)
    }
}
