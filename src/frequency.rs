use std::fmt;
use std::sync::OnceLock;
use std::thread;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use log::{debug, info, warn};

use crate::config::DEFAULT_CALIBRATION_SECS;
use crate::{read, ReadMode};

/// Cycle counter frequency in ticks per second
///
/// An empirical estimate, not a hardware constant. Measure it once and reuse it.
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd)]
pub struct ClockFrequency(f64);

impl ClockFrequency {
    #[inline]
    pub const fn from_hz(hz: f64) -> Self {
        ClockFrequency(hz)
    }

    #[inline]
    pub fn hz(self) -> f64 {
        self.0
    }

    #[inline]
    pub fn ghz(self) -> f64 {
        self.0 / 1e9
    }

    /// Ticks per nanosecond (~3.0 for a 3 GHz counter)
    #[inline]
    pub fn ticks_per_ns(self) -> f64 {
        self.ghz()
    }

    /// Relative distance from `other`, e.g. 0.05 for 5%
    pub fn relative_error(self, other: ClockFrequency) -> f64 {
        ((self.0 - other.0) / other.0).abs()
    }
}

impl From<f64> for ClockFrequency {
    fn from(hz: f64) -> Self {
        ClockFrequency(hz)
    }
}

impl fmt::Display for ClockFrequency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:.6} GHz", self.ghz())
    }
}

/// Logical CPU the calling thread is running on, when the platform can tell
#[cfg(target_os = "linux")]
fn current_cpu() -> Option<i32> {
    // SAFE: sched_getcpu has no preconditions
    let cpu_id = unsafe { libc::sched_getcpu() };
    (cpu_id >= 0).then_some(cpu_id)
}

#[cfg(not(target_os = "linux"))]
fn current_cpu() -> Option<i32> {
    None
}

/// CPU switch observed between two `current_cpu` readings, as (before, after)
fn migrated(before: Option<i32>, after: Option<i32>) -> Option<(i32, i32)> {
    match (before, after) {
        (Some(before), Some(after)) if before != after => Some((before, after)),
        _ => None,
    }
}

/// Sleep interval for `nominal_seconds`, rejecting values that are not positive and
/// finite or don't fit a `Duration`
pub(crate) fn calibration_interval(nominal_seconds: f64) -> Result<Duration> {
    if !nominal_seconds.is_finite() || nominal_seconds <= 0.0 {
        bail!("Calibration interval must be a positive number of seconds, got {}", nominal_seconds);
    }
    Duration::try_from_secs_f64(nominal_seconds)
        .with_context(|| format!("Calibration interval of {} s is too long", nominal_seconds))
}

/// Estimate the counter frequency by sleeping for `nominal_seconds` between two
/// serialized reads
///
/// `nominal_seconds` must be positive, finite and representable as a `Duration`
/// (below ~1.8e19 s); [`estimate_frequency_averaged`] checks this and reports an error
/// instead. The calling thread blocks for the whole interval; the sleep cannot be
/// cancelled. Accuracy degrades under frequency scaling or if the thread migrates to
/// another core while sleeping (the latter is logged, not reported). Call it once at
/// start-up and cache the result.
pub fn estimate_frequency_via_sleep(nominal_seconds: f64) -> ClockFrequency {
    let interval = calibration_interval(nominal_seconds);
    debug_assert!(interval.is_ok(), "{:?}", interval);
    let interval = interval.unwrap_or_default();

    let cpu_before = current_cpu();
    let start = read(ReadMode::Serialized);

    thread::sleep(interval);

    let end = read(ReadMode::Serialized);

    if let Some((before, after)) = migrated(cpu_before, current_cpu()) {
        warn!(
            "Thread migrated from CPU {} to CPU {} during frequency calibration; the estimate may be off",
            before, after
        );
    }

    let ticks = end.elapsed_since(start);
    let frequency = ClockFrequency(ticks.0 as f64 / nominal_seconds);
    debug!("{} over {} s sleep: {}", ticks, nominal_seconds, frequency);

    frequency
}

/// Mean of `samples` after dropping statistical outliers
///
/// Samples further than one corrected sample standard deviation from the mean are
/// discarded, and the remaining ones are averaged. Relating TSC ticks to a sleep is
/// noisy in both directions (wake-up latency, interrupts, migrations), so the errors
/// are treated as random and symmetric.
pub fn filtered_mean(samples: &[f64]) -> Result<f64> {
    if samples.is_empty() {
        bail!("No samples to average");
    }
    if let Some(bad) = samples.iter().find(|s| !s.is_finite()) {
        bail!("Sample {} is not a finite number", bad);
    }

    // Incremental (Welford) mean and sum of squared deviations
    let mut mean = 0.0;
    let mut s = 0.0;
    for (i, sample) in samples.iter().enumerate() {
        let delta = sample - mean;
        mean += delta / (i as f64 + 1.0);
        s += delta * (sample - mean);
    }

    let sigma = if samples.len() > 1 {
        (s / (samples.len() as f64 - 1.0)).sqrt()
    } else {
        0.0
    };

    let good: Vec<f64> = samples
        .iter()
        .copied()
        .filter(|sample| (sample - mean).abs() <= sigma)
        .collect();

    // The sample closest to the mean is always within one sigma, so this can't happen
    // unless rounding conspires against us
    if good.is_empty() {
        bail!("All {} samples were rejected as outliers", samples.len());
    }

    let rejected = samples.len() - good.len();
    if rejected > 0 {
        warn!("Rejected {} of {} samples as outliers (mean {}, sigma {})", rejected, samples.len(), mean, sigma);
    }

    let average = good.iter().sum::<f64>() / good.len() as f64;
    debug!("Mean: {}, corrected sample standard deviation: {}, filtered average: {}", mean, sigma, average);

    Ok(average)
}

/// Run [`estimate_frequency_via_sleep`] `samples` times and combine the results with
/// [`filtered_mean`]
pub fn estimate_frequency_averaged(nominal_seconds: f64, samples: usize) -> Result<ClockFrequency> {
    if samples == 0 {
        bail!("At least one frequency sample is required");
    }
    calibration_interval(nominal_seconds)?;

    let estimates: Vec<f64> = (0..samples)
        .map(|i| {
            let frequency = estimate_frequency_via_sleep(nominal_seconds);
            debug!("[Measurement {}] {}", i, frequency);
            frequency.hz()
        })
        .collect();

    let hz = filtered_mean(&estimates)
        .context("Error while cleaning clock frequency samples from random noise")?;
    let frequency = ClockFrequency(hz);
    info!("Clock frequency (calibrated over {} samples): {}", samples, frequency);

    Ok(frequency)
}

/// Frequency measured once per process with [`DEFAULT_CALIBRATION_SECS`] of sleep
///
/// The first call blocks for the calibration interval; later calls return the cached
/// value.
pub fn cached_frequency() -> ClockFrequency {
    static FREQUENCY: OnceLock<ClockFrequency> = OnceLock::new();

    *FREQUENCY.get_or_init(|| {
        let frequency = estimate_frequency_via_sleep(DEFAULT_CALIBRATION_SECS);
        info!("Clock frequency (calibrated): {}", frequency);
        frequency
    })
}

/// Try reading the TSC frequency from Linux sysfs
fn frequency_from_sysfs() -> Option<ClockFrequency> {
    let content = std::fs::read_to_string("/sys/devices/system/cpu/cpu0/tsc_freq_khz").ok()?;
    let khz = content.trim().parse::<u64>().ok()?;
    debug!("TSC frequency from sysfs: {} kHz", khz);
    Some(ClockFrequency(khz as f64 * 1e3))
}

/// Try reading the TSC frequency from CPUID leaf 0x15 (Time Stamp Counter and Nominal
/// Core Crystal Clock)
fn frequency_from_cpuid() -> Option<ClockFrequency> {
    #[cfg(target_arch = "x86")]
    use std::arch::x86::__cpuid;
    #[cfg(target_arch = "x86_64")]
    use std::arch::x86_64::__cpuid;

    // SAFE: every x86 CPU with a TSC also implements CPUID
    #[allow(unused_unsafe)]
    let max_leaf = unsafe { __cpuid(0) }.eax;
    if max_leaf < 0x15 {
        return None;
    }

    #[allow(unused_unsafe)]
    let leaf = unsafe { __cpuid(0x15) };
    let (denominator, numerator, crystal_hz) = (leaf.eax, leaf.ebx, leaf.ecx);
    if denominator == 0 || numerator == 0 || crystal_hz == 0 {
        return None;
    }

    let hz = crystal_hz as u64 * numerator as u64 / denominator as u64;
    debug!("TSC frequency from CPUID 0x15: {} Hz", hz);
    Some(ClockFrequency(hz as f64))
}

/// Frequency the platform advertises for the counter, if any
///
/// Checks sysfs first and CPUID second. Many CPUs and most hypervisors report neither,
/// in which case calibration is the only option.
pub fn reported_frequency() -> Option<ClockFrequency> {
    frequency_from_sysfs().or_else(frequency_from_cpuid)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_plausible(frequency: ClockFrequency) {
        // 100MHz to 10GHz
        assert!(
            frequency.hz() > 1e8 && frequency.hz() < 1e10,
            "implausible clock frequency: {}",
            frequency
        );
    }

    #[test]
    fn test_estimate_frequency_via_sleep() {
        assert_plausible(estimate_frequency_via_sleep(0.1));
    }

    #[test]
    fn test_filtered_mean_removes_outliers() {
        let samples = [
            3_000_000_000.0,
            3_000_000_100.0,
            3_000_000_050.0,
            3_000_000_080.0,
            3_000_000_020.0,
            3_500_000_000.0, // outlier
            3_000_000_030.0,
            3_000_000_060.0,
        ];

        let golden = filtered_mean(&samples).unwrap();
        assert!(
            golden > 3_000_000_000.0 && golden < 3_000_000_100.0,
            "filtered mean should ignore the outlier, got {}",
            golden
        );
    }

    #[test]
    fn test_filtered_mean_degenerate_inputs() {
        assert_eq!(filtered_mean(&[42.0]).unwrap(), 42.0);
        assert_eq!(filtered_mean(&[7.0, 7.0, 7.0]).unwrap(), 7.0);
        assert!(filtered_mean(&[]).is_err());
        assert!(filtered_mean(&[1.0, f64::NAN]).is_err());
    }

    #[test]
    fn test_estimate_frequency_averaged() {
        assert_plausible(estimate_frequency_averaged(0.05, 3).unwrap());
        assert!(estimate_frequency_averaged(0.05, 0).is_err());
    }

    #[test]
    fn test_averaged_rejects_bad_interval() {
        for secs in [0.0, -1.0, f64::NAN, f64::INFINITY, 1e30] {
            assert!(estimate_frequency_averaged(secs, 1).is_err(), "interval {} should be rejected", secs);
        }
    }

    #[test]
    fn test_calibration_interval() {
        assert_eq!(calibration_interval(0.25).unwrap(), Duration::from_millis(250));
        assert!(calibration_interval(0.0).is_err());
        assert!(calibration_interval(-0.5).is_err());
        assert!(calibration_interval(1e30).is_err());
    }

    #[test]
    fn test_migrated() {
        assert_eq!(migrated(Some(2), Some(2)), None);
        assert_eq!(migrated(Some(2), Some(5)), Some((2, 5)));
        assert_eq!(migrated(None, Some(5)), None);
        assert_eq!(migrated(Some(2), None), None);
        assert_eq!(migrated(None, None), None);
    }

    #[test]
    fn test_reported_frequency_is_plausible() {
        if let Some(frequency) = reported_frequency() {
            assert_plausible(frequency);
        }
    }

    #[test]
    fn test_relative_error() {
        let nominal = ClockFrequency::from_hz(3.0e9);
        assert!((ClockFrequency::from_hz(3.15e9).relative_error(nominal) - 0.05).abs() < 1e-12);
        assert_eq!(nominal.relative_error(nominal), 0.0);
    }

    #[test]
    fn test_ticks_per_ns() {
        let frequency = ClockFrequency::from_hz(3.2e9);
        assert_eq!(frequency.ticks_per_ns(), 3.2);
        assert_eq!(frequency.ticks_per_ns(), frequency.ghz());
    }

    #[test]
    fn test_display() {
        assert_eq!(ClockFrequency::from_hz(3.2e9).to_string(), "3.200000 GHz");
    }
}
