//! Cycle-accurate timestamps and self-calibration for benchmarking on x86-class CPUs.
//!
//! The crate reads the CPU time-stamp counter (TSC) in two modes, measures how much
//! a back-to-back read costs, and estimates the counter frequency so that raw cycle
//! deltas can be expressed in wall-clock units.
//!
//! Typical use:
//!   1) estimate the frequency once at start-up (it sleeps, so it's expensive) and keep it
//!   2) bracket hot code with [`read`] and keep the raw deltas
//!   3) convert the deltas with [`to_ns`] and friends using the cached frequency
//!
//! Cycle counts are only comparable when both reads happen on the same logical CPU.
//! This library does not pin threads; callers that need meaningful deltas must keep the
//! measuring thread on one core themselves (or accept wider variance).

#[cfg(not(any(target_arch = "x86", target_arch = "x86_64")))]
compile_error!("tscbench supports only x86 and x86_64 targets: no cycle counter instruction is available");

mod calibration;
pub mod config;
mod conversion;
mod frequency;
mod overhead;
mod reader;

use std::fmt;

pub use calibration::Calibration;
pub use config::CalibrationConfig;
pub use conversion::{secs_before_wrap, to_ms, to_ns, to_s, to_us, FastConverter};
pub use frequency::{
    cached_frequency, estimate_frequency_averaged, estimate_frequency_via_sleep, filtered_mean,
    reported_frequency, ClockFrequency,
};
pub use overhead::{measure_overhead, measure_overhead_distribution, OverheadStats, ReadOverhead};
pub use reader::{CycleReader, NativeReader, Tsc};

/// Raw value of the cycle counter
///
/// Has no absolute meaning: only deltas between two counts taken on the same logical
/// CPU are meaningful.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CycleCount(pub u64);

impl CycleCount {
    /// Number of ticks
    #[inline]
    pub fn get(self) -> u64 {
        self.0
    }

    /// Ticks elapsed since `earlier`. Saturates to zero if the counter appears to have
    /// gone backwards (which only happens after a core migration)
    #[inline]
    pub fn elapsed_since(self, earlier: CycleCount) -> CycleCount {
        CycleCount(self.0.saturating_sub(earlier.0))
    }

    /// Checked subtraction. Computes `self - other`,
    /// returning `None` if underflow occurred.
    #[inline]
    pub fn checked_sub(self, other: CycleCount) -> Option<CycleCount> {
        self.0.checked_sub(other.0).map(CycleCount)
    }

    #[inline]
    pub fn to_ns(self, frequency: ClockFrequency) -> f64 {
        to_ns(self, frequency)
    }

    #[inline]
    pub fn to_us(self, frequency: ClockFrequency) -> f64 {
        to_us(self, frequency)
    }

    #[inline]
    pub fn to_ms(self, frequency: ClockFrequency) -> f64 {
        to_ms(self, frequency)
    }

    #[inline]
    pub fn to_s(self, frequency: ClockFrequency) -> f64 {
        to_s(self, frequency)
    }
}

impl From<u64> for CycleCount {
    fn from(ticks: u64) -> Self {
        CycleCount(ticks)
    }
}

impl fmt::Display for CycleCount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} cycles", self.0)
    }
}

/// Which instruction is used to read the counter, and therefore which ordering
/// guarantee holds around the read
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReadMode {
    /// Plain `rdtsc`. Cheapest, but the CPU may execute it earlier or later than its
    /// position in program order
    Unserialized,
    /// `rdtscp` followed by `lfence`. Every earlier instruction retires before the counter
    /// is sampled, and no later instruction starts before the read completes
    Serialized,
}

impl ReadMode {
    pub const ALL: [ReadMode; 2] = [ReadMode::Unserialized, ReadMode::Serialized];
}

impl fmt::Display for ReadMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReadMode::Unserialized => f.pad("rdtsc"),
            ReadMode::Serialized => f.pad("rdtscp"),
        }
    }
}

/// Read the cycle counter of the current logical CPU
#[inline(always)]
pub fn read(mode: ReadMode) -> CycleCount {
    CycleCount(NativeReader::read(mode))
}
