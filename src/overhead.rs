//! Cost of reading the cycle counter.
//!
//! Reading the counter costs cycles itself, so any measured delta includes the cost of
//! one read-read pair. The routines here estimate that baseline for each [`ReadMode`].
//!
//! The mean is sensitive to outliers: a single context switch inside the loop inflates
//! it. A result orders of magnitude above the usual few dozen cycles means the
//! scheduler interfered, not that something is broken. Use
//! [`measure_overhead_distribution`] when a robust figure (minimum, median) is needed.

use anyhow::{bail, Result};
use log::debug;

use crate::reader::{CycleReader, NativeReader};
use crate::ReadMode;

#[inline(always)]
fn mean_pair_cost<F>(read: F, iterations: u64) -> f64
where
    F: Fn() -> u64,
{
    let mut cost = 0.0;
    for _ in 0..iterations {
        let first = read();
        let second = read();
        cost += second.saturating_sub(first) as f64;
    }
    cost / iterations as f64
}

/// Mean number of cycles between two back-to-back reads in `mode`, over `iterations`
/// trials. Returns 0.0 when `iterations` is zero
pub fn measure_overhead(mode: ReadMode, iterations: u64) -> f64 {
    if iterations == 0 {
        return 0.0;
    }

    let mean = match mode {
        ReadMode::Unserialized => mean_pair_cost(NativeReader::read_unserialized, iterations),
        ReadMode::Serialized => mean_pair_cost(NativeReader::read_serialized, iterations),
    };
    debug!("{} overhead: {:.2} cycles (mean of {} pairs)", mode, mean, iterations);

    mean
}

/// Distribution of the cost of a read-read pair, in cycles
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct OverheadStats {
    pub min: u64,
    pub median: u64,
    pub p99: u64,
    pub mean: f64,
}

impl OverheadStats {
    /// Summarize raw pair costs. `samples` must not be empty
    fn from_samples(samples: &mut [u64]) -> Self {
        samples.sort_unstable();
        let n = samples.len();
        let mean = samples.iter().map(|&s| s as f64).sum::<f64>() / n as f64;

        Self {
            min: samples[0],
            median: samples[n / 2],
            p99: samples[(n * 99) / 100],
            mean,
        }
    }
}

/// Like [`measure_overhead`], but keeps every pair cost and reports order statistics
///
/// Allocates one `u64` per iteration up front, outside the measured loop.
pub fn measure_overhead_distribution(mode: ReadMode, iterations: usize) -> Result<OverheadStats> {
    if iterations == 0 {
        bail!("Overhead distribution needs at least one iteration");
    }

    let mut samples = Vec::with_capacity(iterations);
    match mode {
        ReadMode::Unserialized => {
            for _ in 0..iterations {
                let first = NativeReader::read_unserialized();
                let second = NativeReader::read_unserialized();
                samples.push(second.saturating_sub(first));
            }
        }
        ReadMode::Serialized => {
            for _ in 0..iterations {
                let first = NativeReader::read_serialized();
                let second = NativeReader::read_serialized();
                samples.push(second.saturating_sub(first));
            }
        }
    }

    let stats = OverheadStats::from_samples(&mut samples);
    debug!(
        "{} overhead over {} pairs: min={}, median={}, p99={}, mean={:.2}",
        mode, iterations, stats.min, stats.median, stats.p99, stats.mean
    );

    Ok(stats)
}

/// Mean read-read cost for both read modes, in cycles
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ReadOverhead {
    pub unserialized: f64,
    pub serialized: f64,
}

impl ReadOverhead {
    pub fn measure(iterations: u64) -> Self {
        Self {
            unserialized: measure_overhead(ReadMode::Unserialized, iterations),
            serialized: measure_overhead(ReadMode::Serialized, iterations),
        }
    }

    pub fn for_mode(&self, mode: ReadMode) -> f64 {
        match mode {
            ReadMode::Unserialized => self.unserialized,
            ReadMode::Serialized => self.serialized,
        }
    }
}
