//! Microbenchmark to sanity-check cycle measurements
//!
//! This benchmark measures:
//! 1. Counter read overhead (rdtsc vs rdtscp)
//! 2. Known instruction latencies, bracketed by serialized reads
//! 3. Measurement consistency
//!
//! Run with: cargo run --example microbenchmark --release

use std::hint::black_box;

use log::info;
use simple_logger::SimpleLogger;
use tscbench::{measure_overhead_distribution, read, ReadMode};

const ITERATIONS: usize = 10_000;

/// Cycle cost of `f` bracketed by serialized reads: (min, median, p99)
fn measure<F: FnMut()>(mut f: F) -> (u64, u64, u64) {
    let mut measurements = Vec::with_capacity(ITERATIONS);

    for _ in 0..ITERATIONS {
        let start = read(ReadMode::Serialized);
        f();
        let end = read(ReadMode::Serialized);
        measurements.push(end.elapsed_since(start).get());
    }

    measurements.sort_unstable();
    (
        measurements[0],
        measurements[ITERATIONS / 2],
        measurements[(ITERATIONS * 99) / 100],
    )
}

fn nop_1() {
    // SAFE: nop has no effects
    unsafe { std::arch::asm!("nop", options(nomem, nostack)) }
}

fn nop_10() {
    // SAFE: nop has no effects
    unsafe {
        std::arch::asm!(
            "nop", "nop", "nop", "nop", "nop",
            "nop", "nop", "nop", "nop", "nop",
            options(nomem, nostack),
        )
    }
}

/// Dependency chain of 10 ADDs - cannot be parallelized
fn add_chain() {
    // SAFE: only modifies the scratch register passed in
    unsafe {
        std::arch::asm!(
            "add {0}, 1", "add {0}, 1", "add {0}, 1", "add {0}, 1", "add {0}, 1",
            "add {0}, 1", "add {0}, 1", "add {0}, 1", "add {0}, 1", "add {0}, 1",
            inout(reg) 0usize => _,
            options(nomem, nostack),
        )
    }
}

fn imul() {
    // SAFE: only modifies the scratch register passed in
    unsafe {
        std::arch::asm!(
            "imul {0}, {0}, 7",
            inout(reg) 42usize => _,
            options(nomem, nostack),
        )
    }
}

fn main() -> anyhow::Result<()> {
    SimpleLogger::new().init()?;

    info!("Measuring known instruction sequences. All figures in CPU cycles.");

    // Warm up
    for _ in 0..1000 {
        black_box(read(ReadMode::Unserialized));
    }

    for mode in ReadMode::ALL {
        let stats = measure_overhead_distribution(mode, ITERATIONS)?;
        info!(
            "{:<7} pair: min={:4} median={:4} p99={:4} mean={:.2}",
            mode, stats.min, stats.median, stats.p99, stats.mean
        );
    }

    let (base_min, base_median, base_p99) = measure(|| {});
    info!("Empty region:    min={:4} median={:4} p99={:4}", base_min, base_median, base_p99);

    let cases: [(&str, fn()); 4] = [
        ("1 NOP", nop_1),
        ("10 NOPs", nop_10),
        ("10 ADDs (chain)", add_chain),
        ("IMUL", imul),
    ];
    for (name, f) in cases {
        let (min, median, p99) = measure(f);
        info!(
            "{:<15}  min={:4} median={:4} p99={:4} (net median {})",
            name,
            min,
            median,
            p99,
            median.saturating_sub(base_median)
        );
    }

    info!("Consistency: 10 ADDs measured 5 times");
    for run in 1..=5 {
        let (min, median, p99) = measure(add_chain);
        info!("  Run {}: min={:4} median={:4} p99={:4}", run, min, median, p99);
    }

    info!(
        "Regions much shorter than ~{} cycles are dominated by the measurement itself",
        base_median * 10
    );

    Ok(())
}
