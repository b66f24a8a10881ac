//! Full calibration run: read overhead for both modes and the counter frequency
//!
//! Settings come from TSCBENCH_* environment variables (see `tscbench::config`).
//!
//! Run with: cargo run --example calibrate --release

use log::{info, warn, LevelFilter};
use simple_logger::SimpleLogger;
use tscbench::{read, reported_frequency, secs_before_wrap, Calibration, CalibrationConfig, FastConverter, ReadMode};

fn main() -> anyhow::Result<()> {
    SimpleLogger::new().with_level(LevelFilter::Debug).init()?;

    let config = CalibrationConfig::from_env();
    let calibration = Calibration::run(&config)?;
    let frequency = calibration.frequency;

    match reported_frequency() {
        Some(reported) => info!(
            "Platform reports {}; calibration is {:.3}% off",
            reported,
            frequency.relative_error(reported) * 100.0
        ),
        None => warn!("Platform does not report a TSC frequency; only the calibrated value is available"),
    }

    let converter = FastConverter::new(frequency)?;
    let start = read(ReadMode::Serialized);
    std::thread::sleep(std::time::Duration::from_millis(10));
    let ticks = read(ReadMode::Serialized).elapsed_since(start);
    info!(
        "10 ms sleep: {} = {:.0} ns (float) = {} ns (integer), {:.0} ns net of read overhead",
        ticks,
        ticks.to_ns(frequency),
        converter.to_nanos(ticks),
        calibration.net_ns(ticks, ReadMode::Serialized)
    );

    let years = secs_before_wrap(read(ReadMode::Unserialized), frequency) / (365.0 * 24.0 * 3600.0);
    info!("This core's counter wraps in about {:.0} years", years);

    Ok(())
}
