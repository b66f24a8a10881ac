use anyhow::{bail, Result};
use log::debug;

use crate::config::{MICROS_PER_SEC, MILLIS_PER_SEC, NANOS_PER_SEC, TIME_CONVERSION_MODULUS_SECS};
use crate::{ClockFrequency, CycleCount};

#[inline(always)]
fn scaled(cycle_delta: CycleCount, frequency: ClockFrequency, unit_scale: f64) -> f64 {
    debug_assert!(frequency.hz() > 0.0, "clock frequency must be positive");
    cycle_delta.0 as f64 / (frequency.hz() / unit_scale)
}

/// Convert a cycle delta to nanoseconds. `frequency` must be positive
#[inline]
pub fn to_ns(cycle_delta: CycleCount, frequency: ClockFrequency) -> f64 {
    scaled(cycle_delta, frequency, NANOS_PER_SEC)
}

/// Convert a cycle delta to microseconds. `frequency` must be positive
#[inline]
pub fn to_us(cycle_delta: CycleCount, frequency: ClockFrequency) -> f64 {
    scaled(cycle_delta, frequency, MICROS_PER_SEC)
}

/// Convert a cycle delta to milliseconds. `frequency` must be positive
#[inline]
pub fn to_ms(cycle_delta: CycleCount, frequency: ClockFrequency) -> f64 {
    scaled(cycle_delta, frequency, MILLIS_PER_SEC)
}

/// Convert a cycle delta to seconds. `frequency` must be positive
#[inline]
pub fn to_s(cycle_delta: CycleCount, frequency: ClockFrequency) -> f64 {
    scaled(cycle_delta, frequency, 1.0)
}

/// Seconds left before the counter of the current core overflows, given its value `now`
pub fn secs_before_wrap(now: CycleCount, frequency: ClockFrequency) -> f64 {
    to_s(CycleCount(u64::MAX - now.0), frequency)
}

/// A set of parameters used to convert TSC ticks into nanoseconds in a fast and
/// accurate way, without division
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FastConverter {
    /// A multiplier: (tsc_remainder * mult)
    mult: u64,

    /// A shift: nsecs_per_tsc_remainder = (tsc_remainder * mult) >> shift
    shift: u32,

    /// Number of nanoseconds per TSC modulus: nsecs_per_tsc_moduli =
    /// (tsc_ticks >> tsc_remainder_length) * nsecs_per_tsc_modulus
    nsecs_per_tsc_modulus: u64,

    /// Length of TSC remainder in bits
    tsc_remainder_length: u32,

    /// tsc_remainder = tsc_ticks & tsc_remainder_bitmask
    tsc_remainder_bitmask: u64,

    /// Number of TSC ticks per second the parameters were derived from
    tsc_ticks_per_sec: u64,
}

impl FastConverter {
    /// Calculate multiply-shift parameters for `frequency`.
    ///
    /// Ideally we'd compute `ns = ticks / ticks_per_ns`, but integer division is slow and
    /// rounding `ticks_per_ns` to an integer is inaccurate (3.333 is not 3). Instead we
    /// scale by a power of two: `ns = (ticks * (2^shift / ticks_per_ns)) >> shift`, with
    /// `mult = 2^shift / ticks_per_ns` precomputed. The product must not overflow 64 bits,
    /// which bounds the number of ticks one multiplication may cover. So a count is split
    /// into whole "TSC moduli" (the largest power of two not exceeding the tick worth of
    /// [`TIME_CONVERSION_MODULUS_SECS`]) plus a remainder:
    ///
    /// ```text
    /// ns = (ticks >> remainder_length) * nsecs_per_tsc_modulus
    ///    + ((ticks & remainder_bitmask) * mult) >> shift
    /// ```
    ///
    /// `nsecs_per_tsc_modulus` is computed with the same multiply-shift formula as the
    /// remainder, so equal tick ranges always convert to equal nanosecond values.
    pub fn new(frequency: ClockFrequency) -> Result<Self> {
        if !(frequency.hz() >= 1.0) || !frequency.hz().is_finite() {
            bail!("Cannot derive conversion parameters from clock frequency {}", frequency);
        }
        Self::from_ticks_per_sec(frequency.hz().round() as u64)
    }

    fn from_ticks_per_sec(tsc_per_sec: u64) -> Result<Self> {
        if u64::MAX / TIME_CONVERSION_MODULUS_SECS < tsc_per_sec {
            bail!("Configured time conversion modulus is too big. TSC worth of this period doesn't fit 64-bit cell");
        }

        let tsc_worth_of_modulus = TIME_CONVERSION_MODULUS_SECS * tsc_per_sec;
        let mult_bound = u64::MAX / tsc_worth_of_modulus;
        // No overflow: mult_bound * tsc_per_sec <= u64::MAX / TIME_CONVERSION_MODULUS_SECS
        let factor_bound = mult_bound * tsc_per_sec / 1_000_000_000;

        // "factor" is the largest power of 2 that does not exceed factor_bound
        let shift = factor_bound.checked_ilog2().unwrap_or(0);
        let factor = 1u64 << shift;
        // Smaller than mult_bound by construction
        let mult = factor * 1_000_000_000 / tsc_per_sec;

        // Largest power of 2 that doesn't exceed tsc_worth_of_modulus
        let tsc_remainder_length = tsc_worth_of_modulus.ilog2();
        let tsc_modulus = 1u64 << tsc_remainder_length;

        let nsecs_per_tsc_modulus = (tsc_modulus * mult) >> shift;
        let tsc_remainder_bitmask = tsc_modulus - 1;

        debug!(
            "TSC-to-ns parameters for {} Hz: shift={}, mult={}, remainder bits={}, ns per TSC modulus={}",
            tsc_per_sec, shift, mult, tsc_remainder_length, nsecs_per_tsc_modulus
        );

        Ok(Self {
            mult,
            shift,
            nsecs_per_tsc_modulus,
            tsc_remainder_length,
            tsc_remainder_bitmask,
            tsc_ticks_per_sec: tsc_per_sec,
        })
    }

    /// Convert TSC ticks to nanoseconds
    #[inline]
    pub fn to_nanos(&self, ticks: CycleCount) -> u64 {
        let moduli = (ticks.0 >> self.tsc_remainder_length).saturating_mul(self.nsecs_per_tsc_modulus);
        let remainder = ((ticks.0 & self.tsc_remainder_bitmask) * self.mult) >> self.shift;
        moduli.saturating_add(remainder)
    }

    /// TSC ticks per second the parameters were derived from
    #[inline]
    pub fn tsc_ticks_per_sec(&self) -> u64 {
        self.tsc_ticks_per_sec
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const GHZ_3: ClockFrequency = ClockFrequency::from_hz(3.0e9);

    #[test]
    fn test_scenario_three_ghz() {
        let delta = CycleCount(3_000_000_000);
        assert_eq!(to_s(delta, GHZ_3), 1.0);
        assert_eq!(to_ms(delta, GHZ_3), 1000.0);
        assert_eq!(to_us(delta, GHZ_3), 1_000_000.0);
        assert_eq!(to_ns(delta, GHZ_3), 1_000_000_000.0);
    }

    #[test]
    fn test_units_are_consistent() {
        let frequencies = [1.0e6, 2.4e9, 3.333e9, 4.7e9];
        let deltas = [1u64, 37, 12_345, 9_876_543_210];

        for &hz in &frequencies {
            let f = ClockFrequency::from_hz(hz);
            for &ticks in &deltas {
                let x = CycleCount(ticks);
                let ns = to_ns(x, f);
                assert!((ns - to_us(x, f) * 1000.0).abs() <= ns * 1e-12, "ns/us mismatch at {} Hz", hz);
                assert!((ns - to_ms(x, f) * 1e6).abs() <= ns * 1e-12, "ns/ms mismatch at {} Hz", hz);

                let back = to_s(x, f) * hz;
                assert!((back - ticks as f64).abs() <= ticks as f64 * 1e-12, "to_s not invertible: {} vs {}", back, ticks);
            }
        }
    }

    #[test]
    fn test_conversion_is_linear() {
        let f = ClockFrequency::from_hz(2.5e9);
        let a = to_ns(CycleCount(1000), f);
        let b = to_ns(CycleCount(3000), f);
        assert!((b - 3.0 * a).abs() < 1e-9, "a={}, b={}", a, b);
        assert_eq!(to_ns(CycleCount(0), f), 0.0);
    }

    #[test]
    fn test_cycle_count_methods_forward() {
        let delta = CycleCount(6_000_000);
        assert_eq!(delta.to_ms(GHZ_3), 2.0);
        assert_eq!(delta.to_us(GHZ_3), 2000.0);
        assert_eq!(delta.to_ns(GHZ_3), to_ns(delta, GHZ_3));
        assert_eq!(delta.to_s(GHZ_3), 0.002);
    }

    #[test]
    fn test_secs_before_wrap() {
        let secs = secs_before_wrap(CycleCount(u64::MAX - 3_000_000_000), GHZ_3);
        assert_eq!(secs, 1.0);

        // A freshly booted 3 GHz machine has about 195 years before the TSC wraps
        let years = secs_before_wrap(CycleCount(0), GHZ_3) / (365.0 * 24.0 * 3600.0);
        assert!(years > 190.0 && years < 200.0, "years = {}", years);
    }

    #[test]
    fn test_fast_converter_params() {
        let params = FastConverter::new(GHZ_3).unwrap();
        assert!(params.mult > 0, "mult should be positive");
        assert!(params.shift > 0, "shift should be positive");
        assert!(params.tsc_remainder_length > 0, "tsc_remainder_length should be positive");
        assert_eq!(params.tsc_ticks_per_sec(), 3_000_000_000);
    }

    #[test]
    fn test_fast_converter_one_second() {
        let params = FastConverter::new(GHZ_3).unwrap();
        let ns = params.to_nanos(CycleCount(3_000_000_000));
        let error = (ns as f64 - 1e9).abs() / 1e9;
        assert!(error < 1e-6, "conversion error {} (ns={})", error, ns);
    }

    #[test]
    fn test_fast_converter_small_values() {
        let params = FastConverter::new(GHZ_3).unwrap();
        let ns = params.to_nanos(CycleCount(3000));
        assert!((999..=1000).contains(&ns), "3000 ticks at 3GHz should be ~1000ns, got {}", ns);
    }

    #[test]
    fn test_fast_converter_matches_float_conversion() {
        let f = ClockFrequency::from_hz(3.333e9);
        let params = FastConverter::new(f).unwrap();

        // Spans several TSC moduli (one hour worth of ticks)
        let ticks = CycleCount(3_333_000_000 * 3600);
        let fast = params.to_nanos(ticks) as f64;
        let exact = to_ns(ticks, f);
        assert!((fast - exact).abs() / exact < 1e-6, "fast={}, exact={}", fast, exact);
    }

    #[test]
    fn test_fast_converter_rejects_bad_frequency() {
        assert!(FastConverter::new(ClockFrequency::from_hz(0.0)).is_err());
        assert!(FastConverter::new(ClockFrequency::from_hz(-1.0)).is_err());
        assert!(FastConverter::new(ClockFrequency::from_hz(f64::NAN)).is_err());
        assert!(FastConverter::new(ClockFrequency::from_hz(1.0e19)).is_err());
    }
}
