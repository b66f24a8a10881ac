#[cfg(target_arch = "x86")]
use std::arch::x86::{__rdtscp, _mm_lfence, _rdtsc};
#[cfg(target_arch = "x86_64")]
use std::arch::x86_64::{__rdtscp, _mm_lfence, _rdtsc};
use std::sync::atomic::{compiler_fence, Ordering};

use crate::ReadMode;

/// Access to a monotonic per-core cycle counter
///
/// Implemented once per supported architecture. The implementation is selected at build
/// time; targets without one fail to compile instead of falling back to a slower clock.
pub trait CycleReader {
    /// Read the counter without any ordering guarantee
    fn read_unserialized() -> u64;

    /// Read the counter after all prior instructions have retired, and before any later
    /// instruction begins executing
    fn read_serialized() -> u64;

    #[inline(always)]
    fn read(mode: ReadMode) -> u64 {
        match mode {
            ReadMode::Unserialized => Self::read_unserialized(),
            ReadMode::Serialized => Self::read_serialized(),
        }
    }
}

/// x86 time-stamp counter
#[derive(Debug, Clone, Copy, Default)]
pub struct Tsc;

/// Reader used by [`crate::read`] on the target architecture
pub type NativeReader = Tsc;

#[cfg(any(target_arch = "x86", target_arch = "x86_64"))]
impl CycleReader for Tsc {
    #[inline(always)]
    fn read_unserialized() -> u64 {
        // SAFE: rdtsc is available on every x86 CPU this crate targets and touches no memory
        unsafe { _rdtsc() }
    }

    #[inline(always)]
    fn read_serialized() -> u64 {
        // Keep the compiler from moving memory accesses across the read
        compiler_fence(Ordering::SeqCst);

        let mut aux: u32 = 0;
        // SAFE: rdtscp only writes the counter and IA32_TSC_AUX (into `aux`). Every CPU with
        // rdtscp also has SSE2, so lfence is available.
        // rdtscp waits for earlier instructions to retire; the trailing lfence stops later
        // instructions from starting before the counter is sampled
        let tsc = unsafe {
            let tsc = __rdtscp(&mut aux);
            _mm_lfence();
            tsc
        };

        compiler_fence(Ordering::SeqCst);

        tsc
    }
}
