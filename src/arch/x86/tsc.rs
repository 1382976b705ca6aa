//! TSC-backed clock

use core::arch::x86_64::{__cpuid, __cpuid_count, _rdtsc};

use crate::smp::Clock;

pub struct TscClock {
    ticks_per_us: u64,
}

impl TscClock {
    /// Returns None for a zero rate
    pub const fn new(ticks_per_us: u64) -> Option<Self> {
        if ticks_per_us == 0 {
            None
        } else {
            Some(Self { ticks_per_us })
        }
    }

    /// Rate from CPUID leaf 0x15, falling back to the base frequency in 0x16.
    pub fn detect() -> Option<Self> {
        Self::new(detect_frequency_hz()? / 1_000_000)
    }

    pub fn ticks_per_us(&self) -> u64 {
        self.ticks_per_us
    }
}

impl Clock for TscClock {
    fn now_us(&self) -> u64 {
        read_tsc() / self.ticks_per_us
    }

    fn delay_us(&self, us: u64) {
        let deadline = read_tsc().saturating_add(us.saturating_mul(self.ticks_per_us));
        while read_tsc() < deadline {
            core::hint::spin_loop();
        }
    }
}

fn read_tsc() -> u64 {
    // SAFETY: RDTSC is always available on x86_64.
    unsafe { _rdtsc() }
}

fn detect_frequency_hz() -> Option<u64> {
    // SAFETY: CPUID is always available on x86_64.
    unsafe {
        let highest_leaf = __cpuid(0).eax;

        if highest_leaf >= 0x15 {
            let leaf = __cpuid_count(0x15, 0);
            let denom = leaf.eax as u64;
            let numer = leaf.ebx as u64;
            let crystal = leaf.ecx as u64;
            if denom != 0 && numer != 0 && crystal != 0 {
                return Some(crystal * numer / denom);
            }
        }

        if highest_leaf >= 0x16 {
            let base_mhz = __cpuid(0x16).eax as u64;
            if base_mhz != 0 {
                return Some(base_mhz * 1_000_000);
            }
        }
    }
    None
}
