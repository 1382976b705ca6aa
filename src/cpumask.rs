//! CPU identifiers and CPU sets
//!
//! Logical CPU ids are dense indices assigned during enumeration (0 is
//! always the bootstrap processor). Physical addresses are whatever the
//! platform uses to route interrupts (APIC/SAPIC id, CPU address).
//!
//! `CpuSet` is a plain value; `AtomicCpuSet` is the shared form used for the
//! process-wide online/possible/callin maps. Every `AtomicCpuSet` update is a
//! single atomic RMW on one word, so concurrent writers touching different
//! bits never lose each other's updates.

use core::fmt;
use core::sync::atomic::{AtomicU64, Ordering};

/// Maximum number of logical CPUs
pub const MAX_CPUS: usize = 64;

/// Dense logical CPU index
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct LogicalCpu(u8);

impl LogicalCpu {
    /// The bootstrap processor
    pub const BOOT: LogicalCpu = LogicalCpu(0);

    pub const fn new(index: usize) -> Option<Self> {
        if index < MAX_CPUS {
            Some(LogicalCpu(index as u8))
        } else {
            None
        }
    }

    #[inline]
    pub const fn index(self) -> usize {
        self.0 as usize
    }

    #[inline]
    const fn bit(self) -> u64 {
        1u64 << self.0
    }
}

impl fmt::Display for LogicalCpu {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Platform-specific physical CPU address
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PhysicalCpuAddress(pub u32);

impl fmt::Display for PhysicalCpuAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// A set of logical CPUs
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct CpuSet(u64);

impl CpuSet {
    pub const fn empty() -> Self {
        CpuSet(0)
    }

    pub const fn from_bits(bits: u64) -> Self {
        CpuSet(bits)
    }

    /// Logical CPUs `0..count` (clamped to `MAX_CPUS`)
    pub const fn first(count: usize) -> Self {
        if count >= MAX_CPUS {
            CpuSet(u64::MAX)
        } else {
            CpuSet((1u64 << count) - 1)
        }
    }

    pub const fn single(cpu: LogicalCpu) -> Self {
        CpuSet(cpu.bit())
    }

    #[inline]
    pub const fn bits(self) -> u64 {
        self.0
    }

    #[inline]
    pub const fn contains(self, cpu: LogicalCpu) -> bool {
        self.0 & cpu.bit() != 0
    }

    pub fn insert(&mut self, cpu: LogicalCpu) -> bool {
        let was = self.contains(cpu);
        self.0 |= cpu.bit();
        !was
    }

    pub fn remove(&mut self, cpu: LogicalCpu) -> bool {
        let was = self.contains(cpu);
        self.0 &= !cpu.bit();
        was
    }

    #[inline]
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    #[inline]
    pub const fn len(self) -> usize {
        self.0.count_ones() as usize
    }

    pub const fn union(self, other: CpuSet) -> CpuSet {
        CpuSet(self.0 | other.0)
    }

    pub const fn intersection(self, other: CpuSet) -> CpuSet {
        CpuSet(self.0 & other.0)
    }

    pub const fn difference(self, other: CpuSet) -> CpuSet {
        CpuSet(self.0 & !other.0)
    }

    pub const fn is_subset(self, other: CpuSet) -> bool {
        self.0 & !other.0 == 0
    }

    /// Iterate members from the lowest id upwards
    pub fn iter(self) -> CpuSetIter {
        CpuSetIter(self.0)
    }
}

impl FromIterator<LogicalCpu> for CpuSet {
    fn from_iter<I: IntoIterator<Item = LogicalCpu>>(iter: I) -> Self {
        let mut set = CpuSet::empty();
        for cpu in iter {
            set.insert(cpu);
        }
        set
    }
}

impl IntoIterator for CpuSet {
    type Item = LogicalCpu;
    type IntoIter = CpuSetIter;

    fn into_iter(self) -> CpuSetIter {
        self.iter()
    }
}

pub struct CpuSetIter(u64);

impl Iterator for CpuSetIter {
    type Item = LogicalCpu;

    fn next(&mut self) -> Option<LogicalCpu> {
        if self.0 == 0 {
            return None;
        }
        let index = self.0.trailing_zeros();
        self.0 &= self.0 - 1;
        Some(LogicalCpu(index as u8))
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let n = self.0.count_ones() as usize;
        (n, Some(n))
    }
}

impl fmt::Debug for CpuSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl fmt::Display for CpuSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("{")?;
        for (i, cpu) in self.iter().enumerate() {
            if i > 0 {
                f.write_str(",")?;
            }
            write!(f, "{}", cpu)?;
        }
        f.write_str("}")
    }
}

/// Shared CPU set with lock-free single-bit updates
pub struct AtomicCpuSet(AtomicU64);

impl AtomicCpuSet {
    pub const fn new() -> Self {
        AtomicCpuSet(AtomicU64::new(0))
    }

    #[inline]
    pub fn load(&self) -> CpuSet {
        CpuSet(self.0.load(Ordering::Acquire))
    }

    #[inline]
    pub fn contains(&self, cpu: LogicalCpu) -> bool {
        self.load().contains(cpu)
    }

    pub fn is_empty(&self) -> bool {
        self.load().is_empty()
    }

    pub fn len(&self) -> usize {
        self.load().len()
    }

    /// Set one bit; returns true if it was previously clear
    pub fn insert(&self, cpu: LogicalCpu) -> bool {
        self.0.fetch_or(cpu.bit(), Ordering::AcqRel) & cpu.bit() == 0
    }

    /// Clear one bit; returns true if it was previously set
    pub fn remove(&self, cpu: LogicalCpu) -> bool {
        self.0.fetch_and(!cpu.bit(), Ordering::AcqRel) & cpu.bit() != 0
    }

    pub fn remove_all(&self, set: CpuSet) -> CpuSet {
        CpuSet(self.0.fetch_and(!set.0, Ordering::AcqRel))
    }

    pub fn store(&self, set: CpuSet) {
        self.0.store(set.0, Ordering::Release);
    }

    pub fn swap(&self, set: CpuSet) -> CpuSet {
        CpuSet(self.0.swap(set.0, Ordering::AcqRel))
    }
}

impl Default for AtomicCpuSet {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for AtomicCpuSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.load(), f)
    }
}
