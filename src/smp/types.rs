//! SMP Type Definitions
//!
//! Bring-up states, platform enumeration input and the bring-up report.

use core::fmt;

use crate::cpumask::{CpuSet, PhysicalCpuAddress};

/// Per-CPU bring-up state
#[repr(u8)]
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum BringupState {
    Unknown = 0,
    Enumerated = 1,
    Spawning = 2,
    WaitingCheckin = 3,
    CheckedIn = 4,
    Commenced = 5,
    Online = 6,
    /// Never checked in; excluded for the rest of this boot
    StuckTimeout = 7,
    /// No idle context could be created
    SpawnFailed = 8,
    /// Left the online map through STOP
    Stopped = 9,
}

impl BringupState {
    pub fn from_atomic(val: u8) -> Self {
        match val {
            1 => BringupState::Enumerated,
            2 => BringupState::Spawning,
            3 => BringupState::WaitingCheckin,
            4 => BringupState::CheckedIn,
            5 => BringupState::Commenced,
            6 => BringupState::Online,
            7 => BringupState::StuckTimeout,
            8 => BringupState::SpawnFailed,
            9 => BringupState::Stopped,
            _ => BringupState::Unknown,
        }
    }

    pub fn is_terminal_failure(self) -> bool {
        matches!(self, BringupState::StuckTimeout | BringupState::SpawnFailed)
    }
}

/// One processor reported by platform enumeration
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CpuCandidate {
    /// Firmware's own processor number (ACPI processor id, CPU address
    /// slot). Only used in log messages; logical ids are assigned densely in
    /// list order.
    pub firmware_id: u32,
    pub physical: PhysicalCpuAddress,
    /// Firmware marked the processor usable
    pub enabled: bool,
}

impl CpuCandidate {
    pub const fn new(firmware_id: u32, physical: PhysicalCpuAddress) -> Self {
        Self {
            firmware_id,
            physical,
            enabled: true,
        }
    }
}

/// Platform enumeration result consumed by [`Smp::enumerate`](super::Smp::enumerate)
#[derive(Clone, Copy, Debug)]
pub struct Topology<'a> {
    pub boot_cpu: PhysicalCpuAddress,
    /// Every processor found, the boot processor may be listed too
    pub cpus: &'a [CpuCandidate],
}

/// Outcome of `bring_up_secondaries`
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BringupReport {
    pub possible: CpuSet,
    /// Boot CPU plus every secondary that reached the checkin point
    pub checked_in: CpuSet,
    pub stuck: CpuSet,
    pub spawn_failed: CpuSet,
    /// Processors left out by the `max_cpus` limit
    pub skipped: usize,
}

impl fmt::Display for BringupReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} of {} CPUs checked in (stuck {}, spawn failed {}, skipped {})",
            self.checked_in.len(),
            self.possible.len(),
            self.stuck,
            self.spawn_failed,
            self.skipped
        )
    }
}
