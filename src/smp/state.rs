//! SMP Global State
//!
//! The possible/online/callin maps, the logical-to-physical table and the
//! rendezvous flags. Each CPU's `callin` and `online` bits are written only
//! by that CPU (the STOP path clears `online` on itself); `possible` and the
//! physical table are written only by the enumerator, before the table is
//! frozen.

use core::sync::atomic::{AtomicBool, AtomicU32, AtomicU8, AtomicUsize, Ordering};

use crate::cpumask::{AtomicCpuSet, LogicalCpu, PhysicalCpuAddress, MAX_CPUS};

use super::types::BringupState;

/// "Who is booting" slot value when no bring-up is in progress
pub(crate) const NO_CPU: usize = usize::MAX;

pub(crate) struct CpuMaps {
    pub possible: AtomicCpuSet,
    pub online: AtomicCpuSet,
    pub callin: AtomicCpuSet,
    physical: [AtomicU32; MAX_CPUS],
    count: AtomicUsize,
    frozen: AtomicBool,
    state: [AtomicU8; MAX_CPUS],
    /// Logical id of the secondary currently being woken
    pub booting: AtomicUsize,
    /// One-shot false -> true
    pub commenced: AtomicBool,
}

impl CpuMaps {
    pub fn new() -> Self {
        Self {
            possible: AtomicCpuSet::new(),
            online: AtomicCpuSet::new(),
            callin: AtomicCpuSet::new(),
            physical: core::array::from_fn(|_| AtomicU32::new(0)),
            count: AtomicUsize::new(0),
            frozen: AtomicBool::new(false),
            state: core::array::from_fn(|_| AtomicU8::new(BringupState::Unknown as u8)),
            booting: AtomicUsize::new(NO_CPU),
            commenced: AtomicBool::new(false),
        }
    }

    /// Number of logical ids handed out
    pub fn enumerated(&self) -> usize {
        self.count.load(Ordering::Acquire)
    }

    /// Append a physical CPU and return its new logical id.
    ///
    /// Only the enumerator calls this, before `freeze`.
    pub fn assign(&self, physical: PhysicalCpuAddress) -> Option<LogicalCpu> {
        if self.frozen.load(Ordering::Acquire) {
            return None;
        }
        let index = self.count.load(Ordering::Relaxed);
        let cpu = LogicalCpu::new(index)?;
        self.physical[index].store(physical.0, Ordering::Relaxed);
        self.state[index].store(BringupState::Enumerated as u8, Ordering::Relaxed);
        self.count.store(index + 1, Ordering::Release);
        Some(cpu)
    }

    /// Freeze the logical-to-physical table. Returns false if already frozen.
    pub fn freeze(&self) -> bool {
        self.frozen
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn physical_id(&self, cpu: LogicalCpu) -> Option<PhysicalCpuAddress> {
        if cpu.index() < self.enumerated() {
            Some(PhysicalCpuAddress(
                self.physical[cpu.index()].load(Ordering::Relaxed),
            ))
        } else {
            None
        }
    }

    pub fn logical_id(&self, physical: PhysicalCpuAddress) -> Option<LogicalCpu> {
        let count = self.enumerated();
        (0..count)
            .find(|&i| self.physical[i].load(Ordering::Relaxed) == physical.0)
            .and_then(LogicalCpu::new)
    }

    pub fn state(&self, cpu: LogicalCpu) -> BringupState {
        BringupState::from_atomic(self.state[cpu.index()].load(Ordering::Acquire))
    }

    pub fn set_state(&self, cpu: LogicalCpu, state: BringupState) {
        self.state[cpu.index()].store(state as u8, Ordering::Release);
    }

    /// Move `cpu` from `from` to `to`; false if another CPU changed it first.
    pub fn transition(&self, cpu: LogicalCpu, from: BringupState, to: BringupState) -> bool {
        self.state[cpu.index()]
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}
