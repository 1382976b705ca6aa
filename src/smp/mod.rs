//! SMP (Symmetric Multi-Processing) Core
//!
//! Brings secondary CPUs online and coordinates them afterwards:
//! - checkin/commence rendezvous for secondary bring-up
//! - IPI signalling through per-CPU pending-operation masks
//! - remote function calls with bounded acknowledgement
//! - TLB shootdown and STOP broadcast
//!
//! # Module Organization
//!
//! - `types`: bring-up states, enumeration input, bring-up report
//! - `state`: CPU maps and the logical-to-physical table
//! - `platform`: the hardware seam (`Platform`, `Clock`)
//! - `poll`: bounded busy-wait helper
//! - `ipi`: operation codes, pending masks, signal functions, statistics
//! - `dispatch`: the doorbell interrupt handler
//! - `call`: `call_function_all` / `call_function_one`
//! - `bringup`: enumeration, secondary bring-up, commence
//! - `tlb`: TLB shootdown
//! - `stop`: STOP broadcast

mod bringup;
mod call;
mod dispatch;
mod ipi;
mod platform;
mod poll;
mod state;
mod stop;
mod tlb;
mod types;

use core::sync::atomic::{AtomicUsize, Ordering};

use spin::Mutex;

use crate::config::SmpConfig;
use crate::cpumask::{CpuSet, LogicalCpu, PhysicalCpuAddress, MAX_CPUS};

use call::CallSlot;
use ipi::IpiCounters;
use state::CpuMaps;
use tlb::FlushState;

pub use bringup::EnumerationError;
pub use call::{CallClass, CallError, CallFn};
pub use ipi::{IpiOp, IpiStats, PendingOps};
pub use platform::{Clock, Platform, SecondaryEntry, SpawnError};
pub use poll::{poll_with_timeout, PollTimeout};
pub use tlb::FlushRange;
pub use types::{BringupReport, BringupState, CpuCandidate, Topology};

/// SMP state for one machine
///
/// Lives for the whole boot; secondaries and the platform's interrupt
/// entry hold `&'static` references to it.
pub struct Smp<P: Platform> {
    platform: P,
    config: SmpConfig,
    maps: CpuMaps,
    pending: [PendingOps; MAX_CPUS],
    stats: [IpiCounters; MAX_CPUS],
    single_call: CallSlot,
    all_call: CallSlot,
    flush: FlushState,
    /// Idle contexts parked between spawn and commence
    contexts: [Mutex<Option<P::Context>>; MAX_CPUS],
    /// Processors dropped by the `max_cpus` limit
    skipped: AtomicUsize,
}

impl<P: Platform> Smp<P> {
    pub fn new(platform: P, config: SmpConfig) -> Self {
        Self {
            platform,
            config,
            maps: CpuMaps::new(),
            pending: [const { PendingOps::new() }; MAX_CPUS],
            stats: [const { IpiCounters::new() }; MAX_CPUS],
            single_call: CallSlot::new(),
            all_call: CallSlot::new(),
            flush: FlushState::new(),
            contexts: core::array::from_fn(|_| Mutex::new(None)),
            skipped: AtomicUsize::new(0),
        }
    }

    pub fn platform(&self) -> &P {
        &self.platform
    }

    pub fn config(&self) -> &SmpConfig {
        &self.config
    }

    /// Logical id of the executing CPU.
    ///
    /// Falls back to the boot CPU before enumeration has run.
    pub fn current_cpu(&self) -> LogicalCpu {
        self.maps
            .logical_id(self.platform.current_physical())
            .unwrap_or(LogicalCpu::BOOT)
    }

    pub fn online_cpus(&self) -> CpuSet {
        self.maps.online.load()
    }

    pub fn possible_cpus(&self) -> CpuSet {
        self.maps.possible.load()
    }

    /// CPUs that reached the checkin point
    pub fn callin_cpus(&self) -> CpuSet {
        self.maps.callin.load()
    }

    pub fn num_online(&self) -> usize {
        self.maps.online.len()
    }

    pub fn is_online(&self, cpu: LogicalCpu) -> bool {
        self.maps.online.contains(cpu)
    }

    pub fn physical_id(&self, cpu: LogicalCpu) -> Option<PhysicalCpuAddress> {
        self.maps.physical_id(cpu)
    }

    pub fn logical_id(&self, physical: PhysicalCpuAddress) -> Option<LogicalCpu> {
        self.maps.logical_id(physical)
    }

    pub fn cpu_state(&self, cpu: LogicalCpu) -> BringupState {
        self.maps.state(cpu)
    }

    /// True once `commence` has released the secondaries
    pub fn commenced(&self) -> bool {
        self.maps.commenced.load(Ordering::Acquire)
    }

    pub fn ipi_stats(&self, cpu: LogicalCpu) -> IpiStats {
        self.stats[cpu.index()].snapshot()
    }

    /// Pending-operation mask of `cpu`
    pub fn pending(&self, cpu: LogicalCpu) -> &PendingOps {
        &self.pending[cpu.index()]
    }
}
