//! IPI (Inter-Processor Interrupt) Operations and Signalling
//!
//! A single doorbell vector carries every operation. The sender sets the
//! operation's bit in the target's pending mask and rings the doorbell; the
//! target drains the whole mask when it takes the interrupt, so signals that
//! arrive before the interrupt is taken coalesce instead of being lost.

use core::fmt;
use core::sync::atomic::{fence, AtomicU32, AtomicU64, Ordering};

use crate::cpumask::{CpuSet, LogicalCpu};

use super::platform::Platform;
use super::Smp;

// ============================================================================
// Operation codes
// ============================================================================

#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum IpiOp {
    Reschedule = 0,
    CallFunction = 1,
    Stop = 2,
    FlushTlb = 3,
}

impl IpiOp {
    pub const COUNT: usize = 4;

    pub const ALL: [IpiOp; IpiOp::COUNT] = [
        IpiOp::Reschedule,
        IpiOp::CallFunction,
        IpiOp::Stop,
        IpiOp::FlushTlb,
    ];

    #[inline]
    pub const fn bit(self) -> u32 {
        1 << (self as u32)
    }

    pub const fn from_index(index: u32) -> Option<Self> {
        match index {
            0 => Some(IpiOp::Reschedule),
            1 => Some(IpiOp::CallFunction),
            2 => Some(IpiOp::Stop),
            3 => Some(IpiOp::FlushTlb),
            _ => None,
        }
    }

    pub const fn name(self) -> &'static str {
        match self {
            IpiOp::Reschedule => "RESCHEDULE",
            IpiOp::CallFunction => "CALL_FUNCTION",
            IpiOp::Stop => "STOP",
            IpiOp::FlushTlb => "FLUSH_TLB",
        }
    }
}

impl fmt::Display for IpiOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

// ============================================================================
// Pending operation mask
// ============================================================================

/// Per-CPU pending-operation word: any CPU sets bits, only the owner clears.
pub struct PendingOps(AtomicU32);

impl PendingOps {
    pub const fn new() -> Self {
        Self(AtomicU32::new(0))
    }

    /// Returns true if the bit was not already pending
    pub fn raise(&self, op: IpiOp) -> bool {
        self.0.fetch_or(op.bit(), Ordering::AcqRel) & op.bit() == 0
    }

    /// Set arbitrary bits, including ones with no operation assigned.
    pub fn raise_bits(&self, bits: u32) {
        self.0.fetch_or(bits, Ordering::AcqRel);
    }

    /// Fetch and clear everything pending
    pub fn take(&self) -> u32 {
        self.0.swap(0, Ordering::AcqRel)
    }

    pub fn peek(&self) -> u32 {
        self.0.load(Ordering::Acquire)
    }

    pub(crate) fn clear(&self) {
        self.0.store(0, Ordering::Release);
    }
}

impl Default for PendingOps {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Statistics
// ============================================================================

pub(crate) struct IpiCounters {
    sent: [AtomicU64; IpiOp::COUNT],
    received: [AtomicU64; IpiOp::COUNT],
    interrupts: AtomicU64,
    unknown: AtomicU64,
}

impl IpiCounters {
    pub const fn new() -> Self {
        Self {
            sent: [const { AtomicU64::new(0) }; IpiOp::COUNT],
            received: [const { AtomicU64::new(0) }; IpiOp::COUNT],
            interrupts: AtomicU64::new(0),
            unknown: AtomicU64::new(0),
        }
    }

    pub fn record_sent(&self, op: IpiOp) {
        self.sent[op as usize].fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_received(&self, op: IpiOp) {
        self.received[op as usize].fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_interrupt(&self) {
        self.interrupts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_unknown(&self) {
        self.unknown.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> IpiStats {
        IpiStats {
            sent: core::array::from_fn(|i| self.sent[i].load(Ordering::Relaxed)),
            received: core::array::from_fn(|i| self.received[i].load(Ordering::Relaxed)),
            interrupts: self.interrupts.load(Ordering::Relaxed),
            unknown: self.unknown.load(Ordering::Relaxed),
        }
    }
}

/// Snapshot of one CPU's IPI counters
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct IpiStats {
    sent: [u64; IpiOp::COUNT],
    received: [u64; IpiOp::COUNT],
    /// Doorbell interrupts taken
    pub interrupts: u64,
    /// Pending bits with no operation assigned
    pub unknown: u64,
}

impl IpiStats {
    /// Signals of `op` this CPU sent
    pub fn sent(&self, op: IpiOp) -> u64 {
        self.sent[op as usize]
    }

    /// Times this CPU dispatched `op`
    pub fn received(&self, op: IpiOp) -> u64 {
        self.received[op as usize]
    }
}

// ============================================================================
// Signal functions
// ============================================================================

impl<P: Platform> Smp<P> {
    /// Post `op` to `target` and ring its doorbell
    pub fn signal(&self, target: LogicalCpu, op: IpiOp) {
        let Some(physical) = self.maps.physical_id(target) else {
            crate::kwarn!("SMP: {} IPI to unknown CPU {} dropped", op, target);
            return;
        };

        // Data published for the receiver must be visible before the bit.
        fence(Ordering::SeqCst);
        self.pending[target.index()].raise(op);
        self.stats[self.current_cpu().index()].record_sent(op);

        #[cfg(feature = "debug_ipi")]
        crate::kdebug!("SMP: {} -> CPU {} (phys {})", op, target, physical);

        self.platform.raise_interrupt(physical);
    }

    pub fn signal_mask(&self, targets: CpuSet, op: IpiOp) {
        for cpu in targets {
            self.signal(cpu, op);
        }
    }

    /// Every online CPU except the caller
    pub fn signal_all_but_self(&self, op: IpiOp) {
        let me = self.current_cpu();
        let targets = self.maps.online.load().difference(CpuSet::single(me));
        self.signal_mask(targets, op);
    }

    /// Every online CPU, the caller included
    pub fn signal_all(&self, op: IpiOp) {
        self.signal_mask(self.maps.online.load(), op);
    }

    pub fn signal_self(&self, op: IpiOp) {
        self.signal(self.current_cpu(), op);
    }

    /// Ask `cpu` to re-evaluate scheduling on its next interrupt return
    pub fn send_reschedule(&self, cpu: LogicalCpu) {
        self.signal(cpu, IpiOp::Reschedule);
    }
}
