//! Platform Seam
//!
//! The SMP core never touches hardware directly. Physical CPU addressing,
//! the wake-up sequence, the IPI doorbell, idle context creation, local TLB
//! maintenance and the halt loop are provided by a [`Platform`]
//! implementation.

use core::fmt;

use crate::cpumask::{LogicalCpu, PhysicalCpuAddress};

use super::tlb::FlushRange;
use super::Smp;

/// Time source used by every bounded wait in the SMP core
pub trait Clock {
    /// Monotonic microseconds
    fn now_us(&self) -> u64;

    /// Busy-wait (or otherwise pass) roughly `us` microseconds
    fn delay_us(&self, us: u64);

    /// Called on every iteration of an unbounded spin
    fn cpu_relax(&self) {
        core::hint::spin_loop();
    }
}

/// Hardware primitives consumed by the SMP core
///
/// Every method may be called from interrupt context except
/// `spawn_idle_context`, which only runs on the bootstrap processor during
/// bring-up.
pub trait Platform: Clock + Sync + Sized + 'static {
    /// Bare execution context handed to a secondary once it commences
    type Context: Send;

    /// Physical address of the CPU executing the call
    fn current_physical(&self) -> PhysicalCpuAddress;

    /// Raise the SMP IPI vector on `target`. Must not block; a busy
    /// interrupt controller is retried internally.
    fn raise_interrupt(&self, target: PhysicalCpuAddress);

    /// Start `target` at the platform entry vector. Fire-and-forget: the
    /// woken CPU eventually calls [`SecondaryEntry::run`].
    fn wake(&self, target: PhysicalCpuAddress, entry: SecondaryEntry<Self>);

    /// Create the idle context for `cpu` without making it visible to any
    /// scheduler.
    fn spawn_idle_context(&self, cpu: LogicalCpu) -> Result<Self::Context, SpawnError>;

    /// Per-CPU local initialization run by a secondary before checkin
    /// (firmware registration, local timer, local interrupt enable).
    fn secondary_init(&self, _cpu: LogicalCpu) {}

    /// Switch into the idle context; the CPU now belongs to the scheduler.
    fn enter_idle(&self, cpu: LogicalCpu, context: Self::Context) -> !;

    /// Mask interrupts and stop this CPU for good.
    fn halt(&self) -> !;

    /// Purge local translation cache entries covering `range`.
    fn flush_tlb_local(&self, range: FlushRange);

    /// Run `f` with local interrupts masked.
    fn without_interrupts<R, F: FnOnce() -> R>(&self, f: F) -> R {
        f()
    }
}

/// Handle given to the platform wake primitive.
///
/// The woken CPU enters the rendezvous by calling [`run`](Self::run).
pub struct SecondaryEntry<P: Platform> {
    smp: &'static Smp<P>,
}

impl<P: Platform> SecondaryEntry<P> {
    pub(crate) fn new(smp: &'static Smp<P>) -> Self {
        Self { smp }
    }

    /// Enter the bring-up rendezvous on the calling CPU. Never returns: the
    /// CPU either ends up in its idle context or halts.
    pub fn run(self) -> ! {
        self.smp.secondary_start()
    }
}

impl<P: Platform> Clone for SecondaryEntry<P> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<P: Platform> Copy for SecondaryEntry<P> {}

/// Idle context creation failed
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SpawnError(pub &'static str);

impl fmt::Display for SpawnError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.0)
    }
}
