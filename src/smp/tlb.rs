//! TLB Shootdown
//!
//! One shootdown runs at a time. The initiator publishes the range and the
//! set of other online CPUs, signals FLUSH_TLB and flushes locally while the
//! others do the same; each receiver clears its own bit after its local
//! flush. A responder that leaves the online map (STOP) is no longer waited
//! for.

use core::sync::atomic::{fence, AtomicU64, AtomicU8, Ordering};

use spin::Mutex;

use crate::cpumask::{AtomicCpuSet, CpuSet, LogicalCpu};

use super::ipi::IpiOp;
use super::platform::Platform;
use super::poll::spin_until;
use super::Smp;

/// Address range covered by a flush
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FlushRange {
    All,
    /// Half-open `[start, end)`
    Range { start: u64, end: u64 },
}

const KIND_ALL: u8 = 0;
const KIND_RANGE: u8 = 1;

pub(crate) struct FlushState {
    lock: Mutex<()>,
    kind: AtomicU8,
    start: AtomicU64,
    end: AtomicU64,
    responders: AtomicCpuSet,
}

impl FlushState {
    pub const fn new() -> Self {
        Self {
            lock: Mutex::new(()),
            kind: AtomicU8::new(KIND_ALL),
            start: AtomicU64::new(0),
            end: AtomicU64::new(0),
            responders: AtomicCpuSet::new(),
        }
    }

    /// Range of the shootdown in progress
    pub fn range(&self) -> FlushRange {
        match self.kind.load(Ordering::Acquire) {
            KIND_RANGE => FlushRange::Range {
                start: self.start.load(Ordering::Relaxed),
                end: self.end.load(Ordering::Relaxed),
            },
            _ => FlushRange::All,
        }
    }

    fn begin(&self, range: FlushRange, responders: CpuSet) {
        match range {
            FlushRange::All => self.kind.store(KIND_ALL, Ordering::Relaxed),
            FlushRange::Range { start, end } => {
                self.start.store(start, Ordering::Relaxed);
                self.end.store(end, Ordering::Relaxed);
                self.kind.store(KIND_RANGE, Ordering::Relaxed);
            }
        }
        fence(Ordering::Release);
        self.responders.store(responders);
    }

    /// Acknowledge `cpu`'s local flush. False if it was not being waited for.
    pub fn complete(&self, cpu: LogicalCpu) -> bool {
        self.responders.remove(cpu)
    }

    /// Responders that have not acknowledged yet
    pub fn outstanding(&self) -> CpuSet {
        self.responders.load()
    }
}

impl<P: Platform> Smp<P> {
    /// Invalidate every translation on all online CPUs.
    pub fn flush_tlb_all(&self) {
        self.shootdown(FlushRange::All);
    }

    /// Invalidate translations for `[start, end)` on all online CPUs.
    pub fn flush_tlb_range(&self, start: u64, end: u64) {
        if start >= end {
            return;
        }
        self.shootdown(FlushRange::Range { start, end });
    }

    fn shootdown(&self, range: FlushRange) {
        let flush = &self.flush;
        let _guard = loop {
            if let Some(guard) = flush.lock.try_lock() {
                break guard;
            }
            // Another initiator may be waiting on us.
            self.platform.cpu_relax();
        };

        let me = self.current_cpu();
        let others = self.maps.online.load().difference(CpuSet::single(me));

        flush.begin(range, others);
        fence(Ordering::SeqCst);
        self.signal_mask(others, IpiOp::FlushTlb);

        self.platform.flush_tlb_local(range);

        // A CPU halted by STOP never acknowledges; it also runs nothing.
        spin_until(&self.platform, || {
            flush
                .outstanding()
                .intersection(self.maps.online.load())
                .is_empty()
        });
        flush.responders.store(CpuSet::empty());
    }
}
