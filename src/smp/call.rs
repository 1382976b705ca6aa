//! Remote Function Calls
//!
//! `call_function_all` / `call_function_one` run `func(arg)` on other CPUs.
//! Each call class owns one publish slot; holding a [`PublishGuard`] is the
//! only way to publish into it, and dropping the guard empties the slot on
//! every exit path.
//!
//! Receivers claim a call by clearing their own bit in the slot's
//! `unstarted` set while holding the record lock. The caller's timeout path
//! empties `unstarted` under the same lock, so a CPU that arrives after the
//! caller gave up finds nothing to run instead of a stale record.

use core::fmt;
use core::sync::atomic::{fence, AtomicBool, Ordering};

use spin::Mutex;

use crate::cpumask::{AtomicCpuSet, CpuSet, LogicalCpu};

use super::ipi::IpiOp;
use super::platform::Platform;
use super::poll::{poll_with_timeout, spin_until};
use super::Smp;

/// Function run on the remote CPU
pub type CallFn = fn(usize);

/// Which publish slot a call goes through
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CallClass {
    Single,
    All,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CallError {
    /// Slot occupied and the caller asked not to retry
    Busy,
    /// These CPUs never acknowledged the call
    Timeout { unresponsive: CpuSet },
    /// A single-target call aimed at the calling CPU
    SelfTarget,
    NotOnline(LogicalCpu),
}

impl fmt::Display for CallError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CallError::Busy => f.write_str("remote call slot busy"),
            CallError::Timeout { unresponsive } => {
                write!(f, "remote call not acknowledged by CPUs {}", unresponsive)
            }
            CallError::SelfTarget => f.write_str("single-target remote call aimed at self"),
            CallError::NotOnline(cpu) => write!(f, "CPU {} is not online", cpu),
        }
    }
}

#[derive(Clone, Copy)]
struct CallRecord {
    func: CallFn,
    arg: usize,
    wait: bool,
}

pub(crate) struct CallSlot {
    owned: AtomicBool,
    record: Mutex<Option<CallRecord>>,
    unstarted: AtomicCpuSet,
    unfinished: AtomicCpuSet,
}

impl CallSlot {
    pub const fn new() -> Self {
        Self {
            owned: AtomicBool::new(false),
            record: Mutex::new(None),
            unstarted: AtomicCpuSet::new(),
            unfinished: AtomicCpuSet::new(),
        }
    }

    pub fn is_published(&self) -> bool {
        self.owned.load(Ordering::Acquire)
    }

    fn try_acquire<'a, P: Platform>(&'a self, platform: &'a P) -> Option<PublishGuard<'a, P>> {
        self.owned
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .ok()
            .map(|_| PublishGuard {
                slot: self,
                platform,
            })
    }

    /// Run the published call if `cpu` is one of its unstarted targets.
    pub fn receive(&self, cpu: LogicalCpu) -> bool {
        let record = {
            let guard = self.record.lock();
            let Some(record) = *guard else {
                return false;
            };
            if !self.unstarted.remove(cpu) {
                return false;
            }
            record
        };

        // The record is a copy: with `wait == false` the caller may release
        // the slot as soon as `unstarted` drains.
        (record.func)(record.arg);

        if record.wait {
            fence(Ordering::SeqCst);
            self.unfinished.remove(cpu);
        }
        true
    }
}

/// Exclusive ownership of a publish slot
pub(crate) struct PublishGuard<'a, P: Platform> {
    slot: &'a CallSlot,
    platform: &'a P,
}

impl<P: Platform> PublishGuard<'_, P> {
    fn publish(&self, record: CallRecord, targets: CpuSet) {
        self.platform.without_interrupts(|| {
            let mut current = self.slot.record.lock();
            self.slot.unfinished.store(if record.wait {
                targets
            } else {
                CpuSet::empty()
            });
            self.slot.unstarted.store(targets);
            *current = Some(record);
        });
        fence(Ordering::SeqCst);
    }

    fn unstarted(&self) -> CpuSet {
        self.slot.unstarted.load()
    }

    fn unfinished(&self) -> CpuSet {
        self.slot.unfinished.load()
    }

    /// Stop accepting new receivers. Returns the targets that never started;
    /// they are also dropped from `unfinished`.
    fn withdraw(&self) -> CpuSet {
        self.platform.without_interrupts(|| {
            let mut current = self.slot.record.lock();
            *current = None;
            let never = self.slot.unstarted.swap(CpuSet::empty());
            self.slot.unfinished.remove_all(never);
            never
        })
    }
}

impl<P: Platform> Drop for PublishGuard<'_, P> {
    fn drop(&mut self) {
        self.platform.without_interrupts(|| {
            let mut current = self.slot.record.lock();
            *current = None;
            self.slot.unstarted.store(CpuSet::empty());
            self.slot.unfinished.store(CpuSet::empty());
        });
        self.slot.owned.store(false, Ordering::Release);
    }
}

impl<P: Platform> Smp<P> {
    /// Run `func(arg)` on every other online CPU.
    ///
    /// With `retry`, a busy slot is waited for instead of failing with
    /// `Busy`, and on platforms that opt in lagging targets are re-signalled
    /// before giving up. With `wait`, returns only after every target has
    /// finished running `func`.
    ///
    /// Must not be called while holding a lock `func` needs, or with
    /// interrupts masked in a way that keeps the targets from making progress.
    pub fn call_function_all(
        &self,
        func: CallFn,
        arg: usize,
        retry: bool,
        wait: bool,
    ) -> Result<(), CallError> {
        let me = self.current_cpu();
        let targets = self.maps.online.load().difference(CpuSet::single(me));
        self.call_function_many(&self.all_call, targets, func, arg, retry, wait)
    }

    /// Run `func(arg)` on `target`, which must be another online CPU.
    pub fn call_function_one(
        &self,
        target: LogicalCpu,
        func: CallFn,
        arg: usize,
        retry: bool,
        wait: bool,
    ) -> Result<(), CallError> {
        if target == self.current_cpu() {
            return Err(CallError::SelfTarget);
        }
        if !self.maps.online.contains(target) {
            return Err(CallError::NotOnline(target));
        }
        self.call_function_many(
            &self.single_call,
            CpuSet::single(target),
            func,
            arg,
            retry,
            wait,
        )
    }

    /// True while a call of `class` is published
    pub fn is_published(&self, class: CallClass) -> bool {
        match class {
            CallClass::Single => self.single_call.is_published(),
            CallClass::All => self.all_call.is_published(),
        }
    }

    fn call_function_many(
        &self,
        slot: &CallSlot,
        targets: CpuSet,
        func: CallFn,
        arg: usize,
        retry: bool,
        wait: bool,
    ) -> Result<(), CallError> {
        if targets.is_empty() {
            return Ok(());
        }

        let guard = self.acquire_slot(slot, retry)?;
        guard.publish(CallRecord { func, arg, wait }, targets);
        self.signal_mask(targets, IpiOp::CallFunction);

        self.wait_started(&guard, retry, wait)?;

        if wait {
            spin_until(&self.platform, || guard.unfinished().is_empty());
        }
        Ok(())
    }

    fn acquire_slot<'a>(
        &'a self,
        slot: &'a CallSlot,
        retry: bool,
    ) -> Result<PublishGuard<'a, P>, CallError> {
        loop {
            if let Some(guard) = slot.try_acquire(&self.platform) {
                return Ok(guard);
            }
            if !retry {
                return Err(CallError::Busy);
            }
            spin_until(&self.platform, || !slot.is_published());
        }
    }

    fn wait_started(
        &self,
        guard: &PublishGuard<'_, P>,
        retry: bool,
        wait: bool,
    ) -> Result<(), CallError> {
        let config = &self.config;
        let mut resends = 0;

        loop {
            let acked = poll_with_timeout(
                &self.platform,
                config.call_ack_timeout_us,
                config.call_poll_interval_us,
                || guard.unstarted().is_empty(),
            );
            if acked.is_ok() {
                return Ok(());
            }

            let lagging = guard.unstarted();
            if lagging.is_empty() {
                return Ok(());
            }
            if retry && config.resend_ipi_on_timeout && resends < config.max_ipi_resends {
                resends += 1;
                crate::kwarn!(
                    "SMP: remote call not acknowledged by CPUs {}, resending ({}/{})",
                    lagging,
                    resends,
                    config.max_ipi_resends
                );
                self.signal_mask(lagging, IpiOp::CallFunction);
                continue;
            }

            let unresponsive = guard.withdraw();
            if unresponsive.is_empty() {
                // Everyone claimed it between the last poll and the withdraw.
                return Ok(());
            }
            crate::kerror!(
                "SMP: remote call timed out, CPUs {} never started",
                unresponsive
            );
            if wait {
                // Targets that did start still report into this slot.
                spin_until(&self.platform, || guard.unfinished().is_empty());
            }
            return Err(CallError::Timeout { unresponsive });
        }
    }
}
