//! Bounded and unbounded busy-wait helpers
//!
//! Nothing in the SMP core may sleep: bring-up runs before the scheduler
//! exists and IPI handlers run in interrupt context. Every wait is a poll of
//! shared memory through these two helpers.

use core::fmt;

use super::platform::Clock;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PollTimeout {
    pub waited_us: u64,
}

impl fmt::Display for PollTimeout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "condition not met after {} us", self.waited_us)
    }
}

/// Poll `predicate` every `interval_us` until it holds or `bound_us` passes.
///
/// The predicate is always evaluated once more after the deadline, so a
/// condition that becomes true during the final delay is not reported as a
/// timeout. An `interval_us` of zero spins with `cpu_relax`.
pub fn poll_with_timeout<C, F>(
    clock: &C,
    bound_us: u64,
    interval_us: u64,
    mut predicate: F,
) -> Result<(), PollTimeout>
where
    C: Clock + ?Sized,
    F: FnMut() -> bool,
{
    let start = clock.now_us();
    loop {
        if predicate() {
            return Ok(());
        }
        let waited = clock.now_us().saturating_sub(start);
        if waited >= bound_us {
            return Err(PollTimeout { waited_us: waited });
        }
        if interval_us == 0 {
            clock.cpu_relax();
        } else {
            clock.delay_us(interval_us.min(bound_us - waited));
        }
    }
}

/// Spin until `predicate` holds. Only for waits whose completion is
/// guaranteed by program order on another CPU.
pub(crate) fn spin_until<C, F>(clock: &C, mut predicate: F)
where
    C: Clock + ?Sized,
    F: FnMut() -> bool,
{
    while !predicate() {
        clock.cpu_relax();
    }
}
