//! STOP broadcast

use crate::cpumask::CpuSet;

use super::ipi::IpiOp;
use super::platform::Platform;
use super::poll::poll_with_timeout;
use super::Smp;

impl<P: Platform> Smp<P> {
    /// Halt every other online CPU.
    ///
    /// Each target drops itself from the online map before halting. Waits
    /// up to `stop_timeout_us` and returns how many targets are still online.
    pub fn send_stop_all(&self) -> usize {
        let me = self.current_cpu();
        let targets = self.maps.online.load().difference(CpuSet::single(me));
        if targets.is_empty() {
            return 0;
        }

        crate::kinfo!("SMP: CPU {} stopping CPUs {}", me, targets);
        self.signal_mask(targets, IpiOp::Stop);

        let stopped = poll_with_timeout(
            &self.platform,
            self.config.stop_timeout_us,
            self.config.call_poll_interval_us,
            || self.maps.online.load().intersection(targets).is_empty(),
        );

        let remaining = self.maps.online.load().intersection(targets);
        if stopped.is_err() {
            crate::kwarn!("SMP: CPUs {} did not stop", remaining);
        }
        remaining.len()
    }
}
