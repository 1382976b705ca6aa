//! IPI Signalling and Dispatch Tests

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serial_test::serial;

    use smpcore::{Clock, IpiOp, LogicalCpu, Platform};

    use crate::mock::{self, calls, VirtualMachine, VmConfig};

    // =========================================================================
    // Operation codes
    // =========================================================================

    #[test]
    fn test_op_codes_are_fixed() {
        assert_eq!(IpiOp::Reschedule.bit(), 1 << 0);
        assert_eq!(IpiOp::CallFunction.bit(), 1 << 1);
        assert_eq!(IpiOp::Stop.bit(), 1 << 2);
        assert_eq!(IpiOp::FlushTlb.bit(), 1 << 3);
        for (index, op) in IpiOp::ALL.iter().enumerate() {
            assert_eq!(IpiOp::from_index(index as u32), Some(*op));
        }
        assert_eq!(IpiOp::from_index(IpiOp::COUNT as u32), None);
        assert_eq!(IpiOp::CallFunction.to_string(), "CALL_FUNCTION");
    }

    // =========================================================================
    // Pending masks
    // =========================================================================

    #[test]
    fn test_pending_mask_coalesces() {
        let vm = VirtualMachine::unbooted(VmConfig::new(1));
        let pending = vm.smp().pending(LogicalCpu::BOOT);

        assert!(pending.raise(IpiOp::Reschedule));
        assert!(!pending.raise(IpiOp::Reschedule));
        assert!(pending.raise(IpiOp::FlushTlb));
        assert_eq!(pending.peek(), IpiOp::Reschedule.bit() | IpiOp::FlushTlb.bit());
        assert_eq!(pending.take(), IpiOp::Reschedule.bit() | IpiOp::FlushTlb.bit());
        assert_eq!(pending.take(), 0);
    }

    // =========================================================================
    // Dispatch
    // =========================================================================

    #[test]
    fn test_back_to_back_signals_drain_in_one_interrupt() {
        const TAG: usize = 0xB2B;
        let vm = VirtualMachine::boot(VmConfig::new(3));
        let target = vm.cpu(2);

        // CPU 2 keeps interrupts masked until a remote call is pending on
        // top of its own RESCHEDULE, then takes a single interrupt.
        let drained = vm.spawn_on(2, |smp| {
            let me = smp.current_cpu();
            let before = smp.ipi_stats(me);
            smp.platform().without_interrupts(|| {
                smp.signal_self(IpiOp::Reschedule);
                while smp.pending(me).peek() & IpiOp::CallFunction.bit() == 0 {
                    std::thread::yield_now();
                }
            });
            smp.platform().cpu_relax();
            (before, smp.ipi_stats(me), smp.pending(me).peek())
        });
        assert!(vm.wait_for(Duration::from_secs(5), || {
            vm.smp().pending(target).peek() & IpiOp::Reschedule.bit() != 0
        }));

        let called = vm.run_on(1, move |smp| {
            smp.call_function_one(target, calls::record, TAG, false, true)
        });
        let (before, after, left) = drained.recv_timeout(Duration::from_secs(10)).unwrap();

        assert_eq!(called, Ok(()));
        assert_eq!(calls::recorded(TAG), vec![2]);
        assert_eq!(after.interrupts, before.interrupts + 1);
        assert_eq!(
            after.received(IpiOp::Reschedule),
            before.received(IpiOp::Reschedule) + 1
        );
        assert_eq!(
            after.received(IpiOp::CallFunction),
            before.received(IpiOp::CallFunction) + 1
        );
        assert_eq!(left, 0);
    }

    #[test]
    #[serial]
    fn test_unknown_bit_is_logged_and_skipped() {
        let vm = VirtualMachine::boot(VmConfig::new(2));

        let (before, after) = vm.run_on(1, |smp| {
            let me = smp.current_cpu();
            let before = smp.ipi_stats(me);
            smp.platform().without_interrupts(|| {
                smp.pending(me).raise_bits(1 << 7);
                smp.signal_self(IpiOp::Reschedule);
            });
            smp.platform().cpu_relax();
            (before, smp.ipi_stats(me))
        });

        assert_eq!(after.unknown, before.unknown + 1);
        assert_eq!(
            after.received(IpiOp::Reschedule),
            before.received(IpiOp::Reschedule) + 1
        );
        assert!(mock::log::contains("unknown IPI operation bit 7 ignored"));
    }

    #[test]
    fn test_send_reschedule_reaches_target() {
        let vm = VirtualMachine::boot(VmConfig::new(3));
        let target = vm.cpu(2);
        let before = vm.smp().ipi_stats(target).received(IpiOp::Reschedule);

        vm.run_on(0, move |smp| smp.send_reschedule(target));

        assert!(vm.wait_for(Duration::from_secs(5), || {
            vm.smp().ipi_stats(target).received(IpiOp::Reschedule) == before + 1
        }));
        assert_eq!(vm.smp().pending(target).peek(), 0);
    }

    #[test]
    fn test_signal_all_but_self_skips_sender() {
        let vm = VirtualMachine::boot(VmConfig::new(4));

        let sent = vm.run_on(2, |smp| {
            smp.signal_all_but_self(IpiOp::Reschedule);
            smp.ipi_stats(smp.current_cpu()).sent(IpiOp::Reschedule)
        });
        assert_eq!(sent, 3);

        for slot in [0, 1, 3] {
            let cpu = vm.cpu(slot);
            assert!(vm.wait_for(Duration::from_secs(5), || {
                vm.smp().ipi_stats(cpu).received(IpiOp::Reschedule) >= 1
            }));
        }
        assert_eq!(vm.smp().ipi_stats(vm.cpu(2)).received(IpiOp::Reschedule), 0);
    }

    #[test]
    fn test_signal_all_includes_sender() {
        let vm = VirtualMachine::boot(VmConfig::new(2));

        let received_self = vm.run_on(1, |smp| {
            smp.signal_all(IpiOp::Reschedule);
            smp.platform().cpu_relax();
            smp.ipi_stats(smp.current_cpu()).received(IpiOp::Reschedule)
        });
        assert_eq!(received_self, 1);
    }

    #[test]
    fn test_signal_to_unenumerated_cpu_is_dropped() {
        let vm = VirtualMachine::boot(VmConfig::new(2));
        let ghost = LogicalCpu::new(9).unwrap();

        let sent = vm.run_on(0, move |smp| {
            smp.signal(ghost, IpiOp::Reschedule);
            smp.ipi_stats(smp.current_cpu()).sent(IpiOp::Reschedule)
        });
        assert_eq!(sent, 0);
        assert_eq!(vm.smp().pending(ghost).peek(), 0);
    }

    #[test]
    fn test_clock_is_monotonic_on_vcpus() {
        let vm = VirtualMachine::boot(VmConfig::new(1));
        let (a, b) = vm.run_on(0, |smp| {
            let a = smp.platform().now_us();
            smp.platform().delay_us(500);
            (a, smp.platform().now_us())
        });
        assert!(b >= a + 500);
    }

    #[test]
    #[serial]
    fn test_doorbell_on_unknown_cpu_is_ignored() {
        // Nothing enumerated yet: the test thread is not a known CPU.
        let vm = VirtualMachine::unbooted(VmConfig::new(2));
        let boot = vm.smp().pending(LogicalCpu::BOOT);
        boot.raise(IpiOp::Reschedule);

        vm.smp().handle_ipi();

        assert_eq!(boot.peek(), IpiOp::Reschedule.bit());
        assert_eq!(vm.smp().ipi_stats(LogicalCpu::BOOT).interrupts, 0);
        assert!(mock::log::contains("doorbell on unknown CPU phys 0xffff ignored"));
    }
}
