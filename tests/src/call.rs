//! Remote Function Call Tests

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::mpsc::TryRecvError;
    use std::thread;
    use std::time::Duration;

    use serial_test::serial;

    use smpcore::{CallClass, CallError, Clock, CpuSet, IpiOp, LogicalCpu, Platform};

    use crate::mock::calls::{self, Gate};
    use crate::mock::{self, VirtualMachine, VmConfig};

    const WAIT: Duration = Duration::from_secs(10);

    /// Hold `slot` with interrupts masked until `release` is set.
    fn make_deaf(vm: &VirtualMachine, slot: usize, release: &'static AtomicBool) {
        let entered: &'static AtomicBool = Box::leak(Box::new(AtomicBool::new(false)));
        let _ = vm.spawn_on(slot, move |smp| {
            smp.platform().without_interrupts(|| {
                entered.store(true, Ordering::SeqCst);
                while !release.load(Ordering::SeqCst) {
                    thread::yield_now();
                }
            });
        });
        assert!(vm.wait_for(WAIT, || entered.load(Ordering::SeqCst)));
    }

    // =========================================================================
    // call_function_all
    // =========================================================================

    #[test]
    fn test_call_all_runs_once_per_other_cpu() {
        static COUNTER: AtomicUsize = AtomicUsize::new(0);
        let vm = VirtualMachine::boot(VmConfig::new(4));

        let result = vm.run_on(1, |smp| {
            smp.call_function_all(calls::increment, calls::counter_arg(&COUNTER), true, true)
        });

        assert_eq!(result, Ok(()));
        assert_eq!(COUNTER.load(Ordering::SeqCst), 3);
        assert!(!vm.smp().is_published(CallClass::All));
        assert!(!vm.smp().is_published(CallClass::Single));
    }

    #[test]
    fn test_call_all_targets_every_other_cpu() {
        const TAG: usize = 0xA11;
        let vm = VirtualMachine::boot(VmConfig::new(4));

        let result = vm.run_on(1, |smp| smp.call_function_all(calls::record, TAG, true, true));

        assert_eq!(result, Ok(()));
        assert_eq!(calls::recorded(TAG), vec![0, 2, 3]);
    }

    fn slow_increment(arg: usize) {
        thread::sleep(Duration::from_millis(20));
        calls::increment(arg);
    }

    #[test]
    fn test_wait_returns_after_every_target_finished() {
        static COUNTER: AtomicUsize = AtomicUsize::new(0);
        let vm = VirtualMachine::boot(VmConfig::new(4));

        let seen_at_return = vm.run_on(2, |smp| {
            let result =
                smp.call_function_all(slow_increment, calls::counter_arg(&COUNTER), false, true);
            (result, COUNTER.load(Ordering::SeqCst))
        });

        assert_eq!(seen_at_return, (Ok(()), 3));
    }

    #[test]
    fn test_no_wait_returns_once_started() {
        static GATE: Gate = Gate::new();
        let vm = VirtualMachine::boot(VmConfig::new(3));

        let result = vm.run_on(0, |smp| {
            smp.call_function_all(calls::wait_at_gate, GATE.as_arg(), true, false)
        });

        // Both targets are still parked inside the function.
        assert_eq!(result, Ok(()));
        assert!(vm.wait_for(WAIT, || GATE.entered() == 2));
        assert!(!vm.smp().is_published(CallClass::All));
        GATE.open();
    }

    #[test]
    fn test_call_all_with_no_peers() {
        let vm = VirtualMachine::boot(VmConfig::new(1));
        let (result, sent) = vm.run_on(0, |smp| {
            let result = smp.call_function_all(calls::noop, 0, false, true);
            (result, smp.ipi_stats(LogicalCpu::BOOT).sent(IpiOp::CallFunction))
        });
        assert_eq!(result, Ok(()));
        assert_eq!(sent, 0);
    }

    #[test]
    fn test_concurrent_callers_all_complete() {
        static COUNTER: AtomicUsize = AtomicUsize::new(0);
        const ROUNDS: usize = 10;
        let vm = VirtualMachine::boot(VmConfig::new(4));

        let pending: Vec<_> = [1, 2, 3]
            .into_iter()
            .map(|slot| {
                vm.spawn_on(slot, |smp| {
                    (0..ROUNDS)
                        .map(|_| {
                            smp.call_function_all(
                                calls::increment,
                                calls::counter_arg(&COUNTER),
                                true,
                                true,
                            )
                        })
                        .collect::<Vec<_>>()
                })
            })
            .collect();

        for rx in pending {
            let results = rx.recv_timeout(Duration::from_secs(30)).unwrap();
            assert!(results.iter().all(|r| r.is_ok()), "{:?}", results);
        }
        assert_eq!(COUNTER.load(Ordering::SeqCst), 3 * ROUNDS * 3);
        assert!(!vm.smp().is_published(CallClass::All));
    }

    // =========================================================================
    // call_function_one
    // =========================================================================

    #[test]
    fn test_call_one_runs_on_target_only() {
        const TAG: usize = 0x0E1;
        let vm = VirtualMachine::boot(VmConfig::new(4));
        let target = vm.cpu(3);

        let result = vm.run_on(0, move |smp| {
            smp.call_function_one(target, calls::record, TAG, false, true)
        });

        assert_eq!(result, Ok(()));
        assert_eq!(calls::recorded(TAG), vec![3]);
        assert!(!vm.smp().is_published(CallClass::Single));
    }

    #[test]
    fn test_call_one_self_target_sends_nothing() {
        let vm = VirtualMachine::boot(VmConfig::new(2));

        let (result, before, after) = vm.run_on(1, |smp| {
            let me = smp.current_cpu();
            let before = smp.ipi_stats(me);
            let result = smp.call_function_one(me, calls::noop, 0, true, true);
            (result, before, smp.ipi_stats(me))
        });

        assert_eq!(result, Err(CallError::SelfTarget));
        assert_eq!(before, after);
        assert!(!vm.smp().is_published(CallClass::Single));
    }

    #[test]
    fn test_call_one_rejects_offline_target() {
        let vm = VirtualMachine::boot(VmConfig::new(3).with_stuck(2));
        let stuck = vm.cpu(2);

        let result = vm.run_on(0, move |smp| {
            smp.call_function_one(stuck, calls::noop, 0, false, false)
        });
        assert_eq!(result, Err(CallError::NotOnline(stuck)));
    }

    // =========================================================================
    // Publish slot exclusion
    // =========================================================================

    #[test]
    fn test_busy_slot_without_retry() {
        static GATE: Gate = Gate::new();
        let vm = VirtualMachine::boot(VmConfig::new(4));
        let (cpu0, cpu3) = (vm.cpu(0), vm.cpu(3));

        let holder = vm.spawn_on(1, move |smp| {
            smp.call_function_one(cpu3, calls::wait_at_gate, GATE.as_arg(), false, true)
        });
        assert!(vm.wait_for(WAIT, || GATE.entered() == 1));
        assert!(vm.smp().is_published(CallClass::Single));

        let contender = vm.run_on(2, move |smp| {
            smp.call_function_one(cpu0, calls::noop, 0, false, true)
        });
        assert_eq!(contender, Err(CallError::Busy));

        // The other class has its own slot.
        let other_class = vm.run_on(2, |smp| {
            let targets = smp.online_cpus().difference(CpuSet::single(smp.current_cpu()));
            (targets.len(), smp.is_published(CallClass::All))
        });
        assert_eq!(other_class, (3, false));

        GATE.open();
        assert_eq!(holder.recv_timeout(WAIT).unwrap(), Ok(()));
        assert!(!vm.smp().is_published(CallClass::Single));
    }

    #[test]
    fn test_busy_slot_with_retry_waits_its_turn() {
        static GATE: Gate = Gate::new();
        const TAG: usize = 0xB5;
        let vm = VirtualMachine::boot(VmConfig::new(4));
        let (cpu0, cpu3) = (vm.cpu(0), vm.cpu(3));

        let holder = vm.spawn_on(1, move |smp| {
            smp.call_function_one(cpu3, calls::wait_at_gate, GATE.as_arg(), false, true)
        });
        assert!(vm.wait_for(WAIT, || GATE.entered() == 1));

        let waiter = vm.spawn_on(2, move |smp| {
            smp.call_function_one(cpu0, calls::record, TAG, true, true)
        });
        thread::sleep(Duration::from_millis(50));
        assert_eq!(waiter.try_recv(), Err(TryRecvError::Empty));
        assert!(calls::recorded(TAG).is_empty());

        GATE.open();
        assert_eq!(holder.recv_timeout(WAIT).unwrap(), Ok(()));
        assert_eq!(waiter.recv_timeout(WAIT).unwrap(), Ok(()));
        assert_eq!(calls::recorded(TAG), vec![0]);
    }

    // =========================================================================
    // Acknowledgement timeout
    // =========================================================================

    #[test]
    #[serial]
    fn test_unresponsive_target_times_out() {
        static RELEASE: AtomicBool = AtomicBool::new(false);
        const TAG: usize = 0x71;
        let vm = VirtualMachine::boot(VmConfig::new(4));
        let deaf = vm.cpu(3);
        make_deaf(&vm, 3, &RELEASE);

        let result = vm.run_on(1, |smp| smp.call_function_all(calls::record, TAG, false, true));

        assert_eq!(
            result,
            Err(CallError::Timeout {
                unresponsive: CpuSet::single(deaf)
            })
        );
        assert_eq!(calls::recorded(TAG), vec![0, 2]);
        assert!(!vm.smp().is_published(CallClass::All));
        assert!(mock::log::contains("remote call timed out, CPUs {3} never started"));

        // The late CPU finds nothing left to run.
        RELEASE.store(true, Ordering::SeqCst);
        let drained = vm.run_on(3, |smp| {
            let me = smp.current_cpu();
            smp.platform().cpu_relax();
            smp.ipi_stats(me).received(IpiOp::CallFunction)
        });
        assert_eq!(drained, 1);
        assert_eq!(calls::recorded(TAG), vec![0, 2]);
    }

    #[test]
    #[serial]
    fn test_resend_recovers_a_slow_target() {
        static RELEASE: AtomicBool = AtomicBool::new(false);
        const TAG: usize = 0x4E5;
        let vm = VirtualMachine::boot(VmConfig::new(3).with_smp(|smp| {
            smp.call_ack_timeout_us = 100_000;
            smp.resend_ipi_on_timeout = true;
            smp.max_ipi_resends = 20;
        }));
        make_deaf(&vm, 2, &RELEASE);

        let call = vm.spawn_on(1, |smp| {
            let result = smp.call_function_all(calls::record, TAG, true, true);
            (result, smp.ipi_stats(smp.current_cpu()).sent(IpiOp::CallFunction))
        });
        thread::sleep(Duration::from_millis(250));
        RELEASE.store(true, Ordering::SeqCst);

        let (result, sent) = call.recv_timeout(WAIT).unwrap();
        assert_eq!(result, Ok(()));
        assert!(sent >= 3, "sent {}", sent);
        assert_eq!(calls::recorded(TAG), vec![0, 2]);
        assert!(mock::log::contains("resending"));
    }

    #[test]
    #[serial]
    fn test_no_resend_without_retry() {
        static RELEASE: AtomicBool = AtomicBool::new(false);
        let vm = VirtualMachine::boot(VmConfig::new(2).with_smp(|smp| {
            smp.call_ack_timeout_us = 50_000;
            smp.resend_ipi_on_timeout = true;
        }));
        let deaf = vm.cpu(1);
        make_deaf(&vm, 1, &RELEASE);

        let (result, sent) = vm.run_on(0, |smp| {
            let result = smp.call_function_all(calls::noop, 0, false, false);
            (result, smp.ipi_stats(LogicalCpu::BOOT).sent(IpiOp::CallFunction))
        });
        RELEASE.store(true, Ordering::SeqCst);

        assert_eq!(
            result,
            Err(CallError::Timeout {
                unresponsive: CpuSet::single(deaf)
            })
        );
        assert_eq!(sent, 1);
    }

    #[test]
    fn test_call_error_display() {
        let err = CallError::Timeout {
            unresponsive: CpuSet::from_bits(0b1010),
        };
        assert_eq!(err.to_string(), "remote call not acknowledged by CPUs {1,3}");
        assert_eq!(CallError::Busy.to_string(), "remote call slot busy");
    }
}
