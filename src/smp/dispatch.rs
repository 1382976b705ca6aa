//! IPI Dispatch
//!
//! Runs on the receiving CPU for every doorbell interrupt.

use core::sync::atomic::{fence, Ordering};

use crate::cpumask::LogicalCpu;

use super::ipi::IpiOp;
use super::platform::Platform;
use super::types::BringupState;
use super::Smp;

type Handler<P> = fn(&Smp<P>, LogicalCpu);

impl<P: Platform> Smp<P> {
    /// Indexed by `IpiOp as usize`
    const HANDLERS: [Handler<P>; IpiOp::COUNT] = [
        Self::on_reschedule,
        Self::on_call_function,
        Self::on_stop,
        Self::on_flush_tlb,
    ];

    /// Doorbell interrupt entry.
    ///
    /// Drains the pending mask until it stays empty: senders may add bits
    /// while earlier ones are being dispatched, and the doorbell itself does
    /// not queue. STOP is dispatched after every other bit taken with it.
    pub fn handle_ipi(&self) {
        let physical = self.platform.current_physical();
        let Some(cpu) = self.maps.logical_id(physical) else {
            crate::kwarn!("SMP: doorbell on unknown CPU phys {} ignored", physical);
            return;
        };
        let stats = &self.stats[cpu.index()];
        stats.record_interrupt();

        loop {
            let ops = self.pending[cpu.index()].take();
            if ops == 0 {
                break;
            }

            #[cfg(feature = "debug_ipi")]
            crate::kdebug!("SMP: CPU {} draining ops {:#x}", cpu, ops);

            // Peers may be waiting on the bits taken alongside STOP.
            let stop = ops & IpiOp::Stop.bit() != 0;
            let mut remaining = ops & !IpiOp::Stop.bit();
            while remaining != 0 {
                let index = remaining.trailing_zeros();
                remaining &= remaining - 1;
                match IpiOp::from_index(index) {
                    Some(op) => {
                        stats.record_received(op);
                        (Self::HANDLERS[op as usize])(self, cpu);
                    }
                    None => {
                        // Peers may be waiting on the remaining bits.
                        stats.record_unknown();
                        crate::kerror!(
                            "SMP: CPU {}: unknown IPI operation bit {} ignored",
                            cpu,
                            index
                        );
                    }
                }
            }
            if stop {
                stats.record_received(IpiOp::Stop);
                self.on_stop(cpu);
            }

            // Make what the handlers wrote visible before the re-check.
            fence(Ordering::SeqCst);
        }
    }

    // Return from interrupt re-evaluates scheduling.
    fn on_reschedule(&self, _cpu: LogicalCpu) {}

    fn on_call_function(&self, cpu: LogicalCpu) {
        self.single_call.receive(cpu);
        self.all_call.receive(cpu);
    }

    fn on_stop(&self, cpu: LogicalCpu) {
        crate::kinfo!("SMP: CPU {} stopping", cpu);
        self.maps.online.remove(cpu);
        self.maps.set_state(cpu, BringupState::Stopped);
        fence(Ordering::SeqCst);
        self.platform.halt()
    }

    fn on_flush_tlb(&self, cpu: LogicalCpu) {
        let range = self.flush.range();
        self.platform.flush_tlb_local(range);
        if !self.flush.complete(cpu) {
            crate::kwarn!("SMP: CPU {}: FLUSH_TLB with no shootdown in progress", cpu);
        }
    }
}
