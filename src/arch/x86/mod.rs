//! x86_64 platform pieces

pub mod lapic;
pub mod tsc;

pub use lapic::{LocalApic, SMP_IPI_VECTOR, SPURIOUS_VECTOR};
pub use tsc::TscClock;

/// Mask interrupts and halt for good. Used as `Platform::halt`.
pub fn halt_forever() -> ! {
    ::x86_64::instructions::interrupts::disable();
    loop {
        ::x86_64::instructions::hlt();
    }
}

/// Run `f` with interrupts masked, restoring the previous state afterwards.
pub fn without_interrupts<R, F: FnOnce() -> R>(f: F) -> R {
    ::x86_64::instructions::interrupts::without_interrupts(f)
}
