//! Platform building blocks
//!
//! Pieces a [`Platform`](crate::smp::Platform) implementation is assembled
//! from. Only x86_64 is provided:
//! - Local APIC doorbell and INIT-SIPI-SIPI wake sequence
//! - TSC clock
//! - interrupt masking and the halt loop

#[cfg(all(feature = "platform-x86", target_arch = "x86_64"))]
pub mod x86;
