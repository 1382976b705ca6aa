//! Local APIC access for the SMP doorbell and secondary wake-up
//!
//! Works on a caller-supplied MMIO base so the same code drives the real
//! xAPIC page and a test page.

use core::ptr::{read_volatile, write_volatile};

use ::x86_64::registers::model_specific::Msr;

use crate::cpumask::PhysicalCpuAddress;
use crate::smp::Clock;

/// Vector the SMP doorbell is delivered on
pub const SMP_IPI_VECTOR: u8 = 0xF0;
pub const SPURIOUS_VECTOR: u8 = 0xFF;

const IA32_APIC_BASE: u32 = 0x1B;
const APIC_BASE_MASK: u64 = 0xFFFF_F000;

const REG_ID: usize = 0x20;
const REG_EOI: usize = 0x0B0;
const REG_SVR: usize = 0x0F0;
const REG_ICR_LOW: usize = 0x300;
const REG_ICR_HIGH: usize = 0x310;

const ICR_DELIVERY_PENDING: u32 = 1 << 12;
const ICR_ASSERT: u32 = 0x4000;
const ICR_INIT: u32 = 0x4500;
const ICR_STARTUP: u32 = 0x4600;
const SVR_ENABLE: u32 = 1 << 8;

/// Delay between INIT and the first STARTUP IPI
pub const INIT_DELAY_US: u64 = 10_000;
/// Delay after each STARTUP IPI
pub const STARTUP_DELAY_US: u64 = 200;

pub struct LocalApic {
    base: usize,
}

impl LocalApic {
    /// # Safety
    ///
    /// `base` must point at a mapped, 16-byte aligned local APIC register
    /// page that stays mapped for the lifetime of the returned value.
    pub const unsafe fn new(base: usize) -> Self {
        Self { base }
    }

    /// Physical base from IA32_APIC_BASE.
    ///
    /// # Safety
    ///
    /// Reads an MSR; CPL 0 only.
    pub unsafe fn base_from_msr() -> u64 {
        Msr::new(IA32_APIC_BASE).read() & APIC_BASE_MASK
    }

    pub fn base(&self) -> usize {
        self.base
    }

    /// Software-enable the APIC with the spurious vector.
    pub fn enable(&self) {
        let mut svr = self.read(REG_SVR);
        svr &= !0xFF;
        svr |= SPURIOUS_VECTOR as u32 | SVR_ENABLE;
        self.write(REG_SVR, svr);
    }

    pub fn id(&self) -> PhysicalCpuAddress {
        PhysicalCpuAddress(self.read(REG_ID) >> 24)
    }

    pub fn eoi(&self) {
        self.write(REG_EOI, 0);
    }

    /// Fixed-delivery interrupt on `vector`
    pub fn send_fixed(&self, target: PhysicalCpuAddress, vector: u8) {
        self.send(target, ICR_ASSERT | vector as u32);
    }

    /// Ring the SMP doorbell. Used as `Platform::raise_interrupt`.
    pub fn send_doorbell(&self, target: PhysicalCpuAddress) {
        self.send_fixed(target, SMP_IPI_VECTOR);
    }

    pub fn send_init(&self, target: PhysicalCpuAddress) {
        self.send(target, ICR_INIT);
    }

    /// STARTUP IPI; the target begins at `page << 12`
    pub fn send_startup(&self, target: PhysicalCpuAddress, page: u8) {
        self.send(target, ICR_STARTUP | page as u32);
    }

    /// INIT, wait, then STARTUP twice. Used as `Platform::wake`.
    pub fn wake_sequence<C: Clock + ?Sized>(
        &self,
        clock: &C,
        target: PhysicalCpuAddress,
        page: u8,
    ) {
        self.send_init(target);
        clock.delay_us(INIT_DELAY_US);
        for _ in 0..2 {
            self.send_startup(target, page);
            clock.delay_us(STARTUP_DELAY_US);
        }
    }

    fn send(&self, target: PhysicalCpuAddress, command: u32) {
        self.wait_idle();
        self.write(REG_ICR_HIGH, target.0 << 24);
        self.write(REG_ICR_LOW, command);
        self.wait_idle();
    }

    fn wait_idle(&self) {
        while self.read(REG_ICR_LOW) & ICR_DELIVERY_PENDING != 0 {
            core::hint::spin_loop();
        }
    }

    fn read(&self, offset: usize) -> u32 {
        // SAFETY: `new` guarantees a mapped register page.
        unsafe { read_volatile((self.base + offset) as *const u32) }
    }

    fn write(&self, offset: usize, value: u32) {
        // SAFETY: `new` guarantees a mapped register page.
        unsafe { write_volatile((self.base + offset) as *mut u32, value) }
    }
}
