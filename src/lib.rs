//! smpcore - SMP bring-up and inter-processor interrupt coordination
//!
//! This crate carries the processor-independent part of multiprocessor
//! support:
//! - bringing secondary CPUs online through a checkin/commence rendezvous
//! - signalling peers with a small fixed set of IPI operations
//! - running a function on other CPUs (`call_function_*`)
//! - TLB shootdown and stop/halt broadcast
//!
//! Everything hardware-specific (waking a physical CPU, ringing a doorbell,
//! creating an idle context, halting) is reached through the
//! [`smp::Platform`] trait.
//!
//! # Module Organization
//!
//! - `logger`: kernel log levels, sinks and the in-memory log ring
//! - `config`: tunables and command-line overrides
//! - `cpumask`: logical/physical CPU ids and CPU sets
//! - `smp`: the SMP core itself
//! - `arch`: platform building blocks (x86_64 local APIC, TSC clock)

#![no_std]

pub mod arch;
pub mod config;
pub mod cpumask;
pub mod logger;
pub mod smp;

pub use config::{ConfigError, SmpConfig};
pub use cpumask::{AtomicCpuSet, CpuSet, LogicalCpu, PhysicalCpuAddress, MAX_CPUS};
pub use smp::{
    poll_with_timeout, BringupReport, BringupState, CallClass, CallError, CallFn, Clock,
    CpuCandidate, EnumerationError, FlushRange, IpiOp, IpiStats, Platform, PollTimeout,
    SecondaryEntry, Smp, SpawnError, Topology,
};

#[macro_export]
macro_rules! klog {
    ($level:expr, $($arg:tt)*) => {{
        $crate::logger::log($level, format_args!($($arg)*));
    }};
}

#[macro_export]
macro_rules! kfatal {
    ($($arg:tt)*) => {{
        $crate::klog!($crate::logger::LogLevel::FATAL, $($arg)*);
    }};
}

#[macro_export]
macro_rules! kerror {
    ($($arg:tt)*) => {{
        $crate::klog!($crate::logger::LogLevel::ERROR, $($arg)*);
    }};
}

#[macro_export]
macro_rules! kwarn {
    ($($arg:tt)*) => {{
        $crate::klog!($crate::logger::LogLevel::WARN, $($arg)*);
    }};
}

#[macro_export]
macro_rules! kinfo {
    ($($arg:tt)*) => {{
        $crate::klog!($crate::logger::LogLevel::INFO, $($arg)*);
    }};
}

#[macro_export]
macro_rules! kdebug {
    ($($arg:tt)*) => {{
        $crate::klog!($crate::logger::LogLevel::DEBUG, $($arg)*);
    }};
}

#[macro_export]
macro_rules! ktrace {
    ($($arg:tt)*) => {{
        $crate::klog!($crate::logger::LogLevel::TRACE, $($arg)*);
    }};
}
