//! Secondary CPU Bring-up
//!
//! The boot CPU enumerates the platform's processors, then brings each
//! secondary up one at a time:
//!
//! ```text
//! master                                   secondary
//! ------                                   ---------
//! spawn idle context
//! booting = cpu, WaitingCheckin
//! wake(phys) ----------------------------> secondary_start()
//! poll callin (bounded)                    local init
//!                                          WaitingCheckin -> CheckedIn
//!                                <-------- set callin
//! next CPU ...                             spin on commence
//! commence() ----------------------------> set online, enter idle
//! ```
//!
//! A secondary that misses its checkin window is marked `StuckTimeout` and
//! never joins; if it starts later anyway it halts itself.

use core::fmt;
use core::sync::atomic::{fence, Ordering};

use crate::cpumask::{CpuSet, LogicalCpu, PhysicalCpuAddress, MAX_CPUS};

use super::platform::{Platform, SecondaryEntry};
use super::poll::{poll_with_timeout, spin_until};
use super::state::NO_CPU;
use super::types::{BringupReport, BringupState, Topology};
use super::Smp;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EnumerationError {
    /// `enumerate` already ran for this boot
    AlreadyEnumerated,
    /// `bring_up_secondaries` called before `enumerate`
    NotEnumerated,
    /// `bring_up_secondaries` already ran for this boot
    AlreadyBroughtUp,
}

impl fmt::Display for EnumerationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EnumerationError::AlreadyEnumerated => f.write_str("CPUs already enumerated"),
            EnumerationError::NotEnumerated => f.write_str("CPUs not enumerated yet"),
            EnumerationError::AlreadyBroughtUp => f.write_str("secondary CPUs already brought up"),
        }
    }
}

impl<P: Platform> Smp<P> {
    /// Populate the logical-to-physical table and the possible map.
    ///
    /// The boot CPU always becomes logical 0 and is online from here on.
    /// Remaining candidates get dense logical ids in list order; disabled
    /// and duplicate entries are skipped and anything past `max_cpus` is
    /// counted in the bring-up report. Returns the number of possible CPUs.
    pub fn enumerate(&self, topology: &Topology<'_>) -> Result<usize, EnumerationError> {
        if self.maps.enumerated() != 0 {
            return Err(EnumerationError::AlreadyEnumerated);
        }
        let Some(boot) = self.maps.assign(topology.boot_cpu) else {
            return Err(EnumerationError::AlreadyEnumerated);
        };

        let running_on = self.platform.current_physical();
        if running_on != topology.boot_cpu {
            crate::kwarn!(
                "SMP: enumerating on phys {} but firmware names phys {} as boot CPU",
                running_on,
                topology.boot_cpu
            );
        }

        self.pending[boot.index()].clear();
        self.maps.possible.insert(boot);
        self.maps.callin.insert(boot);
        self.maps.online.insert(boot);
        self.maps.set_state(boot, BringupState::Online);

        let limit = self.config.max_cpus.clamp(1, MAX_CPUS);
        let mut skipped = 0;

        for candidate in topology.cpus {
            if candidate.physical == topology.boot_cpu {
                continue;
            }
            if !candidate.enabled {
                crate::kinfo!(
                    "SMP: processor {} (phys {}) disabled by firmware",
                    candidate.firmware_id,
                    candidate.physical
                );
                continue;
            }
            if self.maps.logical_id(candidate.physical).is_some() {
                crate::kwarn!(
                    "SMP: processor {} reuses phys {}, ignored",
                    candidate.firmware_id,
                    candidate.physical
                );
                continue;
            }
            if self.maps.enumerated() >= limit {
                skipped += 1;
                continue;
            }
            let Some(cpu) = self.maps.assign(candidate.physical) else {
                skipped += 1;
                continue;
            };
            self.maps.possible.insert(cpu);
            crate::kdebug!(
                "SMP: processor {} (phys {}) is CPU {}",
                candidate.firmware_id,
                candidate.physical,
                cpu
            );
        }

        if skipped > 0 {
            crate::kwarn!(
                "SMP: {} processors ignored, limit is {} CPUs",
                skipped,
                limit
            );
        }
        self.skipped.store(skipped, Ordering::Relaxed);

        let possible = self.maps.enumerated();
        crate::kinfo!(
            "SMP: {} possible CPUs, boot CPU phys {}",
            possible,
            topology.boot_cpu
        );
        Ok(possible)
    }

    /// Bring every enumerated secondary to its checkin point.
    ///
    /// Runs on the boot CPU. Each secondary gets `checkin_timeout_us` per
    /// wake attempt; one that never checks in is logged and left out. The
    /// logical-to-physical table is frozen from here on.
    pub fn bring_up_secondaries(&'static self) -> Result<BringupReport, EnumerationError> {
        if self.maps.enumerated() == 0 {
            return Err(EnumerationError::NotEnumerated);
        }
        if !self.maps.freeze() {
            return Err(EnumerationError::AlreadyBroughtUp);
        }

        let mut report = BringupReport {
            possible: self.maps.possible.load(),
            checked_in: CpuSet::single(LogicalCpu::BOOT),
            stuck: CpuSet::empty(),
            spawn_failed: CpuSet::empty(),
            skipped: self.skipped.load(Ordering::Relaxed),
        };
        let started = self.platform.now_us();

        for index in 1..self.maps.enumerated() {
            let Some(cpu) = LogicalCpu::new(index) else {
                break;
            };
            let Some(physical) = self.maps.physical_id(cpu) else {
                continue;
            };
            match self.boot_secondary(cpu, physical) {
                Ok(()) => report.checked_in.insert(cpu),
                Err(BringupState::SpawnFailed) => report.spawn_failed.insert(cpu),
                Err(_) => report.stuck.insert(cpu),
            };
        }

        let elapsed_ms = self.platform.now_us().saturating_sub(started) / 1000;
        crate::kinfo!("SMP: bring-up done in {} ms: {}", elapsed_ms, report);
        Ok(report)
    }

    /// Returns the failure state on error
    fn boot_secondary(
        &'static self,
        cpu: LogicalCpu,
        physical: PhysicalCpuAddress,
    ) -> Result<(), BringupState> {
        self.maps.set_state(cpu, BringupState::Spawning);

        let context = match self.platform.spawn_idle_context(cpu) {
            Ok(context) => context,
            Err(err) => {
                crate::kerror!("SMP: no idle context for CPU {}: {}", cpu, err);
                self.maps.set_state(cpu, BringupState::SpawnFailed);
                return Err(BringupState::SpawnFailed);
            }
        };
        *self.contexts[cpu.index()].lock() = Some(context);

        self.pending[cpu.index()].clear();
        self.maps.booting.store(cpu.index(), Ordering::Release);
        self.maps.set_state(cpu, BringupState::WaitingCheckin);
        fence(Ordering::SeqCst);

        let result = self.wait_checkin(cpu, physical);

        self.maps.booting.store(NO_CPU, Ordering::Release);
        result
    }

    fn wait_checkin(
        &'static self,
        cpu: LogicalCpu,
        physical: PhysicalCpuAddress,
    ) -> Result<(), BringupState> {
        let config = &self.config;
        let attempts = config.wake_attempts.max(1);

        for attempt in 1..=attempts {
            if attempt > 1 {
                crate::kwarn!(
                    "SMP: CPU {} silent, resending wake ({}/{})",
                    cpu,
                    attempt,
                    attempts
                );
            }
            self.platform.wake(physical, SecondaryEntry::new(self));

            let arrived = poll_with_timeout(
                &self.platform,
                config.checkin_timeout_us,
                config.checkin_poll_interval_us,
                || self.maps.callin.contains(cpu),
            );
            if arrived.is_ok() {
                crate::kdebug!("SMP: CPU {} checked in", cpu);
                return Ok(());
            }
        }

        if !self
            .maps
            .transition(cpu, BringupState::WaitingCheckin, BringupState::StuckTimeout)
        {
            // Checked in right at the deadline; callin follows the state change.
            spin_until(&self.platform, || self.maps.callin.contains(cpu));
            return Ok(());
        }

        self.contexts[cpu.index()].lock().take();
        crate::kerror!(
            "SMP: CPU {} (phys {}) stuck: no checkin within {} ms",
            cpu,
            physical,
            config.checkin_timeout_us / 1000
        );
        Err(BringupState::StuckTimeout)
    }

    /// Entry point of a woken secondary, reached through [`SecondaryEntry::run`].
    pub(crate) fn secondary_start(&'static self) -> ! {
        let physical = self.platform.current_physical();
        let Some(cpu) = self.maps.logical_id(physical) else {
            crate::kfatal!("SMP: unknown CPU phys {} started, halting", physical);
            self.platform.halt()
        };

        if self.maps.online.contains(cpu) {
            crate::kfatal!(
                "SMP: CPU {} (phys {}) re-entered bring-up while online, halting",
                cpu,
                physical
            );
            self.platform.halt()
        }
        if self.maps.booting.load(Ordering::Acquire) != cpu.index() {
            crate::kerror!("SMP: CPU {} started outside its bring-up window, halting", cpu);
            self.platform.halt()
        }

        self.pending[cpu.index()].clear();
        self.platform.secondary_init(cpu);

        if !self
            .maps
            .transition(cpu, BringupState::WaitingCheckin, BringupState::CheckedIn)
        {
            crate::kerror!("SMP: CPU {} checked in after its timeout, halting", cpu);
            self.platform.halt()
        }
        fence(Ordering::SeqCst);
        self.maps.callin.insert(cpu);

        spin_until(&self.platform, || self.maps.commenced.load(Ordering::Acquire));
        self.maps.set_state(cpu, BringupState::Commenced);

        let Some(context) = self.contexts[cpu.index()].lock().take() else {
            crate::kfatal!("SMP: CPU {} has no idle context, halting", cpu);
            self.platform.halt()
        };

        fence(Ordering::SeqCst);
        self.maps.online.insert(cpu);
        self.maps.set_state(cpu, BringupState::Online);
        crate::kinfo!("SMP: CPU {} (phys {}) online", cpu, physical);

        self.platform.enter_idle(cpu, context)
    }

    /// Release every checked-in secondary into its idle context.
    ///
    /// Waits up to `online_timeout_us` for them to appear in the online
    /// map and returns the number of online CPUs.
    pub fn commence(&self) -> usize {
        if self.maps.commenced.swap(true, Ordering::AcqRel) {
            crate::kwarn!("SMP: commence called twice");
            return self.num_online();
        }
        fence(Ordering::SeqCst);

        let joined = poll_with_timeout(
            &self.platform,
            self.config.online_timeout_us,
            self.config.checkin_poll_interval_us,
            || self.maps.callin.load().is_subset(self.maps.online.load()),
        );
        if joined.is_err() {
            let missing = self.maps.callin.load().difference(self.maps.online.load());
            crate::kwarn!("SMP: CPUs {} checked in but never came online", missing);
        }

        let online = self.num_online();
        crate::kinfo!(
            "SMP: {} of {} possible CPUs online",
            online,
            self.maps.possible.len()
        );
        online
    }
}
