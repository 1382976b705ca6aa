//! SMP Configuration
//!
//! Timeouts and policy knobs for bring-up and remote calls. Defaults mirror
//! the classic values: ten seconds for a secondary to check in, one tick
//! for a remote call to be acknowledged.

use core::fmt;

use crate::cpumask::MAX_CPUS;

/// Bound on the master's poll for a secondary's callin bit
pub const CHECKIN_TIMEOUT_US: u64 = 10_000_000;

/// Interval between callin polls
pub const CHECKIN_POLL_INTERVAL_US: u64 = 100;

/// Wake attempts per secondary (platforms that need a resent startup vector opt into more)
pub const WAKE_ATTEMPTS: u32 = 1;

/// Bound on a remote call's "started" acknowledgement (one 100 Hz tick)
pub const CALL_ACK_TIMEOUT_US: u64 = 10_000;

/// Interval between acknowledgement polls
pub const CALL_POLL_INTERVAL_US: u64 = 10;

/// Re-signals of lagging targets before a remote call gives up
pub const MAX_IPI_RESENDS: u32 = 3;

/// Bound on `commence()` waiting for checked-in CPUs to go online
pub const ONLINE_TIMEOUT_US: u64 = 1_000_000;

/// Bound on `send_stop_all()` waiting for peers to leave the online map
pub const STOP_TIMEOUT_US: u64 = 1_000_000;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SmpConfig {
    pub checkin_timeout_us: u64,
    pub checkin_poll_interval_us: u64,
    pub wake_attempts: u32,
    pub call_ack_timeout_us: u64,
    pub call_poll_interval_us: u64,
    /// Re-signal targets that have not acknowledged a `retry` call in time
    pub resend_ipi_on_timeout: bool,
    pub max_ipi_resends: u32,
    pub online_timeout_us: u64,
    pub stop_timeout_us: u64,
    /// Upper bound on logical CPUs, boot CPU included
    pub max_cpus: usize,
}

impl SmpConfig {
    pub const DEFAULT: SmpConfig = SmpConfig {
        checkin_timeout_us: CHECKIN_TIMEOUT_US,
        checkin_poll_interval_us: CHECKIN_POLL_INTERVAL_US,
        wake_attempts: WAKE_ATTEMPTS,
        call_ack_timeout_us: CALL_ACK_TIMEOUT_US,
        call_poll_interval_us: CALL_POLL_INTERVAL_US,
        resend_ipi_on_timeout: false,
        max_ipi_resends: MAX_IPI_RESENDS,
        online_timeout_us: ONLINE_TIMEOUT_US,
        stop_timeout_us: STOP_TIMEOUT_US,
        max_cpus: MAX_CPUS,
    };

    /// Apply kernel command line overrides.
    ///
    /// Recognized tokens: `nosmp`, `maxcpus=N`, `smp.checkin_ms=N`,
    /// `smp.wake_attempts=N`, `smp.call_timeout_us=N`, `smp.ipi_resend`,
    /// `smp.max_resends=N`. Unknown tokens are ignored; a malformed value
    /// for a recognized key stops parsing and leaves earlier overrides applied.
    pub fn apply_cmdline(&mut self, cmdline: &str) -> Result<(), ConfigError> {
        for token in cmdline.split_whitespace() {
            match token.split_once('=') {
                None => match token {
                    "nosmp" => self.max_cpus = 1,
                    "smp.ipi_resend" => self.resend_ipi_on_timeout = true,
                    _ => {}
                },
                Some((key, value)) => match key {
                    "maxcpus" => {
                        let n = parse_number(key, value)?;
                        // maxcpus=0 still leaves the boot CPU running
                        self.max_cpus = (n as usize).clamp(1, MAX_CPUS);
                    }
                    "smp.checkin_ms" => {
                        self.checkin_timeout_us = parse_number(key, value)?.saturating_mul(1000);
                    }
                    "smp.wake_attempts" => {
                        let n = parse_number(key, value)?;
                        if n == 0 || n > u32::MAX as u64 {
                            return Err(ConfigError::OutOfRange { key: "smp.wake_attempts" });
                        }
                        self.wake_attempts = n as u32;
                    }
                    "smp.call_timeout_us" => {
                        self.call_ack_timeout_us = parse_number(key, value)?;
                    }
                    "smp.max_resends" => {
                        let n = parse_number(key, value)?;
                        self.max_ipi_resends = n.min(u32::MAX as u64) as u32;
                    }
                    _ => {}
                },
            }
        }
        Ok(())
    }
}

impl Default for SmpConfig {
    fn default() -> Self {
        Self::DEFAULT
    }
}

fn parse_number(key: &str, value: &str) -> Result<u64, ConfigError> {
    value.parse::<u64>().map_err(|_| ConfigError::InvalidNumber {
        key: static_key(key),
    })
}

fn static_key(key: &str) -> &'static str {
    match key {
        "maxcpus" => "maxcpus",
        "smp.checkin_ms" => "smp.checkin_ms",
        "smp.wake_attempts" => "smp.wake_attempts",
        "smp.call_timeout_us" => "smp.call_timeout_us",
        "smp.max_resends" => "smp.max_resends",
        _ => "?",
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConfigError {
    InvalidNumber { key: &'static str },
    OutOfRange { key: &'static str },
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::InvalidNumber { key } => write!(f, "{}: expected a decimal number", key),
            ConfigError::OutOfRange { key } => write!(f, "{}: value out of range", key),
        }
    }
}
