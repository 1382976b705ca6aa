use core::fmt::{self, Write};
use core::sync::atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering};

use spin::{Mutex, RwLock};

static LOGGER_INITIALIZED: AtomicBool = AtomicBool::new(false);
static LOG_LEVEL: AtomicU8 = AtomicU8::new(LogLevel::INFO.priority());
static SINK_RUNTIME_ENABLED: AtomicBool = AtomicBool::new(true);
static DROPPED_LINES: AtomicUsize = AtomicUsize::new(0);

/// Number of lines kept in the log ring
pub const LOG_RING_LINES: usize = 256;

/// Maximum bytes of one formatted log line (longer lines are truncated)
pub const LOG_LINE_MAX: usize = 192;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    PANIC,
    FATAL,
    ERROR,
    WARN,
    INFO,
    DEBUG,
    TRACE,
}

impl LogLevel {
    pub const fn as_str(self) -> &'static str {
        match self {
            LogLevel::PANIC => "PANIC",
            LogLevel::FATAL => "FATAL",
            LogLevel::ERROR => "ERROR",
            LogLevel::WARN => "WARN",
            LogLevel::INFO => "INFO",
            LogLevel::DEBUG => "DEBUG",
            LogLevel::TRACE => "TRACE",
        }
    }

    const fn priority(self) -> u8 {
        match self {
            LogLevel::PANIC => 0,
            LogLevel::FATAL => 1,
            LogLevel::ERROR => 2,
            LogLevel::WARN => 3,
            LogLevel::INFO => 4,
            LogLevel::DEBUG => 5,
            LogLevel::TRACE => 6,
        }
    }

    fn from_priority(value: u8) -> Self {
        match value {
            0 => LogLevel::PANIC,
            1 => LogLevel::FATAL,
            2 => LogLevel::ERROR,
            3 => LogLevel::WARN,
            4 => LogLevel::INFO,
            5 => LogLevel::DEBUG,
            _ => LogLevel::TRACE,
        }
    }

    pub fn from_str(value: &str) -> Option<Self> {
        if value.eq_ignore_ascii_case("panic") {
            Some(LogLevel::PANIC)
        } else if value.eq_ignore_ascii_case("fatal") {
            Some(LogLevel::FATAL)
        } else if value.eq_ignore_ascii_case("error") {
            Some(LogLevel::ERROR)
        } else if value.eq_ignore_ascii_case("warn") || value.eq_ignore_ascii_case("warning") {
            Some(LogLevel::WARN)
        } else if value.eq_ignore_ascii_case("info") {
            Some(LogLevel::INFO)
        } else if value.eq_ignore_ascii_case("debug") {
            Some(LogLevel::DEBUG)
        } else if value.eq_ignore_ascii_case("trace") {
            Some(LogLevel::TRACE)
        } else {
            None
        }
    }
}

/// Destination for formatted log lines (serial console, host stderr, ...)
///
/// Called with the log ring unlocked but possibly from interrupt context,
/// so implementations must not block on anything but spin locks.
pub trait LogSink: Sync {
    fn write_line(&self, level: LogLevel, line: &str);
}

static SINK: RwLock<Option<&'static dyn LogSink>> = RwLock::new(None);
static CLOCK: RwLock<Option<fn() -> u64>> = RwLock::new(None);

/// Register the console sink and the timestamp source.
///
/// Only the first call takes effect; later calls return `false`.
pub fn init(sink: &'static dyn LogSink, clock_us: Option<fn() -> u64>) -> bool {
    if LOGGER_INITIALIZED
        .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
        .is_err()
    {
        return false;
    }
    *SINK.write() = Some(sink);
    *CLOCK.write() = clock_us;
    true
}

pub fn is_initialized() -> bool {
    LOGGER_INITIALIZED.load(Ordering::Relaxed)
}

pub fn log(level: LogLevel, args: fmt::Arguments<'_>) {
    let current = LOG_LEVEL.load(Ordering::Relaxed);
    if level.priority() > current {
        return;
    }

    let mut line = LogLine::new();
    let _ = write!(
        line,
        "[{timestamp}] [{level}] ",
        timestamp = TimestampDisplay {
            microseconds: boot_time_us(),
        },
        level = LevelDisplay(level)
    );
    if fmt::write(&mut line, args).is_err() {
        line.mark_truncated();
    }

    push_line(&line);

    if should_emit_sink(level) {
        if let Some(sink) = *SINK.read() {
            sink.write_line(level, line.as_str());
        }
    }
}

pub fn set_max_level(level: LogLevel) {
    LOG_LEVEL.store(level.priority(), Ordering::Relaxed);
}

pub fn max_level() -> LogLevel {
    LogLevel::from_priority(LOG_LEVEL.load(Ordering::Relaxed))
}

pub fn parse_level_directive(cmdline: &str) -> Option<LogLevel> {
    for token in cmdline.split_whitespace() {
        if let Some((key, value)) = token.split_once('=') {
            if key.eq_ignore_ascii_case("log") || key.eq_ignore_ascii_case("loglevel") {
                if let Some(level) = LogLevel::from_str(value) {
                    return Some(level);
                }
            }
        }
    }
    None
}

pub fn boot_time_us() -> u64 {
    match *CLOCK.read() {
        Some(clock) => clock(),
        None => 0,
    }
}

pub fn set_sink_output_enabled(enabled: bool) {
    SINK_RUNTIME_ENABLED.store(enabled, Ordering::Relaxed);
}

fn should_emit_sink(level: LogLevel) -> bool {
    if SINK_RUNTIME_ENABLED.load(Ordering::Relaxed) {
        true
    } else {
        level.priority() <= LogLevel::ERROR.priority()
    }
}

// ============================================================================
// Log ring
// ============================================================================

static LOG_RING: Mutex<LogRing> = Mutex::new(LogRing::new());

/// `try_lock` attempts before a line is dropped from the ring
const RING_LOCK_SPINS: usize = 1 << 16;

/// Append to the ring without ever blocking for good.
///
/// An interrupt handler that logs while its own CPU is inside `log` would
/// spin forever on a plain lock; after a bounded wait the line is dropped
/// from the ring (it still reaches the sink) and counted.
fn push_line(line: &LogLine) {
    for _ in 0..RING_LOCK_SPINS {
        if let Some(mut ring) = LOG_RING.try_lock() {
            ring.push(line);
            return;
        }
        core::hint::spin_loop();
    }
    DROPPED_LINES.fetch_add(1, Ordering::Relaxed);
}

/// Visit every line still held in the log ring, oldest first.
///
/// The ring stays locked for the whole walk; lines `f` logs skip the ring.
pub fn for_each_line<F: FnMut(&str)>(mut f: F) {
    let ring = LOG_RING.lock();
    for line in ring.iter() {
        f(line.as_str());
    }
}

/// Returns true when any retained line contains `needle`
pub fn ring_contains(needle: &str) -> bool {
    let mut found = false;
    for_each_line(|line| {
        if line.contains(needle) {
            found = true;
        }
    });
    found
}

/// Drop every retained line
pub fn clear_ring() {
    LOG_RING.lock().clear();
}

/// Lines overwritten before anyone read them, or never stored because the
/// ring stayed locked
pub fn dropped_lines() -> usize {
    DROPPED_LINES.load(Ordering::Relaxed)
}

struct LogRing {
    lines: [LogLine; LOG_RING_LINES],
    head: usize,
    count: usize,
}

impl LogRing {
    const fn new() -> Self {
        Self {
            lines: [LogLine::new(); LOG_RING_LINES],
            head: 0,
            count: 0,
        }
    }

    fn push(&mut self, line: &LogLine) {
        let slot = (self.head + self.count) % LOG_RING_LINES;
        self.lines[slot] = *line;
        if self.count == LOG_RING_LINES {
            self.head = (self.head + 1) % LOG_RING_LINES;
            DROPPED_LINES.fetch_add(1, Ordering::Relaxed);
        } else {
            self.count += 1;
        }
    }

    fn clear(&mut self) {
        self.head = 0;
        self.count = 0;
    }

    fn iter(&self) -> impl Iterator<Item = &LogLine> {
        (0..self.count).map(move |i| &self.lines[(self.head + i) % LOG_RING_LINES])
    }
}

#[derive(Clone, Copy)]
struct LogLine {
    buf: [u8; LOG_LINE_MAX],
    len: usize,
}

impl LogLine {
    const fn new() -> Self {
        Self {
            buf: [0; LOG_LINE_MAX],
            len: 0,
        }
    }

    fn as_str(&self) -> &str {
        // Only whole UTF-8 sequences are ever copied in.
        core::str::from_utf8(&self.buf[..self.len]).unwrap_or("<invalid utf-8>")
    }

    fn mark_truncated(&mut self) {
        const MARK: &[u8] = b"...";
        let mut at = self.len.min(LOG_LINE_MAX - MARK.len());
        // Back up to the start of a UTF-8 sequence.
        while at > 0 && at < self.len && self.buf[at] & 0xC0 == 0x80 {
            at -= 1;
        }
        self.buf[at..at + MARK.len()].copy_from_slice(MARK);
        self.len = at + MARK.len();
    }
}

impl Write for LogLine {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        let room = LOG_LINE_MAX - self.len;
        if s.len() <= room {
            self.buf[self.len..self.len + s.len()].copy_from_slice(s.as_bytes());
            self.len += s.len();
            return Ok(());
        }
        let mut cut = room;
        while cut > 0 && !s.is_char_boundary(cut) {
            cut -= 1;
        }
        self.buf[self.len..self.len + cut].copy_from_slice(&s.as_bytes()[..cut]);
        self.len += cut;
        Err(fmt::Error)
    }
}

struct TimestampDisplay {
    microseconds: u64,
}

impl fmt::Display for TimestampDisplay {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let seconds = self.microseconds / 1_000_000;
        let micros = self.microseconds % 1_000_000;
        write!(f, "{:>5}.{:06}", seconds, micros)
    }
}

struct LevelDisplay(LogLevel);

impl fmt::Display for LevelDisplay {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:<5}", self.0.as_str())
    }
}
