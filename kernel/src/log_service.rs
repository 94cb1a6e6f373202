//! Kernel logger.
//!
//! Implements the `log` crate façade: every subsystem logs through
//! `log::{error,warn,info,debug}!` with a fixed `target` tag ("pmm", "vmm",
//! "irq", "timer", "sched", "sync", "net", "mmio"). Records are written to
//! the serial console and mirrored into a fixed-size, heap-free ring buffer
//! of structured entries that can be drained for diagnostics.
//!
//! The ring buffer is usable before the heap exists and from interrupt
//! context (IRQ-safe lock, no allocation on the log path).

use core::fmt::{self, Write};

use log::{LevelFilter, Metadata, Record};

use crate::sync::IrqSpinLock;

/// Maximum number of buffered entries.
const LOG_BUFFER_CAPACITY: usize = 256;

/// Maximum stored message length in bytes; longer messages are truncated.
const LOG_MESSAGE_MAX_LEN: usize = 120;

/// Maximum stored subsystem-tag length in bytes.
const LOG_TARGET_MAX_LEN: usize = 12;

/// A single structured log entry, stored inline without allocation.
#[derive(Clone, Copy)]
pub struct LogEntry {
    /// Milliseconds since boot at the time of logging.
    pub timestamp_ms: u64,
    pub level: log::Level,
    target_buf: [u8; LOG_TARGET_MAX_LEN],
    target_len: u8,
    message_buf: [u8; LOG_MESSAGE_MAX_LEN],
    message_len: u8,
}

impl LogEntry {
    const fn empty() -> Self {
        Self {
            timestamp_ms: 0,
            level: log::Level::Trace,
            target_buf: [0; LOG_TARGET_MAX_LEN],
            target_len: 0,
            message_buf: [0; LOG_MESSAGE_MAX_LEN],
            message_len: 0,
        }
    }

    /// The subsystem tag.
    pub fn target(&self) -> &str {
        core::str::from_utf8(&self.target_buf[..self.target_len as usize]).unwrap_or("")
    }

    /// The message text (possibly truncated).
    pub fn message(&self) -> &str {
        core::str::from_utf8(&self.message_buf[..self.message_len as usize]).unwrap_or("")
    }
}

/// Fixed-capacity circular buffer of entries; overwrites the oldest on wrap.
struct LogRing {
    entries: [LogEntry; LOG_BUFFER_CAPACITY],
    /// Next slot to write.
    head: usize,
    /// Valid entries (capped at capacity).
    count: usize,
}

impl LogRing {
    const fn new() -> Self {
        Self {
            entries: [LogEntry::empty(); LOG_BUFFER_CAPACITY],
            head: 0,
            count: 0,
        }
    }

    fn push(&mut self, entry: LogEntry) {
        self.entries[self.head] = entry;
        self.head = (self.head + 1) % LOG_BUFFER_CAPACITY;
        if self.count < LOG_BUFFER_CAPACITY {
            self.count += 1;
        }
    }

    fn oldest_index(&self) -> usize {
        if self.count < LOG_BUFFER_CAPACITY {
            0
        } else {
            self.head
        }
    }

    fn get(&self, logical: usize) -> Option<&LogEntry> {
        if logical >= self.count {
            return None;
        }
        Some(&self.entries[(self.oldest_index() + logical) % LOG_BUFFER_CAPACITY])
    }
}

static LOG_RING: IrqSpinLock<LogRing> = IrqSpinLock::new(LogRing::new());

/// Fixed-buffer `fmt::Write` sink used to format without allocating.
struct FixedWriter {
    buf: [u8; LOG_MESSAGE_MAX_LEN],
    len: usize,
}

impl FixedWriter {
    const fn new() -> Self {
        Self {
            buf: [0; LOG_MESSAGE_MAX_LEN],
            len: 0,
        }
    }
}

impl Write for FixedWriter {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        let space = LOG_MESSAGE_MAX_LEN - self.len;
        let take = s.len().min(space);
        // Truncate on a char boundary so the stored bytes stay valid UTF-8.
        let mut take_adj = take;
        while take_adj > 0 && !s.is_char_boundary(take_adj) {
            take_adj -= 1;
        }
        self.buf[self.len..self.len + take_adj].copy_from_slice(&s.as_bytes()[..take_adj]);
        self.len += take_adj;
        Ok(())
    }
}

/// The `log::Log` implementation.
struct KernelLogger;

impl log::Log for KernelLogger {
    fn enabled(&self, _metadata: &Metadata) -> bool {
        true
    }

    fn log(&self, record: &Record) {
        // Serial line first, so a crash right after still shows the message.
        crate::println!(
            "[{:5}] [{}] {}",
            record.level(),
            record.target(),
            record.args()
        );

        let mut writer = FixedWriter::new();
        // Formatting into a fixed buffer cannot fail; overflow truncates.
        let _ = write!(writer, "{}", record.args());

        let mut entry = LogEntry::empty();
        entry.timestamp_ms = crate::timer::uptime_ms();
        entry.level = record.level();
        let target = record.target().as_bytes();
        let tlen = target.len().min(LOG_TARGET_MAX_LEN);
        entry.target_buf[..tlen].copy_from_slice(&target[..tlen]);
        entry.target_len = tlen as u8;
        entry.message_buf = writer.buf;
        entry.message_len = writer.len as u8;

        LOG_RING.lock().push(entry);
    }

    fn flush(&self) {}
}

static LOGGER: KernelLogger = KernelLogger;

/// Install the kernel logger. Called once, before any subsystem logs.
pub fn init(max_level: LevelFilter) {
    // set_logger fails only if a logger is already installed; on the kernel
    // that means init was called twice, which is harmless to ignore.
    let _ = log::set_logger(&LOGGER);
    log::set_max_level(max_level);
}

/// Visit all buffered entries, oldest first. Returns how many were visited.
pub fn drain<F: FnMut(&LogEntry)>(mut f: F) -> usize {
    let ring = LOG_RING.lock();
    let mut visited = 0;
    while let Some(entry) = ring.get(visited) {
        f(entry);
        visited += 1;
    }
    visited
}

/// Number of buffered entries.
pub fn buffered_count() -> usize {
    LOG_RING.lock().count
}
