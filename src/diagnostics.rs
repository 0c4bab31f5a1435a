//! Per-message diagnostic logging.
//!
//! Every pipeline run owns a [`RunLog`] which buffers its entries and hands
//! them to a shared [`LogSink`] in one batch when the run ends. Sinks are
//! shared between concurrent runs, so they must serialise their own writes.

use chrono::{DateTime, Local};
use std::fs::OpenOptions;
use std::io::Write;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

/// Diagnostic severity, ordered from most to least severe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub enum Severity {
    Fatal = 0,
    Error = 1,
    #[default]
    Warning = 2,
    Info = 3,
    Debug = 4,
}

impl Severity {
    /// Maps the numeric level used in the settings file.
    pub fn from_code(code: i64) -> Option<Self> {
        match code {
            0 => Some(Severity::Fatal),
            1 => Some(Severity::Error),
            2 => Some(Severity::Warning),
            3 => Some(Severity::Info),
            4 => Some(Severity::Debug),
            _ => None,
        }
    }

    pub fn code(self) -> u8 {
        self as u8
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Severity::Fatal => "FATAL",
            Severity::Error => "ERROR",
            Severity::Warning => "WARNING",
            Severity::Info => "INFO",
            Severity::Debug => "DEBUG",
        }
    }
}

impl From<Severity> for log::Level {
    fn from(severity: Severity) -> Self {
        match severity {
            Severity::Fatal | Severity::Error => log::Level::Error,
            Severity::Warning => log::Level::Warn,
            Severity::Info => log::Level::Info,
            Severity::Debug => log::Level::Debug,
        }
    }
}

#[derive(Debug, Clone)]
pub struct LogEntry {
    pub timestamp: DateTime<Local>,
    pub severity: Severity,
    pub message: String,
}

/// Destination for flushed diagnostic batches.
///
/// Implementations must never fail the caller: a batch that cannot be
/// written is dropped.
pub trait LogSink: Send + Sync {
    fn append(&self, entries: &[LogEntry]);
}

/// Forwards entries to the process-wide `log` facade.
#[derive(Debug, Default)]
pub struct ProcessLogSink;

impl LogSink for ProcessLogSink {
    fn append(&self, entries: &[LogEntry]) {
        for entry in entries {
            log::log!(log::Level::from(entry.severity), "{}", entry.message);
        }
    }
}

/// Append-only diagnostic file.
///
/// Batches are handed to a dedicated writer thread over a channel, so a
/// flush never waits on the file. The file may be momentarily locked by
/// another process; the writer retries each batch a bounded number of
/// times before dropping it. Dropping the sink drains the queue.
pub struct FileLogSink {
    path: PathBuf,
    sender: Option<mpsc::UnboundedSender<String>>,
    worker: Option<std::thread::JoinHandle<()>>,
    dropped: Arc<AtomicUsize>,
}

struct FileWriter {
    path: PathBuf,
    attempts: u32,
    backoff: Duration,
    dropped: Arc<AtomicUsize>,
}

impl FileWriter {
    fn run(self, mut receiver: mpsc::UnboundedReceiver<String>) {
        while let Some(text) = receiver.blocking_recv() {
            self.write_with_retry(&text);
        }
    }

    fn write_with_retry(&self, text: &str) {
        for attempt in 1..=self.attempts {
            match self.try_write(text) {
                Ok(()) => return,
                Err(e) if attempt < self.attempts => {
                    log::debug!(
                        "Diagnostic log {} busy (attempt {attempt}): {e}",
                        self.path.display()
                    );
                    std::thread::sleep(self.backoff);
                }
                Err(e) => {
                    self.dropped.fetch_add(1, Ordering::Relaxed);
                    log::warn!(
                        "Dropping diagnostic batch after {} attempts, {} not writable: {e}",
                        self.attempts,
                        self.path.display()
                    );
                }
            }
        }
    }

    fn try_write(&self, text: &str) -> std::io::Result<()> {
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        file.write_all(text.as_bytes())?;
        file.flush()
    }
}

impl FileLogSink {
    pub const DEFAULT_ATTEMPTS: u32 = 10;
    pub const DEFAULT_BACKOFF: Duration = Duration::from_millis(100);

    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self::with_retry(path, Self::DEFAULT_ATTEMPTS, Self::DEFAULT_BACKOFF)
    }

    pub fn with_retry(path: impl Into<PathBuf>, attempts: u32, backoff: Duration) -> Self {
        let path = path.into();
        let dropped = Arc::new(AtomicUsize::new(0));
        let (sender, receiver) = mpsc::unbounded_channel();
        let writer = FileWriter {
            path: path.clone(),
            attempts: attempts.max(1),
            backoff,
            dropped: dropped.clone(),
        };

        let worker = std::thread::Builder::new()
            .name("diagnostic-log".to_string())
            .spawn(move || writer.run(receiver));
        let (sender, worker) = match worker {
            Ok(handle) => (Some(sender), Some(handle)),
            Err(e) => {
                log::error!("Failed to start diagnostic log writer: {e}");
                (None, None)
            }
        };

        FileLogSink {
            path,
            sender,
            worker,
            dropped,
        }
    }

    /// Batches given up on after exhausting all attempts.
    pub fn dropped_batches(&self) -> usize {
        self.dropped.load(Ordering::Relaxed)
    }

    fn format_batch(entries: &[LogEntry]) -> String {
        let pid = std::process::id();
        let mut out = String::new();
        for entry in entries {
            out.push_str(&format!(
                "[{}] {} {} {}\n",
                entry.timestamp.format("%Y-%m-%d %H:%M:%S"),
                pid,
                entry.severity.as_str(),
                entry.message
            ));
        }
        out
    }
}

impl LogSink for FileLogSink {
    fn append(&self, entries: &[LogEntry]) {
        if entries.is_empty() {
            return;
        }
        let sent = self
            .sender
            .as_ref()
            .map(|sender| sender.send(Self::format_batch(entries)).is_ok())
            .unwrap_or(false);
        if !sent {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            log::warn!(
                "Dropping {} diagnostic entries, writer for {} is not running",
                entries.len(),
                self.path.display()
            );
        }
    }
}

impl Drop for FileLogSink {
    fn drop(&mut self) {
        // Closing the channel lets the writer finish the queue and exit.
        self.sender.take();
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                log::warn!("Diagnostic log writer for {} panicked", self.path.display());
            }
        }
    }
}

/// Collects entries in memory. Used by tests and tooling.
#[derive(Debug, Default)]
pub struct MemoryLogSink {
    entries: Mutex<Vec<LogEntry>>,
    batches: Mutex<usize>,
}

impl MemoryLogSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entries(&self) -> Vec<LogEntry> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Number of `append` calls received.
    pub fn batches(&self) -> usize {
        *self.batches.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn contains(&self, severity: Severity, needle: &str) -> bool {
        self.entries()
            .iter()
            .any(|e| e.severity == severity && e.message.contains(needle))
    }
}

impl LogSink for MemoryLogSink {
    fn append(&self, entries: &[LogEntry]) {
        self.entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .extend_from_slice(entries);
        *self.batches.lock().unwrap_or_else(|e| e.into_inner()) += 1;
    }
}

/// Delivers every batch to each inner sink in order.
pub struct FanoutSink(pub Vec<Arc<dyn LogSink>>);

impl LogSink for FanoutSink {
    fn append(&self, entries: &[LogEntry]) {
        for sink in &self.0 {
            sink.append(entries);
        }
    }
}

/// Buffered log for a single message run.
///
/// Entries above `max_level` are discarded when logged. The buffer is
/// handed to the sink on [`RunLog::flush`] and again on drop, so a run that
/// bails out early still gets its diagnostics written, unless the log was
/// set up with [`RunLog::divert_unflushed`].
pub struct RunLog {
    max_level: Severity,
    entries: Vec<LogEntry>,
    sink: Arc<dyn LogSink>,
    salvage: Option<Arc<Mutex<Vec<LogEntry>>>>,
}

impl RunLog {
    pub fn new(sink: Arc<dyn LogSink>, max_level: Severity) -> Self {
        RunLog {
            max_level,
            entries: Vec::new(),
            sink,
            salvage: None,
        }
    }

    /// Entries still buffered when this log is dropped are moved into
    /// `slot` instead of going to the sink. Lets the caller report a run
    /// that never reached its final flush in a single batch.
    pub fn divert_unflushed(mut self, slot: Arc<Mutex<Vec<LogEntry>>>) -> Self {
        self.salvage = Some(slot);
        self
    }

    /// Adds entries recorded elsewhere ahead of anything logged later.
    pub fn absorb(&mut self, entries: Vec<LogEntry>) {
        self.entries.extend(entries);
    }

    pub fn enabled(&self, severity: Severity) -> bool {
        severity <= self.max_level
    }

    pub fn log(&mut self, message: impl Into<String>, severity: Severity) {
        if !self.enabled(severity) {
            return;
        }
        self.entries.push(LogEntry {
            timestamp: Local::now(),
            severity,
            message: message.into(),
        });
    }

    pub fn fatal(&mut self, message: impl Into<String>) {
        self.log(message, Severity::Fatal);
    }

    pub fn error(&mut self, message: impl Into<String>) {
        self.log(message, Severity::Error);
    }

    pub fn warning(&mut self, message: impl Into<String>) {
        self.log(message, Severity::Warning);
    }

    pub fn info(&mut self, message: impl Into<String>) {
        self.log(message, Severity::Info);
    }

    pub fn debug(&mut self, message: impl Into<String>) {
        self.log(message, Severity::Debug);
    }

    pub fn flush(&mut self) {
        if self.entries.is_empty() {
            return;
        }
        let batch = std::mem::take(&mut self.entries);
        self.sink.append(&batch);
    }
}

impl Drop for RunLog {
    fn drop(&mut self) {
        if let Some(slot) = &self.salvage {
            let entries = std::mem::take(&mut self.entries);
            slot.lock().unwrap_or_else(|e| e.into_inner()).extend(entries);
            return;
        }
        self.flush();
    }
}
