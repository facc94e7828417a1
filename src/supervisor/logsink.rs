//! Log aggregation: every producer pushes formatted records onto one bounded
//! queue, a single sink thread owns the log file.

use crate::metrics;
use anyhow::{Context, Result};
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, Receiver, SyncSender, TryRecvError, TrySendError};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing_subscriber::fmt::MakeWriter;

pub const DEFAULT_QUEUE_CAPACITY: usize = 10_000;

const DRAIN_PAUSE: Duration = Duration::from_millis(100);

/// Upper bound on how long [`LogSink::stop`] waits for the final drain.
const STOP_TIMEOUT: Duration = Duration::from_secs(5);

enum LogRecord {
    Line(Vec<u8>),
    /// Sentinel: ends the current batch, the sink keeps running.
    Flush,
}

/// Producer side of the log queue, cheap to clone. Also a [`MakeWriter`] so
/// a `tracing_subscriber::fmt` layer can write straight into it.
#[derive(Clone)]
pub struct LogQueue {
    tx: SyncSender<LogRecord>,
    // shared so that a restarted sink picks up where the dead one stopped
    rx: Arc<Mutex<Receiver<LogRecord>>>,
}

impl LogQueue {
    pub fn bounded(capacity: usize) -> Self {
        let (tx, rx) = mpsc::sync_channel(capacity);
        Self {
            tx,
            rx: Arc::new(Mutex::new(rx)),
        }
    }

    /// Enqueue one record without blocking. Records that do not fit are
    /// dropped and counted.
    pub fn push(&self, record: impl Into<Vec<u8>>) {
        match self.tx.try_send(LogRecord::Line(record.into())) {
            Ok(()) | Err(TrySendError::Disconnected(_)) => {}
            Err(TrySendError::Full(_)) => metrics::LOG_RECORDS_DROPPED.inc(),
        }
    }

    /// Ask the sink to end its current batch and flush. Dropped when the
    /// queue is full.
    pub fn flush(&self) {
        let _ = self.tx.try_send(LogRecord::Flush);
    }

    fn receiver(&self) -> MutexGuard<'_, Receiver<LogRecord>> {
        self.rx
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

impl std::fmt::Debug for LogQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogQueue").finish_non_exhaustive()
    }
}

/// Buffers one formatted event and enqueues it when dropped.
pub struct QueueWriter {
    queue: LogQueue,
    buf: Vec<u8>,
}

impl Write for QueueWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.buf.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Drop for QueueWriter {
    fn drop(&mut self) {
        if !self.buf.is_empty() {
            self.queue.push(std::mem::take(&mut self.buf));
        }
    }
}

impl<'a> MakeWriter<'a> for LogQueue {
    type Writer = QueueWriter;

    fn make_writer(&'a self) -> Self::Writer {
        QueueWriter {
            queue: self.clone(),
            buf: Vec::new(),
        }
    }
}

/// Where and how the sink writes.
#[derive(Clone, Debug)]
pub struct LogFileConfig {
    pub path: PathBuf,
    pub max_bytes: u64,
    pub backups: usize,
}

/// Size-rotated append-only file: `path`, `path.1` (newest backup) up to
/// `path.<backups>`.
pub struct RotatingFile {
    config: LogFileConfig,
    file: File,
    size: u64,
}

impl RotatingFile {
    /// # Errors
    ///
    /// Returns an error if the file cannot be opened for appending.
    pub fn open(config: LogFileConfig) -> io::Result<Self> {
        let file = open_append(&config.path)?;
        let size = file.metadata()?.len();

        Ok(Self { config, file, size })
    }

    /// # Errors
    ///
    /// Returns an error if writing or rotating fails.
    pub fn write_record(&mut self, record: &[u8]) -> io::Result<()> {
        let len = record.len() as u64;

        if self.config.max_bytes > 0 && self.size > 0 && self.size + len > self.config.max_bytes {
            self.rotate()?;
        }

        self.file.write_all(record)?;
        self.size += len;

        Ok(())
    }

    /// # Errors
    ///
    /// Returns an error if the file cannot be flushed.
    pub fn flush(&mut self) -> io::Result<()> {
        self.file.flush()
    }

    fn rotate(&mut self) -> io::Result<()> {
        self.file.flush()?;

        let path = &self.config.path;

        if self.config.backups == 0 {
            self.file = OpenOptions::new().write(true).truncate(true).open(path)?;
            self.size = 0;
            return Ok(());
        }

        for n in (1..self.config.backups).rev() {
            let from = backup_path(path, n);
            if from.exists() {
                fs::rename(&from, backup_path(path, n + 1))?;
            }
        }
        fs::rename(path, backup_path(path, 1))?;

        self.file = open_append(path)?;
        self.size = 0;

        Ok(())
    }
}

pub fn backup_path(path: &Path, n: usize) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(format!(".{n}"));
    PathBuf::from(name)
}

fn open_append(path: &Path) -> io::Result<File> {
    OpenOptions::new().create(true).append(true).open(path)
}

/// The single consumer of a [`LogQueue`].
pub struct LogSink {
    queue: LogQueue,
    config: LogFileConfig,
    shutdown: Arc<AtomicBool>,
    thread: Option<JoinHandle<io::Result<()>>>,
}

impl LogSink {
    /// Start the sink thread.
    ///
    /// # Errors
    ///
    /// Returns an error if the thread cannot be spawned.
    pub fn start(queue: LogQueue, config: LogFileConfig) -> Result<Self> {
        let mut sink = Self {
            queue,
            config,
            shutdown: Arc::new(AtomicBool::new(false)),
            thread: None,
        };
        sink.spawn()?;
        Ok(sink)
    }

    pub fn is_alive(&self) -> bool {
        self.thread.as_ref().is_some_and(|t| !t.is_finished())
    }

    /// Reap a dead sink thread and start a new one on the same queue.
    /// Returns the reason the previous thread ended.
    ///
    /// # Errors
    ///
    /// Returns an error if the new thread cannot be spawned.
    pub fn restart(&mut self) -> Result<String> {
        let cause = match self.thread.take().map(JoinHandle::join) {
            None => "not running".to_string(),
            Some(Ok(Ok(()))) => "stopped".to_string(),
            Some(Ok(Err(e))) => e.to_string(),
            Some(Err(panic)) => panic_message(panic.as_ref()),
        };

        self.spawn()?;
        Ok(cause)
    }

    /// Write everything queued so far and stop the sink. Never blocks on
    /// the queue: a dead sink is reaped as is, a live one gets at most
    /// [`STOP_TIMEOUT`] for its final drain.
    pub fn stop(mut self) {
        let Some(thread) = self.thread.take() else {
            return;
        };

        self.shutdown.store(true, Ordering::Release);

        if thread.is_finished() {
            let _ = thread.join();
            return;
        }

        self.queue.flush();

        let deadline = Instant::now() + STOP_TIMEOUT;
        while !thread.is_finished() {
            if Instant::now() >= deadline {
                // detached, it exits with the process
                return;
            }
            thread::sleep(Duration::from_millis(10));
        }
        let _ = thread.join();
    }

    fn spawn(&mut self) -> Result<()> {
        let queue = self.queue.clone();
        let config = self.config.clone();
        let shutdown = Arc::clone(&self.shutdown);

        let thread = thread::Builder::new()
            .name("log-sink".to_string())
            .spawn(move || drain_loop(&queue, config, &shutdown))
            .context("Failed to spawn log sink thread")?;

        self.thread = Some(thread);
        Ok(())
    }
}

/// Why a batch ended.
enum BatchEnd {
    Empty,
    Flush,
    Disconnected,
}

fn drain_batch(queue: &LogQueue, file: &mut RotatingFile) -> io::Result<BatchEnd> {
    let rx = queue.receiver();
    loop {
        match rx.try_recv() {
            Ok(LogRecord::Line(record)) => file.write_record(&record)?,
            Ok(LogRecord::Flush) => return Ok(BatchEnd::Flush),
            Err(TryRecvError::Empty) => return Ok(BatchEnd::Empty),
            Err(TryRecvError::Disconnected) => return Ok(BatchEnd::Disconnected),
        }
    }
}

fn drain_loop(queue: &LogQueue, config: LogFileConfig, shutdown: &AtomicBool) -> io::Result<()> {
    let mut file = RotatingFile::open(config)?;

    loop {
        let end = drain_batch(queue, &mut file)?;
        file.flush()?;

        if matches!(end, BatchEnd::Disconnected) {
            return Ok(());
        }

        if shutdown.load(Ordering::Acquire) {
            // write whatever is still queued behind the sentinel
            while matches!(drain_batch(queue, &mut file)?, BatchEnd::Flush) {}
            return file.flush();
        }

        if matches!(end, BatchEnd::Empty) {
            thread::sleep(DRAIN_PAUSE);
        }
    }
}

pub(crate) fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    panic
        .downcast_ref::<&str>()
        .map(ToString::to_string)
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "panic".to_string())
}
