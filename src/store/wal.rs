//! Write-ahead log worker for the session store
//!
//! All WAL I/O happens on one dedicated thread that owns the file handle.
//! Writers hand it records over a bounded channel and get a reply once the
//! bytes reach the OS buffer. Durability is tracked separately:
//!
//! - Records are written immediately, fsync is deferred (every
//!   `fsync_interval_ms`, or earlier when `max_unfsynced_bytes` is reached)
//! - A writer that needs durability waits on the [`DurabilityLatch`] until the
//!   worker reports an fsync covering its LSN
//! - Many mutations therefore share one fsync under load
//!
//! ### Record framing
//! ```text
//! +----------------------+-------------------------------+
//! | 4 bytes (LE u32)     | N bytes                       |
//! | encoded length N     | bincode-encoded LogRecord     |
//! +----------------------+-------------------------------+
//! ```

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{mpsc, Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use serde::Deserialize;

use super::log::{LogRecord, Lsn};
use crate::error::{ConsoleError, Result};

/// Group-commit and deferred fsync settings
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct WalConfig {
    /// Maximum time to keep collecting a batch (milliseconds)
    pub batch_timeout_ms: u64,
    /// Maximum records per batch
    pub max_batch_size: usize,
    /// WAL size that triggers an automatic checkpoint (bytes)
    pub checkpoint_threshold_bytes: u64,
    /// Deferred fsync period (milliseconds). 0 = fsync every batch.
    pub fsync_interval_ms: u64,
    /// Buffered bytes that force an immediate fsync
    pub max_unfsynced_bytes: usize,
    /// Upper bound a writer waits for its record to become durable (milliseconds)
    pub durable_wait_ms: u64,
}

impl Default for WalConfig {
    fn default() -> Self {
        Self {
            batch_timeout_ms: 2,
            max_batch_size: 128,
            checkpoint_threshold_bytes: 4 * 1024 * 1024,
            fsync_interval_ms: 20,
            max_unfsynced_bytes: 1 << 20,
            durable_wait_ms: 10_000,
        }
    }
}

impl WalConfig {
    /// fsync after every batch
    pub fn synchronous() -> Self {
        Self {
            fsync_interval_ms: 0,
            ..Default::default()
        }
    }

    /// Larger batches and a longer fsync period
    pub fn high_throughput() -> Self {
        Self {
            batch_timeout_ms: 10,
            max_batch_size: 512,
            fsync_interval_ms: 100,
            max_unfsynced_bytes: 4 << 20,
            ..Default::default()
        }
    }
}

/// Lets writers block until their LSN has been fsynced
pub struct DurabilityLatch {
    durable_lsn: AtomicU64,
    closed: AtomicBool,
    mutex: Mutex<()>,
    condvar: Condvar,
}

impl DurabilityLatch {
    fn new() -> Self {
        Self {
            durable_lsn: AtomicU64::new(0),
            closed: AtomicBool::new(false),
            mutex: Mutex::new(()),
            condvar: Condvar::new(),
        }
    }

    pub fn durable_lsn(&self) -> Lsn {
        self.durable_lsn.load(Ordering::Acquire)
    }

    /// Block until `lsn` is durable, the worker stops, or `timeout` passes
    pub fn wait(&self, lsn: Lsn, timeout: Duration) -> Result<()> {
        if self.durable_lsn() >= lsn {
            return Ok(());
        }

        let deadline = Instant::now() + timeout;
        let mut guard = self
            .mutex
            .lock()
            .map_err(|_| ConsoleError::Internal("durability latch poisoned".into()))?;

        loop {
            if self.durable_lsn() >= lsn {
                return Ok(());
            }
            if self.closed.load(Ordering::Acquire) {
                return Err(ConsoleError::worker_gone("shut down while waiting for fsync"));
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(ConsoleError::Internal(format!(
                    "timed out waiting for LSN {} to become durable (durable: {})",
                    lsn,
                    self.durable_lsn()
                )));
            }
            guard = self
                .condvar
                .wait_timeout(guard, remaining)
                .map_err(|_| ConsoleError::Internal("durability latch poisoned".into()))?
                .0;
        }
    }

    /// Only moves forward
    fn advance(&self, lsn: Lsn) {
        self.durable_lsn.fetch_max(lsn, Ordering::AcqRel);
        let _guard = self.mutex.lock();
        self.condvar.notify_all();
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
        let _guard = self.mutex.lock();
        self.condvar.notify_all();
    }
}

pub(crate) struct AppendRequest {
    record: LogRecord,
    /// Receives the number of bytes written
    responder: mpsc::SyncSender<Result<usize>>,
}

pub(crate) enum WalMessage {
    Append(AppendRequest),
    /// Empty the log file (after a checkpoint)
    Truncate(mpsc::SyncSender<Result<()>>),
    /// fsync now, reply with the durable LSN
    Sync(mpsc::SyncSender<Result<Lsn>>),
    Shutdown,
}

/// Handle to the WAL worker thread
pub struct WalWriter {
    sender: mpsc::SyncSender<WalMessage>,
    latch: Arc<DurabilityLatch>,
    durable_wait: Duration,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl WalWriter {
    /// Open (or create) the log at `path` and start the worker thread
    pub fn open(path: PathBuf, config: WalConfig) -> Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(&path)?;

        let (tx, rx) = mpsc::sync_channel::<WalMessage>(4096);
        let latch = Arc::new(DurabilityLatch::new());
        let durable_wait = Duration::from_millis(config.durable_wait_ms);

        let worker_latch = Arc::clone(&latch);
        let worker = std::thread::Builder::new()
            .name("txconsole-wal".into())
            .spawn(move || worker_loop(file, rx, path, config, worker_latch))?;

        Ok(Self {
            sender: tx,
            latch,
            durable_wait,
            worker: Mutex::new(Some(worker)),
        })
    }

    /// Queue a record without waiting. Records reach the file in submit order,
    /// so callers must submit in LSN order.
    pub fn submit(&self, record: LogRecord) -> Result<PendingAppend<'_>> {
        let lsn = record.lsn;
        let (tx, rx) = mpsc::sync_channel(1);
        self.sender
            .send(WalMessage::Append(AppendRequest { record, responder: tx }))
            .map_err(|e| ConsoleError::worker_gone(&e.to_string()))?;
        Ok(PendingAppend { writer: self, lsn, reply: rx })
    }

    /// Write a record without waiting for fsync. Returns bytes written.
    pub fn append(&self, record: LogRecord) -> Result<usize> {
        self.submit(record)?.written()
    }

    /// Write a record and wait until it is on disk
    pub fn append_durable(&self, record: LogRecord) -> Result<usize> {
        self.submit(record)?.durable()
    }

    pub fn force_sync(&self) -> Result<Lsn> {
        let (tx, rx) = mpsc::sync_channel(1);
        self.sender
            .send(WalMessage::Sync(tx))
            .map_err(|e| ConsoleError::worker_gone(&e.to_string()))?;
        rx.recv().map_err(|e| ConsoleError::worker_gone(&e.to_string()))?
    }

    pub fn truncate(&self) -> Result<()> {
        let (tx, rx) = mpsc::sync_channel(1);
        self.sender
            .send(WalMessage::Truncate(tx))
            .map_err(|e| ConsoleError::worker_gone(&e.to_string()))?;
        rx.recv().map_err(|e| ConsoleError::worker_gone(&e.to_string()))?
    }

    pub fn durable_lsn(&self) -> Lsn {
        self.latch.durable_lsn()
    }

    /// Flush, fsync and stop the worker. Safe to call more than once.
    pub fn shutdown(&self) {
        let _ = self.sender.send(WalMessage::Shutdown);
        let handle = match self.worker.lock() {
            Ok(mut guard) => guard.take(),
            Err(_) => None,
        };
        if let Some(handle) = handle {
            if handle.join().is_err() {
                log::error!("WAL worker panicked during shutdown");
            }
        }
    }
}

/// A queued record awaiting its write (and optionally fsync)
pub struct PendingAppend<'a> {
    writer: &'a WalWriter,
    lsn: Lsn,
    reply: mpsc::Receiver<Result<usize>>,
}

impl PendingAppend<'_> {
    pub fn lsn(&self) -> Lsn {
        self.lsn
    }

    /// Wait for the worker to write the record. Returns bytes written.
    pub fn written(self) -> Result<usize> {
        self.reply
            .recv()
            .map_err(|e| ConsoleError::worker_gone(&e.to_string()))?
    }

    /// Wait until the record is fsynced
    pub fn durable(self) -> Result<usize> {
        let writer = self.writer;
        let lsn = self.lsn;
        let bytes = self.written()?;
        writer.latch.wait(lsn, writer.durable_wait)?;
        Ok(bytes)
    }
}

impl Drop for WalWriter {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn worker_loop(
    mut file: File,
    rx: mpsc::Receiver<WalMessage>,
    path: PathBuf,
    config: WalConfig,
    latch: Arc<DurabilityLatch>,
) {
    let batch_timeout = Duration::from_millis(config.batch_timeout_ms.max(1));
    let fsync_interval = Duration::from_millis(config.fsync_interval_ms);
    let deferred = config.fsync_interval_ms > 0;

    let mut last_fsync = Instant::now();
    let mut unsynced_bytes: usize = 0;
    let mut written_lsn: Lsn = 0;

    loop {
        let mut batch: Vec<AppendRequest> = Vec::new();
        let mut truncates = Vec::new();
        let mut syncs = Vec::new();
        let mut shutdown = false;

        let wait = if deferred && unsynced_bytes > 0 {
            batch_timeout.min(fsync_interval.saturating_sub(last_fsync.elapsed()))
        } else {
            batch_timeout
        };

        let mut dispatch = |msg: WalMessage, batch: &mut Vec<AppendRequest>| match msg {
            WalMessage::Append(req) => batch.push(req),
            WalMessage::Truncate(r) => truncates.push(r),
            WalMessage::Sync(r) => syncs.push(r),
            WalMessage::Shutdown => shutdown = true,
        };

        match rx.recv_timeout(wait) {
            Ok(msg) => dispatch(msg, &mut batch),
            Err(mpsc::RecvTimeoutError::Timeout) => {}
            Err(mpsc::RecvTimeoutError::Disconnected) => dispatch(WalMessage::Shutdown, &mut batch),
        }

        // Keep collecting until the batch is full or the window closes
        let deadline = Instant::now() + batch_timeout;
        while !batch.is_empty() && batch.len() < config.max_batch_size {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            match rx.recv_timeout(remaining) {
                Ok(WalMessage::Shutdown) => {
                    dispatch(WalMessage::Shutdown, &mut batch);
                    break;
                }
                Ok(msg) => dispatch(msg, &mut batch),
                Err(_) => break,
            }
        }

        if !batch.is_empty() {
            let records: Vec<&LogRecord> = batch.iter().map(|r| &r.record).collect();
            match write_records(&mut file, &records) {
                Ok(sizes) => {
                    if let Some(max) = records.iter().map(|r| r.lsn).max() {
                        written_lsn = written_lsn.max(max);
                    }
                    unsynced_bytes += sizes.iter().sum::<usize>();
                    if !deferred {
                        match file.sync_data() {
                            Ok(()) => {
                                latch.advance(written_lsn);
                                unsynced_bytes = 0;
                                last_fsync = Instant::now();
                            }
                            Err(e) => log::error!("WAL fsync failed: {}", e),
                        }
                    }
                    for (req, size) in batch.into_iter().zip(sizes) {
                        let _ = req.responder.send(Ok(size));
                    }
                }
                Err(e) => {
                    log::error!("WAL write failed: {}", e);
                    let msg = e.to_string();
                    for req in batch {
                        let _ = req.responder.send(Err(ConsoleError::Internal(msg.clone())));
                    }
                }
            }
        }

        let due = deferred && last_fsync.elapsed() >= fsync_interval;
        let full = unsynced_bytes >= config.max_unfsynced_bytes;
        let forced = !syncs.is_empty() || !truncates.is_empty() || shutdown;

        if unsynced_bytes > 0 && (due || full || forced) {
            match file.sync_data() {
                Ok(()) => {
                    log::debug!("WAL fsync complete: LSN {}, {} bytes", written_lsn, unsynced_bytes);
                    latch.advance(written_lsn);
                    unsynced_bytes = 0;
                    last_fsync = Instant::now();
                    for r in syncs {
                        let _ = r.send(Ok(written_lsn));
                    }
                }
                Err(e) => {
                    log::error!("WAL fsync failed: {}", e);
                    for r in syncs {
                        let _ = r.send(Err(ConsoleError::Internal(e.to_string())));
                    }
                }
            }
        } else {
            for r in syncs {
                let _ = r.send(Ok(latch.durable_lsn()));
            }
        }

        for r in truncates {
            let result = truncate_file(&mut file, &path);
            if result.is_ok() {
                unsynced_bytes = 0;
            }
            let _ = r.send(result);
        }

        if shutdown {
            latch.close();
            log::info!("WAL worker stopped at LSN {}", latch.durable_lsn());
            break;
        }
    }
}

fn truncate_file(file: &mut File, path: &Path) -> Result<()> {
    file.flush()?;
    // Append mode keeps later writes at the (new) end
    file.set_len(0)?;
    file.sync_all()?;
    log::debug!("WAL truncated: {}", path.display());
    Ok(())
}

/// Write framed records, returning the byte size of each
pub(super) fn write_records(file: &mut File, records: &[&LogRecord]) -> Result<Vec<usize>> {
    let mut sizes = Vec::with_capacity(records.len());
    for record in records {
        let encoded = bincode::serialize(record)?;
        let len = encoded.len() as u32;
        file.write_all(&len.to_le_bytes())?;
        file.write_all(&encoded)?;
        sizes.push(4 + encoded.len());
    }
    file.flush()?;
    Ok(sizes)
}
