//! Session Store
//!
//! Durable keyed storage of global sessions and their branches.
//!
//! ## Layout
//! ```text
//! data/
//! ├── sessions.wal            # length-prefixed bincode LogRecords since the last checkpoint
//! └── sessions.snapshot.json  # checkpoint image (LSN + every session)
//! ```
//!
//! ## Write path
//! 1. Take the per-xid lock (bounded wait, `Busy` on timeout)
//! 2. Build the complete post-image of the session
//! 3. Append it to the WAL and wait for fsync
//! 4. Publish the image into the in-memory map
//!
//! A session and its branch list are one image, so readers either see the old
//! image or the new one, never a mix.
//!
//! ## Read path
//! Readers clone `Arc`s out of the published map under a short, bounded read
//! lock. They may miss a write that is still waiting for fsync; queries favour
//! availability over read-your-latest-write.
//!
//! ## Checkpoint
//! Blocks new mutations, writes the snapshot (temp file + rename), truncates
//! the WAL. Runs when the WAL grows past `checkpoint_threshold_bytes`, after
//! recovery and on shutdown.

pub mod lock;
pub mod log;
pub mod recovery;
pub mod wal;

pub use self::lock::{KeyGuard, KeyedLock};
pub use self::log::{LogOperation, LogRecord, Lsn};
pub use self::recovery::{RecoveryManager, Snapshot, SNAPSHOT_FILE, WAL_FILE};
pub use self::wal::{PendingAppend, WalConfig, WalWriter};

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};

use crate::error::{ConsoleError, Result};
use crate::types::{now_millis, BranchId, BranchSession, GlobalSession, Xid};

/// Store tuning knobs
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Bounded wait for the per-xid mutation lock
    pub lock_wait: Duration,
    /// Bounded wait for a read snapshot of the session map
    pub read_wait: Duration,
    pub wal: WalConfig,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            lock_wait: Duration::from_millis(500),
            read_wait: Duration::from_millis(200),
            wal: WalConfig::default(),
        }
    }
}

/// Audit/ordering marker of the latest successful mutation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Modification {
    pub lsn: Lsn,
    /// Unix epoch millis
    pub timestamp: u64,
}

pub struct SessionStore {
    data_dir: PathBuf,
    config: StoreConfig,
    /// Published images; replaced wholesale on every mutation
    sessions: RwLock<HashMap<Xid, Arc<GlobalSession>>>,
    locks: KeyedLock,
    wal: WalWriter,
    /// Mutations hold it shared, checkpoint holds it exclusive
    gate: RwLock<()>,
    checkpointing: Mutex<()>,
    append_order: Mutex<()>,
    current_lsn: AtomicU64,
    last_modified_at: AtomicU64,
    next_id: AtomicU64,
    bytes_since_checkpoint: AtomicU64,
    closed: AtomicBool,
}

impl SessionStore {
    /// Open the store in `data_dir`, recovering snapshot + WAL
    pub fn open(data_dir: impl Into<PathBuf>, config: StoreConfig) -> Result<Self> {
        let data_dir = data_dir.into();
        std::fs::create_dir_all(&data_dir)?;

        let recovered = RecoveryManager::new(data_dir.clone()).recover()?;
        let wal = WalWriter::open(data_dir.join(WAL_FILE), config.wal.clone())?;

        let sessions = recovered
            .sessions
            .into_iter()
            .map(|(xid, s)| (xid, Arc::new(s)))
            .collect::<HashMap<_, _>>();
        ::log::info!(
            "Session store opened at {:?}: {} sessions, LSN {}",
            data_dir,
            sessions.len(),
            recovered.last_lsn
        );

        let store = Self {
            data_dir,
            config,
            sessions: RwLock::new(sessions),
            locks: KeyedLock::new(),
            wal,
            gate: RwLock::new(()),
            checkpointing: Mutex::new(()),
            append_order: Mutex::new(()),
            current_lsn: AtomicU64::new(recovered.last_lsn),
            last_modified_at: AtomicU64::new(recovered.last_modified),
            next_id: AtomicU64::new(recovered.max_id + 1),
            bytes_since_checkpoint: AtomicU64::new(0),
            closed: AtomicBool::new(false),
        };

        if recovered.replayed > 0 {
            store.checkpoint()?;
        }
        Ok(store)
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    /// Allocate a transaction or branch id
    pub fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::SeqCst)
    }

    pub fn last_modified(&self) -> Modification {
        Modification {
            lsn: self.current_lsn.load(Ordering::SeqCst),
            timestamp: self.last_modified_at.load(Ordering::SeqCst),
        }
    }

    pub fn durable_lsn(&self) -> Lsn {
        self.wal.durable_lsn()
    }

    /// Take the mutation lock for one xid
    pub fn lock(&self, xid: &str) -> Result<SessionGuard<'_>> {
        self.ensure_open()?;
        let key = self.locks.acquire(xid, self.config.lock_wait)?;
        Ok(SessionGuard { store: self, _key: key, xid: xid.to_string() })
    }

    /// Insert or replace a session (with its branches)
    pub fn put(&self, session: GlobalSession) -> Result<Modification> {
        let guard = self.lock(&session.xid)?;
        guard.put(session)
    }

    pub fn get(&self, xid: &str) -> Result<GlobalSession> {
        self.get_arc(xid).map(|s| (*s).clone())
    }

    pub fn get_arc(&self, xid: &str) -> Result<Arc<GlobalSession>> {
        let sessions = self.read_map()?;
        sessions
            .get(xid)
            .cloned()
            .ok_or_else(|| ConsoleError::session_not_found(xid))
    }

    pub fn get_branch(&self, xid: &str, branch_id: BranchId) -> Result<BranchSession> {
        let session = self.get_arc(xid)?;
        session
            .branch(branch_id)
            .cloned()
            .ok_or_else(|| ConsoleError::branch_not_found(xid, branch_id))
    }

    pub fn contains(&self, xid: &str) -> Result<bool> {
        Ok(self.read_map()?.contains_key(xid))
    }

    /// Remove a session and all of its branches
    pub fn delete(&self, xid: &str) -> Result<GlobalSession> {
        let guard = self.lock(xid)?;
        guard.remove()
    }

    /// Remove one branch from its session
    pub fn delete_branch(&self, xid: &str, branch_id: BranchId) -> Result<BranchSession> {
        let guard = self.lock(xid)?;
        guard.remove_branch(branch_id)
    }

    /// Point-in-time view of every published session
    pub fn snapshot(&self) -> Result<Vec<Arc<GlobalSession>>> {
        Ok(self.read_map()?.values().cloned().collect())
    }

    /// Session count with the same bounded wait as `snapshot`
    pub fn count(&self) -> Result<usize> {
        Ok(self.read_map()?.len())
    }

    pub fn len(&self) -> usize {
        self.sessions.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Write a snapshot of all sessions and truncate the WAL
    pub fn checkpoint(&self) -> Result<()> {
        let _running = self.checkpointing.lock();
        let _gate = self.gate.write();

        let lsn = self.current_lsn.load(Ordering::SeqCst);
        let sessions: Vec<GlobalSession> = self
            .sessions
            .read()
            .values()
            .map(|s| (**s).clone())
            .collect();
        let count = sessions.len();
        let snapshot = Snapshot {
            lsn,
            timestamp: now_millis(),
            last_modified: self.last_modified_at.load(Ordering::SeqCst),
            max_id: self.next_id.load(Ordering::SeqCst).saturating_sub(1),
            sessions,
        };

        self.wal.force_sync()?;
        recovery::write_snapshot(&self.data_dir.join(SNAPSHOT_FILE), &snapshot)?;
        self.wal.truncate()?;
        self.bytes_since_checkpoint.store(0, Ordering::SeqCst);

        // Marker only; replay skips it because its LSN is covered by the snapshot
        self.wal.append(LogRecord {
            lsn,
            op: LogOperation::Checkpoint { snapshot_lsn: lsn },
            timestamp: now_millis(),
        })?;

        ::log::info!("Checkpoint complete at LSN {} ({} sessions)", lsn, count);
        Ok(())
    }

    /// Checkpoint and stop the WAL worker. Later mutations fail with `Internal`.
    pub fn shutdown(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let result = self.checkpoint();
        self.wal.shutdown();
        ::log::info!("Session store closed");
        result
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(ConsoleError::Internal("session store is shut down".into()));
        }
        Ok(())
    }

    fn read_map(&self) -> Result<parking_lot::RwLockReadGuard<'_, HashMap<Xid, Arc<GlobalSession>>>> {
        self.sessions.try_read_for(self.config.read_wait).ok_or_else(|| {
            ConsoleError::Busy(format!(
                "session map not readable within {} ms",
                self.config.read_wait.as_millis()
            ))
        })
    }

    /// Log `op` durably, then publish it
    fn commit(&self, op: LogOperation) -> Result<Modification> {
        let bytes = {
            let _gate = self.gate.read();
            let timestamp = now_millis();
            let (record, pending) = {
                // LSN allocation and submission stay in one order
                let _order = self.append_order.lock();
                let lsn = self.current_lsn.fetch_add(1, Ordering::SeqCst) + 1;
                let record = LogRecord { lsn, op, timestamp };
                let pending = self.wal.submit(record.clone())?;
                (record, pending)
            };
            let bytes = pending.durable()?;

            let mut sessions = self.sessions.write();
            match record.op {
                LogOperation::Upsert { session } => {
                    sessions.insert(session.xid.clone(), Arc::new(session));
                }
                LogOperation::Remove { xid } => {
                    sessions.remove(&xid);
                }
                LogOperation::Checkpoint { .. } => {}
            }
            self.last_modified_at.fetch_max(timestamp, Ordering::SeqCst);
            bytes
        };

        let total = self.bytes_since_checkpoint.fetch_add(bytes as u64, Ordering::SeqCst) + bytes as u64;
        if total > self.config.wal.checkpoint_threshold_bytes {
            if let Err(e) = self.checkpoint() {
                ::log::error!("Automatic checkpoint failed: {}", e);
            }
        }
        Ok(self.last_modified())
    }
}

impl Drop for SessionStore {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            ::log::error!("Session store shutdown failed: {}", e);
        }
    }
}

/// Exclusive access to one xid for the duration of a read-modify-write
pub struct SessionGuard<'a> {
    store: &'a SessionStore,
    _key: KeyGuard<'a>,
    xid: String,
}

impl SessionGuard<'_> {
    pub fn xid(&self) -> &str {
        &self.xid
    }

    /// Current image, if the session exists
    pub fn current(&self) -> Result<Option<Arc<GlobalSession>>> {
        Ok(self.store.read_map()?.get(&self.xid).cloned())
    }

    /// Owned copy of the current image, or `NotFound`
    pub fn load(&self) -> Result<GlobalSession> {
        self.current()?
            .map(|s| (*s).clone())
            .ok_or_else(|| ConsoleError::session_not_found(&self.xid))
    }

    /// Validate and write a new image for this xid
    pub fn put(&self, mut session: GlobalSession) -> Result<Modification> {
        self.validate(&session)?;
        session.gmt_modified = now_millis();
        self.store.commit(LogOperation::Upsert { session })
    }

    pub fn remove(&self) -> Result<GlobalSession> {
        let current = self.load()?;
        self.store.commit(LogOperation::Remove { xid: self.xid.clone() })?;
        Ok(current)
    }

    pub fn remove_branch(&self, branch_id: BranchId) -> Result<BranchSession> {
        let mut session = self.load()?;
        let branch = session
            .remove_branch(branch_id)
            .ok_or_else(|| ConsoleError::branch_not_found(&self.xid, branch_id))?;
        self.put(session)?;
        Ok(branch)
    }

    /// Reject images that would corrupt the store
    fn validate(&self, session: &GlobalSession) -> Result<()> {
        if session.xid != self.xid {
            return Err(ConsoleError::InvalidArgument(format!(
                "session xid '{}' does not match locked xid '{}'",
                session.xid, self.xid
            )));
        }
        if session.xid.trim().is_empty() {
            return Err(ConsoleError::InvalidArgument("xid must not be blank".into()));
        }
        let mut seen = HashSet::new();
        for branch in &session.branches {
            if branch.xid != session.xid {
                return Err(ConsoleError::InvalidArgument(format!(
                    "branch {} references xid '{}' but belongs to '{}'",
                    branch.branch_id, branch.xid, session.xid
                )));
            }
            if !seen.insert(branch.branch_id) {
                return Err(ConsoleError::InvalidArgument(format!(
                    "duplicate branch id {} in global session '{}'",
                    branch.branch_id, session.xid
                )));
            }
        }
        Ok(())
    }
}
