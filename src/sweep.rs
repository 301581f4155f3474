//! Retention sweeper
//!
//! A background thread that periodically:
//! - Removes terminal sessions whose last modification is older than the retention period
//! - Reports sessions in a retrying status for the external coordination engine
//!
//! Stopped (`Suspended`) sessions are never touched. A session that is locked
//! by a command when the sweep reaches it is skipped until the next pass.

use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

use crate::error::{ConsoleError, Result};
use crate::state::GlobalStatus;
use crate::store::SessionStore;
use crate::types::{now_millis, Xid};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SweepConfig {
    pub interval: Duration,
    /// How long a terminal session is kept after its last modification
    pub retention: Duration,
}

impl Default for SweepConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(5),
            retention: Duration::from_secs(600),
        }
    }
}

/// Outcome of one pass
#[derive(Debug, Default, Clone, PartialEq)]
pub struct SweepReport {
    pub removed: Vec<Xid>,
    pub retry_candidates: Vec<Xid>,
    /// Expired sessions skipped because a command held their lock
    pub skipped: usize,
}

/// Run one sweep pass as of `now` (epoch millis)
pub fn sweep_once(store: &SessionStore, retention: Duration, now: u64) -> Result<SweepReport> {
    let retention_ms = retention.as_millis() as u64;
    let mut report = SweepReport::default();

    for session in store.snapshot()? {
        if session.status == GlobalStatus::Suspended {
            continue;
        }
        if session.status.is_retrying() {
            report.retry_candidates.push(session.xid.clone());
            continue;
        }
        if !expired(session.status, session.gmt_modified, retention_ms, now) {
            continue;
        }

        let guard = match store.lock(&session.xid) {
            Ok(guard) => guard,
            Err(ConsoleError::Busy(_)) => {
                report.skipped += 1;
                continue;
            }
            Err(e) => return Err(e),
        };
        // Re-check under the lock; a command may have changed it since the snapshot
        match guard.current()? {
            Some(current) if expired(current.status, current.gmt_modified, retention_ms, now) => {
                guard.remove()?;
                report.removed.push(session.xid.clone());
            }
            _ => {}
        }
    }

    report.retry_candidates.sort();
    Ok(report)
}

fn expired(status: GlobalStatus, gmt_modified: u64, retention_ms: u64, now: u64) -> bool {
    status.is_terminal() && now.saturating_sub(gmt_modified) >= retention_ms
}

struct SweeperState {
    shutdown: Mutex<bool>,
    wakeup: Condvar,
}

/// Handle to the background sweeper thread; stops it on drop
pub struct Sweeper {
    state: Arc<SweeperState>,
    worker: Option<JoinHandle<()>>,
}

impl Sweeper {
    pub fn spawn(store: Arc<SessionStore>, config: SweepConfig) -> Result<Self> {
        let state = Arc::new(SweeperState {
            shutdown: Mutex::new(false),
            wakeup: Condvar::new(),
        });
        let worker_state = Arc::clone(&state);
        let worker = thread::Builder::new()
            .name("txconsole-sweep".into())
            .spawn(move || sweeper_loop(worker_state, store, config))?;
        Ok(Self { state, worker: Some(worker) })
    }

    pub fn stop(&mut self) {
        *self.state.shutdown.lock() = true;
        self.state.wakeup.notify_all();
        if let Some(handle) = self.worker.take() {
            if handle.join().is_err() {
                log::error!("Retention sweeper panicked");
            }
        }
    }
}

impl Drop for Sweeper {
    fn drop(&mut self) {
        self.stop();
    }
}

fn sweeper_loop(state: Arc<SweeperState>, store: Arc<SessionStore>, config: SweepConfig) {
    log::info!(
        "Retention sweeper started (interval: {:?}, retention: {:?})",
        config.interval,
        config.retention
    );

    loop {
        {
            let mut shutdown = state.shutdown.lock();
            if !*shutdown {
                state.wakeup.wait_for(&mut shutdown, config.interval);
            }
            if *shutdown {
                log::info!("Retention sweeper shutting down");
                break;
            }
        }

        match sweep_once(&store, config.retention, now_millis()) {
            Ok(report) => {
                for xid in &report.removed {
                    log::info!("Sweeper removed expired global session {}", xid);
                }
                if !report.retry_candidates.is_empty() {
                    log::info!(
                        "{} global sessions awaiting retry: {:?}",
                        report.retry_candidates.len(),
                        report.retry_candidates
                    );
                }
                if report.skipped > 0 {
                    log::debug!("Sweeper skipped {} locked sessions", report.skipped);
                }
            }
            Err(e) => log::error!("Retention sweep failed: {}", e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::StoreConfig;
    use crate::types::GlobalSession;
    use std::time::Instant;
    use tempfile::tempdir;

    #[test]
    fn test_sweep_removes_only_expired_terminal_sessions() {
        let dir = tempdir().unwrap();
        let store = SessionStore::open(dir.path(), StoreConfig::default()).unwrap();
        let statuses = [
            ("done", GlobalStatus::Committed),
            ("failed", GlobalStatus::RollbackFailed),
            ("active", GlobalStatus::Committing),
            ("retry", GlobalStatus::CommitRetrying),
            ("stopped", GlobalStatus::Suspended),
        ];
        for (xid, status) in statuses {
            store.put(GlobalSession::new(xid, 1, "app", "tx", 1).with_status(status)).unwrap();
        }

        // Nothing has aged past the retention yet
        let report = sweep_once(&store, Duration::from_secs(60), now_millis()).unwrap();
        assert!(report.removed.is_empty());
        assert_eq!(report.retry_candidates, vec!["retry".to_string()]);

        let later = now_millis() + 61_000;
        let mut report = sweep_once(&store, Duration::from_secs(60), later).unwrap();
        report.removed.sort();
        assert_eq!(report.removed, vec!["done".to_string(), "failed".to_string()]);
        assert_eq!(store.len(), 3);
        assert!(store.get("stopped").is_ok());
    }

    #[test]
    fn test_sweep_skips_locked_sessions() {
        let dir = tempdir().unwrap();
        let config = StoreConfig { lock_wait: Duration::from_millis(10), ..Default::default() };
        let store = Arc::new(SessionStore::open(dir.path(), config).unwrap());
        store
            .put(GlobalSession::new("T1", 1, "app", "tx", 1).with_status(GlobalStatus::Finished))
            .unwrap();

        let held = Arc::clone(&store);
        let (locked_tx, locked_rx) = std::sync::mpsc::channel();
        let (release_tx, release_rx) = std::sync::mpsc::channel::<()>();
        let holder = thread::spawn(move || {
            let _guard = held.lock("T1").unwrap();
            locked_tx.send(()).unwrap();
            release_rx.recv().unwrap();
        });
        locked_rx.recv().unwrap();

        let report = sweep_once(&store, Duration::ZERO, now_millis()).unwrap();
        assert_eq!(report.skipped, 1);
        assert!(report.removed.is_empty());

        release_tx.send(()).unwrap();
        holder.join().unwrap();
        let report = sweep_once(&store, Duration::ZERO, now_millis()).unwrap();
        assert_eq!(report.removed, vec!["T1".to_string()]);
    }

    #[test]
    fn test_sweeper_stops_promptly() {
        let dir = tempdir().unwrap();
        let store = Arc::new(SessionStore::open(dir.path(), StoreConfig::default()).unwrap());
        let mut sweeper = Sweeper::spawn(
            store,
            SweepConfig { interval: Duration::from_secs(60), retention: Duration::ZERO },
        )
        .unwrap();
        let start = Instant::now();
        sweeper.stop();
        assert!(start.elapsed() < Duration::from_secs(5));
    }
}
