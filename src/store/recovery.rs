//! Snapshot loading and WAL replay

use std::collections::HashMap;
use std::fs::File;
use std::io::{BufReader, ErrorKind as IoErrorKind, Read};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use super::log::{LogOperation, LogRecord, Lsn};
use crate::error::{ConsoleError, Result};
use crate::types::{GlobalSession, Xid};

pub const WAL_FILE: &str = "sessions.wal";
pub const SNAPSHOT_FILE: &str = "sessions.snapshot.json";

/// Checkpoint image written next to the WAL
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct Snapshot {
    /// Every record up to and including this LSN is reflected in `sessions`
    pub lsn: Lsn,
    pub timestamp: u64,
    /// Time of the last mutation reflected in `sessions`
    #[serde(default)]
    pub last_modified: u64,
    /// Highest transaction/branch id handed out so far
    pub max_id: u64,
    pub sessions: Vec<GlobalSession>,
}

/// What the store needs to resume after a restart
#[derive(Debug, Default)]
pub struct RecoveredState {
    pub sessions: HashMap<Xid, GlobalSession>,
    pub last_lsn: Lsn,
    /// Wall-clock time of the last recovered mutation
    pub last_modified: u64,
    pub max_id: u64,
    pub replayed: usize,
}

pub struct RecoveryManager {
    data_dir: PathBuf,
}

impl RecoveryManager {
    pub fn new(data_dir: PathBuf) -> Self {
        Self { data_dir }
    }

    fn wal_path(&self) -> PathBuf {
        self.data_dir.join(WAL_FILE)
    }

    fn snapshot_path(&self) -> PathBuf {
        self.data_dir.join(SNAPSHOT_FILE)
    }

    /// Load the last snapshot, then replay newer WAL records in LSN order
    pub fn recover(&self) -> Result<RecoveredState> {
        let snapshot = read_snapshot(&self.snapshot_path())?;
        let mut state = RecoveredState {
            last_lsn: snapshot.lsn,
            last_modified: snapshot.last_modified,
            max_id: snapshot.max_id,
            ..Default::default()
        };
        for session in snapshot.sessions {
            state.max_id = state.max_id.max(max_id_of(&session));
            state.sessions.insert(session.xid.clone(), session);
        }
        if snapshot.lsn > 0 {
            log::info!(
                "Loaded snapshot at LSN {} with {} sessions",
                snapshot.lsn,
                state.sessions.len()
            );
        }

        let mut records = read_wal(&self.wal_path())?;
        records.sort_by_key(|r| r.lsn);

        for record in records {
            if record.lsn <= snapshot.lsn {
                continue;
            }
            state.last_lsn = state.last_lsn.max(record.lsn);
            match record.op {
                LogOperation::Upsert { session } => {
                    state.last_modified = state.last_modified.max(record.timestamp);
                    state.max_id = state.max_id.max(max_id_of(&session));
                    state.sessions.insert(session.xid.clone(), session);
                }
                LogOperation::Remove { xid } => {
                    state.last_modified = state.last_modified.max(record.timestamp);
                    state.sessions.remove(&xid);
                }
                LogOperation::Checkpoint { .. } => {}
            }
            state.replayed += 1;
        }

        if state.replayed > 0 {
            log::info!(
                "Replayed {} WAL records, recovered {} sessions (last LSN {})",
                state.replayed,
                state.sessions.len(),
                state.last_lsn
            );
        }
        Ok(state)
    }
}

fn max_id_of(session: &GlobalSession) -> u64 {
    session
        .branches
        .iter()
        .map(|b| b.branch_id)
        .fold(session.transaction_id, u64::max)
}

pub fn read_snapshot(path: &Path) -> Result<Snapshot> {
    if !path.exists() {
        return Ok(Snapshot::default());
    }
    let file = File::open(path)?;
    serde_json::from_reader(BufReader::new(file)).map_err(|e| {
        ConsoleError::Codec(format!("failed to parse snapshot '{}': {}", path.display(), e))
    })
}

/// Write the snapshot through a temp file and rename it into place
pub fn write_snapshot(path: &Path, snapshot: &Snapshot) -> Result<()> {
    let dir = path
        .parent()
        .ok_or_else(|| ConsoleError::Internal(format!("snapshot path '{}' has no parent", path.display())))?;
    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    serde_json::to_writer(&mut tmp, snapshot)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| ConsoleError::Io(e.error))?;
    Ok(())
}

/// Read every well-formed record; a torn tail from a crash mid-write ends the scan
pub fn read_wal(path: &Path) -> Result<Vec<LogRecord>> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let file = File::open(path)?;
    let file_len = file.metadata()?.len();
    let mut reader = BufReader::new(file);
    let mut records = Vec::new();
    let mut pos: u64 = 0;

    loop {
        let mut len_buf = [0u8; 4];
        match reader.read_exact(&mut len_buf) {
            Ok(()) => {}
            Err(ref e) if e.kind() == IoErrorKind::UnexpectedEof => break,
            Err(e) => return Err(e.into()),
        }
        pos += 4;
        let len = u32::from_le_bytes(len_buf) as u64;
        // A length past end of file is a torn or corrupt prefix; never allocate it
        if len > file_len - pos {
            log::warn!(
                "Ignoring WAL record of {} bytes at offset {} past end of {}",
                len,
                pos - 4,
                path.display()
            );
            break;
        }
        pos += len;
        let mut buf = vec![0u8; len as usize];
        if let Err(e) = reader.read_exact(&mut buf) {
            if e.kind() == IoErrorKind::UnexpectedEof {
                log::warn!("Ignoring truncated WAL record at end of {}", path.display());
                break;
            }
            return Err(e.into());
        }
        match bincode::deserialize::<LogRecord>(&buf) {
            Ok(record) => records.push(record),
            Err(e) => log::warn!("Skipping malformed WAL record: {}", e),
        }
    }
    Ok(records)
}
