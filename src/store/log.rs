//! WAL record structures

use serde::{Deserialize, Serialize};

use crate::types::{GlobalSession, Xid};

/// Log Sequence Number - orders every mutation of the store
pub type Lsn = u64;

/// A WAL log record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogRecord {
    pub lsn: Lsn,
    pub op: LogOperation,
    /// Unix epoch millis
    pub timestamp: u64,
}

/// Mutations that can be logged. Each carries the full post-image so replay
/// never depends on the state it is replayed onto.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum LogOperation {
    /// Session created or replaced (branches included)
    Upsert { session: GlobalSession },
    /// Session removed together with its branches
    Remove { xid: Xid },
    /// Snapshot written up to `snapshot_lsn`
    Checkpoint { snapshot_lsn: Lsn },
}

impl LogOperation {
    pub fn xid(&self) -> Option<&str> {
        match self {
            LogOperation::Upsert { session } => Some(&session.xid),
            LogOperation::Remove { xid } => Some(xid),
            LogOperation::Checkpoint { .. } => None,
        }
    }
}
