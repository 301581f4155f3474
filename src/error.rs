//! Error types for txconsole
//!
//! A single error enum covers the session store, the query engine and the
//! command processor. Every error maps to a stable [`ErrorKind`] that the
//! console transmits in-band, so clients never have to infer the failure from
//! the HTTP status alone.

use std::fmt;
use std::io;

use thiserror::Error;

/// Unified error type for console operations
#[derive(Debug, Error)]
pub enum ConsoleError {
    /// Unknown xid or branch id
    #[error("{0}")]
    NotFound(String),
    /// Command is illegal for the current status
    #[error("{0}")]
    InvalidState(String),
    /// Delete attempted on a session or branch that has not reached a terminal status
    #[error("{0}")]
    StillActive(String),
    /// Missing or malformed command parameter
    #[error("{0}")]
    InvalidArgument(String),
    /// Malformed filter combination
    #[error("{0}")]
    InvalidQuery(String),
    /// Page number or page size out of bounds
    #[error("{0}")]
    InvalidPagination(String),
    /// Per-xid lock (or snapshot lock) not acquired within the bounded wait
    #[error("{0}")]
    Busy(String),
    /// Store/persistence fault
    #[error("{0}")]
    Internal(String),
    /// I/O error (WAL, snapshot, sockets)
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    /// Encoding or decoding failure (WAL records, snapshot file)
    #[error("codec error: {0}")]
    Codec(String),
}

/// Stable, machine-readable error classification sent to clients
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    NotFound,
    InvalidState,
    StillActive,
    InvalidArgument,
    InvalidQuery,
    InvalidPagination,
    Busy,
    Internal,
}

impl ErrorKind {
    /// Code carried in the response envelope
    pub fn code(&self) -> &'static str {
        match self {
            ErrorKind::NotFound => "NotFound",
            ErrorKind::InvalidState => "InvalidState",
            ErrorKind::StillActive => "StillActive",
            ErrorKind::InvalidArgument => "InvalidArgument",
            ErrorKind::InvalidQuery => "InvalidQuery",
            ErrorKind::InvalidPagination => "InvalidPagination",
            ErrorKind::Busy => "Busy",
            ErrorKind::Internal => "Internal",
        }
    }

    /// HTTP status that accompanies the in-band error
    pub fn http_status(&self) -> u16 {
        match self {
            ErrorKind::NotFound => 404,
            ErrorKind::InvalidState | ErrorKind::StillActive => 409,
            ErrorKind::InvalidArgument | ErrorKind::InvalidQuery | ErrorKind::InvalidPagination => 400,
            ErrorKind::Busy => 503,
            ErrorKind::Internal => 500,
        }
    }

    /// `StillActive` is the delete-specific flavour of `InvalidState`
    pub fn is_state_conflict(&self) -> bool {
        matches!(self, ErrorKind::InvalidState | ErrorKind::StillActive)
    }

    /// Whether a read may be retried after a short backoff
    pub fn is_transient(&self) -> bool {
        matches!(self, ErrorKind::Busy | ErrorKind::Internal)
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

impl ConsoleError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ConsoleError::NotFound(_) => ErrorKind::NotFound,
            ConsoleError::InvalidState(_) => ErrorKind::InvalidState,
            ConsoleError::StillActive(_) => ErrorKind::StillActive,
            ConsoleError::InvalidArgument(_) => ErrorKind::InvalidArgument,
            ConsoleError::InvalidQuery(_) => ErrorKind::InvalidQuery,
            ConsoleError::InvalidPagination(_) => ErrorKind::InvalidPagination,
            ConsoleError::Busy(_) => ErrorKind::Busy,
            ConsoleError::Internal(_) | ConsoleError::Io(_) | ConsoleError::Codec(_) => {
                ErrorKind::Internal
            }
        }
    }

    pub fn session_not_found(xid: &str) -> Self {
        ConsoleError::NotFound(format!("global session '{}' does not exist", xid))
    }

    pub fn branch_not_found(xid: &str, branch_id: u64) -> Self {
        ConsoleError::NotFound(format!(
            "branch session '{}' does not exist in global session '{}'",
            branch_id, xid
        ))
    }

    pub fn lock_timeout(xid: &str, waited_ms: u64) -> Self {
        ConsoleError::Busy(format!(
            "global session '{}' is being modified, lock not acquired within {} ms",
            xid, waited_ms
        ))
    }

    pub(crate) fn worker_gone(what: &str) -> Self {
        ConsoleError::Internal(format!("WAL worker unavailable: {}", what))
    }
}

impl From<bincode::Error> for ConsoleError {
    fn from(e: bincode::Error) -> Self {
        ConsoleError::Codec(e.to_string())
    }
}

impl From<serde_json::Error> for ConsoleError {
    fn from(e: serde_json::Error) -> Self {
        ConsoleError::Codec(e.to_string())
    }
}

/// Result type alias for console operations
pub type Result<T> = std::result::Result<T, ConsoleError>;
