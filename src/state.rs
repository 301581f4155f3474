//! Session State Machine
//!
//! The authoritative status model for global and branch sessions. The
//! coordinator path consults [`GlobalStatus::can_transition_to`] and
//! [`BranchStatus::can_transition_to`] before every protocol-driven update;
//! the command processor uses [`GlobalStatus::is_terminal`],
//! [`GlobalStatus::is_active`] and friends for its legality checks.
//!
//! ## Global status flow
//! ```text
//!                 ┌──> Committing ──> CommitRetrying ──┐
//!                 ├──> AsyncCommitting ────────────────┼──> Committed | CommitFailed ──┐
//!   Begin ────────┤                                    │                               │
//!                 ├──> Rollbacking ──> RollbackRetrying ──> Rollbacked | RollbackFailed ┼──> Finished
//!                 └──> TimeoutRollbacking ──> TimeoutRollbackRetrying                   │
//!                                   └──> TimeoutRollbacked | TimeoutRollbackFailed ─────┘
//! ```
//!
//! `Suspended` sits outside the protocol flow: only the operator `stop`/`start`
//! commands enter and leave it.
//!
//! Numeric codes match the ones the console frontend sends as the `status`
//! query parameter.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::ConsoleError;

/// Status of a global (distributed) transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum GlobalStatus {
    Begin,
    Committing,
    CommitRetrying,
    Rollbacking,
    RollbackRetrying,
    TimeoutRollbacking,
    TimeoutRollbackRetrying,
    AsyncCommitting,
    Committed,
    CommitFailed,
    Rollbacked,
    RollbackFailed,
    TimeoutRollbacked,
    TimeoutRollbackFailed,
    Finished,
    /// Stopped by an operator; the retry sweep and the coordinator leave it alone
    Suspended,
}

impl GlobalStatus {
    pub const ALL: [GlobalStatus; 16] = [
        GlobalStatus::Begin,
        GlobalStatus::Committing,
        GlobalStatus::CommitRetrying,
        GlobalStatus::Rollbacking,
        GlobalStatus::RollbackRetrying,
        GlobalStatus::TimeoutRollbacking,
        GlobalStatus::TimeoutRollbackRetrying,
        GlobalStatus::AsyncCommitting,
        GlobalStatus::Committed,
        GlobalStatus::CommitFailed,
        GlobalStatus::Rollbacked,
        GlobalStatus::RollbackFailed,
        GlobalStatus::TimeoutRollbacked,
        GlobalStatus::TimeoutRollbackFailed,
        GlobalStatus::Finished,
        GlobalStatus::Suspended,
    ];

    pub fn code(&self) -> i32 {
        match self {
            GlobalStatus::Begin => 1,
            GlobalStatus::Committing => 2,
            GlobalStatus::CommitRetrying => 3,
            GlobalStatus::Rollbacking => 4,
            GlobalStatus::RollbackRetrying => 5,
            GlobalStatus::TimeoutRollbacking => 6,
            GlobalStatus::TimeoutRollbackRetrying => 7,
            GlobalStatus::AsyncCommitting => 8,
            GlobalStatus::Committed => 9,
            GlobalStatus::CommitFailed => 10,
            GlobalStatus::Rollbacked => 11,
            GlobalStatus::RollbackFailed => 12,
            GlobalStatus::TimeoutRollbacked => 13,
            GlobalStatus::TimeoutRollbackFailed => 14,
            GlobalStatus::Finished => 15,
            GlobalStatus::Suspended => 21,
        }
    }

    pub fn from_code(code: i32) -> Option<Self> {
        Self::ALL.iter().copied().find(|s| s.code() == code)
    }

    /// No further protocol-driven transition happens from here (except to `Finished`)
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            GlobalStatus::Committed
                | GlobalStatus::CommitFailed
                | GlobalStatus::Rollbacked
                | GlobalStatus::RollbackFailed
                | GlobalStatus::TimeoutRollbacked
                | GlobalStatus::TimeoutRollbackFailed
                | GlobalStatus::Finished
        )
    }

    /// Non-terminal and not stopped by an operator
    pub fn is_active(&self) -> bool {
        !self.is_terminal() && *self != GlobalStatus::Suspended
    }

    /// Statuses the external retry engine picks up on its next pass
    pub fn is_retrying(&self) -> bool {
        matches!(
            self,
            GlobalStatus::CommitRetrying
                | GlobalStatus::RollbackRetrying
                | GlobalStatus::TimeoutRollbackRetrying
                | GlobalStatus::AsyncCommitting
        )
    }

    /// Whether the session is heading towards commit rather than rollback
    pub fn leans_commit(&self) -> bool {
        matches!(
            self,
            GlobalStatus::Committing
                | GlobalStatus::CommitRetrying
                | GlobalStatus::AsyncCommitting
                | GlobalStatus::Committed
                | GlobalStatus::CommitFailed
        )
    }

    /// Protocol-driven transition table. Reporting the current status again is allowed.
    pub fn can_transition_to(&self, next: GlobalStatus) -> bool {
        use GlobalStatus::*;
        if *self == next {
            return *self != Suspended;
        }
        match (self, next) {
            (Begin, Committing | AsyncCommitting | Rollbacking | TimeoutRollbacking) => true,
            (Committing, CommitRetrying | Committed | CommitFailed) => true,
            (CommitRetrying, Committed | CommitFailed) => true,
            (AsyncCommitting, CommitRetrying | Committed) => true,
            (Rollbacking, RollbackRetrying | Rollbacked | RollbackFailed) => true,
            (RollbackRetrying, Rollbacked | RollbackFailed) => true,
            (TimeoutRollbacking, TimeoutRollbackRetrying | TimeoutRollbacked | TimeoutRollbackFailed) => {
                true
            }
            (TimeoutRollbackRetrying, TimeoutRollbacked | TimeoutRollbackFailed) => true,
            (from, Finished) => from.is_terminal(),
            _ => false,
        }
    }

    /// Aggregate-consistency rule between a global status and its branches
    pub fn is_consistent_with<'a, I>(&self, branches: I) -> bool
    where
        I: IntoIterator<Item = &'a BranchStatus>,
    {
        let mut branches = branches.into_iter();
        match self {
            GlobalStatus::Committed => branches.all(|b| *b == BranchStatus::PhaseTwoCommitted),
            GlobalStatus::Rollbacked | GlobalStatus::TimeoutRollbacked => {
                branches.all(|b| *b == BranchStatus::PhaseTwoRollbacked)
            }
            GlobalStatus::Finished => branches.all(|b| b.is_terminal()),
            _ => true,
        }
    }
}

impl fmt::Display for GlobalStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

impl FromStr for GlobalStatus {
    type Err = ConsoleError;

    /// Accepts either the numeric code or the variant name (case-insensitive)
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if let Ok(code) = s.parse::<i32>() {
            return Self::from_code(code).ok_or_else(|| {
                ConsoleError::InvalidArgument(format!("unknown global status code {}", code))
            });
        }
        Self::ALL
            .iter()
            .copied()
            .find(|st| st.to_string().eq_ignore_ascii_case(s))
            .ok_or_else(|| ConsoleError::InvalidArgument(format!("unknown global status '{}'", s)))
    }
}

/// Status of one resource manager's branch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BranchStatus {
    Registered,
    PhaseOneDone,
    PhaseTwoCommitted,
    PhaseTwoRollbacked,
    /// Phase two failed and will not be retried
    PhaseTwoFailed,
    /// Stopped by an operator
    Suspended,
}

impl BranchStatus {
    pub const ALL: [BranchStatus; 6] = [
        BranchStatus::Registered,
        BranchStatus::PhaseOneDone,
        BranchStatus::PhaseTwoCommitted,
        BranchStatus::PhaseTwoRollbacked,
        BranchStatus::PhaseTwoFailed,
        BranchStatus::Suspended,
    ];

    pub fn code(&self) -> i32 {
        match self {
            BranchStatus::Registered => 1,
            BranchStatus::PhaseOneDone => 2,
            BranchStatus::PhaseTwoCommitted => 5,
            BranchStatus::PhaseTwoFailed => 7,
            BranchStatus::PhaseTwoRollbacked => 8,
            BranchStatus::Suspended => 13,
        }
    }

    pub fn from_code(code: i32) -> Option<Self> {
        Self::ALL.iter().copied().find(|s| s.code() == code)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            BranchStatus::PhaseTwoCommitted | BranchStatus::PhaseTwoRollbacked | BranchStatus::PhaseTwoFailed
        )
    }

    /// Only branches that have not entered phase two can be stopped
    pub fn is_stoppable(&self) -> bool {
        matches!(self, BranchStatus::Registered | BranchStatus::PhaseOneDone)
    }

    pub fn can_transition_to(&self, next: BranchStatus) -> bool {
        use BranchStatus::*;
        if *self == next {
            return *self != Suspended;
        }
        matches!(
            (self, next),
            (Registered, PhaseOneDone)
                | (PhaseOneDone, PhaseTwoCommitted | PhaseTwoRollbacked | PhaseTwoFailed)
        )
    }
}

impl fmt::Display for BranchStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

impl FromStr for BranchStatus {
    type Err = ConsoleError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if let Ok(code) = s.parse::<i32>() {
            return Self::from_code(code).ok_or_else(|| {
                ConsoleError::InvalidArgument(format!("unknown branch status code {}", code))
            });
        }
        Self::ALL
            .iter()
            .copied()
            .find(|st| st.to_string().eq_ignore_ascii_case(s))
            .ok_or_else(|| ConsoleError::InvalidArgument(format!("unknown branch status '{}'", s)))
    }
}
