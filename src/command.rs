//! Command Processor
//!
//! Operator commands against global and branch sessions. Each command runs
//! under the per-xid lock: load the current image, check legality against the
//! state machine, write the new image. A command that cannot get the lock in
//! time fails with `Busy` and is never retried here; every command is safe to
//! reissue.
//!
//! `force_delete_*`, `change_global_status` and `delete_lock` bypass the
//! regular transition table and are logged on the `audit` target at warn level.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use log::{info, warn};

use crate::error::{ConsoleError, Result};
use crate::row_lock::LockTarget;
use crate::state::{BranchStatus, GlobalStatus};
use crate::store::SessionStore;
use crate::types::{BranchId, BranchSession, GlobalSession};

/// Direction forced by `send_commit_or_rollback`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitOrRollback {
    Commit,
    Rollback,
}

impl CommitOrRollback {
    fn target(&self) -> GlobalStatus {
        match self {
            CommitOrRollback::Commit => GlobalStatus::Committing,
            CommitOrRollback::Rollback => GlobalStatus::Rollbacking,
        }
    }
}

impl fmt::Display for CommitOrRollback {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CommitOrRollback::Commit => f.write_str("commit"),
            CommitOrRollback::Rollback => f.write_str("rollback"),
        }
    }
}

impl FromStr for CommitOrRollback {
    type Err = ConsoleError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "commit" => Ok(CommitOrRollback::Commit),
            "rollback" => Ok(CommitOrRollback::Rollback),
            other => Err(ConsoleError::InvalidArgument(format!(
                "action must be 'commit' or 'rollback', got '{}'",
                other
            ))),
        }
    }
}

pub struct CommandProcessor {
    store: Arc<SessionStore>,
}

impl CommandProcessor {
    pub fn new(store: Arc<SessionStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<SessionStore> {
        &self.store
    }

    /// Remove a terminal global session and all of its branches
    pub fn delete_global(&self, xid: &str) -> Result<()> {
        info!("delete global session, xid = {}", xid);
        let guard = self.store.lock(xid)?;
        let session = guard.load()?;
        if !session.status.is_terminal() {
            return Err(ConsoleError::StillActive(format!(
                "global session '{}' is {} and cannot be deleted until it finishes",
                xid, session.status
            )));
        }
        guard.remove()?;
        Ok(())
    }

    /// Remove a global session regardless of its status
    pub fn force_delete_global(&self, xid: &str) -> Result<()> {
        info!("force delete global session, xid = {}", xid);
        let guard = self.store.lock(xid)?;
        let removed = guard.remove()?;
        warn!(
            target: "audit",
            "force deleted global session {} (status {}, {} branches)",
            xid,
            removed.status,
            removed.branches.len()
        );
        Ok(())
    }

    /// Suspend an active session. Stopping a suspended session is a no-op.
    pub fn stop_global(&self, xid: &str) -> Result<()> {
        info!("stop global session, xid = {}", xid);
        self.update(xid, |session| {
            match session.status {
                GlobalStatus::Suspended => Ok(false),
                status if status.is_terminal() => Err(ConsoleError::InvalidState(format!(
                    "global session '{}' is already {} and cannot be stopped",
                    session.xid, status
                ))),
                status => {
                    session.suspended_from = Some(status);
                    session.status = GlobalStatus::Suspended;
                    Ok(true)
                }
            }
        })?;
        Ok(())
    }

    /// Resume a suspended session with the status it had when stopped
    pub fn start_global(&self, xid: &str) -> Result<()> {
        info!("start global session, xid = {}", xid);
        self.update(xid, |session| {
            if session.status != GlobalStatus::Suspended {
                return Err(ConsoleError::InvalidState(format!(
                    "global session '{}' is {}, not stopped",
                    session.xid, session.status
                )));
            }
            session.status = session.suspended_from.take().unwrap_or(GlobalStatus::Begin);
            Ok(true)
        })?;
        Ok(())
    }

    /// Force the session into `Committing` or `Rollbacking`. Without an
    /// explicit action the direction follows the session's current leaning.
    pub fn send_commit_or_rollback(
        &self,
        xid: &str,
        action: Option<CommitOrRollback>,
    ) -> Result<GlobalStatus> {
        info!(
            "send commit or rollback, xid = {}, action = {}",
            xid,
            action.map(|a| a.to_string()).unwrap_or_else(|| "auto".into())
        );
        let session = self.update(xid, |session| {
            let status = session.status;
            if status.is_terminal() || status == GlobalStatus::Suspended {
                return Err(ConsoleError::InvalidState(format!(
                    "global session '{}' is {}, commit or rollback cannot be sent",
                    session.xid, status
                )));
            }
            let target = match action {
                Some(action) => action.target(),
                None if status.leans_commit() => GlobalStatus::Committing,
                None => GlobalStatus::Rollbacking,
            };
            session.status = target;
            Ok(status != target)
        })?;
        Ok(session.status)
    }

    /// Operator override of the global status. Without an explicit status the
    /// failed session is moved to the matching retrying status.
    pub fn change_global_status(
        &self,
        xid: &str,
        status: Option<GlobalStatus>,
    ) -> Result<GlobalStatus> {
        info!("change global status, xid = {}", xid);
        if status == Some(GlobalStatus::Suspended) {
            return Err(ConsoleError::InvalidArgument(
                "Suspended cannot be set directly, stop the session instead".into(),
            ));
        }
        let mut previous = None;
        let session = self.update(xid, |session| {
            let current = session.status;
            if current == GlobalStatus::Suspended {
                return Err(ConsoleError::InvalidState(format!(
                    "global session '{}' is stopped, start it before changing its status",
                    session.xid
                )));
            }
            let target = match status {
                Some(target) if !target.is_consistent_with(session.branch_statuses()) => {
                    return Err(ConsoleError::InvalidState(format!(
                        "global session '{}' cannot be {} while its branches disagree",
                        session.xid, target
                    )));
                }
                Some(target) => target,
                None => failure_remedy(current).ok_or_else(|| {
                    ConsoleError::InvalidState(format!(
                        "global session '{}' is {}, only failed sessions can be changed without a target status",
                        session.xid, current
                    ))
                })?,
            };
            previous = Some(current);
            session.status = target;
            Ok(current != target)
        })?;
        if let Some(previous) = previous.filter(|p| *p != session.status) {
            warn!(
                target: "audit",
                "changed status of global session {} from {} to {}",
                xid,
                previous,
                session.status
            );
        }
        Ok(session.status)
    }

    /// Remove one terminal branch
    pub fn delete_branch(&self, xid: &str, branch_id: BranchId) -> Result<()> {
        info!("delete branch session, xid = {}, branchId = {}", xid, branch_id);
        self.update(xid, |session| {
            let branch = steerable_branch(session, branch_id)?;
            if !branch.status.is_terminal() {
                return Err(ConsoleError::StillActive(format!(
                    "branch session '{}' is {} and cannot be deleted until phase two completes",
                    branch_id, branch.status
                )));
            }
            session.remove_branch(branch_id);
            Ok(true)
        })?;
        Ok(())
    }

    /// Remove one branch regardless of its status
    pub fn force_delete_branch(&self, xid: &str, branch_id: BranchId) -> Result<()> {
        info!("force delete branch session, xid = {}, branchId = {}", xid, branch_id);
        let mut removed_status = None;
        self.update(xid, |session| {
            steerable_branch(session, branch_id)?;
            removed_status = session.remove_branch(branch_id).map(|b| b.status);
            Ok(true)
        })?;
        warn!(
            target: "audit",
            "force deleted branch session {} of global session {} (status {})",
            branch_id,
            xid,
            removed_status.map(|s| s.to_string()).unwrap_or_default()
        );
        Ok(())
    }

    /// Suspend a branch that has not entered phase two. Idempotent.
    pub fn stop_branch(&self, xid: &str, branch_id: BranchId) -> Result<()> {
        info!("stop branch session, xid = {}, branchId = {}", xid, branch_id);
        self.update(xid, |session| {
            steerable_branch(session, branch_id)?;
            let branch = branch_mut(session, branch_id)?;
            match branch.status {
                BranchStatus::Suspended => Ok(false),
                status if status.is_stoppable() => {
                    branch.suspended_from = Some(status);
                    branch.status = BranchStatus::Suspended;
                    Ok(true)
                }
                status => Err(ConsoleError::InvalidState(format!(
                    "branch session '{}' is {} and cannot be stopped",
                    branch_id, status
                ))),
            }
        })?;
        Ok(())
    }

    pub fn start_branch(&self, xid: &str, branch_id: BranchId) -> Result<()> {
        info!("start branch session, xid = {}, branchId = {}", xid, branch_id);
        self.update(xid, |session| {
            steerable_branch(session, branch_id)?;
            let branch = branch_mut(session, branch_id)?;
            if branch.status != BranchStatus::Suspended {
                return Err(ConsoleError::InvalidState(format!(
                    "branch session '{}' is {}, not stopped",
                    branch_id, branch.status
                )));
            }
            branch.status = branch.suspended_from.take().unwrap_or(BranchStatus::Registered);
            Ok(true)
        })?;
        Ok(())
    }

    /// Release one locked row from the branches holding it. Returns the number
    /// of branches that released the row; none is `NotFound`.
    pub fn delete_lock(&self, target: &LockTarget) -> Result<usize> {
        info!(
            "delete global lock, resourceId = {}, tableName = {}, pk = {}",
            target.resource_id, target.table_name, target.pk
        );
        target.validate()?;
        let xids: Vec<String> = match &target.xid {
            Some(xid) => vec![xid.clone()],
            None => self
                .store
                .snapshot()?
                .iter()
                .filter(|s| target.held_by(s))
                .map(|s| s.xid.clone())
                .collect(),
        };

        let mut released = 0;
        for xid in &xids {
            let mut count = 0;
            let outcome = self.update(xid, |session| {
                count = target.release(session);
                Ok(count > 0)
            });
            match outcome {
                Ok(_) => {}
                // Finished between the snapshot and the lock
                Err(ConsoleError::NotFound(_)) if target.xid.is_none() => continue,
                Err(e) => return Err(e),
            }
            if count > 0 {
                warn!(
                    target: "audit",
                    "released row lock {}^^^{}^^^{} of global session {} ({} branches)",
                    target.resource_id, target.table_name, target.pk, xid, count
                );
            }
            released += count;
        }

        if released == 0 {
            return Err(ConsoleError::NotFound(format!(
                "no branch holds a lock on {}:{} in {}",
                target.table_name, target.pk, target.resource_id
            )));
        }
        Ok(released)
    }

    /// Load, apply and (when `apply` reports a change) persist under the xid lock
    fn update<F>(&self, xid: &str, apply: F) -> Result<GlobalSession>
    where
        F: FnOnce(&mut GlobalSession) -> Result<bool>,
    {
        let guard = self.store.lock(xid)?;
        let mut session = guard.load()?;
        if apply(&mut session)? {
            guard.put(session.clone())?;
        }
        Ok(session)
    }
}

/// Retrying status that resumes a failed session
fn failure_remedy(status: GlobalStatus) -> Option<GlobalStatus> {
    match status {
        GlobalStatus::CommitFailed => Some(GlobalStatus::CommitRetrying),
        GlobalStatus::RollbackFailed => Some(GlobalStatus::RollbackRetrying),
        GlobalStatus::TimeoutRollbackFailed => Some(GlobalStatus::TimeoutRollbackRetrying),
        _ => None,
    }
}

/// Branch lookup for operator branch commands; Saga transactions are not steerable
fn steerable_branch(session: &GlobalSession, branch_id: BranchId) -> Result<&BranchSession> {
    if session.is_saga() {
        return Err(ConsoleError::InvalidState(format!(
            "global session '{}' runs in Saga mode, its branches cannot be managed individually",
            session.xid
        )));
    }
    session
        .branch(branch_id)
        .ok_or_else(|| ConsoleError::branch_not_found(&session.xid, branch_id))
}

fn branch_mut(session: &mut GlobalSession, branch_id: BranchId) -> Result<&mut BranchSession> {
    let xid = session.xid.clone();
    session
        .branch_mut(branch_id)
        .ok_or_else(|| ConsoleError::branch_not_found(&xid, branch_id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::store::StoreConfig;
    use crate::types::BranchType;
    use tempfile::{tempdir, TempDir};

    /// Collects `audit` target messages for the whole test binary
    struct AuditLog;

    static AUDIT_LOG: AuditLog = AuditLog;
    static AUDIT_LINES: std::sync::Mutex<Vec<String>> = std::sync::Mutex::new(Vec::new());

    impl log::Log for AuditLog {
        fn enabled(&self, metadata: &log::Metadata) -> bool {
            metadata.target() == "audit"
        }

        fn log(&self, record: &log::Record) {
            if self.enabled(record.metadata()) {
                AUDIT_LINES.lock().unwrap().push(record.args().to_string());
            }
        }

        fn flush(&self) {}
    }

    fn capture_audit() {
        static INSTALL: std::sync::Once = std::sync::Once::new();
        INSTALL.call_once(|| {
            log::set_logger(&AUDIT_LOG).unwrap();
            log::set_max_level(log::LevelFilter::Warn);
        });
    }

    fn audit_lines(xid: &str) -> Vec<String> {
        let needle = format!("global session {}", xid);
        AUDIT_LINES
            .lock()
            .unwrap()
            .iter()
            .filter(|line| line.contains(&needle))
            .cloned()
            .collect()
    }

    fn processor() -> (TempDir, CommandProcessor) {
        let dir = tempdir().unwrap();
        let store = Arc::new(SessionStore::open(dir.path(), StoreConfig::default()).unwrap());
        (dir, CommandProcessor::new(store))
    }

    fn seed(p: &CommandProcessor, xid: &str, status: GlobalStatus, branch: Option<(BranchType, BranchStatus)>) {
        let mut s = GlobalSession::new(xid, 1, "app", "tx", 1).with_status(status);
        if let Some((branch_type, branch_status)) = branch {
            let mut b = s.new_branch(1, branch_type, "db");
            b.status = branch_status;
            s.add_branch(b);
        }
        p.store().put(s).unwrap();
    }

    #[test]
    fn test_stop_is_idempotent_and_start_restores() {
        let (_dir, p) = processor();
        seed(&p, "T1", GlobalStatus::Rollbacking, None);
        p.stop_global("T1").unwrap();
        p.stop_global("T1").unwrap();
        let s = p.store().get("T1").unwrap();
        assert_eq!(s.status, GlobalStatus::Suspended);
        assert_eq!(s.suspended_from, Some(GlobalStatus::Rollbacking));

        p.start_global("T1").unwrap();
        assert_eq!(p.store().get("T1").unwrap().status, GlobalStatus::Rollbacking);
        assert_eq!(p.start_global("T1").unwrap_err().kind(), ErrorKind::InvalidState);
    }

    #[test]
    fn test_stop_terminal_fails() {
        let (_dir, p) = processor();
        seed(&p, "T1", GlobalStatus::Committed, None);
        assert_eq!(p.stop_global("T1").unwrap_err().kind(), ErrorKind::InvalidState);
    }

    #[test]
    fn test_delete_requires_terminal() {
        let (_dir, p) = processor();
        seed(&p, "T1", GlobalStatus::Committing, None);
        seed(&p, "T2", GlobalStatus::Rollbacked, None);
        assert_eq!(p.delete_global("T1").unwrap_err().kind(), ErrorKind::StillActive);
        p.delete_global("T2").unwrap();
        assert_eq!(p.delete_global("T2").unwrap_err().kind(), ErrorKind::NotFound);
        assert_eq!(p.force_delete_global("T9").unwrap_err().kind(), ErrorKind::NotFound);
    }

    #[test]
    fn test_commit_or_rollback_direction() {
        let (_dir, p) = processor();
        seed(&p, "T1", GlobalStatus::CommitRetrying, None);
        seed(&p, "T2", GlobalStatus::Begin, None);
        seed(&p, "T3", GlobalStatus::Begin, None);
        assert_eq!(p.send_commit_or_rollback("T1", None).unwrap(), GlobalStatus::Committing);
        assert_eq!(p.send_commit_or_rollback("T2", None).unwrap(), GlobalStatus::Rollbacking);
        assert_eq!(
            p.send_commit_or_rollback("T3", Some(CommitOrRollback::Commit)).unwrap(),
            GlobalStatus::Committing
        );

        p.stop_global("T2").unwrap();
        assert_eq!(p.send_commit_or_rollback("T2", None).unwrap_err().kind(), ErrorKind::InvalidState);
    }

    #[test]
    fn test_change_status_remedy_and_override() {
        let (_dir, p) = processor();
        seed(&p, "T1", GlobalStatus::RollbackFailed, None);
        seed(&p, "T2", GlobalStatus::Begin, None);
        assert_eq!(p.change_global_status("T1", None).unwrap(), GlobalStatus::RollbackRetrying);
        assert_eq!(p.change_global_status("T2", None).unwrap_err().kind(), ErrorKind::InvalidState);
        assert_eq!(
            p.change_global_status("T2", Some(GlobalStatus::Finished)).unwrap(),
            GlobalStatus::Finished
        );
        assert_eq!(
            p.change_global_status("T2", Some(GlobalStatus::Suspended)).unwrap_err().kind(),
            ErrorKind::InvalidArgument
        );
    }

    #[test]
    fn test_change_status_rejects_inconsistent_target() {
        let (_dir, p) = processor();
        seed(&p, "T1", GlobalStatus::Committing, Some((BranchType::AT, BranchStatus::Registered)));
        for target in [GlobalStatus::Committed, GlobalStatus::Rollbacked, GlobalStatus::Finished] {
            assert_eq!(
                p.change_global_status("T1", Some(target)).unwrap_err().kind(),
                ErrorKind::InvalidState
            );
        }
        assert_eq!(p.store().get("T1").unwrap().status, GlobalStatus::Committing);

        // Unconstrained targets still go through
        assert_eq!(
            p.change_global_status("T1", Some(GlobalStatus::CommitFailed)).unwrap(),
            GlobalStatus::CommitFailed
        );

        let mut t1 = p.store().get("T1").unwrap();
        t1.branch_mut(1).unwrap().status = BranchStatus::PhaseTwoCommitted;
        p.store().put(t1).unwrap();
        assert_eq!(
            p.change_global_status("T1", Some(GlobalStatus::Committed)).unwrap(),
            GlobalStatus::Committed
        );
    }

    #[test]
    fn test_audit_records_overrides() {
        capture_audit();
        let (_dir, p) = processor();
        seed(&p, "audit-1", GlobalStatus::CommitFailed, None);
        seed(&p, "audit-2", GlobalStatus::Begin, None);

        p.change_global_status("audit-1", None).unwrap();
        let lines = audit_lines("audit-1");
        assert_eq!(lines.len(), 1);
        assert!(lines[0].contains("from CommitFailed to CommitRetrying"));

        // Setting the current status again changes nothing and is not audited
        p.change_global_status("audit-1", Some(GlobalStatus::CommitRetrying)).unwrap();
        assert_eq!(audit_lines("audit-1").len(), 1);

        p.force_delete_global("audit-2").unwrap();
        let lines = audit_lines("audit-2");
        assert_eq!(lines.len(), 1);
        assert!(lines[0].starts_with("force deleted global session audit-2"));
    }

    #[test]
    fn test_delete_lock_releases_row() {
        capture_audit();
        let (_dir, p) = processor();
        let mut s = GlobalSession::new("lock-1", 1, "app", "tx", 1);
        let mut b = s.new_branch(1, BranchType::AT, "jdbc:orders");
        b.lock_key = Some("orders:1,2".into());
        s.add_branch(b);
        p.store().put(s).unwrap();

        let target = LockTarget {
            xid: None,
            branch_id: None,
            resource_id: "jdbc:orders".into(),
            table_name: "orders".into(),
            pk: "2".into(),
        };
        assert_eq!(p.delete_lock(&target).unwrap(), 1);
        assert_eq!(p.store().get_branch("lock-1", 1).unwrap().lock_key.as_deref(), Some("orders:1"));
        assert_eq!(audit_lines("lock-1").len(), 1);
        assert_eq!(p.delete_lock(&target).unwrap_err().kind(), ErrorKind::NotFound);

        let elsewhere = LockTarget { xid: Some("nope".into()), pk: "1".into(), ..target.clone() };
        assert_eq!(p.delete_lock(&elsewhere).unwrap_err().kind(), ErrorKind::NotFound);
        let blank = LockTarget { table_name: "".into(), ..target };
        assert_eq!(p.delete_lock(&blank).unwrap_err().kind(), ErrorKind::InvalidArgument);
    }

    #[test]
    fn test_branch_stop_start_and_delete() {
        let (_dir, p) = processor();
        seed(&p, "T1", GlobalStatus::Begin, Some((BranchType::AT, BranchStatus::PhaseOneDone)));
        p.stop_branch("T1", 1).unwrap();
        p.stop_branch("T1", 1).unwrap();
        assert_eq!(p.store().get_branch("T1", 1).unwrap().status, BranchStatus::Suspended);
        assert_eq!(p.delete_branch("T1", 1).unwrap_err().kind(), ErrorKind::StillActive);

        p.start_branch("T1", 1).unwrap();
        assert_eq!(p.store().get_branch("T1", 1).unwrap().status, BranchStatus::PhaseOneDone);
        assert_eq!(p.stop_branch("T1", 2).unwrap_err().kind(), ErrorKind::NotFound);

        p.force_delete_branch("T1", 1).unwrap();
        assert!(p.store().get("T1").unwrap().branches.is_empty());
        assert_eq!(p.force_delete_branch("T1", 1).unwrap_err().kind(), ErrorKind::NotFound);
    }

    #[test]
    fn test_terminal_branch_delete_and_stop() {
        let (_dir, p) = processor();
        seed(&p, "T1", GlobalStatus::Committing, Some((BranchType::TCC, BranchStatus::PhaseTwoCommitted)));
        assert_eq!(p.stop_branch("T1", 1).unwrap_err().kind(), ErrorKind::InvalidState);
        p.delete_branch("T1", 1).unwrap();
        assert_eq!(p.store().get("T1").unwrap().status, GlobalStatus::Committing);
    }

    #[test]
    fn test_saga_branches_rejected() {
        let (_dir, p) = processor();
        seed(&p, "T1", GlobalStatus::Begin, Some((BranchType::Saga, BranchStatus::Registered)));
        assert_eq!(p.stop_branch("T1", 1).unwrap_err().kind(), ErrorKind::InvalidState);
        assert_eq!(p.force_delete_branch("T1", 1).unwrap_err().kind(), ErrorKind::InvalidState);
    }

    #[test]
    fn test_action_parsing() {
        assert_eq!("Commit".parse::<CommitOrRollback>().unwrap(), CommitOrRollback::Commit);
        assert_eq!(" rollback ".parse::<CommitOrRollback>().unwrap(), CommitOrRollback::Rollback);
        assert!("abort".parse::<CommitOrRollback>().is_err());
    }
}
