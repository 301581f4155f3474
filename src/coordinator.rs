//! Coordination path
//!
//! Protocol-driven updates issued by the live transaction coordinator: begin a
//! global transaction, register branches, and report branch and global
//! outcomes. Unlike operator commands these always go through the regular
//! transition tables in [`crate::state`], and a stopped session or branch
//! refuses them until an operator starts it again.

use std::sync::Arc;

use log::debug;

use crate::error::{ConsoleError, Result};
use crate::state::{BranchStatus, GlobalStatus};
use crate::store::SessionStore;
use crate::types::{now_millis, BranchId, BranchType, GlobalSession, Xid};

/// Parameters of a branch registration
#[derive(Debug, Clone)]
pub struct BranchRegistration {
    pub branch_type: BranchType,
    pub resource_id: String,
    pub lock_key: Option<String>,
    pub client_id: Option<String>,
    pub application_data: Option<String>,
}

impl BranchRegistration {
    pub fn new(branch_type: BranchType, resource_id: impl Into<String>) -> Self {
        Self {
            branch_type,
            resource_id: resource_id.into(),
            lock_key: None,
            client_id: None,
            application_data: None,
        }
    }
}

pub struct Coordinator {
    store: Arc<SessionStore>,
    /// Prefix of every xid handed out, usually the console's host:port
    server_addr: String,
}

impl Coordinator {
    pub fn new(store: Arc<SessionStore>, server_addr: impl Into<String>) -> Self {
        Self { store, server_addr: server_addr.into() }
    }

    /// Start a global transaction and return its xid
    pub fn begin(
        &self,
        application_id: &str,
        transaction_service_group: &str,
        transaction_name: &str,
        timeout_ms: u64,
    ) -> Result<Xid> {
        if application_id.trim().is_empty() {
            return Err(ConsoleError::InvalidArgument("applicationId must not be blank".into()));
        }
        let transaction_id = self.store.next_id();
        let xid = format!("{}:{}", self.server_addr, transaction_id);

        let mut session = GlobalSession::new(
            xid.clone(),
            transaction_id,
            application_id,
            transaction_name,
            now_millis(),
        );
        session.transaction_service_group = transaction_service_group.to_string();
        session.timeout_ms = timeout_ms;

        self.store.put(session)?;
        debug!("Began global transaction {}", xid);
        Ok(xid)
    }

    /// Attach a new branch to a global session that is still in `Begin`
    pub fn register_branch(&self, xid: &str, registration: BranchRegistration) -> Result<BranchId> {
        let guard = self.store.lock(xid)?;
        let mut session = guard.load()?;
        if session.status != GlobalStatus::Begin {
            return Err(ConsoleError::InvalidState(format!(
                "global session '{}' is {}, branches can only register while it is Begin",
                xid, session.status
            )));
        }

        let branch_id = self.store.next_id();
        let mut branch = session.new_branch(branch_id, registration.branch_type, registration.resource_id);
        branch.lock_key = registration.lock_key;
        branch.client_id = registration.client_id;
        branch.application_data = registration.application_data;
        session.add_branch(branch);

        guard.put(session)?;
        debug!("Registered branch {} in {}", branch_id, xid);
        Ok(branch_id)
    }

    /// Phase-one or phase-two outcome of one branch
    pub fn report_branch_status(&self, xid: &str, branch_id: BranchId, status: BranchStatus) -> Result<()> {
        let guard = self.store.lock(xid)?;
        let mut session = guard.load()?;
        if session.status == GlobalStatus::Suspended {
            return Err(stopped(xid));
        }
        let branch = session
            .branch_mut(branch_id)
            .ok_or_else(|| ConsoleError::branch_not_found(xid, branch_id))?;
        if branch.status == BranchStatus::Suspended {
            return Err(ConsoleError::InvalidState(format!(
                "branch session '{}' of '{}' is stopped and does not accept status reports",
                branch_id, xid
            )));
        }
        if !branch.status.can_transition_to(status) {
            return Err(ConsoleError::InvalidState(format!(
                "branch session '{}' cannot move from {} to {}",
                branch_id, branch.status, status
            )));
        }
        branch.status = status;
        branch.gmt_modified = now_millis();

        guard.put(session)?;
        Ok(())
    }

    /// Global outcome reported by the coordination engine
    pub fn report_global_status(&self, xid: &str, status: GlobalStatus) -> Result<()> {
        let guard = self.store.lock(xid)?;
        let mut session = guard.load()?;
        if session.status == GlobalStatus::Suspended {
            return Err(stopped(xid));
        }
        if !session.status.can_transition_to(status) {
            return Err(ConsoleError::InvalidState(format!(
                "global session '{}' cannot move from {} to {}",
                xid, session.status, status
            )));
        }
        if !status.is_consistent_with(session.branch_statuses()) {
            return Err(ConsoleError::InvalidState(format!(
                "global session '{}' cannot become {} while its branches are not all finished accordingly",
                xid, status
            )));
        }
        session.status = status;

        guard.put(session)?;
        Ok(())
    }
}

fn stopped(xid: &str) -> ConsoleError {
    ConsoleError::InvalidState(format!(
        "global session '{}' is stopped and does not accept coordinator updates",
        xid
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::store::StoreConfig;
    use tempfile::{tempdir, TempDir};

    fn coordinator() -> (TempDir, Coordinator) {
        let dir = tempdir().unwrap();
        let store = Arc::new(SessionStore::open(dir.path(), StoreConfig::default()).unwrap());
        (dir, Coordinator::new(store, "10.0.0.1:8091"))
    }

    #[test]
    fn test_begin_formats_xid() {
        let (_dir, c) = coordinator();
        let xid = c.begin("app", "group", "order", 30_000).unwrap();
        assert!(xid.starts_with("10.0.0.1:8091:"));
        let s = c.store.get(&xid).unwrap();
        assert_eq!(s.status, GlobalStatus::Begin);
        assert_eq!(s.transaction_service_group, "group");
        assert_eq!(s.timeout_ms, 30_000);
        assert_eq!(c.begin(" ", "group", "order", 1).unwrap_err().kind(), ErrorKind::InvalidArgument);
    }

    #[test]
    fn test_full_commit_flow() {
        let (_dir, c) = coordinator();
        let xid = c.begin("app", "group", "order", 30_000).unwrap();
        let mut reg = BranchRegistration::new(BranchType::AT, "jdbc:db");
        reg.lock_key = Some("orders:1".into());
        let b = c.register_branch(&xid, reg).unwrap();

        c.report_branch_status(&xid, b, BranchStatus::PhaseOneDone).unwrap();
        c.report_global_status(&xid, GlobalStatus::Committing).unwrap();
        assert_eq!(
            c.report_global_status(&xid, GlobalStatus::Committed).unwrap_err().kind(),
            ErrorKind::InvalidState
        );
        c.report_branch_status(&xid, b, BranchStatus::PhaseTwoCommitted).unwrap();
        c.report_global_status(&xid, GlobalStatus::Committed).unwrap();
        c.report_global_status(&xid, GlobalStatus::Finished).unwrap();

        let s = c.store.get(&xid).unwrap();
        assert_eq!(s.status, GlobalStatus::Finished);
        assert_eq!(s.branches[0].lock_key.as_deref(), Some("orders:1"));
    }

    #[test]
    fn test_register_requires_begin() {
        let (_dir, c) = coordinator();
        let xid = c.begin("app", "group", "order", 1).unwrap();
        c.report_global_status(&xid, GlobalStatus::Rollbacking).unwrap();
        let err = c
            .register_branch(&xid, BranchRegistration::new(BranchType::TCC, "svc"))
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidState);
        let err = c
            .register_branch("missing", BranchRegistration::new(BranchType::TCC, "svc"))
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[test]
    fn test_illegal_branch_transition() {
        let (_dir, c) = coordinator();
        let xid = c.begin("app", "group", "order", 1).unwrap();
        let b = c.register_branch(&xid, BranchRegistration::new(BranchType::XA, "xa")).unwrap();
        let err = c.report_branch_status(&xid, b, BranchStatus::PhaseTwoCommitted).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidState);
        let err = c.report_branch_status(&xid, b + 100, BranchStatus::PhaseOneDone).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[test]
    fn test_stopped_session_rejects_updates() {
        let (_dir, c) = coordinator();
        let xid = c.begin("app", "group", "order", 1).unwrap();
        let mut s = c.store.get(&xid).unwrap();
        s.suspended_from = Some(s.status);
        s.status = GlobalStatus::Suspended;
        c.store.put(s).unwrap();

        let err = c.report_global_status(&xid, GlobalStatus::Committing).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidState);
        let err = c.register_branch(&xid, BranchRegistration::new(BranchType::AT, "db")).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidState);
    }
}
