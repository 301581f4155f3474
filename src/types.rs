//! Core session types
//!
//! [`GlobalSession`] is the coordinator's record of one distributed
//! transaction; it exclusively owns its [`BranchSession`]s. Both are stored as
//! whole images: the store never mutates a published session in place, it
//! replaces it (see `store`).

use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::state::{BranchStatus, GlobalStatus};

/// Global transaction identifier
pub type Xid = String;

/// Branch identifier, unique within its global session
pub type BranchId = u64;

/// Current wall-clock time in Unix epoch millis
pub fn now_millis() -> u64 {
    match SystemTime::now().duration_since(UNIX_EPOCH) {
        Ok(dur) => dur.as_millis() as u64,
        Err(_) => 0,
    }
}

/// Transaction mode a branch participates in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BranchType {
    AT,
    TCC,
    Saga,
    XA,
}

impl BranchType {
    pub fn from_name(name: &str) -> Option<Self> {
        match name.to_uppercase().as_str() {
            "AT" => Some(BranchType::AT),
            "TCC" => Some(BranchType::TCC),
            "SAGA" => Some(BranchType::Saga),
            "XA" => Some(BranchType::XA),
            _ => None,
        }
    }
}

/// One resource manager's participation in a global transaction
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BranchSession {
    pub xid: Xid,
    pub branch_id: BranchId,
    pub application_id: String,
    pub transaction_name: String,
    pub branch_type: BranchType,
    pub resource_id: String,
    /// Row locks held by the branch, `table:pk1,pk2;table2:pk`
    pub lock_key: Option<String>,
    pub client_id: Option<String>,
    pub application_data: Option<String>,
    pub status: BranchStatus,
    /// Status before an operator stop, restored by start
    pub suspended_from: Option<BranchStatus>,
    pub begin_time: u64,
    pub gmt_modified: u64,
}

/// The coordinator's record of one distributed transaction
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GlobalSession {
    pub xid: Xid,
    pub transaction_id: u64,
    pub application_id: String,
    pub transaction_service_group: String,
    pub transaction_name: String,
    pub timeout_ms: u64,
    pub status: GlobalStatus,
    /// Status before an operator stop, restored by start
    pub suspended_from: Option<GlobalStatus>,
    pub begin_time: u64,
    pub gmt_modified: u64,
    /// Ordered by registration; branch ids are unique
    pub branches: Vec<BranchSession>,
}

impl GlobalSession {
    pub fn new(
        xid: impl Into<Xid>,
        transaction_id: u64,
        application_id: impl Into<String>,
        transaction_name: impl Into<String>,
        begin_time: u64,
    ) -> Self {
        Self {
            xid: xid.into(),
            transaction_id,
            application_id: application_id.into(),
            transaction_service_group: String::new(),
            transaction_name: transaction_name.into(),
            timeout_ms: 60_000,
            status: GlobalStatus::Begin,
            suspended_from: None,
            begin_time,
            gmt_modified: begin_time,
            branches: Vec::new(),
        }
    }

    pub fn with_status(mut self, status: GlobalStatus) -> Self {
        self.status = status;
        self
    }

    /// Build a branch that inherits this session's descriptive fields
    pub fn new_branch(
        &self,
        branch_id: BranchId,
        branch_type: BranchType,
        resource_id: impl Into<String>,
    ) -> BranchSession {
        BranchSession {
            xid: self.xid.clone(),
            branch_id,
            application_id: self.application_id.clone(),
            transaction_name: self.transaction_name.clone(),
            branch_type,
            resource_id: resource_id.into(),
            lock_key: None,
            client_id: None,
            application_data: None,
            status: BranchStatus::Registered,
            suspended_from: None,
            begin_time: now_millis(),
            gmt_modified: now_millis(),
        }
    }

    pub fn branch(&self, branch_id: BranchId) -> Option<&BranchSession> {
        self.branches.iter().find(|b| b.branch_id == branch_id)
    }

    pub fn branch_mut(&mut self, branch_id: BranchId) -> Option<&mut BranchSession> {
        self.branches.iter_mut().find(|b| b.branch_id == branch_id)
    }

    /// Append a branch; returns false if the id is already taken
    pub fn add_branch(&mut self, branch: BranchSession) -> bool {
        if self.branch(branch.branch_id).is_some() {
            return false;
        }
        self.branches.push(branch);
        true
    }

    pub fn remove_branch(&mut self, branch_id: BranchId) -> Option<BranchSession> {
        let pos = self.branches.iter().position(|b| b.branch_id == branch_id)?;
        Some(self.branches.remove(pos))
    }

    /// Saga branches have no determinative role, so operators cannot steer them
    pub fn is_saga(&self) -> bool {
        self.branches.iter().any(|b| b.branch_type == BranchType::Saga)
    }

    pub fn branch_statuses(&self) -> impl Iterator<Item = &BranchStatus> {
        self.branches.iter().map(|b| &b.status)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session() -> GlobalSession {
        GlobalSession::new("127.0.0.1:8091:1", 1, "order-service", "placeOrder", 1_000)
    }

    #[test]
    fn test_new_session_defaults() {
        let s = session();
        assert_eq!(s.status, GlobalStatus::Begin);
        assert!(s.branches.is_empty());
        assert_eq!(s.gmt_modified, s.begin_time);
    }

    #[test]
    fn test_branch_inherits_descriptive_fields() {
        let s = session();
        let b = s.new_branch(7, BranchType::AT, "jdbc:mysql://db/orders");
        assert_eq!(b.xid, s.xid);
        assert_eq!(b.application_id, "order-service");
        assert_eq!(b.transaction_name, "placeOrder");
        assert_eq!(b.status, BranchStatus::Registered);
    }

    #[test]
    fn test_branch_ids_are_unique() {
        let mut s = session();
        let b = s.new_branch(7, BranchType::AT, "r1");
        assert!(s.add_branch(b.clone()));
        assert!(!s.add_branch(b));
        assert_eq!(s.branches.len(), 1);

        assert!(s.remove_branch(7).is_some());
        assert!(s.remove_branch(7).is_none());
    }

    #[test]
    fn test_saga_detection() {
        let mut s = session();
        let at = s.new_branch(1, BranchType::AT, "r1");
        s.add_branch(at);
        assert!(!s.is_saga());
        let saga = s.new_branch(2, BranchType::Saga, "r2");
        s.add_branch(saga);
        assert!(s.is_saga());
    }

    #[test]
    fn test_branch_type_from_name() {
        assert_eq!(BranchType::from_name("tcc"), Some(BranchType::TCC));
        assert_eq!(BranchType::from_name("SAGA"), Some(BranchType::Saga));
        assert_eq!(BranchType::from_name("2pc"), None);
    }
}
