//! Wire representations of sessions
//!
//! Status fields carry the numeric code the frontend filters on plus the
//! readable name.

use serde::Serialize;

use crate::row_lock::RowLock;
use crate::types::{BranchSession, GlobalSession};

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GlobalSessionView {
    pub xid: String,
    pub transaction_id: String,
    pub status: i32,
    pub status_name: String,
    pub application_id: String,
    pub transaction_service_group: String,
    pub transaction_name: String,
    pub timeout: u64,
    pub begin_time: u64,
    pub gmt_modified: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub suspended_from: Option<String>,
    #[serde(rename = "branchSessionVOs")]
    pub branch_sessions: Vec<BranchSessionView>,
}

impl From<GlobalSession> for GlobalSessionView {
    fn from(s: GlobalSession) -> Self {
        Self {
            xid: s.xid,
            // Ids exceed JavaScript's safe integer range, send them as strings
            transaction_id: s.transaction_id.to_string(),
            status: s.status.code(),
            status_name: s.status.to_string(),
            application_id: s.application_id,
            transaction_service_group: s.transaction_service_group,
            transaction_name: s.transaction_name,
            timeout: s.timeout_ms,
            begin_time: s.begin_time,
            gmt_modified: s.gmt_modified,
            suspended_from: s.suspended_from.map(|st| st.to_string()),
            branch_sessions: s.branches.into_iter().map(BranchSessionView::from).collect(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BranchSessionView {
    pub xid: String,
    pub branch_id: String,
    pub resource_id: String,
    pub branch_type: String,
    pub status: i32,
    pub status_name: String,
    pub application_id: String,
    pub transaction_name: String,
    pub lock_key: Option<String>,
    pub client_id: Option<String>,
    pub application_data: Option<String>,
    pub begin_time: u64,
    pub gmt_modified: u64,
}

impl From<BranchSession> for BranchSessionView {
    fn from(b: BranchSession) -> Self {
        Self {
            xid: b.xid,
            branch_id: b.branch_id.to_string(),
            resource_id: b.resource_id,
            branch_type: format!("{:?}", b.branch_type),
            status: b.status.code(),
            status_name: b.status.to_string(),
            application_id: b.application_id,
            transaction_name: b.transaction_name,
            lock_key: b.lock_key,
            client_id: b.client_id,
            application_data: b.application_data,
            begin_time: b.begin_time,
            gmt_modified: b.gmt_modified,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GlobalLockView {
    pub xid: String,
    pub transaction_id: String,
    pub branch_id: String,
    pub resource_id: String,
    pub table_name: String,
    pub pk: String,
    pub row_key: String,
    pub gmt_create: u64,
    pub gmt_modified: u64,
}

impl From<RowLock> for GlobalLockView {
    fn from(row: RowLock) -> Self {
        let row_key = row.row_key();
        Self {
            xid: row.xid,
            transaction_id: row.transaction_id.to_string(),
            branch_id: row.branch_id.to_string(),
            resource_id: row.resource_id,
            table_name: row.table_name,
            pk: row.pk,
            row_key,
            gmt_create: row.begin_time,
            gmt_modified: row.gmt_modified,
        }
    }
}
