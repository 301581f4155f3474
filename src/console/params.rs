//! Query-string parameters
//!
//! Every field arrives as an optional string and is parsed here, so malformed
//! input yields an in-band error envelope instead of an extractor rejection.
//! Blank values count as absent.

use serde::Deserialize;

use crate::command::CommitOrRollback;
use crate::error::{ConsoleError, Result};
use crate::query::{GlobalSessionFilter, PageRequest};
use crate::row_lock::{GlobalLockFilter, LockTarget};
use crate::state::GlobalStatus;
use crate::types::BranchId;

fn present(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|v| !v.is_empty())
}

fn require<'a>(value: &'a Option<String>, name: &str) -> Result<&'a str> {
    present(value).ok_or_else(|| ConsoleError::InvalidArgument(format!("{} is required", name)))
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GlobalSessionParam {
    pub xid: Option<String>,
    pub application_id: Option<String>,
    pub status: Option<String>,
    pub transaction_name: Option<String>,
    pub with_branch: Option<String>,
    pub page_num: Option<String>,
    pub page_size: Option<String>,
    pub time_start: Option<String>,
    pub time_end: Option<String>,
}

impl GlobalSessionParam {
    pub fn filter(&self) -> Result<GlobalSessionFilter> {
        let status = present(&self.status)
            .map(|s| {
                s.parse::<GlobalStatus>()
                    .map_err(|e| ConsoleError::InvalidQuery(e.to_string()))
            })
            .transpose()?;
        let with_branch = match present(&self.with_branch) {
            None => false,
            Some(v) => v.parse::<bool>().map_err(|_| {
                ConsoleError::InvalidQuery(format!("withBranch must be true or false, got '{}'", v))
            })?,
        };
        Ok(GlobalSessionFilter {
            xid: present(&self.xid).map(String::from),
            application_id: present(&self.application_id).map(String::from),
            status,
            transaction_name: present(&self.transaction_name).map(String::from),
            time_start: parse_time(&self.time_start, "timeStart")?,
            time_end: parse_time(&self.time_end, "timeEnd")?,
            with_branch,
        })
    }

    pub fn page(&self) -> Result<PageRequest> {
        page_request(&self.page_num, &self.page_size)
    }
}

fn page_request(page_num: &Option<String>, page_size: &Option<String>) -> Result<PageRequest> {
    let defaults = PageRequest::default();
    Ok(PageRequest {
        page_num: parse_page(page_num, "pageNum")?.unwrap_or(defaults.page_num),
        page_size: parse_page(page_size, "pageSize")?.unwrap_or(defaults.page_size),
    })
}

fn parse_time(value: &Option<String>, name: &str) -> Result<Option<u64>> {
    present(value)
        .map(|v| {
            v.parse::<u64>().map_err(|_| {
                ConsoleError::InvalidQuery(format!("{} must be epoch milliseconds, got '{}'", name, v))
            })
        })
        .transpose()
}

/// Negative and zero values parse here and are rejected by `PageRequest::validate`
fn parse_page(value: &Option<String>, name: &str) -> Result<Option<u32>> {
    present(value)
        .map(|v| match v.parse::<i64>() {
            Ok(n) if n < 0 => Ok(0),
            Ok(n) => Ok(u32::try_from(n).unwrap_or(u32::MAX)),
            Err(_) => Err(ConsoleError::InvalidPagination(format!(
                "{} must be an integer, got '{}'",
                name, v
            ))),
        })
        .transpose()
}

#[derive(Debug, Default, Deserialize)]
pub struct XidParam {
    pub xid: Option<String>,
}

impl XidParam {
    pub fn xid(&self) -> Result<String> {
        require(&self.xid, "xid").map(String::from)
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BranchParam {
    pub xid: Option<String>,
    pub branch_id: Option<String>,
}

impl BranchParam {
    pub fn xid(&self) -> Result<String> {
        require(&self.xid, "xid").map(String::from)
    }

    pub fn branch_id(&self) -> Result<BranchId> {
        parse_branch_id(require(&self.branch_id, "branchId")?)
    }
}

fn parse_branch_id(raw: &str) -> Result<BranchId> {
    raw.parse::<BranchId>().map_err(|_| {
        ConsoleError::InvalidArgument(format!("branchId must be a non-negative integer, got '{}'", raw))
    })
}

/// Row lock listing and release
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GlobalLockParam {
    pub xid: Option<String>,
    pub branch_id: Option<String>,
    pub resource_id: Option<String>,
    pub table_name: Option<String>,
    pub pk: Option<String>,
    pub page_num: Option<String>,
    pub page_size: Option<String>,
}

impl GlobalLockParam {
    pub fn filter(&self) -> Result<GlobalLockFilter> {
        let branch_id = present(&self.branch_id)
            .map(|raw| parse_branch_id(raw).map_err(|e| ConsoleError::InvalidQuery(e.to_string())))
            .transpose()?;
        Ok(GlobalLockFilter {
            xid: present(&self.xid).map(String::from),
            branch_id,
            resource_id: present(&self.resource_id).map(String::from),
            table_name: present(&self.table_name).map(String::from),
            pk: present(&self.pk).map(String::from),
        })
    }

    pub fn page(&self) -> Result<PageRequest> {
        page_request(&self.page_num, &self.page_size)
    }

    /// Releasing a lock needs the full row coordinates
    pub fn target(&self) -> Result<LockTarget> {
        Ok(LockTarget {
            xid: present(&self.xid).map(String::from),
            branch_id: present(&self.branch_id).map(parse_branch_id).transpose()?,
            resource_id: require(&self.resource_id, "resourceId")?.to_string(),
            table_name: require(&self.table_name, "tableName")?.to_string(),
            pk: require(&self.pk, "pk")?.to_string(),
        })
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct CommitOrRollbackParam {
    pub xid: Option<String>,
    pub action: Option<String>,
}

impl CommitOrRollbackParam {
    pub fn xid(&self) -> Result<String> {
        require(&self.xid, "xid").map(String::from)
    }

    pub fn action(&self) -> Result<Option<CommitOrRollback>> {
        present(&self.action).map(str::parse).transpose()
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct ChangeStatusParam {
    pub xid: Option<String>,
    pub status: Option<String>,
}

impl ChangeStatusParam {
    pub fn xid(&self) -> Result<String> {
        require(&self.xid, "xid").map(String::from)
    }

    /// Unknown status values never reach the store
    pub fn status(&self) -> Result<Option<GlobalStatus>> {
        present(&self.status).map(str::parse).transpose()
    }
}
