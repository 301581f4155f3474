//! Row locks held by branches
//!
//! A branch records the rows it has locked in `lock_key` as
//! `table:pk1,pk2;table2:pk`. The console lists those rows one per
//! `(table, pk)` pair and lets an operator release individual rows.

use crate::error::{ConsoleError, Result};
use crate::types::{BranchId, BranchSession, GlobalSession};

/// Split a lock key into `(table, pk)` pairs in declaration order.
/// Segments without a table or without primary keys are skipped.
pub fn parse_lock_key(lock_key: &str) -> Vec<(String, String)> {
    let mut rows = Vec::new();
    for segment in lock_key.split(';') {
        let Some((table, pks)) = segment.split_once(':') else {
            continue;
        };
        let table = table.trim();
        if table.is_empty() {
            continue;
        }
        for pk in pks.split(',').map(str::trim).filter(|pk| !pk.is_empty()) {
            rows.push((table.to_string(), pk.to_string()));
        }
    }
    rows
}

/// Inverse of [`parse_lock_key`]; `None` when no rows remain
pub fn format_lock_key(rows: &[(String, String)]) -> Option<String> {
    let mut tables: Vec<(&str, Vec<&str>)> = Vec::new();
    for (table, pk) in rows {
        match tables.iter_mut().find(|(t, _)| *t == table.as_str()) {
            Some((_, pks)) => pks.push(pk.as_str()),
            None => tables.push((table.as_str(), vec![pk.as_str()])),
        }
    }
    if tables.is_empty() {
        return None;
    }
    let segments: Vec<String> = tables
        .iter()
        .map(|(table, pks)| format!("{}:{}", table, pks.join(",")))
        .collect();
    Some(segments.join(";"))
}

/// One locked row
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RowLock {
    pub xid: String,
    pub transaction_id: u64,
    pub branch_id: BranchId,
    pub resource_id: String,
    pub table_name: String,
    pub pk: String,
    pub begin_time: u64,
    pub gmt_modified: u64,
}

impl RowLock {
    /// Globally unique key of the locked row
    pub fn row_key(&self) -> String {
        format!("{}^^^{}^^^{}", self.resource_id, self.table_name, self.pk)
    }
}

/// Every row locked by the branches of `session`
pub fn row_locks(session: &GlobalSession) -> Vec<RowLock> {
    session
        .branches
        .iter()
        .flat_map(|branch| {
            let rows = branch.lock_key.as_deref().map(parse_lock_key).unwrap_or_default();
            rows.into_iter().map(move |(table_name, pk)| RowLock {
                xid: session.xid.clone(),
                transaction_id: session.transaction_id,
                branch_id: branch.branch_id,
                resource_id: branch.resource_id.clone(),
                table_name,
                pk,
                begin_time: branch.begin_time,
                gmt_modified: branch.gmt_modified,
            })
        })
        .collect()
}

/// Exact-match filter over row locks, fields combined with AND
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GlobalLockFilter {
    pub xid: Option<String>,
    pub branch_id: Option<BranchId>,
    pub resource_id: Option<String>,
    pub table_name: Option<String>,
    pub pk: Option<String>,
}

impl GlobalLockFilter {
    pub fn matches(&self, row: &RowLock) -> bool {
        self.xid.as_ref().map_or(true, |xid| &row.xid == xid)
            && self.branch_id.map_or(true, |id| row.branch_id == id)
            && self.resource_id.as_ref().map_or(true, |r| &row.resource_id == r)
            && self.table_name.as_ref().map_or(true, |t| &row.table_name == t)
            && self.pk.as_ref().map_or(true, |pk| &row.pk == pk)
    }
}

/// Row to release. The xid and branch narrow the search when given.
#[derive(Debug, Clone, PartialEq)]
pub struct LockTarget {
    pub xid: Option<String>,
    pub branch_id: Option<BranchId>,
    pub resource_id: String,
    pub table_name: String,
    pub pk: String,
}

impl LockTarget {
    pub fn validate(&self) -> Result<()> {
        for (name, value) in [
            ("resourceId", &self.resource_id),
            ("tableName", &self.table_name),
            ("pk", &self.pk),
        ] {
            if value.trim().is_empty() {
                return Err(ConsoleError::InvalidArgument(format!("{} is required", name)));
            }
        }
        Ok(())
    }

    /// Whether any branch of `session` holds the row
    pub fn held_by(&self, session: &GlobalSession) -> bool {
        session.branches.iter().any(|b| self.held_by_branch(b))
    }

    fn held_by_branch(&self, branch: &BranchSession) -> bool {
        self.covers(branch)
            && branch
                .lock_key
                .as_deref()
                .map(parse_lock_key)
                .unwrap_or_default()
                .iter()
                .any(|(table, pk)| *table == self.table_name && *pk == self.pk)
    }

    fn covers(&self, branch: &BranchSession) -> bool {
        branch.resource_id == self.resource_id && self.branch_id.map_or(true, |id| branch.branch_id == id)
    }

    /// Drop the row from every matching branch of `session`; returns the
    /// number of branches that released it
    pub fn release(&self, session: &mut GlobalSession) -> usize {
        let mut released = 0;
        for branch in session.branches.iter_mut().filter(|b| self.covers(b)) {
            let Some(lock_key) = branch.lock_key.as_deref() else {
                continue;
            };
            let mut rows = parse_lock_key(lock_key);
            let before = rows.len();
            rows.retain(|(table, pk)| !(*table == self.table_name && *pk == self.pk));
            if rows.len() != before {
                branch.lock_key = format_lock_key(&rows);
                released += 1;
            }
        }
        released
    }
}
