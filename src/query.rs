//! Query Engine
//!
//! Filtered, paginated reads over a point-in-time snapshot of the session
//! store. All filter fields are optional and combined with AND:
//!
//! | field             | match                                   |
//! |-------------------|-----------------------------------------|
//! | `xid`             | exact                                   |
//! | `application_id`  | exact                                   |
//! | `status`          | exact                                   |
//! | `transaction_name`| case-sensitive substring                |
//! | `time_start/end`  | inclusive range over `begin_time`       |
//!
//! Rows are ordered by `begin_time` descending, then `xid` ascending, so a
//! stable store always produces the same pages. Row locks are listed the same
//! way, ordered by xid, branch, table and primary key.

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;

use crate::error::{ConsoleError, Result};
use crate::row_lock::{row_locks, GlobalLockFilter, RowLock};
use crate::state::GlobalStatus;
use crate::store::SessionStore;
use crate::types::{BranchId, BranchSession, GlobalSession};

pub const DEFAULT_MAX_PAGE_SIZE: u32 = 100;

/// Base backoff before the single read retry; jitter is added on top
const RETRY_BACKOFF_MS: u64 = 10;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct GlobalSessionFilter {
    pub xid: Option<String>,
    pub application_id: Option<String>,
    pub status: Option<GlobalStatus>,
    pub transaction_name: Option<String>,
    /// Inclusive lower bound on `begin_time` (epoch millis)
    pub time_start: Option<u64>,
    /// Inclusive upper bound on `begin_time` (epoch millis)
    pub time_end: Option<u64>,
    /// Attach branch rows to each result
    pub with_branch: bool,
}

impl GlobalSessionFilter {
    pub fn validate(&self) -> Result<()> {
        if let (Some(start), Some(end)) = (self.time_start, self.time_end) {
            if start > end {
                return Err(ConsoleError::InvalidQuery(format!(
                    "timeStart ({}) is after timeEnd ({})",
                    start, end
                )));
            }
        }
        Ok(())
    }

    pub fn matches(&self, session: &GlobalSession) -> bool {
        if let Some(xid) = &self.xid {
            if &session.xid != xid {
                return false;
            }
        }
        if let Some(app) = &self.application_id {
            if &session.application_id != app {
                return false;
            }
        }
        if let Some(status) = self.status {
            if session.status != status {
                return false;
            }
        }
        if let Some(name) = &self.transaction_name {
            if !session.transaction_name.contains(name.as_str()) {
                return false;
            }
        }
        if let Some(start) = self.time_start {
            if session.begin_time < start {
                return false;
            }
        }
        if let Some(end) = self.time_end {
            if session.begin_time > end {
                return false;
            }
        }
        true
    }
}

/// 1-indexed page request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageRequest {
    pub page_num: u32,
    pub page_size: u32,
}

impl PageRequest {
    pub fn new(page_num: u32, page_size: u32) -> Self {
        Self { page_num, page_size }
    }

    pub fn validate(&self, max_page_size: u32) -> Result<()> {
        if self.page_num < 1 {
            return Err(ConsoleError::InvalidPagination(format!(
                "pageNum must be at least 1, got {}",
                self.page_num
            )));
        }
        if self.page_size < 1 || self.page_size > max_page_size {
            return Err(ConsoleError::InvalidPagination(format!(
                "pageSize must be between 1 and {}, got {}",
                max_page_size, self.page_size
            )));
        }
        Ok(())
    }

    fn offset(&self) -> usize {
        (self.page_num as usize - 1) * self.page_size as usize
    }
}

impl Default for PageRequest {
    fn default() -> Self {
        Self { page_num: 1, page_size: 10 }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Page<T> {
    pub rows: Vec<T>,
    /// Matching rows across all pages
    pub total_count: usize,
    pub page_num: u32,
    pub page_size: u32,
}

impl<T> Page<T> {
    /// Number of pages needed for `total_count`
    pub fn pages(&self) -> usize {
        if self.page_size == 0 {
            return 0;
        }
        self.total_count.div_ceil(self.page_size as usize)
    }
}

pub struct QueryEngine {
    store: Arc<SessionStore>,
    max_page_size: u32,
}

impl QueryEngine {
    pub fn new(store: Arc<SessionStore>, max_page_size: u32) -> Self {
        Self { store, max_page_size }
    }

    pub fn max_page_size(&self) -> u32 {
        self.max_page_size
    }

    pub fn query_global_sessions(
        &self,
        filter: &GlobalSessionFilter,
        page: PageRequest,
    ) -> Result<Page<GlobalSession>> {
        filter.validate()?;
        page.validate(self.max_page_size)?;

        let snapshot = self.read_with_retry(|store| store.snapshot())?;

        let mut matched: Vec<&GlobalSession> = snapshot
            .iter()
            .map(|s| s.as_ref())
            .filter(|s| filter.matches(s))
            .collect();
        matched.sort_by(|a, b| {
            b.begin_time
                .cmp(&a.begin_time)
                .then_with(|| a.xid.cmp(&b.xid))
        });

        let total_count = matched.len();
        let rows = matched
            .into_iter()
            .skip(page.offset())
            .take(page.page_size as usize)
            .map(|s| {
                let mut row = s.clone();
                if !filter.with_branch {
                    row.branches.clear();
                }
                row
            })
            .collect();

        Ok(Page {
            rows,
            total_count,
            page_num: page.page_num,
            page_size: page.page_size,
        })
    }

    /// All branches of one global session, in registration order
    pub fn query_branches(&self, xid: &str) -> Result<Vec<BranchSession>> {
        let session = self.read_with_retry(|store| store.get_arc(xid))?;
        Ok(session.branches.clone())
    }

    /// Whether `branch_id` is a live branch of `xid` (and so may own its row locks)
    pub fn check_lock(&self, xid: &str, branch_id: BranchId) -> Result<bool> {
        match self.read_with_retry(|store| store.get_arc(xid)) {
            Ok(session) => Ok(session.branch(branch_id).is_some()),
            Err(ConsoleError::NotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Row locks held by live branches, ordered by xid, branch, table and pk
    pub fn query_locks(&self, filter: &GlobalLockFilter, page: PageRequest) -> Result<Page<RowLock>> {
        page.validate(self.max_page_size)?;

        let snapshot = self.read_with_retry(|store| store.snapshot())?;

        let mut matched: Vec<RowLock> = snapshot
            .iter()
            .filter(|s| filter.xid.as_ref().map_or(true, |xid| &s.xid == xid))
            .flat_map(|s| row_locks(s))
            .filter(|row| filter.matches(row))
            .collect();
        matched.sort_by(|a, b| {
            a.xid
                .cmp(&b.xid)
                .then_with(|| a.branch_id.cmp(&b.branch_id))
                .then_with(|| a.table_name.cmp(&b.table_name))
                .then_with(|| a.pk.cmp(&b.pk))
        });

        let total_count = matched.len();
        let rows = matched
            .into_iter()
            .skip(page.offset())
            .take(page.page_size as usize)
            .collect();

        Ok(Page {
            rows,
            total_count,
            page_num: page.page_num,
            page_size: page.page_size,
        })
    }

    /// Transient read failures get one retry after a jittered backoff
    fn read_with_retry<T, F>(&self, read: F) -> Result<T>
    where
        F: Fn(&SessionStore) -> Result<T>,
    {
        match read(&self.store) {
            Err(e) if e.kind().is_transient() => {
                let jitter = rand::thread_rng().gen_range(0..=RETRY_BACKOFF_MS);
                log::debug!("Retrying read after transient error: {}", e);
                std::thread::sleep(Duration::from_millis(RETRY_BACKOFF_MS + jitter));
                read(&self.store)
            }
            other => other,
        }
    }
}
