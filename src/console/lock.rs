//! Global lock endpoints

use std::sync::Arc;

use axum::extract::{Query, State};

use super::envelope::{ApiResult, PageResult, SingleResult};
use super::params::{BranchParam, GlobalLockParam};
use super::view::GlobalLockView;
use super::{blocking, ConsoleState};

pub async fn query(
    State(state): State<ConsoleState>,
    Query(param): Query<GlobalLockParam>,
) -> ApiResult<PageResult<GlobalLockView>> {
    let filter = param.filter()?;
    let page = param.page()?;
    let engine = Arc::clone(&state.query);
    let result = blocking(move || engine.query_locks(&filter, page)).await?;
    Ok(PageResult::from_page(result, GlobalLockView::from))
}

/// Release one row lock; `tableName`, `pk` and `resourceId` are required
pub async fn delete(
    State(state): State<ConsoleState>,
    Query(param): Query<GlobalLockParam>,
) -> ApiResult<SingleResult<()>> {
    let target = param.target()?;
    let commands = Arc::clone(&state.commands);
    blocking(move || commands.delete_lock(&target)).await?;
    Ok(SingleResult::empty())
}

/// `data: true` iff the xid exists and owns the branch
pub async fn check(
    State(state): State<ConsoleState>,
    Query(param): Query<BranchParam>,
) -> ApiResult<SingleResult<bool>> {
    let (xid, branch_id) = (param.xid()?, param.branch_id()?);
    let engine = Arc::clone(&state.query);
    let owned = blocking(move || engine.check_lock(&xid, branch_id)).await?;
    Ok(SingleResult::ok(owned))
}
