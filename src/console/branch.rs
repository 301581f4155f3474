//! Branch session endpoints

use std::sync::Arc;

use axum::extract::{Query, State};

use super::envelope::{ApiResult, SingleResult};
use super::params::{BranchParam, XidParam};
use super::view::BranchSessionView;
use super::{blocking, ConsoleState};

pub async fn query_by_xid(
    State(state): State<ConsoleState>,
    Query(param): Query<XidParam>,
) -> ApiResult<SingleResult<Vec<BranchSessionView>>> {
    let xid = param.xid()?;
    let engine = Arc::clone(&state.query);
    let branches = blocking(move || engine.query_branches(&xid)).await?;
    Ok(SingleResult::ok(branches.into_iter().map(BranchSessionView::from).collect()))
}

pub async fn delete_branch_session(
    State(state): State<ConsoleState>,
    Query(param): Query<BranchParam>,
) -> ApiResult<SingleResult<()>> {
    let (xid, branch_id) = (param.xid()?, param.branch_id()?);
    let commands = Arc::clone(&state.commands);
    blocking(move || commands.delete_branch(&xid, branch_id)).await?;
    Ok(SingleResult::empty())
}

pub async fn force_delete_branch_session(
    State(state): State<ConsoleState>,
    Query(param): Query<BranchParam>,
) -> ApiResult<SingleResult<()>> {
    let (xid, branch_id) = (param.xid()?, param.branch_id()?);
    let commands = Arc::clone(&state.commands);
    blocking(move || commands.force_delete_branch(&xid, branch_id)).await?;
    Ok(SingleResult::empty())
}

pub async fn stop_branch_session(
    State(state): State<ConsoleState>,
    Query(param): Query<BranchParam>,
) -> ApiResult<SingleResult<()>> {
    let (xid, branch_id) = (param.xid()?, param.branch_id()?);
    let commands = Arc::clone(&state.commands);
    blocking(move || commands.stop_branch(&xid, branch_id)).await?;
    Ok(SingleResult::empty())
}

pub async fn start_branch_session(
    State(state): State<ConsoleState>,
    Query(param): Query<BranchParam>,
) -> ApiResult<SingleResult<()>> {
    let (xid, branch_id) = (param.xid()?, param.branch_id()?);
    let commands = Arc::clone(&state.commands);
    blocking(move || commands.start_branch(&xid, branch_id)).await?;
    Ok(SingleResult::empty())
}
