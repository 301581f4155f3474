//! Global session endpoints

use std::sync::Arc;

use axum::extract::{Query, State};

use super::envelope::{ApiResult, PageResult, SingleResult};
use super::params::{ChangeStatusParam, CommitOrRollbackParam, GlobalSessionParam, XidParam};
use super::view::GlobalSessionView;
use super::{blocking, ConsoleState};

pub async fn query(
    State(state): State<ConsoleState>,
    Query(param): Query<GlobalSessionParam>,
) -> ApiResult<PageResult<GlobalSessionView>> {
    let filter = param.filter()?;
    let page = param.page()?;
    let engine = Arc::clone(&state.query);
    let result = blocking(move || engine.query_global_sessions(&filter, page)).await?;
    Ok(PageResult::from_page(result, GlobalSessionView::from))
}

pub async fn delete_global_session(
    State(state): State<ConsoleState>,
    Query(param): Query<XidParam>,
) -> ApiResult<SingleResult<()>> {
    let xid = param.xid()?;
    let commands = Arc::clone(&state.commands);
    blocking(move || commands.delete_global(&xid)).await?;
    Ok(SingleResult::empty())
}

pub async fn force_delete_global_session(
    State(state): State<ConsoleState>,
    Query(param): Query<XidParam>,
) -> ApiResult<SingleResult<()>> {
    let xid = param.xid()?;
    let commands = Arc::clone(&state.commands);
    blocking(move || commands.force_delete_global(&xid)).await?;
    Ok(SingleResult::empty())
}

pub async fn stop_global_session(
    State(state): State<ConsoleState>,
    Query(param): Query<XidParam>,
) -> ApiResult<SingleResult<()>> {
    let xid = param.xid()?;
    let commands = Arc::clone(&state.commands);
    blocking(move || commands.stop_global(&xid)).await?;
    Ok(SingleResult::empty())
}

pub async fn start_global_session(
    State(state): State<ConsoleState>,
    Query(param): Query<XidParam>,
) -> ApiResult<SingleResult<()>> {
    let xid = param.xid()?;
    let commands = Arc::clone(&state.commands);
    blocking(move || commands.start_global(&xid)).await?;
    Ok(SingleResult::empty())
}

/// Replies with the status the session was moved to
pub async fn send_commit_or_rollback(
    State(state): State<ConsoleState>,
    Query(param): Query<CommitOrRollbackParam>,
) -> ApiResult<SingleResult<String>> {
    let xid = param.xid()?;
    let action = param.action()?;
    let commands = Arc::clone(&state.commands);
    let status = blocking(move || commands.send_commit_or_rollback(&xid, action)).await?;
    Ok(SingleResult::ok(status.to_string()))
}

pub async fn change_global_status(
    State(state): State<ConsoleState>,
    Query(param): Query<ChangeStatusParam>,
) -> ApiResult<SingleResult<String>> {
    let xid = param.xid()?;
    let status = param.status()?;
    let commands = Arc::clone(&state.commands);
    let status = blocking(move || commands.change_global_status(&xid, status)).await?;
    Ok(SingleResult::ok(status.to_string()))
}
