//! HTTP console
//!
//! | Method | Path                                          |
//! |--------|-----------------------------------------------|
//! | GET    | /console/globalSession/query                  |
//! | DELETE | /console/globalSession/deleteGlobalSession    |
//! | DELETE | /console/globalSession/forceDeleteGlobalSession |
//! | PUT    | /console/globalSession/stopGlobalSession      |
//! | PUT    | /console/globalSession/startGlobalSession     |
//! | PUT    | /console/globalSession/sendCommitOrRollback   |
//! | PUT    | /console/globalSession/changeGlobalStatus     |
//! | GET    | /console/branchSession/queryByXid             |
//! | DELETE | /console/branchSession/deleteBranchSession    |
//! | DELETE | /console/branchSession/forceDeleteBranchSession |
//! | PUT    | /console/branchSession/stopBranchSession      |
//! | PUT    | /console/branchSession/startBranchSession     |
//! | GET    | /console/globalLock/query                     |
//! | DELETE | /console/globalLock/delete                    |
//! | GET    | /console/globalLock/check                     |
//! | GET    | /health                                       |
//!
//! Every `/console` route is also served under `/api/v1/console`. Store work
//! is blocking and runs on the tokio blocking pool.

pub mod branch;
pub mod envelope;
pub mod global;
pub mod lock;
pub mod params;
pub mod view;

use std::sync::Arc;

use axum::routing::{delete, get, put};
use axum::Router;
use serde::Serialize;
use tower_http::cors::CorsLayer;

use crate::command::CommandProcessor;
use crate::error::{ConsoleError, Result};
use crate::query::QueryEngine;

use self::envelope::{ApiError, ApiResult, SingleResult};

/// Shared handler state
#[derive(Clone)]
pub struct ConsoleState {
    pub query: Arc<QueryEngine>,
    pub commands: Arc<CommandProcessor>,
}

impl ConsoleState {
    pub fn new(query: Arc<QueryEngine>, commands: Arc<CommandProcessor>) -> Self {
        Self { query, commands }
    }
}

pub fn router(state: ConsoleState) -> Router {
    let console = Router::new()
        .route("/globalSession/query", get(global::query))
        .route("/globalSession/deleteGlobalSession", delete(global::delete_global_session))
        .route(
            "/globalSession/forceDeleteGlobalSession",
            delete(global::force_delete_global_session),
        )
        .route("/globalSession/stopGlobalSession", put(global::stop_global_session))
        .route("/globalSession/startGlobalSession", put(global::start_global_session))
        .route("/globalSession/sendCommitOrRollback", put(global::send_commit_or_rollback))
        .route("/globalSession/changeGlobalStatus", put(global::change_global_status))
        .route("/branchSession/queryByXid", get(branch::query_by_xid))
        .route("/branchSession/deleteBranchSession", delete(branch::delete_branch_session))
        .route(
            "/branchSession/forceDeleteBranchSession",
            delete(branch::force_delete_branch_session),
        )
        .route("/branchSession/stopBranchSession", put(branch::stop_branch_session))
        .route("/branchSession/startBranchSession", put(branch::start_branch_session))
        .route("/globalLock/query", get(lock::query))
        .route("/globalLock/delete", delete(lock::delete))
        .route("/globalLock/check", get(lock::check));

    Router::new()
        .nest("/console", console.clone())
        .nest("/api/v1/console", console)
        .route("/health", get(health))
        .fallback(unknown_route)
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Run store work on the blocking pool
pub(crate) async fn blocking<T, F>(work: F) -> ApiResult<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(work)
        .await
        .map_err(|e| ConsoleError::Internal(format!("console task failed: {}", e)))?
        .map_err(ApiError)
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Health {
    pub status: &'static str,
    pub sessions: usize,
    pub last_lsn: u64,
    pub last_modified: u64,
}

async fn health(
    axum::extract::State(state): axum::extract::State<ConsoleState>,
) -> ApiResult<SingleResult<Health>> {
    let store = Arc::clone(state.commands.store());
    let health = blocking(move || {
        let modified = store.last_modified();
        Ok(Health {
            status: "UP",
            sessions: store.count()?,
            last_lsn: modified.lsn,
            last_modified: modified.timestamp,
        })
    })
    .await?;
    Ok(SingleResult::ok(health))
}

async fn unknown_route(uri: axum::http::Uri) -> ApiError {
    ApiError(ConsoleError::NotFound(format!("no console route for {}", uri.path())))
}
