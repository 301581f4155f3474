//! JSON response envelope
//!
//! Success or failure always travels in-band:
//! ```json
//! { "success": false, "code": "StillActive", "message": "...", "data": null }
//! ```
//! Paged responses add `totalCount`, `pageNum`, `pageSize` and `pages`.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;

use crate::error::ConsoleError;
use crate::query::Page;

pub const SUCCESS_CODE: &str = "OK";
const SUCCESS_MESSAGE: &str = "success";

#[derive(Debug, Serialize)]
pub struct SingleResult<T> {
    pub success: bool,
    pub code: String,
    pub message: String,
    pub data: Option<T>,
}

impl<T: Serialize> SingleResult<T> {
    pub fn ok(data: T) -> Self {
        Self {
            success: true,
            code: SUCCESS_CODE.to_string(),
            message: SUCCESS_MESSAGE.to_string(),
            data: Some(data),
        }
    }
}

impl SingleResult<()> {
    pub fn empty() -> Self {
        Self {
            success: true,
            code: SUCCESS_CODE.to_string(),
            message: SUCCESS_MESSAGE.to_string(),
            data: None,
        }
    }
}

impl<T: Serialize> IntoResponse for SingleResult<T> {
    fn into_response(self) -> Response {
        Json(self).into_response()
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PageResult<T> {
    pub success: bool,
    pub code: String,
    pub message: String,
    pub data: Vec<T>,
    pub total_count: usize,
    pub page_num: u32,
    pub page_size: u32,
    pub pages: usize,
}

impl<T: Serialize> PageResult<T> {
    pub fn from_page<S>(page: Page<S>, view: impl Fn(S) -> T) -> Self {
        let pages = page.pages();
        Self {
            success: true,
            code: SUCCESS_CODE.to_string(),
            message: SUCCESS_MESSAGE.to_string(),
            data: page.rows.into_iter().map(view).collect(),
            total_count: page.total_count,
            page_num: page.page_num,
            page_size: page.page_size,
            pages,
        }
    }
}

impl<T: Serialize> IntoResponse for PageResult<T> {
    fn into_response(self) -> Response {
        Json(self).into_response()
    }
}

/// Handler error rendered as a failure envelope
#[derive(Debug)]
pub struct ApiError(pub ConsoleError);

impl From<ConsoleError> for ApiError {
    fn from(e: ConsoleError) -> Self {
        ApiError(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let kind = self.0.kind();
        if kind.http_status() >= 500 {
            log::error!("console error: {}", self.0);
        } else {
            log::debug!("console request rejected ({}): {}", kind, self.0);
        }
        let status = StatusCode::from_u16(kind.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let body = SingleResult::<()> {
            success: false,
            code: kind.code().to_string(),
            message: self.0.to_string(),
            data: None,
        };
        (status, Json(body)).into_response()
    }
}

pub type ApiResult<T> = std::result::Result<T, ApiError>;
