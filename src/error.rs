//! Error type for axum handlers that can fail outside the relay envelope.
//!
//! Backend failures are reported in-band as `{ts, error}` with HTTP 200 (see
//! [`crate::relay`]). [`AppError`] covers the rest: a relay task that panicked
//! or was cancelled by the runtime ends up here as a 500.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;

/// Wraps [`anyhow::Error`] so it can be returned from axum handlers.
#[derive(Debug)]
pub struct AppError(anyhow::Error);

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        tracing::error!(error = %format!("{:#}", self.0), "handler error");
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "error": format!("{:#}", self.0) })),
        )
            .into_response()
    }
}

impl<E> From<E> for AppError
where
    E: Into<anyhow::Error>,
{
    fn from(e: E) -> Self {
        Self(e.into())
    }
}
