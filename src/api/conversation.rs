//! `POST /conversation`.
//!
//! The relay runs on its own task so it always finishes, and always writes
//! its usage line, even after the caller hangs up. The handler owns a
//! [`DropGuard`](tokio_util::sync::DropGuard) on the request's cancellation
//! token: if the connection closes first, axum drops the handler future, the
//! guard cancels the token, and the backend call inside the task stops.

use std::sync::Arc;

use anyhow::Context;
use axum::{
    extract::{rejection::JsonRejection, State},
    response::{IntoResponse, Response},
    Extension, Json,
};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use super::{auth::AuthError, request_id::RequestId};
use crate::{
    error::AppError,
    relay::{self, Caller, ConversationRequest, RelayState},
};

pub async fn conversation(
    State(state): State<Arc<RelayState>>,
    Extension(caller): Extension<Caller>,
    request_id: Option<Extension<RequestId>>,
    payload: Result<Json<Value>, JsonRejection>,
) -> Result<Response, AppError> {
    let request_id = request_id.map(|Extension(RequestId(id))| id);

    // A body that does not parse still gets the `{ts, error}` envelope.
    let body = match payload {
        Ok(Json(body)) => body,
        Err(rejection) => {
            let error = rejection.body_text();
            let reply = relay::reject(&state, &caller, Value::Null, error, request_id.as_deref()).await;
            return Ok(Json(reply).into_response());
        }
    };
    let ts = body.get("ts").cloned().unwrap_or(Value::Null);
    let request: ConversationRequest = match serde_json::from_value(body) {
        Ok(request) => request,
        Err(e) => {
            let error = format!("invalid conversation body: {e}");
            let reply = relay::reject(&state, &caller, ts, error, request_id.as_deref()).await;
            return Ok(Json(reply).into_response());
        }
    };

    // The header picked the allow-list group; the body may not pick another backend.
    if let Some(body_model) = request.model.as_deref().filter(|m| !m.is_empty()) {
        if body_model != caller.model.as_str() {
            return Ok(AuthError::ModelMismatch {
                header: caller.model,
                body: body_model.to_owned(),
            }
            .into_response());
        }
    }

    let cancel = CancellationToken::new();
    let guard = cancel.clone().drop_guard();

    let task = tokio::spawn(async move {
        relay::converse(&state, &caller, request, request_id.as_deref(), &cancel).await
    });
    let reply = task.await.context("relay task failed")?;
    guard.disarm();

    Ok(Json(reply).into_response())
}
