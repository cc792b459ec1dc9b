//! Allow-list gate for `POST /conversation`.
//!
//! The front-end sends three headers: `user`, `accept-code` (base64 of the
//! same user identifier) and `model`. The model selects an allow-list group
//! ([`ModelId::allow_group`]); the user must be listed in it. Every rejection
//! is a bare `401 Unauthorized` so callers cannot tell which check failed; the
//! reason goes to the log instead.
//!
//! On success a [`Caller`] extension is attached for the handler.

use std::sync::Arc;

use axum::{
    extract::{Request, State},
    http::{HeaderMap, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use chrono::Local;
use tracing::{info, warn};

use crate::{
    config::Config,
    model::{ModelId, UnknownModel},
    relay::{Caller, RelayState},
};

/// Why a request was turned away.
#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("missing `{0}` header")]
    MissingHeader(&'static str),
    #[error("accept-code is not base64-encoded UTF-8")]
    BadAcceptCode,
    #[error("accept-code does not match user")]
    IdentityMismatch,
    #[error(transparent)]
    UnknownModel(#[from] UnknownModel),
    #[error("user is not on the `{0}` allow-list")]
    NotAllowed(&'static str),
    #[error("body model `{body}` does not match header model `{header}`")]
    ModelMismatch { header: ModelId, body: String },
}

impl IntoResponse for AuthError {
    fn into_response(self) -> Response {
        warn!(reason = %self, "Unauthorized");
        (StatusCode::UNAUTHORIZED, "Unauthorized").into_response()
    }
}

fn header<'a>(headers: &'a HeaderMap, name: &'static str) -> Result<&'a str, AuthError> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
        .ok_or(AuthError::MissingHeader(name))
}

/// Check the identity headers against the allow-list.
pub fn authorize(headers: &HeaderMap, config: &Config, ip: String) -> Result<Caller, AuthError> {
    let accept_code = header(headers, "accept-code")?;
    let user = header(headers, "user")?;
    let model: ModelId = header(headers, "model")?.parse()?;

    let decoded = STANDARD
        .decode(accept_code)
        .ok()
        .and_then(|bytes| String::from_utf8(bytes).ok())
        .ok_or(AuthError::BadAcceptCode)?;
    if decoded != user {
        return Err(AuthError::IdentityMismatch);
    }
    if !config.is_allowed(user, model) {
        return Err(AuthError::NotAllowed(model.allow_group()));
    }

    Ok(Caller {
        user: user.to_owned(),
        model,
        ip,
    })
}

/// Axum middleware: rejects callers that fail [`authorize`] and injects a
/// [`Caller`] extension for the rest.
pub async fn allow_list_middleware(
    State(state): State<Arc<RelayState>>,
    mut req: Request,
    next: Next,
) -> Response {
    let ip = super::client_ip(req.headers(), req.extensions());

    match authorize(req.headers(), &state.config(), ip) {
        Ok(caller) => {
            info!(
                "{} - {} - {}",
                caller.user,
                caller.ip,
                Local::now().format("%Y-%m-%d %H:%M:%S")
            );
            req.extensions_mut().insert(caller);
            next.run(req).await
        }
        Err(e) => e.into_response(),
    }
}
