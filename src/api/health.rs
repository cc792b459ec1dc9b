//! Liveness and reachability probes.

use axum::{
    extract::Request,
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use chrono::Local;
use serde_json::json;

/// `GET /healthz`: always returns 200 OK with `{"status": "ok"}`.
///
/// No dependencies and never blocks; used by `chat-relay --healthcheck`.
pub async fn healthz() -> impl IntoResponse {
    (StatusCode::OK, Json(json!({ "status": "ok" })))
}

/// `GET /ping`: server clock and the address the relay sees for the caller.
pub async fn ping(req: Request) -> String {
    let ip = super::client_ip(req.headers(), req.extensions());
    format!(
        "server time: {}\n\n\nclient ip: {ip}",
        Local::now().format("%Y-%m-%d %H:%M:%S")
    )
}
