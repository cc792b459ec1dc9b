//! Request ID middleware.
//!
//! Every inbound request is assigned an `X-Request-ID`, taken from the caller
//! when present and generated (UUID v4) otherwise. The ID is stored as an axum
//! [`Extension`](axum::Extension), echoed on the response, recorded in the
//! usage log and carried by a [`tracing`] span around the handler.

use axum::{extract::Request, http::HeaderValue, middleware::Next, response::Response};
use tracing::Instrument as _;
use uuid::Uuid;

pub const HEADER: &str = "x-request-id";

/// The ID assigned to the current request.
#[derive(Clone, Debug)]
pub struct RequestId(pub String);

/// Apply **inside** `TraceLayer` so the span nests under the HTTP span.
pub async fn request_id_middleware(mut req: Request, next: Next) -> Response {
    let id = req
        .headers()
        .get(HEADER)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
        .map(String::from)
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    req.extensions_mut().insert(RequestId(id.clone()));

    let span = tracing::debug_span!("request_id", id = %id);
    let mut response = next.run(req).instrument(span).await;

    if let Ok(value) = HeaderValue::from_str(&id) {
        response.headers_mut().insert(HEADER, value);
    }
    response
}
