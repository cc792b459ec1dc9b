//! HTTP surface.
//!
//! | Route               | Handler                              |
//! |---------------------|--------------------------------------|
//! | `POST /conversation`| allow-list gate, then the relay      |
//! | `GET /ping`         | server time and caller IP            |
//! | `GET /healthz`      | liveness probe                       |
//! | anything else       | static front-end build               |

use std::{net::SocketAddr, path::Path, sync::Arc};

use axum::{
    extract::ConnectInfo,
    http::{Extensions, HeaderMap},
    middleware,
    routing::{get, post},
    Router,
};
use tower_http::{
    cors::{Any, CorsLayer},
    services::ServeDir,
    trace::{DefaultMakeSpan, DefaultOnResponse, TraceLayer},
};

use crate::relay::RelayState;

pub mod auth;
pub mod conversation;
pub mod health;
pub mod request_id;

/// Routes only, without the outer middleware stack.
pub fn router(state: Arc<RelayState>) -> Router {
    Router::new()
        .route("/conversation", post(conversation::conversation))
        .route_layer(middleware::from_fn_with_state(
            Arc::clone(&state),
            auth::allow_list_middleware,
        ))
        .route("/ping", get(health::ping))
        .route("/healthz", get(health::healthz))
        .with_state(state)
}

/// The full application: routes, static fallback, CORS, request IDs and tracing.
pub fn app(state: Arc<RelayState>, static_dir: &Path) -> Router {
    let trace_layer = TraceLayer::new_for_http()
        .make_span_with(DefaultMakeSpan::new().level(tracing::Level::INFO))
        .on_response(DefaultOnResponse::new().level(tracing::Level::INFO));
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    router(state)
        .fallback_service(ServeDir::new(static_dir))
        .layer(middleware::from_fn(request_id::request_id_middleware))
        .layer(trace_layer)
        .layer(cors)
}

/// Caller address: first `X-Forwarded-For` hop, else the TCP peer.
pub fn client_ip(headers: &HeaderMap, extensions: &Extensions) -> String {
    headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(str::trim)
        .filter(|ip| !ip.is_empty())
        .map(str::to_owned)
        .or_else(|| {
            extensions
                .get::<ConnectInfo<SocketAddr>>()
                .map(|ConnectInfo(addr)| addr.ip().to_string())
        })
        .unwrap_or_else(|| "unknown".to_owned())
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use axum::{
        body::{to_bytes, Body},
        http::{Request, StatusCode},
    };
    use tower::ServiceExt; // oneshot

    use super::*;
    use crate::config::Config;

    fn state() -> Arc<RelayState> {
        let config: Config = toml::from_str("").unwrap();
        Arc::new(RelayState::new(Arc::new(config), PathBuf::from("settings.toml")))
    }

    async fn body_text(body: Body) -> String {
        String::from_utf8(to_bytes(body, usize::MAX).await.unwrap().to_vec()).unwrap()
    }

    // -----------------------------------------------------------------------
    // Probes
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn healthz_returns_200_ok() {
        let resp = router(state())
            .oneshot(Request::get("/healthz").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(body_text(resp.into_body()).await, r#"{"status":"ok"}"#);
    }

    #[tokio::test]
    async fn ping_reports_forwarded_client_ip() {
        let resp = router(state())
            .oneshot(
                Request::get("/ping")
                    .header("x-forwarded-for", "203.0.113.9, 10.0.0.1")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let text = body_text(resp.into_body()).await;
        assert!(text.starts_with("server time: "), "got: {text}");
        assert!(text.ends_with("\n\n\nclient ip: 203.0.113.9"), "got: {text}");
    }

    #[test]
    fn client_ip_falls_back_to_peer_then_unknown() {
        let mut extensions = Extensions::new();
        assert_eq!(client_ip(&HeaderMap::new(), &extensions), "unknown");

        extensions.insert(ConnectInfo(SocketAddr::from(([192, 0, 2, 7], 50_000))));
        assert_eq!(client_ip(&HeaderMap::new(), &extensions), "192.0.2.7");
    }

    // -----------------------------------------------------------------------
    // Full app
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn unknown_paths_are_served_from_static_dir() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("index.html"), "<h1>chat</h1>").unwrap();

        let resp = app(state(), dir.path())
            .oneshot(Request::get("/index.html").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(body_text(resp.into_body()).await, "<h1>chat</h1>");

        let missing = app(state(), dir.path())
            .oneshot(Request::get("/nope.js").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(missing.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn responses_carry_request_id_and_cors_headers() {
        let dir = tempfile::tempdir().unwrap();
        let resp = app(state(), dir.path())
            .oneshot(
                Request::get("/healthz")
                    .header("origin", "https://chat.example.com")
                    .header(request_id::HEADER, "req-42")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.headers()[request_id::HEADER], "req-42");
        assert_eq!(resp.headers()["access-control-allow-origin"], "*");
    }

    #[tokio::test]
    async fn cors_preflight_is_answered() {
        let dir = tempfile::tempdir().unwrap();
        let resp = app(state(), dir.path())
            .oneshot(
                Request::builder()
                    .method("OPTIONS")
                    .uri("/conversation")
                    .header("origin", "https://chat.example.com")
                    .header("access-control-request-method", "POST")
                    .header("access-control-request-headers", "accept-code,user,model")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert!(resp.headers().contains_key("access-control-allow-methods"));
    }
}
