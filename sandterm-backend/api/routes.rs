use axum::extract::State;
use axum::http::HeaderValue;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use hyper::StatusCode;
use hyper::header;
use serde_json::json;
use tower_http::cors::{Any, CorsLayer};

use super::AppState;
use super::middleware;

pub fn build_router(state: AppState) -> Router {
    let cors = cors_layer(&state.config.cors_origin);

    Router::new()
        .route("/ping", get(ping))
        .route("/terminal", get(super::terminal::terminal_ws))
        .route("/editor", get(super::editor::editor_ws))
        .nest("/api", api_router())
        .fallback(not_found)
        .with_state(state)
        .layer(cors)
        .layer(axum::middleware::from_fn(middleware::strip_trailing_slash))
        .layer(axum::middleware::from_fn(
            middleware::enrich_current_span_middleware,
        ))
}

fn api_router() -> Router<AppState> {
    let v1 = Router::new()
        .merge(super::projects::router())
        .merge(super::sandbox::router());

    Router::new()
        .route("/ping", get(ping))
        .route("/health", get(health))
        // Unversioned project routes predate /v1.
        .merge(super::projects::router())
        .nest("/v1", v1)
}

fn cors_layer(origin: &str) -> CorsLayer {
    let layer = CorsLayer::new()
        .allow_methods(Any)
        .allow_headers(vec![header::CONTENT_TYPE, header::AUTHORIZATION]);

    if origin == "*" {
        return layer.allow_origin(Any);
    }
    match HeaderValue::from_str(origin) {
        Ok(value) => layer.allow_origin(value),
        Err(e) => {
            tracing::warn!(origin = %origin, error = %e, "invalid CORS_ORIGIN, allowing any");
            layer.allow_origin(Any)
        }
    }
}

async fn ping() -> impl IntoResponse {
    Json(json!({
        "message": "pong",
        "timestamp": chrono::Utc::now().to_rfc3339(),
    }))
}

async fn health(State(state): State<AppState>) -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "uptime_secs": state.started_at.elapsed().as_secs(),
        "sessions": state.sessions.count().await,
    }))
}

async fn not_found(req: axum::extract::Request) -> impl IntoResponse {
    tracing::warn!("unhandled path: {}", req.uri());
    (StatusCode::NOT_FOUND, "Not Found")
}

#[cfg(test)]
mod tests {
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    use super::*;
    use crate::api::test_support;
    use crate::sandbox::testing::FakeRuntime;

    async fn get_json(app: Router, uri: &str) -> (StatusCode, serde_json::Value) {
        let resp = app
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = resp.status();
        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        let value = serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null);
        (status, value)
    }

    #[tokio::test]
    async fn ping_answers_pong_on_every_alias() {
        let tmp = tempfile::tempdir().unwrap();
        let state = test_support::state(tmp.path(), FakeRuntime::new());

        for uri in ["/ping", "/api/ping"] {
            let (status, body) = get_json(build_router(state.clone()), uri).await;
            assert_eq!(status, StatusCode::OK);
            assert_eq!(body["message"], "pong");
            assert!(body["timestamp"].is_string());
        }
    }

    #[tokio::test]
    async fn health_reports_sessions() {
        let tmp = tempfile::tempdir().unwrap();
        let state = test_support::state(tmp.path(), FakeRuntime::new());

        let (status, body) = get_json(build_router(state), "/api/health").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
        assert_eq!(body["sessions"], 0);
    }

    #[tokio::test]
    async fn unknown_path_is_404() {
        let tmp = tempfile::tempdir().unwrap();
        let state = test_support::state(tmp.path(), FakeRuntime::new());

        let (status, _) = get_json(build_router(state), "/nope").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn trailing_slash_redirects() {
        let tmp = tempfile::tempdir().unwrap();
        let state = test_support::state(tmp.path(), FakeRuntime::new());

        let resp = build_router(state)
            .oneshot(
                Request::builder()
                    .uri("/api/v1/projects/?x=1")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::PERMANENT_REDIRECT);
        assert_eq!(resp.headers()[header::LOCATION], "/api/v1/projects?x=1");
    }

    #[tokio::test]
    async fn terminal_without_upgrade_is_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        let state = test_support::state(tmp.path(), FakeRuntime::new());

        let (status, _) = get_json(build_router(state), "/terminal?projectId=p1").await;
        assert!(status.is_client_error());
    }
}
