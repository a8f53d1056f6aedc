use axum::Json;
use axum::extract::{Path, State};
use hyper::StatusCode;
use serde_json::{Value, json};

use crate::api::AppState;
use crate::sandbox::session::SessionId;

/// GET /api/v1/sessions — live terminal sessions.
pub(crate) async fn list_sessions(State(state): State<AppState>) -> Json<Value> {
    let ids = state.sessions.list_ids().await;
    let sessions: Vec<Value> = state
        .sessions
        .snapshot()
        .await
        .iter()
        .map(|s| json!({ "id": s.id(), "projectId": s.project_id() }))
        .collect();
    Json(json!({
        "count": ids.len(),
        "ids": ids,
        "sessions": sessions,
    }))
}

/// GET /api/v1/sessions/{id}
pub(crate) async fn get_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    match state.sessions.get(&SessionId::from(id)).await {
        Some(s) => Ok(Json(json!({ "id": s.id(), "projectId": s.project_id() }))),
        None => Err((
            StatusCode::NOT_FOUND,
            Json(json!({ "error": "session not found" })),
        )),
    }
}

/// GET /api/v1/sandboxes — instance state and host port per known project.
pub(crate) async fn list_sandboxes(
    State(state): State<AppState>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    let projects = state.projects.list_projects().await.map_err(|e| {
        tracing::error!(error = %e, "failed to list projects");
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "error": "failed to list projects" })),
        )
    })?;
    let sandboxes = state.sandboxes.list_sandboxes(&projects).await;
    Ok(Json(json!({ "sandboxes": sandboxes })))
}

#[cfg(test)]
mod tests {
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use tokio::sync::mpsc;
    use tower::ServiceExt;

    use crate::api::{create_app, test_support};
    use crate::sandbox::testing::FakeRuntime;
    use crate::sandbox::{ClientTransport, TerminalSession};

    use super::*;

    async fn get(app: axum::Router, uri: &str) -> Value {
        let resp = app
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn sessions_endpoint_reflects_registry() {
        let tmp = tempfile::tempdir().unwrap();
        let state = test_support::state(tmp.path(), FakeRuntime::new());

        let body = get(create_app(state.clone()), "/api/v1/sessions").await;
        assert_eq!(body["count"], 0);

        let ready = state.sandboxes.ensure_ready("proj-A").await.unwrap();
        let (_in_tx, in_rx) = mpsc::channel(4);
        let (out_tx, _out_rx) = mpsc::channel(4);
        let session = TerminalSession::open(
            &state.session_ctx,
            ready.instance,
            "proj-A",
            ClientTransport {
                inbound: in_rx,
                outbound: out_tx,
            },
        )
        .await
        .unwrap();

        let body = get(create_app(state.clone()), "/api/v1/sessions").await;
        assert_eq!(body["count"], 1);
        assert_eq!(body["ids"][0], session.id().as_str());
        assert_eq!(body["sessions"][0]["projectId"], "proj-A");

        let uri = format!("/api/v1/sessions/{}", session.id());
        let body = get(create_app(state.clone()), &uri).await;
        assert_eq!(body["projectId"], "proj-A");

        let resp = create_app(state)
            .oneshot(
                Request::builder()
                    .uri("/api/v1/sessions/nope")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn sandboxes_endpoint_lists_projects() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::create_dir(tmp.path().join("proj-A")).unwrap();
        std::fs::create_dir(tmp.path().join("proj-B")).unwrap();
        let state = test_support::state(tmp.path(), FakeRuntime::new());
        state.sandboxes.ensure_ready("proj-A").await.unwrap();

        let body = get(create_app(state), "/api/v1/sandboxes").await;
        let list = body["sandboxes"].as_array().unwrap();
        assert_eq!(list.len(), 2);
        assert_eq!(list[0]["project_id"], "proj-A");
        assert_eq!(list[0]["state"], "running");
        assert_eq!(list[1]["state"], "absent");
        assert!(list[1]["host_port"].is_null());
    }
}
