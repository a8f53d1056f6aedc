use axum::Json;
use axum::extract::{Path, State};
use hyper::StatusCode;
use serde_json::{Value, json};

use crate::api::AppState;
use crate::projects::ProjectError;

type ApiResult = Result<(StatusCode, Json<Value>), (StatusCode, Json<Value>)>;

fn error_response(e: ProjectError) -> (StatusCode, Json<Value>) {
    let status = match &e {
        ProjectError::InvalidId(_) => StatusCode::BAD_REQUEST,
        ProjectError::NotFound(_) => StatusCode::NOT_FOUND,
        ProjectError::LimitReached(_) => StatusCode::CONFLICT,
        ProjectError::Template(_) | ProjectError::Io(_) => {
            tracing::error!(error = %e, "project operation failed");
            StatusCode::INTERNAL_SERVER_ERROR
        }
    };
    let message = match &e {
        // Command output and host paths stay in the logs.
        ProjectError::Template(_) => "failed to create project".to_string(),
        ProjectError::Io(_) => "project storage error".to_string(),
        other => other.to_string(),
    };
    (status, Json(json!({ "error": message })))
}

/// POST /api/v1/projects — scaffold a new project.
pub(crate) async fn create_project(State(state): State<AppState>) -> ApiResult {
    let id = state.projects.create_project().await.map_err(error_response)?;
    tracing::info!(project_id = %id, "project created");
    Ok((
        StatusCode::CREATED,
        Json(json!({
            "message": "Project created successfully",
            "projectId": id,
        })),
    ))
}

/// GET /api/v1/projects
pub(crate) async fn list_projects(State(state): State<AppState>) -> ApiResult {
    let ids = state.projects.list_projects().await.map_err(error_response)?;
    Ok((StatusCode::OK, Json(json!({ "projects": ids }))))
}

/// GET /api/v1/projects/{id} — project info plus the sandbox's host port, if
/// it is running. Never provisions a sandbox.
pub(crate) async fn get_project(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult {
    let info = state.projects.get_project(&id).await.map_err(error_response)?;
    let host_port = state.sandboxes.get_port(&id).await;
    Ok((
        StatusCode::OK,
        Json(json!({
            "projectId": info.id,
            "path": info.path,
            "createdAt": info.created_at,
            "hostPort": host_port,
        })),
    ))
}

/// DELETE /api/v1/projects/{id} — removes the directory only; the sandbox
/// instance, if any, is left to the operator.
pub(crate) async fn delete_project(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult {
    state.projects.delete_project(&id).await.map_err(error_response)?;
    Ok((
        StatusCode::OK,
        Json(json!({ "message": "Project deleted", "projectId": id })),
    ))
}

/// GET /api/v1/projects/{id}/tree
pub(crate) async fn project_tree(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult {
    let tree = state.projects.project_tree(&id).await.map_err(error_response)?;
    let tree = serde_json::to_value(tree).map_err(|e| {
        tracing::error!(error = %e, "failed to serialize project tree");
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "error": "project storage error" })),
        )
    })?;
    Ok((StatusCode::OK, Json(tree)))
}
