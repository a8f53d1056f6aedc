use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::response::IntoResponse;
use serde::Deserialize;
use serde_json::{Value, json};
use tokio::sync::mpsc;

use crate::api::AppState;
use crate::sandbox::{CloseReason, SandboxManager};
use crate::watcher::{FileChange, ProjectWatcher};
use crate::workspace::{Workspace, WorkspaceError};

#[derive(Deserialize)]
pub(crate) struct EditorQuery {
    #[serde(rename = "projectId")]
    pub project_id: Option<String>,
}

/// One request from the editor client.
#[derive(Debug, Deserialize)]
#[serde(tag = "event", rename_all = "camelCase")]
enum EditorRequest {
    WriteFile {
        #[serde(alias = "pathToFileOrFolder")]
        path: String,
        #[serde(default)]
        data: String,
    },
    ReadFile {
        #[serde(alias = "pathToFileOrFolder")]
        path: String,
    },
    CreateFile {
        #[serde(alias = "pathToFileOrFolder")]
        path: String,
    },
    DeleteFile {
        #[serde(alias = "pathToFileOrFolder")]
        path: String,
    },
    CreateFolder {
        #[serde(alias = "pathToFileOrFolder")]
        path: String,
    },
    DeleteFolder {
        #[serde(alias = "pathToFileOrFolder")]
        path: String,
    },
    GetPort,
}

/// GET /editor?projectId=.. — file operations and change notifications for
/// one project.
pub(crate) async fn editor_ws(
    State(state): State<AppState>,
    Query(query): Query<EditorQuery>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_editor(socket, state, query.project_id))
}

async fn handle_editor(mut socket: WebSocket, state: AppState, project_id: Option<String>) {
    let Some(project_id) = project_id.filter(|id| !id.is_empty()) else {
        tracing::warn!("editor connection without projectId");
        reject(&mut socket, "Project ID required", CloseReason::MissingProjectId).await;
        return;
    };

    let workspace = match state.projects.workspace(&project_id) {
        Ok(ws) => ws,
        Err(e) => {
            tracing::warn!(project_id = %project_id, error = %e, "editor connection for unknown project");
            reject(&mut socket, &e.to_string(), CloseReason::MissingProjectId).await;
            return;
        }
    };

    let (change_tx, mut change_rx) = mpsc::unbounded_channel::<FileChange>();
    // Held for the lifetime of the connection.
    let _watcher = match ProjectWatcher::start(
        &workspace,
        state.config.watcher_settle,
        state.config.ignored_segments(),
        change_tx,
    ) {
        Ok(w) => Some(w),
        Err(e) => {
            tracing::error!(project_id = %project_id, error = %e, "failed to start project watcher");
            None
        }
    };

    tracing::info!(project_id = %project_id, "editor connected");

    loop {
        let outgoing = tokio::select! {
            _ = state.shutdown.cancelled() => {
                let _ = socket
                    .send(Message::Close(Some(CloseFrame {
                        code: CloseReason::ServerShutdown.code(),
                        reason: CloseReason::ServerShutdown.reason().into(),
                    })))
                    .await;
                break;
            }
            Some(change) = change_rx.recv() => change_event(&change),
            msg = socket.recv() => match msg {
                Some(Ok(Message::Text(text))) => {
                    handle_request(&workspace, &state.sandboxes, &project_id, text.as_str()).await
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => continue,
                Some(Err(e)) => {
                    tracing::debug!(project_id = %project_id, error = %e, "editor socket error");
                    break;
                }
            },
        };
        if socket
            .send(Message::Text(outgoing.to_string().into()))
            .await
            .is_err()
        {
            break;
        }
    }

    tracing::info!(project_id = %project_id, "editor disconnected");
}

async fn reject(socket: &mut WebSocket, message: &str, reason: CloseReason) {
    let _ = socket
        .send(Message::Text(error_event(message).to_string().into()))
        .await;
    let _ = socket
        .send(Message::Close(Some(CloseFrame {
            code: reason.code(),
            reason: reason.reason().into(),
        })))
        .await;
}

fn change_event(change: &FileChange) -> Value {
    json!({
        "event": "fileChange",
        "change": change.change,
        "path": change.path,
    })
}

fn error_event(message: &str) -> Value {
    json!({ "event": "error", "message": message })
}

/// Run one editor request and build its reply.
async fn handle_request(
    workspace: &Workspace,
    sandboxes: &SandboxManager,
    project_id: &str,
    raw: &str,
) -> Value {
    let request: EditorRequest = match serde_json::from_str(raw) {
        Ok(r) => r,
        Err(e) => {
            tracing::debug!(error = %e, "unparseable editor message");
            return error_event("invalid editor message");
        }
    };

    let result = match request {
        EditorRequest::WriteFile { path, data } => workspace
            .write_file(&path, &data)
            .await
            .map(|_| json!({ "event": "writeFileSuccess", "message": "File written successfully", "path": path })),
        EditorRequest::ReadFile { path } => workspace
            .read_file(&path)
            .await
            .map(|content| json!({ "event": "readFileSuccess", "content": content, "path": path })),
        EditorRequest::CreateFile { path } => workspace
            .create_file(&path)
            .await
            .map(|_| json!({ "event": "createFileSuccess", "message": "File created successfully", "path": path })),
        EditorRequest::DeleteFile { path } => workspace
            .delete_file(&path)
            .await
            .map(|_| json!({ "event": "deleteFileSuccess", "message": "File deleted successfully", "path": path })),
        EditorRequest::CreateFolder { path } => workspace
            .create_dir(&path)
            .await
            .map(|_| json!({ "event": "createFolderSuccess", "message": "Folder created successfully", "path": path })),
        EditorRequest::DeleteFolder { path } => workspace
            .delete_dir(&path)
            .await
            .map(|_| json!({ "event": "deleteFolderSuccess", "message": "Folder deleted successfully", "path": path })),
        EditorRequest::GetPort => {
            let port = sandboxes.get_port(project_id).await;
            Ok(json!({ "event": "getPortSuccess", "port": port, "containerName": project_id }))
        }
    };

    result.unwrap_or_else(|e| {
        match &e {
            WorkspaceError::Io(io) => {
                tracing::error!(project_id = %project_id, error = %io, "editor file operation failed");
            }
            other => tracing::debug!(project_id = %project_id, error = %other, "editor request rejected"),
        }
        error_event(&e.to_string())
    })
}
