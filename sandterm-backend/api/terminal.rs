use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::response::IntoResponse;
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::json;
use tokio::sync::mpsc;

use crate::api::AppState;
use crate::projects::validate_id;
use crate::sandbox::{ClientEvent, ClientTransport, CloseReason, ServerMessage, TerminalSession};

/// Buffered messages per direction between the socket and the session.
const CHANNEL_DEPTH: usize = 64;

#[derive(Deserialize)]
pub(crate) struct TerminalQuery {
    #[serde(rename = "projectId")]
    pub project_id: Option<String>,
}

/// GET /terminal?projectId=.. — WebSocket bridged to a shell in the
/// project's sandbox.
pub(crate) async fn terminal_ws(
    State(state): State<AppState>,
    Query(query): Query<TerminalQuery>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_terminal(socket, state, query.project_id))
}

async fn handle_terminal(socket: WebSocket, state: AppState, project_id: Option<String>) {
    let (ws_sink, ws_stream) = socket.split();
    let (inbound_tx, inbound_rx) = mpsc::channel(CHANNEL_DEPTH);
    let (outbound_tx, outbound_rx) = mpsc::channel(CHANNEL_DEPTH);
    let mut writer = tokio::spawn(forward_to_client(ws_sink, outbound_rx));

    serve_terminal(&state, project_id, inbound_rx, outbound_tx).await;

    // The writer finishing first means the session is over or was refused.
    let client_done = tokio::select! {
        _ = read_client(ws_stream, inbound_tx) => true,
        res = &mut writer => {
            if let Err(e) = res {
                tracing::debug!(error = %e, "terminal writer task failed");
            }
            false
        }
    };
    if client_done {
        // Ends once the session drops its sender.
        if let Err(e) = writer.await {
            tracing::debug!(error = %e, "terminal writer task failed");
        }
    }
}

/// Provision the project's sandbox and attach a session to the given
/// transport. Refusals are reported as a close message on `outbound`.
async fn serve_terminal(
    state: &AppState,
    project_id: Option<String>,
    inbound: mpsc::Receiver<ClientEvent>,
    outbound: mpsc::Sender<ServerMessage>,
) {
    let project_id = match project_id.filter(|id| validate_id(id).is_ok()) {
        Some(id) => id,
        None => {
            tracing::warn!("terminal connection without a usable projectId");
            let _ = outbound
                .send(ServerMessage::Close(CloseReason::MissingProjectId))
                .await;
            return;
        }
    };

    let ready = match state.sandboxes.ensure_ready(&project_id).await {
        Some(ready) => ready,
        None => {
            let _ = outbound
                .send(ServerMessage::Close(CloseReason::SandboxUnavailable))
                .await;
            return;
        }
    };

    let transport = ClientTransport {
        inbound,
        outbound: outbound.clone(),
    };
    if let Err(e) =
        TerminalSession::open(&state.session_ctx, ready.instance, &project_id, transport).await
    {
        tracing::error!(project_id = %project_id, error = %e, "failed to open terminal session");
        let _ = outbound
            .send(ServerMessage::Close(CloseReason::for_error(&e)))
            .await;
    }
}

/// Feed socket frames to the session until the client goes away.
async fn read_client(
    mut stream: futures::stream::SplitStream<WebSocket>,
    inbound: mpsc::Sender<ClientEvent>,
) {
    while let Some(msg) = stream.next().await {
        let event = match msg {
            Ok(msg) => match client_event(msg) {
                Some(event) => event,
                None => continue,
            },
            Err(e) => ClientEvent::Error(e.to_string()),
        };
        let done = !matches!(event, ClientEvent::Message(_));
        if inbound.send(event).await.is_err() || done {
            return;
        }
    }
    // Stream exhausted without a close frame still counts as a close.
    let _ = inbound.send(ClientEvent::Closed).await;
}

async fn forward_to_client(
    mut sink: futures::stream::SplitSink<WebSocket, Message>,
    mut outbound: mpsc::Receiver<ServerMessage>,
) {
    while let Some(msg) = outbound.recv().await {
        let closing = matches!(msg, ServerMessage::Close(_));
        if sink.send(server_message(msg)).await.is_err() || closing {
            break;
        }
    }
    let _ = sink.close().await;
}

fn close_message(reason: CloseReason) -> Message {
    Message::Close(Some(CloseFrame {
        code: reason.code(),
        reason: reason.reason().into(),
    }))
}

/// Socket frame for a session message.
fn server_message(msg: ServerMessage) -> Message {
    match msg {
        ServerMessage::Output(bytes) => Message::Binary(bytes),
        ServerMessage::Port(port) => {
            Message::Text(json!({ "type": "port", "port": port }).to_string().into())
        }
        ServerMessage::Close(reason) => close_message(reason),
    }
}

/// Session event for a socket frame. Pings and pongs are answered by axum.
fn client_event(msg: Message) -> Option<ClientEvent> {
    match msg {
        Message::Binary(bytes) => Some(ClientEvent::Message(bytes)),
        Message::Text(text) => Some(ClientEvent::Message(bytes::Bytes::copy_from_slice(
            text.as_str().as_bytes(),
        ))),
        Message::Close(_) => Some(ClientEvent::Closed),
        Message::Ping(_) | Message::Pong(_) => None,
    }
}
