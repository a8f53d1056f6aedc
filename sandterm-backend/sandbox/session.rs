//! Terminal session: one client transport bridged to one exec channel.
//!
//! The transport is a pair of channels so the bridge is independent of the
//! websocket layer. Output goes through the [`FrameDemuxer`]; input is written
//! verbatim except for the `getPort` query. Whichever side ends first tears
//! the session down, and teardown runs at most once.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use bytes::Bytes;
use futures::StreamExt;
use serde::Serialize;
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, mpsc};
use tokio_util::sync::CancellationToken;

use crate::sandbox::demux::FrameDemuxer;
use crate::sandbox::error::{ExecStage, SandboxError};
use crate::sandbox::registry::SessionRegistry;
use crate::sandbox::runtime::{
    ExecAttachment, ExecInput, ExecOutput, ExecSpec, ExecStartOptions, InstanceRef, RuntimeClient,
};

/// Client message intercepted as a port query instead of being forwarded.
pub const GET_PORT: &[u8] = b"getPort";

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct SessionId(String);

impl SessionId {
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for SessionId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ── Transport ───────────────────────────────────────────────────────

/// Something the client did.
#[derive(Debug)]
pub enum ClientEvent {
    Message(Bytes),
    Closed,
    Error(String),
}

/// Something to deliver to the client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerMessage {
    /// One demultiplexed output payload.
    Output(Bytes),
    /// Answer to a `getPort` query.
    Port(Option<u16>),
    Close(CloseReason),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    StreamEnded,
    ServerShutdown,
    MissingProjectId,
    SandboxUnavailable,
    ExecCreateFailed,
    ExecStartFailed,
    StreamError,
}

impl CloseReason {
    pub fn code(self) -> u16 {
        match self {
            CloseReason::StreamEnded => 1000,
            CloseReason::ServerShutdown => 1001,
            CloseReason::MissingProjectId => 1008,
            CloseReason::SandboxUnavailable => 1011,
            CloseReason::ExecCreateFailed => 4001,
            CloseReason::ExecStartFailed => 4002,
            CloseReason::StreamError => 4003,
        }
    }

    pub fn reason(self) -> &'static str {
        match self {
            CloseReason::StreamEnded => "session ended",
            CloseReason::ServerShutdown => "server shutting down",
            CloseReason::MissingProjectId => "projectId is required",
            CloseReason::SandboxUnavailable => "sandbox unavailable",
            CloseReason::ExecCreateFailed => "failed to create terminal",
            CloseReason::ExecStartFailed => "failed to start terminal",
            CloseReason::StreamError => "terminal stream error",
        }
    }

    pub fn for_error(err: &SandboxError) -> Self {
        match err {
            SandboxError::SandboxUnavailable(_) | SandboxError::PortUnresolved(_) => {
                CloseReason::SandboxUnavailable
            }
            SandboxError::ExecUnavailable {
                stage: ExecStage::Create,
                ..
            } => CloseReason::ExecCreateFailed,
            SandboxError::ExecUnavailable {
                stage: ExecStage::Start,
                ..
            } => CloseReason::ExecStartFailed,
            SandboxError::StreamFault(_) => CloseReason::StreamError,
            SandboxError::ProtocolViolation(_) => CloseReason::MissingProjectId,
        }
    }
}

/// The session's view of a client connection.
pub struct ClientTransport {
    pub inbound: mpsc::Receiver<ClientEvent>,
    pub outbound: mpsc::Sender<ServerMessage>,
}

/// Why a session is being torn down.
#[derive(Debug)]
pub enum TeardownCause {
    ClientClosed,
    ClientFailed(String),
    StreamEnded,
    StreamFailed(String),
    Shutdown,
}

impl TeardownCause {
    /// Close frame owed to the client. Client-side causes owe none.
    fn close_reason(&self) -> Option<CloseReason> {
        match self {
            TeardownCause::ClientClosed | TeardownCause::ClientFailed(_) => None,
            TeardownCause::StreamEnded => Some(CloseReason::StreamEnded),
            TeardownCause::StreamFailed(_) => Some(CloseReason::StreamError),
            TeardownCause::Shutdown => Some(CloseReason::ServerShutdown),
        }
    }
}

// ── Session ─────────────────────────────────────────────────────────

/// Shared dependencies for opening sessions.
#[derive(Clone)]
pub struct SessionContext {
    pub runtime: Arc<dyn RuntimeClient>,
    pub registry: SessionRegistry,
    pub shell: Vec<String>,
    pub user: String,
    pub workdir: String,
    pub app_port: u16,
}

impl SessionContext {
    fn exec_spec(&self) -> ExecSpec {
        ExecSpec {
            command: self.shell.clone(),
            user: self.user.clone(),
            working_dir: Some(self.workdir.clone()),
            attach_stdin: true,
            attach_stdout: true,
            attach_stderr: true,
            tty: false,
        }
    }
}

pub struct TerminalSession {
    id: SessionId,
    project_id: String,
    instance: InstanceRef,
    input: Mutex<Option<ExecInput>>,
    /// Taken at teardown so the client side sees its channel close.
    outbound: std::sync::Mutex<Option<mpsc::Sender<ServerMessage>>>,
    torn_down: AtomicBool,
    cancel: CancellationToken,
    runtime: Arc<dyn RuntimeClient>,
    registry: SessionRegistry,
    app_port: u16,
}

impl TerminalSession {
    /// Open an exec channel on `instance`, register the session and start
    /// both relay directions.
    pub async fn open(
        ctx: &SessionContext,
        instance: InstanceRef,
        project_id: &str,
        transport: ClientTransport,
    ) -> Result<Arc<TerminalSession>, SandboxError> {
        let exec = ctx
            .runtime
            .exec_create(&instance, &ctx.exec_spec())
            .await
            .map_err(|e| SandboxError::ExecUnavailable {
                stage: ExecStage::Create,
                message: e.to_string(),
            })?;

        let io = match ctx
            .runtime
            .exec_start(&exec, ExecStartOptions::default())
            .await
        {
            Ok(ExecAttachment::Attached(io)) => io,
            Ok(ExecAttachment::Detached) => {
                return Err(SandboxError::ExecUnavailable {
                    stage: ExecStage::Start,
                    message: "runtime returned no attached streams".into(),
                });
            }
            Err(e) => {
                return Err(SandboxError::ExecUnavailable {
                    stage: ExecStage::Start,
                    message: e.to_string(),
                });
            }
        };

        let session = Arc::new(TerminalSession {
            id: SessionId::generate(),
            project_id: project_id.to_string(),
            instance,
            input: Mutex::new(Some(io.input)),
            outbound: std::sync::Mutex::new(Some(transport.outbound)),
            torn_down: AtomicBool::new(false),
            cancel: CancellationToken::new(),
            runtime: ctx.runtime.clone(),
            registry: ctx.registry.clone(),
            app_port: ctx.app_port,
        });
        ctx.registry.add(session.clone()).await;

        tracing::info!(
            session_id = %session.id,
            project_id = %session.project_id,
            exec_id = %exec.id,
            "terminal session opened"
        );

        tokio::spawn(session.clone().pump_output(io.output));
        tokio::spawn(session.clone().pump_input(transport.inbound));

        Ok(session)
    }

    pub fn id(&self) -> &SessionId {
        &self.id
    }

    pub fn project_id(&self) -> &str {
        &self.project_id
    }

    pub fn is_closed(&self) -> bool {
        self.torn_down.load(Ordering::Acquire)
    }

    fn sender(&self) -> Option<mpsc::Sender<ServerMessage>> {
        self.outbound
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Deliver to the client unless the session is being torn down. A
    /// closed client drops the message.
    async fn deliver(&self, msg: ServerMessage) {
        let Some(tx) = self.sender() else {
            return;
        };
        tokio::select! {
            _ = self.cancel.cancelled() => {}
            _ = tx.send(msg) => {}
        }
    }

    /// Instance → client.
    async fn pump_output(self: Arc<Self>, mut output: ExecOutput) {
        let mut demux = FrameDemuxer::new();
        let cause = loop {
            let next = tokio::select! {
                _ = self.cancel.cancelled() => return,
                next = output.next() => next,
            };
            match next {
                Some(Ok(chunk)) => {
                    for frame in demux.push(&chunk) {
                        if frame.payload.is_empty() {
                            continue;
                        }
                        self.deliver(ServerMessage::Output(frame.payload)).await;
                    }
                }
                Some(Err(e)) => break TeardownCause::StreamFailed(e.to_string()),
                None => break TeardownCause::StreamEnded,
            }
        };
        if !demux.is_idle() {
            tracing::debug!(
                session_id = %self.id,
                pending = demux.pending_len(),
                "output ended mid-frame"
            );
        }
        self.teardown(cause).await;
    }

    /// Client → instance.
    async fn pump_input(self: Arc<Self>, mut inbound: mpsc::Receiver<ClientEvent>) {
        let cause = loop {
            let event = tokio::select! {
                _ = self.cancel.cancelled() => return,
                event = inbound.recv() => event,
            };
            match event {
                Some(ClientEvent::Message(data)) if data.as_ref() == GET_PORT => {
                    let port = self.lookup_port().await;
                    self.deliver(ServerMessage::Port(port)).await;
                }
                Some(ClientEvent::Message(data)) => {
                    let written = tokio::select! {
                        _ = self.cancel.cancelled() => return,
                        res = self.write_input(&data) => res,
                    };
                    if let Err(e) = written {
                        break TeardownCause::StreamFailed(e.to_string());
                    }
                }
                Some(ClientEvent::Error(e)) => break TeardownCause::ClientFailed(e),
                Some(ClientEvent::Closed) | None => break TeardownCause::ClientClosed,
            }
        };
        self.teardown(cause).await;
    }

    async fn write_input(&self, data: &[u8]) -> std::io::Result<()> {
        let mut input = self.input.lock().await;
        match input.as_mut() {
            Some(w) => {
                w.write_all(data).await?;
                w.flush().await
            }
            None => Ok(()),
        }
    }

    async fn lookup_port(&self) -> Option<u16> {
        match self.runtime.inspect(&self.instance).await {
            Ok(info) => info.host_port(self.app_port),
            Err(e) => {
                tracing::debug!(session_id = %self.id, error = %e, "port query failed");
                None
            }
        }
    }

    /// Release both ends and leave the registry. Returns `false` if another
    /// caller got here first.
    pub async fn teardown(&self, cause: TeardownCause) -> bool {
        if self.torn_down.swap(true, Ordering::AcqRel) {
            return false;
        }
        self.cancel.cancel();
        self.registry.remove(&self.id).await;

        if let Some(mut input) = self.input.lock().await.take() {
            if let Err(e) = input.shutdown().await {
                tracing::debug!(session_id = %self.id, error = %e, "exec input shutdown failed");
            }
        }
        let outbound = self
            .outbound
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let (Some(tx), Some(reason)) = (outbound, cause.close_reason()) {
            // Delivery to a client that is already gone is dropped.
            let _ = tx.send(ServerMessage::Close(reason)).await;
        }

        match &cause {
            TeardownCause::ClientFailed(e) | TeardownCause::StreamFailed(e) => {
                tracing::warn!(session_id = %self.id, project_id = %self.project_id, error = %e, "terminal session failed");
            }
            _ => {
                tracing::info!(session_id = %self.id, project_id = %self.project_id, cause = ?cause, "terminal session closed");
            }
        }
        true
    }
}

/// Tear down every registered session, e.g. on server shutdown.
pub async fn close_all(registry: &SessionRegistry) -> usize {
    let mut closed = 0;
    for session in registry.snapshot().await {
        if session.teardown(TeardownCause::Shutdown).await {
            closed += 1;
        }
    }
    closed
}
