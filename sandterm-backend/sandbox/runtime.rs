use std::collections::BTreeMap;
use std::pin::Pin;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use tokio::io::AsyncWrite;

use super::error::RuntimeError;

// ── Instance identity & state ───────────────────────────────────────

/// A runtime instance addressed by its daemon id and its name.
///
/// The name is the project id; it doubles as the idempotency key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceRef {
    pub id: String,
    pub name: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstanceState {
    Absent,
    Starting,
    Running,
    Stopped,
}

/// One host-side binding of an exposed instance port.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostBinding {
    pub host_ip: Option<String>,
    pub host_port: Option<String>,
}

/// Result of inspecting an instance.
#[derive(Debug, Clone)]
pub struct InstanceInfo {
    pub state: InstanceState,
    /// Keyed by `"<port>/<proto>"`, e.g. `"5173/tcp"`.
    pub port_bindings: BTreeMap<String, Vec<HostBinding>>,
}

impl InstanceInfo {
    /// First host port bound to `container_port`/tcp, if the runtime reports one.
    pub fn host_port(&self, container_port: u16) -> Option<u16> {
        self.port_bindings
            .get(&port_key(container_port))?
            .iter()
            .filter_map(|b| b.host_port.as_deref())
            .find_map(|p| p.parse::<u16>().ok().filter(|p| *p != 0))
    }
}

pub fn port_key(port: u16) -> String {
    format!("{port}/tcp")
}

// ── Creation spec ───────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BindMount {
    pub host_path: String,
    pub instance_path: String,
}

impl BindMount {
    pub fn to_bind_string(&self) -> String {
        format!("{}:{}", self.host_path, self.instance_path)
    }
}

/// Everything the runtime needs to create a project instance.
#[derive(Debug, Clone)]
pub struct InstanceSpec {
    pub name: String,
    pub image: String,
    pub command: Vec<String>,
    pub user: String,
    pub working_dir: String,
    pub env: Vec<String>,
    pub bind: BindMount,
    pub exposed_port: u16,
    /// Requested host port for `exposed_port`; `0` means "any free port".
    pub host_port: u16,
}

// ── Exec ────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct ExecSpec {
    pub command: Vec<String>,
    pub user: String,
    pub working_dir: Option<String>,
    pub attach_stdin: bool,
    pub attach_stdout: bool,
    pub attach_stderr: bool,
    /// Ask the runtime for a tty on the exec itself. A tty exec stream is
    /// raw (unframed), so interactive sessions leave this off.
    pub tty: bool,
}

/// Opaque handle to a created (not yet started) exec.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecHandle {
    pub id: String,
    pub instance: String,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ExecStartOptions {
    pub detach: bool,
}

pub type ExecInput = Pin<Box<dyn AsyncWrite + Send>>;
pub type ExecOutput = BoxStream<'static, Result<Bytes, RuntimeError>>;

/// Attached exec streams: raw input and the combined (framed) output.
pub struct ExecIo {
    pub input: ExecInput,
    pub output: ExecOutput,
}

pub enum ExecAttachment {
    Attached(ExecIo),
    Detached,
}

/// Capability surface over the host's container runtime.
///
/// Constructed once per process and injected wherever instances are touched,
/// so tests can substitute an in-memory runtime.
#[async_trait]
pub trait RuntimeClient: Send + Sync {
    /// Exact-name lookup across running and stopped instances.
    async fn find_by_name(&self, name: &str) -> Result<Option<InstanceRef>, RuntimeError>;

    async fn inspect(&self, instance: &InstanceRef) -> Result<InstanceInfo, RuntimeError>;

    async fn create(&self, spec: &InstanceSpec) -> Result<InstanceRef, RuntimeError>;

    /// Start an instance. Starting an already-running instance succeeds.
    async fn start(&self, instance: &InstanceRef) -> Result<(), RuntimeError>;

    async fn exec_create(
        &self,
        instance: &InstanceRef,
        spec: &ExecSpec,
    ) -> Result<ExecHandle, RuntimeError>;

    async fn exec_start(
        &self,
        exec: &ExecHandle,
        opts: ExecStartOptions,
    ) -> Result<ExecAttachment, RuntimeError>;
}
