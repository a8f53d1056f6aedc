//! Docker Engine implementation of [`RuntimeClient`].
//!
//! Control calls go through bollard. Attached exec start is done by hand: the
//! daemon hijacks the HTTP connection and then speaks the raw multiplexed
//! stdout/stderr framing, which the session demultiplexes itself.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use bollard::Docker;
use bollard::errors::Error as BollardError;
use bollard::exec::StartExecOptions;
use bollard::models::{ContainerCreateBody, ExecConfig, HostConfig, PortBinding};
use bollard::query_parameters::{CreateContainerOptions, ListContainersOptions};
use bytes::Bytes;
use futures::StreamExt;
use http_body_util::Full;
use hyper::{Method, Request, StatusCode, header};
use hyper_util::rt::TokioIo;
use tokio::net::UnixStream;
use tokio_util::io::ReaderStream;

use crate::sandbox::error::RuntimeError;
use crate::sandbox::runtime::{
    ExecAttachment, ExecHandle, ExecIo, ExecSpec, ExecStartOptions, HostBinding, InstanceInfo,
    InstanceRef, InstanceSpec, InstanceState, RuntimeClient, port_key,
};

pub struct DockerRuntime {
    docker: Docker,
    socket_path: PathBuf,
}

impl DockerRuntime {
    pub fn connect(socket_path: &Path) -> Result<Self, RuntimeError> {
        let docker = Docker::connect_with_socket(
            socket_path.to_string_lossy().as_ref(),
            120,
            bollard::API_DEFAULT_VERSION,
        )
        .map_err(map_bollard)?;
        Ok(Self {
            docker,
            socket_path: socket_path.to_path_buf(),
        })
    }

    pub async fn ping(&self) -> Result<(), RuntimeError> {
        self.docker.ping().await.map_err(map_bollard)?;
        Ok(())
    }

    /// POST /exec/{id}/start with an upgrade request and hand back both
    /// halves of the hijacked connection.
    async fn attach_exec(&self, exec_id: &str) -> Result<ExecIo, RuntimeError> {
        let stream = UnixStream::connect(&self.socket_path).await?;
        let (mut sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(stream))
            .await
            .map_err(transport)?;
        let conn_exec_id = exec_id.to_string();
        tokio::spawn(async move {
            if let Err(e) = conn.with_upgrades().await {
                tracing::debug!(exec_id = %conn_exec_id, error = %e, "exec attach connection ended");
            }
        });

        let body = serde_json::json!({ "Detach": false, "Tty": false }).to_string();
        let req = Request::builder()
            .method(Method::POST)
            .uri(format!("/exec/{exec_id}/start"))
            .header(header::HOST, "docker")
            .header(header::CONTENT_TYPE, "application/json")
            .header(header::CONNECTION, "Upgrade")
            .header(header::UPGRADE, "tcp")
            .body(Full::new(Bytes::from(body)))
            .map_err(|e| RuntimeError::Transport(e.to_string()))?;

        let resp = sender.send_request(req).await.map_err(transport)?;
        match resp.status() {
            StatusCode::SWITCHING_PROTOCOLS => {}
            StatusCode::NOT_FOUND => return Err(RuntimeError::NotFound(exec_id.to_string())),
            status => {
                return Err(RuntimeError::Api(format!(
                    "exec start returned {status} instead of an upgrade"
                )));
            }
        }

        let upgraded = hyper::upgrade::on(resp).await.map_err(transport)?;
        let (read, write) = tokio::io::split(TokioIo::new(upgraded));
        let output = ReaderStream::new(read)
            .map(|chunk| chunk.map_err(RuntimeError::from))
            .boxed();

        Ok(ExecIo {
            input: Box::pin(write),
            output,
        })
    }
}

#[async_trait]
impl RuntimeClient for DockerRuntime {
    async fn find_by_name(&self, name: &str) -> Result<Option<InstanceRef>, RuntimeError> {
        let mut filters = HashMap::new();
        filters.insert("name".to_string(), vec![name.to_string()]);
        let options = ListContainersOptions {
            all: true,
            filters: Some(filters),
            ..Default::default()
        };

        let containers = self
            .docker
            .list_containers(Some(options))
            .await
            .map_err(map_bollard)?;

        Ok(containers
            .into_iter()
            .find(|c| names_match(c.names.as_deref().unwrap_or_default(), name))
            .and_then(|c| c.id)
            .map(|id| InstanceRef {
                id,
                name: name.to_string(),
            }))
    }

    async fn inspect(&self, instance: &InstanceRef) -> Result<InstanceInfo, RuntimeError> {
        let resp = self
            .docker
            .inspect_container(&instance.id, None)
            .await
            .map_err(map_bollard)?;

        let status = resp
            .state
            .and_then(|s| s.status)
            .map(|s| format!("{s:?}").to_lowercase())
            .unwrap_or_default();
        let ports = resp
            .network_settings
            .and_then(|ns| ns.ports)
            .unwrap_or_default();

        Ok(InstanceInfo {
            state: state_from_status(&status),
            port_bindings: host_bindings(ports),
        })
    }

    async fn create(&self, spec: &InstanceSpec) -> Result<InstanceRef, RuntimeError> {
        let port = port_key(spec.exposed_port);
        let mut port_bindings = HashMap::new();
        port_bindings.insert(
            port.clone(),
            Some(vec![PortBinding {
                host_ip: None,
                host_port: Some(spec.host_port.to_string()),
            }]),
        );

        let host_config = HostConfig {
            binds: Some(vec![spec.bind.to_bind_string()]),
            port_bindings: Some(port_bindings),
            ..Default::default()
        };

        let body = ContainerCreateBody {
            image: Some(spec.image.clone()),
            cmd: Some(spec.command.clone()),
            user: Some(spec.user.clone()),
            working_dir: Some(spec.working_dir.clone()),
            env: Some(spec.env.clone()),
            attach_stdin: Some(true),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            open_stdin: Some(true),
            tty: Some(true),
            exposed_ports: Some(vec![port]),
            host_config: Some(host_config),
            ..Default::default()
        };

        let options = CreateContainerOptions {
            name: Some(spec.name.clone()),
            ..Default::default()
        };

        let resp = self
            .docker
            .create_container(Some(options), body)
            .await
            .map_err(map_bollard)?;

        for warning in &resp.warnings {
            tracing::warn!(instance = %spec.name, warning = %warning, "docker create warning");
        }

        Ok(InstanceRef {
            id: resp.id,
            name: spec.name.clone(),
        })
    }

    async fn start(&self, instance: &InstanceRef) -> Result<(), RuntimeError> {
        match self.docker.start_container(&instance.id, None).await {
            Ok(()) => Ok(()),
            // Already running.
            Err(BollardError::DockerResponseServerError {
                status_code: 304, ..
            }) => Ok(()),
            Err(e) => Err(map_bollard(e)),
        }
    }

    async fn exec_create(
        &self,
        instance: &InstanceRef,
        spec: &ExecSpec,
    ) -> Result<ExecHandle, RuntimeError> {
        let config = ExecConfig {
            cmd: Some(spec.command.clone()),
            user: Some(spec.user.clone()),
            working_dir: spec.working_dir.clone(),
            attach_stdin: Some(spec.attach_stdin),
            attach_stdout: Some(spec.attach_stdout),
            attach_stderr: Some(spec.attach_stderr),
            tty: Some(spec.tty),
            ..Default::default()
        };

        let exec = self
            .docker
            .create_exec(&instance.id, config)
            .await
            .map_err(map_bollard)?;

        Ok(ExecHandle {
            id: exec.id,
            instance: instance.name.clone(),
        })
    }

    async fn exec_start(
        &self,
        exec: &ExecHandle,
        opts: ExecStartOptions,
    ) -> Result<ExecAttachment, RuntimeError> {
        if opts.detach {
            self.docker
                .start_exec(
                    &exec.id,
                    Some(StartExecOptions {
                        detach: true,
                        ..Default::default()
                    }),
                )
                .await
                .map_err(map_bollard)?;
            return Ok(ExecAttachment::Detached);
        }

        self.attach_exec(&exec.id).await.map(ExecAttachment::Attached)
    }
}

// ── Helpers ─────────────────────────────────────────────────────────

/// Docker reports names with a leading slash and filters by substring.
fn names_match(names: &[String], name: &str) -> bool {
    names
        .iter()
        .any(|n| n.strip_prefix('/').unwrap_or(n) == name)
}

fn state_from_status(status: &str) -> InstanceState {
    match status {
        "running" => InstanceState::Running,
        "restarting" => InstanceState::Starting,
        "" => InstanceState::Absent,
        _ => InstanceState::Stopped,
    }
}

fn host_bindings(
    ports: HashMap<String, Option<Vec<PortBinding>>>,
) -> BTreeMap<String, Vec<HostBinding>> {
    ports
        .into_iter()
        .map(|(key, bindings)| {
            let bindings = bindings
                .unwrap_or_default()
                .into_iter()
                .map(|b| HostBinding {
                    host_ip: b.host_ip,
                    host_port: b.host_port,
                })
                .collect();
            (key, bindings)
        })
        .collect()
}

fn map_bollard(e: BollardError) -> RuntimeError {
    match e {
        BollardError::DockerResponseServerError {
            status_code: 404,
            message,
        } => RuntimeError::NotFound(message),
        BollardError::DockerResponseServerError {
            status_code,
            message,
        } => RuntimeError::Api(format!("{status_code}: {message}")),
        other => RuntimeError::Transport(other.to_string()),
    }
}

fn transport(e: hyper::Error) -> RuntimeError {
    RuntimeError::Transport(e.to_string())
}
