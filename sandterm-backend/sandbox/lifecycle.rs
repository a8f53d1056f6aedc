//! Sandbox lifecycle: one runtime instance per project.
//!
//! The project id is the instance name, so existence is rediscovered by name
//! lookup on every call and survives process restarts. Lookup-or-create runs
//! under a per-project lock; different projects never contend.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::OwnedMutexGuard;

use crate::sandbox::error::{RuntimeError, SandboxError};
use crate::sandbox::runtime::{
    BindMount, ExecSpec, ExecStartOptions, InstanceRef, InstanceSpec, InstanceState,
    RuntimeClient,
};

// ── Settings ────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct SandboxSettings {
    pub image: String,
    pub user: String,
    /// Port the project's dev server listens on inside the instance.
    pub app_port: u16,
    /// Host directory holding one sub-directory per project.
    pub projects_base: PathBuf,
    /// Fixed in-instance mount point of the project directory.
    pub workdir: String,
    pub attempts: u32,
    pub retry_backoff: Duration,
}

/// A provisioned, running sandbox and the host port its app port is bound to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadySandbox {
    pub instance: InstanceRef,
    pub host_port: u16,
}

#[derive(Debug, Clone, Serialize)]
pub struct SandboxSummary {
    pub project_id: String,
    pub state: &'static str,
    pub host_port: Option<u16>,
}

// ── Per-project lock table ──────────────────────────────────────────

#[derive(Default)]
struct ProjectLocks {
    table: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl ProjectLocks {
    async fn acquire(&self, project_id: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut table = self.table.lock().unwrap_or_else(|e| e.into_inner());
            // Entries only the table references are neither held nor awaited.
            table.retain(|_, lock| Arc::strong_count(lock) > 1);
            table.entry(project_id.to_string()).or_default().clone()
        };
        lock.lock_owned().await
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.table.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

// ── Manager ─────────────────────────────────────────────────────────

#[derive(Clone)]
pub struct SandboxManager {
    runtime: Arc<dyn RuntimeClient>,
    settings: Arc<SandboxSettings>,
    locks: Arc<ProjectLocks>,
}

impl SandboxManager {
    pub fn new(runtime: Arc<dyn RuntimeClient>, settings: SandboxSettings) -> Self {
        Self {
            runtime,
            settings: Arc::new(settings),
            locks: Arc::new(ProjectLocks::default()),
        }
    }

    pub fn settings(&self) -> &SandboxSettings {
        &self.settings
    }

    pub fn runtime(&self) -> Arc<dyn RuntimeClient> {
        self.runtime.clone()
    }

    /// Make sure the project's instance exists and runs, and resolve its host port.
    ///
    /// Failures are logged and reported as `None`; callers decide how to
    /// tell the client.
    pub async fn ensure_ready(&self, project_id: &str) -> Option<ReadySandbox> {
        match self.try_ensure_ready(project_id).await {
            Ok(ready) => Some(ready),
            Err(e) => {
                tracing::error!(project_id = %project_id, error = %e, "sandbox not ready");
                None
            }
        }
    }

    pub async fn try_ensure_ready(&self, project_id: &str) -> Result<ReadySandbox, SandboxError> {
        let attempts = self.settings.attempts.max(1);
        let ready = {
            let _guard = self.locks.acquire(project_id).await;
            let mut attempt = 1;
            loop {
                match self.provision(project_id).await {
                    Ok(ready) => break ready,
                    Err(e) if attempt < attempts => {
                        tracing::warn!(
                            project_id = %project_id,
                            attempt,
                            error = %e,
                            "sandbox provisioning failed, retrying"
                        );
                        tokio::time::sleep(self.settings.retry_backoff * attempt).await;
                        attempt += 1;
                    }
                    Err(e) => return Err(e),
                }
            }
        };

        tracing::info!(
            project_id = %project_id,
            instance_id = %ready.instance.id,
            host_port = ready.host_port,
            "sandbox ready"
        );

        if let Err(e) = self.start_dev_server(&ready.instance).await {
            tracing::warn!(project_id = %project_id, error = %e, "dev server bootstrap failed");
        }

        Ok(ready)
    }

    /// One lookup-or-create, start, resolve-port pass. Caller holds the project lock.
    async fn provision(&self, project_id: &str) -> Result<ReadySandbox, SandboxError> {
        let existing = self
            .runtime
            .find_by_name(project_id)
            .await
            .map_err(unavailable("lookup"))?;

        let instance = match existing {
            Some(instance) => {
                let info = self
                    .runtime
                    .inspect(&instance)
                    .await
                    .map_err(unavailable("inspect"))?;
                if info.state != InstanceState::Running {
                    tracing::info!(
                        project_id = %project_id,
                        state = ?info.state,
                        "starting existing sandbox"
                    );
                    self.runtime
                        .start(&instance)
                        .await
                        .map_err(unavailable("start"))?;
                }
                instance
            }
            None => {
                tracing::info!(project_id = %project_id, image = %self.settings.image, "creating sandbox");
                let instance = self
                    .runtime
                    .create(&self.instance_spec(project_id))
                    .await
                    .map_err(unavailable("create"))?;
                self.runtime
                    .start(&instance)
                    .await
                    .map_err(unavailable("start"))?;
                instance
            }
        };

        // Host port is assigned at start; only inspection after start knows it.
        let info = self
            .runtime
            .inspect(&instance)
            .await
            .map_err(unavailable("inspect"))?;
        if info.state != InstanceState::Running {
            return Err(SandboxError::SandboxUnavailable(format!(
                "instance {} is {:?} after start",
                instance.name, info.state
            )));
        }
        let host_port = info
            .host_port(self.settings.app_port)
            .ok_or_else(|| SandboxError::PortUnresolved(project_id.to_string()))?;

        Ok(ReadySandbox {
            instance,
            host_port,
        })
    }

    /// Resolve the host port of an existing instance without creating or
    /// starting anything.
    pub async fn get_port(&self, project_id: &str) -> Option<u16> {
        let instance = match self.runtime.find_by_name(project_id).await {
            Ok(Some(instance)) => instance,
            Ok(None) => return None,
            Err(e) => {
                tracing::debug!(project_id = %project_id, error = %e, "port lookup failed");
                return None;
            }
        };
        match self.runtime.inspect(&instance).await {
            Ok(info) => info.host_port(self.settings.app_port),
            Err(e) => {
                tracing::debug!(project_id = %project_id, error = %e, "port lookup failed");
                None
            }
        }
    }

    /// State and host port of each named project's instance.
    pub async fn list_sandboxes(&self, project_ids: &[String]) -> Vec<SandboxSummary> {
        let mut out = Vec::with_capacity(project_ids.len());
        for project_id in project_ids {
            let (state, host_port) = match self.runtime.find_by_name(project_id).await {
                Ok(Some(instance)) => match self.runtime.inspect(&instance).await {
                    Ok(info) => (info.state, info.host_port(self.settings.app_port)),
                    Err(RuntimeError::NotFound(_)) => (InstanceState::Absent, None),
                    Err(e) => {
                        tracing::warn!(project_id = %project_id, error = %e, "inspect failed");
                        continue;
                    }
                },
                Ok(None) => (InstanceState::Absent, None),
                Err(e) => {
                    tracing::warn!(project_id = %project_id, error = %e, "lookup failed");
                    continue;
                }
            };
            out.push(SandboxSummary {
                project_id: project_id.clone(),
                state: state_label(state),
                host_port,
            });
        }
        out
    }

    fn instance_spec(&self, project_id: &str) -> InstanceSpec {
        let s = &self.settings;
        InstanceSpec {
            name: project_id.to_string(),
            image: s.image.clone(),
            command: vec!["/bin/bash".to_string()],
            user: s.user.clone(),
            working_dir: s.workdir.clone(),
            env: vec!["HOST=0.0.0.0".to_string()],
            bind: BindMount {
                host_path: s.projects_base.join(project_id).to_string_lossy().into_owned(),
                instance_path: s.workdir.clone(),
            },
            exposed_port: s.app_port,
            host_port: 0,
        }
    }

    /// Launch the dev server detached. A running dev server is left alone.
    async fn start_dev_server(&self, instance: &InstanceRef) -> Result<(), RuntimeError> {
        // Scaffolded apps live in a `sandbox` sub-directory of the project.
        let script = format!(
            "cd sandbox 2>/dev/null; \
             pgrep -f 'npm run dev' >/dev/null 2>&1 || npm run dev -- --host 0.0.0.0 --port {}",
            self.settings.app_port
        );
        let spec = ExecSpec {
            command: vec!["sh".to_string(), "-c".to_string(), script],
            user: self.settings.user.clone(),
            working_dir: Some(self.settings.workdir.clone()),
            attach_stdin: false,
            attach_stdout: false,
            attach_stderr: false,
            tty: false,
        };
        let exec = self.runtime.exec_create(instance, &spec).await?;
        self.runtime
            .exec_start(&exec, ExecStartOptions { detach: true })
            .await?;
        tracing::debug!(instance = %instance.name, exec_id = %exec.id, "dev server bootstrap issued");
        Ok(())
    }
}

fn unavailable(step: &'static str) -> impl Fn(RuntimeError) -> SandboxError {
    move |e| SandboxError::SandboxUnavailable(format!("{step}: {e}"))
}

pub fn state_label(state: InstanceState) -> &'static str {
    match state {
        InstanceState::Absent => "absent",
        InstanceState::Starting => "starting",
        InstanceState::Running => "running",
        InstanceState::Stopped => "stopped",
    }
}
