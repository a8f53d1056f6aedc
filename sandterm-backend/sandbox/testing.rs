//! In-memory [`RuntimeClient`] used by lifecycle and session tests.

use std::collections::HashMap;
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU16, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use tokio::io::AsyncWrite;
use tokio::sync::mpsc;

use super::error::RuntimeError;
use super::runtime::{
    ExecAttachment, ExecHandle, ExecIo, ExecSpec, ExecStartOptions, HostBinding, InstanceInfo,
    InstanceRef, InstanceSpec, InstanceState, RuntimeClient, port_key,
};

struct FakeInstance {
    id: String,
    state: InstanceState,
    exposed_port: u16,
    host_port: Option<u16>,
}

/// One attached exec: what the session wrote into it and a handle to push
/// output back out.
#[derive(Clone)]
pub struct FakeExec {
    pub id: String,
    pub instance: String,
    pub spec: ExecSpec,
    pub detached: bool,
    pub input: Arc<Mutex<Vec<u8>>>,
    pub shutdowns: Arc<AtomicUsize>,
    output: Arc<Mutex<Option<mpsc::UnboundedSender<Result<Bytes, RuntimeError>>>>>,
}

impl FakeExec {
    pub fn push_output(&self, chunk: impl Into<Bytes>) {
        if let Some(tx) = self.output.lock().unwrap().as_ref() {
            let _ = tx.send(Ok(chunk.into()));
        }
    }

    pub fn fail_output(&self, message: &str) {
        if let Some(tx) = self.output.lock().unwrap().take() {
            let _ = tx.send(Err(RuntimeError::Transport(message.to_string())));
        }
    }

    pub fn end_output(&self) {
        self.output.lock().unwrap().take();
    }

    pub fn written(&self) -> Vec<u8> {
        self.input.lock().unwrap().clone()
    }
}

struct RecordingInput {
    buf: Arc<Mutex<Vec<u8>>>,
    shutdowns: Arc<AtomicUsize>,
}

impl AsyncWrite for RecordingInput {
    fn poll_write(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        data: &[u8],
    ) -> Poll<io::Result<usize>> {
        self.buf.lock().unwrap().extend_from_slice(data);
        Poll::Ready(Ok(data.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.shutdowns.fetch_add(1, Ordering::SeqCst);
        Poll::Ready(Ok(()))
    }
}

#[derive(Default)]
pub struct FakeRuntime {
    instances: Mutex<HashMap<String, FakeInstance>>,
    execs: Mutex<Vec<FakeExec>>,
    next_port: AtomicU16,
    pub creates: AtomicUsize,
    pub starts: AtomicUsize,
    pub inspects: AtomicUsize,
    pub exec_creates: AtomicUsize,
    pub fail_create: AtomicBool,
    pub fail_exec_create: AtomicBool,
    pub fail_exec_start: AtomicBool,
    /// Fail only detached exec starts (the dev-server bootstrap).
    pub fail_detached_exec: AtomicBool,
}

impl FakeRuntime {
    pub fn new() -> Arc<Self> {
        let fake = Self::default();
        fake.next_port.store(49152, Ordering::SeqCst);
        Arc::new(fake)
    }

    /// Seed an existing instance, as if left over from an earlier process.
    pub fn insert_instance(&self, name: &str, state: InstanceState, exposed_port: u16) {
        let host_port = (state == InstanceState::Running).then(|| self.allocate_port());
        self.instances.lock().unwrap().insert(
            name.to_string(),
            FakeInstance {
                id: format!("id-{name}"),
                state,
                exposed_port,
                host_port,
            },
        );
    }

    /// Stop an instance; its host port binding goes away like Docker's does.
    pub fn stop_instance(&self, name: &str) {
        if let Some(inst) = self.instances.lock().unwrap().get_mut(name) {
            inst.state = InstanceState::Stopped;
            inst.host_port = None;
        }
    }

    pub fn state_of(&self, name: &str) -> Option<InstanceState> {
        self.instances.lock().unwrap().get(name).map(|i| i.state)
    }

    pub fn instance_count(&self) -> usize {
        self.instances.lock().unwrap().len()
    }

    /// Most recent attached exec opened on `instance`.
    pub fn last_exec(&self, instance: &str) -> Option<FakeExec> {
        self.execs
            .lock()
            .unwrap()
            .iter()
            .rev()
            .find(|e| e.instance == instance && !e.detached)
            .cloned()
    }

    pub fn detached_execs(&self) -> Vec<FakeExec> {
        self.execs
            .lock()
            .unwrap()
            .iter()
            .filter(|e| e.detached)
            .cloned()
            .collect()
    }

    fn allocate_port(&self) -> u16 {
        self.next_port.fetch_add(1, Ordering::SeqCst)
    }
}

#[async_trait]
impl RuntimeClient for FakeRuntime {
    async fn find_by_name(&self, name: &str) -> Result<Option<InstanceRef>, RuntimeError> {
        Ok(self
            .instances
            .lock()
            .unwrap()
            .get(name)
            .map(|i| InstanceRef {
                id: i.id.clone(),
                name: name.to_string(),
            }))
    }

    async fn inspect(&self, instance: &InstanceRef) -> Result<InstanceInfo, RuntimeError> {
        self.inspects.fetch_add(1, Ordering::SeqCst);
        let instances = self.instances.lock().unwrap();
        let inst = instances
            .get(&instance.name)
            .ok_or_else(|| RuntimeError::NotFound(instance.name.clone()))?;
        let mut port_bindings = std::collections::BTreeMap::new();
        if let Some(port) = inst.host_port {
            port_bindings.insert(
                port_key(inst.exposed_port),
                vec![HostBinding {
                    host_ip: Some("0.0.0.0".into()),
                    host_port: Some(port.to_string()),
                }],
            );
        }
        Ok(InstanceInfo {
            state: inst.state,
            port_bindings,
        })
    }

    async fn create(&self, spec: &InstanceSpec) -> Result<InstanceRef, RuntimeError> {
        self.creates.fetch_add(1, Ordering::SeqCst);
        // Give concurrent callers a chance to interleave inside the critical section.
        tokio::task::yield_now().await;
        if self.fail_create.load(Ordering::SeqCst) {
            return Err(RuntimeError::Api("create refused".into()));
        }
        let mut instances = self.instances.lock().unwrap();
        if instances.contains_key(&spec.name) {
            return Err(RuntimeError::Api(format!("name {} already in use", spec.name)));
        }
        let id = format!("id-{}", spec.name);
        instances.insert(
            spec.name.clone(),
            FakeInstance {
                id: id.clone(),
                state: InstanceState::Stopped,
                exposed_port: spec.exposed_port,
                host_port: None,
            },
        );
        Ok(InstanceRef {
            id,
            name: spec.name.clone(),
        })
    }

    async fn start(&self, instance: &InstanceRef) -> Result<(), RuntimeError> {
        self.starts.fetch_add(1, Ordering::SeqCst);
        let port = self.allocate_port();
        let mut instances = self.instances.lock().unwrap();
        let inst = instances
            .get_mut(&instance.name)
            .ok_or_else(|| RuntimeError::NotFound(instance.name.clone()))?;
        if inst.state != InstanceState::Running {
            inst.state = InstanceState::Running;
            inst.host_port = Some(port);
        }
        Ok(())
    }

    async fn exec_create(
        &self,
        instance: &InstanceRef,
        spec: &ExecSpec,
    ) -> Result<ExecHandle, RuntimeError> {
        let n = self.exec_creates.fetch_add(1, Ordering::SeqCst);
        if self.fail_exec_create.load(Ordering::SeqCst) {
            return Err(RuntimeError::Api("exec create refused".into()));
        }
        let id = format!("exec-{n}");
        self.execs.lock().unwrap().push(FakeExec {
            id: id.clone(),
            instance: instance.name.clone(),
            spec: spec.clone(),
            detached: false,
            input: Arc::default(),
            shutdowns: Arc::default(),
            output: Arc::default(),
        });
        Ok(ExecHandle {
            id,
            instance: instance.name.clone(),
        })
    }

    async fn exec_start(
        &self,
        exec: &ExecHandle,
        opts: ExecStartOptions,
    ) -> Result<ExecAttachment, RuntimeError> {
        if opts.detach {
            if self.fail_detached_exec.load(Ordering::SeqCst) {
                return Err(RuntimeError::Api("detached exec refused".into()));
            }
        } else if self.fail_exec_start.load(Ordering::SeqCst) {
            return Err(RuntimeError::Transport("upgrade refused".into()));
        }

        let mut execs = self.execs.lock().unwrap();
        let entry = execs
            .iter_mut()
            .find(|e| e.id == exec.id)
            .ok_or_else(|| RuntimeError::NotFound(exec.id.clone()))?;

        if opts.detach {
            entry.detached = true;
            return Ok(ExecAttachment::Detached);
        }

        let (tx, rx) = mpsc::unbounded_channel();
        *entry.output.lock().unwrap() = Some(tx);
        let output = futures::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|item| (item, rx))
        })
        .boxed();
        let input = RecordingInput {
            buf: entry.input.clone(),
            shutdowns: entry.shutdowns.clone(),
        };
        Ok(ExecAttachment::Attached(ExecIo {
            input: Box::pin(input),
            output,
        }))
    }
}
