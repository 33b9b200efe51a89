//! In-memory container runtime for tests of the capture pipeline.

use std::collections::HashMap;

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use futures::stream;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use buildlog_types::{ContainerDescriptor, StreamKind};

use crate::{ByteStream, ContainerInspection, ContainerRuntime, EventStream, RuntimeError};

/// Scripted output of one container
#[derive(Clone, Debug, Default)]
pub struct FakeContainer {
    pub tty: bool,
    /// Chunks served by `attach(stdout)`
    pub stdout: Vec<Bytes>,
    /// Chunks served by `attach(stderr)`
    pub stderr: Vec<Bytes>,
    /// Chunks served by `logs`
    pub logs: Vec<Bytes>,
    /// Keep streams open after the scripted chunks
    pub hold_open: bool,
}

impl FakeContainer {
    pub fn tty() -> Self {
        Self {
            tty: true,
            ..Default::default()
        }
    }

    pub fn multiplexed() -> Self {
        Self::default()
    }

    pub fn with_stdout(mut self, chunk: impl Into<Bytes>) -> Self {
        self.stdout.push(chunk.into());
        self
    }

    pub fn with_stderr(mut self, chunk: impl Into<Bytes>) -> Self {
        self.stderr.push(chunk.into());
        self
    }

    pub fn with_logs(mut self, chunk: impl Into<Bytes>) -> Self {
        self.logs.push(chunk.into());
        self
    }

    pub fn held_open(mut self) -> Self {
        self.hold_open = true;
        self
    }
}

#[derive(Default)]
struct FakeState {
    containers: HashMap<String, FakeContainer>,
    existing: Vec<ContainerDescriptor>,
    event_tx: Option<mpsc::UnboundedSender<ContainerDescriptor>>,
    event_rx: Option<mpsc::UnboundedReceiver<ContainerDescriptor>>,
    calls: Vec<String>,
    fail_list: bool,
    failing_events: usize,
}

/// Container runtime backed by scripted containers and a manual event feed
pub struct FakeRuntime {
    state: Mutex<FakeState>,
}

impl FakeRuntime {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            state: Mutex::new(FakeState {
                event_tx: Some(tx),
                event_rx: Some(rx),
                ..Default::default()
            }),
        }
    }

    pub fn with_container(self, id: &str, container: FakeContainer) -> Self {
        self.state.lock().containers.insert(id.to_string(), container);
        self
    }

    /// Container returned by `list_containers`
    pub fn with_existing(self, descriptor: ContainerDescriptor) -> Self {
        self.state.lock().existing.push(descriptor);
        self
    }

    /// Add a container to `list_containers` after construction
    pub fn add_existing(&self, descriptor: ContainerDescriptor) {
        self.state.lock().existing.push(descriptor);
    }

    pub fn failing_list(self) -> Self {
        self.state.lock().fail_list = true;
        self
    }

    /// Fail the next `count` calls to `events`
    pub fn failing_events(self, count: usize) -> Self {
        self.state.lock().failing_events = count;
        self
    }

    /// Publish an event on the feed returned by `events`
    pub fn emit_event(&self, descriptor: ContainerDescriptor) {
        if let Some(tx) = &self.state.lock().event_tx {
            let _ = tx.send(descriptor);
        }
    }

    /// Calls made so far, e.g. `inspect:abc` or `attach:abc:stderr`
    pub fn calls(&self) -> Vec<String> {
        self.state.lock().calls.clone()
    }

    fn record(&self, call: String) {
        self.state.lock().calls.push(call);
    }

    fn container(&self, id: &str) -> Result<FakeContainer, RuntimeError> {
        self.state
            .lock()
            .containers
            .get(id)
            .cloned()
            .ok_or_else(|| RuntimeError::Status {
                status: 404,
                path: format!("/containers/{}/json", id),
                message: format!("No such container: {}", id),
            })
    }

    fn serve(chunks: Vec<Bytes>, hold_open: bool) -> ByteStream {
        let scripted = stream::iter(chunks.into_iter().map(Ok));
        if hold_open {
            scripted.chain(stream::pending()).boxed()
        } else {
            scripted.boxed()
        }
    }
}

impl Default for FakeRuntime {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ContainerRuntime for FakeRuntime {
    async fn events(&self) -> Result<EventStream, RuntimeError> {
        self.record("events".to_string());
        let rx = {
            let mut state = self.state.lock();
            if state.failing_events > 0 {
                state.failing_events -= 1;
                return Err(RuntimeError::Status {
                    status: 500,
                    path: "/events".to_string(),
                    message: "daemon restarting".to_string(),
                });
            }
            state.event_rx.take()
        };
        match rx {
            Some(rx) => Ok(stream::unfold(rx, |mut rx| async move {
                rx.recv().await.map(|descriptor| (Ok(descriptor), rx))
            })
            .boxed()),
            None => Ok(stream::pending().boxed()),
        }
    }

    async fn list_containers(&self) -> Result<Vec<ContainerDescriptor>, RuntimeError> {
        self.record("list".to_string());
        let state = self.state.lock();
        if state.fail_list {
            return Err(RuntimeError::Status {
                status: 500,
                path: "/containers/json".to_string(),
                message: "daemon unavailable".to_string(),
            });
        }
        Ok(state.existing.clone())
    }

    async fn inspect(&self, container_id: &str) -> Result<ContainerInspection, RuntimeError> {
        self.record(format!("inspect:{}", container_id));
        let container = self.container(container_id)?;
        Ok(ContainerInspection { tty: container.tty })
    }

    async fn attach(
        &self,
        container_id: &str,
        stream: StreamKind,
    ) -> Result<ByteStream, RuntimeError> {
        self.record(format!("attach:{}:{}", container_id, stream.as_str()));
        let container = self.container(container_id)?;
        let chunks = match stream {
            StreamKind::Stdout => container.stdout,
            StreamKind::Stderr => container.stderr,
        };
        Ok(Self::serve(chunks, container.hold_open))
    }

    async fn logs(&self, container_id: &str) -> Result<ByteStream, RuntimeError> {
        self.record(format!("logs:{}", container_id));
        let container = self.container(container_id)?;
        Ok(Self::serve(container.logs, container.hold_open))
    }
}

/// Encode one multiplexed frame
pub fn frame(is_error: bool, payload: &[u8]) -> Bytes {
    let mut out = vec![if is_error { 2 } else { 1 }, 0, 0, 0];
    out.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    out.extend_from_slice(payload);
    Bytes::from(out)
}
