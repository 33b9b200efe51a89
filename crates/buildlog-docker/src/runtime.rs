use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;

use buildlog_types::{ContainerDescriptor, StreamKind};

use crate::RuntimeError;

/// Raw bytes read from a container output stream
pub type ByteStream = BoxStream<'static, Result<Bytes, RuntimeError>>;

/// Container lifecycle events, already normalized into descriptors
pub type EventStream = BoxStream<'static, Result<ContainerDescriptor, RuntimeError>>;

/// Result of inspecting a container
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ContainerInspection {
    /// Whether the container was created with a pseudo terminal
    pub tty: bool,
}

/// Operations the capture pipeline needs from the container runtime
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Subscribe to container `create` and `start` events
    async fn events(&self) -> Result<EventStream, RuntimeError>;

    /// List the currently running containers
    async fn list_containers(&self) -> Result<Vec<ContainerDescriptor>, RuntimeError>;

    /// Inspect a single container
    async fn inspect(&self, container_id: &str) -> Result<ContainerInspection, RuntimeError>;

    /// Attach to one output stream of a running container over the raw transport
    async fn attach(&self, container_id: &str, stream: StreamKind)
    -> Result<ByteStream, RuntimeError>;

    /// Follow the container's log endpoint with stdout and stderr merged
    async fn logs(&self, container_id: &str) -> Result<ByteStream, RuntimeError>;
}
