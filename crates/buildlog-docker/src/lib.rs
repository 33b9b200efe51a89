//! Docker Engine client for buildlog
//!
//! This crate provides the runtime boundary of the daemon: the
//! [`ContainerRuntime`] trait consumed by the capture pipeline and a
//! [`DockerClient`] speaking the Engine API over the daemon's unix socket.

mod client;
mod error;
mod runtime;
mod wire;

#[cfg(any(test, feature = "test-util"))]
pub mod testing;

pub use client::{DockerClient, CODEFRESH_DOCKER_SOCKET, DEFAULT_DOCKER_SOCKET};
pub use error::RuntimeError;
pub use runtime::{ByteStream, ContainerInspection, ContainerRuntime, EventStream};

// Re-export types that are used in our public API
pub use buildlog_types::{ContainerDescriptor, ContainerLabels, ContainerStatus, StreamKind};
