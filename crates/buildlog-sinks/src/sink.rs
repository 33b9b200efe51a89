use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use buildlog_types::ContainerDescriptor;

use crate::SinkError;

/// Container-scoped writer returned by [`Sink::attach`].
///
/// Routing keys are bound when the adapter is created. Calls never block:
/// they hand the write to the sink's own writer task.
pub trait SinkAdapter: Send + Sync {
    /// Append one captured line
    fn push(&self, line: &str) -> Result<(), SinkError>;

    /// Record when the container last produced output
    fn set_last_update(&self, timestamp: DateTime<Utc>) -> Result<(), SinkError>;

    /// Set a scalar metric under `path`
    fn update_metric(&self, path: &str, value: u64) -> Result<(), SinkError>;
}

/// A backend that stores captured log lines
#[async_trait]
pub trait Sink: Send + Sync {
    /// Short name used in diagnostics
    fn name(&self) -> &'static str;

    /// Fail fast when required connection settings are missing
    fn validate(&self) -> Result<(), SinkError>;

    /// Connect to the backend.
    ///
    /// Connection problems are logged; they never fail the daemon.
    async fn start(&self);

    /// Open an adapter bound to one container's routing keys
    fn attach(&self, container: &ContainerDescriptor) -> Arc<dyn SinkAdapter>;
}
