use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::join_all;
use tracing::warn;

use buildlog_types::ContainerDescriptor;

use crate::{Sink, SinkAdapter, SinkError};

/// Sink that forwards every call to all of its delegates
pub struct CompositeSink {
    sinks: Vec<Box<dyn Sink>>,
}

impl CompositeSink {
    pub fn new(sinks: Vec<Box<dyn Sink>>) -> Self {
        Self { sinks }
    }

    pub fn len(&self) -> usize {
        self.sinks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sinks.is_empty()
    }
}

#[async_trait]
impl Sink for CompositeSink {
    fn name(&self) -> &'static str {
        "composite"
    }

    fn validate(&self) -> Result<(), SinkError> {
        if self.sinks.is_empty() {
            return Err(SinkError::NoSinks);
        }
        self.sinks.iter().try_for_each(|sink| sink.validate())
    }

    async fn start(&self) {
        join_all(self.sinks.iter().map(|sink| sink.start())).await;
    }

    fn attach(&self, container: &ContainerDescriptor) -> Arc<dyn SinkAdapter> {
        Arc::new(CompositeAdapter {
            adapters: self
                .sinks
                .iter()
                .map(|sink| (sink.name(), sink.attach(container)))
                .collect(),
        })
    }
}

struct CompositeAdapter {
    adapters: Vec<(&'static str, Arc<dyn SinkAdapter>)>,
}

impl CompositeAdapter {
    /// Run `call` on every delegate, returning the first failure
    fn fan_out(
        &self,
        operation: &str,
        call: impl Fn(&dyn SinkAdapter) -> Result<(), SinkError>,
    ) -> Result<(), SinkError> {
        let mut first_error = None;
        for (name, adapter) in &self.adapters {
            if let Err(e) = call(adapter.as_ref()) {
                warn!(sink = name, operation, error = %e, "Sink call failed");
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }
}

impl SinkAdapter for CompositeAdapter {
    fn push(&self, line: &str) -> Result<(), SinkError> {
        self.fan_out("push", |adapter| adapter.push(line))
    }

    fn set_last_update(&self, timestamp: DateTime<Utc>) -> Result<(), SinkError> {
        self.fan_out("set_last_update", |adapter| adapter.set_last_update(timestamp))
    }

    fn update_metric(&self, path: &str, value: u64) -> Result<(), SinkError> {
        self.fan_out("update_metric", |adapter| adapter.update_metric(path, value))
    }
}
