//! In-memory sink for tests

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;

use buildlog_types::ContainerDescriptor;

use crate::{Sink, SinkAdapter, SinkError};

/// A call observed by a [`RecordingSink`] adapter
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RecordedCall {
    Push(String),
    LastUpdate(DateTime<Utc>),
    Metric(String, u64),
}

#[derive(Default)]
struct Recorder {
    calls: Mutex<Vec<(Option<String>, RecordedCall)>>,
    started: AtomicBool,
}

/// Sink that records every adapter call, optionally failing them
#[derive(Clone, Default)]
pub struct RecordingSink {
    recorder: Arc<Recorder>,
    fail_calls: bool,
    invalid: Option<&'static str>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every adapter call records and then returns an error
    pub fn failing() -> Self {
        Self {
            fail_calls: true,
            ..Self::default()
        }
    }

    /// `validate` reports the given setting as missing
    pub fn invalid(setting: &'static str) -> Self {
        Self {
            invalid: Some(setting),
            ..Self::default()
        }
    }

    pub fn started(&self) -> bool {
        self.recorder.started.load(Ordering::SeqCst)
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        self.recorder
            .calls
            .lock()
            .iter()
            .map(|(_, call)| call.clone())
            .collect()
    }

    /// Calls made through adapters attached to `container_id`
    pub fn calls_for(&self, container_id: &str) -> Vec<RecordedCall> {
        self.recorder
            .calls
            .lock()
            .iter()
            .filter(|(id, _)| id.as_deref() == Some(container_id))
            .map(|(_, call)| call.clone())
            .collect()
    }

    pub fn pushed_lines(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                RecordedCall::Push(line) => Some(line),
                _ => None,
            })
            .collect()
    }

    /// Latest value written for a metric
    pub fn metric(&self, path: &str) -> Option<u64> {
        self.calls().into_iter().rev().find_map(|call| match call {
            RecordedCall::Metric(p, value) if p == path => Some(value),
            _ => None,
        })
    }
}

#[async_trait]
impl Sink for RecordingSink {
    fn name(&self) -> &'static str {
        "recording"
    }

    fn validate(&self) -> Result<(), SinkError> {
        match self.invalid {
            Some(setting) => Err(SinkError::MissingConfig(setting)),
            None => Ok(()),
        }
    }

    async fn start(&self) {
        self.recorder.started.store(true, Ordering::SeqCst);
    }

    fn attach(&self, container: &ContainerDescriptor) -> Arc<dyn SinkAdapter> {
        Arc::new(RecordingAdapter {
            container_id: container.id.clone(),
            recorder: self.recorder.clone(),
            fail_calls: self.fail_calls,
        })
    }
}

struct RecordingAdapter {
    container_id: Option<String>,
    recorder: Arc<Recorder>,
    fail_calls: bool,
}

impl RecordingAdapter {
    fn record(&self, call: RecordedCall) -> Result<(), SinkError> {
        self.recorder
            .calls
            .lock()
            .push((self.container_id.clone(), call));
        if self.fail_calls {
            return Err(SinkError::WriterClosed);
        }
        Ok(())
    }
}

impl SinkAdapter for RecordingAdapter {
    fn push(&self, line: &str) -> Result<(), SinkError> {
        self.record(RecordedCall::Push(line.to_string()))
    }

    fn set_last_update(&self, timestamp: DateTime<Utc>) -> Result<(), SinkError> {
        self.record(RecordedCall::LastUpdate(timestamp))
    }

    fn update_metric(&self, path: &str, value: u64) -> Result<(), SinkError> {
        self.record(RecordedCall::Metric(path.to_string(), value))
    }
}
