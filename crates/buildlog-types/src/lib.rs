//! Shared types for buildlog
//!
//! This crate contains data structures used across multiple buildlog crates.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

// ============================================================================
// Container Labels
// ============================================================================

/// Label keys understood by the daemon and its sinks
pub mod labels {
    pub const LOGGER_ID: &str = "io.codefresh.logger.id";
    pub const LOGGER_STRATEGY: &str = "io.codefresh.logger.strategy";
    pub const LOGGER_LOG_SIZE_LIMIT: &str = "io.codefresh.logger.logSizeLimit";

    pub const ACCOUNT_ID: &str = "io.codefresh.accountId";
    pub const REQUEST_ID: &str = "io.codefresh.requestId";
    pub const STEP_NAME: &str = "io.codefresh.stepName";

    pub const FIREBASE_LOGS_URL: &str = "io.codefresh.logger.firebase.logsUrl";
    pub const FIREBASE_LAST_UPDATE_URL: &str = "io.codefresh.logger.firebase.lastUpdateUrl";
    pub const FIREBASE_METRICS_LOGS_URL: &str = "io.codefresh.logger.firebase.metricsLogs";
}

/// Size limits are configured in megabytes of 1,000,000 bytes
pub const BYTES_PER_MEGABYTE: u64 = 1_000_000;

/// Convert a megabyte setting into bytes
pub const fn megabytes_to_bytes(megabytes: u64) -> u64 {
    megabytes.saturating_mul(BYTES_PER_MEGABYTE)
}

/// Canonical label mapping of a container.
///
/// The event feed and the list/inspect endpoints carry labels in differently
/// shaped documents; both are converted into this type at the runtime boundary.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ContainerLabels(HashMap<String, String>);

impl ContainerLabels {
    pub fn new(labels: HashMap<String, String>) -> Self {
        Self(labels)
    }

    /// Look up a label, treating empty values as absent
    pub fn get(&self, key: &str) -> Option<&str> {
        self.0
            .get(key)
            .map(String::as_str)
            .filter(|value| !value.is_empty())
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.0.insert(key.into(), value.into());
    }

    pub fn logger_id(&self) -> Option<&str> {
        self.get(labels::LOGGER_ID)
    }

    pub fn strategy(&self) -> Option<&str> {
        self.get(labels::LOGGER_STRATEGY)
    }

    /// Per-container log size limit in bytes.
    ///
    /// Values that are not a whole number of megabytes are ignored.
    pub fn log_size_limit(&self) -> Option<u64> {
        self.get(labels::LOGGER_LOG_SIZE_LIMIT)
            .and_then(|value| value.trim().parse::<u64>().ok())
            .map(megabytes_to_bytes)
    }

    pub fn account_id(&self) -> Option<&str> {
        self.get(labels::ACCOUNT_ID)
    }

    pub fn request_id(&self) -> Option<&str> {
        self.get(labels::REQUEST_ID)
    }

    pub fn step_name(&self) -> Option<&str> {
        self.get(labels::STEP_NAME)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<HashMap<String, String>> for ContainerLabels {
    fn from(labels: HashMap<String, String>) -> Self {
        Self(labels)
    }
}

impl<K, V> FromIterator<(K, V)> for ContainerLabels
where
    K: Into<String>,
    V: Into<String>,
{
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self(
            iter.into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }
}

// ============================================================================
// Container Descriptor
// ============================================================================

/// Container lifecycle status as reported by the runtime
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ContainerStatus {
    Created,
    Started,
    Other(String),
}

impl ContainerStatus {
    /// Status from an event feed action (`create`, `start`, ...)
    pub fn from_event_action(action: &str) -> Self {
        match action {
            "create" => Self::Created,
            "start" => Self::Started,
            other => Self::Other(other.to_string()),
        }
    }

    /// Status from the `State` field of a container listing
    pub fn from_state(state: &str) -> Self {
        match state {
            "created" => Self::Created,
            "running" => Self::Started,
            other => Self::Other(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::Created => "create",
            Self::Started => "start",
            Self::Other(s) => s,
        }
    }
}

impl fmt::Display for ContainerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A container as seen by the router
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ContainerDescriptor {
    pub id: Option<String>,
    pub status: Option<ContainerStatus>,
    pub labels: ContainerLabels,
}

impl ContainerDescriptor {
    pub fn new(id: impl Into<String>, status: ContainerStatus, labels: ContainerLabels) -> Self {
        Self {
            id: Some(id.into()),
            status: Some(status),
            labels,
        }
    }
}

// ============================================================================
// Logging Strategy & Transport
// ============================================================================

/// How a session obtains the container's output
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum LoggerStrategy {
    /// Live attach to stdout and stderr
    Attach,
    /// Follow the container's log endpoint
    Logs,
}

impl LoggerStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Attach => "attach",
            Self::Logs => "logs",
        }
    }
}

impl fmt::Display for LoggerStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Strategy label value that is not supported
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
#[error("Strategy: {0} is not supported")]
pub struct UnsupportedStrategy(pub String);

impl FromStr for LoggerStrategy {
    type Err = UnsupportedStrategy;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "attach" => Ok(Self::Attach),
            "logs" => Ok(Self::Logs),
            other => Err(UnsupportedStrategy(other.to_string())),
        }
    }
}

/// Transport mode of a container's output streams
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransportMode {
    /// Raw text, one stream per origin
    Tty,
    /// Framed stdout/stderr sharing one stream
    Multiplexed,
}

impl TransportMode {
    pub fn from_tty(tty: bool) -> Self {
        if tty { Self::Tty } else { Self::Multiplexed }
    }
}

/// Origin of a byte stream
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum StreamKind {
    Stdout,
    Stderr,
}

impl StreamKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Stdout => "stdout",
            Self::Stderr => "stderr",
        }
    }
}

// ============================================================================
// Log Types
// ============================================================================

/// A decoded log record handed to a sink
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LogRecord {
    pub is_error: bool,
    pub text: String,
}

impl LogRecord {
    pub fn new(is_error: bool, text: impl Into<String>) -> Self {
        Self {
            is_error,
            text: text.into(),
        }
    }

    pub fn stdout(text: impl Into<String>) -> Self {
        Self::new(false, text)
    }

    pub fn stderr(text: impl Into<String>) -> Self {
        Self::new(true, text)
    }

    /// Size of the record as accounted against limits (UTF-8 bytes)
    pub fn byte_len(&self) -> u64 {
        self.text.len() as u64
    }
}

// ============================================================================
// Routing Status
// ============================================================================

/// Handling status of an admitted container
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerHandlingStatus {
    Initializing,
    Listening,
}

/// Readiness of the daemon itself
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DaemonStatus {
    #[default]
    Init,
    Ready,
}
