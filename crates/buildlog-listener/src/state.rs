use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use buildlog_types::{ContainerHandlingStatus, DaemonStatus};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
struct ContainerEntry {
    status: ContainerHandlingStatus,
}

/// Which containers the daemon has taken over, plus its own readiness.
///
/// Serializes flat, with container ids next to the daemon status:
/// `{"status":"ready","<id>":{"status":"listening"}}`
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoutingState {
    status: DaemonStatus,
    #[serde(flatten)]
    containers: BTreeMap<String, ContainerEntry>,
}

impl RoutingState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn status(&self) -> DaemonStatus {
        self.status
    }

    pub fn set_status(&mut self, status: DaemonStatus) {
        self.status = status;
    }

    pub fn contains(&self, container_id: &str) -> bool {
        self.containers.contains_key(container_id)
    }

    pub fn container_status(&self, container_id: &str) -> Option<ContainerHandlingStatus> {
        self.containers.get(container_id).map(|entry| entry.status)
    }

    pub fn set_container(&mut self, container_id: &str, status: ContainerHandlingStatus) {
        self.containers
            .insert(container_id.to_string(), ContainerEntry { status });
    }

    /// Number of containers taken over
    pub fn len(&self) -> usize {
        self.containers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.containers.is_empty()
    }
}

/// JSON snapshot of the routing state on disk
#[derive(Clone, Debug)]
pub struct StateFile {
    path: PathBuf,
}

impl StateFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Replace the file with the current state
    pub fn write(&self, state: &RoutingState) -> io::Result<()> {
        let contents = serde_json::to_vec(state)?;
        fs::write(&self.path, contents)
    }

    pub fn read(&self) -> io::Result<RoutingState> {
        let contents = fs::read(&self.path)?;
        Ok(serde_json::from_slice(&contents)?)
    }
}
