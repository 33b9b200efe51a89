//! Engine API documents and their conversion into the canonical types

use serde::Deserialize;
use std::collections::HashMap;

use buildlog_types::{ContainerDescriptor, ContainerLabels, ContainerStatus};

use crate::ContainerInspection;

/// One message of the `/events` feed
#[derive(Debug, Default, Deserialize)]
pub(crate) struct EventMessage {
    #[serde(rename = "Type")]
    pub typ: Option<String>,
    #[serde(rename = "Action")]
    pub action: Option<String>,
    /// Legacy field, removed from newer API versions
    pub status: Option<String>,
    /// Legacy field, removed from newer API versions
    pub id: Option<String>,
    #[serde(rename = "Actor")]
    pub actor: Option<EventActor>,
}

#[derive(Debug, Default, Deserialize)]
pub(crate) struct EventActor {
    #[serde(rename = "ID")]
    pub id: Option<String>,
    #[serde(rename = "Attributes")]
    pub attributes: Option<HashMap<String, String>>,
}

impl EventMessage {
    /// Container events only; other object types are skipped
    pub fn is_container_event(&self) -> bool {
        self.typ.as_deref().is_none_or(|t| t == "container")
    }

    pub fn into_descriptor(self) -> ContainerDescriptor {
        let (actor_id, attributes) = match self.actor {
            Some(actor) => (actor.id, actor.attributes.unwrap_or_default()),
            None => (None, HashMap::new()),
        };

        ContainerDescriptor {
            id: self.id.or(actor_id),
            status: self
                .action
                .or(self.status)
                .map(|a| ContainerStatus::from_event_action(&a)),
            labels: ContainerLabels::from(attributes),
        }
    }
}

/// One entry of `/containers/json`
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub(crate) struct ContainerSummary {
    pub id: Option<String>,
    pub state: Option<String>,
    pub status: Option<String>,
    pub labels: Option<HashMap<String, String>>,
}

impl ContainerSummary {
    pub fn into_descriptor(self) -> ContainerDescriptor {
        let status = match (self.state, self.status) {
            (Some(state), _) => Some(ContainerStatus::from_state(&state)),
            (None, Some(status)) => Some(ContainerStatus::Other(status)),
            (None, None) => None,
        };

        ContainerDescriptor {
            id: self.id,
            status,
            labels: ContainerLabels::from(self.labels.unwrap_or_default()),
        }
    }
}

/// Subset of `/containers/{id}/json`
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub(crate) struct InspectResponse {
    pub config: Option<InspectConfig>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub(crate) struct InspectConfig {
    #[serde(default)]
    pub tty: bool,
}

impl From<InspectResponse> for ContainerInspection {
    fn from(response: InspectResponse) -> Self {
        ContainerInspection {
            tty: response.config.unwrap_or_default().tty,
        }
    }
}

/// Error document returned with non-success statuses
#[derive(Debug, Deserialize)]
pub(crate) struct ErrorResponse {
    pub message: String,
}
