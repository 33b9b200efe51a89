//! Container discovery and routing for buildlog
//!
//! This crate provides the [`Router`], which watches the container runtime for
//! build containers, decides which ones to capture and owns the capture
//! sessions, the shared byte budget and the persisted routing state.

mod error;
mod router;
mod state;

pub use error::RouterError;
pub use router::{Admission, Router, RouterConfig};
pub use state::{RoutingState, StateFile};

// Re-export types that are used in our public API
pub use buildlog_types::{ContainerHandlingStatus, DaemonStatus};
