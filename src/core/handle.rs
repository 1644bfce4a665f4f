//! Request and handle records shared by the manager, the reaper and the worker

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

use super::state::ContainerState;

/// Opaque reference to the code/input a container should see
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PayloadRef(pub String);

impl PayloadRef {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// A caller's wish to run a unit of untrusted code
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionRequest {
    pub request_id: String,
    pub submitted_at: DateTime<Utc>,
    pub payload_ref: PayloadRef,
}

impl ExecutionRequest {
    pub fn new(request_id: impl Into<String>, payload_ref: PayloadRef) -> Self {
        Self {
            request_id: request_id.into(),
            submitted_at: Utc::now(),
            payload_ref,
        }
    }

    /// Create a request with a freshly generated id
    pub fn generated(payload_ref: PayloadRef) -> Self {
        // simple form is hex only, always a valid name component
        Self::new(uuid::Uuid::new_v4().simple().to_string(), payload_ref)
    }
}

/// The manager's record of the container serving one request
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ContainerHandle {
    pub request_id: String,
    pub name: String,
    pub state: ContainerState,
    pub created_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
    /// Last runtime error, kept for diagnostics when the handle is Failed
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

impl ContainerHandle {
    pub(crate) fn new(request_id: &str, name: String) -> Self {
        let now = Utc::now();
        Self {
            request_id: request_id.to_string(),
            name,
            state: ContainerState::Requested,
            created_at: now,
            last_activity_at: now,
            last_error: None,
        }
    }

    /// Move to `next`, refusing illegal transitions
    pub(crate) fn transition(&mut self, next: ContainerState) -> bool {
        if !self.state.can_transition_to(next) {
            warn!(
                "Refusing illegal transition {} -> {} for {}",
                self.state, next, self.name
            );
            return false;
        }
        self.state = next;
        true
    }

    pub(crate) fn fail(&mut self, error: impl ToString) {
        self.last_error = Some(error.to_string());
        self.transition(ContainerState::Failed);
    }

    pub(crate) fn touch(&mut self) {
        self.last_activity_at = Utc::now();
    }

    /// Whether the handle has seen no activity for at least `idle_window`
    pub fn is_idle_expired(&self, idle_window: std::time::Duration, now: DateTime<Utc>) -> bool {
        let Ok(window) = chrono::Duration::from_std(idle_window) else {
            return false;
        };
        now - self.last_activity_at >= window
    }
}
