//! Error taxonomy for the lifecycle manager and the runtime client

use std::time::Duration;

use thiserror::Error;

/// Error reported by a container runtime client
#[derive(Debug, Clone, Error, PartialEq)]
pub enum RuntimeError {
    /// The named container does not exist
    #[error("no such container: {0}")]
    NotFound(String),
    /// A container with this name already exists
    #[error("container name already in use: {0}")]
    AlreadyExists(String),
    /// The runtime ran the command but reported failure
    #[error("{operation} failed (exit status {status:?}): {stderr}")]
    CommandFailed {
        operation: &'static str,
        status: Option<i32>,
        stderr: String,
    },
    /// The runtime did not answer within the per-command timeout
    #[error("{operation} timed out after {after:?}")]
    Timeout {
        operation: &'static str,
        after: Duration,
    },
    /// The runtime binary could not be spawned
    #[error("failed to spawn runtime command for {operation}: {message}")]
    Spawn {
        operation: &'static str,
        message: String,
    },
    /// The payload reference cannot be mounted or injected
    #[error("invalid payload reference {0:?}")]
    InvalidPayload(String),
    /// A sweep is stopping and removing this container right now
    #[error("container {0} is being reclaimed by a sweep")]
    Reclaiming(String),
}

impl RuntimeError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, RuntimeError::NotFound(_))
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, RuntimeError::Timeout { .. })
    }
}

/// Error surfaced to callers of the lifecycle manager
#[derive(Debug, Clone, Error, PartialEq)]
pub enum LifecycleError {
    /// Caller input is unusable as a container name; not retried
    #[error("invalid request id {request_id:?}: {reason}")]
    InvalidRequestId {
        request_id: String,
        reason: &'static str,
    },
    /// The runtime refused or failed to create/start the container
    #[error("failed to create container {name}: {source}")]
    CreationFailed {
        name: String,
        #[source]
        source: RuntimeError,
    },
    /// Stop or remove failed; the next sweep retries
    #[error("failed to remove container {name}: {source}")]
    RemovalFailed {
        name: String,
        #[source]
        source: RuntimeError,
    },
}

impl LifecycleError {
    /// Stable identifier used in job results
    pub fn kind(&self) -> &'static str {
        match self {
            LifecycleError::InvalidRequestId { .. } => "invalid_request_id",
            LifecycleError::CreationFailed { source, .. } if source.is_timeout() => "timeout",
            LifecycleError::RemovalFailed { source, .. } if source.is_timeout() => "timeout",
            LifecycleError::CreationFailed { .. } => "creation_failed",
            LifecycleError::RemovalFailed { .. } => "removal_failed",
        }
    }

    /// Whether the caller may retry the same call later
    pub fn is_retryable(&self) -> bool {
        !matches!(self, LifecycleError::InvalidRequestId { .. })
    }

    pub fn is_timeout(&self) -> bool {
        match self {
            LifecycleError::CreationFailed { source, .. }
            | LifecycleError::RemovalFailed { source, .. } => source.is_timeout(),
            LifecycleError::InvalidRequestId { .. } => false,
        }
    }
}
