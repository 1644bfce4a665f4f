//! Runtime module - Container engine abstraction
//!
//! This module provides the interface the lifecycle manager and the reaper
//! use to drive the container engine:
//! - `DockerCli`: shells out to a Docker-compatible CLI
//! - `MemoryRuntime`: in-process engine for tests and dry runs
//!
//! The runtime module does NOT:
//! - Track lifecycle state (that's the manager's job)
//! - Decide which containers may be reclaimed
//! - Apply timeouts on its own; callers wrap each call in `bounded`

pub mod docker;
pub mod memory;

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::core::{PayloadRef, RuntimeError};

/// Resource limits applied to every sandbox container
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceLimits {
    /// CPU quota in cores
    pub cpus: f64,
    /// Memory limit in MB
    pub memory_mb: u32,
    /// Maximum number of processes
    pub pids: u32,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            cpus: 1.0,
            memory_mb: 256,
            pids: 64,
        }
    }
}

/// Everything the engine needs to create one sandbox container
#[derive(Debug, Clone)]
pub struct CreateSpec {
    pub name: String,
    pub request_id: String,
    pub image: String,
    pub limits: ResourceLimits,
    pub payload: PayloadRef,
}

/// Container engine operations consumed by the manager and the reaper
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Names of all containers (running or not) starting with `prefix`
    async fn list_by_prefix(&self, prefix: &str) -> Result<Vec<String>, RuntimeError>;

    /// Create a stopped container
    async fn create(&self, spec: &CreateSpec) -> Result<(), RuntimeError>;

    async fn start(&self, name: &str) -> Result<(), RuntimeError>;

    async fn stop(&self, name: &str) -> Result<(), RuntimeError>;

    async fn remove(&self, name: &str) -> Result<(), RuntimeError>;

    /// Remove images no container references; returns how many were pruned when known
    async fn prune_images(&self) -> Result<Option<u64>, RuntimeError>;
}

/// Run one runtime call, failing with `RuntimeError::Timeout` after `limit`
pub async fn bounded<T, F>(operation: &'static str, limit: Duration, call: F) -> Result<T, RuntimeError>
where
    F: Future<Output = Result<T, RuntimeError>>,
{
    match tokio::time::timeout(limit, call).await {
        Ok(result) => result,
        Err(_) => Err(RuntimeError::Timeout {
            operation,
            after: limit,
        }),
    }
}

/// Stop then remove `name`; a container that is already gone counts as removed
pub async fn stop_and_remove(
    runtime: &dyn ContainerRuntime,
    name: &str,
    limit: Duration,
) -> Result<(), RuntimeError> {
    match bounded("stop", limit, runtime.stop(name)).await {
        Ok(()) => {}
        Err(e) if e.is_not_found() => return Ok(()),
        Err(e) => return Err(e),
    }
    match bounded("remove", limit, runtime.remove(name)).await {
        Err(e) if !e.is_not_found() => Err(e),
        _ => Ok(()),
    }
}

// Re-exports
pub use docker::DockerCli;
pub use memory::MemoryRuntime;
