//! Lifecycle manager for sandboxed code-execution containers
//!
//! - `naming`: request id → container name, scoped by a fixed prefix
//! - `lifecycle`: acquire / release / force-remove, one container per request
//! - `reaper`: sweeps that reclaim released, failed, idle and orphaned containers
//! - `runtime`: the container engine port and its implementations
//! - `jobs` / `redis_manager`: the queue-driven worker surface

pub mod config;
pub mod core;
pub mod jobs;
pub mod lifecycle;
pub mod naming;
pub mod reaper;
pub mod redis_manager;
pub mod runtime;

pub use config::ManagerConfig;
pub use core::{ContainerHandle, ContainerState, ExecutionRequest, LifecycleError, PayloadRef, RuntimeError};
pub use lifecycle::LifecycleManager;
pub use naming::NamingRegistry;
pub use reaper::{ReapAll, ReapGate, Reaper, SweepFailure, SweepResult};
pub use runtime::{ContainerRuntime, DockerCli, MemoryRuntime, ResourceLimits};
