//! Reaper - scoped discover-and-remove sweeps
//!
//! A sweep snapshots every container in the managed namespace, asks its
//! `ReapGate` which ones may go, stops and removes those with bounded
//! parallelism, then prunes unreferenced images. Per-container failures are
//! collected in the `SweepResult`; nothing aborts the sweep.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::ManagerConfig;
use crate::core::{LifecycleError, RuntimeError};
use crate::naming::NamingRegistry;
use crate::runtime::{bounded, stop_and_remove, ContainerRuntime};

/// Decides, per listed container, whether a sweep may reclaim it
#[async_trait]
pub trait ReapGate: Send + Sync {
    /// Claim `name` for removal; `false` leaves it for a later sweep.
    /// Must not wait on locks held by in-flight requests.
    async fn claim(&self, name: &str) -> bool;

    /// Report the outcome for a previously claimed container
    async fn settle(&self, name: &str, result: Result<(), &RuntimeError>);
}

/// Gate that reclaims every container in the namespace
pub struct ReapAll;

#[async_trait]
impl ReapGate for ReapAll {
    async fn claim(&self, _name: &str) -> bool {
        true
    }

    async fn settle(&self, _name: &str, _result: Result<(), &RuntimeError>) {}
}

/// A container that could not be reclaimed
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SweepFailure {
    pub name: String,
    pub error: String,
}

/// Outcome of one sweep
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SweepResult {
    /// Containers in the namespace at listing time
    pub scanned: usize,
    pub removed: usize,
    /// Still active, left for a later sweep
    pub skipped: usize,
    /// In listing order
    pub failed: Vec<SweepFailure>,
    /// Images pruned, when the runtime reports it
    #[serde(skip_serializing_if = "Option::is_none")]
    pub images_pruned: Option<u64>,
}

/// Periodic or on-demand cleanup of the managed namespace
#[derive(Clone)]
pub struct Reaper {
    runtime: Arc<dyn ContainerRuntime>,
    naming: NamingRegistry,
    gate: Arc<dyn ReapGate>,
    command_timeout: Duration,
    concurrency: usize,
    prune_images: bool,
}

impl Reaper {
    /// Reaper that reclaims every prefixed container
    pub fn new(runtime: Arc<dyn ContainerRuntime>, config: &ManagerConfig) -> Result<Self, LifecycleError> {
        Ok(Self {
            runtime,
            naming: NamingRegistry::new(&config.prefix)?,
            gate: Arc::new(ReapAll),
            command_timeout: config.command_timeout,
            concurrency: config.sweep_concurrency.max(1),
            prune_images: config.prune_images,
        })
    }

    pub fn with_gate(mut self, gate: Arc<dyn ReapGate>) -> Self {
        self.gate = gate;
        self
    }

    /// Run one sweep
    pub async fn sweep(&self) -> SweepResult {
        let mut result = SweepResult::default();

        let namespace = self.naming.namespace();
        let names = match bounded(
            "list",
            self.command_timeout,
            self.runtime.list_by_prefix(namespace),
        )
        .await
        {
            Ok(names) => names,
            Err(e) => {
                error!("Sweep could not list containers under {}: {}", namespace, e);
                result.failed.push(SweepFailure {
                    name: namespace.to_string(),
                    error: e.to_string(),
                });
                return result;
            }
        };

        // never trust the runtime's filter for scoping
        let names: Vec<String> = names
            .into_iter()
            .filter(|name| self.naming.owns(name))
            .collect();
        result.scanned = names.len();

        // Removal tasks are detached so that dropping the sweep future never
        // strands a claim: every claimed container is settled exactly once.
        let semaphore = Arc::new(Semaphore::new(self.concurrency));
        let mut claimed = Vec::with_capacity(names.len());
        for name in names {
            if !self.gate.claim(&name).await {
                debug!("Sweep skipping active container {}", name);
                result.skipped += 1;
                continue;
            }

            let runtime = Arc::clone(&self.runtime);
            let gate = Arc::clone(&self.gate);
            let semaphore = Arc::clone(&semaphore);
            let limit = self.command_timeout;
            let task_name = name.clone();
            let task = tokio::spawn(async move {
                let outcome = match semaphore.acquire_owned().await {
                    Ok(_permit) => stop_and_remove(runtime.as_ref(), &task_name, limit).await,
                    Err(_) => Err(RuntimeError::Reclaiming(task_name.clone())),
                };
                gate.settle(&task_name, outcome.as_ref().map(|_| ())).await;
                outcome
            });
            claimed.push((name, task));
        }

        for (name, task) in claimed {
            match task.await {
                Ok(Ok(())) => {
                    info!("Reaped container {}", name);
                    result.removed += 1;
                }
                Ok(Err(e)) => {
                    warn!("Failed to reap container {}: {}", name, e);
                    result.failed.push(SweepFailure {
                        name,
                        error: e.to_string(),
                    });
                }
                Err(e) => {
                    error!("Sweep task for {} panicked: {}", name, e);
                    self.gate
                        .settle(&name, Err(&RuntimeError::Reclaiming(name.clone())))
                        .await;
                    result.failed.push(SweepFailure {
                        name,
                        error: "sweep task aborted".to_string(),
                    });
                }
            }
        }

        if self.prune_images {
            match bounded("prune_images", self.command_timeout, self.runtime.prune_images()).await {
                Ok(pruned) => result.images_pruned = pruned,
                Err(e) => warn!("Image prune failed (ignored): {}", e),
            }
        }

        info!(
            "Sweep summary: scanned={}, removed={}, skipped={}, failed={}",
            result.scanned,
            result.removed,
            result.skipped,
            result.failed.len()
        );

        result
    }

    /// Sweep every `interval` in a background task, handing each result to `on_result`
    pub fn spawn<F>(self, interval: Duration, on_result: F) -> JoinHandle<()>
    where
        F: Fn(SweepResult) + Send + Sync + 'static,
    {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                ticker.tick().await;
                let result = self.sweep().await;
                on_result(result);
            }
        })
    }
}
