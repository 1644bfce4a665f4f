//! Lifecycle manager for sandbox containers
//!
//! Owns one `ContainerHandle` per execution request and drives it through
//! create → run → reap. Transitions for the same request are serialized by a
//! per-name async lock; different requests never wait on each other. The
//! process-wide map is only locked to look up or insert a slot, never across
//! a runtime call.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tracing::{debug, info, warn};

use crate::config::ManagerConfig;
use crate::core::{
    ContainerHandle, ContainerState, ExecutionRequest, LifecycleError, PayloadRef, RuntimeError,
};
use crate::naming::NamingRegistry;
use crate::reaper::{ReapGate, Reaper};
use crate::runtime::{bounded, stop_and_remove, ContainerRuntime, CreateSpec};

#[derive(Default)]
struct Slot {
    handle: Option<ContainerHandle>,
    /// A sweep has claimed this name and is stopping/removing it
    sweep_claimed: bool,
}

type SlotRef = Arc<tokio::sync::Mutex<Slot>>;

/// Request-path half of the subsystem: acquire, release and force-remove
pub struct LifecycleManager {
    runtime: Arc<dyn ContainerRuntime>,
    naming: NamingRegistry,
    config: ManagerConfig,
    slots: Mutex<HashMap<String, SlotRef>>,
}

impl LifecycleManager {
    pub fn new(runtime: Arc<dyn ContainerRuntime>, config: ManagerConfig) -> Result<Self, LifecycleError> {
        Ok(Self {
            runtime,
            naming: NamingRegistry::new(&config.prefix)?,
            config,
            slots: Mutex::new(HashMap::new()),
        })
    }

    pub fn naming(&self) -> &NamingRegistry {
        &self.naming
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.config
    }

    /// Reaper sharing this manager's runtime and honouring its handles
    pub fn reaper(self: &Arc<Self>) -> Result<Reaper, LifecycleError> {
        let gate: Arc<dyn ReapGate> = self.clone();
        Ok(Reaper::new(self.runtime.clone(), &self.config)?.with_gate(gate))
    }

    /// Ensure a running container exists for `request`.
    ///
    /// Idempotent by request id: while the handle is active, the existing
    /// handle is returned and no container is created. A failed creation
    /// leaves no handle behind.
    pub async fn acquire(&self, request: &ExecutionRequest) -> Result<ContainerHandle, LifecycleError> {
        let name = self.naming.name_for(&request.request_id)?;
        let slot_ref = self.slot(&name);
        let mut slot = slot_ref.lock().await;

        if slot.sweep_claimed {
            return Err(LifecycleError::CreationFailed {
                name: name.clone(),
                source: RuntimeError::Reclaiming(name),
            });
        }

        if let Some(handle) = slot.handle.as_mut() {
            if handle.state.is_active() {
                handle.touch();
                debug!("Reusing container {} ({})", handle.name, handle.state);
                return Ok(handle.clone());
            }

            // released or failed but not yet swept: reclaim before recreating
            info!("Reclaiming {} ({}) before re-acquire", handle.name, handle.state);
            if let Err(source) = stop_and_remove(self.runtime.as_ref(), &name, self.config.command_timeout).await {
                warn!("Could not reclaim {} for re-acquire: {}", name, source);
                handle.fail(&source);
                return Err(LifecycleError::CreationFailed { name, source });
            }
            slot.handle = None;
        }

        let mut handle = ContainerHandle::new(&request.request_id, name.clone());
        handle.transition(ContainerState::Creating);
        info!(
            "Creating container {} for request {} (image {})",
            name, request.request_id, self.config.base_image
        );

        match self.create_and_start(&request.request_id, &name, &request.payload_ref).await {
            Ok(()) => {
                handle.transition(ContainerState::Running);
                handle.touch();
                slot.handle = Some(handle.clone());
                info!("Container {} is running", name);
                Ok(handle)
            }
            Err(source) => {
                warn!("Failed to create container {}: {}", name, source);
                drop(slot);
                drop(slot_ref);
                self.prune_slot(&name);
                Err(LifecycleError::CreationFailed { name, source })
            }
        }
    }

    async fn create_and_start(
        &self,
        request_id: &str,
        name: &str,
        payload: &PayloadRef,
    ) -> Result<(), RuntimeError> {
        let spec = CreateSpec {
            name: name.to_string(),
            request_id: request_id.to_string(),
            image: self.config.base_image.clone(),
            limits: self.config.limits.clone(),
            payload: payload.clone(),
        };
        let limit = self.config.command_timeout;

        match bounded("create", limit, self.runtime.create(&spec)).await {
            Ok(()) => {}
            Err(RuntimeError::AlreadyExists(_)) => {
                // leftover from an earlier process; nothing tracks it
                warn!("Replacing stale container {}", name);
                stop_and_remove(self.runtime.as_ref(), name, limit).await?;
                bounded("create", limit, self.runtime.create(&spec)).await?;
            }
            Err(e) => return Err(e),
        }

        if let Err(e) = bounded("start", limit, self.runtime.start(name)).await {
            if let Err(cleanup) = stop_and_remove(self.runtime.as_ref(), name, limit).await {
                warn!("Could not clean up unstarted container {}: {}", name, cleanup);
            }
            return Err(e);
        }
        Ok(())
    }

    /// Record activity on an active handle
    pub async fn touch(&self, request_id: &str) -> Result<Option<ContainerHandle>, LifecycleError> {
        self.with_handle(request_id, |handle| {
            if handle.state.is_active() {
                handle.touch();
            }
        })
        .await
    }

    /// Execution finished: Running → Idle. The idle window starts now.
    pub async fn complete(&self, request_id: &str) -> Result<Option<ContainerHandle>, LifecycleError> {
        self.with_handle(request_id, |handle| {
            if handle.state == ContainerState::Running {
                handle.transition(ContainerState::Idle);
                handle.touch();
                debug!("Container {} is idle", handle.name);
            }
        })
        .await
    }

    /// Mark the handle reapable; the next sweep removes the container
    pub async fn release(&self, request_id: &str) -> Result<Option<ContainerHandle>, LifecycleError> {
        self.with_handle(request_id, |handle| {
            if matches!(handle.state, ContainerState::Running | ContainerState::Idle) {
                handle.transition(ContainerState::Reaping);
                info!("Released container {}", handle.name);
            }
        })
        .await
    }

    /// Stop and remove the request's container now.
    ///
    /// Idempotent: a request whose container is already gone succeeds.
    /// On failure the handle is kept as Failed and the next sweep retries.
    pub async fn force_remove(&self, request_id: &str) -> Result<(), LifecycleError> {
        let name = self.naming.name_for(request_id)?;
        let slot_ref = self.slot(&name);
        let mut slot = slot_ref.lock().await;

        if let Some(handle) = slot.handle.as_mut() {
            if handle.state != ContainerState::Reaping {
                handle.transition(ContainerState::Reaping);
            }
        }

        let result = stop_and_remove(self.runtime.as_ref(), &name, self.config.command_timeout).await;
        match result {
            Ok(()) => {
                if let Some(mut handle) = slot.handle.take() {
                    handle.transition(ContainerState::Removed);
                }
                info!("Force-removed container {}", name);
                drop(slot);
                drop(slot_ref);
                self.prune_slot(&name);
                Ok(())
            }
            Err(source) => {
                warn!("Force-remove of {} failed: {}", name, source);
                if let Some(handle) = slot.handle.as_mut() {
                    handle.fail(&source);
                }
                Err(LifecycleError::RemovalFailed { name, source })
            }
        }
    }

    /// Snapshot of the request's handle
    pub async fn handle(&self, request_id: &str) -> Result<Option<ContainerHandle>, LifecycleError> {
        self.with_handle(request_id, |_| {}).await
    }

    /// Snapshot of every tracked handle
    pub async fn handles(&self) -> Vec<ContainerHandle> {
        let slots: Vec<SlotRef> = self.slots().values().cloned().collect();
        let mut handles = Vec::with_capacity(slots.len());
        for slot in slots {
            if let Some(handle) = &slot.lock().await.handle {
                handles.push(handle.clone());
            }
        }
        handles.sort_by(|a, b| a.name.cmp(&b.name));
        handles
    }

    async fn with_handle<F>(&self, request_id: &str, f: F) -> Result<Option<ContainerHandle>, LifecycleError>
    where
        F: FnOnce(&mut ContainerHandle),
    {
        let name = self.naming.name_for(request_id)?;
        let Some(slot_ref) = self.existing_slot(&name) else {
            debug!("No handle for request {}", request_id);
            return Ok(None);
        };
        let mut slot = slot_ref.lock().await;
        let snapshot = slot.handle.as_mut().map(|handle| {
            f(handle);
            handle.clone()
        });

        // an empty slot left behind by an overlapping force-remove or sweep
        if snapshot.is_none() {
            drop(slot);
            drop(slot_ref);
            self.prune_slot(&name);
        }
        Ok(snapshot)
    }

    fn slots(&self) -> MutexGuard<'_, HashMap<String, SlotRef>> {
        self.slots.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn slot(&self, name: &str) -> SlotRef {
        self.slots()
            .entry(name.to_string())
            .or_default()
            .clone()
    }

    fn existing_slot(&self, name: &str) -> Option<SlotRef> {
        self.slots().get(name).cloned()
    }

    /// Drop an empty slot nobody else holds
    fn prune_slot(&self, name: &str) {
        let mut slots = self.slots();
        let unused = match slots.get(name) {
            Some(slot) if Arc::strong_count(slot) == 1 => slot
                .try_lock()
                .map(|s| s.handle.is_none() && !s.sweep_claimed)
                .unwrap_or(false),
            _ => false,
        };
        if unused {
            slots.remove(name);
        }
    }
}

#[async_trait]
impl ReapGate for LifecycleManager {
    async fn claim(&self, name: &str) -> bool {
        let slot_ref = self.slot(name);
        // a locked slot has a request in flight; leave it for the next sweep
        let Ok(mut slot) = slot_ref.try_lock() else {
            return false;
        };

        let eligible = match slot.handle.as_mut() {
            // untracked containers are orphans
            None => {
                info!(
                    "Reclaiming orphan container {} (request {})",
                    name,
                    self.naming.request_id_of(name).unwrap_or("?")
                );
                true
            }
            Some(handle) => claim_handle(handle, self.config.idle_timeout),
        };

        if eligible {
            slot.sweep_claimed = true;
        }
        let prune = !eligible && slot.handle.is_none();
        drop(slot);
        drop(slot_ref);
        if prune {
            self.prune_slot(name);
        }
        eligible
    }

    async fn settle(&self, name: &str, result: Result<(), &RuntimeError>) {
        let Some(slot_ref) = self.existing_slot(name) else {
            return;
        };
        let mut slot = slot_ref.lock().await;
        slot.sweep_claimed = false;

        match result {
            Ok(()) => {
                if let Some(mut handle) = slot.handle.take() {
                    handle.transition(ContainerState::Removed);
                }
            }
            Err(e) => {
                if let Some(handle) = slot.handle.as_mut() {
                    handle.fail(e);
                }
            }
        }

        drop(slot);
        drop(slot_ref);
        self.prune_slot(name);
    }
}

/// Sweep eligibility for a tracked handle; moves eligible handles to Reaping
fn claim_handle(handle: &mut ContainerHandle, idle_timeout: Duration) -> bool {
    match handle.state {
        ContainerState::Reaping => true,
        ContainerState::Failed => handle.transition(ContainerState::Reaping),
        ContainerState::Running | ContainerState::Idle => {
            if !handle.is_idle_expired(idle_timeout, Utc::now()) {
                return false;
            }
            info!("Container {} idle past {:?}", handle.name, idle_timeout);
            if handle.state == ContainerState::Running {
                handle.transition(ContainerState::Idle);
            }
            handle.transition(ContainerState::Reaping)
        }
        _ => false,
    }
}
