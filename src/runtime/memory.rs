//! In-memory runtime
//!
//! Keeps containers in a map and lets tests inject failures or hangs per
//! operation. Used by every lifecycle and reaper test.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;

use super::{ContainerRuntime, CreateSpec};
use crate::core::RuntimeError;

/// Runtime operation, used to target injected faults
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Op {
    List,
    Create,
    Start,
    Stop,
    Remove,
    PruneImages,
}

#[derive(Debug, Clone)]
pub struct MemoryContainer {
    pub running: bool,
    pub spec: Option<CreateSpec>,
}

#[derive(Default)]
struct State {
    containers: BTreeMap<String, MemoryContainer>,
    dangling_images: u64,
    failures: HashMap<(Op, Option<String>), RuntimeError>,
    hangs: HashSet<(Op, Option<String>)>,
    delays: HashMap<Op, Duration>,
    calls: HashMap<Op, usize>,
    in_flight: HashMap<Op, usize>,
    peak_in_flight: HashMap<Op, usize>,
}

/// Container engine living entirely in process memory
#[derive(Default)]
pub struct MemoryRuntime {
    state: Mutex<State>,
}

impl MemoryRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, State> {
        // a panicking test thread must not wedge the others
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Seed a running container that this runtime did not create
    pub fn insert_running(&self, name: &str) {
        self.state().containers.insert(
            name.to_string(),
            MemoryContainer {
                running: true,
                spec: None,
            },
        );
    }

    pub fn add_dangling_images(&self, count: u64) {
        self.state().dangling_images += count;
    }

    pub fn names(&self) -> Vec<String> {
        self.state().containers.keys().cloned().collect()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.state().containers.contains_key(name)
    }

    pub fn container(&self, name: &str) -> Option<MemoryContainer> {
        self.state().containers.get(name).cloned()
    }

    /// Number of calls made for `op`
    pub fn calls(&self, op: Op) -> usize {
        self.state().calls.get(&op).copied().unwrap_or(0)
    }

    /// Make `op` fail with `error`; `name = None` targets every container
    pub fn fail_on(&self, op: Op, name: Option<&str>, error: RuntimeError) {
        self.state()
            .failures
            .insert((op, name.map(str::to_string)), error);
    }

    /// Make `op` never complete
    pub fn hang_on(&self, op: Op, name: Option<&str>) {
        self.state().hangs.insert((op, name.map(str::to_string)));
    }

    /// Make every `op` call take at least `delay`
    pub fn delay_on(&self, op: Op, delay: Duration) {
        self.state().delays.insert(op, delay);
    }

    /// Most `op` calls that were ever running at the same time
    pub fn peak_in_flight(&self, op: Op) -> usize {
        self.state().peak_in_flight.get(&op).copied().unwrap_or(0)
    }

    pub fn clear_faults(&self) {
        let mut state = self.state();
        state.failures.clear();
        state.hangs.clear();
        state.delays.clear();
    }

    /// Record the call and report whether it should hang or fail
    fn enter(&self, op: Op, name: Option<&str>) -> Result<bool, RuntimeError> {
        let mut state = self.state();
        *state.calls.entry(op).or_default() += 1;

        let exact = (op, name.map(str::to_string));
        let any = (op, None);
        if state.hangs.contains(&exact) || state.hangs.contains(&any) {
            return Ok(true);
        }
        if let Some(err) = state.failures.get(&exact).or_else(|| state.failures.get(&any)) {
            return Err(err.clone());
        }
        Ok(false)
    }

    async fn guard(&self, op: Op, name: Option<&str>) -> Result<(), RuntimeError> {
        let hang = self.enter(op, name)?;
        let _in_flight = InFlight::start(self, op);

        let delay = self.state().delays.get(&op).copied();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if hang {
            std::future::pending::<()>().await;
        }
        Ok(())
    }
}

/// Counts an operation as running until dropped, including when the caller
/// gives up on it
struct InFlight<'a> {
    runtime: &'a MemoryRuntime,
    op: Op,
}

impl<'a> InFlight<'a> {
    fn start(runtime: &'a MemoryRuntime, op: Op) -> Self {
        let mut state = runtime.state();
        let current = {
            let count = state.in_flight.entry(op).or_default();
            *count += 1;
            *count
        };
        let peak = state.peak_in_flight.entry(op).or_default();
        *peak = (*peak).max(current);
        Self { runtime, op }
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        if let Some(count) = self.runtime.state().in_flight.get_mut(&self.op) {
            *count = count.saturating_sub(1);
        }
    }
}

#[async_trait]
impl ContainerRuntime for MemoryRuntime {
    async fn list_by_prefix(&self, prefix: &str) -> Result<Vec<String>, RuntimeError> {
        self.guard(Op::List, None).await?;
        Ok(self
            .state()
            .containers
            .keys()
            .filter(|name| name.starts_with(prefix))
            .cloned()
            .collect())
    }

    async fn create(&self, spec: &CreateSpec) -> Result<(), RuntimeError> {
        self.guard(Op::Create, Some(&spec.name)).await?;
        let mut state = self.state();
        if state.containers.contains_key(&spec.name) {
            return Err(RuntimeError::AlreadyExists(spec.name.clone()));
        }
        state.containers.insert(
            spec.name.clone(),
            MemoryContainer {
                running: false,
                spec: Some(spec.clone()),
            },
        );
        Ok(())
    }

    async fn start(&self, name: &str) -> Result<(), RuntimeError> {
        self.guard(Op::Start, Some(name)).await?;
        match self.state().containers.get_mut(name) {
            Some(container) => {
                container.running = true;
                Ok(())
            }
            None => Err(RuntimeError::NotFound(name.to_string())),
        }
    }

    async fn stop(&self, name: &str) -> Result<(), RuntimeError> {
        self.guard(Op::Stop, Some(name)).await?;
        match self.state().containers.get_mut(name) {
            Some(container) => {
                container.running = false;
                Ok(())
            }
            None => Err(RuntimeError::NotFound(name.to_string())),
        }
    }

    async fn remove(&self, name: &str) -> Result<(), RuntimeError> {
        self.guard(Op::Remove, Some(name)).await?;
        match self.state().containers.remove(name) {
            Some(_) => Ok(()),
            None => Err(RuntimeError::NotFound(name.to_string())),
        }
    }

    async fn prune_images(&self) -> Result<Option<u64>, RuntimeError> {
        self.guard(Op::PruneImages, None).await?;
        let mut state = self.state();
        Ok(Some(std::mem::take(&mut state.dangling_images)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::PayloadRef;
    use crate::runtime::ResourceLimits;

    fn spec(name: &str) -> CreateSpec {
        CreateSpec {
            name: name.into(),
            request_id: "a".into(),
            image: "img".into(),
            limits: ResourceLimits::default(),
            payload: PayloadRef::new("p"),
        }
    }

    #[tokio::test]
    async fn test_create_start_stop_remove() {
        let rt = MemoryRuntime::new();
        rt.create(&spec("sandbox_a")).await.unwrap();
        assert!(!rt.container("sandbox_a").unwrap().running);

        rt.start("sandbox_a").await.unwrap();
        assert!(rt.container("sandbox_a").unwrap().running);

        rt.stop("sandbox_a").await.unwrap();
        rt.remove("sandbox_a").await.unwrap();
        assert!(!rt.contains("sandbox_a"));
        assert!(rt.remove("sandbox_a").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_duplicate_create() {
        let rt = MemoryRuntime::new();
        rt.create(&spec("sandbox_a")).await.unwrap();
        assert!(matches!(
            rt.create(&spec("sandbox_a")).await,
            Err(RuntimeError::AlreadyExists(_))
        ));
    }

    #[tokio::test]
    async fn test_injected_failure_is_scoped_by_name() {
        let rt = MemoryRuntime::new();
        rt.insert_running("sandbox_a");
        rt.insert_running("sandbox_b");
        rt.fail_on(Op::Stop, Some("sandbox_b"), RuntimeError::NotFound("x".into()));

        assert!(rt.stop("sandbox_a").await.is_ok());
        assert!(rt.stop("sandbox_b").await.is_err());
        assert_eq!(rt.calls(Op::Stop), 2);

        rt.clear_faults();
        assert!(rt.stop("sandbox_b").await.is_ok());
    }

    #[tokio::test]
    async fn test_tracks_overlapping_calls() {
        let rt = MemoryRuntime::new();
        rt.insert_running("sandbox_a");
        rt.insert_running("sandbox_b");
        rt.delay_on(Op::Stop, Duration::from_millis(30));

        let (a, b) = tokio::join!(rt.stop("sandbox_a"), rt.stop("sandbox_b"));
        assert!(a.is_ok() && b.is_ok());
        assert_eq!(rt.peak_in_flight(Op::Stop), 2);

        rt.stop("sandbox_a").await.unwrap();
        assert_eq!(rt.peak_in_flight(Op::Stop), 2);
        assert_eq!(rt.peak_in_flight(Op::Remove), 0);
    }

    #[tokio::test]
    async fn test_prune_drains_dangling_images() {
        let rt = MemoryRuntime::new();
        rt.add_dangling_images(3);
        assert_eq!(rt.prune_images().await.unwrap(), Some(3));
        assert_eq!(rt.prune_images().await.unwrap(), Some(0));
    }
}
