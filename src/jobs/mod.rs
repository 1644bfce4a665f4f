//! Worker jobs
//!
//! Jobs arrive as JSON on the Redis queue, tagged by `job_type`, and map
//! one-to-one onto lifecycle manager and reaper calls.

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::core::{ContainerHandle, ExecutionRequest, LifecycleError, PayloadRef};
use crate::lifecycle::LifecycleManager;
use crate::reaper::{Reaper, SweepResult};

/// Worker job enum - represents the operations callers can request
#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "job_type", rename_all = "snake_case")]
pub enum WorkerJob {
    /// Create (or reuse) the request's container
    Acquire(AcquireJob),
    /// Record activity
    Touch(RequestJob),
    /// Execution finished
    Complete(RequestJob),
    /// Hand the container to the next sweep
    Release(RequestJob),
    /// Stop and remove now
    ForceRemove(RequestJob),
    /// Run a sweep immediately
    Sweep,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct AcquireJob {
    /// Generated when absent
    #[serde(default)]
    pub request_id: Option<String>,
    pub payload_ref: PayloadRef,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct RequestJob {
    pub request_id: String,
}

/// Result of a request-scoped job
#[derive(Debug, Serialize, Deserialize, PartialEq)]
pub struct JobResult {
    pub request_id: String,
    pub operation: String,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub handle: Option<ContainerHandle>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<String>,
    pub retryable: bool,
}

impl JobResult {
    fn from_outcome(
        request_id: String,
        operation: &str,
        outcome: Result<Option<ContainerHandle>, LifecycleError>,
    ) -> Self {
        match outcome {
            Ok(handle) => Self {
                request_id,
                operation: operation.to_string(),
                success: true,
                handle,
                error: None,
                error_kind: None,
                retryable: false,
            },
            Err(e) => {
                warn!("{} failed for request {}: {}", operation, request_id, e);
                Self {
                    request_id,
                    operation: operation.to_string(),
                    success: false,
                    handle: None,
                    error: Some(e.to_string()),
                    error_kind: Some(e.kind().to_string()),
                    retryable: e.is_retryable(),
                }
            }
        }
    }
}

/// What a processed job produced
#[derive(Debug)]
pub enum JobOutcome {
    Request(JobResult),
    Sweep(SweepResult),
}

/// Process a single job
pub async fn process_job(manager: &LifecycleManager, reaper: &Reaper, job: WorkerJob) -> JobOutcome {
    let (request_id, operation, outcome) = match job {
        WorkerJob::Acquire(job) => {
            let request = match job.request_id {
                Some(id) => ExecutionRequest::new(id, job.payload_ref),
                None => ExecutionRequest::generated(job.payload_ref),
            };
            info!("Received acquire job: request_id={}", request.request_id);
            let outcome = manager.acquire(&request).await.map(Some);
            (request.request_id, "acquire", outcome)
        }
        WorkerJob::Touch(job) => {
            let outcome = manager.touch(&job.request_id).await;
            (job.request_id, "touch", outcome)
        }
        WorkerJob::Complete(job) => {
            let outcome = manager.complete(&job.request_id).await;
            (job.request_id, "complete", outcome)
        }
        WorkerJob::Release(job) => {
            let outcome = manager.release(&job.request_id).await;
            (job.request_id, "release", outcome)
        }
        WorkerJob::ForceRemove(job) => {
            let outcome = manager.force_remove(&job.request_id).await.map(|()| None);
            (job.request_id, "force_remove", outcome)
        }
        WorkerJob::Sweep => {
            info!("Received on-demand sweep job");
            return JobOutcome::Sweep(reaper.sweep().await);
        }
    };

    JobOutcome::Request(JobResult::from_outcome(request_id, operation, outcome))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ManagerConfig;
    use crate::core::ContainerState;
    use crate::runtime::MemoryRuntime;
    use std::sync::Arc;

    fn setup() -> (Arc<MemoryRuntime>, Arc<LifecycleManager>, Reaper) {
        let runtime = Arc::new(MemoryRuntime::new());
        let manager = Arc::new(
            LifecycleManager::new(runtime.clone(), ManagerConfig::default()).unwrap(),
        );
        let reaper = manager.reaper().unwrap();
        (runtime, manager, reaper)
    }

    fn parse(json: &str) -> WorkerJob {
        serde_json::from_str(json).unwrap()
    }

    async fn run(manager: &LifecycleManager, reaper: &Reaper, json: &str) -> JobResult {
        match process_job(manager, reaper, parse(json)).await {
            JobOutcome::Request(result) => result,
            JobOutcome::Sweep(_) => panic!("expected a request result"),
        }
    }

    #[test]
    fn test_parse_jobs() {
        assert!(matches!(
            parse(r#"{"job_type":"acquire","request_id":"sub-1","payload_ref":"sub-1/main.py"}"#),
            WorkerJob::Acquire(AcquireJob { request_id: Some(_), .. })
        ));
        assert!(matches!(
            parse(r#"{"job_type":"acquire","payload_ref":"x"}"#),
            WorkerJob::Acquire(AcquireJob { request_id: None, .. })
        ));
        assert!(matches!(
            parse(r#"{"job_type":"force_remove","request_id":"sub-1"}"#),
            WorkerJob::ForceRemove(_)
        ));
        assert!(matches!(parse(r#"{"job_type":"sweep"}"#), WorkerJob::Sweep));
        assert!(serde_json::from_str::<WorkerJob>(r#"{"job_type":"reboot"}"#).is_err());
    }

    #[tokio::test]
    async fn test_acquire_then_release_then_sweep() {
        let (runtime, manager, reaper) = setup();

        let acquired = run(
            &manager,
            &reaper,
            r#"{"job_type":"acquire","request_id":"sub-1","payload_ref":"sub-1"}"#,
        )
        .await;
        assert!(acquired.success);
        assert_eq!(acquired.handle.unwrap().state, ContainerState::Running);

        let released = run(&manager, &reaper, r#"{"job_type":"release","request_id":"sub-1"}"#).await;
        assert_eq!(released.handle.unwrap().state, ContainerState::Reaping);

        match process_job(&manager, &reaper, WorkerJob::Sweep).await {
            JobOutcome::Sweep(result) => assert_eq!(result.removed, 1),
            JobOutcome::Request(_) => panic!("expected a sweep result"),
        }
        assert!(runtime.names().is_empty());
    }

    #[tokio::test]
    async fn test_generated_request_id() {
        let (runtime, manager, reaper) = setup();

        let result = run(&manager, &reaper, r#"{"job_type":"acquire","payload_ref":"p"}"#).await;

        assert!(result.success);
        assert_eq!(result.request_id.len(), 32);
        assert_eq!(runtime.names(), vec![format!("sandbox_{}", result.request_id)]);
    }

    #[tokio::test]
    async fn test_invalid_request_reports_kind() {
        let (_runtime, manager, reaper) = setup();

        let result = run(
            &manager,
            &reaper,
            r#"{"job_type":"acquire","request_id":"../etc","payload_ref":"p"}"#,
        )
        .await;

        assert!(!result.success);
        assert_eq!(result.error_kind.as_deref(), Some("invalid_request_id"));
        assert!(!result.retryable);

        let json = serde_json::to_value(&result).unwrap();
        assert!(json.get("handle").is_none());
    }

    #[tokio::test]
    async fn test_force_remove_job() {
        let (runtime, manager, reaper) = setup();
        run(
            &manager,
            &reaper,
            r#"{"job_type":"acquire","request_id":"a","payload_ref":"p"}"#,
        )
        .await;

        let result = run(&manager, &reaper, r#"{"job_type":"force_remove","request_id":"a"}"#).await;
        assert!(result.success);
        assert_eq!(result.operation, "force_remove");
        assert!(runtime.names().is_empty());
    }
}
