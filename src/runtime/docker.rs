//! Docker CLI runtime
//!
//! Drives a Docker-compatible engine (`docker`, `podman`) through its command
//! line, one subprocess per operation.

use std::path::{Component, Path, PathBuf};
use std::process::{Output, Stdio};

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, info};

use super::{ContainerRuntime, CreateSpec};
use crate::config::ManagerConfig;
use crate::core::RuntimeError;

/// Label attached to every container this crate creates
pub const REQUEST_LABEL: &str = "sandbox-manager.request";

/// Mount point of the payload inside the container
pub const PAYLOAD_MOUNT: &str = "/workspace";

/// Runtime backed by a Docker-compatible CLI
#[derive(Debug, Clone)]
pub struct DockerCli {
    bin: String,
    network: String,
    run_command: Vec<String>,
    payload_root: Option<PathBuf>,
}

impl DockerCli {
    pub fn new(bin: impl Into<String>) -> Self {
        Self {
            bin: bin.into(),
            network: "none".to_string(),
            run_command: Vec::new(),
            payload_root: None,
        }
    }

    pub fn from_config(config: &ManagerConfig) -> Self {
        Self {
            bin: config.runtime_bin.clone(),
            network: config.network.clone(),
            run_command: config.run_command.clone(),
            payload_root: config.payload_root.clone(),
        }
    }

    pub fn with_run_command(mut self, command: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.run_command = command.into_iter().map(|c| c.into()).collect();
        self
    }

    pub fn with_payload_root(mut self, root: impl AsRef<Path>) -> Self {
        self.payload_root = Some(root.as_ref().to_path_buf());
        self
    }

    /// Arguments for `<bin> create ...`
    fn create_args(&self, spec: &CreateSpec) -> Result<Vec<String>, RuntimeError> {
        let mut args = vec![
            "create".to_string(),
            "--name".to_string(),
            spec.name.clone(),
            "--label".to_string(),
            format!("{}={}", REQUEST_LABEL, spec.request_id),
            format!("--network={}", self.network),
            format!("--cpus={}", spec.limits.cpus),
            format!("--memory={}m", spec.limits.memory_mb),
            format!("--pids-limit={}", spec.limits.pids),
            "--security-opt=no-new-privileges".to_string(),
            "--cap-drop=ALL".to_string(),
        ];

        let payload = spec.payload.as_str();
        if !payload.is_empty() {
            args.push(format!("--env=PAYLOAD_REF={}", payload));

            if let Some(root) = &self.payload_root {
                if !is_safe_payload_path(payload) {
                    return Err(RuntimeError::InvalidPayload(payload.to_string()));
                }
                let host_path = root.join(payload);
                args.push(format!(
                    "--volume={}:{}:ro",
                    host_path.display(),
                    PAYLOAD_MOUNT
                ));
            }
        }

        args.push(spec.image.clone());
        args.extend(self.run_command.iter().cloned());
        Ok(args)
    }

    /// Run one CLI invocation; the child dies if the caller drops the future
    async fn run(&self, operation: &'static str, args: &[String]) -> Result<Output, RuntimeError> {
        debug!("Running {} with args: {:?}", self.bin, args);

        let output = Command::new(&self.bin)
            .args(args)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| RuntimeError::Spawn {
                operation,
                message: e.to_string(),
            })?;

        if output.status.success() {
            Ok(output)
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            Err(classify_failure(operation, output.status.code(), stderr))
        }
    }
}

#[async_trait]
impl ContainerRuntime for DockerCli {
    async fn list_by_prefix(&self, prefix: &str) -> Result<Vec<String>, RuntimeError> {
        let args = vec![
            "ps".to_string(),
            "-a".to_string(),
            "--filter".to_string(),
            format!("name={}", prefix),
            "--format".to_string(),
            "{{.Names}}".to_string(),
        ];
        let output = self.run("list", &args).await?;

        // the engine's name filter is a substring match
        Ok(String::from_utf8_lossy(&output.stdout)
            .lines()
            .map(str::trim)
            .filter(|name| name.starts_with(prefix))
            .map(str::to_string)
            .collect())
    }

    async fn create(&self, spec: &CreateSpec) -> Result<(), RuntimeError> {
        let args = self.create_args(spec)?;
        self.run("create", &args).await?;
        info!("Created container {} from {}", spec.name, spec.image);
        Ok(())
    }

    async fn start(&self, name: &str) -> Result<(), RuntimeError> {
        self.run("start", &["start".to_string(), name.to_string()])
            .await?;
        Ok(())
    }

    async fn stop(&self, name: &str) -> Result<(), RuntimeError> {
        self.run("stop", &["stop".to_string(), name.to_string()])
            .await?;
        Ok(())
    }

    async fn remove(&self, name: &str) -> Result<(), RuntimeError> {
        self.run(
            "remove",
            &["rm".to_string(), "-f".to_string(), name.to_string()],
        )
        .await?;
        Ok(())
    }

    async fn prune_images(&self) -> Result<Option<u64>, RuntimeError> {
        let output = self
            .run(
                "prune_images",
                &["image".to_string(), "prune".to_string(), "-f".to_string()],
            )
            .await?;
        Ok(Some(count_pruned(&String::from_utf8_lossy(&output.stdout))))
    }
}

/// Map CLI stderr onto the runtime error taxonomy
fn classify_failure(operation: &'static str, status: Option<i32>, stderr: String) -> RuntimeError {
    let lower = stderr.to_lowercase();
    if lower.contains("no such container") {
        RuntimeError::NotFound(stderr)
    } else if lower.contains("already in use") {
        RuntimeError::AlreadyExists(stderr)
    } else {
        RuntimeError::CommandFailed {
            operation,
            status,
            stderr,
        }
    }
}

/// Count `deleted:` lines in `image prune` output
fn count_pruned(stdout: &str) -> u64 {
    stdout
        .lines()
        .filter(|line| line.trim_start().starts_with("deleted:"))
        .count() as u64
}

/// Payload refs resolved on the host must stay under the payload root
fn is_safe_payload_path(path: &str) -> bool {
    let path = Path::new(path);
    !path.as_os_str().is_empty()
        && path
            .components()
            .all(|component| matches!(component, Component::Normal(_)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::PayloadRef;
    use crate::runtime::ResourceLimits;

    fn spec(payload: &str) -> CreateSpec {
        CreateSpec {
            name: "sandbox_sub-1".into(),
            request_id: "sub-1".into(),
            image: "runner:latest".into(),
            limits: ResourceLimits {
                cpus: 0.5,
                memory_mb: 128,
                pids: 32,
            },
            payload: PayloadRef::new(payload),
        }
    }

    #[test]
    fn test_create_args_limits_and_isolation() {
        let cli = DockerCli::new("docker").with_run_command(["python3", "main.py"]);
        let args = cli.create_args(&spec("sub-1/code")).unwrap();

        assert_eq!(&args[..3], ["create", "--name", "sandbox_sub-1"]);
        assert!(args.contains(&"sandbox-manager.request=sub-1".to_string()));
        assert!(args.contains(&"--network=none".to_string()));
        assert!(args.contains(&"--cpus=0.5".to_string()));
        assert!(args.contains(&"--memory=128m".to_string()));
        assert!(args.contains(&"--pids-limit=32".to_string()));
        assert!(args.contains(&"--env=PAYLOAD_REF=sub-1/code".to_string()));
        assert!(!args.iter().any(|a| a.starts_with("--volume")));
        assert_eq!(&args[args.len() - 3..], ["runner:latest", "python3", "main.py"]);
    }

    #[test]
    fn test_create_args_mounts_payload_under_root() {
        let cli = DockerCli::new("docker").with_payload_root("/srv/payloads");
        let args = cli.create_args(&spec("sub-1")).unwrap();
        assert!(args.contains(&"--volume=/srv/payloads/sub-1:/workspace:ro".to_string()));
    }

    #[test]
    fn test_create_args_rejects_escaping_payload() {
        let cli = DockerCli::new("docker").with_payload_root("/srv/payloads");
        for payload in ["../etc", "/etc/passwd", "a/../../b", "./a"] {
            assert_eq!(
                cli.create_args(&spec(payload)).unwrap_err(),
                RuntimeError::InvalidPayload(payload.to_string())
            );
        }
    }

    #[test]
    fn test_classify_failure() {
        assert!(classify_failure(
            "stop",
            Some(1),
            "Error response from daemon: No such container: sandbox_a".into()
        )
        .is_not_found());
        assert!(matches!(
            classify_failure(
                "create",
                Some(125),
                "Conflict. The container name \"/sandbox_a\" is already in use".into()
            ),
            RuntimeError::AlreadyExists(_)
        ));
        assert!(matches!(
            classify_failure("start", Some(1), "permission denied".into()),
            RuntimeError::CommandFailed {
                operation: "start",
                status: Some(1),
                ..
            }
        ));
    }

    #[test]
    fn test_count_pruned() {
        let out = "Deleted Images:\nuntagged: runner@sha256:aa\ndeleted: sha256:aa\ndeleted: sha256:bb\n\nTotal reclaimed space: 12MB\n";
        assert_eq!(count_pruned(out), 2);
        assert_eq!(count_pruned("Total reclaimed space: 0B\n"), 0);
    }

    #[tokio::test]
    async fn test_missing_binary_is_spawn_error() {
        let cli = DockerCli::new("/nonexistent/sandbox-runtime-bin");
        let err = cli.stop("sandbox_a").await.unwrap_err();
        assert!(matches!(err, RuntimeError::Spawn { operation: "stop", .. }));
    }
}
