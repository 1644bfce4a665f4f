//! Manager configuration
//!
//! Defaults, overridden by an optional TOML file, overridden by environment
//! variables. The resulting value is passed explicitly to the manager, the
//! reaper and the runtime client.

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use anyhow::Context;
use serde::Deserialize;
use tracing::info;

use crate::naming::NamingRegistry;
use crate::runtime::ResourceLimits;

/// Environment variable naming the TOML configuration file
pub const CONFIG_PATH_ENV: &str = "SANDBOX_CONFIG";

/// Lifecycle manager configuration
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// Container name prefix marking the managed namespace
    pub prefix: String,
    /// Trusted base image every sandbox is created from
    pub base_image: String,
    /// Inactivity after which a running handle may be reaped
    pub idle_timeout: Duration,
    /// Delay between periodic sweeps
    pub sweep_interval: Duration,
    /// Upper bound on any single runtime call
    pub command_timeout: Duration,
    /// Containers stopped/removed in parallel during a sweep
    pub sweep_concurrency: usize,
    pub limits: ResourceLimits,
    /// Network the container joins (`none` disables egress)
    pub network: String,
    /// Command run by the container; empty means the image default
    pub run_command: Vec<String>,
    /// Host directory payload refs are resolved under and mounted from
    pub payload_root: Option<PathBuf>,
    /// Prune unreferenced images at the end of each sweep
    pub prune_images: bool,
    /// Docker-compatible CLI binary
    pub runtime_bin: String,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            prefix: "sandbox".to_string(),
            base_image: "sandbox-runner:latest".to_string(),
            idle_timeout: Duration::from_secs(300),
            sweep_interval: Duration::from_secs(60),
            command_timeout: Duration::from_secs(30),
            sweep_concurrency: 4,
            limits: ResourceLimits::default(),
            network: "none".to_string(),
            run_command: Vec::new(),
            payload_root: None,
            prune_images: true,
            runtime_bin: "docker".to_string(),
        }
    }
}

/// Raw TOML configuration; every key is optional
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawConfig {
    prefix: Option<String>,
    base_image: Option<String>,
    idle_timeout_secs: Option<u64>,
    sweep_interval_secs: Option<u64>,
    command_timeout_secs: Option<u64>,
    sweep_concurrency: Option<usize>,
    network: Option<String>,
    run_command: Option<Vec<String>>,
    payload_root: Option<PathBuf>,
    prune_images: Option<bool>,
    runtime_bin: Option<String>,
    limits: Option<RawLimits>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawLimits {
    cpus: Option<f64>,
    memory_mb: Option<u32>,
    pids: Option<u32>,
}

impl ManagerConfig {
    /// Load defaults, then the TOML file (explicit path or `SANDBOX_CONFIG`), then env overrides
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let mut config = Self::default();

        let env_path = std::env::var(CONFIG_PATH_ENV).ok().map(PathBuf::from);
        if let Some(path) = path.map(Path::to_path_buf).or(env_path) {
            let content = std::fs::read_to_string(&path)
                .with_context(|| format!("Failed to read config file {}", path.display()))?;
            config
                .apply_toml(&content)
                .with_context(|| format!("Invalid config file {}", path.display()))?;
            info!("Loaded manager configuration from {}", path.display());
        }

        config.apply_env(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Overlay values present in a TOML document
    pub fn apply_toml(&mut self, content: &str) -> anyhow::Result<()> {
        let raw: RawConfig = toml::from_str(content)?;

        if let Some(v) = raw.prefix {
            self.prefix = v;
        }
        if let Some(v) = raw.base_image {
            self.base_image = v;
        }
        if let Some(v) = raw.idle_timeout_secs {
            self.idle_timeout = Duration::from_secs(v);
        }
        if let Some(v) = raw.sweep_interval_secs {
            self.sweep_interval = Duration::from_secs(v);
        }
        if let Some(v) = raw.command_timeout_secs {
            self.command_timeout = Duration::from_secs(v);
        }
        if let Some(v) = raw.sweep_concurrency {
            self.sweep_concurrency = v;
        }
        if let Some(v) = raw.network {
            self.network = v;
        }
        if let Some(v) = raw.run_command {
            self.run_command = v;
        }
        if let Some(v) = raw.payload_root {
            self.payload_root = Some(v);
        }
        if let Some(v) = raw.prune_images {
            self.prune_images = v;
        }
        if let Some(v) = raw.runtime_bin {
            self.runtime_bin = v;
        }
        if let Some(limits) = raw.limits {
            if let Some(v) = limits.cpus {
                self.limits.cpus = v;
            }
            if let Some(v) = limits.memory_mb {
                self.limits.memory_mb = v;
            }
            if let Some(v) = limits.pids {
                self.limits.pids = v;
            }
        }
        Ok(())
    }

    /// Overlay `SANDBOX_*` variables read through `lookup`
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) -> anyhow::Result<()> {
        if let Some(v) = lookup("SANDBOX_PREFIX") {
            self.prefix = v;
        }
        if let Some(v) = lookup("SANDBOX_IMAGE") {
            self.base_image = v;
        }
        if let Some(v) = parse_var::<u64>(&lookup, "SANDBOX_IDLE_TIMEOUT_SECS")? {
            self.idle_timeout = Duration::from_secs(v);
        }
        if let Some(v) = parse_var::<u64>(&lookup, "SANDBOX_SWEEP_INTERVAL_SECS")? {
            self.sweep_interval = Duration::from_secs(v);
        }
        if let Some(v) = parse_var::<u64>(&lookup, "SANDBOX_COMMAND_TIMEOUT_SECS")? {
            self.command_timeout = Duration::from_secs(v);
        }
        if let Some(v) = parse_var(&lookup, "SANDBOX_SWEEP_CONCURRENCY")? {
            self.sweep_concurrency = v;
        }
        if let Some(v) = parse_var(&lookup, "SANDBOX_CPUS")? {
            self.limits.cpus = v;
        }
        if let Some(v) = parse_var(&lookup, "SANDBOX_MEMORY_MB")? {
            self.limits.memory_mb = v;
        }
        if let Some(v) = parse_var(&lookup, "SANDBOX_PIDS_LIMIT")? {
            self.limits.pids = v;
        }
        if let Some(v) = lookup("SANDBOX_RUNTIME_BIN") {
            self.runtime_bin = v;
        }
        if let Some(v) = lookup("SANDBOX_PAYLOAD_ROOT") {
            self.payload_root = Some(PathBuf::from(v));
        }
        Ok(())
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        NamingRegistry::new(&self.prefix)
            .map_err(|e| anyhow::anyhow!("Invalid container prefix: {}", e))?;
        if self.base_image.trim().is_empty() {
            anyhow::bail!("Base image must not be empty");
        }
        if self.sweep_concurrency == 0 {
            anyhow::bail!("Sweep concurrency must be at least 1");
        }
        if self.command_timeout.is_zero() {
            anyhow::bail!("Command timeout must be greater than zero");
        }
        if self.sweep_interval.is_zero() {
            anyhow::bail!("Sweep interval must be greater than zero");
        }
        if !(self.limits.cpus > 0.0) {
            anyhow::bail!("CPU limit must be positive, got {}", self.limits.cpus);
        }
        if self.limits.memory_mb == 0 {
            anyhow::bail!("Memory limit must be greater than zero");
        }
        Ok(())
    }
}

fn parse_var<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> anyhow::Result<Option<T>>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match lookup(key) {
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .with_context(|| format!("Invalid value for {}: {:?}", key, raw)),
        None => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn create_test_config() -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
prefix = "student-code"
base_image = "runner:3.12"
idle_timeout_secs = 120
run_command = ["python3", "/workspace/main.py"]

[limits]
cpus = 0.5
memory_mb = 512
"#
        )
        .unwrap();
        file
    }

    #[test]
    fn test_defaults_are_valid() {
        let config = ManagerConfig::default();
        config.validate().unwrap();
        assert_eq!(config.prefix, "sandbox");
        assert_eq!(config.network, "none");
    }

    #[test]
    fn test_toml_overrides() {
        let file = create_test_config();
        let content = std::fs::read_to_string(file.path()).unwrap();

        let mut config = ManagerConfig::default();
        config.apply_toml(&content).unwrap();

        assert_eq!(config.prefix, "student-code");
        assert_eq!(config.base_image, "runner:3.12");
        assert_eq!(config.idle_timeout, Duration::from_secs(120));
        assert_eq!(config.run_command, vec!["python3", "/workspace/main.py"]);
        assert_eq!(config.limits.cpus, 0.5);
        assert_eq!(config.limits.memory_mb, 512);
        // untouched keys keep defaults
        assert_eq!(config.limits.pids, 64);
        assert_eq!(config.sweep_interval, Duration::from_secs(60));
    }

    #[test]
    fn test_load_from_explicit_path() {
        let file = create_test_config();
        let config = ManagerConfig::load(Some(file.path())).unwrap();
        assert_eq!(config.base_image, "runner:3.12");
    }

    #[test]
    fn test_unknown_toml_key_is_rejected() {
        let mut config = ManagerConfig::default();
        assert!(config.apply_toml("prefx = \"typo\"").is_err());
    }

    #[test]
    fn test_env_overrides() {
        let vars: HashMap<&str, &str> = [
            ("SANDBOX_PREFIX", "lab"),
            ("SANDBOX_SWEEP_INTERVAL_SECS", "15"),
            ("SANDBOX_MEMORY_MB", "1024"),
            ("SANDBOX_PAYLOAD_ROOT", "/srv/payloads"),
        ]
        .into_iter()
        .collect();

        let mut config = ManagerConfig::default();
        config
            .apply_env(|key| vars.get(key).map(|v| v.to_string()))
            .unwrap();

        assert_eq!(config.prefix, "lab");
        assert_eq!(config.sweep_interval, Duration::from_secs(15));
        assert_eq!(config.limits.memory_mb, 1024);
        assert_eq!(config.payload_root, Some(PathBuf::from("/srv/payloads")));
    }

    #[test]
    fn test_env_parse_error() {
        let mut config = ManagerConfig::default();
        let err = config
            .apply_env(|key| (key == "SANDBOX_CPUS").then(|| "lots".to_string()))
            .unwrap_err();
        assert!(err.to_string().contains("SANDBOX_CPUS"));
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = ManagerConfig::default();
        config.prefix = "../x".into();
        assert!(config.validate().is_err());

        let mut config = ManagerConfig::default();
        config.prefix = "sandbox_lab".into();
        assert!(config.validate().is_err());

        let mut config = ManagerConfig::default();
        config.sweep_concurrency = 0;
        assert!(config.validate().is_err());

        let mut config = ManagerConfig::default();
        config.limits.cpus = 0.0;
        assert!(config.validate().is_err());
    }
}
