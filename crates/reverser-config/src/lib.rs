//! Configuration file support for the controller (`.reverser.toml`).
//!
//! This module provides support for a controller-wide configuration file,
//! with every field overridable via `REVERSER_<SECTION>_<KEY>` environment
//! variables (checked after the file is parsed, so env always wins).

use std::env;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};

/// Correlation Store sizing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CorrelationConfig {
    #[serde(default = "default_correlation_capacity")]
    pub capacity: usize,
    #[serde(default = "default_correlation_ttl", with = "humantime_serde")]
    pub ttl: Duration,
}

impl Default for CorrelationConfig {
    fn default() -> Self {
        Self {
            capacity: default_correlation_capacity(),
            ttl: default_correlation_ttl(),
        }
    }
}

fn default_correlation_capacity() -> usize {
    10_000
}

fn default_correlation_ttl() -> Duration {
    Duration::from_secs(5 * 60)
}

/// Branch Worker batching and retry knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    #[serde(default = "default_max_batch")]
    pub max_batch: usize,
    #[serde(default = "default_flush_interval", with = "humantime_serde")]
    pub flush_interval: Duration,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_mailbox_capacity")]
    pub mailbox_capacity: usize,
    #[serde(default = "default_overflow_capacity")]
    pub overflow_capacity: usize,
    #[serde(default = "default_shutdown_timeout", with = "humantime_serde")]
    pub shutdown_timeout: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            max_batch: default_max_batch(),
            flush_interval: default_flush_interval(),
            max_retries: default_max_retries(),
            mailbox_capacity: default_mailbox_capacity(),
            overflow_capacity: default_overflow_capacity(),
            shutdown_timeout: default_shutdown_timeout(),
        }
    }
}

fn default_max_batch() -> usize {
    100
}
fn default_flush_interval() -> Duration {
    Duration::from_secs(2)
}
fn default_max_retries() -> u32 {
    8
}
fn default_mailbox_capacity() -> usize {
    1_024
}
fn default_overflow_capacity() -> usize {
    default_mailbox_capacity() * 4
}
fn default_shutdown_timeout() -> Duration {
    Duration::from_secs(10)
}

/// Reconciler Manager periodic drift-check interval.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconcilerConfig {
    #[serde(default = "default_reconcile_interval", with = "humantime_serde")]
    pub reconcile_interval: Duration,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            reconcile_interval: default_reconcile_interval(),
        }
    }
}

fn default_reconcile_interval() -> Duration {
    Duration::from_secs(10 * 60)
}

/// Git Repository Facade timeouts and commit identity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GitConfig {
    #[serde(default = "default_author_name")]
    pub author_name: String,
    #[serde(default = "default_author_email")]
    pub author_email: String,
    #[serde(default = "default_op_timeout", with = "humantime_serde")]
    pub operation_timeout: Duration,
    #[serde(default = "default_push_cycle_timeout", with = "humantime_serde")]
    pub push_cycle_timeout: Duration,
}

impl Default for GitConfig {
    fn default() -> Self {
        Self {
            author_name: default_author_name(),
            author_email: default_author_email(),
            operation_timeout: default_op_timeout(),
            push_cycle_timeout: default_push_cycle_timeout(),
        }
    }
}

fn default_author_name() -> String {
    "gitops-reverser".to_string()
}
fn default_author_email() -> String {
    "gitops-reverser@users.noreply.github.com".to_string()
}
fn default_op_timeout() -> Duration {
    Duration::from_secs(60)
}
fn default_push_cycle_timeout() -> Duration {
    Duration::from_secs(120)
}

/// HTTP surface bind address and readiness knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
        }
    }
}

fn default_bind_addr() -> String {
    "0.0.0.0:8080".to_string()
}

/// Top-level configuration, loaded from `.reverser.toml` with environment
/// overrides layered on top.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReverserConfig {
    #[serde(default)]
    pub correlation: CorrelationConfig,
    #[serde(default)]
    pub worker: WorkerConfig,
    #[serde(default)]
    pub reconciler: ReconcilerConfig,
    #[serde(default)]
    pub git: GitConfig,
    #[serde(default)]
    pub server: ServerConfig,
}

impl ReverserConfig {
    /// Load configuration from a specific file path, then apply environment
    /// overrides. Missing file is not an error; callers get defaults.
    pub fn load(path: &Path) -> Result<Self> {
        let mut config = if path.exists() {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("failed to read config file: {}", path.display()))?;
            toml::from_str(&content)
                .with_context(|| format!("failed to parse config file: {}", path.display()))?
        } else {
            Self::default()
        };

        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(v) = env::var("REVERSER_CORRELATION_CAPACITY") {
            if let Ok(n) = v.parse() {
                self.correlation.capacity = n;
            }
        }
        if let Ok(v) = env::var("REVERSER_CORRELATION_TTL") {
            if let Ok(d) = humantime::parse_duration(&v) {
                self.correlation.ttl = d;
            }
        }
        if let Ok(v) = env::var("REVERSER_WORKER_MAX_BATCH") {
            if let Ok(n) = v.parse() {
                self.worker.max_batch = n;
            }
        }
        if let Ok(v) = env::var("REVERSER_WORKER_FLUSH_INTERVAL") {
            if let Ok(d) = humantime::parse_duration(&v) {
                self.worker.flush_interval = d;
            }
        }
        if let Ok(v) = env::var("REVERSER_WORKER_MAX_RETRIES") {
            if let Ok(n) = v.parse() {
                self.worker.max_retries = n;
            }
        }
        if let Ok(v) = env::var("REVERSER_RECONCILER_INTERVAL") {
            if let Ok(d) = humantime::parse_duration(&v) {
                self.reconciler.reconcile_interval = d;
            }
        }
        if let Ok(v) = env::var("REVERSER_GIT_AUTHOR_NAME") {
            self.git.author_name = v;
        }
        if let Ok(v) = env::var("REVERSER_GIT_AUTHOR_EMAIL") {
            self.git.author_email = v;
        }
        if let Ok(v) = env::var("REVERSER_SERVER_BIND_ADDR") {
            self.server.bind_addr = v;
        }
    }

    fn validate(&self) -> Result<()> {
        if self.correlation.capacity == 0 {
            bail!("correlation.capacity must be greater than 0");
        }
        if self.correlation.ttl.is_zero() {
            bail!("correlation.ttl must be greater than 0");
        }
        if self.worker.max_batch == 0 {
            bail!("worker.max_batch must be greater than 0");
        }
        if self.worker.max_retries == 0 {
            bail!("worker.max_retries must be greater than 0");
        }
        if self.worker.mailbox_capacity == 0 {
            bail!("worker.mailbox_capacity must be greater than 0");
        }
        if self.git.author_email.is_empty() {
            bail!("git.author_email must not be empty");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn missing_file_yields_defaults() {
        let td = tempdir().expect("tempdir");
        let path = td.path().join(".reverser.toml");
        let config = ReverserConfig::load(&path).expect("load");
        assert_eq!(config.worker.max_batch, 100);
        assert_eq!(config.correlation.capacity, 10_000);
    }

    #[test]
    fn parses_partial_toml_with_defaults_for_rest() {
        let td = tempdir().expect("tempdir");
        let path = td.path().join(".reverser.toml");
        std::fs::write(
            &path,
            r#"
            [worker]
            max_batch = 50
            "#,
        )
        .expect("write");

        let config = ReverserConfig::load(&path).expect("load");
        assert_eq!(config.worker.max_batch, 50);
        assert_eq!(config.worker.max_retries, 8);
    }

    #[test]
    fn rejects_zero_max_batch() {
        let td = tempdir().expect("tempdir");
        let path = td.path().join(".reverser.toml");
        std::fs::write(&path, "[worker]\nmax_batch = 0\n").expect("write");

        assert!(ReverserConfig::load(&path).is_err());
    }

    #[test]
    fn env_override_wins_over_file() {
        let td = tempdir().expect("tempdir");
        let path = td.path().join(".reverser.toml");
        std::fs::write(&path, "[worker]\nmax_batch = 50\n").expect("write");

        unsafe {
            env::set_var("REVERSER_WORKER_MAX_BATCH", "77");
        }
        let config = ReverserConfig::load(&path).expect("load");
        unsafe {
            env::remove_var("REVERSER_WORKER_MAX_BATCH");
        }

        assert_eq!(config.worker.max_batch, 77);
    }
}
