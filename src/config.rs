//! Node Configuration
//!
//! Both roles read an optional TOML file; every key has a default and command-line
//! flags override what the file says.

use anyhow::{Context, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinatorConfig {
    pub bind: SocketAddr,
    pub store_dir: PathBuf,
    pub idle_seconds: u64,
    /// Final job reports kept for status queries.
    pub finished_jobs_retained: usize,
    pub install_builtin_modules: bool,
    /// Bearer token -> permission patterns. Empty grants everything to everyone.
    pub tokens: HashMap<String, Vec<String>>,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            bind: SocketAddr::from(([127, 0, 0, 1], 7070)),
            store_dir: PathBuf::from("code-store"),
            idle_seconds: crate::coordinator::DEFAULT_IDLE_SECONDS,
            finished_jobs_retained: crate::coordinator::DEFAULT_FINISHED_CAPACITY,
            install_builtin_modules: true,
            tokens: HashMap::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    pub coordinator_url: String,
    pub token: Option<String>,
    /// Number of execution slots.
    pub concurrency: usize,
    /// Wait used when the coordinator hands out nothing, not even an idle instruction.
    pub idle_seconds: u64,
    pub artifact_cache_capacity: usize,
    pub worker_cache_capacity: usize,
    pub reconnect_initial_ms: u64,
    pub reconnect_max_ms: u64,
    pub request_timeout_ms: u64,
    pub request_attempts: usize,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            coordinator_url: "http://127.0.0.1:7070".to_string(),
            token: None,
            concurrency: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4),
            idle_seconds: 5,
            artifact_cache_capacity: 64,
            worker_cache_capacity: 5,
            reconnect_initial_ms: 150,
            reconnect_max_ms: 5_000,
            request_timeout_ms: 5_000,
            request_attempts: 3,
        }
    }
}

impl WorkerConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

/// Reads `path` as TOML, or returns the defaults when no file is given.
pub fn load<T: DeserializeOwned + Default>(path: Option<&Path>) -> Result<T> {
    let Some(path) = path else {
        return Ok(T::default());
    };

    let text = std::fs::read_to_string(path)
        .with_context(|| format!("reading config file {}", path.display()))?;
    toml::from_str(&text).with_context(|| format!("parsing config file {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_file_keeps_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("worker.toml");
        std::fs::write(&path, "concurrency = 2\ntoken = \"w\"\n").unwrap();

        let config: WorkerConfig = load(Some(&path)).unwrap();

        assert_eq!(config.concurrency, 2);
        assert_eq!(config.token.as_deref(), Some("w"));
        assert_eq!(config.worker_cache_capacity, 5);
    }

    #[test]
    fn test_coordinator_tokens_table() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("coordinator.toml");
        std::fs::write(
            &path,
            "bind = \"0.0.0.0:9000\"\n[tokens]\nadmin = [\"*\"]\nworker = [\"worker\"]\n",
        )
        .unwrap();

        let config: CoordinatorConfig = load(Some(&path)).unwrap();

        assert_eq!(config.bind.port(), 9000);
        assert_eq!(config.tokens["worker"], vec!["worker".to_string()]);
        assert_eq!(config.idle_seconds, 10);
        assert_eq!(config.finished_jobs_retained, 1024);
    }

    #[test]
    fn test_missing_file_is_an_error() {
        let result: Result<WorkerConfig> = load(Some(Path::new("/definitely/not/here.toml")));
        assert!(result.is_err());
    }
}
