//! Engine configuration loader for Orchid.
//!
//! Reads `orchid.toml` from the data directory and deserializes it into
//! [`EngineConfig`]. Falls back to sensible defaults when the file is
//! missing or malformed. Partial files are fine: every field carries a
//! serde default.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Tunable engine limits and intervals.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Engine-wide cap on concurrently processing workflows.
    #[serde(default = "default_max_concurrent_workflows")]
    pub max_concurrent_workflows: usize,
    /// Step timeout applied when a step does not set its own.
    #[serde(default = "default_step_timeout_ms")]
    pub default_step_timeout_ms: u64,
    /// Fixed worker pool size for batch mode.
    #[serde(default = "default_batch_workers")]
    pub batch_workers: usize,
    /// How batch work is assigned to workers.
    #[serde(default)]
    pub router_strategy: RouterStrategy,
    /// How long `stop()` waits for active workflows to drain.
    #[serde(default = "default_shutdown_grace_ms")]
    pub shutdown_grace_ms: u64,
    /// Interval between health-monitor heartbeats.
    #[serde(default = "default_health_interval_ms")]
    pub health_interval_ms: u64,
    /// Event bus channel capacity.
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,
}

fn default_max_concurrent_workflows() -> usize {
    8
}

fn default_step_timeout_ms() -> u64 {
    30_000
}

fn default_batch_workers() -> usize {
    4
}

fn default_shutdown_grace_ms() -> u64 {
    5_000
}

fn default_health_interval_ms() -> u64 {
    30_000
}

fn default_event_capacity() -> usize {
    1024
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_concurrent_workflows: default_max_concurrent_workflows(),
            default_step_timeout_ms: default_step_timeout_ms(),
            batch_workers: default_batch_workers(),
            router_strategy: RouterStrategy::default(),
            shutdown_grace_ms: default_shutdown_grace_ms(),
            health_interval_ms: default_health_interval_ms(),
            event_capacity: default_event_capacity(),
        }
    }
}

impl EngineConfig {
    pub fn default_step_timeout(&self) -> Duration {
        Duration::from_millis(self.default_step_timeout_ms)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }

    pub fn health_interval(&self) -> Duration {
        Duration::from_millis(self.health_interval_ms)
    }
}

/// Strategy the batch worker router uses to assign steps to workers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RouterStrategy {
    /// Cycle through workers in index order.
    #[default]
    RoundRobin,
    /// Pick the worker with the fewest in-flight assignments.
    LeastLoaded,
}

impl RouterStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RoundRobin => "round_robin",
            Self::LeastLoaded => "least_loaded",
        }
    }
}

/// Load engine configuration from `{data_dir}/orchid.toml`.
///
/// - If the file does not exist, returns [`EngineConfig::default()`].
/// - If the file exists but fails to parse, logs a warning and returns the
///   default.
/// - If the file exists and parses successfully, returns the parsed config
///   with serde defaults filling any absent fields.
pub async fn load_engine_config(data_dir: &Path) -> EngineConfig {
    let config_path = data_dir.join("orchid.toml");

    let content = match tokio::fs::read_to_string(&config_path).await {
        Ok(content) => content,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            tracing::debug!("No orchid.toml found at {}, using defaults", config_path.display());
            return EngineConfig::default();
        }
        Err(err) => {
            tracing::warn!("Failed to read {}: {err}, using defaults", config_path.display());
            return EngineConfig::default();
        }
    };

    match toml::from_str::<EngineConfig>(&content) {
        Ok(config) => config,
        Err(err) => {
            tracing::warn!(
                "Failed to parse {}: {err}, using defaults",
                config_path.display()
            );
            EngineConfig::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn load_engine_config_missing_file_returns_default() {
        let tmp = TempDir::new().unwrap();
        let config = load_engine_config(tmp.path()).await;
        assert_eq!(config.max_concurrent_workflows, 8);
        assert_eq!(config.default_step_timeout_ms, 30_000);
        assert_eq!(config.router_strategy, RouterStrategy::RoundRobin);
    }

    #[tokio::test]
    async fn load_engine_config_valid_toml_returns_parsed() {
        let tmp = TempDir::new().unwrap();
        let config_path = tmp.path().join("orchid.toml");
        tokio::fs::write(
            &config_path,
            r#"
max_concurrent_workflows = 16
default_step_timeout_ms = 10000
batch_workers = 2
router_strategy = "least_loaded"
shutdown_grace_ms = 2000
health_interval_ms = 60000
event_capacity = 256
"#,
        )
        .await
        .unwrap();

        let config = load_engine_config(tmp.path()).await;
        assert_eq!(config.max_concurrent_workflows, 16);
        assert_eq!(config.batch_workers, 2);
        assert_eq!(config.router_strategy, RouterStrategy::LeastLoaded);
        assert_eq!(config.event_capacity, 256);
    }

    #[tokio::test]
    async fn load_engine_config_invalid_toml_returns_default() {
        let tmp = TempDir::new().unwrap();
        let config_path = tmp.path().join("orchid.toml");
        tokio::fs::write(&config_path, "this is not { valid toml !!!")
            .await
            .unwrap();

        let config = load_engine_config(tmp.path()).await;
        assert_eq!(config.max_concurrent_workflows, 8);
        assert_eq!(config.shutdown_grace_ms, 5_000);
    }

    #[tokio::test]
    async fn load_engine_config_partial_file_fills_defaults() {
        let tmp = TempDir::new().unwrap();
        let config_path = tmp.path().join("orchid.toml");
        tokio::fs::write(&config_path, "batch_workers = 6\n").await.unwrap();

        let config = load_engine_config(tmp.path()).await;
        assert_eq!(config.batch_workers, 6);
        // Everything else falls back to the serde defaults.
        assert_eq!(config.max_concurrent_workflows, 8);
        assert_eq!(config.health_interval_ms, 30_000);
    }

    #[test]
    fn test_duration_helpers() {
        let config = EngineConfig::default();
        assert_eq!(config.default_step_timeout(), Duration::from_secs(30));
        assert_eq!(config.shutdown_grace(), Duration::from_secs(5));
        assert_eq!(config.health_interval(), Duration::from_secs(30));
    }
}
