//! Agent configuration

use anyhow::{Context, Result};
use serde::Deserialize;
use stats_lib::EngineConfig;
use std::path::PathBuf;
use std::time::Duration;

/// Agent configuration, read from `STATS_AGENT_*` environment variables
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// API server port for health, metrics and queries
    pub api_port: u16,

    /// Cluster the instance belongs to
    pub cluster: String,

    /// Identity of this container instance
    pub container_instance: String,

    /// Root of the cgroup v2 unified hierarchy
    pub cgroup_root: PathBuf,

    /// Task manifest written by the task-management subsystem
    pub task_manifest_path: PathBuf,

    /// How often the task manifest is re-read
    pub manifest_refresh_secs: u64,

    /// cgroup read interval per container
    pub poll_interval_ms: u64,

    /// Container discovery interval
    pub discovery_interval_secs: u64,

    /// Track containers for health only
    pub disable_metrics: bool,

    /// Publish interval; 0 disables publishing
    pub publish_interval_secs: u64,

    pub telemetry_channel_capacity: usize,
    pub health_channel_capacity: usize,
    pub window_capacity: usize,
    pub inactivity_timeout_secs: u64,
    pub volume_metrics_timeout_secs: u64,
    pub volume_source_prefix: String,

    /// Retry interval for started containers missing from the manifest
    pub unresolved_retry_secs: u64,
}

impl Default for AgentConfig {
    fn default() -> Self {
        let engine = EngineConfig::default();
        Self {
            api_port: 8080,
            cluster: "default".to_string(),
            container_instance: std::env::var("HOSTNAME").unwrap_or_else(|_| "unknown".to_string()),
            cgroup_root: PathBuf::from("/sys/fs/cgroup"),
            task_manifest_path: PathBuf::from("/var/lib/stats-agent/tasks.json"),
            manifest_refresh_secs: 10,
            poll_interval_ms: 1000,
            discovery_interval_secs: 5,
            disable_metrics: engine.disable_metrics,
            publish_interval_secs: engine.publish_interval.map_or(0, |i| i.as_secs()),
            telemetry_channel_capacity: engine.telemetry_channel_capacity,
            health_channel_capacity: engine.health_channel_capacity,
            window_capacity: engine.window_capacity,
            inactivity_timeout_secs: engine.inactivity_timeout.as_secs(),
            volume_metrics_timeout_secs: engine.volume_metrics_timeout.as_secs(),
            volume_source_prefix: engine.volume_source_prefix,
            unresolved_retry_secs: engine.unresolved_retry_interval.as_secs(),
        }
    }
}

impl AgentConfig {
    /// Load configuration from the environment
    pub fn load() -> Result<Self> {
        let config = config::Config::builder()
            .add_source(config::Environment::with_prefix("STATS_AGENT").try_parsing(true))
            .build()?;

        Self::from_config(config)
    }

    fn from_config(config: config::Config) -> Result<Self> {
        config
            .try_deserialize()
            .context("Invalid stats agent configuration")
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }

    pub fn discovery_interval(&self) -> Duration {
        Duration::from_secs(self.discovery_interval_secs.max(1))
    }

    pub fn manifest_refresh_interval(&self) -> Duration {
        Duration::from_secs(self.manifest_refresh_secs.max(1))
    }

    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            disable_metrics: self.disable_metrics,
            publish_interval: (self.publish_interval_secs > 0)
                .then(|| Duration::from_secs(self.publish_interval_secs)),
            telemetry_channel_capacity: self.telemetry_channel_capacity,
            health_channel_capacity: self.health_channel_capacity,
            window_capacity: self.window_capacity,
            inactivity_timeout: Duration::from_secs(self.inactivity_timeout_secs),
            volume_metrics_timeout: Duration::from_secs(self.volume_metrics_timeout_secs),
            volume_source_prefix: self.volume_source_prefix.clone(),
            unresolved_retry_interval: Duration::from_secs(self.unresolved_retry_secs.max(1)),
            cluster: self.cluster.clone(),
            container_instance: self.container_instance.clone(),
        }
    }
}
