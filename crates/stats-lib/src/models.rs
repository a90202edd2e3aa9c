//! Core data models for the stats engine
//!
//! Tasks and container metadata are owned by the surrounding task-management
//! subsystem and only read here. Samples, statistic sets and the outbound
//! messages are produced by the engine itself.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle status of a task as last known by the agent
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TaskStatus {
    #[default]
    Created,
    Running,
    Stopped,
}

impl TaskStatus {
    /// Returns true once the task can no longer run containers
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Stopped)
    }
}

/// Lifecycle status of a single container
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ContainerStatus {
    #[default]
    Created,
    Running,
    Stopped,
}

impl ContainerStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ContainerStatus::Stopped)
    }
}

/// Health status reported for a container
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HealthStatus {
    #[default]
    Unknown,
    Healthy,
    Unhealthy,
}

/// Mechanism used to evaluate a container's health
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthCheckType {
    /// Health check executed by the container runtime
    Docker,
}

/// Last health result reported by the runtime
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ContainerHealthState {
    pub status: HealthStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub since: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
}

/// Container metadata resolved from the task-management subsystem
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ContainerMetadata {
    /// Runtime identifier of the container
    pub runtime_id: String,
    /// Container name from the task definition
    pub name: String,
    #[serde(default)]
    pub known_status: ContainerStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub health_check: Option<HealthCheckType>,
    #[serde(default)]
    pub health: ContainerHealthState,
}

/// A volume attached to a task
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskVolume {
    pub name: String,
    #[serde(flatten)]
    pub kind: VolumeKind,
}

/// Backing type of a task volume
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum VolumeKind {
    /// Network-backed block volume attached to the instance for this task
    NetworkBlock {
        volume_id: String,
        volume_name: String,
        /// Host path of the mount, relative to the volume source prefix
        source_volume_host_path: String,
    },
    /// Bind mount from the host filesystem
    Host { source_path: String },
    /// Runtime-managed volume
    Local,
}

/// A task (group of co-scheduled containers)
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub arn: String,
    pub family: String,
    pub version: String,
    /// Runtime network mode; empty means the runtime default (bridge)
    #[serde(default)]
    pub network_mode: String,
    /// Name of the service-connect proxy container, when the task has one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_connect_container: Option<String>,
    #[serde(default)]
    pub containers: Vec<ContainerMetadata>,
    #[serde(default)]
    pub volumes: Vec<TaskVolume>,
    #[serde(default)]
    pub known_status: TaskStatus,
}

impl Task {
    pub fn is_bridge_network(&self) -> bool {
        matches!(self.network_mode.as_str(), "" | "bridge" | "default")
    }

    /// Whether per-container network sets belong in this task's telemetry
    ///
    /// A bridge-mode task with a service-connect container routes its
    /// traffic through that proxy, and its containers report no network set.
    pub fn reports_container_network_stats(&self) -> bool {
        !(self.service_connect_container.is_some() && self.is_bridge_network())
    }
}

/// Cumulative network counters as reported by the runtime
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct NetworkCounters {
    pub rx_bytes: u64,
    pub tx_bytes: u64,
    pub rx_packets: u64,
    pub tx_packets: u64,
}

/// One raw observation of a container from the runtime stats stream
///
/// CPU and memory are instantaneous; storage and network are cumulative
/// counters and must be diffed against the previous observation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawStats {
    pub read: DateTime<Utc>,
    pub cpu_usage_percent: f64,
    pub memory_usage_bytes: u64,
    pub storage_read_bytes: u64,
    pub storage_write_bytes: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub network: Option<NetworkCounters>,
}

/// Aggregated statistic set over a window of samples
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct StatsSet {
    pub min: f64,
    pub max: f64,
    pub sum: f64,
    pub count: u64,
}

impl StatsSet {
    /// A set describing exactly one observation
    pub fn single(value: f64) -> Self {
        Self {
            min: value,
            max: value,
            sum: value,
            count: 1,
        }
    }
}

/// Storage statistics for one container
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct StorageStatsSet {
    pub read_size_bytes: StatsSet,
    pub write_size_bytes: StatsSet,
}

/// Network statistics for one container
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct NetworkStatsSet {
    pub rx_bytes: StatsSet,
    pub tx_bytes: StatsSet,
    pub rx_packets: StatsSet,
    pub tx_packets: StatsSet,
}

/// Aggregated metrics for one container
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContainerMetrics {
    pub container_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cpu: Option<StatsSet>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub memory: Option<StatsSet>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub storage: Option<StorageStatsSet>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub network: Option<NetworkStatsSet>,
}

impl ContainerMetrics {
    /// Returns true when no stream produced any data
    pub fn is_empty(&self) -> bool {
        self.cpu.is_none() && self.memory.is_none() && self.storage.is_none() && self.network.is_none()
    }
}

/// Utilization of one network-backed volume
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VolumeMetric {
    pub volume_id: String,
    pub volume_name: String,
    pub utilized: StatsSet,
    pub size: StatsSet,
}

/// Per-task telemetry entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskMetrics {
    pub task_arn: String,
    pub task_definition_family: String,
    pub task_definition_version: String,
    pub container_metrics: Vec<ContainerMetrics>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub volume_metrics: Vec<VolumeMetric>,
}

/// Health of one container at publish time
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContainerHealth {
    pub container_name: String,
    pub health_status: HealthStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status_since: Option<DateTime<Utc>>,
}

/// Per-task health entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskHealth {
    pub task_arn: String,
    pub task_definition_family: String,
    pub task_definition_version: String,
    pub containers: Vec<ContainerHealth>,
}

/// Instance identity and framing attached to every outbound message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricsMetadata {
    pub cluster: String,
    pub container_instance: String,
    /// True when the message carries no task entries
    pub idle: bool,
    /// Every tick produces a single, complete message
    pub fin: bool,
    pub timestamp: DateTime<Utc>,
}

/// Telemetry snapshot for one publish tick
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetryMessage {
    pub metadata: MetricsMetadata,
    pub task_metrics: Vec<TaskMetrics>,
}

/// Health snapshot for one publish tick
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthMessage {
    pub metadata: MetricsMetadata,
    pub health_metrics: Vec<TaskHealth>,
}

/// Container lifecycle events fed to the engine
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContainerEvent {
    /// A container was observed running
    Started(String),
    /// A container was removed
    Stopped(String),
}
