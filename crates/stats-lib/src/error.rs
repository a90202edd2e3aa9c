//! Error types for the stats engine
//!
//! None of these are fatal to the agent. Each variant documents what the
//! engine does when it sees one.

use thiserror::Error;

/// Errors surfaced by the stats engine and its collaborators
#[derive(Debug, Error)]
pub enum StatsError {
    /// Container or task could not be resolved; that single entry is skipped
    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    /// No task currently has a resource-tracked container
    #[error("no task metrics to report")]
    EmptyMetrics,

    /// No task currently has a health-tracked container
    #[error("no task health metrics to report")]
    EmptyHealthMetrics,

    /// Task definition identity is missing from the cache; the task is excluded
    #[error("task definition not found for task {task_arn}")]
    StaleTaskDefinition { task_arn: String },

    /// Metrics for one volume could not be fetched; that volume is omitted
    #[error("unable to fetch metrics for volume {volume_id} of task {task_arn}: {reason}")]
    VolumeMetrics {
        volume_id: String,
        task_arn: String,
        reason: String,
    },

    /// Stats subscription could not be established; the tracker stays idle
    #[error("unable to open stats stream for container {container_id}: {source}")]
    StreamEstablish {
        container_id: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("engine already started")]
    AlreadyStarted,

    #[error(transparent)]
    Runtime(#[from] anyhow::Error),
}

impl StatsError {
    pub fn container_not_found(id: impl Into<String>) -> Self {
        StatsError::NotFound {
            kind: "container",
            id: id.into(),
        }
    }

    pub fn task_not_found(id: impl Into<String>) -> Self {
        StatsError::NotFound {
            kind: "task",
            id: id.into(),
        }
    }

    /// Returns true for the resolution failure kind
    pub fn is_not_found(&self) -> bool {
        matches!(self, StatsError::NotFound { .. })
    }
}

pub type Result<T> = std::result::Result<T, StatsError>;
