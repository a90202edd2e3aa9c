//! Container stats and telemetry engine
//!
//! This crate provides the core functionality for:
//! - Tracking the containers of each task on the host
//! - Collecting per-container resource samples into bounded windows
//! - Publishing per-task telemetry and health messages with backpressure
//! - Reconciling tracking state with the container runtime after a restart

pub mod engine;
pub mod error;
pub mod health;
pub mod models;
pub mod observability;
pub mod resolver;
pub mod runtime;
pub mod stats;
pub mod volume;

pub use engine::{
    AddOutcome, ContainerStats, EngineConfig, EngineReceivers, EngineState, StatsEngine,
    StatsEngineBuilder,
};
pub use error::{Result, StatsError};
pub use health::{
    ComponentHealth, ComponentStatus, HealthRegistry, HealthResponse, ReadinessResponse,
};
pub use models::*;
pub use observability::{EngineMetrics, StructuredLogger};
pub use resolver::{ManifestResolver, MetadataResolver};
pub use runtime::{CgroupStatsSource, RuntimeStatsSource, StatsStream};
pub use volume::{VolumeMetricsClient, VolumeUsage};
