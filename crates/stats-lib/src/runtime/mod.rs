//! Container runtime statistics sources
//!
//! The engine subscribes to one stream of raw samples per container and
//! lists running containers during reconciliation. [`CgroupStatsSource`]
//! reads both from the cgroup v2 unified hierarchy.

mod cgroup;

pub use cgroup::{CgroupStatsSource, DEFAULT_POLL_INTERVAL};

use crate::models::RawStats;
use anyhow::Result;
use std::pin::Pin;
use std::time::Duration;
use tokio_stream::Stream;

pub use async_trait::async_trait;

/// Stream of raw samples for one container
pub type StatsStream = Pin<Box<dyn Stream<Item = Result<RawStats>> + Send>>;

/// Trait for runtime statistics implementations
#[async_trait]
pub trait RuntimeStatsSource: Send + Sync {
    /// Subscribe to raw samples for a container
    ///
    /// The stream ends when the container goes away or no sample arrives
    /// within `inactivity_timeout`. Dropping the stream releases the
    /// subscription.
    async fn stream_stats(
        &self,
        container_id: &str,
        inactivity_timeout: Duration,
    ) -> Result<StatsStream>;

    /// List the ids of all containers currently present
    async fn list_running_containers(&self) -> Result<Vec<String>>;
}
