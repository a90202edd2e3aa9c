//! Per-container collection routine
//!
//! A [`Tracker`] owns the [`StatsQueue`] of one container and, once started,
//! a background task that drains the runtime stats stream into it. Health is
//! not collected here; it is resolved on demand at publish time.

use super::queue::StatsQueue;
use crate::error::StatsError;
use crate::models::{ContainerHealth, ContainerMetadata, ContainerMetrics, HealthStatus, RawStats};
use crate::observability::EngineMetrics;
use crate::resolver::MetadataResolver;
use crate::runtime::RuntimeStatsSource;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

/// Collection state for one container
pub struct Tracker {
    container_id: String,
    task_arn: String,
    metadata: ContainerMetadata,
    queue: Arc<StatsQueue>,
    source: Arc<dyn RuntimeStatsSource>,
    inactivity_timeout: Duration,
    cancel: CancellationToken,
    handle: Mutex<Option<JoinHandle<()>>>,
    metrics: EngineMetrics,
}

impl std::fmt::Debug for Tracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tracker")
            .field("container_id", &self.container_id)
            .field("task_arn", &self.task_arn)
            .field("cancelled", &self.cancel.is_cancelled())
            .finish_non_exhaustive()
    }
}

impl Tracker {
    /// Create an idle tracker
    ///
    /// The routine is bound to a child of `parent`, so cancelling the engine
    /// stops it as well.
    pub fn new(
        task_arn: impl Into<String>,
        metadata: ContainerMetadata,
        source: Arc<dyn RuntimeStatsSource>,
        window_capacity: usize,
        inactivity_timeout: Duration,
        parent: &CancellationToken,
        metrics: EngineMetrics,
    ) -> Self {
        Self {
            container_id: metadata.runtime_id.clone(),
            task_arn: task_arn.into(),
            metadata,
            queue: Arc::new(StatsQueue::new(window_capacity)),
            source,
            inactivity_timeout,
            cancel: parent.child_token(),
            handle: Mutex::new(None),
            metrics,
        }
    }

    pub fn container_id(&self) -> &str {
        &self.container_id
    }

    pub fn task_arn(&self) -> &str {
        &self.task_arn
    }

    pub fn queue(&self) -> &StatsQueue {
        &self.queue
    }

    /// Start the collection routine; no-op if already started or stopped
    pub fn start(&self) {
        let mut handle = self.handle.lock().unwrap_or_else(PoisonError::into_inner);
        if handle.is_some() || self.cancel.is_cancelled() {
            return;
        }

        *handle = Some(tokio::spawn(collect(
            self.container_id.clone(),
            self.source.clone(),
            self.queue.clone(),
            self.inactivity_timeout,
            self.cancel.clone(),
            self.metrics.clone(),
        )));
    }

    /// Cancel the collection routine
    ///
    /// Safe to call any number of times, and on a tracker that never started.
    pub fn stop(&self) {
        self.cancel.cancel();
        let handle = self
            .handle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if handle.is_some() {
            debug!(container_id = %self.container_id, "Stopped stats collection");
        }
    }

    /// True while the collection routine is alive
    pub fn is_running(&self) -> bool {
        self.handle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(|h| !h.is_finished())
    }

    pub fn container_metrics(&self) -> ContainerMetrics {
        self.queue.container_metrics(&self.metadata.name)
    }

    /// Aggregate and start a fresh interval
    pub fn drain_metrics(&self) -> ContainerMetrics {
        self.queue.drain_metrics(&self.metadata.name)
    }

    pub fn last_raw_sample(&self) -> Option<RawStats> {
        self.queue.last_raw_sample()
    }

    /// Resolve the container's current health
    ///
    /// Never fabricates a status: a container that cannot be resolved, or
    /// that stopped while having a health check, reports unknown.
    pub fn health(&self, resolver: &dyn MetadataResolver) -> ContainerHealth {
        let container = match resolver.resolve_container(&self.container_id) {
            Ok(container) => container,
            Err(e) => {
                debug!(container_id = %self.container_id, error = %e, "Unable to resolve container health");
                return ContainerHealth {
                    container_name: self.metadata.name.clone(),
                    health_status: HealthStatus::Unknown,
                    status_since: None,
                };
            }
        };

        let (health_status, status_since) = match container.health_check {
            None => (HealthStatus::Healthy, None),
            Some(_) if container.known_status.is_terminal() => (HealthStatus::Unknown, None),
            Some(_) => (container.health.status, container.health.since),
        };

        ContainerHealth {
            container_name: container.name,
            health_status,
            status_since,
        }
    }
}

impl Drop for Tracker {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Drain the stats stream of one container into its queue
///
/// The subscription lives on this task's stack, so it is released on every
/// exit path: cancellation, stream end, stream error or inactivity.
async fn collect(
    container_id: String,
    source: Arc<dyn RuntimeStatsSource>,
    queue: Arc<StatsQueue>,
    inactivity_timeout: Duration,
    cancel: CancellationToken,
    metrics: EngineMetrics,
) {
    let subscribed = tokio::select! {
        _ = cancel.cancelled() => return,
        result = source.stream_stats(&container_id, inactivity_timeout) => result,
    };

    let mut stream = match subscribed {
        Ok(stream) => stream,
        Err(source) => {
            let err = StatsError::StreamEstablish {
                container_id: container_id.clone(),
                source,
            };
            warn!(container_id = %container_id, error = %err, "Stats collection not started");
            metrics.inc_stream_failures();
            return;
        }
    };

    debug!(container_id = %container_id, "Stats collection started");

    loop {
        let next = tokio::select! {
            _ = cancel.cancelled() => break,
            next = tokio::time::timeout(inactivity_timeout, stream.next()) => next,
        };

        match next {
            Ok(Some(Ok(raw))) => {
                let read = raw.read;
                if queue.ingest(raw) {
                    trace!(container_id = %container_id, read = %read, "Received stats sample");
                } else {
                    debug!(container_id = %container_id, read = %read, "Discarding out-of-order stats sample");
                }
            }
            Ok(Some(Err(e))) => {
                debug!(container_id = %container_id, error = %e, "Stats stream failed");
                break;
            }
            Ok(None) => {
                debug!(container_id = %container_id, "Stats stream closed");
                break;
            }
            Err(_) => {
                debug!(
                    container_id = %container_id,
                    timeout_secs = inactivity_timeout.as_secs(),
                    "No stats received within inactivity timeout"
                );
                break;
            }
        }
    }

    debug!(container_id = %container_id, "Stats collection finished");
}
