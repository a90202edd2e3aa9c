//! Stats engine
//!
//! Owns the task index, one tracker per container, and the publish loop that
//! turns tracker windows into telemetry and health messages. Container add
//! and remove calls, the collection routines and the publish loop all run
//! concurrently against the same index.

mod publish;

use crate::error::{Result, StatsError};
use crate::health::{components, HealthRegistry};
use crate::models::{
    ContainerEvent, ContainerHealth, ContainerMetrics, HealthMessage, MetricsMetadata, RawStats,
    TaskHealth, TaskMetrics, TelemetryMessage,
};
use crate::observability::{EngineMetrics, StructuredLogger};
use crate::resolver::MetadataResolver;
use crate::runtime::RuntimeStatsSource;
use crate::stats::{TaskIndex, TaskSnapshot, Tracker, TrackingKind, DEFAULT_WINDOW_CAPACITY};
use crate::volume::{VolumeMetricsClient, VolumeMetricsFetcher, DEFAULT_VOLUME_SOURCE_PREFIX};
use serde::Serialize;
use std::collections::HashSet;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Configuration for the stats engine
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Track containers for health only, never collecting resource stats
    pub disable_metrics: bool,
    /// Interval between publish ticks; `None` disables publishing
    pub publish_interval: Option<Duration>,
    pub telemetry_channel_capacity: usize,
    pub health_channel_capacity: usize,
    /// Samples kept per metric stream and container
    pub window_capacity: usize,
    /// How long a stats stream may stay silent before collection ends
    pub inactivity_timeout: Duration,
    /// Deadline of a single volume metrics query
    pub volume_metrics_timeout: Duration,
    /// Host prefix of network-backed volume mounts
    pub volume_source_prefix: String,
    /// How often started containers the resolver did not know yet are retried
    pub unresolved_retry_interval: Duration,
    pub cluster: String,
    pub container_instance: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            disable_metrics: false,
            publish_interval: Some(Duration::from_secs(20)),
            telemetry_channel_capacity: 10,
            health_channel_capacity: 10,
            window_capacity: DEFAULT_WINDOW_CAPACITY,
            inactivity_timeout: Duration::from_secs(60),
            volume_metrics_timeout: Duration::from_secs(5),
            volume_source_prefix: DEFAULT_VOLUME_SOURCE_PREFIX.to_string(),
            unresolved_retry_interval: Duration::from_secs(5),
            cluster: String::new(),
            container_instance: String::new(),
        }
    }
}

impl EngineConfig {
    pub fn validate(&self) -> Result<()> {
        if self.telemetry_channel_capacity == 0 || self.health_channel_capacity == 0 {
            return Err(StatsError::InvalidConfig(
                "channel capacities must be at least 1".to_string(),
            ));
        }
        if self.window_capacity == 0 {
            return Err(StatsError::InvalidConfig(
                "window capacity must be at least 1".to_string(),
            ));
        }
        if self.publish_interval.is_some_and(|i| i.is_zero()) {
            return Err(StatsError::InvalidConfig(
                "publish interval must be non-zero".to_string(),
            ));
        }
        if self.inactivity_timeout.is_zero() {
            return Err(StatsError::InvalidConfig(
                "inactivity timeout must be non-zero".to_string(),
            ));
        }
        if self.unresolved_retry_interval.is_zero() {
            return Err(StatsError::InvalidConfig(
                "unresolved retry interval must be non-zero".to_string(),
            ));
        }
        Ok(())
    }
}

/// Lifecycle of the engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineState {
    Uninitialized,
    Running,
    /// Terminal
    ShuttingDown,
}

/// Result of asking the engine to track a container
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddOutcome {
    Added(TrackingKind),
    AlreadyTracked,
    /// The owning task already stopped; nothing was tracked
    TaskTerminal,
}

/// Last raw sample and current aggregate of one container
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ContainerStats {
    pub task_arn: String,
    pub container_id: String,
    pub last_sample: RawStats,
    pub metrics: ContainerMetrics,
}

/// Receiving ends of the engine's output channels
#[derive(Debug)]
pub struct EngineReceivers {
    pub telemetry: mpsc::Receiver<TelemetryMessage>,
    pub health: mpsc::Receiver<HealthMessage>,
}

/// Builder for [`StatsEngine`]
#[derive(Default)]
pub struct StatsEngineBuilder {
    config: EngineConfig,
    runtime: Option<Arc<dyn RuntimeStatsSource>>,
    resolver: Option<Arc<dyn MetadataResolver>>,
    volume_client: Option<Arc<dyn VolumeMetricsClient>>,
    health: Option<HealthRegistry>,
}

impl StatsEngineBuilder {
    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn runtime(mut self, runtime: Arc<dyn RuntimeStatsSource>) -> Self {
        self.runtime = Some(runtime);
        self
    }

    pub fn resolver(mut self, resolver: Arc<dyn MetadataResolver>) -> Self {
        self.resolver = Some(resolver);
        self
    }

    pub fn volume_client(mut self, client: Arc<dyn VolumeMetricsClient>) -> Self {
        self.volume_client = Some(client);
        self
    }

    /// Share a health registry with the caller; a private one is used otherwise
    pub fn health_registry(mut self, health: HealthRegistry) -> Self {
        self.health = Some(health);
        self
    }

    pub fn build(self) -> Result<(Arc<StatsEngine>, EngineReceivers)> {
        self.config.validate()?;
        let runtime = self
            .runtime
            .ok_or_else(|| StatsError::InvalidConfig("runtime stats source is required".to_string()))?;
        let resolver = self
            .resolver
            .ok_or_else(|| StatsError::InvalidConfig("metadata resolver is required".to_string()))?;

        let (telemetry_tx, telemetry) = mpsc::channel(self.config.telemetry_channel_capacity);
        let (health_tx, health) = mpsc::channel(self.config.health_channel_capacity);

        let metrics = EngineMetrics::new();
        let volumes = VolumeMetricsFetcher::new(
            self.volume_client,
            self.config.volume_metrics_timeout,
            self.config.volume_source_prefix.clone(),
            metrics.clone(),
        );

        let engine = StatsEngine {
            logger: StructuredLogger::new(self.config.container_instance.clone()),
            config: self.config,
            runtime,
            resolver,
            volumes,
            index: TaskIndex::new(),
            telemetry_tx,
            health_tx,
            cancel: CancellationToken::new(),
            state: RwLock::new(EngineState::Uninitialized),
            health: self.health.unwrap_or_default(),
            metrics,
            publishing: Mutex::new(()),
        };

        Ok((Arc::new(engine), EngineReceivers { telemetry, health }))
    }
}

/// The stats and telemetry engine
pub struct StatsEngine {
    config: EngineConfig,
    runtime: Arc<dyn RuntimeStatsSource>,
    resolver: Arc<dyn MetadataResolver>,
    volumes: VolumeMetricsFetcher,
    index: TaskIndex,
    telemetry_tx: mpsc::Sender<TelemetryMessage>,
    health_tx: mpsc::Sender<HealthMessage>,
    cancel: CancellationToken,
    state: RwLock<EngineState>,
    health: HealthRegistry,
    metrics: EngineMetrics,
    logger: StructuredLogger,
    /// Held for the duration of one publish tick
    publishing: Mutex<()>,
}

impl StatsEngine {
    pub fn builder() -> StatsEngineBuilder {
        StatsEngineBuilder::default()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn state(&self) -> EngineState {
        *self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_state(&self, state: EngineState) {
        *self.state.write().unwrap_or_else(PoisonError::into_inner) = state;
    }

    pub fn health_registry(&self) -> &HealthRegistry {
        &self.health
    }

    /// Token cancelled when the engine shuts down
    pub fn shutdown_token(&self) -> CancellationToken {
        self.cancel.child_token()
    }

    /// (containers, tasks) currently tracked
    pub fn tracked_counts(&self) -> (usize, usize) {
        self.index.counts()
    }

    fn refresh_tracked_gauges(&self) {
        let (containers, tasks) = self.index.counts();
        self.metrics.set_tracked(containers, tasks);
    }

    /// Start tracking a container
    ///
    /// Resolution failures are returned and nothing is tracked. Adding a
    /// container that is already tracked is a no-op.
    pub fn add_container(&self, container_id: &str) -> Result<AddOutcome> {
        if self.index.contains(container_id) {
            return Ok(AddOutcome::AlreadyTracked);
        }

        let task = self
            .resolver
            .resolve_task(container_id)
            .inspect_err(|e| self.note_resolution_failure(e))?;
        if task.known_status.is_terminal() {
            debug!(container_id = %container_id, task_arn = %task.arn, "Task is terminal, not tracking container");
            return Ok(AddOutcome::TaskTerminal);
        }

        let mut metadata = self
            .resolver
            .resolve_container(container_id)
            .inspect_err(|e| self.note_resolution_failure(e))?;
        metadata.runtime_id = container_id.to_string();

        let kind = if self.config.disable_metrics {
            TrackingKind::HealthOnly
        } else {
            TrackingKind::Resource
        };
        let tracker = Arc::new(Tracker::new(
            task.arn.clone(),
            metadata,
            self.runtime.clone(),
            self.config.window_capacity,
            self.config.inactivity_timeout,
            &self.cancel,
            self.metrics.clone(),
        ));

        if !self.index.insert(&task, tracker.clone(), kind) {
            return Ok(AddOutcome::AlreadyTracked);
        }
        if kind == TrackingKind::Resource {
            tracker.start();
        }
        self.refresh_tracked_gauges();

        info!(
            container_id = %container_id,
            task_arn = %task.arn,
            kind = ?kind,
            "Tracking container"
        );
        Ok(AddOutcome::Added(kind))
    }

    fn note_resolution_failure(&self, err: &StatsError) {
        if err.is_not_found() {
            self.metrics.inc_resolution_failures();
        }
    }

    /// Stop tracking a container; returns false if it was not tracked
    pub fn remove_container(&self, container_id: &str) -> bool {
        let Some(tracker) = self.index.remove(container_id) else {
            debug!(container_id = %container_id, "Container not tracked, nothing to remove");
            return false;
        };

        tracker.stop();
        self.refresh_tracked_gauges();
        info!(container_id = %container_id, task_arn = %tracker.task_arn(), "Stopped tracking container");
        true
    }

    /// Stop every tracker
    pub fn remove_all(&self) {
        let trackers = self.index.drain();
        for tracker in &trackers {
            tracker.stop();
        }
        self.refresh_tracked_gauges();
        info!(containers = trackers.len(), "Stopped tracking all containers");
    }

    /// Rebuild tracking state from the containers the runtime reports
    ///
    /// Safe to run alongside live add events. Returns how many containers
    /// were newly tracked.
    pub async fn synchronize(&self) -> Result<usize> {
        let container_ids = match self.runtime.list_running_containers().await {
            Ok(ids) => ids,
            Err(e) => {
                self.health
                    .set_degraded(components::RUNTIME, format!("Failed to list containers: {:#}", e))
                    .await;
                return Err(StatsError::Runtime(e));
            }
        };
        self.health.set_healthy(components::RUNTIME).await;

        let listed = container_ids.len();
        let mut added = 0;
        for container_id in container_ids {
            match self.add_container(&container_id) {
                Ok(AddOutcome::Added(_)) => added += 1,
                Ok(_) => {}
                Err(e) => warn!(container_id = %container_id, error = %e, "Unable to track container"),
            }
        }

        info!(listed = listed, added = added, "Reconciled tracked containers with runtime");
        Ok(added)
    }

    /// Apply container lifecycle events until the engine shuts down or the
    /// sender goes away
    ///
    /// A started container the resolver does not know yet is kept pending and
    /// retried every `unresolved_retry_interval` until it resolves or stops.
    pub async fn run_events(&self, mut events: mpsc::Receiver<ContainerEvent>) {
        let mut pending: HashSet<String> = HashSet::new();
        let mut retry = interval(self.config.unresolved_retry_interval);
        retry.set_missed_tick_behavior(MissedTickBehavior::Skip);
        retry.reset();

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                event = events.recv() => match event {
                    Some(ContainerEvent::Started(container_id)) => {
                        if !self.track_started(&container_id) {
                            debug!(container_id = %container_id, "Container not resolvable yet, will retry");
                            pending.insert(container_id);
                        }
                    }
                    Some(ContainerEvent::Stopped(container_id)) => {
                        pending.remove(&container_id);
                        self.remove_container(&container_id);
                    }
                    None => break,
                },
                _ = retry.tick(), if !pending.is_empty() => {
                    pending.retain(|container_id| !self.track_started(container_id));
                }
            }
        }
        debug!(pending = pending.len(), "Container event listener stopped");
    }

    /// Try to track a started container; false when it should be retried
    fn track_started(&self, container_id: &str) -> bool {
        match self.add_container(container_id) {
            Ok(_) => true,
            Err(e) if e.is_not_found() => false,
            Err(e) => {
                warn!(container_id = %container_id, error = %e, "Unable to track started container");
                true
            }
        }
    }

    /// Start the engine: reconcile, then spawn the supervisor
    ///
    /// The supervisor runs the publish loop when an interval is configured
    /// and stops every tracker once the engine shuts down.
    pub async fn start(self: &Arc<Self>) -> Result<JoinHandle<()>> {
        {
            let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
            if *state != EngineState::Uninitialized {
                return Err(StatsError::AlreadyStarted);
            }
            *state = EngineState::Running;
        }

        for component in [components::ENGINE, components::PUBLISHER, components::RUNTIME] {
            self.health.register(component).await;
        }

        if let Err(e) = self.synchronize().await {
            warn!(error = %e, "Initial reconciliation failed");
        }
        self.health.set_ready(true).await;

        info!(
            publish_interval = ?self.config.publish_interval,
            disable_metrics = self.config.disable_metrics,
            "Stats engine running"
        );

        let engine = self.clone();
        Ok(tokio::spawn(async move { engine.supervise().await }))
    }

    async fn supervise(self: Arc<Self>) {
        match self.config.publish_interval {
            Some(every) => self.run_publish_loop(every).await,
            None => self.cancel.cancelled().await,
        }

        self.set_state(EngineState::ShuttingDown);
        self.remove_all();
        self.health.set_ready(false).await;
        self.health
            .set_unhealthy(components::ENGINE, "Stats engine shut down")
            .await;
        info!("Stats engine stopped");
    }

    /// Cancel the engine; the supervisor stops every tracker
    pub fn shutdown(&self) {
        if self.state() != EngineState::ShuttingDown {
            info!("Stats engine shutting down");
        }
        self.set_state(EngineState::ShuttingDown);
        self.cancel.cancel();
    }

    fn metadata(&self, idle: bool) -> MetricsMetadata {
        MetricsMetadata {
            cluster: self.config.cluster.clone(),
            container_instance: self.config.container_instance.clone(),
            idle,
            fin: true,
            timestamp: chrono::Utc::now(),
        }
    }

    /// Aggregate one task's resource trackers
    ///
    /// With `drain` the windows are cleared in the same step.
    async fn task_metrics(&self, task: &TaskSnapshot, drain: bool) -> Result<TaskMetrics> {
        let definition = self
            .index
            .definition(&task.task_arn)
            .ok_or_else(|| StatsError::StaleTaskDefinition {
                task_arn: task.task_arn.clone(),
            })?;

        let resolved = self
            .resolver
            .resolve_task_by_arn(&task.task_arn)
            .inspect_err(|e| debug!(task_arn = %task.task_arn, error = %e, "Unable to resolve task"))
            .ok();
        let network_stats = resolved
            .as_ref()
            .map_or(true, |t| t.reports_container_network_stats());

        let container_metrics = task
            .trackers
            .iter()
            .map(|t| if drain { t.drain_metrics() } else { t.container_metrics() })
            .map(|mut m| {
                if !network_stats {
                    m.network = None;
                }
                m
            })
            .filter(|m| !m.is_empty())
            .collect();

        let volume_metrics = match &resolved {
            Some(resolved) => self.volumes.fetch(resolved).await,
            None => Vec::new(),
        };

        Ok(TaskMetrics {
            task_arn: task.task_arn.clone(),
            task_definition_family: definition.family,
            task_definition_version: definition.version,
            container_metrics,
            volume_metrics,
        })
    }

    async fn collect_task_metrics(&self, snapshot: &[TaskSnapshot], drain: bool) -> Vec<TaskMetrics> {
        let mut task_metrics = Vec::new();
        for task in snapshot.iter().filter(|t| !t.trackers.is_empty()) {
            match self.task_metrics(task, drain).await {
                Ok(metrics) => task_metrics.push(metrics),
                Err(e) => warn!(task_arn = %task.task_arn, error = %e, "Excluding task from metrics"),
            }
        }
        task_metrics
    }

    fn task_health(&self, task: &TaskSnapshot) -> Result<TaskHealth> {
        let definition = self
            .index
            .definition(&task.task_arn)
            .ok_or_else(|| StatsError::StaleTaskDefinition {
                task_arn: task.task_arn.clone(),
            })?;

        let containers: Vec<ContainerHealth> = task
            .all_trackers()
            .map(|t| t.health(self.resolver.as_ref()))
            .collect();

        Ok(TaskHealth {
            task_arn: task.task_arn.clone(),
            task_definition_family: definition.family,
            task_definition_version: definition.version,
            containers,
        })
    }

    fn collect_task_health(&self, snapshot: &[TaskSnapshot]) -> Vec<TaskHealth> {
        snapshot
            .iter()
            .filter(|t| t.all_trackers().next().is_some())
            .filter_map(|task| match self.task_health(task) {
                Ok(health) => Some(health),
                Err(e) => {
                    warn!(task_arn = %task.task_arn, error = %e, "Excluding task from health");
                    None
                }
            })
            .collect()
    }

    /// Current metrics of every task with a resource-tracked container
    ///
    /// Does not reset any window.
    pub async fn instance_metrics(&self) -> Result<TelemetryMessage> {
        let snapshot = self.index.snapshot();
        if snapshot.iter().all(|t| t.trackers.is_empty()) {
            return Err(StatsError::EmptyMetrics);
        }

        let task_metrics = self.collect_task_metrics(&snapshot, false).await;
        Ok(TelemetryMessage {
            metadata: self.metadata(task_metrics.is_empty()),
            task_metrics,
        })
    }

    /// Current health of every task with a tracked container
    pub async fn task_health_metrics(&self) -> Result<HealthMessage> {
        let snapshot = self.index.snapshot();
        if snapshot.iter().all(|t| t.all_trackers().next().is_none()) {
            return Err(StatsError::EmptyHealthMetrics);
        }

        let health_metrics = self.collect_task_health(&snapshot);
        Ok(HealthMessage {
            metadata: self.metadata(health_metrics.is_empty()),
            health_metrics,
        })
    }

    /// Last raw sample and aggregate of one resource-tracked container
    pub fn container_stats(&self, task_arn: &str, container_id: &str) -> Result<ContainerStats> {
        if !self.index.has_task(task_arn) {
            return Err(StatsError::task_not_found(task_arn));
        }
        let tracker = self
            .index
            .resource_tracker(task_arn, container_id)
            .ok_or_else(|| StatsError::container_not_found(container_id))?;
        let last_sample = tracker.last_raw_sample().ok_or_else(|| StatsError::NotFound {
            kind: "container stats",
            id: container_id.to_string(),
        })?;

        Ok(ContainerStats {
            task_arn: task_arn.to_string(),
            container_id: container_id.to_string(),
            last_sample,
            metrics: tracker.container_metrics(),
        })
    }
}

impl Drop for StatsEngine {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
