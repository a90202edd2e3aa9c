//! Observability infrastructure for the stats engine
//!
//! Provides:
//! - Prometheus metrics (tracked containers, publish latency, dropped messages)
//! - Structured JSON event logging with tracing

use prometheus::{
    register_histogram, register_int_counter, register_int_counter_vec, register_int_gauge,
    Histogram, IntCounter, IntCounterVec, IntGauge,
};
use std::sync::OnceLock;
use tracing::{info, warn};

/// Histogram buckets for publish tick latency (in seconds)
const PUBLISH_LATENCY_BUCKETS: &[f64] = &[
    0.0005, 0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
];

/// Output sink labels
pub mod sinks {
    pub const TELEMETRY: &str = "telemetry";
    pub const HEALTH: &str = "health";
}

/// Global metrics instance (registered once)
static GLOBAL_METRICS: OnceLock<EngineMetricsInner> = OnceLock::new();

struct EngineMetricsInner {
    tracked_containers: IntGauge,
    tracked_tasks: IntGauge,
    messages_published: IntCounterVec,
    messages_dropped: IntCounterVec,
    publish_latency_seconds: Histogram,
    stream_failures: IntCounter,
    volume_metric_failures: IntCounter,
    resolution_failures: IntCounter,
}

impl EngineMetricsInner {
    fn new() -> Self {
        Self {
            tracked_containers: register_int_gauge!(
                "stats_agent_tracked_containers",
                "Number of containers currently tracked by the stats engine"
            )
            .expect("Failed to register tracked_containers"),

            tracked_tasks: register_int_gauge!(
                "stats_agent_tracked_tasks",
                "Number of tasks with at least one tracked container"
            )
            .expect("Failed to register tracked_tasks"),

            messages_published: register_int_counter_vec!(
                "stats_agent_messages_published_total",
                "Messages handed to an output channel",
                &["sink"]
            )
            .expect("Failed to register messages_published"),

            messages_dropped: register_int_counter_vec!(
                "stats_agent_messages_dropped_total",
                "Messages dropped because the output channel was full",
                &["sink"]
            )
            .expect("Failed to register messages_dropped"),

            publish_latency_seconds: register_histogram!(
                "stats_agent_publish_latency_seconds",
                "Time spent assembling and sending one publish tick",
                PUBLISH_LATENCY_BUCKETS.to_vec()
            )
            .expect("Failed to register publish_latency_seconds"),

            stream_failures: register_int_counter!(
                "stats_agent_stream_failures_total",
                "Stats subscriptions that could not be established"
            )
            .expect("Failed to register stream_failures"),

            volume_metric_failures: register_int_counter!(
                "stats_agent_volume_metric_failures_total",
                "Volume metric queries that failed or timed out"
            )
            .expect("Failed to register volume_metric_failures"),

            resolution_failures: register_int_counter!(
                "stats_agent_resolution_failures_total",
                "Containers or tasks the resolver could not find"
            )
            .expect("Failed to register resolution_failures"),
        }
    }
}

/// Engine metrics for Prometheus exposition
///
/// Lightweight handle to the global metrics instance; clones share the
/// same underlying metrics.
#[derive(Clone)]
pub struct EngineMetrics {
    inner: &'static EngineMetricsInner,
}

impl Default for EngineMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for EngineMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineMetrics").finish_non_exhaustive()
    }
}

impl EngineMetrics {
    /// Create a new metrics handle (registers global metrics on first call)
    pub fn new() -> Self {
        Self {
            inner: GLOBAL_METRICS.get_or_init(EngineMetricsInner::new),
        }
    }

    pub fn set_tracked(&self, containers: usize, tasks: usize) {
        self.inner.tracked_containers.set(containers as i64);
        self.inner.tracked_tasks.set(tasks as i64);
    }

    pub fn inc_published(&self, sink: &str) {
        self.inner.messages_published.with_label_values(&[sink]).inc();
    }

    pub fn inc_dropped(&self, sink: &str) {
        self.inner.messages_dropped.with_label_values(&[sink]).inc();
    }

    pub fn observe_publish_latency(&self, duration_secs: f64) {
        self.inner.publish_latency_seconds.observe(duration_secs);
    }

    pub fn inc_stream_failures(&self) {
        self.inner.stream_failures.inc();
    }

    pub fn inc_volume_metric_failures(&self) {
        self.inner.volume_metric_failures.inc();
    }

    pub fn inc_resolution_failures(&self) {
        self.inner.resolution_failures.inc();
    }

    /// Current dropped count for a sink
    pub fn dropped(&self, sink: &str) -> u64 {
        self.inner.messages_dropped.with_label_values(&[sink]).get()
    }
}

/// Structured logger for engine events
///
/// Fixed-shape logs carrying an `event` field, so log pipelines can match
/// on them without parsing messages.
#[derive(Debug, Clone)]
pub struct StructuredLogger {
    container_instance: String,
}

impl StructuredLogger {
    pub fn new(container_instance: impl Into<String>) -> Self {
        Self {
            container_instance: container_instance.into(),
        }
    }

    /// Log agent startup
    pub fn log_startup(&self, version: &str, cluster: &str) {
        info!(
            event = "agent_started",
            container_instance = %self.container_instance,
            agent_version = %version,
            cluster = %cluster,
            "Stats agent started"
        );
    }

    /// Log agent shutdown
    pub fn log_shutdown(&self, reason: &str) {
        info!(
            event = "agent_shutdown",
            container_instance = %self.container_instance,
            reason = %reason,
            "Stats agent shutting down"
        );
    }

    /// Log a message lost to a full output channel
    pub fn log_message_dropped(&self, sink: &str, capacity: usize, total_dropped: u64) {
        warn!(
            event = "message_dropped",
            container_instance = %self.container_instance,
            sink = %sink,
            channel_capacity = capacity,
            total_dropped = total_dropped,
            "Output channel full, dropping newest message"
        );
    }

    /// Log the outcome of one publish tick
    pub fn log_metrics_published(&self, telemetry_tasks: usize, health_tasks: usize, elapsed_secs: f64) {
        info!(
            event = "metrics_published",
            container_instance = %self.container_instance,
            telemetry_tasks = telemetry_tasks,
            health_tasks = health_tasks,
            idle = telemetry_tasks == 0,
            elapsed_secs = elapsed_secs,
            "Published task metrics"
        );
    }
}
