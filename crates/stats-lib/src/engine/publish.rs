//! Periodic publishing with drop-newest backpressure

use super::StatsEngine;
use crate::health::components;
use crate::models::{HealthMessage, TelemetryMessage};
use crate::observability::sinks;
use std::time::Duration;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::time::{interval, Instant, MissedTickBehavior};
use tracing::{debug, info};

impl StatsEngine {
    /// Tick immediately, then every `every`, until the engine is cancelled
    pub(super) async fn run_publish_loop(&self, every: Duration) {
        info!(interval_secs = every.as_secs_f64(), "Starting metrics publish loop");

        let mut ticker = interval(every);
        // A tick that overruns swallows the ticks it overlapped
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    info!("Shutting down metrics publish loop");
                    break;
                }
                _ = ticker.tick() => self.publish_metrics().await,
            }
        }
    }

    /// Run one publish tick
    ///
    /// Assembles a telemetry and a health message and offers each to its
    /// channel without waiting. A full channel loses the new message, never
    /// the queued ones. Ticks never overlap; a call made while another tick
    /// is in flight returns without publishing.
    pub async fn publish_metrics(&self) {
        let Ok(_tick) = self.publishing.try_lock() else {
            debug!("Publish tick already in progress, skipping");
            return;
        };
        let start = Instant::now();

        let snapshot = self.index.snapshot();
        let task_metrics = self.collect_task_metrics(&snapshot, true).await;
        let health_metrics = self.collect_task_health(&snapshot);

        let telemetry_tasks = task_metrics.len();
        let health_tasks = health_metrics.len();

        let telemetry = TelemetryMessage {
            metadata: self.metadata(task_metrics.is_empty()),
            task_metrics,
        };
        let health = HealthMessage {
            metadata: self.metadata(health_metrics.is_empty()),
            health_metrics,
        };

        let telemetry_sent = self.offer(&self.telemetry_tx, telemetry, sinks::TELEMETRY);
        let health_sent = self.offer(&self.health_tx, health, sinks::HEALTH);

        if telemetry_sent && health_sent {
            self.health.set_healthy(components::PUBLISHER).await;
        } else {
            self.health
                .set_degraded(components::PUBLISHER, "Output channel full or closed, messages dropped")
                .await;
        }

        let elapsed = start.elapsed().as_secs_f64();
        self.metrics.observe_publish_latency(elapsed);
        self.logger
            .log_metrics_published(telemetry_tasks, health_tasks, elapsed);
    }

    /// Non-blocking send; returns true when the message was queued
    fn offer<T>(&self, tx: &mpsc::Sender<T>, message: T, sink: &str) -> bool {
        match tx.try_send(message) {
            Ok(()) => {
                self.metrics.inc_published(sink);
                true
            }
            Err(TrySendError::Full(_)) => {
                self.metrics.inc_dropped(sink);
                self.logger
                    .log_message_dropped(sink, tx.max_capacity(), self.metrics.dropped(sink));
                false
            }
            Err(TrySendError::Closed(_)) => {
                debug!(sink = %sink, "Output channel closed, discarding message");
                false
            }
        }
    }
}
