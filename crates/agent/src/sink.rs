//! Consumer of the engine's output channels
//!
//! Stands in for the telemetry backend connection: every message is
//! serialized and logged. Draining promptly keeps the engine from dropping
//! messages on a full channel.

use serde::Serialize;
use stats_lib::EngineReceivers;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SinkTotals {
    pub telemetry: u64,
    pub health: u64,
}

fn emit<T: Serialize>(kind: &str, message: &T) {
    match serde_json::to_string(message) {
        Ok(json) => debug!(kind = %kind, message = %json, "Outbound message"),
        Err(e) => warn!(kind = %kind, error = %e, "Failed to serialize outbound message"),
    }
}

/// Drain both channels until cancelled or both senders are gone
pub async fn drain(mut receivers: EngineReceivers, cancel: CancellationToken) -> SinkTotals {
    let mut totals = SinkTotals::default();
    let mut telemetry_open = true;
    let mut health_open = true;

    while telemetry_open || health_open {
        tokio::select! {
            _ = cancel.cancelled() => break,
            message = receivers.telemetry.recv(), if telemetry_open => match message {
                Some(message) => {
                    totals.telemetry += 1;
                    emit("telemetry", &message);
                }
                None => telemetry_open = false,
            },
            message = receivers.health.recv(), if health_open => match message {
                Some(message) => {
                    totals.health += 1;
                    emit("health", &message);
                }
                None => health_open = false,
            },
        }
    }

    info!(
        telemetry = totals.telemetry,
        health = totals.health,
        "Output sink stopped"
    );
    totals
}
