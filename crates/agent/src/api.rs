//! HTTP API for health checks, Prometheus metrics and engine queries

use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use prometheus::{Encoder, TextEncoder};
use serde::Deserialize;
use stats_lib::{ComponentStatus, HealthRegistry, StatsEngine, StatsError};
use std::sync::Arc;
use tracing::{info, warn};

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub health_registry: HealthRegistry,
    pub engine: Arc<StatsEngine>,
}

impl AppState {
    pub fn new(health_registry: HealthRegistry, engine: Arc<StatsEngine>) -> Self {
        Self {
            health_registry,
            engine,
        }
    }
}

/// Map an engine error onto an HTTP response
fn error_response(err: StatsError) -> Response {
    match err {
        StatsError::EmptyMetrics | StatsError::EmptyHealthMetrics => StatusCode::NO_CONTENT.into_response(),
        StatsError::NotFound { .. } => (
            StatusCode::NOT_FOUND,
            Json(serde_json::json!({ "error": err.to_string() })),
        )
            .into_response(),
        other => {
            warn!(error = %other, "Query failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(serde_json::json!({ "error": other.to_string() })),
            )
                .into_response()
        }
    }
}

/// Health check response - returns 200 if healthy, 503 if unhealthy
async fn healthz(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let health = state.health_registry.health().await;

    let status_code = match health.status {
        ComponentStatus::Healthy | ComponentStatus::Degraded => StatusCode::OK,
        ComponentStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
    };

    (status_code, Json(health))
}

/// Readiness check response - returns 200 if ready, 503 if not ready
async fn readyz(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let readiness = state.health_registry.readiness().await;

    let status_code = if readiness.ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (status_code, Json(readiness))
}

/// Prometheus metrics endpoint
async fn metrics() -> Response {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();

    if let Err(e) = encoder.encode(&prometheus::gather(), &mut buffer) {
        warn!(error = %e, "Failed to encode metrics");
        return StatusCode::INTERNAL_SERVER_ERROR.into_response();
    }

    (
        StatusCode::OK,
        [("content-type", encoder.format_type().to_string())],
        buffer,
    )
        .into_response()
}

async fn instance_metrics(State(state): State<Arc<AppState>>) -> Response {
    match state.engine.instance_metrics().await {
        Ok(message) => Json(message).into_response(),
        Err(e) => error_response(e),
    }
}

async fn task_health(State(state): State<Arc<AppState>>) -> Response {
    match state.engine.task_health_metrics().await {
        Ok(message) => Json(message).into_response(),
        Err(e) => error_response(e),
    }
}

#[derive(Debug, Deserialize)]
struct ContainerQuery {
    task: String,
    container: String,
}

async fn container_stats(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ContainerQuery>,
) -> Response {
    match state.engine.container_stats(&query.task, &query.container) {
        Ok(stats) => Json(stats).into_response(),
        Err(e) => error_response(e),
    }
}

/// Create the API router
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/metrics", get(metrics))
        .route("/v1/metrics", get(instance_metrics))
        .route("/v1/health", get(task_health))
        .route("/v1/containers", get(container_stats))
        .with_state(state)
}

/// Start the API server
pub async fn serve(port: u16, state: Arc<AppState>) -> anyhow::Result<()> {
    let app = create_router(state);

    let addr = format!("0.0.0.0:{}", port);
    info!(addr = %addr, "Starting API server");

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use stats_lib::health::components;
    use stats_lib::{CgroupStatsSource, ContainerMetadata, EngineConfig, ManifestResolver, Task, TaskStatus};
    use tower::ServiceExt;

    fn test_state() -> Arc<AppState> {
        let resolver = ManifestResolver::from_tasks(vec![Task {
            arn: "t1".to_string(),
            family: "web".to_string(),
            version: "2".to_string(),
            known_status: TaskStatus::Running,
            containers: vec![ContainerMetadata {
                runtime_id: "c1".to_string(),
                name: "app".to_string(),
                ..Default::default()
            }],
            ..Default::default()
        }]);

        let health_registry = HealthRegistry::new();
        let (engine, _receivers) = StatsEngine::builder()
            .config(EngineConfig {
                publish_interval: None,
                ..Default::default()
            })
            .runtime(Arc::new(CgroupStatsSource::new("/nonexistent/cgroup")))
            .resolver(Arc::new(resolver))
            .health_registry(health_registry.clone())
            .build()
            .unwrap();

        Arc::new(AppState::new(health_registry, engine))
    }

    async fn get(app: Router, uri: &str) -> (StatusCode, Vec<u8>) {
        let response = app
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, body.to_vec())
    }

    #[tokio::test]
    async fn test_healthz_reports_components() {
        let state = test_state();
        state.health_registry.register(components::ENGINE).await;

        let (status, body) = get(create_router(state.clone()), "/healthz").await;
        assert_eq!(status, StatusCode::OK);
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["status"], "healthy");

        state
            .health_registry
            .set_unhealthy(components::ENGINE, "stopped")
            .await;
        let (status, _) = get(create_router(state), "/healthz").await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn test_readyz_follows_registry() {
        let state = test_state();
        let (status, _) = get(create_router(state.clone()), "/readyz").await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);

        state.health_registry.set_ready(true).await;
        let (status, _) = get(create_router(state), "/readyz").await;
        assert_eq!(status, StatusCode::OK);
    }

    #[tokio::test]
    async fn test_metrics_endpoint_exposes_engine_metrics() {
        let (status, body) = get(create_router(test_state()), "/metrics").await;
        assert_eq!(status, StatusCode::OK);
        assert!(String::from_utf8(body)
            .unwrap()
            .contains("stats_agent_tracked_containers"));
    }

    #[tokio::test]
    async fn test_empty_queries_return_no_content() {
        let state = test_state();
        let (status, _) = get(create_router(state.clone()), "/v1/metrics").await;
        assert_eq!(status, StatusCode::NO_CONTENT);

        let (status, _) = get(create_router(state), "/v1/health").await;
        assert_eq!(status, StatusCode::NO_CONTENT);
    }

    #[tokio::test]
    async fn test_instance_metrics_lists_tracked_task() {
        let state = test_state();
        state.engine.add_container("c1").unwrap();

        let (status, body) = get(create_router(state.clone()), "/v1/metrics").await;
        assert_eq!(status, StatusCode::OK);
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["task_metrics"][0]["task_arn"], "t1");
        assert_eq!(json["task_metrics"][0]["task_definition_family"], "web");

        let (status, body) = get(create_router(state), "/v1/health").await;
        assert_eq!(status, StatusCode::OK);
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["health_metrics"][0]["containers"][0]["health_status"], "HEALTHY");
    }

    #[tokio::test]
    async fn test_unknown_container_is_not_found() {
        let (status, body) = get(
            create_router(test_state()),
            "/v1/containers?task=t9&container=c9",
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert!(json["error"].as_str().unwrap().contains("t9"));
    }
}
