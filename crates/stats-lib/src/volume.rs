//! Volume metrics for network-backed task volumes
//!
//! Queries are issued one volume at a time, each bounded by a deadline. A
//! failed volume is logged and left out; it never fails the task.

use crate::error::StatsError;
use crate::models::{StatsSet, Task, VolumeKind, VolumeMetric};
use crate::observability::EngineMetrics;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Default host prefix under which network-backed volumes are mounted
pub const DEFAULT_VOLUME_SOURCE_PREFIX: &str = "/mnt/ecs/ebs/";

/// Used and total bytes of one volume
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VolumeUsage {
    pub used_bytes: u64,
    pub capacity_bytes: u64,
}

/// Client for an external volume metrics service
#[async_trait]
pub trait VolumeMetricsClient: Send + Sync {
    async fn get_volume_metrics(&self, volume_id: &str, source_path: &str) -> anyhow::Result<VolumeUsage>;
}

/// Fetches metrics for the network-backed volumes of a task
#[derive(Clone)]
pub struct VolumeMetricsFetcher {
    client: Option<Arc<dyn VolumeMetricsClient>>,
    deadline: Duration,
    source_prefix: String,
    metrics: EngineMetrics,
}

impl VolumeMetricsFetcher {
    pub fn new(
        client: Option<Arc<dyn VolumeMetricsClient>>,
        deadline: Duration,
        source_prefix: impl Into<String>,
        metrics: EngineMetrics,
    ) -> Self {
        Self {
            client,
            deadline,
            source_prefix: source_prefix.into(),
            metrics,
        }
    }

    /// Metrics for every network-backed volume of `task` that answered in time
    pub async fn fetch(&self, task: &Task) -> Vec<VolumeMetric> {
        let Some(client) = &self.client else {
            return Vec::new();
        };

        let mut results = Vec::new();
        for volume in &task.volumes {
            let VolumeKind::NetworkBlock {
                volume_id,
                volume_name,
                source_volume_host_path,
            } = &volume.kind
            else {
                continue;
            };

            let source_path = format!("{}{}", self.source_prefix, source_volume_host_path);
            match self
                .fetch_one(client.as_ref(), &task.arn, volume_id, &source_path)
                .await
            {
                Ok(usage) => results.push(VolumeMetric {
                    volume_id: volume_id.clone(),
                    volume_name: volume_name.clone(),
                    utilized: StatsSet::single(usage.used_bytes as f64),
                    size: StatsSet::single(usage.capacity_bytes as f64),
                }),
                Err(e) => {
                    warn!(
                        task_arn = %task.arn,
                        volume_id = %volume_id,
                        source_path = %source_path,
                        error = %e,
                        "Skipping volume metrics"
                    );
                    self.metrics.inc_volume_metric_failures();
                }
            }
        }

        debug!(task_arn = %task.arn, volumes = results.len(), "Fetched volume metrics");
        results
    }

    async fn fetch_one(
        &self,
        client: &dyn VolumeMetricsClient,
        task_arn: &str,
        volume_id: &str,
        source_path: &str,
    ) -> Result<VolumeUsage, StatsError> {
        let failure = |reason: String| StatsError::VolumeMetrics {
            volume_id: volume_id.to_string(),
            task_arn: task_arn.to_string(),
            reason,
        };

        match tokio::time::timeout(self.deadline, client.get_volume_metrics(volume_id, source_path)).await {
            Ok(Ok(usage)) => Ok(usage),
            Ok(Err(e)) => Err(failure(format!("{:#}", e))),
            Err(_) => Err(failure(format!(
                "deadline of {}ms exceeded",
                self.deadline.as_millis()
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::TaskVolume;
    use std::collections::HashMap;
    use std::sync::Mutex;

    /// Client answering from a table; ids absent from it fail, ids in
    /// `slow` never answer
    #[derive(Default)]
    struct TableClient {
        usage: HashMap<String, VolumeUsage>,
        slow: Vec<String>,
        calls: Mutex<Vec<(String, String)>>,
    }

    #[async_trait]
    impl VolumeMetricsClient for TableClient {
        async fn get_volume_metrics(&self, volume_id: &str, source_path: &str) -> anyhow::Result<VolumeUsage> {
            self.calls
                .lock()
                .unwrap()
                .push((volume_id.to_string(), source_path.to_string()));
            if self.slow.iter().any(|id| id == volume_id) {
                std::future::pending::<()>().await;
            }
            self.usage
                .get(volume_id)
                .copied()
                .ok_or_else(|| anyhow::anyhow!("volume {} not attached", volume_id))
        }
    }

    fn network_volume(id: &str) -> TaskVolume {
        TaskVolume {
            name: format!("{}-mount", id),
            kind: VolumeKind::NetworkBlock {
                volume_id: id.to_string(),
                volume_name: format!("{}-name", id),
                source_volume_host_path: format!("task-{}", id),
            },
        }
    }

    fn task_with(volumes: Vec<TaskVolume>) -> Task {
        Task {
            arn: "t1".to_string(),
            volumes,
            ..Default::default()
        }
    }

    fn fetcher(client: Arc<TableClient>) -> VolumeMetricsFetcher {
        VolumeMetricsFetcher::new(
            Some(client),
            Duration::from_millis(50),
            DEFAULT_VOLUME_SOURCE_PREFIX,
            EngineMetrics::new(),
        )
    }

    #[tokio::test]
    async fn test_fetch_converts_usage_to_single_sample_sets() {
        let client = Arc::new(TableClient {
            usage: HashMap::from([(
                "vol-1".to_string(),
                VolumeUsage {
                    used_bytes: 15,
                    capacity_bytes: 20,
                },
            )]),
            ..Default::default()
        });
        let task = task_with(vec![
            network_volume("vol-1"),
            TaskVolume {
                name: "scratch".to_string(),
                kind: VolumeKind::Local,
            },
        ]);

        let metrics = fetcher(client.clone()).fetch(&task).await;
        assert_eq!(metrics.len(), 1);
        assert_eq!(metrics[0].volume_id, "vol-1");
        assert_eq!(metrics[0].volume_name, "vol-1-name");
        assert_eq!(metrics[0].utilized, StatsSet::single(15.0));
        assert_eq!(metrics[0].size, StatsSet::single(20.0));

        let calls = client.calls.lock().unwrap();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].1, "/mnt/ecs/ebs/task-vol-1");
    }

    #[tokio::test]
    async fn test_failed_volume_is_omitted() {
        let client = Arc::new(TableClient {
            usage: HashMap::from([(
                "vol-2".to_string(),
                VolumeUsage {
                    used_bytes: 1,
                    capacity_bytes: 2,
                },
            )]),
            ..Default::default()
        });
        let task = task_with(vec![network_volume("vol-1"), network_volume("vol-2")]);

        let metrics = fetcher(client).fetch(&task).await;
        assert_eq!(metrics.len(), 1);
        assert_eq!(metrics[0].volume_id, "vol-2");
    }

    #[tokio::test]
    async fn test_deadline_exceeded_is_omitted() {
        let client = Arc::new(TableClient {
            slow: vec!["vol-1".to_string()],
            ..Default::default()
        });
        let task = task_with(vec![network_volume("vol-1")]);

        let metrics = fetcher(client).fetch(&task).await;
        assert!(metrics.is_empty());
    }

    #[tokio::test]
    async fn test_without_client_is_empty() {
        let fetcher = VolumeMetricsFetcher::new(
            None,
            Duration::from_secs(1),
            DEFAULT_VOLUME_SOURCE_PREFIX,
            EngineMetrics::new(),
        );
        let task = task_with(vec![network_volume("vol-1")]);

        assert!(fetcher.fetch(&task).await.is_empty());
    }

    #[tokio::test]
    async fn test_fetch_one_reports_context() {
        let client = TableClient::default();
        let err = fetcher(Arc::new(TableClient::default()))
            .fetch_one(&client, "t1", "vol-9", "/mnt/ecs/ebs/x")
            .await
            .unwrap_err();

        let message = err.to_string();
        assert!(message.contains("vol-9"));
        assert!(message.contains("t1"));
    }
}
