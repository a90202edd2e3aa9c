//! Task index
//!
//! Maps tasks to the trackers of their containers. Resource trackers collect
//! statistics; health-only trackers are kept when metrics collection is
//! disabled and only take part in health reporting. A container lives in at
//! most one of the two maps.
//!
//! Every operation takes the lock once and leaves the index consistent, so
//! callers never see a half-applied add or remove.

use super::tracker::Tracker;
use crate::models::Task;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Family and version of a task definition
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskDefinition {
    pub family: String,
    pub version: String,
}

/// Which map a container is tracked in
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackingKind {
    Resource,
    HealthOnly,
}

/// Point-in-time view of one task for aggregation
#[derive(Debug, Clone)]
pub struct TaskSnapshot {
    pub task_arn: String,
    pub trackers: Vec<Arc<Tracker>>,
    pub health_trackers: Vec<Arc<Tracker>>,
}

impl TaskSnapshot {
    /// Every tracker of the task, resource ones first
    pub fn all_trackers(&self) -> impl Iterator<Item = &Arc<Tracker>> {
        self.trackers.iter().chain(self.health_trackers.iter())
    }
}

type ContainerMap = BTreeMap<String, Arc<Tracker>>;

#[derive(Debug, Default)]
struct IndexInner {
    containers: HashMap<String, ContainerMap>,
    health_checks: HashMap<String, ContainerMap>,
    definitions: HashMap<String, TaskDefinition>,
    /// container_id -> (task_arn, kind)
    locations: HashMap<String, (String, TrackingKind)>,
    /// Task arns in discovery order
    order: Vec<String>,
}

impl IndexInner {
    fn map_mut(&mut self, kind: TrackingKind) -> &mut HashMap<String, ContainerMap> {
        match kind {
            TrackingKind::Resource => &mut self.containers,
            TrackingKind::HealthOnly => &mut self.health_checks,
        }
    }

    fn task_is_empty(&self, task_arn: &str) -> bool {
        self.containers.get(task_arn).map_or(true, |m| m.is_empty())
            && self.health_checks.get(task_arn).map_or(true, |m| m.is_empty())
    }

    fn forget_task(&mut self, task_arn: &str) {
        self.containers.remove(task_arn);
        self.health_checks.remove(task_arn);
        self.definitions.remove(task_arn);
        self.order.retain(|arn| arn != task_arn);
    }
}

/// Concurrency-safe registry of tracked containers
#[derive(Debug, Default)]
pub struct TaskIndex {
    inner: RwLock<IndexInner>,
}

impl TaskIndex {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, IndexInner> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, IndexInner> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn contains(&self, container_id: &str) -> bool {
        self.read().locations.contains_key(container_id)
    }

    /// Track a container of `task`
    ///
    /// Returns false, leaving the index untouched, when the container is
    /// already tracked. The first insert for a task records its definition.
    pub fn insert(&self, task: &Task, tracker: Arc<Tracker>, kind: TrackingKind) -> bool {
        let mut inner = self.write();
        let container_id = tracker.container_id().to_string();
        if inner.locations.contains_key(&container_id) {
            return false;
        }

        if !inner.order.iter().any(|arn| arn == &task.arn) {
            inner.order.push(task.arn.clone());
        }
        inner
            .definitions
            .entry(task.arn.clone())
            .or_insert_with(|| TaskDefinition {
                family: task.family.clone(),
                version: task.version.clone(),
            });
        inner
            .map_mut(kind)
            .entry(task.arn.clone())
            .or_default()
            .insert(container_id.clone(), tracker);
        inner
            .locations
            .insert(container_id, (task.arn.clone(), kind));
        true
    }

    /// Untrack a container, returning its tracker
    ///
    /// The task and its cached definition are forgotten once its last
    /// container is gone.
    pub fn remove(&self, container_id: &str) -> Option<Arc<Tracker>> {
        let mut inner = self.write();
        let (task_arn, kind) = inner.locations.remove(container_id)?;

        let tracker = inner
            .map_mut(kind)
            .get_mut(&task_arn)
            .and_then(|m| m.remove(container_id));

        if inner.task_is_empty(&task_arn) {
            inner.forget_task(&task_arn);
        }
        tracker
    }

    /// Untrack everything, returning every tracker
    pub fn drain(&self) -> Vec<Arc<Tracker>> {
        let inner = std::mem::take(&mut *self.write());
        inner
            .containers
            .into_values()
            .chain(inner.health_checks.into_values())
            .flat_map(BTreeMap::into_values)
            .collect()
    }

    /// Snapshot every known task in discovery order
    pub fn snapshot(&self) -> Vec<TaskSnapshot> {
        let inner = self.read();
        let collect = |map: &HashMap<String, ContainerMap>, arn: &str| {
            map.get(arn)
                .map(|m| m.values().cloned().collect())
                .unwrap_or_default()
        };

        inner
            .order
            .iter()
            .map(|arn| TaskSnapshot {
                task_arn: arn.clone(),
                trackers: collect(&inner.containers, arn),
                health_trackers: collect(&inner.health_checks, arn),
            })
            .collect()
    }

    pub fn definition(&self, task_arn: &str) -> Option<TaskDefinition> {
        self.read().definitions.get(task_arn).cloned()
    }

    /// Drop a cached definition while keeping the task's trackers
    pub fn evict_definition(&self, task_arn: &str) -> Option<TaskDefinition> {
        self.write().definitions.remove(task_arn)
    }

    pub fn has_task(&self, task_arn: &str) -> bool {
        self.read().order.iter().any(|arn| arn == task_arn)
    }

    /// Resource tracker of a container within a task
    pub fn resource_tracker(&self, task_arn: &str, container_id: &str) -> Option<Arc<Tracker>> {
        self.read()
            .containers
            .get(task_arn)
            .and_then(|m| m.get(container_id))
            .cloned()
    }

    /// Where a container is tracked
    pub fn location(&self, container_id: &str) -> Option<(String, TrackingKind)> {
        self.read().locations.get(container_id).cloned()
    }

    /// (containers, tasks) currently tracked
    pub fn counts(&self) -> (usize, usize) {
        let inner = self.read();
        (inner.locations.len(), inner.order.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ContainerMetadata;
    use crate::observability::EngineMetrics;
    use crate::runtime::{async_trait, RuntimeStatsSource, StatsStream};
    use std::time::Duration;
    use tokio_util::sync::CancellationToken;

    struct NoSource;

    #[async_trait]
    impl RuntimeStatsSource for NoSource {
        async fn stream_stats(&self, _: &str, _: Duration) -> anyhow::Result<StatsStream> {
            anyhow::bail!("unused")
        }

        async fn list_running_containers(&self) -> anyhow::Result<Vec<String>> {
            Ok(vec![])
        }
    }

    fn task(arn: &str) -> Task {
        Task {
            arn: arn.to_string(),
            family: format!("{}-family", arn),
            version: "1".to_string(),
            ..Default::default()
        }
    }

    fn tracker(task_arn: &str, id: &str) -> Arc<Tracker> {
        Arc::new(Tracker::new(
            task_arn,
            ContainerMetadata {
                runtime_id: id.to_string(),
                name: id.to_string(),
                ..Default::default()
            },
            Arc::new(NoSource),
            4,
            Duration::from_secs(1),
            &CancellationToken::new(),
            EngineMetrics::new(),
        ))
    }

    #[test]
    fn test_insert_is_idempotent_across_maps() {
        let index = TaskIndex::new();
        assert!(index.insert(&task("t1"), tracker("t1", "c1"), TrackingKind::Resource));
        assert!(!index.insert(&task("t1"), tracker("t1", "c1"), TrackingKind::Resource));
        assert!(!index.insert(&task("t1"), tracker("t1", "c1"), TrackingKind::HealthOnly));

        assert_eq!(index.counts(), (1, 1));
        assert_eq!(
            index.location("c1"),
            Some(("t1".to_string(), TrackingKind::Resource))
        );
    }

    #[test]
    fn test_snapshot_keeps_discovery_order() {
        let index = TaskIndex::new();
        index.insert(&task("t2"), tracker("t2", "b"), TrackingKind::Resource);
        index.insert(&task("t1"), tracker("t1", "a"), TrackingKind::HealthOnly);
        index.insert(&task("t2"), tracker("t2", "c"), TrackingKind::Resource);

        let snapshot = index.snapshot();
        let arns: Vec<_> = snapshot.iter().map(|s| s.task_arn.as_str()).collect();
        assert_eq!(arns, vec!["t2", "t1"]);
        assert_eq!(snapshot[0].trackers.len(), 2);
        assert!(snapshot[1].trackers.is_empty());
        assert_eq!(snapshot[1].health_trackers.len(), 1);
        assert_eq!(snapshot[1].all_trackers().count(), 1);
    }

    #[test]
    fn test_remove_forgets_empty_task() {
        let index = TaskIndex::new();
        index.insert(&task("t1"), tracker("t1", "c1"), TrackingKind::Resource);
        index.insert(&task("t1"), tracker("t1", "c2"), TrackingKind::HealthOnly);

        assert!(index.remove("c1").is_some());
        assert!(index.has_task("t1"));
        assert!(index.definition("t1").is_some());

        assert!(index.remove("c2").is_some());
        assert!(!index.has_task("t1"));
        assert!(index.definition("t1").is_none());
        assert!(index.remove("c2").is_none());
        assert_eq!(index.counts(), (0, 0));
    }

    #[test]
    fn test_first_definition_wins() {
        let index = TaskIndex::new();
        index.insert(&task("t1"), tracker("t1", "c1"), TrackingKind::Resource);
        let mut updated = task("t1");
        updated.version = "2".to_string();
        index.insert(&updated, tracker("t1", "c2"), TrackingKind::Resource);

        assert_eq!(index.definition("t1").unwrap().version, "1");
    }

    #[test]
    fn test_drain_empties_index() {
        let index = TaskIndex::new();
        index.insert(&task("t1"), tracker("t1", "c1"), TrackingKind::Resource);
        index.insert(&task("t2"), tracker("t2", "c2"), TrackingKind::HealthOnly);

        assert_eq!(index.drain().len(), 2);
        assert!(index.snapshot().is_empty());
        assert!(!index.contains("c1"));
        assert_eq!(index.counts(), (0, 0));
    }

    #[test]
    fn test_resource_tracker_lookup() {
        let index = TaskIndex::new();
        index.insert(&task("t1"), tracker("t1", "c1"), TrackingKind::Resource);
        index.insert(&task("t1"), tracker("t1", "h1"), TrackingKind::HealthOnly);

        assert!(index.resource_tracker("t1", "c1").is_some());
        assert!(index.resource_tracker("t1", "h1").is_none());
        assert!(index.resource_tracker("t2", "c1").is_none());
    }
}
