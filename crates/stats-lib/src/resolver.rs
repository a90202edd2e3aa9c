//! Container and task metadata resolution
//!
//! The engine never owns task state. It asks a [`MetadataResolver`] which
//! task a container belongs to and what the container currently looks like.

use crate::error::{Result, StatsError};
use crate::models::{ContainerMetadata, Task};
use anyhow::Context;
use dashmap::DashMap;
use serde::Deserialize;
use std::collections::HashSet;
use std::path::Path;
use tracing::{debug, info};

/// Lookup service mapping container and task identifiers to metadata
pub trait MetadataResolver: Send + Sync {
    /// Resolve the task owning a container
    fn resolve_task(&self, container_id: &str) -> Result<Task>;

    /// Resolve a task by its ARN
    fn resolve_task_by_arn(&self, task_arn: &str) -> Result<Task>;

    /// Resolve the current metadata of a container
    fn resolve_container(&self, container_id: &str) -> Result<ContainerMetadata>;
}

/// On-disk shape of the task manifest
#[derive(Debug, Deserialize)]
struct Manifest {
    #[serde(default)]
    tasks: Vec<Task>,
}

/// Resolver backed by a task manifest written by the task-management subsystem
#[derive(Debug, Default)]
pub struct ManifestResolver {
    /// Map of task_arn -> Task
    tasks: DashMap<String, Task>,
    /// Map of container runtime id -> task_arn
    containers: DashMap<String, String>,
}

impl ManifestResolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a resolver from an in-memory task list
    pub fn from_tasks(tasks: impl IntoIterator<Item = Task>) -> Self {
        let resolver = Self::new();
        for task in tasks {
            resolver.upsert_task(task);
        }
        resolver
    }

    /// Load a resolver from a JSON manifest file
    pub async fn load(path: &Path) -> anyhow::Result<Self> {
        let resolver = Self::new();
        resolver.reload(path).await?;
        Ok(resolver)
    }

    /// Replace the resolver contents with the manifest at `path`
    ///
    /// A manifest that cannot be read or parsed leaves the contents as they
    /// were.
    pub async fn reload(&self, path: &Path) -> anyhow::Result<()> {
        let content = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read task manifest {}", path.display()))?;
        let manifest: Manifest = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse task manifest {}", path.display()))?;

        let count = manifest.tasks.len();
        self.replace(manifest.tasks);
        info!(path = %path.display(), tasks = count, "Loaded task manifest");
        Ok(())
    }

    /// Swap in a new task list
    ///
    /// Entries present in both the old and the new list stay resolvable
    /// throughout: new entries are written first, stale ones pruned after.
    pub fn replace(&self, tasks: Vec<Task>) {
        let mut task_arns = HashSet::with_capacity(tasks.len());
        let mut container_ids = HashSet::new();
        for task in tasks {
            task_arns.insert(task.arn.clone());
            container_ids.extend(
                task.containers
                    .iter()
                    .filter(|c| !c.runtime_id.is_empty())
                    .map(|c| c.runtime_id.clone()),
            );
            self.upsert_task(task);
        }

        self.containers.retain(|id, _| container_ids.contains(id));
        self.tasks.retain(|arn, _| task_arns.contains(arn));
    }

    /// Insert or update a single task and its container mappings
    pub fn upsert_task(&self, task: Task) {
        let arn = task.arn.clone();
        let current: HashSet<String> = task
            .containers
            .iter()
            .filter(|c| !c.runtime_id.is_empty())
            .map(|c| c.runtime_id.clone())
            .collect();

        debug!(task_arn = %arn, containers = task.containers.len(), "Indexed task");
        let previous = self.tasks.insert(arn.clone(), task);
        for container_id in &current {
            self.containers.insert(container_id.clone(), arn.clone());
        }

        // Containers the task no longer lists, unless another task claimed them
        for container in previous.into_iter().flat_map(|t| t.containers) {
            if !current.contains(&container.runtime_id) {
                self.containers
                    .remove_if(&container.runtime_id, |_, owner| *owner == arn);
            }
        }
    }

    /// Drop a task and its container mappings
    pub fn remove_task(&self, task_arn: &str) -> Option<Task> {
        let (_, task) = self.tasks.remove(task_arn)?;
        for container in &task.containers {
            self.containers
                .remove_if(&container.runtime_id, |_, owner| owner == task_arn);
        }
        Some(task)
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    fn task_arn_for(&self, container_id: &str) -> Result<String> {
        self.containers
            .get(container_id)
            .map(|arn| arn.value().clone())
            .ok_or_else(|| StatsError::container_not_found(container_id))
    }
}

impl MetadataResolver for ManifestResolver {
    fn resolve_task(&self, container_id: &str) -> Result<Task> {
        let task_arn = self.task_arn_for(container_id)?;
        self.resolve_task_by_arn(&task_arn)
    }

    fn resolve_task_by_arn(&self, task_arn: &str) -> Result<Task> {
        self.tasks
            .get(task_arn)
            .map(|task| task.value().clone())
            .ok_or_else(|| StatsError::task_not_found(task_arn))
    }

    fn resolve_container(&self, container_id: &str) -> Result<ContainerMetadata> {
        let task_arn = self.task_arn_for(container_id)?;
        let task = self
            .tasks
            .get(&task_arn)
            .ok_or_else(|| StatsError::task_not_found(&task_arn))?;

        task.containers
            .iter()
            .find(|c| c.runtime_id == container_id)
            .cloned()
            .ok_or_else(|| StatsError::container_not_found(container_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ContainerStatus, TaskStatus};
    use std::io::Write;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    fn task(arn: &str, container_ids: &[&str]) -> Task {
        Task {
            arn: arn.to_string(),
            family: "web".to_string(),
            version: "3".to_string(),
            known_status: TaskStatus::Running,
            containers: container_ids
                .iter()
                .map(|id| ContainerMetadata {
                    runtime_id: id.to_string(),
                    name: format!("name-{}", id),
                    known_status: ContainerStatus::Running,
                    ..Default::default()
                })
                .collect(),
            ..Default::default()
        }
    }

    #[test]
    fn test_resolve_task_and_container() {
        let resolver = ManifestResolver::from_tasks(vec![task("t1", &["c1", "c2"])]);

        assert_eq!(resolver.resolve_task("c2").unwrap().arn, "t1");
        assert_eq!(resolver.resolve_task_by_arn("t1").unwrap().family, "web");
        assert_eq!(resolver.resolve_container("c1").unwrap().name, "name-c1");
    }

    #[test]
    fn test_unknown_ids_are_not_found() {
        let resolver = ManifestResolver::from_tasks(vec![task("t1", &["c1"])]);

        assert!(resolver.resolve_task("c9").unwrap_err().is_not_found());
        assert!(resolver.resolve_task_by_arn("t9").unwrap_err().is_not_found());
        assert!(resolver.resolve_container("c9").unwrap_err().is_not_found());
    }

    #[test]
    fn test_upsert_moves_container_mappings() {
        let resolver = ManifestResolver::from_tasks(vec![task("t1", &["c1", "c2"])]);
        resolver.upsert_task(task("t1", &["c2"]));

        assert!(resolver.resolve_task("c1").is_err());
        assert_eq!(resolver.resolve_task("c2").unwrap().arn, "t1");

        resolver.remove_task("t1");
        assert!(resolver.is_empty());
        assert!(resolver.resolve_task("c2").is_err());
    }

    #[test]
    fn test_replace_keeps_unchanged_entries_resolvable() {
        let resolver = Arc::new(ManifestResolver::from_tasks(vec![task("t1", &["c1"])]));
        let done = Arc::new(AtomicBool::new(false));

        let reader = {
            let resolver = resolver.clone();
            let done = done.clone();
            std::thread::spawn(move || {
                let mut misses = 0;
                while !done.load(Ordering::Relaxed) {
                    if resolver.resolve_container("c1").is_err() || resolver.resolve_task("c1").is_err() {
                        misses += 1;
                    }
                }
                misses
            })
        };

        for _ in 0..5_000 {
            resolver.replace(vec![task("t1", &["c1"])]);
        }
        done.store(true, Ordering::Relaxed);

        assert_eq!(reader.join().unwrap(), 0);
    }

    #[test]
    fn test_replace_prunes_missing_tasks_and_containers() {
        let resolver = ManifestResolver::from_tasks(vec![task("t1", &["c1"]), task("t2", &["c2"])]);
        resolver.replace(vec![task("t2", &["c3"])]);

        assert_eq!(resolver.len(), 1);
        assert!(resolver.resolve_task_by_arn("t1").unwrap_err().is_not_found());
        assert!(resolver.resolve_task("c1").unwrap_err().is_not_found());
        assert!(resolver.resolve_task("c2").unwrap_err().is_not_found());
        assert_eq!(resolver.resolve_task("c3").unwrap().arn, "t2");
    }

    #[test]
    fn test_container_moved_between_tasks_follows_new_owner() {
        let resolver = ManifestResolver::from_tasks(vec![task("t1", &["c1"])]);
        resolver.upsert_task(task("t2", &["c1"]));
        resolver.upsert_task(task("t1", &[]));

        assert_eq!(resolver.resolve_task("c1").unwrap().arn, "t2");
    }

    #[tokio::test]
    async fn test_load_manifest_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"tasks": [{{
                "arn": "arn:task/1",
                "family": "api",
                "version": "7",
                "known_status": "RUNNING",
                "containers": [{{"runtime_id": "abc", "name": "app", "health_check": "docker"}}],
                "volumes": [{{
                    "name": "data",
                    "type": "network_block",
                    "volume_id": "vol-1",
                    "volume_name": "data-vol",
                    "source_volume_host_path": "task_vol-1"
                }}]
            }}]}}"#
        )
        .unwrap();

        let resolver = ManifestResolver::load(file.path()).await.unwrap();
        let task = resolver.resolve_task("abc").unwrap();
        assert_eq!(task.version, "7");
        assert_eq!(task.volumes.len(), 1);
        assert!(resolver.resolve_container("abc").unwrap().health_check.is_some());
    }

    #[tokio::test]
    async fn test_load_missing_manifest_fails() {
        let result = ManifestResolver::load(Path::new("/nonexistent/manifest.json")).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_failed_reload_keeps_contents() {
        let resolver = ManifestResolver::from_tasks(vec![task("t1", &["c1"])]);
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "not json").unwrap();

        assert!(resolver.reload(file.path()).await.is_err());
        assert_eq!(resolver.resolve_task("c1").unwrap().arn, "t1");
    }
}
