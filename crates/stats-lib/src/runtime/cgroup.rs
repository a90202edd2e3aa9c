//! cgroup v2 runtime stats source
//!
//! Reads container samples from the unified cgroup v2 hierarchy:
//! - cpu.stat for cumulative CPU time
//! - memory.current for current memory usage
//! - io.stat for cumulative block I/O bytes
//!
//! Network counters are not exposed through cgroups, so samples from this
//! source never carry them.

use super::{async_trait, RuntimeStatsSource, StatsStream};
use crate::models::{ContainerEvent, RawStats};
use anyhow::{Context, Result};
use dashmap::DashMap;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tokio::fs;
use tokio::sync::mpsc;
use tokio::time::{interval, MissedTickBehavior};
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Default interval between two reads of a container's cgroup files
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Samples buffered between the poller and the stream consumer
const STREAM_BUFFER: usize = 4;

/// Cumulative counters read from one cgroup
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
struct CgroupCounters {
    cpu_usage_usec: u64,
    memory_usage_bytes: u64,
    io_read_bytes: u64,
    io_write_bytes: u64,
}

/// Runtime source over the cgroup v2 unified hierarchy
pub struct CgroupStatsSource {
    cgroup_root: PathBuf,
    poll_interval: Duration,
    /// Map of container_id -> cgroup directory, filled by listing
    paths: DashMap<String, PathBuf>,
}

impl CgroupStatsSource {
    /// Create a new cgroup v2 source
    pub fn new(cgroup_root: impl Into<PathBuf>) -> Self {
        Self {
            cgroup_root: cgroup_root.into(),
            poll_interval: DEFAULT_POLL_INTERVAL,
            paths: DashMap::new(),
        }
    }

    /// Set the interval between cgroup reads
    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// Check if cgroup v2 is available under the configured root
    pub async fn is_available(&self) -> bool {
        fs::metadata(self.cgroup_root.join("cgroup.controllers"))
            .await
            .is_ok()
    }

    /// Parse cpu.stat file contents
    /// Returns usage_usec
    pub fn parse_cpu_stat(content: &str) -> u64 {
        content
            .lines()
            .filter_map(|line| line.split_once(' '))
            .find(|(key, _)| *key == "usage_usec")
            .and_then(|(_, value)| value.trim().parse().ok())
            .unwrap_or(0)
    }

    /// Parse io.stat file contents
    /// Returns (rbytes, wbytes) summed over all devices
    pub fn parse_io_stat(content: &str) -> (u64, u64) {
        let mut read_bytes = 0u64;
        let mut write_bytes = 0u64;

        for line in content.lines() {
            // "8:0 rbytes=1 wbytes=2 rios=3 wios=4 dbytes=0 dios=0"
            for field in line.split_whitespace().skip(1) {
                match field.split_once('=') {
                    Some(("rbytes", v)) => read_bytes += v.parse::<u64>().unwrap_or(0),
                    Some(("wbytes", v)) => write_bytes += v.parse::<u64>().unwrap_or(0),
                    _ => {}
                }
            }
        }

        (read_bytes, write_bytes)
    }

    /// Extract a container id from a cgroup directory name
    /// Handles the common runtime layouts:
    /// - Docker/containerd: <container_id>
    /// - systemd driver: docker-<container_id>.scope, cri-containerd-<container_id>.scope
    /// - CRI-O: crio-<container_id>.scope
    pub fn extract_container_id(name: &str) -> Option<String> {
        let stripped = name.strip_suffix(".scope").unwrap_or(name);
        let candidate = ["docker-", "cri-containerd-", "crio-"]
            .iter()
            .find_map(|prefix| stripped.strip_prefix(prefix))
            .unwrap_or(stripped);

        if candidate.len() == 64 && candidate.chars().all(|c| c.is_ascii_hexdigit()) {
            Some(candidate.to_string())
        } else {
            None
        }
    }

    /// Read a single value from a cgroup file
    async fn read_cgroup_value(cgroup_path: &Path, filename: &str) -> Result<u64> {
        let file_path = cgroup_path.join(filename);
        let content = fs::read_to_string(&file_path)
            .await
            .with_context(|| format!("Failed to read {}", file_path.display()))?;

        content
            .trim()
            .parse()
            .with_context(|| format!("Failed to parse {} value", filename))
    }

    /// Read all counters of one container cgroup
    async fn read_counters(cgroup_path: &Path) -> Result<CgroupCounters> {
        let cpu_stat = fs::read_to_string(cgroup_path.join("cpu.stat"))
            .await
            .with_context(|| format!("Failed to read cpu.stat in {}", cgroup_path.display()))?;
        let memory_usage_bytes = Self::read_cgroup_value(cgroup_path, "memory.current")
            .await
            .unwrap_or(0);
        // io controller may not be enabled for this cgroup
        let io_stat = fs::read_to_string(cgroup_path.join("io.stat"))
            .await
            .unwrap_or_default();
        let (io_read_bytes, io_write_bytes) = Self::parse_io_stat(&io_stat);

        Ok(CgroupCounters {
            cpu_usage_usec: Self::parse_cpu_stat(&cpu_stat),
            memory_usage_bytes,
            io_read_bytes,
            io_write_bytes,
        })
    }

    /// Recursively scan a cgroup directory for container cgroups
    async fn scan_cgroup_dir(path: &Path) -> Result<Vec<(String, PathBuf)>> {
        let mut containers = Vec::new();
        let mut entries = fs::read_dir(path).await?;

        while let Some(entry) = entries.next_entry().await? {
            let entry_path = entry.path();
            if !entry.file_type().await?.is_dir() {
                continue;
            }

            let name = entry.file_name().to_string_lossy().to_string();
            if let Some(container_id) = Self::extract_container_id(&name) {
                if fs::metadata(entry_path.join("cpu.stat")).await.is_ok() {
                    containers.push((container_id, entry_path.clone()));
                    continue;
                }
            }

            if let Ok(nested) = Box::pin(Self::scan_cgroup_dir(&entry_path)).await {
                containers.extend(nested);
            }
        }

        Ok(containers)
    }

    /// Scan the hierarchy and refresh the container path cache
    async fn discover(&self) -> Result<Vec<String>> {
        let found = Self::scan_cgroup_dir(&self.cgroup_root)
            .await
            .with_context(|| format!("Failed to scan {}", self.cgroup_root.display()))?;

        let ids: HashSet<&String> = found.iter().map(|(id, _)| id).collect();
        self.paths.retain(|id, _| ids.contains(id));

        let mut listed = Vec::with_capacity(found.len());
        for (id, path) in found {
            self.paths.insert(id.clone(), path);
            listed.push(id);
        }
        Ok(listed)
    }

    async fn container_path(&self, container_id: &str) -> Result<PathBuf> {
        if let Some(path) = self.paths.get(container_id) {
            return Ok(path.clone());
        }
        self.discover().await?;
        self.paths
            .get(container_id)
            .map(|p| p.clone())
            .ok_or_else(|| anyhow::anyhow!("Cgroup path not found for container {}", container_id))
    }

    /// Emit lifecycle events by diffing successive container listings
    pub async fn watch(
        &self,
        every: Duration,
        events: mpsc::Sender<ContainerEvent>,
        cancel: CancellationToken,
    ) {
        let mut known: HashSet<String> = HashSet::new();
        let mut ticker = interval(every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        info!(root = %self.cgroup_root.display(), "Watching cgroup hierarchy for containers");

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }

            let current: HashSet<String> = match self.discover().await {
                Ok(ids) => ids.into_iter().collect(),
                Err(e) => {
                    warn!(error = %e, "Failed to list containers");
                    continue;
                }
            };

            let started = current.difference(&known).cloned().map(ContainerEvent::Started);
            let stopped = known.difference(&current).cloned().map(ContainerEvent::Stopped);
            for event in started.chain(stopped).collect::<Vec<_>>() {
                if events.send(event).await.is_err() {
                    debug!("Container event receiver closed");
                    return;
                }
            }
            known = current;
        }
    }
}

/// Turn two consecutive counter reads into a raw sample
fn to_raw_stats(previous: &CgroupCounters, current: &CgroupCounters, elapsed: Duration) -> RawStats {
    let elapsed_usec = elapsed.as_micros().max(1) as f64;
    let cpu_delta = current.cpu_usage_usec.saturating_sub(previous.cpu_usage_usec) as f64;

    RawStats {
        read: chrono::Utc::now(),
        cpu_usage_percent: cpu_delta / elapsed_usec * 100.0,
        memory_usage_bytes: current.memory_usage_bytes,
        storage_read_bytes: current.io_read_bytes,
        storage_write_bytes: current.io_write_bytes,
        network: None,
    }
}

#[async_trait]
impl RuntimeStatsSource for CgroupStatsSource {
    async fn stream_stats(
        &self,
        container_id: &str,
        inactivity_timeout: Duration,
    ) -> Result<StatsStream> {
        let cgroup_path = self.container_path(container_id).await?;
        let mut previous = Self::read_counters(&cgroup_path).await?;
        let mut previous_at = Instant::now();

        let (tx, rx) = mpsc::channel(STREAM_BUFFER);
        let poll_interval = self.poll_interval;
        let container_id = container_id.to_string();

        debug!(
            container_id = %container_id,
            path = %cgroup_path.display(),
            inactivity_timeout_secs = inactivity_timeout.as_secs(),
            "Opening cgroup stats stream"
        );

        tokio::spawn(async move {
            let mut ticker = interval(poll_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately and the baseline is already read
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = tx.closed() => break,
                    _ = ticker.tick() => {}
                }

                match Self::read_counters(&cgroup_path).await {
                    Ok(current) => {
                        let now = Instant::now();
                        let raw = to_raw_stats(&previous, &current, now - previous_at);
                        previous = current;
                        previous_at = now;
                        if tx.send(Ok(raw)).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        // Cgroup removed: the container is gone
                        let _ = tx.send(Err(e)).await;
                        break;
                    }
                }
            }

            debug!(container_id = %container_id, "cgroup stats poller stopped");
        });

        Ok(Box::pin(ReceiverStream::new(rx)))
    }

    async fn list_running_containers(&self) -> Result<Vec<String>> {
        self.discover().await
    }
}
