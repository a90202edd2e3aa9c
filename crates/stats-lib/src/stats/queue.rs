//! Per-container sample queue
//!
//! Groups the statistic windows of one container together with the last raw
//! observation used for delta computation. The lock is scoped to this one
//! container, so the collection routine and publish-time aggregation never
//! contend on the task index.

use super::window::StatsWindow;
use crate::models::{
    ContainerMetrics, NetworkCounters, NetworkStatsSet, RawStats, StatsSet, StorageStatsSet,
};
use chrono::{DateTime, Utc};
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Values for one observation after cumulative counters were diffed
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct IntervalSample {
    pub timestamp: DateTime<Utc>,
    pub cpu_usage_percent: f64,
    pub memory_usage_bytes: f64,
    /// `None` on the first observation, when there is nothing to diff against
    pub storage: Option<StorageDelta>,
    pub network: Option<NetworkCounters>,
}

/// Storage bytes moved during one interval
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StorageDelta {
    pub read_bytes: u64,
    pub write_bytes: u64,
}

/// Difference of a cumulative counter; a counter that went backwards
/// (source restart) contributes its current value
fn counter_delta(previous: u64, current: u64) -> u64 {
    if current >= previous {
        current - previous
    } else {
        current
    }
}

/// Convert a raw observation into interval values
///
/// CPU and memory are copied as-is. Storage and network counters are diffed
/// against `previous`; without one they contribute nothing.
pub fn compute_sample(previous: Option<&RawStats>, current: &RawStats) -> IntervalSample {
    let storage = previous.map(|prev| StorageDelta {
        read_bytes: counter_delta(prev.storage_read_bytes, current.storage_read_bytes),
        write_bytes: counter_delta(prev.storage_write_bytes, current.storage_write_bytes),
    });

    let network = match (previous.and_then(|p| p.network), current.network) {
        (Some(prev), Some(curr)) => Some(NetworkCounters {
            rx_bytes: counter_delta(prev.rx_bytes, curr.rx_bytes),
            tx_bytes: counter_delta(prev.tx_bytes, curr.tx_bytes),
            rx_packets: counter_delta(prev.rx_packets, curr.rx_packets),
            tx_packets: counter_delta(prev.tx_packets, curr.tx_packets),
        }),
        _ => None,
    };

    IntervalSample {
        timestamp: current.read,
        cpu_usage_percent: current.cpu_usage_percent,
        memory_usage_bytes: current.memory_usage_bytes as f64,
        storage,
        network,
    }
}

#[derive(Debug)]
struct Windows {
    cpu: StatsWindow,
    memory: StatsWindow,
    storage_read: StatsWindow,
    storage_write: StatsWindow,
    net_rx_bytes: StatsWindow,
    net_tx_bytes: StatsWindow,
    net_rx_packets: StatsWindow,
    net_tx_packets: StatsWindow,
    /// Newest timestamp ever windowed; survives clears
    newest: Option<DateTime<Utc>>,
    last_raw: Option<RawStats>,
}

impl Windows {
    fn new(capacity: usize) -> Self {
        Self {
            cpu: StatsWindow::new(capacity),
            memory: StatsWindow::new(capacity),
            storage_read: StatsWindow::new(capacity),
            storage_write: StatsWindow::new(capacity),
            net_rx_bytes: StatsWindow::new(capacity),
            net_tx_bytes: StatsWindow::new(capacity),
            net_rx_packets: StatsWindow::new(capacity),
            net_tx_packets: StatsWindow::new(capacity),
            newest: None,
            last_raw: None,
        }
    }

    fn push(&mut self, sample: &IntervalSample) -> bool {
        let ts = sample.timestamp;
        if self.newest.is_some_and(|newest| ts < newest) {
            return false;
        }
        self.newest = Some(ts);

        self.cpu.add(ts, sample.cpu_usage_percent);
        self.memory.add(ts, sample.memory_usage_bytes);

        if let Some(storage) = sample.storage {
            self.storage_read.add(ts, storage.read_bytes as f64);
            self.storage_write.add(ts, storage.write_bytes as f64);
        }

        if let Some(net) = sample.network {
            self.net_rx_bytes.add(ts, net.rx_bytes as f64);
            self.net_tx_bytes.add(ts, net.tx_bytes as f64);
            self.net_rx_packets.add(ts, net.rx_packets as f64);
            self.net_tx_packets.add(ts, net.tx_packets as f64);
        }
        true
    }

    fn storage(&self) -> Option<StorageStatsSet> {
        Some(StorageStatsSet {
            read_size_bytes: self.storage_read.aggregate()?,
            write_size_bytes: self.storage_write.aggregate()?,
        })
    }

    fn network(&self) -> Option<NetworkStatsSet> {
        Some(NetworkStatsSet {
            rx_bytes: self.net_rx_bytes.aggregate()?,
            tx_bytes: self.net_tx_bytes.aggregate()?,
            rx_packets: self.net_rx_packets.aggregate()?,
            tx_packets: self.net_tx_packets.aggregate()?,
        })
    }

    fn all_mut(&mut self) -> [&mut StatsWindow; 8] {
        [
            &mut self.cpu,
            &mut self.memory,
            &mut self.storage_read,
            &mut self.storage_write,
            &mut self.net_rx_bytes,
            &mut self.net_tx_bytes,
            &mut self.net_rx_packets,
            &mut self.net_tx_packets,
        ]
    }
}

/// Statistic windows and last raw sample of one container
#[derive(Debug)]
pub struct StatsQueue {
    inner: RwLock<Windows>,
}

impl StatsQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: RwLock::new(Windows::new(capacity)),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, Windows> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Windows> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Push already-computed interval values into the windows
    ///
    /// Returns `false` for a sample older than one already windowed.
    pub fn add(&self, sample: &IntervalSample) -> bool {
        self.write().push(sample)
    }

    /// Diff a raw observation against the last one, window it and remember it
    ///
    /// An observation read before the last one is discarded and `false` is
    /// returned: windowing it would diff counters across a rewound baseline.
    /// An observation with the same read time is accepted.
    pub fn ingest(&self, raw: RawStats) -> bool {
        let mut windows = self.write();
        if windows.last_raw.as_ref().is_some_and(|last| raw.read < last.read) {
            return false;
        }
        let sample = compute_sample(windows.last_raw.as_ref(), &raw);
        if !windows.push(&sample) {
            return false;
        }
        windows.last_raw = Some(raw);
        true
    }

    pub fn last_raw_sample(&self) -> Option<RawStats> {
        self.read().last_raw.clone()
    }

    pub fn set_last_raw_sample(&self, raw: RawStats) {
        self.write().last_raw = Some(raw);
    }

    pub fn cpu_stats_set(&self) -> Option<StatsSet> {
        self.read().cpu.aggregate()
    }

    pub fn memory_stats_set(&self) -> Option<StatsSet> {
        self.read().memory.aggregate()
    }

    /// Read and write sets, present only when both have data
    pub fn storage_stats_set(&self) -> Option<StorageStatsSet> {
        self.read().storage()
    }

    pub fn network_stats_set(&self) -> Option<NetworkStatsSet> {
        self.read().network()
    }

    /// Aggregate every window under a single read lock
    pub fn container_metrics(&self, container_name: &str) -> ContainerMetrics {
        let windows = self.read();
        ContainerMetrics {
            container_name: container_name.to_string(),
            cpu: windows.cpu.aggregate(),
            memory: windows.memory.aggregate(),
            storage: windows.storage(),
            network: windows.network(),
        }
    }

    /// Clear every window, keeping the last raw sample for the next delta
    pub fn reset(&self) {
        let mut windows = self.write();
        for window in windows.all_mut() {
            window.clear();
        }
    }

    /// Aggregate and clear under one write lock, so no sample lands between
    /// the two and goes unreported
    pub fn drain_metrics(&self, container_name: &str) -> ContainerMetrics {
        let mut windows = self.write();
        let metrics = ContainerMetrics {
            container_name: container_name.to_string(),
            cpu: windows.cpu.aggregate(),
            memory: windows.memory.aggregate(),
            storage: windows.storage(),
            network: windows.network(),
        };
        for window in windows.all_mut() {
            window.clear();
        }
        metrics
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw(offset_secs: i64, read_bytes: u64, write_bytes: u64) -> RawStats {
        RawStats {
            read: DateTime::from_timestamp(1_700_000_000 + offset_secs, 0).unwrap(),
            cpu_usage_percent: 12.5,
            memory_usage_bytes: 1024,
            storage_read_bytes: read_bytes,
            storage_write_bytes: write_bytes,
            network: None,
        }
    }

    #[test]
    fn test_compute_sample_first_observation() {
        let current = raw(0, 500, 700);
        let sample = compute_sample(None, &current);

        assert_eq!(sample.cpu_usage_percent, 12.5);
        assert_eq!(sample.memory_usage_bytes, 1024.0);
        assert_eq!(sample.storage, None);
        assert_eq!(sample.network, None);
    }

    #[test]
    fn test_compute_sample_diffs_cumulative_counters() {
        let mut previous = raw(0, 500, 700);
        previous.network = Some(NetworkCounters {
            rx_bytes: 10,
            tx_bytes: 20,
            rx_packets: 1,
            tx_packets: 2,
        });
        let mut current = raw(1, 600, 900);
        current.network = Some(NetworkCounters {
            rx_bytes: 15,
            tx_bytes: 50,
            rx_packets: 3,
            tx_packets: 2,
        });

        let sample = compute_sample(Some(&previous), &current);
        assert_eq!(
            sample.storage,
            Some(StorageDelta {
                read_bytes: 100,
                write_bytes: 200
            })
        );
        assert_eq!(
            sample.network,
            Some(NetworkCounters {
                rx_bytes: 5,
                tx_bytes: 30,
                rx_packets: 2,
                tx_packets: 0,
            })
        );
    }

    #[test]
    fn test_compute_sample_counter_reset() {
        let previous = raw(0, 1_000, 1_000);
        let current = raw(1, 40, 1_010);

        let sample = compute_sample(Some(&previous), &current);
        assert_eq!(
            sample.storage,
            Some(StorageDelta {
                read_bytes: 40,
                write_bytes: 10
            })
        );
    }

    #[test]
    fn test_late_observation_is_discarded() {
        let queue = StatsQueue::new(10);
        assert!(queue.ingest(raw(0, 1_000, 0)));
        assert!(queue.ingest(raw(10, 1_100, 0)));
        assert!(!queue.ingest(raw(5, 1_050, 0)));

        let storage = queue.storage_stats_set().unwrap();
        assert_eq!(storage.read_size_bytes.count, 1);
        assert_eq!(storage.read_size_bytes.sum, 100.0);
        assert_eq!(queue.cpu_stats_set().unwrap().count, 2);
        assert_eq!(queue.last_raw_sample().unwrap().read, raw(10, 0, 0).read);

        // The baseline is untouched, so the next delta is measured from t10
        assert!(queue.ingest(raw(20, 1_400, 0)));
        assert_eq!(queue.storage_stats_set().unwrap().read_size_bytes.sum, 400.0);
    }

    #[test]
    fn test_same_read_time_is_accepted() {
        let queue = StatsQueue::new(10);
        assert!(queue.ingest(raw(0, 1_000, 0)));
        assert!(queue.ingest(raw(0, 1_000, 0)));

        let storage = queue.storage_stats_set().unwrap();
        assert_eq!(storage.read_size_bytes.sum, 0.0);
        assert_eq!(queue.cpu_stats_set().unwrap().count, 2);
    }

    #[test]
    fn test_add_rejects_samples_older_than_a_drained_interval() {
        let queue = StatsQueue::new(10);
        let sample = compute_sample(None, &raw(10, 0, 0));
        assert!(queue.add(&sample));
        queue.drain_metrics("app");

        let late = compute_sample(None, &raw(5, 0, 0));
        assert!(!queue.add(&late));
        assert_eq!(queue.cpu_stats_set(), None);
    }

    #[test]
    fn test_seeded_last_sample_is_delta_base() {
        let queue = StatsQueue::new(10);
        queue.set_last_raw_sample(raw(0, 1_000, 400));
        assert!(queue.storage_stats_set().is_none());

        queue.ingest(raw(1, 1_050, 450));
        let storage = queue.storage_stats_set().unwrap();
        assert_eq!(storage.read_size_bytes.sum, 50.0);
        assert_eq!(storage.write_size_bytes.sum, 50.0);
    }

    #[test]
    fn test_ingest_read_deltas() {
        let queue = StatsQueue::new(10);
        queue.ingest(raw(0, 1_000, 0));
        queue.ingest(raw(1, 1_100, 0));
        queue.ingest(raw(2, 1_300, 0));

        let storage = queue.storage_stats_set().unwrap();
        assert_eq!(
            storage.read_size_bytes,
            StatsSet {
                min: 100.0,
                max: 200.0,
                sum: 300.0,
                count: 2,
            }
        );
        // CPU and memory are windowed for every observation
        assert_eq!(queue.cpu_stats_set().unwrap().count, 3);
        assert_eq!(queue.memory_stats_set().unwrap().count, 3);
        assert_eq!(queue.last_raw_sample().unwrap().storage_read_bytes, 1_300);
    }

    #[test]
    fn test_network_absent_without_counters() {
        let queue = StatsQueue::new(10);
        queue.ingest(raw(0, 0, 0));
        queue.ingest(raw(1, 0, 0));

        assert!(queue.network_stats_set().is_none());
        let metrics = queue.container_metrics("web");
        assert!(metrics.network.is_none());
        assert!(metrics.storage.is_some());
        assert_eq!(metrics.container_name, "web");
    }

    #[test]
    fn test_drain_metrics_clears_windows() {
        let queue = StatsQueue::new(10);
        queue.ingest(raw(0, 100, 0));
        queue.ingest(raw(1, 130, 0));

        let drained = queue.drain_metrics("web");
        assert_eq!(drained.cpu.unwrap().count, 2);
        assert_eq!(drained.storage.unwrap().read_size_bytes.sum, 30.0);
        assert!(queue.container_metrics("web").is_empty());
    }

    #[test]
    fn test_reset_keeps_last_raw() {
        let queue = StatsQueue::new(10);
        queue.ingest(raw(0, 100, 0));
        queue.ingest(raw(1, 150, 0));
        queue.reset();

        assert!(queue.container_metrics("c").is_empty());
        assert!(queue.last_raw_sample().is_some());

        // The next observation still diffs against the retained sample
        queue.ingest(raw(2, 170, 0));
        assert_eq!(queue.storage_stats_set().unwrap().read_size_bytes.sum, 20.0);
    }
}
