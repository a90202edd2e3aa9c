//! Fixed-capacity sample window
//!
//! Holds the most recent samples of one metric stream of one container with
//! FIFO eviction, and folds them into a [`StatsSet`] on demand.

use crate::models::StatsSet;
use chrono::{DateTime, Utc};
use std::collections::VecDeque;

/// Default window capacity (samples)
pub const DEFAULT_WINDOW_CAPACITY: usize = 30;

/// A timestamped observation of one metric stream
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Sample {
    pub timestamp: DateTime<Utc>,
    pub value: f64,
}

/// Bounded, time-ordered buffer of samples
#[derive(Debug, Clone)]
pub struct StatsWindow {
    samples: VecDeque<Sample>,
    capacity: usize,
}

impl StatsWindow {
    /// Create a window holding at most `capacity` samples
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            samples: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Append a sample, evicting the oldest one when full
    ///
    /// Samples must arrive in non-decreasing timestamp order. One older than
    /// the newest buffered sample is rejected and `false` is returned; an
    /// equal timestamp is accepted.
    pub fn add(&mut self, timestamp: DateTime<Utc>, value: f64) -> bool {
        if self.latest().is_some_and(|latest| timestamp < latest) {
            return false;
        }
        while self.samples.len() >= self.capacity {
            self.samples.pop_front();
        }
        self.samples.push_back(Sample { timestamp, value });
        true
    }

    /// Fold the buffered samples into min/max/sum/count
    ///
    /// Returns `None` when the window is empty.
    pub fn aggregate(&self) -> Option<StatsSet> {
        let mut iter = self.samples.iter();
        let first = iter.next()?;

        let init = StatsSet::single(first.value);
        Some(iter.fold(init, |mut set, sample| {
            set.min = set.min.min(sample.value);
            set.max = set.max.max(sample.value);
            set.sum += sample.value;
            set.count += 1;
            set
        }))
    }

    /// Drop every buffered sample
    pub fn clear(&mut self) {
        self.samples.clear();
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Timestamp of the newest sample
    pub fn latest(&self) -> Option<DateTime<Utc>> {
        self.samples.back().map(|s| s.timestamp)
    }
}

impl Default for StatsWindow {
    fn default() -> Self {
        Self::new(DEFAULT_WINDOW_CAPACITY)
    }
}
