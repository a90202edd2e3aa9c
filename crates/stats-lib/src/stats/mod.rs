//! Sample windows, per-container trackers and the task index

pub mod index;
pub mod queue;
pub mod tracker;
pub mod window;

pub use index::{TaskDefinition, TaskIndex, TaskSnapshot, TrackingKind};
pub use queue::{compute_sample, IntervalSample, StatsQueue, StorageDelta};
pub use tracker::Tracker;
pub use window::{StatsWindow, DEFAULT_WINDOW_CAPACITY};
