//! Call statistics for progress estimation.

mod tracker;

pub use tracker::{
    CallStatEntry, CallStatsTracker, CallToken, MAX_RUNNING_FRACTION, MIN_SAMPLE, Progress,
};
