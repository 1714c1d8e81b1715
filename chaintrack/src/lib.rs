// src/lib.rs
pub mod tracking {
    pub mod config;
    pub mod matching;
    pub mod events;
    pub mod state;
    pub mod stats;
    pub mod tracker;
}

// Re-export commonly used types
pub use tracking::config::TrackerConfig;
pub use tracking::events::{ClusterId, LifecycleEvent};
pub use tracking::stats::StatisticsSummary;
pub use tracking::tracker::ClusterTracker;
