use serde::{Deserialize, Serialize};

use chaincore::algorithm::connectivity::ConnectivityDetector;
use chaincore::data::cluster::FrameClusterSet;
use chaincore::data::particle::Frame;
use chaincore::{Result, TrackError};

use crate::tracking::config::TrackerConfig;
use crate::tracking::events::{EventClassifier, LifecycleEvent};
use crate::tracking::matching::CorrespondenceMatcher;
use crate::tracking::state::ClusterTrackState;
use crate::tracking::stats::{StatisticsAggregator, StatisticsSummary};

const CHECKPOINT_VERSION: u32 = 1;

#[derive(Serialize, Deserialize)]
struct Checkpoint {
    version: u32,
    config: TrackerConfig,
    state: ClusterTrackState,
    stats: StatisticsAggregator,
}

/// Frame-sequential driver: detect -> match -> classify -> commit -> fold.
///
/// A transition is committed only after it has been fully classified, so an error
/// leaves the tracker at the last committed frame.
#[derive(Clone, Debug)]
pub struct ClusterTracker {
    config: TrackerConfig,
    detector: ConnectivityDetector,
    matcher: CorrespondenceMatcher,
    classifier: EventClassifier,
    state: ClusterTrackState,
    stats: StatisticsAggregator,
}

impl ClusterTracker {
    /// Creates a new `ClusterTracker`.
    ///
    /// # Examples
    ///
    /// ```
    /// use chaincore::data::particle::Frame;
    /// use chaintrack::{ClusterTracker, TrackerConfig};
    ///
    /// let mut tracker = ClusterTracker::new(TrackerConfig::with_radius(1.0)).unwrap();
    /// let frame = Frame::from_positions(0, vec![(1, vec![0.0]), (2, vec![0.5]), (3, vec![9.0])]).unwrap();
    /// let events = tracker.process_frame(&frame).unwrap();
    /// assert_eq!(events.len(), 2);
    /// assert_eq!(tracker.summary().live_clusters, 2);
    /// ```
    pub fn new(config: TrackerConfig) -> Result<Self> {
        let state = ClusterTrackState::new();
        let stats = StatisticsAggregator::new(config.size_series_stride, config.reservoir_capacity, config.reservoir_seed);
        Self::assemble(config, state, stats)
    }

    fn assemble(config: TrackerConfig, state: ClusterTrackState, stats: StatisticsAggregator) -> Result<Self> {
        config.validate()?;
        let detector = ConnectivityDetector::new(config.connectivity_params())?;
        let matcher = CorrespondenceMatcher::new(config.match_params());
        let classifier = EventClassifier::new(config.size_tolerance, config.check_conservation);
        Ok(Self { config, detector, matcher, classifier, state, stats })
    }

    pub fn config(&self) -> &TrackerConfig {
        &self.config
    }

    pub fn state(&self) -> &ClusterTrackState {
        &self.state
    }

    /// Detect clusters in `frame` and advance the tracker by one transition.
    pub fn process_frame(&mut self, frame: &Frame) -> Result<Vec<LifecycleEvent>> {
        self.state.check_order(frame.index)?;
        let set = self.detector.detect(frame)?;
        self.process_clusters(set)
    }

    /// Advance by one transition using an already built cluster set.
    pub fn process_clusters(&mut self, set: FrameClusterSet) -> Result<Vec<LifecycleEvent>> {
        self.state.check_order(set.frame)?;

        let plan = match self.state.previous() {
            None => self.classifier.initial(&self.state, &set),
            Some(prev) => {
                let corr = self.matcher.correspond(prev, &set);
                if corr.peels > 0 {
                    tracing::debug!(frame = set.frame, peels = corr.peels, "resolved many-to-many correspondence");
                }
                self.classifier.classify(&self.state, prev, &set, &corr)?
            }
        };

        let events = plan.events.clone();
        let (frame, clusters) = (set.frame, set.len());
        self.state.commit(plan, set)?;
        if let Some(committed) = self.state.previous() {
            self.stats.fold(committed, &events);
        }

        tracing::debug!(frame, clusters, events = events.len(), live = self.state.live_count(), "frame committed");
        Ok(events)
    }

    /// Process a whole trajectory and return the finalized summary.
    pub fn run<I>(mut self, frames: I) -> Result<StatisticsSummary>
    where
        I: IntoIterator<Item = Frame>,
    {
        for frame in frames {
            self.process_frame(&frame)?;
        }
        Ok(self.finalize())
    }

    /// Partial statistics, valid at any checkpoint boundary.
    pub fn summary(&self) -> StatisticsSummary {
        self.stats.summary()
    }

    pub fn finalize(self) -> StatisticsSummary {
        self.stats.finalize()
    }

    /// Encode the committed state and statistics.
    pub fn checkpoint(&self) -> Result<Vec<u8>> {
        let cp = Checkpoint {
            version: CHECKPOINT_VERSION,
            config: self.config.clone(),
            state: self.state.clone(),
            stats: self.stats.clone(),
        };
        bincode::serialize(&cp).map_err(|e| TrackError::Checkpoint(e.to_string()))
    }

    /// Restore a tracker from `checkpoint()` bytes.
    pub fn resume(bytes: &[u8]) -> Result<Self> {
        let cp: Checkpoint = bincode::deserialize(bytes).map_err(|e| {
            tracing::error!(len = bytes.len(), "undecodable checkpoint");
            TrackError::Checkpoint(e.to_string())
        })?;
        if cp.version != CHECKPOINT_VERSION {
            return Err(TrackError::Checkpoint(format!("unsupported checkpoint version {}", cp.version)));
        }
        tracing::info!(last_frame = ?cp.state.last_frame(), live = cp.state.live_count(), "resumed from checkpoint");
        Self::assemble(cp.config, cp.state, cp.stats)
    }
}
