use std::collections::BTreeMap;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use statrs::statistics::{Data, Median, OrderStatistics};

use chaincore::data::cluster::{ClusterShape, FrameClusterSet};
use chaincore::{Result, TrackError};

use crate::tracking::events::{ClusterId, LifecycleEvent};

/// Running mean/variance of per-step centroid squared displacement, plus a bounded
/// reservoir sample for order statistics.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MobilityAccumulator {
    count: u64,
    sum: f64,
    // Welford
    mean: f64,
    m2: f64,
    reservoir: Vec<f64>,
    capacity: usize,
    seed: u64,
}

impl MobilityAccumulator {
    pub fn new(capacity: usize, seed: u64) -> Self {
        Self { count: 0, sum: 0.0, mean: 0.0, m2: 0.0, reservoir: Vec::with_capacity(capacity.min(1024)), capacity, seed }
    }

    pub fn push(&mut self, x: f64) {
        if !x.is_finite() {
            return;
        }
        self.count += 1;
        self.sum += x;
        let delta = x - self.mean;
        self.mean += delta / self.count as f64;
        self.m2 += delta * (x - self.mean);

        // Algorithm R; each draw is keyed by (seed, ordinal) so resumed runs sample identically
        if self.reservoir.len() < self.capacity {
            self.reservoir.push(x);
        } else {
            let mut rng = StdRng::seed_from_u64(self.seed ^ self.count.wrapping_mul(0x9e37_79b9_7f4a_7c15));
            let j = rng.gen_range(0..self.count);
            if (j as usize) < self.capacity {
                self.reservoir[j as usize] = x;
            }
        }
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    pub fn mean(&self) -> Option<f64> {
        (self.count > 0).then(|| self.sum / self.count as f64)
    }

    /// Sample variance (n - 1 denominator).
    pub fn variance(&self) -> Option<f64> {
        (self.count > 1).then(|| self.m2 / (self.count - 1) as f64)
    }

    pub fn reservoir(&self) -> &[f64] {
        &self.reservoir
    }

    pub fn summary(&self) -> MobilitySummary {
        let (median, p90) = if self.reservoir.is_empty() {
            (None, None)
        } else {
            let mut data = Data::new(self.reservoir.clone());
            (Some(data.median()), Some(data.percentile(90)))
        };
        MobilitySummary {
            steps: self.count,
            mean_sq_displacement: self.mean(),
            variance: self.variance(),
            median,
            p90,
            reservoir_len: self.reservoir.len(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MobilitySummary {
    pub steps: u64,
    pub mean_sq_displacement: Option<f64>,
    pub variance: Option<f64>,
    /// Estimated from the reservoir.
    pub median: Option<f64>,
    pub p90: Option<f64>,
    pub reservoir_len: usize,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShapeCounts {
    pub singleton: usize,
    pub chain: usize,
    pub ring: usize,
    pub branched: usize,
}

impl ShapeCounts {
    fn from_set(set: &FrameClusterSet) -> Self {
        let mut counts = ShapeCounts::default();
        for c in set.iter() {
            match c.shape {
                ClusterShape::Singleton => counts.singleton += 1,
                ClusterShape::Chain => counts.chain += 1,
                ClusterShape::Ring => counts.ring += 1,
                ClusterShape::Branched => counts.branched += 1,
            }
        }
        counts
    }
}

/// Pull-based snapshot; valid mid-run and at the end of a trajectory.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StatisticsSummary {
    pub frames_processed: u64,
    pub last_frame: Option<u64>,
    pub live_clusters: usize,
    /// Completed lifetimes (frames observed between birth and death) -> count.
    pub lifetime_histogram: BTreeMap<u64, u64>,
    /// Lifetimes so far of tracks still alive.
    pub censored_lifetime_histogram: BTreeMap<u64, u64>,
    /// Sampled (frame, size) series per live identity.
    pub size_series: BTreeMap<ClusterId, Vec<(u64, usize)>>,
    pub birth_count: u64,
    pub death_count: u64,
    pub merge_count: u64,
    pub split_count: u64,
    pub mobility: MobilitySummary,
    /// Shapes of the clusters in the latest frame.
    pub shapes: ShapeCounts,
    /// Chain-shaped cluster observations over all frames.
    pub chain_observations: u64,
    pub finalized: bool,
}

impl StatisticsSummary {
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self).map_err(|e| TrackError::Export(e.to_string()))
    }

    pub fn completed_lifetimes(&self) -> u64 {
        self.lifetime_histogram.values().sum()
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
struct LiveRecord {
    birth_frame: u64,
    frames_observed: u64,
    series: Vec<(u64, usize)>,
}

/// Folds the event stream into running statistics without retaining history.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StatisticsAggregator {
    stride: u64,
    live: FxHashMap<ClusterId, LiveRecord>,
    lifetimes: BTreeMap<u64, u64>,
    births: u64,
    deaths: u64,
    merges: u64,
    splits: u64,
    mobility: MobilityAccumulator,
    shapes: ShapeCounts,
    chain_observations: u64,
    frames: u64,
    last_frame: Option<u64>,
}

impl StatisticsAggregator {
    pub fn new(stride: u64, reservoir_capacity: usize, seed: u64) -> Self {
        Self {
            stride: stride.max(1),
            live: FxHashMap::default(),
            lifetimes: BTreeMap::new(),
            births: 0,
            deaths: 0,
            merges: 0,
            splits: 0,
            mobility: MobilityAccumulator::new(reservoir_capacity, seed),
            shapes: ShapeCounts::default(),
            chain_observations: 0,
            frames: 0,
            last_frame: None,
        }
    }

    /// Fold one committed transition: the new frame's clusters and its events.
    pub fn fold(&mut self, set: &FrameClusterSet, events: &[LifecycleEvent]) {
        for event in events {
            match event {
                LifecycleEvent::Birth { frame, id, size, .. } => {
                    self.births += 1;
                    self.live.insert(*id, LiveRecord { birth_frame: *frame, frames_observed: 0, series: Vec::new() });
                    self.observe(*id, *frame, *size);
                }
                LifecycleEvent::Death { id, .. } => {
                    self.deaths += 1;
                    if let Some(rec) = self.live.remove(id) {
                        *self.lifetimes.entry(rec.frames_observed).or_default() += 1;
                    }
                }
                LifecycleEvent::Merge { .. } | LifecycleEvent::Split { .. } => {
                    if matches!(event, LifecycleEvent::Merge { .. }) {
                        self.merges += 1;
                    } else {
                        self.splits += 1;
                    }
                    if let Some((id, size)) = event.observed() {
                        self.observe(id, event.frame(), size);
                    }
                }
                LifecycleEvent::Continuation { .. } | LifecycleEvent::Growth { .. } | LifecycleEvent::Shrink { .. } => {
                    if let Some(d2) = event.displacement_sq() {
                        self.mobility.push(d2);
                    }
                    if let Some((id, size)) = event.observed() {
                        self.observe(id, event.frame(), size);
                    }
                }
            }
        }

        self.shapes = ShapeCounts::from_set(set);
        self.chain_observations += self.shapes.chain as u64;
        self.frames += 1;
        self.last_frame = Some(set.frame);
    }

    /// Every `stride`-th observation of a track is sampled, counted from its birth.
    fn observe(&mut self, id: ClusterId, frame: u64, size: usize) {
        let stride = self.stride;
        if let Some(rec) = self.live.get_mut(&id) {
            if rec.frames_observed % stride == 0 {
                rec.series.push((frame, size));
            }
            rec.frames_observed += 1;
        }
    }

    pub fn live_count(&self) -> usize {
        self.live.len()
    }

    /// Birth frame of a live identity.
    pub fn birth_frame(&self, id: ClusterId) -> Option<u64> {
        self.live.get(&id).map(|r| r.birth_frame)
    }

    pub fn summary(&self) -> StatisticsSummary {
        let mut censored = BTreeMap::new();
        for rec in self.live.values() {
            *censored.entry(rec.frames_observed).or_default() += 1;
        }
        let size_series = self.live.iter().map(|(id, rec)| (*id, rec.series.clone())).collect();

        StatisticsSummary {
            frames_processed: self.frames,
            last_frame: self.last_frame,
            live_clusters: self.live.len(),
            lifetime_histogram: self.lifetimes.clone(),
            censored_lifetime_histogram: censored,
            size_series,
            birth_count: self.births,
            death_count: self.deaths,
            merge_count: self.merges,
            split_count: self.splits,
            mobility: self.mobility.summary(),
            shapes: self.shapes.clone(),
            chain_observations: self.chain_observations,
            finalized: false,
        }
    }

    /// Final summary at end of trajectory; surviving tracks stay censored.
    pub fn finalize(&self) -> StatisticsSummary {
        let mut summary = self.summary();
        summary.finalized = true;
        tracing::info!(
            frames = summary.frames_processed,
            completed = summary.completed_lifetimes(),
            censored = summary.live_clusters,
            merges = summary.merge_count,
            splits = summary.split_count,
            "statistics finalized"
        );
        summary
    }
}
