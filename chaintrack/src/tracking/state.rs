use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use chaincore::data::cluster::{Cluster, FrameClusterSet};
use chaincore::{Result, TrackError};

use crate::tracking::events::{ClusterId, LifecycleEvent, TransitionPlan};

/// Running size summary of one track.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SizeSummary {
    pub initial: usize,
    pub current: usize,
    pub min: usize,
    pub max: usize,
    pub sum: u64,
    pub observations: u64,
}

impl SizeSummary {
    fn new(size: usize) -> Self {
        Self { initial: size, current: size, min: size, max: size, sum: size as u64, observations: 1 }
    }

    fn record(&mut self, size: usize) {
        self.current = size;
        self.min = self.min.min(size);
        self.max = self.max.max(size);
        self.sum += size as u64;
        self.observations += 1;
    }

    pub fn mean(&self) -> f64 {
        if self.observations == 0 { 0.0 } else { self.sum as f64 / self.observations as f64 }
    }
}

/// Identity held for one live persistent cluster.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ClusterTrack {
    pub id: ClusterId,
    pub birth_frame: u64,
    pub last_seen: u64,
    pub cluster: Cluster,
    pub sizes: SizeSummary,
    pub event_count: u64,
}

impl ClusterTrack {
    /// Frames observed so far, birth frame included.
    pub fn frames_observed(&self) -> u64 {
        self.sizes.observations
    }
}

/// The only mutable entity of a run: live tracks plus the previous frame's clusters.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ClusterTrackState {
    tracks: BTreeMap<ClusterId, ClusterTrack>,
    previous: Option<FrameClusterSet>,
    previous_ids: Vec<ClusterId>,
    last_frame: Option<u64>,
    next_id: u64,
    retired: u64,
}

impl ClusterTrackState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fails with `OutOfOrderFrame` unless `frame` is strictly after the last committed frame.
    pub fn check_order(&self, frame: u64) -> Result<()> {
        match self.last_frame {
            Some(last) if frame <= last => {
                tracing::error!(last, frame, "out-of-order frame");
                Err(TrackError::OutOfOrderFrame { last, got: frame })
            }
            _ => Ok(()),
        }
    }

    pub fn last_frame(&self) -> Option<u64> {
        self.last_frame
    }

    pub fn previous(&self) -> Option<&FrameClusterSet> {
        self.previous.as_ref()
    }

    /// Identity of each cluster in the previous frame, by cluster index.
    pub fn previous_ids(&self) -> &[ClusterId] {
        &self.previous_ids
    }

    pub fn next_id(&self) -> u64 {
        self.next_id
    }

    pub fn live_count(&self) -> usize {
        self.tracks.len()
    }

    /// Number of identities that have died so far.
    pub fn retired_count(&self) -> u64 {
        self.retired
    }

    pub fn track(&self, id: ClusterId) -> Result<&ClusterTrack> {
        self.tracks.get(&id).ok_or(TrackError::UnknownCluster(id.0))
    }

    /// Live tracks in identity order.
    pub fn tracks(&self) -> impl Iterator<Item = &ClusterTrack> {
        self.tracks.values()
    }

    /// Live identity currently holding `particle`, if any.
    pub fn id_of_particle(&self, particle: u64) -> Option<ClusterId> {
        let set = self.previous.as_ref()?;
        set.cluster_of(particle).and_then(|ci| self.previous_ids.get(ci).copied())
    }

    /// Apply a classified transition and make `next` the new previous frame.
    pub fn commit(&mut self, plan: TransitionPlan, next: FrameClusterSet) -> Result<()> {
        self.check_order(plan.frame)?;
        if plan.ids.len() != next.len() || plan.next_id < self.next_id {
            return Err(TrackError::ConservationViolation {
                frame: plan.frame,
                side: "to",
                expected: next.len(),
                found: plan.ids.len(),
            });
        }
        let frame = plan.frame;

        for event in &plan.events {
            if let LifecycleEvent::Death { id, .. } = event {
                if self.tracks.remove(id).is_some() {
                    self.retired += 1;
                }
            }
        }

        for (ci, &id) in plan.ids.iter().enumerate() {
            let cluster = next.clusters()[ci].clone();
            match self.tracks.get_mut(&id) {
                Some(track) => {
                    track.sizes.record(cluster.size());
                    track.cluster = cluster;
                    track.last_seen = frame;
                }
                None => {
                    let sizes = SizeSummary::new(cluster.size());
                    self.tracks.insert(
                        id,
                        ClusterTrack { id, birth_frame: frame, last_seen: frame, cluster, sizes, event_count: 0 },
                    );
                }
            }
        }

        for event in &plan.events {
            if let Some(track) = self.tracks.get_mut(&event.id()) {
                track.event_count += 1;
            }
        }

        self.previous_ids = plan.ids;
        self.previous = Some(next);
        self.last_frame = Some(frame);
        self.next_id = plan.next_id;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chaincore::data::cluster::ClusterShape;
    use crate::tracking::events::{BirthOrigin, EventClassifier};

    fn set(frame: u64, groups: &[&[u64]]) -> FrameClusterSet {
        let clusters = groups.iter().map(|g| Cluster::new(g.to_vec(), vec![0.0], ClusterShape::Branched)).collect();
        FrameClusterSet::from_clusters(frame, clusters).unwrap()
    }

    #[test]
    fn test_initial_commit() {
        let mut state = ClusterTrackState::new();
        let first = set(3, &[&[1, 2], &[5]]);
        let plan = EventClassifier::new(0, true).initial(&state, &first);
        state.commit(plan, first).unwrap();

        assert_eq!(state.live_count(), 2);
        assert_eq!(state.last_frame(), Some(3));
        assert_eq!(state.next_id(), 2);
        assert_eq!(state.id_of_particle(5), Some(ClusterId(1)));
        let track = state.track(ClusterId(0)).unwrap();
        assert_eq!(track.birth_frame, 3);
        assert_eq!(track.event_count, 1);
    }

    #[test]
    fn test_out_of_order_rejected() {
        let mut state = ClusterTrackState::new();
        let first = set(5, &[&[1]]);
        let plan = EventClassifier::new(0, true).initial(&state, &first);
        state.commit(plan, first).unwrap();

        assert_eq!(state.check_order(5).unwrap_err(), TrackError::OutOfOrderFrame { last: 5, got: 5 });
        assert_eq!(state.check_order(2).unwrap_err(), TrackError::OutOfOrderFrame { last: 5, got: 2 });
        assert!(state.check_order(6).is_ok());
    }

    #[test]
    fn test_death_retires_track() {
        let mut state = ClusterTrackState::new();
        let first = set(0, &[&[1, 2]]);
        let plan = EventClassifier::new(0, true).initial(&state, &first);
        state.commit(plan, first).unwrap();

        let plan = TransitionPlan {
            frame: 1,
            events: vec![
                LifecycleEvent::Death {
                    frame: 1,
                    id: ClusterId(0),
                    last_size: 2,
                    cause: crate::tracking::events::DeathCause::Dissolved,
                },
                LifecycleEvent::Birth { frame: 1, id: ClusterId(1), size: 1, origin: BirthOrigin::Nucleated },
            ],
            ids: vec![ClusterId(1)],
            next_id: 2,
        };
        state.commit(plan, set(1, &[&[9]])).unwrap();
        assert_eq!(state.retired_count(), 1);
        assert_eq!(state.track(ClusterId(0)).unwrap_err(), TrackError::UnknownCluster(0));
        assert_eq!(state.track(ClusterId(1)).unwrap().birth_frame, 1);
    }

    #[test]
    fn test_mismatched_plan_rejected() {
        let mut state = ClusterTrackState::new();
        let plan = TransitionPlan { frame: 0, events: Vec::new(), ids: vec![ClusterId(0)], next_id: 1 };
        assert!(state.commit(plan, set(0, &[&[1], &[2]])).is_err());
        assert!(state.previous().is_none());
    }

    #[test]
    fn test_size_summary() {
        let mut s = SizeSummary::new(4);
        s.record(2);
        s.record(6);
        assert_eq!((s.min, s.max, s.current, s.initial), (2, 6, 6, 4));
        assert!((s.mean() - 4.0).abs() < 1e-12);
    }
}
