use std::fmt;
use std::fmt::Formatter;

use serde::{Deserialize, Serialize};

use chaincore::data::cluster::FrameClusterSet;
use chaincore::data::particle::distance_sq;
use chaincore::{Result, TrackError};

use crate::tracking::matching::{Correspondence, Transition};
use crate::tracking::state::ClusterTrackState;

/// Persistent cluster identity. Assigned once at birth and never reused.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ClusterId(pub u64);

impl fmt::Display for ClusterId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "C{}", self.0)
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum BirthOrigin {
    /// Present in the first processed frame.
    Initial,
    /// Built entirely from particles that were free or absent before.
    Nucleated,
    /// Took over the particles of a cluster whose overlap was too small to continue it.
    Replaced { predecessor: ClusterId },
    /// Non-inheriting child of a split.
    Offspring { parent: ClusterId },
    /// Piece of a cluster that dissolved or lost its identity elsewhere.
    Fragment { of: ClusterId },
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeathCause {
    Dissolved,
    Replaced { successor: ClusterId },
    Absorbed { into: ClusterId },
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum EventKind {
    Birth,
    Death,
    Continuation,
    Growth,
    Shrink,
    Merge,
    Split,
}

/// One typed identity transition. `frame` is the index of the frame in which the
/// transition is observed.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum LifecycleEvent {
    Birth { frame: u64, id: ClusterId, size: usize, origin: BirthOrigin },
    Death { frame: u64, id: ClusterId, last_size: usize, cause: DeathCause },
    Continuation { frame: u64, id: ClusterId, size: usize, displacement_sq: f64 },
    Growth { frame: u64, id: ClusterId, from_size: usize, to_size: usize, displacement_sq: f64 },
    Shrink { frame: u64, id: ClusterId, from_size: usize, to_size: usize, displacement_sq: f64 },
    /// `id` survives; `absorbed` identities die in the same transition.
    Merge { frame: u64, id: ClusterId, absorbed: Vec<ClusterId>, from_size: usize, to_size: usize },
    /// `id` continues in the heir; `offspring` are born in the same transition.
    Split { frame: u64, id: ClusterId, offspring: Vec<ClusterId>, from_size: usize, to_size: usize },
}

impl LifecycleEvent {
    pub fn frame(&self) -> u64 {
        match self {
            LifecycleEvent::Birth { frame, .. }
            | LifecycleEvent::Death { frame, .. }
            | LifecycleEvent::Continuation { frame, .. }
            | LifecycleEvent::Growth { frame, .. }
            | LifecycleEvent::Shrink { frame, .. }
            | LifecycleEvent::Merge { frame, .. }
            | LifecycleEvent::Split { frame, .. } => *frame,
        }
    }

    /// The identity this event is about.
    pub fn id(&self) -> ClusterId {
        match self {
            LifecycleEvent::Birth { id, .. }
            | LifecycleEvent::Death { id, .. }
            | LifecycleEvent::Continuation { id, .. }
            | LifecycleEvent::Growth { id, .. }
            | LifecycleEvent::Shrink { id, .. }
            | LifecycleEvent::Merge { id, .. }
            | LifecycleEvent::Split { id, .. } => *id,
        }
    }

    pub fn kind(&self) -> EventKind {
        match self {
            LifecycleEvent::Birth { .. } => EventKind::Birth,
            LifecycleEvent::Death { .. } => EventKind::Death,
            LifecycleEvent::Continuation { .. } => EventKind::Continuation,
            LifecycleEvent::Growth { .. } => EventKind::Growth,
            LifecycleEvent::Shrink { .. } => EventKind::Shrink,
            LifecycleEvent::Merge { .. } => EventKind::Merge,
            LifecycleEvent::Split { .. } => EventKind::Split,
        }
    }

    /// Identity and size observed in `frame`; `None` for deaths.
    pub fn observed(&self) -> Option<(ClusterId, usize)> {
        match self {
            LifecycleEvent::Birth { id, size, .. } | LifecycleEvent::Continuation { id, size, .. } => Some((*id, *size)),
            LifecycleEvent::Growth { id, to_size, .. }
            | LifecycleEvent::Shrink { id, to_size, .. }
            | LifecycleEvent::Merge { id, to_size, .. }
            | LifecycleEvent::Split { id, to_size, .. } => Some((*id, *to_size)),
            LifecycleEvent::Death { .. } => None,
        }
    }

    /// Centroid squared displacement of a continuing cluster.
    pub fn displacement_sq(&self) -> Option<f64> {
        match self {
            LifecycleEvent::Continuation { displacement_sq, .. }
            | LifecycleEvent::Growth { displacement_sq, .. }
            | LifecycleEvent::Shrink { displacement_sq, .. } => Some(*displacement_sq),
            _ => None,
        }
    }
}

impl fmt::Display for LifecycleEvent {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            LifecycleEvent::Birth { frame, id, size, origin } => write!(f, "[{frame}] birth {id} size {size} ({origin:?})"),
            LifecycleEvent::Death { frame, id, last_size, cause } => write!(f, "[{frame}] death {id} size {last_size} ({cause:?})"),
            LifecycleEvent::Continuation { frame, id, size, .. } => write!(f, "[{frame}] continue {id} size {size}"),
            LifecycleEvent::Growth { frame, id, from_size, to_size, .. } => write!(f, "[{frame}] grow {id} {from_size} -> {to_size}"),
            LifecycleEvent::Shrink { frame, id, from_size, to_size, .. } => write!(f, "[{frame}] shrink {id} {from_size} -> {to_size}"),
            LifecycleEvent::Merge { frame, id, absorbed, to_size, .. } => write!(f, "[{frame}] merge {id} absorbs {absorbed:?} -> size {to_size}"),
            LifecycleEvent::Split { frame, id, offspring, to_size, .. } => write!(f, "[{frame}] split {id} keeps size {to_size}, offspring {offspring:?}"),
        }
    }
}

/// Outcome of classifying one transition: the ordered events plus the identity of
/// every cluster in the new frame. Computed without touching the state.
#[derive(Clone, Debug, PartialEq)]
pub struct TransitionPlan {
    pub frame: u64,
    pub events: Vec<LifecycleEvent>,
    /// Identity of each cluster in the new frame, by cluster index.
    pub ids: Vec<ClusterId>,
    /// First unassigned identity after this transition.
    pub next_id: u64,
}

#[derive(Clone, Debug)]
pub struct EventClassifier {
    size_tolerance: usize,
    check_conservation: bool,
}

impl EventClassifier {
    pub fn new(size_tolerance: usize, check_conservation: bool) -> Self {
        Self { size_tolerance, check_conservation }
    }

    /// Every cluster of the first frame is an implicit birth.
    pub fn initial(&self, state: &ClusterTrackState, set: &FrameClusterSet) -> TransitionPlan {
        let mut next_id = state.next_id();
        let mut ids = Vec::with_capacity(set.len());
        let mut events = Vec::with_capacity(set.len());
        for c in set.iter() {
            let id = ClusterId(next_id);
            next_id += 1;
            ids.push(id);
            events.push(LifecycleEvent::Birth { frame: set.frame, id, size: c.size(), origin: BirthOrigin::Initial });
        }
        TransitionPlan { frame: set.frame, events, ids, next_id }
    }

    /// Translate a correspondence into lifecycle events, ordered by identity.
    pub fn classify(
        &self,
        state: &ClusterTrackState,
        prev: &FrameClusterSet,
        next: &FrameClusterSet,
        corr: &Correspondence,
    ) -> Result<TransitionPlan> {
        if self.check_conservation {
            corr.check_conservation(prev, next)?;
        }

        let frame = next.frame;
        let prev_ids = state.previous_ids();
        if prev_ids.len() != prev.len() {
            tracing::error!(frame, expected = prev_ids.len(), found = prev.len(), "previous frame does not match tracked state");
            return Err(TrackError::ConservationViolation {
                frame,
                side: "from",
                expected: prev_ids.len(),
                found: prev.len(),
            });
        }
        let old = |a: usize| prev_ids[a];

        // identities carried forward
        let mut assigned: Vec<Option<ClusterId>> = vec![None; next.len()];
        for t in &corr.transitions {
            match t {
                Transition::Continuation { from, to, .. } => assigned[*to] = Some(old(*from)),
                Transition::Split { from, heir, .. } => assigned[*heir] = Some(old(*from)),
                Transition::Merge { heir, to, .. } => assigned[*to] = Some(old(*heir)),
                _ => {}
            }
        }

        let carried: Vec<bool> = assigned.iter().map(Option::is_some).collect();

        // fresh identities in cluster order
        let mut next_id = state.next_id();
        let ids: Vec<ClusterId> = assigned
            .into_iter()
            .map(|slot| {
                slot.unwrap_or_else(|| {
                    let id = ClusterId(next_id);
                    next_id += 1;
                    id
                })
            })
            .collect();

        let size_prev = |a: usize| prev.clusters()[a].size();
        let size_next = |b: usize| next.clusters()[b].size();
        // largest cluster dissolving into each fresh target, lower index on ties
        let mut dissolved_into: Vec<Option<usize>> = vec![None; next.len()];
        for t in &corr.transitions {
            if let Transition::Vanish { from, into: Some(b) } = t {
                if carried[*b] {
                    continue;
                }
                let keep = matches!(dissolved_into[*b], Some(a) if (size_prev(a), *from) > (size_prev(*from), a));
                if !keep {
                    dissolved_into[*b] = Some(*from);
                }
            }
        }

        let birth = |b: usize, origin: BirthOrigin| LifecycleEvent::Birth { frame, id: ids[b], size: size_next(b), origin };

        let mut events = Vec::with_capacity(corr.transitions.len() + 1);
        for t in &corr.transitions {
            match t {
                Transition::Continuation { from, to, .. } => {
                    let (a, b) = (*from, *to);
                    let disp = distance_sq(&prev.clusters()[a].centroid, &next.clusters()[b].centroid);
                    events.push(self.continuation(frame, old(a), size_prev(a), size_next(b), disp));
                }
                Transition::Replacement { from, to, .. } => {
                    events.push(LifecycleEvent::Death {
                        frame,
                        id: old(*from),
                        last_size: size_prev(*from),
                        cause: DeathCause::Replaced { successor: ids[*to] },
                    });
                    events.push(birth(*to, BirthOrigin::Replaced { predecessor: old(*from) }));
                }
                Transition::Split { from, heir, offspring, .. } => {
                    let parent = old(*from);
                    events.push(LifecycleEvent::Split {
                        frame,
                        id: parent,
                        offspring: offspring.iter().map(|&b| ids[b]).collect(),
                        from_size: size_prev(*from),
                        to_size: size_next(*heir),
                    });
                    events.extend(offspring.iter().map(|&b| birth(b, BirthOrigin::Offspring { parent })));
                }
                Transition::Merge { sources, heir, to, .. } => {
                    let survivor = old(*heir);
                    let absorbed: Vec<ClusterId> = sources.iter().filter(|&&a| a != *heir).map(|&a| old(a)).collect();
                    events.push(LifecycleEvent::Merge {
                        frame,
                        id: survivor,
                        absorbed,
                        from_size: size_prev(*heir),
                        to_size: size_next(*to),
                    });
                    events.extend(sources.iter().filter(|&&a| a != *heir).map(|&a| LifecycleEvent::Death {
                        frame,
                        id: old(a),
                        last_size: size_prev(a),
                        cause: DeathCause::Absorbed { into: survivor },
                    }));
                }
                Transition::Vanish { from, into } => events.push(LifecycleEvent::Death {
                    frame,
                    id: old(*from),
                    last_size: size_prev(*from),
                    cause: match into {
                        Some(b) if carried[*b] => DeathCause::Absorbed { into: ids[*b] },
                        Some(b) => DeathCause::Replaced { successor: ids[*b] },
                        None => DeathCause::Dissolved,
                    },
                }),
                Transition::Appear { to, from } => {
                    let origin = match (from, dissolved_into[*to]) {
                        (Some(a), _) => BirthOrigin::Fragment { of: old(*a) },
                        (None, Some(a)) => BirthOrigin::Replaced { predecessor: old(a) },
                        (None, None) => BirthOrigin::Nucleated,
                    };
                    events.push(birth(*to, origin));
                }
            }
        }

        // one event per identity, so ordering by identity is total
        events.sort_by_key(|e| e.id());

        Ok(TransitionPlan { frame, events, ids, next_id })
    }

    fn continuation(&self, frame: u64, id: ClusterId, from_size: usize, to_size: usize, displacement_sq: f64) -> LifecycleEvent {
        if to_size > from_size + self.size_tolerance {
            LifecycleEvent::Growth { frame, id, from_size, to_size, displacement_sq }
        } else if from_size > to_size + self.size_tolerance {
            LifecycleEvent::Shrink { frame, id, from_size, to_size, displacement_sq }
        } else {
            LifecycleEvent::Continuation { frame, id, size: to_size, displacement_sq }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chaincore::data::cluster::{Cluster, ClusterShape};
    use crate::tracking::matching::{CorrespondenceMatcher, MatchParams};

    fn set(frame: u64, groups: &[(&[u64], f64)]) -> FrameClusterSet {
        let clusters = groups
            .iter()
            .map(|(g, x)| Cluster::new(g.to_vec(), vec![*x, 0.0], ClusterShape::Branched))
            .collect();
        FrameClusterSet::from_clusters(frame, clusters).unwrap()
    }

    fn step(state: &mut ClusterTrackState, classifier: &EventClassifier, next: FrameClusterSet) -> Vec<LifecycleEvent> {
        let plan = match state.previous() {
            None => classifier.initial(state, &next),
            Some(prev) => {
                let corr = CorrespondenceMatcher::new(MatchParams::default()).correspond(prev, &next);
                classifier.classify(state, prev, &next, &corr).unwrap()
            }
        };
        let events = plan.events.clone();
        state.commit(plan, next).unwrap();
        events
    }

    #[test]
    fn test_initial_births() {
        let mut state = ClusterTrackState::new();
        let classifier = EventClassifier::new(0, true);
        let events = step(&mut state, &classifier, set(0, &[(&[1, 2], 0.0), (&[3], 5.0)]));
        assert_eq!(
            events,
            vec![
                LifecycleEvent::Birth { frame: 0, id: ClusterId(0), size: 2, origin: BirthOrigin::Initial },
                LifecycleEvent::Birth { frame: 0, id: ClusterId(1), size: 1, origin: BirthOrigin::Initial },
            ]
        );
    }

    #[test]
    fn test_growth_shrink_and_tolerance() {
        let mut state = ClusterTrackState::new();
        let classifier = EventClassifier::new(0, true);
        step(&mut state, &classifier, set(0, &[(&[1, 2, 3], 0.0)]));
        let events = step(&mut state, &classifier, set(1, &[(&[1, 2, 3, 4], 2.0)]));
        assert_eq!(
            events,
            vec![LifecycleEvent::Growth { frame: 1, id: ClusterId(0), from_size: 3, to_size: 4, displacement_sq: 4.0 }]
        );
        let events = step(&mut state, &classifier, set(2, &[(&[1, 2, 3], 2.0)]));
        assert_eq!(events[0].kind(), EventKind::Shrink);

        let mut state = ClusterTrackState::new();
        let tolerant = EventClassifier::new(1, true);
        step(&mut state, &tolerant, set(0, &[(&[1, 2, 3], 0.0)]));
        let events = step(&mut state, &tolerant, set(1, &[(&[1, 2, 3, 4], 0.0)]));
        assert_eq!(events[0], LifecycleEvent::Continuation { frame: 1, id: ClusterId(0), size: 4, displacement_sq: 0.0 });
    }

    #[test]
    fn test_merge_emits_merge_and_absorbed_death() {
        let mut state = ClusterTrackState::new();
        let classifier = EventClassifier::new(0, true);
        step(&mut state, &classifier, set(0, &[(&[1, 2], 0.0), (&[3, 4], 1.0)]));
        let events = step(&mut state, &classifier, set(1, &[(&[1, 2, 3, 4], 0.5)]));
        assert_eq!(
            events,
            vec![
                LifecycleEvent::Merge { frame: 1, id: ClusterId(0), absorbed: vec![ClusterId(1)], from_size: 2, to_size: 4 },
                LifecycleEvent::Death {
                    frame: 1,
                    id: ClusterId(1),
                    last_size: 2,
                    cause: DeathCause::Absorbed { into: ClusterId(0) },
                },
            ]
        );
        assert_eq!(state.live_count(), 1);
    }

    #[test]
    fn test_split_emits_split_and_offspring_birth() {
        let mut state = ClusterTrackState::new();
        let classifier = EventClassifier::new(0, true);
        step(&mut state, &classifier, set(0, &[(&[1, 2, 3, 4], 0.0)]));
        let events = step(&mut state, &classifier, set(1, &[(&[1, 2], -1.0), (&[3, 4], 1.0)]));
        assert_eq!(
            events,
            vec![
                LifecycleEvent::Split { frame: 1, id: ClusterId(0), offspring: vec![ClusterId(1)], from_size: 4, to_size: 2 },
                LifecycleEvent::Birth {
                    frame: 1,
                    id: ClusterId(1),
                    size: 2,
                    origin: BirthOrigin::Offspring { parent: ClusterId(0) },
                },
            ]
        );
    }

    #[test]
    fn test_replacement_pairs_death_and_birth() {
        let mut state = ClusterTrackState::new();
        let classifier = EventClassifier::new(0, true);
        step(&mut state, &classifier, set(0, &[(&[1, 2, 3, 4], 0.0)]));
        let events = step(&mut state, &classifier, set(1, &[(&[4, 5, 6], 0.0)]));
        assert_eq!(
            events,
            vec![
                LifecycleEvent::Death {
                    frame: 1,
                    id: ClusterId(0),
                    last_size: 4,
                    cause: DeathCause::Replaced { successor: ClusterId(1) },
                },
                LifecycleEvent::Birth {
                    frame: 1,
                    id: ClusterId(1),
                    size: 3,
                    origin: BirthOrigin::Replaced { predecessor: ClusterId(0) },
                },
            ]
        );
    }

    #[test]
    fn test_weak_merge_is_replacement_not_absorption() {
        let mut state = ClusterTrackState::new();
        let classifier = EventClassifier::new(0, true);
        step(&mut state, &classifier, set(0, &[(&[1, 2], 0.0), (&[3, 4, 5], 1.0)]));

        let prev = state.previous().unwrap().clone();
        let next = set(1, &[(&[1, 2, 3, 4, 5, 6, 7, 8], 0.5)]);
        let corr = CorrespondenceMatcher::new(MatchParams { continuity_threshold: 0.6 }).correspond(&prev, &next);
        let events = classifier.classify(&state, &prev, &next, &corr).unwrap().events;
        assert_eq!(
            events,
            vec![
                LifecycleEvent::Death {
                    frame: 1,
                    id: ClusterId(0),
                    last_size: 2,
                    cause: DeathCause::Replaced { successor: ClusterId(2) },
                },
                LifecycleEvent::Death {
                    frame: 1,
                    id: ClusterId(1),
                    last_size: 3,
                    cause: DeathCause::Replaced { successor: ClusterId(2) },
                },
                LifecycleEvent::Birth {
                    frame: 1,
                    id: ClusterId(2),
                    size: 8,
                    origin: BirthOrigin::Replaced { predecessor: ClusterId(1) },
                },
            ]
        );
    }

    #[test]
    fn test_foreign_previous_frame_rejected() {
        let mut state = ClusterTrackState::new();
        let classifier = EventClassifier::new(0, true);
        step(&mut state, &classifier, set(0, &[(&[1, 2], 0.0)]));

        let foreign = set(0, &[(&[1], 0.0), (&[2], 0.0), (&[3], 0.0)]);
        let next = set(1, &[(&[1, 2, 3], 0.0)]);
        let corr = CorrespondenceMatcher::new(MatchParams::default()).correspond(&foreign, &next);
        let err = EventClassifier::new(0, false).classify(&state, &foreign, &next, &corr).unwrap_err();
        assert_eq!(err, TrackError::ConservationViolation { frame: 1, side: "from", expected: 1, found: 3 });
    }

    #[test]
    fn test_event_order_is_by_identity() {
        let mut state = ClusterTrackState::new();
        let classifier = EventClassifier::new(0, true);
        step(&mut state, &classifier, set(0, &[(&[1, 2], 0.0), (&[3, 4], 0.0), (&[5, 6], 0.0)]));
        let events = step(&mut state, &classifier, set(1, &[(&[1], 0.0), (&[2], 0.0), (&[3, 4, 7], 0.0), (&[5, 6], 0.0), (&[9], 0.0)]));
        let ids: Vec<u64> = events.iter().map(|e| e.id().0).collect();
        let mut sorted = ids.clone();
        sorted.sort_unstable();
        assert_eq!(ids, sorted);
        let before = ids.len();
        sorted.dedup();
        assert_eq!(sorted.len(), before);
    }
}
