use std::cmp::Ordering;

use itertools::Itertools;
use ordered_float::OrderedFloat;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};

use chaincore::algorithm::union_find::Dsu;
use chaincore::data::cluster::FrameClusterSet;
use chaincore::{Result, TrackError};

#[derive(Copy, Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MatchParams {
    /// Minimum Jaccard overlap for an identity-carrying edge.
    pub continuity_threshold: f64,
}

impl Default for MatchParams {
    fn default() -> Self {
        Self { continuity_threshold: 0.5 }
    }
}

/// Non-zero overlap between cluster `from` at t and cluster `to` at t+1.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct OverlapEdge {
    pub from: usize,
    pub to: usize,
    pub shared: usize,
    pub overlap: f64,
}

/// Jaccard similarity from the intersection size and both set sizes.
#[inline]
pub fn jaccard(shared: usize, size_a: usize, size_b: usize) -> f64 {
    let union = (size_a + size_b).saturating_sub(shared);
    if union == 0 { 0.0 } else { shared as f64 / union as f64 }
}

/// One resolved piece of the correspondence between two consecutive frames.
/// Indices refer to cluster positions in the respective `FrameClusterSet`.
#[derive(Clone, Debug, PartialEq)]
pub enum Transition {
    /// 1:1 with overlap at or above the threshold; identity carries forward.
    Continuation { from: usize, to: usize, overlap: f64 },
    /// 1:1 below the threshold; the old identity dies and the new cluster is born.
    Replacement { from: usize, to: usize, overlap: f64 },
    /// `heir` inherits the identity of `from`, `offspring` are born.
    Split { from: usize, heir: usize, offspring: Vec<usize>, overlap: f64 },
    /// `to` inherits the identity of `heir`; every other source dies.
    Merge { sources: Vec<usize>, heir: usize, to: usize, overlap: f64 },
    /// Cluster at t has no successor carrying its identity.
    Vanish { from: usize, into: Option<usize> },
    /// Cluster at t+1 carries no earlier identity.
    Appear { to: usize, from: Option<usize> },
}

impl Transition {
    /// Clusters at t covered by this transition.
    pub fn sources(&self) -> Vec<usize> {
        match self {
            Transition::Continuation { from, .. }
            | Transition::Replacement { from, .. }
            | Transition::Split { from, .. }
            | Transition::Vanish { from, .. } => vec![*from],
            Transition::Merge { sources, .. } => sources.clone(),
            Transition::Appear { .. } => Vec::new(),
        }
    }

    /// Clusters at t+1 covered by this transition.
    pub fn targets(&self) -> Vec<usize> {
        match self {
            Transition::Continuation { to, .. }
            | Transition::Replacement { to, .. }
            | Transition::Merge { to, .. }
            | Transition::Appear { to, .. } => vec![*to],
            Transition::Split { heir, offspring, .. } => {
                let mut v = Vec::with_capacity(offspring.len() + 1);
                v.push(*heir);
                v.extend_from_slice(offspring);
                v.sort_unstable();
                v
            }
            Transition::Vanish { .. } => Vec::new(),
        }
    }

    fn order_key(&self) -> (usize, usize) {
        let a = self.sources().into_iter().min().unwrap_or(usize::MAX);
        let b = self.targets().into_iter().min().unwrap_or(usize::MAX);
        (a, b)
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct Correspondence {
    pub prev_frame: u64,
    pub next_frame: u64,
    /// All non-zero overlaps, ordered by (from, to).
    pub edges: Vec<OverlapEdge>,
    /// Resolved transitions, ordered by lowest source then lowest target index.
    pub transitions: Vec<Transition>,
    /// Number of many-to-many peels performed.
    pub peels: usize,
}

impl Correspondence {
    pub fn successors(&self, from: usize) -> Vec<usize> {
        self.edges.iter().filter(|e| e.from == from).map(|e| e.to).collect()
    }

    pub fn predecessors(&self, to: usize) -> Vec<usize> {
        self.edges.iter().filter(|e| e.to == to).map(|e| e.from).collect()
    }

    /// Every cluster on either side must be covered by exactly one transition, which
    /// makes every particle of each frame land on exactly one edge.
    pub fn check_conservation(&self, prev: &FrameClusterSet, next: &FrameClusterSet) -> Result<()> {
        let sides: [(&'static str, &FrameClusterSet, Vec<usize>); 2] = [
            ("from", prev, self.transitions.iter().flat_map(|t| t.sources()).collect()),
            ("to", next, self.transitions.iter().flat_map(|t| t.targets()).collect()),
        ];

        for (side, set, covered) in sides {
            let mut hits = vec![0usize; set.len()];
            let mut found = 0usize;
            let mut stray = false;
            for ci in covered {
                match set.get(ci) {
                    Some(c) => {
                        hits[ci] += 1;
                        found += c.size();
                    }
                    None => stray = true,
                }
            }
            let expected = set.particle_count();
            if stray || found != expected || hits.iter().any(|&h| h != 1) {
                tracing::error!(frame = self.next_frame, side, expected, found, "membership not conserved");
                return Err(TrackError::ConservationViolation { frame: self.next_frame, side, expected, found });
            }
        }
        Ok(())
    }
}

/// Overlap edges between two consecutive cluster sets, computed through the
/// particle -> cluster index in O(particles).
pub fn overlap_edges(prev: &FrameClusterSet, next: &FrameClusterSet) -> Vec<OverlapEdge> {
    let mut shared: FxHashMap<(usize, usize), usize> = FxHashMap::default();
    for (a, cluster) in prev.iter().enumerate() {
        for &id in cluster.members() {
            if let Some(b) = next.cluster_of(id) {
                *shared.entry((a, b)).or_default() += 1;
            }
        }
    }

    shared
        .into_iter()
        .sorted_unstable_by_key(|&(k, _)| k)
        .filter_map(|((from, to), n)| {
            let (ca, cb) = (prev.get(from)?, next.get(to)?);
            Some(OverlapEdge { from, to, shared: n, overlap: jaccard(n, ca.size(), cb.size()) })
        })
        .collect()
}

/// Higher overlap first, then lower source, then lower target.
fn rank(x: &OverlapEdge, y: &OverlapEdge) -> Ordering {
    OrderedFloat(y.overlap)
        .cmp(&OrderedFloat(x.overlap))
        .then(x.from.cmp(&y.from))
        .then(x.to.cmp(&y.to))
}

/// Split a set of edges into bipartite connected pieces.
fn components(edges: Vec<OverlapEdge>) -> Vec<Vec<OverlapEdge>> {
    if edges.is_empty() {
        return Vec::new();
    }
    let froms: Vec<usize> = edges.iter().map(|e| e.from).sorted_unstable().dedup().collect();
    let tos: Vec<usize> = edges.iter().map(|e| e.to).sorted_unstable().dedup().collect();
    let local_from = |a: usize| froms.binary_search(&a).unwrap_or(0);
    let local_to = |b: usize| froms.len() + tos.binary_search(&b).unwrap_or(0);

    let mut dsu = Dsu::new(froms.len() + tos.len());
    for e in &edges {
        dsu.union(local_from(e.from), local_to(e.to));
    }

    let mut pieces: FxHashMap<usize, Vec<OverlapEdge>> = FxHashMap::default();
    for e in edges {
        pieces.entry(dsu.find(local_from(e.from))).or_default().push(e);
    }
    pieces.into_values().sorted_unstable_by_key(|p| (p[0].from, p[0].to)).collect()
}

/// Pure function of two consecutive `FrameClusterSet`s and the thresholds.
#[derive(Clone, Debug, Default)]
pub struct CorrespondenceMatcher {
    params: MatchParams,
}

impl CorrespondenceMatcher {
    pub fn new(params: MatchParams) -> Self {
        Self { params }
    }

    pub fn params(&self) -> &MatchParams {
        &self.params
    }

    /// Resolve the correspondence between `prev` (t) and `next` (t+1).
    ///
    /// Each connected component of the bipartite overlap graph is classified as a
    /// continuation, split or merge; many-to-many components are resolved by
    /// repeatedly peeling the strongest edge, at most min(|A|, |B|) times.
    pub fn correspond(&self, prev: &FrameClusterSet, next: &FrameClusterSet) -> Correspondence {
        let edges = overlap_edges(prev, next);
        let n_a = prev.len();
        let n_b = next.len();

        let mut dsu = Dsu::new(n_a + n_b);
        for e in &edges {
            dsu.union(e.from, n_a + e.to);
        }
        let mut by_root: FxHashMap<usize, Vec<OverlapEdge>> = FxHashMap::default();
        for e in &edges {
            by_root.entry(dsu.find(e.from)).or_default().push(*e);
        }

        let mut transitions = Vec::with_capacity(n_a.max(n_b));
        let mut peels = 0usize;

        for group in dsu.clone().groups() {
            let root = dsu.find(group[0]);
            match by_root.remove(&root) {
                Some(component) => self.resolve(prev, component, &mut transitions, &mut peels),
                None => {
                    let node = group[0];
                    if node < n_a {
                        transitions.push(Transition::Vanish { from: node, into: None });
                    } else {
                        transitions.push(Transition::Appear { to: node - n_a, from: None });
                    }
                }
            }
        }

        transitions.sort_by_key(|t| t.order_key());
        Correspondence { prev_frame: prev.frame, next_frame: next.frame, edges, transitions, peels }
    }

    fn resolve(&self, prev: &FrameClusterSet, component: Vec<OverlapEdge>, out: &mut Vec<Transition>, peels: &mut usize) {
        let mut work = vec![component];

        while let Some(edges) = work.pop() {
            let froms: Vec<usize> = edges.iter().map(|e| e.from).sorted_unstable().dedup().collect();
            let tos: Vec<usize> = edges.iter().map(|e| e.to).sorted_unstable().dedup().collect();

            match (froms.len(), tos.len()) {
                (0, _) | (_, 0) => {}
                (1, 1) => out.push(self.one_to_one(&edges[0])),
                (1, _) => self.split(froms[0], &edges, out),
                (_, 1) => self.merge(prev, tos[0], &edges, out),
                _ => {
                    let Some(best) = edges.iter().min_by(|x, y| rank(x, y)).copied() else { continue };
                    *peels += 1;
                    tracing::trace!(from = best.from, to = best.to, overlap = best.overlap, "peeling strongest edge");
                    out.push(self.one_to_one(&best));

                    let rest: Vec<OverlapEdge> =
                        edges.iter().filter(|e| e.from != best.from && e.to != best.to).copied().collect();

                    // nodes whose only edges ran to a peeled endpoint
                    for &a in froms.iter().filter(|&&a| a != best.from) {
                        if !rest.iter().any(|e| e.from == a) {
                            out.push(Transition::Vanish { from: a, into: Some(best.to) });
                        }
                    }
                    for &b in tos.iter().filter(|&&b| b != best.to) {
                        if !rest.iter().any(|e| e.to == b) {
                            out.push(Transition::Appear { to: b, from: Some(best.from) });
                        }
                    }

                    work.extend(components(rest));
                }
            }
        }
    }

    fn one_to_one(&self, e: &OverlapEdge) -> Transition {
        if e.overlap >= self.params.continuity_threshold {
            Transition::Continuation { from: e.from, to: e.to, overlap: e.overlap }
        } else {
            Transition::Replacement { from: e.from, to: e.to, overlap: e.overlap }
        }
    }

    fn split(&self, from: usize, edges: &[OverlapEdge], out: &mut Vec<Transition>) {
        let Some(heir) = edges.iter().min_by(|x, y| rank(x, y)) else { return };
        let targets = edges.iter().map(|e| e.to).sorted_unstable().dedup();

        if heir.overlap >= self.params.continuity_threshold {
            out.push(Transition::Split {
                from,
                heir: heir.to,
                offspring: targets.filter(|&b| b != heir.to).collect(),
                overlap: heir.overlap,
            });
        } else {
            out.push(Transition::Vanish { from, into: None });
            out.extend(targets.map(|to| Transition::Appear { to, from: Some(from) }));
        }
    }

    fn merge(&self, prev: &FrameClusterSet, to: usize, edges: &[OverlapEdge], out: &mut Vec<Transition>) {
        let size = |a: usize| prev.get(a).map(|c| c.size()).unwrap_or(0);
        // largest prior cluster, lower index on ties
        let Some(heir) = edges.iter().min_by(|x, y| size(y.from).cmp(&size(x.from)).then(x.from.cmp(&y.from))) else {
            return;
        };
        let sources: Vec<usize> = edges.iter().map(|e| e.from).sorted_unstable().dedup().collect();

        if heir.overlap >= self.params.continuity_threshold {
            out.push(Transition::Merge { sources, heir: heir.from, to, overlap: heir.overlap });
        } else {
            out.extend(sources.into_iter().map(|from| Transition::Vanish { from, into: Some(to) }));
            out.push(Transition::Appear { to, from: None });
        }
    }
}
