use std::fmt;
use std::fmt::Formatter;

use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};

use crate::data::particle::ParticleId;
use crate::error::{Result, TrackError};

/// Topology of a cluster's internal connectivity graph.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ClusterShape {
    Singleton,
    /// Path-like: every member has at most two connections and there is no cycle.
    Chain,
    /// A single closed loop.
    Ring,
    Branched,
}

impl ClusterShape {
    /// Classify from member count, number of distinct internal edges and max degree.
    ///
    /// # Examples
    ///
    /// ```
    /// use chaincore::data::cluster::ClusterShape;
    ///
    /// assert_eq!(ClusterShape::classify(1, 0, 0), ClusterShape::Singleton);
    /// assert_eq!(ClusterShape::classify(4, 3, 2), ClusterShape::Chain);
    /// assert_eq!(ClusterShape::classify(4, 4, 2), ClusterShape::Ring);
    /// assert_eq!(ClusterShape::classify(4, 3, 3), ClusterShape::Branched);
    /// ```
    pub fn classify(size: usize, edges: usize, max_degree: usize) -> Self {
        if size <= 1 {
            ClusterShape::Singleton
        } else if max_degree <= 2 && edges + 1 == size {
            ClusterShape::Chain
        } else if max_degree == 2 && edges == size && size >= 3 {
            ClusterShape::Ring
        } else {
            ClusterShape::Branched
        }
    }

    pub fn is_chain(&self) -> bool {
        matches!(self, ClusterShape::Chain)
    }
}

/// A per-frame cluster. Value-typed and never mutated after creation.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Cluster {
    members: Vec<ParticleId>,
    pub centroid: Vec<f64>,
    pub shape: ClusterShape,
}

impl Cluster {
    /// Creates a new `Cluster`; members are sorted ascending and de-duplicated.
    ///
    /// # Examples
    ///
    /// ```
    /// use chaincore::data::cluster::{Cluster, ClusterShape};
    ///
    /// let c = Cluster::new(vec![3, 1, 2], vec![0.0, 0.0], ClusterShape::Chain);
    /// assert_eq!(c.members(), &[1, 2, 3]);
    /// assert_eq!(c.min_id(), 1);
    /// ```
    pub fn new(mut members: Vec<ParticleId>, centroid: Vec<f64>, shape: ClusterShape) -> Self {
        members.sort_unstable();
        members.dedup();
        Cluster { members, centroid, shape }
    }

    pub fn members(&self) -> &[ParticleId] {
        &self.members
    }

    pub fn size(&self) -> usize {
        self.members.len()
    }

    /// Smallest member identifier; the canonical ordering key.
    pub fn min_id(&self) -> ParticleId {
        self.members.first().copied().unwrap_or(ParticleId::MAX)
    }

    pub fn contains(&self, id: ParticleId) -> bool {
        self.members.binary_search(&id).is_ok()
    }
}

impl fmt::Display for Cluster {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "Cluster(size: {}, min_id: {}, shape: {:?})", self.size(), self.min_id(), self.shape)
    }
}

/// Immutable snapshot of all clusters found in one frame, ordered by minimum member
/// identifier, with an O(1) particle -> cluster lookup.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FrameClusterSet {
    pub frame: u64,
    clusters: Vec<Cluster>,
    membership: FxHashMap<ParticleId, usize>,
}

impl FrameClusterSet {
    /// Build from clusters that partition a particle set. Fails with `DuplicateParticle`
    /// if a particle is claimed by two clusters.
    ///
    /// # Examples
    ///
    /// ```
    /// use chaincore::data::cluster::{Cluster, ClusterShape, FrameClusterSet};
    ///
    /// let set = FrameClusterSet::from_clusters(0, vec![
    ///     Cluster::new(vec![3, 4], vec![1.0], ClusterShape::Chain),
    ///     Cluster::new(vec![1, 2], vec![0.0], ClusterShape::Chain),
    /// ]).unwrap();
    /// assert_eq!(set.clusters()[0].members(), &[1, 2]);
    /// assert_eq!(set.cluster_of(4), Some(1));
    /// ```
    pub fn from_clusters(frame: u64, mut clusters: Vec<Cluster>) -> Result<Self> {
        clusters.retain(|c| c.size() > 0);
        clusters.sort_by_key(|c| c.min_id());

        let total: usize = clusters.iter().map(|c| c.size()).sum();
        let mut membership = FxHashMap::default();
        membership.reserve(total);

        for (ci, c) in clusters.iter().enumerate() {
            for &id in c.members() {
                if membership.insert(id, ci).is_some() {
                    return Err(TrackError::DuplicateParticle { frame, id });
                }
            }
        }

        Ok(FrameClusterSet { frame, clusters, membership })
    }

    pub fn clusters(&self) -> &[Cluster] {
        &self.clusters
    }

    pub fn get(&self, index: usize) -> Option<&Cluster> {
        self.clusters.get(index)
    }

    pub fn len(&self) -> usize {
        self.clusters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clusters.is_empty()
    }

    /// Index of the cluster holding `id`, if the particle is present in this frame.
    #[inline]
    pub fn cluster_of(&self, id: ParticleId) -> Option<usize> {
        self.membership.get(&id).copied()
    }

    pub fn particle_count(&self) -> usize {
        self.membership.len()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Cluster> {
        self.clusters.iter()
    }
}

impl PartialEq for FrameClusterSet {
    fn eq(&self, other: &Self) -> bool {
        self.frame == other.frame && self.clusters == other.clusters
    }
}

impl fmt::Display for FrameClusterSet {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "FrameClusterSet(frame: {}, clusters: {}, particles: {})",
            self.frame,
            self.clusters.len(),
            self.membership.len()
        )
    }
}
