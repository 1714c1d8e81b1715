use rayon::prelude::*;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};

use crate::algorithm::spatial::SpatialIndex;
use crate::algorithm::union_find::Dsu;
use crate::data::cluster::{Cluster, ClusterShape, FrameClusterSet};
use crate::data::particle::{Frame, Particle, ParticleId, Species};
use crate::error::{Result, TrackError};

/// Species-pair specific cutoff; the pair is unordered.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PairCutoff {
    pub a: Species,
    pub b: Species,
    pub radius: f64,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ConnectivityParams {
    /// Global connectivity radius. Required unless every frame carries a bond list.
    pub radius: Option<f64>,
    /// Tighter cutoffs for specific species pairs, each <= `radius`.
    pub pair_cutoffs: Vec<PairCutoff>,
    /// Evaluate neighbor lists on the rayon pool.
    pub parallel: bool,
}

impl Default for ConnectivityParams {
    fn default() -> Self {
        Self { radius: None, pair_cutoffs: Vec::new(), parallel: true }
    }
}

impl ConnectivityParams {
    pub fn with_radius(radius: f64) -> Self {
        Self { radius: Some(radius), ..Self::default() }
    }

    pub fn validate(&self) -> Result<()> {
        if let Some(r) = self.radius {
            if !(r.is_finite() && r > 0.0) {
                return Err(TrackError::InvalidConfig(format!(
                    "radius must be positive and finite, got {r}"
                )));
            }
        }
        for pc in &self.pair_cutoffs {
            let Some(r) = self.radius else {
                return Err(TrackError::InvalidConfig(
                    "pair cutoffs require a global radius".to_string(),
                ));
            };
            if !(pc.radius.is_finite() && pc.radius > 0.0 && pc.radius <= r) {
                return Err(TrackError::InvalidConfig(format!(
                    "pair cutoff ({}, {}) must lie in (0, {r}], got {}",
                    pc.a, pc.b, pc.radius
                )));
            }
        }
        Ok(())
    }

    /// Squared cutoff for a particle pair, falling back to the global radius.
    #[inline]
    fn cutoff_sq(&self, a: Option<Species>, b: Option<Species>, global: f64) -> f64 {
        if let (Some(sa), Some(sb)) = (a, b) {
            for pc in &self.pair_cutoffs {
                if (pc.a == sa && pc.b == sb) || (pc.a == sb && pc.b == sa) {
                    return pc.radius * pc.radius;
                }
            }
        }
        global * global
    }
}

/// Partitions one frame's particles into connected clusters.
#[derive(Clone, Debug)]
pub struct ConnectivityDetector {
    params: ConnectivityParams,
}

impl ConnectivityDetector {
    pub fn new(params: ConnectivityParams) -> Result<Self> {
        params.validate()?;
        Ok(Self { params })
    }

    pub fn params(&self) -> &ConnectivityParams {
        &self.params
    }

    /// Build the `FrameClusterSet` for `frame`.
    ///
    /// An explicit bond list on the frame replaces the distance criterion. Clusters are
    /// ordered by their smallest particle identifier.
    ///
    /// # Examples
    ///
    /// ```
    /// use chaincore::algorithm::connectivity::{ConnectivityDetector, ConnectivityParams};
    /// use chaincore::data::particle::Frame;
    ///
    /// let frame = Frame::from_positions(0, vec![(1, vec![0.0]), (2, vec![0.5]), (3, vec![4.0])]).unwrap();
    /// let detector = ConnectivityDetector::new(ConnectivityParams::with_radius(1.0)).unwrap();
    /// let set = detector.detect(&frame).unwrap();
    /// assert_eq!(set.len(), 2);
    /// assert_eq!(set.clusters()[0].members(), &[1, 2]);
    /// ```
    pub fn detect(&self, frame: &Frame) -> Result<FrameClusterSet> {
        let particles: Vec<&Particle> = frame.particles().collect();
        let n = particles.len();
        if n == 0 {
            return FrameClusterSet::from_clusters(frame.index, Vec::new());
        }

        let edges = match frame.bonds() {
            Some(bonds) => bond_edges(frame, &particles, bonds)?,
            None => {
                let Some(radius) = self.params.radius else {
                    tracing::error!(frame = frame.index, "no connectivity criterion for frame");
                    return Err(TrackError::MissingCriterion { frame: frame.index });
                };
                self.radius_edges(frame, &particles, radius)?
            }
        };

        let mut dsu = Dsu::new(n);
        let mut degree = vec![0usize; n];
        for &(i, j) in &edges {
            dsu.union(i, j);
            degree[i] += 1;
            degree[j] += 1;
        }

        let mut root_edges: FxHashMap<usize, usize> = FxHashMap::default();
        for &(i, _) in &edges {
            *root_edges.entry(dsu.find(i)).or_default() += 1;
        }

        let dim = frame.dim();
        let mut clusters = Vec::new();
        for group in dsu.clone().groups() {
            let root = dsu.find(group[0]);
            let n_edges = root_edges.get(&root).copied().unwrap_or(0);
            let max_degree = group.iter().map(|&i| degree[i]).max().unwrap_or(0);

            let mut centroid = vec![0.0f64; dim];
            for &i in &group {
                for (c, x) in centroid.iter_mut().zip(particles[i].position.iter()) {
                    *c += x;
                }
            }
            let inv = 1.0 / group.len() as f64;
            centroid.iter_mut().for_each(|c| *c *= inv);

            let members = group.iter().map(|&i| particles[i].id).collect();
            let shape = ClusterShape::classify(group.len(), n_edges, max_degree);
            clusters.push(Cluster::new(members, centroid, shape));
        }

        tracing::debug!(frame = frame.index, particles = n, edges = edges.len(), clusters = clusters.len(), "clusters detected");
        FrameClusterSet::from_clusters(frame.index, clusters)
    }

    fn radius_edges(&self, frame: &Frame, particles: &[&Particle], radius: f64) -> Result<Vec<(usize, usize)>> {
        let index = SpatialIndex::build(frame, radius)?;

        // index and `particles` share the ascending-id dense order
        let neighbors_of = |i: usize| -> Vec<(usize, usize)> {
            let mut out = Vec::new();
            let si = particles[i].species;
            index.for_each_neighbor(i, |j, d2| {
                if j > i && d2 <= self.params.cutoff_sq(si, particles[j].species, radius) {
                    out.push((i, j));
                }
            });
            out.sort_unstable();
            out
        };

        let n = particles.len();
        let edges: Vec<(usize, usize)> = if self.params.parallel {
            (0..n).into_par_iter().flat_map_iter(neighbors_of).collect()
        } else {
            (0..n).flat_map(neighbors_of).collect()
        };
        Ok(edges)
    }
}

fn bond_edges(frame: &Frame, particles: &[&Particle], bonds: &[(ParticleId, ParticleId)]) -> Result<Vec<(usize, usize)>> {
    let dense: FxHashMap<ParticleId, usize> = particles.iter().enumerate().map(|(i, p)| (p.id, i)).collect();

    let mut edges = Vec::with_capacity(bonds.len());
    for &(a, b) in bonds {
        let (Some(&i), Some(&j)) = (dense.get(&a), dense.get(&b)) else {
            tracing::error!(frame = frame.index, a, b, "bond references unknown particle");
            return Err(TrackError::InvalidBond { frame: frame.index, a, b });
        };
        if i != j {
            edges.push((i.min(j), i.max(j)));
        }
    }
    edges.sort_unstable();
    edges.dedup();
    Ok(edges)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn detector(radius: f64) -> ConnectivityDetector {
        ConnectivityDetector::new(ConnectivityParams::with_radius(radius)).unwrap()
    }

    fn members(set: &FrameClusterSet) -> Vec<Vec<ParticleId>> {
        set.iter().map(|c| c.members().to_vec()).collect()
    }

    #[test]
    fn test_all_within_radius_form_one_cluster() {
        let frame = Frame::from_positions(0, vec![(1, vec![0.0, 0.0]), (2, vec![0.5, 0.0]), (3, vec![0.0, 0.5])]).unwrap();
        let set = detector(1.0).detect(&frame).unwrap();
        assert_eq!(members(&set), vec![vec![1, 2, 3]]);
        assert_eq!(set.clusters()[0].shape, ClusterShape::Ring);
        let c = &set.clusters()[0].centroid;
        assert!((c[0] - 0.5 / 3.0).abs() < 1e-12);
        assert!((c[1] - 0.5 / 3.0).abs() < 1e-12);
    }

    #[test]
    fn test_transitive_chain() {
        let frame = Frame::from_positions(
            3,
            vec![(4, vec![0.0]), (2, vec![0.9]), (8, vec![1.8]), (1, vec![2.7]), (5, vec![9.0])],
        )
        .unwrap();
        let set = detector(1.0).detect(&frame).unwrap();
        assert_eq!(members(&set), vec![vec![1, 2, 4, 8], vec![5]]);
        assert_eq!(set.clusters()[0].shape, ClusterShape::Chain);
        assert_eq!(set.clusters()[1].shape, ClusterShape::Singleton);
    }

    #[test]
    fn test_partition_and_idempotence() {
        let mut pts = Vec::new();
        for id in 0..200u64 {
            let t = id as f64;
            pts.push((id * 3 + 1, vec![(t * 0.731).sin() * 6.0, (t * 1.37).cos() * 6.0, (t * 0.19).sin() * 6.0]));
        }
        let frame = Frame::from_positions(0, pts).unwrap();
        let det = detector(1.1);
        let a = det.detect(&frame).unwrap();
        let b = det.detect(&frame).unwrap();
        assert_eq!(a, b);

        let mut seen: Vec<ParticleId> = a.iter().flat_map(|c| c.members().to_vec()).collect();
        seen.sort_unstable();
        let all: Vec<ParticleId> = frame.ids().collect();
        assert_eq!(seen, all);

        let mins: Vec<ParticleId> = a.iter().map(|c| c.min_id()).collect();
        let mut sorted = mins.clone();
        sorted.sort_unstable();
        assert_eq!(mins, sorted);
    }

    #[test]
    fn test_parallel_matches_sequential() {
        let pts: Vec<(ParticleId, Vec<f64>)> =
            (0..150u64).map(|i| (i, vec![(i as f64 * 0.37).fract() * 5.0, (i as f64 * 0.61).fract() * 5.0])).collect();
        let frame = Frame::from_positions(0, pts).unwrap();
        let par = ConnectivityDetector::new(ConnectivityParams { parallel: true, ..ConnectivityParams::with_radius(0.6) }).unwrap();
        let seq = ConnectivityDetector::new(ConnectivityParams { parallel: false, ..ConnectivityParams::with_radius(0.6) }).unwrap();
        assert_eq!(par.detect(&frame).unwrap(), seq.detect(&frame).unwrap());
    }

    #[test]
    fn test_bonds_replace_distance() {
        let frame = Frame::from_positions(0, vec![(1, vec![0.0]), (2, vec![100.0]), (3, vec![0.1])])
            .unwrap()
            .with_bonds(vec![(1, 2), (2, 1), (3, 3)]);
        let set = detector(1.0).detect(&frame).unwrap();
        assert_eq!(members(&set), vec![vec![1, 2], vec![3]]);
        assert_eq!(set.clusters()[0].shape, ClusterShape::Chain);
    }

    #[test]
    fn test_invalid_bond() {
        let frame = Frame::from_positions(7, vec![(1, vec![0.0]), (2, vec![1.0])]).unwrap().with_bonds(vec![(1, 42)]);
        let err = detector(1.0).detect(&frame).unwrap_err();
        assert_eq!(err, TrackError::InvalidBond { frame: 7, a: 1, b: 42 });
    }

    #[test]
    fn test_missing_criterion() {
        let det = ConnectivityDetector::new(ConnectivityParams::default()).unwrap();
        let frame = Frame::from_positions(2, vec![(1, vec![0.0])]).unwrap();
        assert_eq!(det.detect(&frame).unwrap_err(), TrackError::MissingCriterion { frame: 2 });

        let bonded = Frame::from_positions(2, vec![(1, vec![0.0]), (2, vec![5.0])]).unwrap().with_bonds(vec![(1, 2)]);
        assert_eq!(det.detect(&bonded).unwrap().len(), 1);
    }

    #[test]
    fn test_pair_cutoffs() {
        let params = ConnectivityParams {
            radius: Some(1.0),
            pair_cutoffs: vec![PairCutoff { a: 1, b: 2, radius: 0.3 }],
            parallel: false,
        };
        let det = ConnectivityDetector::new(params).unwrap();
        let frame = Frame::new(
            0,
            vec![
                Particle::new(1, vec![0.0]).with_species(1),
                Particle::new(2, vec![0.5]).with_species(2),
                Particle::new(3, vec![5.0]).with_species(1),
                Particle::new(4, vec![5.5]).with_species(1),
            ],
        )
        .unwrap();
        let set = det.detect(&frame).unwrap();
        assert_eq!(members(&set), vec![vec![1], vec![2], vec![3, 4]]);
    }

    #[test]
    fn test_invalid_params() {
        assert!(ConnectivityDetector::new(ConnectivityParams::with_radius(-1.0)).is_err());
        let params = ConnectivityParams {
            radius: Some(1.0),
            pair_cutoffs: vec![PairCutoff { a: 0, b: 0, radius: 2.0 }],
            parallel: false,
        };
        assert!(ConnectivityDetector::new(params).is_err());
    }

    #[test]
    fn test_empty_frame() {
        let frame = Frame::new(0, Vec::new()).unwrap();
        let set = detector(1.0).detect(&frame).unwrap();
        assert!(set.is_empty());
    }
}
