use itertools::Itertools;
use rustc_hash::FxHashMap;

use crate::data::particle::{distance_sq, Frame, ParticleId};
use crate::error::{Result, TrackError};

/// Uniform grid over one frame's positions with cell edge >= the query radius, so every
/// neighbor within `radius` lives in the 3^D block of cells around a particle.
#[derive(Clone, Debug)]
pub struct SpatialIndex {
    radius: f64,
    inv_cell: f64,
    dim: usize,
    /// dense index -> particle id (ascending)
    ids: Vec<ParticleId>,
    /// flat coordinates, stride `dim`
    coords: Vec<f64>,
    index_of: FxHashMap<ParticleId, usize>,
    cells: FxHashMap<Vec<i64>, Vec<usize>>,
    offsets: Vec<Vec<i64>>,
}

impl SpatialIndex {
    /// Build the grid in O(n).
    ///
    /// # Arguments
    ///
    /// * `frame` - the frame to index.
    /// * `radius` - connectivity radius; must be positive and finite.
    ///
    /// # Examples
    ///
    /// ```
    /// use chaincore::data::particle::Frame;
    /// use chaincore::algorithm::spatial::SpatialIndex;
    ///
    /// let frame = Frame::from_positions(0, vec![(1, vec![0.0, 0.0]), (2, vec![0.5, 0.0]), (3, vec![5.0, 5.0])]).unwrap();
    /// let index = SpatialIndex::build(&frame, 1.0).unwrap();
    /// assert_eq!(index.neighbors(1).unwrap(), vec![2]);
    /// assert!(index.neighbors(3).unwrap().is_empty());
    /// ```
    pub fn build(frame: &Frame, radius: f64) -> Result<Self> {
        if !(radius.is_finite() && radius > 0.0) {
            return Err(TrackError::InvalidConfig(format!(
                "connectivity radius must be positive and finite, got {radius}"
            )));
        }

        let dim = frame.dim();
        let n = frame.len();
        // slightly oversized cells keep exact-radius pairs in adjacent cells despite rounding
        let inv_cell = 1.0 / (radius * (1.0 + 1e-9));

        let mut ids = Vec::with_capacity(n);
        let mut coords = Vec::with_capacity(n * dim);
        let mut index_of = FxHashMap::default();
        index_of.reserve(n);
        let mut cells: FxHashMap<Vec<i64>, Vec<usize>> = FxHashMap::default();

        for (i, p) in frame.particles().enumerate() {
            ids.push(p.id);
            coords.extend_from_slice(&p.position);
            index_of.insert(p.id, i);
            cells.entry(cell_key(&p.position, inv_cell)).or_default().push(i);
        }

        let offsets = if dim == 0 {
            Vec::new()
        } else {
            std::iter::repeat_n(-1i64..=1, dim).multi_cartesian_product().collect()
        };

        Ok(SpatialIndex { radius, inv_cell, dim, ids, coords, index_of, cells, offsets })
    }

    pub fn radius(&self) -> f64 {
        self.radius
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    /// Particle id for a dense index.
    #[inline]
    pub fn id_at(&self, index: usize) -> ParticleId {
        self.ids[index]
    }

    #[inline]
    pub fn index_of(&self, id: ParticleId) -> Option<usize> {
        self.index_of.get(&id).copied()
    }

    #[inline]
    pub fn position(&self, index: usize) -> &[f64] {
        &self.coords[index * self.dim..(index + 1) * self.dim]
    }

    /// Identifiers within `radius` of `id` (excluding `id`), ascending.
    pub fn neighbors(&self, id: ParticleId) -> Result<Vec<ParticleId>> {
        let i = self.index_of(id).ok_or(TrackError::NotFound(id))?;
        Ok(self.neighbors_of_index(i).into_iter().map(|j| self.ids[j]).collect())
    }

    /// Dense indices within `radius` of dense index `i` (excluding `i`), ascending.
    pub fn neighbors_of_index(&self, i: usize) -> Vec<usize> {
        let mut out = Vec::new();
        self.for_each_neighbor(i, |j, _| out.push(j));
        out.sort_unstable();
        out
    }

    /// Visit every neighbor `j` of `i` within `radius` together with the squared distance.
    pub fn for_each_neighbor<F: FnMut(usize, f64)>(&self, i: usize, mut f: F) {
        let pos = self.position(i);
        let base = cell_key(pos, self.inv_cell);
        let r2 = self.radius * self.radius;
        let mut key = vec![0i64; self.dim];

        for off in &self.offsets {
            for d in 0..self.dim {
                key[d] = base[d].saturating_add(off[d]);
            }
            let Some(bucket) = self.cells.get(&key) else { continue };
            for &j in bucket {
                if j == i {
                    continue;
                }
                let d2 = distance_sq(pos, self.position(j));
                if d2 <= r2 {
                    f(j, d2);
                }
            }
        }
    }
}

#[inline]
fn cell_key(pos: &[f64], inv_cell: f64) -> Vec<i64> {
    // float -> int casts saturate, NaN lands in cell 0 and never passes the distance test
    pos.iter().map(|&x| (x * inv_cell).floor() as i64).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn line_frame() -> Frame {
        Frame::from_positions(
            0,
            vec![
                (10, vec![0.0, 0.0, 0.0]),
                (11, vec![0.9, 0.0, 0.0]),
                (12, vec![1.8, 0.0, 0.0]),
                (13, vec![10.0, 0.0, 0.0]),
                (14, vec![-0.5, 0.5, 0.5]),
            ],
        )
        .unwrap()
    }

    #[test]
    fn test_neighbors_within_radius() {
        let index = SpatialIndex::build(&line_frame(), 1.0).unwrap();
        assert_eq!(index.neighbors(10).unwrap(), vec![11, 14]);
        assert_eq!(index.neighbors(11).unwrap(), vec![10, 12]);
        assert_eq!(index.neighbors(12).unwrap(), vec![11]);
        assert!(index.neighbors(13).unwrap().is_empty());
    }

    #[test]
    fn test_radius_is_inclusive() {
        let frame = Frame::from_positions(0, vec![(1, vec![0.0, 0.0]), (2, vec![2.0, 0.0])]).unwrap();
        let index = SpatialIndex::build(&frame, 2.0).unwrap();
        assert_eq!(index.neighbors(1).unwrap(), vec![2]);
    }

    #[test]
    fn test_negative_coordinates_cross_cells() {
        let frame = Frame::from_positions(0, vec![(1, vec![-0.1]), (2, vec![0.1]), (3, vec![-2.5])]).unwrap();
        let index = SpatialIndex::build(&frame, 0.5).unwrap();
        assert_eq!(index.neighbors(1).unwrap(), vec![2]);
        assert_eq!(index.neighbors(2).unwrap(), vec![1]);
    }

    #[test]
    fn test_matches_brute_force() {
        let mut pts = Vec::new();
        let mut x = 0.37f64;
        for id in 0..60u64 {
            // deterministic pseudo-random walk
            x = (x * 9301.0 + 49297.0) % 233280.0;
            let a = x / 233280.0 * 6.0;
            x = (x * 9301.0 + 49297.0) % 233280.0;
            let b = x / 233280.0 * 6.0;
            pts.push((id, vec![a, b]));
        }
        let frame = Frame::from_positions(0, pts.clone()).unwrap();
        let index = SpatialIndex::build(&frame, 0.8).unwrap();

        for (id, p) in &pts {
            let mut expect: Vec<ParticleId> = pts
                .iter()
                .filter(|(j, q)| j != id && distance_sq(p, q) <= 0.8 * 0.8)
                .map(|(j, _)| *j)
                .collect();
            expect.sort_unstable();
            assert_eq!(index.neighbors(*id).unwrap(), expect);
        }
    }

    #[test]
    fn test_unknown_id() {
        let index = SpatialIndex::build(&line_frame(), 1.0).unwrap();
        assert_eq!(index.neighbors(99).unwrap_err(), TrackError::NotFound(99));
    }

    #[test]
    fn test_empty_frame() {
        let frame = Frame::new(0, Vec::new()).unwrap();
        let index = SpatialIndex::build(&frame, 1.0).unwrap();
        assert!(index.is_empty());
        assert_eq!(index.neighbors(1).unwrap_err(), TrackError::NotFound(1));
    }

    #[test]
    fn test_bad_radius() {
        assert!(SpatialIndex::build(&line_frame(), 0.0).is_err());
        assert!(SpatialIndex::build(&line_frame(), f64::NAN).is_err());
    }
}
