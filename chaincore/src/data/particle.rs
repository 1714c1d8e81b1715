use std::collections::BTreeMap;
use std::fmt;
use std::fmt::Formatter;

use serde::{Deserialize, Serialize};

use crate::error::{Result, TrackError};

/// Stable particle identifier, the join key across frames.
pub type ParticleId = u64;

/// Optional species/type tag.
pub type Species = u32;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Particle {
    pub id: ParticleId,
    pub position: Vec<f64>,
    pub species: Option<Species>,
}

impl Particle {
    /// Creates a new `Particle` without a species tag.
    ///
    /// # Arguments
    ///
    /// * `id` - identifier, stable across frames.
    /// * `position` - D-dimensional position, already unwrapped upstream.
    ///
    /// # Examples
    ///
    /// ```
    /// use chaincore::data::particle::Particle;
    ///
    /// let p = Particle::new(7, vec![0.0, 1.5, 2.0]);
    /// assert_eq!(p.dim(), 3);
    /// ```
    pub fn new(id: ParticleId, position: Vec<f64>) -> Self {
        Particle { id, position, species: None }
    }

    pub fn with_species(mut self, species: Species) -> Self {
        self.species = Some(species);
        self
    }

    pub fn dim(&self) -> usize {
        self.position.len()
    }

    #[inline]
    pub fn distance_sq(&self, other: &Particle) -> f64 {
        distance_sq(&self.position, &other.position)
    }
}

#[inline]
pub fn distance_sq(a: &[f64], b: &[f64]) -> f64 {
    a.iter().zip(b.iter()).map(|(x, y)| (x - y) * (x - y)).sum()
}

/// One trajectory snapshot. Particles are kept ordered by identifier so that every
/// traversal of a frame is deterministic.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(try_from = "FrameRecord", into = "FrameRecord")]
pub struct Frame {
    pub index: u64,
    particles: BTreeMap<ParticleId, Particle>,
    bonds: Option<Vec<(ParticleId, ParticleId)>>,
    dim: usize,
}

impl Frame {
    /// Creates a new `Frame`, validating that identifiers are unique and that all
    /// positions share one non-zero dimension.
    ///
    /// # Arguments
    ///
    /// * `index` - monotonic frame index.
    /// * `particles` - the particles observed in this frame.
    ///
    /// # Examples
    ///
    /// ```
    /// use chaincore::data::particle::{Frame, Particle};
    ///
    /// let frame = Frame::new(0, vec![Particle::new(1, vec![0.0, 0.0]), Particle::new(2, vec![1.0, 0.0])]).unwrap();
    /// assert_eq!(frame.len(), 2);
    /// assert_eq!(frame.dim(), 2);
    /// ```
    pub fn new(index: u64, particles: Vec<Particle>) -> Result<Self> {
        let mut map = BTreeMap::new();
        let mut dim = 0usize;

        for p in particles {
            if p.position.is_empty() {
                return Err(TrackError::EmptyPosition { frame: index, id: p.id });
            }
            if dim == 0 {
                dim = p.dim();
            } else if p.dim() != dim {
                return Err(TrackError::DimensionMismatch {
                    frame: index,
                    id: p.id,
                    expected: dim,
                    found: p.dim(),
                });
            }
            let id = p.id;
            if map.insert(id, p).is_some() {
                return Err(TrackError::DuplicateParticle { frame: index, id });
            }
        }

        Ok(Frame { index, particles: map, bonds: None, dim })
    }

    /// Convenience constructor from `(id, position)` pairs.
    pub fn from_positions<I>(index: u64, positions: I) -> Result<Self>
    where
        I: IntoIterator<Item = (ParticleId, Vec<f64>)>,
    {
        Frame::new(index, positions.into_iter().map(|(id, pos)| Particle::new(id, pos)).collect())
    }

    /// Attach an explicit bond list. When present it replaces the distance criterion.
    pub fn with_bonds(mut self, bonds: Vec<(ParticleId, ParticleId)>) -> Self {
        self.bonds = Some(bonds);
        self
    }

    pub fn bonds(&self) -> Option<&[(ParticleId, ParticleId)]> {
        self.bonds.as_deref()
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    pub fn len(&self) -> usize {
        self.particles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.particles.is_empty()
    }

    pub fn get(&self, id: ParticleId) -> Option<&Particle> {
        self.particles.get(&id)
    }

    pub fn contains(&self, id: ParticleId) -> bool {
        self.particles.contains_key(&id)
    }

    /// Particles in ascending identifier order.
    pub fn particles(&self) -> impl Iterator<Item = &Particle> {
        self.particles.values()
    }

    pub fn ids(&self) -> impl Iterator<Item = ParticleId> + '_ {
        self.particles.keys().copied()
    }
}

/// Serialized form of a [`Frame`]. Decoding goes through [`Frame::new`], so a
/// decoded frame satisfies the same checks as a constructed one.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FrameRecord {
    pub index: u64,
    pub particles: Vec<Particle>,
    #[serde(default)]
    pub bonds: Option<Vec<(ParticleId, ParticleId)>>,
}

impl TryFrom<FrameRecord> for Frame {
    type Error = TrackError;

    fn try_from(record: FrameRecord) -> Result<Self> {
        let frame = Frame::new(record.index, record.particles)?;
        Ok(match record.bonds {
            Some(bonds) => frame.with_bonds(bonds),
            None => frame,
        })
    }
}

impl From<Frame> for FrameRecord {
    fn from(frame: Frame) -> Self {
        FrameRecord { index: frame.index, particles: frame.particles.into_values().collect(), bonds: frame.bonds }
    }
}

impl fmt::Display for Frame {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Frame(index: {}, particles: {}, dim: {}, bonds: {})",
            self.index,
            self.particles.len(),
            self.dim,
            self.bonds.as_ref().map(|b| b.len().to_string()).unwrap_or_else(|| "none".to_string())
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_orders_by_id() {
        let frame = Frame::from_positions(0, vec![(5, vec![0.0]), (1, vec![1.0]), (3, vec![2.0])]).unwrap();
        let ids: Vec<ParticleId> = frame.ids().collect();
        assert_eq!(ids, vec![1, 3, 5]);
    }

    #[test]
    fn test_duplicate_rejected() {
        let err = Frame::from_positions(4, vec![(1, vec![0.0]), (1, vec![1.0])]).unwrap_err();
        assert_eq!(err, TrackError::DuplicateParticle { frame: 4, id: 1 });
    }

    #[test]
    fn test_dimension_mismatch_rejected() {
        let err = Frame::from_positions(0, vec![(1, vec![0.0, 0.0]), (2, vec![1.0])]).unwrap_err();
        assert_eq!(err, TrackError::DimensionMismatch { frame: 0, id: 2, expected: 2, found: 1 });
    }

    #[test]
    fn test_empty_position_rejected() {
        let err = Frame::from_positions(0, vec![(9, vec![])]).unwrap_err();
        assert_eq!(err, TrackError::EmptyPosition { frame: 0, id: 9 });
    }

    #[test]
    fn test_empty_frame() {
        let frame = Frame::new(2, Vec::new()).unwrap();
        assert!(frame.is_empty());
        assert_eq!(frame.dim(), 0);
    }

    #[test]
    fn test_decoding_validates() {
        let frame = Frame::from_positions(3, vec![(2, vec![1.0, 0.0]), (1, vec![0.0, 0.0])]).unwrap().with_bonds(vec![(1, 2)]);
        let json = serde_json::to_string(&frame).unwrap();
        let back: Frame = serde_json::from_str(&json).unwrap();
        assert_eq!(back.ids().collect::<Vec<_>>(), vec![1, 2]);
        assert_eq!(back.bonds(), Some(&[(1, 2)][..]));

        let dup = r#"{"index":0,"particles":[{"id":1,"position":[0.0],"species":null},{"id":1,"position":[1.0],"species":null}]}"#;
        let err = serde_json::from_str::<Frame>(dup).unwrap_err();
        assert!(err.to_string().contains("appears more than once"));

        let mixed = r#"{"index":0,"particles":[{"id":1,"position":[0.0],"species":null},{"id":2,"position":[1.0,2.0],"species":null}]}"#;
        assert!(serde_json::from_str::<Frame>(mixed).is_err());
    }

    #[test]
    fn test_distance_sq() {
        let a = Particle::new(1, vec![0.0, 0.0, 0.0]);
        let b = Particle::new(2, vec![1.0, 2.0, 2.0]);
        assert!((a.distance_sq(&b) - 9.0).abs() < 1e-12);
    }
}
