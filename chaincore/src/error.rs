use thiserror::Error;

use crate::data::particle::ParticleId;

/// Errors raised while building frames, detecting clusters or tracking them over time.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum TrackError {
    /// A bond references a particle that is not part of the frame. Fatal for the run.
    #[error("frame {frame}: bond ({a}, {b}) references a particle not present in the frame")]
    InvalidBond { frame: u64, a: ParticleId, b: ParticleId },

    /// Query for a particle identifier that is not indexed.
    #[error("particle {0} not found")]
    NotFound(ParticleId),

    /// Lookup of a persistent cluster id that has no live track.
    #[error("no live track for persistent cluster {0}")]
    UnknownCluster(u64),

    /// Frames must arrive with strictly increasing indices.
    #[error("frame {got} is not after the last processed frame {last}")]
    OutOfOrderFrame { last: u64, got: u64 },

    /// Particle membership was not conserved across a transition. Signals a defect.
    #[error("frame {frame}: membership not conserved on the {side} side (expected {expected}, found {found})")]
    ConservationViolation {
        frame: u64,
        side: &'static str,
        expected: usize,
        found: usize,
    },

    #[error("frame {frame}: particle {id} appears more than once")]
    DuplicateParticle { frame: u64, id: ParticleId },

    #[error("frame {frame}: particle {id} has dimension {found}, expected {expected}")]
    DimensionMismatch {
        frame: u64,
        id: ParticleId,
        expected: usize,
        found: usize,
    },

    #[error("frame {frame}: particle {id} has an empty position")]
    EmptyPosition { frame: u64, id: ParticleId },

    /// No connectivity radius is configured and the frame carries no bond list.
    #[error("frame {frame}: no connectivity radius configured and no bond list supplied")]
    MissingCriterion { frame: u64 },

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("checkpoint error: {0}")]
    Checkpoint(String),

    /// A summary or configuration could not be serialized for export.
    #[error("export error: {0}")]
    Export(String),
}

impl TrackError {
    /// Fatal errors abort the run; the rest are local to the caller.
    pub fn is_fatal(&self) -> bool {
        !matches!(
            self,
            TrackError::NotFound(_)
                | TrackError::UnknownCluster(_)
                | TrackError::InvalidConfig(_)
                | TrackError::Export(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, TrackError>;
