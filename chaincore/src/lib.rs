pub mod error;

// data module
pub mod data {
    pub mod particle;
    pub mod cluster;
}

// algorithm module
pub mod algorithm {
    pub mod union_find;
    pub mod spatial;
    pub mod connectivity;
}

pub use error::{Result, TrackError};
