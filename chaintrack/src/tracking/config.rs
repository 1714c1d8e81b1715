use serde::{Deserialize, Serialize};

use chaincore::algorithm::connectivity::{ConnectivityParams, PairCutoff};
use chaincore::{Result, TrackError};

use crate::tracking::matching::MatchParams;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackerConfig {
    /// Connectivity radius; required unless every frame supplies a bond list.
    pub radius: Option<f64>,
    /// Species-pair cutoffs, each <= `radius`.
    pub pair_cutoffs: Vec<PairCutoff>,
    /// Minimum Jaccard overlap for identity to carry across a transition, in (0, 1].
    pub continuity_threshold: f64,
    /// Size changes strictly beyond this tag a continuation as Growth/Shrink.
    pub size_tolerance: usize,
    /// Sample each live cluster's size on frames divisible by this stride.
    pub size_series_stride: u64,
    /// Capacity of the mobility reservoir.
    pub reservoir_capacity: usize,
    pub reservoir_seed: u64,
    /// Evaluate neighbor lists on the rayon pool.
    pub parallel: bool,
    /// Verify membership conservation on every transition.
    pub check_conservation: bool,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            radius: None,
            pair_cutoffs: Vec::new(),
            continuity_threshold: 0.5,
            size_tolerance: 0,
            size_series_stride: 1,
            reservoir_capacity: 1000,
            reservoir_seed: 0x5eed_c1a5,
            parallel: true,
            check_conservation: cfg!(debug_assertions),
        }
    }
}

impl TrackerConfig {
    pub fn with_radius(radius: f64) -> Self {
        Self { radius: Some(radius), ..Self::default() }
    }

    /// Bond-list only configuration; frames without bonds will fail.
    pub fn bonds_only() -> Self {
        Self::default()
    }

    pub fn with_continuity_threshold(mut self, threshold: f64) -> Self {
        self.continuity_threshold = threshold;
        self
    }

    pub fn with_size_tolerance(mut self, tolerance: usize) -> Self {
        self.size_tolerance = tolerance;
        self
    }

    pub fn with_size_series_stride(mut self, stride: u64) -> Self {
        self.size_series_stride = stride;
        self
    }

    pub fn with_reservoir(mut self, capacity: usize, seed: u64) -> Self {
        self.reservoir_capacity = capacity;
        self.reservoir_seed = seed;
        self
    }

    pub fn with_pair_cutoff(mut self, cutoff: PairCutoff) -> Self {
        self.pair_cutoffs.push(cutoff);
        self
    }

    pub fn with_parallel(mut self, parallel: bool) -> Self {
        self.parallel = parallel;
        self
    }

    pub fn with_conservation_check(mut self, check: bool) -> Self {
        self.check_conservation = check;
        self
    }

    /// Parse a JSON document; absent fields take their defaults.
    ///
    /// # Examples
    ///
    /// ```
    /// use chaintrack::TrackerConfig;
    ///
    /// let config = TrackerConfig::from_json_str(r#"{ "radius": 1.5, "continuity_threshold": 0.3 }"#).unwrap();
    /// assert_eq!(config.radius, Some(1.5));
    /// assert_eq!(config.size_series_stride, 1);
    /// ```
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: TrackerConfig =
            serde_json::from_str(json).map_err(|e| TrackError::InvalidConfig(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self).map_err(|e| TrackError::Export(e.to_string()))
    }

    pub fn validate(&self) -> Result<()> {
        self.connectivity_params().validate()?;
        let t = self.continuity_threshold;
        if !(t > 0.0 && t <= 1.0) {
            return Err(TrackError::InvalidConfig(format!(
                "continuity_threshold must lie in (0, 1], got {t}"
            )));
        }
        if self.size_series_stride == 0 {
            return Err(TrackError::InvalidConfig("size_series_stride must be positive".to_string()));
        }
        if self.reservoir_capacity == 0 {
            return Err(TrackError::InvalidConfig("reservoir_capacity must be positive".to_string()));
        }
        Ok(())
    }

    pub fn connectivity_params(&self) -> ConnectivityParams {
        ConnectivityParams {
            radius: self.radius,
            pair_cutoffs: self.pair_cutoffs.clone(),
            parallel: self.parallel,
        }
    }

    pub fn match_params(&self) -> MatchParams {
        MatchParams { continuity_threshold: self.continuity_threshold }
    }
}
