//! Thresholds and schedules for a night-wide refinement run.
//!
//! Configuration is read from TOML. Every key is optional and falls back to
//! the station defaults below; unknown keys are ignored.
//!
//! ```toml
//! min_exposures = 200
//! sample_size = 300
//! radius_schedule = [3.0, 1.5, 0.75]
//! seed = 42
//!
//! [station]
//! fps = 25.0
//! platepar_name = "platepar.toml"
//! ```

use std::io;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors raised while loading a [`FitConfig`].
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] io::Error),
    #[error("invalid config: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Per-station settings needed to turn a night directory into exposures.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StationConfig {
    /// Video frame rate, used to timestamp the middle of each FF block.
    pub fps: f64,
    /// File name of the platepar inside the night directory.
    pub platepar_name: String,
    /// Star catalog CSV (`ra,dec,mag`).
    pub catalog_path: PathBuf,
}

impl Default for StationConfig {
    fn default() -> Self {
        Self {
            fps: 25.0,
            platepar_name: "platepar.toml".to_string(),
            catalog_path: PathBuf::from("catalog.csv"),
        }
    }
}

/// Configuration of the refinement controller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FitConfig {
    /// FF files with fewer detected stars are not used.
    pub ff_min_stars: usize,
    /// Minimum number of qualifying exposures needed to attempt a fit.
    pub min_exposures: usize,
    /// Number of exposures drawn from a larger pool.
    pub sample_size: usize,
    /// Minimum detected stars summed over the sampled exposures.
    pub min_total_stars: usize,
    /// Exposures matching fewer stars are left out of the cost.
    pub min_matched_stars: usize,
    /// Faintest catalog magnitude considered.
    pub catalog_mag_limit: f64,
    /// Matching radii in pixels, coarse to fine.
    pub radius_schedule: Vec<f64>,
    /// A stage starts only if the current platepar matches at least this many
    /// stars per sampled exposure.
    pub min_initial_matches_per_exposure: f64,
    /// Absolute cost tolerance of the simplex minimizer.
    pub fatol: f64,
    /// Absolute parameter tolerance of the simplex minimizer.
    pub xatol: f64,
    /// Iteration cap per minimization; `200 * n_params` when unset.
    pub max_iter: Option<usize>,
    /// Abort if a single radius stage runs longer than this many seconds.
    pub stage_timeout_s: Option<f64>,
    /// Seed for exposure sampling; drawn from entropy when unset.
    pub seed: Option<u64>,
    pub station: StationConfig,
}

impl Default for FitConfig {
    fn default() -> Self {
        Self {
            ff_min_stars: 5,
            min_exposures: 400,
            sample_size: 400,
            min_total_stars: 500,
            min_matched_stars: 7,
            catalog_mag_limit: 4.5,
            radius_schedule: vec![3.0, 1.5, 0.75],
            min_initial_matches_per_exposure: 1.0,
            fatol: 0.1,
            xatol: 1e-4,
            max_iter: None,
            stage_timeout_s: None,
            seed: None,
            station: StationConfig::default(),
        }
    }
}

impl FitConfig {
    /// Parse a configuration from TOML text.
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load a configuration from a TOML file.
    pub fn from_toml_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    /// Reject settings the controller cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.radius_schedule.is_empty() {
            return Err(ConfigError::Invalid("radius_schedule is empty".into()));
        }
        if let Some(r) = self
            .radius_schedule
            .iter()
            .find(|r| !r.is_finite() || **r <= 0.0)
        {
            return Err(ConfigError::Invalid(format!(
                "matching radius must be positive, got {}",
                r
            )));
        }
        if self.sample_size == 0 {
            return Err(ConfigError::Invalid("sample_size must be at least 1".into()));
        }
        if !self.station.fps.is_finite() || self.station.fps <= 0.0 {
            return Err(ConfigError::Invalid(format!(
                "fps must be positive, got {}",
                self.station.fps
            )));
        }
        Ok(())
    }
}
