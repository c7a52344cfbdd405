//! Night-wide astrometric calibration refinement for fixed meteor cameras.
//!
//! Given the stars detected in many exposures of one night, a star catalog and
//! an approximate calibration ("platepar"), the crate refines the pointing,
//! scale and lens distortion so that projected catalog stars land on the
//! detected stars. The fit runs coarse to fine over a schedule of matching
//! radii and minimizes the cost with a Nelder–Mead simplex.
//!
//! ```no_run
//! use std::path::Path;
//! use platefit::calstars::{build_exposure_pool, read_calstars};
//! use platefit::catalog::StarCatalog;
//! use platefit::config::FitConfig;
//! use platefit::platepar::Platepar;
//! use platefit::projection::GnomonicProjection;
//! use platefit::refine::AutoFit;
//!
//! let config = FitConfig::default();
//! let platepar = Platepar::from_toml_file(Path::new("night/platepar.toml")).unwrap();
//! let catalog = StarCatalog::load_csv(Path::new("catalog.csv"), Some(config.catalog_mag_limit)).unwrap();
//! let (_, entries) = read_calstars(Path::new("night/CALSTARS.txt")).unwrap();
//! let pool = build_exposure_pool(&entries, config.station.fps, config.ff_min_stars);
//!
//! let outcome = AutoFit::new(&GnomonicProjection, &catalog, &config).run_seeded(&platepar, &pool);
//! if outcome.success {
//!     outcome.platepar.save(Path::new("night/platepar.toml")).unwrap();
//! }
//! ```

pub mod calstars;
pub mod catalog;
pub mod config;
pub mod matcher;
pub mod platepar;
pub mod projection;
pub mod refine;
pub mod residuals;
pub mod simplex;

#[cfg(test)]
mod test_utils;
