//! Night-wide refinement of a platepar.
//!
//! [`AutoFit`] takes the stars detected over a whole night and an approximate
//! platepar and improves it in stages:
//!
//! 1. Check the exposure pool is large enough and draw a random sample from it.
//! 2. For each matching radius in the coarse-to-fine schedule:
//!    - score the current platepar and give up if it matches too few stars,
//!    - minimize the cost over pointing and scale,
//!    - minimize over the X distortion coefficients,
//!    - minimize over the Y distortion coefficients.
//!
//! Any failed step stops the run. The outcome always carries the platepar as
//! last updated together with the reason it stopped, so the caller decides
//! whether anything is worth saving.

use std::fmt;
use std::time::Instant;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use thiserror::Error;

use crate::calstars::Exposure;
use crate::catalog::CatalogSubset;
use crate::config::FitConfig;
use crate::platepar::{Axis, Platepar};
use crate::projection::Projection;
use crate::residuals::{MatchStats, ResidualEvaluator};
use crate::simplex::{Minimizer, NelderMead};

/// Parameters minimized together in one step of a radius stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamGroup {
    /// RA, Dec, position angle and scale.
    Pointing,
    DistortionX,
    DistortionY,
}

impl ParamGroup {
    pub const ALL: [ParamGroup; 3] = [
        ParamGroup::Pointing,
        ParamGroup::DistortionX,
        ParamGroup::DistortionY,
    ];

    fn params(self, pp: &Platepar) -> Vec<f64> {
        match self {
            ParamGroup::Pointing => pp.pointing_params().to_vec(),
            ParamGroup::DistortionX => pp.x_poly.clone(),
            ParamGroup::DistortionY => pp.y_poly.clone(),
        }
    }

    /// Write `params` into `pp`. Lengths always come from [`Self::params`].
    fn apply(self, pp: &mut Platepar, params: &[f64]) {
        match self {
            ParamGroup::Pointing => pp.set_pointing_params(params),
            ParamGroup::DistortionX => pp.x_poly.copy_from_slice(params),
            ParamGroup::DistortionY => pp.y_poly.copy_from_slice(params),
        }
    }
}

impl fmt::Display for ParamGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParamGroup::Pointing => write!(f, "pointing"),
            ParamGroup::DistortionX => write!(f, "x distortion"),
            ParamGroup::DistortionY => write!(f, "y distortion"),
        }
    }
}

/// Why a refinement run stopped early.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum RefineError {
    #[error("{found} qualifying exposures, need at least {required}")]
    InsufficientExposures { found: usize, required: usize },

    #[error("{found} detected stars in the sampled exposures, need at least {required}")]
    InsufficientStars { found: usize, required: usize },

    #[error("initial fit too poor at radius {radius} px: {matched} matched stars, need {required}")]
    PoorInitialFit {
        radius: f64,
        matched: usize,
        required: f64,
    },

    #[error("minimizer did not converge on {group} at radius {radius} px")]
    OptimizerDivergence { radius: f64, group: ParamGroup },

    #[error("{axis} distortion has {found} coefficients, projection expects {expected}")]
    CoefficientMismatch {
        axis: Axis,
        found: usize,
        expected: usize,
    },

    #[error("stage at radius {radius} px took {elapsed_s:.1} s, limit is {limit_s:.1} s")]
    StageTimeout {
        radius: f64,
        elapsed_s: f64,
        limit_s: f64,
    },

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

/// Match statistics before and after one radius stage.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StageReport {
    pub radius: f64,
    pub before: MatchStats,
    pub after: MatchStats,
}

/// Result of a refinement run.
#[derive(Debug, Clone)]
pub struct FitOutcome {
    /// Platepar as last updated. Equal to the input if the run stopped before
    /// any minimization succeeded.
    pub platepar: Platepar,
    pub success: bool,
    pub failure: Option<RefineError>,
    /// Exposures used after sampling; zero if the run stopped before.
    pub n_sampled: usize,
    /// Statistics of the input platepar at the first radius.
    pub initial_stats: Option<MatchStats>,
    /// Statistics of the refined platepar at the last radius.
    pub final_stats: Option<MatchStats>,
    pub stages: Vec<StageReport>,
}

impl FitOutcome {
    /// The refined platepar, or the reason the run stopped.
    pub fn into_result(self) -> Result<Platepar, RefineError> {
        match self.failure {
            None => Ok(self.platepar),
            Some(err) => Err(err),
        }
    }
}

/// Pick which exposures of a pool of `pool_len` to use.
///
/// Returns every index when the pool is no larger than `target`, otherwise
/// exactly `target` distinct indices drawn uniformly. Indices are sorted, so
/// the sample keeps the pool's time order.
pub fn sample_exposures<R: Rng + ?Sized>(pool_len: usize, target: usize, rng: &mut R) -> Vec<usize> {
    if pool_len <= target {
        return (0..pool_len).collect();
    }
    let mut indices = rand::seq::index::sample(rng, pool_len, target).into_vec();
    indices.sort_unstable();
    indices
}

/// Coarse-to-fine platepar refinement over a night of exposures.
pub struct AutoFit<'a, M: Minimizer = NelderMead> {
    projection: &'a dyn Projection,
    catalog: &'a dyn CatalogSubset,
    config: &'a FitConfig,
    minimizer: M,
}

impl<'a> AutoFit<'a, NelderMead> {
    /// Refinement with a Nelder–Mead minimizer tuned from `config`.
    pub fn new(
        projection: &'a dyn Projection,
        catalog: &'a dyn CatalogSubset,
        config: &'a FitConfig,
    ) -> Self {
        let minimizer = NelderMead {
            fatol: config.fatol,
            xatol: config.xatol,
            max_iter: config.max_iter,
            max_fev: None,
        };
        Self {
            projection,
            catalog,
            config,
            minimizer,
        }
    }
}

impl<'a, M: Minimizer> AutoFit<'a, M> {
    /// Swap in a different minimizer.
    pub fn with_minimizer<N: Minimizer>(self, minimizer: N) -> AutoFit<'a, N> {
        AutoFit {
            projection: self.projection,
            catalog: self.catalog,
            config: self.config,
            minimizer,
        }
    }

    /// Run with a generator seeded from the configuration, or from entropy if
    /// no seed is configured.
    pub fn run_seeded(&self, platepar: &Platepar, pool: &[Exposure]) -> FitOutcome {
        let mut rng = match self.config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        self.run(platepar, pool, &mut rng)
    }

    /// Refine `platepar` against the exposure `pool`.
    ///
    /// `pool` must already be filtered to exposures with enough stars. `rng`
    /// is only used to sample exposures.
    pub fn run<R: Rng + ?Sized>(&self, platepar: &Platepar, pool: &[Exposure], rng: &mut R) -> FitOutcome {
        let config = self.config;
        let mut outcome = FitOutcome {
            platepar: platepar.clone(),
            success: false,
            failure: None,
            n_sampled: 0,
            initial_stats: None,
            final_stats: None,
            stages: Vec::new(),
        };

        if let Err(err) = config.validate() {
            return abort(outcome, RefineError::InvalidConfig(err.to_string()));
        }

        let expected = self.projection.poly_len();
        for axis in [Axis::X, Axis::Y] {
            let found = platepar.poly(axis).len();
            if found != expected {
                return abort(
                    outcome,
                    RefineError::CoefficientMismatch {
                        axis,
                        found,
                        expected,
                    },
                );
            }
        }

        if pool.len() < config.min_exposures {
            return abort(
                outcome,
                RefineError::InsufficientExposures {
                    found: pool.len(),
                    required: config.min_exposures,
                },
            );
        }

        let sampled: Vec<Exposure> = sample_exposures(pool.len(), config.sample_size, rng)
            .into_iter()
            .map(|i| pool[i].clone())
            .collect();
        outcome.n_sampled = sampled.len();
        let total_stars: usize = sampled.iter().map(|e| e.stars.len()).sum();
        tracing::info!(
            "using {} of {} exposures, {} detected stars",
            sampled.len(),
            pool.len(),
            total_stars
        );
        if total_stars < config.min_total_stars {
            return abort(
                outcome,
                RefineError::InsufficientStars {
                    found: total_stars,
                    required: config.min_total_stars,
                },
            );
        }

        let evaluator = ResidualEvaluator::new(
            self.projection,
            self.catalog,
            &sampled,
            config.catalog_mag_limit,
            config.min_matched_stars,
        );

        for &radius in &config.radius_schedule {
            let started = Instant::now();

            let before = evaluator.evaluate(&outcome.platepar, radius);
            tracing::info!(
                "radius {:.2} px: {} matched stars, mean distance {:.3} px, cost {:.5}",
                radius,
                before.n_matched,
                before.mean_distance,
                before.cost
            );
            if outcome.initial_stats.is_none() {
                outcome.initial_stats = Some(before);
            }

            let required = config.min_initial_matches_per_exposure * sampled.len() as f64;
            if (before.n_matched as f64) < required {
                return abort(
                    outcome,
                    RefineError::PoorInitialFit {
                        radius,
                        matched: before.n_matched,
                        required,
                    },
                );
            }

            for group in ParamGroup::ALL {
                if let Err(err) = self.refine_group(&mut outcome.platepar, &evaluator, radius, group) {
                    return abort(outcome, err);
                }
            }

            let after = evaluator.evaluate(&outcome.platepar, radius);
            outcome.stages.push(StageReport {
                radius,
                before,
                after,
            });
            tracing::info!(
                "radius {:.2} px done: {} matched stars, mean distance {:.3} px",
                radius,
                after.n_matched,
                after.mean_distance
            );

            if let Some(limit_s) = config.stage_timeout_s {
                let elapsed_s = started.elapsed().as_secs_f64();
                if elapsed_s > limit_s {
                    return abort(
                        outcome,
                        RefineError::StageTimeout {
                            radius,
                            elapsed_s,
                            limit_s,
                        },
                    );
                }
            }
        }

        outcome.final_stats = outcome.stages.last().map(|s| s.after);
        outcome.success = true;
        tracing::info!(
            "refinement finished: RA {:.4}, Dec {:.4}, PA {:.4}, scale {:.5} px/deg",
            outcome.platepar.ra_d,
            outcome.platepar.dec_d,
            outcome.platepar.pos_angle_ref,
            outcome.platepar.f_scale
        );
        outcome
    }

    /// Minimize the cost over one parameter group and write the result into
    /// `working`. Trial values are applied to a copy, never to `working`.
    fn refine_group(
        &self,
        working: &mut Platepar,
        evaluator: &ResidualEvaluator<'_>,
        radius: f64,
        group: ParamGroup,
    ) -> Result<(), RefineError> {
        let base = working.clone();
        let x0 = group.params(&base);
        let cost = |params: &[f64]| {
            if params.len() != x0.len() {
                return f64::INFINITY;
            }
            let mut trial = base.clone();
            group.apply(&mut trial, params);
            evaluator.cost(&trial, radius)
        };

        let result = self.minimizer.minimize(&cost, &x0);
        tracing::debug!(
            "{} at {:.2} px: cost {:.5}, {} iterations, {} evaluations, converged={}",
            group,
            radius,
            result.fun,
            result.iterations,
            result.evaluations,
            result.converged
        );

        if !result.converged || result.x.len() != x0.len() {
            return Err(RefineError::OptimizerDivergence { radius, group });
        }
        group.apply(working, &result.x);
        Ok(())
    }
}

fn abort(mut outcome: FitOutcome, err: RefineError) -> FitOutcome {
    tracing::warn!("refinement aborted: {}", err);
    outcome.success = false;
    outcome.failure = Some(err);
    outcome
}
