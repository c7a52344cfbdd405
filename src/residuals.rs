//! Scoring a platepar against the stars detected during a night.
//!
//! For every exposure the catalog stars around the field center are projected
//! into the image with the trial platepar and paired with the detected stars
//! (see [`crate::matcher`]). Exposures with too few pairs are ignored. The
//! pooled pair distances give the cost
//!
//! ```text
//! cost = mean_distance² / √(n_matched + 1)
//! ```
//!
//! which prefers both small residuals and many matches. A platepar that
//! matches nothing scores [`SENTINEL_COST`] instead of failing, which steers
//! a minimizer away from that region.

use rayon::prelude::*;

use crate::calstars::Exposure;
use crate::catalog::CatalogSubset;
use crate::matcher::match_stars;
use crate::platepar::Platepar;
use crate::projection::Projection;

/// Cost reported when no star could be matched at all.
pub const SENTINEL_COST: f64 = 9999.0;

/// Aggregate matching statistics for one platepar.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MatchStats {
    /// Matched pairs pooled over all accepted exposures.
    pub n_matched: usize,
    /// Mean pair distance in pixels; infinite when nothing matched.
    pub mean_distance: f64,
    /// Scalar cost, see the module docs.
    pub cost: f64,
}

impl MatchStats {
    fn from_distances(n_matched: usize, distance_sum: f64) -> Self {
        if n_matched == 0 {
            return Self {
                n_matched: 0,
                mean_distance: f64::INFINITY,
                cost: SENTINEL_COST,
            };
        }
        let mean_distance = distance_sum / n_matched as f64;
        Self {
            n_matched,
            mean_distance,
            cost: mean_distance * mean_distance / ((n_matched + 1) as f64).sqrt(),
        }
    }
}

/// Evaluates platepars against a fixed catalog and set of exposures.
///
/// Holds only shared references; every evaluation works on the platepar it is
/// handed, so concurrent evaluations never see each other's trial values.
pub struct ResidualEvaluator<'a> {
    projection: &'a dyn Projection,
    catalog: &'a dyn CatalogSubset,
    exposures: &'a [Exposure],
    mag_limit: f64,
    min_matched_stars: usize,
}

impl<'a> ResidualEvaluator<'a> {
    pub fn new(
        projection: &'a dyn Projection,
        catalog: &'a dyn CatalogSubset,
        exposures: &'a [Exposure],
        mag_limit: f64,
        min_matched_stars: usize,
    ) -> Self {
        Self {
            projection,
            catalog,
            exposures,
            mag_limit,
            min_matched_stars,
        }
    }

    /// Exposures this evaluator scores against.
    pub fn exposures(&self) -> &[Exposure] {
        self.exposures
    }

    /// Match statistics of `pp` at matching radius `max_radius` (pixels).
    pub fn evaluate(&self, pp: &Platepar, max_radius: f64) -> MatchStats {
        let per_exposure: Vec<(usize, f64)> = self
            .exposures
            .par_iter()
            .map(|exposure| self.exposure_residuals(pp, exposure, max_radius))
            .collect();

        // Reduce in exposure order so the sum does not depend on scheduling.
        let (n_matched, distance_sum) = per_exposure
            .iter()
            .filter(|(n, _)| *n > 0)
            .fold((0usize, 0.0f64), |(n, s), &(dn, ds)| (n + dn, s + ds));

        let stats = MatchStats::from_distances(n_matched, distance_sum);
        tracing::trace!(
            "radius={:.2}px matched={} mean={:.4}px cost={:.6}",
            max_radius,
            stats.n_matched,
            stats.mean_distance,
            stats.cost
        );
        stats
    }

    /// Scalar cost of `pp` at matching radius `max_radius`.
    pub fn cost(&self, pp: &Platepar, max_radius: f64) -> f64 {
        self.evaluate(pp, max_radius).cost
    }

    /// Matched pair count and distance sum for one exposure, or `(0, 0.0)` if
    /// the exposure falls below the per-exposure match threshold.
    fn exposure_residuals(&self, pp: &Platepar, exposure: &Exposure, max_radius: f64) -> (usize, f64) {
        let center_x = pp.x_res as f64 / 2.0;
        let center_y = pp.y_res as f64 / 2.0;
        let (ra_c, dec_c) = self
            .projection
            .inverse(pp, exposure.jd, &[center_x], &[center_y]);
        let (Some(&ra_c), Some(&dec_c)) = (ra_c.first(), dec_c.first()) else {
            return (0, 0.0);
        };
        if !ra_c.is_finite() || !dec_c.is_finite() {
            return (0, 0.0);
        }

        let subset = self
            .catalog
            .subset(ra_c, dec_c, pp.field_radius_deg(), self.mag_limit);
        if subset.is_empty() {
            return (0, 0.0);
        }

        let ra: Vec<f64> = subset.iter().map(|s| s.ra).collect();
        let dec: Vec<f64> = subset.iter().map(|s| s.dec).collect();
        let (cat_x, cat_y) = self.projection.forward(pp, exposure.jd, &ra, &dec);

        let width = pp.x_res as f64;
        let height = pp.y_res as f64;
        let in_bounds: Vec<usize> = (0..cat_x.len())
            .filter(|&k| (0.0..width).contains(&cat_x[k]) && (0.0..height).contains(&cat_y[k]))
            .collect();

        let matched = match_stars(&exposure.stars, &cat_x, &cat_y, &in_bounds, max_radius);
        if matched.is_empty() || matched.len() < self.min_matched_stars {
            return (0, 0.0);
        }

        let distance_sum = matched.iter().map(|m| m.distance).sum();
        (matched.len(), distance_sum)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{grid_night, synthetic_night, SyntheticNight};

    fn evaluator<'a>(night: &'a SyntheticNight, min_matched: usize) -> ResidualEvaluator<'a> {
        ResidualEvaluator::new(
            &night.projection,
            &night.catalog,
            &night.exposures,
            night.mag_limit,
            min_matched,
        )
    }

    #[test]
    fn test_exact_calibration_zero_cost() {
        let night = grid_night(3, 0.0);
        let stats = evaluator(&night, 1).evaluate(&night.truth, 3.0);
        assert_eq!(stats.n_matched, 30);
        assert!(stats.mean_distance < 1e-6);
        assert!(stats.cost < 1e-9);
    }

    #[test]
    fn test_uniform_offset_within_radius() {
        let night = grid_night(3, 2.0);
        let stats = evaluator(&night, 1).evaluate(&night.truth, 3.0);
        assert_eq!(stats.n_matched, 30);
        assert!((stats.mean_distance - 2.0).abs() < 1e-6);
        assert!((stats.cost - 4.0 / 31.0_f64.sqrt()).abs() < 1e-6);
    }

    #[test]
    fn test_offset_beyond_radius_is_sentinel() {
        let night = grid_night(3, 2.0);
        let stats = evaluator(&night, 1).evaluate(&night.truth, 1.0);
        assert_eq!(stats.n_matched, 0);
        assert_eq!(stats.cost, SENTINEL_COST);
        assert!(stats.mean_distance.is_infinite());
    }

    #[test]
    fn test_min_matched_threshold_drops_exposures() {
        let night = grid_night(3, 0.0);
        // Each exposure has exactly 10 pairs.
        assert_eq!(evaluator(&night, 10).evaluate(&night.truth, 3.0).n_matched, 30);
        let stats = evaluator(&night, 11).evaluate(&night.truth, 3.0);
        assert_eq!(stats.n_matched, 0);
        assert_eq!(stats.cost, SENTINEL_COST);
    }

    #[test]
    fn test_cost_non_negative_and_sentinel_iff_empty() {
        let night = synthetic_night(4, 7);
        let eval = evaluator(&night, 3);
        let mut pp = night.truth.clone();
        for step in 0..12 {
            pp.ra_d = night.truth.ra_d + 0.05 * step as f64;
            pp.f_scale = night.truth.f_scale * (1.0 + 0.004 * step as f64);
            for &r in &[0.75, 1.5, 3.0] {
                let stats = eval.evaluate(&pp, r);
                assert!(stats.cost >= 0.0);
                assert_eq!(stats.cost == SENTINEL_COST, stats.n_matched == 0);
            }
        }
    }

    #[test]
    fn test_larger_radius_never_decreases_matches() {
        let night = synthetic_night(4, 11);
        let eval = evaluator(&night, 1);
        let mut pp = night.truth.clone();
        pp.dec_d += 0.1;
        pp.pos_angle_ref += 0.2;
        let mut previous = 0;
        for &r in &[0.25, 0.75, 1.5, 3.0, 6.0] {
            let n = eval.evaluate(&pp, r).n_matched;
            assert!(n >= previous, "radius {} matched {} < {}", r, n, previous);
            previous = n;
        }
    }

    #[test]
    fn test_evaluation_is_deterministic() {
        let night = synthetic_night(6, 3);
        let eval = evaluator(&night, 3);
        let mut pp = night.truth.clone();
        pp.ra_d += 0.07;
        let a = eval.evaluate(&pp, 3.0);
        let b = eval.evaluate(&pp, 3.0);
        assert_eq!(a, b);
    }

    #[test]
    fn test_degenerate_scale_is_sentinel() {
        let night = grid_night(3, 0.0);
        let mut pp = night.truth.clone();
        pp.f_scale = 0.0;
        assert_eq!(evaluator(&night, 1).cost(&pp, 3.0), SENTINEL_COST);
        pp.f_scale = -5.0;
        assert_eq!(evaluator(&night, 1).cost(&pp, 3.0), SENTINEL_COST);
    }
}
