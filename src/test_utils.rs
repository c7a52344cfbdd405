//! Synthetic nights shared by the unit tests.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::calstars::{DetectedStar, Exposure};
use crate::catalog::{CatalogStar, StarCatalog};
use crate::platepar::Platepar;
use crate::projection::{radec_to_vector, GnomonicProjection, Projection, POLY_TERMS};

pub struct SyntheticNight {
    pub projection: GnomonicProjection,
    pub catalog: StarCatalog,
    pub exposures: Vec<Exposure>,
    pub mag_limit: f64,
    /// Platepar the detections were generated with.
    pub truth: Platepar,
}

pub const MAG_LIMIT: f64 = 4.5;

pub fn truth_platepar() -> Platepar {
    Platepar::new(30.0, 20.0, 10.0, 8.0, 640, 480, 2_458_000.5, POLY_TERMS)
}

fn detection(x: f64, y: f64) -> DetectedStar {
    DetectedStar {
        y,
        x,
        bg_level: 20.0,
        intensity: 1500.0,
    }
}

/// Ten bright stars on a coarse pixel grid, seen in `n_exposures` exposures.
///
/// Every detection sits exactly where the true platepar projects its catalog
/// star, shifted by `offset_px` along x.
pub fn grid_night(n_exposures: usize, offset_px: f64) -> SyntheticNight {
    let projection = GnomonicProjection;
    let truth = truth_platepar();

    let mut xs = Vec::new();
    let mut ys = Vec::new();
    for &y in &[180.0, 300.0] {
        for &x in &[160.0, 240.0, 320.0, 400.0, 480.0] {
            xs.push(x);
            ys.push(y);
        }
    }
    let (ra, dec) = projection.inverse(&truth, truth.jd, &xs, &ys);
    let stars: Vec<CatalogStar> = ra
        .iter()
        .zip(dec.iter())
        .map(|(&ra, &dec)| CatalogStar { ra, dec, mag: 2.0 })
        .collect();

    let exposures = (0..n_exposures)
        .map(|k| {
            let jd = truth.jd + 0.002 * k as f64;
            let (x, y) = projection.forward(&truth, jd, &ra, &dec);
            Exposure {
                jd,
                stars: x
                    .iter()
                    .zip(y.iter())
                    .map(|(&x, &y)| detection(x + offset_px, y))
                    .collect(),
            }
        })
        .collect();

    SyntheticNight {
        projection,
        catalog: StarCatalog::new(stars),
        exposures,
        mag_limit: MAG_LIMIT,
        truth,
    }
}

/// Random star field around the true pointing, observed in `n_exposures`
/// exposures spaced about six minutes apart.
///
/// Bright stars are at least 3° apart. The catalog also carries faint stars
/// that are never detected, and each exposure has two spurious detections.
pub fn synthetic_night(n_exposures: usize, seed: u64) -> SyntheticNight {
    let mut rng = StdRng::seed_from_u64(seed);
    let projection = GnomonicProjection;
    let truth = truth_platepar();
    let spacing = 0.004;

    let cap_center = radec_to_vector(
        truth.ra_d + 360.985_647 * spacing * n_exposures as f64 / 2.0,
        truth.dec_d,
    );
    let cap_cos = 48.0_f64.to_radians().cos();
    let min_sep_cos = 3.0_f64.to_radians().cos();

    let mut stars: Vec<CatalogStar> = Vec::new();
    let mut attempts = 0;
    while stars.len() < 100 && attempts < 200_000 {
        attempts += 1;
        let ra = rng.gen_range(0.0..360.0);
        let dec = rng.gen_range(-1.0f64..1.0).asin().to_degrees();
        let v = radec_to_vector(ra, dec);
        if v.dot(&cap_center) < cap_cos {
            continue;
        }
        let crowded = stars
            .iter()
            .any(|s| radec_to_vector(s.ra, s.dec).dot(&v) > min_sep_cos);
        if crowded {
            continue;
        }
        stars.push(CatalogStar {
            ra,
            dec,
            mag: rng.gen_range(0.0..4.0),
        });
    }
    let bright = stars.len();
    for _ in 0..20 {
        let s = stars[rng.gen_range(0..bright)];
        stars.push(CatalogStar {
            ra: s.ra + rng.gen_range(-1.0..1.0),
            dec: s.dec + rng.gen_range(-1.0..1.0),
            mag: 6.0,
        });
    }

    let ra: Vec<f64> = stars[..bright].iter().map(|s| s.ra).collect();
    let dec: Vec<f64> = stars[..bright].iter().map(|s| s.dec).collect();
    let width = truth.x_res as f64;
    let height = truth.y_res as f64;

    let exposures = (0..n_exposures)
        .map(|k| {
            let jd = truth.jd + spacing * k as f64;
            let (x, y) = projection.forward(&truth, jd, &ra, &dec);
            let mut detected: Vec<DetectedStar> = x
                .iter()
                .zip(y.iter())
                .filter(|&(&x, &y)| x > 2.0 && x < width - 2.0 && y > 2.0 && y < height - 2.0)
                .map(|(&x, &y)| detection(x, y))
                .collect();

            let mut spurious = 0;
            while spurious < 2 {
                let sx = rng.gen_range(0.0..width);
                let sy = rng.gen_range(0.0..height);
                if detected.iter().all(|d| (d.x - sx).hypot(d.y - sy) > 15.0) {
                    detected.push(detection(sx, sy));
                    spurious += 1;
                }
            }
            Exposure { jd, stars: detected }
        })
        .collect();

    SyntheticNight {
        projection,
        catalog: StarCatalog::new(stars),
        exposures,
        mag_limit: MAG_LIMIT,
        truth,
    }
}
