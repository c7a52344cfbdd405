//! Sky ↔ pixel projection for a fixed (non-tracking) camera.
//!
//! # Model
//!
//! The camera stays fixed relative to the ground, so the sky drifts through
//! the field at the sidereal rate. The pointing at time `t` (Julian Date) is
//!
//! ```text
//! ra_c(t)  = ra_d + 360.98564736629 * (t - jd_ref)
//! dec_c(t) = dec_d
//! ```
//!
//! Stars are projected gnomonically onto the tangent plane at `(ra_c, dec_c)`,
//! giving standard coordinates `(ξ, η)` (east, north) expressed in degrees.
//! These are rotated by the position angle and scaled by `f_scale`
//! (pixels per degree) into undistorted pixel offsets `(u, v)` from the image
//! center:
//!
//! ```text
//! u = f * ( ξ cos θ + η sin θ)
//! v = f * ( ξ sin θ - η cos θ)
//! ```
//!
//! Lens distortion is added in pixel space from two 12-term polynomials
//! evaluated on offsets normalized by the half-resolution (`X = u / (w/2)`,
//! `Y = v / (h/2)`, `r = √(X² + Y²)`):
//!
//! ```text
//! [1, X, Y, X², XY, Y², X³, X²Y, XY², Y³, X·r, Y·r]
//! ```
//!
//! The inverse transform removes distortion by fixed-point iteration, which
//! converges quickly for the few-pixel corrections a real lens needs.

use nalgebra::{Matrix3, Vector3};

use crate::platepar::Platepar;

/// Sidereal rotation of the sky in degrees per day.
pub const SIDEREAL_DEG_PER_DAY: f64 = 360.985_647_366_29;

/// Number of distortion coefficients per axis in [`GnomonicProjection`].
pub const POLY_TERMS: usize = 12;

/// Fixed-point iterations used to remove distortion in the inverse transform.
const UNDISTORT_ITERATIONS: usize = 20;

/// Pure mapping between sky coordinates and image pixels.
///
/// Implementations must not keep state between calls: the refinement engine
/// evaluates many trial platepars concurrently.
pub trait Projection: Sync {
    /// Project sky positions (degrees) to pixel coordinates `(x, y)`.
    ///
    /// Stars that cannot be projected (e.g. behind the camera) yield NaN.
    fn forward(&self, pp: &Platepar, jd: f64, ra: &[f64], dec: &[f64]) -> (Vec<f64>, Vec<f64>);

    /// Map pixel coordinates back to sky positions `(ra, dec)` in degrees.
    fn inverse(&self, pp: &Platepar, jd: f64, x: &[f64], y: &[f64]) -> (Vec<f64>, Vec<f64>);

    /// Number of distortion coefficients expected per axis.
    fn poly_len(&self) -> usize;
}

/// Gnomonic projection with polynomial pixel-space distortion.
#[derive(Debug, Clone, Copy, Default)]
pub struct GnomonicProjection;

impl Projection for GnomonicProjection {
    fn forward(&self, pp: &Platepar, jd: f64, ra: &[f64], dec: &[f64]) -> (Vec<f64>, Vec<f64>) {
        let (ra_c, dec_c) = pointing_at(pp, jd);
        let basis = camera_basis(ra_c, dec_c);
        let (sin_pa, cos_pa) = pp.pos_angle_ref.to_radians().sin_cos();
        let (hw, hh) = half_resolution(pp);

        ra.iter()
            .zip(dec.iter())
            .map(|(&ra, &dec)| {
                let cam = basis * radec_to_vector(ra, dec);
                if cam.z <= 0.0 {
                    return (f64::NAN, f64::NAN);
                }
                let xi = (cam.x / cam.z).to_degrees();
                let eta = (cam.y / cam.z).to_degrees();

                let u = pp.f_scale * (xi * cos_pa + eta * sin_pa);
                let v = pp.f_scale * (xi * sin_pa - eta * cos_pa);
                let (du, dv) = distortion(pp, u / hw, v / hh);
                (hw + u + du, hh + v + dv)
            })
            .unzip()
    }

    fn inverse(&self, pp: &Platepar, jd: f64, x: &[f64], y: &[f64]) -> (Vec<f64>, Vec<f64>) {
        let (ra_c, dec_c) = pointing_at(pp, jd);
        let basis_t = camera_basis(ra_c, dec_c).transpose();
        let (sin_pa, cos_pa) = pp.pos_angle_ref.to_radians().sin_cos();
        let (hw, hh) = half_resolution(pp);

        x.iter()
            .zip(y.iter())
            .map(|(&px, &py)| {
                let u_d = px - hw;
                let v_d = py - hh;

                let mut u = u_d;
                let mut v = v_d;
                for _ in 0..UNDISTORT_ITERATIONS {
                    let (du, dv) = distortion(pp, u / hw, v / hh);
                    u = u_d - du;
                    v = v_d - dv;
                }

                let xi = (u * cos_pa + v * sin_pa) / pp.f_scale;
                let eta = (u * sin_pa - v * cos_pa) / pp.f_scale;

                let cam = Vector3::new(xi.to_radians(), eta.to_radians(), 1.0);
                vector_to_radec(&(basis_t * cam.normalize()))
            })
            .unzip()
    }

    fn poly_len(&self) -> usize {
        POLY_TERMS
    }
}

/// Pointing of the image center at Julian Date `jd`.
pub fn pointing_at(pp: &Platepar, jd: f64) -> (f64, f64) {
    let ra = pp.ra_d + SIDEREAL_DEG_PER_DAY * (jd - pp.jd);
    (ra.rem_euclid(360.0), pp.dec_d)
}

/// Unit vector on the celestial sphere for `(ra, dec)` in degrees.
pub fn radec_to_vector(ra: f64, dec: f64) -> Vector3<f64> {
    let (sin_ra, cos_ra) = ra.to_radians().sin_cos();
    let (sin_dec, cos_dec) = dec.to_radians().sin_cos();
    Vector3::new(cos_ra * cos_dec, sin_ra * cos_dec, sin_dec)
}

/// `(ra, dec)` in degrees of a celestial unit vector.
pub fn vector_to_radec(v: &Vector3<f64>) -> (f64, f64) {
    let ra = v.y.atan2(v.x).to_degrees().rem_euclid(360.0);
    let dec = v.z.clamp(-1.0, 1.0).asin().to_degrees();
    (ra, dec)
}

/// Rotation from the celestial frame into the tangent-plane frame at
/// `(ra_c, dec_c)`.
///
/// Rows are the local east, north, and boresight directions, so the rotated
/// vector has `x` = east, `y` = north, `z` = along the boresight.
fn camera_basis(ra_c: f64, dec_c: f64) -> Matrix3<f64> {
    let (sin_ra, cos_ra) = ra_c.to_radians().sin_cos();
    let (sin_dec, cos_dec) = dec_c.to_radians().sin_cos();

    Matrix3::new(
        -sin_ra,
        cos_ra,
        0.0,
        -sin_dec * cos_ra,
        -sin_dec * sin_ra,
        cos_dec,
        cos_dec * cos_ra,
        cos_dec * sin_ra,
        sin_dec,
    )
}

fn half_resolution(pp: &Platepar) -> (f64, f64) {
    (pp.x_res as f64 / 2.0, pp.y_res as f64 / 2.0)
}

/// Pixel-space distortion `(du, dv)` at normalized image offset `(x, y)`.
fn distortion(pp: &Platepar, x: f64, y: f64) -> (f64, f64) {
    let terms = poly_terms(x, y);
    (dot(&pp.x_poly, &terms), dot(&pp.y_poly, &terms))
}

fn poly_terms(x: f64, y: f64) -> [f64; POLY_TERMS] {
    let r = (x * x + y * y).sqrt();
    [
        1.0,
        x,
        y,
        x * x,
        x * y,
        y * y,
        x * x * x,
        x * x * y,
        x * y * y,
        y * y * y,
        x * r,
        y * r,
    ]
}

fn dot(coeffs: &[f64], terms: &[f64]) -> f64 {
    coeffs.iter().zip(terms.iter()).map(|(c, t)| c * t).sum()
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn platepar() -> Platepar {
        Platepar::new(30.0, 20.0, 10.0, 8.0, 640, 480, 2458000.5, POLY_TERMS)
    }

    #[test]
    fn test_center_maps_to_pointing() {
        let pp = platepar();
        let (ra, dec) = GnomonicProjection.inverse(&pp, pp.jd, &[320.0], &[240.0]);
        assert_relative_eq!(ra[0], 30.0, epsilon = 1e-9);
        assert_relative_eq!(dec[0], 20.0, epsilon = 1e-9);

        let (x, y) = GnomonicProjection.forward(&pp, pp.jd, &[30.0], &[20.0]);
        assert_relative_eq!(x[0], 320.0, epsilon = 1e-9);
        assert_relative_eq!(y[0], 240.0, epsilon = 1e-9);
    }

    #[test]
    fn test_forward_inverse_roundtrip() {
        let mut pp = platepar();
        pp.x_poly[1] = 0.8;
        pp.x_poly[3] = -0.5;
        pp.y_poly[2] = 0.4;
        pp.y_poly[11] = 0.3;

        let xs = [10.0, 320.0, 600.0, 150.0];
        let ys = [20.0, 100.0, 450.0, 400.0];
        let jd = pp.jd + 0.1;

        let (ra, dec) = GnomonicProjection.inverse(&pp, jd, &xs, &ys);
        let (x2, y2) = GnomonicProjection.forward(&pp, jd, &ra, &dec);
        for i in 0..xs.len() {
            assert_relative_eq!(x2[i], xs[i], epsilon = 1e-6);
            assert_relative_eq!(y2[i], ys[i], epsilon = 1e-6);
        }
    }

    #[test]
    fn test_sky_drifts_at_sidereal_rate() {
        let pp = platepar();
        let one_hour = 1.0 / 24.0;
        let jd = pp.jd + one_hour;
        let (ra_c, dec_c) = pointing_at(&pp, jd);
        // The JD sum rounds to about 5e-10 days, so compare against the
        // offset that was actually represented.
        assert_relative_eq!(ra_c, 30.0 + SIDEREAL_DEG_PER_DAY * (jd - pp.jd), epsilon = 1e-9);
        assert_relative_eq!(ra_c, 30.0 + SIDEREAL_DEG_PER_DAY / 24.0, epsilon = 1e-6);
        assert_relative_eq!(dec_c, 20.0, epsilon = 1e-12);
    }

    #[test]
    fn test_scale_matches_pixels_per_degree() {
        // Zero position angle: north is up (decreasing y).
        let pp = Platepar::new(0.0, 0.0, 0.0, 10.0, 1000, 1000, 2451545.0, POLY_TERMS);
        let (x, y) = GnomonicProjection.forward(&pp, pp.jd, &[0.0], &[1.0]);
        let expected = 10.0 * 1.0_f64.to_radians().tan().to_degrees();
        assert_relative_eq!(x[0], 500.0, epsilon = 1e-9);
        assert_relative_eq!(500.0 - y[0], expected, epsilon = 1e-9);
    }

    #[test]
    fn test_constant_term_shifts_pixels() {
        let mut pp = platepar();
        pp.x_poly[0] = 2.0;
        pp.y_poly[0] = -1.0;
        let (x, y) = GnomonicProjection.forward(&pp, pp.jd, &[30.0], &[20.0]);
        assert_relative_eq!(x[0], 322.0, epsilon = 1e-9);
        assert_relative_eq!(y[0], 239.0, epsilon = 1e-9);
    }

    #[test]
    fn test_star_behind_camera_is_nan() {
        let pp = platepar();
        let (x, y) = GnomonicProjection.forward(&pp, pp.jd, &[210.0], &[-20.0]);
        assert!(x[0].is_nan());
        assert!(y[0].is_nan());
    }

    #[test]
    fn test_vector_radec_roundtrip() {
        for &(ra, dec) in &[(0.0, 0.0), (123.4, -56.7), (359.9, 89.0)] {
            let (r, d) = vector_to_radec(&radec_to_vector(ra, dec));
            assert_relative_eq!(r, ra, epsilon = 1e-9);
            assert_relative_eq!(d, dec, epsilon = 1e-9);
        }
    }
}
