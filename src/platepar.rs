//! Astrometric calibration ("platepar") of a fixed meteor camera.
//!
//! A platepar describes where the camera points at a reference epoch, how the
//! image is rotated and scaled on the sky, and a pair of polynomial lens
//! distortion corrections. Platepars are stored as TOML:
//!
//! ```toml
//! [pointing]
//! ra_d = 312.5
//! dec_d = 45.1
//! pos_angle_ref = 12.0
//! f_scale = 7.2
//! jd = 2457999.5
//!
//! [image]
//! width = 1280
//! height = 720
//!
//! [distortion]
//! x_poly = [0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0]
//! y_poly = [0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0]
//! ```
//!
//! # Usage
//!
//! ```no_run
//! use std::path::Path;
//! use platefit::platepar::Platepar;
//!
//! let pp = Platepar::from_toml_file(Path::new("platepar.toml")).unwrap();
//! println!("field radius: {:.2} deg", pp.field_radius_deg());
//! ```

use std::fmt;
use std::io;
use std::path::{Path, PathBuf};

/// One of the two image axes carrying a distortion polynomial.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Axis {
    X,
    Y,
}

impl fmt::Display for Axis {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Axis::X => write!(f, "x"),
            Axis::Y => write!(f, "y"),
        }
    }
}

/// Astrometric calibration parameters for one camera.
#[derive(Debug, Clone, PartialEq)]
pub struct Platepar {
    /// Right ascension of the image center at `jd`, in degrees.
    pub ra_d: f64,
    /// Declination of the image center, in degrees.
    pub dec_d: f64,
    /// Rotation of the image on the sky, in degrees.
    pub pos_angle_ref: f64,
    /// Plate scale in pixels per degree.
    pub f_scale: f64,
    /// Distortion correction along the image X axis (pixels).
    pub x_poly: Vec<f64>,
    /// Distortion correction along the image Y axis (pixels).
    pub y_poly: Vec<f64>,
    /// Image width in pixels.
    pub x_res: u32,
    /// Image height in pixels.
    pub y_res: u32,
    /// Reference Julian Date at which `ra_d` was measured.
    pub jd: f64,
}

impl Platepar {
    /// Create a platepar with zeroed distortion polynomials of length `poly_len`.
    pub fn new(
        ra_d: f64,
        dec_d: f64,
        pos_angle_ref: f64,
        f_scale: f64,
        x_res: u32,
        y_res: u32,
        jd: f64,
        poly_len: usize,
    ) -> Self {
        Self {
            ra_d,
            dec_d,
            pos_angle_ref,
            f_scale,
            x_poly: vec![0.0; poly_len],
            y_poly: vec![0.0; poly_len],
            x_res,
            y_res,
            jd,
        }
    }

    /// Pointing and scale parameters as `[ra, dec, position angle, scale]`.
    pub fn pointing_params(&self) -> [f64; 4] {
        [self.ra_d, self.dec_d, self.pos_angle_ref, self.f_scale]
    }

    /// Overwrite the pointing and scale parameters.
    pub fn set_pointing_params(&mut self, params: &[f64]) {
        debug_assert_eq!(params.len(), 4);
        self.ra_d = params[0];
        self.dec_d = params[1];
        self.pos_angle_ref = params[2];
        self.f_scale = params[3];
    }

    /// Distortion coefficients for one axis.
    pub fn poly(&self, axis: Axis) -> &[f64] {
        match axis {
            Axis::X => &self.x_poly,
            Axis::Y => &self.y_poly,
        }
    }

    /// Overwrite the distortion coefficients for one axis.
    ///
    /// The coefficient count is fixed by the projection model, so a slice of a
    /// different length is rejected and the platepar is left untouched.
    pub fn set_poly(&mut self, axis: Axis, coeffs: &[f64]) -> Result<(), usize> {
        let target = match axis {
            Axis::X => &mut self.x_poly,
            Axis::Y => &mut self.y_poly,
        };
        if target.len() != coeffs.len() {
            return Err(target.len());
        }
        target.copy_from_slice(coeffs);
        Ok(())
    }

    /// Half-diagonal of the field of view in degrees.
    pub fn field_radius_deg(&self) -> f64 {
        let w = self.x_res as f64;
        let h = self.y_res as f64;
        (w * w + h * h).sqrt() / 2.0 / self.f_scale
    }

    /// Load a platepar from a TOML file.
    pub fn from_toml_file(path: &Path) -> io::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    /// Parse a platepar from a TOML string.
    pub fn from_toml_str(content: &str) -> io::Result<Self> {
        let value: toml::Value = content
            .parse()
            .map_err(|e| invalid(format!("TOML parse error: {}", e)))?;

        let pointing = section(&value, "pointing")?;
        let image = section(&value, "image")?;
        let distortion = section(&value, "distortion")?;

        let x_poly = get_f64_array(distortion, "x_poly")?;
        let y_poly = get_f64_array(distortion, "y_poly")?;
        if x_poly.len() != y_poly.len() {
            return Err(invalid(format!(
                "x_poly has {} coefficients but y_poly has {}",
                x_poly.len(),
                y_poly.len()
            )));
        }

        Ok(Platepar {
            ra_d: get_f64(pointing, "ra_d")?,
            dec_d: get_f64(pointing, "dec_d")?,
            pos_angle_ref: get_f64(pointing, "pos_angle_ref")?,
            f_scale: get_f64(pointing, "f_scale")?,
            jd: get_f64(pointing, "jd")?,
            x_res: get_u32(image, "width")?,
            y_res: get_u32(image, "height")?,
            x_poly,
            y_poly,
        })
    }

    /// Serialize to the TOML layout read by [`Platepar::from_toml_str`].
    pub fn to_toml_string(&self) -> io::Result<String> {
        let mut pointing = toml::Table::new();
        pointing.insert("ra_d".into(), self.ra_d.into());
        pointing.insert("dec_d".into(), self.dec_d.into());
        pointing.insert("pos_angle_ref".into(), self.pos_angle_ref.into());
        pointing.insert("f_scale".into(), self.f_scale.into());
        pointing.insert("jd".into(), self.jd.into());

        let mut image = toml::Table::new();
        image.insert("width".into(), i64::from(self.x_res).into());
        image.insert("height".into(), i64::from(self.y_res).into());

        let mut distortion = toml::Table::new();
        distortion.insert("x_poly".into(), self.x_poly.clone().into());
        distortion.insert("y_poly".into(), self.y_poly.clone().into());

        let mut root = toml::Table::new();
        root.insert("pointing".into(), pointing.into());
        root.insert("image".into(), image.into());
        root.insert("distortion".into(), distortion.into());

        toml::to_string(&root).map_err(|e| invalid(format!("TOML serialize error: {}", e)))
    }

    /// Write the platepar to `path` as TOML.
    pub fn save(&self, path: &Path) -> io::Result<()> {
        std::fs::write(path, self.to_toml_string()?)
    }

    /// Replace the platepar at `path`, keeping the previous file as
    /// `<name>.old`. Returns the backup path.
    ///
    /// The new platepar is written to `<name>.tmp` before the old file is
    /// moved aside, so a failed write leaves `path` as it was.
    pub fn save_with_backup(&self, path: &Path) -> io::Result<PathBuf> {
        let name = path
            .file_name()
            .ok_or_else(|| invalid(format!("not a file path: {}", path.display())))?
            .to_string_lossy()
            .into_owned();
        let tmp = path.with_file_name(format!("{}.tmp", name));
        let backup = path.with_file_name(format!("{}.old", name));

        self.save(&tmp)?;
        if path.exists() {
            if let Err(e) = std::fs::rename(path, &backup) {
                std::fs::remove_file(&tmp).ok();
                return Err(e);
            }
        }
        if let Err(e) = std::fs::rename(&tmp, path) {
            std::fs::rename(&backup, path).ok();
            return Err(e);
        }
        Ok(backup)
    }
}

fn invalid(msg: impl Into<String>) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, msg.into())
}

fn section<'a>(root: &'a toml::Value, name: &str) -> io::Result<&'a toml::Value> {
    root.get(name)
        .ok_or_else(|| invalid(format!("missing [{}] section", name)))
}

fn as_f64(v: &toml::Value) -> Option<f64> {
    v.as_float().or_else(|| v.as_integer().map(|n| n as f64))
}

fn get_f64(table: &toml::Value, key: &str) -> io::Result<f64> {
    table
        .get(key)
        .and_then(as_f64)
        .ok_or_else(|| invalid(format!("missing or invalid '{}'", key)))
}

fn get_u32(table: &toml::Value, key: &str) -> io::Result<u32> {
    table
        .get(key)
        .and_then(|v| v.as_integer())
        .and_then(|i| u32::try_from(i).ok())
        .ok_or_else(|| invalid(format!("missing or invalid '{}'", key)))
}

fn get_f64_array(table: &toml::Value, key: &str) -> io::Result<Vec<f64>> {
    let array = table
        .get(key)
        .and_then(|v| v.as_array())
        .ok_or_else(|| invalid(format!("missing '{}' array", key)))?;

    array
        .iter()
        .enumerate()
        .map(|(i, v)| {
            as_f64(v).ok_or_else(|| invalid(format!("{}[{}] is not a number", key, i)))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Platepar {
        let mut pp = Platepar::new(312.5, 45.1, 12.0, 7.2, 1280, 720, 2457999.5, 12);
        pp.x_poly[1] = 0.25;
        pp.y_poly[11] = -1.5;
        pp
    }

    #[test]
    fn test_toml_roundtrip() {
        let pp = sample();
        let parsed = Platepar::from_toml_str(&pp.to_toml_string().unwrap()).unwrap();
        assert_eq!(parsed, pp);
    }

    #[test]
    fn test_parse_toml_integers() {
        let toml_str = r#"
[pointing]
ra_d = 10
dec_d = -5
pos_angle_ref = 0
f_scale = 8
jd = 2458000

[image]
width = 640
height = 480

[distortion]
x_poly = [0, 0, 0]
y_poly = [0, 0, 0]
"#;
        let pp = Platepar::from_toml_str(toml_str).unwrap();
        assert!((pp.ra_d - 10.0).abs() < 1e-12);
        assert!((pp.dec_d + 5.0).abs() < 1e-12);
        assert_eq!(pp.x_res, 640);
        assert_eq!(pp.x_poly.len(), 3);
    }

    #[test]
    fn test_parse_rejects_uneven_polynomials() {
        let toml_str = r#"
[pointing]
ra_d = 10.0
dec_d = 5.0
pos_angle_ref = 0.0
f_scale = 8.0
jd = 2458000.0

[image]
width = 640
height = 480

[distortion]
x_poly = [0.0, 0.0]
y_poly = [0.0]
"#;
        let err = Platepar::from_toml_str(toml_str).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn test_missing_section() {
        let err = Platepar::from_toml_str("[pointing]\nra_d = 1.0\n").unwrap_err();
        assert!(err.to_string().contains("image") || err.to_string().contains("missing"));
    }

    #[test]
    fn test_set_poly_keeps_length() {
        let mut pp = sample();
        assert_eq!(pp.set_poly(Axis::X, &[1.0; 3]), Err(12));
        assert_eq!(pp.x_poly[1], 0.25);

        pp.set_poly(Axis::Y, &[2.0; 12]).unwrap();
        assert!(pp.poly(Axis::Y).iter().all(|&c| c == 2.0));
        assert_eq!(pp.poly(Axis::X).len(), 12);
    }

    #[test]
    fn test_pointing_params_roundtrip() {
        let mut pp = sample();
        pp.set_pointing_params(&[1.0, 2.0, 3.0, 4.0]);
        assert_eq!(pp.pointing_params(), [1.0, 2.0, 3.0, 4.0]);
    }

    #[test]
    fn test_field_radius_is_half_diagonal() {
        let pp = Platepar::new(0.0, 0.0, 0.0, 10.0, 600, 800, 2451545.0, 12);
        assert!((pp.field_radius_deg() - 50.0).abs() < 1e-12);
    }

    #[test]
    fn test_field_radius_degenerate_scale() {
        let pp = Platepar::new(0.0, 0.0, 0.0, 0.0, 600, 800, 2451545.0, 12);
        assert!(!pp.field_radius_deg().is_finite());
    }

    #[test]
    fn test_save_and_load_file() {
        let pp = sample();
        let path = std::env::temp_dir().join("platefit_test_platepar.toml");
        pp.save(&path).expect("save failed");
        let loaded = Platepar::from_toml_file(&path).expect("load failed");
        assert_eq!(loaded, pp);
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn test_save_with_backup_keeps_previous() {
        let dir = std::env::temp_dir().join("platefit_test_backup_ok");
        std::fs::remove_dir_all(&dir).ok();
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("platepar.toml");
        let old = sample();
        old.save(&path).unwrap();

        let mut new = sample();
        new.ra_d += 1.0;
        let backup = new.save_with_backup(&path).expect("save failed");

        assert_eq!(backup, dir.join("platepar.toml.old"));
        assert_eq!(Platepar::from_toml_file(&path).unwrap(), new);
        assert_eq!(Platepar::from_toml_file(&backup).unwrap(), old);
        assert!(!dir.join("platepar.toml.tmp").exists());
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_failed_save_leaves_platepar_in_place() {
        let dir = std::env::temp_dir().join("platefit_test_backup_fail");
        std::fs::remove_dir_all(&dir).ok();
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("platepar.toml");
        let old = sample();
        old.save(&path).unwrap();
        // A directory in the way of the temporary file makes the write fail.
        std::fs::create_dir_all(dir.join("platepar.toml.tmp")).unwrap();

        let mut new = sample();
        new.ra_d += 1.0;
        assert!(new.save_with_backup(&path).is_err());

        assert_eq!(Platepar::from_toml_file(&path).unwrap(), old);
        assert!(!dir.join("platepar.toml.old").exists());
        std::fs::remove_dir_all(&dir).ok();
    }
}
