//! Star catalog and radius-bounded catalog subsetting.
//!
//! The refinement engine only needs one thing from a catalog: the stars
//! brighter than a magnitude limit inside a cone around a sky position. That
//! query is expressed by the [`CatalogSubset`] trait. [`StarCatalog`] is the
//! concrete implementation: it owns the stars, indexes their unit vectors in a
//! KD-tree, and loads/saves a simple CSV format (`ra,dec,mag` in degrees).

use std::io;
use std::path::Path;

use kiddo::ImmutableKdTree;
use kiddo::SquaredEuclidean;

use crate::projection::radec_to_vector;

/// A catalog star. Coordinates are in degrees.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CatalogStar {
    pub ra: f64,
    pub dec: f64,
    pub mag: f64,
}

/// Catalog access needed by the residual evaluator.
pub trait CatalogSubset: Sync {
    /// Get a star by index.
    fn star(&self, index: usize) -> &CatalogStar;

    /// Number of stars in the catalog.
    fn num_stars(&self) -> usize;

    /// Indices of stars within `radius` radians of the unit vector `center`.
    ///
    /// Order is unspecified. The default implementation scans every star.
    fn nearby_stars(&self, center: &[f64; 3], radius: f64) -> Vec<usize> {
        let cos_radius = radius.cos();
        (0..self.num_stars())
            .filter(|&i| {
                let s = self.star(i);
                let v = radec_to_vector(s.ra, s.dec);
                center[0] * v.x + center[1] * v.y + center[2] * v.z > cos_radius
            })
            .collect()
    }

    /// Stars within `radius_deg` of `(center_ra, center_dec)` and no fainter
    /// than `mag_limit`, in catalog order.
    ///
    /// Catalog order is preserved so that downstream tie-breaks are stable.
    fn subset(
        &self,
        center_ra: f64,
        center_dec: f64,
        radius_deg: f64,
        mag_limit: f64,
    ) -> Vec<CatalogStar> {
        if !radius_deg.is_finite() || radius_deg <= 0.0 {
            return Vec::new();
        }
        let c = radec_to_vector(center_ra, center_dec);
        let radius = radius_deg.min(180.0).to_radians();

        let mut indices = self.nearby_stars(&[c.x, c.y, c.z], radius);
        indices.sort_unstable();
        indices
            .into_iter()
            .map(|i| *self.star(i))
            .filter(|s| s.mag <= mag_limit)
            .collect()
    }
}

/// Catalog backed by owned star data and a KD-tree over unit vectors.
pub struct StarCatalog {
    stars: Vec<CatalogStar>,
    /// Absent for an empty catalog.
    kdtree: Option<ImmutableKdTree<f64, 3>>,
}

impl StarCatalog {
    /// Build a catalog from stars; the spatial index is built immediately.
    pub fn new(stars: Vec<CatalogStar>) -> Self {
        let points: Vec<[f64; 3]> = stars
            .iter()
            .map(|s| {
                let v = radec_to_vector(s.ra, s.dec);
                [v.x, v.y, v.z]
            })
            .collect();
        let kdtree = (!points.is_empty()).then(|| ImmutableKdTree::new_from_slice(&points));
        Self { stars, kdtree }
    }

    /// All stars in catalog order.
    pub fn stars(&self) -> &[CatalogStar] {
        &self.stars
    }

    /// Load a catalog CSV with an `ra,dec,mag` header.
    ///
    /// Stars fainter than `mag_limit` (when given) are skipped at load time.
    pub fn load_csv(path: &Path, mag_limit: Option<f64>) -> io::Result<Self> {
        let mut rdr = csv::ReaderBuilder::new()
            .has_headers(true)
            .trim(csv::Trim::All)
            .from_path(path)
            .map_err(io::Error::other)?;

        let mut stars = Vec::new();
        for (row, result) in rdr.records().enumerate() {
            let record = result.map_err(io::Error::other)?;
            let parse = |idx: usize| -> io::Result<f64> {
                record
                    .get(idx)
                    .ok_or_else(|| {
                        io::Error::new(
                            io::ErrorKind::InvalidData,
                            format!("row {}: missing column {}", row + 1, idx),
                        )
                    })?
                    .parse()
                    .map_err(|e| {
                        io::Error::new(io::ErrorKind::InvalidData, format!("row {}: {}", row + 1, e))
                    })
            };
            let star = CatalogStar {
                ra: parse(0)?,
                dec: parse(1)?,
                mag: parse(2)?,
            };
            if mag_limit.map_or(true, |lim| star.mag <= lim) {
                stars.push(star);
            }
        }
        Ok(Self::new(stars))
    }

    /// Write the catalog as CSV with an `ra,dec,mag` header.
    pub fn save_csv(&self, path: &Path) -> io::Result<()> {
        let mut wtr = csv::Writer::from_path(path).map_err(io::Error::other)?;
        wtr.write_record(["ra", "dec", "mag"])
            .map_err(io::Error::other)?;
        for star in &self.stars {
            wtr.write_record([
                star.ra.to_string(),
                star.dec.to_string(),
                star.mag.to_string(),
            ])
            .map_err(io::Error::other)?;
        }
        wtr.flush()
    }
}

impl CatalogSubset for StarCatalog {
    fn star(&self, index: usize) -> &CatalogStar {
        &self.stars[index]
    }

    fn num_stars(&self) -> usize {
        self.stars.len()
    }

    /// Converts the angular radius to squared chord length on the unit
    /// sphere, `d² = 2 - 2·cos(θ)`, and queries the KD-tree.
    fn nearby_stars(&self, center: &[f64; 3], radius: f64) -> Vec<usize> {
        let Some(tree) = &self.kdtree else {
            return Vec::new();
        };
        let sq_dist = 2.0 - 2.0 * radius.cos();
        tree.within::<SquaredEuclidean>(center, sq_dist)
            .iter()
            .map(|nn| nn.item as usize)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn star(ra: f64, dec: f64, mag: f64) -> CatalogStar {
        CatalogStar { ra, dec, mag }
    }

    fn sample_stars() -> Vec<CatalogStar> {
        vec![
            star(10.0, 0.0, 1.0),
            star(10.0, 5.0, 3.0),
            star(10.0, 12.0, 2.0),
            star(40.0, 0.0, 1.0),
            star(190.0, 0.0, 0.5),
            star(11.0, -1.0, 6.0),
        ]
    }

    /// Brute-force reference using the trait's default scan.
    struct ScanCatalog(Vec<CatalogStar>);

    impl CatalogSubset for ScanCatalog {
        fn star(&self, index: usize) -> &CatalogStar {
            &self.0[index]
        }

        fn num_stars(&self) -> usize {
            self.0.len()
        }
    }

    #[test]
    fn test_subset_radius_and_magnitude() {
        let cat = StarCatalog::new(sample_stars());
        let subset = cat.subset(10.0, 0.0, 8.0, 4.5);
        assert_eq!(subset, vec![star(10.0, 0.0, 1.0), star(10.0, 5.0, 3.0)]);
    }

    #[test]
    fn test_subset_preserves_catalog_order() {
        let cat = StarCatalog::new(sample_stars());
        let subset = cat.subset(10.0, 0.0, 40.0, 10.0);
        let expected: Vec<CatalogStar> = sample_stars()
            .into_iter()
            .filter(|s| s.ra < 100.0)
            .collect();
        assert_eq!(subset, expected);
    }

    #[test]
    fn test_kdtree_matches_brute_force() {
        let stars = sample_stars();
        let tree = StarCatalog::new(stars.clone());
        let scan = ScanCatalog(stars);
        for &(ra, dec, r) in &[(10.0, 0.0, 3.0), (20.0, 5.0, 25.0), (190.0, 1.0, 2.0)] {
            assert_eq!(tree.subset(ra, dec, r, 10.0), scan.subset(ra, dec, r, 10.0));
        }
    }

    #[test]
    fn test_subset_degenerate_radius() {
        let cat = StarCatalog::new(sample_stars());
        assert!(cat.subset(10.0, 0.0, f64::INFINITY, 10.0).is_empty());
        assert!(cat.subset(10.0, 0.0, f64::NAN, 10.0).is_empty());
        assert!(cat.subset(10.0, 0.0, -1.0, 10.0).is_empty());
    }

    #[test]
    fn test_empty_catalog() {
        let cat = StarCatalog::new(Vec::new());
        assert!(cat.subset(0.0, 0.0, 10.0, 10.0).is_empty());
    }

    #[test]
    fn test_csv_roundtrip_with_mag_limit() {
        let cat = StarCatalog::new(sample_stars());
        let path = std::env::temp_dir().join("platefit_test_catalog.csv");
        cat.save_csv(&path).expect("save failed");

        let all = StarCatalog::load_csv(&path, None).expect("load failed");
        assert_eq!(all.stars(), cat.stars());

        let bright = StarCatalog::load_csv(&path, Some(2.0)).expect("load failed");
        assert_eq!(bright.num_stars(), 4);
        assert!(bright.stars().iter().all(|s| s.mag <= 2.0));

        std::fs::remove_file(&path).ok();
    }
}
