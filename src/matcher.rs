//! Nearest-neighbour pairing of detected stars with projected catalog stars.
//!
//! Every detected star is paired with the closest in-bounds catalog star if
//! that star lies strictly within the matching radius. Pairing is not
//! exclusive: several detected stars may claim the same catalog star. When
//! two catalog stars are equally close, the one listed first in
//! `candidates` wins.

use crate::calstars::DetectedStar;

/// A detected star paired with a projected catalog star.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MatchedPair {
    /// Index into the detected-star list.
    pub detected: usize,
    /// Index into the projected catalog arrays.
    pub catalog: usize,
    /// Pixel distance between the two.
    pub distance: f64,
}

/// Match detected stars against projected catalog positions.
///
/// `cat_x`/`cat_y` are parallel arrays of projected catalog pixel positions;
/// only the indices listed in `candidates` are considered. Returns pairs in
/// detected-star order.
pub fn match_stars(
    detected: &[DetectedStar],
    cat_x: &[f64],
    cat_y: &[f64],
    candidates: &[usize],
    max_radius: f64,
) -> Vec<MatchedPair> {
    let mut matches = Vec::new();

    for (i, star) in detected.iter().enumerate() {
        let mut best: Option<(usize, f64)> = None;

        for &k in candidates {
            let dx = star.x - cat_x[k];
            let dy = star.y - cat_y[k];
            let dist = (dx * dx + dy * dy).sqrt();
            if dist.is_nan() {
                continue;
            }
            if best.map_or(true, |(_, d)| dist < d) {
                best = Some((k, dist));
            }
        }

        if let Some((k, dist)) = best {
            if dist < max_radius {
                matches.push(MatchedPair {
                    detected: i,
                    catalog: k,
                    distance: dist,
                });
            }
        }
    }

    matches
}
