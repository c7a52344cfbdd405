//! Detected-star lists (CALSTARS) and the exposure pool built from them.
//!
//! A CALSTARS file holds, for every FF (four-frame temporal pixel) file
//! recorded during a night, the stars the extractor found in it:
//!
//! ```text
//! ==========================================================================
//! Asteria star extractor
//! Cal time = FF header time plus 255/(2*framerate_Hz) seconds
//! Row  Column  Intensity-Backgnd  Intensity  (integrated values)
//! ==========================================================================
//! FF folder = /data/night
//! Cam #  = 1
//! Nrows  = 720
//! Ncols  = 1280
//! Nstars = -1
//! ==========================================================================
//! FF_CA0001_20170905_014231_187_0000000.fits
//! Star area dim = -1
//! Integ pixels  = -1
//!  123.45  456.78     12   3456
//! ...
//! ##########################################################################
//! ```
//!
//! Star lines are `row column background intensity`. FF file names carry the
//! block start time, from which the Julian Date of the block middle is
//! derived.

use std::fmt;
use std::io;
use std::path::Path;

use chrono::NaiveDateTime;

/// Number of video frames compressed into one FF file.
pub const FRAMES_PER_FF: f64 = 256.0;

/// Julian Date of the Unix epoch.
const JD_UNIX_EPOCH: f64 = 2_440_587.5;

const SECTION_SEPARATOR: &str =
    "==========================================================================";
const END_SEPARATOR: &str =
    "##########################################################################";

/// A star found by the extractor in one exposure.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DetectedStar {
    /// Row (pixel Y).
    pub y: f64,
    /// Column (pixel X).
    pub x: f64,
    /// Background level around the star.
    pub bg_level: f64,
    /// Integrated intensity.
    pub intensity: f64,
}

/// One exposure with its detected stars, keyed by Julian Date.
#[derive(Debug, Clone, PartialEq)]
pub struct Exposure {
    pub jd: f64,
    pub stars: Vec<DetectedStar>,
}

/// Per-FF entry of a CALSTARS file.
#[derive(Debug, Clone, PartialEq)]
pub struct CalstarsEntry {
    pub ff_name: String,
    pub stars: Vec<DetectedStar>,
}

/// Header metadata of a CALSTARS file.
#[derive(Debug, Clone, PartialEq)]
pub struct CalstarsHeader {
    pub ff_directory: String,
    pub cam_code: String,
    pub nrows: u32,
    pub ncols: u32,
}

/// Read a CALSTARS file.
pub fn read_calstars(path: &Path) -> io::Result<(CalstarsHeader, Vec<CalstarsEntry>)> {
    let content = std::fs::read_to_string(path)?;
    parse_calstars(&content)
}

/// Parse CALSTARS text.
///
/// Unknown header lines are ignored; each star line must have four numeric
/// columns.
pub fn parse_calstars(content: &str) -> io::Result<(CalstarsHeader, Vec<CalstarsEntry>)> {
    let mut header = CalstarsHeader {
        ff_directory: String::new(),
        cam_code: String::new(),
        nrows: 0,
        ncols: 0,
    };
    let mut entries: Vec<CalstarsEntry> = Vec::new();
    let mut expect_name = false;

    for (line_no, raw) in content.lines().enumerate() {
        let line = raw.trim();
        if line.is_empty() {
            continue;
        }
        if line.starts_with("=====") {
            expect_name = true;
            continue;
        }
        if line.starts_with("#####") {
            break;
        }

        if let Some((key, value)) = line.split_once('=') {
            let value = value.trim();
            match key.trim() {
                "FF folder" => header.ff_directory = value.to_string(),
                "Cam #" => header.cam_code = value.to_string(),
                "Nrows" => header.nrows = parse_field(value, line_no)?,
                "Ncols" => header.ncols = parse_field(value, line_no)?,
                _ => {}
            }
            continue;
        }

        if expect_name {
            expect_name = false;
            if line.starts_with("FF") {
                entries.push(CalstarsEntry {
                    ff_name: line.to_string(),
                    stars: Vec::new(),
                });
            }
            continue;
        }

        let Some(entry) = entries.last_mut() else {
            continue;
        };
        entry.stars.push(parse_star_line(line, line_no)?);
    }

    Ok((header, entries))
}

fn parse_field<T: std::str::FromStr>(value: &str, line_no: usize) -> io::Result<T>
where
    T::Err: std::fmt::Display,
{
    value.parse().map_err(|e: T::Err| {
        io::Error::new(
            io::ErrorKind::InvalidData,
            format!("line {}: {}", line_no + 1, e),
        )
    })
}

fn parse_star_line(line: &str, line_no: usize) -> io::Result<DetectedStar> {
    let cols: Vec<&str> = line.split_whitespace().collect();
    if cols.len() < 4 {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("line {}: expected 4 star columns, got {}", line_no + 1, cols.len()),
        ));
    }
    Ok(DetectedStar {
        y: parse_field(cols[0], line_no)?,
        x: parse_field(cols[1], line_no)?,
        bg_level: parse_field(cols[2], line_no)?,
        intensity: parse_field(cols[3], line_no)?,
    })
}

/// Render CALSTARS text for the given entries.
pub fn format_calstars(header: &CalstarsHeader, entries: &[CalstarsEntry]) -> String {
    let mut out = String::new();
    // Writing into a String cannot fail.
    if write_calstars_text(&mut out, header, entries).is_err() {
        out.clear();
    }
    out
}

fn write_calstars_text(
    out: &mut impl fmt::Write,
    header: &CalstarsHeader,
    entries: &[CalstarsEntry],
) -> fmt::Result {
    writeln!(out, "{}", SECTION_SEPARATOR)?;
    writeln!(out, "Asteria star extractor")?;
    writeln!(out, "Cal time = FF header time plus 255/(2*framerate_Hz) seconds")?;
    writeln!(out, "Row  Column  Intensity-Backgnd  Intensity  (integrated values)")?;
    writeln!(out, "{}", SECTION_SEPARATOR)?;
    writeln!(out, "FF folder = {}", header.ff_directory)?;
    writeln!(out, "Cam #  = {}", header.cam_code)?;
    writeln!(out, "Nrows  = {}", header.nrows)?;
    writeln!(out, "Ncols  = {}", header.ncols)?;
    writeln!(out, "Nstars = -1")?;

    for entry in entries {
        writeln!(out, "{}", SECTION_SEPARATOR)?;
        writeln!(out, "{}", entry.ff_name)?;
        writeln!(out, "Star area dim = -1")?;
        writeln!(out, "Integ pixels  = -1")?;
        for s in &entry.stars {
            writeln!(
                out,
                "{:7.2} {:7.2} {:6} {:6}",
                s.y,
                s.x,
                s.bg_level.round() as i64,
                s.intensity.round() as i64
            )?;
        }
    }
    writeln!(out, "{}", END_SEPARATOR)
}

/// Write a CALSTARS file.
pub fn write_calstars(
    path: &Path,
    header: &CalstarsHeader,
    entries: &[CalstarsEntry],
) -> io::Result<()> {
    std::fs::write(path, format_calstars(header, entries))
}

/// Julian Date of a UTC timestamp.
pub fn datetime_to_jd(dt: &NaiveDateTime) -> f64 {
    let ts = dt.and_utc();
    let seconds = ts.timestamp() as f64 + f64::from(ts.timestamp_subsec_micros()) / 1e6;
    JD_UNIX_EPOCH + seconds / 86_400.0
}

/// Julian Date of the middle of the frame block stored in an FF file.
///
/// Expects names like `FF_CA0001_20170905_014231_187_0000000.fits`: the
/// third and fourth fields give the UTC date and time, the fifth the
/// milliseconds. Returns `None` for names that do not follow this layout.
pub fn ff_name_to_jd(ff_name: &str, fps: f64) -> Option<f64> {
    let stem = ff_name.rsplit('/').next()?;
    let fields: Vec<&str> = stem.split('_').collect();
    if fields.len() < 5 || !fields[0].starts_with("FF") {
        return None;
    }
    let start = NaiveDateTime::parse_from_str(
        &format!("{}_{}", fields[2], fields[3]),
        "%Y%m%d_%H%M%S",
    )
    .ok()?;
    let millis: f64 = fields[4].get(..3)?.parse().ok()?;

    let middle_offset_s = millis / 1000.0 + FRAMES_PER_FF / (2.0 * fps);
    Some(datetime_to_jd(&start) + middle_offset_s / 86_400.0)
}

/// Build the exposure pool from CALSTARS entries.
///
/// FF files with fewer than `min_stars` stars or an unparseable name are
/// dropped. The pool is sorted by Julian Date; if two FF files map to the same
/// Julian Date only the first is kept.
pub fn build_exposure_pool(entries: &[CalstarsEntry], fps: f64, min_stars: usize) -> Vec<Exposure> {
    let mut pool: Vec<Exposure> = entries
        .iter()
        .filter(|e| e.stars.len() >= min_stars)
        .filter_map(|e| match ff_name_to_jd(&e.ff_name, fps) {
            Some(jd) => Some(Exposure {
                jd,
                stars: e.stars.clone(),
            }),
            None => {
                tracing::warn!("skipping FF file with unrecognized name: {}", e.ff_name);
                None
            }
        })
        .collect();

    pool.sort_by(|a, b| a.jd.total_cmp(&b.jd));
    let before = pool.len();
    pool.dedup_by(|later, earlier| later.jd == earlier.jd);
    if pool.len() != before {
        tracing::warn!(
            "dropped {} FF files with duplicate timestamps",
            before - pool.len()
        );
    }
    pool
}
