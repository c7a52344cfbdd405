//! Generate a synthetic night and refine a perturbed platepar against it.
//!
//! Usage:
//!   cargo run --release --example synthetic_night -- [options]
//!
//! Options:
//!   --out <dir>          Also write platepar.toml, catalog.csv and CALSTARS.txt
//!                        there, ready for the `platefit` example
//!   --exposures <n>      Number of FF files (default: 60)
//!   --seed <n>           Random seed (default: 1)
//!   --noise <px>         Centroid noise in pixels (default: 0.2)
//!
//! Example:
//!   cargo run --release --example synthetic_night -- --out /tmp/night --exposures 120

use std::path::PathBuf;
use std::time::Instant;

use chrono::{Duration, NaiveDate};
use clap::Parser;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use platefit::calstars::{
    build_exposure_pool, ff_name_to_jd, write_calstars, CalstarsEntry, CalstarsHeader,
    DetectedStar,
};
use platefit::catalog::{CatalogStar, StarCatalog};
use platefit::config::FitConfig;
use platefit::platepar::Platepar;
use platefit::projection::{radec_to_vector, GnomonicProjection, Projection, POLY_TERMS};
use platefit::refine::AutoFit;

type CliError = Box<dyn std::error::Error>;
type CliResult<T> = Result<T, CliError>;

/// Seconds between consecutive FF files.
const FF_SPACING_S: f64 = 10.24;

#[derive(Parser)]
#[command(name = "synthetic_night")]
#[command(about = "Simulate a night of star detections and refine a perturbed platepar")]
struct Cli {
    /// Write the simulated night to this directory.
    #[arg(long)]
    out: Option<PathBuf>,

    /// Number of FF files.
    #[arg(long, default_value_t = 60)]
    exposures: usize,

    /// Random seed.
    #[arg(long, default_value_t = 1)]
    seed: u64,

    /// Centroid noise in pixels.
    #[arg(long, default_value_t = 0.2)]
    noise: f64,
}

fn main() -> CliResult<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let mut rng = StdRng::seed_from_u64(cli.seed);
    let projection = GnomonicProjection;

    // FF file names and their timestamps
    let start = NaiveDate::from_ymd_opt(2017, 9, 5)
        .and_then(|d| d.and_hms_opt(1, 42, 31))
        .ok_or("invalid start time")?;
    let fps = 25.0;
    let mut names = Vec::with_capacity(cli.exposures);
    for k in 0..cli.exposures {
        let t = start + Duration::milliseconds((k as f64 * FF_SPACING_S * 1000.0) as i64);
        names.push(format!(
            "FF_XX0001_{}_{:03}_{:07}.fits",
            t.format("%Y%m%d_%H%M%S"),
            t.and_utc().timestamp_subsec_millis(),
            k * 256
        ));
    }
    let jds: Vec<f64> = names
        .iter()
        .map(|n| ff_name_to_jd(n, fps).ok_or("generated an unparseable FF name"))
        .collect::<Result<_, _>>()?;

    let mut truth = Platepar::new(312.0, 45.0, 12.0, 7.5, 1280, 720, jds[0], POLY_TERMS);
    truth.x_poly[0] = 0.4;
    truth.x_poly[1] = -0.8;
    truth.y_poly[0] = -0.3;
    truth.y_poly[2] = 0.6;

    let catalog = simulate_catalog(&truth, &jds, &mut rng);
    eprintln!("Simulated {} catalog stars", catalog.stars().len());

    // Detections: every visible catalog star plus centroid noise
    let ra: Vec<f64> = catalog.stars().iter().map(|s| s.ra).collect();
    let dec: Vec<f64> = catalog.stars().iter().map(|s| s.dec).collect();
    let width = truth.x_res as f64;
    let height = truth.y_res as f64;
    let entries: Vec<CalstarsEntry> = names
        .iter()
        .zip(jds.iter())
        .map(|(name, &jd)| {
            let (x, y) = projection.forward(&truth, jd, &ra, &dec);
            let stars = x
                .iter()
                .zip(y.iter())
                .zip(catalog.stars())
                .filter(|&((&x, &y), _)| x > 1.0 && x < width - 1.0 && y > 1.0 && y < height - 1.0)
                .map(|((&x, &y), s)| DetectedStar {
                    y: y + rng.gen_range(-cli.noise..=cli.noise),
                    x: x + rng.gen_range(-cli.noise..=cli.noise),
                    bg_level: 20.0,
                    intensity: 10f64.powf((8.0 - s.mag) / 2.5).round(),
                })
                .collect();
            CalstarsEntry {
                ff_name: name.clone(),
                stars,
            }
        })
        .collect();

    let mut start_pp = truth.clone();
    start_pp.ra_d += 0.12;
    start_pp.dec_d -= 0.07;
    start_pp.pos_angle_ref += 0.15;
    start_pp.f_scale *= 1.008;
    start_pp.x_poly = vec![0.0; POLY_TERMS];
    start_pp.y_poly = vec![0.0; POLY_TERMS];

    let config = FitConfig {
        min_exposures: (cli.exposures / 2).max(1),
        sample_size: cli.exposures.min(100),
        min_total_stars: 100,
        seed: Some(cli.seed),
        ..FitConfig::default()
    };

    if let Some(dir) = &cli.out {
        std::fs::create_dir_all(dir)?;
        let header = CalstarsHeader {
            ff_directory: dir.display().to_string(),
            cam_code: "XX0001".to_string(),
            nrows: truth.y_res,
            ncols: truth.x_res,
        };
        write_calstars(&dir.join("CALSTARS.txt"), &header, &entries)?;
        catalog.save_csv(&dir.join("catalog.csv"))?;
        start_pp.save(&dir.join(&config.station.platepar_name))?;
        truth.save(&dir.join("platepar_truth.toml"))?;
        eprintln!("Wrote night to {}", dir.display());
    }

    let pool = build_exposure_pool(&entries, fps, config.ff_min_stars);
    let t0 = Instant::now();
    let outcome = AutoFit::new(&projection, &catalog, &config).run_seeded(&start_pp, &pool);

    println!("{}", if outcome.success { "REFINEMENT OK" } else { "REFINEMENT FAILED" });
    if let Some(err) = &outcome.failure {
        println!("  Reason:   {}", err);
    }
    let pp = &outcome.platepar;
    println!("             truth      start      refined");
    println!("  RA     {:10.4} {:10.4} {:10.4}", truth.ra_d, start_pp.ra_d, pp.ra_d);
    println!("  Dec    {:10.4} {:10.4} {:10.4}", truth.dec_d, start_pp.dec_d, pp.dec_d);
    println!(
        "  PA     {:10.4} {:10.4} {:10.4}",
        truth.pos_angle_ref, start_pp.pos_angle_ref, pp.pos_angle_ref
    );
    println!(
        "  Scale  {:10.5} {:10.5} {:10.5}",
        truth.f_scale, start_pp.f_scale, pp.f_scale
    );
    if let (Some(initial), Some(last)) = (outcome.initial_stats, outcome.final_stats) {
        println!(
            "  Mean residual {:.3} px -> {:.3} px ({} -> {} stars)",
            initial.mean_distance, last.mean_distance, initial.n_matched, last.n_matched
        );
    }
    println!("  Time:  {:.1} s", t0.elapsed().as_secs_f64());

    if !outcome.success {
        std::process::exit(2);
    }
    Ok(())
}

/// Random bright stars covering the sky swept by the field during the night,
/// kept at least 2° apart.
fn simulate_catalog(truth: &Platepar, jds: &[f64], rng: &mut StdRng) -> StarCatalog {
    let projection = GnomonicProjection;
    let center_x = [truth.x_res as f64 / 2.0];
    let center_y = [truth.y_res as f64 / 2.0];
    let first = projection.inverse(truth, jds[0], &center_x, &center_y);
    let last = projection.inverse(truth, jds[jds.len() - 1], &center_x, &center_y);
    let a = radec_to_vector(first.0[0], first.1[0]);
    let b = radec_to_vector(last.0[0], last.1[0]);
    let mid = (a + b).normalize();
    let cap_cos = (truth.field_radius_deg() * 1.1 + a.angle(&b).to_degrees() / 2.0)
        .min(90.0)
        .to_radians()
        .cos();
    let min_sep_cos = 2.0f64.to_radians().cos();

    let mut stars: Vec<CatalogStar> = Vec::new();
    for _ in 0..500_000 {
        if stars.len() >= 600 {
            break;
        }
        let ra = rng.gen_range(0.0..360.0);
        let dec = rng.gen_range(-1.0f64..1.0).asin().to_degrees();
        let v = radec_to_vector(ra, dec);
        if v.dot(&mid) < cap_cos {
            continue;
        }
        if stars
            .iter()
            .any(|s| radec_to_vector(s.ra, s.dec).dot(&v) > min_sep_cos)
        {
            continue;
        }
        stars.push(CatalogStar {
            ra,
            dec,
            mag: rng.gen_range(-1.0..4.5),
        });
    }
    StarCatalog::new(stars)
}
