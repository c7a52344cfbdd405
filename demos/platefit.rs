//! Refine a night's platepar from its CALSTARS file.
//!
//! Usage:
//!   cargo run --release --example platefit -- <night_dir> [options]
//!
//! Options:
//!   --config <path>    TOML refinement config (defaults otherwise)
//!   --catalog <path>   Star catalog CSV (overrides the config)
//!   --seed <n>         Seed for exposure sampling
//!   --dry-run          Report the result without writing the platepar
//!
//! On success the previous platepar is kept as `<name>.old` next to the new
//! one. On failure nothing is written and the process exits with status 2.
//!
//! Example:
//!   cargo run --release --example platefit -- data/CA0001_20170905_012345 --seed 42

use std::path::{Path, PathBuf};
use std::time::Instant;

use clap::Parser;

use platefit::calstars::{build_exposure_pool, read_calstars};
use platefit::catalog::{CatalogSubset, StarCatalog};
use platefit::config::FitConfig;
use platefit::platepar::Platepar;
use platefit::projection::GnomonicProjection;
use platefit::refine::AutoFit;

type CliError = Box<dyn std::error::Error>;
type CliResult<T> = Result<T, CliError>;

#[derive(Parser)]
#[command(name = "platefit")]
#[command(about = "Refine a meteor camera calibration using all stars of one night")]
struct Cli {
    /// Night directory holding the platepar and CALSTARS file.
    night_dir: PathBuf,

    /// TOML refinement config.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Star catalog CSV (`ra,dec,mag`).
    #[arg(long)]
    catalog: Option<PathBuf>,

    /// Seed for exposure sampling.
    #[arg(long)]
    seed: Option<u64>,

    /// Do not write the refined platepar.
    #[arg(long)]
    dry_run: bool,
}

fn main() -> CliResult<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => FitConfig::from_toml_file(path)?,
        None => FitConfig::default(),
    };
    if let Some(seed) = cli.seed {
        config.seed = Some(seed);
    }
    if let Some(catalog) = &cli.catalog {
        config.station.catalog_path = catalog.clone();
    }

    let platepar_path = cli.night_dir.join(&config.station.platepar_name);
    tracing::info!("Loading platepar: {}", platepar_path.display());
    let platepar = Platepar::from_toml_file(&platepar_path).map_err(|e| -> CliError {
        format!("Failed to load platepar {}: {}", platepar_path.display(), e).into()
    })?;

    let calstars_path = find_calstars(&cli.night_dir)?;
    tracing::info!("Loading detected stars: {}", calstars_path.display());
    let (header, entries) = read_calstars(&calstars_path)?;
    if header.ncols != platepar.x_res || header.nrows != platepar.y_res {
        tracing::warn!(
            "CALSTARS frame {}x{} does not match platepar {}x{}",
            header.ncols,
            header.nrows,
            platepar.x_res,
            platepar.y_res
        );
    }
    let pool = build_exposure_pool(&entries, config.station.fps, config.ff_min_stars);
    tracing::info!(
        "{} of {} FF files have at least {} stars",
        pool.len(),
        entries.len(),
        config.ff_min_stars
    );

    let catalog_path = &config.station.catalog_path;
    tracing::info!("Loading catalog: {}", catalog_path.display());
    let catalog = StarCatalog::load_csv(catalog_path, Some(config.catalog_mag_limit))
        .map_err(|e| -> CliError {
            format!("Failed to load catalog {}: {}", catalog_path.display(), e).into()
        })?;
    tracing::info!(
        "{} catalog stars brighter than magnitude {}",
        catalog.num_stars(),
        config.catalog_mag_limit
    );

    let t0 = Instant::now();
    let outcome = AutoFit::new(&GnomonicProjection, &catalog, &config).run_seeded(&platepar, &pool);
    let elapsed_s = t0.elapsed().as_secs_f64();

    if !outcome.success {
        println!("REFINEMENT FAILED");
        if let Some(err) = &outcome.failure {
            println!("  Reason:   {}", err);
        }
        println!("  Platepar left untouched: {}", platepar_path.display());
        std::process::exit(2);
    }

    let pp = &outcome.platepar;
    println!("REFINEMENT OK");
    println!("  RA:       {:.4} deg  (was {:.4})", pp.ra_d, platepar.ra_d);
    println!("  Dec:      {:.4} deg  (was {:.4})", pp.dec_d, platepar.dec_d);
    println!("  PA:       {:.4} deg  (was {:.4})", pp.pos_angle_ref, platepar.pos_angle_ref);
    println!("  Scale:    {:.5} px/deg  (was {:.5})", pp.f_scale, platepar.f_scale);
    println!("  Sampled:  {} exposures", outcome.n_sampled);
    for stage in &outcome.stages {
        println!(
            "  r={:<5.2} {:>5} -> {:>5} stars, mean {:.3} -> {:.3} px",
            stage.radius,
            stage.before.n_matched,
            stage.after.n_matched,
            stage.before.mean_distance,
            stage.after.mean_distance
        );
    }
    println!("  Time:     {:.1} s", elapsed_s);

    if cli.dry_run {
        println!("  Dry run, platepar not written");
        return Ok(());
    }

    let backup = pp.save_with_backup(&platepar_path)?;
    println!("  Saved:    {} (previous in {})", platepar_path.display(), backup.display());
    Ok(())
}

/// First `CALSTARS*.txt` file in `dir`, by name.
fn find_calstars(dir: &Path) -> CliResult<PathBuf> {
    let mut candidates: Vec<PathBuf> = std::fs::read_dir(dir)?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|p| {
            p.file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.starts_with("CALSTARS") && n.ends_with(".txt"))
        })
        .collect();
    candidates.sort();
    candidates
        .into_iter()
        .next()
        .ok_or_else(|| format!("no CALSTARS*.txt file in {}", dir.display()).into())
}
