use crate::config::Config;
use crate::db::Repository;
use crate::enrichment::Enricher;
use crate::geocoder::NominatimGeocoder;
use crate::loader::Loader;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "weather-pipeline")]
#[command(about = "Load weather records into SQLite and geocode their stations")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    #[arg(short, long, global = true, default_value = "config/config.yaml")]
    pub config: PathBuf,

    #[arg(long, global = true, help = "SQLite database file [overrides database.path]")]
    pub database: Option<PathBuf>,

    #[arg(short, long, global = true, help = "Hide progress bars")]
    pub quiet: bool,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Load a weather-records CSV into the database
    Load {
        #[arg(long, help = "Input CSV [overrides loader.csv_path]")]
        csv: Option<PathBuf>,
    },

    /// Geocode the stations of one state that still lack coordinates
    Geocode {
        #[arg(short, long, help = "Two-letter state code [overrides geocoder.state]")]
        state: Option<String>,
    },

    /// Load the CSV, then geocode one state
    Run {
        #[arg(long, help = "Input CSV [overrides loader.csv_path]")]
        csv: Option<PathBuf>,

        #[arg(short, long, help = "Two-letter state code [overrides geocoder.state]")]
        state: Option<String>,
    },

    /// Report table counts, referential integrity and geocoding coverage
    Validate,
}

impl Cli {
    /// Load the configuration file and apply command-line overrides
    pub fn resolve_config(&self) -> crate::error::Result<Config> {
        let mut config = Config::load(&self.config)?;

        if let Some(database) = &self.database {
            config.database.path = database.clone();
        }

        match &self.command {
            Commands::Load { csv } => {
                if let Some(csv) = csv {
                    config.loader.csv_path = csv.clone();
                }
            }
            Commands::Geocode { state } => {
                if let Some(state) = state {
                    config.geocoder.state = state.to_uppercase();
                }
            }
            Commands::Run { csv, state } => {
                if let Some(csv) = csv {
                    config.loader.csv_path = csv.clone();
                }
                if let Some(state) = state {
                    config.geocoder.state = state.to_uppercase();
                }
            }
            Commands::Validate => {}
        }

        config.validate()?;
        Ok(config)
    }
}

pub async fn run(cli: Cli) -> anyhow::Result<()> {
    let config = cli.resolve_config().map_err(|e| {
        anyhow::anyhow!(
            "Failed to load configuration: {}\n\n\
             Make sure:\n\
             1. {} exists (or pass --config)\n\
             2. All referenced environment variables are set (check .env.example)",
            e,
            cli.config.display()
        )
    })?;
    info!("Configuration loaded from {}", cli.config.display());

    // The input file must exist before the database is even opened
    if matches!(cli.command, Commands::Load { .. } | Commands::Run { .. }) {
        if !config.loader.csv_path.is_file() {
            anyhow::bail!(
                "Input CSV not found: {}",
                config.loader.csv_path.display()
            );
        }
    }

    let repository = Repository::connect(&config.database).await.map_err(|e| {
        anyhow::anyhow!(
            "Failed to open database {}: {}\n\n\
             Common fixes:\n\
             1. Check the parent directory exists and is writable\n\
             2. Set database.create_if_missing: true to create a new file",
            config.database.path.display(),
            e
        )
    })?;
    info!("Connected to database: {}", config.database.path.display());

    let repository = Arc::new(repository);
    repository.run_migrations().await?;

    let show_progress = !cli.quiet;

    match &cli.command {
        Commands::Load { .. } => {
            load(&config, repository, show_progress).await?;
        }
        Commands::Geocode { .. } => {
            geocode(&config, repository, show_progress).await?;
        }
        Commands::Run { .. } => {
            load(&config, Arc::clone(&repository), show_progress).await?;
            geocode(&config, repository, show_progress).await?;
        }
        Commands::Validate => {
            validate(&repository).await?;
        }
    }

    Ok(())
}

async fn load(config: &Config, repository: Arc<Repository>, show_progress: bool) -> anyhow::Result<()> {
    let loader = Loader::new(repository, config.loader.clone()).with_progress(show_progress);
    let summary = loader.load(&config.loader.csv_path).await?;

    println!(
        "Rows loaded: {}, rows skipped: {}, fields set to NULL: {}",
        summary.rows_loaded, summary.rows_skipped, summary.fields_nulled
    );
    Ok(())
}

async fn geocode(config: &Config, repository: Arc<Repository>, show_progress: bool) -> anyhow::Result<()> {
    let geocoder = NominatimGeocoder::new(&config.geocoder)?;
    let enricher = Enricher::new(repository, geocoder).with_progress(show_progress);
    let summary = enricher.run(&config.geocoder.state).await?;

    for failure in &summary.failures {
        warn!(
            "Station {} not geocoded ('{}'): {}",
            failure.station_code, failure.query, failure.reason
        );
    }

    println!(
        "Stations geocoded: {}, stations failed: {} (of {} candidates in {})",
        summary.geocoded,
        summary.not_found + summary.failed,
        summary.candidates,
        summary.state_code
    );

    if let Some(e) = summary.rate_limited {
        println!("Stations not attempted: {}", summary.not_attempted);
        anyhow::bail!(
            "Geocoding stopped early: {}. Re-run later to continue with the remaining stations",
            e
        );
    }
    Ok(())
}

async fn validate(repository: &Repository) -> anyhow::Result<()> {
    let report = repository.integrity_report().await?;

    println!(
        "states: {}, stations: {}, weather_records: {}",
        report.counts.states, report.counts.stations, report.counts.weather_records
    );
    println!("stations without state: {}", report.stations_without_state);
    println!("records without station: {}", report.records_without_station);
    println!("records with mismatched state: {}", report.records_with_state_mismatch);
    println!(
        "stations with partial coordinates: {}",
        report.stations_with_partial_coordinates
    );

    for status in &report.geocoding {
        let percent = if status.total_stations > 0 {
            status.geocoded_stations as f64 / status.total_stations as f64 * 100.0
        } else {
            0.0
        };
        println!(
            "{} ({}): {}/{} stations geocoded ({:.1}%)",
            status.name, status.code, status.geocoded_stations, status.total_stations, percent
        );
    }

    if !report.is_consistent() {
        anyhow::bail!("Database failed integrity checks");
    }

    info!("Database passed integrity checks");
    Ok(())
}
