//! geobroker CLI entry point.
//!
//! Runs one geometry query through a [`RegionBroker`] and prints the result
//! as JSON on stdout. Logs go to stderr.

use std::path::PathBuf;

use anyhow::{Context, bail};
use clap::{Parser, Subcommand, ValueEnum};
use serde_json::Value;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use geobroker_broker::RegionBroker;
use geobroker_common::{ConfigFile, LogFormat};
use geobroker_core::{DistanceUnit, FeatureCollection, Geometry, LatLng};

#[derive(Debug, Parser)]
#[command(name = "geobroker", version, about = "Point-in-region lookups against GeoJSON boundaries")]
struct Cli {
    /// TOML configuration file.
    #[arg(long, env = "GEOBROKER_CONFIG")]
    config: Option<PathBuf>,

    /// Run every query inline instead of on the execution context.
    #[arg(long)]
    no_context: bool,

    /// Override the configured log format.
    #[arg(long, value_enum)]
    log_format: Option<LogFormatArg>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Find the region containing a point.
    #[command(allow_negative_numbers = true)]
    Identify {
        #[arg(long)]
        lat: f64,
        #[arg(long)]
        lng: f64,
        /// Name of a dataset from the configuration file.
        #[arg(long, conflicts_with = "geojson")]
        dataset: Option<String>,
        /// GeoJSON FeatureCollection file to scan.
        #[arg(long)]
        geojson: Option<PathBuf>,
    },
    /// Great-circle distance between two points.
    #[command(allow_negative_numbers = true)]
    Distance {
        #[arg(long)]
        from_lat: f64,
        #[arg(long)]
        from_lng: f64,
        #[arg(long)]
        to_lat: f64,
        #[arg(long)]
        to_lng: f64,
        #[arg(long, value_enum, default_value_t = UnitArg::Kilometers)]
        unit: UnitArg,
    },
    /// Bounding box of a GeoJSON geometry.
    Bbox {
        /// GeoJSON geometry object.
        #[arg(long)]
        geometry: String,
    },
    /// Centroid of a GeoJSON geometry.
    Centroid {
        /// GeoJSON geometry object.
        #[arg(long)]
        geometry: String,
    },
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum LogFormatArg {
    Pretty,
    Json,
}

impl From<LogFormatArg> for LogFormat {
    fn from(arg: LogFormatArg) -> Self {
        match arg {
            LogFormatArg::Pretty => Self::Pretty,
            LogFormatArg::Json => Self::Json,
        }
    }
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum UnitArg {
    Kilometers,
    Meters,
    Miles,
    NauticalMiles,
}

impl From<UnitArg> for DistanceUnit {
    fn from(arg: UnitArg) -> Self {
        match arg {
            UnitArg::Kilometers => Self::Kilometers,
            UnitArg::Meters => Self::Meters,
            UnitArg::Miles => Self::Miles,
            UnitArg::NauticalMiles => Self::NauticalMiles,
        }
    }
}

fn init_tracing(format: LogFormat) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "warn,geobroker=info".into());

    match format {
        LogFormat::Pretty => tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init(),
        LogFormat::Json => tracing_subscriber::registry()
            .with(filter)
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_writer(std::io::stderr),
            )
            .init(),
    }
}

fn parse_geometry(raw: &str) -> anyhow::Result<Geometry> {
    serde_json::from_str(raw).context("Invalid GeoJSON geometry")
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => ConfigFile::from_file(path)
            .with_context(|| format!("Failed to load configuration from {}", path.display()))?,
        None => ConfigFile::default(),
    };

    init_tracing(cli.log_format.map_or(config.logging.format, Into::into));

    if cli.no_context {
        config.broker.context.enabled = false;
    }

    let broker = RegionBroker::new(config.broker.clone());
    info!(broker_id = %broker.id(), mode = ?broker.mode(), "Broker ready");

    for entry in &config.datasets {
        let collection = FeatureCollection::from_file(&entry.path)
            .with_context(|| format!("Failed to read dataset '{}'", entry.name))?;
        let count = broker
            .load_index(entry.name.clone(), collection.features)
            .await
            .with_context(|| format!("Failed to load dataset '{}'", entry.name))?;
        info!(name = %entry.name, count, "Dataset loaded");
    }

    let output: Value = match cli.command {
        Command::Identify {
            lat,
            lng,
            dataset,
            geojson,
        } => {
            let point = LatLng::new(lat, lng);
            let found = match (dataset, geojson) {
                (Some(name), _) => {
                    if config.dataset(&name).is_none() {
                        warn!(name = %name, "Dataset is not declared in the configuration");
                    }
                    broker.identify_in_index(point, &name).await?
                }
                (None, Some(path)) => {
                    let collection = FeatureCollection::from_file(&path)
                        .with_context(|| format!("Failed to read {}", path.display()))?;
                    broker.identify_region(point, collection.features).await?
                }
                (None, None) => bail!("identify needs --dataset or --geojson"),
            };
            serde_json::to_value(found)?
        }
        Command::Distance {
            from_lat,
            from_lng,
            to_lat,
            to_lng,
            unit,
        } => {
            let distance = broker
                .distance(
                    LatLng::new(from_lat, from_lng),
                    LatLng::new(to_lat, to_lng),
                    unit.into(),
                )
                .await?;
            serde_json::json!({ "distance": distance, "unit": DistanceUnit::from(unit) })
        }
        Command::Bbox { geometry } => {
            serde_json::to_value(broker.bbox(parse_geometry(&geometry)?).await?)?
        }
        Command::Centroid { geometry } => {
            serde_json::to_value(broker.centroid(parse_geometry(&geometry)?).await?)?
        }
    };

    println!("{}", serde_json::to_string_pretty(&output)?);

    broker.shutdown();
    Ok(())
}
