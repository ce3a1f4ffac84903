//! Nightlights CLI
//!
//! Runs the pipeline stages against one working directory:
//! - individual stages (`match`, `reindex`, `partition`, ...)
//! - the whole pipeline in order (`run`)
//! - status, verification, and a default config file

use anyhow::Context;
use clap::{Parser, Subcommand};
use nightlights::pipeline::Pipeline;
use nightlights::storage::{EntityKind, Stage, ValueKind};
use nightlights::{generate_default_config, Config, LoggingConfig};
use std::path::PathBuf;
use std::sync::Mutex;
use tracing_subscriber::fmt::writer::BoxMakeWriter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser)]
#[command(name = "nightlights")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Village and darkspot night-light pipeline")]
#[command(long_about = "Matches villages to nearby darkspots, estimates a per-village background \
from the matched darkspots, subtracts it from the observed luminosity and pivots every \
per-date array into per-village time series.")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Config file (.toml or .json)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Rerun stages even if their completion marker exists
    #[arg(long, global = true)]
    pub force: bool,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Match villages to darkspots within the tolerance box and distance cap
    Match,

    /// Histogram of darkspot minus village coordinate offsets
    MatchStats,

    /// Assign dense ids and build the match graph
    Reindex,

    /// Split a raw table into per-date sparse files
    Partition {
        /// village or darkspot
        kind: EntityKind,
    },

    /// Turn per-date sparse files into dense chunk files
    Densify {
        /// village or darkspot
        kind: EntityKind,
    },

    /// Trimmed darkspot statistics for every village and date
    Background,

    /// Observed minus background
    Subtract,

    /// Pivot per-date chunk files into per-village series
    Pivot {
        /// Value kinds to pivot (vis_observed, background, nvalid, bsd, vis_adjusted); all when empty
        kinds: Vec<ValueKind>,
    },

    /// Run every stage in order
    Run,

    /// Show which stages are done
    Status,

    /// Spot-check stored arrays against their sources
    Verify {
        /// Number of samples per check
        #[arg(short, long, default_value = "100")]
        samples: usize,
    },

    /// Print a default config file
    Config {
        /// Write to this file instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

fn init_logging(logging: &LoggingConfig) -> anyhow::Result<()> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&logging.level));

    let writer = match &logging.file {
        Some(path) => {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("Failed to open log file {}", path))?;
            BoxMakeWriter::new(Mutex::new(file))
        }
        None => BoxMakeWriter::new(std::io::stderr),
    };
    let ansi = logging.file.is_none();

    let (json, pretty) = if logging.format.eq_ignore_ascii_case("json") {
        let layer = tracing_subscriber::fmt::layer()
            .json()
            .with_writer(writer);
        (Some(layer), None)
    } else {
        let layer = tracing_subscriber::fmt::layer()
            .with_ansi(ansi)
            .with_writer(writer);
        (None, Some(layer))
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(json)
        .with(pretty)
        .init();
    Ok(())
}

fn load_config(path: Option<&PathBuf>) -> anyhow::Result<Config> {
    match path {
        Some(path) => Config::load_with_env(path)
            .with_context(|| format!("Failed to load config {}", path.display())),
        None => Ok(Config::load_default()),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    if let Commands::Config { output } = &cli.command {
        let content = generate_default_config();
        match output {
            Some(path) => {
                std::fs::write(path, content)
                    .with_context(|| format!("Failed to write {}", path.display()))?;
                println!("Wrote default config to {}", path.display());
            }
            None => print!("{}", content),
        }
        return Ok(());
    }

    let config = load_config(cli.config.as_ref())?;
    init_logging(&config.logging)?;
    tracing::info!(
        "Nightlights v{} in {}",
        env!("CARGO_PKG_VERSION"),
        config.paths.path.display()
    );

    let pipeline = Pipeline::new(config);
    let force = cli.force;

    match cli.command {
        Commands::Match => {
            pipeline.run_stage(Stage::Match, force).await?;
        }
        Commands::MatchStats => {
            let stats = pipeline.match_stats().await?;
            println!("{} matched pairs", stats.pairs);
            print!("{}", stats.table());
        }
        Commands::Reindex => {
            pipeline.run_stage(Stage::Reindex, force).await?;
        }
        Commands::Partition { kind } => {
            pipeline.run_stage(Stage::Partition(kind), force).await?;
        }
        Commands::Densify { kind } => {
            pipeline.run_stage(Stage::Densify(kind), force).await?;
        }
        Commands::Background => {
            pipeline.run_stage(Stage::Background, force).await?;
        }
        Commands::Subtract => {
            pipeline.run_stage(Stage::Subtract, force).await?;
        }
        Commands::Pivot { kinds } => {
            let kinds = if kinds.is_empty() {
                ValueKind::all().to_vec()
            } else {
                kinds
            };
            for kind in kinds {
                pipeline.run_stage(Stage::Pivot(kind), force).await?;
            }
        }
        Commands::Run => {
            let ran = pipeline.run_all(force).await?;
            println!("{} of {} stages ran", ran, Stage::ordered().len());
        }
        Commands::Status => {
            let ctx = pipeline.context();
            println!("Nightlights v{}", env!("CARGO_PKG_VERSION"));
            println!("Working directory: {}", ctx.config().paths.path.display());
            println!();
            for (stage, done) in ctx.status().report() {
                println!("  {:<28} {}", stage.name(), if done { "done" } else { "-" });
            }
            if let Ok(info) = ctx.load_info() {
                println!();
                println!("Villages: {}", info.n_village);
                println!("Chunks:   {}", info.n_chunk);
            }
        }
        Commands::Verify { samples } => {
            let report = pipeline.verify(samples).await?;
            println!(
                "Verified {} raw rows and {} series values",
                report.raw_checked, report.series_checked
            );
        }
        Commands::Config { .. } => {}
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_stage_commands() {
        let cli = Cli::parse_from(["nightlights", "partition", "darkspot", "--force"]);
        assert!(cli.force);
        assert!(matches!(
            cli.command,
            Commands::Partition {
                kind: EntityKind::Darkspot
            }
        ));

        let cli = Cli::parse_from(["nightlights", "pivot", "vis_adjusted", "bsd"]);
        match cli.command {
            Commands::Pivot { kinds } => {
                assert_eq!(kinds, vec![ValueKind::Adjusted, ValueKind::Bsd])
            }
            _ => panic!("expected pivot"),
        }
    }

    #[test]
    fn test_unknown_kind_rejected() {
        assert!(Cli::try_parse_from(["nightlights", "densify", "towns"]).is_err());
    }

    #[test]
    fn test_global_config_flag() {
        let cli = Cli::parse_from(["nightlights", "status", "--config", "nl.toml"]);
        assert_eq!(cli.config, Some(PathBuf::from("nl.toml")));
        assert!(matches!(cli.command, Commands::Status));
    }
}
