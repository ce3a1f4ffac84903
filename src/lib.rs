//! # Nightlights
//!
//! Batch pipeline that correlates satellite night-light luminosity of
//! villages with that of nearby unlit "darkspots", subtracts the darkspot
//! background from each village observation and pivots the result into
//! per-village time series.
//!
//! ## Modules
//!
//! - [`config`]: Working directory, column indices, tolerances, worker counts
//! - [`storage`]: On-disk formats shared by all stages
//! - [`pipeline`]: The stages and the runner that sequences them
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use nightlights::{Config, Pipeline};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let mut config = Config::default();
//!     config.paths.path = "/data/nightlights".into();
//!
//!     let pipeline = Pipeline::new(config);
//!     let ran = pipeline.run_all(false).await?;
//!     println!("{} stages ran", ran);
//!
//!     let report = pipeline.verify(100).await?;
//!     println!("{:?}", report);
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod pipeline;
pub mod storage;

pub use config::{generate_default_config, Config, ConfigError, LoggingConfig};

pub use pipeline::{Pipeline, PipelineError, PipelineResult, RunContext};

pub use storage::{
    ChunkLayout, DatasetInfo, DateKey, EntityKind, IdTable, MatchGraph, PipelineStatus, Stage,
    StorageError, StorageResult, TimeSeriesReader, ValueKind,
};
