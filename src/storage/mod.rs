//! Nightlights Storage Format
//!
//! This module provides the on-disk format shared by every pipeline stage:
//!
//! - **types**: Entity kinds, value kinds, chunk layout
//! - **codec**: Gzip float64 arrays and typed id/value records
//! - **chunks**: Dense per-date arrays split into id-range chunk files
//! - **dates**: Date keys and `<year>/<month>/<day>` directories
//! - **ids**: Dense id tables (key → id, first-seen order)
//! - **match_graph**: Village → darkspot adjacency with a hard size bound
//! - **info**: Dataset summary (`info.json`)
//! - **series**: Pivoted time-series files
//! - **status**: Stage completion markers
//! - **error**: Error types
//!
//! # Layout
//!
//! ```text
//! <path>/villages.csv.gz, darkspots.csv.gz, matches.bin.gz, info.json
//! <path>/<base>/<year>/<month>/<day>/idvis.gz           sparse (id, value)
//! <path>/<base>/<year>/<month>/<day>/<kind>_<NN>.gz     dense chunk, NaN = missing
//! <path>/<ts_dir>/<kind>/<kind>_<NN>.gz, dates.txt.gz   pivoted series
//! <path>/<stage>_done                                  completion markers
//! ```

pub mod chunks;
pub mod codec;
pub mod dates;
pub mod error;
pub mod ids;
pub mod info;
pub mod match_graph;
pub mod series;
pub mod status;
pub mod types;

// Re-export commonly used types
pub use chunks::{read_chunk, read_dense, write_chunks};
pub use codec::{
    append_id_values, read_f64_array, read_f64_sub_array, read_id_values, read_lines,
    write_f64_array, write_lines, F64Reader, IdValue,
};
pub use dates::{discover_date_dirs, DateDir, DateKey};
pub use error::{StorageError, StorageResult};
pub use ids::{EntityId, IdTable};
pub use info::DatasetInfo;
pub use match_graph::MatchGraph;
pub use series::{series_dir, TimeSeriesReader, DATES_FILE};
pub use status::{PipelineStatus, Stage};
pub use types::{ChunkLayout, EntityKind, ValueKind};
