//! Configuration System
//!
//! Handles loading configuration from files and environment variables.
//! Supports TOML and JSON config files and environment variable overrides.

use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Main configuration structure
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub paths: PathsConfig,

    #[serde(default)]
    pub columns: ColumnsConfig,

    #[serde(default)]
    pub layout: LayoutConfig,

    #[serde(default)]
    pub matching: MatchingConfig,

    #[serde(default)]
    pub background: BackgroundConfig,

    #[serde(default)]
    pub workers: WorkersConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

/// File and directory names, relative to `path` unless absolute
#[derive(Debug, Clone, Deserialize)]
pub struct PathsConfig {
    /// Working directory holding every input and output
    #[serde(default = "default_path")]
    pub path: PathBuf,

    /// Raw darkspot observations (date, vis, lat, lon columns)
    #[serde(default = "default_darkspot_raw_file")]
    pub darkspot_raw_file: String,

    /// Raw village observations (id, date, vis columns)
    #[serde(default = "default_village_raw_file")]
    pub village_raw_file: String,

    /// Darkspot coordinates used for matching
    #[serde(default = "default_darkspot_coords_file")]
    pub darkspot_coords_file: String,

    /// Village identifiers and coordinates used for matching
    #[serde(default = "default_village_info_file")]
    pub village_info_file: String,

    #[serde(default = "default_match_raw_file")]
    pub match_raw_file: String,

    #[serde(default = "default_match_file")]
    pub match_file: String,

    #[serde(default = "default_village_index_file")]
    pub village_index_file: String,

    #[serde(default = "default_darkspot_index_file")]
    pub darkspot_index_file: String,

    #[serde(default = "default_info_file")]
    pub info_file: String,

    #[serde(default = "default_village_base_dir")]
    pub village_base_dir: String,

    #[serde(default = "default_darkspot_base_dir")]
    pub darkspot_base_dir: String,

    /// Directory for pivoted time series
    #[serde(default = "default_ts_dir")]
    pub ts_dir: String,
}

fn default_path() -> PathBuf {
    PathBuf::from(".")
}

fn default_darkspot_raw_file() -> String {
    "darkspots_raw.csv.gz".to_string()
}

fn default_village_raw_file() -> String {
    "villages_raw.csv.gz".to_string()
}

fn default_darkspot_coords_file() -> String {
    "darkspot_latlon.csv.gz".to_string()
}

fn default_village_info_file() -> String {
    "village_info.csv.gz".to_string()
}

fn default_match_raw_file() -> String {
    "match_raw.txt.gz".to_string()
}

fn default_match_file() -> String {
    "matches.bin.gz".to_string()
}

fn default_village_index_file() -> String {
    "villages.csv.gz".to_string()
}

fn default_darkspot_index_file() -> String {
    "darkspots.csv.gz".to_string()
}

fn default_info_file() -> String {
    "info.json".to_string()
}

fn default_village_base_dir() -> String {
    "villages".to_string()
}

fn default_darkspot_base_dir() -> String {
    "darkspots".to_string()
}

fn default_ts_dir() -> String {
    "timeseries".to_string()
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            path: default_path(),
            darkspot_raw_file: default_darkspot_raw_file(),
            village_raw_file: default_village_raw_file(),
            darkspot_coords_file: default_darkspot_coords_file(),
            village_info_file: default_village_info_file(),
            match_raw_file: default_match_raw_file(),
            match_file: default_match_file(),
            village_index_file: default_village_index_file(),
            darkspot_index_file: default_darkspot_index_file(),
            info_file: default_info_file(),
            village_base_dir: default_village_base_dir(),
            darkspot_base_dir: default_darkspot_base_dir(),
            ts_dir: default_ts_dir(),
        }
    }
}

impl PathsConfig {
    /// Resolve a configured name against the working directory
    pub fn resolve(&self, name: &str) -> PathBuf {
        self.path.join(name)
    }
}

/// Column indices (0-based) of the raw CSV tables
#[derive(Debug, Clone, Deserialize)]
pub struct ColumnsConfig {
    #[serde(default)]
    pub darkspot_date: usize,
    #[serde(default = "default_darkspot_vis")]
    pub darkspot_vis: usize,
    #[serde(default = "default_darkspot_lat")]
    pub darkspot_lat: usize,
    #[serde(default = "default_darkspot_lon")]
    pub darkspot_lon: usize,

    #[serde(default)]
    pub village_id: usize,
    #[serde(default = "default_village_date")]
    pub village_date: usize,
    #[serde(default = "default_village_vis")]
    pub village_vis: usize,

    #[serde(default)]
    pub coords_lat: usize,
    #[serde(default = "default_coords_lon")]
    pub coords_lon: usize,

    #[serde(default = "default_info_id")]
    pub info_id: usize,
    #[serde(default = "default_info_lat")]
    pub info_lat: usize,
    #[serde(default = "default_info_lon")]
    pub info_lon: usize,

    /// Whether the raw observation files start with a header row
    #[serde(default)]
    pub raw_has_header: bool,

    /// Whether the coordinate files start with a header row
    #[serde(default)]
    pub coords_has_header: bool,
}

fn default_darkspot_vis() -> usize {
    3
}

fn default_darkspot_lat() -> usize {
    1
}

fn default_darkspot_lon() -> usize {
    2
}

fn default_village_date() -> usize {
    1
}

fn default_village_vis() -> usize {
    2
}

fn default_coords_lon() -> usize {
    1
}

fn default_info_id() -> usize {
    3
}

fn default_info_lat() -> usize {
    4
}

fn default_info_lon() -> usize {
    5
}

impl Default for ColumnsConfig {
    fn default() -> Self {
        Self {
            darkspot_date: 0,
            darkspot_vis: default_darkspot_vis(),
            darkspot_lat: default_darkspot_lat(),
            darkspot_lon: default_darkspot_lon(),
            village_id: 0,
            village_date: default_village_date(),
            village_vis: default_village_vis(),
            coords_lat: 0,
            coords_lon: default_coords_lon(),
            info_id: default_info_id(),
            info_lat: default_info_lat(),
            info_lon: default_info_lon(),
            raw_has_header: false,
            coords_has_header: false,
        }
    }
}

/// Chunking and buffering of the columnar format
#[derive(Debug, Clone, Deserialize)]
pub struct LayoutConfig {
    /// Number of entities per chunk file
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,

    /// Per-date buffer size (bytes) that triggers a flush while partitioning
    #[serde(default = "default_flush_bytes")]
    pub flush_bytes: usize,
}

fn default_chunk_size() -> usize {
    20_000
}

fn default_flush_bytes() -> usize {
    800_000
}

impl Default for LayoutConfig {
    fn default() -> Self {
        Self {
            chunk_size: default_chunk_size(),
            flush_bytes: default_flush_bytes(),
        }
    }
}

/// Spatial matching tolerances
#[derive(Debug, Clone, Deserialize)]
pub struct MatchingConfig {
    /// Half-height of the search box (degrees latitude)
    #[serde(default = "default_lat_tol")]
    pub lat_tol: f64,

    /// Half-width of the search box (degrees longitude)
    #[serde(default = "default_lon_tol")]
    pub lon_tol: f64,

    /// Great-circle distance cap in metres
    #[serde(default = "default_max_distance_m")]
    pub max_distance_m: f64,

    /// Maximum number of darkspots matched to one village
    #[serde(default = "default_max_match")]
    pub max_match: usize,
}

fn default_lat_tol() -> f64 {
    0.1
}

fn default_lon_tol() -> f64 {
    0.1
}

fn default_max_distance_m() -> f64 {
    10_000.0
}

fn default_max_match() -> usize {
    1_000
}

impl Default for MatchingConfig {
    fn default() -> Self {
        Self {
            lat_tol: default_lat_tol(),
            lon_tol: default_lon_tol(),
            max_distance_m: default_max_distance_m(),
            max_match: default_max_match(),
        }
    }
}

/// Trimmed statistics cutpoints
#[derive(Debug, Clone, Deserialize)]
pub struct BackgroundConfig {
    /// Lower quantile, e.g. 0.25
    #[serde(default = "default_lower")]
    pub lower: f64,

    /// Upper quantile, e.g. 0.75
    #[serde(default = "default_upper")]
    pub upper: f64,
}

fn default_lower() -> f64 {
    0.25
}

fn default_upper() -> f64 {
    0.75
}

impl Default for BackgroundConfig {
    fn default() -> Self {
        Self {
            lower: default_lower(),
            upper: default_upper(),
        }
    }
}

/// Concurrent workers per stage
#[derive(Debug, Clone, Deserialize)]
pub struct WorkersConfig {
    #[serde(default = "default_densify_workers")]
    pub densify: usize,
    #[serde(default = "default_background_workers")]
    pub background: usize,
    #[serde(default = "default_subtract_workers")]
    pub subtract: usize,
    #[serde(default = "default_pivot_workers")]
    pub pivot: usize,
}

fn default_densify_workers() -> usize {
    10
}

fn default_background_workers() -> usize {
    40
}

fn default_subtract_workers() -> usize {
    30
}

fn default_pivot_workers() -> usize {
    5
}

impl Default for WorkersConfig {
    fn default() -> Self {
        Self {
            densify: default_densify_workers(),
            background: default_background_workers(),
            subtract: default_subtract_workers(),
            pivot: default_pivot_workers(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,

    #[serde(default = "default_log_format")]
    pub format: String,

    pub file: Option<String>,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
            file: None,
        }
    }
}

impl Config {
    /// Load configuration from a file (`.json` as JSON, anything else as TOML)
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
            path: path.to_path_buf(),
            error: e.to_string(),
        })?;

        let is_json = path
            .extension()
            .map(|e| e.eq_ignore_ascii_case("json"))
            .unwrap_or(false);

        let config: Config = if is_json {
            serde_json::from_str(&content).map_err(|e| ConfigError::Parse {
                path: path.to_path_buf(),
                error: e.to_string(),
            })?
        } else {
            toml::from_str(&content).map_err(|e| ConfigError::Parse {
                path: path.to_path_buf(),
                error: e.to_string(),
            })?
        };

        config.validate()?;
        Ok(config)
    }

    /// Load configuration from environment variables only
    pub fn from_env() -> Self {
        let mut config = Config::default();
        config.apply_env_overrides();
        config
    }

    /// Load configuration with environment variable overrides
    pub fn load_with_env(path: &Path) -> Result<Self, ConfigError> {
        let mut config = Self::load(path)?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Load from default locations or environment
    pub fn load_default() -> Self {
        let config_paths = [
            dirs::config_dir().map(|p| p.join("nightlights").join("config.toml")),
            Some(PathBuf::from("./nightlights.toml")),
            Some(PathBuf::from("./nightlights.json")),
        ];

        for path_opt in config_paths.iter().flatten() {
            if path_opt.exists() {
                match Self::load_with_env(path_opt) {
                    Ok(config) => {
                        tracing::info!("Loaded config from {:?}", path_opt);
                        return config;
                    }
                    Err(e) => {
                        tracing::warn!("Failed to load config from {:?}: {}", path_opt, e);
                    }
                }
            }
        }

        tracing::info!("Using default config with environment overrides");
        Self::from_env()
    }

    /// Apply environment variable overrides to an existing config
    fn apply_env_overrides(&mut self) {
        if let Ok(path) = std::env::var("NIGHTLIGHTS_PATH") {
            self.paths.path = PathBuf::from(path);
        }
        if let Ok(level) = std::env::var("NIGHTLIGHTS_LOG_LEVEL") {
            self.logging.level = level;
        }
        if let Ok(format) = std::env::var("NIGHTLIGHTS_LOG_FORMAT") {
            self.logging.format = format;
        }
    }

    /// Reject settings that would break the pipeline's invariants
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: String| -> Result<(), ConfigError> { Err(ConfigError::Invalid(msg)) };

        if self.layout.chunk_size == 0 {
            return invalid("layout.chunk_size must be positive".into());
        }
        if self.matching.max_match == 0 {
            return invalid("matching.max_match must be positive".into());
        }
        let (lo, hi) = (self.background.lower, self.background.upper);
        if !(0.0..=1.0).contains(&lo) || !(0.0..=1.0).contains(&hi) || lo > hi {
            return invalid(format!(
                "background quantiles must satisfy 0 <= lower <= upper <= 1, got {} and {}",
                lo, hi
            ));
        }
        for (name, tol) in [
            ("matching.lat_tol", self.matching.lat_tol),
            ("matching.lon_tol", self.matching.lon_tol),
            ("matching.max_distance_m", self.matching.max_distance_m),
        ] {
            if !(tol.is_finite() && tol > 0.0) {
                return invalid(format!("{} must be a positive number, got {}", name, tol));
            }
        }
        for (name, n) in [
            ("workers.densify", self.workers.densify),
            ("workers.background", self.workers.background),
            ("workers.subtract", self.workers.subtract),
            ("workers.pivot", self.workers.pivot),
        ] {
            if n == 0 {
                return invalid(format!("{} must be positive", name));
            }
        }
        Ok(())
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path:?}: {error}")]
    Io { path: PathBuf, error: String },

    #[error("Failed to parse config file {path:?}: {error}")]
    Parse { path: PathBuf, error: String },

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Generate a default config file content
pub fn generate_default_config() -> String {
    r#"# Nightlights Configuration
#
# Environment variables override these settings:
# - NIGHTLIGHTS_PATH
# - NIGHTLIGHTS_LOG_LEVEL
# - NIGHTLIGHTS_LOG_FORMAT

[paths]
# Working directory; every name below is relative to it
path = "."

darkspot_raw_file = "darkspots_raw.csv.gz"
village_raw_file = "villages_raw.csv.gz"
darkspot_coords_file = "darkspot_latlon.csv.gz"
village_info_file = "village_info.csv.gz"
match_raw_file = "match_raw.txt.gz"
match_file = "matches.bin.gz"
village_index_file = "villages.csv.gz"
darkspot_index_file = "darkspots.csv.gz"
info_file = "info.json"
village_base_dir = "villages"
darkspot_base_dir = "darkspots"
ts_dir = "timeseries"

[columns]
# 0-based column indices of the raw tables
darkspot_date = 0
darkspot_vis = 3
darkspot_lat = 1
darkspot_lon = 2
village_id = 0
village_date = 1
village_vis = 2
coords_lat = 0
coords_lon = 1
info_id = 3
info_lat = 4
info_lon = 5
raw_has_header = false
coords_has_header = false

[layout]
# Entities per chunk file
chunk_size = 20000

# Per-date buffer size (bytes) before flushing while partitioning
flush_bytes = 800000

[matching]
# Search box half-widths (degrees)
lat_tol = 0.1
lon_tol = 0.1

# Great-circle distance cap (metres)
max_distance_m = 10000.0

# Maximum darkspots per village; exceeding it aborts the reindex
max_match = 1000

[background]
# Trimmed window quantiles
lower = 0.25
upper = 0.75

[workers]
densify = 10
background = 40
subtract = 30
pivot = 5

[logging]
# Log level: trace, debug, info, warn, error
level = "info"

# Log format: pretty or json
format = "pretty"

# Optional log file path
# file = "nightlights.log"
"#
    .to_string()
}
