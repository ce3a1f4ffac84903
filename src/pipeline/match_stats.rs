//! Offset histogram of the raw match file
//!
//! For every matched pair, the darkspot minus village offset in latitude
//! and longitude is binned into 0.1 degree bins covering `[-2.6, 2.6)`.
//! An offset outside that range means the match file does not come from a
//! sane tolerance and is reported as an error.

use crate::pipeline::context::RunContext;
use crate::pipeline::error::{PipelineError, PipelineResult};
use crate::pipeline::matcher::{parse_darkspot_key, MatchRecord};
use crate::storage::codec::open_gz;
use std::io::BufRead;
use std::path::Path;

/// Half-width of the histogram range, in degrees
pub const OFFSET_RANGE: f64 = 2.6;

/// Bins per degree (0.1 degree bins)
pub const BINS_PER_DEGREE: f64 = 10.0;

/// Number of bins
pub const BIN_COUNT: usize = 52;

/// Histograms of match offsets
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MatchStats {
    pub pairs: u64,
    pub lat: Vec<u64>,
    pub lon: Vec<u64>,
}

impl Default for MatchStats {
    fn default() -> Self {
        Self {
            pairs: 0,
            lat: vec![0; BIN_COUNT],
            lon: vec![0; BIN_COUNT],
        }
    }
}

/// Bin index of an offset, `None` when outside the histogram range
pub fn offset_bin(offset: f64) -> Option<usize> {
    if !offset.is_finite() || offset.abs() > OFFSET_RANGE {
        return None;
    }
    let ix = ((offset + OFFSET_RANGE) * BINS_PER_DEGREE).floor() as usize;
    (ix < BIN_COUNT).then_some(ix)
}

/// Lower edge of a bin, in degrees
pub fn bin_lower_edge(bin: usize) -> f64 {
    bin as f64 / BINS_PER_DEGREE - OFFSET_RANGE
}

impl MatchStats {
    /// Add one pair's offsets
    pub fn record(&mut self, record: &MatchRecord, location: &str) -> PipelineResult<()> {
        let darkspot = parse_darkspot_key(&record.darkspot_key).ok_or_else(|| {
            PipelineError::input(location, format!("bad darkspot key {:?}", record.darkspot_key))
        })?;

        let dlat = darkspot.lat - record.village.lat;
        let dlon = darkspot.lon - record.village.lon;
        let lat_bin = offset_bin(dlat)
            .ok_or_else(|| PipelineError::input(location, format!("latitude offset {} out of range", dlat)))?;
        let lon_bin = offset_bin(dlon)
            .ok_or_else(|| PipelineError::input(location, format!("longitude offset {} out of range", dlon)))?;

        self.lat[lat_bin] += 1;
        self.lon[lon_bin] += 1;
        self.pairs += 1;
        Ok(())
    }

    /// Render both histograms as a table
    pub fn table(&self) -> String {
        let mut out = String::from("offset      lat        lon\n");
        for bin in 0..BIN_COUNT {
            out.push_str(&format!(
                "{:>6.2} {:>10} {:>10}\n",
                bin_lower_edge(bin),
                self.lat[bin],
                self.lon[bin]
            ));
        }
        out
    }
}

/// Build the histograms from a raw match file
pub fn compute_match_stats(path: &Path) -> PipelineResult<MatchStats> {
    let reader = open_gz(path)?;
    let mut stats = MatchStats::default();

    for (n, line) in reader.lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let location = format!("{:?} line {}", path, n + 1);
        let record = MatchRecord::parse_line(&line, &location)?;
        stats.record(&record, &location)?;
    }
    Ok(stats)
}

pub fn run_match_stats(ctx: &RunContext) -> PipelineResult<MatchStats> {
    let path = ctx.match_raw_file();
    let stats = compute_match_stats(&path)?;
    tracing::info!("Offset histogram over {} pairs:\n{}", stats.pairs, stats.table());
    Ok(stats)
}
