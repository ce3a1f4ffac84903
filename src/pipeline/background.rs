//! Background aggregator
//!
//! For every darkspot date, computes per village the trimmed mean, the
//! trimmed standard deviation and the number of values in the trimmed
//! window, over the observed values of the village's matched darkspots.
//!
//! Dates are computed concurrently; a single writer receives the results
//! over a channel and writes `background_NN`, `nvalid_NN` and `bsd_NN`
//! chunk files into the village directory of the same date.

use crate::pipeline::context::{run_bounded, Progress, RunContext, StageLog};
use crate::pipeline::error::{PipelineError, PipelineResult};
use crate::storage::{
    discover_date_dirs, read_dense, write_chunks, ChunkLayout, DateKey, EntityKind, MatchGraph,
    Stage, StorageError, ValueKind,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::mpsc;

/// Trimmed statistics of one village on one date
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TrimmedStats {
    pub mean: f64,
    pub count: usize,
    pub sd: f64,
}

impl TrimmedStats {
    pub const EMPTY: TrimmedStats = TrimmedStats {
        mean: f64::NAN,
        count: 0,
        sd: f64::NAN,
    };
}

/// Index window `[lo, hi)` kept after trimming `n` sorted values.
///
/// The bottom `floor(n * lower)` and the top `floor(n * (1 - upper))`
/// values are discarded.
pub fn trim_window(n: usize, lower: f64, upper: f64) -> (usize, usize) {
    let lo = ((n as f64 * lower).floor() as usize).min(n);
    let cut = ((n as f64 * (1.0 - upper)).floor() as usize).min(n);
    let hi = (n - cut).max(lo);
    (lo, hi)
}

/// Trimmed mean and population standard deviation of the valid values.
///
/// `values` must hold no NaN; it is sorted in place.
pub fn trimmed_stats(values: &mut [f64], lower: f64, upper: f64) -> TrimmedStats {
    values.sort_unstable_by(f64::total_cmp);
    let (lo, hi) = trim_window(values.len(), lower, upper);
    let window = &values[lo..hi];
    if window.is_empty() {
        return TrimmedStats::EMPTY;
    }

    let n = window.len() as f64;
    let mean = window.iter().sum::<f64>() / n;
    let var = window.iter().map(|v| (v - mean) * (v - mean)).sum::<f64>() / n;
    TrimmedStats {
        mean,
        count: window.len(),
        sd: var.sqrt(),
    }
}

/// Background arrays of one date, indexed by village id
#[derive(Debug, Clone)]
pub struct DateBackground {
    pub date: DateKey,
    pub mean: Vec<f64>,
    pub nvalid: Vec<f64>,
    pub sd: Vec<f64>,
}

/// Compute the background of every village from one date's darkspot array
pub fn compute_background(
    date: DateKey,
    darkspots: &[f64],
    graph: &MatchGraph,
    lower: f64,
    upper: f64,
) -> PipelineResult<DateBackground> {
    let villages = graph.village_count();
    let mut out = DateBackground {
        date,
        mean: Vec::with_capacity(villages),
        nvalid: Vec::with_capacity(villages),
        sd: Vec::with_capacity(villages),
    };
    let mut scratch: Vec<f64> = Vec::with_capacity(graph.max_match());

    for matched in graph.iter() {
        scratch.clear();
        for &id in matched {
            let value = *darkspots.get(id as usize).ok_or(StorageError::IdOutOfRange {
                id: i64::from(id),
                count: darkspots.len(),
            })?;
            if !value.is_nan() {
                scratch.push(value);
            }
        }

        let stats = trimmed_stats(&mut scratch, lower, upper);
        out.mean.push(stats.mean);
        out.nvalid.push(stats.count as f64);
        out.sd.push(stats.sd);
    }

    Ok(out)
}

/// Counts reported by a background run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BackgroundSummary {
    pub dates_computed: usize,
    pub dates_written: usize,
    pub dates_skipped: usize,
}

/// Drain the result channel, writing each date into its village directory
fn write_results(
    mut rx: mpsc::Receiver<DateBackground>,
    village_base: &Path,
    layout: &ChunkLayout,
    log: &StageLog,
) -> BackgroundSummary {
    let mut summary = BackgroundSummary::default();
    while let Some(result) = rx.blocking_recv() {
        let dir = result.date.dir_in(village_base);
        if !dir.is_dir() {
            log.record(format!("{}: no village directory {:?}, skipped", result.date, dir));
            summary.dates_skipped += 1;
            continue;
        }

        let mut ok = true;
        for (kind, values) in [
            (ValueKind::Background, &result.mean),
            (ValueKind::NValid, &result.nvalid),
            (ValueKind::Bsd, &result.sd),
        ] {
            if let Err(e) = write_chunks(&dir, kind, layout, values) {
                log.record(format!("{}: writing {} failed: {}", result.date, kind, e));
                ok = false;
            }
        }
        if ok {
            summary.dates_written += 1;
        } else {
            summary.dates_skipped += 1;
        }
    }
    summary
}

pub async fn run_background(ctx: &RunContext) -> PipelineResult<BackgroundSummary> {
    let config = ctx.shared_config();
    let info = ctx.load_info()?;
    let graph = Arc::new(ctx.load_match_graph()?);
    if graph.village_count() != info.n_village {
        return Err(StorageError::Corruption(format!(
            "match graph has {} villages, info.json records {}",
            graph.village_count(),
            info.n_village
        ))
        .into());
    }

    let village_layout = ctx.layout(info.n_village);
    let darkspot_layout = ctx.layout(ctx.entity_count(EntityKind::Darkspot)?);
    let village_base: PathBuf = ctx.base_dir(EntityKind::Village);
    let dirs = discover_date_dirs(&ctx.base_dir(EntityKind::Darkspot), None)?;
    let log = ctx.stage_log(Stage::Background)?;

    tracing::info!(
        "Computing backgrounds for {} villages over {} dates (window {}..{})",
        info.n_village,
        dirs.len(),
        config.background.lower,
        config.background.upper
    );

    let (tx, rx) = mpsc::channel::<DateBackground>(config.workers.background);
    let writer = {
        let log = log.clone();
        tokio::task::spawn_blocking(move || write_results(rx, &village_base, &village_layout, &log))
    };

    let progress = Arc::new(Progress::new("background", dirs.len(), 10));
    let units = dirs.into_iter().map(|dir| {
        let tx = tx.clone();
        let graph = Arc::clone(&graph);
        let config = Arc::clone(&config);
        let log = log.clone();
        let progress = Arc::clone(&progress);
        move || -> PipelineResult<bool> {
            let darkspots = match read_dense(&dir.path, ValueKind::Observed, &darkspot_layout) {
                Ok(values) => values,
                Err(e) => {
                    log.record(format!("{}: darkspot data unavailable: {}", dir.date, e));
                    return Ok(false);
                }
            };

            let result = compute_background(
                dir.date,
                &darkspots,
                &graph,
                config.background.lower,
                config.background.upper,
            )?;
            tx.blocking_send(result)
                .map_err(|_| PipelineError::Worker("background writer stopped".to_string()))?;
            progress.tick();
            Ok(true)
        }
    });

    let computed = run_bounded(ctx.limits().background.clone(), units).await;
    drop(tx);
    let computed = computed?;

    let mut summary = writer.await?;
    summary.dates_computed = computed.iter().filter(|&&c| c).count();
    summary.dates_skipped += computed.len() - summary.dates_computed;
    log.flush()?;

    tracing::info!(
        "Background: {} dates written, {} skipped",
        summary.dates_written,
        summary.dates_skipped
    );
    Ok(summary)
}
