//! Background subtraction
//!
//! `vis_adjusted = vis_observed - background`, chunk by chunk, for every
//! village date directory. A NaN observation stays NaN.

use crate::pipeline::context::{run_bounded, Progress, RunContext, StageLog};
use crate::pipeline::error::PipelineResult;
use crate::storage::{
    discover_date_dirs, read_chunk, write_f64_array, DateDir, EntityKind, Stage, StorageError,
    StorageResult, ValueKind,
};
use std::sync::Arc;

/// Subtract `background` from `observed` in place.
///
/// Slots where the observation is NaN are left NaN.
pub fn subtract_in_place(observed: &mut [f64], background: &[f64]) -> StorageResult<()> {
    if observed.len() != background.len() {
        return Err(StorageError::LengthMismatch {
            expected: observed.len(),
            found: background.len(),
        });
    }
    for (obs, bg) in observed.iter_mut().zip(background) {
        if !obs.is_nan() {
            *obs -= bg;
        }
    }
    Ok(())
}

/// Adjust one (date, chunk) unit
pub fn subtract_chunk(dir: &DateDir, chunk: usize) -> StorageResult<()> {
    let mut values = read_chunk(&dir.path, ValueKind::Observed, chunk)?;
    let background = read_chunk(&dir.path, ValueKind::Background, chunk)?;
    subtract_in_place(&mut values, &background)?;
    write_f64_array(dir.path.join(ValueKind::Adjusted.chunk_file(chunk)), &values)
}

/// Counts reported by a subtract run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SubtractSummary {
    pub units: usize,
    pub written: usize,
    pub skipped: usize,
}

pub async fn run_subtract(ctx: &RunContext) -> PipelineResult<SubtractSummary> {
    let info = ctx.load_info()?;
    let dirs = discover_date_dirs(&ctx.base_dir(EntityKind::Village), None)?;
    let log = ctx.stage_log(Stage::Subtract)?;

    let units: Vec<(Arc<DateDir>, usize)> = dirs
        .into_iter()
        .map(Arc::new)
        .flat_map(|dir| (0..info.n_chunk).map(move |chunk| (Arc::clone(&dir), chunk)))
        .collect();
    tracing::info!("Subtracting backgrounds over {} (date, chunk) units", units.len());

    let progress = Arc::new(Progress::new("subtract", units.len(), 1000));
    let total = units.len();
    let work = units.into_iter().map(|(dir, chunk)| {
        let log: StageLog = log.clone();
        let progress = Arc::clone(&progress);
        move || -> PipelineResult<bool> {
            let written = match subtract_chunk(&dir, chunk) {
                Ok(()) => true,
                Err(e) => {
                    log.record(format!("{} chunk {}: {}", dir.date, chunk, e));
                    false
                }
            };
            progress.tick();
            Ok(written)
        }
    });

    let results = run_bounded(ctx.limits().subtract.clone(), work).await?;
    log.flush()?;

    let written = results.iter().filter(|&&w| w).count();
    let summary = SubtractSummary {
        units: total,
        written,
        skipped: total - written,
    };
    tracing::info!("Subtract: {} chunks written, {} skipped", summary.written, summary.skipped);
    Ok(summary)
}
