//! Spot checks of the stored arrays against their sources
//!
//! Two checks, both over deterministic samples:
//!
//! - raw village rows against the `vis_observed` chunk files they were
//!   densified into
//! - pivoted `vis_observed` series against the per-date chunk files

use crate::pipeline::context::RunContext;
use crate::pipeline::error::{PipelineError, PipelineResult};
use crate::pipeline::rewriter::RawColumns;
use crate::storage::codec::open_gz;
use crate::storage::{read_chunk, EntityKind, TimeSeriesReader, ValueKind};
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::path::PathBuf;

/// Outcome of a verification run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct VerifyReport {
    pub raw_checked: usize,
    pub series_checked: usize,
}

fn same(a: f64, b: f64) -> bool {
    (a.is_nan() && b.is_nan()) || a == b
}

/// Compare every `stride`-th raw village row with the densified arrays,
/// stopping after `samples` checks. Rows with unmatched villages are passed
/// over.
pub fn verify_raw(ctx: &RunContext, samples: usize, stride: usize) -> PipelineResult<usize> {
    let config = ctx.config();
    let ids = ctx.load_ids(EntityKind::Village)?;
    let layout = ctx.layout(ctx.load_info()?.n_village);
    let base = ctx.base_dir(EntityKind::Village);
    let raw = ctx.path(&config.paths.village_raw_file);
    let columns = RawColumns::for_kind(EntityKind::Village, &config.columns);

    let mut reader = csv::ReaderBuilder::new()
        .has_headers(config.columns.raw_has_header)
        .flexible(true)
        .from_reader(open_gz(&raw)?);

    let mut cache: HashMap<(PathBuf, usize), Vec<f64>> = HashMap::new();
    let mut checked = 0;
    for (row, record) in reader.records().enumerate() {
        if checked >= samples {
            break;
        }
        if row % stride.max(1) != 0 {
            continue;
        }
        let record = record?;
        let location = format!("{:?} row {}", raw, row + 1);
        let key = columns.key(&record, &location)?;
        let Some(id) = ids.get(&key) else {
            continue;
        };
        let date = columns.date(&record, &location)?;
        let expected = columns.value(&record, &location)?;

        let (chunk, offset) = layout.locate(id as usize);
        let dir = date.dir_in(&base);
        let column = match cache.entry((dir.clone(), chunk)) {
            Entry::Occupied(e) => e.into_mut(),
            Entry::Vacant(e) => {
                e.insert(read_chunk(&dir, ValueKind::Observed, chunk)?)
            }
        };

        let found = column.get(offset).copied().unwrap_or(f64::NAN);
        if !same(expected, found) {
            return Err(PipelineError::Verification(format!(
                "{}: village {} on {} is {} in the raw file but {} in chunk {}",
                location, key, date, expected, found, chunk
            )));
        }
        checked += 1;
    }

    tracing::info!("Raw check passed for {} rows", checked);
    Ok(checked)
}

/// Compare sampled pivoted values with the per-date chunk files
pub fn verify_series(ctx: &RunContext, samples: usize) -> PipelineResult<usize> {
    let layout = ctx.layout(ctx.load_info()?.n_village);
    let reader = TimeSeriesReader::open(&ctx.ts_root(), ValueKind::Observed, layout)?;
    let dates = reader.dates();
    if dates.is_empty() || layout.entity_count() == 0 {
        return Ok(0);
    }

    let base = ctx.base_dir(EntityKind::Village);
    let n_dates = dates.len();
    let mut checked = 0;

    // Spread the samples over chunks and dates with fixed co-prime steps
    for i in 0..samples {
        let chunk = (i * 7) % layout.chunk_count();
        let d = (i * 13) % n_dates;
        let date = dates[d];

        let column = match read_chunk(&date.dir_in(&base), ValueKind::Observed, chunk) {
            Ok(column) => column,
            Err(e) if e.is_not_found() => continue,
            Err(e) => return Err(e.into()),
        };
        let pivoted = reader.read_chunk(chunk)?;

        for (j, value) in column.iter().enumerate().take(10) {
            let found = pivoted[j * n_dates + d];
            if !same(*value, found) {
                return Err(PipelineError::Verification(format!(
                    "chunk {} entity {} on {}: {} in the date file, {} in the series",
                    chunk, j, date, value, found
                )));
            }
            checked += 1;
        }
    }

    tracing::info!("Series check passed for {} values", checked);
    Ok(checked)
}

pub fn run_verify(ctx: &RunContext, samples: usize) -> PipelineResult<VerifyReport> {
    Ok(VerifyReport {
        raw_checked: verify_raw(ctx, samples, 997)?,
        series_checked: verify_series(ctx, samples)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::pipeline::pivot::run_pivot;
    use crate::pipeline::rewriter::{densify_date, partition_file};
    use crate::storage::codec::write_lines;
    use crate::storage::{write_chunks, DatasetInfo, DateKey, IdTable};
    use tempfile::tempdir;

    fn setup() -> (tempfile::TempDir, RunContext) {
        let dir = tempdir().unwrap();
        let mut config = Config::default();
        config.paths.path = dir.path().to_path_buf();
        config.layout.chunk_size = 2;
        let ctx = RunContext::new(config);

        let mut ids = IdTable::new();
        for key in ["V1", "V2", "V3"] {
            ids.assign(key).unwrap();
        }
        ids.save(&ctx.index_file(EntityKind::Village), "village").unwrap();
        DatasetInfo::new(3, 2).save(&ctx.info_file()).unwrap();

        write_lines(
            ctx.path(&ctx.config().paths.village_raw_file),
            &["V1,2001-01-01,1.0", "V3,2001-01-01,3.0", "V2,2001-01-02,2.0"],
        )
        .unwrap();
        (dir, ctx)
    }

    #[tokio::test]
    async fn test_verify_after_pipeline() {
        let (_dir, ctx) = setup();
        let columns = RawColumns::for_kind(EntityKind::Village, &ctx.config().columns);
        let ids = ctx.load_ids(EntityKind::Village).unwrap();
        let base = ctx.base_dir(EntityKind::Village);
        let raw = ctx.path(&ctx.config().paths.village_raw_file);

        let summary = partition_file(&raw, columns, false, &ids, &base, 1024).unwrap();
        let layout = ctx.layout(3);
        for date in &summary.dates {
            densify_date(&date.dir_in(&base), &layout).unwrap();
        }
        run_pivot(&ctx, ValueKind::Observed).await.unwrap();

        assert_eq!(verify_raw(&ctx, 10, 1).unwrap(), 3);
        assert!(verify_series(&ctx, 4).unwrap() > 0);
    }

    #[test]
    fn test_raw_mismatch_detected() {
        let (_dir, ctx) = setup();
        let base = ctx.base_dir(EntityKind::Village);
        let layout = ctx.layout(3);
        let day = DateKey::from_ymd(2001, 1, 1).unwrap().dir_in(&base);
        write_chunks(&day, ValueKind::Observed, &layout, &[1.0, f64::NAN, 30.0]).unwrap();

        let err = verify_raw(&ctx, 10, 1).unwrap_err();
        assert!(matches!(err, PipelineError::Verification(_)));
    }
}
