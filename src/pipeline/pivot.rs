//! Pivot per-date chunk files into per-entity time series
//!
//! For one value kind and one chunk, every date's chunk file is loaded as a
//! compressed blob and all dates are decoded in lockstep, so the output is
//! written entity by entity: the series of the entity at offset `j` lands
//! at `[j * D, (j + 1) * D)` of `<ts_dir>/<kind>/<kind>_NN.gz`.

use crate::pipeline::context::{run_bounded, RunContext, StageLog};
use crate::pipeline::error::PipelineResult;
use crate::storage::codec::{create_gz, finish_gz, F64Reader};
use crate::storage::{
    discover_date_dirs, series_dir, write_lines, ChunkLayout, DateDir, EntityKind, Stage,
    StorageError, ValueKind, DATES_FILE,
};
use flate2::read::MultiGzDecoder;
use std::io::{Cursor, Write};
use std::path::Path;
use std::sync::Arc;

type BlobReader = F64Reader<MultiGzDecoder<Cursor<Vec<u8>>>>;

/// Load one date's chunk file into memory; `None` when the file is missing
fn load_blob(path: &Path) -> PipelineResult<Option<BlobReader>> {
    match std::fs::read(path) {
        Ok(bytes) => Ok(Some(F64Reader::new(MultiGzDecoder::new(Cursor::new(bytes))))),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(StorageError::file(path, e).into()),
    }
}

/// Pivot one chunk of `kind` across `dates` into `out`
///
/// A missing date file contributes NaN for every entity. A date file with
/// fewer than `chunk_len` values is fatal.
pub fn pivot_chunk(
    dates: &[DateDir],
    kind: ValueKind,
    chunk: usize,
    chunk_len: usize,
    out: &Path,
    log: &StageLog,
) -> PipelineResult<()> {
    let file_name = kind.chunk_file(chunk);
    let mut sources = Vec::with_capacity(dates.len());
    for date in dates {
        let source = load_blob(&date.path.join(&file_name))?;
        if source.is_none() {
            log.record(format!("Missing date: {} ({})", date.date, file_name));
        }
        sources.push(source);
    }
    tracing::debug!("Loaded {} blobs for {}", sources.len(), file_name);

    let mut writer = create_gz(out)?;
    let mut row = Vec::with_capacity(dates.len() * 8);
    for offset in 0..chunk_len {
        row.clear();
        for (date, source) in dates.iter().zip(sources.iter_mut()) {
            let value = match source {
                Some(reader) => reader.next_value()?.ok_or_else(|| {
                    tracing::error!("{} for {} ends at entity {}", file_name, date.date, offset);
                    StorageError::LengthMismatch {
                        expected: chunk_len,
                        found: offset,
                    }
                })?,
                None => f64::NAN,
            };
            row.extend_from_slice(&value.to_le_bytes());
        }
        writer.write_all(&row)?;
    }
    finish_gz(writer)?;

    for (date, source) in dates.iter().zip(sources.iter_mut()) {
        if let Some(reader) = source {
            if reader.next_value()?.is_some() {
                log.record(format!("{} for {} is longer than {} values", file_name, date.date, chunk_len));
            }
        }
    }
    Ok(())
}

/// Write the date index of a series directory, one `YYYY-MM-DD` per line
pub fn write_dates(dir: &Path, dates: &[DateDir]) -> PipelineResult<()> {
    let lines: Vec<String> = dates.iter().map(|d| d.date.to_string()).collect();
    write_lines(dir.join(DATES_FILE), &lines)?;
    Ok(())
}

/// Pivot every chunk of one value kind
pub async fn run_pivot(ctx: &RunContext, kind: ValueKind) -> PipelineResult<usize> {
    let info = ctx.load_info()?;
    let layout: ChunkLayout = ctx.layout(info.n_village);
    let dates = Arc::new(discover_date_dirs(&ctx.base_dir(EntityKind::Village), None)?);
    let out_dir = series_dir(&ctx.ts_root(), kind);
    let log = ctx.stage_log(Stage::Pivot(kind))?;

    std::fs::create_dir_all(&out_dir)?;
    write_dates(&out_dir, &dates)?;
    tracing::info!(
        "Pivoting {} over {} dates into {} chunks at {:?}",
        kind,
        dates.len(),
        layout.chunk_count(),
        out_dir
    );

    let units = (0..layout.chunk_count()).map(|chunk| {
        let dates = Arc::clone(&dates);
        let out = out_dir.join(kind.chunk_file(chunk));
        let log = log.clone();
        move || -> PipelineResult<usize> {
            pivot_chunk(&dates, kind, chunk, layout.chunk_len(chunk), &out, &log)?;
            tracing::info!("Pivoted {} chunk {}", kind, chunk);
            Ok(chunk)
        }
    });

    let done = run_bounded(ctx.limits().pivot.clone(), units).await?;
    log.flush()?;
    Ok(done.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::pipeline::error::PipelineError;
    use crate::storage::{read_chunk, write_chunks, DatasetInfo, DateKey, TimeSeriesReader};
    use tempfile::tempdir;

    fn context(dir: &Path, chunk_size: usize) -> RunContext {
        let mut config = Config::default();
        config.paths.path = dir.to_path_buf();
        config.layout.chunk_size = chunk_size;
        RunContext::new(config)
    }

    #[tokio::test]
    async fn test_pivot_matches_date_files() {
        let dir = tempdir().unwrap();
        let ctx = context(dir.path(), 3);
        DatasetInfo::new(5, 3).save(&ctx.info_file()).unwrap();

        let base = ctx.base_dir(EntityKind::Village);
        let layout = ChunkLayout::new(3, 5);
        let days: Vec<DateKey> = (1..=4).map(|d| DateKey::from_ymd(2003, 2, d).unwrap()).collect();
        for (d, day) in days.iter().enumerate() {
            let values: Vec<f64> = (0..5).map(|e| (d * 100 + e) as f64).collect();
            write_chunks(&day.dir_in(&base), ValueKind::Observed, &layout, &values).unwrap();
        }

        assert_eq!(run_pivot(&ctx, ValueKind::Observed).await.unwrap(), 2);

        let reader = TimeSeriesReader::open(&ctx.ts_root(), ValueKind::Observed, layout).unwrap();
        assert_eq!(reader.dates(), days.as_slice());

        let n_dates = days.len();
        for chunk in 0..layout.chunk_count() {
            let pivoted = reader.read_chunk(chunk).unwrap();
            for (d, day) in days.iter().enumerate() {
                let column = read_chunk(&day.dir_in(&base), ValueKind::Observed, chunk).unwrap();
                for (j, value) in column.iter().enumerate() {
                    assert_eq!(pivoted[j * n_dates + d], *value);
                }
            }
        }

        assert_eq!(reader.series(4).unwrap(), vec![4.0, 104.0, 204.0, 304.0]);
    }

    #[tokio::test]
    async fn test_missing_date_file_is_nan() {
        let dir = tempdir().unwrap();
        let ctx = context(dir.path(), 2);
        DatasetInfo::new(2, 2).save(&ctx.info_file()).unwrap();

        let base = ctx.base_dir(EntityKind::Village);
        let layout = ChunkLayout::new(2, 2);
        let day1 = DateKey::from_ymd(2003, 2, 1).unwrap();
        let day2 = DateKey::from_ymd(2003, 2, 2).unwrap();
        write_chunks(&day1.dir_in(&base), ValueKind::Background, &layout, &[1.0, 2.0]).unwrap();
        std::fs::create_dir_all(day2.dir_in(&base)).unwrap();

        run_pivot(&ctx, ValueKind::Background).await.unwrap();

        let reader = TimeSeriesReader::open(&ctx.ts_root(), ValueKind::Background, layout).unwrap();
        let series = reader.series(1).unwrap();
        assert_eq!(series[0], 2.0);
        assert!(series[1].is_nan());

        let log = std::fs::read_to_string(dir.path().join("pivot_background.log")).unwrap();
        assert!(log.contains("Missing date: 2003-02-02"));
    }

    #[test]
    fn test_short_date_file_is_fatal() {
        let dir = tempdir().unwrap();
        let date = DateDir::new(dir.path(), DateKey::from_ymd(2003, 2, 1).unwrap());
        write_chunks(&date.path, ValueKind::Observed, &ChunkLayout::new(2, 2), &[1.0, 2.0]).unwrap();
        let log = StageLog::create(dir.path(), Stage::Pivot(ValueKind::Observed)).unwrap();

        let out = dir.path().join("out.gz");
        let err = pivot_chunk(&[date], ValueKind::Observed, 0, 3, &out, &log).unwrap_err();
        assert!(matches!(
            err,
            PipelineError::Storage(StorageError::LengthMismatch { expected: 3, found: 2 })
        ));
    }
}
