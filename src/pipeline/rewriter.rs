//! Columnar rewriter
//!
//! Two passes turn a raw observation table into dense per-date arrays:
//!
//! 1. **partition**: stream the raw rows, resolve each key to its dense id
//!    and append `(id, value)` records to `<base>/<y>/<m>/<d>/idvis.gz`.
//!    Records are buffered per date and flushed as one gzip member each
//!    time a buffer reaches the flush threshold.
//! 2. **densify**: per date directory, scatter the sparse records into a
//!    NaN-filled array of the full id space and write it as chunk files.

use crate::config::ColumnsConfig;
use crate::pipeline::context::{run_bounded, Progress, RunContext};
use crate::pipeline::error::{PipelineError, PipelineResult};
use crate::pipeline::matcher::darkspot_key;
use crate::storage::codec::{append_id_values, open_gz, read_id_values, ID_VALUE_WIDTH};
use crate::storage::{
    discover_date_dirs, write_chunks, ChunkLayout, DateKey, EntityKind, IdTable, IdValue,
    StorageError, ValueKind,
};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

/// Sparse per-date file written by the partition pass
pub const SPARSE_FILE: &str = "idvis.gz";

/// Raw rows between progress reports
const PROGRESS_EVERY: usize = 10_000_000;

/// Which columns of a raw row hold the key, the date and the value
#[derive(Debug, Clone, Copy)]
pub struct RawColumns {
    kind: EntityKind,
    key: usize,
    lat: usize,
    lon: usize,
    date: usize,
    vis: usize,
}

impl RawColumns {
    pub fn for_kind(kind: EntityKind, cols: &ColumnsConfig) -> Self {
        match kind {
            EntityKind::Village => Self {
                kind,
                key: cols.village_id,
                lat: 0,
                lon: 0,
                date: cols.village_date,
                vis: cols.village_vis,
            },
            EntityKind::Darkspot => Self {
                kind,
                key: 0,
                lat: cols.darkspot_lat,
                lon: cols.darkspot_lon,
                date: cols.darkspot_date,
                vis: cols.darkspot_vis,
            },
        }
    }

    fn field<'r>(&self, record: &'r csv::StringRecord, ix: usize, location: &str) -> PipelineResult<&'r str> {
        record
            .get(ix)
            .map(str::trim)
            .ok_or_else(|| PipelineError::input(location, format!("missing column {}", ix)))
    }

    /// The entity key of a row. Darkspot keys are rebuilt from the parsed
    /// coordinates so they match the keys the matcher produced.
    pub fn key(&self, record: &csv::StringRecord, location: &str) -> PipelineResult<String> {
        match self.kind {
            EntityKind::Village => Ok(self.field(record, self.key, location)?.to_string()),
            EntityKind::Darkspot => {
                let lat = parse_f64(self.field(record, self.lat, location)?, location)?;
                let lon = parse_f64(self.field(record, self.lon, location)?, location)?;
                Ok(darkspot_key(lat, lon))
            }
        }
    }

    pub fn date(&self, record: &csv::StringRecord, location: &str) -> PipelineResult<DateKey> {
        let field = self.field(record, self.date, location)?;
        DateKey::parse(field).map_err(|e| PipelineError::input(location, e))
    }

    pub fn value(&self, record: &csv::StringRecord, location: &str) -> PipelineResult<f64> {
        parse_f64(self.field(record, self.vis, location)?, location)
    }
}

fn parse_f64(field: &str, location: &str) -> PipelineResult<f64> {
    field
        .parse()
        .map_err(|e| PipelineError::input(location, format!("bad number {:?}: {}", field, e)))
}

/// Per-date record buffers with threshold flushing
///
/// The first flush of a date in a run truncates whatever file an earlier
/// run left behind; later flushes append a new gzip member.
pub struct DateBuffers {
    base: PathBuf,
    flush_records: usize,
    buffers: HashMap<DateKey, Vec<IdValue>>,
    started: HashSet<DateKey>,
    flushes: usize,
}

impl DateBuffers {
    pub fn new(base: impl Into<PathBuf>, flush_bytes: usize) -> Self {
        Self {
            base: base.into(),
            flush_records: (flush_bytes / ID_VALUE_WIDTH).max(1),
            buffers: HashMap::new(),
            started: HashSet::new(),
            flushes: 0,
        }
    }

    pub fn push(&mut self, date: DateKey, record: IdValue) -> PipelineResult<()> {
        let buffer = self.buffers.entry(date).or_default();
        buffer.push(record);
        if buffer.len() >= self.flush_records {
            self.flush(date)?;
        }
        Ok(())
    }

    fn flush(&mut self, date: DateKey) -> PipelineResult<()> {
        let Some(buffer) = self.buffers.get_mut(&date) else {
            return Ok(());
        };
        if buffer.is_empty() {
            return Ok(());
        }

        let path = date.dir_in(&self.base).join(SPARSE_FILE);
        let truncate = self.started.insert(date);
        append_id_values(&path, buffer, truncate)?;
        buffer.clear();
        self.flushes += 1;
        Ok(())
    }

    /// Flush every non-empty buffer; returns the dates written this run
    pub fn finish(mut self) -> PipelineResult<Vec<DateKey>> {
        let mut dates: Vec<DateKey> = self.buffers.keys().copied().collect();
        dates.sort();
        for date in &dates {
            self.flush(*date)?;
        }
        tracing::debug!("{} flushes across {} dates", self.flushes, self.started.len());

        let mut written: Vec<DateKey> = self.started.into_iter().collect();
        written.sort();
        Ok(written)
    }
}

/// Counts reported by a partition run
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PartitionSummary {
    pub rows: usize,
    pub kept: usize,
    pub dropped: usize,
    pub dates: Vec<DateKey>,
}

/// Partition a raw table into per-date sparse files under `base`
///
/// Rows whose key is not in `ids` are dropped; any other malformed row is
/// fatal.
pub fn partition_file(
    raw: &Path,
    columns: RawColumns,
    has_headers: bool,
    ids: &IdTable,
    base: &Path,
    flush_bytes: usize,
) -> PipelineResult<PartitionSummary> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(has_headers)
        .flexible(true)
        .from_reader(open_gz(raw)?);

    let mut buffers = DateBuffers::new(base, flush_bytes);
    let mut summary = PartitionSummary::default();
    let progress = Progress::new("partition rows", 0, PROGRESS_EVERY);

    for (row, record) in reader.records().enumerate() {
        let record = record?;
        let location = format!("{:?} row {}", raw, row + 1);
        summary.rows += 1;
        progress.tick();

        let key = columns.key(&record, &location)?;
        let Some(id) = ids.get(&key) else {
            summary.dropped += 1;
            continue;
        };
        let date = columns.date(&record, &location)?;
        let value = columns.value(&record, &location)?;

        buffers.push(date, IdValue::new(i64::from(id), value))?;
        summary.kept += 1;
    }

    summary.dates = buffers.finish()?;
    Ok(summary)
}

pub fn run_partition(ctx: &RunContext, kind: EntityKind) -> PipelineResult<PartitionSummary> {
    let config = ctx.config();
    let raw = match kind {
        EntityKind::Village => ctx.path(&config.paths.village_raw_file),
        EntityKind::Darkspot => ctx.path(&config.paths.darkspot_raw_file),
    };
    let ids = ctx.load_ids(kind)?;
    let base = ctx.base_dir(kind);
    tracing::info!("Partitioning {:?} by date into {:?} ({} known {})", raw, base, ids.len(), kind.plural());

    let summary = partition_file(
        &raw,
        RawColumns::for_kind(kind, &config.columns),
        config.columns.raw_has_header,
        &ids,
        &base,
        config.layout.flush_bytes,
    )?;

    tracing::info!(
        "{} rows: {} kept, {} with unmatched keys dropped, {} dates",
        summary.rows,
        summary.kept,
        summary.dropped,
        summary.dates.len()
    );
    Ok(summary)
}

/// Scatter sparse records into a NaN-filled array of `entity_count` slots
pub fn densify(records: &[IdValue], entity_count: usize) -> PipelineResult<Vec<f64>> {
    let mut values = vec![f64::NAN; entity_count];
    for record in records {
        let slot = usize::try_from(record.id)
            .ok()
            .and_then(|ix| values.get_mut(ix))
            .ok_or(StorageError::IdOutOfRange {
                id: record.id,
                count: entity_count,
            })?;
        *slot = record.value;
    }
    Ok(values)
}

/// Densify one date directory into `vis_observed` chunk files
pub fn densify_date(dir: &Path, layout: &ChunkLayout) -> PipelineResult<usize> {
    let records = read_id_values(dir.join(SPARSE_FILE))?;
    let values = densify(&records, layout.entity_count())?;
    write_chunks(dir, ValueKind::Observed, layout, &values)?;
    Ok(records.len())
}

pub async fn run_densify(ctx: &RunContext, kind: EntityKind) -> PipelineResult<usize> {
    let layout = ctx.layout(ctx.entity_count(kind)?);
    let dirs = discover_date_dirs(&ctx.base_dir(kind), Some(SPARSE_FILE))?;
    tracing::info!(
        "Densifying {} date directories of {} ({} chunks)",
        dirs.len(),
        kind.plural(),
        layout.chunk_count()
    );

    let progress = std::sync::Arc::new(Progress::new(format!("densify {}", kind.plural()), dirs.len(), 100));
    let units = dirs.into_iter().map(|dir| {
        let progress = std::sync::Arc::clone(&progress);
        move || -> PipelineResult<usize> {
            let n = densify_date(&dir.path, &layout).map_err(|e| {
                tracing::error!("Densify failed for {}: {}", dir.date, e);
                e
            })?;
            progress.tick();
            Ok(n)
        }
    });

    let counts = run_bounded(ctx.limits().densify.clone(), units).await?;
    Ok(counts.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::storage::codec::write_lines;
    use crate::storage::read_dense;
    use tempfile::tempdir;

    fn ids(keys: &[&str]) -> IdTable {
        let mut table = IdTable::new();
        for key in keys {
            table.assign(key).unwrap();
        }
        table
    }

    #[test]
    fn test_densify_fills_nan() {
        let records = [IdValue::new(3, 1.5), IdValue::new(0, -2.0)];
        let values = densify(&records, 5).unwrap();
        assert_eq!(values[0], -2.0);
        assert!(values[1].is_nan());
        assert!(values[2].is_nan());
        assert_eq!(values[3], 1.5);
        assert!(values[4].is_nan());
    }

    #[test]
    fn test_densify_out_of_range_is_fatal() {
        assert!(densify(&[IdValue::new(5, 1.0)], 5).is_err());
        assert!(densify(&[IdValue::new(-1, 1.0)], 5).is_err());
    }

    #[test]
    fn test_buffers_flush_at_threshold() {
        let dir = tempdir().unwrap();
        // Two records per flush
        let mut buffers = DateBuffers::new(dir.path(), 2 * ID_VALUE_WIDTH);
        let date = DateKey::from_ymd(2001, 3, 4).unwrap();

        for i in 0..5 {
            buffers.push(date, IdValue::new(i, i as f64)).unwrap();
        }
        let path = date.dir_in(dir.path()).join(SPARSE_FILE);
        assert_eq!(read_id_values(&path).unwrap().len(), 4);

        assert_eq!(buffers.finish().unwrap(), vec![date]);
        assert_eq!(read_id_values(&path).unwrap().len(), 5);
    }

    #[test]
    fn test_partition_then_densify_round_trip() {
        let dir = tempdir().unwrap();
        let raw = dir.path().join("villages_raw.csv.gz");
        write_lines(
            &raw,
            &[
                "V2,2001-03-04,7.5",
                "V1,2001-03-04,1.25",
                "V9,2001-03-04,99.0",
                "V1,2001-03-05,3.0",
            ],
        )
        .unwrap();

        let table = ids(&["V1", "V2", "V3"]);
        let columns = RawColumns::for_kind(EntityKind::Village, &ColumnsConfig::default());
        let base = dir.path().join("villages");

        let summary = partition_file(&raw, columns, false, &table, &base, 800_000).unwrap();
        assert_eq!(summary.rows, 4);
        assert_eq!(summary.kept, 3);
        assert_eq!(summary.dropped, 1);
        assert_eq!(summary.dates.len(), 2);

        let layout = ChunkLayout::new(2, 3);
        let day = DateKey::from_ymd(2001, 3, 4).unwrap().dir_in(&base);
        assert_eq!(densify_date(&day, &layout).unwrap(), 2);

        let dense = read_dense(&day, ValueKind::Observed, &layout).unwrap();
        assert_eq!(dense[0], 1.25);
        assert_eq!(dense[1], 7.5);
        assert!(dense[2].is_nan());
        assert!(day.join("vis_observed_01.gz").is_file());
    }

    #[test]
    fn test_rerun_partition_replaces_stale_data() {
        let dir = tempdir().unwrap();
        let raw = dir.path().join("villages_raw.csv.gz");
        write_lines(&raw, &["V1,2001-03-04,1.0"]).unwrap();
        let table = ids(&["V1"]);
        let columns = RawColumns::for_kind(EntityKind::Village, &ColumnsConfig::default());
        let base = dir.path().join("villages");

        partition_file(&raw, columns, false, &table, &base, 800_000).unwrap();
        partition_file(&raw, columns, false, &table, &base, 800_000).unwrap();

        let path = DateKey::from_ymd(2001, 3, 4).unwrap().dir_in(&base).join(SPARSE_FILE);
        assert_eq!(read_id_values(&path).unwrap(), vec![IdValue::new(0, 1.0)]);
    }

    #[test]
    fn test_darkspot_keys_are_normalised() {
        let dir = tempdir().unwrap();
        let raw = dir.path().join("darkspots_raw.csv.gz");
        write_lines(&raw, &["2001-03-04,21.5,79.25,0.5"]).unwrap();
        let table = ids(&["21.50000000:79.25000000"]);
        let columns = RawColumns::for_kind(EntityKind::Darkspot, &ColumnsConfig::default());

        let summary = partition_file(&raw, columns, false, &table, dir.path(), 800_000).unwrap();
        assert_eq!(summary.kept, 1);
    }

    #[test]
    fn test_bad_value_is_fatal() {
        let dir = tempdir().unwrap();
        let raw = dir.path().join("villages_raw.csv.gz");
        write_lines(&raw, &["V1,2001-03-04,bright"]).unwrap();
        let columns = RawColumns::for_kind(EntityKind::Village, &ColumnsConfig::default());

        let err = partition_file(&raw, columns, false, &ids(&["V1"]), dir.path(), 800_000).unwrap_err();
        assert!(matches!(err, PipelineError::Input { .. }));
    }

    #[tokio::test]
    async fn test_run_densify_all_dates() {
        let dir = tempdir().unwrap();
        let mut config = Config::default();
        config.paths.path = dir.path().to_path_buf();
        config.layout.chunk_size = 2;
        let ctx = RunContext::new(config);

        ids(&["a", "b", "c"])
            .save(&ctx.index_file(EntityKind::Darkspot), "darkspot")
            .unwrap();
        let base = ctx.base_dir(EntityKind::Darkspot);
        for day in 1..=3 {
            let path = DateKey::from_ymd(2002, 1, day).unwrap().dir_in(&base).join(SPARSE_FILE);
            append_id_values(&path, &[IdValue::new(2, day as f64)], true).unwrap();
        }

        assert_eq!(run_densify(&ctx, EntityKind::Darkspot).await.unwrap(), 3);

        let layout = ChunkLayout::new(2, 3);
        let day2 = DateKey::from_ymd(2002, 1, 2).unwrap().dir_in(&base);
        let dense = read_dense(&day2, ValueKind::Observed, &layout).unwrap();
        assert_eq!(dense[2], 2.0);
        assert!(dense[0].is_nan());
    }
}
