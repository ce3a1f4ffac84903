//! Pivoted time-series files
//!
//! ```text
//! <ts_dir>/<kind>/dates.txt.gz      one YYYY-MM-DD line per date index
//! <ts_dir>/<kind>/<kind>_<NN>.gz    chunk_len × n_dates float64 values
//! ```
//!
//! Within a chunk file the series of the entity at offset `j` occupies
//! `[j * n_dates, (j + 1) * n_dates)`, in date order.

use crate::storage::codec::{read_f64_array, read_f64_sub_array, read_lines};
use crate::storage::dates::DateKey;
use crate::storage::error::{StorageError, StorageResult};
use crate::storage::types::{ChunkLayout, ValueKind};
use std::path::{Path, PathBuf};

/// Name of the date index file inside a series directory
pub const DATES_FILE: &str = "dates.txt.gz";

/// Directory holding the pivoted series of one value kind
pub fn series_dir(ts_root: &Path, kind: ValueKind) -> PathBuf {
    ts_root.join(kind.stem())
}

/// Random access to pivoted series by entity id
pub struct TimeSeriesReader {
    dir: PathBuf,
    kind: ValueKind,
    dates: Vec<DateKey>,
    layout: ChunkLayout,
}

impl TimeSeriesReader {
    pub fn open(ts_root: &Path, kind: ValueKind, layout: ChunkLayout) -> StorageResult<Self> {
        let dir = series_dir(ts_root, kind);
        let dates = read_lines(dir.join(DATES_FILE))?
            .iter()
            .filter(|l| !l.trim().is_empty())
            .map(|l| DateKey::parse(l))
            .collect::<StorageResult<Vec<_>>>()?;

        Ok(Self {
            dir,
            kind,
            dates,
            layout,
        })
    }

    pub fn dates(&self) -> &[DateKey] {
        &self.dates
    }

    pub fn chunk_path(&self, chunk: usize) -> PathBuf {
        self.dir.join(self.kind.chunk_file(chunk))
    }

    /// The full series of one entity, one value per date
    pub fn series(&self, id: usize) -> StorageResult<Vec<f64>> {
        if id >= self.layout.entity_count() {
            return Err(StorageError::IdOutOfRange {
                id: id as i64,
                count: self.layout.entity_count(),
            });
        }
        let (chunk, offset) = self.layout.locate(id);
        let n = self.dates.len();
        read_f64_sub_array(self.chunk_path(chunk), offset * n, (offset + 1) * n)
    }

    /// Every series of a chunk, checked against the expected size
    pub fn read_chunk(&self, chunk: usize) -> StorageResult<Vec<f64>> {
        let values = read_f64_array(self.chunk_path(chunk))?;
        let expected = self.layout.chunk_len(chunk) * self.dates.len();
        if values.len() != expected {
            return Err(StorageError::LengthMismatch {
                expected,
                found: values.len(),
            });
        }
        Ok(values)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::codec::{write_f64_array, write_lines};
    use tempfile::tempdir;

    #[test]
    fn test_series_lookup() {
        let dir = tempdir().unwrap();
        let root = dir.path();
        let sdir = series_dir(root, ValueKind::Observed);
        write_lines(sdir.join(DATES_FILE), &["2001-01-01", "2001-01-02"]).unwrap();

        // chunk size 2, 3 entities: chunk 0 holds ids 0 and 1, chunk 1 holds id 2
        write_f64_array(sdir.join("vis_observed_00.gz"), &[0.0, 0.1, 1.0, 1.1]).unwrap();
        write_f64_array(sdir.join("vis_observed_01.gz"), &[2.0, 2.1]).unwrap();

        let reader =
            TimeSeriesReader::open(root, ValueKind::Observed, ChunkLayout::new(2, 3)).unwrap();
        assert_eq!(reader.dates().len(), 2);
        assert_eq!(reader.series(1).unwrap(), vec![1.0, 1.1]);
        assert_eq!(reader.series(2).unwrap(), vec![2.0, 2.1]);
        assert!(reader.series(3).is_err());
        assert_eq!(reader.read_chunk(1).unwrap(), vec![2.0, 2.1]);
    }
}
