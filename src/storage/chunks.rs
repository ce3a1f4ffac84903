//! Chunked per-date arrays
//!
//! A dense per-date array of `entity_count` values is stored as
//! `chunk_count` files inside the date directory, one per id range.
//! Concatenating the files in chunk order gives back the dense array.

use crate::storage::codec::{read_f64_array, write_f64_array};
use crate::storage::error::{StorageError, StorageResult};
use crate::storage::types::{ChunkLayout, ValueKind};
use std::path::Path;

/// Write a dense array as chunk files of `kind` into `dir`
pub fn write_chunks(dir: &Path, kind: ValueKind, layout: &ChunkLayout, values: &[f64]) -> StorageResult<()> {
    if values.len() != layout.entity_count() {
        return Err(StorageError::LengthMismatch {
            expected: layout.entity_count(),
            found: values.len(),
        });
    }

    for (chunk, slice) in layout.split(values) {
        write_f64_array(dir.join(kind.chunk_file(chunk)), slice)?;
    }
    Ok(())
}

/// Read one chunk file of `kind` from `dir`
pub fn read_chunk(dir: &Path, kind: ValueKind, chunk: usize) -> StorageResult<Vec<f64>> {
    read_f64_array(dir.join(kind.chunk_file(chunk)))
}

/// Reassemble the dense array of `kind` from all of its chunk files
pub fn read_dense(dir: &Path, kind: ValueKind, layout: &ChunkLayout) -> StorageResult<Vec<f64>> {
    let mut values = Vec::with_capacity(layout.entity_count());
    for chunk in 0..layout.chunk_count() {
        let part = read_chunk(dir, kind, chunk)?;
        if part.len() != layout.chunk_len(chunk) {
            return Err(StorageError::LengthMismatch {
                expected: layout.chunk_len(chunk),
                found: part.len(),
            });
        }
        values.extend(part);
    }
    Ok(values)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_chunks_reassemble_bit_for_bit() {
        let dir = tempdir().unwrap();
        let layout = ChunkLayout::new(4, 10);
        let values: Vec<f64> = (0..10)
            .map(|i| if i % 3 == 0 { f64::NAN } else { i as f64 * 0.5 })
            .collect();

        write_chunks(dir.path(), ValueKind::Observed, &layout, &values).unwrap();
        assert!(dir.path().join("vis_observed_02.gz").is_file());
        assert!(!dir.path().join("vis_observed_03.gz").exists());
        assert_eq!(read_chunk(dir.path(), ValueKind::Observed, 2).unwrap().len(), 2);

        let restored = read_dense(dir.path(), ValueKind::Observed, &layout).unwrap();
        let bits: Vec<u64> = restored.iter().map(|v| v.to_bits()).collect();
        let expected: Vec<u64> = values.iter().map(|v| v.to_bits()).collect();
        assert_eq!(bits, expected);
    }

    #[test]
    fn test_write_rejects_wrong_length() {
        let dir = tempdir().unwrap();
        let layout = ChunkLayout::new(4, 10);
        let err = write_chunks(dir.path(), ValueKind::Background, &layout, &[1.0; 9]).unwrap_err();
        assert!(matches!(err, StorageError::LengthMismatch { expected: 10, found: 9 }));
    }

    #[test]
    fn test_read_dense_detects_short_chunk() {
        let dir = tempdir().unwrap();
        let layout = ChunkLayout::new(4, 8);
        write_f64_array(dir.path().join("bsd_00.gz"), &[1.0; 4]).unwrap();
        write_f64_array(dir.path().join("bsd_01.gz"), &[1.0; 3]).unwrap();

        assert!(read_dense(dir.path(), ValueKind::Bsd, &layout).is_err());
    }
}
