//! Gzip codecs for the on-disk array formats
//!
//! Every persisted array is a gzip stream of fixed-width little-endian
//! values:
//!
//! ```text
//! float64 array:   [f64 LE][f64 LE][f64 LE]...
//! id/value pairs:  [i64 LE id][f64 LE value][i64 LE id][f64 LE value]...
//! ```
//!
//! Sparse id/value files are built by appending one gzip member per flush,
//! so all readers decode with `MultiGzDecoder`.

use crate::storage::error::{StorageError, StorageResult};
use flate2::read::MultiGzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Read, Write};
use std::path::Path;

/// Width of one encoded float64 value
pub const F64_WIDTH: usize = 8;

/// Width of one encoded id/value record
pub const ID_VALUE_WIDTH: usize = 16;

/// One sparse observation: a dense entity id and its value for some date
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct IdValue {
    pub id: i64,
    pub value: f64,
}

impl IdValue {
    pub fn new(id: i64, value: f64) -> Self {
        Self { id, value }
    }

    /// Encode as 16 bytes: id then value, both little-endian
    pub fn to_bytes(&self) -> [u8; ID_VALUE_WIDTH] {
        let mut buf = [0u8; ID_VALUE_WIDTH];
        buf[0..8].copy_from_slice(&self.id.to_le_bytes());
        buf[8..16].copy_from_slice(&self.value.to_le_bytes());
        buf
    }

    /// Decode from the 16-byte layout written by `to_bytes`
    pub fn from_bytes(buf: &[u8; ID_VALUE_WIDTH]) -> Self {
        let mut id = [0u8; 8];
        let mut value = [0u8; 8];
        id.copy_from_slice(&buf[0..8]);
        value.copy_from_slice(&buf[8..16]);
        Self {
            id: i64::from_le_bytes(id),
            value: f64::from_le_bytes(value),
        }
    }
}

/// Open a gzip file for reading (multi-member aware)
pub fn open_gz(path: impl AsRef<Path>) -> StorageResult<BufReader<MultiGzDecoder<File>>> {
    let path = path.as_ref();
    let file = File::open(path).map_err(|e| StorageError::file(path, e))?;
    Ok(BufReader::new(MultiGzDecoder::new(file)))
}

/// Create (or truncate) a gzip file for writing, creating parent directories
pub fn create_gz(path: impl AsRef<Path>) -> StorageResult<GzEncoder<BufWriter<File>>> {
    let path = path.as_ref();
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let file = File::create(path).map_err(|e| StorageError::file(path, e))?;
    Ok(GzEncoder::new(BufWriter::new(file), Compression::default()))
}

/// Finish a gzip stream and flush the underlying file
pub fn finish_gz(encoder: GzEncoder<BufWriter<File>>) -> StorageResult<()> {
    let mut inner = encoder.finish()?;
    inner.flush()?;
    Ok(())
}

/// Fill `buf` as far as the reader allows; returns the number of bytes read
fn read_up_to<R: Read>(reader: &mut R, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

/// Streaming reader of little-endian float64 values
pub struct F64Reader<R: Read> {
    inner: R,
    position: usize,
}

impl<R: Read> F64Reader<R> {
    pub fn new(inner: R) -> Self {
        Self { inner, position: 0 }
    }

    /// Read the next value, `None` at a clean end of stream
    pub fn next_value(&mut self) -> StorageResult<Option<f64>> {
        let mut buf = [0u8; F64_WIDTH];
        match read_up_to(&mut self.inner, &mut buf)? {
            0 => Ok(None),
            F64_WIDTH => {
                self.position += 1;
                Ok(Some(f64::from_le_bytes(buf)))
            }
            n => Err(StorageError::Corruption(format!(
                "truncated float64 after {} values ({} trailing bytes)",
                self.position, n
            ))),
        }
    }

    /// Skip `count` values; returns how many were actually skipped
    pub fn skip(&mut self, count: usize) -> StorageResult<usize> {
        for skipped in 0..count {
            if self.next_value()?.is_none() {
                return Ok(skipped);
            }
        }
        Ok(count)
    }

    /// Number of values consumed so far
    pub fn position(&self) -> usize {
        self.position
    }
}

impl F64Reader<BufReader<MultiGzDecoder<File>>> {
    /// Open a gzip float64 array file for streaming
    pub fn open(path: impl AsRef<Path>) -> StorageResult<Self> {
        Ok(Self::new(open_gz(path)?))
    }
}

/// Write a float64 array as a gzip file
pub fn write_f64_array(path: impl AsRef<Path>, values: &[f64]) -> StorageResult<()> {
    let mut bytes = Vec::with_capacity(values.len() * F64_WIDTH);
    for v in values {
        bytes.extend_from_slice(&v.to_le_bytes());
    }

    let mut encoder = create_gz(path)?;
    encoder.write_all(&bytes)?;
    finish_gz(encoder)
}

/// Read a whole gzip float64 array file
pub fn read_f64_array(path: impl AsRef<Path>) -> StorageResult<Vec<f64>> {
    let path = path.as_ref();
    let mut reader = open_gz(path)?;
    let mut bytes = Vec::new();
    reader
        .read_to_end(&mut bytes)
        .map_err(|e| StorageError::file(path, e))?;

    if bytes.len() % F64_WIDTH != 0 {
        return Err(StorageError::Corruption(format!(
            "{:?}: {} bytes is not a whole number of float64 values",
            path,
            bytes.len()
        )));
    }

    Ok(bytes
        .chunks_exact(F64_WIDTH)
        .map(|c| {
            let mut b = [0u8; F64_WIDTH];
            b.copy_from_slice(c);
            f64::from_le_bytes(b)
        })
        .collect())
}

/// Read values `[start, end)` of a gzip float64 array file
///
/// Gzip has no random access, so the prefix is decoded and discarded.
pub fn read_f64_sub_array(path: impl AsRef<Path>, start: usize, end: usize) -> StorageResult<Vec<f64>> {
    let path = path.as_ref();
    if end < start {
        return Err(StorageError::Corruption(format!(
            "invalid sub-array range {}..{}",
            start, end
        )));
    }

    let mut reader = F64Reader::open(path)?;
    let skipped = reader.skip(start)?;
    if skipped < start {
        return Err(StorageError::LengthMismatch {
            expected: end,
            found: skipped,
        });
    }

    let mut values = Vec::with_capacity(end - start);
    while values.len() < end - start {
        match reader.next_value()? {
            Some(v) => values.push(v),
            None => {
                return Err(StorageError::LengthMismatch {
                    expected: end,
                    found: start + values.len(),
                })
            }
        }
    }
    Ok(values)
}

/// Append id/value records to a sparse file as one new gzip member
///
/// With `truncate` the file is replaced instead of extended.
pub fn append_id_values(path: impl AsRef<Path>, records: &[IdValue], truncate: bool) -> StorageResult<()> {
    let path = path.as_ref();
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let file = if truncate {
        File::create(path)
    } else {
        OpenOptions::new().create(true).append(true).open(path)
    }
    .map_err(|e| StorageError::file(path, e))?;

    let mut bytes = Vec::with_capacity(records.len() * ID_VALUE_WIDTH);
    for record in records {
        bytes.extend_from_slice(&record.to_bytes());
    }

    let mut encoder = GzEncoder::new(BufWriter::new(file), Compression::default());
    encoder.write_all(&bytes)?;
    finish_gz(encoder)
}

/// Read every id/value record from a sparse file
pub fn read_id_values(path: impl AsRef<Path>) -> StorageResult<Vec<IdValue>> {
    let path = path.as_ref();
    let mut reader = open_gz(path)?;
    let mut records = Vec::new();
    let mut buf = [0u8; ID_VALUE_WIDTH];

    loop {
        match read_up_to(&mut reader, &mut buf).map_err(|e| StorageError::file(path, e))? {
            0 => break,
            ID_VALUE_WIDTH => records.push(IdValue::from_bytes(&buf)),
            n => {
                return Err(StorageError::Corruption(format!(
                    "{:?}: truncated id/value record after {} records ({} trailing bytes)",
                    path,
                    records.len(),
                    n
                )))
            }
        }
    }

    Ok(records)
}

/// Write text lines into a gzip file
pub fn write_lines<S: AsRef<str>>(path: impl AsRef<Path>, lines: &[S]) -> StorageResult<()> {
    let mut encoder = create_gz(path)?;
    for line in lines {
        encoder.write_all(line.as_ref().as_bytes())?;
        encoder.write_all(b"\n")?;
    }
    finish_gz(encoder)
}

/// Read all text lines from a gzip file
pub fn read_lines(path: impl AsRef<Path>) -> StorageResult<Vec<String>> {
    let path = path.as_ref();
    let reader = open_gz(path)?;
    let mut lines = Vec::new();
    for line in reader.lines() {
        let line = line.map_err(|e| StorageError::file(path, e))?;
        lines.push(line.trim_end_matches('\r').to_string());
    }
    Ok(lines)
}
