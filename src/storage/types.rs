//! Core data types for the chunked storage format
//!
//! - `EntityKind`: villages and darkspots, each with its own dense id space
//! - `ValueKind`: the per-date array families and their file names
//! - `ChunkLayout`: how a dense id space is split into fixed-size chunks

use crate::storage::error::StorageError;
use serde::{Deserialize, Serialize};
use std::ops::Range;
use std::str::FromStr;

/// Which dense id space an entity belongs to
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum EntityKind {
    Village,
    Darkspot,
}

impl EntityKind {
    pub fn all() -> &'static [EntityKind] {
        &[EntityKind::Village, EntityKind::Darkspot]
    }

    /// Plural name used in file names and stage markers
    pub fn plural(&self) -> &'static str {
        match self {
            EntityKind::Village => "villages",
            EntityKind::Darkspot => "darkspots",
        }
    }
}

impl std::fmt::Display for EntityKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EntityKind::Village => write!(f, "village"),
            EntityKind::Darkspot => write!(f, "darkspot"),
        }
    }
}

impl FromStr for EntityKind {
    type Err = StorageError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "village" | "villages" => Ok(EntityKind::Village),
            "darkspot" | "darkspots" => Ok(EntityKind::Darkspot),
            other => Err(StorageError::parse("entity kind", format!("unknown entity kind {:?}", other))),
        }
    }
}

/// Family of per-date, per-chunk float64 arrays
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ValueKind {
    /// Raw observed luminosity
    Observed,
    /// Trimmed mean of matched darkspots
    Background,
    /// Sample size behind each background value
    NValid,
    /// Trimmed standard deviation of matched darkspots
    Bsd,
    /// Observed minus background
    Adjusted,
}

impl ValueKind {
    pub fn all() -> &'static [ValueKind] {
        &[
            ValueKind::Observed,
            ValueKind::Background,
            ValueKind::NValid,
            ValueKind::Bsd,
            ValueKind::Adjusted,
        ]
    }

    /// File name stem, e.g. `vis_observed`
    pub fn stem(&self) -> &'static str {
        match self {
            ValueKind::Observed => "vis_observed",
            ValueKind::Background => "background",
            ValueKind::NValid => "nvalid",
            ValueKind::Bsd => "bsd",
            ValueKind::Adjusted => "vis_adjusted",
        }
    }

    /// File name for one chunk, e.g. `vis_observed_03.gz`
    pub fn chunk_file(&self, chunk: usize) -> String {
        format!("{}_{:02}.gz", self.stem(), chunk)
    }
}

impl std::fmt::Display for ValueKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.stem())
    }
}

impl FromStr for ValueKind {
    type Err = StorageError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ValueKind::all()
            .iter()
            .copied()
            .find(|k| k.stem() == s)
            .ok_or_else(|| StorageError::parse("value kind", format!("unknown value kind {:?}", s)))
    }
}

/// Partition of a dense id space `[0, entity_count)` into fixed-size chunks
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkLayout {
    chunk_size: usize,
    entity_count: usize,
}

impl ChunkLayout {
    /// Create a layout; `chunk_size` must be positive
    pub fn new(chunk_size: usize, entity_count: usize) -> Self {
        assert!(chunk_size > 0, "chunk size must be positive");
        Self {
            chunk_size,
            entity_count,
        }
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    pub fn entity_count(&self) -> usize {
        self.entity_count
    }

    /// `ceil(entity_count / chunk_size)`
    pub fn chunk_count(&self) -> usize {
        self.entity_count.div_ceil(self.chunk_size)
    }

    /// Chunk index and offset within the chunk for an entity id
    pub fn locate(&self, id: usize) -> (usize, usize) {
        (id / self.chunk_size, id % self.chunk_size)
    }

    /// Id range covered by a chunk (empty past the last chunk)
    pub fn range(&self, chunk: usize) -> Range<usize> {
        let start = (chunk * self.chunk_size).min(self.entity_count);
        let end = (start + self.chunk_size).min(self.entity_count);
        start..end
    }

    /// Number of entities in a chunk; only the last chunk may be short
    pub fn chunk_len(&self, chunk: usize) -> usize {
        self.range(chunk).len()
    }

    /// Split a dense array into `(chunk index, slice)` pairs
    pub fn split<'a>(&self, values: &'a [f64]) -> impl Iterator<Item = (usize, &'a [f64])> + 'a {
        values.chunks(self.chunk_size).enumerate()
    }
}
