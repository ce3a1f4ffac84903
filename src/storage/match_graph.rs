//! Village to darkspot adjacency
//!
//! `MatchGraph[v]` is the list of darkspot ids matched to village `v`.
//! Every list is bounded by `max_match`; the background aggregator sizes its
//! scratch buffer from that bound, so a longer list is rejected both when the
//! graph is built and when it is loaded.
//!
//! File layout (the whole file is gzip-compressed):
//! ```text
//! ┌─────────────────────────────────────────┐
//! │ HEADER (24 bytes)                       │
//! │   magic: [u8; 4] = "NLMG"               │
//! │   version: u16                          │
//! │   reserved: u16                         │
//! │   village_count: u32                    │
//! │   max_match: u32                        │
//! │   payload_len: u32                      │
//! │   payload_checksum: u32                 │
//! ├─────────────────────────────────────────┤
//! │ PAYLOAD: bincode Vec<Vec<u32>>          │
//! └─────────────────────────────────────────┘
//! ```

use crate::storage::codec::{create_gz, finish_gz, open_gz};
use crate::storage::error::{StorageError, StorageResult};
use crate::storage::ids::EntityId;
use std::io::{Read, Write};
use std::path::Path;

const GRAPH_MAGIC: [u8; 4] = *b"NLMG";

const GRAPH_VERSION: u16 = 1;

const HEADER_SIZE: usize = 24;

/// Adjacency lists from village id to matched darkspot ids
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MatchGraph {
    max_match: usize,
    lists: Vec<Vec<EntityId>>,
}

impl MatchGraph {
    pub fn new(max_match: usize) -> Self {
        Self {
            max_match,
            lists: Vec::new(),
        }
    }

    /// Build from complete lists, failing on any list over the bound
    pub fn from_lists(max_match: usize, lists: Vec<Vec<EntityId>>) -> StorageResult<Self> {
        for (village, list) in lists.iter().enumerate() {
            if list.len() > max_match {
                return Err(StorageError::MatchLimitExceeded {
                    village,
                    count: list.len(),
                    max: max_match,
                });
            }
        }
        Ok(Self { max_match, lists })
    }

    /// Append a darkspot to a village's list, growing the table as needed
    pub fn push(&mut self, village: EntityId, darkspot: EntityId) -> StorageResult<()> {
        let v = village as usize;
        if v >= self.lists.len() {
            self.lists.resize_with(v + 1, Vec::new);
        }

        let list = &mut self.lists[v];
        if list.len() >= self.max_match {
            return Err(StorageError::MatchLimitExceeded {
                village: v,
                count: list.len() + 1,
                max: self.max_match,
            });
        }
        list.push(darkspot);
        Ok(())
    }

    /// Matched darkspots of a village (empty for unknown ids)
    pub fn matches(&self, village: usize) -> &[EntityId] {
        self.lists.get(village).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn iter(&self) -> impl Iterator<Item = &[EntityId]> {
        self.lists.iter().map(Vec::as_slice)
    }

    /// Number of villages (highest village id + 1)
    pub fn village_count(&self) -> usize {
        self.lists.len()
    }

    pub fn max_match(&self) -> usize {
        self.max_match
    }

    /// Highest darkspot id referenced, if any
    pub fn max_darkspot(&self) -> Option<EntityId> {
        self.lists.iter().flatten().copied().max()
    }

    pub fn total_matches(&self) -> usize {
        self.lists.iter().map(Vec::len).sum()
    }

    /// Write the graph to a gzip file
    pub fn save(&self, path: &Path) -> StorageResult<()> {
        let payload = bincode::serialize(&self.lists)?;

        let mut header = [0u8; HEADER_SIZE];
        header[0..4].copy_from_slice(&GRAPH_MAGIC);
        header[4..6].copy_from_slice(&GRAPH_VERSION.to_le_bytes());
        header[8..12].copy_from_slice(&(self.lists.len() as u32).to_le_bytes());
        header[12..16].copy_from_slice(&(self.max_match as u32).to_le_bytes());
        header[16..20].copy_from_slice(&(payload.len() as u32).to_le_bytes());
        header[20..24].copy_from_slice(&crc32fast::hash(&payload).to_le_bytes());

        let mut encoder = create_gz(path)?;
        encoder.write_all(&header)?;
        encoder.write_all(&payload)?;
        finish_gz(encoder)
    }

    /// Load a graph, re-checking every list against `max_match`.
    ///
    /// The bound used is the one passed in, not the one recorded at save
    /// time, since it is the caller's buffers that depend on it.
    pub fn load(path: &Path, max_match: usize) -> StorageResult<Self> {
        let mut reader = open_gz(path)?;
        let mut bytes = Vec::new();
        reader
            .read_to_end(&mut bytes)
            .map_err(|e| StorageError::file(path, e))?;

        if bytes.len() < HEADER_SIZE {
            return Err(StorageError::Corruption(format!(
                "{:?}: match graph shorter than its header",
                path
            )));
        }

        let (header, payload) = bytes.split_at(HEADER_SIZE);
        if header[0..4] != GRAPH_MAGIC {
            return Err(StorageError::Corruption(format!(
                "{:?}: invalid magic {:?}",
                path,
                &header[0..4]
            )));
        }

        let version = u16::from_le_bytes([header[4], header[5]]);
        if version > GRAPH_VERSION {
            return Err(StorageError::Corruption(format!(
                "{:?}: unsupported version {}",
                path, version
            )));
        }

        let village_count = u32::from_le_bytes([header[8], header[9], header[10], header[11]]) as usize;
        let payload_len = u32::from_le_bytes([header[16], header[17], header[18], header[19]]) as usize;
        let stored_checksum = u32::from_le_bytes([header[20], header[21], header[22], header[23]]);

        if payload.len() != payload_len {
            return Err(StorageError::Corruption(format!(
                "{:?}: payload is {} bytes, header says {}",
                path,
                payload.len(),
                payload_len
            )));
        }
        let computed = crc32fast::hash(payload);
        if computed != stored_checksum {
            return Err(StorageError::Corruption(format!(
                "{:?}: checksum mismatch: stored={}, computed={}",
                path, stored_checksum, computed
            )));
        }

        let lists: Vec<Vec<EntityId>> = bincode::deserialize(payload)?;
        if lists.len() != village_count {
            return Err(StorageError::LengthMismatch {
                expected: village_count,
                found: lists.len(),
            });
        }

        Self::from_lists(max_match, lists)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_push_grows_table() {
        let mut graph = MatchGraph::new(4);
        graph.push(2, 7).unwrap();
        graph.push(0, 1).unwrap();
        graph.push(2, 3).unwrap();

        assert_eq!(graph.village_count(), 3);
        assert_eq!(graph.matches(2), &[7, 3]);
        assert!(graph.matches(1).is_empty());
        assert!(graph.matches(99).is_empty());
        assert_eq!(graph.max_darkspot(), Some(7));
        assert_eq!(graph.total_matches(), 3);
    }

    #[test]
    fn test_push_past_bound_fails() {
        let mut graph = MatchGraph::new(2);
        graph.push(0, 0).unwrap();
        graph.push(0, 1).unwrap();

        let err = graph.push(0, 2).unwrap_err();
        assert!(matches!(
            err,
            StorageError::MatchLimitExceeded { village: 0, count: 3, max: 2 }
        ));
        // Nothing was silently truncated or appended
        assert_eq!(graph.matches(0), &[0, 1]);
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("matches.bin.gz");

        let graph = MatchGraph::from_lists(3, vec![vec![0, 1], vec![], vec![2, 1, 0]]).unwrap();
        graph.save(&path).unwrap();

        let loaded = MatchGraph::load(&path, 3).unwrap();
        assert_eq!(loaded, graph);
    }

    #[test]
    fn test_load_enforces_callers_bound() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("matches.bin.gz");

        MatchGraph::from_lists(5, vec![vec![0, 1, 2, 3]]).unwrap().save(&path).unwrap();

        let err = MatchGraph::load(&path, 3).unwrap_err();
        assert!(matches!(err, StorageError::MatchLimitExceeded { .. }));
    }

    #[test]
    fn test_load_detects_corruption() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("matches.bin.gz");
        let mut encoder = create_gz(&path).unwrap();
        encoder.write_all(b"NOPE and some more bytes to pass the size").unwrap();
        finish_gz(encoder).unwrap();

        let err = MatchGraph::load(&path, 10).unwrap_err();
        assert!(matches!(err, StorageError::Corruption(_)));
    }
}
