//! Dense id tables
//!
//! Maps source entity keys (village identifiers, `lat:lon` darkspot keys)
//! to contiguous ids `0, 1, 2, ...` assigned in first-seen order.
//!
//! Persisted as a gzipped two-column CSV:
//!
//! ```text
//! id,village
//! 0,V-102934
//! 1,V-000017
//! ```

use crate::storage::codec::{create_gz, finish_gz, open_gz};
use crate::storage::error::{StorageError, StorageResult};
use std::collections::HashMap;
use std::path::Path;

/// Dense entity id
pub type EntityId = u32;

/// Key to dense id table with first-seen assignment
#[derive(Debug, Default, Clone)]
pub struct IdTable {
    /// Keys indexed by id
    keys: Vec<String>,
    /// Key to id lookup
    index: HashMap<String, EntityId>,
}

impl IdTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up a key, assigning the next unused id when it is new.
    /// Returns the id and whether it was freshly assigned.
    pub fn assign(&mut self, key: &str) -> StorageResult<(EntityId, bool)> {
        if let Some(&id) = self.index.get(key) {
            return Ok((id, false));
        }

        let id = EntityId::try_from(self.keys.len()).map_err(|_| StorageError::IdOutOfRange {
            id: self.keys.len() as i64,
            count: EntityId::MAX as usize,
        })?;
        self.keys.push(key.to_string());
        self.index.insert(key.to_string(), id);
        Ok((id, true))
    }

    pub fn get(&self, key: &str) -> Option<EntityId> {
        self.index.get(key).copied()
    }

    pub fn key(&self, id: EntityId) -> Option<&str> {
        self.keys.get(id as usize).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// Keys in id order
    pub fn keys(&self) -> &[String] {
        &self.keys
    }

    /// Save as `id,<title>` CSV, sorted by id
    pub fn save(&self, path: &Path, title: &str) -> StorageResult<()> {
        let mut writer = csv::Writer::from_writer(create_gz(path)?);
        writer.write_record(["id", title])?;
        for (id, key) in self.keys.iter().enumerate() {
            writer.write_record([id.to_string().as_str(), key.as_str()])?;
        }
        let encoder = writer
            .into_inner()
            .map_err(|e| StorageError::Io(e.into_error()))?;
        finish_gz(encoder)
    }

    /// Load a table written by `save`.
    ///
    /// The id column must run `0, 1, 2, ...` without gaps; anything else
    /// means the file does not describe a dense id space.
    pub fn load(path: &Path) -> StorageResult<Self> {
        let mut reader = csv::ReaderBuilder::new()
            .has_headers(true)
            .from_reader(open_gz(path)?);

        let mut table = Self::new();
        for (row, record) in reader.records().enumerate() {
            let record = record?;
            let location = format!("{:?} row {}", path, row + 2);

            let id: usize = record
                .get(0)
                .ok_or_else(|| StorageError::parse(&location, "missing id column"))?
                .trim()
                .parse()
                .map_err(|e| StorageError::parse(&location, e))?;
            let key = record
                .get(1)
                .ok_or_else(|| StorageError::parse(&location, "missing key column"))?;

            if id != row {
                return Err(StorageError::Corruption(format!(
                    "{}: id {} where {} was expected",
                    location, id, row
                )));
            }

            let (_, fresh) = table.assign(key)?;
            if !fresh {
                return Err(StorageError::Corruption(format!(
                    "{}: duplicate key {:?}",
                    location, key
                )));
            }
        }

        Ok(table)
    }
}

/// Save per-entity counts as `id,<title>` CSV (diagnostics)
pub fn save_counts(path: &Path, title: &str, counts: &[u64]) -> StorageResult<()> {
    let mut writer = csv::Writer::from_writer(create_gz(path)?);
    writer.write_record(["id", title])?;
    for (id, count) in counts.iter().enumerate() {
        writer.write_record([id.to_string(), count.to_string()])?;
    }
    let encoder = writer
        .into_inner()
        .map_err(|e| StorageError::Io(e.into_error()))?;
    finish_gz(encoder)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_first_seen_assignment() {
        let mut table = IdTable::new();
        assert_eq!(table.assign("b").unwrap(), (0, true));
        assert_eq!(table.assign("a").unwrap(), (1, true));
        assert_eq!(table.assign("b").unwrap(), (0, false));
        assert_eq!(table.assign("c").unwrap(), (2, true));

        assert_eq!(table.len(), 3);
        assert_eq!(table.get("a"), Some(1));
        assert_eq!(table.key(2), Some("c"));
        assert_eq!(table.get("z"), None);
    }

    #[test]
    fn test_ids_are_dense() {
        let mut table = IdTable::new();
        for key in ["x", "y", "x", "z", "y", "w"] {
            table.assign(key).unwrap();
        }
        let mut ids: Vec<EntityId> = table.keys().iter().map(|k| table.get(k).unwrap()).collect();
        ids.sort_unstable();
        assert_eq!(ids, (0..table.len() as EntityId).collect::<Vec<_>>());
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("darkspots.csv.gz");

        let mut table = IdTable::new();
        table.assign("21.50000000:78.25000000").unwrap();
        table.assign("21.51000000:78.25000000").unwrap();
        table.save(&path, "darkspot").unwrap();

        let loaded = IdTable::load(&path).unwrap();
        assert_eq!(loaded.keys(), table.keys());
        assert_eq!(loaded.get("21.51000000:78.25000000"), Some(1));
    }

    #[test]
    fn test_load_rejects_gaps() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("villages.csv.gz");
        crate::storage::codec::write_lines(&path, &["id,village", "0,a", "2,b"]).unwrap();

        let err = IdTable::load(&path).unwrap_err();
        assert!(matches!(err, StorageError::Corruption(_)));
    }

    #[test]
    fn test_save_counts() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("village_match_counts.csv.gz");
        save_counts(&path, "darkspots", &[3, 0, 7]).unwrap();
        let lines = crate::storage::codec::read_lines(&path).unwrap();
        assert_eq!(lines, vec!["id,darkspots", "0,3", "1,0", "2,7"]);
    }
}
