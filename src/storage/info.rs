//! Dataset summary (`info.json`)

use crate::storage::error::{StorageError, StorageResult};
use crate::storage::types::ChunkLayout;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Village count and chunk count recorded by the reindex stage
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct DatasetInfo {
    #[serde(rename = "Nvillage")]
    pub n_village: usize,
    #[serde(rename = "Nchunk")]
    pub n_chunk: usize,
}

impl DatasetInfo {
    pub fn new(n_village: usize, chunk_size: usize) -> Self {
        Self {
            n_village,
            n_chunk: ChunkLayout::new(chunk_size, n_village).chunk_count(),
        }
    }

    pub fn load(path: &Path) -> StorageResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| StorageError::file(path, e))?;
        Ok(serde_json::from_str(&content)?)
    }

    pub fn save(&self, path: &Path) -> StorageResult<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = serde_json::to_string(self)?;
        std::fs::write(path, content).map_err(|e| StorageError::file(path, e))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_chunk_count() {
        assert_eq!(DatasetInfo::new(594980, 20000).n_chunk, 30);
        assert_eq!(DatasetInfo::new(40000, 20000).n_chunk, 2);
        assert_eq!(DatasetInfo::new(0, 20000).n_chunk, 0);
    }

    #[test]
    fn test_json_field_names() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("info.json");
        DatasetInfo::new(25, 10).save(&path).unwrap();

        let raw = std::fs::read_to_string(&path).unwrap();
        assert_eq!(raw, r#"{"Nvillage":25,"Nchunk":3}"#);
        assert_eq!(DatasetInfo::load(&path).unwrap(), DatasetInfo::new(25, 10));
    }
}
