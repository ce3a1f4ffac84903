//! Pipeline stage completion record
//!
//! Each stage that finishes writes an empty `<stage>_done` marker in the
//! working directory. `PipelineStatus` is the single place that reads and
//! writes those markers; a missing marker means the stage (and everything
//! downstream of it) must be rerun.

use crate::storage::error::{StorageError, StorageResult};
use crate::storage::types::{EntityKind, ValueKind};
use std::path::{Path, PathBuf};

/// A pipeline stage, in execution order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    Match,
    Reindex,
    Partition(EntityKind),
    Densify(EntityKind),
    Background,
    Subtract,
    Pivot(ValueKind),
}

impl Stage {
    /// Every stage in the order a full run executes them
    pub fn ordered() -> Vec<Stage> {
        let mut stages = vec![
            Stage::Match,
            Stage::Reindex,
            Stage::Partition(EntityKind::Village),
            Stage::Partition(EntityKind::Darkspot),
            Stage::Densify(EntityKind::Village),
            Stage::Densify(EntityKind::Darkspot),
            Stage::Background,
            Stage::Subtract,
        ];
        stages.extend(ValueKind::all().iter().map(|&k| Stage::Pivot(k)));
        stages
    }

    /// Stable name, used for the marker and the stage log
    pub fn name(&self) -> String {
        match self {
            Stage::Match => "match".to_string(),
            Stage::Reindex => "reindex".to_string(),
            Stage::Partition(kind) => format!("partition_{}", kind.plural()),
            Stage::Densify(kind) => format!("densify_{}", kind.plural()),
            Stage::Background => "background".to_string(),
            Stage::Subtract => "subtract".to_string(),
            Stage::Pivot(kind) => format!("pivot_{}", kind.stem()),
        }
    }

    pub fn marker_file(&self) -> String {
        format!("{}_done", self.name())
    }

    pub fn log_file(&self) -> String {
        format!("{}.log", self.name())
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.name())
    }
}

/// Completion record for the stages of one working directory
#[derive(Debug, Clone)]
pub struct PipelineStatus {
    dir: PathBuf,
}

impl PipelineStatus {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn marker(&self, stage: Stage) -> PathBuf {
        self.dir.join(stage.marker_file())
    }

    pub fn is_done(&self, stage: Stage) -> bool {
        self.marker(stage).is_file()
    }

    /// Record that a stage finished successfully
    pub fn mark_done(&self, stage: Stage) -> StorageResult<()> {
        std::fs::create_dir_all(&self.dir)?;
        let path = self.marker(stage);
        std::fs::File::create(&path).map_err(|e| StorageError::file(&path, e))?;
        Ok(())
    }

    /// Forget a stage's completion, before rerunning it
    pub fn clear(&self, stage: Stage) -> StorageResult<()> {
        let path = self.marker(stage);
        match std::fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StorageError::file(&path, e)),
        }
    }

    /// `(stage, done)` for every stage, in execution order
    pub fn report(&self) -> Vec<(Stage, bool)> {
        Stage::ordered()
            .into_iter()
            .map(|s| (s, self.is_done(s)))
            .collect()
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_marker_names() {
        assert_eq!(Stage::Reindex.marker_file(), "reindex_done");
        assert_eq!(
            Stage::Densify(EntityKind::Village).marker_file(),
            "densify_villages_done"
        );
        assert_eq!(Stage::Pivot(ValueKind::Adjusted).log_file(), "pivot_vis_adjusted.log");
    }

    #[test]
    fn test_mark_and_clear() {
        let dir = tempdir().unwrap();
        let status = PipelineStatus::new(dir.path());

        assert!(!status.is_done(Stage::Match));
        status.mark_done(Stage::Match).unwrap();
        assert!(status.is_done(Stage::Match));
        assert!(dir.path().join("match_done").is_file());

        status.clear(Stage::Match).unwrap();
        assert!(!status.is_done(Stage::Match));
        // Clearing twice is fine
        status.clear(Stage::Match).unwrap();
    }

    #[test]
    fn test_report_order() {
        let dir = tempdir().unwrap();
        let status = PipelineStatus::new(dir.path());
        status.mark_done(Stage::Reindex).unwrap();

        let report = status.report();
        assert_eq!(report[0], (Stage::Match, false));
        assert_eq!(report[1], (Stage::Reindex, true));
        assert_eq!(report.len(), 8 + ValueKind::all().len());
    }
}
