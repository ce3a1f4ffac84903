//! Run-scoped state shared by the workers of every stage
//!
//! `RunContext` owns the configuration, the stage completion record and one
//! semaphore per concurrent stage. Workers receive what they need from it at
//! spawn time; nothing in the pipeline is process-global.

use crate::config::Config;
use crate::pipeline::error::{PipelineError, PipelineResult};
use crate::storage::{
    ChunkLayout, DatasetInfo, EntityKind, IdTable, MatchGraph, PipelineStatus, Stage,
};
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

/// Concurrency limits, one semaphore per concurrent stage
#[derive(Debug, Clone)]
pub struct StageLimits {
    pub densify: Arc<Semaphore>,
    pub background: Arc<Semaphore>,
    pub subtract: Arc<Semaphore>,
    pub pivot: Arc<Semaphore>,
}

/// Everything one pipeline run shares across stages and workers
#[derive(Debug, Clone)]
pub struct RunContext {
    config: Arc<Config>,
    status: PipelineStatus,
    limits: StageLimits,
}

impl RunContext {
    pub fn new(config: Config) -> Self {
        let status = PipelineStatus::new(config.paths.path.clone());
        let limits = StageLimits {
            densify: Arc::new(Semaphore::new(config.workers.densify)),
            background: Arc::new(Semaphore::new(config.workers.background)),
            subtract: Arc::new(Semaphore::new(config.workers.subtract)),
            pivot: Arc::new(Semaphore::new(config.workers.pivot)),
        };

        Self {
            config: Arc::new(config),
            status,
            limits,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn shared_config(&self) -> Arc<Config> {
        Arc::clone(&self.config)
    }

    pub fn status(&self) -> &PipelineStatus {
        &self.status
    }

    pub fn limits(&self) -> &StageLimits {
        &self.limits
    }

    /// Resolve a configured file name against the working directory
    pub fn path(&self, name: &str) -> PathBuf {
        self.config.paths.resolve(name)
    }

    /// Root of the date-partitioned tree for an entity kind
    pub fn base_dir(&self, kind: EntityKind) -> PathBuf {
        match kind {
            EntityKind::Village => self.path(&self.config.paths.village_base_dir),
            EntityKind::Darkspot => self.path(&self.config.paths.darkspot_base_dir),
        }
    }

    /// Persisted id table for an entity kind
    pub fn index_file(&self, kind: EntityKind) -> PathBuf {
        match kind {
            EntityKind::Village => self.path(&self.config.paths.village_index_file),
            EntityKind::Darkspot => self.path(&self.config.paths.darkspot_index_file),
        }
    }

    pub fn ts_root(&self) -> PathBuf {
        self.path(&self.config.paths.ts_dir)
    }

    pub fn info_file(&self) -> PathBuf {
        self.path(&self.config.paths.info_file)
    }

    pub fn match_file(&self) -> PathBuf {
        self.path(&self.config.paths.match_file)
    }

    pub fn match_raw_file(&self) -> PathBuf {
        self.path(&self.config.paths.match_raw_file)
    }

    /// Fail unless `requires` has completed, used at the start of a stage
    pub fn require(&self, stage: Stage, requires: Stage) -> PipelineResult<()> {
        if self.status.is_done(requires) {
            Ok(())
        } else {
            Err(PipelineError::MissingPrerequisite {
                stage: stage.name(),
                requires: requires.name(),
            })
        }
    }

    pub fn load_info(&self) -> PipelineResult<DatasetInfo> {
        Ok(DatasetInfo::load(&self.info_file())?)
    }

    pub fn load_ids(&self, kind: EntityKind) -> PipelineResult<IdTable> {
        Ok(IdTable::load(&self.index_file(kind))?)
    }

    pub fn load_match_graph(&self) -> PipelineResult<MatchGraph> {
        Ok(MatchGraph::load(
            &self.match_file(),
            self.config.matching.max_match,
        )?)
    }

    /// Chunk layout of an id space of `entity_count` entities
    pub fn layout(&self, entity_count: usize) -> ChunkLayout {
        ChunkLayout::new(self.config.layout.chunk_size, entity_count)
    }

    /// Size of the dense id space of an entity kind
    pub fn entity_count(&self, kind: EntityKind) -> PipelineResult<usize> {
        match kind {
            EntityKind::Village => Ok(self.load_info()?.n_village),
            EntityKind::Darkspot => Ok(self.load_ids(EntityKind::Darkspot)?.len()),
        }
    }

    /// Open (truncating) the recoverable-error log of a stage
    pub fn stage_log(&self, stage: Stage) -> PipelineResult<StageLog> {
        Ok(StageLog::create(&self.config.paths.path, stage)?)
    }
}

/// Per-stage log of recoverable errors, shared by the stage's workers
#[derive(Debug, Clone)]
pub struct StageLog {
    stage: Stage,
    path: PathBuf,
    file: Arc<Mutex<BufWriter<File>>>,
    entries: Arc<AtomicUsize>,
}

impl StageLog {
    pub fn create(dir: &Path, stage: Stage) -> std::io::Result<Self> {
        std::fs::create_dir_all(dir)?;
        let path = dir.join(stage.log_file());
        let file = File::create(&path)?;
        Ok(Self {
            stage,
            path,
            file: Arc::new(Mutex::new(BufWriter::new(file))),
            entries: Arc::new(AtomicUsize::new(0)),
        })
    }

    /// Record a skipped unit of work
    pub fn record(&self, message: impl std::fmt::Display) {
        tracing::warn!(stage = %self.stage, "{}", message);
        self.entries.fetch_add(1, Ordering::Relaxed);

        match self.file.lock() {
            Ok(mut file) => {
                let line = format!("{} {}\n", chrono::Utc::now().to_rfc3339(), message);
                if let Err(e) = file.write_all(line.as_bytes()) {
                    tracing::error!("Failed to write stage log {:?}: {}", self.path, e);
                }
            }
            Err(e) => tracing::error!("Stage log lock poisoned: {}", e),
        }
    }

    /// Number of entries recorded so far
    pub fn entries(&self) -> usize {
        self.entries.load(Ordering::Relaxed)
    }

    pub fn flush(&self) -> std::io::Result<()> {
        match self.file.lock() {
            Ok(mut file) => file.flush(),
            Err(e) => Err(std::io::Error::new(std::io::ErrorKind::Other, e.to_string())),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Run blocking units of work on the blocking pool, never more at once than
/// the semaphore has permits. The permit is taken before a unit is spawned,
/// so the caller waits here while the stage is saturated.
///
/// Results come back in completion order. The first failing unit fails the
/// whole batch.
pub async fn run_bounded<T, F, I>(semaphore: Arc<Semaphore>, units: I) -> PipelineResult<Vec<T>>
where
    I: IntoIterator<Item = F>,
    F: FnOnce() -> PipelineResult<T> + Send + 'static,
    T: Send + 'static,
{
    let mut set = JoinSet::new();
    for unit in units {
        let permit = Arc::clone(&semaphore)
            .acquire_owned()
            .await
            .map_err(|e| PipelineError::Worker(e.to_string()))?;
        set.spawn_blocking(move || {
            let _permit = permit;
            unit()
        });
    }

    let mut results = Vec::with_capacity(set.len());
    while let Some(joined) = set.join_next().await {
        results.push(joined??);
    }
    Ok(results)
}

/// Console progress as a fraction of total work completed.
/// A total of zero means unknown; only the running count is reported.
#[derive(Debug)]
pub struct Progress {
    label: String,
    total: usize,
    every: usize,
    done: AtomicUsize,
}

impl Progress {
    pub fn new(label: impl Into<String>, total: usize, every: usize) -> Self {
        Self {
            label: label.into(),
            total,
            every: every.max(1),
            done: AtomicUsize::new(0),
        }
    }

    /// Count one finished unit; logs every `every` units and at the end
    pub fn tick(&self) -> usize {
        let done = self.done.fetch_add(1, Ordering::Relaxed) + 1;
        if self.total == 0 {
            if done % self.every == 0 {
                tracing::info!("{}: {}", self.label, done);
            }
        } else if done % self.every == 0 || done == self.total {
            tracing::info!("{}: {:.5} ({}/{})", self.label, self.fraction_of(done), done, self.total);
        }
        done
    }

    pub fn done(&self) -> usize {
        self.done.load(Ordering::Relaxed)
    }

    fn fraction_of(&self, done: usize) -> f64 {
        done as f64 / self.total as f64
    }
}
