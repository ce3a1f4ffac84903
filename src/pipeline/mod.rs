//! Pipeline stages
//!
//! - **matcher**: spatial join of villages and darkspots
//! - **match_stats**: offset histogram of the raw matches
//! - **reindex**: dense ids, match graph, dataset info
//! - **rewriter**: partition raw rows by date, densify into chunk files
//! - **background**: trimmed statistics of matched darkspots
//! - **subtract**: observed minus background
//! - **pivot**: per-date chunk files to per-entity series
//! - **verify**: spot checks against the sources
//!
//! `Pipeline` runs stages in dependency order and records completion
//! through `PipelineStatus` markers.

pub mod background;
pub mod context;
pub mod error;
pub mod match_stats;
pub mod matcher;
pub mod pivot;
pub mod reindex;
pub mod rewriter;
pub mod subtract;
pub mod verify;

pub use context::{run_bounded, Progress, RunContext, StageLog};
pub use error::{PipelineError, PipelineResult};

use crate::config::Config;
use crate::storage::{EntityKind, Stage, ValueKind};
use std::time::Instant;

/// Stages that must have completed before `stage` can run
pub fn prerequisites(stage: Stage) -> Vec<Stage> {
    match stage {
        Stage::Match => vec![],
        Stage::Reindex => vec![Stage::Match],
        Stage::Partition(_) => vec![Stage::Reindex],
        Stage::Densify(kind) => vec![Stage::Partition(kind)],
        Stage::Background => vec![
            Stage::Densify(EntityKind::Darkspot),
            Stage::Partition(EntityKind::Village),
        ],
        Stage::Subtract => vec![Stage::Background, Stage::Densify(EntityKind::Village)],
        Stage::Pivot(ValueKind::Observed) => vec![Stage::Densify(EntityKind::Village)],
        Stage::Pivot(ValueKind::Adjusted) => vec![Stage::Subtract],
        Stage::Pivot(_) => vec![Stage::Background],
    }
}

/// Runs pipeline stages against one working directory
#[derive(Debug, Clone)]
pub struct Pipeline {
    ctx: RunContext,
}

impl Pipeline {
    pub fn new(config: Config) -> Self {
        Self {
            ctx: RunContext::new(config),
        }
    }

    pub fn context(&self) -> &RunContext {
        &self.ctx
    }

    /// Run one stage.
    ///
    /// A stage whose marker exists is skipped unless `force` is set.
    /// Returns whether the stage actually ran.
    pub async fn run_stage(&self, stage: Stage, force: bool) -> PipelineResult<bool> {
        let status = self.ctx.status();
        if status.is_done(stage) && !force {
            tracing::info!("Stage {} already done, skipping", stage);
            return Ok(false);
        }
        for requires in prerequisites(stage) {
            self.ctx.require(stage, requires)?;
        }

        status.clear(stage)?;
        tracing::info!("Starting stage {}", stage);
        let started = Instant::now();

        self.execute(stage).await?;

        status.mark_done(stage)?;
        tracing::info!("Stage {} done in {:.1}s", stage, started.elapsed().as_secs_f64());
        Ok(true)
    }

    async fn execute(&self, stage: Stage) -> PipelineResult<()> {
        match stage {
            Stage::Match => {
                let ctx = self.ctx.clone();
                tokio::task::spawn_blocking(move || matcher::run_match(&ctx)).await??;
            }
            Stage::Reindex => {
                let ctx = self.ctx.clone();
                tokio::task::spawn_blocking(move || reindex::run_reindex(&ctx)).await??;
            }
            Stage::Partition(kind) => {
                let ctx = self.ctx.clone();
                tokio::task::spawn_blocking(move || rewriter::run_partition(&ctx, kind)).await??;
            }
            Stage::Densify(kind) => {
                rewriter::run_densify(&self.ctx, kind).await?;
            }
            Stage::Background => {
                background::run_background(&self.ctx).await?;
            }
            Stage::Subtract => {
                subtract::run_subtract(&self.ctx).await?;
            }
            Stage::Pivot(kind) => {
                pivot::run_pivot(&self.ctx, kind).await?;
            }
        }
        Ok(())
    }

    /// Run every stage in order; returns how many stages ran
    pub async fn run_all(&self, force: bool) -> PipelineResult<usize> {
        let mut ran = 0;
        for stage in Stage::ordered() {
            if self.run_stage(stage, force).await? {
                ran += 1;
            }
        }
        Ok(ran)
    }

    /// Offset histogram of the raw match file
    pub async fn match_stats(&self) -> PipelineResult<match_stats::MatchStats> {
        if !self.ctx.status().is_done(Stage::Match) {
            return Err(PipelineError::MissingPrerequisite {
                stage: "match-stats".to_string(),
                requires: Stage::Match.name(),
            });
        }
        let ctx = self.ctx.clone();
        tokio::task::spawn_blocking(move || match_stats::run_match_stats(&ctx)).await?
    }

    /// Spot-check stored arrays against their sources
    pub async fn verify(&self, samples: usize) -> PipelineResult<verify::VerifyReport> {
        for requires in prerequisites(Stage::Pivot(ValueKind::Observed)) {
            self.ctx.require(Stage::Pivot(ValueKind::Observed), requires)?;
        }
        let ctx = self.ctx.clone();
        tokio::task::spawn_blocking(move || verify::run_verify(&ctx, samples)).await?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::codec::write_lines;
    use crate::storage::{read_chunk, DateKey, TimeSeriesReader};
    use tempfile::tempdir;

    /// Two villages, three darkspots, two dates, end to end
    fn write_inputs(dir: &std::path::Path) {
        write_lines(
            dir.join("darkspot_latlon.csv.gz"),
            &["10.00,20.00", "10.02,20.01", "10.50,20.50"],
        )
        .unwrap();
        write_lines(
            dir.join("village_info.csv.gz"),
            &["x,x,x,VA,10.01,20.00", "x,x,x,VB,10.50,20.51"],
        )
        .unwrap();
        write_lines(
            dir.join("darkspots_raw.csv.gz"),
            &[
                "2004-05-01,10.00,20.00,1.0",
                "2004-05-01,10.02,20.01,3.0",
                "2004-05-01,10.50,20.50,6.0",
                "2004-05-02,10.00,20.00,2.0",
                "2004-05-02,10.50,20.50,4.0",
                "2004-05-02,55.00,55.00,9.0",
            ],
        )
        .unwrap();
        write_lines(
            dir.join("villages_raw.csv.gz"),
            &[
                "VA,2004-05-01,10.0",
                "VB,2004-05-01,8.0",
                "VA,2004-05-02,5.0",
                "VZ,2004-05-02,1.0",
            ],
        )
        .unwrap();
    }

    fn pipeline(dir: &std::path::Path) -> Pipeline {
        let mut config = Config::default();
        config.paths.path = dir.to_path_buf();
        config.layout.chunk_size = 1;
        config.background.lower = 0.0;
        config.background.upper = 1.0;
        config.workers.background = 2;
        Pipeline::new(config)
    }

    #[test]
    fn test_prerequisites() {
        assert!(prerequisites(Stage::Match).is_empty());
        assert_eq!(prerequisites(Stage::Pivot(ValueKind::Adjusted)), vec![Stage::Subtract]);
        assert_eq!(prerequisites(Stage::Pivot(ValueKind::Bsd)), vec![Stage::Background]);
    }

    #[tokio::test]
    async fn test_stage_out_of_order_fails() {
        let dir = tempdir().unwrap();
        let p = pipeline(dir.path());
        let err = p.run_stage(Stage::Reindex, false).await.unwrap_err();
        assert!(matches!(err, PipelineError::MissingPrerequisite { .. }));
    }

    #[tokio::test]
    async fn test_full_run() {
        let dir = tempdir().unwrap();
        write_inputs(dir.path());
        let p = pipeline(dir.path());

        assert_eq!(p.run_all(false).await.unwrap(), Stage::ordered().len());
        // Everything is marked done now
        assert_eq!(p.run_all(false).await.unwrap(), 0);

        let ctx = p.context();
        let info = ctx.load_info().unwrap();
        assert_eq!(info.n_village, 2);
        assert_eq!(info.n_chunk, 2);

        // VA matches the two darkspots near (10, 20); VB the one at (10.5, 20.5)
        let graph = ctx.load_match_graph().unwrap();
        assert_eq!(graph.matches(0).len(), 2);
        assert_eq!(graph.matches(1).len(), 1);

        let base = ctx.base_dir(EntityKind::Village);
        let day1 = DateKey::from_ymd(2004, 5, 1).unwrap().dir_in(&base);
        assert_eq!(read_chunk(&day1, ValueKind::Background, 0).unwrap(), vec![2.0]);
        assert_eq!(read_chunk(&day1, ValueKind::Adjusted, 0).unwrap(), vec![8.0]);
        assert_eq!(read_chunk(&day1, ValueKind::Adjusted, 1).unwrap(), vec![2.0]);

        let layout = ctx.layout(info.n_village);
        let series = TimeSeriesReader::open(&ctx.ts_root(), ValueKind::Adjusted, layout).unwrap();
        // VA on day 2: 5 - mean(2) = 3
        assert_eq!(series.series(0).unwrap(), vec![8.0, 3.0]);
        let vb = series.series(1).unwrap();
        assert_eq!(vb[0], 2.0);
        assert!(vb[1].is_nan());

        let report = p.verify(5).await.unwrap();
        assert!(report.raw_checked >= 1);
        assert!(report.series_checked >= 1);

        let stats = p.match_stats().await.unwrap();
        assert_eq!(stats.pairs, 3);
    }
}
