//! Identifier reindexer
//!
//! Streams the raw match file and assigns dense ids to village and darkspot
//! keys in first-seen order. The resulting id order depends only on the
//! order of the match file, so rerunning on the same file reproduces it.

use crate::pipeline::context::{Progress, RunContext};
use crate::pipeline::error::PipelineResult;
use crate::pipeline::matcher::MatchRecord;
use crate::storage::codec::open_gz;
use crate::storage::ids::save_counts;
use crate::storage::{DatasetInfo, EntityId, EntityKind, IdTable, MatchGraph};
use std::io::BufRead;
use std::path::Path;

/// Per-village match counts, `id,darkspots`
pub const VILLAGE_COUNTS_FILE: &str = "village_match_counts.csv.gz";

/// Per-darkspot match counts, `id,villages`
pub const DARKSPOT_COUNTS_FILE: &str = "darkspot_match_counts.csv.gz";

/// Match lines between progress reports
const PROGRESS_EVERY: usize = 10_000_000;

/// Accumulates id tables, adjacency lists and match counts
#[derive(Debug)]
pub struct Reindexer {
    villages: IdTable,
    darkspots: IdTable,
    graph: MatchGraph,
    village_counts: Vec<u64>,
    darkspot_counts: Vec<u64>,
}

/// Everything the reindexer produces
#[derive(Debug)]
pub struct ReindexOutput {
    pub villages: IdTable,
    pub darkspots: IdTable,
    pub graph: MatchGraph,
    pub village_counts: Vec<u64>,
    pub darkspot_counts: Vec<u64>,
}

impl Reindexer {
    pub fn new(max_match: usize) -> Self {
        Self {
            villages: IdTable::new(),
            darkspots: IdTable::new(),
            graph: MatchGraph::new(max_match),
            village_counts: Vec::new(),
            darkspot_counts: Vec::new(),
        }
    }

    /// Add one matched pair. Fails when the village exceeds `max_match`.
    pub fn ingest(&mut self, village_key: &str, darkspot_key: &str) -> PipelineResult<(EntityId, EntityId)> {
        let (vid, fresh_village) = self.villages.assign(village_key)?;
        let (did, fresh_darkspot) = self.darkspots.assign(darkspot_key)?;
        if fresh_village {
            self.village_counts.push(0);
        }
        if fresh_darkspot {
            self.darkspot_counts.push(0);
        }

        self.graph.push(vid, did)?;
        self.village_counts[vid as usize] += 1;
        self.darkspot_counts[did as usize] += 1;
        Ok((vid, did))
    }

    pub fn village_count(&self) -> usize {
        self.villages.len()
    }

    pub fn finish(self) -> ReindexOutput {
        ReindexOutput {
            villages: self.villages,
            darkspots: self.darkspots,
            graph: self.graph,
            village_counts: self.village_counts,
            darkspot_counts: self.darkspot_counts,
        }
    }
}

/// Feed every line of a raw match file into a reindexer
pub fn reindex_file(path: &Path, max_match: usize) -> PipelineResult<ReindexOutput> {
    let reader = open_gz(path)?;
    let mut reindexer = Reindexer::new(max_match);
    let progress = Progress::new("reindex lines", 0, PROGRESS_EVERY);

    for (n, line) in reader.lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let location = format!("{:?} line {}", path, n + 1);
        let record = MatchRecord::parse_line(&line, &location)?;
        reindexer.ingest(&record.village_key, &record.darkspot_key)?;
        progress.tick();
    }

    Ok(reindexer.finish())
}

/// Run the reindex stage and persist its outputs
pub fn run_reindex(ctx: &RunContext) -> PipelineResult<DatasetInfo> {
    let config = ctx.config();
    let input = ctx.match_raw_file();
    tracing::info!("Reindexing matches from {:?}", input);

    let output = reindex_file(&input, config.matching.max_match)?;
    tracing::info!(
        "{} villages, {} darkspots, {} matches",
        output.villages.len(),
        output.darkspots.len(),
        output.graph.total_matches()
    );

    output
        .villages
        .save(&ctx.index_file(EntityKind::Village), &EntityKind::Village.to_string())?;
    output
        .darkspots
        .save(&ctx.index_file(EntityKind::Darkspot), &EntityKind::Darkspot.to_string())?;

    tracing::info!("Writing match graph to {:?}", ctx.match_file());
    output.graph.save(&ctx.match_file())?;

    save_counts(&ctx.path(VILLAGE_COUNTS_FILE), "darkspots", &output.village_counts)?;
    save_counts(&ctx.path(DARKSPOT_COUNTS_FILE), "villages", &output.darkspot_counts)?;

    let info = DatasetInfo::new(output.graph.village_count(), config.layout.chunk_size);
    info.save(&ctx.info_file())?;
    tracing::info!("Nvillage = {}, Nchunk = {}", info.n_village, info.n_chunk);

    Ok(info)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::pipeline::error::PipelineError;
    use crate::storage::codec::{read_lines, write_lines};
    use crate::storage::StorageError;
    use tempfile::tempdir;

    #[test]
    fn test_first_seen_ids() {
        let mut r = Reindexer::new(10);
        assert_eq!(r.ingest("V9", "1:1").unwrap(), (0, 0));
        assert_eq!(r.ingest("V3", "2:2").unwrap(), (1, 1));
        assert_eq!(r.ingest("V9", "2:2").unwrap(), (0, 1));
        assert_eq!(r.ingest("V3", "3:3").unwrap(), (1, 2));

        let out = r.finish();
        assert_eq!(out.villages.keys(), &["V9".to_string(), "V3".to_string()]);
        assert_eq!(out.graph.matches(0), &[0, 1]);
        assert_eq!(out.graph.matches(1), &[1, 2]);
        assert_eq!(out.village_counts, vec![2, 2]);
        assert_eq!(out.darkspot_counts, vec![1, 2, 1]);
    }

    #[test]
    fn test_match_limit_is_fatal() {
        let mut r = Reindexer::new(2);
        r.ingest("V1", "a").unwrap();
        r.ingest("V1", "b").unwrap();
        let err = r.ingest("V1", "c").unwrap_err();
        assert!(matches!(
            err,
            PipelineError::Storage(StorageError::MatchLimitExceeded { village: 0, .. })
        ));
    }

    #[test]
    fn test_run_reindex_persists_everything() {
        let dir = tempdir().unwrap();
        let mut config = Config::default();
        config.paths.path = dir.path().to_path_buf();
        config.layout.chunk_size = 2;
        let ctx = RunContext::new(config);

        write_lines(
            ctx.match_raw_file(),
            &[
                "V1,1.00000000:1.00000000,1.0,1.0",
                "V2,1.00000000:1.00000000,1.1,1.0",
                "V3,2.00000000:2.00000000,2.0,2.0",
            ],
        )
        .unwrap();

        let info = run_reindex(&ctx).unwrap();
        assert_eq!(info, DatasetInfo { n_village: 3, n_chunk: 2 });
        assert_eq!(ctx.load_info().unwrap(), info);

        let villages = ctx.load_ids(EntityKind::Village).unwrap();
        assert_eq!(villages.get("V3"), Some(2));
        let darkspots = ctx.load_ids(EntityKind::Darkspot).unwrap();
        assert_eq!(darkspots.len(), 2);

        let graph = ctx.load_match_graph().unwrap();
        assert_eq!(graph.matches(1), &[0]);

        let counts = read_lines(ctx.path(DARKSPOT_COUNTS_FILE)).unwrap();
        assert_eq!(counts, vec!["id,villages", "0,2", "1,1"]);
    }

    #[test]
    fn test_malformed_line_is_fatal() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("match_raw.txt.gz");
        write_lines(&path, &["V1,1:1,1.0,1.0", "garbage"]).unwrap();
        assert!(matches!(
            reindex_file(&path, 10),
            Err(PipelineError::Input { .. })
        ));
    }
}
