//! Spatial matcher
//!
//! Pairs every village with the darkspots that lie inside a lat/lon box
//! centred on it and within a great-circle distance cap. Darkspots are held
//! in an R-tree; each village issues one envelope query and the candidates
//! are filtered by haversine distance.
//!
//! Output is `match_raw.txt.gz`, one line per pair:
//!
//! ```text
//! <village key>,<darkspot key>,<village lat>,<village lon>
//! ```
//!
//! Darkspot keys are the darkspot's coordinates formatted `lat:lon` with
//! eight decimals, which is also how the partition stage rebuilds them.

use crate::pipeline::context::{Progress, RunContext};
use crate::pipeline::error::{PipelineError, PipelineResult};
use crate::storage::codec::{create_gz, finish_gz, open_gz};
use rstar::{RTree, RTreeObject, AABB};
use std::io::Write;
use std::path::Path;

/// Mean Earth radius in metres
pub const EARTH_RADIUS_M: f64 = 6_371_000.0;

/// Villages between progress reports
const PROGRESS_EVERY: usize = 10_000;

/// Great-circle distance in metres between two points given in degrees
pub fn haversine_distance(a: Coordinate, b: Coordinate) -> f64 {
    let lat1 = a.lat.to_radians();
    let lat2 = b.lat.to_radians();
    let dlat = (b.lat - a.lat).to_radians();
    let dlon = (b.lon - a.lon).to_radians();

    let h = (dlat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (dlon / 2.0).sin().powi(2);
    2.0 * EARTH_RADIUS_M * h.sqrt().min(1.0).asin()
}

/// Canonical darkspot key
pub fn darkspot_key(lat: f64, lon: f64) -> String {
    format!("{:.8}:{:.8}", lat, lon)
}

/// Parse a darkspot key back into its coordinates
pub fn parse_darkspot_key(key: &str) -> Option<Coordinate> {
    let (lat, lon) = key.split_once(':')?;
    Some(Coordinate::new(lat.trim().parse().ok()?, lon.trim().parse().ok()?))
}

/// A point in degrees
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Coordinate {
    pub lat: f64,
    pub lon: f64,
}

impl Coordinate {
    pub fn new(lat: f64, lon: f64) -> Self {
        Self { lat, lon }
    }
}

/// Match window around each village
#[derive(Debug, Clone, Copy)]
pub struct Tolerance {
    pub lat: f64,
    pub lon: f64,
    pub max_distance_m: f64,
}

/// A darkspot stored in the R-tree
#[derive(Debug, Clone)]
struct DarkspotPoint {
    at: Coordinate,
    key: String,
}

impl RTreeObject for DarkspotPoint {
    type Envelope = AABB<[f64; 2]>;

    fn envelope(&self) -> Self::Envelope {
        AABB::from_point([self.at.lat, self.at.lon])
    }
}

/// R-tree over darkspot locations
pub struct SpatialIndex {
    tree: RTree<DarkspotPoint>,
}

impl SpatialIndex {
    /// Bulk-load darkspot coordinates; keys are derived from the coordinates
    pub fn build(darkspots: &[Coordinate]) -> Self {
        let points = darkspots
            .iter()
            .map(|&at| DarkspotPoint {
                at,
                key: darkspot_key(at.lat, at.lon),
            })
            .collect();
        Self {
            tree: RTree::bulk_load(points),
        }
    }

    pub fn len(&self) -> usize {
        self.tree.size()
    }

    pub fn is_empty(&self) -> bool {
        self.tree.size() == 0
    }

    /// Darkspots inside the box, before the distance filter
    pub fn candidates(&self, village: Coordinate, tol: &Tolerance) -> Vec<(&str, Coordinate)> {
        let envelope = AABB::from_corners(
            [village.lat - tol.lat, village.lon - tol.lon],
            [village.lat + tol.lat, village.lon + tol.lon],
        );
        self.tree
            .locate_in_envelope_intersecting(&envelope)
            .map(|p| (p.key.as_str(), p.at))
            .collect()
    }

    /// Darkspots inside the box and within the distance cap
    pub fn matches(&self, village: Coordinate, tol: &Tolerance) -> Vec<&str> {
        self.candidates(village, tol)
            .into_iter()
            .filter(|(_, at)| haversine_distance(village, *at) <= tol.max_distance_m)
            .map(|(key, _)| key)
            .collect()
    }
}

/// A village row from the info table
#[derive(Debug, Clone, PartialEq)]
pub struct Village {
    pub key: String,
    pub at: Coordinate,
}

fn parse_coordinate(field: Option<&str>, location: &str, name: &str) -> PipelineResult<f64> {
    let field = field.ok_or_else(|| PipelineError::input(location, format!("missing {} column", name)))?;
    field
        .trim()
        .parse()
        .map_err(|e| PipelineError::input(location, format!("bad {} {:?}: {}", name, field, e)))
}

fn csv_reader(path: &Path, has_headers: bool) -> PipelineResult<csv::Reader<impl std::io::Read>> {
    Ok(csv::ReaderBuilder::new()
        .has_headers(has_headers)
        .flexible(true)
        .from_reader(open_gz(path)?))
}

/// Read darkspot coordinates from a gzip CSV
pub fn read_coordinates(path: &Path, lat_ix: usize, lon_ix: usize, has_headers: bool) -> PipelineResult<Vec<Coordinate>> {
    let mut reader = csv_reader(path, has_headers)?;
    let mut out = Vec::new();
    for (row, record) in reader.records().enumerate() {
        let record = record?;
        let location = format!("{:?} row {}", path, row + 1);
        let lat = parse_coordinate(record.get(lat_ix), &location, "latitude")?;
        let lon = parse_coordinate(record.get(lon_ix), &location, "longitude")?;
        out.push(Coordinate::new(lat, lon));
    }
    Ok(out)
}

/// Read village keys and coordinates from a gzip CSV
pub fn read_villages(
    path: &Path,
    id_ix: usize,
    lat_ix: usize,
    lon_ix: usize,
    has_headers: bool,
) -> PipelineResult<Vec<Village>> {
    let mut reader = csv_reader(path, has_headers)?;
    let mut out = Vec::new();
    for (row, record) in reader.records().enumerate() {
        let record = record?;
        let location = format!("{:?} row {}", path, row + 1);
        let key = record
            .get(id_ix)
            .ok_or_else(|| PipelineError::input(&location, "missing village id column"))?
            .trim()
            .to_string();
        let lat = parse_coordinate(record.get(lat_ix), &location, "latitude")?;
        let lon = parse_coordinate(record.get(lon_ix), &location, "longitude")?;
        out.push(Village {
            key,
            at: Coordinate::new(lat, lon),
        });
    }
    Ok(out)
}

/// One line of the raw match file
#[derive(Debug, Clone, PartialEq)]
pub struct MatchRecord {
    pub village_key: String,
    pub darkspot_key: String,
    pub village: Coordinate,
}

impl MatchRecord {
    pub fn to_line(&self) -> String {
        format!(
            "{},{},{:.8},{:.8}",
            self.village_key, self.darkspot_key, self.village.lat, self.village.lon
        )
    }

    pub fn parse_line(line: &str, location: &str) -> PipelineResult<Self> {
        let fields: Vec<&str> = line.trim_end().split(',').collect();
        if fields.len() != 4 {
            return Err(PipelineError::input(
                location,
                format!("expected 4 fields, found {}", fields.len()),
            ));
        }
        let lat = parse_coordinate(Some(fields[2]), location, "latitude")?;
        let lon = parse_coordinate(Some(fields[3]), location, "longitude")?;
        Ok(Self {
            village_key: fields[0].to_string(),
            darkspot_key: fields[1].to_string(),
            village: Coordinate::new(lat, lon),
        })
    }
}

/// Counts reported by a match run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MatchSummary {
    pub villages: usize,
    pub darkspots: usize,
    pub pairs: usize,
    pub unmatched_villages: usize,
}

/// Match villages against darkspots and stream the pairs to `out`
pub fn write_matches(
    index: &SpatialIndex,
    villages: &[Village],
    tol: &Tolerance,
    out: &Path,
) -> PipelineResult<MatchSummary> {
    let mut writer = create_gz(out)?;
    let progress = Progress::new("match", villages.len(), PROGRESS_EVERY);
    let mut summary = MatchSummary {
        villages: villages.len(),
        darkspots: index.len(),
        ..Default::default()
    };

    for village in villages {
        let matched = index.matches(village.at, tol);
        if matched.is_empty() {
            summary.unmatched_villages += 1;
        }
        for key in matched {
            let record = MatchRecord {
                village_key: village.key.clone(),
                darkspot_key: key.to_string(),
                village: village.at,
            };
            writeln!(writer, "{}", record.to_line())?;
            summary.pairs += 1;
        }
        progress.tick();
    }

    finish_gz(writer)?;
    Ok(summary)
}

/// Run the matching stage with the context's configuration
pub fn run_match(ctx: &RunContext) -> PipelineResult<MatchSummary> {
    let config = ctx.config();
    let cols = &config.columns;

    let coords_file = ctx.path(&config.paths.darkspot_coords_file);
    let info_file = ctx.path(&config.paths.village_info_file);

    tracing::info!("Reading darkspot coordinates from {:?}", coords_file);
    let darkspots = read_coordinates(&coords_file, cols.coords_lat, cols.coords_lon, cols.coords_has_header)?;

    tracing::info!("Reading village coordinates from {:?}", info_file);
    let villages = read_villages(
        &info_file,
        cols.info_id,
        cols.info_lat,
        cols.info_lon,
        cols.coords_has_header,
    )?;

    let index = SpatialIndex::build(&darkspots);
    tracing::info!("Indexed {} darkspots; matching {} villages", index.len(), villages.len());

    let tol = Tolerance {
        lat: config.matching.lat_tol,
        lon: config.matching.lon_tol,
        max_distance_m: config.matching.max_distance_m,
    };
    let summary = write_matches(&index, &villages, &tol, &ctx.match_raw_file())?;

    tracing::info!(
        "Matched {} pairs; {} of {} villages have no darkspot",
        summary.pairs,
        summary.unmatched_villages,
        summary.villages
    );
    Ok(summary)
}
