//! Date keys and date-partitioned directories
//!
//! Dates live on disk as `<base>/<year>/<month>/<day>/`, zero-padded so
//! that lexical order of the paths is chronological order.

use crate::storage::error::{StorageError, StorageResult};
use chrono::{Datelike, NaiveDate};
use std::path::{Path, PathBuf};

/// A calendar day identifying one column of observations
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DateKey(NaiveDate);

impl DateKey {
    pub fn new(date: NaiveDate) -> Self {
        Self(date)
    }

    pub fn from_ymd(year: i32, month: u32, day: u32) -> StorageResult<Self> {
        NaiveDate::from_ymd_opt(year, month, day)
            .map(Self)
            .ok_or_else(|| StorageError::InvalidDate(format!("{}-{}-{}", year, month, day)))
    }

    /// Parse a raw `YYYY-MM-DD` field
    pub fn parse(s: &str) -> StorageResult<Self> {
        let s = s.trim();
        NaiveDate::parse_from_str(s, "%Y-%m-%d")
            .map(Self)
            .map_err(|e| StorageError::InvalidDate(format!("{:?}: {}", s, e)))
    }

    /// Recover the date from a `<base>/<year>/<month>/<day>` path
    pub fn from_dir(path: &Path) -> StorageResult<Self> {
        let parts: Vec<&str> = path
            .components()
            .rev()
            .take(3)
            .filter_map(|c| c.as_os_str().to_str())
            .collect();

        if parts.len() != 3 {
            return Err(StorageError::InvalidDate(format!("{:?}", path)));
        }

        let bad = || StorageError::InvalidDate(format!("{:?}", path));
        let day: u32 = parts[0].parse().map_err(|_| bad())?;
        let month: u32 = parts[1].parse().map_err(|_| bad())?;
        let year: i32 = parts[2].parse().map_err(|_| bad())?;
        Self::from_ymd(year, month, day)
    }

    pub fn date(&self) -> NaiveDate {
        self.0
    }

    /// Directory for this date under `base`
    pub fn dir_in(&self, base: &Path) -> PathBuf {
        base.join(format!("{:04}", self.0.year()))
            .join(format!("{:02}", self.0.month()))
            .join(format!("{:02}", self.0.day()))
    }
}

impl std::fmt::Display for DateKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0.format("%Y-%m-%d"))
    }
}

/// A date directory found on disk
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct DateDir {
    pub date: DateKey,
    pub path: PathBuf,
}

impl DateDir {
    pub fn new(base: &Path, date: DateKey) -> Self {
        Self {
            date,
            path: date.dir_in(base),
        }
    }
}

fn numeric_subdirs(dir: &Path) -> StorageResult<Vec<PathBuf>> {
    let mut out = Vec::new();
    for entry in std::fs::read_dir(dir).map_err(|e| StorageError::file(dir, e))? {
        let entry = entry?;
        let path = entry.path();
        let numeric = path
            .file_name()
            .and_then(|n| n.to_str())
            .map(|n| !n.is_empty() && n.bytes().all(|b| b.is_ascii_digit()))
            .unwrap_or(false);
        if numeric && entry.file_type()?.is_dir() {
            out.push(path);
        }
    }
    Ok(out)
}

/// Enumerate `<base>/<year>/<month>/<day>` directories in chronological order
///
/// With `required` set, only directories containing that file are returned.
/// A missing base directory yields an empty list.
pub fn discover_date_dirs(base: &Path, required: Option<&str>) -> StorageResult<Vec<DateDir>> {
    if !base.exists() {
        return Ok(Vec::new());
    }

    let mut dirs = Vec::new();
    for year in numeric_subdirs(base)? {
        for month in numeric_subdirs(&year)? {
            for day in numeric_subdirs(&month)? {
                if let Some(name) = required {
                    if !day.join(name).is_file() {
                        continue;
                    }
                }
                match DateKey::from_dir(&day) {
                    Ok(date) => dirs.push(DateDir { date, path: day }),
                    Err(e) => tracing::warn!("Skipping directory {:?}: {}", day, e),
                }
            }
        }
    }

    dirs.sort();
    Ok(dirs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_parse_and_display() {
        let date = DateKey::parse("1993-4-7").unwrap();
        assert_eq!(date.to_string(), "1993-04-07");
        assert!(DateKey::parse("1993-13-01").is_err());
        assert!(DateKey::parse("yesterday").is_err());
    }

    #[test]
    fn test_dir_round_trip() {
        let base = Path::new("/data/villages");
        let date = DateKey::from_ymd(2004, 2, 29).unwrap();
        let dir = date.dir_in(base);
        assert_eq!(dir, PathBuf::from("/data/villages/2004/02/29"));
        assert_eq!(DateKey::from_dir(&dir).unwrap(), date);
    }

    #[test]
    fn test_discover_sorted_and_filtered() {
        let dir = tempdir().unwrap();
        let base = dir.path();
        for (y, m, d) in [(2001, 12, 31), (2001, 2, 1), (2000, 6, 15)] {
            let date = DateKey::from_ymd(y, m, d).unwrap();
            let path = date.dir_in(base);
            std::fs::create_dir_all(&path).unwrap();
            std::fs::write(path.join("idvis.gz"), b"").unwrap();
        }
        // A date directory without the marker file and a stray directory
        std::fs::create_dir_all(DateKey::from_ymd(2002, 1, 1).unwrap().dir_in(base)).unwrap();
        std::fs::create_dir_all(base.join("notes")).unwrap();

        let all = discover_date_dirs(base, None).unwrap();
        assert_eq!(all.len(), 4);

        let found = discover_date_dirs(base, Some("idvis.gz")).unwrap();
        let dates: Vec<String> = found.iter().map(|d| d.date.to_string()).collect();
        assert_eq!(dates, vec!["2000-06-15", "2001-02-01", "2001-12-31"]);
    }

    #[test]
    fn test_discover_missing_base() {
        let dir = tempdir().unwrap();
        assert!(discover_date_dirs(&dir.path().join("absent"), None).unwrap().is_empty());
    }
}
