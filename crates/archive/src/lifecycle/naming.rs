//! File naming for active, standby and historic archive files.

use crate::error::{ArchiveError, Result};
use crate::format::TimeTag;
use chrono::{NaiveDateTime, TimeZone, Utc};
use std::fs;
use std::path::{Path, PathBuf};

/// Extension of active and historic archive files.
pub const ARCHIVE_EXTENSION: &str = "d";

/// Extension of the pre-built standby file.
pub const STANDBY_EXTENSION: &str = "standby";

/// Timestamp layout embedded in historic file names, before escaping.
const NAME_TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.3f";

/// Replacement for `:` in file names.
const COLON_ESCAPE: char = '!';

/// Separator between the start and end time of a historic file name.
const RANGE_SEPARATOR: &str = "_to_";

/// Provides filesystem paths derived from the active archive file path.
///
/// For an active file `/data/archive.d`:
///
/// ```text
/// /data/archive.d                                                   active
/// /data/archive.standby                                             standby
/// /data/archive_2024-01-01 00!00!00.000_to_2024-01-08 00!00!00.000.d  historic
/// ```
#[derive(Debug, Clone)]
pub struct ArchiveLayout {
    active: PathBuf,
    directory: PathBuf,
    stem: String,
}

impl ArchiveLayout {
    /// Creates the layout of the active file at `active`.
    ///
    /// # Errors
    ///
    /// Returns `ArchiveError::InvalidInput` if `active` has no file stem or
    /// does not use the archive extension.
    pub fn new(active: &Path) -> Result<Self> {
        let stem = active
            .file_stem()
            .and_then(|stem| stem.to_str())
            .filter(|stem| !stem.is_empty())
            .ok_or_else(|| {
                ArchiveError::InvalidInput(format!("archive path {active:?} has no file name"))
            })?;
        if active.extension().and_then(|ext| ext.to_str()) != Some(ARCHIVE_EXTENSION) {
            return Err(ArchiveError::InvalidInput(format!(
                "archive path {active:?} must use the .{ARCHIVE_EXTENSION} extension"
            )));
        }
        let directory = match active.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };
        Ok(Self {
            active: active.to_path_buf(),
            directory,
            stem: stem.to_string(),
        })
    }

    /// Path of the active file.
    pub fn active_path(&self) -> &Path {
        &self.active
    }

    /// Directory holding the active file.
    pub fn directory(&self) -> &Path {
        &self.directory
    }

    /// File stem shared by all archive files.
    pub fn stem(&self) -> &str {
        &self.stem
    }

    /// Path of the standby file.
    pub fn standby_path(&self) -> PathBuf {
        self.directory
            .join(format!("{}.{}", self.stem, STANDBY_EXTENSION))
    }

    /// Builds a historic file name using
    /// `{stem}_{start}_to_{end}.d` with `:` escaped as `!`.
    pub fn historic_file_name(&self, start: TimeTag, end: TimeTag) -> String {
        format!(
            "{}_{}{}{}.{}",
            self.stem,
            encode_time(start),
            RANGE_SEPARATOR,
            encode_time(end),
            ARCHIVE_EXTENSION
        )
    }

    /// Path of the historic file covering `[start, end]` in the active
    /// directory.
    pub fn historic_path(&self, start: TimeTag, end: TimeTag) -> PathBuf {
        self.directory.join(self.historic_file_name(start, end))
    }

    /// Parses the time range embedded in a historic file name.
    pub fn parse_historic_name(&self, name: &str) -> Option<(TimeTag, TimeTag)> {
        let rest = name
            .strip_prefix(self.stem.as_str())?
            .strip_prefix('_')?
            .strip_suffix(ARCHIVE_EXTENSION)?
            .strip_suffix('.')?;
        let (start, end) = rest.split_once(RANGE_SEPARATOR)?;
        Some((decode_time(start)?, decode_time(end)?))
    }

    /// Lists historic files of this archive in `directory`.
    ///
    /// A missing directory yields an empty list.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be read.
    pub fn list_historic_files(&self, directory: &Path) -> Result<Vec<PathBuf>> {
        if !directory.exists() {
            return Ok(Vec::new());
        }
        let mut files = Vec::new();
        for entry in fs::read_dir(directory)? {
            let entry = entry?;
            let path = entry.path();
            if !path.is_file() {
                continue;
            }
            let Some(name) = path.file_name().and_then(|name| name.to_str()) else {
                continue;
            };
            if self.parse_historic_name(name).is_some() {
                files.push(path);
            }
        }
        files.sort();
        Ok(files)
    }
}

fn encode_time(time: TimeTag) -> String {
    time.to_datetime()
        .format(NAME_TIME_FORMAT)
        .to_string()
        .replace(':', &COLON_ESCAPE.to_string())
}

fn decode_time(text: &str) -> Option<TimeTag> {
    let text = text.replace(COLON_ESCAPE, ":");
    let naive = NaiveDateTime::parse_from_str(&text, NAME_TIME_FORMAT).ok()?;
    TimeTag::from_datetime(Utc.from_utc_datetime(&naive)).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn t(millis: i64) -> TimeTag {
        TimeTag::from_millis(millis).unwrap()
    }

    #[test]
    fn test_paths() {
        let layout = ArchiveLayout::new(Path::new("/data/plant_a.d")).unwrap();
        assert_eq!(layout.stem(), "plant_a");
        assert_eq!(layout.directory(), Path::new("/data"));
        assert_eq!(layout.standby_path(), PathBuf::from("/data/plant_a.standby"));
    }

    #[test]
    fn test_rejects_bad_paths() {
        assert!(ArchiveLayout::new(Path::new("/data/archive.dat")).is_err());
        assert!(ArchiveLayout::new(Path::new("/")).is_err());
    }

    #[test]
    fn test_historic_name_roundtrip() {
        let layout = ArchiveLayout::new(Path::new("plant_a.d")).unwrap();
        let start = t(86_400_123);
        let end = t(172_800_999);

        let name = layout.historic_file_name(start, end);
        assert_eq!(
            name,
            "plant_a_1995-01-02 00!00!00.123_to_1995-01-03 00!00!00.999.d"
        );
        assert!(!name.contains(':'));
        assert_eq!(layout.parse_historic_name(&name), Some((start, end)));
    }

    #[test]
    fn test_parse_rejects_foreign_names() {
        let layout = ArchiveLayout::new(Path::new("plant_a.d")).unwrap();
        assert!(layout.parse_historic_name("plant_a.d").is_none());
        assert!(layout.parse_historic_name("plant_b_1995-01-02 00!00!00.000_to_1995-01-03 00!00!00.000.d").is_none());
        assert!(layout.parse_historic_name("plant_a_garbage_to_more.d").is_none());
        assert!(layout.parse_historic_name("plant_a.standby").is_none());
    }

    #[test]
    fn test_list_historic_files() {
        let dir = TempDir::new().unwrap();
        let layout = ArchiveLayout::new(&dir.path().join("archive.d")).unwrap();
        let historic = layout.historic_path(t(0), t(1_000));
        fs::write(&historic, b"").unwrap();
        fs::write(layout.active_path(), b"").unwrap();
        fs::write(layout.standby_path(), b"").unwrap();

        assert_eq!(layout.list_historic_files(dir.path()).unwrap(), vec![historic]);
        assert!(layout
            .list_historic_files(&dir.path().join("missing"))
            .unwrap()
            .is_empty());
    }
}
