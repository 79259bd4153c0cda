//! Offload of historic files to secondary storage.

use crate::error::{ArchiveError, Result};
use crate::format::TimeTag;
use crate::lifecycle::historic::{HistoricFileInfo, HistoricIndex};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, error, info};

/// Where offloaded historic files go.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum OffloadLocation {
    /// Offload is disabled.
    #[default]
    None,
    /// Move files into this directory.
    Directory(PathBuf),
    /// Delete files instead of moving them.
    Delete,
}

impl OffloadLocation {
    /// Parses a configured location. An empty string disables offload and
    /// `*DELETE*` selects deletion.
    pub fn parse(location: &str) -> Self {
        match location.trim() {
            "" => Self::None,
            "*DELETE*" => Self::Delete,
            path => Self::Directory(PathBuf::from(path)),
        }
    }

    /// Returns true unless offload is disabled.
    pub fn is_enabled(&self) -> bool {
        !matches!(self, Self::None)
    }

    /// Offload directory, if files are moved.
    pub fn directory(&self) -> Option<&Path> {
        match self {
            Self::Directory(path) => Some(path),
            _ => None,
        }
    }
}

/// Result of one offload pass.
#[derive(Debug, Default)]
pub struct OffloadReport {
    /// Files moved or deleted.
    pub completed: usize,
    /// Files that could not be processed, with the cause.
    pub failures: Vec<(PathBuf, ArchiveError)>,
}

/// Returns true if `info` started more than `max_age` before `now`.
pub fn is_expired(info: &HistoricFileInfo, max_age: Duration, now: TimeTag) -> bool {
    info.start_time < now.saturating_sub(max_age)
}

/// Returns true if free space on the volume holding `directory` is below
/// `total * (1 - threshold / 100)`.
///
/// # Errors
///
/// Returns an error if the volume cannot be queried.
pub fn needs_space(directory: &Path, threshold: f64) -> Result<bool> {
    let available = fs3::available_space(directory)?;
    let total = fs3::total_space(directory)?;
    Ok((available as f64) < total as f64 * (1.0 - threshold / 100.0))
}

/// Historic files in `directory` that started more than `max_age` ago,
/// oldest first.
pub fn expired_files(
    index: &HistoricIndex,
    directory: &Path,
    max_age: Duration,
    now: TimeTag,
) -> Vec<HistoricFileInfo> {
    index
        .files()
        .into_iter()
        .filter(|info| info.is_in(directory) && is_expired(info, max_age, now))
        .collect()
}

/// The `count` oldest historic files in `directory`.
pub fn oldest_files(index: &HistoricIndex, directory: &Path, count: usize) -> Vec<HistoricFileInfo> {
    index
        .files()
        .into_iter()
        .filter(|info| info.is_in(directory))
        .take(count)
        .collect()
}

/// Historic files beyond the newest `max_files`, oldest first.
pub fn surplus_files(index: &HistoricIndex, max_files: usize) -> Vec<HistoricFileInfo> {
    let files = index.files();
    let surplus = files.len().saturating_sub(max_files);
    files.into_iter().take(surplus).collect()
}

/// Deletes `files` and drops them from `index`.
pub fn delete_files(index: &HistoricIndex, files: &[HistoricFileInfo]) -> OffloadReport {
    let mut report = OffloadReport::default();
    for file in files {
        match remove_if_exists(&file.path) {
            Ok(()) => {
                index.remove(&file.path);
                report.completed += 1;
                debug!("Deleted historic file {:?}", file.path);
            }
            Err(err) => {
                error!("Failed to delete historic file {:?}: {}", file.path, err);
                report.failures.push((file.path.clone(), err));
            }
        }
    }
    report
}

/// Moves or deletes `files` according to `location`, keeping `index`
/// current. `progress` is called after each file with the number of files
/// processed, the total, and the file.
pub fn offload_files(
    index: &HistoricIndex,
    files: &[HistoricFileInfo],
    location: &OffloadLocation,
    mut progress: impl FnMut(usize, usize, &Path),
) -> OffloadReport {
    let mut report = OffloadReport::default();
    let total = files.len();

    for (done, file) in files.iter().enumerate() {
        let result = match location {
            OffloadLocation::None => Ok(None),
            OffloadLocation::Delete => remove_if_exists(&file.path).map(|()| None),
            OffloadLocation::Directory(target) => offload_to(&file.path, target).map(Some),
        };
        match result {
            Ok(destination) => {
                index.remove(&file.path);
                if let Some(destination) = destination {
                    index.insert(HistoricFileInfo::new(
                        destination,
                        file.start_time,
                        file.end_time,
                    ));
                }
                report.completed += 1;
            }
            Err(err) => {
                error!("Failed to offload historic file {:?}: {}", file.path, err);
                report.failures.push((file.path.clone(), err));
            }
        }
        progress(done + 1, total, &file.path);
    }

    if total > 0 {
        info!(
            "Offloaded {} of {} historic files ({} failed)",
            report.completed,
            total,
            report.failures.len()
        );
    }
    report
}

fn offload_to(source: &Path, target: &Path) -> Result<PathBuf> {
    let name = source.file_name().ok_or_else(|| {
        ArchiveError::InvalidInput(format!("historic path {source:?} has no file name"))
    })?;
    fs::create_dir_all(target)?;
    let destination = target.join(name);
    remove_if_exists(&destination)?;
    move_file(source, &destination)?;
    Ok(destination)
}

/// Renames `source` to `destination`, copying across volumes.
///
/// # Errors
///
/// Returns an error if neither rename nor copy succeeds.
pub fn move_file(source: &Path, destination: &Path) -> Result<()> {
    if fs::rename(source, destination).is_ok() {
        return Ok(());
    }
    fs::copy(source, destination)?;
    fs::remove_file(source)?;
    Ok(())
}

fn remove_if_exists(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err.into()),
    }
}
