//! File-backed state store.
//!
//! States are fixed-size records: the state of historian ID `n` lives at
//! offset `(n - 1) * STATE_SIZE`. A slot whose ID field is zero is unused.

use crate::compression::state::{CompressionState, STATE_SIZE};
use crate::error::{ArchiveError, Result};
use crate::format::{le_i32, HistorianId};
use crate::store::StateStore;
use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Compression states stored in one file of fixed-size records.
#[derive(Debug)]
pub struct StateFile {
    path: PathBuf,
    file: Mutex<File>,
}

impl StateFile {
    /// Opens the state file at `path`, creating it if missing.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be opened or its length is not a
    /// whole number of records.
    pub fn open(path: &Path) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;
        let len = file.metadata()?.len();
        if len % STATE_SIZE as u64 != 0 {
            return Err(ArchiveError::Corrupt(format!(
                "state file {path:?} length {len} is not a multiple of {STATE_SIZE}"
            )));
        }
        debug!("Opened state file {:?} with {} slots", path, len / STATE_SIZE as u64);
        Ok(Self {
            path: path.to_path_buf(),
            file: Mutex::new(file),
        })
    }

    /// Path of the file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn offset(historian_id: HistorianId) -> Result<u64> {
        if historian_id <= 0 {
            return Err(ArchiveError::InvalidInput(format!(
                "historian ID {historian_id} must be positive"
            )));
        }
        Ok((historian_id as u64 - 1) * STATE_SIZE as u64)
    }
}

impl StateStore for StateFile {
    fn read(&self, historian_id: HistorianId) -> Result<Option<CompressionState>> {
        let offset = Self::offset(historian_id)?;
        let mut file = self.file.lock();
        if offset + STATE_SIZE as u64 > file.metadata()?.len() {
            return Ok(None);
        }
        file.seek(SeekFrom::Start(offset))?;
        let mut buf = [0u8; STATE_SIZE];
        file.read_exact(&mut buf)?;
        if le_i32(&buf[0..4]) != historian_id {
            return Ok(None);
        }
        Ok(Some(CompressionState::from_bytes(&buf)))
    }

    fn write(&self, state: CompressionState) -> Result<()> {
        let offset = Self::offset(state.historian_id)?;
        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(offset))?;
        state.write_to(&mut *file)?;
        Ok(())
    }

    fn ids(&self) -> Result<Vec<HistorianId>> {
        let mut file = self.file.lock();
        let mut data = Vec::new();
        file.seek(SeekFrom::Start(0))?;
        file.read_to_end(&mut data)?;
        Ok(data
            .chunks_exact(STATE_SIZE)
            .enumerate()
            .filter(|(slot, chunk)| le_i32(&chunk[0..4]) == *slot as i32 + 1)
            .map(|(slot, _)| slot as HistorianId + 1)
            .collect())
    }

    fn save(&self) -> Result<()> {
        let mut file = self.file.lock();
        file.flush()?;
        file.sync_data()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::point::PointRecord;
    use crate::format::{Quality, TimeTag};
    use tempfile::TempDir;

    #[test]
    fn test_states_survive_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("archive_state.dat");
        {
            let store = StateFile::open(&path).unwrap();
            let mut state = CompressionState::new(3);
            state.archived = PointRecord::new(
                3,
                TimeTag::from_millis(42_000).unwrap(),
                7.5,
                Quality::Good,
            );
            state.active_block_index = Some(12);
            store.write(state).unwrap();
            store.write(CompressionState::new(1)).unwrap();
            store.save().unwrap();
        }

        let store = StateFile::open(&path).unwrap();
        assert_eq!(store.ids().unwrap(), vec![1, 3]);
        assert!(store.read(2).unwrap().is_none());
        assert!(store.read(10).unwrap().is_none());

        let state = store.read(3).unwrap().unwrap();
        assert_eq!(state.archived.value, 7.5);
        assert_eq!(state.active_block_index, Some(12));
    }

    #[test]
    fn test_rejects_non_positive_id() {
        let dir = TempDir::new().unwrap();
        let store = StateFile::open(&dir.path().join("state.dat")).unwrap();
        assert!(store.read(0).is_err());
        assert!(store.write(CompressionState::new(-4)).is_err());
    }
}
