//! In-memory collaborator stores.

use crate::compression::state::CompressionState;
use crate::error::Result;
use crate::format::HistorianId;
use crate::store::{
    CoordinationRecord, CoordinationStore, MetadataRecord, MetadataStore, StateStore,
};
use parking_lot::RwLock;
use std::collections::BTreeMap;

/// Metadata kept in a map.
#[derive(Debug, Default)]
pub struct InMemoryMetadataStore {
    records: RwLock<BTreeMap<HistorianId, MetadataRecord>>,
}

impl InMemoryMetadataStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a store holding `records`.
    pub fn with_records(records: impl IntoIterator<Item = MetadataRecord>) -> Self {
        let store = Self::new();
        {
            let mut map = store.records.write();
            for record in records {
                map.insert(record.historian_id, record);
            }
        }
        store
    }

    /// Number of records.
    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    /// Returns true when no record is stored.
    pub fn is_empty(&self) -> bool {
        self.records.read().is_empty()
    }
}

impl MetadataStore for InMemoryMetadataStore {
    fn read(&self, historian_id: HistorianId) -> Result<Option<MetadataRecord>> {
        Ok(self.records.read().get(&historian_id).cloned())
    }

    fn write(&self, record: MetadataRecord) -> Result<()> {
        self.records.write().insert(record.historian_id, record);
        Ok(())
    }
}

/// Compression states kept in a map.
#[derive(Debug, Default)]
pub struct InMemoryStateStore {
    states: RwLock<BTreeMap<HistorianId, CompressionState>>,
}

impl InMemoryStateStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

impl StateStore for InMemoryStateStore {
    fn read(&self, historian_id: HistorianId) -> Result<Option<CompressionState>> {
        Ok(self.states.read().get(&historian_id).copied())
    }

    fn write(&self, state: CompressionState) -> Result<()> {
        self.states.write().insert(state.historian_id, state);
        Ok(())
    }

    fn ids(&self) -> Result<Vec<HistorianId>> {
        Ok(self.states.read().keys().copied().collect())
    }
}

/// Coordination record kept in memory.
#[derive(Debug, Default)]
pub struct InMemoryCoordinationStore {
    record: RwLock<CoordinationRecord>,
}

impl InMemoryCoordinationStore {
    /// Creates a store holding the default record.
    pub fn new() -> Self {
        Self::default()
    }
}

impl CoordinationStore for InMemoryCoordinationStore {
    fn read(&self) -> Result<CoordinationRecord> {
        Ok(*self.record.read())
    }

    fn write(&self, record: CoordinationRecord) -> Result<()> {
        *self.record.write() = record;
        Ok(())
    }
}
