//! Alopex Archive - block-allocated time series archive files
//!
//! This crate stores per-series samples (value, time, quality) in fixed-size
//! archive files. Each file is a set of equally sized data blocks tracked by
//! an allocation table; each block belongs to one series and is append-only.
//! Samples pass through swinging-door compression before they are archived,
//! and full files roll over to historic files that remain readable.
//!
//! # Components
//!
//! - [`ArchiveFile`]: write pipeline, reads across files, rollover
//! - [`PointRecord`] / [`format::BlockPointer`]: binary record codecs
//! - [`format::AllocationTable`]: block allocation of one file
//! - [`CompressionEngine`]: per-series compression decisions
//! - [`store`]: collaborator traits for metadata, states and coordination
//!
//! # Example
//!
//! ```rust,ignore
//! use alopex_archive::store::{
//!     InMemoryCoordinationStore, InMemoryMetadataStore, InMemoryStateStore, MetadataRecord,
//! };
//! use alopex_archive::{ArchiveConfig, ArchiveFile, PointRecord, Quality, TimeTag};
//! use std::sync::Arc;
//!
//! let metadata = InMemoryMetadataStore::with_records([
//!     MetadataRecord::new(7, "boiler.temperature").with_compression_limit(0.5),
//! ]);
//! let archive = ArchiveFile::new(
//!     ArchiveConfig::new("/var/lib/plant/plant.d"),
//!     Arc::new(metadata),
//!     Arc::new(InMemoryStateStore::new()),
//!     Arc::new(InMemoryCoordinationStore::new()),
//! )?;
//! archive.open()?;
//!
//! archive.write(PointRecord::new(7, TimeTag::now(), 81.5, Quality::NotSet))?;
//! let recent: Vec<PointRecord> = archive.read_all(7)?.collect();
//!
//! archive.close()?;
//! ```

#![deny(missing_docs)]

pub mod archive;
pub mod compression;
pub mod error;
pub mod format;
pub mod lifecycle;
pub mod store;

pub use archive::{
    ArchiveConfig, ArchiveEvent, ArchiveFile, ArchiveReader, ArchiveStatistics, WriteOutcome,
};
pub use compression::{CompressionEngine, CompressionState};
pub use error::{ArchiveError, Result};
pub use format::handle::SyncMode;
pub use format::{HistorianId, PointRecord, Quality, TimeTag};
pub use lifecycle::OffloadLocation;
