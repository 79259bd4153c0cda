//! File lifecycle: naming, the historic file index, and offload.

pub mod historic;
pub mod naming;
pub mod offload;

pub use historic::{HistoricFileInfo, HistoricIndex};
pub use naming::ArchiveLayout;
pub use offload::OffloadLocation;
