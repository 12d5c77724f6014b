//! On-disk state for epgshift.
//!
//! Holds the channel offset store and the data directory areas for raw
//! snapshots, processed guides and run reports. Every file is replaced
//! atomically.

mod atomic;
mod layout;
mod offsets;
mod processed;
mod reports;
mod snapshots;

pub use layout::DataLayout;
#[allow(clippy::module_name_repetitions)]
pub use offsets::{OffsetMap, OffsetStore, StoreError};
pub use processed::{ProcessedArea, ProcessedOutput};
pub use reports::ReportArea;
pub use snapshots::{RawArea, Snapshot, SnapshotMeta};
