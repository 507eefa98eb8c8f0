//! Durable-storage plumbing: the partitioned block archive and the
//! double-buffered snapshot directory rotation.

pub mod archive;
pub mod snapshot;

pub use archive::{ArchiveError, BlockArchive};
pub use snapshot::{SnapshotError, SnapshotSlots};
