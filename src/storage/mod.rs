//! Log-facing storage types
//!
//! The resource manager does not own the log; this module holds the batch
//! model shared with the consensus layer and the snapshot file manager
//! used for offloaded abort segments and local state snapshots.

pub mod record;
pub mod snapshot;

pub use record::{
    BatchHeader, BatchKind, ControlRecordKind, Record, RecordBatch, ATTR_CONTROL_BIT,
    ATTR_TRANSACTIONAL_BIT, CONTROL_TYPE_ABORT, CONTROL_TYPE_COMMIT,
};
pub use snapshot::SnapshotManager;
