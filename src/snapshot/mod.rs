//! Table Snapshot Module
//!
//! Point-in-time copies of source tables and the row diffs between them:
//! - version ledger (which capture is current, which is previous)
//! - snapshot engine (schema + batched row copy into the local store)
//! - diff engine (set differences reconciled by primary key)

pub mod diff;
pub mod engine;
pub mod value;
pub mod versions;

pub use diff::{Diff, DiffCell, DiffEngine, Row};
pub use engine::{SnapshotEngine, SnapshotOptions, DEFAULT_BATCH_SIZE};
pub use value::Value;
pub use versions::{snapshot_table, VersionId, VersionRecord, VersionStore};
