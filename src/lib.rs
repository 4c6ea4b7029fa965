//! TableSnap - table snapshots and row-level diffs
//!
//! Captures full copies of source tables into a local SQLite store, one
//! version per capture, and reports rows added, deleted and modified between
//! the two newest captures of a table.

pub mod cli;
pub mod config;
pub mod error;
pub mod introspection;
pub mod models;
pub mod routes;
pub mod snapshot;
pub mod source;
pub mod state;
pub mod store;
pub mod type_mapper;

pub use error::{AppError, AppResult};
pub use snapshot::{Diff, DiffCell, SnapshotEngine, SnapshotOptions};
