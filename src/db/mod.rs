//! State store: durable record of every event mirrored onto the calendars.
//!
//! This module is split into two submodules:
//! - `model`: view models returned by read-only queries.
//! - `repo`: SQL functions over the `sync_records` and `sync_runs` tables.
//!
//! Callers import from `calsync::db`; the repository API is re-exported here.

pub mod model;
pub mod repo;

pub use repo::*;

pub use model::RunRow;
