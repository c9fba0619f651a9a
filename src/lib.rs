//! Incremental per-day rollups of game-client telemetry.
//!
//! Raw events are read from per-version collections, folded into an
//! in-memory accumulator table keyed by dimensions, day and metric name,
//! and persisted to a single aggregate collection.

pub mod agent;
pub mod config;
pub mod export;
pub mod rollup;
pub mod store;
