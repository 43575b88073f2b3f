//! staydb - A minimal embedded relational storage and query engine
//!
//! This crate provides:
//! - Typed table heaps with constraints and foreign keys
//! - Secondary indexes (single-column and composite)
//! - Date-range partitioning with pruning
//! - A query layer: predicates, joins, aggregation, window functions
//! - Snapshot-consistent scans over pluggable storage engines

pub mod engine;
pub mod error;
pub mod query;
pub mod schema;
pub mod storage;
pub mod types;
