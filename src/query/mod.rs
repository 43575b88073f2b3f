//! Query processing:
//! - `descriptor`: structured query descriptors (the caller-facing input)
//! - `plan`: access-path planning (partition pruning, index selection,
//!   join ordering)
//! - `exec`: plan execution (scans, joins, aggregation, window functions)

pub mod descriptor;
pub mod exec;
pub mod plan;

use std::ops::Bound;

pub use descriptor::QueryDescriptor;

use crate::{
    engine::{IndexDef, PartitionMap, Pruning},
    error::Result,
    schema::Table,
    types::{Row, Value},
};

/// One consistent view of catalog and data, as the planner and executors
/// see it. Implemented by the engine over a single snapshot, so a whole
/// query observes one point in time.
pub trait QueryAccess {
    fn table(&self, name: &str) -> Result<Table>;
    fn indexes(&self, table: &str) -> Result<Vec<IndexDef>>;
    fn partition_map(&self, table: &str) -> Result<Option<PartitionMap>>;
    fn count_rows(&self, table: &str) -> Result<usize>;
    /// (distinct key tuples, total entries)
    fn index_stats(&self, index: &IndexDef) -> Result<(usize, usize)>;
    fn scan(&self, table: &str, pruning: &Pruning) -> Result<Vec<Row>>;
    fn index_lookup(
        &self,
        index: &IndexDef,
        prefix: &[Value],
        range: Option<(Bound<Value>, Bound<Value>)>,
    ) -> Result<Vec<Row>>;
}
