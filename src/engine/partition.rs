use std::collections::BTreeSet;
use std::ops::Bound;

use chrono::NaiveDate;
use log::{debug, warn};
use serde::{Deserialize, Serialize};

use crate::{
    error::{Error, Result},
    storage::{engine::Engine as StorageEngine, mvcc::MvccTransaction},
    types::Value,
};

use super::{Database, Key};

/// Partition identifier within one table heap
pub type PartitionId = u32;

/// Every heap has this partition; rows whose key falls outside all declared
/// ranges (or is null) land here
pub const OVERFLOW_PARTITION: PartitionId = 0;

/// Range partition map for one table: sorted, disjoint half-open date
/// ranges plus the implicit overflow partition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PartitionMap {
    /// Partition key column (must be a date column)
    pub column: String,
    next_id: PartitionId,
    /// Sorted by `low`; pairwise disjoint
    ranges: Vec<PartitionRange>,
}

/// One declared partition: rows with `low <= key < high`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PartitionRange {
    pub id: PartitionId,
    pub low: NaiveDate,
    pub high: NaiveDate,
}

/// Predicate over the partition key column, as the router understands it
#[derive(Debug, Clone, PartialEq)]
pub enum KeyPredicate {
    /// key >= low AND key < high (single-sided bounds via Unbounded)
    Range {
        low: Bound<NaiveDate>,
        high: Bound<NaiveDate>,
    },
    /// The key only appears wrapped in a function; range reasoning over the
    /// raw column would be unsound
    Opaque,
    /// The predicate does not constrain the key
    Unconstrained,
}

/// Outcome of partition pruning
#[derive(Debug, Clone, PartialEq)]
pub enum Pruning {
    /// Only these partitions can hold matching rows
    Partitions(BTreeSet<PartitionId>),
    /// No pruning possible; scan every partition
    All,
}

impl PartitionMap {
    pub fn new(column: impl Into<String>) -> Self {
        Self {
            column: column.into(),
            next_id: OVERFLOW_PARTITION + 1,
            ranges: Vec::new(),
        }
    }

    pub fn ranges(&self) -> &[PartitionRange] {
        &self.ranges
    }

    /// All partition ids in heap (storage key) order
    pub fn partition_ids(&self) -> Vec<PartitionId> {
        let mut ids: Vec<PartitionId> = self.ranges.iter().map(|r| r.id).collect();
        ids.push(OVERFLOW_PARTITION);
        ids.sort_unstable();
        ids
    }

    /// Declares a new range; fails if it intersects an existing one
    pub fn add_range(&mut self, low: NaiveDate, high: NaiveDate) -> Result<PartitionId> {
        if low >= high {
            return Err(Error::Internal(format!(
                "empty partition range [{}, {})",
                low, high
            )));
        }
        if let Some(existing) = self
            .ranges
            .iter()
            .find(|r| r.low < high && low < r.high)
        {
            return Err(Error::OverlappingRange(format!(
                "[{}, {}) intersects partition {} [{}, {})",
                low, high, existing.id, existing.low, existing.high
            )));
        }

        let id = self.next_id;
        self.next_id += 1;
        let pos = self.ranges.partition_point(|r| r.low < low);
        self.ranges.insert(pos, PartitionRange { id, low, high });
        Ok(id)
    }

    /// Removes a declared range; the overflow partition cannot be dropped
    pub fn drop_range(&mut self, id: PartitionId) -> Result<PartitionRange> {
        if id == OVERFLOW_PARTITION {
            return Err(Error::Internal(
                "the overflow partition cannot be dropped".into(),
            ));
        }
        let pos = self
            .ranges
            .iter()
            .position(|r| r.id == id)
            .ok_or(Error::NotFound(format!("partition {}", id)))?;
        Ok(self.ranges.remove(pos))
    }

    /// Routes a partition key value to its partition. Null keys go to the
    /// overflow partition.
    pub fn route(&self, key: Option<NaiveDate>) -> PartitionId {
        let Some(key) = key else {
            return OVERFLOW_PARTITION;
        };
        // Last range starting at or before the key, if it also ends past it
        let pos = self.ranges.partition_point(|r| r.low <= key);
        if pos > 0 {
            let candidate = &self.ranges[pos - 1];
            if key < candidate.high {
                return candidate.id;
            }
        }
        OVERFLOW_PARTITION
    }

    /// Returns the partitions that can hold rows matching the predicate.
    ///
    /// Sound but conservative: a partition containing a matching row is
    /// never excluded; extra partitions may be included. The overflow
    /// partition is excluded only when the queried interval is fully
    /// covered by declared ranges.
    pub fn prune(&self, predicate: &KeyPredicate) -> Pruning {
        let (low, high) = match predicate {
            KeyPredicate::Range { low, high } => (low, high),
            KeyPredicate::Opaque => {
                warn!(
                    "partition key {} only appears inside a function; pruning unavailable",
                    self.column
                );
                return Pruning::All;
            }
            KeyPredicate::Unconstrained => return Pruning::All,
        };

        // Normalize to half-open [a, b) over whole days
        let a = match low {
            Bound::Included(d) => *d,
            Bound::Excluded(d) => d.succ_opt().unwrap_or(NaiveDate::MAX),
            Bound::Unbounded => NaiveDate::MIN,
        };
        let b = match high {
            Bound::Included(d) => d.succ_opt().unwrap_or(NaiveDate::MAX),
            Bound::Excluded(d) => *d,
            Bound::Unbounded => NaiveDate::MAX,
        };

        let mut ids: BTreeSet<PartitionId> = self
            .ranges
            .iter()
            .filter(|r| r.low < b && a < r.high)
            .map(|r| r.id)
            .collect();

        // Null keys never satisfy a range predicate, so the overflow
        // partition matters only where declared coverage has holes
        if !self.covers(a, b) {
            ids.insert(OVERFLOW_PARTITION);
        }

        debug!(
            "pruned {} to partitions {:?} for [{}, {})",
            self.column, ids, a, b
        );
        Pruning::Partitions(ids)
    }

    /// Whether [a, b) is fully covered by declared ranges
    fn covers(&self, a: NaiveDate, b: NaiveDate) -> bool {
        let mut cursor = a;
        for r in &self.ranges {
            if cursor >= b {
                break;
            }
            if r.low <= cursor && cursor < r.high {
                cursor = r.high;
            }
        }
        cursor >= b
    }
}

impl<E: StorageEngine> Database<E> {
    /// Establishes range partitioning on a table by a date column. The heap
    /// must still be empty: existing rows were placed without a map and
    /// re-routing them here would race concurrent writers.
    pub fn partition_by(&self, table: &str, column: &str) -> Result<()> {
        self.with_txn(|txn| {
            let schema = Self::load_table(txn, table)?;
            let idx = schema.get_col_index(column)?;
            if schema.columns[idx].datatype != crate::types::DataType::Date {
                return Err(Error::Internal(format!(
                    "partition key {}.{} must be a date column",
                    table, column
                )));
            }
            if Self::load_partition_map(txn, table)?.is_some() {
                return Err(Error::Internal(format!(
                    "table {} is already partitioned",
                    table
                )));
            }
            if !Self::scan_heap(txn, table, &Pruning::All)?.is_empty() {
                return Err(Error::Internal(format!(
                    "table {} must be empty to establish partitioning",
                    table
                )));
            }
            Self::store_partition_map(txn, table, &PartitionMap::new(column))
        })
    }

    /// Adds a partition `[low, high)`; rows already sitting in the overflow
    /// partition that belong to the new range migrate into it atomically
    pub fn add_partition(
        &self,
        table: &str,
        low: NaiveDate,
        high: NaiveDate,
    ) -> Result<PartitionId> {
        self.with_txn(|txn| {
            let schema = Self::load_table(txn, table)?;
            let mut map = Self::load_partition_map(txn, table)?.ok_or(Error::Internal(
                format!("table {} is not partitioned", table),
            ))?;
            let id = map.add_range(low, high)?;

            let key_idx = schema.get_col_index(&map.column)?;
            let overflow = BTreeSet::from([OVERFLOW_PARTITION]);
            for (row_id, row) in
                Self::scan_heap(txn, table, &Pruning::Partitions(overflow))?
            {
                if let Value::Date(d) = &row[key_idx] {
                    if *d >= low && *d < high {
                        Self::move_row(txn, table, row_id, OVERFLOW_PARTITION, id, &row)?;
                    }
                }
            }

            Self::store_partition_map(txn, table, &map)?;
            debug!("added partition {} [{}, {}) to {}", id, low, high, table);
            Ok(id)
        })
    }

    /// Drops a partition and every row it contains (retention cleanup).
    /// Irreversible; contained rows do not cascade through foreign keys.
    pub fn drop_partition(&self, table: &str, id: PartitionId) -> Result<()> {
        self.with_txn(|txn| {
            let mut map = Self::load_partition_map(txn, table)?.ok_or(Error::Internal(
                format!("table {} is not partitioned", table),
            ))?;
            let range = map.drop_range(id)?;

            let contained = BTreeSet::from([id]);
            for (row_id, row) in
                Self::scan_heap(txn, table, &Pruning::Partitions(contained))?
            {
                Self::remove_row_storage(txn, table, row_id, id, &row)?;
            }

            Self::store_partition_map(txn, table, &map)?;
            debug!(
                "dropped partition {} [{}, {}) from {}",
                id, range.low, range.high, table
            );
            Ok(())
        })
    }

    pub(super) fn load_partition_map(
        txn: &MvccTransaction<E>,
        table: &str,
    ) -> Result<Option<PartitionMap>> {
        Ok(txn
            .get(Key::PartitionMap(table.into()).encode())?
            .map(|v| bincode::deserialize(&v))
            .transpose()?)
    }

    pub(super) fn store_partition_map(
        txn: &MvccTransaction<E>,
        table: &str,
        map: &PartitionMap,
    ) -> Result<()> {
        txn.set(
            Key::PartitionMap(table.into()).encode(),
            bincode::serialize(map)?,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn yearly_map() -> PartitionMap {
        let mut map = PartitionMap::new("start_date");
        map.add_range(date(2023, 1, 1), date(2024, 1, 1)).unwrap();
        map.add_range(date(2024, 1, 1), date(2025, 1, 1)).unwrap();
        map
    }

    #[test]
    fn test_route() {
        let map = yearly_map();
        assert_eq!(map.route(Some(date(2023, 6, 15))), 1);
        assert_eq!(map.route(Some(date(2024, 1, 1))), 2);
        assert_eq!(map.route(Some(date(2024, 12, 31))), 2);
        // Out of range and null go to overflow
        assert_eq!(map.route(Some(date(2025, 1, 1))), OVERFLOW_PARTITION);
        assert_eq!(map.route(Some(date(2019, 3, 3))), OVERFLOW_PARTITION);
        assert_eq!(map.route(None), OVERFLOW_PARTITION);
    }

    #[test]
    fn test_overlap_rejected() {
        let mut map = yearly_map();
        assert!(matches!(
            map.add_range(date(2024, 6, 1), date(2024, 7, 1)),
            Err(Error::OverlappingRange(_))
        ));
        assert!(matches!(
            map.add_range(date(2023, 12, 1), date(2024, 2, 1)),
            Err(Error::OverlappingRange(_))
        ));
        // Adjacent is fine: ranges are half-open
        assert!(map.add_range(date(2025, 1, 1), date(2026, 1, 1)).is_ok());
    }

    #[test]
    fn test_empty_range_rejected() {
        let mut map = PartitionMap::new("d");
        assert!(map.add_range(date(2024, 1, 1), date(2024, 1, 1)).is_err());
    }

    #[test]
    fn test_prune_exact_partition() {
        // Year-of-2024 predicate must prune to exactly the 2024 partition
        let map = yearly_map();
        let pruning = map.prune(&KeyPredicate::Range {
            low: Bound::Included(date(2024, 1, 1)),
            high: Bound::Excluded(date(2025, 1, 1)),
        });
        assert_eq!(pruning, Pruning::Partitions(BTreeSet::from([2])));
    }

    #[test]
    fn test_prune_includes_overflow_when_uncovered() {
        let map = yearly_map();
        // Interval extends past declared coverage: overflow stays in
        let pruning = map.prune(&KeyPredicate::Range {
            low: Bound::Included(date(2024, 6, 1)),
            high: Bound::Unbounded,
        });
        assert_eq!(pruning, Pruning::Partitions(BTreeSet::from([2, OVERFLOW_PARTITION])));
    }

    #[test]
    fn test_prune_gap_includes_overflow() {
        let mut map = PartitionMap::new("d");
        map.add_range(date(2023, 1, 1), date(2024, 1, 1)).unwrap();
        map.add_range(date(2025, 1, 1), date(2026, 1, 1)).unwrap();
        let pruning = map.prune(&KeyPredicate::Range {
            low: Bound::Included(date(2023, 6, 1)),
            high: Bound::Excluded(date(2025, 6, 1)),
        });
        // The 2024 gap may hold matching overflow rows
        assert_eq!(
            pruning,
            Pruning::Partitions(BTreeSet::from([1, 2, OVERFLOW_PARTITION]))
        );
    }

    #[test]
    fn test_prune_opaque_scans_all() {
        let map = yearly_map();
        assert_eq!(map.prune(&KeyPredicate::Opaque), Pruning::All);
        assert_eq!(map.prune(&KeyPredicate::Unconstrained), Pruning::All);
    }

    #[test]
    fn test_drop_range() {
        let mut map = yearly_map();
        let dropped = map.drop_range(1).unwrap();
        assert_eq!(dropped.low, date(2023, 1, 1));
        assert!(matches!(map.drop_range(1), Err(Error::NotFound(_))));
        assert!(map.drop_range(OVERFLOW_PARTITION).is_err());
    }
}
