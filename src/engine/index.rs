use std::collections::HashSet;
use std::ops::Bound;

use log::debug;
use serde::{Deserialize, Serialize};

use crate::{
    error::{Error, Result},
    schema::Table,
    storage::{
        engine::{prefix_range, Engine as StorageEngine},
        keycode::{encode_tuple, encode_value},
        mvcc::MvccTransaction,
    },
    types::{Row, RowId, Value},
};

use super::{Database, Key, KeyPrefix, Pruning};

/// Secondary index definition
///
/// Column order determines key-prefix matching: an index on (A, B) serves
/// predicates on A alone or on A and B together, never on B alone.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexDef {
    pub name: String,
    pub table: String,
    pub columns: Vec<String>,
    pub unique: bool,
}

impl IndexDef {
    pub fn name_for(table: &str, columns: &[&str]) -> String {
        format!("{}_{}_idx", table, columns.join("_"))
    }
}

impl<E: StorageEngine> Database<E> {
    /// Creates a secondary index by scanning the heap once. The returned
    /// name is the handle for later lookups and drops.
    pub fn create_index(&self, table: &str, columns: &[&str], unique: bool) -> Result<String> {
        self.with_txn(|txn| {
            let schema = Self::load_table(txn, table)?;
            for col in columns {
                schema.get_col_index(col)?;
            }

            let name = IndexDef::name_for(table, columns);
            if Self::load_index(txn, table, &name)?.is_some() {
                return Err(Error::Internal(format!("index {} already exists", name)));
            }
            let def = IndexDef {
                name: name.clone(),
                table: table.into(),
                columns: columns.iter().map(|c| c.to_string()).collect(),
                unique,
            };

            let mut seen = HashSet::new();
            for (row_id, row) in Self::scan_heap(txn, table, &Pruning::All)? {
                let tuple = Self::index_tuple(&def, &schema, &row)?;
                let entry = encode_tuple(&tuple);
                if unique && !tuple.iter().any(Value::is_null) && !seen.insert(entry.clone()) {
                    return Err(Error::ConstraintViolation(format!(
                        "duplicate key for unique index {}",
                        name
                    )));
                }
                Self::index_insert_entry(txn, &def, entry, row_id)?;
            }

            txn.set(
                Key::IndexMeta(table.into(), name.clone()).encode(),
                bincode::serialize(&def)?,
            )?;
            debug!("created index {} on {}({})", name, table, columns.join(", "));
            Ok(name)
        })
    }

    /// Drops an index and all its entries. Indexes backing the primary key
    /// stay: constraint enforcement depends on them.
    pub fn drop_index(&self, table: &str, name: &str) -> Result<()> {
        self.with_txn(|txn| {
            let schema = Self::load_table(txn, table)?;
            let def = Self::load_index(txn, table, name)?
                .ok_or(Error::NotFound(format!("index {}", name)))?;

            let pk_name = &schema.columns[schema.primary_key_index()].name;
            if def.unique && def.columns.len() == 1 && &def.columns[0] == pk_name {
                return Err(Error::Internal(format!(
                    "index {} backs the primary key of {}",
                    name, table
                )));
            }

            for entry in txn.scan_prefix(KeyPrefix::IndexAll(table.into(), name.into()).encode())? {
                txn.delete(entry.key)?;
            }
            txn.delete(Key::IndexMeta(table.into(), name.into()).encode())
        })
    }

    /// Point or prefix lookup: equality values for a leading prefix of the
    /// indexed columns, plus an optional range over the next column.
    /// Returns matching row ids in key order.
    pub fn index_lookup(
        &self,
        table: &str,
        name: &str,
        prefix: &[Value],
        range: Option<(Bound<Value>, Bound<Value>)>,
    ) -> Result<Vec<RowId>> {
        self.with_txn(|txn| {
            let def = Self::load_index(txn, table, name)?
                .ok_or(Error::NotFound(format!("index {}", name)))?;
            Self::index_lookup_ids(txn, &def, prefix, range.as_ref())
        })
    }

    /// Fraction of the heap a single key is expected to match:
    /// distinct-key-count / entry-count, in [0, 1]. Higher means a more
    /// selective (more useful) index.
    pub fn estimate_selectivity(&self, table: &str, name: &str) -> Result<f64> {
        self.with_txn(|txn| {
            let def = Self::load_index(txn, table, name)?
                .ok_or(Error::NotFound(format!("index {}", name)))?;
            let (distinct, entries) = Self::index_stats(txn, &def)?;
            if entries == 0 {
                return Ok(1.0);
            }
            Ok(distinct as f64 / entries as f64)
        })
    }

    pub(super) fn load_indexes(txn: &MvccTransaction<E>, table: &str) -> Result<Vec<IndexDef>> {
        txn.scan_prefix(KeyPrefix::IndexMetaAll(table.into()).encode())?
            .into_iter()
            .map(|entry| Ok(bincode::deserialize(&entry.value)?))
            .collect()
    }

    pub(super) fn load_index(
        txn: &MvccTransaction<E>,
        table: &str,
        name: &str,
    ) -> Result<Option<IndexDef>> {
        Ok(txn
            .get(Key::IndexMeta(table.into(), name.into()).encode())?
            .map(|v| bincode::deserialize(&v))
            .transpose()?)
    }

    /// Extracts the indexed column values from a row
    pub(super) fn index_tuple(def: &IndexDef, schema: &Table, row: &Row) -> Result<Vec<Value>> {
        def.columns
            .iter()
            .map(|col| Ok(row[schema.get_col_index(col)?].clone()))
            .collect()
    }

    pub(super) fn index_insert_entry(
        txn: &MvccTransaction<E>,
        def: &IndexDef,
        tuple_bytes: Vec<u8>,
        row_id: RowId,
    ) -> Result<()> {
        txn.set(
            Key::Index(def.table.clone(), def.name.clone(), tuple_bytes, row_id).encode(),
            bincode::serialize(&row_id)?,
        )
    }

    pub(super) fn index_delete_entry(
        txn: &MvccTransaction<E>,
        def: &IndexDef,
        tuple_bytes: Vec<u8>,
        row_id: RowId,
    ) -> Result<()> {
        txn.delete(Key::Index(def.table.clone(), def.name.clone(), tuple_bytes, row_id).encode())
    }

    /// True if any entry matches the exact tuple, excluding `except`
    /// (used for unique enforcement; the row being updated is its own match)
    pub(super) fn index_tuple_taken(
        txn: &MvccTransaction<E>,
        def: &IndexDef,
        tuple: &[Value],
        except: Option<RowId>,
    ) -> Result<bool> {
        let ids = Self::index_lookup_ids(txn, def, tuple, None)?;
        Ok(ids.into_iter().any(|id| Some(id) != except))
    }

    pub(super) fn index_lookup_ids(
        txn: &MvccTransaction<E>,
        def: &IndexDef,
        prefix: &[Value],
        range: Option<&(Bound<Value>, Bound<Value>)>,
    ) -> Result<Vec<RowId>> {
        if prefix.len() + range.iter().count() > def.columns.len() {
            return Err(Error::Internal(format!(
                "lookup uses more columns than index {} has",
                def.name
            )));
        }

        let base = KeyPrefix::IndexTuple(
            def.table.clone(),
            def.name.clone(),
            encode_tuple(prefix),
        )
        .encode();

        let entries = match range {
            None => txn.scan_prefix(base)?,
            Some((low, high)) => {
                // Map value bounds onto raw-key bounds: an entry whose tuple
                // equals a bound value strictly extends base + encode(bound)
                // with its row id, so inclusive bounds widen to the end of
                // that value's prefix range.
                let with_value = |v: &Value| {
                    let mut key = base.clone();
                    key.extend_from_slice(&encode_value(v));
                    key
                };
                let from = match low {
                    Bound::Included(v) => Bound::Included(with_value(v)),
                    Bound::Excluded(v) => match prefix_range(&with_value(v)).1 {
                        Bound::Excluded(end) => Bound::Included(end),
                        _ => Bound::Unbounded,
                    },
                    Bound::Unbounded => Bound::Included(base.clone()),
                };
                let to = match high {
                    Bound::Included(v) => prefix_range(&with_value(v)).1,
                    Bound::Excluded(v) => Bound::Excluded(with_value(v)),
                    Bound::Unbounded => prefix_range(&base).1,
                };
                let from_ref = match &from {
                    Bound::Included(k) => Bound::Included(k),
                    Bound::Excluded(k) => Bound::Excluded(k),
                    Bound::Unbounded => Bound::Unbounded,
                };
                let to_ref = match &to {
                    Bound::Included(k) => Bound::Included(k),
                    Bound::Excluded(k) => Bound::Excluded(k),
                    Bound::Unbounded => Bound::Unbounded,
                };
                txn.scan_range(from_ref, to_ref)?
            }
        };

        entries
            .into_iter()
            .map(|entry| Ok(bincode::deserialize(&entry.value)?))
            .collect()
    }

    /// (distinct key tuples, total entries) for selectivity estimation
    pub(super) fn index_stats(txn: &MvccTransaction<E>, def: &IndexDef) -> Result<(usize, usize)> {
        let entries =
            txn.scan_prefix(KeyPrefix::IndexAll(def.table.clone(), def.name.clone()).encode())?;
        let total = entries.len();
        let mut distinct = HashSet::new();
        for entry in entries {
            // The row id is the trailing fixed-width component
            let tuple_end = entry.key.len().saturating_sub(8);
            distinct.insert(entry.key[..tuple_end].to_vec());
        }
        Ok((distinct.len(), total))
    }

    /// Maintains every index of the table for one row mutation. `old` and
    /// `new` are the row images before and after; either may be absent for
    /// inserts and deletes. Runs inside the mutation's transaction, so heap
    /// and index changes commit or roll back together.
    pub(super) fn index_maintain(
        txn: &MvccTransaction<E>,
        schema: &Table,
        indexes: &[IndexDef],
        row_id: RowId,
        old: Option<&Row>,
        new: Option<&Row>,
    ) -> Result<()> {
        for def in indexes {
            let old_tuple = old.map(|r| Self::index_tuple(def, schema, r)).transpose()?;
            let new_tuple = new.map(|r| Self::index_tuple(def, schema, r)).transpose()?;
            if old_tuple == new_tuple {
                continue;
            }
            if let Some(tuple) = &old_tuple {
                Self::index_delete_entry(txn, def, encode_tuple(tuple), row_id)?;
            }
            if let Some(tuple) = &new_tuple {
                if def.unique
                    && !tuple.iter().any(Value::is_null)
                    && Self::index_tuple_taken(txn, def, tuple, Some(row_id))?
                {
                    return Err(Error::ConstraintViolation(format!(
                        "duplicate key for unique index {}",
                        def.name
                    )));
                }
                Self::index_insert_entry(txn, def, encode_tuple(tuple), row_id)?;
            }
        }
        Ok(())
    }
}
