//! The relational engine: catalog, row CRUD with constraint and foreign-key
//! enforcement, secondary indexes, and range partitioning. Everything is
//! stored in one keyspace behind the snapshot layer, so each mutation
//! commits row, directory and index entries together or not at all.

use std::collections::{BTreeMap, HashSet};
use std::ops::Bound;

use chrono::NaiveDate;
use log::trace;

use crate::{
    error::{Error, Result},
    query::{
        exec::ResultSet,
        plan::Plan,
        QueryAccess, QueryDescriptor,
    },
    schema::{OnDelete, Table},
    storage::{
        engine::Engine as StorageEngine,
        keycode::{encode_u64, escape_bytes},
        mvcc::{Mvcc, MvccTransaction},
    },
    types::{Row, RowId, Value},
};

pub mod index;
pub mod partition;

pub use index::IndexDef;
pub use partition::{KeyPredicate, PartitionId, PartitionMap, Pruning, OVERFLOW_PARTITION};

// Keyspace tags. Tables and catalog entries sort before row data, row data
// before index entries; within a table, rows order by (partition, row id).
const KEY_TABLE: u8 = 0x01;
const KEY_INDEX_META: u8 = 0x02;
const KEY_PARTITION_MAP: u8 = 0x03;
const KEY_NEXT_ROW_ID: u8 = 0x04;
const KEY_ROW: u8 = 0x05;
const KEY_ROW_DIR: u8 = 0x06;
const KEY_INDEX: u8 = 0x07;

/// Key types for engine storage
#[derive(Debug)]
pub(crate) enum Key {
    /// Table schema (catalog)
    Table(String),
    /// Index definition
    IndexMeta(String, String),
    /// Partition boundary list
    PartitionMap(String),
    /// Row id counter
    NextRowId(String),
    /// Row payload under (table, partition, row id)
    Row(String, PartitionId, RowId),
    /// Row directory: row id -> partition
    RowDir(String, RowId),
    /// Index entry: encoded key tuple plus row id for uniqueness
    Index(String, String, Vec<u8>, RowId),
}

impl Key {
    pub(crate) fn encode(&self) -> Vec<u8> {
        match self {
            Key::Table(table) => {
                let mut out = vec![KEY_TABLE];
                out.extend_from_slice(&escape_bytes(table.as_bytes()));
                out
            }
            Key::IndexMeta(table, name) => {
                let mut out = vec![KEY_INDEX_META];
                out.extend_from_slice(&escape_bytes(table.as_bytes()));
                out.extend_from_slice(&escape_bytes(name.as_bytes()));
                out
            }
            Key::PartitionMap(table) => {
                let mut out = vec![KEY_PARTITION_MAP];
                out.extend_from_slice(&escape_bytes(table.as_bytes()));
                out
            }
            Key::NextRowId(table) => {
                let mut out = vec![KEY_NEXT_ROW_ID];
                out.extend_from_slice(&escape_bytes(table.as_bytes()));
                out
            }
            Key::Row(table, partition, row_id) => {
                let mut out = vec![KEY_ROW];
                out.extend_from_slice(&escape_bytes(table.as_bytes()));
                out.extend_from_slice(&partition.to_be_bytes());
                out.extend_from_slice(&encode_u64(*row_id));
                out
            }
            Key::RowDir(table, row_id) => {
                let mut out = vec![KEY_ROW_DIR];
                out.extend_from_slice(&escape_bytes(table.as_bytes()));
                out.extend_from_slice(&encode_u64(*row_id));
                out
            }
            Key::Index(table, name, tuple, row_id) => {
                let mut out = vec![KEY_INDEX];
                out.extend_from_slice(&escape_bytes(table.as_bytes()));
                out.extend_from_slice(&escape_bytes(name.as_bytes()));
                out.extend_from_slice(tuple);
                out.extend_from_slice(&encode_u64(*row_id));
                out
            }
        }
    }
}

/// Key prefixes for scans over one keyspace section
#[derive(Debug)]
pub(crate) enum KeyPrefix {
    TableAll,
    IndexMetaAll(String),
    RowPartition(String, PartitionId),
    RowDirAll(String),
    IndexAll(String, String),
    IndexTuple(String, String, Vec<u8>),
}

impl KeyPrefix {
    pub(crate) fn encode(&self) -> Vec<u8> {
        match self {
            KeyPrefix::TableAll => vec![KEY_TABLE],
            KeyPrefix::IndexMetaAll(table) => {
                let mut out = vec![KEY_INDEX_META];
                out.extend_from_slice(&escape_bytes(table.as_bytes()));
                out
            }
            KeyPrefix::RowPartition(table, partition) => {
                let mut out = vec![KEY_ROW];
                out.extend_from_slice(&escape_bytes(table.as_bytes()));
                out.extend_from_slice(&partition.to_be_bytes());
                out
            }
            KeyPrefix::RowDirAll(table) => {
                let mut out = vec![KEY_ROW_DIR];
                out.extend_from_slice(&escape_bytes(table.as_bytes()));
                out
            }
            KeyPrefix::IndexAll(table, name) => {
                let mut out = vec![KEY_INDEX];
                out.extend_from_slice(&escape_bytes(table.as_bytes()));
                out.extend_from_slice(&escape_bytes(name.as_bytes()));
                out
            }
            KeyPrefix::IndexTuple(table, name, tuple) => {
                let mut out = vec![KEY_INDEX];
                out.extend_from_slice(&escape_bytes(table.as_bytes()));
                out.extend_from_slice(&escape_bytes(name.as_bytes()));
                out.extend_from_slice(tuple);
                out
            }
        }
    }
}

/// The database: a process-scoped registry of tables, indexes and
/// partition maps over one storage engine. Clones share the engine and may
/// operate concurrently; conflicting row mutations surface as
/// `WriteConflict`.
pub struct Database<E: StorageEngine> {
    mvcc: Mvcc<E>,
}

impl<E: StorageEngine> Clone for Database<E> {
    fn clone(&self) -> Self {
        Self {
            mvcc: self.mvcc.clone(),
        }
    }
}

impl<E: StorageEngine> Database<E> {
    /// Opens a database over the engine and loads the schema. Schemas are
    /// defined once here; reopening over an existing store checks that the
    /// given schemas match the persisted catalog.
    pub fn open(engine: E, schemas: Vec<Table>) -> Result<Self> {
        let db = Self {
            mvcc: Mvcc::new(engine),
        };

        db.with_txn(|txn| {
            for table in &schemas {
                table.validate()?;
            }
            for table in &schemas {
                for col in &table.columns {
                    if let Some(fk) = &col.references {
                        let target = schemas
                            .iter()
                            .find(|t| t.name == fk.table)
                            .ok_or(Error::Internal(format!(
                                "foreign key {}.{} references unknown table {}",
                                table.name, col.name, fk.table
                            )))?;
                        let pk = &target.columns[target.primary_key_index()];
                        if pk.datatype != col.datatype {
                            return Err(Error::Internal(format!(
                                "foreign key {}.{} type differs from {}.{}",
                                table.name, col.name, target.name, pk.name
                            )));
                        }
                    }
                }
            }
            for table in &schemas {
                match Self::load_table_opt(txn, &table.name)? {
                    Some(existing) if existing != *table => {
                        return Err(Error::Internal(format!(
                            "persisted schema for table {} differs",
                            table.name
                        )))
                    }
                    Some(_) => {}
                    None => txn.set(
                        Key::Table(table.name.clone()).encode(),
                        bincode::serialize(table)?,
                    )?,
                }
            }
            Ok(())
        })?;

        // Primary key and UNIQUE columns are enforced through unique indexes
        for table in &schemas {
            let pk = &table.columns[table.primary_key_index()];
            db.ensure_unique_index(&table.name, &pk.name)?;
            for col in table.columns.iter().filter(|c| c.unique && !c.primary_key) {
                db.ensure_unique_index(&table.name, &col.name)?;
            }
        }

        Ok(db)
    }

    fn ensure_unique_index(&self, table: &str, column: &str) -> Result<()> {
        let name = IndexDef::name_for(table, &[column]);
        let exists = self.with_txn(|txn| Self::load_index(txn, table, &name))?;
        if exists.is_none() {
            self.create_index(table, &[column], true)?;
        }
        Ok(())
    }

    /// Runs one operation inside a snapshot transaction, committing on
    /// success and rolling back on failure
    pub(crate) fn with_txn<T>(
        &self,
        f: impl FnOnce(&MvccTransaction<E>) -> Result<T>,
    ) -> Result<T> {
        let txn = self.mvcc.begin()?;
        match f(&txn) {
            Ok(value) => {
                txn.commit()?;
                Ok(value)
            }
            Err(err) => {
                txn.rollback()?;
                Err(err)
            }
        }
    }

    /// Inserts a row (missing trailing columns take their defaults) and
    /// returns its assigned row id
    pub fn insert(&self, table: &str, row: Row) -> Result<RowId> {
        self.with_txn(|txn| Self::insert_inner(txn, table, row))
    }

    /// Fetches a row by id
    pub fn get(&self, table: &str, row_id: RowId) -> Result<Option<Row>> {
        self.with_txn(|txn| {
            Self::load_table(txn, table)?;
            Ok(Self::get_row(txn, table, row_id)?.map(|(_, row)| row))
        })
    }

    /// Scans a table in heap order. With a partition-key range, only
    /// partitions intersecting the range are visited.
    pub fn scan(
        &self,
        table: &str,
        partition_range: Option<(Bound<NaiveDate>, Bound<NaiveDate>)>,
    ) -> Result<Vec<(RowId, Row)>> {
        self.with_txn(|txn| {
            Self::load_table(txn, table)?;
            let pruning = match (Self::load_partition_map(txn, table)?, partition_range) {
                (Some(map), Some((low, high))) => map.prune(&KeyPredicate::Range { low, high }),
                _ => Pruning::All,
            };
            Self::scan_heap(txn, table, &pruning)
        })
    }

    /// Updates columns of a row, re-validating constraints and re-keying
    /// index entries; the row moves partition if its partition key changed
    pub fn update(&self, table: &str, row_id: RowId, patch: BTreeMap<String, Value>) -> Result<Row> {
        self.with_txn(|txn| Self::update_inner(txn, table, row_id, &patch))
    }

    /// Deletes a row, applying each referencing relation's on-delete
    /// policy. Returns false if the row does not exist.
    pub fn delete(&self, table: &str, row_id: RowId) -> Result<bool> {
        self.with_txn(|txn| {
            Self::load_table(txn, table)?;
            let mut visited = HashSet::new();
            Self::delete_inner(txn, table, row_id, &mut visited)
        })
    }

    /// Executes a query descriptor over one snapshot of the database
    pub fn execute(&self, query: &QueryDescriptor) -> Result<ResultSet>
    where
        E: 'static,
    {
        let snapshot = Snapshot {
            txn: self.mvcc.begin()?,
        };
        let result = Plan::build(query, &snapshot).and_then(|plan| plan.execute(&snapshot));
        match result {
            Ok(set) => {
                snapshot.txn.commit()?;
                Ok(set)
            }
            Err(err) => {
                snapshot.txn.rollback()?;
                Err(err)
            }
        }
    }

    fn insert_inner(txn: &MvccTransaction<E>, table: &str, row: Row) -> Result<RowId> {
        let schema = Self::load_table(txn, table)?;
        let row = Self::pad_row(&schema, row)?;

        for (col, value) in schema.columns.iter().zip(row.iter()) {
            col.validate_value(value)?;
            Self::check_foreign_key(txn, &schema, col, value)?;
        }

        let row_id = Self::next_row_id(txn, table)?;
        let partition = Self::route_row(txn, table, &schema, &row)?;

        let indexes = Self::load_indexes(txn, table)?;
        Self::index_maintain(txn, &schema, &indexes, row_id, None, Some(&row))?;

        txn.set(
            Key::Row(table.into(), partition, row_id).encode(),
            bincode::serialize(&row)?,
        )?;
        txn.set(
            Key::RowDir(table.into(), row_id).encode(),
            bincode::serialize(&partition)?,
        )?;
        trace!("insert {}/{} into partition {}", table, row_id, partition);
        Ok(row_id)
    }

    fn update_inner(
        txn: &MvccTransaction<E>,
        table: &str,
        row_id: RowId,
        patch: &BTreeMap<String, Value>,
    ) -> Result<Row> {
        let schema = Self::load_table(txn, table)?;
        let (partition, old_row) = Self::get_row(txn, table, row_id)?
            .ok_or(Error::NotFound(format!("row {} in table {}", row_id, table)))?;

        let mut new_row = old_row.clone();
        for (col_name, value) in patch {
            let idx = schema.get_col_index(col_name)?;
            let col = &schema.columns[idx];
            col.validate_value(value)?;
            Self::check_foreign_key(txn, &schema, col, value)?;
            new_row[idx] = value.clone();
        }

        // A referenced primary key cannot change out from under its
        // referencing rows
        let pk_idx = schema.primary_key_index();
        if new_row[pk_idx] != old_row[pk_idx]
            && !Self::referencing_rows(txn, &schema, &old_row[pk_idx])?.is_empty()
        {
            return Err(Error::ReferentialIntegrity(format!(
                "primary key of {} row {} is referenced",
                table, row_id
            )));
        }

        let indexes = Self::load_indexes(txn, table)?;
        Self::index_maintain(txn, &schema, &indexes, row_id, Some(&old_row), Some(&new_row))?;

        let new_partition = Self::route_row(txn, table, &schema, &new_row)?;
        if new_partition != partition {
            Self::move_row(txn, table, row_id, partition, new_partition, &new_row)?;
        } else {
            txn.set(
                Key::Row(table.into(), partition, row_id).encode(),
                bincode::serialize(&new_row)?,
            )?;
        }
        trace!("update {}/{}", table, row_id);
        Ok(new_row)
    }

    fn delete_inner(
        txn: &MvccTransaction<E>,
        table: &str,
        row_id: RowId,
        visited: &mut HashSet<(String, RowId)>,
    ) -> Result<bool> {
        if !visited.insert((table.into(), row_id)) {
            return Ok(false);
        }
        let Some((partition, row)) = Self::get_row(txn, table, row_id)? else {
            return Ok(false);
        };

        let schema = Self::load_table(txn, table)?;
        let pk = schema.get_primary_key(&row);
        for (ref_schema, col_idx, on_delete) in Self::referencing_relations(txn, table)? {
            let mut dependents = Self::rows_matching(txn, &ref_schema, col_idx, &pk)?;
            dependents.retain(|id| !visited.contains(&(ref_schema.name.clone(), *id)));
            if dependents.is_empty() {
                continue;
            }
            match on_delete {
                OnDelete::Restrict => {
                    return Err(Error::ReferentialIntegrity(format!(
                        "{} row {} is referenced by {}.{}",
                        table, row_id, ref_schema.name, ref_schema.columns[col_idx].name
                    )))
                }
                OnDelete::Cascade => {
                    for dependent in dependents {
                        Self::delete_inner(txn, &ref_schema.name, dependent, visited)?;
                    }
                }
            }
        }

        Self::remove_row_storage(txn, table, row_id, partition, &row)?;
        trace!("delete {}/{}", table, row_id);
        Ok(true)
    }

    /// Fills missing trailing columns with their defaults
    fn pad_row(schema: &Table, mut row: Row) -> Result<Row> {
        if row.len() > schema.columns.len() {
            return Err(Error::ConstraintViolation(format!(
                "too many values for table {}",
                schema.name
            )));
        }
        for column in schema.columns.iter().skip(row.len()) {
            match &column.default {
                Some(default) => row.push(default.clone()),
                None if column.nullable => row.push(Value::Null),
                None => {
                    return Err(Error::ConstraintViolation(format!(
                        "no value or default for column {}",
                        column.name
                    )))
                }
            }
        }
        Ok(row)
    }

    fn check_foreign_key(
        txn: &MvccTransaction<E>,
        schema: &Table,
        col: &crate::schema::Column,
        value: &Value,
    ) -> Result<()> {
        let Some(fk) = &col.references else {
            return Ok(());
        };
        if value.is_null() {
            return Ok(());
        }
        let target = Self::load_table(txn, &fk.table)?;
        if !Self::pk_exists(txn, &target, value)? {
            return Err(Error::ReferentialIntegrity(format!(
                "{}.{} = {} has no matching {} row",
                schema.name, col.name, value, fk.table
            )));
        }
        Ok(())
    }

    /// Whether a row with the given primary key exists, via the
    /// primary-key index when present
    fn pk_exists(txn: &MvccTransaction<E>, schema: &Table, value: &Value) -> Result<bool> {
        let pk_name = &schema.columns[schema.primary_key_index()].name;
        let index_name = IndexDef::name_for(&schema.name, &[pk_name]);
        if let Some(def) = Self::load_index(txn, &schema.name, &index_name)? {
            return Ok(!Self::index_lookup_ids(txn, &def, std::slice::from_ref(value), None)?
                .is_empty());
        }
        let pk_idx = schema.primary_key_index();
        Ok(Self::scan_heap(txn, &schema.name, &Pruning::All)?
            .iter()
            .any(|(_, row)| &row[pk_idx] == value))
    }

    /// All (table, column index, policy) relations referencing `target`
    fn referencing_relations(
        txn: &MvccTransaction<E>,
        target: &str,
    ) -> Result<Vec<(Table, usize, OnDelete)>> {
        let mut relations = Vec::new();
        for entry in txn.scan_prefix(KeyPrefix::TableAll.encode())? {
            let schema: Table = bincode::deserialize(&entry.value)?;
            for (idx, col) in schema.columns.iter().enumerate() {
                if let Some(fk) = &col.references {
                    if fk.table == target {
                        relations.push((schema.clone(), idx, fk.on_delete));
                    }
                }
            }
        }
        Ok(relations)
    }

    /// Row ids of rows referencing the given primary key through any relation
    fn referencing_rows(
        txn: &MvccTransaction<E>,
        schema: &Table,
        pk: &Value,
    ) -> Result<Vec<RowId>> {
        let mut out = Vec::new();
        for (ref_schema, col_idx, _) in Self::referencing_relations(txn, &schema.name)? {
            out.extend(Self::rows_matching(txn, &ref_schema, col_idx, pk)?);
        }
        Ok(out)
    }

    /// Row ids in `schema` whose column equals `value`, via an index on
    /// that column when one exists
    fn rows_matching(
        txn: &MvccTransaction<E>,
        schema: &Table,
        col_idx: usize,
        value: &Value,
    ) -> Result<Vec<RowId>> {
        let col_name = &schema.columns[col_idx].name;
        for def in Self::load_indexes(txn, &schema.name)? {
            if def.columns.first() == Some(col_name) {
                return Self::index_lookup_ids(txn, &def, std::slice::from_ref(value), None);
            }
        }
        Ok(Self::scan_heap(txn, &schema.name, &Pruning::All)?
            .into_iter()
            .filter(|(_, row)| &row[col_idx] == value)
            .map(|(id, _)| id)
            .collect())
    }

    fn route_row(
        txn: &MvccTransaction<E>,
        table: &str,
        schema: &Table,
        row: &Row,
    ) -> Result<PartitionId> {
        let Some(map) = Self::load_partition_map(txn, table)? else {
            return Ok(OVERFLOW_PARTITION);
        };
        let key_idx = schema.get_col_index(&map.column)?;
        let key = match &row[key_idx] {
            Value::Date(d) => Some(*d),
            Value::Null => None,
            other => {
                return Err(Error::Internal(format!(
                    "partition key {} holds non-date value {}",
                    map.column, other
                )))
            }
        };
        Ok(map.route(key))
    }

    pub(crate) fn load_table(txn: &MvccTransaction<E>, name: &str) -> Result<Table> {
        Self::load_table_opt(txn, name)?.ok_or(Error::NotFound(format!("table {}", name)))
    }

    fn load_table_opt(txn: &MvccTransaction<E>, name: &str) -> Result<Option<Table>> {
        Ok(txn
            .get(Key::Table(name.into()).encode())?
            .map(|v| bincode::deserialize(&v))
            .transpose()?)
    }

    fn next_row_id(txn: &MvccTransaction<E>, table: &str) -> Result<RowId> {
        let key = Key::NextRowId(table.into()).encode();
        let next = match txn.get(key.clone())? {
            Some(value) => bincode::deserialize(&value)?,
            None => 1,
        };
        txn.set(key, bincode::serialize(&(next + 1))?)?;
        Ok(next)
    }

    /// Scans the heap in (partition, row id) order, visiting only the
    /// partitions the pruning result names
    pub(crate) fn scan_heap(
        txn: &MvccTransaction<E>,
        table: &str,
        pruning: &Pruning,
    ) -> Result<Vec<(RowId, Row)>> {
        let partitions: Vec<PartitionId> = match pruning {
            Pruning::All => match Self::load_partition_map(txn, table)? {
                Some(map) => map.partition_ids(),
                None => vec![OVERFLOW_PARTITION],
            },
            Pruning::Partitions(set) => set.iter().copied().collect(),
        };

        let mut rows = Vec::new();
        for partition in partitions {
            for entry in
                txn.scan_prefix(KeyPrefix::RowPartition(table.into(), partition).encode())?
            {
                rows.push((Self::row_id_from_key(&entry.key)?, bincode::deserialize(&entry.value)?));
            }
        }
        Ok(rows)
    }

    pub(crate) fn get_row(
        txn: &MvccTransaction<E>,
        table: &str,
        row_id: RowId,
    ) -> Result<Option<(PartitionId, Row)>> {
        let Some(dir) = txn.get(Key::RowDir(table.into(), row_id).encode())? else {
            return Ok(None);
        };
        let partition: PartitionId = bincode::deserialize(&dir)?;
        let Some(payload) = txn.get(Key::Row(table.into(), partition, row_id).encode())? else {
            return Err(Error::Internal(format!(
                "row directory of {} points at missing row {}",
                table, row_id
            )));
        };
        Ok(Some((partition, bincode::deserialize(&payload)?)))
    }

    pub(crate) fn count_rows(txn: &MvccTransaction<E>, table: &str) -> Result<usize> {
        Ok(txn
            .scan_prefix(KeyPrefix::RowDirAll(table.into()).encode())?
            .len())
    }

    /// Removes a row's payload, directory entry and index entries
    pub(crate) fn remove_row_storage(
        txn: &MvccTransaction<E>,
        table: &str,
        row_id: RowId,
        partition: PartitionId,
        row: &Row,
    ) -> Result<()> {
        let schema = Self::load_table(txn, table)?;
        let indexes = Self::load_indexes(txn, table)?;
        Self::index_maintain(txn, &schema, &indexes, row_id, Some(row), None)?;
        txn.delete(Key::Row(table.into(), partition, row_id).encode())?;
        txn.delete(Key::RowDir(table.into(), row_id).encode())
    }

    /// Moves a row between partitions, updating the directory; index
    /// entries are partition-agnostic and stay put
    pub(crate) fn move_row(
        txn: &MvccTransaction<E>,
        table: &str,
        row_id: RowId,
        from: PartitionId,
        to: PartitionId,
        row: &Row,
    ) -> Result<()> {
        txn.delete(Key::Row(table.into(), from, row_id).encode())?;
        txn.set(
            Key::Row(table.into(), to, row_id).encode(),
            bincode::serialize(row)?,
        )?;
        txn.set(
            Key::RowDir(table.into(), row_id).encode(),
            bincode::serialize(&to)?,
        )
    }

    fn row_id_from_key(key: &[u8]) -> Result<RowId> {
        if key.len() < 8 {
            return Err(Error::Serialization("row key too short".into()));
        }
        let mut buf = [0u8; 8];
        buf.copy_from_slice(&key[key.len() - 8..]);
        Ok(u64::from_be_bytes(buf))
    }
}

/// One consistent view of the database, backing a whole query execution
pub(crate) struct Snapshot<E: StorageEngine> {
    txn: MvccTransaction<E>,
}

impl<E: StorageEngine> QueryAccess for Snapshot<E> {
    fn table(&self, name: &str) -> Result<Table> {
        Database::<E>::load_table(&self.txn, name)
    }

    fn indexes(&self, table: &str) -> Result<Vec<IndexDef>> {
        Database::<E>::load_indexes(&self.txn, table)
    }

    fn partition_map(&self, table: &str) -> Result<Option<PartitionMap>> {
        Database::<E>::load_partition_map(&self.txn, table)
    }

    fn count_rows(&self, table: &str) -> Result<usize> {
        Database::<E>::count_rows(&self.txn, table)
    }

    fn index_stats(&self, index: &IndexDef) -> Result<(usize, usize)> {
        Database::<E>::index_stats(&self.txn, index)
    }

    fn scan(&self, table: &str, pruning: &Pruning) -> Result<Vec<Row>> {
        Ok(Database::<E>::scan_heap(&self.txn, table, pruning)?
            .into_iter()
            .map(|(_, row)| row)
            .collect())
    }

    fn index_lookup(
        &self,
        index: &IndexDef,
        prefix: &[Value],
        range: Option<(Bound<Value>, Bound<Value>)>,
    ) -> Result<Vec<Row>> {
        let ids = Database::<E>::index_lookup_ids(&self.txn, index, prefix, range.as_ref())?;
        let mut rows = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some((_, row)) = Database::<E>::get_row(&self.txn, &index.table, id)? {
                rows.push(row);
            }
        }
        Ok(rows)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::ops::Bound;

    use super::*;
    use crate::{
        query::descriptor::{
            AggFunc, ColumnExpr, CmpOp, JoinKind, OrderDirection, Predicate, QueryDescriptor,
            Window, WindowFunc,
        },
        schema::{Check, Column, OnDelete, Table},
        storage::memory::MemoryEngine,
        types::{DataType, Value},
    };

    fn booking_schema(guest_policy: OnDelete) -> Vec<Table> {
        vec![
            Table {
                name: "user".into(),
                columns: vec![
                    Column::primary_key("user_id", DataType::Integer),
                    Column::new("email", DataType::String).not_null().unique(),
                    Column::new("name", DataType::String),
                ],
            },
            Table {
                name: "property".into(),
                columns: vec![
                    Column::primary_key("property_id", DataType::Integer),
                    Column::new("host_id", DataType::Integer)
                        .not_null()
                        .references("user", OnDelete::Restrict),
                    Column::new("location", DataType::String).not_null(),
                    Column::new("price", DataType::Float)
                        .not_null()
                        .with_check(Check::GreaterThan(Value::Float(0.0))),
                ],
            },
            Table {
                name: "booking".into(),
                columns: vec![
                    Column::primary_key("booking_id", DataType::Integer),
                    Column::new("property_id", DataType::Integer)
                        .not_null()
                        .references("property", OnDelete::Cascade),
                    Column::new("user_id", DataType::Integer)
                        .not_null()
                        .references("user", guest_policy),
                    Column::new("start_date", DataType::Date).not_null(),
                    Column::new("end_date", DataType::Date).not_null(),
                    Column::new("total_price", DataType::Float).not_null(),
                    Column::new("status", DataType::String)
                        .with_variants(&["pending", "confirmed", "canceled"])
                        .with_default(Value::String("pending".into())),
                ],
            },
            Table {
                name: "review".into(),
                columns: vec![
                    Column::primary_key("review_id", DataType::Integer),
                    Column::new("booking_id", DataType::Integer)
                        .not_null()
                        .references("booking", OnDelete::Cascade),
                    Column::new("rating", DataType::Integer)
                        .not_null()
                        .with_check(Check::Between(Value::Integer(1), Value::Integer(5))),
                ],
            },
        ]
    }

    fn open(guest_policy: OnDelete) -> Result<Database<MemoryEngine>> {
        let _ = env_logger::builder().is_test(true).try_init();
        Database::open(MemoryEngine::new(), booking_schema(guest_policy))
    }

    /// Four users (one guest-only), three properties, five bookings
    /// spread over 2023 and 2024, two reviews
    fn seed(db: &Database<MemoryEngine>) -> Result<()> {
        for (id, email, name) in [
            (1, "ada@x.com", "Ada"),
            (2, "bayo@x.com", "Bayo"),
            (3, "chi@x.com", "Chi"),
            (4, "didi@x.com", "Didi"),
        ] {
            db.insert(
                "user",
                vec![
                    Value::Integer(id),
                    Value::String(email.into()),
                    Value::String(name.into()),
                ],
            )?;
        }
        for (id, host, location, price) in [
            (1, 1, "kigali", 120.0),
            (2, 2, "lagos", 250.0),
            (3, 2, "kigali", 90.0),
        ] {
            db.insert(
                "property",
                vec![
                    Value::Integer(id),
                    Value::Integer(host),
                    Value::String(location.into()),
                    Value::Float(price),
                ],
            )?;
        }
        for (id, prop, user, start, end, total, status) in [
            (1, 1, 2, (2024, 6, 1), (2024, 6, 5), 480.0, "confirmed"),
            (2, 2, 1, (2024, 3, 10), (2024, 3, 12), 500.0, "confirmed"),
            (3, 1, 1, (2023, 7, 1), (2023, 7, 3), 240.0, "canceled"),
            (4, 3, 2, (2024, 8, 20), (2024, 8, 22), 180.0, "pending"),
            (5, 1, 4, (2024, 9, 1), (2024, 9, 4), 300.0, "pending"),
        ] {
            db.insert(
                "booking",
                vec![
                    Value::Integer(id),
                    Value::Integer(prop),
                    Value::Integer(user),
                    Value::date(start.0, start.1, start.2),
                    Value::date(end.0, end.1, end.2),
                    Value::Float(total),
                    Value::String(status.into()),
                ],
            )?;
        }
        for (id, booking, rating) in [(1, 1, 5), (2, 3, 2)] {
            db.insert(
                "review",
                vec![
                    Value::Integer(id),
                    Value::Integer(booking),
                    Value::Integer(rating),
                ],
            )?;
        }
        Ok(())
    }

    #[test]
    fn test_insert_get_roundtrip() -> Result<()> {
        let db = open(OnDelete::Cascade)?;
        seed(&db)?;

        // Missing trailing status takes its default
        let id = db.insert(
            "booking",
            vec![
                Value::Integer(6),
                Value::Integer(2),
                Value::Integer(3),
                Value::date(2024, 11, 1),
                Value::date(2024, 11, 3),
                Value::Float(500.0),
            ],
        )?;
        let row = db.get("booking", id)?.expect("row just inserted");
        assert_eq!(row[0], Value::Integer(6));
        assert_eq!(row[6], Value::String("pending".into()));

        assert_eq!(db.get("booking", 999)?, None);
        assert!(matches!(db.get("missing", 1), Err(Error::NotFound(_))));
        Ok(())
    }

    #[test]
    fn test_insert_constraint_violations() -> Result<()> {
        let db = open(OnDelete::Cascade)?;
        seed(&db)?;

        // NOT NULL
        let err = db.insert(
            "user",
            vec![Value::Integer(9), Value::Null, Value::String("X".into())],
        );
        assert!(matches!(err, Err(Error::ConstraintViolation(_))));

        // Enum membership
        let err = db.insert(
            "booking",
            vec![
                Value::Integer(9),
                Value::Integer(1),
                Value::Integer(1),
                Value::date(2024, 1, 1),
                Value::date(2024, 1, 2),
                Value::Float(100.0),
                Value::String("paused".into()),
            ],
        );
        assert!(matches!(err, Err(Error::ConstraintViolation(_))));

        // CHECK range on rating
        let err = db.insert(
            "review",
            vec![Value::Integer(9), Value::Integer(1), Value::Integer(6)],
        );
        assert!(matches!(err, Err(Error::ConstraintViolation(_))));

        // UNIQUE email and duplicate primary key
        let err = db.insert(
            "user",
            vec![
                Value::Integer(9),
                Value::String("ada@x.com".into()),
                Value::Null,
            ],
        );
        assert!(matches!(err, Err(Error::ConstraintViolation(_))));
        let err = db.insert(
            "user",
            vec![
                Value::Integer(1),
                Value::String("new@x.com".into()),
                Value::Null,
            ],
        );
        assert!(matches!(err, Err(Error::ConstraintViolation(_))));

        // A failed insert leaves nothing behind
        assert_eq!(db.scan("user", None)?.len(), 4);
        Ok(())
    }

    #[test]
    fn test_insert_foreign_key_missing() -> Result<()> {
        let db = open(OnDelete::Cascade)?;
        seed(&db)?;
        let err = db.insert(
            "booking",
            vec![
                Value::Integer(9),
                Value::Integer(1),
                Value::Integer(42),
                Value::date(2024, 1, 1),
                Value::date(2024, 1, 2),
                Value::Float(100.0),
            ],
        );
        assert!(matches!(err, Err(Error::ReferentialIntegrity(_))));
        Ok(())
    }

    #[test]
    fn test_delete_restrict() -> Result<()> {
        let db = open(OnDelete::Restrict)?;
        seed(&db)?;
        // Didi only appears as a booking guest; the guest relation is
        // restrict here
        let user_row_id = db
            .scan("user", None)?
            .into_iter()
            .find(|(_, row)| row[0] == Value::Integer(4))
            .map(|(id, _)| id)
            .unwrap();
        assert!(matches!(
            db.delete("user", user_row_id),
            Err(Error::ReferentialIntegrity(_))
        ));
        // Hosts are restrict in every fixture
        let host_row_id = db
            .scan("user", None)?
            .into_iter()
            .find(|(_, row)| row[0] == Value::Integer(1))
            .map(|(id, _)| id)
            .unwrap();
        assert!(matches!(
            db.delete("user", host_row_id),
            Err(Error::ReferentialIntegrity(_))
        ));
        Ok(())
    }

    #[test]
    fn test_delete_cascade_chain() -> Result<()> {
        let db = open(OnDelete::Cascade)?;
        seed(&db)?;
        let user_row_id = db
            .scan("user", None)?
            .into_iter()
            .find(|(_, row)| row[0] == Value::Integer(4))
            .map(|(id, _)| id)
            .unwrap();
        assert!(db.delete("user", user_row_id)?);

        // Didi's booking 5 went with them
        let remaining: Vec<Value> = db
            .scan("booking", None)?
            .into_iter()
            .map(|(_, row)| row[0].clone())
            .collect();
        assert_eq!(remaining.len(), 4);
        assert!(!remaining.contains(&Value::Integer(5)));

        // Deleting a property cascades through bookings into reviews
        let property_row_id = db
            .scan("property", None)?
            .into_iter()
            .find(|(_, row)| row[0] == Value::Integer(1))
            .map(|(id, _)| id)
            .unwrap();
        assert!(db.delete("property", property_row_id)?);
        assert_eq!(db.scan("booking", None)?.len(), 2);
        assert_eq!(db.scan("review", None)?.len(), 0);

        assert!(!db.delete("property", property_row_id)?);
        Ok(())
    }

    #[test]
    fn test_update_rekeys_indexes() -> Result<()> {
        let db = open(OnDelete::Cascade)?;
        seed(&db)?;
        let (row_id, _) = db.scan("user", None)?[0].clone();

        db.update(
            "user",
            row_id,
            BTreeMap::from([("email".to_string(), Value::String("ada@new.com".into()))]),
        )?;

        let index = IndexDef::name_for("user", &["email"]);
        assert_eq!(
            db.index_lookup("user", &index, &[Value::String("ada@new.com".into())], None)?,
            vec![row_id]
        );
        assert!(db
            .index_lookup("user", &index, &[Value::String("ada@x.com".into())], None)?
            .is_empty());
        Ok(())
    }

    #[test]
    fn test_update_validates() -> Result<()> {
        let db = open(OnDelete::Cascade)?;
        seed(&db)?;
        let (row_id, _) = db.scan("booking", None)?[0].clone();

        let err = db.update(
            "booking",
            row_id,
            BTreeMap::from([("status".to_string(), Value::String("paused".into()))]),
        );
        assert!(matches!(err, Err(Error::ConstraintViolation(_))));

        let err = db.update(
            "booking",
            row_id,
            BTreeMap::from([("user_id".to_string(), Value::Integer(42))]),
        );
        assert!(matches!(err, Err(Error::ReferentialIntegrity(_))));

        let err = db.update("booking", 999, BTreeMap::new());
        assert!(matches!(err, Err(Error::NotFound(_))));
        Ok(())
    }

    #[test]
    fn test_index_completeness_under_mutations() -> Result<()> {
        let db = open(OnDelete::Cascade)?;
        seed(&db)?;
        let index = db.create_index("booking", &["status"], false)?;

        let confirmed = Value::String("confirmed".into());
        let by_index = db.index_lookup("booking", &index, &[confirmed.clone()], None)?;
        assert_eq!(by_index.len(), 2);

        // Flip booking 4 to confirmed and booking 1 away, then delete 2
        let rows = db.scan("booking", None)?;
        let row_id_of = |n: i64| {
            rows.iter()
                .find(|(_, row)| row[0] == Value::Integer(n))
                .map(|(id, _)| *id)
                .unwrap()
        };
        db.update(
            "booking",
            row_id_of(4),
            BTreeMap::from([("status".to_string(), confirmed.clone())]),
        )?;
        db.update(
            "booking",
            row_id_of(1),
            BTreeMap::from([("status".to_string(), Value::String("canceled".into()))]),
        )?;
        db.delete("booking", row_id_of(2))?;

        // The index now matches a fresh heap scan exactly
        let mut by_index = db.index_lookup("booking", &index, &[confirmed.clone()], None)?;
        by_index.sort_unstable();
        let mut by_scan: Vec<RowId> = db
            .scan("booking", None)?
            .into_iter()
            .filter(|(_, row)| row[6] == confirmed)
            .map(|(id, _)| id)
            .collect();
        by_scan.sort_unstable();
        assert_eq!(by_index, by_scan);
        assert_eq!(by_index.len(), 1);
        Ok(())
    }

    #[test]
    fn test_composite_index_range_lookup() -> Result<()> {
        let db = open(OnDelete::Cascade)?;
        seed(&db)?;
        let index = db.create_index("property", &["location", "price"], false)?;

        // Prefix plus trailing range
        let ids = db.index_lookup(
            "property",
            &index,
            &[Value::String("kigali".into())],
            Some((
                Bound::Included(Value::Float(100.0)),
                Bound::Included(Value::Float(300.0)),
            )),
        )?;
        assert_eq!(ids.len(), 1);

        // Prefix alone
        let ids = db.index_lookup("property", &index, &[Value::String("kigali".into())], None)?;
        assert_eq!(ids.len(), 2);

        let selectivity = db.estimate_selectivity("property", &index)?;
        assert!(selectivity > 0.9);
        Ok(())
    }

    fn partitioned_booking_db() -> Result<Database<MemoryEngine>> {
        let db = open(OnDelete::Cascade)?;
        db.partition_by("booking", "start_date")?;
        db.add_partition(
            "booking",
            chrono::NaiveDate::from_ymd_opt(2023, 1, 1).unwrap(),
            chrono::NaiveDate::from_ymd_opt(2024, 1, 1).unwrap(),
        )?;
        db.add_partition(
            "booking",
            chrono::NaiveDate::from_ymd_opt(2024, 1, 1).unwrap(),
            chrono::NaiveDate::from_ymd_opt(2025, 1, 1).unwrap(),
        )?;
        seed(&db)?;
        Ok(db)
    }

    #[test]
    fn test_scan_partition_range() -> Result<()> {
        let db = partitioned_booking_db()?;

        let in_2024 = db.scan(
            "booking",
            Some((
                Bound::Included(chrono::NaiveDate::from_ymd_opt(2024, 1, 1).unwrap()),
                Bound::Excluded(chrono::NaiveDate::from_ymd_opt(2025, 1, 1).unwrap()),
            )),
        )?;
        assert_eq!(in_2024.len(), 4);

        let in_2023 = db.scan(
            "booking",
            Some((
                Bound::Included(chrono::NaiveDate::from_ymd_opt(2023, 1, 1).unwrap()),
                Bound::Excluded(chrono::NaiveDate::from_ymd_opt(2024, 1, 1).unwrap()),
            )),
        )?;
        assert_eq!(in_2023.len(), 1);
        assert_eq!(in_2023[0].1[0], Value::Integer(3));
        Ok(())
    }

    #[test]
    fn test_update_moves_row_across_partitions() -> Result<()> {
        let db = partitioned_booking_db()?;
        let (row_id, _) = db
            .scan("booking", None)?
            .into_iter()
            .find(|(_, row)| row[0] == Value::Integer(1))
            .unwrap();

        db.update(
            "booking",
            row_id,
            BTreeMap::from([("start_date".to_string(), Value::date(2023, 6, 1))]),
        )?;

        let in_2023: Vec<Value> = db
            .scan(
                "booking",
                Some((
                    Bound::Included(chrono::NaiveDate::from_ymd_opt(2023, 1, 1).unwrap()),
                    Bound::Excluded(chrono::NaiveDate::from_ymd_opt(2024, 1, 1).unwrap()),
                )),
            )?
            .into_iter()
            .map(|(_, row)| row[0].clone())
            .collect();
        assert!(in_2023.contains(&Value::Integer(1)));
        Ok(())
    }

    #[test]
    fn test_drop_partition_removes_rows() -> Result<()> {
        let db = partitioned_booking_db()?;
        // Partition 1 is [2023-01-01, 2024-01-01)
        db.drop_partition("booking", 1)?;
        let remaining = db.scan("booking", None)?;
        assert_eq!(remaining.len(), 4);
        assert!(remaining
            .iter()
            .all(|(_, row)| row[0] != Value::Integer(3)));
        Ok(())
    }

    #[test]
    fn test_add_partition_migrates_overflow_rows() -> Result<()> {
        let db = partitioned_booking_db()?;
        // 2025 is outside every declared range and lands in overflow
        db.insert(
            "booking",
            vec![
                Value::Integer(7),
                Value::Integer(1),
                Value::Integer(3),
                Value::date(2025, 2, 10),
                Value::date(2025, 2, 12),
                Value::Float(210.0),
            ],
        )?;
        let in_2025 = |db: &Database<MemoryEngine>| {
            db.scan(
                "booking",
                Some((
                    Bound::Included(chrono::NaiveDate::from_ymd_opt(2025, 1, 1).unwrap()),
                    Bound::Excluded(chrono::NaiveDate::from_ymd_opt(2026, 1, 1).unwrap()),
                )),
            )
        };
        // Uncovered interval: the overflow partition is scanned and the
        // row is found even before its partition exists
        assert_eq!(in_2025(&db)?.len(), 1);

        db.add_partition(
            "booking",
            chrono::NaiveDate::from_ymd_opt(2025, 1, 1).unwrap(),
            chrono::NaiveDate::from_ymd_opt(2026, 1, 1).unwrap(),
        )?;
        let rows = in_2025(&db)?;
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].1[0], Value::Integer(7));

        // Overlap with the freshly added range is rejected
        assert!(matches!(
            db.add_partition(
                "booking",
                chrono::NaiveDate::from_ymd_opt(2025, 6, 1).unwrap(),
                chrono::NaiveDate::from_ymd_opt(2025, 7, 1).unwrap(),
            ),
            Err(Error::OverlappingRange(_))
        ));
        Ok(())
    }

    #[test]
    fn test_create_unique_index_rejects_duplicates() -> Result<()> {
        let db = open(OnDelete::Cascade)?;
        seed(&db)?;
        // Two properties share the kigali location
        assert!(matches!(
            db.create_index("property", &["location"], true),
            Err(Error::ConstraintViolation(_))
        ));
        // The failed build leaves no index behind
        assert!(db.create_index("property", &["location"], false).is_ok());
        Ok(())
    }

    #[test]
    fn test_execute_filter_order_projection() -> Result<()> {
        let db = open(OnDelete::Cascade)?;
        seed(&db)?;

        let query = QueryDescriptor::from("booking")
            .filter(Predicate::eq("status", Value::String("confirmed".into())))
            .order_by("total_price", OrderDirection::Desc)
            .project(&["booking_id", "total_price"]);
        let result = db.execute(&query)?;

        assert_eq!(result.columns, vec!["booking_id", "total_price"]);
        let rows: Vec<_> = result.into_iter().collect();
        assert_eq!(
            rows,
            vec![
                vec![Value::Integer(2), Value::Float(500.0)],
                vec![Value::Integer(1), Value::Float(480.0)],
            ]
        );
        Ok(())
    }

    #[test]
    fn test_execute_prunes_to_one_partition() -> Result<()> {
        // The 2024 range must land on the second partition only and still
        // return the matching booking
        let db = open(OnDelete::Cascade)?;
        db.partition_by("booking", "start_date")?;
        db.add_partition(
            "booking",
            chrono::NaiveDate::from_ymd_opt(2023, 1, 1).unwrap(),
            chrono::NaiveDate::from_ymd_opt(2024, 1, 1).unwrap(),
        )?;
        db.add_partition(
            "booking",
            chrono::NaiveDate::from_ymd_opt(2024, 1, 1).unwrap(),
            chrono::NaiveDate::from_ymd_opt(2025, 1, 1).unwrap(),
        )?;
        db.insert(
            "user",
            vec![
                Value::Integer(1),
                Value::String("a@x.com".into()),
                Value::Null,
            ],
        )?;
        db.insert(
            "property",
            vec![
                Value::Integer(1),
                Value::Integer(1),
                Value::String("kigali".into()),
                Value::Float(120.0),
            ],
        )?;
        db.insert(
            "booking",
            vec![
                Value::Integer(1),
                Value::Integer(1),
                Value::Integer(1),
                Value::date(2024, 6, 1),
                Value::date(2024, 6, 5),
                Value::Float(480.0),
            ],
        )?;

        let map = db.with_txn(|txn| Database::load_partition_map(txn, "booking"))?.unwrap();
        let pruning = map.prune(&KeyPredicate::Range {
            low: Bound::Included(chrono::NaiveDate::from_ymd_opt(2024, 1, 1).unwrap()),
            high: Bound::Excluded(chrono::NaiveDate::from_ymd_opt(2025, 1, 1).unwrap()),
        });
        assert_eq!(pruning, Pruning::Partitions(std::collections::BTreeSet::from([2])));

        let query = QueryDescriptor::from("booking")
            .filter(Predicate::ge("start_date", Value::date(2024, 1, 1)))
            .filter(Predicate::lt("start_date", Value::date(2025, 1, 1)));
        let result = db.execute(&query)?;
        assert_eq!(result.len(), 1);
        assert_eq!(result.rows()[0][0], Value::Integer(1));
        Ok(())
    }

    #[test]
    fn test_execute_year_function_scans_all_partitions() -> Result<()> {
        let db = partitioned_booking_db()?;
        // Wrapping the key in a function defeats pruning but must still be
        // answered correctly via the fallback scan
        let query = QueryDescriptor::from("booking").filter(Predicate::Compare(
            ColumnExpr::year("start_date"),
            CmpOp::Eq,
            Value::Integer(2024),
        ));
        assert_eq!(db.execute(&query)?.len(), 4);
        Ok(())
    }

    #[test]
    fn test_execute_inner_join() -> Result<()> {
        let db = open(OnDelete::Cascade)?;
        seed(&db)?;

        let query = QueryDescriptor::from("booking")
            .join("user", JoinKind::Inner, ("booking.user_id", "user.user_id"))
            .filter(Predicate::eq("status", Value::String("confirmed".into())))
            .order_by("booking_id", OrderDirection::Asc)
            .project(&["booking_id", "user.name"]);
        let rows: Vec<_> = db.execute(&query)?.into_iter().collect();
        assert_eq!(
            rows,
            vec![
                vec![Value::Integer(1), Value::String("Bayo".into())],
                vec![Value::Integer(2), Value::String("Ada".into())],
            ]
        );

        // An index on the join key switches to lookup joins with the same
        // result
        db.create_index("booking", &["user_id"], false)?;
        let query = QueryDescriptor::from("user")
            .join("booking", JoinKind::Inner, ("user.user_id", "booking.user_id"))
            .filter(Predicate::eq("status", Value::String("confirmed".into())))
            .order_by("booking_id", OrderDirection::Asc)
            .project(&["booking_id", "user.name"]);
        let rows: Vec<_> = db.execute(&query)?.into_iter().collect();
        assert_eq!(
            rows,
            vec![
                vec![Value::Integer(1), Value::String("Bayo".into())],
                vec![Value::Integer(2), Value::String("Ada".into())],
            ]
        );
        Ok(())
    }

    #[test]
    fn test_execute_left_outer_join_pads_nulls() -> Result<()> {
        let db = open(OnDelete::Cascade)?;
        seed(&db)?;

        let query = QueryDescriptor::from("user")
            .join("booking", JoinKind::LeftOuter, ("user.user_id", "booking.user_id"))
            .order_by("user.user_id", OrderDirection::Asc)
            .project(&["name", "booking_id"]);
        let rows: Vec<_> = db.execute(&query)?.into_iter().collect();

        // Chi has no bookings and still shows up, Null-padded
        assert!(rows.contains(&vec![Value::String("Chi".into()), Value::Null]));
        assert_eq!(rows.len(), 6);
        Ok(())
    }

    #[test]
    fn test_execute_ambiguous_and_unknown_columns() -> Result<()> {
        let db = open(OnDelete::Cascade)?;
        seed(&db)?;

        let query = QueryDescriptor::from("booking")
            .join("user", JoinKind::Inner, ("booking.user_id", "user.user_id"))
            .filter(Predicate::eq("user_id", Value::Integer(1)));
        assert!(matches!(db.execute(&query), Err(Error::AmbiguousColumn(_))));

        let query = QueryDescriptor::from("booking")
            .filter(Predicate::eq("guest_count", Value::Integer(2)));
        assert!(matches!(db.execute(&query), Err(Error::UnknownColumn(_))));

        let query = QueryDescriptor::from("booking")
            .filter(Predicate::eq("total_price", Value::String("many".into())));
        assert!(matches!(db.execute(&query), Err(Error::TypeMismatch(_))));
        Ok(())
    }

    #[test]
    fn test_execute_aggregation_with_having() -> Result<()> {
        let db = open(OnDelete::Cascade)?;
        seed(&db)?;

        let query = QueryDescriptor::from("booking")
            .group_by("user_id")
            .aggregate(AggFunc::Count, "booking_id", "bookings")
            .aggregate(AggFunc::Sum, "total_price", "spent")
            .having(Predicate::gt("spent", Value::Float(400.0)))
            .order_by("user_id", OrderDirection::Asc);
        let rows: Vec<_> = db.execute(&query)?.into_iter().collect();

        assert_eq!(
            rows,
            vec![
                vec![Value::Integer(1), Value::Integer(2), Value::Float(740.0)],
                vec![Value::Integer(2), Value::Integer(2), Value::Float(660.0)],
            ]
        );
        Ok(())
    }

    #[test]
    fn test_execute_global_aggregates() -> Result<()> {
        let db = open(OnDelete::Cascade)?;
        seed(&db)?;

        let query = QueryDescriptor::from("property")
            .aggregate(AggFunc::Count, "property_id", "n")
            .aggregate(AggFunc::Min, "price", "cheapest")
            .aggregate(AggFunc::Max, "price", "dearest")
            .aggregate(AggFunc::Avg, "price", "average");
        let rows: Vec<_> = db.execute(&query)?.into_iter().collect();
        assert_eq!(
            rows,
            vec![vec![
                Value::Integer(3),
                Value::Float(90.0),
                Value::Float(250.0),
                Value::Float(460.0 / 3.0),
            ]]
        );
        Ok(())
    }

    #[test]
    fn test_execute_window_rank_per_user() -> Result<()> {
        let db = open(OnDelete::Cascade)?;
        seed(&db)?;

        let query = QueryDescriptor::from("booking")
            .window(
                Window::new(WindowFunc::Rank, "price_rank")
                    .partition_by("user_id")
                    .order_by("total_price", OrderDirection::Desc),
            )
            .order_by("booking_id", OrderDirection::Asc)
            .project(&["booking_id", "price_rank"]);
        let rows: Vec<_> = db.execute(&query)?.into_iter().collect();

        // Ada: 500 > 240; Bayo: 480 > 180; Didi: alone
        assert_eq!(
            rows,
            vec![
                vec![Value::Integer(1), Value::Integer(1)],
                vec![Value::Integer(2), Value::Integer(1)],
                vec![Value::Integer(3), Value::Integer(2)],
                vec![Value::Integer(4), Value::Integer(2)],
                vec![Value::Integer(5), Value::Integer(1)],
            ]
        );
        Ok(())
    }

    #[test]
    fn test_execute_running_sum_window() -> Result<()> {
        let db = open(OnDelete::Cascade)?;
        seed(&db)?;

        let query = QueryDescriptor::from("booking")
            .filter(Predicate::eq("user_id", Value::Integer(2)))
            .window(
                Window::new(
                    WindowFunc::RunningSum(crate::query::descriptor::ColumnRef::parse(
                        "total_price",
                    )),
                    "spend_to_date",
                )
                .order_by("start_date", OrderDirection::Asc),
            )
            .order_by("start_date", OrderDirection::Asc)
            .project(&["booking_id", "spend_to_date"]);
        let rows: Vec<_> = db.execute(&query)?.into_iter().collect();
        assert_eq!(
            rows,
            vec![
                vec![Value::Integer(1), Value::Float(480.0)],
                vec![Value::Integer(4), Value::Float(660.0)],
            ]
        );
        Ok(())
    }

    #[test]
    fn test_execute_pattern_match_post_filters() -> Result<()> {
        let db = open(OnDelete::Cascade)?;
        seed(&db)?;
        // Even with an index on location, the pattern predicate scans
        db.create_index("property", &["location"], false)?;

        let query = QueryDescriptor::from("property")
            .filter(Predicate::matches("location", "%gal%"))
            .order_by("property_id", OrderDirection::Asc)
            .project(&["property_id"]);
        let rows: Vec<_> = db.execute(&query)?.into_iter().collect();
        assert_eq!(
            rows,
            vec![vec![Value::Integer(1)], vec![Value::Integer(3)]]
        );
        Ok(())
    }

    #[test]
    fn test_execute_price_range_without_location_prefix() -> Result<()> {
        let db = open(OnDelete::Cascade)?;
        seed(&db)?;
        db.create_index("property", &["location", "price"], false)?;

        // A (location, price) index cannot serve a price-only range; the
        // fallback still answers correctly
        let query = QueryDescriptor::from("property")
            .filter(Predicate::between(
                "price",
                Value::Float(100.0),
                Value::Float(300.0),
            ))
            .order_by("property_id", OrderDirection::Asc)
            .project(&["property_id"]);
        let rows: Vec<_> = db.execute(&query)?.into_iter().collect();
        assert_eq!(
            rows,
            vec![vec![Value::Integer(1)], vec![Value::Integer(2)]]
        );
        Ok(())
    }
}
