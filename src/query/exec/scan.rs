use std::cmp::Ordering;
use std::ops::Bound;

use crate::{
    engine::{IndexDef, Pruning},
    error::Result,
    query::{
        descriptor::{ColumnRef, OrderDirection, Predicate},
        QueryAccess,
    },
    types::Value,
};

use super::{evaluate, resolve, Batch, ColumnLabel, Columns, Executor};

/// Table scan executor: visits the partitions pruning left in and applies
/// the residual filter
pub struct Scan {
    table: String,
    pruning: Pruning,
    filter: Option<Predicate>,
}

impl Scan {
    pub fn new(table: String, pruning: Pruning, filter: Option<Predicate>) -> Box<Self> {
        Box::new(Self {
            table,
            pruning,
            filter,
        })
    }
}

impl<A: QueryAccess> Executor<A> for Scan {
    fn execute(self: Box<Self>, access: &A) -> Result<Batch> {
        let schema = access.table(&self.table)?;
        let columns = table_columns(&schema);
        let rows = access.scan(&self.table, &self.pruning)?;
        filter_rows(columns, rows, &self.filter)
    }
}

/// Index scan executor: equality prefix plus optional trailing range
pub struct IndexScan {
    table: String,
    index: IndexDef,
    prefix: Vec<Value>,
    range: Option<(Bound<Value>, Bound<Value>)>,
    filter: Option<Predicate>,
}

impl IndexScan {
    pub fn new(
        table: String,
        index: IndexDef,
        prefix: Vec<Value>,
        range: Option<(Bound<Value>, Bound<Value>)>,
        filter: Option<Predicate>,
    ) -> Box<Self> {
        Box::new(Self {
            table,
            index,
            prefix,
            range,
            filter,
        })
    }
}

impl<A: QueryAccess> Executor<A> for IndexScan {
    fn execute(self: Box<Self>, access: &A) -> Result<Batch> {
        let Self {
            table,
            index,
            prefix,
            range,
            filter,
        } = *self;
        let schema = access.table(&table)?;
        let columns = table_columns(&schema);
        let rows = access.index_lookup(&index, &prefix, range)?;
        filter_rows(columns, rows, &filter)
    }
}

/// Post-filter executor for predicates that could not ride an access path
pub struct Filter<A: QueryAccess> {
    source: Box<dyn Executor<A>>,
    predicate: Predicate,
}

impl<A: QueryAccess> Filter<A> {
    pub fn new(source: Box<dyn Executor<A>>, predicate: Predicate) -> Box<Self> {
        Box::new(Self { source, predicate })
    }
}

impl<A: QueryAccess> Executor<A> for Filter<A> {
    fn execute(self: Box<Self>, access: &A) -> Result<Batch> {
        let batch = self.source.execute(access)?;
        filter_rows(batch.columns, batch.rows, &Some(self.predicate))
    }
}

/// ORDER BY executor - sorts rows by the given columns
pub struct Order<A: QueryAccess> {
    source: Box<dyn Executor<A>>,
    order_by: Vec<(ColumnRef, OrderDirection)>,
}

impl<A: QueryAccess> Order<A> {
    pub fn new(
        source: Box<dyn Executor<A>>,
        order_by: Vec<(ColumnRef, OrderDirection)>,
    ) -> Box<Self> {
        Box::new(Self { source, order_by })
    }
}

impl<A: QueryAccess> Executor<A> for Order<A> {
    fn execute(self: Box<Self>, access: &A) -> Result<Batch> {
        let Batch { columns, mut rows } = self.source.execute(access)?;

        let mut keys = Vec::with_capacity(self.order_by.len());
        for (col, direction) in &self.order_by {
            keys.push((resolve(&columns, col)?, *direction));
        }

        // Compare column by column; incomparable pairs fall through to the
        // next key instead of failing the whole sort
        rows.sort_by(|a, b| {
            for (idx, direction) in &keys {
                match a[*idx].partial_cmp(&b[*idx]) {
                    Some(Ordering::Equal) | None => {}
                    Some(o) => {
                        return if *direction == OrderDirection::Asc {
                            o
                        } else {
                            o.reverse()
                        }
                    }
                }
            }
            Ordering::Equal
        });

        Ok(Batch { columns, rows })
    }
}

/// Projection executor - narrows the batch to the named columns
pub struct Projection<A: QueryAccess> {
    source: Box<dyn Executor<A>>,
    columns: Vec<ColumnRef>,
}

impl<A: QueryAccess> Projection<A> {
    pub fn new(source: Box<dyn Executor<A>>, columns: Vec<ColumnRef>) -> Box<Self> {
        Box::new(Self { source, columns })
    }
}

impl<A: QueryAccess> Executor<A> for Projection<A> {
    fn execute(self: Box<Self>, access: &A) -> Result<Batch> {
        let batch = self.source.execute(access)?;

        let mut picked = Vec::with_capacity(self.columns.len());
        for col in &self.columns {
            picked.push(resolve(&batch.columns, col)?);
        }

        let columns = picked.iter().map(|i| batch.columns[*i].clone()).collect();
        let rows = batch
            .rows
            .into_iter()
            .map(|row| picked.iter().map(|i| row[*i].clone()).collect())
            .collect();
        Ok(Batch { columns, rows })
    }
}

pub(super) fn table_columns(schema: &crate::schema::Table) -> Columns {
    schema
        .columns
        .iter()
        .map(|c| ColumnLabel {
            table: schema.name.clone(),
            name: c.name.clone(),
        })
        .collect()
}

fn filter_rows(
    columns: Columns,
    rows: Vec<crate::types::Row>,
    filter: &Option<Predicate>,
) -> Result<Batch> {
    let rows = match filter {
        Some(predicate) => rows
            .into_iter()
            .filter_map(|row| match evaluate(predicate, &columns, &row) {
                Ok(true) => Some(Ok(row)),
                Ok(false) => None,
                Err(err) => Some(Err(err)),
            })
            .collect::<Result<Vec<_>>>()?,
        None => rows,
    };
    Ok(Batch { columns, rows })
}
