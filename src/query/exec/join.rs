use std::cmp::Ordering;

use crate::{
    engine::IndexDef,
    error::Result,
    query::{
        descriptor::{ColumnRef, JoinKind},
        QueryAccess,
    },
    types::{Row, Value},
};

use super::{resolve, scan::table_columns, Batch, Executor};

/// Nested-loop equality join. The planner flips the driving side when the
/// right input is the smaller one; output columns stay in (left, right)
/// order either way.
pub struct NestedLoopJoin<A: QueryAccess> {
    left: Box<dyn Executor<A>>,
    right: Box<dyn Executor<A>>,
    kind: JoinKind,
    on: (ColumnRef, ColumnRef),
    flipped: bool,
}

impl<A: QueryAccess> NestedLoopJoin<A> {
    pub fn new(
        left: Box<dyn Executor<A>>,
        right: Box<dyn Executor<A>>,
        kind: JoinKind,
        on: (ColumnRef, ColumnRef),
        flipped: bool,
    ) -> Box<Self> {
        Box::new(Self {
            left,
            right,
            kind,
            on,
            flipped,
        })
    }
}

impl<A: QueryAccess> Executor<A> for NestedLoopJoin<A> {
    fn execute(self: Box<Self>, access: &A) -> Result<Batch> {
        let left = self.left.execute(access)?;
        let right = self.right.execute(access)?;

        let left_idx = resolve(&left.columns, &self.on.0)?;
        let right_idx = resolve(&right.columns, &self.on.1)?;

        let mut columns = left.columns;
        columns.extend(right.columns.iter().cloned());
        let right_width = right.columns.len();

        let mut rows = Vec::new();
        if self.flipped {
            // Inner join driven from the smaller right side
            for rrow in &right.rows {
                for lrow in &left.rows {
                    if keys_match(&lrow[left_idx], &rrow[right_idx]) {
                        rows.push(combine(lrow, rrow));
                    }
                }
            }
        } else {
            for lrow in &left.rows {
                let mut matched = false;
                for rrow in &right.rows {
                    if keys_match(&lrow[left_idx], &rrow[right_idx]) {
                        rows.push(combine(lrow, rrow));
                        matched = true;
                    }
                }
                if self.kind == JoinKind::LeftOuter && !matched {
                    rows.push(pad_right(lrow, right_width));
                }
            }
        }

        Ok(Batch { columns, rows })
    }
}

/// Index-lookup join: probes the joined table's index once per left row
pub struct IndexLookupJoin<A: QueryAccess> {
    left: Box<dyn Executor<A>>,
    table: String,
    index: IndexDef,
    kind: JoinKind,
    on: (ColumnRef, ColumnRef),
}

impl<A: QueryAccess> IndexLookupJoin<A> {
    pub fn new(
        left: Box<dyn Executor<A>>,
        table: String,
        index: IndexDef,
        kind: JoinKind,
        on: (ColumnRef, ColumnRef),
    ) -> Box<Self> {
        Box::new(Self {
            left,
            table,
            index,
            kind,
            on,
        })
    }
}

impl<A: QueryAccess> Executor<A> for IndexLookupJoin<A> {
    fn execute(self: Box<Self>, access: &A) -> Result<Batch> {
        let left = self.left.execute(access)?;
        let schema = access.table(&self.table)?;
        let right_columns = table_columns(&schema);

        let left_idx = resolve(&left.columns, &self.on.0)?;
        let right_width = right_columns.len();

        let mut columns = left.columns;
        columns.extend(right_columns);

        let mut rows = Vec::new();
        for lrow in &left.rows {
            let key = &lrow[left_idx];
            let mut matched = false;
            if !key.is_null() {
                for rrow in
                    access.index_lookup(&self.index, std::slice::from_ref(key), None)?
                {
                    rows.push(combine(lrow, &rrow));
                    matched = true;
                }
            }
            if self.kind == JoinKind::LeftOuter && !matched {
                rows.push(pad_right(lrow, right_width));
            }
        }

        Ok(Batch { columns, rows })
    }
}

/// Join keys match when both are non-null and compare equal
fn keys_match(l: &Value, r: &Value) -> bool {
    !l.is_null() && !r.is_null() && l.partial_cmp(r) == Some(Ordering::Equal)
}

fn combine(lrow: &Row, rrow: &Row) -> Row {
    let mut row = lrow.clone();
    row.extend(rrow.iter().cloned());
    row
}

/// Null-pads the right side of an unmatched outer-join row
fn pad_right(lrow: &Row, right_width: usize) -> Row {
    let mut row = lrow.clone();
    row.extend(std::iter::repeat(Value::Null).take(right_width));
    row
}
