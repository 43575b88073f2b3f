use std::cmp::Ordering;

use crate::{
    error::{Error, Result},
    query::{
        descriptor::{ColumnExpr, ColumnRef, CmpOp, Predicate},
        plan::Node,
        QueryAccess,
    },
    types::{Row, Value},
};

mod agg;
mod join;
mod scan;
mod window;

use agg::HashAggregate;
use join::{IndexLookupJoin, NestedLoopJoin};
use scan::{Filter, IndexScan, Order, Projection, Scan};
use window::WindowStage;

/// A column flowing through the pipeline, tagged with its source table.
/// Computed columns (aggregates, window functions) carry an empty table.
#[derive(Debug, Clone, PartialEq)]
pub struct ColumnLabel {
    pub table: String,
    pub name: String,
}

pub type Columns = Vec<ColumnLabel>;

/// Intermediate result flowing between executors
#[derive(Debug, PartialEq)]
pub struct Batch {
    pub columns: Columns,
    pub rows: Vec<Row>,
}

/// Plan-node executor
pub trait Executor<A: QueryAccess> {
    fn execute(self: Box<Self>, access: &A) -> Result<Batch>;
}

/// Builds an executor tree from a plan node
impl<A: QueryAccess + 'static> dyn Executor<A> {
    pub fn build(node: Node) -> Box<dyn Executor<A>> {
        match node {
            Node::Scan {
                table,
                pruning,
                filter,
            } => Scan::new(table, pruning, filter),
            Node::IndexScan {
                table,
                index,
                prefix,
                range,
                filter,
            } => IndexScan::new(table, index, prefix, range, filter),
            Node::Filter { source, predicate } => Filter::new(Self::build(*source), predicate),
            Node::NestedLoopJoin {
                left,
                right,
                kind,
                on,
                flipped,
            } => NestedLoopJoin::new(Self::build(*left), Self::build(*right), kind, on, flipped),
            Node::IndexLookupJoin {
                left,
                table,
                index,
                kind,
                on,
            } => IndexLookupJoin::new(Self::build(*left), table, index, kind, on),
            Node::Aggregate {
                source,
                aggregates,
                group_by,
                having,
            } => HashAggregate::new(Self::build(*source), aggregates, group_by, having),
            Node::Window { source, windows } => WindowStage::new(Self::build(*source), windows),
            Node::Order { source, order_by } => Order::new(Self::build(*source), order_by),
            Node::Projection { source, columns } => Projection::new(Self::build(*source), columns),
        }
    }
}

/// Finished query result: named columns and the matching rows.
/// Iterating consumes the rows; re-running the descriptor restarts the
/// pipeline on a fresh snapshot.
#[derive(Debug, PartialEq)]
pub struct ResultSet {
    pub columns: Vec<String>,
    rows: Vec<Row>,
}

impl ResultSet {
    /// Short names where unambiguous, table-qualified otherwise
    pub(crate) fn from_batch(batch: Batch) -> Self {
        let columns = batch
            .columns
            .iter()
            .map(|label| {
                let dupes = batch
                    .columns
                    .iter()
                    .filter(|other| other.name == label.name)
                    .count();
                if dupes > 1 && !label.table.is_empty() {
                    format!("{}.{}", label.table, label.name)
                } else {
                    label.name.clone()
                }
            })
            .collect();
        Self {
            columns,
            rows: batch.rows,
        }
    }

    pub fn rows(&self) -> &[Row] {
        &self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

impl IntoIterator for ResultSet {
    type Item = Row;
    type IntoIter = std::vec::IntoIter<Row>;

    /// Lazy, finite stream of result rows; the iterator running out is the
    /// end-of-stream marker
    fn into_iter(self) -> Self::IntoIter {
        self.rows.into_iter()
    }
}

/// Resolves a column reference against the columns in scope
pub(crate) fn resolve(columns: &Columns, r: &ColumnRef) -> Result<usize> {
    match &r.table {
        Some(table) => columns
            .iter()
            .position(|c| &c.table == table && c.name == r.column)
            .ok_or(Error::UnknownColumn(r.to_string())),
        None => {
            let mut hits = columns
                .iter()
                .enumerate()
                .filter(|(_, c)| c.name == r.column);
            match (hits.next(), hits.next()) {
                (Some((idx, _)), None) => Ok(idx),
                (Some(_), Some(_)) => Err(Error::AmbiguousColumn(r.to_string())),
                (None, _) => Err(Error::UnknownColumn(r.to_string())),
            }
        }
    }
}

/// Evaluates a column expression for one row
pub(crate) fn eval_expr(expr: &ColumnExpr, columns: &Columns, row: &Row) -> Result<Value> {
    match expr {
        ColumnExpr::Column(r) => Ok(row[resolve(columns, r)?].clone()),
        ColumnExpr::Year(r) => match &row[resolve(columns, r)?] {
            Value::Null => Ok(Value::Null),
            Value::Date(d) => Ok(Value::Integer(chrono::Datelike::year(d) as i64)),
            other => Err(Error::TypeMismatch(format!(
                "year() needs a date, got {}",
                other
            ))),
        },
    }
}

/// Compares two values; Null never compares (SQL three-valued logic
/// collapses to false at the predicate level)
fn compare(lhs: &Value, rhs: &Value) -> Result<Option<Ordering>> {
    if lhs.is_null() || rhs.is_null() {
        return Ok(None);
    }
    lhs.partial_cmp(rhs)
        .map(Some)
        .ok_or(Error::TypeMismatch(format!(
            "cannot compare {} with {}",
            lhs, rhs
        )))
}

/// Evaluates a predicate for one row
pub(crate) fn evaluate(predicate: &Predicate, columns: &Columns, row: &Row) -> Result<bool> {
    match predicate {
        Predicate::All(predicates) => {
            for p in predicates {
                if !evaluate(p, columns, row)? {
                    return Ok(false);
                }
            }
            Ok(true)
        }
        Predicate::Compare(expr, op, value) => {
            let lhs = eval_expr(expr, columns, row)?;
            let Some(ord) = compare(&lhs, value)? else {
                return Ok(false);
            };
            Ok(match op {
                CmpOp::Eq => ord == Ordering::Equal,
                CmpOp::Ne => ord != Ordering::Equal,
                CmpOp::Lt => ord == Ordering::Less,
                CmpOp::Le => ord != Ordering::Greater,
                CmpOp::Gt => ord == Ordering::Greater,
                CmpOp::Ge => ord != Ordering::Less,
            })
        }
        Predicate::Between(expr, low, high) => {
            let lhs = eval_expr(expr, columns, row)?;
            let (Some(lo), Some(hi)) = (compare(&lhs, low)?, compare(&lhs, high)?) else {
                return Ok(false);
            };
            Ok(lo != Ordering::Less && hi != Ordering::Greater)
        }
        Predicate::Matches(r, pattern) => match &row[resolve(columns, r)?] {
            Value::Null => Ok(false),
            Value::String(s) => Ok(text_matches(pattern, s)),
            other => Err(Error::TypeMismatch(format!(
                "pattern match needs a string, got {}",
                other
            ))),
        },
    }
}

/// SQL LIKE-style matching: `%` matches any run, `_` any single character
fn text_matches(pattern: &str, text: &str) -> bool {
    fn inner(p: &[char], t: &[char]) -> bool {
        match p.first() {
            None => t.is_empty(),
            Some('%') => inner(&p[1..], t) || (!t.is_empty() && inner(p, &t[1..])),
            Some('_') => !t.is_empty() && inner(&p[1..], &t[1..]),
            Some(c) => t.first() == Some(c) && inner(&p[1..], &t[1..]),
        }
    }
    let p: Vec<char> = pattern.chars().collect();
    let t: Vec<char> = text.chars().collect();
    inner(&p, &t)
}
