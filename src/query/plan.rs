use std::collections::HashMap;
use std::ops::Bound;

use chrono::NaiveDate;
use log::debug;

use crate::{
    engine::{IndexDef, KeyPredicate, Pruning},
    error::{Error, Result},
    query::{
        descriptor::{
            ColumnExpr, ColumnRef, CmpOp, JoinKind, Predicate, QueryDescriptor, WindowFunc,
        },
        exec::{Executor, ResultSet},
        QueryAccess,
    },
    schema::Table,
    types::{DataType, Value},
};

use super::descriptor::{Aggregate, OrderDirection, Window};

/// Execution plan node tree
#[derive(Debug)]
pub enum Node {
    /// Heap scan over the partitions pruning left in
    Scan {
        table: String,
        pruning: Pruning,
        filter: Option<Predicate>,
    },
    /// Index scan: equality prefix plus optional trailing range; residual
    /// predicates applied as a post-filter
    IndexScan {
        table: String,
        index: IndexDef,
        prefix: Vec<Value>,
        range: Option<(Bound<Value>, Bound<Value>)>,
        filter: Option<Predicate>,
    },
    Filter {
        source: Box<Node>,
        predicate: Predicate,
    },
    /// Nested-loop equality join; `flipped` drives from the right side
    /// when it is the smaller one
    NestedLoopJoin {
        left: Box<Node>,
        right: Box<Node>,
        kind: JoinKind,
        on: (ColumnRef, ColumnRef),
        flipped: bool,
    },
    /// Per-left-row index lookup into the joined table
    IndexLookupJoin {
        left: Box<Node>,
        table: String,
        index: IndexDef,
        kind: JoinKind,
        on: (ColumnRef, ColumnRef),
    },
    Aggregate {
        source: Box<Node>,
        aggregates: Vec<Aggregate>,
        group_by: Vec<ColumnRef>,
        having: Option<Predicate>,
    },
    Window {
        source: Box<Node>,
        windows: Vec<Window>,
    },
    Order {
        source: Box<Node>,
        order_by: Vec<(ColumnRef, OrderDirection)>,
    },
    Projection {
        source: Box<Node>,
        columns: Vec<ColumnRef>,
    },
}

/// Execution plan for one query descriptor
#[derive(Debug)]
pub struct Plan(pub Node);

impl Plan {
    pub fn build<A: QueryAccess>(query: &QueryDescriptor, access: &A) -> Result<Plan> {
        Planner { access }.build(query)
    }

    pub fn execute<A: QueryAccess + 'static>(self, access: &A) -> Result<ResultSet> {
        let batch = <dyn Executor<A>>::build(self.0).execute(access)?;
        Ok(ResultSet::from_batch(batch))
    }
}

/// Chooses access paths: partition pruning first, then the cheapest
/// applicable index (or full scan), then join order by estimated size
struct Planner<'a, A: QueryAccess> {
    access: &'a A,
}

impl<'a, A: QueryAccess> Planner<'a, A> {
    fn build(&self, query: &QueryDescriptor) -> Result<Plan> {
        let mut scope = vec![self.access.table(&query.table)?];
        for join in &query.joins {
            scope.push(self.access.table(&join.table)?);
        }

        // Every conjunct names exactly one table; cross-table conditions
        // only occur as join equalities
        let mut by_table: HashMap<String, Vec<Predicate>> = HashMap::new();
        for conjunct in flatten(query.predicate.clone()) {
            let owner = owner_table(&conjunct, &scope)?;
            by_table.entry(owner).or_default().push(conjunct);
        }

        let base_conjuncts = by_table.remove(&query.table).unwrap_or_default();
        let mut node = self.access_path(&scope[0], base_conjuncts)?;
        let mut left_estimate = self.access.count_rows(&query.table)?;

        for (join, right_schema) in query.joins.iter().zip(scope.iter().skip(1)) {
            let (left_col, right_col) =
                join_sides(&join.on, &scope, right_schema)?;
            let right_conjuncts = by_table.remove(&right_schema.name).unwrap_or_default();
            let right_estimate = self.access.count_rows(&right_schema.name)?;

            // An index whose leading column is the join key turns the join
            // into per-row lookups
            let lookup_index = self
                .access
                .indexes(&right_schema.name)?
                .into_iter()
                .filter(|def| def.columns.first() == Some(&right_col.column))
                .min_by_key(|def| def.columns.len());

            node = match lookup_index {
                Some(index) => {
                    debug!(
                        "join {}: index lookup via {}",
                        right_schema.name, index.name
                    );
                    let join_node = Node::IndexLookupJoin {
                        left: Box::new(node),
                        table: right_schema.name.clone(),
                        index,
                        kind: join.kind,
                        on: (left_col, right_col),
                    };
                    // Lookups cannot pre-apply the table's own predicates
                    with_filter(join_node, right_conjuncts)
                }
                None => {
                    let flipped = join.kind == JoinKind::Inner && right_estimate < left_estimate;
                    debug!(
                        "join {}: nested loop, driving from the {} side",
                        right_schema.name,
                        if flipped { "right" } else { "left" }
                    );
                    let residual = match join.kind {
                        // Outer joins must re-check right-side predicates
                        // after Null padding
                        JoinKind::LeftOuter => right_conjuncts.clone(),
                        JoinKind::Inner => Vec::new(),
                    };
                    let right = self.access_path(right_schema, right_conjuncts)?;
                    let join_node = Node::NestedLoopJoin {
                        left: Box::new(node),
                        right: Box::new(right),
                        kind: join.kind,
                        on: (left_col, right_col),
                        flipped,
                    };
                    with_filter(join_node, residual)
                }
            };
            left_estimate = left_estimate.max(right_estimate);
        }

        if !query.aggregates.is_empty() || !query.group_by.is_empty() {
            node = Node::Aggregate {
                source: Box::new(node),
                aggregates: query.aggregates.clone(),
                group_by: query.group_by.clone(),
                having: query.having.clone(),
            };
        } else if query.having.is_some() {
            return Err(Error::Internal(
                "HAVING requires aggregation or grouping".into(),
            ));
        }

        if !query.windows.is_empty() {
            for window in &query.windows {
                if let WindowFunc::Ntile(n) = window.func {
                    if n == 0 {
                        return Err(Error::Internal("ntile needs at least one bucket".into()));
                    }
                }
            }
            node = Node::Window {
                source: Box::new(node),
                windows: query.windows.clone(),
            };
        }

        if !query.order_by.is_empty() {
            node = Node::Order {
                source: Box::new(node),
                order_by: query.order_by.clone(),
            };
        }

        if !query.projection.is_empty() {
            node = Node::Projection {
                source: Box::new(node),
                columns: query.projection.clone(),
            };
        }

        Ok(Plan(node))
    }

    /// Access path for one table: prune partitions, then pick the cheapest
    /// applicable index under the threshold, else scan
    fn access_path(&self, schema: &Table, conjuncts: Vec<Predicate>) -> Result<Node> {
        let pruning = match self.access.partition_map(&schema.name)? {
            Some(map) => map.prune(&partition_key_predicate(&map.column, &conjuncts)),
            None => Pruning::All,
        };

        let heap_rows = self.access.count_rows(&schema.name)?;
        let mut best: Option<(IndexDef, Vec<Value>, IndexRange, Vec<usize>, usize)> = None;

        for def in self.access.indexes(&schema.name)? {
            let Some((prefix, range, used)) = match_index(&def, &conjuncts) else {
                continue;
            };
            // A mistyped literal cannot ride the index; the scan path
            // surfaces it as a type error instead of an empty result
            if !lookup_types_match(schema, &def, &prefix, &range) {
                continue;
            }
            let (distinct, entries) = self.access.index_stats(&def)?;
            let estimated = if range.is_none() {
                entries / distinct.max(1)
            } else {
                // Ranges are assumed to hit about half the entries
                entries / 2
            };
            // The index must actually narrow the scan
            if estimated >= heap_rows && heap_rows > 0 {
                continue;
            }
            if best.as_ref().map_or(true, |(.., e)| estimated < *e) {
                best = Some((def, prefix, range, used, estimated));
            }
        }

        match best {
            Some((index, prefix, range, used, estimated)) => {
                debug!(
                    "table {}: index scan via {} (estimated {} rows)",
                    schema.name, index.name, estimated
                );
                let residual: Vec<Predicate> = conjuncts
                    .into_iter()
                    .enumerate()
                    .filter(|(i, _)| !used.contains(i))
                    .map(|(_, p)| p)
                    .collect();
                Ok(Node::IndexScan {
                    table: schema.name.clone(),
                    index,
                    prefix,
                    range,
                    filter: conjoin(residual),
                })
            }
            None => {
                debug!("table {}: full scan", schema.name);
                Ok(Node::Scan {
                    table: schema.name.clone(),
                    pruning,
                    filter: conjoin(conjuncts),
                })
            }
        }
    }
}

type IndexRange = Option<(Bound<Value>, Bound<Value>)>;

/// Flattens a predicate tree into its conjuncts
fn flatten(predicate: Option<Predicate>) -> Vec<Predicate> {
    let mut out = Vec::new();
    let mut stack: Vec<Predicate> = predicate.into_iter().collect();
    while let Some(p) = stack.pop() {
        match p {
            Predicate::All(list) => stack.extend(list),
            other => out.push(other),
        }
    }
    out.reverse();
    out
}

/// Rebuilds a conjunction, or None when nothing is left
fn conjoin(mut conjuncts: Vec<Predicate>) -> Option<Predicate> {
    match conjuncts.len() {
        0 => None,
        1 => conjuncts.pop(),
        _ => Some(Predicate::All(conjuncts)),
    }
}

fn with_filter(node: Node, conjuncts: Vec<Predicate>) -> Node {
    match conjoin(conjuncts) {
        Some(predicate) => Node::Filter {
            source: Box::new(node),
            predicate,
        },
        None => node,
    }
}

fn predicate_column(predicate: &Predicate) -> &ColumnRef {
    match predicate {
        Predicate::Compare(expr, _, _) | Predicate::Between(expr, _, _) => expr.column_ref(),
        Predicate::Matches(r, _) => r,
        Predicate::All(_) => unreachable!("conjunctions are flattened first"),
    }
}

/// Names the one table a conjunct refers to
fn owner_table(predicate: &Predicate, scope: &[Table]) -> Result<String> {
    let r = predicate_column(predicate);
    match &r.table {
        Some(table) => {
            let schema = scope
                .iter()
                .find(|t| &t.name == table)
                .ok_or(Error::UnknownColumn(r.to_string()))?;
            schema.get_col_index(&r.column)?;
            Ok(table.clone())
        }
        None => {
            let mut hits = scope
                .iter()
                .filter(|t| t.columns.iter().any(|c| c.name == r.column));
            match (hits.next(), hits.next()) {
                (Some(schema), None) => Ok(schema.name.clone()),
                (Some(_), Some(_)) => Err(Error::AmbiguousColumn(r.to_string())),
                (None, _) => Err(Error::UnknownColumn(r.to_string())),
            }
        }
    }
}

/// Normalizes a join condition into (left side, right side) references
fn join_sides(
    on: &(ColumnRef, ColumnRef),
    scope: &[Table],
    right: &Table,
) -> Result<(ColumnRef, ColumnRef)> {
    let belongs_right = |r: &ColumnRef| -> Result<bool> {
        match &r.table {
            Some(table) => Ok(table == &right.name),
            None => {
                let in_right = right.columns.iter().any(|c| c.name == r.column);
                let in_left = scope
                    .iter()
                    .take_while(|t| t.name != right.name)
                    .any(|t| t.columns.iter().any(|c| c.name == r.column));
                if in_right && in_left {
                    return Err(Error::AmbiguousColumn(r.to_string()));
                }
                Ok(in_right)
            }
        }
    };
    match (belongs_right(&on.0)?, belongs_right(&on.1)?) {
        (false, true) => Ok((on.0.clone(), on.1.clone())),
        (true, false) => Ok((on.1.clone(), on.0.clone())),
        _ => Err(Error::Internal(format!(
            "join condition {} = {} must name one column per side",
            on.0, on.1
        ))),
    }
}

/// Distills the conjuncts into what the partition router can use: a plain
/// date range on the key column, an opaque (function-wrapped) reference,
/// or no constraint at all
fn partition_key_predicate(key_column: &str, conjuncts: &[Predicate]) -> KeyPredicate {
    let mut low: Option<NaiveDate> = None;
    let mut high: Option<NaiveDate> = None;
    let mut constrained = false;

    let tighten_low = |d: NaiveDate, low: &mut Option<NaiveDate>| {
        *low = Some(low.map_or(d, |cur| cur.max(d)));
    };
    let tighten_high = |d: NaiveDate, high: &mut Option<NaiveDate>| {
        *high = Some(high.map_or(d, |cur| cur.min(d)));
    };

    for conjunct in conjuncts {
        if predicate_column(conjunct).column != key_column {
            continue;
        }
        match conjunct {
            Predicate::Compare(ColumnExpr::Year(_), _, _) => return KeyPredicate::Opaque,
            Predicate::Compare(ColumnExpr::Column(_), op, Value::Date(d)) => {
                match op {
                    CmpOp::Eq => {
                        tighten_low(*d, &mut low);
                        tighten_high(next_day(*d), &mut high);
                    }
                    CmpOp::Ge => tighten_low(*d, &mut low),
                    CmpOp::Gt => tighten_low(next_day(*d), &mut low),
                    CmpOp::Le => tighten_high(next_day(*d), &mut high),
                    CmpOp::Lt => tighten_high(*d, &mut high),
                    // An inequality excludes one day, not a range
                    CmpOp::Ne => continue,
                }
                constrained = true;
            }
            Predicate::Between(ColumnExpr::Column(_), Value::Date(a), Value::Date(b)) => {
                constrained = true;
                tighten_low(*a, &mut low);
                tighten_high(next_day(*b), &mut high);
            }
            _ => {}
        }
    }

    if !constrained {
        return KeyPredicate::Unconstrained;
    }
    KeyPredicate::Range {
        low: low.map_or(Bound::Unbounded, Bound::Included),
        high: high.map_or(Bound::Unbounded, Bound::Excluded),
    }
}

fn next_day(d: NaiveDate) -> NaiveDate {
    d.succ_opt().unwrap_or(NaiveDate::MAX)
}

/// Whether every lookup literal matches its indexed column's type
/// (Integer and Float interchange, as in value comparison)
fn lookup_types_match(
    schema: &Table,
    def: &IndexDef,
    prefix: &[Value],
    range: &IndexRange,
) -> bool {
    let compatible = |column: &str, value: &Value| {
        let Ok(idx) = schema.get_col_index(column) else {
            return false;
        };
        match (schema.columns[idx].datatype, value.datatype()) {
            (_, None) => true,
            (dt, Some(vt)) if dt == vt => true,
            (DataType::Integer, Some(DataType::Float))
            | (DataType::Float, Some(DataType::Integer)) => true,
            _ => false,
        }
    };

    for (column, value) in def.columns.iter().zip(prefix) {
        if !compatible(column, value) {
            return false;
        }
    }
    if let Some((low, high)) = range {
        let column = &def.columns[prefix.len()];
        for bound in [low, high] {
            if let Bound::Included(v) | Bound::Excluded(v) = bound {
                if !compatible(column, v) {
                    return false;
                }
            }
        }
    }
    true
}

/// Matches an index against the conjuncts: equality values for a leading
/// column prefix, then at most one range over the next column. Returns the
/// prefix, the range, and which conjuncts were consumed.
fn match_index(
    def: &IndexDef,
    conjuncts: &[Predicate],
) -> Option<(Vec<Value>, IndexRange, Vec<usize>)> {
    let mut prefix = Vec::new();
    let mut used = Vec::new();

    for column in &def.columns {
        // Equality on this column extends the prefix
        let eq = conjuncts.iter().enumerate().find(|(i, p)| {
            !used.contains(i)
                && matches!(p, Predicate::Compare(ColumnExpr::Column(r), CmpOp::Eq, _)
                    if &r.column == column)
        });
        if let Some((i, Predicate::Compare(_, _, value))) = eq {
            prefix.push(value.clone());
            used.push(i);
            continue;
        }

        // Otherwise gather range bounds on this column and stop
        let mut low = Bound::Unbounded;
        let mut high = Bound::Unbounded;
        let mut found = false;
        for (i, p) in conjuncts.iter().enumerate() {
            if used.contains(&i) {
                continue;
            }
            match p {
                Predicate::Compare(ColumnExpr::Column(r), op, value) if &r.column == column => {
                    match op {
                        CmpOp::Gt => low = Bound::Excluded(value.clone()),
                        CmpOp::Ge => low = Bound::Included(value.clone()),
                        CmpOp::Lt => high = Bound::Excluded(value.clone()),
                        CmpOp::Le => high = Bound::Included(value.clone()),
                        CmpOp::Eq | CmpOp::Ne => continue,
                    }
                    used.push(i);
                    found = true;
                }
                Predicate::Between(ColumnExpr::Column(r), a, b) if &r.column == column => {
                    low = Bound::Included(a.clone());
                    high = Bound::Included(b.clone());
                    used.push(i);
                    found = true;
                }
                _ => {}
            }
        }
        if found {
            return Some((prefix, Some((low, high)), used));
        }
        break;
    }

    if prefix.is_empty() {
        return None;
    }
    Some((prefix, None, used))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flatten_nested_conjunctions() {
        let p = Predicate::All(vec![
            Predicate::eq("a", Value::Integer(1)),
            Predicate::All(vec![
                Predicate::gt("b", Value::Integer(2)),
                Predicate::lt("c", Value::Integer(3)),
            ]),
        ]);
        assert_eq!(flatten(Some(p)).len(), 3);
        assert!(flatten(None).is_empty());
    }

    #[test]
    fn test_partition_key_predicate_range() {
        let conjuncts = vec![
            Predicate::ge("start_date", Value::date(2024, 1, 1)),
            Predicate::lt("start_date", Value::date(2025, 1, 1)),
            Predicate::eq("status", Value::String("confirmed".into())),
        ];
        let kp = partition_key_predicate("start_date", &conjuncts);
        assert_eq!(
            kp,
            KeyPredicate::Range {
                low: Bound::Included(NaiveDate::from_ymd_opt(2024, 1, 1).unwrap()),
                high: Bound::Excluded(NaiveDate::from_ymd_opt(2025, 1, 1).unwrap()),
            }
        );
    }

    #[test]
    fn test_partition_key_predicate_function_is_opaque() {
        // YEAR(start_date) = 2024 defeats pruning and must say so
        let conjuncts = vec![Predicate::Compare(
            ColumnExpr::year("start_date"),
            CmpOp::Eq,
            Value::Integer(2024),
        )];
        assert_eq!(
            partition_key_predicate("start_date", &conjuncts),
            KeyPredicate::Opaque
        );
    }

    #[test]
    fn test_partition_key_predicate_unconstrained() {
        let conjuncts = vec![Predicate::eq("status", Value::String("ok".into()))];
        assert_eq!(
            partition_key_predicate("start_date", &conjuncts),
            KeyPredicate::Unconstrained
        );
    }

    fn composite_index() -> IndexDef {
        IndexDef {
            name: "property_location_price_idx".into(),
            table: "property".into(),
            columns: vec!["location".into(), "price".into()],
            unique: false,
        }
    }

    #[test]
    fn test_match_index_prefix_then_range() {
        let conjuncts = vec![
            Predicate::eq("location", Value::String("kigali".into())),
            Predicate::between("price", Value::Float(100.0), Value::Float(300.0)),
        ];
        let (prefix, range, used) = match_index(&composite_index(), &conjuncts).unwrap();
        assert_eq!(prefix, vec![Value::String("kigali".into())]);
        assert_eq!(
            range,
            Some((
                Bound::Included(Value::Float(100.0)),
                Bound::Included(Value::Float(300.0))
            ))
        );
        assert_eq!(used.len(), 2);
    }

    #[test]
    fn test_match_index_rejects_non_prefix() {
        // price alone cannot use a (location, price) index
        let conjuncts = vec![Predicate::between(
            "price",
            Value::Float(100.0),
            Value::Float(300.0),
        )];
        assert!(match_index(&composite_index(), &conjuncts).is_none());
    }

    #[test]
    fn test_match_index_ignores_pattern_predicates() {
        let def = IndexDef {
            name: "property_location_idx".into(),
            table: "property".into(),
            columns: vec!["location".into()],
            unique: false,
        };
        let conjuncts = vec![Predicate::matches("location", "%gali%")];
        assert!(match_index(&def, &conjuncts).is_none());
    }
}
