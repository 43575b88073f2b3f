use std::cmp::Ordering;
use std::collections::HashMap;

use crate::{
    error::{Error, Result},
    query::{
        descriptor::{OrderDirection, Window, WindowFunc},
        QueryAccess,
    },
    storage::keycode::encode_tuple,
    types::{Row, Value},
};

use super::{resolve, Batch, ColumnLabel, Columns, Executor};

/// Window-function executor: for each window, partitions the input by the
/// PARTITION BY key, stable-sorts every partition by its ORDER BY key,
/// computes the function, and appends the result as a new column. Input
/// row order is preserved in the output.
pub struct WindowStage<A: QueryAccess> {
    source: Box<dyn Executor<A>>,
    windows: Vec<Window>,
}

impl<A: QueryAccess> WindowStage<A> {
    pub fn new(source: Box<dyn Executor<A>>, windows: Vec<Window>) -> Box<Self> {
        Box::new(Self { source, windows })
    }
}

impl<A: QueryAccess> Executor<A> for WindowStage<A> {
    fn execute(self: Box<Self>, access: &A) -> Result<Batch> {
        let Batch { mut columns, rows } = self.source.execute(access)?;

        // Every window resolves against the input columns; aliases become
        // visible only downstream of this stage
        let mut computed: Vec<Vec<Value>> = Vec::with_capacity(self.windows.len());
        for window in &self.windows {
            computed.push(compute_window(window, &columns, &rows)?);
        }
        for window in &self.windows {
            columns.push(ColumnLabel {
                table: String::new(),
                name: window.alias.clone(),
            });
        }

        let rows = rows
            .into_iter()
            .enumerate()
            .map(|(i, mut row)| {
                for values in &computed {
                    row.push(values[i].clone());
                }
                row
            })
            .collect();

        Ok(Batch { columns, rows })
    }
}

/// Computes one window function; result is aligned with the input rows
fn compute_window(window: &Window, columns: &Columns, rows: &[Row]) -> Result<Vec<Value>> {
    let mut part_idx = Vec::with_capacity(window.partition_by.len());
    for col in &window.partition_by {
        part_idx.push(resolve(columns, col)?);
    }
    let mut order_idx = Vec::with_capacity(window.order_by.len());
    for (col, direction) in &window.order_by {
        order_idx.push((resolve(columns, col)?, *direction));
    }
    let source_idx = match &window.func {
        WindowFunc::Lag(col) | WindowFunc::Lead(col) | WindowFunc::RunningSum(col) => {
            Some(resolve(columns, col)?)
        }
        _ => None,
    };

    // Partition rows, remembering each row's original position; partitions
    // keep first-seen order, rows keep input order within a partition
    let mut partitions: Vec<Vec<usize>> = Vec::new();
    let mut seen: HashMap<Vec<u8>, usize> = HashMap::new();
    for (i, row) in rows.iter().enumerate() {
        let key: Vec<Value> = part_idx.iter().map(|p| row[*p].clone()).collect();
        let encoded = encode_tuple(&key);
        match seen.get(&encoded) {
            Some(&at) => partitions[at].push(i),
            None => {
                seen.insert(encoded, partitions.len());
                partitions.push(vec![i]);
            }
        }
    }

    let mut out = vec![Value::Null; rows.len()];
    for mut members in partitions {
        // Stable sort: ties keep their input order
        members.sort_by(|&a, &b| order_keys_cmp(&rows[a], &rows[b], &order_idx));
        let values = evaluate_function(&window.func, &members, rows, &order_idx, source_idx)?;
        for (member, value) in members.into_iter().zip(values) {
            out[member] = value;
        }
    }
    Ok(out)
}

fn order_keys_cmp(a: &Row, b: &Row, order_idx: &[(usize, OrderDirection)]) -> Ordering {
    for (idx, direction) in order_idx {
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
}

/// Whether two sorted neighbors tie on the ORDER BY key
fn ties(a: &Row, b: &Row, order_idx: &[(usize, OrderDirection)]) -> bool {
    order_keys_cmp(a, b, order_idx) == Ordering::Equal
}

fn evaluate_function(
    func: &WindowFunc,
    members: &[usize],
    rows: &[Row],
    order_idx: &[(usize, OrderDirection)],
    source_idx: Option<usize>,
) -> Result<Vec<Value>> {
    let len = members.len();
    let mut values = Vec::with_capacity(len);
    match func {
        WindowFunc::RowNumber => {
            // Strict 1-based counter, ties and all
            for n in 1..=len {
                values.push(Value::Integer(n as i64));
            }
        }
        WindowFunc::Rank => {
            // Ties share a rank; the next distinct key skips past them
            let mut rank = 1i64;
            for (pos, &member) in members.iter().enumerate() {
                if pos > 0 && !ties(&rows[member], &rows[members[pos - 1]], order_idx) {
                    rank = pos as i64 + 1;
                }
                values.push(Value::Integer(rank));
            }
        }
        WindowFunc::DenseRank => {
            // Ties share a rank with no gaps after them
            let mut rank = 1i64;
            for (pos, &member) in members.iter().enumerate() {
                if pos > 0 && !ties(&rows[member], &rows[members[pos - 1]], order_idx) {
                    rank += 1;
                }
                values.push(Value::Integer(rank));
            }
        }
        WindowFunc::Ntile(n) => {
            // Near-equal buckets, larger buckets first when uneven
            let n = *n;
            let base = len / n;
            let extra = len % n;
            for pos in 0..len {
                let bucket = if base == 0 {
                    pos
                } else if pos < extra * (base + 1) {
                    pos / (base + 1)
                } else {
                    extra + (pos - extra * (base + 1)) / base
                };
                values.push(Value::Integer(bucket as i64 + 1));
            }
        }
        WindowFunc::Lag(_) => {
            let idx = source_idx.expect("lag resolves its source column");
            for pos in 0..len {
                values.push(match pos.checked_sub(1) {
                    Some(prev) => rows[members[prev]][idx].clone(),
                    None => Value::Null,
                });
            }
        }
        WindowFunc::Lead(_) => {
            let idx = source_idx.expect("lead resolves its source column");
            for pos in 0..len {
                values.push(match members.get(pos + 1) {
                    Some(&next) => rows[next][idx].clone(),
                    None => Value::Null,
                });
            }
        }
        WindowFunc::RunningSum(_) => {
            let idx = source_idx.expect("running sum resolves its source column");
            let mut acc: Option<f64> = None;
            for &member in members {
                match &rows[member][idx] {
                    Value::Null => {}
                    Value::Integer(v) => acc = Some(acc.unwrap_or(0.0) + *v as f64),
                    Value::Float(v) => acc = Some(acc.unwrap_or(0.0) + v),
                    other => {
                        return Err(Error::TypeMismatch(format!(
                            "running sum over non-numeric value {}",
                            other
                        )))
                    }
                }
                values.push(acc.map_or(Value::Null, Value::Float));
            }
        }
    }
    Ok(values)
}
