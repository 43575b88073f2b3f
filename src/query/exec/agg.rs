use std::collections::HashMap;

use crate::{
    error::{Error, Result},
    query::{
        descriptor::{AggFunc, Aggregate, ColumnRef, Predicate},
        QueryAccess,
    },
    storage::keycode::encode_tuple,
    types::{Row, Value},
};

use super::{evaluate, resolve, Batch, ColumnLabel, Executor};

/// Aggregation executor: hash-groups rows by the GROUP BY key, runs each
/// aggregate per group, then applies HAVING over the grouped output.
/// Output order is unspecified beyond grouping.
pub struct HashAggregate<A: QueryAccess> {
    source: Box<dyn Executor<A>>,
    aggregates: Vec<Aggregate>,
    group_by: Vec<ColumnRef>,
    having: Option<Predicate>,
}

impl<A: QueryAccess> HashAggregate<A> {
    pub fn new(
        source: Box<dyn Executor<A>>,
        aggregates: Vec<Aggregate>,
        group_by: Vec<ColumnRef>,
        having: Option<Predicate>,
    ) -> Box<Self> {
        Box::new(Self {
            source,
            aggregates,
            group_by,
            having,
        })
    }
}

impl<A: QueryAccess> Executor<A> for HashAggregate<A> {
    fn execute(self: Box<Self>, access: &A) -> Result<Batch> {
        let batch = self.source.execute(access)?;

        let mut group_idx = Vec::with_capacity(self.group_by.len());
        for col in &self.group_by {
            group_idx.push(resolve(&batch.columns, col)?);
        }
        let mut agg_idx = Vec::with_capacity(self.aggregates.len());
        for agg in &self.aggregates {
            agg_idx.push(resolve(&batch.columns, &agg.column)?);
        }

        // Group rows by their encoded key; first-seen order is kept so the
        // output is deterministic even though no order is promised
        let mut groups: Vec<(Vec<Value>, Vec<Row>)> = Vec::new();
        let mut seen: HashMap<Vec<u8>, usize> = HashMap::new();
        if group_idx.is_empty() {
            // A global aggregate is one group, even over zero rows
            groups.push((Vec::new(), batch.rows));
        } else {
            for row in batch.rows {
                let key: Vec<Value> = group_idx.iter().map(|i| row[*i].clone()).collect();
                let encoded = encode_tuple(&key);
                match seen.get(&encoded) {
                    Some(&at) => groups[at].1.push(row),
                    None => {
                        seen.insert(encoded, groups.len());
                        groups.push((key, vec![row]));
                    }
                }
            }
        }

        let mut columns: Vec<ColumnLabel> = group_idx
            .iter()
            .map(|i| batch.columns[*i].clone())
            .collect();
        for agg in &self.aggregates {
            columns.push(ColumnLabel {
                table: String::new(),
                name: agg.alias.clone(),
            });
        }

        let mut rows = Vec::with_capacity(groups.len());
        for (key, group_rows) in groups {
            let mut out = key;
            for (agg, idx) in self.aggregates.iter().zip(agg_idx.iter()) {
                let calculator = <dyn Calculator>::build(agg.func);
                out.push(calculator.calc(*idx, &group_rows)?);
            }
            rows.push(out);
        }

        if let Some(having) = &self.having {
            rows = rows
                .into_iter()
                .filter_map(|row| match evaluate(having, &columns, &row) {
                    Ok(true) => Some(Ok(row)),
                    Ok(false) => None,
                    Err(err) => Some(Err(err)),
                })
                .collect::<Result<Vec<_>>>()?;
        }

        Ok(Batch { columns, rows })
    }
}

/// Trait for aggregate function calculations over one group
pub trait Calculator {
    fn calc(&self, col: usize, rows: &[Row]) -> Result<Value>;
}

impl dyn Calculator {
    pub fn build(func: AggFunc) -> Box<dyn Calculator> {
        match func {
            AggFunc::Count => Count::new(),
            AggFunc::Sum => Sum::new(),
            AggFunc::Avg => Avg::new(),
            AggFunc::Min => Min::new(),
            AggFunc::Max => Max::new(),
        }
    }
}

/// COUNT - counts non-null values in a column
pub struct Count;

impl Count {
    fn new() -> Box<Self> {
        Box::new(Self {})
    }
}

impl Calculator for Count {
    fn calc(&self, col: usize, rows: &[Row]) -> Result<Value> {
        Ok(Value::Integer(
            rows.iter().filter(|row| !row[col].is_null()).count() as i64,
        ))
    }
}

/// SUM - numeric sum of a column, Null over an all-null group
pub struct Sum;

impl Sum {
    fn new() -> Box<Self> {
        Box::new(Self {})
    }
}

impl Calculator for Sum {
    fn calc(&self, col: usize, rows: &[Row]) -> Result<Value> {
        let mut sum = None;
        for row in rows {
            match &row[col] {
                Value::Null => {}
                Value::Integer(v) => sum = Some(sum.unwrap_or(0.0) + *v as f64),
                Value::Float(v) => sum = Some(sum.unwrap_or(0.0) + v),
                other => {
                    return Err(Error::TypeMismatch(format!(
                        "sum over non-numeric value {}",
                        other
                    )))
                }
            }
        }
        Ok(sum.map_or(Value::Null, Value::Float))
    }
}

/// AVG = SUM / COUNT
pub struct Avg;

impl Avg {
    fn new() -> Box<Self> {
        Box::new(Self {})
    }
}

impl Calculator for Avg {
    fn calc(&self, col: usize, rows: &[Row]) -> Result<Value> {
        let sum = Sum::new().calc(col, rows)?;
        let count = Count::new().calc(col, rows)?;
        Ok(match (sum, count) {
            (Value::Float(s), Value::Integer(c)) if c > 0 => Value::Float(s / c as f64),
            _ => Value::Null,
        })
    }
}

/// MIN - smallest non-null value
pub struct Min;

impl Min {
    fn new() -> Box<Self> {
        Box::new(Self {})
    }
}

impl Calculator for Min {
    fn calc(&self, col: usize, rows: &[Row]) -> Result<Value> {
        fold_extreme(col, rows, std::cmp::Ordering::Less)
    }
}

/// MAX - largest non-null value
pub struct Max;

impl Max {
    fn new() -> Box<Self> {
        Box::new(Self {})
    }
}

impl Calculator for Max {
    fn calc(&self, col: usize, rows: &[Row]) -> Result<Value> {
        fold_extreme(col, rows, std::cmp::Ordering::Greater)
    }
}

fn fold_extreme(col: usize, rows: &[Row], keep: std::cmp::Ordering) -> Result<Value> {
    let mut best: Option<&Value> = None;
    for row in rows {
        let value = &row[col];
        if value.is_null() {
            continue;
        }
        best = Some(match best {
            None => value,
            Some(current) => {
                let ord = value.partial_cmp(current).ok_or(Error::TypeMismatch(
                    format!("cannot compare {} with {}", value, current),
                ))?;
                if ord == keep {
                    value
                } else {
                    current
                }
            }
        });
    }
    Ok(best.cloned().unwrap_or(Value::Null))
}
