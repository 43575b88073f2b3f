//! Structured query descriptors. Callers build these directly; turning SQL
//! text into a descriptor is someone else's job.

use crate::types::Value;

/// A query: one base table, optional joins, predicates, aggregation,
/// window functions, ordering and projection
#[derive(Debug, Clone, PartialEq)]
pub struct QueryDescriptor {
    pub table: String,
    pub predicate: Option<Predicate>,
    pub joins: Vec<Join>,
    pub aggregates: Vec<Aggregate>,
    pub group_by: Vec<ColumnRef>,
    pub having: Option<Predicate>,
    pub windows: Vec<Window>,
    pub order_by: Vec<(ColumnRef, OrderDirection)>,
    /// Empty means all columns
    pub projection: Vec<ColumnRef>,
}

impl QueryDescriptor {
    pub fn from(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            predicate: None,
            joins: Vec::new(),
            aggregates: Vec::new(),
            group_by: Vec::new(),
            having: None,
            windows: Vec::new(),
            order_by: Vec::new(),
            projection: Vec::new(),
        }
    }

    /// Adds a predicate, conjoining with any existing one
    pub fn filter(mut self, predicate: Predicate) -> Self {
        self.predicate = Some(match self.predicate.take() {
            Some(existing) => Predicate::All(vec![existing, predicate]),
            None => predicate,
        });
        self
    }

    pub fn join(mut self, table: impl Into<String>, kind: JoinKind, on: (&str, &str)) -> Self {
        self.joins.push(Join {
            table: table.into(),
            kind,
            on: (ColumnRef::parse(on.0), ColumnRef::parse(on.1)),
        });
        self
    }

    pub fn aggregate(mut self, func: AggFunc, column: &str, alias: &str) -> Self {
        self.aggregates.push(Aggregate {
            func,
            column: ColumnRef::parse(column),
            alias: alias.into(),
        });
        self
    }

    pub fn group_by(mut self, column: &str) -> Self {
        self.group_by.push(ColumnRef::parse(column));
        self
    }

    pub fn having(mut self, predicate: Predicate) -> Self {
        self.having = Some(predicate);
        self
    }

    pub fn window(mut self, window: Window) -> Self {
        self.windows.push(window);
        self
    }

    pub fn order_by(mut self, column: &str, direction: OrderDirection) -> Self {
        self.order_by.push((ColumnRef::parse(column), direction));
        self
    }

    pub fn project(mut self, columns: &[&str]) -> Self {
        self.projection = columns.iter().map(|c| ColumnRef::parse(c)).collect();
        self
    }
}

/// Reference to a column, optionally qualified with its table name.
/// Unqualified references that match more than one joined table are
/// rejected as ambiguous.
#[derive(Debug, Clone, PartialEq)]
pub struct ColumnRef {
    pub table: Option<String>,
    pub column: String,
}

impl ColumnRef {
    /// Parses `"column"` or `"table.column"`
    pub fn parse(s: &str) -> Self {
        match s.split_once('.') {
            Some((table, column)) => Self {
                table: Some(table.into()),
                column: column.into(),
            },
            None => Self {
                table: None,
                column: s.into(),
            },
        }
    }
}

impl std::fmt::Display for ColumnRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.table {
            Some(table) => write!(f, "{}.{}", table, self.column),
            None => write!(f, "{}", self.column),
        }
    }
}

/// Left-hand side of a comparison: a column, or a function of one.
/// Function-wrapped columns defeat both index use and partition pruning.
#[derive(Debug, Clone, PartialEq)]
pub enum ColumnExpr {
    Column(ColumnRef),
    /// Year component of a date column
    Year(ColumnRef),
}

impl ColumnExpr {
    pub fn column(s: &str) -> Self {
        Self::Column(ColumnRef::parse(s))
    }

    pub fn year(s: &str) -> Self {
        Self::Year(ColumnRef::parse(s))
    }

    pub fn column_ref(&self) -> &ColumnRef {
        match self {
            Self::Column(r) | Self::Year(r) => r,
        }
    }
}

/// Predicate tree: conjunctions of column comparisons
#[derive(Debug, Clone, PartialEq)]
pub enum Predicate {
    /// All sub-predicates hold
    All(Vec<Predicate>),
    Compare(ColumnExpr, CmpOp, Value),
    /// low <= column <= high
    Between(ColumnExpr, Value, Value),
    /// SQL LIKE-style pattern with `%` and `_` wildcards; never served by
    /// an index
    Matches(ColumnRef, String),
}

impl Predicate {
    pub fn eq(column: &str, value: Value) -> Self {
        Self::Compare(ColumnExpr::column(column), CmpOp::Eq, value)
    }

    pub fn ne(column: &str, value: Value) -> Self {
        Self::Compare(ColumnExpr::column(column), CmpOp::Ne, value)
    }

    pub fn lt(column: &str, value: Value) -> Self {
        Self::Compare(ColumnExpr::column(column), CmpOp::Lt, value)
    }

    pub fn le(column: &str, value: Value) -> Self {
        Self::Compare(ColumnExpr::column(column), CmpOp::Le, value)
    }

    pub fn gt(column: &str, value: Value) -> Self {
        Self::Compare(ColumnExpr::column(column), CmpOp::Gt, value)
    }

    pub fn ge(column: &str, value: Value) -> Self {
        Self::Compare(ColumnExpr::column(column), CmpOp::Ge, value)
    }

    pub fn between(column: &str, low: Value, high: Value) -> Self {
        Self::Between(ColumnExpr::column(column), low, high)
    }

    pub fn matches(column: &str, pattern: &str) -> Self {
        Self::Matches(ColumnRef::parse(column), pattern.into())
    }

    pub fn all(predicates: Vec<Predicate>) -> Self {
        Self::All(predicates)
    }
}

/// Comparison operators
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum CmpOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

/// One join clause against the accumulated left side
#[derive(Debug, Clone, PartialEq)]
pub struct Join {
    pub table: String,
    pub kind: JoinKind,
    /// Equality condition; one side must resolve into the left input, the
    /// other into the joined table
    pub on: (ColumnRef, ColumnRef),
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum JoinKind {
    Inner,
    LeftOuter,
}

/// Sort direction (ascending or descending)
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum OrderDirection {
    Asc,
    Desc,
}

/// Aggregate expression
#[derive(Debug, Clone, PartialEq)]
pub struct Aggregate {
    pub func: AggFunc,
    pub column: ColumnRef,
    pub alias: String,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum AggFunc {
    Count,
    Sum,
    Avg,
    Min,
    Max,
}

/// Window function over a partitioned, ordered view of the row stream
#[derive(Debug, Clone, PartialEq)]
pub struct Window {
    pub func: WindowFunc,
    pub partition_by: Vec<ColumnRef>,
    pub order_by: Vec<(ColumnRef, OrderDirection)>,
    /// Output column name
    pub alias: String,
}

impl Window {
    pub fn new(func: WindowFunc, alias: &str) -> Self {
        Self {
            func,
            partition_by: Vec::new(),
            order_by: Vec::new(),
            alias: alias.into(),
        }
    }

    pub fn partition_by(mut self, column: &str) -> Self {
        self.partition_by.push(ColumnRef::parse(column));
        self
    }

    pub fn order_by(mut self, column: &str, direction: OrderDirection) -> Self {
        self.order_by.push((ColumnRef::parse(column), direction));
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum WindowFunc {
    RowNumber,
    /// Standard tie semantics: equal sort keys share a rank and leave gaps
    Rank,
    /// Ties share a rank without gaps
    DenseRank,
    /// n near-equal buckets, larger buckets first
    Ntile(usize),
    /// Value of the column on the previous row in partition order
    Lag(ColumnRef),
    /// Value of the column on the next row in partition order
    Lead(ColumnRef),
    /// Cumulative sum of the column in partition order
    RunningSum(ColumnRef),
}
