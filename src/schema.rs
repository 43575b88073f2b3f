use serde::{Deserialize, Serialize};

use crate::{
    error::{Error, Result},
    types::{DataType, Row, Value},
};

/// Table schema definition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Table {
    pub name: String,
    pub columns: Vec<Column>,
}

impl Table {
    /// Validates table schema
    pub fn validate(&self) -> Result<()> {
        if self.columns.is_empty() {
            return Err(Error::Internal(format!(
                "table {} has no columns",
                self.name
            )));
        }

        match self.columns.iter().filter(|c| c.primary_key).count() {
            1 => {}
            0 => {
                return Err(Error::Internal(format!(
                    "no primary key for table {}",
                    self.name
                )))
            }
            _ => {
                return Err(Error::Internal(format!(
                    "multiple primary keys for table {}",
                    self.name
                )))
            }
        }

        for col in &self.columns {
            if col.primary_key && col.nullable {
                return Err(Error::Internal(format!(
                    "primary key column {} cannot be nullable",
                    col.name
                )));
            }
            if col.variants.is_some() && col.datatype != DataType::String {
                return Err(Error::Internal(format!(
                    "enum column {} must have string type",
                    col.name
                )));
            }
            if let Some(default) = &col.default {
                if !default.is_null() && default.datatype() != Some(col.datatype) {
                    return Err(Error::Internal(format!(
                        "default value for column {} has wrong type",
                        col.name
                    )));
                }
            }
        }

        Ok(())
    }

    /// Returns the position of the primary key column
    pub fn primary_key_index(&self) -> usize {
        self.columns
            .iter()
            .position(|c| c.primary_key)
            .expect("validated table has a primary key")
    }

    /// Extracts the primary key value from a row
    pub fn get_primary_key(&self, row: &Row) -> Value {
        row[self.primary_key_index()].clone()
    }

    /// Returns the column index for a given column name
    pub fn get_col_index(&self, col_name: &str) -> Result<usize> {
        self.columns
            .iter()
            .position(|c| c.name == col_name)
            .ok_or(Error::UnknownColumn(format!(
                "{}.{}",
                self.name, col_name
            )))
    }
}

/// Column schema definition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Column {
    pub name: String,
    pub datatype: DataType,
    pub nullable: bool,
    pub default: Option<Value>,
    /// Whether this column is the primary key
    pub primary_key: bool,
    /// Whether non-null values must be unique across the heap
    pub unique: bool,
    /// Closed set of allowed string values (enum column)
    pub variants: Option<Vec<String>>,
    /// CHECK constraint applied to non-null values
    pub check: Option<Check>,
    /// Foreign key reference to another table's primary key
    pub references: Option<ForeignKey>,
}

impl Column {
    /// Plain column with no constraints beyond the data type
    pub fn new(name: impl Into<String>, datatype: DataType) -> Self {
        Self {
            name: name.into(),
            datatype,
            nullable: true,
            default: None,
            primary_key: false,
            unique: false,
            variants: None,
            check: None,
            references: None,
        }
    }

    pub fn primary_key(name: impl Into<String>, datatype: DataType) -> Self {
        Self {
            nullable: false,
            primary_key: true,
            ..Self::new(name, datatype)
        }
    }

    pub fn not_null(mut self) -> Self {
        self.nullable = false;
        self
    }

    pub fn unique(mut self) -> Self {
        self.unique = true;
        self
    }

    pub fn with_default(mut self, value: Value) -> Self {
        self.default = Some(value);
        self
    }

    pub fn with_variants(mut self, variants: &[&str]) -> Self {
        self.variants = Some(variants.iter().map(|v| v.to_string()).collect());
        self
    }

    pub fn with_check(mut self, check: Check) -> Self {
        self.check = Some(check);
        self
    }

    pub fn references(mut self, table: impl Into<String>, on_delete: OnDelete) -> Self {
        self.references = Some(ForeignKey {
            table: table.into(),
            on_delete,
        });
        self
    }

    /// Validates a single value against this column's NOT NULL, type,
    /// enum-membership and CHECK constraints
    pub fn validate_value(&self, value: &Value) -> Result<()> {
        match value.datatype() {
            None if self.nullable => return Ok(()),
            None => {
                return Err(Error::ConstraintViolation(format!(
                    "column {} cannot be null",
                    self.name
                )))
            }
            Some(dt) if dt != self.datatype => {
                return Err(Error::ConstraintViolation(format!(
                    "column {} expects {:?}, got {:?}",
                    self.name, self.datatype, dt
                )))
            }
            Some(_) => {}
        }

        if let (Some(variants), Value::String(s)) = (&self.variants, value) {
            if !variants.iter().any(|v| v == s) {
                return Err(Error::ConstraintViolation(format!(
                    "value {} is not a variant of column {}",
                    s, self.name
                )));
            }
        }

        if let Some(check) = &self.check {
            check.validate(&self.name, value)?;
        }

        Ok(())
    }
}

/// CHECK constraint forms
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Check {
    /// low <= value <= high
    Between(Value, Value),
    /// value is one of the listed constants
    OneOf(Vec<Value>),
    /// value > bound
    GreaterThan(Value),
}

impl Check {
    fn validate(&self, col_name: &str, value: &Value) -> Result<()> {
        let ok = match self {
            Check::Between(low, high) => {
                matches!(value.partial_cmp(low), Some(o) if o.is_ge())
                    && matches!(value.partial_cmp(high), Some(o) if o.is_le())
            }
            Check::OneOf(allowed) => allowed.contains(value),
            Check::GreaterThan(bound) => {
                matches!(value.partial_cmp(bound), Some(o) if o.is_gt())
            }
        };
        if ok {
            Ok(())
        } else {
            Err(Error::ConstraintViolation(format!(
                "value {} fails check on column {}",
                value, col_name
            )))
        }
    }
}

/// Foreign key relation from this column to another table's primary key
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForeignKey {
    pub table: String,
    pub on_delete: OnDelete,
}

/// Delete policy for rows referenced through a foreign key
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum OnDelete {
    /// Reject the delete while referencing rows exist
    Restrict,
    /// Delete referencing rows along with the target
    Cascade,
}
