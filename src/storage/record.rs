use crate::core::{DomainError, Result, Value};
use std::collections::BTreeMap;
use std::fmt;

static NULL: Value = Value::Null;

/// A flat persistence row: column name to value, tagged with its table.
#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    table: String,
    values: BTreeMap<String, Value>,
}

impl Record {
    pub fn new(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            values: BTreeMap::new(),
        }
    }

    pub fn from_values(table: impl Into<String>, values: BTreeMap<String, Value>) -> Self {
        Self {
            table: table.into(),
            values,
        }
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    pub fn with(mut self, column: impl Into<String>, value: impl Into<Value>) -> Self {
        self.set(column, value);
        self
    }

    pub fn set(&mut self, column: impl Into<String>, value: impl Into<Value>) {
        self.values.insert(column.into(), value.into());
    }

    /// `Null` for absent columns.
    pub fn get(&self, column: &str) -> &Value {
        self.values.get(column).unwrap_or(&NULL)
    }

    pub fn contains(&self, column: &str) -> bool {
        self.values.contains_key(column)
    }

    pub fn remove(&mut self, column: &str) -> Option<Value> {
        self.values.remove(column)
    }

    pub fn values(&self) -> &BTreeMap<String, Value> {
        &self.values
    }

    pub fn into_values(self) -> BTreeMap<String, Value> {
        self.values
    }

    /// Stable textual key over `columns`, used for primary-key lookups and row locks.
    pub fn key(&self, columns: &[String]) -> Result<String> {
        let mut parts = Vec::with_capacity(columns.len());
        for column in columns {
            let value = self.get(column);
            if value.is_null() {
                return Err(DomainError::Database(format!(
                    "{}.{} is part of the primary key and cannot be null",
                    self.table, column
                )));
            }
            parts.push(value.to_string());
        }
        Ok(parts.join("|"))
    }
}

impl fmt::Display for Record {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}(", self.table)?;
        for (i, (column, value)) in self.values.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}={}", column, value)?;
        }
        write!(f, ")")
    }
}
