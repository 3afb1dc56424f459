use super::Record;
use crate::core::{Result, Value};
use std::cmp::Ordering;

#[derive(Debug, Clone, PartialEq)]
pub enum Condition {
    Eq(Value),
    In(Vec<Value>),
    Lte(Value),
    Lt(Value),
    Gte(Value),
    Gt(Value),
    IsNull,
    NotNull,
}

impl Condition {
    fn matches(&self, value: &Value) -> Result<bool> {
        let ordered = |bound: &Value, accept: fn(Ordering) -> bool| -> Result<bool> {
            if value.is_null() || bound.is_null() {
                return Ok(false);
            }
            Ok(accept(value.compare(bound)?))
        };
        match self {
            Self::Eq(expected) => Ok(value == expected),
            Self::In(options) => Ok(options.iter().any(|o| o == value)),
            Self::Lte(bound) => ordered(bound, Ordering::is_le),
            Self::Lt(bound) => ordered(bound, Ordering::is_lt),
            Self::Gte(bound) => ordered(bound, Ordering::is_ge),
            Self::Gt(bound) => ordered(bound, Ordering::is_gt),
            Self::IsNull => Ok(value.is_null()),
            Self::NotNull => Ok(!value.is_null()),
        }
    }
}

/// Conjunction of per-column conditions.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Filter {
    conditions: Vec<(String, Condition)>,
}

impl Filter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn condition(mut self, column: impl Into<String>, condition: Condition) -> Self {
        self.conditions.push((column.into(), condition));
        self
    }

    pub fn eq(self, column: impl Into<String>, value: impl Into<Value>) -> Self {
        self.condition(column, Condition::Eq(value.into()))
    }

    pub fn is_in<I, V>(self, column: impl Into<String>, values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        self.condition(
            column,
            Condition::In(values.into_iter().map(Into::into).collect()),
        )
    }

    pub fn lte(self, column: impl Into<String>, value: impl Into<Value>) -> Self {
        self.condition(column, Condition::Lte(value.into()))
    }

    pub fn lt(self, column: impl Into<String>, value: impl Into<Value>) -> Self {
        self.condition(column, Condition::Lt(value.into()))
    }

    pub fn gte(self, column: impl Into<String>, value: impl Into<Value>) -> Self {
        self.condition(column, Condition::Gte(value.into()))
    }

    pub fn gt(self, column: impl Into<String>, value: impl Into<Value>) -> Self {
        self.condition(column, Condition::Gt(value.into()))
    }

    pub fn is_null(self, column: impl Into<String>) -> Self {
        self.condition(column, Condition::IsNull)
    }

    pub fn not_null(self, column: impl Into<String>) -> Self {
        self.condition(column, Condition::NotNull)
    }

    /// Equality on every column of `values`.
    pub fn from_columns<'a, I>(values: I) -> Self
    where
        I: IntoIterator<Item = (&'a String, &'a Value)>,
    {
        values
            .into_iter()
            .fold(Self::new(), |f, (column, value)| f.eq(column.clone(), value.clone()))
    }

    pub fn and(mut self, other: Filter) -> Self {
        self.conditions.extend(other.conditions);
        self
    }

    pub fn conditions(&self) -> &[(String, Condition)] {
        &self.conditions
    }

    pub fn is_empty(&self) -> bool {
        self.conditions.is_empty()
    }

    pub fn matches(&self, record: &Record) -> Result<bool> {
        for (column, condition) in &self.conditions {
            if !condition.matches(record.get(column))? {
                return Ok(false);
            }
        }
        Ok(true)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortOrder {
    Asc,
    Desc,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueryOptions {
    pub order_by: Vec<(String, SortOrder)>,
    pub limit: Option<usize>,
    pub offset: Option<usize>,
}

impl QueryOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn order_by(mut self, column: impl Into<String>, order: SortOrder) -> Self {
        self.order_by.push((column.into(), order));
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn offset(mut self, offset: usize) -> Self {
        self.offset = Some(offset);
        self
    }

    /// Sorts, then skips and truncates. Incomparable values keep their order.
    pub fn apply(&self, mut records: Vec<Record>) -> Vec<Record> {
        if !self.order_by.is_empty() {
            records.sort_by(|a, b| {
                for (column, order) in &self.order_by {
                    let ord = a
                        .get(column)
                        .compare(b.get(column))
                        .unwrap_or(Ordering::Equal);
                    let ord = match order {
                        SortOrder::Asc => ord,
                        SortOrder::Desc => ord.reverse(),
                    };
                    if ord != Ordering::Equal {
                        return ord;
                    }
                }
                Ordering::Equal
            });
        }
        let offset = self.offset.unwrap_or(0);
        let limit = self.limit.unwrap_or(usize::MAX);
        records.into_iter().skip(offset).take(limit).collect()
    }
}
