//! Immutable query criteria.
//!
//! A `Criteria` describes which rows a selector should return. Every builder
//! method consumes the value and returns a new one, so a repository scope
//! can be shared and extended without ever mutating the original.

use crate::row::Row;
use crate::value::Value;
use std::cmp::Ordering;

/// Sort direction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum OrderDirection {
    #[default]
    Asc,
    Desc,
}

/// ORDER BY entry.
#[derive(Debug, Clone, PartialEq)]
pub struct OrderBy {
    pub column: String,
    pub direction: OrderDirection,
}

impl OrderBy {
    pub fn asc(column: impl Into<String>) -> Self {
        Self {
            column: column.into(),
            direction: OrderDirection::Asc,
        }
    }

    pub fn desc(column: impl Into<String>) -> Self {
        Self {
            column: column.into(),
            direction: OrderDirection::Desc,
        }
    }
}

/// A single filter predicate.
#[derive(Debug, Clone, PartialEq)]
pub enum Filter {
    /// `column = value` (NULL matches NULL)
    Eq(String, Value),
    /// `column IN (values)`
    In(String, Vec<Value>),
}

impl Filter {
    pub fn column(&self) -> &str {
        match self {
            Filter::Eq(column, _) | Filter::In(column, _) => column,
        }
    }

    fn matches(&self, row: &Row) -> bool {
        let actual = row.get(self.column()).unwrap_or(&Value::Null);
        match self {
            Filter::Eq(_, expected) => actual.key_eq(expected),
            Filter::In(_, values) => values.iter().any(|v| actual.key_eq(v)),
        }
    }
}

/// Immutable description of a selection: filters combined with AND,
/// ordering, limit and offset.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Criteria {
    filters: Vec<Filter>,
    order_by: Vec<OrderBy>,
    limit: Option<usize>,
    offset: Option<usize>,
}

impl Criteria {
    pub fn new() -> Self {
        Self::default()
    }

    /// Criteria matching `column = value`.
    pub fn eq(column: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::new().where_eq(column, value)
    }

    #[must_use]
    pub fn where_eq(mut self, column: impl Into<String>, value: impl Into<Value>) -> Self {
        self.filters.push(Filter::Eq(column.into(), value.into()));
        self
    }

    #[must_use]
    pub fn where_in<I, V>(mut self, column: impl Into<String>, values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        self.filters.push(Filter::In(
            column.into(),
            values.into_iter().map(Into::into).collect(),
        ));
        self
    }

    /// Add every column of `row` as an equality filter.
    #[must_use]
    pub fn where_row(self, row: &Row) -> Self {
        row.iter()
            .fold(self, |criteria, (column, value)| {
                criteria.where_eq(column, value.clone())
            })
    }

    #[must_use]
    pub fn order_by(mut self, order: OrderBy) -> Self {
        self.order_by.push(order);
        self
    }

    #[must_use]
    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    #[must_use]
    pub fn offset(mut self, offset: usize) -> Self {
        self.offset = Some(offset);
        self
    }

    /// Combine with another criteria: filters and ordering are appended,
    /// limit and offset of `other` win when set.
    #[must_use]
    pub fn merge(mut self, other: &Criteria) -> Self {
        self.filters.extend(other.filters.iter().cloned());
        self.order_by.extend(other.order_by.iter().cloned());
        if other.limit.is_some() {
            self.limit = other.limit;
        }
        if other.offset.is_some() {
            self.offset = other.offset;
        }
        self
    }

    pub fn filters(&self) -> &[Filter] {
        &self.filters
    }

    pub fn ordering(&self) -> &[OrderBy] {
        &self.order_by
    }

    pub fn limit_value(&self) -> Option<usize> {
        self.limit
    }

    pub fn offset_value(&self) -> Option<usize> {
        self.offset
    }

    /// Value of the first equality filter on `column`.
    pub fn value_of(&self, column: &str) -> Option<&Value> {
        self.filters.iter().find_map(|f| match f {
            Filter::Eq(c, v) if c == column => Some(v),
            _ => None,
        })
    }

    /// Does the row satisfy every filter?
    pub fn matches(&self, row: &Row) -> bool {
        self.filters.iter().all(|f| f.matches(row))
    }

    /// Apply filters, ordering, offset and limit to an in-memory row set.
    pub fn apply<I: IntoIterator<Item = Row>>(&self, rows: I) -> Vec<Row> {
        let mut selected: Vec<Row> = rows.into_iter().filter(|r| self.matches(r)).collect();
        if !self.order_by.is_empty() {
            selected.sort_by(|a, b| self.compare(a, b));
        }
        selected
            .into_iter()
            .skip(self.offset.unwrap_or(0))
            .take(self.limit.unwrap_or(usize::MAX))
            .collect()
    }

    fn compare(&self, a: &Row, b: &Row) -> Ordering {
        for order in &self.order_by {
            let ordering = compare_values(a.get(&order.column), b.get(&order.column));
            let ordering = match order.direction {
                OrderDirection::Asc => ordering,
                OrderDirection::Desc => ordering.reverse(),
            };
            if ordering != Ordering::Equal {
                return ordering;
            }
        }
        Ordering::Equal
    }
}

fn compare_values(a: Option<&Value>, b: Option<&Value>) -> Ordering {
    let a = a.unwrap_or(&Value::Null);
    let b = b.unwrap_or(&Value::Null);
    match (a, b) {
        (Value::Null, Value::Null) => Ordering::Equal,
        (Value::Null, _) => Ordering::Less,
        (_, Value::Null) => Ordering::Greater,
        (Value::Text(x), Value::Text(y)) => x.cmp(y),
        (Value::Bool(x), Value::Bool(y)) => x.cmp(y),
        _ => match (a.as_f64(), b.as_f64()) {
            (Some(x), Some(y)) => x.partial_cmp(&y).unwrap_or(Ordering::Equal),
            _ => a.to_string().cmp(&b.to_string()),
        },
    }
}
