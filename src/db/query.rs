//! Structured queries against one collection.
//!
//! A `Query` carries equality/range filters, orderings and an optional
//! limit. Local backends evaluate it with [`Query::apply`]; the Firestore
//! backend translates it to a `structuredQuery`.

use serde::Serialize;
use serde_json::{Map, Value};
use std::cmp::Ordering;

use super::Document;
use crate::error::{Result, StoreError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Op {
    Eq,
    Lt,
    Le,
    Gt,
    Ge,
}

impl Op {
    pub fn is_range(&self) -> bool {
        !matches!(self, Op::Eq)
    }

    pub fn as_sql(&self) -> &'static str {
        match self {
            Op::Eq => "=",
            Op::Lt => "<",
            Op::Le => "<=",
            Op::Gt => ">",
            Op::Ge => ">=",
        }
    }

    pub fn as_firestore(&self) -> &'static str {
        match self {
            Op::Eq => "EQUAL",
            Op::Lt => "LESS_THAN",
            Op::Le => "LESS_THAN_OR_EQUAL",
            Op::Gt => "GREATER_THAN",
            Op::Ge => "GREATER_THAN_OR_EQUAL",
        }
    }

    fn accepts(&self, ord: Ordering) -> bool {
        match self {
            Op::Eq => ord == Ordering::Equal,
            Op::Lt => ord == Ordering::Less,
            Op::Le => ord != Ordering::Greater,
            Op::Gt => ord == Ordering::Greater,
            Op::Ge => ord != Ordering::Less,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Ascending,
    Descending,
}

impl Direction {
    pub fn from_descending(descending: bool) -> Self {
        if descending {
            Direction::Descending
        } else {
            Direction::Ascending
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Filter {
    pub field: String,
    pub op: Op,
    pub value: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OrderBy {
    pub field: String,
    pub direction: Direction,
}

/// Composite index a query depends on, in Firestore field order.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct IndexSpec {
    pub collection: String,
    pub fields: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Query {
    pub collection: String,
    pub filters: Vec<Filter>,
    pub order_by: Vec<OrderBy>,
    pub limit: Option<usize>,
}

impl Query {
    pub fn collection(name: &str) -> Self {
        Query {
            collection: name.to_string(),
            filters: Vec::new(),
            order_by: Vec::new(),
            limit: None,
        }
    }

    pub fn filter(mut self, field: &str, op: Op, value: impl Into<Value>) -> Self {
        self.filters.push(Filter {
            field: field.to_string(),
            op,
            value: value.into(),
        });
        self
    }

    pub fn where_eq(self, field: &str, value: impl Into<Value>) -> Self {
        self.filter(field, Op::Eq, value)
    }

    pub fn where_ge(self, field: &str, value: impl Into<Value>) -> Self {
        self.filter(field, Op::Ge, value)
    }

    pub fn where_le(self, field: &str, value: impl Into<Value>) -> Self {
        self.filter(field, Op::Le, value)
    }

    pub fn order_by(mut self, field: &str, direction: Direction) -> Self {
        self.order_by.push(OrderBy {
            field: field.to_string(),
            direction,
        });
        self
    }

    pub fn limit(mut self, n: usize) -> Self {
        self.limit = Some(n);
        self
    }

    /// Field carrying range filters, if any.
    pub fn range_field(&self) -> Option<&str> {
        self.filters
            .iter()
            .find(|f| f.op.is_range())
            .map(|f| f.field.as_str())
    }

    /// Reject queries the remote store would refuse: range filters on more
    /// than one field, or a range filter whose field is not ordered first.
    pub fn validate(&self) -> Result<()> {
        if let Some(range_field) = self.range_field() {
            if let Some(other) = self
                .filters
                .iter()
                .find(|f| f.op.is_range() && f.field != range_field)
            {
                return Err(StoreError::InvalidQuery(format!(
                    "range filters on both '{}' and '{}'",
                    range_field, other.field
                )));
            }
            if let Some(first) = self.order_by.first() {
                if first.field != range_field {
                    return Err(StoreError::InvalidQuery(format!(
                        "range filter on '{}' must be ordered by '{}' first, not '{}'",
                        range_field, range_field, first.field
                    )));
                }
            }
        }
        Ok(())
    }

    /// The composite index this query needs, or `None` when single-field
    /// indexes are enough.
    ///
    /// Equality filters combined with a range filter or an ordering on a
    /// different field need one; so does ordering by more than one field.
    pub fn required_index(&self) -> Option<IndexSpec> {
        let mut fields: Vec<String> = Vec::new();
        for f in self.filters.iter().filter(|f| !f.op.is_range()) {
            if !fields.contains(&f.field) {
                fields.push(f.field.clone());
            }
        }
        let mut trailing: Vec<String> = Vec::new();
        if let Some(range_field) = self.range_field() {
            trailing.push(range_field.to_string());
        }
        for o in &self.order_by {
            if !trailing.contains(&o.field) && !fields.contains(&o.field) {
                trailing.push(o.field.clone());
            }
        }

        let needs_index = (!fields.is_empty() && !trailing.is_empty()) || trailing.len() > 1;
        if !needs_index {
            return None;
        }
        fields.extend(trailing);
        Some(IndexSpec {
            collection: self.collection.clone(),
            fields,
        })
    }

    pub fn matches(&self, fields: &Map<String, Value>) -> bool {
        self.filters.iter().all(|f| match fields.get(&f.field) {
            Some(v) => compare_values(v, &f.value).is_some_and(|ord| f.op.accepts(ord)),
            None => false,
        })
    }

    /// Evaluate in memory: filter, sort and truncate.
    ///
    /// Documents missing an ordered field are dropped, and ties fall back to
    /// document id so results are stable across backends.
    pub fn apply(&self, docs: impl IntoIterator<Item = Document>) -> Vec<Document> {
        let mut out: Vec<Document> = docs
            .into_iter()
            .filter(|d| self.matches(&d.fields))
            .filter(|d| self.order_by.iter().all(|o| d.fields.contains_key(&o.field)))
            .collect();

        out.sort_by(|a, b| {
            for o in &self.order_by {
                let ord = match (a.fields.get(&o.field), b.fields.get(&o.field)) {
                    (Some(x), Some(y)) => total_order(x, y),
                    _ => Ordering::Equal,
                };
                let ord = match o.direction {
                    Direction::Ascending => ord,
                    Direction::Descending => ord.reverse(),
                };
                if ord != Ordering::Equal {
                    return ord;
                }
            }
            a.id.cmp(&b.id)
        });

        if let Some(limit) = self.limit {
            out.truncate(limit);
        }
        out
    }
}

/// Compare two values of the same kind. Mixed kinds are incomparable.
pub fn compare_values(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Null, Value::Null) => Some(Ordering::Equal),
        (Value::Bool(x), Value::Bool(y)) => Some(x.cmp(y)),
        (Value::Number(x), Value::Number(y)) => {
            if let (Some(x), Some(y)) = (x.as_i64(), y.as_i64()) {
                Some(x.cmp(&y))
            } else {
                x.as_f64()?.partial_cmp(&y.as_f64()?)
            }
        }
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        (Value::Array(_), Value::Array(_)) | (Value::Object(_), Value::Object(_)) => {
            (a == b).then_some(Ordering::Equal)
        }
        _ => None,
    }
}

// Firestore's cross-type ordering: null < bool < number < string < array < map
fn type_rank(v: &Value) -> u8 {
    match v {
        Value::Null => 0,
        Value::Bool(_) => 1,
        Value::Number(_) => 2,
        Value::String(_) => 3,
        Value::Array(_) => 4,
        Value::Object(_) => 5,
    }
}

fn total_order(a: &Value, b: &Value) -> Ordering {
    compare_values(a, b).unwrap_or_else(|| type_rank(a).cmp(&type_rank(b)))
}
