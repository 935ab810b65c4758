//! In-memory filter evaluation.
//!
//! `FilterEvaluator` evaluates nested [`FilterExpr`] trees against materialized
//! rows. The reference storage engine executes queries with it, and
//! conditions registered as evaluable derive their in-memory predicate from
//! it, so both evaluation paths share one semantics.

use std::cmp::Ordering;
use std::collections::BTreeSet;

use condauth_proto::{EntityRow, FilterExpr, Value};

/// Collect every field name referenced by a filter.
pub fn referenced_fields(filter: &FilterExpr) -> BTreeSet<String> {
    let mut fields = BTreeSet::new();
    collect_fields(filter, &mut fields);
    fields
}

fn collect_fields(filter: &FilterExpr, fields: &mut BTreeSet<String>) {
    match filter {
        FilterExpr::True | FilterExpr::False => {}
        FilterExpr::Eq { field, .. }
        | FilterExpr::Ne { field, .. }
        | FilterExpr::Lt { field, .. }
        | FilterExpr::Le { field, .. }
        | FilterExpr::Gt { field, .. }
        | FilterExpr::Ge { field, .. }
        | FilterExpr::In { field, .. }
        | FilterExpr::NotIn { field, .. }
        | FilterExpr::IsNull { field }
        | FilterExpr::IsNotNull { field }
        | FilterExpr::Like { field, .. }
        | FilterExpr::NotLike { field, .. } => {
            fields.insert(field.clone());
        }
        FilterExpr::And(children) | FilterExpr::Or(children) => {
            for child in children {
                collect_fields(child, fields);
            }
        }
        FilterExpr::Not(inner) => collect_fields(inner, fields),
    }
}

/// Evaluates filter expressions against entity rows.
pub struct FilterEvaluator;

impl FilterEvaluator {
    /// Evaluate a filter against a row.
    ///
    /// A missing field never satisfies a comparison; `NOT` is plain boolean
    /// negation of the child result.
    pub fn evaluate(filter: &FilterExpr, row: &EntityRow) -> bool {
        match filter {
            FilterExpr::True => true,
            FilterExpr::False => false,
            FilterExpr::Eq { field, value } => {
                Self::compare_field(row, field, value, Self::values_equal)
            }
            FilterExpr::Ne { field, value } => {
                Self::compare_field(row, field, value, |a, b| !Self::values_equal(a, b))
            }
            FilterExpr::Lt { field, value } => Self::compare_field(row, field, value, |a, b| {
                Self::compare_values(a, b).map(Ordering::is_lt).unwrap_or(false)
            }),
            FilterExpr::Le { field, value } => Self::compare_field(row, field, value, |a, b| {
                Self::compare_values(a, b).map(Ordering::is_le).unwrap_or(false)
            }),
            FilterExpr::Gt { field, value } => Self::compare_field(row, field, value, |a, b| {
                Self::compare_values(a, b).map(Ordering::is_gt).unwrap_or(false)
            }),
            FilterExpr::Ge { field, value } => Self::compare_field(row, field, value, |a, b| {
                Self::compare_values(a, b).map(Ordering::is_ge).unwrap_or(false)
            }),
            FilterExpr::In { field, values } => match row.get(field) {
                Some(fv) => values.iter().any(|v| Self::values_equal(fv, v)),
                None => false,
            },
            FilterExpr::NotIn { field, values } => match row.get(field) {
                Some(fv) => !values.iter().any(|v| Self::values_equal(fv, v)),
                None => true,
            },
            FilterExpr::IsNull { field } => matches!(row.get(field), None | Some(Value::Null)),
            FilterExpr::IsNotNull { field } => {
                !matches!(row.get(field), None | Some(Value::Null))
            }
            FilterExpr::Like { field, pattern } => match row.get(field) {
                Some(Value::String(s)) => Self::like_match(s, pattern),
                _ => false,
            },
            FilterExpr::NotLike { field, pattern } => match row.get(field) {
                Some(Value::String(s)) => !Self::like_match(s, pattern),
                _ => true,
            },
            FilterExpr::And(children) => children.iter().all(|c| Self::evaluate(c, row)),
            FilterExpr::Or(children) => children.iter().any(|c| Self::evaluate(c, row)),
            FilterExpr::Not(inner) => !Self::evaluate(inner, row),
        }
    }

    fn compare_field<F>(row: &EntityRow, field: &str, value: &Value, comparator: F) -> bool
    where
        F: FnOnce(&Value, &Value) -> bool,
    {
        match row.get(field) {
            Some(fv) => comparator(fv, value),
            None => false,
        }
    }

    /// Equality across integer widths; array fields match when any element does.
    fn values_equal(a: &Value, b: &Value) -> bool {
        match (a, b) {
            (Value::Null, Value::Null) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Int32(a), Value::Int32(b)) => a == b,
            (Value::Int64(a), Value::Int64(b)) => a == b,
            (Value::Int32(a), Value::Int64(b)) => (*a as i64) == *b,
            (Value::Int64(a), Value::Int32(b)) => *a == (*b as i64),
            (Value::Float64(a), Value::Float64(b)) => a == b,
            (Value::Float64(a), Value::Int64(b)) => *a == (*b as f64),
            (Value::Int64(a), Value::Float64(b)) => (*a as f64) == *b,
            (Value::String(a), Value::String(b)) => a == b,
            (Value::Bytes(a), Value::Bytes(b)) => a == b,
            (Value::Timestamp(a), Value::Timestamp(b)) => a == b,
            (Value::Uuid(a), Value::Uuid(b)) => a == b,
            (array, scalar) if array.is_array() && !scalar.is_array() => array
                .to_elements()
                .iter()
                .any(|element| Self::values_equal(element, scalar)),
            _ => false,
        }
    }

    fn compare_values(a: &Value, b: &Value) -> Option<Ordering> {
        match (a, b) {
            (Value::Int32(a), Value::Int32(b)) => Some(a.cmp(b)),
            (Value::Int64(a), Value::Int64(b)) => Some(a.cmp(b)),
            (Value::Int32(a), Value::Int64(b)) => Some((*a as i64).cmp(b)),
            (Value::Int64(a), Value::Int32(b)) => Some(a.cmp(&(*b as i64))),
            (Value::Float64(a), Value::Float64(b)) => a.partial_cmp(b),
            (Value::Float64(a), Value::Int64(b)) => a.partial_cmp(&(*b as f64)),
            (Value::Int64(a), Value::Float64(b)) => (*a as f64).partial_cmp(b),
            (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
            (Value::Timestamp(a), Value::Timestamp(b)) => Some(a.cmp(b)),
            (Value::Bytes(a), Value::Bytes(b)) => Some(a.cmp(b)),
            (Value::Uuid(a), Value::Uuid(b)) => Some(a.cmp(b)),
            _ => None,
        }
    }

    /// Match a string against a SQL LIKE pattern.
    ///
    /// `%` matches any run of characters, `_` exactly one, and a backslash
    /// escapes the following pattern character.
    pub fn like_match(value: &str, pattern: &str) -> bool {
        let value: Vec<char> = value.chars().collect();
        let pattern: Vec<char> = pattern.chars().collect();
        Self::like_at(&value, &pattern)
    }

    fn like_at(value: &[char], pattern: &[char]) -> bool {
        match pattern.split_first() {
            None => value.is_empty(),
            Some(('%', rest)) => {
                if rest.is_empty() {
                    return true;
                }
                (0..=value.len()).any(|skip| Self::like_at(&value[skip..], rest))
            }
            Some(('_', rest)) => !value.is_empty() && Self::like_at(&value[1..], rest),
            Some(('\\', rest)) => match (rest.split_first(), value.split_first()) {
                (Some((p, rest)), Some((c, tail))) if p == c => Self::like_at(tail, rest),
                _ => false,
            },
            Some((p, rest)) => match value.split_first() {
                Some((c, tail)) if c == p => Self::like_at(tail, rest),
                _ => false,
            },
        }
    }
}
