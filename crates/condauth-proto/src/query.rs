//! Filter expressions and entity queries.

use crate::value::Value;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Boolean filter expression over a single entity.
///
/// Unlike a flat filter list, compound nodes nest arbitrarily so that
/// authorization decision trees can be expressed without loss.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum FilterExpr {
    /// Matches every row.
    True,
    /// Matches no row.
    False,
    /// Field equals value.
    Eq { field: String, value: Value },
    /// Field not equals value.
    Ne { field: String, value: Value },
    /// Field less than value.
    Lt { field: String, value: Value },
    /// Field less than or equal to value.
    Le { field: String, value: Value },
    /// Field greater than value.
    Gt { field: String, value: Value },
    /// Field greater than or equal to value.
    Ge { field: String, value: Value },
    /// Field is in a set of values.
    In { field: String, values: Vec<Value> },
    /// Field is not in a set of values.
    NotIn { field: String, values: Vec<Value> },
    /// Field is null.
    IsNull { field: String },
    /// Field is not null.
    IsNotNull { field: String },
    /// Field matches a LIKE pattern.
    Like { field: String, pattern: String },
    /// Field does not match a LIKE pattern.
    NotLike { field: String, pattern: String },
    /// All children must hold.
    And(Vec<FilterExpr>),
    /// At least one child must hold.
    Or(Vec<FilterExpr>),
    /// Negation.
    Not(Box<FilterExpr>),
}

impl FilterExpr {
    /// Create an equality filter.
    pub fn eq(field: impl Into<String>, value: impl Into<Value>) -> Self {
        FilterExpr::Eq {
            field: field.into(),
            value: value.into(),
        }
    }

    /// Create a not-equal filter.
    pub fn ne(field: impl Into<String>, value: impl Into<Value>) -> Self {
        FilterExpr::Ne {
            field: field.into(),
            value: value.into(),
        }
    }

    /// Create a less-than filter.
    pub fn lt(field: impl Into<String>, value: impl Into<Value>) -> Self {
        FilterExpr::Lt {
            field: field.into(),
            value: value.into(),
        }
    }

    /// Create a less-than-or-equal filter.
    pub fn le(field: impl Into<String>, value: impl Into<Value>) -> Self {
        FilterExpr::Le {
            field: field.into(),
            value: value.into(),
        }
    }

    /// Create a greater-than filter.
    pub fn gt(field: impl Into<String>, value: impl Into<Value>) -> Self {
        FilterExpr::Gt {
            field: field.into(),
            value: value.into(),
        }
    }

    /// Create a greater-than-or-equal filter.
    pub fn ge(field: impl Into<String>, value: impl Into<Value>) -> Self {
        FilterExpr::Ge {
            field: field.into(),
            value: value.into(),
        }
    }

    /// Create an IN filter.
    pub fn in_values(field: impl Into<String>, values: Vec<Value>) -> Self {
        FilterExpr::In {
            field: field.into(),
            values,
        }
    }

    /// Create a NOT IN filter.
    pub fn not_in_values(field: impl Into<String>, values: Vec<Value>) -> Self {
        FilterExpr::NotIn {
            field: field.into(),
            values,
        }
    }

    /// Create an IS NULL filter.
    pub fn is_null(field: impl Into<String>) -> Self {
        FilterExpr::IsNull {
            field: field.into(),
        }
    }

    /// Create an IS NOT NULL filter.
    pub fn is_not_null(field: impl Into<String>) -> Self {
        FilterExpr::IsNotNull {
            field: field.into(),
        }
    }

    /// Create a LIKE filter.
    pub fn like(field: impl Into<String>, pattern: impl Into<String>) -> Self {
        FilterExpr::Like {
            field: field.into(),
            pattern: pattern.into(),
        }
    }

    /// Conjunction that folds constants: `True` children vanish, any `False`
    /// child makes the whole expression `False`, nested `And`s are flattened.
    pub fn and_all(exprs: impl IntoIterator<Item = FilterExpr>) -> Self {
        let mut out = Vec::new();
        for expr in exprs {
            match expr {
                FilterExpr::True => {}
                FilterExpr::False => return FilterExpr::False,
                FilterExpr::And(children) => out.extend(children),
                other => out.push(other),
            }
        }
        match out.len() {
            0 => FilterExpr::True,
            1 => out.remove(0),
            _ => FilterExpr::And(out),
        }
    }

    /// Disjunction that folds constants: `False` children vanish, any `True`
    /// child makes the whole expression `True`, nested `Or`s are flattened.
    pub fn or_any(exprs: impl IntoIterator<Item = FilterExpr>) -> Self {
        let mut out = Vec::new();
        for expr in exprs {
            match expr {
                FilterExpr::False => {}
                FilterExpr::True => return FilterExpr::True,
                FilterExpr::Or(children) => out.extend(children),
                other => out.push(other),
            }
        }
        match out.len() {
            0 => FilterExpr::False,
            1 => out.remove(0),
            _ => FilterExpr::Or(out),
        }
    }

    /// Negation that folds constants and double negation.
    pub fn negate(expr: FilterExpr) -> Self {
        match expr {
            FilterExpr::True => FilterExpr::False,
            FilterExpr::False => FilterExpr::True,
            FilterExpr::Not(inner) => *inner,
            other => FilterExpr::Not(Box::new(other)),
        }
    }

    /// Whether this expression is the constant `True`.
    pub fn is_true(&self) -> bool {
        matches!(self, FilterExpr::True)
    }

    /// Whether this expression is the constant `False`.
    pub fn is_false(&self) -> bool {
        matches!(self, FilterExpr::False)
    }
}

impl fmt::Display for FilterExpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fn list(f: &mut fmt::Formatter<'_>, items: &[FilterExpr], sep: &str) -> fmt::Result {
            write!(f, "(")?;
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    write!(f, " {} ", sep)?;
                }
                write!(f, "{}", item)?;
            }
            write!(f, ")")
        }

        match self {
            FilterExpr::True => write!(f, "TRUE"),
            FilterExpr::False => write!(f, "FALSE"),
            FilterExpr::Eq { field, value } => write!(f, "{} = {}", field, value),
            FilterExpr::Ne { field, value } => write!(f, "{} <> {}", field, value),
            FilterExpr::Lt { field, value } => write!(f, "{} < {}", field, value),
            FilterExpr::Le { field, value } => write!(f, "{} <= {}", field, value),
            FilterExpr::Gt { field, value } => write!(f, "{} > {}", field, value),
            FilterExpr::Ge { field, value } => write!(f, "{} >= {}", field, value),
            FilterExpr::In { field, values } => {
                let items: Vec<String> = values.iter().map(|v| v.to_string()).collect();
                write!(f, "{} IN ({})", field, items.join(", "))
            }
            FilterExpr::NotIn { field, values } => {
                let items: Vec<String> = values.iter().map(|v| v.to_string()).collect();
                write!(f, "{} NOT IN ({})", field, items.join(", "))
            }
            FilterExpr::IsNull { field } => write!(f, "{} IS NULL", field),
            FilterExpr::IsNotNull { field } => write!(f, "{} IS NOT NULL", field),
            FilterExpr::Like { field, pattern } => write!(f, "{} LIKE '{}'", field, pattern),
            FilterExpr::NotLike { field, pattern } => {
                write!(f, "{} NOT LIKE '{}'", field, pattern)
            }
            FilterExpr::And(items) => list(f, items, "AND"),
            FilterExpr::Or(items) => list(f, items, "OR"),
            FilterExpr::Not(inner) => write!(f, "NOT ({})", inner),
        }
    }
}

/// A query over all rows of one entity type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityQuery {
    /// Entity type to query.
    pub entity: String,
    /// Optional filter.
    pub filter: Option<FilterExpr>,
    /// Maximum number of rows to return.
    pub limit: Option<usize>,
    /// When set, the query is known to return nothing and must not be executed.
    #[serde(default)]
    pub always_empty: bool,
}

impl EntityQuery {
    /// Create a query over every row of an entity type.
    pub fn new(entity: impl Into<String>) -> Self {
        Self {
            entity: entity.into(),
            filter: None,
            limit: None,
            always_empty: false,
        }
    }

    /// Set the filter.
    pub fn with_filter(mut self, filter: FilterExpr) -> Self {
        self.filter = Some(filter);
        self
    }

    /// Set the row limit.
    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// AND an additional filter onto the query.
    pub fn and_filter(mut self, extra: FilterExpr) -> Self {
        self.filter = Some(match self.filter.take() {
            None => extra,
            Some(existing) => FilterExpr::and_all([existing, extra]),
        });
        self
    }

    /// Mark the query as returning no rows.
    pub fn into_empty(mut self) -> Self {
        self.always_empty = true;
        self
    }
}
