//! Condition expressions that can reference principal attributes.

use condauth_proto::{FilterExpr, Value};
use serde::{Deserialize, Serialize};

use crate::error::{AuthError, AuthResult};
use crate::security::Principal;

/// A database-translatable predicate over one entity type.
///
/// Resolving an expression against a [`Principal`] substitutes attribute
/// references and yields a plain [`FilterExpr`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ConditionExpr {
    /// A filter with literal values only.
    Filter(FilterExpr),
    /// Field equals a principal attribute.
    /// Example: `department = principal.department`
    AttributeEq {
        /// Field name in the entity.
        field: String,
        /// Attribute name on the principal.
        attribute: String,
    },
    /// Field is in a list stored in a principal attribute.
    AttributeIn {
        /// Field name in the entity.
        field: String,
        /// Attribute name containing the list.
        attribute: String,
    },
    /// Field equals the principal's id.
    PrincipalId {
        /// Field name in the entity.
        field: String,
    },
    /// All conditions must be true.
    And(Vec<ConditionExpr>),
    /// At least one condition must be true.
    Or(Vec<ConditionExpr>),
    /// Negation.
    Not(Box<ConditionExpr>),
}

impl ConditionExpr {
    /// Create an attribute equality condition.
    pub fn attribute_eq(field: impl Into<String>, attribute: impl Into<String>) -> Self {
        ConditionExpr::AttributeEq {
            field: field.into(),
            attribute: attribute.into(),
        }
    }

    /// Create an attribute IN condition.
    pub fn attribute_in(field: impl Into<String>, attribute: impl Into<String>) -> Self {
        ConditionExpr::AttributeIn {
            field: field.into(),
            attribute: attribute.into(),
        }
    }

    /// Create a principal-id ownership condition.
    pub fn principal_id(field: impl Into<String>) -> Self {
        ConditionExpr::PrincipalId {
            field: field.into(),
        }
    }

    /// Create an AND combination.
    pub fn and(exprs: Vec<ConditionExpr>) -> Self {
        ConditionExpr::And(exprs)
    }

    /// Create an OR combination.
    pub fn or(exprs: Vec<ConditionExpr>) -> Self {
        ConditionExpr::Or(exprs)
    }

    /// Create a negation.
    pub fn not(expr: ConditionExpr) -> Self {
        ConditionExpr::Not(Box::new(expr))
    }

    /// Substitute principal attributes, producing a concrete filter.
    ///
    /// Referencing an attribute the principal does not carry is a
    /// configuration error rather than a silent mismatch.
    pub fn resolve(&self, principal: &Principal) -> AuthResult<FilterExpr> {
        match self {
            ConditionExpr::Filter(filter) => Ok(filter.clone()),
            ConditionExpr::AttributeEq { field, attribute } => {
                let value = Self::attribute(principal, attribute)?;
                if value.is_array() {
                    Ok(FilterExpr::in_values(field.clone(), value.to_elements()))
                } else {
                    Ok(FilterExpr::eq(field.clone(), value.clone()))
                }
            }
            ConditionExpr::AttributeIn { field, attribute } => {
                let value = Self::attribute(principal, attribute)?;
                Ok(FilterExpr::in_values(field.clone(), value.to_elements()))
            }
            ConditionExpr::PrincipalId { field } => Ok(FilterExpr::eq(
                field.clone(),
                Value::String(principal.id.clone()),
            )),
            ConditionExpr::And(children) => Ok(FilterExpr::and_all(
                children
                    .iter()
                    .map(|c| c.resolve(principal))
                    .collect::<AuthResult<Vec<_>>>()?,
            )),
            ConditionExpr::Or(children) => Ok(FilterExpr::or_any(
                children
                    .iter()
                    .map(|c| c.resolve(principal))
                    .collect::<AuthResult<Vec<_>>>()?,
            )),
            ConditionExpr::Not(inner) => Ok(FilterExpr::negate(inner.resolve(principal)?)),
        }
    }

    fn attribute<'p>(principal: &'p Principal, name: &str) -> AuthResult<&'p Value> {
        principal.attribute(name).ok_or_else(|| {
            AuthError::Configuration(format!(
                "principal '{}' has no attribute '{}'",
                principal.id, name
            ))
        })
    }
}

impl From<FilterExpr> for ConditionExpr {
    fn from(filter: FilterExpr) -> Self {
        ConditionExpr::Filter(filter)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn principal() -> Principal {
        Principal::new("alice", "Sales")
            .with_attribute("department", "emea")
            .with_attribute("teams", Value::StringArray(vec!["a".into(), "b".into()]))
    }

    #[test]
    fn test_attribute_eq() {
        let filter = ConditionExpr::attribute_eq("department", "department")
            .resolve(&principal())
            .unwrap();
        assert_eq!(filter, FilterExpr::eq("department", "emea"));
    }

    #[test]
    fn test_array_attribute_becomes_in() {
        let filter = ConditionExpr::attribute_eq("team", "teams")
            .resolve(&principal())
            .unwrap();
        assert_eq!(
            filter,
            FilterExpr::in_values("team", vec!["a".into(), "b".into()])
        );
    }

    #[test]
    fn test_principal_id() {
        let filter = ConditionExpr::principal_id("owner").resolve(&principal()).unwrap();
        assert_eq!(filter, FilterExpr::eq("owner", "alice"));
    }

    #[test]
    fn test_compound_folds_constants() {
        let expr = ConditionExpr::and(vec![
            FilterExpr::True.into(),
            ConditionExpr::not(ConditionExpr::principal_id("owner")),
        ]);
        let filter = expr.resolve(&principal()).unwrap();
        assert_eq!(
            filter,
            FilterExpr::Not(Box::new(FilterExpr::eq("owner", "alice")))
        );
    }

    #[test]
    fn test_missing_attribute_is_configuration_error() {
        let err = ConditionExpr::attribute_eq("region", "region")
            .resolve(&principal())
            .unwrap_err();
        assert!(matches!(err, AuthError::Configuration(_)));
    }
}
