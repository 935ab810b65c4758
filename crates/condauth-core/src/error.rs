//! Core error types.

use condauth_proto::{format_id, AccessLevel, EntityId, ExplainResult};
use thiserror::Error;

/// Authorization engine errors.
///
/// `AccessDenied` and `EntityNotFound` are expected business outcomes; the
/// remaining variants are programming or infrastructure errors.
#[derive(Debug, Error)]
pub enum AuthError {
    /// The principal is not authorized at the requested level.
    #[error("access denied: {level} on {entity} [{}]{}", format_ids(.ids), explain_suffix(.explain))]
    AccessDenied {
        /// Requested level.
        level: AccessLevel,
        /// Entity type.
        entity: String,
        /// Denied identifiers.
        ids: Vec<EntityId>,
        /// Evaluation trace, when collected.
        explain: Option<Box<ExplainResult>>,
    },

    /// An assertion targeted identifiers that do not exist.
    #[error("entity not found: {entity} [{}]", format_ids(.ids))]
    EntityNotFound {
        /// Entity type.
        entity: String,
        /// Missing identifiers.
        ids: Vec<EntityId>,
    },

    /// Operation not valid in the current lifecycle state.
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// A condition cannot be materialized in the requested form.
    #[error("unsupported operation: {0}")]
    UnsupportedOperation(String),

    /// A required argument was empty or missing.
    #[error("missing argument: {0}")]
    NullArgument(String),

    /// Malformed rules, roles, or registrations.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// The operation was cancelled before completing.
    #[error("operation cancelled")]
    Cancelled,

    /// Storage layer error.
    #[error("storage error: {0}")]
    Storage(#[from] sled::Error),

    /// Protocol (de)serialization error.
    #[error("protocol error: {0}")]
    Protocol(#[from] condauth_proto::Error),

    /// Record serialization error.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Transaction failure other than authorization.
    #[error("transaction error: {0}")]
    Transaction(String),
}

impl AuthError {
    /// Access denied for a single entity.
    pub fn denied(level: AccessLevel, entity: impl Into<String>, id: EntityId) -> Self {
        AuthError::AccessDenied {
            level,
            entity: entity.into(),
            ids: vec![id],
            explain: None,
        }
    }

    /// Whether this is an expected business outcome rather than a fault.
    pub fn is_business_outcome(&self) -> bool {
        matches!(
            self,
            AuthError::AccessDenied { .. } | AuthError::EntityNotFound { .. }
        )
    }

    /// Whether this is a developer-facing configuration error.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            AuthError::InvalidState(_)
                | AuthError::UnsupportedOperation(_)
                | AuthError::NullArgument(_)
                | AuthError::Configuration(_)
        )
    }
}

fn format_ids(ids: &[EntityId]) -> String {
    ids.iter().map(format_id).collect::<Vec<_>>().join(", ")
}

fn explain_suffix(explain: &Option<Box<ExplainResult>>) -> String {
    match explain.as_ref().and_then(|e| e.error_message()) {
        Some(message) => format!(" ({})", message),
        None => String::new(),
    }
}

/// Result type for authorization operations.
pub type AuthResult<T> = Result<T, AuthError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_access_denied_display() {
        let err = AuthError::denied(AccessLevel::Write, "Invoice", [0xab; 16]);
        let text = err.to_string();
        assert!(text.contains("Write"));
        assert!(text.contains("Invoice"));
        assert!(text.contains("abababab"));
        assert!(err.is_business_outcome());
    }

    #[test]
    fn test_not_found_is_distinct() {
        let err = AuthError::EntityNotFound {
            entity: "Invoice".into(),
            ids: vec![[1u8; 16]],
        };
        assert!(err.to_string().starts_with("entity not found"));
        assert!(!matches!(err, AuthError::AccessDenied { .. }));
    }

    #[test]
    fn test_configuration_classification() {
        assert!(AuthError::InvalidState("sealed".into()).is_configuration());
        assert!(AuthError::NullArgument("symbol".into()).is_configuration());
        assert!(!AuthError::Cancelled.is_configuration());
        assert!(!AuthError::Cancelled.is_business_outcome());
    }
}
