//! Per-request execution context.
//!
//! An [`AuthContext`] carries the principal being authorized, the scoped
//! flags and condition overrides active for this request, and a cooperative
//! cancellation token. It is deliberately `!Sync`: one context belongs to one
//! request and is never shared across threads.

use std::collections::HashMap;

use condauth_proto::Value;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use super::scope::{FlagGuard, ScopeState, WritingGuard};
use crate::error::{AuthError, AuthResult};

/// An already-authenticated identity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Principal {
    /// Stable principal identifier.
    pub id: String,
    /// Role whose rules apply.
    pub role: String,
    /// Attributes conditions can reference (e.g. `department`, `user_id`).
    #[serde(default)]
    pub attributes: HashMap<String, Value>,
}

impl Principal {
    /// Create a principal with no attributes.
    pub fn new(id: impl Into<String>, role: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            role: role.into(),
            attributes: HashMap::new(),
        }
    }

    /// Set an attribute.
    pub fn with_attribute(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.attributes.insert(name.into(), value.into());
        self
    }

    /// Get an attribute.
    pub fn attribute(&self, name: &str) -> Option<&Value> {
        self.attributes.get(name)
    }
}

/// Execution context for one request.
#[derive(Debug)]
pub struct AuthContext {
    principal: Principal,
    scope: ScopeState,
    cancel: CancellationToken,
}

impl AuthContext {
    /// Create a context for a principal.
    pub fn new(principal: Principal) -> Self {
        Self {
            principal,
            scope: ScopeState::default(),
            cancel: CancellationToken::new(),
        }
    }

    /// Use an externally owned cancellation token.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    /// The principal being authorized.
    pub fn principal(&self) -> &Principal {
        &self.principal
    }

    /// Scoped flags and overrides.
    pub fn scope(&self) -> &ScopeState {
        &self.scope
    }

    /// The cancellation token.
    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Fail with [`AuthError::Cancelled`] once cancellation was requested.
    pub fn check_cancelled(&self) -> AuthResult<()> {
        if self.cancel.is_cancelled() {
            Err(AuthError::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Disable automatic query filtering while the guard lives.
    pub fn disable_query_filter(&self) -> FlagGuard<'_> {
        self.scope.disable_query_filter()
    }

    /// Mark the context as saving while the guard lives.
    pub fn in_save(&self) -> FlagGuard<'_> {
        self.scope.in_save()
    }

    /// Mark `entity` as being written while the guard lives.
    pub fn writing(&self, entity: &str) -> WritingGuard<'_> {
        self.scope.writing(entity)
    }

    /// Act on behalf of the user interface while the guard lives.
    pub fn user_interface(&self) -> FlagGuard<'_> {
        self.scope.user_interface()
    }

    /// Suspend every authorization check while the guard lives.
    pub fn disable_authorization(&self) -> FlagGuard<'_> {
        self.scope.disable_authorization()
    }
}
