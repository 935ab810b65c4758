//! Process-wide registry of type conditions.
//!
//! Conditions are registered per (entity type, symbol) during start-up and
//! frozen by [`ConditionRegistry::seal`]. Lookups consult the request's
//! scoped overrides before the registry itself.

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use condauth_proto::{ConditionSymbol, EntityRow, FilterExpr};
use parking_lot::RwLock;
use tracing::{debug, info};

use super::expr::ConditionExpr;
use crate::error::{AuthError, AuthResult};
use crate::query::FilterEvaluator;
use crate::security::{ConditionOverride, Principal, ScopeState};

/// Arguments handed to a query auditor: the query being filtered.
#[derive(Debug, Clone, PartialEq)]
pub struct AuditArgs {
    /// Entity type queried.
    pub entity: String,
    /// The caller's filter before authorization is applied.
    pub filter: Option<FilterExpr>,
}

impl AuditArgs {
    /// Arguments for a query over `entity`.
    pub fn new(entity: impl Into<String>, filter: Option<FilterExpr>) -> Self {
        Self {
            entity: entity.into(),
            filter,
        }
    }
}

/// Produces a condition from the caller's current query.
pub type QueryAuditor = Arc<dyn Fn(&AuditArgs) -> ConditionExpr + Send + Sync>;

/// Compiled in-memory form of a condition.
pub type InMemoryPredicate = Arc<dyn Fn(&EntityRow, &Principal) -> bool + Send + Sync>;

/// In-memory predicate already bound to one principal.
pub type BoundPredicate = Arc<dyn Fn(&EntityRow) -> bool + Send + Sync>;

#[derive(Clone)]
enum InMemoryForm {
    Closure(InMemoryPredicate),
    /// Evaluate the resolved predicate with [`FilterEvaluator`].
    Derived,
}

/// A named predicate attached to an entity type.
#[derive(Clone, Default)]
pub struct TypeCondition {
    predicate: Option<ConditionExpr>,
    auditor: Option<QueryAuditor>,
    in_memory: Option<InMemoryForm>,
}

impl TypeCondition {
    /// Condition backed by a database-translatable predicate.
    pub fn predicate(expr: ConditionExpr) -> Self {
        Self {
            predicate: Some(expr),
            ..Default::default()
        }
    }

    /// Condition backed by a query auditor.
    pub fn auditor<F>(auditor: F) -> Self
    where
        F: Fn(&AuditArgs) -> ConditionExpr + Send + Sync + 'static,
    {
        Self {
            auditor: Some(Arc::new(auditor)),
            ..Default::default()
        }
    }

    /// Predicate whose in-memory form is derived by evaluating it directly.
    pub fn evaluable(expr: ConditionExpr) -> Self {
        Self {
            predicate: Some(expr),
            auditor: None,
            in_memory: Some(InMemoryForm::Derived),
        }
    }

    /// Attach a compiled in-memory predicate.
    pub fn with_in_memory<F>(mut self, in_memory: F) -> Self
    where
        F: Fn(&EntityRow, &Principal) -> bool + Send + Sync + 'static,
    {
        self.in_memory = Some(InMemoryForm::Closure(Arc::new(in_memory)));
        self
    }

    fn with_in_memory_predicate(mut self, in_memory: Option<InMemoryPredicate>) -> Self {
        if let Some(f) = in_memory {
            self.in_memory = Some(InMemoryForm::Closure(f));
        }
        self
    }

    /// Whether a database predicate is available without query context.
    pub fn has_predicate(&self) -> bool {
        self.predicate.is_some()
    }

    /// Whether the condition inspects the caller's query.
    pub fn has_auditor(&self) -> bool {
        self.auditor.is_some()
    }

    /// Whether an in-memory form exists.
    pub fn has_in_memory(&self) -> bool {
        self.in_memory.is_some()
    }

    fn is_valid(&self) -> bool {
        self.predicate.is_some() || self.auditor.is_some()
    }

    /// The database expression. The auditor takes precedence when the query
    /// context is known.
    fn expression(&self, audit: Option<&AuditArgs>) -> Option<ConditionExpr> {
        match (audit, &self.auditor, &self.predicate) {
            (Some(args), Some(auditor), _) => Some(auditor(args)),
            (_, _, Some(predicate)) => Some(predicate.clone()),
            _ => None,
        }
    }

    fn bind(&self, principal: &Principal) -> AuthResult<Option<BoundPredicate>> {
        match &self.in_memory {
            None => Ok(None),
            Some(InMemoryForm::Closure(f)) => {
                let f = Arc::clone(f);
                let principal = principal.clone();
                Ok(Some(Arc::new(move |row: &EntityRow| f(row, &principal))))
            }
            Some(InMemoryForm::Derived) => match &self.predicate {
                Some(predicate) => {
                    let filter = predicate.resolve(principal)?;
                    Ok(Some(Arc::new(move |row: &EntityRow| {
                        FilterEvaluator::evaluate(&filter, row)
                    })))
                }
                None => Ok(None),
            },
        }
    }
}

impl fmt::Debug for TypeCondition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TypeCondition")
            .field("predicate", &self.predicate)
            .field("auditor", &self.auditor.is_some())
            .field("in_memory", &self.in_memory.is_some())
            .finish()
    }
}

type ConditionMap = HashMap<String, HashMap<ConditionSymbol, Arc<TypeCondition>>>;

/// Registry of type conditions keyed by entity type and symbol.
#[derive(Default)]
pub struct ConditionRegistry {
    conditions: RwLock<ConditionMap>,
    sealed: AtomicBool,
}

impl ConditionRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a predicate, optionally with a compiled in-memory form.
    pub fn register(
        &self,
        entity: &str,
        symbol: impl Into<ConditionSymbol>,
        predicate: ConditionExpr,
        in_memory: Option<InMemoryPredicate>,
    ) -> AuthResult<()> {
        self.register_condition(
            entity,
            symbol,
            TypeCondition::predicate(predicate).with_in_memory_predicate(in_memory),
        )
    }

    /// Register a query auditor, optionally with a compiled in-memory form.
    pub fn register_query_auditor<F>(
        &self,
        entity: &str,
        symbol: impl Into<ConditionSymbol>,
        auditor: F,
        in_memory: Option<InMemoryPredicate>,
    ) -> AuthResult<()>
    where
        F: Fn(&AuditArgs) -> ConditionExpr + Send + Sync + 'static,
    {
        self.register_condition(
            entity,
            symbol,
            TypeCondition::auditor(auditor).with_in_memory_predicate(in_memory),
        )
    }

    /// Register a predicate whose in-memory form is derived from it.
    pub fn register_evaluable(
        &self,
        entity: &str,
        symbol: impl Into<ConditionSymbol>,
        predicate: ConditionExpr,
    ) -> AuthResult<()> {
        self.register_condition(entity, symbol, TypeCondition::evaluable(predicate))
    }

    /// Register a condition.
    pub fn register_condition(
        &self,
        entity: &str,
        symbol: impl Into<ConditionSymbol>,
        condition: TypeCondition,
    ) -> AuthResult<()> {
        let symbol = symbol.into();
        if self.is_sealed() {
            return Err(AuthError::InvalidState(format!(
                "cannot register {}.{}: registry is sealed",
                entity, symbol
            )));
        }
        validate_key(entity, &symbol)?;
        if !condition.is_valid() {
            return Err(AuthError::NullArgument(format!(
                "condition {}.{} needs a predicate or a query auditor",
                entity, symbol
            )));
        }

        let mut conditions = self.conditions.write();
        let for_type = conditions.entry(entity.to_string()).or_default();
        if for_type.contains_key(&symbol) {
            return Err(AuthError::Configuration(format!(
                "condition {}.{} is already registered",
                entity, symbol
            )));
        }
        debug!(entity, symbol = %symbol, "condition registered");
        for_type.insert(symbol, Arc::new(condition));
        Ok(())
    }

    /// Whether a condition is registered.
    pub fn is_defined(&self, entity: &str, symbol: &ConditionSymbol) -> bool {
        self.conditions
            .read()
            .get(entity)
            .map(|m| m.contains_key(symbol))
            .unwrap_or(false)
    }

    /// Every symbol registered for an entity type.
    pub fn conditions_for(&self, entity: &str) -> BTreeSet<ConditionSymbol> {
        self.conditions
            .read()
            .get(entity)
            .map(|m| m.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Entity types with at least one condition.
    pub fn entity_types(&self) -> BTreeSet<String> {
        self.conditions.read().keys().cloned().collect()
    }

    /// Freeze registrations.
    pub fn seal(&self) {
        if !self.sealed.swap(true, Ordering::AcqRel) {
            let conditions = self.conditions.read();
            let total: usize = conditions.values().map(HashMap::len).sum();
            info!(types = conditions.len(), conditions = total, "condition registry sealed");
        }
    }

    /// Whether registrations are frozen.
    pub fn is_sealed(&self) -> bool {
        self.sealed.load(Ordering::Acquire)
    }

    fn lookup(
        &self,
        scope: &ScopeState,
        entity: &str,
        symbol: &ConditionSymbol,
    ) -> AuthResult<Arc<TypeCondition>> {
        if let Some(overridden) = scope.override_for(entity, symbol) {
            return Ok(overridden);
        }
        self.conditions
            .read()
            .get(entity)
            .and_then(|m| m.get(symbol))
            .cloned()
            .ok_or_else(|| {
                AuthError::Configuration(format!("condition {}.{} is not registered", entity, symbol))
            })
    }

    /// The database expression of a condition.
    ///
    /// Auditor-only conditions need `audit` and fail with
    /// `UnsupportedOperation` without it.
    pub fn get_condition(
        &self,
        scope: &ScopeState,
        entity: &str,
        symbol: &ConditionSymbol,
        audit: Option<&AuditArgs>,
    ) -> AuthResult<ConditionExpr> {
        let condition = self.lookup(scope, entity, symbol)?;
        condition.expression(audit).ok_or_else(|| {
            AuthError::UnsupportedOperation(format!(
                "condition {}.{} is a query auditor and needs query context",
                entity, symbol
            ))
        })
    }

    /// The in-memory form of a condition bound to `principal`, if it has one.
    pub fn get_in_memory_condition(
        &self,
        scope: &ScopeState,
        entity: &str,
        symbol: &ConditionSymbol,
        principal: &Principal,
    ) -> AuthResult<Option<BoundPredicate>> {
        self.lookup(scope, entity, symbol)?.bind(principal)
    }

    /// Shadow a registered condition for the lifetime of the returned guard.
    pub fn replace_temporally<'s>(
        &self,
        scope: &'s ScopeState,
        entity: &str,
        symbol: impl Into<ConditionSymbol>,
        condition: TypeCondition,
    ) -> AuthResult<ConditionOverride<'s>> {
        let symbol = symbol.into();
        validate_key(entity, &symbol)?;
        if !self.is_defined(entity, &symbol) {
            return Err(AuthError::Configuration(format!(
                "cannot override {}.{}: condition is not registered",
                entity, symbol
            )));
        }
        if !condition.is_valid() {
            return Err(AuthError::NullArgument(format!(
                "override for {}.{} needs a predicate or a query auditor",
                entity, symbol
            )));
        }
        Ok(scope.push_override(entity, &symbol, Arc::new(condition)))
    }
}

impl fmt::Debug for ConditionRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConditionRegistry")
            .field("types", &self.conditions.read().len())
            .field("sealed", &self.is_sealed())
            .finish()
    }
}

fn validate_key(entity: &str, symbol: &ConditionSymbol) -> AuthResult<()> {
    if entity.trim().is_empty() {
        return Err(AuthError::NullArgument("entity type".into()));
    }
    if symbol.is_empty() {
        return Err(AuthError::NullArgument("condition symbol".into()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use condauth_proto::Value;

    fn owned() -> ConditionExpr {
        ConditionExpr::principal_id("owner")
    }

    fn alice() -> Principal {
        Principal::new("alice", "Sales")
    }

    #[test]
    fn test_register_and_lookup() {
        let registry = ConditionRegistry::new();
        registry.register("Invoice", "OwnedByMe", owned(), None).unwrap();
        assert!(registry.is_defined("Invoice", &"OwnedByMe".into()));
        assert!(!registry.is_defined("Order", &"OwnedByMe".into()));

        let scope = ScopeState::default();
        let expr = registry
            .get_condition(&scope, "Invoice", &"OwnedByMe".into(), None)
            .unwrap();
        assert_eq!(expr, owned());
    }

    #[test]
    fn test_duplicate_registration_fails() {
        let registry = ConditionRegistry::new();
        registry.register("Invoice", "OwnedByMe", owned(), None).unwrap();
        let err = registry.register("Invoice", "OwnedByMe", owned(), None).unwrap_err();
        assert!(matches!(err, AuthError::Configuration(_)));
    }

    #[test]
    fn test_register_after_seal_fails() {
        let registry = ConditionRegistry::new();
        registry.seal();
        let err = registry.register("Invoice", "OwnedByMe", owned(), None).unwrap_err();
        assert!(matches!(err, AuthError::InvalidState(_)));
    }

    #[test]
    fn test_empty_keys_and_empty_condition() {
        let registry = ConditionRegistry::new();
        assert!(matches!(
            registry.register("", "OwnedByMe", owned(), None),
            Err(AuthError::NullArgument(_))
        ));
        assert!(matches!(
            registry.register("Invoice", "  ", owned(), None),
            Err(AuthError::NullArgument(_))
        ));
        assert!(matches!(
            registry.register_condition("Invoice", "Empty", TypeCondition::default()),
            Err(AuthError::NullArgument(_))
        ));
    }

    #[test]
    fn test_auditor_needs_query_context() {
        let registry = ConditionRegistry::new();
        registry
            .register_query_auditor(
                "Invoice",
                "SameStatus",
                |args: &AuditArgs| match &args.filter {
                    Some(filter) => ConditionExpr::Filter(filter.clone()),
                    None => ConditionExpr::Filter(FilterExpr::False),
                },
                None,
            )
            .unwrap();
        let scope = ScopeState::default();
        let symbol = ConditionSymbol::new("SameStatus");

        let err = registry.get_condition(&scope, "Invoice", &symbol, None).unwrap_err();
        assert!(matches!(err, AuthError::UnsupportedOperation(_)));

        let args = AuditArgs::new("Invoice", Some(FilterExpr::eq("status", "open")));
        let expr = registry.get_condition(&scope, "Invoice", &symbol, Some(&args)).unwrap();
        assert_eq!(expr, ConditionExpr::Filter(FilterExpr::eq("status", "open")));
    }

    #[test]
    fn test_undefined_condition_is_configuration_error() {
        let registry = ConditionRegistry::new();
        let scope = ScopeState::default();
        let err = registry
            .get_condition(&scope, "Invoice", &"Nope".into(), None)
            .unwrap_err();
        assert!(matches!(err, AuthError::Configuration(_)));
    }

    #[test]
    fn test_evaluable_derives_in_memory() {
        let registry = ConditionRegistry::new();
        registry.register_evaluable("Invoice", "OwnedByMe", owned()).unwrap();
        registry.register("Invoice", "Opaque", owned(), None).unwrap();
        let scope = ScopeState::default();

        let predicate = registry
            .get_in_memory_condition(&scope, "Invoice", &"OwnedByMe".into(), &alice())
            .unwrap()
            .unwrap();
        let mine = EntityRow::new([1u8; 16]).with_field("owner", "alice");
        let theirs = EntityRow::new([2u8; 16]).with_field("owner", "bob");
        assert!(predicate(&mine));
        assert!(!predicate(&theirs));

        assert!(registry
            .get_in_memory_condition(&scope, "Invoice", &"Opaque".into(), &alice())
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_closure_in_memory_sees_principal() {
        let registry = ConditionRegistry::new();
        let in_memory: InMemoryPredicate = Arc::new(|row: &EntityRow, principal: &Principal| {
            row.get("owner") == Some(&Value::String(principal.id.clone()))
        });
        registry
            .register("Invoice", "OwnedByMe", owned(), Some(in_memory))
            .unwrap();
        let scope = ScopeState::default();
        let predicate = registry
            .get_in_memory_condition(&scope, "Invoice", &"OwnedByMe".into(), &alice())
            .unwrap()
            .unwrap();
        assert!(predicate(&EntityRow::new([1u8; 16]).with_field("owner", "alice")));
    }

    #[test]
    fn test_replace_temporally() {
        let registry = ConditionRegistry::new();
        registry.register("Invoice", "OwnedByMe", owned(), None).unwrap();
        registry.seal();
        let scope = ScopeState::default();
        let symbol = ConditionSymbol::new("OwnedByMe");

        {
            let _guard = registry
                .replace_temporally(
                    &scope,
                    "Invoice",
                    "OwnedByMe",
                    TypeCondition::predicate(FilterExpr::True.into()),
                )
                .unwrap();
            let expr = registry.get_condition(&scope, "Invoice", &symbol, None).unwrap();
            assert_eq!(expr, ConditionExpr::Filter(FilterExpr::True));
        }
        let expr = registry.get_condition(&scope, "Invoice", &symbol, None).unwrap();
        assert_eq!(expr, owned());

        let err = registry
            .replace_temporally(
                &scope,
                "Invoice",
                "Unknown",
                TypeCondition::predicate(FilterExpr::True.into()),
            )
            .unwrap_err();
        assert!(matches!(err, AuthError::Configuration(_)));
    }

    #[test]
    fn test_conditions_for() {
        let registry = ConditionRegistry::new();
        registry.register("Invoice", "B", owned(), None).unwrap();
        registry.register("Invoice", "A", owned(), None).unwrap();
        let symbols: Vec<_> = registry.conditions_for("Invoice").into_iter().collect();
        assert_eq!(symbols, vec![ConditionSymbol::new("A"), ConditionSymbol::new("B")]);
        assert!(registry.conditions_for("Order").is_empty());
    }
}
