//! Evaluation traces for denied (or allowed) requests.

use std::collections::HashMap;

use condauth_proto::{
    AccessLevel, ConditionSymbol, ExplainResult, ExplainedRule, SymbolOutcome,
};
use tracing::debug;

use crate::enforce::{AccessControl, Target};
use crate::error::{AuthError, AuthResult};
use crate::security::AuthContext;
use crate::storage::EntitySource;

impl AccessControl {
    /// Evaluate every rule of the principal's role against one entity.
    ///
    /// Symbols are decided in memory when the condition allows it and by one
    /// existence query each otherwise. The trace reproduces the decision of
    /// [`AccessControl::is_allowed`].
    pub fn explain<S>(
        &self,
        ctx: &AuthContext,
        source: &S,
        target: Target<'_>,
        level: AccessLevel,
        for_ui: bool,
    ) -> AuthResult<ExplainResult>
    where
        S: EntitySource + ?Sized,
    {
        let entity = target.entity();
        let id = target.id();
        let rules = self.resolver.resolve(&ctx.principal().role, entity)?;

        let loaded;
        let row = match target {
            Target::Row { row, .. } => row,
            Target::Ref(_) => {
                loaded = source.get(entity, &id)?.ok_or_else(|| AuthError::EntityNotFound {
                    entity: entity.to_string(),
                    ids: vec![id],
                })?;
                &loaded
            }
        };

        let mut outcomes: HashMap<ConditionSymbol, bool> = HashMap::new();
        for symbol in rules.symbols() {
            let holds = match self.registry.get_in_memory_condition(
                ctx.scope(),
                entity,
                &symbol,
                ctx.principal(),
            )? {
                Some(predicate) => predicate(row),
                None => {
                    ctx.check_cancelled()?;
                    let filter = self
                        .registry
                        .get_condition(ctx.scope(), entity, &symbol, None)?
                        .resolve(ctx.principal())?;
                    source.exists_matching(entity, &id, &filter)?
                }
            };
            outcomes.insert(symbol, holds);
        }

        let explained = rules
            .conditions
            .iter()
            .map(|rule| ExplainedRule {
                symbols: rule
                    .symbols
                    .iter()
                    .map(|symbol| SymbolOutcome {
                        symbol: symbol.clone(),
                        holds: outcomes.get(symbol).copied().unwrap_or(false),
                    })
                    .collect(),
                allowed: rule.allowed,
            })
            .collect();

        let result = ExplainResult {
            entity: entity.to_string(),
            id,
            requested: level,
            for_ui,
            fallback: rules.fallback,
            rules: explained,
        };
        debug!(entity, allowed = result.is_allowed(), deciding = ?result.deciding_rule(), "explained");
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use condauth_proto::{
        AllowedPair, ConditionRule, EntityRef, EntityRow, FilterExpr, RoleDef,
        TypeAllowedAndConditions,
    };

    use crate::condition::{ConditionExpr, ConditionRegistry};
    use crate::config::EngineConfig;
    use crate::rules::{MaxMerge, RuleResolver, SledRuleStore};
    use crate::security::{NullAuditLogger, Principal};
    use crate::storage::{StorageConfig, StorageEngine};

    fn setup() -> (AccessControl, StorageEngine) {
        let storage = StorageEngine::open(StorageConfig::temporary()).unwrap();
        let store = Arc::new(SledRuleStore::open(storage.db()).unwrap());
        store.put_role(&RoleDef::new("Sales")).unwrap();
        store
            .put_type_rules(
                "Sales",
                "Invoice",
                &TypeAllowedAndConditions::new(AllowedPair::both(AccessLevel::Read))
                    .with_rule(ConditionRule::new(["OwnedByMe"], AllowedPair::both(AccessLevel::Write)))
                    .with_rule(ConditionRule::new(["Large"], AllowedPair::both(AccessLevel::Read)))
                    .with_rule(ConditionRule::new(["Archived"], AllowedPair::none())),
            )
            .unwrap();

        let registry = Arc::new(ConditionRegistry::new());
        registry
            .register_evaluable("Invoice", "OwnedByMe", ConditionExpr::principal_id("owner"))
            .unwrap();
        registry
            .register_evaluable("Invoice", "Large", FilterExpr::gt("amount", 1000i64).into())
            .unwrap();
        registry
            .register("Invoice", "Archived", FilterExpr::eq("archived", true).into(), None)
            .unwrap();
        registry.seal();

        let resolver = Arc::new(RuleResolver::new(
            store,
            registry.clone(),
            Arc::new(MaxMerge),
            AllowedPair::none(),
            Arc::new(NullAuditLogger),
        ));
        let access = AccessControl::new(
            registry,
            resolver,
            EngineConfig::default(),
            Arc::new(NullAuditLogger),
        );
        (access, storage)
    }

    fn invoice(owner: &str, amount: i64, archived: bool) -> EntityRow {
        EntityRow::new([4u8; 16])
            .with_field("owner", owner)
            .with_field("amount", amount)
            .with_field("archived", archived)
    }

    #[test]
    fn test_explain_matches_decision() {
        let (access, storage) = setup();
        let ctx = AuthContext::new(Principal::new("alice", "Sales"));
        let row = invoice("alice", 5000, false);
        storage.put("Invoice", &row).unwrap();

        let trace = access
            .explain(&ctx, &storage, Target::row("Invoice", &row), AccessLevel::Write, false)
            .unwrap();
        assert_eq!(trace.deciding_rule(), Some(1));
        assert!(!trace.is_allowed());
        let allowed = access
            .is_allowed(&ctx, &storage, Target::row("Invoice", &row), AccessLevel::Write, false)
            .unwrap();
        assert_eq!(trace.is_allowed(), allowed);

        let message = trace.error_message().unwrap();
        assert!(message.contains("Large"));
        assert!(message.contains("OwnedByMe"));
    }

    #[test]
    fn test_explain_queries_only_opaque_symbols() {
        let (access, storage) = setup();
        let ctx = AuthContext::new(Principal::new("alice", "Sales"));
        storage.put("Invoice", &invoice("alice", 10, true)).unwrap();
        let key = EntityRef::new("Invoice", [4u8; 16]);

        let before = storage.stats().snapshot();
        let trace = access
            .explain(&ctx, &storage, Target::Ref(&key), AccessLevel::Read, false)
            .unwrap();
        let used = storage.stats().snapshot().since(&before);
        assert_eq!(used.loads, 1);
        assert_eq!(used.existence, 1);
        assert_eq!(trace.deciding_rule(), Some(2));
        assert!(!trace.is_allowed());
    }

    #[test]
    fn test_explain_missing_entity() {
        let (access, storage) = setup();
        let ctx = AuthContext::new(Principal::new("alice", "Sales"));
        let key = EntityRef::new("Invoice", [5u8; 16]);
        let err = access
            .explain(&ctx, &storage, Target::Ref(&key), AccessLevel::Read, false)
            .unwrap_err();
        assert!(matches!(err, AuthError::EntityNotFound { .. }));
    }
}
