//! Compilation of decision trees to database filters and in-memory checks.

use std::collections::HashMap;
use std::fmt;

use condauth_proto::{AccessLevel, ConditionSymbol, EntityRow, FilterExpr, TypeAllowedAndConditions};
use tracing::debug;

use super::node::TypeConditionNode;
use crate::condition::{AuditArgs, BoundPredicate, ConditionRegistry};
use crate::error::AuthResult;
use crate::security::AuthContext;

/// Simplified decision tree for one (entity type, level, context).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessPlan {
    entity: String,
    node: TypeConditionNode,
}

impl AccessPlan {
    /// Build and simplify the tree for a request.
    pub fn build(
        entity: impl Into<String>,
        rules: &TypeAllowedAndConditions,
        level: AccessLevel,
        for_ui: bool,
    ) -> Self {
        let entity = entity.into();
        let node = TypeConditionNode::from_rules(rules, level, for_ui).simplify();
        if let Some(value) = node.constant() {
            debug!(entity = %entity, %level, for_ui, allowed = value, "access plan is constant");
        }
        Self { entity, node }
    }

    /// Entity type the plan decides for.
    pub fn entity(&self) -> &str {
        &self.entity
    }

    /// The simplified tree.
    pub fn node(&self) -> &TypeConditionNode {
        &self.node
    }

    /// The outcome when no condition needs evaluating.
    pub fn constant(&self) -> Option<bool> {
        self.node.constant()
    }

    /// Translate to a database filter over the plan's entity type.
    ///
    /// Each symbol is materialized once even when several rules share it.
    pub fn to_filter(
        &self,
        registry: &ConditionRegistry,
        ctx: &AuthContext,
        audit: Option<&AuditArgs>,
    ) -> AuthResult<FilterExpr> {
        let mut cache = HashMap::new();
        self.compile(&self.node, registry, ctx, audit, &mut cache)
    }

    fn compile(
        &self,
        node: &TypeConditionNode,
        registry: &ConditionRegistry,
        ctx: &AuthContext,
        audit: Option<&AuditArgs>,
        cache: &mut HashMap<ConditionSymbol, FilterExpr>,
    ) -> AuthResult<FilterExpr> {
        match node {
            TypeConditionNode::Constant(true) => Ok(FilterExpr::True),
            TypeConditionNode::Constant(false) => Ok(FilterExpr::False),
            TypeConditionNode::Conjunction(symbols) => {
                let mut parts = Vec::with_capacity(symbols.len());
                for symbol in symbols {
                    parts.push(self.symbol_filter(symbol, registry, ctx, audit, cache)?);
                }
                Ok(FilterExpr::and_all(parts))
            }
            TypeConditionNode::Branch { cond, then, else_ } => {
                let c = self.compile(cond, registry, ctx, audit, cache)?;
                match (then.constant(), else_.constant()) {
                    (Some(true), Some(false)) => Ok(c),
                    (Some(true), _) => {
                        let e = self.compile(else_, registry, ctx, audit, cache)?;
                        Ok(FilterExpr::or_any([c, e]))
                    }
                    (Some(false), _) => {
                        let e = self.compile(else_, registry, ctx, audit, cache)?;
                        Ok(FilterExpr::and_all([FilterExpr::negate(c), e]))
                    }
                    (_, Some(false)) => {
                        let t = self.compile(then, registry, ctx, audit, cache)?;
                        Ok(FilterExpr::and_all([c, t]))
                    }
                    (_, Some(true)) => {
                        let t = self.compile(then, registry, ctx, audit, cache)?;
                        Ok(FilterExpr::or_any([FilterExpr::negate(c), t]))
                    }
                    (None, None) => {
                        let t = self.compile(then, registry, ctx, audit, cache)?;
                        let e = self.compile(else_, registry, ctx, audit, cache)?;
                        Ok(FilterExpr::or_any([
                            FilterExpr::and_all([c.clone(), t]),
                            FilterExpr::and_all([FilterExpr::negate(c), e]),
                        ]))
                    }
                }
            }
        }
    }

    fn symbol_filter(
        &self,
        symbol: &ConditionSymbol,
        registry: &ConditionRegistry,
        ctx: &AuthContext,
        audit: Option<&AuditArgs>,
        cache: &mut HashMap<ConditionSymbol, FilterExpr>,
    ) -> AuthResult<FilterExpr> {
        if let Some(filter) = cache.get(symbol) {
            return Ok(filter.clone());
        }
        let filter = registry
            .get_condition(ctx.scope(), &self.entity, symbol, audit)?
            .resolve(ctx.principal())?;
        cache.insert(symbol.clone(), filter.clone());
        Ok(filter)
    }

    /// Translate to an in-memory check, or `None` when some symbol has no
    /// in-memory form.
    pub fn to_in_memory(
        &self,
        registry: &ConditionRegistry,
        ctx: &AuthContext,
    ) -> AuthResult<Option<InMemoryPlan>> {
        let mut bound = HashMap::new();
        for symbol in self.node.symbols() {
            match registry.get_in_memory_condition(ctx.scope(), &self.entity, &symbol, ctx.principal())? {
                Some(predicate) => {
                    bound.insert(symbol, predicate);
                }
                None => return Ok(None),
            }
        }
        Ok(Some(InMemoryPlan {
            root: bind_node(&self.node, &bound),
        }))
    }
}

enum InMemoryNode {
    Constant(bool),
    Conjunction(Vec<BoundPredicate>),
    Branch {
        cond: Box<InMemoryNode>,
        then: Box<InMemoryNode>,
        else_: Box<InMemoryNode>,
    },
}

fn bind_node(
    node: &TypeConditionNode,
    bound: &HashMap<ConditionSymbol, BoundPredicate>,
) -> InMemoryNode {
    match node {
        TypeConditionNode::Constant(value) => InMemoryNode::Constant(*value),
        TypeConditionNode::Conjunction(symbols) => InMemoryNode::Conjunction(
            symbols
                .iter()
                .filter_map(|symbol| bound.get(symbol).cloned())
                .collect(),
        ),
        TypeConditionNode::Branch { cond, then, else_ } => InMemoryNode::Branch {
            cond: Box::new(bind_node(cond, bound)),
            then: Box::new(bind_node(then, bound)),
            else_: Box::new(bind_node(else_, bound)),
        },
    }
}

impl InMemoryNode {
    fn evaluate(&self, row: &EntityRow) -> bool {
        match self {
            InMemoryNode::Constant(value) => *value,
            InMemoryNode::Conjunction(predicates) => predicates.iter().all(|p| p(row)),
            InMemoryNode::Branch { cond, then, else_ } => {
                if cond.evaluate(row) {
                    then.evaluate(row)
                } else {
                    else_.evaluate(row)
                }
            }
        }
    }
}

/// A plan bound to one principal, evaluated against loaded rows.
pub struct InMemoryPlan {
    root: InMemoryNode,
}

impl InMemoryPlan {
    /// Decide for a loaded row.
    pub fn evaluate(&self, row: &EntityRow) -> bool {
        self.root.evaluate(row)
    }
}

impl fmt::Debug for InMemoryPlan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InMemoryPlan").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::condition::ConditionExpr;
    use crate::error::AuthError;
    use crate::query::FilterEvaluator;
    use crate::security::Principal;
    use condauth_proto::{AllowedPair, ConditionRule};

    fn registry() -> ConditionRegistry {
        let registry = ConditionRegistry::new();
        registry
            .register_evaluable("Invoice", "OwnedByMe", ConditionExpr::principal_id("owner"))
            .unwrap();
        registry
            .register_evaluable(
                "Invoice",
                "Large",
                FilterExpr::gt("amount", 1000i64).into(),
            )
            .unwrap();
        registry
            .register("Invoice", "Flagged", FilterExpr::eq("flagged", true).into(), None)
            .unwrap();
        registry
            .register_query_auditor(
                "Invoice",
                "Audited",
                |_: &AuditArgs| FilterExpr::True.into(),
                None,
            )
            .unwrap();
        registry.seal();
        registry
    }

    fn ctx() -> AuthContext {
        AuthContext::new(Principal::new("alice", "Sales"))
    }

    fn pair(level: AccessLevel) -> AllowedPair {
        AllowedPair::both(level)
    }

    fn chain() -> TypeAllowedAndConditions {
        TypeAllowedAndConditions::new(pair(AccessLevel::Read))
            .with_rule(ConditionRule::new(["OwnedByMe"], pair(AccessLevel::Write)))
            .with_rule(ConditionRule::new(["Large"], pair(AccessLevel::Read)))
    }

    #[test]
    fn test_to_filter_branches() {
        let plan = AccessPlan::build("Invoice", &chain(), AccessLevel::Write, false);
        let filter = plan.to_filter(&registry(), &ctx(), None).unwrap();
        // if Large then false else OwnedByMe
        assert_eq!(
            filter,
            FilterExpr::and_all([
                FilterExpr::negate(FilterExpr::gt("amount", 1000i64)),
                FilterExpr::eq("owner", "alice"),
            ])
        );
    }

    #[test]
    fn test_constant_plan_needs_no_conditions() {
        let plan = AccessPlan::build("Invoice", &chain(), AccessLevel::Read, false);
        assert_eq!(plan.constant(), Some(true));
        let empty = ConditionRegistry::new();
        assert_eq!(plan.to_filter(&empty, &ctx(), None).unwrap(), FilterExpr::True);
    }

    #[test]
    fn test_in_memory_agrees_with_filter() {
        let registry = registry();
        let ctx = ctx();
        let plan = AccessPlan::build("Invoice", &chain(), AccessLevel::Write, false);
        let filter = plan.to_filter(&registry, &ctx, None).unwrap();
        let in_memory = plan.to_in_memory(&registry, &ctx).unwrap().unwrap();

        for (owner, amount) in [("alice", 10i64), ("alice", 5000), ("bob", 10), ("bob", 5000)] {
            let row = EntityRow::new([3u8; 16])
                .with_field("owner", owner)
                .with_field("amount", amount);
            assert_eq!(in_memory.evaluate(&row), FilterEvaluator::evaluate(&filter, &row));
        }
    }

    #[test]
    fn test_in_memory_unavailable() {
        let rules = TypeAllowedAndConditions::new(pair(AccessLevel::None))
            .with_rule(ConditionRule::new(["Flagged"], pair(AccessLevel::Write)));
        let plan = AccessPlan::build("Invoice", &rules, AccessLevel::Write, false);
        assert!(plan.to_in_memory(&registry(), &ctx()).unwrap().is_none());
    }

    #[test]
    fn test_auditor_without_context_is_unsupported() {
        let rules = TypeAllowedAndConditions::new(pair(AccessLevel::None))
            .with_rule(ConditionRule::new(["Audited"], pair(AccessLevel::Write)));
        let plan = AccessPlan::build("Invoice", &rules, AccessLevel::Write, false);
        let err = plan.to_filter(&registry(), &ctx(), None).unwrap_err();
        assert!(matches!(err, AuthError::UnsupportedOperation(_)));

        let args = AuditArgs::new("Invoice", None);
        assert_eq!(
            plan.to_filter(&registry(), &ctx(), Some(&args)).unwrap(),
            FilterExpr::True
        );
    }

    #[test]
    fn test_general_branch() {
        // if Flagged then OwnedByMe else Large
        let node = TypeConditionNode::Branch {
            cond: Box::new(TypeConditionNode::Conjunction(vec!["Flagged".into()])),
            then: Box::new(TypeConditionNode::Conjunction(vec!["OwnedByMe".into()])),
            else_: Box::new(TypeConditionNode::Conjunction(vec!["Large".into()])),
        };
        let plan = AccessPlan {
            entity: "Invoice".into(),
            node,
        };
        let filter = plan.to_filter(&registry(), &ctx(), None).unwrap();
        let flagged = FilterExpr::eq("flagged", true);
        assert_eq!(
            filter,
            FilterExpr::or_any([
                FilterExpr::and_all([flagged.clone(), FilterExpr::eq("owner", "alice")]),
                FilterExpr::and_all([FilterExpr::negate(flagged), FilterExpr::gt("amount", 1000i64)]),
            ])
        );
    }
}
