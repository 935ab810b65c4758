//! Property-level allowances: masking on read, checks on write.

use std::sync::Arc;

use condauth_proto::{AccessLevel, EntityRow, FilterExpr, MaskingStrategy, PropertyRules, Value};
use tracing::debug;

use super::audit::{AuditEvent, AuditLogger};
use super::context::AuthContext;
use crate::error::{AuthError, AuthResult};
use crate::query::referenced_fields;
use crate::rules::RuleResolver;

/// Applies the resolved property rules of the current principal.
pub struct PropertyGuard {
    resolver: Arc<RuleResolver>,
    audit: Arc<dyn AuditLogger>,
}

impl PropertyGuard {
    /// Create a guard over a resolver.
    pub fn new(resolver: Arc<RuleResolver>, audit: Arc<dyn AuditLogger>) -> Self {
        Self { resolver, audit }
    }

    fn rules(&self, ctx: &AuthContext, entity: &str) -> AuthResult<Arc<PropertyRules>> {
        self.resolver
            .resolve_properties(&ctx.principal().role, entity)
    }

    /// Mask every property the principal may not read.
    ///
    /// The `id` field is never masked.
    pub fn mask_row(
        &self,
        ctx: &AuthContext,
        entity: &str,
        mut row: EntityRow,
        for_ui: bool,
    ) -> AuthResult<EntityRow> {
        if ctx.scope().authorization_disabled() {
            return Ok(row);
        }
        let rules = self.rules(ctx, entity)?;

        let hidden: Vec<String> = row
            .fields
            .iter()
            .filter(|f| f.name != "id" && !rules.get(&f.name).allows(AccessLevel::Read, for_ui))
            .map(|f| f.name.clone())
            .collect();
        if hidden.is_empty() {
            return Ok(row);
        }

        debug!(entity, fields = ?hidden, "masking properties");
        for name in hidden {
            match &rules.masking {
                MaskingStrategy::Omit => {
                    row.remove(&name);
                }
                MaskingStrategy::Null => row.set(name, Value::Null),
                MaskingStrategy::Redacted(placeholder) => {
                    row.set(name, Value::String(placeholder.clone()))
                }
            }
        }
        Ok(row)
    }

    /// Fail with `AccessDenied` naming the first property the principal may
    /// not write.
    pub fn assert_fields_writable<'f>(
        &self,
        ctx: &AuthContext,
        entity: &str,
        fields: impl IntoIterator<Item = &'f str>,
        for_ui: bool,
    ) -> AuthResult<()> {
        self.assert_fields(ctx, entity, fields, AccessLevel::Write, for_ui)
    }

    /// Fail with `AccessDenied` when a filter references a property the
    /// principal may not read.
    pub fn assert_filter_readable(
        &self,
        ctx: &AuthContext,
        entity: &str,
        filter: &FilterExpr,
        for_ui: bool,
    ) -> AuthResult<()> {
        let fields = referenced_fields(filter);
        self.assert_fields(
            ctx,
            entity,
            fields.iter().map(String::as_str),
            AccessLevel::Read,
            for_ui,
        )
    }

    fn assert_fields<'f>(
        &self,
        ctx: &AuthContext,
        entity: &str,
        fields: impl IntoIterator<Item = &'f str>,
        level: AccessLevel,
        for_ui: bool,
    ) -> AuthResult<()> {
        if ctx.scope().authorization_disabled() {
            return Ok(());
        }
        let rules = self.rules(ctx, entity)?;
        for field in fields {
            if field == "id" || rules.get(field).allows(level, for_ui) {
                continue;
            }
            let target = format!("{}.{}", entity, field);
            self.audit
                .log(AuditEvent::access_denied(ctx, target.clone(), level, Vec::new()));
            return Err(AuthError::AccessDenied {
                level,
                entity: target,
                ids: Vec::new(),
                explain: None,
            });
        }
        Ok(())
    }
}

impl std::fmt::Debug for PropertyGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PropertyGuard").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::condition::ConditionRegistry;
    use crate::rules::{MaxMerge, SledRuleStore};
    use crate::security::{MemoryAuditLogger, Principal};
    use condauth_proto::{AllowedPair, RoleDef};

    fn guard(masking: MaskingStrategy) -> (PropertyGuard, MemoryAuditLogger, sled::Db) {
        let db = sled::Config::new().temporary(true).open().unwrap();
        let store = Arc::new(SledRuleStore::open(&db).unwrap());
        store.put_role(&RoleDef::new("Sales")).unwrap();
        store
            .put_property_rules(
                "Sales",
                "Invoice",
                &PropertyRules::new(AllowedPair::both(AccessLevel::Write))
                    .with_field("margin", AllowedPair::new(AccessLevel::None, AccessLevel::Read))
                    .with_field("total", AllowedPair::both(AccessLevel::Read))
                    .with_masking(masking),
            )
            .unwrap();
        let audit = MemoryAuditLogger::new();
        let resolver = Arc::new(RuleResolver::new(
            store,
            Arc::new(ConditionRegistry::new()),
            Arc::new(MaxMerge),
            AllowedPair::none(),
            Arc::new(audit.clone()),
        ));
        (PropertyGuard::new(resolver, Arc::new(audit.clone())), audit, db)
    }

    fn ctx() -> AuthContext {
        AuthContext::new(Principal::new("alice", "Sales"))
    }

    fn row() -> EntityRow {
        EntityRow::new([1u8; 16])
            .with_field("margin", 12i64)
            .with_field("total", 100i64)
    }

    #[test]
    fn test_mask_row_per_context() {
        let (guard, _audit, _db) = guard(MaskingStrategy::Null);
        let masked = guard.mask_row(&ctx(), "Invoice", row(), true).unwrap();
        assert_eq!(masked.get("margin"), Some(&Value::Null));
        assert_eq!(masked.get("total"), Some(&Value::Int64(100)));

        let backend = guard.mask_row(&ctx(), "Invoice", row(), false).unwrap();
        assert_eq!(backend.get("margin"), Some(&Value::Int64(12)));
    }

    #[test]
    fn test_mask_strategies() {
        let (omit, _a, _db) = guard(MaskingStrategy::Omit);
        let masked = omit.mask_row(&ctx(), "Invoice", row(), true).unwrap();
        assert!(masked.get("margin").is_none());
        assert!(masked.get("id").is_some());

        let (redact, _b, _db2) = guard(MaskingStrategy::Redacted("***".into()));
        let masked = redact.mask_row(&ctx(), "Invoice", row(), true).unwrap();
        assert_eq!(masked.get("margin"), Some(&Value::String("***".into())));
    }

    #[test]
    fn test_assert_fields_writable_names_field() {
        let (guard, audit, _db) = guard(MaskingStrategy::Null);
        guard
            .assert_fields_writable(&ctx(), "Invoice", ["id", "customer"], false)
            .unwrap();
        let err = guard
            .assert_fields_writable(&ctx(), "Invoice", ["customer", "total"], false)
            .unwrap_err();
        match err {
            AuthError::AccessDenied { entity, level, .. } => {
                assert_eq!(entity, "Invoice.total");
                assert_eq!(level, AccessLevel::Write);
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(audit.len(), 1);
    }

    #[test]
    fn test_filter_on_hidden_field() {
        let (guard, _audit, _db) = guard(MaskingStrategy::Null);
        let filter = FilterExpr::gt("margin", 10i64);
        assert!(guard.assert_filter_readable(&ctx(), "Invoice", &filter, false).is_ok());
        assert!(guard.assert_filter_readable(&ctx(), "Invoice", &filter, true).is_err());
    }

    #[test]
    fn test_disabled_authorization_skips_masking() {
        let (guard, _audit, _db) = guard(MaskingStrategy::Null);
        let ctx = ctx();
        let _off = ctx.disable_authorization();
        let row = guard.mask_row(&ctx, "Invoice", row(), true).unwrap();
        assert_eq!(row.get("margin"), Some(&Value::Int64(12)));
    }
}
