//! Integration tests for commit-time write checks.

use std::sync::Arc;

use condauth_core::rules::SledRuleStore;
use condauth_core::security::{AuditEventType, MemoryAuditLogger};
use condauth_core::storage::Transaction;
use condauth_core::{
    AuthContext, AuthEngine, AuthError, AuthResult, ConditionExpr, ConditionRegistry,
    EntitySource, Principal, StorageConfig, StorageEngine,
};
use condauth_proto::{
    AccessLevel, AllowedPair, ConditionRule, EntityRef, EntityRow, FilterExpr, RoleDef,
    TypeAllowedAndConditions, Value,
};

fn engine(audit: &MemoryAuditLogger) -> AuthEngine {
    let storage = Arc::new(StorageEngine::open(StorageConfig::temporary()).unwrap());
    let store = Arc::new(SledRuleStore::open(storage.db()).unwrap());
    store.put_role(&RoleDef::new("Sales")).unwrap();
    store
        .put_type_rules(
            "Sales",
            "Invoice",
            &TypeAllowedAndConditions::new(AllowedPair::both(AccessLevel::Read))
                .with_rule(ConditionRule::new(["OwnedByMe"], AllowedPair::both(AccessLevel::Write)))
                .with_rule(ConditionRule::new(["Large"], AllowedPair::both(AccessLevel::Read))),
        )
        .unwrap();

    let registry = Arc::new(ConditionRegistry::new());
    registry
        .register_evaluable("Invoice", "OwnedByMe", ConditionExpr::principal_id("owner"))
        .unwrap();
    registry
        .register("Invoice", "Large", FilterExpr::gt("amount", 1000i64).into(), None)
        .unwrap();
    registry.seal();

    AuthEngine::builder(storage, registry, store)
        .audit(Arc::new(audit.clone()))
        .build()
}

fn invoice(id: u8, owner: &str, amount: i64) -> EntityRow {
    EntityRow::new([id; 16])
        .with_field("owner", owner)
        .with_field("amount", amount)
}

fn stored_amount(engine: &AuthEngine, id: u8) -> Option<Value> {
    engine
        .storage()
        .get("Invoice", &[id; 16])
        .unwrap()
        .and_then(|row| row.get("amount").cloned())
}

#[test]
fn test_owner_updates_commit() {
    let audit = MemoryAuditLogger::new();
    let engine = engine(&audit);
    engine.storage().put("Invoice", &invoice(1, "alice", 100)).unwrap();
    let ctx = AuthContext::new(Principal::new("alice", "Sales"));

    let mut tx = engine.begin(&ctx);
    tx.update("Invoice", invoice(1, "alice", 200)).unwrap();
    tx.insert("Invoice", invoice(2, "alice", 50)).unwrap();
    tx.commit().unwrap();

    assert_eq!(stored_amount(&engine, 1), Some(Value::Int64(200)));
    assert_eq!(stored_amount(&engine, 2), Some(Value::Int64(50)));
    assert!(!ctx.scope().is_in_save());
}

#[test]
fn test_reassigning_foreign_invoice_is_denied() {
    let audit = MemoryAuditLogger::new();
    let engine = engine(&audit);
    engine.storage().put("Invoice", &invoice(1, "bob", 100)).unwrap();
    let ctx = AuthContext::new(Principal::new("alice", "Sales"));

    let mut tx = engine.begin(&ctx);
    tx.update("Invoice", invoice(1, "alice", 100)).unwrap();
    let err = tx.commit().unwrap_err();
    assert!(matches!(err, AuthError::AccessDenied { level: AccessLevel::Write, .. }));

    let owner = engine
        .storage()
        .get("Invoice", &[1u8; 16])
        .unwrap()
        .and_then(|row| row.get("owner").cloned());
    assert_eq!(owner, Some(Value::String("bob".into())));
}

#[test]
fn test_trigger_escalation_aborts_commit() {
    let audit = MemoryAuditLogger::new();
    let engine = engine(&audit);
    engine.storage().put("Invoice", &invoice(1, "alice", 100)).unwrap();
    engine.storage().register_trigger(Arc::new(
        |tx: &mut Transaction<'_>, keys: &[EntityRef]| -> AuthResult<()> {
            for key in keys.iter().filter(|k| k.entity == "Invoice") {
                if let Some(mut row) = tx.fetch(&key.entity, &key.id)? {
                    row.set("amount", 2000i64);
                    tx.update(&key.entity, row)?;
                }
            }
            Ok(())
        },
    ));
    let ctx = AuthContext::new(Principal::new("alice", "Sales"));

    let mut tx = engine.begin(&ctx);
    tx.update("Invoice", invoice(1, "alice", 500)).unwrap();
    let err = tx.commit().unwrap_err();
    assert!(matches!(err, AuthError::AccessDenied { level: AccessLevel::Write, .. }));
    assert_eq!(stored_amount(&engine, 1), Some(Value::Int64(100)));
}

#[test]
fn test_foreign_creation_is_denied() {
    let audit = MemoryAuditLogger::new();
    let engine = engine(&audit);
    let ctx = AuthContext::new(Principal::new("alice", "Sales"));

    let mut tx = engine.begin(&ctx);
    tx.insert("Invoice", invoice(3, "bob", 10)).unwrap();
    assert!(matches!(tx.commit(), Err(AuthError::AccessDenied { .. })));
    assert!(engine.storage().get("Invoice", &[3u8; 16]).unwrap().is_none());
    assert!(audit
        .events()
        .iter()
        .any(|e| matches!(e.event_type, AuditEventType::AccessDenied { .. })));
}

#[test]
fn test_delete_uses_committed_state() {
    let audit = MemoryAuditLogger::new();
    let engine = engine(&audit);
    engine.storage().put("Invoice", &invoice(1, "bob", 10)).unwrap();
    let ctx = AuthContext::new(Principal::new("alice", "Sales"));

    // Reassigning before deleting does not grant the delete.
    let mut tx = engine.begin(&ctx);
    tx.update("Invoice", invoice(1, "alice", 10)).unwrap();
    tx.delete("Invoice", [1u8; 16]).unwrap();
    assert!(matches!(tx.commit(), Err(AuthError::AccessDenied { .. })));
    assert!(engine.storage().get("Invoice", &[1u8; 16]).unwrap().is_some());
}

#[test]
fn test_create_then_delete_is_not_checked() {
    let audit = MemoryAuditLogger::new();
    let engine = engine(&audit);
    let ctx = AuthContext::new(Principal::new("alice", "Sales"));

    let mut tx = engine.begin(&ctx);
    tx.insert("Invoice", invoice(4, "bob", 10)).unwrap();
    tx.delete("Invoice", [4u8; 16]).unwrap();
    tx.commit().unwrap();
    assert!(engine.storage().get("Invoice", &[4u8; 16]).unwrap().is_none());
}

#[test]
fn test_skipped_write_is_audited_and_committed() {
    let audit = MemoryAuditLogger::new();
    let engine = engine(&audit);
    engine.storage().put("Invoice", &invoice(1, "bob", 10)).unwrap();
    let ctx = AuthContext::new(Principal::new("alice", "Sales"));

    let mut tx = engine.begin(&ctx);
    tx.update("Invoice", invoice(1, "bob", 20)).unwrap();
    tx.skip_write_check("Invoice", [1u8; 16], "currency migration");
    tx.commit().unwrap();

    assert_eq!(stored_amount(&engine, 1), Some(Value::Int64(20)));
    let skipped: Vec<_> = audit
        .events()
        .into_iter()
        .filter_map(|e| match e.event_type {
            AuditEventType::WriteCheckSkipped { reason, .. } => Some(reason),
            _ => None,
        })
        .collect();
    assert_eq!(skipped, vec!["currency migration".to_string()]);
}

#[test]
fn test_system_scope_commits_unchecked() {
    let audit = MemoryAuditLogger::new();
    let engine = engine(&audit);
    engine.storage().put("Invoice", &invoice(1, "bob", 10)).unwrap();
    let ctx = AuthContext::new(Principal::new("alice", "Sales"));

    let _system = ctx.disable_authorization();
    let mut tx = engine.begin(&ctx);
    tx.update("Invoice", invoice(1, "bob", 30)).unwrap();
    tx.commit().unwrap();
    assert_eq!(stored_amount(&engine, 1), Some(Value::Int64(30)));
}

#[test]
fn test_nested_level_rolls_back_on_drop() {
    let audit = MemoryAuditLogger::new();
    let engine = engine(&audit);
    let ctx = AuthContext::new(Principal::new("alice", "Sales"));

    let mut tx = engine.begin(&ctx);
    tx.insert("Invoice", invoice(1, "alice", 10)).unwrap();
    {
        let mut nested = tx.nested();
        nested.insert("Invoice", invoice(2, "bob", 10)).unwrap();
        assert_eq!(nested.depth(), 2);
    }
    assert_eq!(tx.depth(), 1);
    assert!(tx.fetch("Invoice", &[2u8; 16]).unwrap().is_none());
    tx.commit().unwrap();
    assert!(engine.storage().get("Invoice", &[1u8; 16]).unwrap().is_some());
}
