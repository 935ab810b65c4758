//! condauth core - conditional authorization over a transactional row store.
//!
//! Roles grant access levels on entity types, optionally gated by ordered
//! condition rules. Conditions are named predicates registered per entity
//! type. The engine turns a role's rules into a decision tree, simplifies it,
//! and either injects it as a query filter, evaluates it against a loaded
//! row, or asserts it on every write at commit time.
//!
//! ```ignore
//! use std::sync::Arc;
//! use condauth_core::{AuthEngine, ConditionExpr, ConditionRegistry, StorageConfig, StorageEngine};
//! use condauth_core::rules::SledRuleStore;
//!
//! let storage = Arc::new(StorageEngine::open(StorageConfig::temporary())?);
//! let store = Arc::new(SledRuleStore::open(storage.db())?);
//! let registry = Arc::new(ConditionRegistry::new());
//! registry.register_evaluable("Invoice", "OwnedByMe", ConditionExpr::principal_id("owner"))?;
//! registry.seal();
//! let engine = AuthEngine::builder(storage, registry, store).build();
//! ```

#[cfg(feature = "mimalloc")]
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

pub mod builder;
pub mod condition;
pub mod config;
pub mod enforce;
pub mod engine;
pub mod error;
mod explain;
pub mod query;
pub mod rules;
pub mod security;
pub mod storage;

pub use builder::{AccessPlan, InMemoryPlan, TypeConditionNode};
pub use condition::{AuditArgs, ConditionExpr, ConditionRegistry, TypeCondition};
pub use config::EngineConfig;
pub use enforce::{AccessControl, Target};
pub use engine::{AuthEngine, AuthEngineBuilder};
pub use error::{AuthError, AuthResult};
pub use rules::{MaxMerge, MergeStrategy, MinMerge, RuleResolver, RuleStore, SledRuleStore};
pub use security::{AuthContext, Principal, PropertyGuard};
pub use storage::{EntitySource, StorageConfig, StorageEngine, Transaction};

/// Re-export protocol types.
pub use condauth_proto as proto;
