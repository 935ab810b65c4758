//! The assembled authorization engine.

use std::fmt;
use std::sync::Arc;

use condauth_proto::{AccessLevel, EntityId, EntityQuery, EntityRow, ExplainResult};
use tracing::info;

use crate::condition::ConditionRegistry;
use crate::config::EngineConfig;
use crate::enforce::{check_writes, AccessControl, Target, WRITE_CHECK_HOOK};
use crate::error::AuthResult;
use crate::rules::{MaxMerge, MergeStrategy, RuleResolver, RuleStore};
use crate::security::{AuditLogger, AuthContext, PropertyGuard, TracingAuditLogger};
use crate::storage::{StorageEngine, Transaction};

/// Builder for [`AuthEngine`].
pub struct AuthEngineBuilder {
    storage: Arc<StorageEngine>,
    registry: Arc<ConditionRegistry>,
    store: Arc<dyn RuleStore>,
    config: EngineConfig,
    strategy: Arc<dyn MergeStrategy>,
    audit: Arc<dyn AuditLogger>,
}

impl AuthEngineBuilder {
    /// Set the engine configuration.
    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Set the inheritance merge strategy. Defaults to [`MaxMerge`].
    pub fn strategy(mut self, strategy: Arc<dyn MergeStrategy>) -> Self {
        self.strategy = strategy;
        self
    }

    /// Set the audit backend. Defaults to [`TracingAuditLogger`].
    pub fn audit(mut self, audit: Arc<dyn AuditLogger>) -> Self {
        self.audit = audit;
        self
    }

    /// Assemble the engine.
    pub fn build(self) -> AuthEngine {
        let resolver = Arc::new(RuleResolver::new(
            Arc::clone(&self.store),
            Arc::clone(&self.registry),
            self.strategy,
            self.config.default_fallback,
            Arc::clone(&self.audit),
        ));
        let access = AccessControl::new(
            Arc::clone(&self.registry),
            Arc::clone(&resolver),
            self.config.clone(),
            Arc::clone(&self.audit),
        );
        let properties = PropertyGuard::new(Arc::clone(&resolver), Arc::clone(&self.audit));

        info!(
            batch_size = self.config.batch_size,
            explain_denials = self.config.explain_denials,
            "authorization engine ready"
        );
        AuthEngine {
            storage: self.storage,
            registry: self.registry,
            store: self.store,
            resolver,
            access,
            properties,
            config: self.config,
        }
    }
}

/// Conditional authorization over a storage engine.
pub struct AuthEngine {
    storage: Arc<StorageEngine>,
    registry: Arc<ConditionRegistry>,
    store: Arc<dyn RuleStore>,
    resolver: Arc<RuleResolver>,
    access: AccessControl,
    properties: PropertyGuard,
    config: EngineConfig,
}

impl AuthEngine {
    /// Start building an engine.
    pub fn builder(
        storage: Arc<StorageEngine>,
        registry: Arc<ConditionRegistry>,
        store: Arc<dyn RuleStore>,
    ) -> AuthEngineBuilder {
        AuthEngineBuilder {
            storage,
            registry,
            store,
            config: EngineConfig::default(),
            strategy: Arc::new(MaxMerge),
            audit: Arc::new(TracingAuditLogger),
        }
    }

    /// Committed storage.
    pub fn storage(&self) -> &StorageEngine {
        &self.storage
    }

    /// Condition registry.
    pub fn registry(&self) -> &ConditionRegistry {
        &self.registry
    }

    /// Rule store.
    pub fn store(&self) -> &dyn RuleStore {
        self.store.as_ref()
    }

    /// Rule resolver.
    pub fn resolver(&self) -> &RuleResolver {
        &self.resolver
    }

    /// Row-level enforcement primitives.
    pub fn access(&self) -> &AccessControl {
        &self.access
    }

    /// Property-level guard.
    pub fn properties(&self) -> &PropertyGuard {
        &self.properties
    }

    /// Engine configuration.
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Open a transaction whose commit asserts every write.
    pub fn begin<'a>(&'a self, ctx: &'a AuthContext) -> Transaction<'a> {
        let mut tx = self.storage.begin();
        self.enlist_write_check(ctx, &mut tx);
        tx
    }

    /// Enlist the write check on an existing transaction. Returns false if
    /// it was already enlisted.
    pub fn enlist_write_check<'a>(&'a self, ctx: &'a AuthContext, tx: &mut Transaction<'a>) -> bool {
        tx.enlist(
            WRITE_CHECK_HOOK,
            Box::new(move |tx: &mut Transaction<'a>| check_writes(&self.access, ctx, tx)),
        )
    }

    /// Whether the principal holds `level` on a committed entity.
    pub fn is_allowed(
        &self,
        ctx: &AuthContext,
        target: Target<'_>,
        level: AccessLevel,
        for_ui: bool,
    ) -> AuthResult<bool> {
        self.access
            .is_allowed(ctx, &*self.storage, target, level, for_ui)
    }

    /// Fail unless the principal holds `level` on a committed entity.
    pub fn assert_allowed(
        &self,
        ctx: &AuthContext,
        target: Target<'_>,
        level: AccessLevel,
        for_ui: bool,
    ) -> AuthResult<()> {
        self.access
            .assert_allowed(ctx, &*self.storage, target, level, for_ui)
    }

    /// Assert backend write access on committed entities.
    pub fn batch_assert_write(&self, ctx: &AuthContext, entity: &str, ids: &[EntityId]) -> AuthResult<()> {
        self.access
            .batch_assert_write(ctx, &*self.storage, entity, ids)
    }

    /// Run a filtered query against committed storage and mask properties
    /// the principal may not read.
    pub fn query(&self, ctx: &AuthContext, query: EntityQuery) -> AuthResult<Vec<EntityRow>> {
        let entity = query.entity.clone();
        let for_ui = ctx.scope().is_user_interface();
        self.access
            .query(ctx, &*self.storage, query)?
            .into_iter()
            .map(|row| self.properties.mask_row(ctx, &entity, row, for_ui))
            .collect()
    }

    /// Explain the decision on a committed entity.
    pub fn explain(
        &self,
        ctx: &AuthContext,
        target: Target<'_>,
        level: AccessLevel,
        for_ui: bool,
    ) -> AuthResult<ExplainResult> {
        self.access
            .explain(ctx, &*self.storage, target, level, for_ui)
    }

    /// Drop every cached rule resolution.
    pub fn invalidate_rules(&self) -> u64 {
        self.resolver.invalidate_all()
    }
}

impl fmt::Debug for AuthEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthEngine")
            .field("storage", &self.storage)
            .field("registry", &self.registry)
            .field("resolver", &self.resolver)
            .field("config", &self.config)
            .finish()
    }
}
