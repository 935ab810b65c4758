//! Enforcement primitives: checks, assertions, and query filter injection.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use condauth_proto::{AccessLevel, EntityId, EntityQuery, EntityRef, EntityRow, FilterExpr};
use tracing::{debug, instrument};

use crate::builder::AccessPlan;
use crate::condition::{AuditArgs, ConditionRegistry};
use crate::config::EngineConfig;
use crate::error::{AuthError, AuthResult};
use crate::rules::RuleResolver;
use crate::security::{AuditEvent, AuditLogger, AuthContext};
use crate::storage::EntitySource;

/// What an access check is about.
#[derive(Debug, Clone, Copy)]
pub enum Target<'r> {
    /// A loaded row; in-memory conditions can decide without a query.
    Row {
        /// Entity type.
        entity: &'r str,
        /// The row.
        row: &'r EntityRow,
    },
    /// A reference to a row that may not be loaded or may not exist.
    Ref(&'r EntityRef),
}

impl<'r> Target<'r> {
    /// Target a loaded row.
    pub fn row(entity: &'r str, row: &'r EntityRow) -> Self {
        Target::Row { entity, row }
    }

    /// Entity type of the target.
    pub fn entity(&self) -> &'r str {
        match *self {
            Target::Row { entity, .. } => entity,
            Target::Ref(key) => &key.entity,
        }
    }

    /// Identity of the target.
    pub fn id(&self) -> EntityId {
        match *self {
            Target::Row { row, .. } => row.id,
            Target::Ref(key) => key.id,
        }
    }
}

impl<'r> From<&'r EntityRef> for Target<'r> {
    fn from(key: &'r EntityRef) -> Self {
        Target::Ref(key)
    }
}

/// Row-level enforcement over resolved rules and registered conditions.
pub struct AccessControl {
    pub(crate) registry: Arc<ConditionRegistry>,
    pub(crate) resolver: Arc<RuleResolver>,
    pub(crate) config: EngineConfig,
    pub(crate) audit: Arc<dyn AuditLogger>,
}

impl AccessControl {
    /// Create the enforcement layer.
    pub fn new(
        registry: Arc<ConditionRegistry>,
        resolver: Arc<RuleResolver>,
        config: EngineConfig,
        audit: Arc<dyn AuditLogger>,
    ) -> Self {
        Self {
            registry,
            resolver,
            config,
            audit,
        }
    }

    /// The simplified plan deciding `level` on `entity` for the principal.
    pub fn plan(
        &self,
        ctx: &AuthContext,
        entity: &str,
        level: AccessLevel,
        for_ui: bool,
    ) -> AuthResult<AccessPlan> {
        let rules = self.resolver.resolve(&ctx.principal().role, entity)?;
        Ok(AccessPlan::build(entity, &rules, level, for_ui))
    }

    /// Returns true when checks are suspended, after auditing the bypass.
    fn bypassed(&self, ctx: &AuthContext, operation: &str, entity: &str) -> bool {
        if ctx.scope().authorization_disabled() {
            self.audit
                .log(AuditEvent::authorization_bypassed(ctx, operation, entity));
            true
        } else {
            false
        }
    }

    /// Whether the principal holds `level` on the target.
    ///
    /// Constant plans decide without a query. Loaded rows are decided in
    /// memory when every condition allows it; otherwise one existence query
    /// `id = X AND <predicate>` runs.
    pub fn is_allowed<S>(
        &self,
        ctx: &AuthContext,
        source: &S,
        target: Target<'_>,
        level: AccessLevel,
        for_ui: bool,
    ) -> AuthResult<bool>
    where
        S: EntitySource + ?Sized,
    {
        let entity = target.entity();
        if self.bypassed(ctx, "is_allowed", entity) {
            return Ok(true);
        }

        let plan = self.plan(ctx, entity, level, for_ui)?;
        if let Some(value) = plan.constant() {
            return Ok(value);
        }

        if let Target::Row { row, .. } = target {
            if let Some(in_memory) = plan.to_in_memory(&self.registry, ctx)? {
                return Ok(in_memory.evaluate(row));
            }
        }

        ctx.check_cancelled()?;
        let filter = plan.to_filter(&self.registry, ctx, None)?;
        source.exists_matching(entity, &target.id(), &filter)
    }

    /// Fail with `AccessDenied` unless the principal holds `level`.
    ///
    /// With `conceal_missing_entities` off, a missing referenced entity is
    /// reported as `EntityNotFound` instead.
    #[instrument(skip(self, ctx, source, target), fields(entity = target.entity()))]
    pub fn assert_allowed<S>(
        &self,
        ctx: &AuthContext,
        source: &S,
        target: Target<'_>,
        level: AccessLevel,
        for_ui: bool,
    ) -> AuthResult<()>
    where
        S: EntitySource + ?Sized,
    {
        if self.is_allowed(ctx, source, target, level, for_ui)? {
            return Ok(());
        }

        let entity = target.entity();
        let id = target.id();
        if let Target::Ref(_) = target {
            if !self.config.conceal_missing_entities && source.get(entity, &id)?.is_none() {
                return Err(AuthError::EntityNotFound {
                    entity: entity.to_string(),
                    ids: vec![id],
                });
            }
        }

        Err(self.denied(ctx, source, entity, vec![id], Some(target), level, for_ui)?)
    }

    /// Build and audit an `AccessDenied`, attaching an explain trace when
    /// configured.
    #[allow(clippy::too_many_arguments)]
    fn denied<S>(
        &self,
        ctx: &AuthContext,
        source: &S,
        entity: &str,
        ids: Vec<EntityId>,
        explained: Option<Target<'_>>,
        level: AccessLevel,
        for_ui: bool,
    ) -> AuthResult<AuthError>
    where
        S: EntitySource + ?Sized,
    {
        let explain = match explained {
            Some(target) if self.config.explain_denials => {
                match self.explain(ctx, source, target, level, for_ui) {
                    Ok(trace) => Some(Box::new(trace)),
                    Err(AuthError::EntityNotFound { .. }) => None,
                    Err(e) => return Err(e),
                }
            }
            _ => None,
        };

        debug!(entity, %level, denied = ids.len(), "access denied");
        self.audit
            .log(AuditEvent::access_denied(ctx, entity, level, ids.clone()));
        Ok(AuthError::AccessDenied {
            level,
            entity: entity.to_string(),
            ids,
            explain,
        })
    }

    /// Inject the authorization predicate into a query.
    ///
    /// Unchanged when access is unconditional; marked `always_empty` when
    /// access is impossible, so executing it touches no storage.
    pub fn filter_query(
        &self,
        ctx: &AuthContext,
        query: EntityQuery,
        level: AccessLevel,
        for_ui: bool,
    ) -> AuthResult<EntityQuery> {
        if self.bypassed(ctx, "filter_query", &query.entity) {
            return Ok(query);
        }

        let plan = self.plan(ctx, &query.entity, level, for_ui)?;
        match plan.constant() {
            Some(true) => return Ok(query),
            Some(false) => {
                debug!(entity = %query.entity, "query cannot return rows");
                return Ok(query.into_empty());
            }
            None => {}
        }

        let args = AuditArgs::new(query.entity.clone(), query.filter.clone());
        let filter = plan.to_filter(&self.registry, ctx, Some(&args))?;
        debug!(entity = %query.entity, filter = %filter, "authorization filter injected");
        self.audit.log(AuditEvent::filter_injected(
            ctx,
            query.entity.clone(),
            filter.to_string(),
        ));
        Ok(query.and_filter(filter))
    }

    /// Execute a query with automatic filtering.
    ///
    /// The level is `Write` while the scope writes the query's type and
    /// `Read` otherwise. Filtering is skipped when disabled in scope.
    pub fn query<S>(&self, ctx: &AuthContext, source: &S, query: EntityQuery) -> AuthResult<Vec<EntityRow>>
    where
        S: EntitySource + ?Sized,
    {
        ctx.check_cancelled()?;
        let scope = ctx.scope();
        if !scope.query_filter_enabled() {
            return source.execute(&query);
        }

        let level = if scope.is_writing(&query.entity) {
            AccessLevel::Write
        } else {
            AccessLevel::Read
        };
        let filtered = self.filter_query(ctx, query, level, scope.is_user_interface())?;
        source.execute(&filtered)
    }

    /// Assert backend write access on many ids of one type.
    ///
    /// Ids are checked in chunks of the configured batch size, one
    /// `select_decisions` round trip each, even when the plan is constant.
    /// Ids missing from storage fail with `EntityNotFound`, which takes
    /// precedence; ids present but not writable fail with `AccessDenied`.
    #[instrument(skip(self, ctx, source, ids), fields(ids = ids.len()))]
    pub fn batch_assert_write<S>(
        &self,
        ctx: &AuthContext,
        source: &S,
        entity: &str,
        ids: &[EntityId],
    ) -> AuthResult<()>
    where
        S: EntitySource + ?Sized,
    {
        if ids.is_empty() || self.bypassed(ctx, "batch_assert_write", entity) {
            return Ok(());
        }

        let plan = self.plan(ctx, entity, AccessLevel::Write, false)?;
        let filter = match plan.constant() {
            Some(true) => FilterExpr::True,
            Some(false) => FilterExpr::False,
            None => plan.to_filter(&self.registry, ctx, None)?,
        };
        let mut decisions: HashMap<EntityId, bool> = HashMap::with_capacity(ids.len());
        for chunk in ids.chunks(self.config.effective_batch_size()) {
            ctx.check_cancelled()?;
            decisions.extend(source.select_decisions(entity, chunk, &filter)?);
        }

        let missing: Vec<EntityId> = ids
            .iter()
            .filter(|id| !decisions.contains_key(*id))
            .copied()
            .collect();
        if !missing.is_empty() {
            return Err(AuthError::EntityNotFound {
                entity: entity.to_string(),
                ids: missing,
            });
        }

        let denied: Vec<EntityId> = ids
            .iter()
            .filter(|id| decisions.get(*id) == Some(&false))
            .copied()
            .collect();
        if let Some(first) = denied.first().copied() {
            let key = EntityRef::new(entity, first);
            return Err(self.denied(
                ctx,
                source,
                entity,
                denied,
                Some(Target::Ref(&key)),
                AccessLevel::Write,
                false,
            )?);
        }
        Ok(())
    }
}

impl fmt::Debug for AccessControl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AccessControl")
            .field("registry", &self.registry)
            .field("resolver", &self.resolver)
            .field("config", &self.config)
            .finish()
    }
}
