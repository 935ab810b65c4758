//! Entity access seam consumed by the authorization engine.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use condauth_proto::{EntityId, EntityQuery, EntityRow, FilterExpr};

use crate::error::AuthResult;
use crate::query::FilterEvaluator;

/// Counters for queries issued against a source.
#[derive(Debug, Default)]
pub struct QueryStats {
    loads: AtomicU64,
    existence: AtomicU64,
    batches: AtomicU64,
    executions: AtomicU64,
}

/// Point-in-time copy of [`QueryStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueryStatsSnapshot {
    /// Single-row loads.
    pub loads: u64,
    /// Existence queries.
    pub existence: u64,
    /// Batch decision queries.
    pub batches: u64,
    /// Executed entity queries.
    pub executions: u64,
}

impl QueryStatsSnapshot {
    /// Sum of every counter.
    pub fn total(&self) -> u64 {
        self.loads + self.existence + self.batches + self.executions
    }

    /// Queries issued since an earlier snapshot.
    pub fn since(&self, earlier: &QueryStatsSnapshot) -> QueryStatsSnapshot {
        QueryStatsSnapshot {
            loads: self.loads - earlier.loads,
            existence: self.existence - earlier.existence,
            batches: self.batches - earlier.batches,
            executions: self.executions - earlier.executions,
        }
    }
}

impl QueryStats {
    pub(crate) fn record_load(&self) {
        self.loads.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_existence(&self) {
        self.existence.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_batch(&self) {
        self.batches.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_execution(&self) {
        self.executions.fetch_add(1, Ordering::Relaxed);
    }

    /// Current counter values.
    pub fn snapshot(&self) -> QueryStatsSnapshot {
        QueryStatsSnapshot {
            loads: self.loads.load(Ordering::Relaxed),
            existence: self.existence.load(Ordering::Relaxed),
            batches: self.batches.load(Ordering::Relaxed),
            executions: self.executions.load(Ordering::Relaxed),
        }
    }
}

/// Read access to entities, either committed or seen through a transaction.
///
/// Implementors supply the raw `fetch`/`fetch_all` primitives; every public
/// method counts one round trip in [`QueryStats`].
pub trait EntitySource {
    /// Query counters shared by this source.
    fn stats(&self) -> &QueryStats;

    /// Load one row without counting it.
    fn fetch(&self, entity: &str, id: &EntityId) -> AuthResult<Option<EntityRow>>;

    /// Load every row of a type without counting it.
    fn fetch_all(&self, entity: &str) -> AuthResult<Vec<EntityRow>>;

    /// Load one row.
    fn get(&self, entity: &str, id: &EntityId) -> AuthResult<Option<EntityRow>> {
        self.stats().record_load();
        self.fetch(entity, id)
    }

    /// Whether the row `id` exists and satisfies `filter`.
    fn exists_matching(&self, entity: &str, id: &EntityId, filter: &FilterExpr) -> AuthResult<bool> {
        self.stats().record_existence();
        Ok(self
            .fetch(entity, id)?
            .map(|row| FilterEvaluator::evaluate(filter, &row))
            .unwrap_or(false))
    }

    /// For each existing id, whether it satisfies `filter`.
    ///
    /// Ids that do not exist are absent from the result.
    fn select_decisions(
        &self,
        entity: &str,
        ids: &[EntityId],
        filter: &FilterExpr,
    ) -> AuthResult<HashMap<EntityId, bool>> {
        self.stats().record_batch();
        let mut decisions = HashMap::with_capacity(ids.len());
        for id in ids {
            if let Some(row) = self.fetch(entity, id)? {
                decisions.insert(*id, FilterEvaluator::evaluate(filter, &row));
            }
        }
        Ok(decisions)
    }

    /// Execute a query. Queries marked `always_empty` return nothing without
    /// touching storage.
    fn execute(&self, query: &EntityQuery) -> AuthResult<Vec<EntityRow>> {
        if query.always_empty {
            return Ok(Vec::new());
        }
        self.stats().record_execution();
        let rows = self.fetch_all(&query.entity)?;
        let matching = rows.into_iter().filter(|row| match &query.filter {
            Some(filter) => FilterEvaluator::evaluate(filter, row),
            None => true,
        });
        Ok(match query.limit {
            Some(limit) => matching.take(limit).collect(),
            None => matching.collect(),
        })
    }
}
