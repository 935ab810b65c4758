//! Transactions with nested levels, pre-commit hooks, and deferred triggers.
//!
//! Writes are staged in an overlay stack: the outer transaction owns the
//! base level and every [`SubTransaction`] pushes one more. Reads see the
//! topmost staged state first, then committed storage. Nothing reaches sled
//! until the outer [`Transaction::commit`], which applies the base level as a
//! single atomic batch.
//!
//! Commit order:
//! 1. enlisted pre-commit hooks run (once each, in enlistment order);
//! 2. deferred commit triggers fire for keys they have not seen yet;
//! 3. the staged writes are applied atomically.
//!
//! Committing a sub-transaction folds its level into the parent and fires
//! the deferred triggers, so hooks can settle side effects before checking.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::ops::{Deref, DerefMut};
use std::sync::Arc;

use condauth_proto::{EntityId, EntityRef, EntityRow};
use tracing::{debug, warn};

use super::engine::row_key;
use super::source::{EntitySource, QueryStats};
use super::{Record, StorageEngine};
use crate::error::{AuthError, AuthResult};

/// Side effect run against the transaction for keys written since the last
/// firing. Writes made by a trigger do not re-fire triggers.
pub type CommitTrigger =
    Arc<dyn Fn(&mut Transaction<'_>, &[EntityRef]) -> AuthResult<()> + Send + Sync>;

/// Hook run immediately before the real commit. An error aborts the commit.
pub type PreCommitHook<'a> = Box<dyn FnOnce(&mut Transaction<'a>) -> AuthResult<()> + 'a>;

/// Entities written by a transaction, bucketed for authorization checks.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WriteTracker {
    created: BTreeSet<EntityRef>,
    modified: BTreeSet<EntityRef>,
    deleted: BTreeSet<EntityRef>,
    excluded: BTreeSet<EntityRef>,
}

impl WriteTracker {
    fn record_created(&mut self, key: EntityRef) {
        if self.deleted.remove(&key) {
            // Deleted then re-inserted: the committed row is being replaced.
            self.modified.insert(key);
        } else {
            self.created.insert(key);
        }
    }

    fn record_modified(&mut self, key: EntityRef) {
        self.modified.insert(key);
    }

    fn record_deleted(&mut self, key: EntityRef) {
        self.modified.remove(&key);
        if !self.created.remove(&key) {
            self.deleted.insert(key);
        }
    }

    fn exclude(&mut self, key: EntityRef) {
        self.excluded.insert(key);
    }

    fn pending<'t>(
        &'t self,
        bucket: &'t BTreeSet<EntityRef>,
    ) -> impl Iterator<Item = &'t EntityRef> + 't {
        bucket.iter().filter(move |key| !self.excluded.contains(*key))
    }

    /// Entities created in this transaction, excluding modified ones.
    pub fn created(&self) -> Vec<EntityRef> {
        self.pending(&self.created)
            .filter(|key| !self.modified.contains(*key))
            .cloned()
            .collect()
    }

    /// Entities whose content changed.
    pub fn modified(&self) -> Vec<EntityRef> {
        self.pending(&self.modified).cloned().collect()
    }

    /// Modified entities that were committed before the transaction began.
    pub fn modified_committed(&self) -> Vec<EntityRef> {
        self.pending(&self.modified)
            .filter(|key| !self.created.contains(*key))
            .cloned()
            .collect()
    }

    /// Committed entities deleted by this transaction.
    pub fn deleted(&self) -> Vec<EntityRef> {
        self.pending(&self.deleted).cloned().collect()
    }

    /// Whether the entity was explicitly removed from pending checks.
    pub fn is_excluded(&self, key: &EntityRef) -> bool {
        self.excluded.contains(key)
    }

    /// Whether nothing is pending in any bucket.
    pub fn is_empty(&self) -> bool {
        self.created().is_empty() && self.modified().is_empty() && self.deleted().is_empty()
    }
}

/// Group entity references by type, keeping id order.
pub fn group_by_type(keys: &[EntityRef]) -> BTreeMap<String, Vec<EntityId>> {
    let mut groups: BTreeMap<String, Vec<EntityId>> = BTreeMap::new();
    for key in keys {
        groups.entry(key.entity.clone()).or_default().push(key.id);
    }
    groups
}

type Level = HashMap<EntityRef, Option<EntityRow>>;

struct Savepoint {
    tracker: WriteTracker,
    untriggered: BTreeSet<EntityRef>,
    skipped: usize,
}

/// A transaction over the reference storage engine.
pub struct Transaction<'a> {
    engine: &'a StorageEngine,
    levels: Vec<Level>,
    savepoints: Vec<Savepoint>,
    tracker: WriteTracker,
    /// Keys written since triggers last fired.
    untriggered: BTreeSet<EntityRef>,
    firing: bool,
    skipped: Vec<(EntityRef, String)>,
    hooks: Vec<(String, PreCommitHook<'a>)>,
    hook_keys: HashSet<String>,
}

impl<'a> Transaction<'a> {
    pub(crate) fn new(engine: &'a StorageEngine) -> Self {
        Self {
            engine,
            levels: vec![Level::new()],
            savepoints: Vec::new(),
            tracker: WriteTracker::default(),
            untriggered: BTreeSet::new(),
            firing: false,
            skipped: Vec::new(),
            hooks: Vec::new(),
            hook_keys: HashSet::new(),
        }
    }

    /// The committed storage underneath this transaction.
    pub fn engine(&self) -> &'a StorageEngine {
        self.engine
    }

    /// Write buckets recorded so far.
    pub fn tracker(&self) -> &WriteTracker {
        &self.tracker
    }

    /// Number of open levels (1 for a plain transaction).
    pub fn depth(&self) -> usize {
        self.levels.len()
    }

    /// Insert a new row.
    pub fn insert(&mut self, entity: &str, row: EntityRow) -> AuthResult<()> {
        let key = EntityRef::new(entity, row.id);
        if self.fetch(entity, &row.id)?.is_some() {
            return Err(AuthError::Transaction(format!("{} already exists", key)));
        }
        self.tracker.record_created(key.clone());
        self.stage(key, Some(row));
        Ok(())
    }

    /// Replace an existing row. Identical content is not tracked as a change.
    pub fn update(&mut self, entity: &str, row: EntityRow) -> AuthResult<()> {
        let key = EntityRef::new(entity, row.id);
        let previous = self
            .fetch(entity, &row.id)?
            .ok_or_else(|| AuthError::EntityNotFound {
                entity: entity.to_string(),
                ids: vec![row.id],
            })?;
        if previous.same_content(&row) {
            return Ok(());
        }
        self.tracker.record_modified(key.clone());
        self.stage(key, Some(row));
        Ok(())
    }

    /// Insert or update depending on whether the row exists.
    pub fn save(&mut self, entity: &str, row: EntityRow) -> AuthResult<()> {
        if self.fetch(entity, &row.id)?.is_some() {
            self.update(entity, row)
        } else {
            self.insert(entity, row)
        }
    }

    /// Delete a row. Returns whether it existed.
    pub fn delete(&mut self, entity: &str, id: EntityId) -> AuthResult<bool> {
        if self.fetch(entity, &id)?.is_none() {
            return Ok(false);
        }
        let key = EntityRef::new(entity, id);
        self.tracker.record_deleted(key.clone());
        self.stage(key, None);
        Ok(true)
    }

    /// Remove an entity from pending write checks.
    pub fn skip_write_check(&mut self, entity: &str, id: EntityId, reason: impl Into<String>) {
        let key = EntityRef::new(entity, id);
        let reason = reason.into();
        warn!(entity = %key, reason = %reason, "write check skipped");
        self.tracker.exclude(key.clone());
        self.skipped.push((key, reason));
    }

    /// Entities removed from pending checks, with the stated reasons.
    pub fn skipped(&self) -> &[(EntityRef, String)] {
        &self.skipped
    }

    /// Register a pre-commit hook once per key. Returns false if a hook with
    /// the same key is already enlisted.
    pub fn enlist(&mut self, key: impl Into<String>, hook: PreCommitHook<'a>) -> bool {
        let key = key.into();
        if !self.hook_keys.insert(key.clone()) {
            return false;
        }
        debug!(hook = %key, "pre-commit hook enlisted");
        self.hooks.push((key, hook));
        true
    }

    /// Whether a hook with this key is enlisted.
    pub fn is_enlisted(&self, key: &str) -> bool {
        self.hook_keys.contains(key)
    }

    /// Open a nested level. Dropping it without commit discards its writes.
    pub fn nested(&mut self) -> SubTransaction<'_, 'a> {
        self.savepoints.push(Savepoint {
            tracker: self.tracker.clone(),
            untriggered: self.untriggered.clone(),
            skipped: self.skipped.len(),
        });
        self.levels.push(Level::new());
        SubTransaction {
            tx: self,
            committed: false,
        }
    }

    /// Run hooks, settle triggers, and apply every staged write atomically.
    pub fn commit(mut self) -> AuthResult<()> {
        let hooks = std::mem::take(&mut self.hooks);
        for (key, hook) in hooks {
            debug!(hook = %key, "running pre-commit hook");
            hook(&mut self)?;
        }
        self.fire_triggers()?;
        self.apply()
    }

    fn stage(&mut self, key: EntityRef, row: Option<EntityRow>) {
        if !self.firing {
            self.untriggered.insert(key.clone());
        }
        if let Some(level) = self.levels.last_mut() {
            level.insert(key, row);
        }
    }

    fn fire_triggers(&mut self) -> AuthResult<()> {
        if self.untriggered.is_empty() {
            return Ok(());
        }
        let keys: Vec<EntityRef> = std::mem::take(&mut self.untriggered).into_iter().collect();
        let triggers = self.engine.triggers();
        if triggers.is_empty() {
            return Ok(());
        }

        debug!(keys = keys.len(), triggers = triggers.len(), "firing commit triggers");
        self.firing = true;
        let mut result = Ok(());
        for trigger in &triggers {
            result = trigger(self, &keys);
            if result.is_err() {
                break;
            }
        }
        self.firing = false;
        result
    }

    fn merge_top(&mut self) {
        if self.levels.len() < 2 {
            return;
        }
        self.savepoints.pop();
        if let Some(top) = self.levels.pop() {
            if let Some(parent) = self.levels.last_mut() {
                parent.extend(top);
            }
        }
    }

    fn rollback_top(&mut self) {
        if self.levels.len() < 2 {
            return;
        }
        self.levels.pop();
        if let Some(savepoint) = self.savepoints.pop() {
            self.tracker = savepoint.tracker;
            self.untriggered = savepoint.untriggered;
            self.skipped.truncate(savepoint.skipped);
        }
    }

    fn apply(mut self) -> AuthResult<()> {
        let level = self.levels.pop().unwrap_or_default();
        if level.is_empty() {
            return Ok(());
        }

        let mut batch = sled::Batch::default();
        let mut writes = 0usize;
        for (key, entry) in level {
            let bytes_key = row_key(&key.entity, &key.id);
            match entry {
                Some(row) => batch.insert(bytes_key, Record::from_row(&row).to_bytes()?),
                None => batch.remove(bytes_key),
            }
            writes += 1;
        }
        self.engine.rows_tree().apply_batch(batch)?;
        debug!(writes, "transaction committed");
        Ok(())
    }
}

impl EntitySource for Transaction<'_> {
    fn stats(&self) -> &QueryStats {
        self.engine.stats()
    }

    fn fetch(&self, entity: &str, id: &EntityId) -> AuthResult<Option<EntityRow>> {
        let key = EntityRef::new(entity, *id);
        for level in self.levels.iter().rev() {
            if let Some(entry) = level.get(&key) {
                return Ok(entry.clone());
            }
        }
        self.engine.fetch(entity, id)
    }

    fn fetch_all(&self, entity: &str) -> AuthResult<Vec<EntityRow>> {
        let mut rows: BTreeMap<EntityId, EntityRow> = self
            .engine
            .fetch_all(entity)?
            .into_iter()
            .map(|row| (row.id, row))
            .collect();

        for level in &self.levels {
            for (key, entry) in level.iter().filter(|(key, _)| key.entity == entity) {
                match entry {
                    Some(row) => {
                        rows.insert(key.id, row.clone());
                    }
                    None => {
                        rows.remove(&key.id);
                    }
                }
            }
        }

        Ok(rows.into_values().collect())
    }
}

/// A nested level of a [`Transaction`].
///
/// Dereferences to the underlying transaction, so reads and writes go
/// through the same API; writes land in this level until [`commit`].
///
/// [`commit`]: SubTransaction::commit
pub struct SubTransaction<'t, 'a> {
    tx: &'t mut Transaction<'a>,
    committed: bool,
}

impl SubTransaction<'_, '_> {
    /// Fold this level into the parent and fire deferred triggers.
    pub fn commit(mut self) -> AuthResult<()> {
        self.committed = true;
        self.tx.merge_top();
        self.tx.fire_triggers()
    }
}

impl<'a> Deref for SubTransaction<'_, 'a> {
    type Target = Transaction<'a>;

    fn deref(&self) -> &Self::Target {
        self.tx
    }
}

impl DerefMut for SubTransaction<'_, '_> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.tx
    }
}

impl Drop for SubTransaction<'_, '_> {
    fn drop(&mut self) {
        if !self.committed {
            debug!(depth = self.tx.depth(), "nested transaction rolled back");
            self.tx.rollback_top();
        }
    }
}
