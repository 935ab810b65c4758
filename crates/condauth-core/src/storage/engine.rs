//! Storage engine implementation.

use condauth_proto::{EntityId, EntityRow};
use parking_lot::RwLock;
use sled::{Db, Tree};
use tracing::debug;

use super::source::{EntitySource, QueryStats};
use super::transaction::{CommitTrigger, Transaction};
use super::{Record, StorageConfig};
use crate::error::AuthResult;

/// Tree name for entity rows.
const ROWS_TREE: &str = "rows";

/// The reference storage engine wrapping sled.
pub struct StorageEngine {
    /// The underlying sled database.
    db: Db,

    /// Tree for entity rows (entity_type + 0 + entity_id -> Record).
    rows: Tree,

    stats: QueryStats,

    /// Deferred side effects fired when pending writes are committed.
    triggers: RwLock<Vec<CommitTrigger>>,
}

impl StorageEngine {
    /// Open or create a storage engine with the given configuration.
    pub fn open(config: StorageConfig) -> AuthResult<Self> {
        let db = config.to_sled_config().open()?;
        Self::from_db(db)
    }

    /// Build an engine on an already opened database.
    pub fn from_db(db: Db) -> AuthResult<Self> {
        let rows = db.open_tree(ROWS_TREE)?;
        Ok(Self {
            db,
            rows,
            stats: QueryStats::default(),
            triggers: RwLock::new(Vec::new()),
        })
    }

    /// Write a row outside any transaction.
    pub fn put(&self, entity: &str, row: &EntityRow) -> AuthResult<()> {
        let record = Record::from_row(row);
        self.rows.insert(row_key(entity, &row.id), record.to_bytes()?)?;
        Ok(())
    }

    /// Remove a row outside any transaction. Returns whether it existed.
    pub fn delete(&self, entity: &str, id: &EntityId) -> AuthResult<bool> {
        Ok(self.rows.remove(row_key(entity, id))?.is_some())
    }

    /// Begin a transaction over this engine.
    pub fn begin(&self) -> Transaction<'_> {
        Transaction::new(self)
    }

    /// Register a deferred commit trigger.
    pub fn register_trigger(&self, trigger: CommitTrigger) {
        self.triggers.write().push(trigger);
        debug!(count = self.triggers.read().len(), "commit trigger registered");
    }

    pub(crate) fn triggers(&self) -> Vec<CommitTrigger> {
        self.triggers.read().iter().cloned().collect()
    }

    /// Flush all pending writes to disk.
    pub fn flush(&self) -> AuthResult<()> {
        self.db.flush()?;
        Ok(())
    }

    /// Generate a new entity ID (UUID v4 layout).
    pub fn generate_id() -> EntityId {
        use std::sync::atomic::{AtomicU64, Ordering};

        static COUNTER: AtomicU64 = AtomicU64::new(0);

        let now = super::record::current_timestamp();
        let counter = COUNTER.fetch_add(1, Ordering::SeqCst);

        let mut id = [0u8; 16];
        id[..8].copy_from_slice(&now.to_le_bytes());
        id[8..16].copy_from_slice(&counter.to_le_bytes());

        id[6] = (id[6] & 0x0f) | 0x40;
        id[8] = (id[8] & 0x3f) | 0x80;

        id
    }

    /// Get the underlying sled database (for opening rule trees).
    pub fn db(&self) -> &Db {
        &self.db
    }

    pub(crate) fn rows_tree(&self) -> &Tree {
        &self.rows
    }
}

impl EntitySource for StorageEngine {
    fn stats(&self) -> &QueryStats {
        &self.stats
    }

    fn fetch(&self, entity: &str, id: &EntityId) -> AuthResult<Option<EntityRow>> {
        match self.rows.get(row_key(entity, id))? {
            Some(bytes) => Ok(Some(Record::from_bytes(&bytes)?.into_row(*id))),
            None => Ok(None),
        }
    }

    fn fetch_all(&self, entity: &str) -> AuthResult<Vec<EntityRow>> {
        let prefix = row_prefix(entity);
        let prefix_len = prefix.len();
        let mut rows = Vec::new();

        for result in self.rows.scan_prefix(&prefix) {
            let (key, value) = result?;
            if key.len() != prefix_len + 16 {
                continue;
            }
            let mut id = [0u8; 16];
            id.copy_from_slice(&key[prefix_len..]);
            rows.push(Record::from_bytes(&value)?.into_row(id));
        }

        Ok(rows)
    }
}

impl std::fmt::Debug for StorageEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StorageEngine")
            .field("rows", &self.rows.len())
            .field("triggers", &self.triggers.read().len())
            .finish()
    }
}

pub(crate) fn row_key(entity: &str, id: &EntityId) -> Vec<u8> {
    let mut key = row_prefix(entity);
    key.extend_from_slice(id);
    key
}

fn row_prefix(entity: &str) -> Vec<u8> {
    let mut prefix = Vec::with_capacity(entity.len() + 1 + 16);
    prefix.extend_from_slice(entity.as_bytes());
    prefix.push(0);
    prefix
}
