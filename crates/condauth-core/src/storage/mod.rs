//! Reference storage layer.
//!
//! A sled-backed row store with nested transactions, implementing the
//! [`EntitySource`] seam the authorization engine queries through.

mod config;
mod engine;
mod record;
mod source;
mod transaction;

pub use config::StorageConfig;
pub use engine::StorageEngine;
pub use record::{current_timestamp, Record};
pub use source::{EntitySource, QueryStats, QueryStatsSnapshot};
pub use transaction::{
    group_by_type, CommitTrigger, PreCommitHook, SubTransaction, Transaction, WriteTracker,
};
