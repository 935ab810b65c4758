//! Record type for stored rows.

use crate::error::{AuthError, AuthResult};
use condauth_proto::{EntityId, EntityRow, Field};
use rkyv::util::AlignedVec;
use rkyv::{Archive, Deserialize, Serialize};

/// A stored row with metadata.
#[derive(Debug, Clone, PartialEq, Archive, Serialize, Deserialize)]
pub struct Record {
    /// Field values, including `id`.
    pub fields: Vec<Field>,

    /// Creation timestamp in microseconds since Unix epoch.
    pub created_at: u64,
}

impl Record {
    /// Snapshot a row with the current timestamp.
    pub fn from_row(row: &EntityRow) -> Self {
        Self {
            fields: row.fields.clone(),
            created_at: current_timestamp(),
        }
    }

    /// Materialize the row for `id`.
    pub fn into_row(self, id: EntityId) -> EntityRow {
        EntityRow {
            id,
            fields: self.fields,
        }
    }

    /// Serialize the record to bytes using rkyv.
    pub fn to_bytes(&self) -> AuthResult<Vec<u8>> {
        rkyv::to_bytes::<rkyv::rancor::Error>(self)
            .map(|v| v.to_vec())
            .map_err(|e| AuthError::Serialization(e.to_string()))
    }

    /// Deserialize a record from bytes using rkyv.
    ///
    /// sled hands out unaligned buffers, so the bytes are copied into an
    /// aligned buffer before validation.
    pub fn from_bytes(bytes: &[u8]) -> AuthResult<Self> {
        let mut aligned = AlignedVec::<16>::with_capacity(bytes.len());
        aligned.extend_from_slice(bytes);
        rkyv::from_bytes::<Self, rkyv::rancor::Error>(&aligned)
            .map_err(|e| AuthError::Serialization(e.to_string()))
    }
}

/// Microseconds since Unix epoch; zero if the clock is before the epoch.
pub fn current_timestamp() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as u64)
        .unwrap_or(0)
}
