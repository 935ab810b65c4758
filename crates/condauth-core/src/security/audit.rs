//! Audit logging for authorization events.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use condauth_proto::{format_id, AccessLevel, EntityId, EntityRef};
use parking_lot::Mutex;

use super::context::AuthContext;
use crate::storage::current_timestamp;

static EVENT_COUNTER: AtomicU64 = AtomicU64::new(0);

fn generate_event_id() -> [u8; 16] {
    let ts = current_timestamp();
    let counter = EVENT_COUNTER.fetch_add(1, Ordering::Relaxed);
    let mut id = [0u8; 16];
    id[0..8].copy_from_slice(&ts.to_be_bytes());
    id[8..16].copy_from_slice(&counter.to_be_bytes());
    id
}

/// Types of audit events.
#[derive(Debug, Clone, PartialEq)]
pub enum AuditEventType {
    /// An assertion failed.
    AccessDenied {
        /// Entity type.
        entity: String,
        /// Requested level.
        level: AccessLevel,
        /// Denied ids.
        ids: Vec<EntityId>,
    },
    /// An authorization predicate was injected into a query.
    FilterInjected {
        /// Entity type queried.
        entity: String,
        /// Rendered predicate.
        filter: String,
    },
    /// A write was removed from pending checks.
    WriteCheckSkipped {
        /// Entity that will not be checked.
        target: EntityRef,
        /// Stated reason.
        reason: String,
    },
    /// A check was skipped because authorization was disabled in scope.
    AuthorizationBypassed {
        /// Operation that ran unchecked.
        operation: String,
        /// Entity type involved.
        entity: String,
    },
    /// The resolved rule cache was cleared.
    RulesInvalidated {
        /// Cache generation after invalidation.
        generation: u64,
    },
}

/// An audit event with metadata.
#[derive(Debug, Clone, PartialEq)]
pub struct AuditEvent {
    /// Unique event ID.
    pub id: [u8; 16],
    /// Timestamp when event occurred.
    pub timestamp: u64,
    /// Principal that triggered the event (empty for system events).
    pub principal: String,
    /// Role of the principal.
    pub role: String,
    /// Event details.
    pub event_type: AuditEventType,
}

impl AuditEvent {
    /// Create an event for a request.
    pub fn new(ctx: &AuthContext, event_type: AuditEventType) -> Self {
        Self {
            id: generate_event_id(),
            timestamp: current_timestamp(),
            principal: ctx.principal().id.clone(),
            role: ctx.principal().role.clone(),
            event_type,
        }
    }

    /// Create an event not tied to a request.
    pub fn system(event_type: AuditEventType) -> Self {
        Self {
            id: generate_event_id(),
            timestamp: current_timestamp(),
            principal: String::new(),
            role: String::new(),
            event_type,
        }
    }

    /// Access denied event.
    pub fn access_denied(
        ctx: &AuthContext,
        entity: impl Into<String>,
        level: AccessLevel,
        ids: Vec<EntityId>,
    ) -> Self {
        Self::new(
            ctx,
            AuditEventType::AccessDenied {
                entity: entity.into(),
                level,
                ids,
            },
        )
    }

    /// Filter injected event.
    pub fn filter_injected(
        ctx: &AuthContext,
        entity: impl Into<String>,
        filter: impl Into<String>,
    ) -> Self {
        Self::new(
            ctx,
            AuditEventType::FilterInjected {
                entity: entity.into(),
                filter: filter.into(),
            },
        )
    }

    /// Write check skipped event.
    pub fn write_check_skipped(ctx: &AuthContext, target: EntityRef, reason: impl Into<String>) -> Self {
        Self::new(
            ctx,
            AuditEventType::WriteCheckSkipped {
                target,
                reason: reason.into(),
            },
        )
    }

    /// Authorization bypassed event.
    pub fn authorization_bypassed(
        ctx: &AuthContext,
        operation: impl Into<String>,
        entity: impl Into<String>,
    ) -> Self {
        Self::new(
            ctx,
            AuditEventType::AuthorizationBypassed {
                operation: operation.into(),
                entity: entity.into(),
            },
        )
    }

    /// Format the event as a log line.
    pub fn to_log_line(&self) -> String {
        let event_desc = match &self.event_type {
            AuditEventType::AccessDenied { entity, level, ids } => format!(
                "ACCESS_DENIED entity={} level={} ids=[{}]",
                entity,
                level,
                ids.iter().map(format_id).collect::<Vec<_>>().join(",")
            ),
            AuditEventType::FilterInjected { entity, filter } => {
                format!("FILTER_INJECTED entity={} filter={}", entity, filter)
            }
            AuditEventType::WriteCheckSkipped { target, reason } => {
                format!("WRITE_CHECK_SKIPPED target={} reason={}", target, reason)
            }
            AuditEventType::AuthorizationBypassed { operation, entity } => {
                format!("AUTHORIZATION_BYPASSED op={} entity={}", operation, entity)
            }
            AuditEventType::RulesInvalidated { generation } => {
                format!("RULES_INVALIDATED generation={}", generation)
            }
        };

        format!(
            "{} id={} principal={} role={} {}",
            self.timestamp,
            hex::encode(self.id),
            self.principal,
            self.role,
            event_desc
        )
    }
}

/// Trait for audit log backends.
pub trait AuditLogger: Send + Sync {
    /// Log an audit event.
    fn log(&self, event: AuditEvent);
}

/// In-memory audit logger for testing.
#[derive(Debug, Default, Clone)]
pub struct MemoryAuditLogger {
    events: Arc<Mutex<Vec<AuditEvent>>>,
}

impl MemoryAuditLogger {
    /// Create a new memory logger.
    pub fn new() -> Self {
        Self::default()
    }

    /// Get all logged events.
    pub fn events(&self) -> Vec<AuditEvent> {
        self.events.lock().clone()
    }

    /// Clear all events.
    pub fn clear(&self) {
        self.events.lock().clear();
    }

    /// Get event count.
    pub fn len(&self) -> usize {
        self.events.lock().len()
    }

    /// Check if empty.
    pub fn is_empty(&self) -> bool {
        self.events.lock().is_empty()
    }
}

impl AuditLogger for MemoryAuditLogger {
    fn log(&self, event: AuditEvent) {
        self.events.lock().push(event);
    }
}

/// No-op audit logger that discards all events.
#[derive(Debug, Default)]
pub struct NullAuditLogger;

impl AuditLogger for NullAuditLogger {
    fn log(&self, _event: AuditEvent) {}
}

/// Audit logger that emits events through `tracing` at info level.
#[derive(Debug, Default)]
pub struct TracingAuditLogger;

impl AuditLogger for TracingAuditLogger {
    fn log(&self, event: AuditEvent) {
        tracing::info!(target: "condauth::audit", "{}", event.to_log_line());
    }
}
