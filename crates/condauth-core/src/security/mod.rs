//! Request context, scoped bypasses, audit logging, and property guards.
//!
//! Every authorization call takes an [`AuthContext`]: the principal plus the
//! per-request scope state. Bypasses are RAII guards on that context:
//!
//! ```ignore
//! use condauth_core::security::{AuthContext, Principal};
//!
//! let ctx = AuthContext::new(Principal::new("alice", "Sales"));
//! {
//!     let _unfiltered = ctx.disable_query_filter();
//!     // queries here see every row
//! }
//! // filtering is back on
//! ```

pub mod audit;
pub mod context;
pub mod property;
pub mod scope;

pub use audit::{
    AuditEvent, AuditEventType, AuditLogger, MemoryAuditLogger, NullAuditLogger,
    TracingAuditLogger,
};
pub use context::{AuthContext, Principal};
pub use property::PropertyGuard;
pub use scope::{ConditionOverride, FlagGuard, ScopeState, WritingGuard};
