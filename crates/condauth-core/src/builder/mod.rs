//! Rule sets to decision trees to filters.
//!
//! Pipeline:
//!
//! ```text
//! TypeAllowedAndConditions --from_rules--> TypeConditionNode --simplify-->
//!     AccessPlan --to_filter--> FilterExpr
//!                --to_in_memory--> InMemoryPlan
//! ```
//!
//! A plan that simplifies to a constant decides without building any
//! predicate and without touching storage.

mod compile;
mod node;

pub use compile::{AccessPlan, InMemoryPlan};
pub use node::TypeConditionNode;
