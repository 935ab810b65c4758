//! Type conditions: named predicates per entity type.

mod expr;
mod registry;

pub use expr::ConditionExpr;
pub use registry::{
    AuditArgs, BoundPredicate, ConditionRegistry, InMemoryPredicate, QueryAuditor, TypeCondition,
};
