//! Roles, rule persistence, inheritance merging, and resolution.

mod merge;
mod resolver;
mod store;

pub use merge::{prune_shadowed, MaxMerge, MergeStrategy, MinMerge};
pub use resolver::RuleResolver;
pub use store::{ChangeListener, RuleChange, RulePack, RuleStore, SledRuleStore};
