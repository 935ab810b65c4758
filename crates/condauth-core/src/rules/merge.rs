//! Exact merging of inherited rule sets.
//!
//! A rule set is a function from symbol truth assignments to an
//! [`AllowedPair`]. Merging two sets yields a set whose answer for every
//! entity is the pointwise merge of both answers. The construction is the
//! product of both rule lists, with the fallback treated as a rule with no
//! symbols at index -1:
//!
//! ```text
//! for i in -1..n, j in -1..m (lexicographic, (-1, -1) excluded):
//!     rule(S_i ∪ T_j, merge(a_i, b_j))
//! fallback = merge(a_-1, b_-1)
//! ```
//!
//! Walking the product last-to-first, the first match is the pair of the
//! deciding rules of each side, so the merged answer is exact.

use std::fmt;

use condauth_proto::{
    AccessLevel, AllowedPair, ConditionRule, ConditionSymbol, PropertyRules,
    TypeAllowedAndConditions,
};
use std::collections::BTreeSet;

/// Policy combining the grants of several parent roles.
pub trait MergeStrategy: Send + Sync + fmt::Debug {
    /// Combine two levels.
    fn merge_level(&self, a: AccessLevel, b: AccessLevel) -> AccessLevel;

    /// Combine two allowance pairs component-wise.
    fn merge_pair(&self, a: &AllowedPair, b: &AllowedPair) -> AllowedPair {
        a.combine(b, |x, y| self.merge_level(x, y))
    }

    /// Combine two rule sets exactly.
    fn merge_rules(
        &self,
        a: &TypeAllowedAndConditions,
        b: &TypeAllowedAndConditions,
    ) -> TypeAllowedAndConditions {
        let left = with_fallback(a);
        let right = with_fallback(b);

        let mut merged = TypeAllowedAndConditions::new(self.merge_pair(&a.fallback, &b.fallback));
        for (i, (left_symbols, left_allowed)) in left.iter().enumerate() {
            for (j, (right_symbols, right_allowed)) in right.iter().enumerate() {
                if i == 0 && j == 0 {
                    continue;
                }
                let symbols: BTreeSet<ConditionSymbol> =
                    left_symbols.union(right_symbols).cloned().collect();
                merged.conditions.push(ConditionRule {
                    symbols,
                    allowed: self.merge_pair(left_allowed, right_allowed),
                });
            }
        }
        prune_shadowed(merged)
    }

    /// Combine two property rule sets field by field.
    fn merge_properties(&self, a: &PropertyRules, b: &PropertyRules) -> PropertyRules {
        let mut merged = PropertyRules::new(self.merge_pair(&a.default, &b.default))
            .with_masking(a.masking.clone());
        let fields: BTreeSet<&String> = a.fields.keys().chain(b.fields.keys()).collect();
        for field in fields {
            let allowed = self.merge_pair(&a.get(field), &b.get(field));
            merged.fields.insert(field.clone(), allowed);
        }
        merged
    }
}

/// Union of grants: a child may do what any parent may do.
#[derive(Debug, Clone, Copy, Default)]
pub struct MaxMerge;

impl MergeStrategy for MaxMerge {
    fn merge_level(&self, a: AccessLevel, b: AccessLevel) -> AccessLevel {
        a.max(b)
    }
}

/// Intersection of grants: a child may do only what every parent may do.
#[derive(Debug, Clone, Copy, Default)]
pub struct MinMerge;

impl MergeStrategy for MinMerge {
    fn merge_level(&self, a: AccessLevel, b: AccessLevel) -> AccessLevel {
        a.min(b)
    }
}

/// Index -1 (the fallback) first, then the rules in order.
fn with_fallback(rules: &TypeAllowedAndConditions) -> Vec<(BTreeSet<ConditionSymbol>, AllowedPair)> {
    std::iter::once((BTreeSet::new(), rules.fallback))
        .chain(
            rules
                .conditions
                .iter()
                .map(|rule| (rule.symbols.clone(), rule.allowed)),
        )
        .collect()
}

/// Drop rules that can never decide.
///
/// Rule `k` is unreachable when some later rule needs a subset of its
/// symbols: whenever `k` matches, the later rule matches too and wins. A
/// surviving rule with no symbols always matches and becomes the fallback.
pub fn prune_shadowed(rules: TypeAllowedAndConditions) -> TypeAllowedAndConditions {
    let TypeAllowedAndConditions {
        mut fallback,
        conditions,
    } = rules;

    let mut kept: Vec<ConditionRule> = Vec::with_capacity(conditions.len());
    for (k, rule) in conditions.iter().enumerate() {
        let shadowed = conditions[k + 1..]
            .iter()
            .any(|later| later.symbols.is_subset(&rule.symbols));
        if !shadowed {
            kept.push(rule.clone());
        }
    }

    if let Some(first) = kept.first() {
        if first.symbols.is_empty() {
            fallback = first.allowed;
            kept.remove(0);
        }
    }

    TypeAllowedAndConditions {
        fallback,
        conditions: kept,
    }
}
