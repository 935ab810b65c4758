//! Rule model: condition symbols, conditional rules, roles, property rules.

use crate::access::{AccessLevel, AllowedPair};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

/// Stable key identifying a named predicate attached to an entity type.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConditionSymbol(String);

impl ConditionSymbol {
    /// Create a symbol from its key.
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    /// The symbol's key.
    pub fn key(&self) -> &str {
        &self.0
    }

    /// Whether the key is empty (a malformed symbol).
    pub fn is_empty(&self) -> bool {
        self.0.trim().is_empty()
    }
}

impl fmt::Display for ConditionSymbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ConditionSymbol {
    fn from(key: &str) -> Self {
        Self::new(key)
    }
}

impl From<String> for ConditionSymbol {
    fn from(key: String) -> Self {
        Self(key)
    }
}

/// A conjunction of condition symbols mapped to an allowance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConditionRule {
    /// Symbols that must all hold for the rule to match.
    pub symbols: BTreeSet<ConditionSymbol>,
    /// Allowance applied when the rule matches.
    pub allowed: AllowedPair,
}

impl ConditionRule {
    /// Create a rule.
    pub fn new<S>(symbols: impl IntoIterator<Item = S>, allowed: AllowedPair) -> Self
    where
        S: Into<ConditionSymbol>,
    {
        Self {
            symbols: symbols.into_iter().map(Into::into).collect(),
            allowed,
        }
    }

    /// Whether every symbol of the rule holds.
    pub fn matches(&self, holds: impl Fn(&ConditionSymbol) -> bool) -> bool {
        self.symbols.iter().all(holds)
    }

    /// Human-readable form of the symbol conjunction.
    pub fn describe_symbols(&self) -> String {
        let keys: Vec<&str> = self.symbols.iter().map(|s| s.key()).collect();
        keys.join(" & ")
    }
}

/// Resolved rule for a (role, entity type): fallback plus ordered overrides.
///
/// Rules are evaluated last-to-first; the first matching rule wins, the
/// fallback applies when none match.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TypeAllowedAndConditions {
    /// Allowance when no condition rule matches.
    pub fallback: AllowedPair,
    /// Conditional overrides in registration order.
    #[serde(default)]
    pub conditions: Vec<ConditionRule>,
}

impl TypeAllowedAndConditions {
    /// Create a rule set with no conditional overrides.
    pub fn new(fallback: AllowedPair) -> Self {
        Self {
            fallback,
            conditions: Vec::new(),
        }
    }

    /// Append a conditional override (it takes precedence over earlier ones).
    pub fn with_rule(mut self, rule: ConditionRule) -> Self {
        self.conditions.push(rule);
        self
    }

    /// Whether there are no conditional overrides.
    pub fn is_unconditional(&self) -> bool {
        self.conditions.is_empty()
    }

    /// Every symbol referenced by any rule.
    pub fn symbols(&self) -> BTreeSet<ConditionSymbol> {
        self.conditions
            .iter()
            .flat_map(|rule| rule.symbols.iter().cloned())
            .collect()
    }

    /// Lowest level any outcome can produce.
    pub fn min(&self, for_ui: bool) -> AccessLevel {
        self.conditions
            .iter()
            .map(|r| r.allowed.get(for_ui))
            .fold(self.fallback.get(for_ui), std::cmp::min)
    }

    /// Highest level any outcome can produce.
    pub fn max(&self, for_ui: bool) -> AccessLevel {
        self.conditions
            .iter()
            .map(|r| r.allowed.get(for_ui))
            .fold(self.fallback.get(for_ui), std::cmp::max)
    }

    /// The rule that decides for the given symbol truth assignment, if any.
    pub fn matching_rule(&self, holds: impl Fn(&ConditionSymbol) -> bool) -> Option<&ConditionRule> {
        self.conditions.iter().rev().find(|rule| rule.matches(&holds))
    }

    /// Reference decision: search last-to-first, fall back when nothing matches.
    pub fn decide(&self, for_ui: bool, holds: impl Fn(&ConditionSymbol) -> bool) -> AccessLevel {
        match self.matching_rule(holds) {
            Some(rule) => rule.allowed.get(for_ui),
            None => self.fallback.get(for_ui),
        }
    }
}

/// Role definition with inheritance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoleDef {
    /// Role name.
    pub name: String,
    /// Parent roles whose rules are merged when the role has none of its own.
    #[serde(default)]
    pub parents: Vec<String>,
}

impl RoleDef {
    /// Create a role without parents.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            parents: Vec::new(),
        }
    }

    /// Add a parent role.
    pub fn inherits(mut self, parent: impl Into<String>) -> Self {
        self.parents.push(parent.into());
        self
    }
}

/// How a hidden property is presented.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum MaskingStrategy {
    /// Remove the field from the row.
    Omit,
    /// Replace the value with null.
    #[default]
    Null,
    /// Replace the value with a fixed placeholder string.
    Redacted(String),
}

/// Property-level allowances for a (role, entity type).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PropertyRules {
    /// Allowance for properties without an explicit entry.
    pub default: AllowedPair,
    /// Per-property allowances.
    #[serde(default)]
    pub fields: BTreeMap<String, AllowedPair>,
    /// Presentation of properties below `Read`.
    #[serde(default)]
    pub masking: MaskingStrategy,
}

impl PropertyRules {
    /// Rules granting `default` to every property.
    pub fn new(default: AllowedPair) -> Self {
        Self {
            default,
            fields: BTreeMap::new(),
            masking: MaskingStrategy::default(),
        }
    }

    /// Set the allowance for one property.
    pub fn with_field(mut self, field: impl Into<String>, allowed: AllowedPair) -> Self {
        self.fields.insert(field.into(), allowed);
        self
    }

    /// Set the masking strategy.
    pub fn with_masking(mut self, masking: MaskingStrategy) -> Self {
        self.masking = masking;
        self
    }

    /// Allowance for a property.
    pub fn get(&self, field: &str) -> AllowedPair {
        self.fields.get(field).copied().unwrap_or(self.default)
    }
}
