//! Rule evaluation traces.
//!
//! An [`ExplainResult`] records, for one entity, which condition symbols held
//! and what each rule would grant. The decision can be recomputed from the
//! trace alone, which keeps the explanation honest.

use crate::access::{AccessLevel, AllowedPair};
use crate::rules::ConditionSymbol;
use crate::value::{format_id, EntityId};
use serde::{Deserialize, Serialize};

/// Truth value of one condition symbol for the explained entity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SymbolOutcome {
    /// The condition symbol.
    pub symbol: ConditionSymbol,
    /// Whether the entity satisfies it.
    pub holds: bool,
}

/// One evaluated condition rule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExplainedRule {
    /// Per-symbol outcomes, in the rule's symbol order.
    pub symbols: Vec<SymbolOutcome>,
    /// The rule's configured allowance.
    pub allowed: AllowedPair,
}

impl ExplainedRule {
    /// Whether every symbol held.
    pub fn matched(&self) -> bool {
        self.symbols.iter().all(|s| s.holds)
    }

    /// Human-readable symbol conjunction.
    pub fn describe(&self) -> String {
        let keys: Vec<&str> = self.symbols.iter().map(|s| s.symbol.key()).collect();
        if keys.is_empty() {
            "<always>".to_string()
        } else {
            keys.join(" & ")
        }
    }
}

/// Trace of a rule evaluation for one entity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExplainResult {
    /// Entity type name.
    pub entity: String,
    /// Entity identity.
    pub id: EntityId,
    /// Level that was requested.
    pub requested: AccessLevel,
    /// Whether the UI allowance was consulted.
    pub for_ui: bool,
    /// Fallback allowance.
    pub fallback: AllowedPair,
    /// Rules in registration order (evaluated last-to-first).
    pub rules: Vec<ExplainedRule>,
}

impl ExplainResult {
    /// Index of the rule that decided, walking last-to-first.
    pub fn deciding_rule(&self) -> Option<usize> {
        self.rules.iter().rposition(|rule| rule.matched())
    }

    /// The level the trace grants.
    pub fn granted(&self) -> AccessLevel {
        match self.deciding_rule() {
            Some(index) => self.rules[index].allowed.get(self.for_ui),
            None => self.fallback.get(self.for_ui),
        }
    }

    /// Recompute the decision from the trace.
    pub fn is_allowed(&self) -> bool {
        self.granted().satisfies(self.requested)
    }

    /// Rules whose allowance would satisfy the request.
    pub fn granting_rules(&self) -> Vec<&ExplainedRule> {
        self.rules
            .iter()
            .filter(|rule| rule.allowed.allows(self.requested, self.for_ui))
            .collect()
    }

    /// Explanation of a denial, or `None` when access is allowed.
    pub fn error_message(&self) -> Option<String> {
        if self.is_allowed() {
            return None;
        }

        let context = if self.for_ui { "user interface" } else { "backend" };
        let mut message = format!(
            "{} {} is not allowed for {} ({})",
            self.entity,
            format_id(&self.id),
            self.requested,
            context
        );

        match self.deciding_rule() {
            Some(index) => {
                let rule = &self.rules[index];
                message.push_str(&format!(
                    ": it is currently in condition [{}], which grants only {}",
                    rule.describe(),
                    rule.allowed.get(self.for_ui)
                ));
            }
            None => {
                message.push_str(&format!(
                    ": it is not in any condition that would grant it, and the fallback grants only {}",
                    self.fallback.get(self.for_ui)
                ));
            }
        }

        let granting = self.granting_rules();
        if granting.is_empty() {
            message.push_str(&format!(". No condition grants {}", self.requested));
        } else {
            let names: Vec<String> = granting
                .iter()
                .map(|rule| format!("[{}]", rule.describe()))
                .collect();
            message.push_str(&format!(
                ". Conditions that would grant {}: {}",
                self.requested,
                names.join(", ")
            ));
        }

        Some(message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn outcome(key: &str, holds: bool) -> SymbolOutcome {
        SymbolOutcome {
            symbol: ConditionSymbol::new(key),
            holds,
        }
    }

    fn trace(rules: Vec<ExplainedRule>, fallback: AccessLevel) -> ExplainResult {
        ExplainResult {
            entity: "Invoice".into(),
            id: [0u8; 16],
            requested: AccessLevel::Write,
            for_ui: true,
            fallback: AllowedPair::both(fallback),
            rules,
        }
    }

    #[test]
    fn test_denied_by_current_condition() {
        let result = trace(
            vec![
                ExplainedRule {
                    symbols: vec![outcome("OwnedByMe", false)],
                    allowed: AllowedPair::both(AccessLevel::Write),
                },
                ExplainedRule {
                    symbols: vec![outcome("Locked", true)],
                    allowed: AllowedPair::both(AccessLevel::Read),
                },
            ],
            AccessLevel::Read,
        );

        assert!(!result.is_allowed());
        assert_eq!(result.deciding_rule(), Some(1));
        let message = result.error_message().unwrap();
        assert!(message.contains("currently in condition [Locked]"));
        assert!(message.contains("[OwnedByMe]"));
    }

    #[test]
    fn test_denied_not_in_any_condition() {
        let result = trace(
            vec![ExplainedRule {
                symbols: vec![outcome("OwnedByMe", false)],
                allowed: AllowedPair::both(AccessLevel::Write),
            }],
            AccessLevel::Read,
        );

        let message = result.error_message().unwrap();
        assert!(message.contains("not in any condition"));
        assert!(message.contains("Conditions that would grant Write: [OwnedByMe]"));
    }

    #[test]
    fn test_allowed_has_no_message() {
        let result = trace(
            vec![ExplainedRule {
                symbols: vec![outcome("OwnedByMe", true)],
                allowed: AllowedPair::both(AccessLevel::Write),
            }],
            AccessLevel::Read,
        );
        assert!(result.is_allowed());
        assert!(result.error_message().is_none());
    }
}
