//! Decision trees built from resolved rules.

use std::collections::BTreeSet;
use std::fmt;

use condauth_proto::{AccessLevel, ConditionSymbol, TypeAllowedAndConditions};

/// Decision tree over condition symbols.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TypeConditionNode {
    /// Fixed outcome.
    Constant(bool),
    /// Holds when every symbol holds. Empty means always.
    Conjunction(Vec<ConditionSymbol>),
    /// `if cond { then } else { else_ }`.
    Branch {
        /// Tested condition.
        cond: Box<TypeConditionNode>,
        /// Outcome when `cond` holds.
        then: Box<TypeConditionNode>,
        /// Outcome otherwise.
        else_: Box<TypeConditionNode>,
    },
}

impl TypeConditionNode {
    /// Build the tree deciding whether `level` is granted.
    ///
    /// Rules are evaluated last-to-first, so the last rule is the outermost
    /// branch and the fallback is the innermost leaf.
    pub fn from_rules(rules: &TypeAllowedAndConditions, level: AccessLevel, for_ui: bool) -> Self {
        let leaf = TypeConditionNode::Constant(rules.fallback.allows(level, for_ui));
        rules
            .conditions
            .iter()
            .fold(leaf, |else_, rule| TypeConditionNode::Branch {
                cond: Box::new(TypeConditionNode::Conjunction(
                    rule.symbols.iter().cloned().collect(),
                )),
                then: Box::new(TypeConditionNode::Constant(rule.allowed.allows(level, for_ui))),
                else_: Box::new(else_),
            })
    }

    /// Bottom-up simplification preserving the decision.
    pub fn simplify(self) -> Self {
        match self {
            TypeConditionNode::Conjunction(symbols) if symbols.is_empty() => {
                TypeConditionNode::Constant(true)
            }
            TypeConditionNode::Branch { cond, then, else_ } => {
                let cond = cond.simplify();
                let then = then.simplify();
                let else_ = else_.simplify();
                match (cond, then, else_) {
                    (TypeConditionNode::Constant(true), then, _) => then,
                    (TypeConditionNode::Constant(false), _, else_) => else_,
                    (_, then, else_) if then == else_ => then,
                    (
                        cond,
                        TypeConditionNode::Constant(true),
                        TypeConditionNode::Constant(false),
                    ) => cond,
                    (cond, then, else_) => TypeConditionNode::Branch {
                        cond: Box::new(cond),
                        then: Box::new(then),
                        else_: Box::new(else_),
                    },
                }
            }
            other => other,
        }
    }

    /// The outcome when the tree does not depend on any symbol.
    pub fn constant(&self) -> Option<bool> {
        match self {
            TypeConditionNode::Constant(value) => Some(*value),
            _ => None,
        }
    }

    /// Every symbol the tree tests.
    pub fn symbols(&self) -> BTreeSet<ConditionSymbol> {
        let mut out = BTreeSet::new();
        self.collect_symbols(&mut out);
        out
    }

    fn collect_symbols(&self, out: &mut BTreeSet<ConditionSymbol>) {
        match self {
            TypeConditionNode::Constant(_) => {}
            TypeConditionNode::Conjunction(symbols) => out.extend(symbols.iter().cloned()),
            TypeConditionNode::Branch { cond, then, else_ } => {
                cond.collect_symbols(out);
                then.collect_symbols(out);
                else_.collect_symbols(out);
            }
        }
    }

    /// Evaluate against a symbol truth assignment.
    pub fn evaluate(&self, holds: &impl Fn(&ConditionSymbol) -> bool) -> bool {
        match self {
            TypeConditionNode::Constant(value) => *value,
            TypeConditionNode::Conjunction(symbols) => symbols.iter().all(holds),
            TypeConditionNode::Branch { cond, then, else_ } => {
                if cond.evaluate(holds) {
                    then.evaluate(holds)
                } else {
                    else_.evaluate(holds)
                }
            }
        }
    }
}

impl fmt::Display for TypeConditionNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TypeConditionNode::Constant(value) => write!(f, "{}", value),
            TypeConditionNode::Conjunction(symbols) => {
                let keys: Vec<&str> = symbols.iter().map(|s| s.key()).collect();
                write!(f, "[{}]", keys.join(" & "))
            }
            TypeConditionNode::Branch { cond, then, else_ } => {
                write!(f, "if {} then {} else {}", cond, then, else_)
            }
        }
    }
}
