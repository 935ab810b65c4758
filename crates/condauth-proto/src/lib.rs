//! condauth protocol types.
//!
//! This crate defines the data model shared by the authorization engine and
//! anything that stores, edits, or displays its rules.
//!
//! # Modules
//!
//! - [`value`] - Runtime values, entity rows, and entity identifiers
//! - [`query`] - Nested filter expressions and entity queries
//! - [`access`] - Access levels and UI/DB allowance pairs
//! - [`rules`] - Condition symbols, condition rules, roles, property rules
//! - [`explain`] - Rule evaluation traces
//! - [`error`] - Protocol error types
//!
//! # Serialization
//!
//! Every type derives serde `Serialize`/`Deserialize` so administration
//! surfaces can ship rule packs and explain traces as JSON. Values and rows
//! additionally derive `rkyv` traits for compact storage:
//!
//! ```ignore
//! use condauth_proto::{EntityRow, Value};
//!
//! let row = EntityRow::new([1u8; 16]).with_field("amount", Value::Int64(500));
//! let bytes = rkyv::to_bytes::<rkyv::rancor::Error>(&row).unwrap();
//! ```

pub mod access;
pub mod error;
pub mod explain;
pub mod query;
pub mod rules;
pub mod value;

pub use error::Error;

pub use access::{AccessLevel, AllowedPair};
pub use explain::{ExplainResult, ExplainedRule, SymbolOutcome};
pub use query::{EntityQuery, FilterExpr};
pub use rules::{
    ConditionRule, ConditionSymbol, MaskingStrategy, PropertyRules, RoleDef,
    TypeAllowedAndConditions,
};
pub use value::{format_id, EntityId, EntityRef, EntityRow, Field, Value};

/// Rule pack format version.
///
/// Stored alongside persisted rule packs; bumped when the serialized layout
/// changes incompatibly.
pub const RULE_FORMAT_VERSION: u32 = 1;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rule_format_version() {
        assert_eq!(RULE_FORMAT_VERSION, 1);
    }

    #[test]
    fn test_row_rkyv_roundtrip() {
        let row = EntityRow::new([7u8; 16])
            .with_field("owner", Value::String("alice".into()))
            .with_field("amount", Value::Int64(500));

        let bytes = rkyv::to_bytes::<rkyv::rancor::Error>(&row).unwrap();
        let decoded: EntityRow =
            rkyv::from_bytes::<EntityRow, rkyv::rancor::Error>(&bytes).unwrap();
        assert_eq!(row, decoded);
    }

    #[test]
    fn test_rules_json_roundtrip() {
        let rules = TypeAllowedAndConditions::new(AllowedPair::both(AccessLevel::Read))
            .with_rule(ConditionRule::new(
                ["OwnedByMe"],
                AllowedPair::both(AccessLevel::Write),
            ));

        let json = serde_json::to_string(&rules).unwrap();
        let decoded: TypeAllowedAndConditions = serde_json::from_str(&json).unwrap();
        assert_eq!(rules, decoded);
    }
}
