//! Engine configuration.

use condauth_proto::AllowedPair;
use serde::{Deserialize, Serialize};

/// Default number of ids checked per batch query.
pub const DEFAULT_BATCH_SIZE: usize = 1000;

/// Authorization engine configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Ids per `select_decisions` round trip in batch write checks.
    pub batch_size: usize,
    /// Report a missing entity as denied in single-entity assertions.
    pub conceal_missing_entities: bool,
    /// Attach an explain trace to `AccessDenied` errors.
    pub explain_denials: bool,
    /// Allowance of roles without rules or parents.
    pub default_fallback: AllowedPair,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            conceal_missing_entities: true,
            explain_denials: false,
            default_fallback: AllowedPair::none(),
        }
    }
}

impl EngineConfig {
    /// Set the batch size. Zero is treated as one.
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    /// Set whether missing entities are reported as denied.
    pub fn with_conceal_missing_entities(mut self, conceal: bool) -> Self {
        self.conceal_missing_entities = conceal;
        self
    }

    /// Set whether denials carry an explain trace.
    pub fn with_explain_denials(mut self, explain: bool) -> Self {
        self.explain_denials = explain;
        self
    }

    /// Set the fallback of roles without rules or parents.
    pub fn with_default_fallback(mut self, fallback: AllowedPair) -> Self {
        self.default_fallback = fallback;
        self
    }

    /// Batch size, never zero.
    pub fn effective_batch_size(&self) -> usize {
        self.batch_size.max(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use condauth_proto::AccessLevel;

    #[test]
    fn test_defaults_fail_closed() {
        let config = EngineConfig::default();
        assert_eq!(config.batch_size, 1000);
        assert!(config.conceal_missing_entities);
        assert!(!config.explain_denials);
        assert_eq!(config.default_fallback, AllowedPair::none());
    }

    #[test]
    fn test_deserialize_partial() {
        let config: EngineConfig =
            serde_json::from_str(r#"{"batch_size": 50, "explain_denials": true}"#).unwrap();
        assert_eq!(config.batch_size, 50);
        assert!(config.explain_denials);
        assert!(config.conceal_missing_entities);
    }

    #[test]
    fn test_builder() {
        let config = EngineConfig::default()
            .with_batch_size(0)
            .with_default_fallback(AllowedPair::both(AccessLevel::Read));
        assert_eq!(config.effective_batch_size(), 1);
        assert_eq!(config.default_fallback.db, AccessLevel::Read);
    }
}
