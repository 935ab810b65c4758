//! Rule persistence.
//!
//! [`SledRuleStore`] keeps roles, type rules, and property rules as JSON in
//! one sled tree and notifies subscribers after every mutation.

use std::fmt;
use std::sync::Arc;

use condauth_proto::{
    Error as ProtoError, PropertyRules, RoleDef, TypeAllowedAndConditions, RULE_FORMAT_VERSION,
};
use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::AuthResult;

const RULE_TREE_NAME: &[u8] = b"condauth:rules";
const ROLE_PREFIX: &[u8] = b"role:";
const TYPE_PREFIX: &[u8] = b"type:";
const PROPERTY_PREFIX: &[u8] = b"prop:";

/// A mutation of the rule store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RuleChange {
    /// A role definition was written or removed.
    Role(String),
    /// Type rules for (role, entity) were written or removed.
    TypeRules {
        /// Role name.
        role: String,
        /// Entity type.
        entity: String,
    },
    /// Property rules for (role, entity) were written or removed.
    PropertyRules {
        /// Role name.
        role: String,
        /// Entity type.
        entity: String,
    },
    /// Every rule was replaced or removed.
    Cleared,
}

/// Called after every store mutation.
pub type ChangeListener = Arc<dyn Fn(&RuleChange) + Send + Sync>;

/// Source of roles and rules.
pub trait RuleStore: Send + Sync {
    /// A role definition.
    fn role(&self, name: &str) -> AuthResult<Option<RoleDef>>;

    /// Every role definition.
    fn roles(&self) -> AuthResult<Vec<RoleDef>>;

    /// Explicit type rules of a role, without inheritance.
    fn type_rules(&self, role: &str, entity: &str) -> AuthResult<Option<TypeAllowedAndConditions>>;

    /// Explicit property rules of a role, without inheritance.
    fn property_rules(&self, role: &str, entity: &str) -> AuthResult<Option<PropertyRules>>;

    /// Register a listener for mutations.
    fn subscribe(&self, listener: ChangeListener);
}

/// Serialized form of a whole rule set, for export and import.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RulePack {
    /// Layout version of the pack.
    pub version: u32,
    /// Role definitions.
    #[serde(default)]
    pub roles: Vec<RoleDef>,
    /// (role, entity, rules) triples.
    #[serde(default)]
    pub type_rules: Vec<(String, String, TypeAllowedAndConditions)>,
    /// (role, entity, rules) triples.
    #[serde(default)]
    pub property_rules: Vec<(String, String, PropertyRules)>,
}

impl Default for RulePack {
    fn default() -> Self {
        Self {
            version: RULE_FORMAT_VERSION,
            roles: Vec::new(),
            type_rules: Vec::new(),
            property_rules: Vec::new(),
        }
    }
}

/// Rule store backed by a sled tree.
pub struct SledRuleStore {
    tree: sled::Tree,
    listeners: RwLock<Vec<ChangeListener>>,
}

impl SledRuleStore {
    /// Open the rule tree of a database.
    pub fn open(db: &sled::Db) -> AuthResult<Self> {
        let tree = db.open_tree(RULE_TREE_NAME)?;
        Ok(Self {
            tree,
            listeners: RwLock::new(Vec::new()),
        })
    }

    /// Write a role definition.
    pub fn put_role(&self, role: &RoleDef) -> AuthResult<()> {
        self.tree
            .insert(prefixed(ROLE_PREFIX, &role.name), encode(role)?)?;
        self.notify(RuleChange::Role(role.name.clone()));
        Ok(())
    }

    /// Remove a role definition. Its rules are kept.
    pub fn remove_role(&self, name: &str) -> AuthResult<bool> {
        let removed = self.tree.remove(prefixed(ROLE_PREFIX, name))?.is_some();
        if removed {
            self.notify(RuleChange::Role(name.to_string()));
        }
        Ok(removed)
    }

    /// Write the type rules of (role, entity).
    pub fn put_type_rules(
        &self,
        role: &str,
        entity: &str,
        rules: &TypeAllowedAndConditions,
    ) -> AuthResult<()> {
        self.tree
            .insert(pair_key(TYPE_PREFIX, role, entity), encode(rules)?)?;
        self.notify(RuleChange::TypeRules {
            role: role.to_string(),
            entity: entity.to_string(),
        });
        Ok(())
    }

    /// Remove the type rules of (role, entity).
    pub fn remove_type_rules(&self, role: &str, entity: &str) -> AuthResult<bool> {
        let removed = self.tree.remove(pair_key(TYPE_PREFIX, role, entity))?.is_some();
        if removed {
            self.notify(RuleChange::TypeRules {
                role: role.to_string(),
                entity: entity.to_string(),
            });
        }
        Ok(removed)
    }

    /// Write the property rules of (role, entity).
    pub fn put_property_rules(
        &self,
        role: &str,
        entity: &str,
        rules: &PropertyRules,
    ) -> AuthResult<()> {
        self.tree
            .insert(pair_key(PROPERTY_PREFIX, role, entity), encode(rules)?)?;
        self.notify(RuleChange::PropertyRules {
            role: role.to_string(),
            entity: entity.to_string(),
        });
        Ok(())
    }

    /// Remove the property rules of (role, entity).
    pub fn remove_property_rules(&self, role: &str, entity: &str) -> AuthResult<bool> {
        let removed = self
            .tree
            .remove(pair_key(PROPERTY_PREFIX, role, entity))?
            .is_some();
        if removed {
            self.notify(RuleChange::PropertyRules {
                role: role.to_string(),
                entity: entity.to_string(),
            });
        }
        Ok(removed)
    }

    /// Names of every stored role.
    pub fn list_roles(&self) -> AuthResult<Vec<String>> {
        Ok(self.roles()?.into_iter().map(|role| role.name).collect())
    }

    /// Remove every role and rule.
    pub fn clear(&self) -> AuthResult<()> {
        self.tree.clear()?;
        self.notify(RuleChange::Cleared);
        Ok(())
    }

    /// Snapshot the whole rule set.
    pub fn export_pack(&self) -> AuthResult<RulePack> {
        let mut pack = RulePack {
            roles: self.roles()?,
            ..RulePack::default()
        };
        for item in self.tree.scan_prefix(TYPE_PREFIX) {
            let (key, value) = item?;
            let (role, entity) = split_pair(&key[TYPE_PREFIX.len()..])?;
            pack.type_rules.push((role, entity, decode(&value)?));
        }
        for item in self.tree.scan_prefix(PROPERTY_PREFIX) {
            let (key, value) = item?;
            let (role, entity) = split_pair(&key[PROPERTY_PREFIX.len()..])?;
            pack.property_rules.push((role, entity, decode(&value)?));
        }
        Ok(pack)
    }

    /// Replace the whole rule set with a pack, atomically.
    pub fn import_pack(&self, pack: &RulePack) -> AuthResult<()> {
        if pack.version != RULE_FORMAT_VERSION {
            return Err(ProtoError::VersionMismatch {
                expected: RULE_FORMAT_VERSION,
                actual: pack.version,
            }
            .into());
        }

        let mut batch = sled::Batch::default();
        for item in self.tree.iter().keys() {
            batch.remove(item?);
        }
        for role in &pack.roles {
            batch.insert(prefixed(ROLE_PREFIX, &role.name), encode(role)?);
        }
        for (role, entity, rules) in &pack.type_rules {
            batch.insert(pair_key(TYPE_PREFIX, role, entity), encode(rules)?);
        }
        for (role, entity, rules) in &pack.property_rules {
            batch.insert(pair_key(PROPERTY_PREFIX, role, entity), encode(rules)?);
        }
        self.tree.apply_batch(batch)?;
        debug!(
            roles = pack.roles.len(),
            type_rules = pack.type_rules.len(),
            "rule pack imported"
        );
        self.notify(RuleChange::Cleared);
        Ok(())
    }

    fn notify(&self, change: RuleChange) {
        debug!(?change, "rule store changed");
        let listeners = self.listeners.read().clone();
        for listener in listeners {
            listener(&change);
        }
    }
}

impl RuleStore for SledRuleStore {
    fn role(&self, name: &str) -> AuthResult<Option<RoleDef>> {
        self.tree
            .get(prefixed(ROLE_PREFIX, name))?
            .map(|bytes| decode(&bytes))
            .transpose()
    }

    fn roles(&self) -> AuthResult<Vec<RoleDef>> {
        let mut roles = Vec::new();
        for item in self.tree.scan_prefix(ROLE_PREFIX) {
            let (_, value) = item?;
            roles.push(decode(&value)?);
        }
        Ok(roles)
    }

    fn type_rules(&self, role: &str, entity: &str) -> AuthResult<Option<TypeAllowedAndConditions>> {
        self.tree
            .get(pair_key(TYPE_PREFIX, role, entity))?
            .map(|bytes| decode(&bytes))
            .transpose()
    }

    fn property_rules(&self, role: &str, entity: &str) -> AuthResult<Option<PropertyRules>> {
        self.tree
            .get(pair_key(PROPERTY_PREFIX, role, entity))?
            .map(|bytes| decode(&bytes))
            .transpose()
    }

    fn subscribe(&self, listener: ChangeListener) {
        self.listeners.write().push(listener);
    }
}

impl fmt::Debug for SledRuleStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SledRuleStore")
            .field("entries", &self.tree.len())
            .field("listeners", &self.listeners.read().len())
            .finish()
    }
}

fn prefixed(prefix: &[u8], name: &str) -> Vec<u8> {
    let mut key = prefix.to_vec();
    key.extend_from_slice(name.as_bytes());
    key
}

fn pair_key(prefix: &[u8], role: &str, entity: &str) -> Vec<u8> {
    let mut key = prefixed(prefix, role);
    key.push(0);
    key.extend_from_slice(entity.as_bytes());
    key
}

fn split_pair(bytes: &[u8]) -> AuthResult<(String, String)> {
    let pos = bytes
        .iter()
        .position(|b| *b == 0)
        .ok_or_else(|| ProtoError::Deserialization("rule key without separator".into()))?;
    let role = String::from_utf8_lossy(&bytes[..pos]).into_owned();
    let entity = String::from_utf8_lossy(&bytes[pos + 1..]).into_owned();
    Ok((role, entity))
}

fn encode<T: Serialize>(value: &T) -> AuthResult<Vec<u8>> {
    Ok(serde_json::to_vec(value).map_err(ProtoError::from)?)
}

fn decode<T: DeserializeOwned>(bytes: &[u8]) -> AuthResult<T> {
    Ok(serde_json::from_slice(bytes).map_err(ProtoError::from)?)
}
