//! Role-aware rule resolution with a generation-stamped cache.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use condauth_proto::{AccessLevel, AllowedPair, PropertyRules, TypeAllowedAndConditions};
use dashmap::DashMap;
use tracing::{debug, info};

use super::merge::MergeStrategy;
use super::store::{RuleChange, RuleStore};
use crate::condition::ConditionRegistry;
use crate::error::{AuthError, AuthResult};
use crate::security::{AuditEvent, AuditEventType, AuditLogger};

type CacheKey = (String, String);

/// Resolved rules per (role, entity). Entries stamped with an older
/// generation are ignored, so a resolution racing an invalidation can never
/// reinstate stale rules.
struct RuleCache {
    types: DashMap<CacheKey, (u64, Arc<TypeAllowedAndConditions>)>,
    properties: DashMap<CacheKey, (u64, Arc<PropertyRules>)>,
    generation: AtomicU64,
    audit: Arc<dyn AuditLogger>,
}

impl RuleCache {
    fn invalidate(&self) -> u64 {
        let generation = self.generation.fetch_add(1, Ordering::AcqRel) + 1;
        self.types.clear();
        self.properties.clear();
        info!(generation, "resolved rules invalidated");
        self.audit
            .log(AuditEvent::system(AuditEventType::RulesInvalidated { generation }));
        generation
    }
}

/// Resolves the effective rules of a role, incorporating inheritance.
pub struct RuleResolver {
    store: Arc<dyn RuleStore>,
    registry: Arc<ConditionRegistry>,
    strategy: Arc<dyn MergeStrategy>,
    default_fallback: AllowedPair,
    cache: Arc<RuleCache>,
}

impl RuleResolver {
    /// Create a resolver and subscribe it to store mutations.
    pub fn new(
        store: Arc<dyn RuleStore>,
        registry: Arc<ConditionRegistry>,
        strategy: Arc<dyn MergeStrategy>,
        default_fallback: AllowedPair,
        audit: Arc<dyn AuditLogger>,
    ) -> Self {
        let cache = Arc::new(RuleCache {
            types: DashMap::new(),
            properties: DashMap::new(),
            generation: AtomicU64::new(0),
            audit,
        });

        let weak: Weak<RuleCache> = Arc::downgrade(&cache);
        store.subscribe(Arc::new(move |change: &RuleChange| {
            if let Some(cache) = weak.upgrade() {
                debug!(?change, "invalidating resolved rules");
                cache.invalidate();
            }
        }));

        Self {
            store,
            registry,
            strategy,
            default_fallback,
            cache,
        }
    }

    /// The effective rules of `role` for `entity`.
    pub fn resolve(&self, role: &str, entity: &str) -> AuthResult<Arc<TypeAllowedAndConditions>> {
        if !self.registry.is_sealed() {
            return Err(AuthError::InvalidState(
                "rules cannot be resolved before the condition registry is sealed".into(),
            ));
        }

        let key = (role.to_string(), entity.to_string());
        let generation = self.cache.generation.load(Ordering::Acquire);
        if let Some(entry) = self.cache.types.get(&key) {
            if entry.0 == generation {
                return Ok(Arc::clone(&entry.1));
            }
        }

        debug!(role, entity, "resolving type rules");
        let mut visiting = Vec::new();
        let resolved = Arc::new(self.resolve_types(role, entity, &mut visiting)?);
        self.cache
            .types
            .insert(key, (generation, Arc::clone(&resolved)));
        Ok(resolved)
    }

    /// The effective property rules of `role` for `entity`.
    ///
    /// Roles without property rules anywhere in their ancestry may write
    /// every property; type rules still govern the entity itself.
    pub fn resolve_properties(&self, role: &str, entity: &str) -> AuthResult<Arc<PropertyRules>> {
        let key = (role.to_string(), entity.to_string());
        let generation = self.cache.generation.load(Ordering::Acquire);
        if let Some(entry) = self.cache.properties.get(&key) {
            if entry.0 == generation {
                return Ok(Arc::clone(&entry.1));
            }
        }

        let mut visiting = Vec::new();
        let resolved = Arc::new(self.resolve_property_rules(role, entity, &mut visiting)?);
        self.cache
            .properties
            .insert(key, (generation, Arc::clone(&resolved)));
        Ok(resolved)
    }

    /// Drop every cached resolution. Returns the new cache generation.
    pub fn invalidate_all(&self) -> u64 {
        self.cache.invalidate()
    }

    /// Current cache generation.
    pub fn generation(&self) -> u64 {
        self.cache.generation.load(Ordering::Acquire)
    }

    /// Check every stored role for unknown parents and inheritance cycles.
    pub fn check_hierarchy(&self) -> AuthResult<()> {
        let roles: HashMap<String, Vec<String>> = self
            .store
            .roles()?
            .into_iter()
            .map(|role| (role.name, role.parents))
            .collect();

        let mut done = HashSet::new();
        for name in roles.keys() {
            let mut path = Vec::new();
            visit(name, &roles, &mut path, &mut done)?;
        }
        Ok(())
    }

    fn resolve_types(
        &self,
        role: &str,
        entity: &str,
        visiting: &mut Vec<String>,
    ) -> AuthResult<TypeAllowedAndConditions> {
        enter(role, visiting)?;
        let definition = self
            .store
            .role(role)?
            .ok_or_else(|| AuthError::Configuration(format!("unknown role '{}'", role)))?;

        let resolved = if let Some(rules) = self.store.type_rules(role, entity)? {
            self.validate_symbols(role, entity, &rules)?;
            rules
        } else if definition.parents.is_empty() {
            TypeAllowedAndConditions::new(self.default_fallback)
        } else {
            let mut merged: Option<TypeAllowedAndConditions> = None;
            for parent in &definition.parents {
                let inherited = self.resolve_types(parent, entity, visiting)?;
                merged = Some(match merged {
                    None => inherited,
                    Some(acc) => self.strategy.merge_rules(&acc, &inherited),
                });
            }
            merged.unwrap_or_else(|| TypeAllowedAndConditions::new(self.default_fallback))
        };

        visiting.pop();
        Ok(resolved)
    }

    fn resolve_property_rules(
        &self,
        role: &str,
        entity: &str,
        visiting: &mut Vec<String>,
    ) -> AuthResult<PropertyRules> {
        enter(role, visiting)?;
        let definition = self
            .store
            .role(role)?
            .ok_or_else(|| AuthError::Configuration(format!("unknown role '{}'", role)))?;

        let resolved = if let Some(rules) = self.store.property_rules(role, entity)? {
            rules
        } else {
            let mut merged: Option<PropertyRules> = None;
            for parent in &definition.parents {
                let inherited = self.resolve_property_rules(parent, entity, visiting)?;
                merged = Some(match merged {
                    None => inherited,
                    Some(acc) => self.strategy.merge_properties(&acc, &inherited),
                });
            }
            merged.unwrap_or_else(|| PropertyRules::new(AllowedPair::both(AccessLevel::Write)))
        };

        visiting.pop();
        Ok(resolved)
    }

    fn validate_symbols(
        &self,
        role: &str,
        entity: &str,
        rules: &TypeAllowedAndConditions,
    ) -> AuthResult<()> {
        for symbol in rules.symbols() {
            if symbol.is_empty() {
                return Err(AuthError::NullArgument(format!(
                    "rules of role '{}' for {} contain an empty condition symbol",
                    role, entity
                )));
            }
            if !self.registry.is_defined(entity, &symbol) {
                return Err(AuthError::Configuration(format!(
                    "rules of role '{}' reference condition {}.{} which is not registered",
                    role, entity, symbol
                )));
            }
        }
        Ok(())
    }
}

impl fmt::Debug for RuleResolver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RuleResolver")
            .field("strategy", &self.strategy)
            .field("default_fallback", &self.default_fallback)
            .field("generation", &self.generation())
            .field("cached", &self.cache.types.len())
            .finish()
    }
}

fn enter(role: &str, visiting: &mut Vec<String>) -> AuthResult<()> {
    if visiting.iter().any(|r| r == role) {
        return Err(cycle_error(visiting, role));
    }
    visiting.push(role.to_string());
    Ok(())
}

fn cycle_error(path: &[String], role: &str) -> AuthError {
    let mut chain: Vec<&str> = path.iter().map(String::as_str).collect();
    chain.push(role);
    AuthError::Configuration(format!("role inheritance cycle: {}", chain.join(" -> ")))
}

fn visit(
    name: &str,
    roles: &HashMap<String, Vec<String>>,
    path: &mut Vec<String>,
    done: &mut HashSet<String>,
) -> AuthResult<()> {
    if done.contains(name) {
        return Ok(());
    }
    if path.iter().any(|r| r == name) {
        return Err(cycle_error(path, name));
    }
    let parents = roles
        .get(name)
        .ok_or_else(|| AuthError::Configuration(format!("unknown role '{}'", name)))?;

    path.push(name.to_string());
    for parent in parents {
        visit(parent, roles, path, done)?;
    }
    path.pop();
    done.insert(name.to_string());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::condition::ConditionExpr;
    use crate::rules::{MaxMerge, MinMerge, SledRuleStore};
    use crate::security::MemoryAuditLogger;
    use condauth_proto::{ConditionRule, ConditionSymbol, RoleDef};

    struct Fixture {
        store: Arc<SledRuleStore>,
        resolver: RuleResolver,
        audit: MemoryAuditLogger,
        _db: sled::Db,
    }

    fn fixture_with(strategy: Arc<dyn MergeStrategy>) -> Fixture {
        let db = sled::Config::new().temporary(true).open().unwrap();
        let store = Arc::new(SledRuleStore::open(&db).unwrap());
        let registry = Arc::new(ConditionRegistry::new());
        for symbol in ["OwnedByMe", "Open"] {
            registry
                .register("Invoice", symbol, ConditionExpr::principal_id("owner"), None)
                .unwrap();
        }
        registry.seal();
        let audit = MemoryAuditLogger::new();
        let resolver = RuleResolver::new(
            store.clone(),
            registry,
            strategy,
            AllowedPair::none(),
            Arc::new(audit.clone()),
        );
        Fixture {
            store,
            resolver,
            audit,
            _db: db,
        }
    }

    fn fixture() -> Fixture {
        fixture_with(Arc::new(MaxMerge))
    }

    fn rules(fallback: AccessLevel, symbol: &str, level: AccessLevel) -> TypeAllowedAndConditions {
        TypeAllowedAndConditions::new(AllowedPair::both(fallback))
            .with_rule(ConditionRule::new([symbol], AllowedPair::both(level)))
    }

    #[test]
    fn test_requires_sealed_registry() {
        let db = sled::Config::new().temporary(true).open().unwrap();
        let resolver = RuleResolver::new(
            Arc::new(SledRuleStore::open(&db).unwrap()),
            Arc::new(ConditionRegistry::new()),
            Arc::new(MaxMerge),
            AllowedPair::none(),
            Arc::new(MemoryAuditLogger::new()),
        );
        let err = resolver.resolve("Sales", "Invoice").unwrap_err();
        assert!(matches!(err, AuthError::InvalidState(_)));
    }

    #[test]
    fn test_explicit_rules_win() {
        let f = fixture();
        f.store.put_role(&RoleDef::new("Employee")).unwrap();
        f.store
            .put_role(&RoleDef::new("Sales").inherits("Employee"))
            .unwrap();
        f.store
            .put_type_rules("Employee", "Invoice", &rules(AccessLevel::Write, "Open", AccessLevel::Write))
            .unwrap();
        let own = rules(AccessLevel::Read, "OwnedByMe", AccessLevel::Write);
        f.store.put_type_rules("Sales", "Invoice", &own).unwrap();

        assert_eq!(*f.resolver.resolve("Sales", "Invoice").unwrap(), own);
    }

    #[test]
    fn test_inherits_from_parents() {
        let f = fixture_with(Arc::new(MinMerge));
        f.store.put_role(&RoleDef::new("A")).unwrap();
        f.store.put_role(&RoleDef::new("B")).unwrap();
        f.store
            .put_role(&RoleDef::new("Child").inherits("A").inherits("B"))
            .unwrap();
        f.store
            .put_type_rules("A", "Invoice", &TypeAllowedAndConditions::new(AllowedPair::both(AccessLevel::Write)))
            .unwrap();
        f.store
            .put_type_rules("B", "Invoice", &rules(AccessLevel::Read, "OwnedByMe", AccessLevel::Write))
            .unwrap();

        let resolved = f.resolver.resolve("Child", "Invoice").unwrap();
        let owned = ConditionSymbol::new("OwnedByMe");
        assert_eq!(resolved.decide(false, |s| *s == owned), AccessLevel::Write);
        assert_eq!(resolved.decide(false, |_| false), AccessLevel::Read);
    }

    #[test]
    fn test_no_rules_no_parents_is_default_fallback() {
        let f = fixture();
        f.store.put_role(&RoleDef::new("Guest")).unwrap();
        let resolved = f.resolver.resolve("Guest", "Invoice").unwrap();
        assert_eq!(resolved.fallback, AllowedPair::none());
        assert!(resolved.is_unconditional());
    }

    #[test]
    fn test_unknown_role_and_unregistered_symbol() {
        let f = fixture();
        assert!(matches!(
            f.resolver.resolve("Nobody", "Invoice"),
            Err(AuthError::Configuration(_))
        ));

        f.store.put_role(&RoleDef::new("Sales")).unwrap();
        f.store
            .put_type_rules("Sales", "Invoice", &rules(AccessLevel::Read, "Missing", AccessLevel::Write))
            .unwrap();
        assert!(matches!(
            f.resolver.resolve("Sales", "Invoice"),
            Err(AuthError::Configuration(_))
        ));
    }

    #[test]
    fn test_inheritance_cycle() {
        let f = fixture();
        f.store.put_role(&RoleDef::new("A").inherits("B")).unwrap();
        f.store.put_role(&RoleDef::new("B").inherits("A")).unwrap();
        let err = f.resolver.resolve("A", "Invoice").unwrap_err();
        assert!(err.to_string().contains("cycle"));
        assert!(f.resolver.check_hierarchy().is_err());
    }

    #[test]
    fn test_check_hierarchy_unknown_parent() {
        let f = fixture();
        f.store.put_role(&RoleDef::new("A").inherits("Ghost")).unwrap();
        assert!(matches!(
            f.resolver.check_hierarchy(),
            Err(AuthError::Configuration(_))
        ));
    }

    #[test]
    fn test_store_mutation_invalidates_cache() {
        let f = fixture();
        f.store.put_role(&RoleDef::new("Sales")).unwrap();
        f.store
            .put_type_rules("Sales", "Invoice", &rules(AccessLevel::Read, "OwnedByMe", AccessLevel::Write))
            .unwrap();
        let before = f.resolver.resolve("Sales", "Invoice").unwrap();
        assert_eq!(before.fallback, AllowedPair::both(AccessLevel::Read));

        let generation = f.resolver.generation();
        f.store
            .put_type_rules("Sales", "Invoice", &rules(AccessLevel::None, "OwnedByMe", AccessLevel::Write))
            .unwrap();
        assert!(f.resolver.generation() > generation);

        let after = f.resolver.resolve("Sales", "Invoice").unwrap();
        assert_eq!(after.fallback, AllowedPair::none());
        assert!(f
            .audit
            .events()
            .iter()
            .any(|e| matches!(e.event_type, AuditEventType::RulesInvalidated { .. })));
    }

    #[test]
    fn test_cached_resolution_is_shared() {
        let f = fixture();
        f.store.put_role(&RoleDef::new("Sales")).unwrap();
        let a = f.resolver.resolve("Sales", "Invoice").unwrap();
        let b = f.resolver.resolve("Sales", "Invoice").unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        f.resolver.invalidate_all();
        let c = f.resolver.resolve("Sales", "Invoice").unwrap();
        assert!(!Arc::ptr_eq(&a, &c));
    }

    #[test]
    fn test_property_rules_default_and_inheritance() {
        let f = fixture();
        f.store.put_role(&RoleDef::new("Employee")).unwrap();
        f.store
            .put_role(&RoleDef::new("Sales").inherits("Employee"))
            .unwrap();
        assert_eq!(
            f.resolver.resolve_properties("Sales", "Invoice").unwrap().get("amount"),
            AllowedPair::both(AccessLevel::Write)
        );

        f.store
            .put_property_rules(
                "Employee",
                "Invoice",
                &PropertyRules::new(AllowedPair::both(AccessLevel::Write))
                    .with_field("margin", AllowedPair::none()),
            )
            .unwrap();
        let resolved = f.resolver.resolve_properties("Sales", "Invoice").unwrap();
        assert_eq!(resolved.get("margin"), AllowedPair::none());
    }
}
