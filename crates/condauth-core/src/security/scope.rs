//! Scoped flags and temporary condition overrides.
//!
//! Every flag is toggled through an RAII guard that restores the value it
//! found. Re-entering an already active scope is therefore a no-op, and
//! leaving the inner scope keeps the outer one active.

use std::cell::{Cell, RefCell};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use condauth_proto::ConditionSymbol;
use tracing::{debug, warn};

use crate::condition::TypeCondition;

type OverrideKey = (String, ConditionSymbol);
type OverrideLayers = HashMap<OverrideKey, Vec<(u64, Arc<TypeCondition>)>>;

/// Interior-mutable scope state of one request.
#[derive(Default)]
pub struct ScopeState {
    query_filter_disabled: Cell<bool>,
    in_save: Cell<bool>,
    in_ui: Cell<bool>,
    authorization_disabled: Cell<bool>,
    writing: RefCell<BTreeSet<String>>,
    overrides: RefCell<OverrideLayers>,
    next_layer: Cell<u64>,
}

impl ScopeState {
    /// Whether automatic query filtering applies.
    pub fn query_filter_enabled(&self) -> bool {
        !self.query_filter_disabled.get()
    }

    /// Whether a save is in progress.
    pub fn is_in_save(&self) -> bool {
        self.in_save.get()
    }

    /// Whether the request acts on behalf of the user interface.
    pub fn is_user_interface(&self) -> bool {
        self.in_ui.get()
    }

    /// Whether every authorization check is suspended.
    pub fn authorization_disabled(&self) -> bool {
        self.authorization_disabled.get()
    }

    /// Whether `entity` is being written.
    pub fn is_writing(&self, entity: &str) -> bool {
        self.writing.borrow().contains(entity)
    }

    pub(crate) fn disable_query_filter(&self) -> FlagGuard<'_> {
        FlagGuard::set(&self.query_filter_disabled, "query_filter_disabled")
    }

    pub(crate) fn in_save(&self) -> FlagGuard<'_> {
        FlagGuard::set(&self.in_save, "in_save")
    }

    pub(crate) fn user_interface(&self) -> FlagGuard<'_> {
        FlagGuard::set(&self.in_ui, "user_interface")
    }

    pub(crate) fn disable_authorization(&self) -> FlagGuard<'_> {
        if !self.authorization_disabled.get() {
            warn!("authorization disabled for scope");
        }
        FlagGuard::set(&self.authorization_disabled, "authorization_disabled")
    }

    pub(crate) fn writing(&self, entity: &str) -> WritingGuard<'_> {
        let inserted = self.writing.borrow_mut().insert(entity.to_string());
        WritingGuard {
            writing: &self.writing,
            entity: inserted.then(|| entity.to_string()),
        }
    }

    /// The innermost active override for a condition, if any.
    pub(crate) fn override_for(
        &self,
        entity: &str,
        symbol: &ConditionSymbol,
    ) -> Option<Arc<TypeCondition>> {
        self.overrides
            .borrow()
            .get(&(entity.to_string(), symbol.clone()))
            .and_then(|layers| layers.last())
            .map(|(_, condition)| Arc::clone(condition))
    }

    /// Number of override layers active for a condition.
    pub fn override_depth(&self, entity: &str, symbol: &ConditionSymbol) -> usize {
        self.overrides
            .borrow()
            .get(&(entity.to_string(), symbol.clone()))
            .map(Vec::len)
            .unwrap_or(0)
    }

    pub(crate) fn push_override(
        &self,
        entity: &str,
        symbol: &ConditionSymbol,
        condition: Arc<TypeCondition>,
    ) -> ConditionOverride<'_> {
        let layer = self.next_layer.get();
        self.next_layer.set(layer + 1);
        let key = (entity.to_string(), symbol.clone());
        self.overrides
            .borrow_mut()
            .entry(key.clone())
            .or_default()
            .push((layer, condition));
        debug!(entity, symbol = %symbol, layer, "condition override pushed");
        ConditionOverride {
            overrides: &self.overrides,
            key,
            layer,
        }
    }
}

impl std::fmt::Debug for ScopeState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScopeState")
            .field("query_filter_disabled", &self.query_filter_disabled.get())
            .field("in_save", &self.in_save.get())
            .field("in_ui", &self.in_ui.get())
            .field("authorization_disabled", &self.authorization_disabled.get())
            .field("writing", &self.writing.borrow())
            .field("overrides", &self.overrides.borrow().len())
            .finish()
    }
}

/// Guard for a boolean scope flag; restores the previous value on drop.
#[must_use = "the flag is reset as soon as the guard is dropped"]
pub struct FlagGuard<'s> {
    flag: &'s Cell<bool>,
    previous: bool,
    name: &'static str,
}

impl<'s> FlagGuard<'s> {
    fn set(flag: &'s Cell<bool>, name: &'static str) -> Self {
        let previous = flag.replace(true);
        Self {
            flag,
            previous,
            name,
        }
    }

    /// Whether entering this guard changed the flag.
    pub fn is_outermost(&self) -> bool {
        !self.previous
    }
}

impl Drop for FlagGuard<'_> {
    fn drop(&mut self) {
        self.flag.set(self.previous);
        if !self.previous {
            debug!(flag = self.name, "scope flag cleared");
        }
    }
}

/// Guard for the set of entity types being written.
#[must_use = "the type stops being written as soon as the guard is dropped"]
pub struct WritingGuard<'s> {
    writing: &'s RefCell<BTreeSet<String>>,
    /// Set only when this guard added the entry.
    entity: Option<String>,
}

impl Drop for WritingGuard<'_> {
    fn drop(&mut self) {
        if let Some(entity) = self.entity.take() {
            self.writing.borrow_mut().remove(&entity);
        }
    }
}

/// Guard for a temporary condition replacement; pops exactly its own layer.
#[must_use = "the override is removed as soon as the guard is dropped"]
#[derive(Debug)]
pub struct ConditionOverride<'s> {
    overrides: &'s RefCell<OverrideLayers>,
    key: OverrideKey,
    layer: u64,
}

impl Drop for ConditionOverride<'_> {
    fn drop(&mut self) {
        let mut overrides = self.overrides.borrow_mut();
        if let Some(layers) = overrides.get_mut(&self.key) {
            layers.retain(|(layer, _)| *layer != self.layer);
            if layers.is_empty() {
                overrides.remove(&self.key);
            }
        }
        debug!(entity = %self.key.0, symbol = %self.key.1, layer = self.layer, "condition override popped");
    }
}
