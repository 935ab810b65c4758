//! Access levels and allowance pairs.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Ordered permission tier.
///
/// Ordering is by ordinal: `None < Read < Write`.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub enum AccessLevel {
    /// No access.
    #[default]
    None,
    /// Read access.
    Read,
    /// Read and write access.
    Write,
}

impl AccessLevel {
    /// All levels in ascending order.
    pub const ALL: [AccessLevel; 3] = [AccessLevel::None, AccessLevel::Read, AccessLevel::Write];

    /// Whether this level satisfies a requested level.
    pub fn satisfies(self, requested: AccessLevel) -> bool {
        self >= requested
    }
}

impl fmt::Display for AccessLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AccessLevel::None => write!(f, "None"),
            AccessLevel::Read => write!(f, "Read"),
            AccessLevel::Write => write!(f, "Write"),
        }
    }
}

/// Allowance for the user-interface context and the backend/DB context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct AllowedPair {
    /// Level granted when acting from the user interface.
    pub ui: AccessLevel,
    /// Level granted to backend code.
    pub db: AccessLevel,
}

impl AllowedPair {
    /// Create a pair from explicit levels.
    pub fn new(ui: AccessLevel, db: AccessLevel) -> Self {
        Self { ui, db }
    }

    /// Same level in both contexts.
    pub fn both(level: AccessLevel) -> Self {
        Self { ui: level, db: level }
    }

    /// No access in either context.
    pub fn none() -> Self {
        Self::both(AccessLevel::None)
    }

    /// Select the level for the requested context.
    pub fn get(&self, for_ui: bool) -> AccessLevel {
        if for_ui {
            self.ui
        } else {
            self.db
        }
    }

    /// Whether the selected level satisfies the requested one.
    pub fn allows(&self, requested: AccessLevel, for_ui: bool) -> bool {
        self.get(for_ui).satisfies(requested)
    }

    /// Component-wise combination with another pair.
    pub fn combine(
        &self,
        other: &AllowedPair,
        f: impl Fn(AccessLevel, AccessLevel) -> AccessLevel,
    ) -> AllowedPair {
        AllowedPair {
            ui: f(self.ui, other.ui),
            db: f(self.db, other.db),
        }
    }
}

impl fmt::Display for AllowedPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.ui == self.db {
            write!(f, "{}", self.ui)
        } else {
            write!(f, "{} (ui) / {} (db)", self.ui, self.db)
        }
    }
}
