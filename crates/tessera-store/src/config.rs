//! Store configuration.
//!
//! A [`StoreConfig`] is handed to [`Store::open`](crate::store::Store::open)
//! and owned by the store from then on. There is no process-wide registry:
//! everything a unit needs is reached through the store it runs against.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::StoreError;

// ---------------------------------------------------------------------------
// Budget
// ---------------------------------------------------------------------------

/// The bounded per-unit resources.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Budget {
    /// Attribute records created (net of removals) within one unit.
    Created,
    /// Distinct `(entity, key)` pairs accessed within one unit.
    Accessed,
    /// Encoded size of a single attribute value, in bytes.
    RecordSize,
}

impl fmt::Display for Budget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Budget::Created => "creation",
            Budget::Accessed => "access",
            Budget::RecordSize => "record size",
        };
        f.write_str(name)
    }
}

// ---------------------------------------------------------------------------
// UnitBudgets
// ---------------------------------------------------------------------------

/// Per-unit resource limits. These are deployment policy, not semantics.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct UnitBudgets {
    pub max_created: usize,
    pub max_accessed: usize,
    pub max_value_bytes: usize,
}

impl Default for UnitBudgets {
    /// 1000 creations, 1000 accesses, 256 KiB per value.
    fn default() -> Self {
        Self {
            max_created: 1000,
            max_accessed: 1000,
            max_value_bytes: 256 * 1024,
        }
    }
}

impl UnitBudgets {
    /// The configured limit for `budget`.
    pub fn limit(&self, budget: Budget) -> usize {
        match budget {
            Budget::Created => self.max_created,
            Budget::Accessed => self.max_accessed,
            Budget::RecordSize => self.max_value_bytes,
        }
    }

    fn validate(&self) -> Result<(), StoreError> {
        for budget in [Budget::Created, Budget::Accessed, Budget::RecordSize] {
            if self.limit(budget) == 0 {
                return Err(StoreError::InvalidConfig {
                    details: format!("{budget} budget must be positive"),
                });
            }
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// StoreConfig
// ---------------------------------------------------------------------------

/// Configuration for a [`Store`](crate::store::Store).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// The deployed schema version. New entities start at this version and
    /// mutations require entities to be at it.
    pub schema_version: u64,
    pub budgets: UnitBudgets,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            schema_version: 1,
            budgets: UnitBudgets::default(),
        }
    }
}

impl StoreConfig {
    /// Parse a configuration from JSON. Missing fields take their defaults.
    pub fn from_json(json: &str) -> Result<Self, StoreError> {
        let config: StoreConfig =
            serde_json::from_str(json).map_err(|e| StoreError::InvalidConfig {
                details: e.to_string(),
            })?;
        config.validate()?;
        Ok(config)
    }

    /// Reject configurations no store can run with.
    pub fn validate(&self) -> Result<(), StoreError> {
        if self.schema_version == 0 {
            return Err(StoreError::VersionMismatch {
                entity: None,
                expected: 1,
                found: 0,
            });
        }
        self.budgets.validate()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
