//! Ownership classes, the transition table, and execution-path selection.
//!
//! Every entity starts [`Ownership::Owned`] by the holder that created it and
//! may move, exactly once, to one of the terminal classes:
//!
//! - [`OwnershipClass::Shared`]: any holder may mutate it, but only from a
//!   [`ExecutionPath::Sequenced`] unit.
//! - [`OwnershipClass::Immutable`]: readable by anyone, mutable by no one.
//! - [`OwnershipClass::Nested`]: reachable only through its parent's access
//!   path.
//!
//! The only edge that stays in `Owned` is a transfer to a new holder. Nothing
//! ever returns to `Owned`.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::entity::{EntityId, Holder};

// ---------------------------------------------------------------------------
// OwnershipClass
// ---------------------------------------------------------------------------

/// The class tag of an entity's [`Ownership`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OwnershipClass {
    Owned,
    Shared,
    Immutable,
    Nested,
}

/// Every permitted `(from, to)` edge. Anything else is rejected.
const TRANSITIONS: &[(OwnershipClass, OwnershipClass)] = &[
    (OwnershipClass::Owned, OwnershipClass::Owned),
    (OwnershipClass::Owned, OwnershipClass::Shared),
    (OwnershipClass::Owned, OwnershipClass::Immutable),
    (OwnershipClass::Owned, OwnershipClass::Nested),
];

impl OwnershipClass {
    /// Whether the transition table lists `self -> next`.
    pub fn can_transition_to(self, next: OwnershipClass) -> bool {
        TRANSITIONS.contains(&(self, next))
    }

    /// The execution path a mutation rooted at this class must use.
    pub fn required_path(self) -> ExecutionPath {
        match self {
            OwnershipClass::Shared => ExecutionPath::Sequenced,
            OwnershipClass::Owned | OwnershipClass::Immutable | OwnershipClass::Nested => {
                ExecutionPath::Independent
            }
        }
    }
}

impl fmt::Display for OwnershipClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            OwnershipClass::Owned => "owned",
            OwnershipClass::Shared => "shared",
            OwnershipClass::Immutable => "immutable",
            OwnershipClass::Nested => "nested",
        };
        f.write_str(name)
    }
}

// ---------------------------------------------------------------------------
// Ownership
// ---------------------------------------------------------------------------

/// Ownership state of an entity, with the data each class needs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "class", rename_all = "snake_case")]
pub enum Ownership {
    /// Exclusively held; only `holder` may mutate.
    Owned { holder: Holder },
    /// Mutable by anyone through the sequenced path.
    Shared,
    /// Frozen forever.
    Immutable,
    /// Wrapped inside `parent`; access resolves through the parent chain.
    Nested { parent: EntityId },
}

impl Ownership {
    /// The class without its payload.
    pub fn class(&self) -> OwnershipClass {
        match self {
            Ownership::Owned { .. } => OwnershipClass::Owned,
            Ownership::Shared => OwnershipClass::Shared,
            Ownership::Immutable => OwnershipClass::Immutable,
            Ownership::Nested { .. } => OwnershipClass::Nested,
        }
    }

    /// The holder, if this is [`Ownership::Owned`].
    pub fn holder(&self) -> Option<Holder> {
        match self {
            Ownership::Owned { holder } => Some(*holder),
            _ => None,
        }
    }

    /// The parent, if this is [`Ownership::Nested`].
    pub fn parent(&self) -> Option<EntityId> {
        match self {
            Ownership::Nested { parent } => Some(*parent),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// ExecutionPath
// ---------------------------------------------------------------------------

/// How an execution unit is scheduled relative to other units.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ExecutionPath {
    /// Uncontended; may run in parallel with other independent units.
    Independent,
    /// Totally ordered against every other sequenced unit.
    Sequenced,
}

// ---------------------------------------------------------------------------
// AccessRoot
// ---------------------------------------------------------------------------

/// The entity at the top of a nesting chain, which decides who may mutate
/// everything nested beneath it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AccessRoot {
    pub root: EntityId,
    pub class: OwnershipClass,
    pub holder: Option<Holder>,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
