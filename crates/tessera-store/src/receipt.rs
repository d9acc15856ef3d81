//! Receipts describing what a committed execution unit changed.

use serde::{Deserialize, Serialize};

use crate::attribute::AttributeKey;
use crate::entity::{EntityId, Holder};
use crate::ownership::{ExecutionPath, Ownership};

/// One observable effect of a committed unit, in the order it happened.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Change {
    EntityCreated {
        entity: EntityId,
        type_tag: String,
    },
    EntityDeleted {
        entity: EntityId,
    },
    AttributeAdded {
        entity: EntityId,
        key: AttributeKey,
        type_tag: String,
    },
    /// The attribute was borrowed mutably at least once.
    AttributeMutated {
        entity: EntityId,
        key: AttributeKey,
    },
    AttributeRemoved {
        entity: EntityId,
        key: AttributeKey,
    },
    OwnershipChanged {
        entity: EntityId,
        from: Ownership,
        to: Ownership,
    },
    Migrated {
        entity: EntityId,
        from: u64,
        to: u64,
    },
}

impl Change {
    /// The entity this change applies to.
    pub fn entity(&self) -> EntityId {
        match self {
            Change::EntityCreated { entity, .. }
            | Change::EntityDeleted { entity }
            | Change::AttributeAdded { entity, .. }
            | Change::AttributeMutated { entity, .. }
            | Change::AttributeRemoved { entity, .. }
            | Change::OwnershipChanged { entity, .. }
            | Change::Migrated { entity, .. } => *entity,
        }
    }

    /// The attribute key, for attribute-level changes.
    pub fn key(&self) -> Option<&AttributeKey> {
        match self {
            Change::AttributeAdded { key, .. }
            | Change::AttributeMutated { key, .. }
            | Change::AttributeRemoved { key, .. } => Some(key),
            _ => None,
        }
    }
}

/// Summary of a committed execution unit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnitReceipt {
    pub unit_id: u64,
    pub sender: Holder,
    pub path: ExecutionPath,
    /// Position in the total order, for sequenced units.
    pub sequence: Option<u64>,
    pub timestamp_ms: u64,
    /// Net attribute records created.
    pub created: usize,
    /// Distinct `(entity, key)` pairs accessed.
    pub accessed: usize,
    pub changes: Vec<Change>,
}

/// The result of a committed unit: the closure's value and the receipt.
#[derive(Debug)]
pub struct Committed<T> {
    pub value: T,
    pub receipt: UnitReceipt,
}

impl<T> Committed<T> {
    /// Discard the receipt and keep the unit's return value.
    pub fn into_value(self) -> T {
        self.value
    }
}
