//! Entity identifiers, holders, records and identity allocation.
//!
//! An [`EntityId`] is a plain 64-bit handle issued by the [`IdentityAllocator`].
//! Unlike a recycling allocator, identifiers are never handed out twice: the
//! counter only moves forward, even when the execution unit that allocated an
//! identifier is later rolled back.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::ownership::{Ownership, OwnershipClass};

// ---------------------------------------------------------------------------
// EntityId
// ---------------------------------------------------------------------------

/// A globally unique, never reused entity identifier.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EntityId(u64);

impl EntityId {
    /// Raw `u64` representation.
    #[inline]
    pub fn to_raw(self) -> u64 {
        self.0
    }

    /// Reconstruct from a raw `u64`.
    #[inline]
    pub fn from_raw(raw: u64) -> Self {
        Self(raw)
    }
}

impl fmt::Debug for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EntityId({})", self.0)
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// Holder
// ---------------------------------------------------------------------------

/// The party on whose behalf an execution unit runs, and the exclusive holder
/// of [`Ownership::Owned`] entities.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Holder(pub u64);

impl fmt::Display for Holder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "holder:{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// EntityRecord
// ---------------------------------------------------------------------------

/// The fixed-size persisted record of an entity.
///
/// `id`, `type_tag` and `created_at` never change after creation. Attributes
/// live outside the record so its size does not depend on how many are
/// attached.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityRecord {
    pub id: EntityId,
    /// Caller-chosen kind of entity, also the key for registered migrations.
    pub type_tag: String,
    /// Timestamp (milliseconds) of the unit that created the entity.
    pub created_at: u64,
    pub ownership: Ownership,
    pub schema_version: u64,
}

impl EntityRecord {
    /// The ownership class tag of this record.
    pub fn class(&self) -> OwnershipClass {
        self.ownership.class()
    }
}

// ---------------------------------------------------------------------------
// IdentityAllocator
// ---------------------------------------------------------------------------

/// Issues monotonically increasing [`EntityId`]s.
#[derive(Debug, Default)]
pub struct IdentityAllocator {
    next: u64,
}

impl IdentityAllocator {
    /// Create a new allocator starting at zero.
    pub fn new() -> Self {
        Self { next: 0 }
    }

    /// Resume allocation after `next - 1`, used when restoring a snapshot.
    pub fn resume_from(next: u64) -> Self {
        Self { next }
    }

    /// Allocate a fresh [`EntityId`]. Never fails and never repeats.
    pub fn allocate(&mut self) -> EntityId {
        let id = EntityId(self.next);
        self.next += 1;
        id
    }

    /// The raw value the next allocation will return.
    pub fn next_raw(&self) -> u64 {
        self.next
    }

    /// Whether `id` has been issued by this allocator.
    pub fn has_issued(&self, id: EntityId) -> bool {
        id.0 < self.next
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocate_unique_ids() {
        let mut alloc = IdentityAllocator::new();
        let mut ids: Vec<EntityId> = (0..100).map(|_| alloc.allocate()).collect();
        ids.sort();
        ids.dedup();
        assert_eq!(ids.len(), 100);
    }

    #[test]
    fn allocation_is_monotonic() {
        let mut alloc = IdentityAllocator::new();
        let a = alloc.allocate();
        let b = alloc.allocate();
        assert!(b > a);
        assert!(alloc.has_issued(a));
        assert!(alloc.has_issued(b));
        assert!(!alloc.has_issued(EntityId::from_raw(b.to_raw() + 1)));
    }

    #[test]
    fn resume_never_reissues() {
        let mut alloc = IdentityAllocator::new();
        for _ in 0..5 {
            alloc.allocate();
        }
        let mut resumed = IdentityAllocator::resume_from(alloc.next_raw());
        assert_eq!(resumed.allocate(), EntityId::from_raw(5));
    }

    #[test]
    fn display_formats() {
        assert_eq!(EntityId::from_raw(7).to_string(), "#7");
        assert_eq!(format!("{:?}", EntityId::from_raw(7)), "EntityId(7)");
        assert_eq!(Holder(3).to_string(), "holder:3");
    }
}
