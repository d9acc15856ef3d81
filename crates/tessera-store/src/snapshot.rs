//! Store snapshot and restore support.
//!
//! A [`StoreSnapshot`] is the persisted layout of a store: fixed-size entity
//! records plus attribute records addressed by `(parent_id, key_type,
//! key_value)` and stored apart from their parent. Values are carried as the
//! bytes produced by their registered encoder.
//!
//! Attribute type registration and migrations are not part of a snapshot; the
//! restoring store must register the same types first.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::attribute::{AttributeKey, StoredValue};
use crate::capability::Capability;
use crate::entity::{EntityId, EntityRecord, IdentityAllocator};
use crate::ownership::{Ownership, OwnershipClass};
use crate::store::Store;
use crate::StoreError;

// ---------------------------------------------------------------------------
// Snapshot types
// ---------------------------------------------------------------------------

/// One persisted attribute record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttributeRecord {
    pub parent_id: EntityId,
    pub key_type: String,
    pub key_value: Vec<u8>,
    pub value_type_tag: String,
    pub value_bytes: Vec<u8>,
}

/// A complete, serializable image of a store's data.
///
/// Entities are ordered by id and attributes by `(parent_id, key)`, so two
/// stores holding the same data produce byte-identical snapshots.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreSnapshot {
    pub schema_version: u64,
    /// Next identifier the allocator would hand out.
    pub next_id: u64,
    pub next_sequence: u64,
    /// Attribute type tags registered at capture time, sorted.
    pub type_tags: Vec<String>,
    pub entities: Vec<EntityRecord>,
    pub attributes: Vec<AttributeRecord>,
}

impl StoreSnapshot {
    /// Canonical JSON encoding.
    pub fn to_json(&self) -> Result<String, StoreError> {
        serde_json::to_string(self).map_err(|e| StoreError::Serialization {
            details: e.to_string(),
        })
    }

    /// Parse a snapshot. Consistency is checked on restore, not here.
    pub fn from_json(json: &str) -> Result<Self, StoreError> {
        serde_json::from_str(json).map_err(|e| StoreError::InvalidSnapshot {
            details: e.to_string(),
        })
    }

    /// Blake3 hex digest of the canonical JSON encoding.
    pub fn hash(&self) -> Result<String, StoreError> {
        let bytes = serde_json::to_vec(self).map_err(|e| StoreError::Serialization {
            details: e.to_string(),
        })?;
        Ok(blake3::hash(&bytes).to_hex().to_string())
    }
}

// ---------------------------------------------------------------------------
// Store snapshot/restore impl
// ---------------------------------------------------------------------------

impl Store {
    /// Capture every entity and attribute record.
    pub fn capture_snapshot(&self) -> Result<StoreSnapshot, StoreError> {
        let entities: Vec<EntityRecord> = self.entities.values().cloned().collect();

        let mut attributes = Vec::with_capacity(self.attributes.len());
        for ((parent_id, key), stored) in &self.attributes {
            attributes.push(AttributeRecord {
                parent_id: *parent_id,
                key_type: key.key_type().to_owned(),
                key_value: key.key_value().to_vec(),
                value_type_tag: self.registry.tag_of(stored.type_id).to_owned(),
                value_bytes: self.registry.encode_value(stored)?,
            });
        }

        Ok(StoreSnapshot {
            schema_version: self.config.schema_version,
            next_id: self.allocator.next_raw(),
            next_sequence: self.next_sequence,
            type_tags: self
                .registry
                .registered_tags()
                .into_iter()
                .map(str::to_owned)
                .collect(),
            entities,
            attributes,
        })
    }

    /// Blake3 hex digest of the current snapshot.
    pub fn state_hash(&self) -> Result<String, StoreError> {
        self.capture_snapshot()?.hash()
    }

    /// Replace this store's data with `snapshot`. Requires the capability.
    ///
    /// The snapshot is validated and every value decoded before any state is
    /// touched, so on error the store is unchanged. The deployed schema
    /// version is kept; a snapshot from a later schema is rejected. The
    /// allocator and sequence counters never move backwards, so identifiers
    /// already issued by this store stay unique.
    ///
    /// Ownership transitions are one-way: a live entity that is shared,
    /// immutable or nested must keep that exact ownership in the snapshot,
    /// and a live immutable entity must be present in it.
    pub fn restore_from_snapshot(
        &mut self,
        capability: &Capability,
        snapshot: &StoreSnapshot,
    ) -> Result<(), StoreError> {
        self.authority().require(capability)?;
        if snapshot.schema_version > self.config.schema_version {
            return Err(StoreError::VersionMismatch {
                entity: None,
                expected: self.config.schema_version,
                found: snapshot.schema_version,
            });
        }

        // Entities: unique, issued before `next_id`, not from a later schema.
        let mut entities = BTreeMap::new();
        for record in &snapshot.entities {
            if record.id.to_raw() >= snapshot.next_id {
                return Err(StoreError::InvalidSnapshot {
                    details: format!(
                        "entity {} is at or above the snapshot's next id {}",
                        record.id, snapshot.next_id
                    ),
                });
            }
            if record.schema_version > snapshot.schema_version {
                return Err(StoreError::VersionMismatch {
                    entity: Some(record.id),
                    expected: snapshot.schema_version,
                    found: record.schema_version,
                });
            }
            if entities.insert(record.id, record.clone()).is_some() {
                return Err(StoreError::InvalidSnapshot {
                    details: format!("entity {} appears twice", record.id),
                });
            }
        }

        // Nesting: parents exist and chains terminate.
        for record in entities.values() {
            if let Ownership::Nested { parent } = record.ownership {
                if !entities.contains_key(&parent) {
                    return Err(StoreError::EntityNotFound { entity: parent });
                }
            }
        }
        check_acyclic(&entities)?;
        self.check_no_ownership_reversal(&entities)?;

        // Attributes: parent exists, type registered, value decodes.
        let mut attributes = BTreeMap::new();
        for record in &snapshot.attributes {
            if !entities.contains_key(&record.parent_id) {
                return Err(StoreError::EntityNotFound {
                    entity: record.parent_id,
                });
            }
            let key = AttributeKey::from_parts(record.key_type.clone(), record.key_value.clone());
            let stored: StoredValue = self
                .registry
                .decode_value(&record.value_type_tag, &record.value_bytes)?;
            if attributes.insert((record.parent_id, key.clone()), stored).is_some() {
                return Err(StoreError::DuplicateKey {
                    entity: record.parent_id,
                    key,
                });
            }
        }

        let current_next = self.allocator.next_raw();
        if snapshot.next_id < current_next {
            warn!(
                snapshot_next = snapshot.next_id,
                current_next, "snapshot is older than this store's allocator; keeping the allocator"
            );
        }
        self.allocator = IdentityAllocator::resume_from(snapshot.next_id.max(current_next));
        self.next_sequence = self.next_sequence.max(snapshot.next_sequence);
        self.entities = entities;
        self.attributes = attributes;
        info!(
            entities = self.entities.len(),
            attributes = self.attributes.len(),
            "store restored from snapshot"
        );
        Ok(())
    }
}

impl Store {
    fn check_no_ownership_reversal(
        &self,
        restored: &BTreeMap<EntityId, EntityRecord>,
    ) -> Result<(), StoreError> {
        for (id, live) in &self.entities {
            if live.ownership.class() == OwnershipClass::Owned {
                continue;
            }
            let reason = match restored.get(id) {
                Some(record) if record.ownership == live.ownership => continue,
                Some(record) => format!(
                    "snapshot would move it from {} to {}",
                    live.ownership.class(),
                    record.ownership.class()
                ),
                None if live.ownership.class() == OwnershipClass::Immutable => {
                    "snapshot would delete an immutable entity".to_owned()
                }
                None => continue,
            };
            warn!(entity = %id, %reason, "restore refused");
            return Err(StoreError::OwnershipViolation {
                entity: *id,
                reason,
            });
        }
        Ok(())
    }
}

fn check_acyclic(entities: &BTreeMap<EntityId, EntityRecord>) -> Result<(), StoreError> {
    let mut settled: BTreeSet<EntityId> = BTreeSet::new();
    for &start in entities.keys() {
        let mut chain = BTreeSet::new();
        let mut current = Some(start);
        while let Some(id) = current {
            if settled.contains(&id) {
                break;
            }
            if !chain.insert(id) {
                return Err(StoreError::OwnershipViolation {
                    entity: id,
                    reason: "snapshot nesting contains a cycle".to_owned(),
                });
            }
            current = entities.get(&id).and_then(|r| r.ownership.parent());
        }
        settled.extend(chain);
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StoreConfig;
    use crate::entity::Holder;
    use crate::store::UnitContext;

    #[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
    struct Health(u32);

    fn open() -> (Store, Capability) {
        let (mut store, cap) = Store::open(StoreConfig::default()).unwrap();
        store.register_attribute::<Health>("health").unwrap();
        (store, cap)
    }

    fn populate(store: &mut Store) -> EntityId {
        store
            .execute(UnitContext::independent(Holder(1), 0), |unit| {
                let e = unit.create_entity("thing");
                unit.add(e, "health", Health(7))?;
                Ok(e)
            })
            .unwrap()
            .into_value()
    }

    #[test]
    fn capture_lists_records_separately() {
        let (mut store, _cap) = open();
        let e = populate(&mut store);
        let snap = store.capture_snapshot().unwrap();

        assert_eq!(snap.entities.len(), 1);
        assert_eq!(snap.attributes.len(), 1);
        let attr = &snap.attributes[0];
        assert_eq!(attr.parent_id, e);
        assert_eq!(attr.key_type, "string");
        assert_eq!(attr.value_type_tag, "health");
        assert_eq!(attr.value_bytes, b"7");
        assert_eq!(snap.next_id, e.to_raw() + 1);
    }

    #[test]
    fn cyclic_nesting_is_rejected() {
        let (mut store, _cap) = open();
        let a = populate(&mut store);
        let b = populate(&mut store);
        let mut snap = store.capture_snapshot().unwrap();
        snap.entities[0].ownership = Ownership::Nested { parent: b };
        snap.entities[1].ownership = Ownership::Nested { parent: a };

        let (mut target, cap) = open();
        let err = target.restore_from_snapshot(&cap, &snap).unwrap_err();
        assert!(matches!(err, StoreError::OwnershipViolation { .. }));
        assert_eq!(target.entity_count(), 0);
    }

    #[test]
    fn id_at_or_above_next_id_is_rejected() {
        let (mut store, _cap) = open();
        populate(&mut store);
        let mut snap = store.capture_snapshot().unwrap();
        snap.next_id = 0;

        let (mut target, cap) = open();
        assert!(matches!(
            target.restore_from_snapshot(&cap, &snap),
            Err(StoreError::InvalidSnapshot { .. })
        ));
    }

    #[test]
    fn malformed_json_is_an_invalid_snapshot() {
        assert!(matches!(
            StoreSnapshot::from_json("{\"entities\": 3}"),
            Err(StoreError::InvalidSnapshot { .. })
        ));
    }

    #[test]
    fn restore_requires_own_capability() {
        let (mut store, _cap) = open();
        populate(&mut store);
        let snap = store.capture_snapshot().unwrap();
        let (_other, foreign) = open();

        let (mut target, _cap) = open();
        assert_eq!(
            target.restore_from_snapshot(&foreign, &snap),
            Err(StoreError::Unauthorized)
        );
        assert_eq!(target.entity_count(), 0);
    }

    #[test]
    fn restore_cannot_unfreeze() {
        let (mut store, cap) = open();
        let e = populate(&mut store);
        let before_freeze = store.capture_snapshot().unwrap();
        store
            .execute(UnitContext::independent(Holder(1), 0), |unit| unit.freeze(e))
            .unwrap();
        let frozen = store.state_hash().unwrap();

        let err = store.restore_from_snapshot(&cap, &before_freeze).unwrap_err();
        assert!(matches!(err, StoreError::OwnershipViolation { entity, .. } if entity == e));
        assert_eq!(store.state_hash().unwrap(), frozen);
        assert_eq!(
            store.entity(e).map(|r| r.ownership.class()),
            Some(OwnershipClass::Immutable)
        );
    }

    #[test]
    fn restore_cannot_unshare_or_drop_a_frozen_entity() {
        let (mut store, cap) = open();
        let shared = populate(&mut store);
        let empty = store.capture_snapshot().unwrap();
        let frozen = store
            .execute(UnitContext::independent(Holder(1), 0), |unit| {
                unit.share(shared)?;
                let frozen = unit.create_entity("plaque");
                unit.freeze(frozen)?;
                Ok(frozen)
            })
            .unwrap()
            .into_value();
        let after = store.capture_snapshot().unwrap();

        // Shared back to owned.
        let err = store.restore_from_snapshot(&cap, &empty).unwrap_err();
        assert!(matches!(err, StoreError::OwnershipViolation { entity, .. } if entity == shared));

        // Same ownership, frozen entity missing.
        let mut dropped = after.clone();
        dropped.entities.retain(|r| r.id != frozen);
        let err = store.restore_from_snapshot(&cap, &dropped).unwrap_err();
        assert!(matches!(err, StoreError::OwnershipViolation { entity, .. } if entity == frozen));

        // Restoring the current image is always allowed.
        store.restore_from_snapshot(&cap, &after).unwrap();
    }
}
