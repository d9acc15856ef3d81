//! Execution units: the all-or-nothing transaction boundary.
//!
//! A [`Unit`] is opened by [`Store::execute`](crate::store::Store::execute)
//! and borrows the store mutably for its whole lifetime. Every mutation pushes
//! its inverse onto an undo log. When the unit ends it either commits (drops
//! the log and emits a [`UnitReceipt`]) or replays the log backwards so that
//! no partial effect survives.
//!
//! # Failure model
//!
//! There is no local recovery. The first failing operation poisons the unit;
//! from then on the unit will abort at its end even if the caller ignored the
//! error. Callers that need to branch should use the non-failing predicates
//! [`Unit::exists`] and [`Unit::exists_with_type`].
//!
//! # Budgets
//!
//! - **creation**: attribute records added, minus records removed;
//! - **access**: distinct `(entity, key)` pairs touched by `add`, `borrow`,
//!   `borrow_mut` and `remove`;
//! - **record size**: encoded size of one value, checked on `add` and again at
//!   commit for every value borrowed mutably.

use std::collections::{BTreeSet, HashSet};

use serde::Serialize;
use tracing::{debug, trace, warn};

use crate::attribute::{AttributeKey, StoredValue};
use crate::capability::Capability;
use crate::commitment::{Commitment, CommitmentLedger};
use crate::config::Budget;
use crate::entity::{EntityId, EntityRecord, Holder};
use crate::ownership::{ExecutionPath, Ownership, OwnershipClass};
use crate::receipt::{Change, Committed, UnitReceipt};
use crate::store::{Store, UnitContext};
use crate::StoreError;

// ---------------------------------------------------------------------------
// Undo log
// ---------------------------------------------------------------------------

/// The inverse of one applied mutation.
#[derive(Debug)]
enum Undo {
    EntityCreated(EntityId),
    /// Put back a deleted or modified entity record.
    EntityRestored(EntityRecord),
    AttributeInserted(EntityId, AttributeKey),
    /// Put back a removed or mutably borrowed attribute value.
    AttributeRestored(EntityId, AttributeKey, StoredValue),
}

// ---------------------------------------------------------------------------
// Unit
// ---------------------------------------------------------------------------

/// One execution unit against a [`Store`].
pub struct Unit<'s> {
    store: &'s mut Store,
    id: u64,
    ctx: UnitContext,
    sequence: Option<u64>,
    undo: Vec<Undo>,
    changes: Vec<Change>,
    created: usize,
    accessed: HashSet<(EntityId, AttributeKey)>,
    /// Attributes borrowed mutably; their pre-unit value is on the undo log.
    touched: BTreeSet<(EntityId, AttributeKey)>,
    commitments: CommitmentLedger,
    /// Entities whose registered migration is running; exempt from the
    /// version guard until it returns.
    migrating: Vec<EntityId>,
    poisoned: Option<StoreError>,
    finished: bool,
}

impl std::fmt::Debug for Unit<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Unit")
            .field("id", &self.id)
            .field("ctx", &self.ctx)
            .field("sequence", &self.sequence)
            .field("undo_len", &self.undo.len())
            .field("poisoned", &self.poisoned.is_some())
            .finish()
    }
}

impl<'s> Unit<'s> {
    pub(crate) fn open(
        store: &'s mut Store,
        id: u64,
        ctx: UnitContext,
        sequence: Option<u64>,
    ) -> Self {
        trace!(unit = id, sender = %ctx.sender, path = ?ctx.path, ?sequence, "unit opened");
        Self {
            store,
            id,
            ctx,
            sequence,
            undo: Vec::new(),
            changes: Vec::new(),
            created: 0,
            accessed: HashSet::new(),
            touched: BTreeSet::new(),
            commitments: CommitmentLedger::default(),
            migrating: Vec::new(),
            poisoned: None,
            finished: false,
        }
    }

    /// Store-assigned identifier of this unit.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Sender, path and timestamp the unit was opened with.
    pub fn context(&self) -> &UnitContext {
        &self.ctx
    }

    /// The holder this unit acts for.
    pub fn sender(&self) -> Holder {
        self.ctx.sender
    }

    /// Position in the total order, for sequenced units.
    pub fn sequence(&self) -> Option<u64> {
        self.sequence
    }

    /// Read-only view of the store as this unit currently sees it.
    pub fn store(&self) -> &Store {
        &*self.store
    }

    /// The record of a live entity, including this unit's uncommitted changes.
    pub fn entity(&self, entity: EntityId) -> Option<&EntityRecord> {
        self.store.entities.get(&entity)
    }

    /// Whether an operation has already failed; the unit will abort.
    pub fn is_poisoned(&self) -> bool {
        self.poisoned.is_some()
    }

    // -- identity ---------------------------------------------------------------

    /// Allocate a bare identifier. Never reissued, even if this unit aborts.
    pub fn allocate(&mut self) -> EntityId {
        self.store.allocator.allocate()
    }

    /// Create an entity owned by this unit's sender at the deployed schema
    /// version.
    pub fn create_entity(&mut self, type_tag: &str) -> EntityId {
        let id = self.store.allocator.allocate();
        let record = EntityRecord {
            id,
            type_tag: type_tag.to_owned(),
            created_at: self.ctx.timestamp_ms,
            ownership: Ownership::Owned {
                holder: self.ctx.sender,
            },
            schema_version: self.store.config.schema_version,
        };
        self.store.entities.insert(id, record);
        self.undo.push(Undo::EntityCreated(id));
        self.changes.push(Change::EntityCreated {
            entity: id,
            type_tag: type_tag.to_owned(),
        });
        trace!(unit = self.id, entity = %id, type_tag, "entity created");
        id
    }

    /// Delete an entity.
    ///
    /// Fails with [`StoreError::AttributesRemain`] if attributes or nested
    /// children are still attached, unless `cascade` is set, in which case
    /// they are removed too (children recursively).
    pub fn delete_entity(&mut self, entity: EntityId, cascade: bool) -> Result<(), StoreError> {
        let result = self.delete_entity_inner(entity, cascade);
        self.track(result)
    }

    fn delete_entity_inner(&mut self, entity: EntityId, cascade: bool) -> Result<(), StoreError> {
        self.guard_mutation(entity)?;
        let keys = self.store.keys_of(entity);
        let children = self.store.children_of(entity);
        if !cascade && (!keys.is_empty() || !children.is_empty()) {
            return Err(StoreError::AttributesRemain {
                entity,
                attributes: keys.len(),
                children: children.len(),
            });
        }
        self.purge(entity, keys, children);
        Ok(())
    }

    fn purge(&mut self, entity: EntityId, keys: Vec<AttributeKey>, children: Vec<EntityId>) {
        for child in children {
            let child_keys = self.store.keys_of(child);
            let grandchildren = self.store.children_of(child);
            self.purge(child, child_keys, grandchildren);
        }
        for key in keys {
            if let Some(stored) = self.store.attributes.remove(&(entity, key.clone())) {
                self.created = self.created.saturating_sub(1);
                self.touched.remove(&(entity, key.clone()));
                self.changes.push(Change::AttributeRemoved {
                    entity,
                    key: key.clone(),
                });
                self.undo.push(Undo::AttributeRestored(entity, key, stored));
            }
        }
        if let Some(record) = self.store.entities.remove(&entity) {
            self.undo.push(Undo::EntityRestored(record));
            self.changes.push(Change::EntityDeleted { entity });
            trace!(unit = self.id, entity = %entity, "entity deleted");
        }
    }

    // -- attributes -------------------------------------------------------------

    /// Attach `value` under `key`. Fails with [`StoreError::DuplicateKey`] if
    /// the key already holds a record.
    pub fn add<T>(
        &mut self,
        entity: EntityId,
        key: impl Into<AttributeKey>,
        value: T,
    ) -> Result<(), StoreError>
    where
        T: Serialize + Send + Sync + 'static,
    {
        let result = self.add_inner(entity, key.into(), value);
        self.track(result)
    }

    fn add_inner<T>(&mut self, entity: EntityId, key: AttributeKey, value: T) -> Result<(), StoreError>
    where
        T: Serialize + Send + Sync + 'static,
    {
        self.guard_mutation(entity)?;
        let type_id = self
            .store
            .registry
            .lookup::<T>()
            .ok_or_else(|| self.store.registry.unknown::<T>())?;
        self.count_access(entity, &key)?;
        if self.store.attributes.contains_key(&(entity, key.clone())) {
            return Err(StoreError::DuplicateKey { entity, key });
        }

        let encoded = serde_json::to_vec(&value).map_err(|e| StoreError::Serialization {
            details: e.to_string(),
        })?;
        self.check_record_size(encoded.len())?;
        let limit = self.store.config.budgets.max_created;
        if self.created >= limit {
            return Err(StoreError::CapacityExceeded {
                budget: Budget::Created,
                limit,
            });
        }

        self.created += 1;
        self.store.attributes.insert(
            (entity, key.clone()),
            StoredValue {
                type_id,
                value: Box::new(value),
            },
        );
        self.undo.push(Undo::AttributeInserted(entity, key.clone()));
        let type_tag = self.store.registry.tag_of(type_id).to_owned();
        trace!(unit = self.id, entity = %entity, %key, %type_tag, "attribute added");
        self.changes.push(Change::AttributeAdded {
            entity,
            key,
            type_tag,
        });
        Ok(())
    }

    /// Read the `T` stored under `key`.
    pub fn borrow<T: 'static>(
        &mut self,
        entity: EntityId,
        key: impl Into<AttributeKey>,
    ) -> Result<&T, StoreError> {
        let key = key.into();
        let checked = self.prepare_read::<T>(entity, &key);
        self.track(checked)?;
        let store = &*self.store;
        store
            .attributes
            .get(&(entity, key.clone()))
            .and_then(|stored| stored.value.downcast_ref::<T>())
            .ok_or_else(|| store.type_mismatch::<T>(entity, key))
    }

    /// Mutably borrow the `T` stored under `key`.
    ///
    /// Requires mutable access to the entity (see [`Unit::guard`]) on top of
    /// the checks done by [`borrow`](Self::borrow).
    pub fn borrow_mut<T: 'static>(
        &mut self,
        entity: EntityId,
        key: impl Into<AttributeKey>,
    ) -> Result<&mut T, StoreError> {
        let key = key.into();
        let prepared = self.prepare_write::<T>(entity, &key);
        self.track(prepared)?;
        match self
            .store
            .attributes
            .get_mut(&(entity, key.clone()))
            .and_then(|stored| stored.value.downcast_mut::<T>())
        {
            Some(value) => Ok(value),
            None => Err(StoreError::TypeMismatch {
                entity,
                key,
                stored: String::new(),
                requested: std::any::type_name::<T>().to_owned(),
            }),
        }
    }

    /// Detach and return the `T` stored under `key`. Frees a creation slot.
    pub fn remove<T: 'static>(
        &mut self,
        entity: EntityId,
        key: impl Into<AttributeKey>,
    ) -> Result<T, StoreError> {
        let result = self.remove_inner::<T>(entity, key.into());
        self.track(result)
    }

    fn remove_inner<T: 'static>(&mut self, entity: EntityId, key: AttributeKey) -> Result<T, StoreError> {
        self.guard_mutation(entity)?;
        self.store.check_typed::<T>(entity, &key)?;
        self.count_access(entity, &key)?;

        let map_key = (entity, key.clone());
        let backup = match self.store.attributes.get(&map_key) {
            Some(stored) => self.store.registry.clone_value(stored)?,
            None => return Err(StoreError::KeyNotFound { entity, key }),
        };
        let stored = self
            .store
            .attributes
            .remove(&map_key)
            .ok_or_else(|| StoreError::KeyNotFound {
                entity,
                key: key.clone(),
            })?;
        self.undo
            .push(Undo::AttributeRestored(entity, key.clone(), backup));
        self.created = self.created.saturating_sub(1);
        self.touched.remove(&map_key);
        self.changes.push(Change::AttributeRemoved {
            entity,
            key: key.clone(),
        });
        trace!(unit = self.id, entity = %entity, %key, "attribute removed");

        stored
            .value
            .downcast::<T>()
            .map(|boxed| *boxed)
            .map_err(|_| self.store.type_mismatch::<T>(entity, key))
    }

    /// Whether `key` holds a record on `entity`. Never fails, never counted.
    pub fn exists(&self, entity: EntityId, key: impl Into<AttributeKey>) -> bool {
        self.store.exists(entity, key)
    }

    /// Whether `key` holds a `T` on `entity`. Never fails, never counted.
    pub fn exists_with_type<T: 'static>(&self, entity: EntityId, key: impl Into<AttributeKey>) -> bool {
        self.store.exists_with_type::<T>(entity, key)
    }

    fn prepare_read<T: 'static>(&mut self, entity: EntityId, key: &AttributeKey) -> Result<(), StoreError> {
        self.store.check_typed::<T>(entity, key)?;
        self.count_access(entity, key)
    }

    fn prepare_write<T: 'static>(&mut self, entity: EntityId, key: &AttributeKey) -> Result<(), StoreError> {
        self.guard_mutation(entity)?;
        self.store.check_typed::<T>(entity, key)?;
        self.count_access(entity, key)?;

        let map_key = (entity, key.clone());
        if self.touched.contains(&map_key) {
            return Ok(());
        }
        let snapshot = match self.store.attributes.get(&map_key) {
            Some(stored) => self.store.registry.clone_value(stored)?,
            None => {
                return Err(StoreError::KeyNotFound {
                    entity,
                    key: key.clone(),
                })
            }
        };
        self.undo
            .push(Undo::AttributeRestored(entity, key.clone(), snapshot));
        self.changes.push(Change::AttributeMutated {
            entity,
            key: key.clone(),
        });
        self.touched.insert(map_key);
        Ok(())
    }

    fn count_access(&mut self, entity: EntityId, key: &AttributeKey) -> Result<(), StoreError> {
        let pair = (entity, key.clone());
        if self.accessed.contains(&pair) {
            return Ok(());
        }
        let limit = self.store.config.budgets.max_accessed;
        if self.accessed.len() >= limit {
            return Err(StoreError::CapacityExceeded {
                budget: Budget::Accessed,
                limit,
            });
        }
        self.accessed.insert(pair);
        Ok(())
    }

    fn check_record_size(&self, size: usize) -> Result<(), StoreError> {
        let limit = self.store.config.budgets.max_value_bytes;
        if size > limit {
            return Err(StoreError::CapacityExceeded {
                budget: Budget::RecordSize,
                limit,
            });
        }
        Ok(())
    }

    // -- ownership --------------------------------------------------------------

    /// Check that this unit may mutate `entity`: it exists, its access root
    /// permits this sender on this path, and it is at the deployed version.
    pub fn guard(&mut self, entity: EntityId) -> Result<(), StoreError> {
        let result = self.guard_mutation(entity);
        self.track(result)
    }

    fn guard_mutation(&self, entity: EntityId) -> Result<(), StoreError> {
        self.guard_access(entity)?;
        self.guard_version(entity)
    }

    fn guard_access(&self, entity: EntityId) -> Result<(), StoreError> {
        let root = self.store.access_root(entity)?;
        let denied = |reason: String| StoreError::OwnershipViolation { entity, reason };
        match root.class {
            OwnershipClass::Owned if root.holder == Some(self.ctx.sender) => Ok(()),
            OwnershipClass::Owned => Err(denied(format!(
                "{} does not hold {}",
                self.ctx.sender, root.root
            ))),
            OwnershipClass::Shared if self.ctx.path == ExecutionPath::Sequenced => Ok(()),
            OwnershipClass::Shared => Err(denied(format!(
                "shared entity {} requires the sequenced execution path",
                root.root
            ))),
            OwnershipClass::Immutable => Err(denied(format!("{} is immutable", root.root))),
            OwnershipClass::Nested => Err(denied("nesting chain has no root".to_owned())),
        }
    }

    fn guard_version(&self, entity: EntityId) -> Result<(), StoreError> {
        if self.migrating.contains(&entity) {
            return Ok(());
        }
        let record = self.record(entity)?;
        let deployed = self.store.config.schema_version;
        if record.schema_version != deployed {
            return Err(StoreError::VersionMismatch {
                entity: Some(entity),
                expected: deployed,
                found: record.schema_version,
            });
        }
        Ok(())
    }

    fn record(&self, entity: EntityId) -> Result<&EntityRecord, StoreError> {
        self.store
            .entities
            .get(&entity)
            .ok_or(StoreError::EntityNotFound { entity })
    }

    /// Hand an owned entity to a new holder.
    pub fn transfer(&mut self, entity: EntityId, holder: Holder) -> Result<(), StoreError> {
        let result = self.transition(entity, Ownership::Owned { holder });
        self.track(result)
    }

    /// Owned -> Shared. Irreversible.
    pub fn share(&mut self, entity: EntityId) -> Result<(), StoreError> {
        let result = self.transition(entity, Ownership::Shared);
        self.track(result)
    }

    /// Owned -> Immutable. Irreversible.
    pub fn freeze(&mut self, entity: EntityId) -> Result<(), StoreError> {
        let result = self.transition(entity, Ownership::Immutable);
        self.track(result)
    }

    /// Owned -> Nested under `parent`. Irreversible.
    pub fn nest(&mut self, entity: EntityId, parent: EntityId) -> Result<(), StoreError> {
        let result = self.nest_inner(entity, parent);
        self.track(result)
    }

    fn nest_inner(&mut self, entity: EntityId, parent: EntityId) -> Result<(), StoreError> {
        if !self.store.entities.contains_key(&parent) {
            return Err(StoreError::EntityNotFound { entity: parent });
        }
        if self.store.is_on_chain(parent, entity) {
            return Err(StoreError::OwnershipViolation {
                entity,
                reason: format!("nesting under {parent} would create a cycle"),
            });
        }
        self.guard_mutation(parent)?;
        self.transition(entity, Ownership::Nested { parent })
    }

    fn transition(&mut self, entity: EntityId, next: Ownership) -> Result<(), StoreError> {
        let prior = self.record(entity)?.clone();
        let (from, to) = (prior.class(), next.class());
        if !from.can_transition_to(to) {
            return Err(StoreError::OwnershipViolation {
                entity,
                reason: format!("{from} -> {to} is not a permitted transition"),
            });
        }
        if prior.ownership.holder() != Some(self.ctx.sender) {
            return Err(StoreError::OwnershipViolation {
                entity,
                reason: format!("{} does not hold {entity}", self.ctx.sender),
            });
        }
        self.guard_version(entity)?;

        if let Some(record) = self.store.entities.get_mut(&entity) {
            record.ownership = next.clone();
        }
        debug!(unit = self.id, entity = %entity, %from, %to, "ownership changed");
        self.changes.push(Change::OwnershipChanged {
            entity,
            from: prior.ownership.clone(),
            to: next,
        });
        self.undo.push(Undo::EntityRestored(prior));
        Ok(())
    }

    // -- versions ---------------------------------------------------------------

    /// Fail with [`StoreError::VersionMismatch`] unless `entity` is at
    /// `expected`.
    pub fn assert_version(&mut self, entity: EntityId, expected: u64) -> Result<(), StoreError> {
        let result = self.record(entity).and_then(|record| {
            if record.schema_version == expected {
                Ok(())
            } else {
                Err(StoreError::VersionMismatch {
                    entity: Some(entity),
                    expected,
                    found: record.schema_version,
                })
            }
        });
        self.track(result)
    }

    /// Move `entity` from schema version `from` to `to`, which must be
    /// `from + 1` and no later than the deployed version, then run the
    /// migration registered for its type tag, if any.
    pub fn migrate(&mut self, entity: EntityId, from: u64, to: u64) -> Result<(), StoreError> {
        let result = self.migrate_inner(entity, from, to);
        self.track(result)
    }

    fn migrate_inner(&mut self, entity: EntityId, from: u64, to: u64) -> Result<(), StoreError> {
        let prior = self.record(entity)?.clone();
        if prior.schema_version != from {
            return Err(StoreError::VersionMismatch {
                entity: Some(entity),
                expected: from,
                found: prior.schema_version,
            });
        }
        // No version follows u64::MAX.
        let next = from.checked_add(1).ok_or(StoreError::VersionMismatch {
            entity: Some(entity),
            expected: from,
            found: to,
        })?;
        if to != next {
            return Err(StoreError::VersionMismatch {
                entity: Some(entity),
                expected: next,
                found: to,
            });
        }
        let deployed = self.store.config.schema_version;
        if to > deployed {
            return Err(StoreError::VersionMismatch {
                entity: Some(entity),
                expected: deployed,
                found: to,
            });
        }
        self.guard_access(entity)?;

        if let Some(record) = self.store.entities.get_mut(&entity) {
            record.schema_version = to;
        }
        let type_tag = prior.type_tag.clone();
        self.undo.push(Undo::EntityRestored(prior));
        self.changes.push(Change::Migrated { entity, from, to });

        let migration = self.store.migrations.get(&(type_tag, to)).cloned();
        if let Some(migration) = migration {
            self.migrating.push(entity);
            let outcome = (*migration)(&mut *self, entity);
            self.migrating.pop();
            outcome?;
        }
        debug!(unit = self.id, entity = %entity, from, to, "entity migrated");
        Ok(())
    }

    // -- capability -------------------------------------------------------------

    /// Whether `capability` authorizes privileged operations on this store.
    pub fn check(&self, capability: &Capability) -> bool {
        self.store.authority().check(capability)
    }

    /// [`check`](Self::check) as a precondition; fails with
    /// [`StoreError::Unauthorized`].
    pub fn authorize(&mut self, capability: &Capability) -> Result<(), StoreError> {
        let result = self.store.authority().require(capability);
        self.track(result)
    }

    // -- commitments ------------------------------------------------------------

    /// Open a commitment for `op`. It must be passed to
    /// [`complete`](Self::complete) before the unit ends.
    pub fn begin(&mut self, op: &str) -> Commitment {
        trace!(unit = self.id, op, "commitment opened");
        self.commitments.begin(self.id, op)
    }

    /// Consume `token` and pass `result` through. A token from another unit,
    /// or a failing `result`, aborts the unit.
    pub fn complete<R>(
        &mut self,
        token: Commitment,
        result: Result<R, StoreError>,
    ) -> Result<R, StoreError> {
        let settled = self.commitments.settle(self.id, token);
        self.track(settled.and(result))
    }

    // -- end of unit ------------------------------------------------------------

    fn track<R>(&mut self, result: Result<R, StoreError>) -> Result<R, StoreError> {
        if let Err(err) = &result {
            if self.poisoned.is_none() {
                warn!(unit = self.id, error = %err, "operation failed; unit will abort");
                self.poisoned = Some(err.clone());
            }
        }
        result
    }

    pub(crate) fn finish<T>(
        mut self,
        outcome: Result<T, StoreError>,
    ) -> Result<Committed<T>, StoreError> {
        self.finished = true;
        let verdict = match (self.poisoned.take(), outcome) {
            (Some(err), _) | (None, Err(err)) => Err(err),
            (None, Ok(value)) => self.verify_commit().map(|()| value),
        };
        match verdict {
            Ok(value) => Ok(self.commit(value)),
            Err(err) => {
                self.rollback();
                warn!(unit = self.id, error = %err, "unit aborted; all effects discarded");
                Err(err)
            }
        }
    }

    fn verify_commit(&self) -> Result<(), StoreError> {
        let open = self.commitments.outstanding();
        if !open.is_empty() {
            return Err(StoreError::ProtocolViolation {
                detail: format!(
                    "{} commitment(s) left open: {}",
                    open.len(),
                    open.join(", ")
                ),
            });
        }
        for (entity, key) in &self.touched {
            if let Some(stored) = self.store.attributes.get(&(*entity, key.clone())) {
                let size = self.store.registry.encode_value(stored)?.len();
                self.check_record_size(size)?;
            }
        }
        Ok(())
    }

    fn commit<T>(&mut self, value: T) -> Committed<T> {
        self.undo.clear();
        let receipt = UnitReceipt {
            unit_id: self.id,
            sender: self.ctx.sender,
            path: self.ctx.path,
            sequence: self.sequence,
            timestamp_ms: self.ctx.timestamp_ms,
            created: self.created,
            accessed: self.accessed.len(),
            changes: std::mem::take(&mut self.changes),
        };
        debug!(
            unit = self.id,
            sequence = ?self.sequence,
            changes = receipt.changes.len(),
            created = receipt.created,
            accessed = receipt.accessed,
            "unit committed"
        );
        Committed { value, receipt }
    }

    fn rollback(&mut self) {
        let undo = std::mem::take(&mut self.undo);
        let steps = undo.len();
        for step in undo.into_iter().rev() {
            match step {
                Undo::EntityCreated(id) => {
                    self.store.entities.remove(&id);
                }
                Undo::EntityRestored(record) => {
                    self.store.entities.insert(record.id, record);
                }
                Undo::AttributeInserted(entity, key) => {
                    self.store.attributes.remove(&(entity, key));
                }
                Undo::AttributeRestored(entity, key, stored) => {
                    self.store.attributes.insert((entity, key), stored);
                }
            }
        }
        self.changes.clear();
        trace!(unit = self.id, steps, "unit rolled back");
    }
}

impl Drop for Unit<'_> {
    fn drop(&mut self) {
        if !self.finished {
            warn!(unit = self.id, "unit dropped before finishing; rolling back");
            self.rollback();
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{StoreConfig, UnitBudgets};

    #[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
    struct Health(u32);

    #[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
    struct Label(String);

    const ALICE: Holder = Holder(1);
    const BOB: Holder = Holder(2);

    fn open_with(budgets: UnitBudgets) -> Store {
        let (mut store, _cap) = Store::open(StoreConfig {
            budgets,
            ..StoreConfig::default()
        })
        .unwrap();
        store.register_attribute::<Health>("health").unwrap();
        store.register_attribute::<Label>("label").unwrap();
        store
    }

    fn open() -> Store {
        open_with(UnitBudgets::default())
    }

    fn as_alice() -> UnitContext {
        UnitContext::independent(ALICE, 100)
    }

    fn spawn(store: &mut Store) -> EntityId {
        store
            .execute(as_alice(), |unit| {
                let e = unit.create_entity("thing");
                unit.add(e, "health", Health(10))?;
                Ok(e)
            })
            .unwrap()
            .into_value()
    }

    #[test]
    fn ignored_error_still_aborts_unit() {
        let mut store = open();
        let e = spawn(&mut store);

        let result = store.execute(as_alice(), |unit| {
            unit.add(e, "label", Label("kept?".into()))?;
            // Swallow the failure; the unit is poisoned regardless.
            let _ = unit.add(e, "health", Health(1));
            assert!(unit.is_poisoned());
            Ok(())
        });

        assert!(matches!(result, Err(StoreError::DuplicateKey { .. })));
        assert!(!store.exists(e, "label"));
    }

    #[test]
    fn borrow_mut_rolls_back_on_abort() {
        let mut store = open();
        let e = spawn(&mut store);

        let result: Result<Committed<()>, _> = store.execute(as_alice(), |unit| {
            unit.borrow_mut::<Health>(e, "health")?.0 = 99;
            Err(StoreError::Unauthorized)
        });

        assert!(result.is_err());
        assert_eq!(store.peek::<Health>(e, "health").unwrap(), &Health(10));
    }

    #[test]
    fn remove_then_readd_rolls_back_to_original() {
        let mut store = open();
        let e = spawn(&mut store);

        let result: Result<Committed<()>, _> = store.execute(as_alice(), |unit| {
            unit.borrow_mut::<Health>(e, "health")?.0 = 50;
            let removed = unit.remove::<Health>(e, "health")?;
            assert_eq!(removed, Health(50));
            unit.add(e, "health", Health(70))?;
            unit.borrow_mut::<Health>(e, "health")?.0 = 71;
            Err(StoreError::ProtocolViolation {
                detail: "forced".into(),
            })
        });

        assert!(result.is_err());
        assert_eq!(store.peek::<Health>(e, "health").unwrap(), &Health(10));
    }

    #[test]
    fn receipt_lists_changes_in_order() {
        let mut store = open();
        let committed = store
            .execute(as_alice(), |unit| {
                let e = unit.create_entity("thing");
                unit.add(e, "health", Health(1))?;
                unit.borrow_mut::<Health>(e, "health")?.0 += 1;
                unit.borrow_mut::<Health>(e, "health")?.0 += 1;
                unit.freeze(e)?;
                Ok(e)
            })
            .unwrap();

        let e = committed.value;
        let kinds: Vec<&str> = committed
            .receipt
            .changes
            .iter()
            .map(|c| match c {
                Change::EntityCreated { .. } => "created",
                Change::AttributeAdded { .. } => "added",
                Change::AttributeMutated { .. } => "mutated",
                Change::OwnershipChanged { .. } => "ownership",
                _ => "other",
            })
            .collect();
        assert_eq!(kinds, vec!["created", "added", "mutated", "ownership"]);
        assert_eq!(committed.receipt.created, 1);
        assert_eq!(committed.receipt.accessed, 1);
        assert_eq!(committed.receipt.sequence, None);
        assert_eq!(store.peek::<Health>(e, "health").unwrap(), &Health(3));
    }

    #[test]
    fn access_budget_counts_distinct_pairs() {
        let mut store = open_with(UnitBudgets {
            max_accessed: 2,
            ..UnitBudgets::default()
        });
        let e = spawn(&mut store);

        store
            .execute(as_alice(), |unit| {
                for _ in 0..10 {
                    unit.borrow::<Health>(e, "health")?;
                }
                unit.add(e, "label", Label("x".into()))
            })
            .unwrap();

        let result = store.execute(as_alice(), |unit| {
            unit.borrow::<Health>(e, "health")?;
            unit.borrow::<Label>(e, "label")?;
            unit.add(e, 1u64, Health(0))
        });
        assert!(matches!(
            result,
            Err(StoreError::CapacityExceeded {
                budget: Budget::Accessed,
                limit: 2
            })
        ));
    }

    #[test]
    fn creation_budget_freed_by_remove() {
        let mut store = open_with(UnitBudgets {
            max_created: 2,
            ..UnitBudgets::default()
        });
        let e = spawn(&mut store);

        store
            .execute(as_alice(), |unit| {
                unit.add(e, 1u64, Health(1))?;
                unit.add(e, 2u64, Health(2))?;
                unit.remove::<Health>(e, 1u64)?;
                unit.add(e, 3u64, Health(3))
            })
            .unwrap();

        let result = store.execute(as_alice(), |unit| {
            unit.add(e, 4u64, Health(4))?;
            unit.add(e, 5u64, Health(5))?;
            unit.add(e, 6u64, Health(6))
        });
        assert!(matches!(
            result,
            Err(StoreError::CapacityExceeded {
                budget: Budget::Created,
                ..
            })
        ));
        assert!(!store.exists(e, 4u64));
    }

    #[test]
    fn record_size_checked_on_add_and_commit() {
        let mut store = open_with(UnitBudgets {
            max_value_bytes: 16,
            ..UnitBudgets::default()
        });
        let e = spawn(&mut store);

        let too_big = store.execute(as_alice(), |unit| {
            unit.add(e, "label", Label("a label that is far too long".into()))
        });
        assert!(matches!(
            too_big,
            Err(StoreError::CapacityExceeded {
                budget: Budget::RecordSize,
                ..
            })
        ));

        store
            .execute(as_alice(), |unit| unit.add(e, "label", Label("short".into())))
            .unwrap();
        let grown = store.execute(as_alice(), |unit| {
            unit.borrow_mut::<Label>(e, "label")?.0 = "grown far beyond the limit".into();
            Ok(())
        });
        assert!(matches!(
            grown,
            Err(StoreError::CapacityExceeded {
                budget: Budget::RecordSize,
                ..
            })
        ));
        assert_eq!(
            store.peek::<Label>(e, "label").unwrap(),
            &Label("short".into())
        );
    }

    #[test]
    fn non_holder_cannot_mutate() {
        let mut store = open();
        let e = spawn(&mut store);

        let result = store.execute(UnitContext::independent(BOB, 0), |unit| {
            unit.borrow::<Health>(e, "health")?;
            unit.borrow_mut::<Health>(e, "health").map(|_| ())
        });
        assert!(matches!(result, Err(StoreError::OwnershipViolation { .. })));
    }

    #[test]
    fn shared_requires_sequenced_path() {
        let mut store = open();
        let e = spawn(&mut store);
        store.execute(as_alice(), |unit| unit.share(e)).unwrap();

        let independent = store.execute(UnitContext::independent(BOB, 0), |unit| {
            unit.borrow_mut::<Health>(e, "health").map(|h| h.0 = 1)
        });
        assert!(matches!(
            independent,
            Err(StoreError::OwnershipViolation { .. })
        ));

        let sequenced = store
            .execute(UnitContext::sequenced(BOB, 0), |unit| {
                unit.borrow_mut::<Health>(e, "health").map(|h| h.0 = 2)
            })
            .unwrap();
        assert!(sequenced.receipt.sequence.is_some());
        assert_eq!(store.peek::<Health>(e, "health").unwrap(), &Health(2));
    }

    #[test]
    fn nested_entity_follows_parent_access() {
        let mut store = open();
        let parent = spawn(&mut store);
        let child = spawn(&mut store);
        store
            .execute(as_alice(), |unit| unit.nest(child, parent))
            .unwrap();

        // Parent holder may still mutate the child.
        store
            .execute(as_alice(), |unit| {
                unit.borrow_mut::<Health>(child, "health").map(|h| h.0 = 20)
            })
            .unwrap();

        // Handing the parent to Bob hands him the child's access too.
        store
            .execute(as_alice(), |unit| unit.transfer(parent, BOB))
            .unwrap();
        let alice_try = store.execute(as_alice(), |unit| {
            unit.borrow_mut::<Health>(child, "health").map(|_| ())
        });
        assert!(matches!(
            alice_try,
            Err(StoreError::OwnershipViolation { .. })
        ));
        store
            .execute(UnitContext::independent(BOB, 0), |unit| {
                unit.borrow_mut::<Health>(child, "health").map(|h| h.0 = 30)
            })
            .unwrap();

        // A frozen parent freezes everything nested beneath it.
        store
            .execute(UnitContext::independent(BOB, 0), |unit| unit.freeze(parent))
            .unwrap();
        let frozen = store.execute(UnitContext::independent(BOB, 0), |unit| {
            unit.borrow_mut::<Health>(child, "health").map(|_| ())
        });
        assert!(matches!(frozen, Err(StoreError::OwnershipViolation { .. })));
    }

    #[test]
    fn nest_rejects_cycles() {
        let mut store = open();
        let a = spawn(&mut store);
        let b = spawn(&mut store);
        store.execute(as_alice(), |unit| unit.nest(b, a)).unwrap();

        let cycle = store.execute(as_alice(), |unit| unit.nest(a, b));
        assert!(matches!(cycle, Err(StoreError::OwnershipViolation { .. })));
        let itself = store.execute(as_alice(), |unit| unit.nest(a, a));
        assert!(matches!(itself, Err(StoreError::OwnershipViolation { .. })));
    }

    #[test]
    fn delete_requires_cascade_when_attributes_remain() {
        let mut store = open();
        let parent = spawn(&mut store);
        let child = spawn(&mut store);
        store
            .execute(as_alice(), |unit| unit.nest(child, parent))
            .unwrap();

        let refused = store.execute(as_alice(), |unit| unit.delete_entity(parent, false));
        assert!(matches!(
            refused,
            Err(StoreError::AttributesRemain {
                attributes: 1,
                children: 1,
                ..
            })
        ));

        store
            .execute(as_alice(), |unit| unit.delete_entity(parent, true))
            .unwrap();
        assert!(store.entity(parent).is_none());
        assert!(store.entity(child).is_none());
        assert!(!store.exists(child, "health"));
    }

    #[test]
    fn migrate_past_last_version_is_a_mismatch() {
        let (mut store, cap) = Store::open(StoreConfig {
            schema_version: u64::MAX,
            ..StoreConfig::default()
        })
        .unwrap();
        let e = store
            .execute(as_alice(), |unit| Ok(unit.create_entity("thing")))
            .unwrap()
            .into_value();

        let result = store.execute(as_alice(), |unit| unit.migrate(e, u64::MAX, 0));
        assert!(matches!(
            result,
            Err(StoreError::VersionMismatch {
                expected: u64::MAX,
                found: 0,
                ..
            })
        ));
        assert_eq!(store.entity(e).unwrap().schema_version, u64::MAX);

        assert!(matches!(
            store.upgrade_schema(&cap, 0),
            Err(StoreError::VersionMismatch { entity: None, .. })
        ));
        assert_eq!(store.schema_version(), u64::MAX);
    }

    #[test]
    fn dropped_unit_rolls_back() {
        let mut store = open();
        let e = spawn(&mut store);
        {
            let mut unit = Unit::open(&mut store, 99, as_alice(), None);
            unit.borrow_mut::<Health>(e, "health").unwrap().0 = 0;
            unit.create_entity("orphan");
        }
        assert_eq!(store.peek::<Health>(e, "health").unwrap(), &Health(10));
        assert_eq!(store.entity_count(), 1);
    }

    #[test]
    fn commitment_left_open_aborts() {
        let mut store = open();
        let e = spawn(&mut store);

        let result = store.execute(as_alice(), |unit| {
            let token = unit.begin("reserve");
            unit.add(e, "label", Label("reserved".into()))?;
            std::mem::drop(token);
            Ok(())
        });
        assert!(matches!(result, Err(StoreError::ProtocolViolation { .. })));
        assert!(!store.exists(e, "label"));

        store
            .execute(as_alice(), |unit| {
                let token = unit.begin("reserve");
                let applied = unit.add(e, "label", Label("reserved".into()));
                unit.complete(token, applied)
            })
            .unwrap();
        assert!(store.exists(e, "label"));
    }
}
