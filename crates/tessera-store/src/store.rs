//! The [`Store`] is the top-level container. It owns the identity allocator,
//! the attribute registry, every entity record and attribute record, the
//! registered migrations and the capability authority.
//!
//! All mutation happens inside an execution unit opened with
//! [`Store::execute`]. The read-only accessors here never touch budgets.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::info;

use crate::attribute::{AttributeKey, AttributeRegistry, AttributeTypeId, StoredValue};
use crate::capability::{Capability, CapabilityAuthority};
use crate::config::{StoreConfig, UnitBudgets};
use crate::entity::{EntityId, EntityRecord, Holder, IdentityAllocator};
use crate::ownership::{AccessRoot, ExecutionPath, Ownership, OwnershipClass};
use crate::receipt::Committed;
use crate::unit::Unit;
use crate::StoreError;

/// Data transformation run by [`Unit::migrate`] after an entity's version is
/// bumped. Runs inside the migrating unit.
pub type Migration =
    Arc<dyn Fn(&mut Unit<'_>, EntityId) -> Result<(), StoreError> + Send + Sync>;

// ---------------------------------------------------------------------------
// UnitContext
// ---------------------------------------------------------------------------

/// Who a unit runs for, on which path, and at what time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnitContext {
    pub sender: Holder,
    pub path: ExecutionPath,
    /// Recorded as `created_at` on entities created by the unit.
    pub timestamp_ms: u64,
}

impl UnitContext {
    /// Context for a unit on the independent path.
    pub fn independent(sender: Holder, timestamp_ms: u64) -> Self {
        Self {
            sender,
            path: ExecutionPath::Independent,
            timestamp_ms,
        }
    }

    /// Context for a unit on the sequenced path, which takes a place in the total order.
    pub fn sequenced(sender: Holder, timestamp_ms: u64) -> Self {
        Self {
            sender,
            path: ExecutionPath::Sequenced,
            timestamp_ms,
        }
    }
}

// ---------------------------------------------------------------------------
// Store
// ---------------------------------------------------------------------------

pub struct Store {
    pub(crate) config: StoreConfig,
    pub(crate) allocator: IdentityAllocator,
    pub(crate) registry: AttributeRegistry,
    pub(crate) entities: BTreeMap<EntityId, EntityRecord>,
    /// Keyed by `(parent, key)`, independent of the parent record.
    pub(crate) attributes: BTreeMap<(EntityId, AttributeKey), StoredValue>,
    pub(crate) migrations: HashMap<(String, u64), Migration>,
    authority: CapabilityAuthority,
    next_unit: u64,
    pub(crate) next_sequence: u64,
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store")
            .field("schema_version", &self.config.schema_version)
            .field("entity_count", &self.entities.len())
            .field("attribute_count", &self.attributes.len())
            .finish()
    }
}

impl Store {
    /// Open an empty store and mint its capability.
    ///
    /// The capability is returned exactly once, here.
    pub fn open(config: StoreConfig) -> Result<(Self, Capability), StoreError> {
        config.validate()?;
        let mut authority = CapabilityAuthority::new();
        let capability = authority.mint()?;
        info!(schema_version = config.schema_version, "store opened");
        let store = Self {
            config,
            allocator: IdentityAllocator::new(),
            registry: AttributeRegistry::new(),
            entities: BTreeMap::new(),
            attributes: BTreeMap::new(),
            migrations: HashMap::new(),
            authority,
            next_unit: 0,
            next_sequence: 0,
        };
        Ok((store, capability))
    }

    /// The configuration the store is running with.
    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    /// The deployed schema version.
    pub fn schema_version(&self) -> u64 {
        self.config.schema_version
    }

    /// Registered attribute value types.
    pub fn registry(&self) -> &AttributeRegistry {
        &self.registry
    }

    /// Register an attribute value type under `type_tag`.
    ///
    /// A type keeps the first tag it is registered with. Registering it
    /// again under a different tag fails with
    /// [`StoreError::TypeTagConflict`].
    pub fn register_attribute<T>(
        &mut self,
        type_tag: &str,
    ) -> Result<AttributeTypeId, StoreError>
    where
        T: Clone + Send + Sync + 'static + Serialize + DeserializeOwned,
    {
        self.registry.register::<T>(type_tag)
    }

    /// Register the data transformation that brings entities of `type_tag`
    /// to `to_version`. Replaces any previous registration.
    pub fn register_migration<F>(&mut self, type_tag: &str, to_version: u64, migration: F)
    where
        F: Fn(&mut Unit<'_>, EntityId) -> Result<(), StoreError> + Send + Sync + 'static,
    {
        self.migrations
            .insert((type_tag.to_owned(), to_version), Arc::new(migration));
    }

    // -- capability-gated operations ------------------------------------------

    /// Whether `capability` authorizes privileged operations on this store.
    pub fn check(&self, capability: &Capability) -> bool {
        self.authority.check(capability)
    }

    /// Deploy schema version `to`, which must be exactly one above the current.
    pub fn upgrade_schema(&mut self, capability: &Capability, to: u64) -> Result<(), StoreError> {
        self.authority.require(capability)?;
        let current = self.config.schema_version;
        let expected = current.checked_add(1).ok_or(StoreError::VersionMismatch {
            entity: None,
            expected: current,
            found: to,
        })?;
        if to != expected {
            return Err(StoreError::VersionMismatch {
                entity: None,
                expected,
                found: to,
            });
        }
        info!(from = self.config.schema_version, to, "schema upgraded");
        self.config.schema_version = to;
        Ok(())
    }

    /// Replace the per-unit budgets.
    pub fn set_budgets(
        &mut self,
        capability: &Capability,
        budgets: UnitBudgets,
    ) -> Result<(), StoreError> {
        self.authority.require(capability)?;
        let candidate = StoreConfig {
            budgets,
            ..self.config.clone()
        };
        candidate.validate()?;
        info!(budgets = ?candidate.budgets, "unit budgets replaced");
        self.config = candidate;
        Ok(())
    }

    pub(crate) fn authority(&self) -> &CapabilityAuthority {
        &self.authority
    }

    // -- execution units --------------------------------------------------------

    /// Run `f` as one execution unit.
    ///
    /// If `f` returns an error, if any operation inside it failed (even one
    /// whose error `f` ignored), or if a commitment is left open, every effect
    /// of the unit is rolled back and the first error is returned. Identifiers
    /// allocated by a rolled-back unit are not reissued.
    ///
    /// Sequenced units take the next position in the total order when opened.
    pub fn execute<T, F>(&mut self, ctx: UnitContext, f: F) -> Result<Committed<T>, StoreError>
    where
        F: FnOnce(&mut Unit<'_>) -> Result<T, StoreError>,
    {
        let unit_id = self.next_unit;
        self.next_unit += 1;
        let sequence = match ctx.path {
            ExecutionPath::Sequenced => {
                let seq = self.next_sequence;
                self.next_sequence += 1;
                Some(seq)
            }
            ExecutionPath::Independent => None,
        };

        let mut unit = Unit::open(self, unit_id, ctx, sequence);
        let outcome = f(&mut unit);
        unit.finish(outcome)
    }

    /// The cheapest execution path that can mutate every entity in `entities`.
    ///
    /// Unknown entities are ignored.
    pub fn route(&self, entities: &[EntityId]) -> ExecutionPath {
        let needs_sequencing = entities.iter().any(|&entity| {
            self.access_root(entity)
                .map(|root| root.class.required_path() == ExecutionPath::Sequenced)
                .unwrap_or(false)
        });
        if needs_sequencing {
            ExecutionPath::Sequenced
        } else {
            ExecutionPath::Independent
        }
    }

    /// Walk the nesting chain from `entity` to the entity that decides its
    /// access rights.
    pub fn access_root(&self, entity: EntityId) -> Result<AccessRoot, StoreError> {
        let mut current = self
            .entities
            .get(&entity)
            .ok_or(StoreError::EntityNotFound { entity })?;
        // Nesting is acyclic, so the chain is at most one link per entity.
        for _ in 0..=self.entities.len() {
            match &current.ownership {
                Ownership::Nested { parent } => {
                    current = self
                        .entities
                        .get(parent)
                        .ok_or(StoreError::EntityNotFound { entity: *parent })?;
                }
                other => {
                    return Ok(AccessRoot {
                        root: current.id,
                        class: other.class(),
                        holder: other.holder(),
                    });
                }
            }
        }
        Err(StoreError::OwnershipViolation {
            entity,
            reason: "nesting chain does not terminate".to_owned(),
        })
    }

    /// Whether `ancestor` appears on `entity`'s nesting chain (or is `entity`).
    pub(crate) fn is_on_chain(&self, entity: EntityId, ancestor: EntityId) -> bool {
        let mut current = Some(entity);
        for _ in 0..=self.entities.len() {
            match current {
                Some(id) if id == ancestor => return true,
                Some(id) => {
                    current = self.entities.get(&id).and_then(|r| r.ownership.parent());
                }
                None => return false,
            }
        }
        false
    }

    // -- read-only access -------------------------------------------------------

    /// The record of a live entity.
    pub fn entity(&self, entity: EntityId) -> Option<&EntityRecord> {
        self.entities.get(&entity)
    }

    /// Number of live entities.
    pub fn entity_count(&self) -> usize {
        self.entities.len()
    }

    /// Ids of every live entity, ascending.
    pub fn entity_ids(&self) -> Vec<EntityId> {
        self.entities.keys().copied().collect()
    }

    /// Ownership class of a live entity.
    pub fn ownership_class(&self, entity: EntityId) -> Option<OwnershipClass> {
        self.entities.get(&entity).map(|r| r.class())
    }

    /// Keys attached to `entity`, in key order.
    pub fn keys_of(&self, entity: EntityId) -> Vec<AttributeKey> {
        self.attributes
            .range((entity, AttributeKey::MIN)..)
            .take_while(|((owner, _), _)| *owner == entity)
            .map(|((_, key), _)| key.clone())
            .collect()
    }

    /// Number of attributes attached to `entity`.
    pub fn attribute_count(&self, entity: EntityId) -> usize {
        self.attributes
            .range((entity, AttributeKey::MIN)..)
            .take_while(|((owner, _), _)| *owner == entity)
            .count()
    }

    /// Entities nested directly under `parent`, ascending.
    pub fn children_of(&self, parent: EntityId) -> Vec<EntityId> {
        self.entities
            .values()
            .filter(|r| r.ownership.parent() == Some(parent))
            .map(|r| r.id)
            .collect()
    }

    /// Whether `key` exists on `entity`, whatever its type.
    pub fn exists(&self, entity: EntityId, key: impl Into<AttributeKey>) -> bool {
        self.attributes.contains_key(&(entity, key.into()))
    }

    /// Whether `key` exists on `entity` and holds a `T`.
    pub fn exists_with_type<T: 'static>(
        &self,
        entity: EntityId,
        key: impl Into<AttributeKey>,
    ) -> bool {
        match (
            self.attributes.get(&(entity, key.into())),
            self.registry.lookup::<T>(),
        ) {
            (Some(stored), Some(type_id)) => stored.type_id == type_id,
            _ => false,
        }
    }

    /// Read an attribute outside any unit, with the same checks as
    /// [`Unit::borrow`] but without budgets.
    pub fn peek<T: 'static>(
        &self,
        entity: EntityId,
        key: impl Into<AttributeKey>,
    ) -> Result<&T, StoreError> {
        let key = key.into();
        self.check_typed::<T>(entity, &key)?;
        self.attributes
            .get(&(entity, key.clone()))
            .and_then(|stored| stored.value.downcast_ref::<T>())
            .ok_or_else(|| self.type_mismatch::<T>(entity, key))
    }

    /// Existence and type check for a typed read.
    pub(crate) fn check_typed<T: 'static>(
        &self,
        entity: EntityId,
        key: &AttributeKey,
    ) -> Result<AttributeTypeId, StoreError> {
        if !self.entities.contains_key(&entity) {
            return Err(StoreError::EntityNotFound { entity });
        }
        let stored = self
            .attributes
            .get(&(entity, key.clone()))
            .ok_or_else(|| StoreError::KeyNotFound {
                entity,
                key: key.clone(),
            })?;
        match self.registry.lookup::<T>() {
            Some(type_id) if type_id == stored.type_id => Ok(type_id),
            _ => Err(self.type_mismatch::<T>(entity, key.clone())),
        }
    }

    pub(crate) fn type_mismatch<T: 'static>(
        &self,
        entity: EntityId,
        key: AttributeKey,
    ) -> StoreError {
        let stored = self
            .attributes
            .get(&(entity, key.clone()))
            .map(|s| self.registry.tag_of(s.type_id).to_owned())
            .unwrap_or_default();
        let requested = self
            .registry
            .lookup::<T>()
            .map(|id| self.registry.tag_of(id).to_owned())
            .unwrap_or_else(|| std::any::type_name::<T>().to_owned());
        StoreError::TypeMismatch {
            entity,
            key,
            stored,
            requested,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
