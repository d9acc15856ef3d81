//! Tessera Store -- entity-attribute storage with ownership, schema versions
//! and all-or-nothing execution units.
//!
//! Entities are fixed-size records (`id`, `type_tag`, `created_at`,
//! ownership, schema version). Attributes are typed values attached to an
//! entity under an [`AttributeKey`](attribute::AttributeKey) and stored apart
//! from it, so an entity's record never grows with its attribute count.
//!
//! Every mutation runs inside a [`Unit`](unit::Unit) opened by
//! [`Store::execute`](store::Store::execute). A unit either commits all of
//! its effects or none of them.
//!
//! # Quick Start
//!
//! ```
//! use tessera_store::prelude::*;
//!
//! #[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
//! struct Health(u32);
//!
//! let (mut store, _capability) = Store::open(StoreConfig::default()).unwrap();
//! store.register_attribute::<Health>("health").unwrap();
//!
//! let alice = Holder(1);
//! let committed = store
//!     .execute(UnitContext::independent(alice, 0), |unit| {
//!         let e = unit.create_entity("character");
//!         unit.add(e, "health", Health(100))?;
//!         Ok(e)
//!     })
//!     .unwrap();
//!
//! let e = committed.value;
//! assert_eq!(store.peek::<Health>(e, "health").unwrap(), &Health(100));
//! ```

#![deny(unsafe_code)]

pub mod attribute;
pub mod capability;
pub mod commitment;
pub mod config;
pub mod entity;
pub mod ownership;
pub mod receipt;
pub mod snapshot;
pub mod store;
pub mod unit;

use attribute::AttributeKey;
use config::Budget;
use entity::EntityId;

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

/// Errors produced by store operations.
///
/// Inside a unit every one of these is fatal: the unit aborts at its end with
/// the first error raised and all of its effects are discarded.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    /// The entity does not exist (never created, or deleted).
    #[error("entity {entity} does not exist")]
    EntityNotFound { entity: EntityId },

    #[error("no attribute {key} on entity {entity}")]
    KeyNotFound { entity: EntityId, key: AttributeKey },

    #[error("attribute {key} already exists on entity {entity}")]
    DuplicateKey { entity: EntityId, key: AttributeKey },

    /// The stored value's type differs from the requested type.
    #[error("attribute {key} on entity {entity} holds '{stored}', not '{requested}'")]
    TypeMismatch {
        entity: EntityId,
        key: AttributeKey,
        stored: String,
        requested: String,
    },

    /// A value type was used that has not been registered.
    #[error("attribute type '{type_name}' not registered. Registered types: [{registered}]")]
    UnknownType {
        type_name: String,
        registered: String,
    },

    /// The tag names another type, or the type is registered under another tag.
    #[error("type tag '{type_tag}' conflicts with an existing registration")]
    TypeTagConflict { type_tag: String },

    /// A per-unit budget was exhausted.
    #[error("{budget} budget of {limit} exceeded")]
    CapacityExceeded { budget: Budget, limit: usize },

    #[error("ownership violation on entity {entity}: {reason}")]
    OwnershipViolation { entity: EntityId, reason: String },

    /// `entity` is `None` for store-level version errors.
    #[error("version mismatch on {entity:?}: expected {expected}, found {found}")]
    VersionMismatch {
        entity: Option<EntityId>,
        expected: u64,
        found: u64,
    },

    /// A commitment was left open or completed in the wrong unit.
    #[error("protocol violation: {detail}")]
    ProtocolViolation { detail: String },

    #[error("capability check failed")]
    Unauthorized,

    #[error("entity {entity} still has {attributes} attribute(s) and {children} nested child(ren)")]
    AttributesRemain {
        entity: EntityId,
        attributes: usize,
        children: usize,
    },

    #[error("serialization failed: {details}")]
    Serialization { details: String },

    /// A configuration no store can run with.
    #[error("invalid store config: {details}")]
    InvalidConfig { details: String },

    /// A snapshot that does not describe a consistent store.
    #[error("invalid snapshot: {details}")]
    InvalidSnapshot { details: String },
}

// ---------------------------------------------------------------------------
// Prelude
// ---------------------------------------------------------------------------

/// Convenience re-exports for common usage.
pub mod prelude {
    pub use crate::attribute::{AttributeKey, AttributeRegistry, AttributeTypeId};
    pub use crate::capability::{Capability, CapabilityAuthority};
    pub use crate::commitment::Commitment;
    pub use crate::config::{Budget, StoreConfig, UnitBudgets};
    pub use crate::entity::{EntityId, EntityRecord, Holder, IdentityAllocator};
    pub use crate::ownership::{AccessRoot, ExecutionPath, Ownership, OwnershipClass};
    pub use crate::receipt::{Change, Committed, UnitReceipt};
    pub use crate::snapshot::{AttributeRecord, StoreSnapshot};
    pub use crate::store::{Migration, Store, UnitContext};
    pub use crate::unit::Unit;
    pub use crate::StoreError;
}

// ---------------------------------------------------------------------------
// Integration Tests
// ---------------------------------------------------------------------------
