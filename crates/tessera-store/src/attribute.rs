//! Attribute keys, attribute type registration and type-erased values.
//!
//! Every value type stored as an attribute must be registered in an
//! [`AttributeRegistry`] under a string type tag. Registration produces an
//! [`AttributeTypeId`] that is recorded next to each stored value, plus a small
//! vtable of clone/encode/decode functions. Typed access always compares the
//! recorded id with the caller's type before a checked downcast.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::fmt;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::entity::EntityId;
use crate::StoreError;

/// A type-erased attribute value.
pub type ErasedValue = Box<dyn Any + Send + Sync>;

// ---------------------------------------------------------------------------
// AttributeKey
// ---------------------------------------------------------------------------

/// The `(key_type, key_value)` pair an attribute is stored under.
///
/// `key_value` is the canonical JSON encoding of the key, so two keys are equal
/// exactly when their type tags and encodings are equal.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AttributeKey {
    key_type: String,
    key_value: Vec<u8>,
}

impl AttributeKey {
    /// Smallest possible key; used as a range bound.
    pub(crate) const MIN: AttributeKey = AttributeKey {
        key_type: String::new(),
        key_value: Vec::new(),
    };

    /// Build a key from any serializable value under a caller-chosen key type.
    pub fn new<K: Serialize + ?Sized>(key_type: &str, key: &K) -> Result<Self, StoreError> {
        let key_value = serde_json::to_vec(key).map_err(|e| StoreError::Serialization {
            details: e.to_string(),
        })?;
        Ok(Self {
            key_type: key_type.to_owned(),
            key_value,
        })
    }

    pub(crate) fn from_parts(key_type: String, key_value: Vec<u8>) -> Self {
        Self {
            key_type,
            key_value,
        }
    }

    /// Name of the key's type.
    pub fn key_type(&self) -> &str {
        &self.key_type
    }

    /// Canonical JSON bytes of the key value.
    pub fn key_value(&self) -> &[u8] {
        &self.key_value
    }
}

impl From<&str> for AttributeKey {
    fn from(name: &str) -> Self {
        Self {
            key_type: "string".to_owned(),
            key_value: serde_json::Value::String(name.to_owned())
                .to_string()
                .into_bytes(),
        }
    }
}

impl From<String> for AttributeKey {
    fn from(name: String) -> Self {
        AttributeKey::from(name.as_str())
    }
}

impl From<u64> for AttributeKey {
    fn from(n: u64) -> Self {
        Self {
            key_type: "u64".to_owned(),
            key_value: n.to_string().into_bytes(),
        }
    }
}

impl From<EntityId> for AttributeKey {
    fn from(id: EntityId) -> Self {
        Self {
            key_type: "entity".to_owned(),
            key_value: id.to_raw().to_string().into_bytes(),
        }
    }
}

impl From<&AttributeKey> for AttributeKey {
    fn from(key: &AttributeKey) -> Self {
        key.clone()
    }
}

impl fmt::Display for AttributeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}",
            self.key_type,
            String::from_utf8_lossy(&self.key_value)
        )
    }
}

impl fmt::Debug for AttributeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "AttributeKey({self})")
    }
}

// ---------------------------------------------------------------------------
// AttributeTypeId / vtable
// ---------------------------------------------------------------------------

/// Opaque, lightweight identifier for a registered attribute value type.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AttributeTypeId(pub(crate) u32);

impl fmt::Debug for AttributeTypeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "AttributeTypeId({})", self.0)
    }
}

type CloneFn = fn(&(dyn Any + Send + Sync + 'static)) -> Option<ErasedValue>;
type EncodeFn = fn(&(dyn Any + Send + Sync + 'static)) -> Result<Vec<u8>, String>;
type DecodeFn = fn(&[u8]) -> Result<ErasedValue, String>;

fn clone_erased<T: Clone + Send + Sync + 'static>(
    value: &(dyn Any + Send + Sync + 'static),
) -> Option<ErasedValue> {
    value
        .downcast_ref::<T>()
        .map(|v| Box::new(v.clone()) as ErasedValue)
}

fn encode_erased<T: Serialize + 'static>(
    value: &(dyn Any + Send + Sync + 'static),
) -> Result<Vec<u8>, String> {
    let typed = value
        .downcast_ref::<T>()
        .ok_or_else(|| format!("value is not a {}", std::any::type_name::<T>()))?;
    serde_json::to_vec(typed).map_err(|e| e.to_string())
}

fn decode_erased<T: DeserializeOwned + Send + Sync + 'static>(
    bytes: &[u8],
) -> Result<ErasedValue, String> {
    let typed: T = serde_json::from_slice(bytes).map_err(|e| e.to_string())?;
    Ok(Box::new(typed))
}

/// Type-erased operations for one registered attribute type.
#[derive(Clone, Copy)]
pub(crate) struct AttributeVtable {
    clone: CloneFn,
    encode: EncodeFn,
    decode: DecodeFn,
}

impl AttributeVtable {
    fn new<T>() -> Self
    where
        T: Clone + Send + Sync + 'static + Serialize + DeserializeOwned,
    {
        Self {
            clone: clone_erased::<T>,
            encode: encode_erased::<T>,
            decode: decode_erased::<T>,
        }
    }
}

// ---------------------------------------------------------------------------
// AttributeInfo
// ---------------------------------------------------------------------------

/// Metadata about a registered attribute type.
#[derive(Clone)]
pub struct AttributeInfo {
    pub id: AttributeTypeId,
    /// The type tag recorded in persisted attribute records.
    pub type_tag: String,
    /// Rust `TypeId` for runtime type checking.
    pub type_id: TypeId,
    /// `std::any::type_name::<T>()`, for diagnostics only.
    pub rust_name: &'static str,
    pub(crate) vtable: AttributeVtable,
}

impl fmt::Debug for AttributeInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AttributeInfo")
            .field("id", &self.id)
            .field("type_tag", &self.type_tag)
            .field("rust_name", &self.rust_name)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// StoredValue
// ---------------------------------------------------------------------------

/// A live attribute value together with the type id recorded at creation.
pub(crate) struct StoredValue {
    pub type_id: AttributeTypeId,
    pub value: ErasedValue,
}

impl fmt::Debug for StoredValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StoredValue")
            .field("type_id", &self.type_id)
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// AttributeRegistry
// ---------------------------------------------------------------------------

/// Registry mapping Rust types to [`AttributeTypeId`]s and type tags.
///
/// Type and tag are bound one-to-one: registering a type again under the same
/// tag returns the existing id, and any other pairing is a conflict.
#[derive(Debug, Default)]
pub struct AttributeRegistry {
    by_type: HashMap<TypeId, AttributeTypeId>,
    by_tag: HashMap<String, AttributeTypeId>,
    infos: Vec<AttributeInfo>,
}

impl AttributeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `T` under `type_tag`.
    ///
    /// Returns [`StoreError::TypeTagConflict`] if the tag already names a
    /// different type, or if `T` is already registered under another tag.
    pub fn register<T>(&mut self, type_tag: &str) -> Result<AttributeTypeId, StoreError>
    where
        T: Clone + Send + Sync + 'static + Serialize + DeserializeOwned,
    {
        let rust_type_id = TypeId::of::<T>();
        if let Some(&existing) = self.by_type.get(&rust_type_id) {
            if self.tag_of(existing) == type_tag {
                return Ok(existing);
            }
            return Err(StoreError::TypeTagConflict {
                type_tag: type_tag.to_owned(),
            });
        }
        if self.by_tag.contains_key(type_tag) {
            return Err(StoreError::TypeTagConflict {
                type_tag: type_tag.to_owned(),
            });
        }

        let id = AttributeTypeId(self.infos.len() as u32);
        self.infos.push(AttributeInfo {
            id,
            type_tag: type_tag.to_owned(),
            type_id: rust_type_id,
            rust_name: std::any::type_name::<T>(),
            vtable: AttributeVtable::new::<T>(),
        });
        self.by_type.insert(rust_type_id, id);
        self.by_tag.insert(type_tag.to_owned(), id);
        tracing::trace!(
            type_tag,
            rust_name = std::any::type_name::<T>(),
            "attribute type registered"
        );
        Ok(id)
    }

    /// Look up an attribute type by its Rust `TypeId`.
    pub fn lookup<T: 'static>(&self) -> Option<AttributeTypeId> {
        self.by_type.get(&TypeId::of::<T>()).copied()
    }

    /// Look up an attribute type by its type tag.
    pub fn lookup_by_tag(&self, type_tag: &str) -> Option<AttributeTypeId> {
        self.by_tag.get(type_tag).copied()
    }

    /// Registration details for `id`.
    pub fn get_info(&self, id: AttributeTypeId) -> Option<&AttributeInfo> {
        self.infos.get(id.0 as usize)
    }

    /// The type tag for `id`, or `"<unregistered>"`.
    pub fn tag_of(&self, id: AttributeTypeId) -> &str {
        self.get_info(id)
            .map(|info| info.type_tag.as_str())
            .unwrap_or("<unregistered>")
    }

    /// Number of registered types.
    pub fn len(&self) -> usize {
        self.infos.len()
    }

    pub fn is_empty(&self) -> bool {
        self.infos.is_empty()
    }

    /// Returns all registered type tags, sorted.
    pub fn registered_tags(&self) -> Vec<&str> {
        let mut tags: Vec<&str> = self.by_tag.keys().map(|s| s.as_str()).collect();
        tags.sort();
        tags
    }

    /// Error for a Rust type that was never registered.
    pub(crate) fn unknown<T: 'static>(&self) -> StoreError {
        StoreError::UnknownType {
            type_name: std::any::type_name::<T>().to_owned(),
            registered: self.registered_tags().join(", "),
        }
    }

    fn vtable(&self, id: AttributeTypeId) -> Result<AttributeVtable, StoreError> {
        self.get_info(id)
            .map(|info| info.vtable)
            .ok_or_else(|| StoreError::UnknownType {
                type_name: format!("{id:?}"),
                registered: self.registered_tags().join(", "),
            })
    }

    /// Deep-copy a stored value through its registered clone function.
    pub(crate) fn clone_value(&self, stored: &StoredValue) -> Result<StoredValue, StoreError> {
        let vtable = self.vtable(stored.type_id)?;
        let value = (vtable.clone)(stored.value.as_ref()).ok_or_else(|| {
            StoreError::Serialization {
                details: format!(
                    "stored value does not match its recorded type '{}'",
                    self.tag_of(stored.type_id)
                ),
            }
        })?;
        Ok(StoredValue {
            type_id: stored.type_id,
            value,
        })
    }

    /// Encode a stored value into its persisted bytes.
    pub(crate) fn encode_value(&self, stored: &StoredValue) -> Result<Vec<u8>, StoreError> {
        let vtable = self.vtable(stored.type_id)?;
        (vtable.encode)(stored.value.as_ref())
            .map_err(|details| StoreError::Serialization { details })
    }

    /// Decode persisted bytes recorded under `type_tag`.
    pub(crate) fn decode_value(
        &self,
        type_tag: &str,
        bytes: &[u8],
    ) -> Result<StoredValue, StoreError> {
        let type_id = self
            .lookup_by_tag(type_tag)
            .ok_or_else(|| StoreError::UnknownType {
                type_name: type_tag.to_owned(),
                registered: self.registered_tags().join(", "),
            })?;
        let vtable = self.vtable(type_id)?;
        let value = (vtable.decode)(bytes).map_err(|details| StoreError::Serialization {
            details: format!("attribute type '{type_tag}': {details}"),
        })?;
        Ok(StoredValue { type_id, value })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
