//! The typed entity layer's public vocabulary: `KindId`, the `Entity` trait a schema implements,
//! and `Loaded<E>` -- a value snapshot paired with the identity/version needed to `Update` or
//! `Remove` it inside a later transaction. See DESIGN.md for this layer's grounding.

use crate::key::{KeyPolicy, KeyValue};
use crate::objid::ObjId;
use crucible_base::Result;

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub struct KindId(pub u32);

/// A schema for one kind of entity. Implementors are plain value types; the store never holds
/// onto an implementor directly -- it round-trips through `to_json`/`from_json` at the object
/// store boundary, so the on-disk form is exactly the schema-driven JSON encoding asks for.
pub trait Entity: Sized {
    const KIND: KindId;

    /// `None` means this kind has no key field (it can still be found by id, just not by key).
    fn key_policy() -> Option<KeyPolicy> {
        None
    }

    /// The key field's current value, if this kind declares one.
    fn key_value(&self) -> Option<KeyValue> {
        None
    }

    fn to_json(&self) -> serde_json::Value;
    fn from_json(value: serde_json::Value) -> Result<Self>;
}

/// A value loaded (or just-inserted) inside a transaction, carrying the identity and version
/// needed to `Update` or `Remove` it later in the same transaction.
#[derive(Clone, Debug)]
pub struct Loaded<E> {
    pub entity_id: ObjId,
    pub parent_id: ObjId,
    pub(crate) version: u64,
    pub value: E,
}

impl<E> Loaded<E> {
    pub fn version(&self) -> u64 {
        self.version
    }
}

impl<E> std::ops::Deref for Loaded<E> {
    type Target = E;
    fn deref(&self) -> &E {
        &self.value
    }
}
