//! A transactional embedded entity store: a page-level object store ([`object_store`]) carrying
//! fixed-size `(file, offset)`-addressed frames with crash-safe write-plan commits, and a typed
//! entity layer ([`entity`], [`txn`]) on top that gives schema-driven entities a parent/child tree,
//! unique or ordered keys, and optimistic or exclusive transactions.
//!
//! `object_store.rs` talks to `std::fs::File` directly rather than through a backend trait; see
//! that module's doc comment for the write-ahead-log shape it generalizes from.

pub mod entity;
pub mod json;
pub mod key;
pub mod object_store;
pub mod objid;
pub mod txn;

pub use entity::{Entity, KindId, Loaded};
pub use json::{import, KindCatalog, SimpleCatalog};
pub use key::{KeyPolicy, KeyValue};
pub use object_store::{ObjectStore, ObjectStoreStats, ObjectStoreStatsSnapshot, NR_DATA_FILES};
pub use objid::ObjId;
pub use txn::{EntityStore, StopSignal, Txn};
