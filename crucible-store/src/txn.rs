//! The transactional entity layer: `EntityStore` wraps an [`ObjectStore`] with an in-memory
//! index of entity metadata and parent/child/key relationships, and runs closures against that
//! index inside `RunTx` (optimistic, retried, escalating to exclusive on repeated conflict) or
//! `RunTxExclusive` (serialized against every other writer). The retry-then-escalate policy
//! mirrors the bounded-attempts-then-fallback shape `crucible-crypto`'s adapters use for
//! transient failures.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

use crucible_base::{cancelled, conflict, err, invariant, not_found, Result};
use crucible_crypto::Rng;

use crate::entity::{Entity, KindId, Loaded};
use crate::key::{encode_key, encode_key_prefix, KeyPolicy, KeyValue};
use crate::object_store::ObjectStore;
use crate::objid::ObjId;

/// How many times `RunTx` retries on an optimistic conflict before escalating to
/// `RunTxExclusive`.
const MAX_OPTIMISTIC_ATTEMPTS: u32 = 3;

/// A cooperative cancellation flag threaded through `RunTx`/`RunTxExclusive`, so a caller with a
/// deadline (or a shutdown in progress) can stop a transaction from being retried further.
#[derive(Default)]
pub struct StopSignal(AtomicBool);

impl StopSignal {
    pub fn new() -> StopSignal {
        StopSignal(AtomicBool::new(false))
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

#[derive(Clone, Debug)]
struct EntityMeta {
    kind: u32,
    parent_id: ObjId,
    key: Option<Vec<u8>>,
    version: u64,
}

#[derive(Clone, Default)]
struct StoreState {
    entities: HashMap<ObjId, EntityMeta>,
    children_by_parent: HashMap<ObjId, Vec<ObjId>>,
    keyed_children: HashMap<(ObjId, u32), std::collections::BTreeMap<Vec<u8>, Vec<ObjId>>>,
}

/// The on-disk body every object in the store carries: schema-agnostic metadata plus the
/// entity's own schema-driven JSON encoding.
#[derive(Debug, serde::Serialize, serde::Deserialize)]
struct Envelope {
    kind: u32,
    parent_id: ObjId,
    key: Option<Vec<u8>>,
    version: u64,
    payload_json: Vec<u8>,
}

enum IndexOp {
    Insert(ObjId, EntityMeta),
    Update(ObjId, EntityMeta),
    Remove(ObjId, EntityMeta),
}

fn apply_index_ops(live: &mut StoreState, ops: Vec<IndexOp>) {
    for op in ops {
        match op {
            IndexOp::Insert(id, meta) => {
                live.children_by_parent.entry(meta.parent_id).or_default().push(id);
                if let Some(k) = &meta.key {
                    live.keyed_children
                        .entry((meta.parent_id, meta.kind))
                        .or_default()
                        .entry(k.clone())
                        .or_default()
                        .push(id);
                }
                live.entities.insert(id, meta);
            }
            IndexOp::Update(id, meta) => {
                if let Some(old) = live.entities.get(&id).cloned() {
                    if old.key != meta.key {
                        if let Some(old_key) = &old.key {
                            if let Some(map) = live.keyed_children.get_mut(&(old.parent_id, old.kind)) {
                                if let Some(v) = map.get_mut(old_key) {
                                    v.retain(|&x| x != id);
                                    if v.is_empty() {
                                        map.remove(old_key);
                                    }
                                }
                            }
                        }
                        if let Some(new_key) = &meta.key {
                            live.keyed_children
                                .entry((meta.parent_id, meta.kind))
                                .or_default()
                                .entry(new_key.clone())
                                .or_default()
                                .push(id);
                        }
                    }
                }
                live.entities.insert(id, meta);
            }
            IndexOp::Remove(id, meta) => {
                if let Some(k) = &meta.key {
                    if let Some(map) = live.keyed_children.get_mut(&(meta.parent_id, meta.kind)) {
                        if let Some(v) = map.get_mut(k) {
                            v.retain(|&x| x != id);
                            if v.is_empty() {
                                map.remove(k);
                            }
                        }
                    }
                }
                if let Some(siblings) = live.children_by_parent.get_mut(&meta.parent_id) {
                    siblings.retain(|&x| x != id);
                }
                live.entities.remove(&id);
            }
        }
    }
}

pub struct EntityStore {
    objects: ObjectStore,
    state: RwLock<StoreState>,
    rng: Arc<dyn Rng>,
}

impl EntityStore {
    pub fn open(dir: impl Into<std::path::PathBuf>, rng: Arc<dyn Rng>) -> Result<EntityStore> {
        let objects = ObjectStore::open(dir, rng.clone())?;
        let mut state = StoreState::default();
        for id in objects.iter_ids() {
            let bytes = objects
                .get(id)?
                .ok_or_else(|| err("entity object vanished during startup scan"))?;
            let envelope: Envelope =
                rmp_serde::from_slice(&bytes).map_err(|e| err(format!("envelope decode: {e}")))?;
            let meta = EntityMeta {
                kind: envelope.kind,
                parent_id: envelope.parent_id,
                key: envelope.key,
                version: envelope.version,
            };
            apply_index_ops(&mut state, vec![IndexOp::Insert(id, meta)]);
        }
        Ok(EntityStore {
            objects,
            state: RwLock::new(state),
            rng,
        })
    }

    pub fn set_write_plan_test(&self, enable: bool, odds: u32) {
        self.objects.set_write_plan_test(enable, odds);
    }

    pub fn stats_snapshot(&self) -> crate::object_store::ObjectStoreStatsSnapshot {
        self.objects.stats_snapshot()
    }

    /// Runs `f` against an optimistic snapshot of the store. If the entities `f` read have
    /// changed by commit time, the closure is retried from a fresh snapshot; after
    /// `MAX_OPTIMISTIC_ATTEMPTS` failed attempts it escalates to `RunTxExclusive`.
    pub fn run_tx<T>(&self, stop: &StopSignal, mut f: impl FnMut(&mut Txn) -> Result<T>) -> Result<T> {
        let mut attempts = 0u32;
        loop {
            if stop.is_cancelled() {
                return Err(cancelled("transaction cancelled"));
            }
            self.objects.stats.try_run_tx_non_exclusive.fetch_add(1, Ordering::Relaxed);
            self.objects.stats.start_tx.fetch_add(1, Ordering::Relaxed);
            let snapshot = self.state.read().unwrap().clone();
            let mut txn = Txn::new(self, snapshot);
            let value = match f(&mut txn) {
                Ok(v) => v,
                Err(e) => {
                    self.objects.stats.abort_tx.fetch_add(1, Ordering::Relaxed);
                    return Err(e);
                }
            };
            let mut live = self.state.write().unwrap();
            if txn.conflicts_with(&live) {
                self.objects.stats.abort_tx.fetch_add(1, Ordering::Relaxed);
                drop(live);
                attempts += 1;
                if attempts >= MAX_OPTIMISTIC_ATTEMPTS {
                    self.objects.stats.non_exclusive_give_ups.fetch_add(1, Ordering::Relaxed);
                    return self.run_tx_exclusive(f);
                }
                continue;
            }
            self.objects.commit_batch(&txn.pending_puts, &txn.pending_removes)?;
            apply_index_ops(&mut live, txn.index_ops);
            drop(live);
            for action in txn.post_commit {
                action();
            }
            return Ok(value);
        }
    }

    /// Runs `f` holding the store's write lock for the whole closure, serializing against every
    /// other writer (optimistic or exclusive). Used directly for transactions expected to
    /// conflict often, and as `RunTx`'s fallback after repeated optimistic failure.
    pub fn run_tx_exclusive<T>(&self, mut f: impl FnMut(&mut Txn) -> Result<T>) -> Result<T> {
        self.objects.stats.run_tx_exclusive.fetch_add(1, Ordering::Relaxed);
        self.objects.stats.start_tx.fetch_add(1, Ordering::Relaxed);
        let mut live = self.state.write().unwrap();
        let snapshot = live.clone();
        let mut txn = Txn::new(self, snapshot);
        match f(&mut txn) {
            Ok(value) => {
                self.objects.commit_batch(&txn.pending_puts, &txn.pending_removes)?;
                apply_index_ops(&mut live, txn.index_ops);
                drop(live);
                for action in txn.post_commit {
                    action();
                }
                Ok(value)
            }
            Err(e) => {
                self.objects.stats.abort_tx.fetch_add(1, Ordering::Relaxed);
                Err(e)
            }
        }
    }
}

/// The context a transaction closure operates on: a working view of the store plus the set of
/// pending writes, accumulated read versions (for optimistic conflict detection), and
/// post-commit actions.
pub struct Txn<'a> {
    store: &'a EntityStore,
    snapshot: StoreState,
    read_versions: HashMap<ObjId, u64>,
    pending_puts: Vec<(ObjId, Vec<u8>)>,
    pending_removes: Vec<ObjId>,
    index_ops: Vec<IndexOp>,
    post_commit: Vec<Box<dyn FnOnce() + Send>>,
}

impl<'a> Txn<'a> {
    fn new(store: &'a EntityStore, snapshot: StoreState) -> Txn<'a> {
        Txn {
            store,
            snapshot,
            read_versions: HashMap::new(),
            pending_puts: Vec::new(),
            pending_removes: Vec::new(),
            index_ops: Vec::new(),
            post_commit: Vec::new(),
        }
    }

    fn conflicts_with(&self, live: &StoreState) -> bool {
        self.read_versions
            .iter()
            .any(|(id, version)| live.entities.get(id).map(|m| m.version) != Some(*version))
    }

    fn record_read(&mut self, id: ObjId) {
        let version = self.snapshot.entities.get(&id).map(|m| m.version).unwrap_or(0);
        self.read_versions.entry(id).or_insert(version);
    }

    fn key_exists(&self, parent_id: ObjId, kind: u32, encoded: &[u8]) -> bool {
        self.snapshot
            .keyed_children
            .get(&(parent_id, kind))
            .is_some_and(|m| m.contains_key(encoded))
    }

    fn insert_common<E: Entity>(&mut self, parent_id: ObjId, value: E) -> Result<Loaded<E>> {
        if !parent_id.is_root() {
            if !self.snapshot.entities.contains_key(&parent_id) {
                return Err(not_found("insert: parent does not exist"));
            }
            self.record_read(parent_id);
        }
        if let (Some(policy), Some(kv)) = (E::key_policy(), value.key_value()) {
            if matches!(policy, KeyPolicy::StrUniqueInsensitive | KeyPolicy::NonStrUnique) {
                let probe = encode_key(policy, &kv, ObjId::NONE);
                if self.key_exists(parent_id, E::KIND.0, &probe) {
                    return Err(conflict("insert: duplicate key under parent"));
                }
            }
        }
        let entity_id = ObjId::generate(self.store.rng.as_ref());
        let key_bytes = match (E::key_policy(), value.key_value()) {
            (Some(policy), Some(kv)) => Some(encode_key(policy, &kv, entity_id)),
            _ => None,
        };
        let payload_json = serde_json::to_vec(&value.to_json()).map_err(|e| err(format!("encode entity: {e}")))?;
        let envelope = Envelope {
            kind: E::KIND.0,
            parent_id,
            key: key_bytes.clone(),
            version: 1,
            payload_json,
        };
        let body = rmp_serde::to_vec(&envelope).map_err(|e| err(format!("encode envelope: {e}")))?;
        self.pending_puts.push((entity_id, body));
        let meta = EntityMeta {
            kind: E::KIND.0,
            parent_id,
            key: key_bytes,
            version: 1,
        };
        apply_index_ops(&mut self.snapshot, vec![IndexOp::Insert(entity_id, meta.clone())]);
        self.index_ops.push(IndexOp::Insert(entity_id, meta));
        Ok(Loaded {
            entity_id,
            parent_id,
            version: 1,
            value,
        })
    }

    /// Insert `value` under `parent_id`, re-checking that the parent still exists.
    pub fn insert_parent_exists<E: Entity>(&mut self, parent_id: ObjId, value: E) -> Result<Loaded<E>> {
        self.insert_common(parent_id, value)
    }

    /// Insert `value` under a parent already loaded earlier in this same transaction.
    pub fn insert_parent_loaded<E: Entity, P>(&mut self, parent: &Loaded<P>, value: E) -> Result<Loaded<E>> {
        invariant!(
            self.read_versions.contains_key(&parent.entity_id),
            "insert_parent_loaded: parent {} was not loaded in this transaction",
            parent.entity_id
        );
        self.insert_common(parent.entity_id, value)
    }

    pub fn load<E: Entity>(&mut self, id: ObjId) -> Result<Loaded<E>> {
        let meta = self
            .snapshot
            .entities
            .get(&id)
            .cloned()
            .ok_or_else(|| not_found("load: entity not found"))?;
        if meta.kind != E::KIND.0 {
            return Err(err("load: entity kind mismatch"));
        }
        self.record_read(id);
        let bytes = match self.pending_puts.iter().rev().find(|(pid, _)| *pid == id) {
            Some((_, bytes)) => bytes.clone(),
            None => self
                .store
                .objects
                .get(id)?
                .ok_or_else(|| not_found("load: entity object missing"))?,
        };
        let envelope: Envelope = rmp_serde::from_slice(&bytes).map_err(|e| err(format!("decode envelope: {e}")))?;
        let json: serde_json::Value =
            serde_json::from_slice(&envelope.payload_json).map_err(|e| err(format!("decode entity: {e}")))?;
        let value = E::from_json(json)?;
        Ok(Loaded {
            entity_id: id,
            parent_id: meta.parent_id,
            version: meta.version,
            value,
        })
    }

    pub fn update<E: Entity>(&mut self, loaded: &Loaded<E>, new_value: E) -> Result<()> {
        self.record_read(loaded.entity_id);
        let meta = self
            .snapshot
            .entities
            .get(&loaded.entity_id)
            .cloned()
            .ok_or_else(|| not_found("update: entity not found"))?;
        let new_key = match (E::key_policy(), new_value.key_value()) {
            (Some(policy), Some(kv)) => Some(encode_key(policy, &kv, loaded.entity_id)),
            _ => None,
        };
        if new_key != meta.key {
            if let (Some(policy), Some(nk)) = (E::key_policy(), &new_key) {
                if matches!(policy, KeyPolicy::StrUniqueInsensitive | KeyPolicy::NonStrUnique)
                    && self.key_exists(meta.parent_id, E::KIND.0, nk)
                {
                    return Err(conflict("update: duplicate key under parent"));
                }
            }
        }
        let payload_json =
            serde_json::to_vec(&new_value.to_json()).map_err(|e| err(format!("encode entity: {e}")))?;
        let new_version = meta.version + 1;
        let envelope = Envelope {
            kind: E::KIND.0,
            parent_id: meta.parent_id,
            key: new_key.clone(),
            version: new_version,
            payload_json,
        };
        let body = rmp_serde::to_vec(&envelope).map_err(|e| err(format!("encode envelope: {e}")))?;
        self.pending_puts.push((loaded.entity_id, body));
        let new_meta = EntityMeta {
            kind: E::KIND.0,
            parent_id: meta.parent_id,
            key: new_key,
            version: new_version,
        };
        apply_index_ops(&mut self.snapshot, vec![IndexOp::Update(loaded.entity_id, new_meta.clone())]);
        self.index_ops.push(IndexOp::Update(loaded.entity_id, new_meta));
        Ok(())
    }

    pub fn remove<E: Entity>(&mut self, loaded: &Loaded<E>) -> Result<()> {
        self.record_read(loaded.entity_id);
        if self
            .snapshot
            .children_by_parent
            .get(&loaded.entity_id)
            .is_some_and(|c| !c.is_empty())
        {
            return Err(err("remove: entity still has children, call remove_children first"));
        }
        let meta = self
            .snapshot
            .entities
            .get(&loaded.entity_id)
            .cloned()
            .ok_or_else(|| not_found("remove: entity not found"))?;
        self.pending_removes.push(loaded.entity_id);
        apply_index_ops(&mut self.snapshot, vec![IndexOp::Remove(loaded.entity_id, meta.clone())]);
        self.index_ops.push(IndexOp::Remove(loaded.entity_id, meta));
        Ok(())
    }

    /// Recursively removes every descendant of `parent_id` (depth-first), without requiring the
    /// caller to know each descendant's concrete entity type.
    pub fn remove_children(&mut self, parent_id: ObjId) -> Result<()> {
        let children = self.snapshot.children_by_parent.get(&parent_id).cloned().unwrap_or_default();
        for child in children {
            self.remove_children(child)?;
            self.record_read(child);
            if let Some(meta) = self.snapshot.entities.get(&child).cloned() {
                self.pending_removes.push(child);
                apply_index_ops(&mut self.snapshot, vec![IndexOp::Remove(child, meta.clone())]);
                self.index_ops.push(IndexOp::Remove(child, meta));
            }
        }
        Ok(())
    }

    pub fn find_child_id<E: Entity>(&mut self, parent_id: ObjId, kv: &KeyValue) -> Option<ObjId> {
        let policy = E::key_policy()?;
        let map = self.snapshot.keyed_children.get(&(parent_id, E::KIND.0))?;
        match policy {
            KeyPolicy::StrUniqueInsensitive | KeyPolicy::NonStrUnique => {
                let encoded = encode_key(policy, kv, ObjId::NONE);
                map.get(&encoded).and_then(|ids| ids.first().copied())
            }
            KeyPolicy::NonStrMulti => {
                let prefix = encode_key_prefix(kv);
                map.range(prefix.clone()..)
                    .find(|(k, _)| k.starts_with(&prefix))
                    .and_then(|(_, ids)| ids.first().copied())
            }
        }
    }

    pub fn find_child<E: Entity>(&mut self, parent_id: ObjId, kv: &KeyValue) -> Result<Option<Loaded<E>>> {
        match self.find_child_id::<E>(parent_id, kv) {
            Some(id) => self.load::<E>(id).map(Some),
            None => Ok(None),
        }
    }

    pub fn child_with_same_key_exists<E: Entity>(&self, parent_id: ObjId, kv: &KeyValue) -> bool {
        let Some(policy) = E::key_policy() else { return false };
        let probe = encode_key(policy, kv, ObjId::NONE);
        self.key_exists(parent_id, E::KIND.0, &probe)
    }

    /// Visits every direct child of `parent_id`, in no particular order, regardless of kind.
    pub fn enum_all_children(&mut self, parent_id: ObjId, mut f: impl FnMut(ObjId, KindId) -> bool) {
        let ids = self.snapshot.children_by_parent.get(&parent_id).cloned().unwrap_or_default();
        for id in ids {
            self.record_read(id);
            let kind = self.snapshot.entities.get(&id).map(|m| KindId(m.kind)).unwrap_or(KindId(0));
            if !f(id, kind) {
                break;
            }
        }
    }

    pub fn enum_all_children_of_kind<E: Entity>(
        &mut self,
        parent_id: ObjId,
        mut f: impl FnMut(Loaded<E>) -> bool,
    ) -> Result<()> {
        let ids: Vec<ObjId> = self
            .snapshot
            .children_by_parent
            .get(&parent_id)
            .cloned()
            .unwrap_or_default()
            .into_iter()
            .filter(|id| self.snapshot.entities.get(id).is_some_and(|m| m.kind == E::KIND.0))
            .collect();
        for id in ids {
            if !f(self.load::<E>(id)?) {
                break;
            }
        }
        Ok(())
    }

    /// Range-scans the keyed children of kind `E` under `parent_id` from `lo` (inclusive) up to
    /// `hi` (inclusive, or unbounded if `None`), in key order.
    pub fn find_children<E: Entity>(
        &mut self,
        parent_id: ObjId,
        lo: &KeyValue,
        hi: Option<&KeyValue>,
        mut f: impl FnMut(Loaded<E>) -> bool,
    ) -> Result<()> {
        let lo_bytes = encode_key_prefix(lo);
        let hi_bytes = hi.map(encode_key_prefix);
        let ids: Vec<ObjId> = {
            let Some(map) = self.snapshot.keyed_children.get(&(parent_id, E::KIND.0)) else {
                return Ok(());
            };
            map.range(lo_bytes.clone()..)
                .take_while(|(k, _)| match &hi_bytes {
                    Some(hi) => &k[..hi.len().min(k.len())] <= hi.as_slice(),
                    None => true,
                })
                .flat_map(|(_, ids)| ids.iter().copied())
                .collect()
        };
        for id in ids {
            if !f(self.load::<E>(id)?) {
                break;
            }
        }
        Ok(())
    }

    pub fn add_post_commit_action(&mut self, action: impl FnOnce() + Send + 'static) {
        self.post_commit.push(Box::new(action));
    }

    /// Untyped insert, for callers (the JSON import layer) that only know a kind by its
    /// `KindId` at runtime rather than as a static `Entity` type.
    pub fn insert_raw(
        &mut self,
        parent_id: ObjId,
        kind: KindId,
        key: Option<(KeyPolicy, KeyValue)>,
        json: serde_json::Value,
    ) -> Result<ObjId> {
        if !parent_id.is_root() {
            if !self.snapshot.entities.contains_key(&parent_id) {
                return Err(not_found("insert: parent does not exist"));
            }
            self.record_read(parent_id);
        }
        if let Some((policy, kv)) = &key {
            if matches!(policy, KeyPolicy::StrUniqueInsensitive | KeyPolicy::NonStrUnique) {
                let probe = encode_key(*policy, kv, ObjId::NONE);
                if self.key_exists(parent_id, kind.0, &probe) {
                    return Err(conflict("insert: duplicate key under parent"));
                }
            }
        }
        let entity_id = ObjId::generate(self.store.rng.as_ref());
        let key_bytes = key.map(|(policy, kv)| encode_key(policy, &kv, entity_id));
        let payload_json = serde_json::to_vec(&json).map_err(|e| err(format!("encode entity: {e}")))?;
        let envelope = Envelope {
            kind: kind.0,
            parent_id,
            key: key_bytes.clone(),
            version: 1,
            payload_json,
        };
        let body = rmp_serde::to_vec(&envelope).map_err(|e| err(format!("encode envelope: {e}")))?;
        self.pending_puts.push((entity_id, body));
        let meta = EntityMeta {
            kind: kind.0,
            parent_id,
            key: key_bytes,
            version: 1,
        };
        apply_index_ops(&mut self.snapshot, vec![IndexOp::Insert(entity_id, meta.clone())]);
        self.index_ops.push(IndexOp::Insert(entity_id, meta));
        Ok(entity_id)
    }

    /// Untyped lookup by parent-scoped key, for a kind known only by `KindId` at runtime.
    pub fn find_raw(&self, parent_id: ObjId, kind: KindId, policy: KeyPolicy, kv: &KeyValue) -> Option<ObjId> {
        let map = self.snapshot.keyed_children.get(&(parent_id, kind.0))?;
        match policy {
            KeyPolicy::StrUniqueInsensitive | KeyPolicy::NonStrUnique => {
                let encoded = encode_key(policy, kv, ObjId::NONE);
                map.get(&encoded).and_then(|ids| ids.first().copied())
            }
            KeyPolicy::NonStrMulti => {
                let prefix = encode_key_prefix(kv);
                map.range(prefix.clone()..)
                    .find(|(k, _)| k.starts_with(&prefix))
                    .and_then(|(_, ids)| ids.first().copied())
            }
        }
    }

    /// Untyped load: returns the entity's `KindId` and raw JSON payload without decoding through
    /// an `Entity` impl.
    pub fn load_raw(&mut self, id: ObjId) -> Result<(KindId, serde_json::Value)> {
        let meta = self
            .snapshot
            .entities
            .get(&id)
            .cloned()
            .ok_or_else(|| not_found("load: entity not found"))?;
        self.record_read(id);
        let bytes = match self.pending_puts.iter().rev().find(|(pid, _)| *pid == id) {
            Some((_, bytes)) => bytes.clone(),
            None => self
                .store
                .objects
                .get(id)?
                .ok_or_else(|| not_found("load: entity object missing"))?,
        };
        let envelope: Envelope = rmp_serde::from_slice(&bytes).map_err(|e| err(format!("decode envelope: {e}")))?;
        let json: serde_json::Value =
            serde_json::from_slice(&envelope.payload_json).map_err(|e| err(format!("decode entity: {e}")))?;
        Ok((KindId(meta.kind), json))
    }

    /// Untyped remove, for a kind known only by `KindId` at runtime.
    pub fn remove_raw(&mut self, id: ObjId) -> Result<()> {
        self.record_read(id);
        if self
            .snapshot
            .children_by_parent
            .get(&id)
            .is_some_and(|c| !c.is_empty())
        {
            return Err(err("remove: entity still has children, call remove_children first"));
        }
        let meta = self
            .snapshot
            .entities
            .get(&id)
            .cloned()
            .ok_or_else(|| not_found("remove: entity not found"))?;
        self.pending_removes.push(id);
        apply_index_ops(&mut self.snapshot, vec![IndexOp::Remove(id, meta.clone())]);
        self.index_ops.push(IndexOp::Remove(id, meta));
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crucible_crypto::OsRng;
    use test_log::test;

    #[derive(Clone, Debug, PartialEq)]
    struct Note {
        label: String,
        body: String,
    }

    impl Entity for Note {
        const KIND: KindId = KindId(1);

        fn key_policy() -> Option<KeyPolicy> {
            Some(KeyPolicy::StrUniqueInsensitive)
        }

        fn key_value(&self) -> Option<KeyValue> {
            Some(KeyValue::Str(self.label.clone()))
        }

        fn to_json(&self) -> serde_json::Value {
            serde_json::json!({ "label": self.label, "body": self.body })
        }

        fn from_json(value: serde_json::Value) -> Result<Self> {
            Ok(Note {
                label: value["label"].as_str().unwrap_or_default().to_string(),
                body: value["body"].as_str().unwrap_or_default().to_string(),
            })
        }
    }

    #[derive(Clone, Debug, PartialEq)]
    struct Tick {
        at: i64,
    }

    impl Entity for Tick {
        const KIND: KindId = KindId(2);

        fn key_policy() -> Option<KeyPolicy> {
            Some(KeyPolicy::NonStrMulti)
        }

        fn key_value(&self) -> Option<KeyValue> {
            Some(KeyValue::Time(self.at))
        }

        fn to_json(&self) -> serde_json::Value {
            serde_json::json!({ "at": self.at })
        }

        fn from_json(value: serde_json::Value) -> Result<Self> {
            Ok(Tick {
                at: value["at"].as_i64().unwrap_or_default(),
            })
        }
    }

    fn open_tmp() -> (tempfile::TempDir, EntityStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = EntityStore::open(dir.path(), Arc::new(OsRng)).unwrap();
        (dir, store)
    }

    #[test]
    fn insert_load_update_round_trip() {
        let (_dir, store) = open_tmp();
        let stop = StopSignal::new();
        let id = store
            .run_tx(&stop, |txn| {
                let note = txn.insert_parent_exists(
                    ObjId::ROOT,
                    Note { label: "a".into(), body: "first".into() },
                )?;
                Ok(note.entity_id)
            })
            .unwrap();

        store
            .run_tx(&stop, |txn| {
                let loaded = txn.load::<Note>(id)?;
                assert_eq!(loaded.version(), 1);
                txn.update(&loaded, Note { label: "a".into(), body: "second".into() })
            })
            .unwrap();

        store
            .run_tx(&stop, |txn| {
                let loaded = txn.load::<Note>(id)?;
                assert_eq!(loaded.value.body, "second");
                assert_eq!(loaded.version(), 2);
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn duplicate_key_insert_is_rejected() {
        let (_dir, store) = open_tmp();
        let stop = StopSignal::new();
        store
            .run_tx(&stop, |txn| {
                txn.insert_parent_exists(ObjId::ROOT, Note { label: "dup".into(), body: "one".into() })
            })
            .unwrap();
        let result = store.run_tx(&stop, |txn| {
            txn.insert_parent_exists(ObjId::ROOT, Note { label: "Dup".into(), body: "two".into() })
        });
        assert!(result.is_err());
    }

    #[test]
    fn find_child_matches_case_insensitively() {
        let (_dir, store) = open_tmp();
        let stop = StopSignal::new();
        store
            .run_tx(&stop, |txn| {
                txn.insert_parent_exists(ObjId::ROOT, Note { label: "Greeting".into(), body: "hi".into() })
            })
            .unwrap();
        let found = store
            .run_tx(&stop, |txn| txn.find_child::<Note>(ObjId::ROOT, &KeyValue::Str("greeting".into())))
            .unwrap();
        assert_eq!(found.unwrap().value.body, "hi");
    }

    #[test]
    fn remove_requires_children_removed_first() {
        let (_dir, store) = open_tmp();
        let stop = StopSignal::new();
        let parent_id = store
            .run_tx(&stop, |txn| {
                Ok(txn
                    .insert_parent_exists(ObjId::ROOT, Note { label: "p".into(), body: "parent".into() })?
                    .entity_id)
            })
            .unwrap();
        store
            .run_tx(&stop, |txn| {
                let parent = txn.load::<Note>(parent_id)?;
                txn.insert_parent_loaded(&parent, Tick { at: 1 })?;
                Ok(())
            })
            .unwrap();

        let result = store.run_tx(&stop, |txn| {
            let parent = txn.load::<Note>(parent_id)?;
            txn.remove(&parent)
        });
        assert!(result.is_err());

        store
            .run_tx(&stop, |txn| {
                txn.remove_children(parent_id)?;
                let parent = txn.load::<Note>(parent_id)?;
                txn.remove(&parent)
            })
            .unwrap();
        let gone = store.run_tx(&stop, |txn| Ok(txn.load::<Note>(parent_id).is_err())).unwrap();
        assert!(gone);
    }

    #[test]
    fn find_children_range_scan_orders_by_key() {
        let (_dir, store) = open_tmp();
        let stop = StopSignal::new();
        let parent_id = store
            .run_tx(&stop, |txn| {
                Ok(txn
                    .insert_parent_exists(ObjId::ROOT, Note { label: "root-note".into(), body: String::new() })?
                    .entity_id)
            })
            .unwrap();
        store
            .run_tx(&stop, |txn| {
                let parent = txn.load::<Note>(parent_id)?;
                for at in [30, 10, 20] {
                    txn.insert_parent_loaded(&parent, Tick { at })?;
                }
                Ok(())
            })
            .unwrap();

        let seen = store
            .run_tx(&stop, |txn| {
                let mut seen = Vec::new();
                txn.find_children::<Tick>(parent_id, &KeyValue::Time(0), None, |loaded| {
                    seen.push(loaded.value.at);
                    true
                })?;
                Ok(seen)
            })
            .unwrap();
        assert_eq!(seen, vec![10, 20, 30]);
    }

    #[test]
    fn an_interleaved_write_forces_a_retry() {
        let (_dir, store) = open_tmp();
        let stop = StopSignal::new();
        let id = store
            .run_tx(&stop, |txn| {
                Ok(txn
                    .insert_parent_exists(ObjId::ROOT, Note { label: "racer".into(), body: "0".into() })?
                    .entity_id)
            })
            .unwrap();

        let before = store.stats_snapshot();
        let interloper_ran = std::cell::Cell::new(false);
        let result = store.run_tx(&stop, |txn| {
            let loaded = txn.load::<Note>(id)?;
            if !interloper_ran.get() {
                interloper_ran.set(true);
                // Someone else commits a change to the same entity while this closure is
                // (conceptually) still reading its snapshot; the next conflict check must catch it.
                store.run_tx_exclusive(|inner| {
                    let other = inner.load::<Note>(id)?;
                    inner.update(&other, Note { label: "racer".into(), body: "interloper".into() })
                })?;
            }
            txn.update(&loaded, Note { label: "racer".into(), body: "mine".into() })
        });
        result.unwrap();
        let after = store.stats_snapshot();
        assert!(after.abort_tx > before.abort_tx, "the stale read should have been detected as a conflict");
        let value = store.run_tx(&stop, |txn| Ok(txn.load::<Note>(id)?.value.body)).unwrap();
        assert_eq!(value, "mine");
    }

    #[test]
    fn sequential_updates_each_see_the_prior_commit() {
        let (_dir, store) = open_tmp();
        let stop = StopSignal::new();
        let id = store
            .run_tx(&stop, |txn| {
                Ok(txn
                    .insert_parent_exists(ObjId::ROOT, Note { label: "counter".into(), body: "0".into() })?
                    .entity_id)
            })
            .unwrap();

        for _ in 0..5 {
            store
                .run_tx(&stop, |txn| {
                    let loaded = txn.load::<Note>(id)?;
                    let next: i64 = loaded.value.body.parse().unwrap_or(0) + 1;
                    txn.update(&loaded, Note { label: "counter".into(), body: next.to_string() })
                })
                .unwrap();
        }
        let value = store.run_tx(&stop, |txn| Ok(txn.load::<Note>(id)?.value.body)).unwrap();
        assert_eq!(value, "5");
    }

    #[test]
    fn stats_track_commits_and_aborts() {
        let (_dir, store) = open_tmp();
        let stop = StopSignal::new();
        store
            .run_tx(&stop, |txn| {
                txn.insert_parent_exists(ObjId::ROOT, Note { label: "s".into(), body: "x".into() })
            })
            .unwrap();
        let _ = store.run_tx(&stop, |txn| {
            txn.insert_parent_exists(ObjId::ROOT, Note { label: "s".into(), body: "y".into() })
        });
        let snapshot = store.stats_snapshot();
        assert!(snapshot.commit_tx >= 1);
        assert!(snapshot.abort_tx >= 1);
    }

    #[test]
    fn cancelled_stop_signal_short_circuits_run_tx() {
        let (_dir, store) = open_tmp();
        let stop = StopSignal::new();
        stop.cancel();
        let result = store.run_tx(&stop, |txn| {
            txn.insert_parent_exists(ObjId::ROOT, Note { label: "z".into(), body: "z".into() })
        });
        assert!(result.is_err());
    }
}
