//! Schema-driven JSON import: a batch of labeled instructions runs against a single
//! [`Txn`], so a whole subtree can be found, inserted, or removed atomically without the
//! caller statically knowing every `Entity` type involved. Meant to be driven from inside a
//! single `run_tx_exclusive` call -- an `Err` anywhere aborts the whole batch, and nothing
//! commits.
//!
//! A kind is named by a string (`"Note"`, `"SmtpMsgToSend"`, ...) rather than a Rust type, so
//! a [`KindCatalog`] maps those names to `KindId`/key policy at runtime. `j` labels bind an
//! instruction's resulting `ObjId` so a later instruction in the same batch can reference it as
//! a parent or remove target via `"$label"`.

use std::collections::HashMap;

use crucible_base::{err, not_found, Result};

use crate::entity::KindId;
use crate::key::{KeyPolicy, KeyValue};
use crate::objid::ObjId;
use crate::txn::Txn;

/// Maps the kind names import instructions carry to the `KindId`/key policy the untyped
/// `Txn::*_raw` methods need, and reads a `KeyValue` out of an instruction's `key` field.
pub trait KindCatalog: Send + Sync {
    fn kind_id(&self, name: &str) -> Option<KindId>;
    fn key_policy(&self, kind: KindId) -> Option<KeyPolicy>;
    /// Decode `key` (as given in an instruction's `key` field) into the `KeyValue` that kind's
    /// key policy expects. `None` if the JSON doesn't match the kind's key type.
    fn key_value(&self, kind: KindId, key: &serde_json::Value) -> Option<KeyValue>;
}

/// A simple in-memory catalog keyed by kind name, built once at startup and shared across
/// imports.
#[derive(Default)]
pub struct SimpleCatalog {
    kinds: HashMap<String, (KindId, Option<KeyPolicy>)>,
}

impl SimpleCatalog {
    pub fn new() -> SimpleCatalog {
        SimpleCatalog::default()
    }

    pub fn register(&mut self, name: &str, kind: KindId, key_policy: Option<KeyPolicy>) -> &mut Self {
        self.kinds.insert(name.to_string(), (kind, key_policy));
        self
    }
}

impl KindCatalog for SimpleCatalog {
    fn kind_id(&self, name: &str) -> Option<KindId> {
        self.kinds.get(name).map(|(k, _)| *k)
    }

    fn key_policy(&self, kind: KindId) -> Option<KeyPolicy> {
        self.kinds.values().find(|(k, _)| *k == kind).and_then(|(_, p)| *p)
    }

    fn key_value(&self, _kind: KindId, key: &serde_json::Value) -> Option<KeyValue> {
        json_to_key_value(key)
    }
}

fn json_to_key_value(key: &serde_json::Value) -> Option<KeyValue> {
    match key {
        serde_json::Value::String(s) => Some(KeyValue::Str(s.clone())),
        serde_json::Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Some(KeyValue::I64(i))
            } else {
                n.as_u64().map(KeyValue::U64)
            }
        }
        serde_json::Value::Array(bytes) => {
            let mut out = Vec::with_capacity(bytes.len());
            for b in bytes {
                out.push(b.as_u64()? as u8);
            }
            Some(KeyValue::Bytes(out))
        }
        _ => None,
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum ImportOp {
    Find,
    Insert,
    Remove,
}

/// One parsed instruction from an import batch: `{"i": "find"|"insert"|"remove", "j"?: label,
/// "e": entity}`.
struct ImportInstr {
    op: ImportOp,
    label: Option<String>,
    entity: serde_json::Value,
}

fn parse_instr(raw: &serde_json::Value) -> Result<ImportInstr> {
    let op = match raw.get("i").and_then(|v| v.as_str()) {
        Some("find") => ImportOp::Find,
        Some("insert") => ImportOp::Insert,
        Some("remove") => ImportOp::Remove,
        Some(other) => return Err(err(format!("import: unknown instruction {other:?}"))),
        None => return Err(err("import: instruction missing \"i\"")),
    };
    let label = raw.get("j").and_then(|v| v.as_str()).map(str::to_string);
    let entity = raw
        .get("e")
        .cloned()
        .ok_or_else(|| err("import: instruction missing \"e\""))?;
    Ok(ImportInstr { op, label, entity })
}

/// Resolves an `"e".parent` field, which is either `"$root"`, a literal `ObjId` string, or
/// `"$label"` referring to an earlier instruction's binding in this same batch.
fn resolve_parent(entity: &serde_json::Value, labels: &HashMap<String, ObjId>) -> Result<ObjId> {
    match entity.get("parent").and_then(|v| v.as_str()) {
        None | Some("$root") => Ok(ObjId::ROOT),
        Some(reference) if reference.starts_with('$') => labels
            .get(&reference[1..])
            .copied()
            .ok_or_else(|| not_found(format!("import: unbound label {reference:?}"))),
        Some(literal) => literal
            .parse()
            .map_err(|_| err(format!("import: bad parent id {literal:?}"))),
    }
}

fn resolve_target(entity: &serde_json::Value, labels: &HashMap<String, ObjId>) -> Result<ObjId> {
    let target = entity
        .get("target")
        .and_then(|v| v.as_str())
        .ok_or_else(|| err("import: remove instruction missing \"e\".target"))?;
    if let Some(reference) = target.strip_prefix('$') {
        return labels
            .get(reference)
            .copied()
            .ok_or_else(|| not_found(format!("import: unbound label {target:?}")));
    }
    target.parse().map_err(|_| err(format!("import: bad target id {target:?}")))
}

fn resolve_kind(entity: &serde_json::Value, catalog: &dyn KindCatalog) -> Result<KindId> {
    let name = entity
        .get("kind")
        .and_then(|v| v.as_str())
        .ok_or_else(|| err("import: instruction missing \"e\".kind"))?;
    catalog
        .kind_id(name)
        .ok_or_else(|| err(format!("import: unknown kind {name:?}")))
}

/// Runs one `find`/`insert`/`remove` instruction against `txn`, returning the `ObjId` its label
/// (if any) should bind to.
fn run_instr(txn: &mut Txn, catalog: &dyn KindCatalog, labels: &mut HashMap<String, ObjId>, instr: ImportInstr) -> Result<()> {
    match instr.op {
        ImportOp::Insert => {
            let kind = resolve_kind(&instr.entity, catalog)?;
            let parent = resolve_parent(&instr.entity, labels)?;
            let fields = instr
                .entity
                .get("fields")
                .cloned()
                .ok_or_else(|| err("import: insert instruction missing \"e\".fields"))?;
            let key = match (catalog.key_policy(kind), instr.entity.get("key")) {
                (Some(policy), Some(key_json)) => {
                    let kv = catalog
                        .key_value(kind, key_json)
                        .ok_or_else(|| err("import: key does not match kind's key type"))?;
                    Some((policy, kv))
                }
                _ => None,
            };
            let id = txn.insert_raw(parent, kind, key, fields)?;
            if let Some(label) = instr.label {
                labels.insert(label, id);
            }
        }
        ImportOp::Find => {
            let kind = resolve_kind(&instr.entity, catalog)?;
            let parent = resolve_parent(&instr.entity, labels)?;
            let policy = catalog
                .key_policy(kind)
                .ok_or_else(|| err("import: find instruction's kind has no key policy"))?;
            let key_json = instr
                .entity
                .get("key")
                .ok_or_else(|| err("import: find instruction missing \"e\".key"))?;
            let kv = catalog
                .key_value(kind, key_json)
                .ok_or_else(|| err("import: key does not match kind's key type"))?;
            let found = txn.find_raw(parent, kind, policy, &kv);
            if let Some(label) = instr.label {
                if let Some(id) = found {
                    labels.insert(label, id);
                }
            }
        }
        ImportOp::Remove => {
            let id = resolve_target(&instr.entity, labels)?;
            txn.remove_raw(id)?;
        }
    }
    Ok(())
}

/// Runs an entire import batch against `txn`. Instructions run in order; a `find` that comes up
/// empty simply leaves its label unbound (a later reference to it is then an error), everything
/// else aborts the whole batch on the first error by propagating it, leaving `txn`'s caller to
/// discard the transaction.
pub fn import(txn: &mut Txn, catalog: &dyn KindCatalog, instructions: &[serde_json::Value]) -> Result<HashMap<String, ObjId>> {
    let mut labels = HashMap::new();
    for raw in instructions {
        let instr = parse_instr(raw)?;
        run_instr(txn, catalog, &mut labels, instr)?;
    }
    Ok(labels)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::entity::Entity;
    use crate::txn::{EntityStore, StopSignal};
    use crucible_crypto::OsRng;
    use std::sync::Arc;
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
            serde_json::json!({"label": self.label, "body": self.body})
        }
        fn from_json(value: serde_json::Value) -> Result<Self> {
            Ok(Note {
                label: value["label"].as_str().unwrap_or_default().to_string(),
                body: value["body"].as_str().unwrap_or_default().to_string(),
            })
        }
    }

    fn catalog() -> SimpleCatalog {
        let mut c = SimpleCatalog::new();
        c.register("Note", Note::KIND, Note::key_policy());
        c
    }

    fn open_tmp() -> (tempfile::TempDir, EntityStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = EntityStore::open(dir.path(), Arc::new(OsRng)).unwrap();
        (dir, store)
    }

    #[test]
    fn insert_then_find_binds_labels() {
        let (_dir, store) = open_tmp();
        let catalog = catalog();
        let batch: Vec<serde_json::Value> = serde_json::from_str(
            r#"[
                {"i":"insert","j":"n1","e":{"kind":"Note","parent":"$root","key":"alpha","fields":{"label":"alpha","body":"one"}}},
                {"i":"find","j":"found","e":{"kind":"Note","parent":"$root","key":"ALPHA"}}
            ]"#,
        )
        .unwrap();
        let labels = store
            .run_tx_exclusive(|txn| import(txn, &catalog, &batch))
            .unwrap();
        assert_eq!(labels["n1"], labels["found"]);
    }

    #[test]
    fn insert_under_labeled_parent() {
        let (_dir, store) = open_tmp();
        let catalog = catalog();
        let batch: Vec<serde_json::Value> = serde_json::from_str(
            r#"[
                {"i":"insert","j":"parent","e":{"kind":"Note","parent":"$root","key":"root-note","fields":{"label":"root-note","body":""}}},
                {"i":"insert","j":"child","e":{"kind":"Note","parent":"$parent","key":"child-note","fields":{"label":"child-note","body":"nested"}}}
            ]"#,
        )
        .unwrap();
        let labels = store
            .run_tx_exclusive(|txn| import(txn, &catalog, &batch))
            .unwrap();
        let (_, json) = store
            .run_tx_exclusive(|txn| txn.load_raw(labels["child"]))
            .unwrap();
        assert_eq!(json["body"], "nested");
    }

    #[test]
    fn remove_by_label_then_reinsert_same_key() {
        let (_dir, store) = open_tmp();
        let catalog = catalog();
        let batch: Vec<serde_json::Value> = serde_json::from_str(
            r#"[
                {"i":"insert","j":"n1","e":{"kind":"Note","parent":"$root","key":"dup","fields":{"label":"dup","body":"first"}}},
                {"i":"remove","e":{"target":"$n1"}},
                {"i":"insert","j":"n2","e":{"kind":"Note","parent":"$root","key":"dup","fields":{"label":"dup","body":"second"}}}
            ]"#,
        )
        .unwrap();
        let labels = store
            .run_tx_exclusive(|txn| import(txn, &catalog, &batch))
            .unwrap();
        let (_, json) = store
            .run_tx_exclusive(|txn| txn.load_raw(labels["n2"]))
            .unwrap();
        assert_eq!(json["body"], "second");
    }

    #[test]
    fn unknown_kind_aborts_whole_batch() {
        let (_dir, store) = open_tmp();
        let catalog = catalog();
        let batch: Vec<serde_json::Value> = serde_json::from_str(
            r#"[
                {"i":"insert","j":"n1","e":{"kind":"Note","parent":"$root","key":"a","fields":{"label":"a","body":"x"}}},
                {"i":"insert","e":{"kind":"NoSuchKind","parent":"$root","fields":{}}}
            ]"#,
        )
        .unwrap();
        let result = store.run_tx_exclusive(|txn| import(txn, &catalog, &batch));
        assert!(result.is_err());
        store
            .run_tx_exclusive(|txn| {
                let kv = KeyValue::Str("a".to_string());
                assert!(txn.find_raw(ObjId::ROOT, Note::KIND, KeyPolicy::StrUniqueInsensitive, &kv).is_none());
                Ok(())
            })
            .unwrap();
    }
}
