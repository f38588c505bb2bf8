//! Key policies and key-to-byte-string encoding. A key's encoded form is a comparable byte
//! string; ordering on that byte string is the parent-scoped child ordering for the key's kind.

use crate::objid::ObjId;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum KeyPolicy {
    /// Unique under case-insensitive compare within the parent.
    StrUniqueInsensitive,
    /// Binary-unique within the parent.
    NonStrUnique,
    /// Not unique; children of the same parent may share the key. Ordered by `(key, entityId)`.
    NonStrMulti,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum KeyValue {
    Str(String),
    I64(i64),
    U64(u64),
    /// FILETIME-unit (100ns ticks since 1601-01-01) time key.
    Time(i64),
    Bytes(Vec<u8>),
}

/// Lower-cases and NFC-folds nothing beyond ASCII case (no locale/unicode tailoring is specified)
/// so `Str_Unique_Insensitive` uniqueness matches byte-for-byte after ASCII lower-casing.
fn encode_str_insensitive(s: &str) -> Vec<u8> {
    s.to_ascii_lowercase().into_bytes()
}

fn encode_scalar(v: &KeyValue) -> Vec<u8> {
    match v {
        KeyValue::Str(s) => s.clone().into_bytes(),
        KeyValue::I64(i) => {
            // Big-endian with the sign bit flipped so two's-complement order matches byte order.
            let flipped = (*i as u64) ^ (1u64 << 63);
            flipped.to_be_bytes().to_vec()
        }
        KeyValue::U64(u) => u.to_be_bytes().to_vec(),
        KeyValue::Time(filetime_units) => {
            let flipped = (*filetime_units as u64) ^ (1u64 << 63);
            flipped.to_be_bytes().to_vec()
        }
        KeyValue::Bytes(b) => b.clone(),
    }
}

/// Encode a key value under a policy, appending `entity_id` for `NonStrMulti` so the encoded
/// form is a total, unique order even among same-keyed siblings.
pub fn encode_key(policy: KeyPolicy, value: &KeyValue, entity_id: ObjId) -> Vec<u8> {
    match policy {
        KeyPolicy::StrUniqueInsensitive => match value {
            KeyValue::Str(s) => encode_str_insensitive(s),
            other => encode_scalar(other),
        },
        KeyPolicy::NonStrUnique => encode_scalar(value),
        KeyPolicy::NonStrMulti => {
            let mut out = encode_scalar(value);
            out.extend_from_slice(&entity_id.as_u128().to_be_bytes());
            out
        }
    }
}

/// Encode just the probe portion of a `NonStrMulti` key (without the entity id suffix), for
/// range-scanning `FindChildren(timeLo, timeHi)`.
pub fn encode_key_prefix(value: &KeyValue) -> Vec<u8> {
    encode_scalar(value)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn str_insensitive_folds_case() {
        let a = encode_key(
            KeyPolicy::StrUniqueInsensitive,
            &KeyValue::Str("Foo.Bar".into()),
            ObjId::NONE,
        );
        let b = encode_key(
            KeyPolicy::StrUniqueInsensitive,
            &KeyValue::Str("foo.bar".into()),
            ObjId::from_u128(9),
        );
        assert_eq!(a, b);
    }

    #[test]
    fn non_str_unique_orders_big_endian() {
        let lo = encode_key(KeyPolicy::NonStrUnique, &KeyValue::U64(1), ObjId::NONE);
        let hi = encode_key(KeyPolicy::NonStrUnique, &KeyValue::U64(2), ObjId::NONE);
        assert!(lo < hi);
    }

    #[test]
    fn non_str_multi_breaks_ties_by_entity_id() {
        let a = encode_key(KeyPolicy::NonStrMulti, &KeyValue::I64(5), ObjId::from_u128(10));
        let b = encode_key(KeyPolicy::NonStrMulti, &KeyValue::I64(5), ObjId::from_u128(20));
        assert_ne!(a, b);
        assert!(a.starts_with(&encode_key_prefix(&KeyValue::I64(5))));
        assert!(b.starts_with(&encode_key_prefix(&KeyValue::I64(5))));
    }

    #[test]
    fn signed_order_preserved_across_negative_boundary() {
        let neg = encode_key(KeyPolicy::NonStrUnique, &KeyValue::I64(-1), ObjId::NONE);
        let pos = encode_key(KeyPolicy::NonStrUnique, &KeyValue::I64(0), ObjId::NONE);
        assert!(neg < pos);
    }
}
