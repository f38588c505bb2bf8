//! `ObjId`: a 128-bit opaque entity identifier with two reserved sentinels, `Root` (the implicit
//! parent of top-level category entities) and `None` (absent/unset reference fields).

use std::fmt;
use std::str::FromStr;

use crucible_base::{err, Result};
use crucible_crypto::Rng;
use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
pub struct ObjId(u128);

impl ObjId {
    pub const ROOT: ObjId = ObjId(0);
    pub const NONE: ObjId = ObjId(1);

    /// Draw a fresh id from the given RNG. Collisions against `ROOT`/`NONE` are astronomically
    /// unlikely but checked anyway since the sentinels must never be handed out as real ids.
    pub fn generate(rng: &dyn Rng) -> ObjId {
        loop {
            let v = rng.random_u128();
            if v != Self::ROOT.0 && v != Self::NONE.0 {
                return ObjId(v);
            }
        }
    }

    pub const fn from_u128(v: u128) -> ObjId {
        ObjId(v)
    }

    pub const fn as_u128(&self) -> u128 {
        self.0
    }

    pub const fn is_root(&self) -> bool {
        self.0 == Self::ROOT.0
    }

    pub const fn is_none(&self) -> bool {
        self.0 == Self::NONE.0
    }
}

impl Default for ObjId {
    fn default() -> Self {
        ObjId::NONE
    }
}

impl fmt::Display for ObjId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Self::ROOT => write!(f, "root"),
            Self::NONE => write!(f, "none"),
            ObjId(v) => write!(f, "{:032x}", v),
        }
    }
}

impl fmt::Debug for ObjId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ObjId({self})")
    }
}

impl FromStr for ObjId {
    type Err = crucible_base::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "root" => Ok(Self::ROOT),
            "none" => Ok(Self::NONE),
            _ => {
                let v = u128::from_str_radix(s, 16).map_err(|_| err(format!("bad ObjId: {s:?}")))?;
                Ok(ObjId(v))
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crucible_crypto::OsRng;

    #[test]
    fn string_round_trip() {
        let id = ObjId::generate(&OsRng);
        let s = id.to_string();
        assert_eq!(s.parse::<ObjId>().unwrap(), id);
        assert_eq!(ObjId::ROOT.to_string(), "root");
        assert_eq!("root".parse::<ObjId>().unwrap(), ObjId::ROOT);
    }

    #[test]
    fn generate_never_yields_sentinels() {
        let rng = OsRng;
        for _ in 0..10_000 {
            let id = ObjId::generate(&rng);
            assert!(!id.is_root());
            assert!(!id.is_none());
        }
    }
}
