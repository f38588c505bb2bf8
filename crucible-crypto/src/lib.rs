//! Crypto adapters consumed by the rest of the workspace: an injectable RNG, streaming
//! hashes, RSA sign/verify, and P-256 ECDH/point-decompression. None of these wrap a
//! platform-specific API (no `BCrypt`/`Schannel`); callers depend on the traits/functions here,
//! backed by ordinary ecosystem crates.

mod ecdh;
mod hash;
mod rng;
mod rsa_adapter;

pub use ecdh::{calculate_y, P256KeyPair};
pub use hash::{HashAlg, StreamingHash};
pub use rng::{OsRng, Rng};
pub use rsa_adapter::{RsaHashAlg, RsaKeyPair, RsaPublicKeyHandle};
