// ECDH P-256 capability: key pair generation, public blob export, and a scalar
// "CalculateY" used for point decompression (y = sqrt(x^3 + ax + b) mod p, parity chosen by a
// `y_odd` flag). Rather than a hand-rolled bignum library, this implementation uses the
// `p256` crate's own field arithmetic (see DESIGN.md's Open Question decision) -- the
// crate already appears in the wider example pack
// (`aptos-labs-aptos-core`, `MystenLabs-sui`, `denoland-deno`) for exactly this role.

use p256::ecdh::diffie_hellman;
use p256::elliptic_curve::sec1::{FromEncodedPoint, ToEncodedPoint};
use p256::{EncodedPoint, PublicKey, SecretKey};

use crucible_base::{err, Result};

pub struct P256KeyPair {
    secret: SecretKey,
}

impl P256KeyPair {
    pub fn generate() -> Self {
        let secret = SecretKey::random(&mut rand::rngs::OsRng);
        P256KeyPair { secret }
    }

    pub fn from_scalar_be_bytes(bytes: &[u8]) -> Result<Self> {
        let secret =
            SecretKey::from_slice(bytes).map_err(|e| err(format!("bad p256 scalar: {e}")))?;
        Ok(P256KeyPair { secret })
    }

    pub fn scalar_be_bytes(&self) -> Vec<u8> {
        self.secret.to_bytes().to_vec()
    }

    /// SEC1 public key blob, compressed or uncompressed.
    pub fn public_blob(&self, compressed: bool) -> Vec<u8> {
        self.secret
            .public_key()
            .to_encoded_point(compressed)
            .as_bytes()
            .to_vec()
    }

    pub fn diffie_hellman(&self, peer_public_blob: &[u8]) -> Result<Vec<u8>> {
        let point = EncodedPoint::from_bytes(peer_public_blob)
            .map_err(|e| err(format!("bad peer public key: {e}")))?;
        let peer_public = Option::<PublicKey>::from(PublicKey::from_encoded_point(&point))
            .ok_or_else(|| err("peer public key not on curve"))?;
        let shared = diffie_hellman(self.secret.to_nonzero_scalar(), peer_public.as_affine());
        Ok(shared.raw_secret_bytes().to_vec())
    }
}

/// Decompress a P-256 point: given the 32-byte big-endian x coordinate and a parity flag,
/// recover the corresponding y coordinate.
pub fn calculate_y(x_be: &[u8; 32], y_odd: bool) -> Result<[u8; 32]> {
    let tag: u8 = if y_odd { 0x03 } else { 0x02 };
    let mut sec1 = [0u8; 33];
    sec1[0] = tag;
    sec1[1..].copy_from_slice(x_be);

    let point = EncodedPoint::from_bytes(sec1).map_err(|e| err(format!("bad x coordinate: {e}")))?;
    let public = Option::<PublicKey>::from(PublicKey::from_encoded_point(&point))
        .ok_or_else(|| err("x coordinate is not on the P-256 curve"))?;
    let uncompressed = public.to_encoded_point(false);
    let y = uncompressed
        .y()
        .ok_or_else(|| err("decompressed point missing y"))?;
    let mut out = [0u8; 32];
    out.copy_from_slice(y.as_slice());
    Ok(out)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn decompress_round_trip() {
        let kp = P256KeyPair::generate();
        let uncompressed = kp.public_blob(false);
        assert_eq!(uncompressed.len(), 65);
        let mut x = [0u8; 32];
        x.copy_from_slice(&uncompressed[1..33]);
        let y_from_blob = &uncompressed[33..65];
        let y_odd = y_from_blob[31] & 1 == 1;
        let recovered = calculate_y(&x, y_odd).unwrap();
        assert_eq!(&recovered[..], y_from_blob);
    }

    #[test]
    fn dh_is_symmetric() {
        let a = P256KeyPair::generate();
        let b = P256KeyPair::generate();
        let shared_a = a.diffie_hellman(&b.public_blob(false)).unwrap();
        let shared_b = b.diffie_hellman(&a.public_blob(false)).unwrap();
        assert_eq!(shared_a, shared_b);
    }
}
