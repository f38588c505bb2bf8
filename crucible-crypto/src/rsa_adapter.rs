// RSA sign/verify capability: PKCS#1 v1.5 with SHA-1 or SHA-256, key import/export
// in PKCS#1, PKCS#8, and a raw form, and `Generate(bits)`. Backed by the `rsa` crate (the same
// family of crates -- `rsa`, `p256` -- the wider example pack reaches for, e.g.
// `aptos-labs-aptos-core`'s and `denoland-deno`'s Cargo.toml).

use rsa::pkcs1::{DecodeRsaPrivateKey, DecodeRsaPublicKey, EncodeRsaPrivateKey, EncodeRsaPublicKey};
use rsa::pkcs8::{DecodePrivateKey, DecodePublicKey, EncodePrivateKey, EncodePublicKey};
use sha1::Sha1;
use sha2::Sha256;
use rsa::signature::{SignatureEncoding, Signer, Verifier};
use rsa::pkcs1v15::{Signature, SigningKey, VerifyingKey};
use rsa::{RsaPrivateKey, RsaPublicKey};

use crucible_base::{err, Result};

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum RsaHashAlg {
    Sha1,
    Sha256,
}

pub struct RsaKeyPair {
    priv_key: RsaPrivateKey,
}

pub struct RsaPublicKeyHandle {
    pub_key: RsaPublicKey,
}

impl RsaKeyPair {
    pub fn generate(bits: usize) -> Result<Self> {
        let priv_key = RsaPrivateKey::new(&mut rand::rngs::OsRng, bits)
            .map_err(|e| err(format!("rsa keygen failed: {e}")))?;
        Ok(RsaKeyPair { priv_key })
    }

    pub fn from_pkcs1_der(der: &[u8]) -> Result<Self> {
        let priv_key = RsaPrivateKey::from_pkcs1_der(der)
            .map_err(|e| err(format!("bad pkcs1 private key: {e}")))?;
        Ok(RsaKeyPair { priv_key })
    }

    pub fn from_pkcs8_der(der: &[u8]) -> Result<Self> {
        let priv_key = RsaPrivateKey::from_pkcs8_der(der)
            .map_err(|e| err(format!("bad pkcs8 private key: {e}")))?;
        Ok(RsaKeyPair { priv_key })
    }

    pub fn to_pkcs1_der(&self) -> Result<Vec<u8>> {
        self.priv_key
            .to_pkcs1_der()
            .map(|d| d.as_bytes().to_vec())
            .map_err(|e| err(format!("pkcs1 encode failed: {e}")))
    }

    pub fn to_pkcs8_der(&self) -> Result<Vec<u8>> {
        self.priv_key
            .to_pkcs8_der()
            .map(|d| d.as_bytes().to_vec())
            .map_err(|e| err(format!("pkcs8 encode failed: {e}")))
    }

    pub fn public(&self) -> RsaPublicKeyHandle {
        RsaPublicKeyHandle {
            pub_key: self.priv_key.to_public_key(),
        }
    }

    pub fn sign(&self, alg: RsaHashAlg, message: &[u8]) -> Result<Vec<u8>> {
        match alg {
            RsaHashAlg::Sha1 => {
                let signing_key: SigningKey<Sha1> = SigningKey::new(self.priv_key.clone());
                let sig = signing_key.sign(message);
                Ok(sig.to_vec())
            }
            RsaHashAlg::Sha256 => {
                let signing_key: SigningKey<Sha256> = SigningKey::new(self.priv_key.clone());
                let sig = signing_key.sign(message);
                Ok(sig.to_vec())
            }
        }
    }
}

impl RsaPublicKeyHandle {
    pub fn from_pkcs1_der(der: &[u8]) -> Result<Self> {
        let pub_key = RsaPublicKey::from_pkcs1_der(der)
            .map_err(|e| err(format!("bad pkcs1 public key: {e}")))?;
        Ok(RsaPublicKeyHandle { pub_key })
    }

    pub fn from_pkcs8_der(der: &[u8]) -> Result<Self> {
        let pub_key = RsaPublicKey::from_public_key_der(der)
            .map_err(|e| err(format!("bad pkcs8 public key: {e}")))?;
        Ok(RsaPublicKeyHandle { pub_key })
    }

    /// "Raw form": a bare `(n, e)` pair, big-endian, length-prefixed -- the simplest possible
    /// wire form, used when neither ASN.1 container is needed (e.g. a test harness dump).
    pub fn to_raw(&self) -> Vec<u8> {
        let n = self.pub_key.n().to_bytes_be();
        let e = self.pub_key.e().to_bytes_be();
        let mut out = Vec::with_capacity(8 + n.len() + e.len());
        out.extend_from_slice(&(n.len() as u32).to_be_bytes());
        out.extend_from_slice(&n);
        out.extend_from_slice(&(e.len() as u32).to_be_bytes());
        out.extend_from_slice(&e);
        out
    }

    pub fn from_raw(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < 4 {
            return Err(err("raw rsa key too short"));
        }
        let n_len = u32::from_be_bytes(bytes[0..4].try_into().unwrap()) as usize;
        let n_start = 4;
        let n_end = n_start + n_len;
        if bytes.len() < n_end + 4 {
            return Err(err("raw rsa key truncated (n)"));
        }
        let n = rsa::BigUint::from_bytes_be(&bytes[n_start..n_end]);
        let e_len =
            u32::from_be_bytes(bytes[n_end..n_end + 4].try_into().unwrap()) as usize;
        let e_start = n_end + 4;
        let e_end = e_start + e_len;
        if bytes.len() < e_end {
            return Err(err("raw rsa key truncated (e)"));
        }
        let e = rsa::BigUint::from_bytes_be(&bytes[e_start..e_end]);
        let pub_key =
            RsaPublicKey::new(n, e).map_err(|e| err(format!("bad raw rsa key: {e}")))?;
        Ok(RsaPublicKeyHandle { pub_key })
    }

    pub fn to_pkcs1_der(&self) -> Result<Vec<u8>> {
        self.pub_key
            .to_pkcs1_der()
            .map(|d| d.as_bytes().to_vec())
            .map_err(|e| err(format!("pkcs1 public encode failed: {e}")))
    }

    pub fn verify(&self, alg: RsaHashAlg, message: &[u8], sig_bytes: &[u8]) -> bool {
        match alg {
            RsaHashAlg::Sha1 => {
                let verifying_key: VerifyingKey<Sha1> = VerifyingKey::new(self.pub_key.clone());
                let Ok(sig) = Signature::try_from(sig_bytes) else {
                    return false;
                };
                verifying_key.verify(message, &sig).is_ok()
            }
            RsaHashAlg::Sha256 => {
                let verifying_key: VerifyingKey<Sha256> = VerifyingKey::new(self.pub_key.clone());
                let Ok(sig) = Signature::try_from(sig_bytes) else {
                    return false;
                };
                verifying_key.verify(message, &sig).is_ok()
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn sign_verify_round_trip() {
        let kp = RsaKeyPair::generate(1024).unwrap();
        let sig = kp.sign(RsaHashAlg::Sha256, b"hello world").unwrap();
        assert!(kp.public().verify(RsaHashAlg::Sha256, b"hello world", &sig));
        assert!(!kp.public().verify(RsaHashAlg::Sha256, b"hello worlD", &sig));
    }

    #[test]
    fn pkcs1_round_trip() {
        let kp = RsaKeyPair::generate(1024).unwrap();
        let der = kp.to_pkcs1_der().unwrap();
        let kp2 = RsaKeyPair::from_pkcs1_der(&der).unwrap();
        let sig = kp2.sign(RsaHashAlg::Sha1, b"x").unwrap();
        assert!(kp.public().verify(RsaHashAlg::Sha1, b"x", &sig));
    }

    #[test]
    fn raw_public_round_trip() {
        let kp = RsaKeyPair::generate(1024).unwrap();
        let raw = kp.public().to_raw();
        let pk2 = RsaPublicKeyHandle::from_raw(&raw).unwrap();
        let sig = kp.sign(RsaHashAlg::Sha256, b"y").unwrap();
        assert!(pk2.verify(RsaHashAlg::Sha256, b"y", &sig));
    }
}
