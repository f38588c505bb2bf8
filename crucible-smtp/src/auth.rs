//! SMTP `AUTH LOGIN`/`PLAIN`/`CRAM-MD5` credential encoding. The wire exchange (sending the
//! mechanism name, reading the `334` continuation challenge) lives in `attempt.rs`; this module
//! only builds the base64 payloads each mechanism sends back.

use base64::Engine;
use crucible_crypto::HashAlg;

const HMAC_BLOCK_LEN: usize = 64;

/// HMAC over `hash`, built from two hash calls per RFC 2104. `crucible-crypto` exposes plain
/// digests, not HMAC directly, so CRAM-MD5 (the one mechanism here that needs it) builds it here
/// from `HashAlg::digest`.
fn hmac(hash: HashAlg, key: &[u8], message: &[u8]) -> Vec<u8> {
    let mut key_block = vec![0u8; HMAC_BLOCK_LEN];
    if key.len() > HMAC_BLOCK_LEN {
        let digested = hash.digest(key);
        key_block[..digested.len()].copy_from_slice(&digested);
    } else {
        key_block[..key.len()].copy_from_slice(key);
    }
    let mut ipad = key_block.clone();
    let mut opad = key_block;
    for b in ipad.iter_mut() {
        *b ^= 0x36;
    }
    for b in opad.iter_mut() {
        *b ^= 0x5c;
    }
    let mut inner = ipad;
    inner.extend_from_slice(message);
    let inner_digest = hash.digest(&inner);
    let mut outer = opad;
    outer.extend_from_slice(&inner_digest);
    hash.digest(&outer)
}

pub fn login_username(username: &str) -> String {
    base64::engine::general_purpose::STANDARD.encode(username.as_bytes())
}

pub fn login_password(password: &str) -> String {
    base64::engine::general_purpose::STANDARD.encode(password.as_bytes())
}

pub fn plain_response(username: &str, password: &str) -> String {
    let mut buf = Vec::with_capacity(username.len() + password.len() + 2);
    buf.push(0u8);
    buf.extend_from_slice(username.as_bytes());
    buf.push(0u8);
    buf.extend_from_slice(password.as_bytes());
    base64::engine::general_purpose::STANDARD.encode(buf)
}

/// `username SPACE hex(hmac-md5(password, challenge))`, base64-encoded as the `334` response.
pub fn cram_md5_response(username: &str, password: &str, challenge_b64: &str) -> Option<String> {
    let challenge = base64::engine::general_purpose::STANDARD.decode(challenge_b64).ok()?;
    let digest = hmac(HashAlg::Md5, password.as_bytes(), &challenge);
    let hex_digest = hex::encode(digest);
    let response = format!("{username} {hex_digest}");
    Some(base64::engine::general_purpose::STANDARD.encode(response))
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn plain_response_is_nul_separated_triple() {
        let encoded = plain_response("user", "pass");
        let decoded = base64::engine::general_purpose::STANDARD.decode(encoded).unwrap();
        assert_eq!(decoded, b"\0user\0pass");
    }

    #[test]
    fn login_fields_round_trip_base64() {
        let encoded = login_username("alice");
        let decoded = base64::engine::general_purpose::STANDARD.decode(encoded).unwrap();
        assert_eq!(decoded, b"alice");
    }

    #[test]
    fn cram_md5_is_stable_for_same_inputs() {
        let challenge = base64::engine::general_purpose::STANDARD.encode(b"<1896.697170952@postoffice.example.com>");
        let a = cram_md5_response("user", "pass", &challenge).unwrap();
        let b = cram_md5_response("user", "pass", &challenge).unwrap();
        assert_eq!(a, b);
    }
}
