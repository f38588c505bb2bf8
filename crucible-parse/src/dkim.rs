//! RFC 6376 DKIM-Signature parsing, canonicalization, signing and verification.
//! Signing chooses relaxed/relaxed by default, algorithm `rsa-sha256`, signs the fixed header
//! list below, emits `h=` in reverse source order, and signs the concatenation of
//! canonicalized signed headers (in that same reverse order) followed by the canonicalized
//! `DKIM-Signature` field itself with an empty `b=`. Verification mirrors this exactly, consuming
//! an injected public-key lookup rather than doing its own DNS resolution (spec's Open Question
//! decision: key resolution stays out of core).

use crucible_crypto::{HashAlg, RsaHashAlg, RsaKeyPair, RsaPublicKeyHandle};

use crate::imf::{Field, FieldKind, Message};

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Canon {
    Simple,
    Relaxed,
}

impl Canon {
    fn as_str(self) -> &'static str {
        match self {
            Canon::Simple => "simple",
            Canon::Relaxed => "relaxed",
        }
    }

    fn parse(s: &str) -> Option<Canon> {
        match s {
            "simple" => Some(Canon::Simple),
            "relaxed" => Some(Canon::Relaxed),
            _ => None,
        }
    }
}

const SIGNED_HEADER_NAMES: &[&str] = &[
    "Date",
    "From",
    "Sender",
    "Reply-To",
    "To",
    "Cc",
    "Bcc",
    "Message-ID",
    "In-Reply-To",
    "References",
    "Subject",
    "Comments",
    "Keywords",
    "MIME-Version",
    "Content-Type",
    "Content-Transfer-Encoding",
    "Content-ID",
    "Content-Description",
    "Content-Disposition",
];

#[derive(Clone, Debug)]
pub struct DkimSignature {
    pub version: u32,
    pub algorithm: String,
    pub header_canon: Canon,
    pub body_canon: Canon,
    pub sdid: String,
    pub selector: String,
    pub headers: Vec<String>,
    pub body_hash_b64: String,
    pub signature_b64: String,
}

fn strip_ws(s: &str) -> String {
    s.chars().filter(|c| !c.is_whitespace()).collect()
}

fn parse_tag_list(s: &str) -> Vec<(String, String)> {
    s.split(';')
        .filter_map(|kv| {
            let kv = kv.trim();
            if kv.is_empty() {
                return None;
            }
            let (k, v) = kv.split_once('=')?;
            Some((k.trim().to_string(), strip_ws(v)))
        })
        .collect()
}

impl DkimSignature {
    pub fn parse(field: &Field) -> Option<DkimSignature> {
        let tags = parse_tag_list(&field.unfolded_value());
        let get = |name: &str| tags.iter().find(|(k, _)| k == name).map(|(_, v)| v.clone());

        let version: u32 = get("v")?.parse().ok()?;
        let algorithm = get("a")?;
        let c = get("c").unwrap_or_else(|| "simple/simple".to_string());
        let (hc, bc) = c.split_once('/').unwrap_or((c.as_str(), "simple"));
        let header_canon = Canon::parse(hc)?;
        let body_canon = Canon::parse(bc)?;
        let sdid = get("d")?;
        let selector = get("s")?;
        let headers = get("h")?.split(':').map(|s| s.to_string()).collect();
        let body_hash_b64 = get("bh")?;
        let signature_b64 = get("b")?;

        Some(DkimSignature {
            version,
            algorithm,
            header_canon,
            body_canon,
            sdid,
            selector,
            headers,
            body_hash_b64,
            signature_b64,
        })
    }
}

fn collapse_ws_str(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut last_space = false;
    for c in s.trim().chars() {
        if c == ' ' || c == '\t' {
            if !last_space {
                out.push(' ');
            }
            last_space = true;
        } else {
            out.push(c);
            last_space = false;
        }
    }
    out
}

/// Canonicalize a single header field, returning bytes with no trailing line terminator.
fn canon_header(field: &Field, canon: Canon) -> Vec<u8> {
    match canon {
        Canon::Simple => {
            let raw = &field.raw;
            if raw.ends_with(b"\r\n") {
                raw[..raw.len() - 2].to_vec()
            } else {
                raw.clone()
            }
        }
        Canon::Relaxed => {
            let name = field.name.to_ascii_lowercase();
            let value = collapse_ws_str(&field.unfolded_value());
            format!("{name}:{value}").into_bytes()
        }
    }
}

/// Canonicalize the would-be `DKIM-Signature` field text (header name + tag list) the same way
/// an ordinary signed header is canonicalized.
fn canon_signature_field(tag_list: &str, canon: Canon) -> Vec<u8> {
    match canon {
        Canon::Simple => format!("DKIM-Signature:{tag_list}").into_bytes(),
        Canon::Relaxed => {
            let value = collapse_ws_str(tag_list);
            format!("dkim-signature:{value}").into_bytes()
        }
    }
}

/// Split into line contents (CR/LF stripped); a final fragment with no trailing LF is included
/// too, so callers that always re-append CRLF effectively add one if the body was missing it.
fn split_lines(body: &[u8]) -> Vec<&[u8]> {
    let mut out = Vec::new();
    let mut start = 0;
    let mut i = 0;
    while i < body.len() {
        if body[i] == b'\n' {
            let content_end = if i > start && body[i - 1] == b'\r' { i - 1 } else { i };
            out.push(&body[start..content_end]);
            start = i + 1;
        }
        i += 1;
    }
    if start < body.len() {
        out.push(&body[start..]);
    }
    out
}

fn canon_body(body: &[u8], canon: Canon) -> Vec<u8> {
    let mut out = Vec::with_capacity(body.len());
    for content in split_lines(body) {
        match canon {
            Canon::Simple => out.extend_from_slice(content),
            Canon::Relaxed => out.extend_from_slice(&collapse_ws_bytes(content)),
        }
        out.extend_from_slice(b"\r\n");
    }
    // Strip trailing empty lines, keeping exactly one trailing CRLF.
    while out.len() >= 4 && &out[out.len() - 4..] == b"\r\n\r\n" {
        out.truncate(out.len() - 2);
    }
    if out.is_empty() {
        out.extend_from_slice(b"\r\n");
    }
    out
}

fn collapse_ws_bytes(content: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(content.len());
    let mut last_space = false;
    for &b in content {
        if b == b' ' || b == b'\t' {
            last_space = true;
        } else {
            if last_space && !out.is_empty() {
                out.push(b' ');
            }
            out.push(b);
            last_space = false;
        }
    }
    out
}

fn find_signed_fields<'a>(msg: &'a Message) -> Vec<&'a Field> {
    msg.fields
        .iter()
        .filter(|f| {
            f.kind != FieldKind::Invalid
                && SIGNED_HEADER_NAMES.iter().any(|n| f.name.eq_ignore_ascii_case(n))
        })
        .collect()
}

#[derive(Clone, Copy, Debug)]
pub struct SignParams {
    pub header_canon: Canon,
    pub body_canon: Canon,
}

impl Default for SignParams {
    fn default() -> Self {
        SignParams {
            header_canon: Canon::Relaxed,
            body_canon: Canon::Relaxed,
        }
    }
}

/// Sign `msg` and return the full `DKIM-Signature: ...\r\n` field text to prepend to the message.
pub fn sign(msg: &Message, sdid: &str, selector: &str, params: SignParams, key: &RsaKeyPair) -> String {
    let signed_fields = find_signed_fields(msg);
    let reversed: Vec<&Field> = signed_fields.into_iter().rev().collect();
    let h_list: Vec<String> = reversed.iter().map(|f| f.name.clone()).collect();

    let body_hash = {
        let canon = canon_body(&msg.body, params.body_canon);
        let digest = HashAlg::Sha256.digest(&canon);
        crate::b64::encode(&digest, crate::b64::Mode::default())
    };

    let tag_list_no_b = format!(
        "v=1; a=rsa-sha256; c={}/{}; d={}; s={}; h={}; bh={}; b=",
        params.header_canon.as_str(),
        params.body_canon.as_str(),
        sdid,
        selector,
        h_list.join(":"),
        body_hash,
    );

    let mut signing_input = Vec::new();
    for field in &reversed {
        signing_input.extend_from_slice(&canon_header(field, params.header_canon));
        signing_input.extend_from_slice(b"\r\n");
    }
    signing_input.extend_from_slice(&canon_signature_field(&tag_list_no_b, params.header_canon));

    let sig_bytes = key
        .sign(RsaHashAlg::Sha256, &signing_input)
        .expect("rsa sign should not fail for a validly generated key");
    let sig_b64 = crate::b64::encode(&sig_bytes, crate::b64::Mode::default());

    format!("DKIM-Signature: {tag_list_no_b}{sig_b64}\r\n")
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum VerifyOutcome {
    Verified,
    Failed,
}

/// Verify one `DKIM-Signature` field against `msg`, using `lookup_key` to resolve the signer's
/// public key from `(sdid, selector)`. Never performs DNS resolution itself.
pub fn verify(
    msg: &Message,
    sig_field: &Field,
    lookup_key: impl FnOnce(&str, &str) -> Option<RsaPublicKeyHandle>,
) -> (VerifyOutcome, &'static str) {
    let Some(sig) = DkimSignature::parse(sig_field) else {
        return (VerifyOutcome::Failed, "malformed DKIM-Signature field");
    };
    if sig.algorithm != "rsa-sha256" {
        return (VerifyOutcome::Failed, "unsupported algorithm");
    }
    let Some(pub_key) = lookup_key(&sig.sdid, &sig.selector) else {
        return (VerifyOutcome::Failed, "public key not found");
    };

    let canon_body_bytes = canon_body(&msg.body, sig.body_canon);
    let digest = HashAlg::Sha256.digest(&canon_body_bytes);
    let actual_bh = crate::b64::encode(&digest, crate::b64::Mode::default());
    if actual_bh != sig.body_hash_b64 {
        return (VerifyOutcome::Failed, "body hash mismatch");
    }

    // Reconstruct the signing input: for each name in h= (already reverse source order at sign
    // time), consume one matching field, last-to-first among duplicates.
    let mut remaining: Vec<&Field> = msg.fields.iter().collect();
    let mut signing_input = Vec::new();
    for wanted_name in &sig.headers {
        let idx = remaining
            .iter()
            .rposition(|f| f.name.eq_ignore_ascii_case(wanted_name));
        match idx {
            Some(i) => {
                let field = remaining.remove(i);
                signing_input.extend_from_slice(&canon_header(field, sig.header_canon));
                signing_input.extend_from_slice(b"\r\n");
            }
            None => {
                // "Absent" headers are signed as empty per RFC 6376 §5.4; nothing to append
                // beyond the header's own canonical empty form, which contributes no bytes here.
            }
        }
    }

    // Reconstruct the tag list with an empty `b=`, in the same fixed tag order `sign` emits in
    // (the only order this implementation ever produces or expects).
    let tag_list_no_b = format!(
        "v={}; a={}; c={}/{}; d={}; s={}; h={}; bh={}; b=",
        sig.version,
        sig.algorithm,
        sig.header_canon.as_str(),
        sig.body_canon.as_str(),
        sig.sdid,
        sig.selector,
        sig.headers.join(":"),
        sig.body_hash_b64,
    );
    signing_input.extend_from_slice(&canon_signature_field(&tag_list_no_b, sig.header_canon));

    let Some(sig_bytes) = crate::b64::decode(&sig.signature_b64, crate::b64::Mode::default())
    else {
        return (VerifyOutcome::Failed, "bad signature encoding");
    };

    if pub_key.verify(RsaHashAlg::Sha256, &signing_input, &sig_bytes) {
        (VerifyOutcome::Verified, "ok")
    } else {
        (VerifyOutcome::Failed, "Signature verification failed")
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crucible_crypto::RsaKeyPair;

    fn sample_message() -> Message {
        let raw = b"Date: Mon, 1 Jan 2024 00:00:00 +0000\r\n\
From: sender@denisbider.com\r\n\
To: recipient@example.com\r\n\
Subject: hello\r\n\
\r\n\
Hello, world.\r\n";
        Message::parse(raw)
    }

    #[test]
    fn scenario_s4_sign_then_verify_known_answer() {
        let kp = RsaKeyPair::generate(2048).unwrap();
        let msg = sample_message();
        let sig_text = sign(&msg, "denisbider.com", "mail", SignParams::default(), &kp);

        let mut signed_raw = sig_text.clone().into_bytes();
        signed_raw.extend_from_slice(&msg.emit());
        let signed_msg = Message::parse(&signed_raw);
        let sig_field = signed_msg.field("DKIM-Signature").unwrap();

        let pub_key = kp.public();
        let (outcome, reason) = verify(&signed_msg, sig_field, |_sdid, _sel| {
            Some(RsaPublicKeyHandle::from_pkcs1_der(&pub_key.to_pkcs1_der().unwrap()).unwrap())
        });
        assert_eq!(outcome, VerifyOutcome::Verified, "{reason}");
    }

    #[test]
    fn flipping_a_body_byte_breaks_verification() {
        let kp = RsaKeyPair::generate(2048).unwrap();
        let msg = sample_message();
        let sig_text = sign(&msg, "denisbider.com", "mail", SignParams::default(), &kp);

        let mut tampered = msg.clone();
        let i = tampered.body.iter().position(|&b| b == b'H').unwrap();
        tampered.body[i] = b'h';

        let mut signed_raw = sig_text.into_bytes();
        signed_raw.extend_from_slice(&tampered.emit());
        let signed_msg = Message::parse(&signed_raw);
        let sig_field = signed_msg.field("DKIM-Signature").unwrap();

        let pub_key = kp.public();
        let (outcome, _) = verify(&signed_msg, sig_field, |_, _| {
            Some(RsaPublicKeyHandle::from_pkcs1_der(&pub_key.to_pkcs1_der().unwrap()).unwrap())
        });
        assert_eq!(outcome, VerifyOutcome::Failed);
    }
}
