//! `dkimgen <outFile>` / `dkimpub <file>`: generate or re-derive the DNS TXT record text a domain
//! publishes at `<selector>._domainkey.<domain>` for a key this tool also holds the private half
//! of. The private key is stored as a single hex line (PKCS#1 DER, the same form the signing and
//! verification round trip already use); the public record follows on a second line so `dkimpub`
//! can re-derive it without re-running keygen.

use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine;

use crucible_base::{err, Result};
use crucible_crypto::RsaKeyPair;

const KEY_BITS: usize = 2048;

fn record_text(kp: &RsaKeyPair) -> Result<String> {
    let pub_der = kp.public().to_pkcs1_der()?;
    Ok(format!("v=DKIM1; k=rsa; p={}", B64.encode(pub_der)))
}

pub fn gen(out_file: String) -> Result<()> {
    let kp = RsaKeyPair::generate(KEY_BITS)?;
    let priv_der = kp.to_pkcs1_der()?;
    let record = record_text(&kp)?;

    let contents = format!("{}\n{record}\n", hex::encode(priv_der));
    std::fs::write(&out_file, contents).map_err(|e| err(format!("could not write {out_file:?}: {e}")))?;

    println!("wrote private key and DNS record to {out_file}");
    println!("{record}");
    Ok(())
}

pub fn pub_from_file(file: String) -> Result<()> {
    let text = std::fs::read_to_string(&file).map_err(|e| err(format!("could not read {file:?}: {e}")))?;
    let first_line = text.lines().next().ok_or_else(|| err(format!("{file:?} is empty")))?;
    let priv_der = hex::decode(first_line.trim()).map_err(|e| err(format!("bad hex private key in {file:?}: {e}")))?;
    let kp = RsaKeyPair::from_pkcs1_der(&priv_der)?;
    println!("{}", record_text(&kp)?);
    Ok(())
}
