//! `genmsg`: assemble an IMF/MIME message from CLI flags and a markdown (treated as plain text,
//! since nothing in this stack renders markdown to HTML) body file, optionally attaching files as
//! base64 parts and DKIM-signing the result.

use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine;

use crucible_base::{err, Result, Time};
use crucible_crypto::{OsRng, RsaKeyPair};
use crucible_parse::dkim::{self, SignParams};
use crucible_parse::imf::Message;
use crucible_parse::mime::generate_boundary;

const DEFAULT_BODY: &str = "This is a test message generated for exercising the send pipeline.\r\n\
\r\n\
It has no particular content of its own.\r\n";

const WEEKDAYS: [&str; 7] = ["Sun", "Mon", "Tue", "Wed", "Thu", "Fri", "Sat"];
const MONTHS: [&str; 12] = [
    "Jan", "Feb", "Mar", "Apr", "May", "Jun", "Jul", "Aug", "Sep", "Oct", "Nov", "Dec",
];

// Same civil-calendar algorithm `crucible_base::Time` itself uses internally (Howard Hinnant's
// `civil_from_days`, public domain), duplicated locally since that conversion isn't exposed.
fn civil_from_days(z: i64) -> (i64, u32, u32) {
    let z = z + 719468;
    let era = if z >= 0 { z } else { z - 146096 } / 146097;
    let doe = z - era * 146097;
    let yoe = (doe - doe / 1460 + doe / 36524 - doe / 146096) / 365;
    let y = yoe + era * 400;
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
    let mp = (5 * doy + 2) / 153;
    let d = (doy - (153 * mp + 2) / 5 + 1) as u32;
    let m = if mp < 10 { mp + 3 } else { mp - 9 } as u32;
    let y = if m <= 2 { y + 1 } else { y };
    (y, m, d)
}

fn rfc5322_date(t: Time) -> String {
    let micros = t.as_unix_micros();
    let days = micros.div_euclid(86_400_000_000);
    let secs_of_day = micros.rem_euclid(86_400_000_000) / 1_000_000;
    let weekday = WEEKDAYS[((days.rem_euclid(7)) + 4).rem_euclid(7) as usize];
    let (y, m, d) = civil_from_days(days);
    let hh = secs_of_day / 3600;
    let mm = (secs_of_day % 3600) / 60;
    let ss = secs_of_day % 60;
    format!("{weekday}, {d} {} {y} {hh:02}:{mm:02}:{ss:02} +0000", MONTHS[(m - 1) as usize])
}

fn message_id(rng: &OsRng) -> String {
    let token = generate_boundary(rng);
    format!("<{token}@crucible.local>")
}

struct Attachment {
    content_type: String,
    file: String,
}

fn parse_attachments(raw: &[String]) -> Vec<Attachment> {
    raw.chunks(2)
        .filter(|pair| pair.len() == 2)
        .map(|pair| Attachment {
            content_type: pair[0].clone(),
            file: pair[1].clone(),
        })
        .collect()
}

#[allow(clippy::too_many_arguments)]
pub fn run(
    out: Option<String>,
    mkdn: Option<String>,
    from: Option<String>,
    to: Vec<String>,
    cc: Vec<String>,
    subject: Option<String>,
    kp: Option<String>,
    sdid: Option<String>,
    sel: Option<String>,
    attach: Vec<String>,
) -> Result<()> {
    let body_text = match mkdn {
        Some(path) => std::fs::read_to_string(&path).map_err(|e| err(format!("could not read {path:?}: {e}")))?,
        None => DEFAULT_BODY.to_string(),
    };
    let attachments = parse_attachments(&attach);
    let rng = OsRng;

    let mut headers = String::new();
    headers.push_str(&format!("Date: {}\r\n", rfc5322_date(Time::now())));
    headers.push_str(&format!("Message-ID: {}\r\n", message_id(&rng)));
    if let Some(from) = &from {
        headers.push_str(&format!("From: {from}\r\n"));
    }
    if !to.is_empty() {
        headers.push_str(&format!("To: {}\r\n", to.join(", ")));
    }
    if !cc.is_empty() {
        headers.push_str(&format!("Cc: {}\r\n", cc.join(", ")));
    }
    if let Some(subject) = &subject {
        headers.push_str(&format!("Subject: {subject}\r\n"));
    }
    headers.push_str("MIME-Version: 1.0\r\n");

    let mut raw = Vec::new();
    if attachments.is_empty() {
        headers.push_str("Content-Type: text/plain; charset=utf-8\r\n");
        raw.extend_from_slice(headers.as_bytes());
        raw.extend_from_slice(b"\r\n");
        raw.extend_from_slice(body_text.replace('\n', "\r\n").as_bytes());
    } else {
        let boundary = generate_boundary(&rng);
        headers.push_str(&format!("Content-Type: multipart/mixed; boundary=\"{boundary}\"\r\n"));
        raw.extend_from_slice(headers.as_bytes());
        raw.extend_from_slice(b"\r\n");

        raw.extend_from_slice(format!("--{boundary}\r\n").as_bytes());
        raw.extend_from_slice(b"Content-Type: text/plain; charset=utf-8\r\n\r\n");
        raw.extend_from_slice(body_text.replace('\n', "\r\n").as_bytes());
        raw.extend_from_slice(b"\r\n");

        for a in &attachments {
            let data = std::fs::read(&a.file).map_err(|e| err(format!("could not read {:?}: {e}", a.file)))?;
            let filename = std::path::Path::new(&a.file)
                .file_name()
                .and_then(|n| n.to_str())
                .unwrap_or(&a.file);
            raw.extend_from_slice(format!("--{boundary}\r\n").as_bytes());
            raw.extend_from_slice(format!("Content-Type: {}\r\n", a.content_type).as_bytes());
            raw.extend_from_slice(b"Content-Transfer-Encoding: base64\r\n");
            raw.extend_from_slice(format!("Content-Disposition: attachment; filename=\"{filename}\"\r\n\r\n").as_bytes());
            let encoded = B64.encode(&data);
            for line in encoded.as_bytes().chunks(76) {
                raw.extend_from_slice(line);
                raw.extend_from_slice(b"\r\n");
            }
        }
        raw.extend_from_slice(format!("--{boundary}--\r\n").as_bytes());
    }

    let msg = Message::parse(&raw);

    let final_bytes = match (kp, sdid, sel) {
        (Some(kp_file), Some(sdid), Some(sel)) => {
            let priv_hex = std::fs::read_to_string(&kp_file)
                .map_err(|e| err(format!("could not read {kp_file:?}: {e}")))?;
            let first_line = priv_hex
                .lines()
                .next()
                .ok_or_else(|| err(format!("{kp_file:?} is empty")))?;
            let priv_der = hex::decode(first_line.trim())
                .map_err(|e| err(format!("bad hex private key in {kp_file:?}: {e}")))?;
            let key = RsaKeyPair::from_pkcs1_der(&priv_der)?;
            let sig_field = dkim::sign(&msg, &sdid, &sel, SignParams::default(), &key);
            let mut out_bytes = sig_field.into_bytes();
            out_bytes.extend_from_slice(&msg.emit());
            out_bytes
        }
        _ => msg.emit(),
    };

    match out {
        Some(path) => {
            std::fs::write(&path, &final_bytes).map_err(|e| err(format!("could not write {path:?}: {e}")))?;
            println!("wrote {} bytes to {path}", final_bytes.len());
        }
        None => {
            use std::io::Write;
            std::io::stdout()
                .write_all(&final_bytes)
                .map_err(|e| err(format!("could not write to stdout: {e}")))?;
        }
    }
    Ok(())
}
