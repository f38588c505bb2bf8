//! MIME part structure (RFC 2045/2046): `Content-Type`, `Content-Transfer-Encoding`,
//! `Content-ID`, `Content-Description`, `Content-Disposition`, `MIME-Version`, extension fields,
//! and content -- multipart bodies split on `--boundary` delimiters and recursed into up to a
//! depth limit. Boundary auto-generation is seeded with `=_` so a generated token can never
//! collide with quoted-printable output (`=` there is always followed by two hex digits or a
//! line break, never `_`).

use crucible_crypto::Rng;

use crate::imf::{Field, Message};

pub const DEFAULT_MAX_DEPTH: usize = 8;

#[derive(Clone, Debug, Default)]
pub struct ContentType {
    pub type_: String,
    pub subtype: String,
    pub params: Vec<(String, String)>,
}

impl ContentType {
    pub fn parse(value: &str) -> Option<ContentType> {
        let mut parts = value.split(';');
        let main = parts.next()?.trim();
        let (type_, subtype) = main.split_once('/')?;
        let mut ct = ContentType {
            type_: type_.trim().to_ascii_lowercase(),
            subtype: subtype.trim().to_ascii_lowercase(),
            params: Vec::new(),
        };
        for param in parts {
            let param = param.trim();
            if param.is_empty() {
                continue;
            }
            if let Some((k, v)) = param.split_once('=') {
                let k = k.trim().to_ascii_lowercase();
                let v = v.trim().trim_matches('"').to_string();
                ct.params.push((k, v));
            }
        }
        Some(ct)
    }

    pub fn param(&self, name: &str) -> Option<&str> {
        self.params
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn is_multipart(&self) -> bool {
        self.type_.eq_ignore_ascii_case("multipart")
    }
}

#[derive(Clone, Debug)]
pub enum Content {
    Leaf(Vec<u8>),
    Multipart {
        boundary: String,
        preamble: Vec<u8>,
        parts: Vec<MimePart>,
        epilogue: Vec<u8>,
    },
}

#[derive(Clone, Debug)]
pub struct MimePart {
    pub content_type: Option<ContentType>,
    pub content_transfer_encoding: Option<String>,
    pub content_id: Option<String>,
    pub content_description: Option<String>,
    pub content_disposition: Option<String>,
    pub mime_version: Option<String>,
    pub extension_fields: Vec<Field>,
    pub content: Content,
}

fn field_value(fields: &[Field], name: &str) -> Option<String> {
    fields
        .iter()
        .find(|f| f.name.eq_ignore_ascii_case(name))
        .map(|f| f.unfolded_value())
}

const KNOWN_MIME_FIELDS: &[&str] = &[
    "Content-Type",
    "Content-Transfer-Encoding",
    "Content-ID",
    "Content-Description",
    "Content-Disposition",
    "MIME-Version",
];

impl MimePart {
    pub fn parse(fields: &[Field], body: &[u8], max_depth: usize) -> MimePart {
        let content_type = field_value(fields, "Content-Type").and_then(|v| ContentType::parse(&v));
        let content_transfer_encoding = field_value(fields, "Content-Transfer-Encoding");
        let content_id = field_value(fields, "Content-ID");
        let content_description = field_value(fields, "Content-Description");
        let content_disposition = field_value(fields, "Content-Disposition");
        let mime_version = field_value(fields, "MIME-Version");
        let extension_fields = fields
            .iter()
            .filter(|f| !KNOWN_MIME_FIELDS.iter().any(|k| f.name.eq_ignore_ascii_case(k)))
            .cloned()
            .collect();

        let content = match &content_type {
            Some(ct) if ct.is_multipart() && max_depth > 0 => {
                if let Some(boundary) = ct.param("boundary") {
                    parse_multipart(boundary, body, max_depth - 1)
                } else {
                    Content::Leaf(body.to_vec())
                }
            }
            _ => Content::Leaf(body.to_vec()),
        };

        MimePart {
            content_type,
            content_transfer_encoding,
            content_id,
            content_description,
            content_disposition,
            mime_version,
            extension_fields,
            content,
        }
    }

    pub fn from_message(msg: &Message) -> MimePart {
        MimePart::parse(&msg.fields, &msg.body, DEFAULT_MAX_DEPTH)
    }
}

fn parse_multipart(boundary: &str, body: &[u8], remaining_depth: usize) -> Content {
    let delim = format!("--{boundary}");
    let delim_bytes = delim.as_bytes();

    let mut positions = Vec::new();
    let mut search_from = 0usize;
    while let Some(rel) = find_subslice(&body[search_from..], delim_bytes) {
        let pos = search_from + rel;
        positions.push(pos);
        search_from = pos + delim_bytes.len();
    }

    if positions.is_empty() {
        return Content::Multipart {
            boundary: boundary.to_string(),
            preamble: body.to_vec(),
            parts: Vec::new(),
            epilogue: Vec::new(),
        };
    }

    let preamble = body[..positions[0]].to_vec();
    let mut parts = Vec::new();
    let mut epilogue = Vec::new();

    for (idx, &pos) in positions.iter().enumerate() {
        let after_delim = pos + delim_bytes.len();
        if body[after_delim..].starts_with(b"--") {
            let content_start = skip_line_end(body, after_delim + 2);
            epilogue = body[content_start..].to_vec();
            break;
        }
        let part_start = skip_line_end(body, after_delim);
        let part_end = positions.get(idx + 1).copied().unwrap_or(body.len());
        let seg = trim_trailing_crlf(&body[part_start..part_end]);
        let msg = Message::parse(seg);
        parts.push(MimePart::parse(&msg.fields, &msg.body, remaining_depth));
    }

    Content::Multipart {
        boundary: boundary.to_string(),
        preamble,
        parts,
        epilogue,
    }
}

fn skip_line_end(body: &[u8], mut i: usize) -> usize {
    if body.get(i) == Some(&b'\r') && body.get(i + 1) == Some(&b'\n') {
        i += 2;
    } else if body.get(i) == Some(&b'\n') {
        i += 1;
    }
    i
}

fn trim_trailing_crlf(data: &[u8]) -> &[u8] {
    if data.ends_with(b"\r\n") {
        &data[..data.len() - 2]
    } else {
        data
    }
}

fn find_subslice(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    memchr::memmem::find(haystack, needle)
}

pub fn generate_boundary(rng: &dyn Rng) -> String {
    let mut buf = [0u8; 12];
    rng.fill_bytes(&mut buf);
    format!("=_{}", hex::encode(buf))
}

#[cfg(test)]
mod test {
    use super::*;
    use crucible_crypto::OsRng;

    #[test]
    fn content_type_params_parse() {
        let ct = ContentType::parse("multipart/mixed; boundary=\"abc123\"").unwrap();
        assert_eq!(ct.type_, "multipart");
        assert_eq!(ct.subtype, "mixed");
        assert_eq!(ct.param("boundary"), Some("abc123"));
        assert!(ct.is_multipart());
    }

    #[test]
    fn simple_multipart_splits_into_parts() {
        let raw = b"Content-Type: multipart/mixed; boundary=BOUND\r\n\r\n\
preamble text\r\n\
--BOUND\r\n\
Content-Type: text/plain\r\n\
\r\n\
first part\r\n\
--BOUND\r\n\
Content-Type: text/html\r\n\
\r\n\
<b>second</b>\r\n\
--BOUND--\r\n\
epilogue text\r\n";
        let msg = Message::parse(raw);
        let part = MimePart::from_message(&msg);
        match part.content {
            Content::Multipart { parts, .. } => {
                assert_eq!(parts.len(), 2);
                assert_eq!(
                    parts[0].content_type.as_ref().unwrap().subtype,
                    "plain"
                );
                assert_eq!(parts[1].content_type.as_ref().unwrap().subtype, "html");
            }
            Content::Leaf(_) => panic!("expected multipart"),
        }
    }

    #[test]
    fn non_multipart_is_a_leaf() {
        let raw = b"Content-Type: text/plain\r\n\r\nhello\r\n";
        let msg = Message::parse(raw);
        let part = MimePart::from_message(&msg);
        assert!(matches!(part.content, Content::Leaf(_)));
    }

    #[test]
    fn generated_boundary_cannot_collide_with_qp_output() {
        let rng = OsRng;
        let boundary = generate_boundary(&rng);
        assert!(boundary.starts_with("=_"));
    }
}
