//! RFC 5322 Internet Message Format: header folding/unfolding, trace+resent field grouping, and
//! the `optional_field`/`invalid_field` split. Header lines are kept as close to
//! their original bytes as possible so `emit(parse(m)) == m` modulo CRLF normalization (testable
//! property #1); the AST stays line-oriented rather than fully tokenizing every known field, the
//! same "classify lightly, leave the payload alone" approach `toka-store-core`'s `EventHeader`
//! takes by carrying `kind` as a plain string rather than a closed enum of every event type it
//! might ever see.

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum FieldKind {
    /// One of the field names this layer understands structurally (trace/resent grouping).
    Known,
    /// An unrecognized but syntactically well-formed field name.
    Optional,
    /// A header line with no parseable `field-name:` prefix; preserved verbatim, never dropped.
    Invalid,
}

#[derive(Clone, Debug)]
pub struct Field {
    pub name: String,
    /// Exact bytes of this field as it appears in the message, folding included, CRLF-terminated.
    pub raw: Vec<u8>,
    pub kind: FieldKind,
}

impl Field {
    /// The unfolded value: everything after the first `:`, leading whitespace stripped, interior
    /// fold sequences (`CRLF SP`/`CRLF TAB`) replaced by a single space.
    pub fn unfolded_value(&self) -> String {
        let Some(colon) = self.raw.iter().position(|&b| b == b':') else {
            return String::new();
        };
        let rest = &self.raw[colon + 1..];
        let mut out = String::new();
        let mut i = 0;
        while i < rest.len() {
            if rest[i] == b'\r' && rest.get(i + 1) == Some(&b'\n') {
                i += 2;
                while matches!(rest.get(i), Some(b' ') | Some(b'\t')) {
                    i += 1;
                }
                if !out.is_empty() {
                    out.push(' ');
                }
                continue;
            }
            out.push(rest[i] as char);
            i += 1;
        }
        out.trim().to_string()
    }
}

#[derive(Clone, Debug, Default)]
pub struct TraceGroup {
    pub return_path: Option<Field>,
    pub received: Vec<Field>,
    pub resent: Vec<Field>,
}

#[derive(Clone, Debug)]
pub struct Message {
    pub fields: Vec<Field>,
    pub body: Vec<u8>,
}

const KNOWN_FIELDS: &[&str] = &[
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
    "Auto-Submitted",
    "Return-Path",
    "Received",
    "Resent-Date",
    "Resent-From",
    "Resent-Sender",
    "Resent-To",
    "Resent-Cc",
    "Resent-Bcc",
    "Resent-Message-ID",
    "DKIM-Signature",
];

fn normalize_crlf(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len() + data.len() / 32);
    let mut i = 0;
    while i < data.len() {
        match data[i] {
            b'\r' => {
                out.push(b'\r');
                out.push(b'\n');
                i += if data.get(i + 1) == Some(&b'\n') { 2 } else { 1 };
            }
            b'\n' => {
                out.push(b'\r');
                out.push(b'\n');
                i += 1;
            }
            b => {
                out.push(b);
                i += 1;
            }
        }
    }
    out
}

fn split_crlf_lines(data: &[u8]) -> Vec<&[u8]> {
    let mut out = Vec::new();
    let mut start = 0;
    let mut i = 0;
    while i + 1 < data.len() {
        if data[i] == b'\r' && data[i + 1] == b'\n' {
            out.push(&data[start..i]);
            i += 2;
            start = i;
        } else {
            i += 1;
        }
    }
    if start < data.len() {
        out.push(&data[start..]);
    }
    out
}

fn unfold_fields(lines: &[&[u8]]) -> Vec<Vec<u8>> {
    let mut groups: Vec<Vec<u8>> = Vec::new();
    for &line in lines {
        let is_continuation = matches!(line.first(), Some(b' ') | Some(b'\t'));
        if is_continuation && !groups.is_empty() {
            let last = groups.last_mut().expect("checked non-empty");
            last.extend_from_slice(b"\r\n");
            last.extend_from_slice(line);
        } else {
            groups.push(line.to_vec());
        }
    }
    groups
}

fn classify(group: &[u8]) -> (String, FieldKind) {
    if let Some(colon) = group.iter().position(|&b| b == b':') {
        let name_bytes = &group[..colon];
        let name_ok = !name_bytes.is_empty()
            && name_bytes
                .iter()
                .all(|&b| (33..=126).contains(&b) && b != b':');
        if name_ok {
            let name = String::from_utf8_lossy(name_bytes).into_owned();
            let kind = if KNOWN_FIELDS.iter().any(|k| k.eq_ignore_ascii_case(&name)) {
                FieldKind::Known
            } else {
                FieldKind::Optional
            };
            return (name, kind);
        }
    }
    (String::new(), FieldKind::Invalid)
}

fn eq_ci(a: &str, b: &str) -> bool {
    a.eq_ignore_ascii_case(b)
}

impl Message {
    pub fn parse(input: &[u8]) -> Message {
        let normalized = normalize_crlf(input);
        let (header_block, body): (&[u8], &[u8]) = match find_blank_line(&normalized) {
            Some(pos) => (&normalized[..pos], &normalized[pos + 4..]),
            None => (&normalized[..], &[][..]),
        };
        let lines = split_crlf_lines(header_block);
        let groups = unfold_fields(&lines);
        let fields = groups
            .into_iter()
            .filter(|g| !g.is_empty())
            .map(|mut g| {
                let (name, kind) = classify(&g);
                g.extend_from_slice(b"\r\n");
                Field { name, raw: g, kind }
            })
            .collect();
        Message {
            fields,
            body: body.to_vec(),
        }
    }

    pub fn emit(&self) -> Vec<u8> {
        let mut out = Vec::new();
        for f in &self.fields {
            out.extend_from_slice(&f.raw);
        }
        out.extend_from_slice(b"\r\n");
        out.extend_from_slice(&self.body);
        out
    }

    fn trace_partition(&self) -> (Vec<TraceGroup>, Vec<usize>) {
        let mut groups = Vec::new();
        let mut consumed = Vec::new();
        let mut i = 0;
        while i < self.fields.len() {
            let name = self.fields[i].name.clone();
            if !eq_ci(&name, "Return-Path") && !eq_ci(&name, "Received") {
                i += 1;
                continue;
            }
            let mut group = TraceGroup::default();
            let mut rp_consumed_idx = None;
            if eq_ci(&name, "Return-Path") {
                group.return_path = Some(self.fields[i].clone());
                rp_consumed_idx = Some(i);
                i += 1;
            }
            let mut got_received = false;
            while i < self.fields.len() && eq_ci(&self.fields[i].name, "Received") {
                group.received.push(self.fields[i].clone());
                consumed.push(i);
                i += 1;
                got_received = true;
            }
            if !got_received {
                // A lone Return-Path with no following Received never completes a trace group;
                // leave it as a main field.
                let _ = rp_consumed_idx;
                continue;
            }
            if let Some(idx) = rp_consumed_idx {
                consumed.push(idx);
            }
            while i < self.fields.len() && self.fields[i].name.to_ascii_lowercase().starts_with("resent-") {
                group.resent.push(self.fields[i].clone());
                consumed.push(i);
                i += 1;
            }
            groups.push(group);
        }
        (groups, consumed)
    }

    pub fn trace_groups(&self) -> Vec<TraceGroup> {
        self.trace_partition().0
    }

    pub fn main_fields(&self) -> Vec<&Field> {
        let (_, consumed) = self.trace_partition();
        self.fields
            .iter()
            .enumerate()
            .filter(|(i, _)| !consumed.contains(i))
            .map(|(_, f)| f)
            .collect()
    }

    pub fn optional_fields(&self) -> impl Iterator<Item = &Field> {
        self.fields.iter().filter(|f| f.kind == FieldKind::Optional)
    }

    pub fn invalid_fields(&self) -> impl Iterator<Item = &Field> {
        self.fields.iter().filter(|f| f.kind == FieldKind::Invalid)
    }

    pub fn field(&self, name: &str) -> Option<&Field> {
        self.fields.iter().find(|f| eq_ci(&f.name, name))
    }
}

fn find_blank_line(data: &[u8]) -> Option<usize> {
    let mut i = 0;
    while i + 3 < data.len() {
        if &data[i..i + 4] == b"\r\n\r\n" {
            return Some(i);
        }
        i += 1;
    }
    None
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn round_trip_with_trace_groups() {
        let msg = b"Return-Path: <a@example.com>\r\n\
Received: from mx1.example.com\r\n\
 by mx2.example.com; Wed, 1 Jan 2020 00:00:00 +0000\r\n\
From: a@example.com\r\n\
To: b@example.com\r\n\
Subject: hello\r\n\
\r\n\
Body text.\r\n";
        let parsed = Message::parse(msg);
        assert_eq!(parsed.emit(), &msg[..]);
        assert_eq!(parsed.trace_groups().len(), 1);
        assert_eq!(parsed.trace_groups()[0].received.len(), 1);
        assert!(parsed.field("Subject").is_some());
    }

    #[test]
    fn normalizes_bare_lf() {
        let msg = b"Subject: hi\nFrom: a@example.com\n\nbody\n";
        let parsed = Message::parse(msg);
        assert_eq!(parsed.field("Subject").unwrap().unfolded_value(), "hi");
        assert_eq!(parsed.body, b"body\n");
    }

    #[test]
    fn unknown_field_is_optional_malformed_is_invalid() {
        let msg = b"X-Custom: value\r\nNotAField\r\nSubject: hi\r\n\r\nbody";
        let parsed = Message::parse(msg);
        assert_eq!(parsed.optional_fields().count(), 1);
        assert_eq!(parsed.invalid_fields().count(), 1);
        let invalid = parsed.invalid_fields().next().unwrap();
        assert!(invalid.raw.starts_with(b"NotAField"));
    }

    #[test]
    fn folded_value_unfolds_to_single_space() {
        let msg = b"Subject: line one\r\n line two\r\n\r\nbody";
        let parsed = Message::parse(msg);
        assert_eq!(
            parsed.field("Subject").unwrap().unfolded_value(),
            "line one line two"
        );
    }
}
