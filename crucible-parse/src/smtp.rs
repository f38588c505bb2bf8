//! RFC 5321 wire grammar shared between this crate's parsing layer and `crucible-smtp`'s
//! socket-driving state machine: multi-line reply parsing, enhanced status code
//! extraction, EHLO capability advertisement, and envelope command construction. Line ending is
//! always CRLF on the wire.

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Reply {
    pub code: u16,
    pub enhanced_status: Option<String>,
    pub lines: Vec<String>,
}

impl Reply {
    pub fn is_positive(&self) -> bool {
        (200..300).contains(&self.code)
    }
    pub fn is_transient(&self) -> bool {
        (400..500).contains(&self.code)
    }
    pub fn is_permanent(&self) -> bool {
        (500..600).contains(&self.code)
    }
}

/// Parse a complete multi-line reply: every line but the last must use `-` as the 4th byte
/// separator and share the same 3-digit code; the last line uses a space.
pub fn parse_reply(lines: &[&str]) -> Option<Reply> {
    if lines.is_empty() {
        return None;
    }
    let mut code = None;
    let mut out_lines = Vec::with_capacity(lines.len());
    let last = lines.len() - 1;
    for (i, line) in lines.iter().enumerate() {
        if line.len() < 4 {
            return None;
        }
        let bytes = line.as_bytes();
        if !bytes[0..3].iter().all(|b| b.is_ascii_digit()) {
            return None;
        }
        let c: u16 = line[0..3].parse().ok()?;
        match code {
            None => code = Some(c),
            Some(existing) if existing != c => return None,
            _ => {}
        }
        let sep = bytes[3];
        let expected = if i == last { b' ' } else { b'-' };
        if sep != expected {
            return None;
        }
        out_lines.push(line[4..].to_string());
    }
    let code = code?;
    let enhanced_status = out_lines.first().and_then(|l| extract_enhanced_status(l, code));
    Some(Reply {
        code,
        enhanced_status,
        lines: out_lines,
    })
}

fn extract_enhanced_status(line: &str, code: u16) -> Option<String> {
    let class = (code / 100) as u32;
    let first = line.split(' ').next()?;
    let mut it = first.split('.');
    let a: u32 = it.next()?.parse().ok()?;
    let _b: u32 = it.next()?.parse().ok()?;
    let _c: u32 = it.next()?.parse().ok()?;
    if it.next().is_some() || a != class {
        return None;
    }
    Some(first.to_string())
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct EhloCapabilities {
    pub size: Option<u64>,
    pub eightbitmime: bool,
    pub starttls: bool,
    pub pipelining: bool,
    pub auth_mechanisms: Vec<String>,
}

/// Parse the capability lines of an EHLO reply (the first line is the greeting text, not a
/// capability).
pub fn parse_ehlo_capabilities(reply: &Reply) -> EhloCapabilities {
    let mut caps = EhloCapabilities::default();
    for line in reply.lines.iter().skip(1) {
        let mut words = line.split_whitespace();
        let Some(keyword) = words.next() else {
            continue;
        };
        match keyword.to_ascii_uppercase().as_str() {
            "SIZE" => caps.size = words.next().and_then(|s| s.parse().ok()),
            "8BITMIME" => caps.eightbitmime = true,
            "STARTTLS" => caps.starttls = true,
            "PIPELINING" => caps.pipelining = true,
            "AUTH" => caps.auth_mechanisms = words.map(|w| w.to_ascii_uppercase()).collect(),
            _ => {}
        }
    }
    caps
}

pub fn ehlo_command(hostname: &str) -> String {
    format!("EHLO {hostname}\r\n")
}

pub fn mail_from_command(sender: &str, size: Option<u64>, eightbitmime: bool) -> String {
    let mut cmd = format!("MAIL FROM:<{sender}>");
    if let Some(sz) = size {
        cmd.push_str(&format!(" SIZE={sz}"));
    }
    if eightbitmime {
        cmd.push_str(" BODY=8BITMIME");
    }
    cmd.push_str("\r\n");
    cmd
}

pub fn rcpt_to_command(recipient: &str) -> String {
    format!("RCPT TO:<{recipient}>\r\n")
}

/// Dot-stuff message content for the DATA phase: any line starting with `.` gets a second `.`
/// prepended, and the terminating `.\r\n` is appended.
pub fn dot_stuff(content: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(content.len() + content.len() / 64 + 5);
    for line in content.split_inclusive(|&b| b == b'\n') {
        if line.starts_with(b".") {
            out.push(b'.');
        }
        out.extend_from_slice(line);
    }
    if !out.ends_with(b"\n") {
        out.extend_from_slice(b"\r\n");
    }
    out.extend_from_slice(b".\r\n");
    out
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn parses_multiline_ehlo_reply() {
        let lines = [
            "250-mx.example.com greets you",
            "250-SIZE 35882577",
            "250-8BITMIME",
            "250-STARTTLS",
            "250-PIPELINING",
            "250 AUTH LOGIN PLAIN",
        ];
        let reply = parse_reply(&lines).unwrap();
        assert_eq!(reply.code, 250);
        let caps = parse_ehlo_capabilities(&reply);
        assert_eq!(caps.size, Some(35882577));
        assert!(caps.eightbitmime);
        assert!(caps.starttls);
        assert!(caps.pipelining);
        assert_eq!(caps.auth_mechanisms, vec!["LOGIN", "PLAIN"]);
    }

    #[test]
    fn enhanced_status_extracted_when_class_matches() {
        let lines = ["550 5.1.1 User unknown"];
        let reply = parse_reply(&lines).unwrap();
        assert_eq!(reply.enhanced_status.as_deref(), Some("5.1.1"));
        assert!(reply.is_permanent());
    }

    #[test]
    fn mismatched_continuation_codes_rejected() {
        let lines = ["250-ok", "251 mismatch"];
        assert!(parse_reply(&lines).is_none());
    }

    #[test]
    fn dot_stuffing_escapes_leading_dots() {
        let content = b"Hi\r\n.secret\r\nbye";
        let stuffed = dot_stuff(content);
        assert_eq!(&stuffed, b"Hi\r\n..secret\r\nbye\r\n.\r\n");
    }
}
