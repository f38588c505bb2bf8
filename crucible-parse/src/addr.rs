//! Casual and strict email address-list extraction. A "casual" list tolerates
//! RFC 5322 comments (CFWS) anywhere, commas or semicolons as separators, and group syntax
//! (`display-name: mailbox-list;`). Addresses are normalized to a `local-part@domain` pair and
//! handed to a caller-supplied callback in source order; on failure the diagnostic and the count
//! of addresses already delivered are both returned, per the extraction API's contract.

use std::fmt;

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct AddrSpec {
    pub local_part: String,
    pub domain: String,
}

impl fmt::Display for AddrSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.local_part, self.domain)
    }
}

fn is_atext(b: u8) -> bool {
    b.is_ascii_alphanumeric()
        || matches!(
            b,
            b'!' | b'#'
                | b'$'
                | b'%'
                | b'&'
                | b'\''
                | b'*'
                | b'+'
                | b'-'
                | b'/'
                | b'='
                | b'?'
                | b'^'
                | b'_'
                | b'`'
                | b'{'
                | b'|'
                | b'}'
                | b'~'
        )
}

/// Skip folding whitespace and (possibly nested) comments.
fn skip_cfws(data: &[u8], mut i: usize) -> usize {
    loop {
        let before = i;
        while i < data.len() && matches!(data[i], b' ' | b'\t' | b'\r' | b'\n') {
            i += 1;
        }
        if data.get(i) == Some(&b'(') {
            i = skip_comment(data, i);
        }
        if i == before {
            break;
        }
    }
    i
}

fn skip_comment(data: &[u8], mut i: usize) -> usize {
    i += 1; // opening '('
    let mut depth = 1usize;
    while i < data.len() && depth > 0 {
        match data[i] {
            b'\\' if i + 1 < data.len() => i += 2,
            b'(' => {
                depth += 1;
                i += 1;
            }
            b')' => {
                depth -= 1;
                i += 1;
            }
            _ => i += 1,
        }
    }
    i
}

fn parse_quoted_string(data: &[u8], i: usize) -> Option<(String, usize)> {
    if data.get(i) != Some(&b'"') {
        return None;
    }
    let mut j = i + 1;
    let mut out = Vec::new();
    loop {
        match data.get(j) {
            None => return None,
            Some(b'"') => {
                j += 1;
                break;
            }
            Some(b'\\') => {
                let &c = data.get(j + 1)?;
                out.push(c);
                j += 2;
            }
            Some(b'\r')
                if data.get(j + 1) == Some(&b'\n')
                    && matches!(data.get(j + 2), Some(b' ') | Some(b'\t')) =>
            {
                out.push(b' ');
                j += 3;
            }
            Some(&c) => {
                out.push(c);
                j += 1;
            }
        }
    }
    Some((String::from_utf8_lossy(&out).into_owned(), j))
}

fn parse_dot_atom(data: &[u8], i: usize) -> Option<(String, usize)> {
    let start = i;
    let mut j = i;
    if !matches!(data.get(j), Some(&b) if is_atext(b)) {
        return None;
    }
    while matches!(data.get(j), Some(&b) if is_atext(b)) {
        j += 1;
    }
    while data.get(j) == Some(&b'.') && matches!(data.get(j + 1), Some(&b) if is_atext(b)) {
        j += 1;
        while matches!(data.get(j), Some(&b) if is_atext(b)) {
            j += 1;
        }
    }
    Some((String::from_utf8_lossy(&data[start..j]).into_owned(), j))
}

fn parse_domain_literal(data: &[u8], i: usize) -> Option<(String, usize)> {
    if data.get(i) != Some(&b'[') {
        return None;
    }
    let mut j = i + 1;
    let start = i;
    loop {
        match data.get(j) {
            None => return None,
            Some(b']') => {
                j += 1;
                break;
            }
            Some(b'\\') if j + 1 < data.len() => j += 2,
            Some(b'[') => return None,
            _ => j += 1,
        }
    }
    Some((String::from_utf8_lossy(&data[start..j]).into_owned(), j))
}

fn parse_addr_spec(data: &[u8], i: usize) -> Option<(AddrSpec, usize)> {
    let mut j = skip_cfws(data, i);
    let (local_part, j1) = if data.get(j) == Some(&b'"') {
        parse_quoted_string(data, j)?
    } else {
        parse_dot_atom(data, j)?
    };
    j = skip_cfws(data, j1);
    if data.get(j) != Some(&b'@') {
        return None;
    }
    j = skip_cfws(data, j + 1);
    let (domain, j2) = if data.get(j) == Some(&b'[') {
        parse_domain_literal(data, j)?
    } else {
        parse_dot_atom(data, j)?
    };
    Some((AddrSpec { local_part, domain }, j2))
}

/// Consume an optional display-name followed by `< addr-spec >`.
fn try_angle_addr(data: &[u8], start: usize) -> Option<(AddrSpec, usize)> {
    let mut j = start;
    loop {
        let k = skip_cfws(data, j);
        match data.get(k) {
            Some(&b'<') => {
                let m = skip_cfws(data, k + 1);
                let (spec, m1) = parse_addr_spec(data, m)?;
                let m2 = skip_cfws(data, m1);
                return if data.get(m2) == Some(&b'>') {
                    Some((spec, m2 + 1))
                } else {
                    None
                };
            }
            Some(&b'"') => {
                let (_, k1) = parse_quoted_string(data, k)?;
                j = k1;
            }
            Some(&b) if is_atext(b) => {
                let (_, k1) = parse_dot_atom(data, k)?;
                j = k1;
            }
            _ => return None,
        }
    }
}

fn parse_mailbox(data: &[u8], i: usize) -> Option<(AddrSpec, usize)> {
    let j = skip_cfws(data, i);
    if let Some(found) = try_angle_addr(data, j) {
        return Some(found);
    }
    parse_addr_spec(data, j)
}

/// Look ahead from `start` for a `:` occurring before `@`/`,`/`;`/`<`/end-of-input, skipping
/// comments and quoted strings along the way. A hit means this is a group: `display-name:
/// mailbox-list;`.
fn detect_group_colon(data: &[u8], start: usize) -> Option<usize> {
    let mut i = start;
    loop {
        i = skip_cfws(data, i);
        match data.get(i) {
            Some(b':') => return Some(i),
            Some(b'@') | Some(b',') | Some(b';') | Some(b'<') | None => return None,
            Some(b'"') => {
                let (_, next) = parse_quoted_string(data, i)?;
                i = next;
            }
            Some(&b) if is_atext(b) => {
                let (_, next) = parse_dot_atom(data, i)?;
                i = next;
            }
            _ => return None,
        }
    }
}

/// Extract every address from a casual address-list field body, in source order, calling
/// `on_addr` for each. Returns the total count on success, or the diagnostic plus the count
/// already delivered on failure.
pub fn extract_addresses(
    data: &[u8],
    mut on_addr: impl FnMut(AddrSpec),
) -> std::result::Result<usize, (String, usize)> {
    let mut i = 0usize;
    let mut count = 0usize;
    loop {
        i = skip_cfws(data, i);
        if i >= data.len() {
            break;
        }
        if data[i] == b',' || data[i] == b';' {
            i += 1;
            continue;
        }
        if let Some(colon) = detect_group_colon(data, i) {
            i = colon + 1;
            loop {
                i = skip_cfws(data, i);
                match data.get(i) {
                    None => return Err(("unterminated address group".into(), count)),
                    Some(b';') => {
                        i += 1;
                        break;
                    }
                    Some(b',') => {
                        i += 1;
                        continue;
                    }
                    _ => match parse_mailbox(data, i) {
                        Some((spec, next)) => {
                            on_addr(spec);
                            count += 1;
                            i = next;
                        }
                        None => {
                            return Err((format!("address parse failed at byte {i}"), count))
                        }
                    },
                }
            }
            continue;
        }
        match parse_mailbox(data, i) {
            Some((spec, next)) => {
                on_addr(spec);
                count += 1;
                i = next;
            }
            None => return Err((format!("address parse failed at byte {i}"), count)),
        }
    }
    Ok(count)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn scenario_s2_single_address_amid_comments() {
        let input = b"(!) \"foo;bar,shar!\" (woof \r\n \"\"\") @ (blah; zar, far) +-!~.example.com (???)";
        let mut found = Vec::new();
        let count = extract_addresses(input, |a| found.push(a)).expect("should parse");
        assert_eq!(count, 1);
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].local_part, "foo;bar,shar!");
        assert_eq!(found[0].domain, "+-!~.example.com");
    }

    #[test]
    fn simple_comma_separated_list() {
        let input = b"alice@example.com, bob@example.org";
        let mut found = Vec::new();
        let count = extract_addresses(input, |a| found.push(a)).unwrap();
        assert_eq!(count, 2);
        assert_eq!(found[0].to_string(), "alice@example.com");
        assert_eq!(found[1].to_string(), "bob@example.org");
    }

    #[test]
    fn angle_addr_with_display_name() {
        let input = b"Alice Example <alice@example.com>";
        let mut found = Vec::new();
        extract_addresses(input, |a| found.push(a)).unwrap();
        assert_eq!(found[0].to_string(), "alice@example.com");
    }

    #[test]
    fn group_syntax() {
        let input = b"undisclosed-recipients: a@example.com, b@example.com;";
        let mut found = Vec::new();
        let count = extract_addresses(input, |a| found.push(a)).unwrap();
        assert_eq!(count, 2);
    }

    #[test]
    fn malformed_input_reports_partial_count() {
        let input = b"a@example.com, @@@";
        let mut found = Vec::new();
        let err = extract_addresses(input, |a| found.push(a)).unwrap_err();
        assert_eq!(err.1, 1);
    }
}
