//! Quoted-printable (RFC 2045 §6.7) encode/decode: any byte outside the safe set
//! is emitted as `=HH`; trailing whitespace on a line is escaped; soft line breaks (`=\r\n`) are
//! inserted so no line exceeds 76 chars (75 for continuations). Decoding preserves invalid
//! escapes verbatim and strips whitespace immediately preceding a hard line break.

fn is_safe(b: u8) -> bool {
    (33..=126).contains(&b) && b != b'='
}

fn hex_digit(b: u8) -> u8 {
    b"0123456789ABCDEF"[(b & 0xf) as usize]
}

fn hex_val(b: u8) -> Option<u8> {
    match b {
        b'0'..=b'9' => Some(b - b'0'),
        b'A'..=b'F' => Some(b - b'A' + 10),
        b'a'..=b'f' => Some(b - b'a' + 10),
        _ => None,
    }
}

pub fn encode(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len());
    let mut line_len = 0usize;

    let push_literal = |out: &mut Vec<u8>, line_len: &mut usize, b: u8| {
        if *line_len >= 75 {
            out.extend_from_slice(b"=\r\n");
            *line_len = 0;
        }
        out.push(b);
        *line_len += 1;
    };
    let push_hex = |out: &mut Vec<u8>, line_len: &mut usize, b: u8| {
        if *line_len >= 73 {
            out.extend_from_slice(b"=\r\n");
            *line_len = 0;
        }
        out.push(b'=');
        out.push(hex_digit(b >> 4));
        out.push(hex_digit(b));
        *line_len += 3;
    };

    let mut i = 0;
    while i < data.len() {
        let b = data[i];
        if b == b'\r' && data.get(i + 1) == Some(&b'\n') {
            out.extend_from_slice(b"\r\n");
            line_len = 0;
            i += 2;
            continue;
        }
        if b == b'\n' {
            out.push(b'\n');
            line_len = 0;
            i += 1;
            continue;
        }
        if b == b' ' || b == b'\t' {
            let mut j = i;
            while j < data.len() && (data[j] == b' ' || data[j] == b'\t') {
                j += 1;
            }
            let at_break = j >= data.len()
                || data[j] == b'\n'
                || (data[j] == b'\r' && data.get(j + 1) == Some(&b'\n'));
            if at_break {
                for &ws in &data[i..j] {
                    push_hex(&mut out, &mut line_len, ws);
                }
            } else {
                for &ws in &data[i..j] {
                    push_literal(&mut out, &mut line_len, ws);
                }
            }
            i = j;
            continue;
        }
        if is_safe(b) {
            push_literal(&mut out, &mut line_len, b);
        } else {
            push_hex(&mut out, &mut line_len, b);
        }
        i += 1;
    }
    out
}

pub fn decode(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len());
    let mut ws_buf: Vec<u8> = Vec::new();
    let mut i = 0;
    while i < data.len() {
        let b = data[i];
        if b == b' ' || b == b'\t' {
            ws_buf.push(b);
            i += 1;
            continue;
        }
        if b == b'\r' && data.get(i + 1) == Some(&b'\n') {
            ws_buf.clear(); // trailing whitespace before a hard break is stripped
            out.extend_from_slice(b"\r\n");
            i += 2;
            continue;
        }
        if b == b'\n' {
            ws_buf.clear();
            out.push(b'\n');
            i += 1;
            continue;
        }
        if b == b'=' {
            out.append(&mut ws_buf);
            if data.get(i + 1) == Some(&b'\r') && data.get(i + 2) == Some(&b'\n') {
                i += 3; // soft line break
                continue;
            }
            if data.get(i + 1) == Some(&b'\n') {
                i += 2; // tolerated bare-LF soft break
                continue;
            }
            if let (Some(&h), Some(&l)) = (data.get(i + 1), data.get(i + 2)) {
                if let (Some(hi), Some(lo)) = (hex_val(h), hex_val(l)) {
                    out.push((hi << 4) | lo);
                    i += 3;
                    continue;
                }
            }
            // Invalid escape sequence: preserved verbatim.
            out.push(b);
            i += 1;
            continue;
        }
        out.append(&mut ws_buf);
        out.push(b);
        i += 1;
    }
    out.append(&mut ws_buf);
    out
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn round_trip_arbitrary_bytes() {
        for sample in [
            &b""[..],
            b"hello world",
            b"line one\r\nline two\r\n",
            b"trailing spaces   \r\nmore   ",
            &[0u8, 1, 2, 0x3d, 0xff, 0x7f, b'a'][..],
        ] {
            let encoded = encode(sample);
            let decoded = decode(&encoded);
            assert_eq!(decoded, sample);
        }
    }

    #[test]
    fn long_lines_get_soft_breaks() {
        let data = vec![b'A'; 200];
        let encoded = encode(&data);
        for line in encoded.split(|&b| b == b'\n') {
            assert!(line.len() <= 76, "line too long: {}", line.len());
        }
        assert_eq!(decode(&encoded), data);
    }

    #[test]
    fn invalid_escape_preserved() {
        let decoded = decode(b"=ZZ");
        assert_eq!(decoded, b"=ZZ");
    }
}
