//! Base64 (RFC 4648) wrapper over the `base64` crate: standard vs URL-safe
//! alphabet, optional padding, optional line-wrap -- used by MIME `Content-Transfer-Encoding:
//! base64` bodies and by DKIM's `b=`/`bh=` tag values.

use base64::engine::general_purpose::{GeneralPurpose, GeneralPurposeConfig};
use base64::engine::Engine;
use base64::alphabet;

#[derive(Clone, Copy, Debug)]
pub struct Mode {
    pub url_safe: bool,
    pub pad: bool,
    pub wrap_at: Option<usize>,
}

impl Default for Mode {
    fn default() -> Self {
        Mode {
            url_safe: false,
            pad: true,
            wrap_at: None,
        }
    }
}

fn engine(mode: Mode) -> GeneralPurpose {
    let alpha = if mode.url_safe {
        alphabet::URL_SAFE
    } else {
        alphabet::STANDARD
    };
    let cfg = GeneralPurposeConfig::new()
        .with_encode_padding(mode.pad)
        .with_decode_padding_mode(base64::engine::DecodePaddingMode::Indifferent);
    GeneralPurpose::new(&alpha, cfg)
}

pub fn encode(data: &[u8], mode: Mode) -> String {
    let raw = engine(mode).encode(data);
    match mode.wrap_at {
        None => raw,
        Some(width) if width == 0 => raw,
        Some(width) => {
            let mut out = String::with_capacity(raw.len() + raw.len() / width * 2);
            for chunk in raw.as_bytes().chunks(width) {
                out.push_str(std::str::from_utf8(chunk).expect("base64 output is ASCII"));
                out.push_str("\r\n");
            }
            out
        }
    }
}

pub fn decode(s: &str, mode: Mode) -> Option<Vec<u8>> {
    let stripped: String = s.chars().filter(|c| !c.is_whitespace()).collect();
    engine(mode).decode(stripped).ok()
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn known_answer_padded() {
        let mode = Mode::default();
        assert_eq!(encode(b"foobar", mode), "Zm9vYmFy");
    }

    #[test]
    fn round_trip_unpadded_url_safe() {
        let mode = Mode {
            url_safe: true,
            pad: false,
            wrap_at: None,
        };
        let sample = &[0xfbu8, 0xff, 0xfe, 0x00, 0x01][..];
        let encoded = encode(sample, mode);
        assert_eq!(decode(&encoded, mode).unwrap(), sample);
    }

    #[test]
    fn round_trip_wrapped() {
        let mode = Mode {
            url_safe: false,
            pad: true,
            wrap_at: Some(76),
        };
        let sample = vec![7u8; 300];
        let encoded = encode(&sample, mode);
        assert!(encoded.contains("\r\n"));
        assert_eq!(decode(&encoded, mode).unwrap(), sample);
    }
}
