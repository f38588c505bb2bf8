// Streaming hash capability: Init -> Update* -> Final. MD5 is exposed only for
// non-security purposes (e.g. MIME boundary seeding), never for signatures.

use md5::Md5;
use sha1::Sha1;
use sha2::Sha256;

use sha1::Digest as _;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum HashAlg {
    Sha1,
    Sha256,
    Md5,
}

pub trait StreamingHash: Send {
    fn update(&mut self, data: &[u8]);
    fn finalize(self: Box<Self>) -> Vec<u8>;
}

struct Sha1State(Sha1);
impl StreamingHash for Sha1State {
    fn update(&mut self, data: &[u8]) {
        sha1::Digest::update(&mut self.0, data);
    }
    fn finalize(self: Box<Self>) -> Vec<u8> {
        sha1::Digest::finalize(self.0).to_vec()
    }
}

struct Sha256State(Sha256);
impl StreamingHash for Sha256State {
    fn update(&mut self, data: &[u8]) {
        sha2::Digest::update(&mut self.0, data);
    }
    fn finalize(self: Box<Self>) -> Vec<u8> {
        sha2::Digest::finalize(self.0).to_vec()
    }
}

struct Md5State(Md5);
impl StreamingHash for Md5State {
    fn update(&mut self, data: &[u8]) {
        md5::Digest::update(&mut self.0, data);
    }
    fn finalize(self: Box<Self>) -> Vec<u8> {
        md5::Digest::finalize(self.0).to_vec()
    }
}

impl HashAlg {
    pub fn init(&self) -> Box<dyn StreamingHash> {
        match self {
            HashAlg::Sha1 => Box::new(Sha1State(Sha1::new())),
            HashAlg::Sha256 => Box::new(Sha256State(Sha256::new())),
            HashAlg::Md5 => Box::new(Md5State(Md5::new())),
        }
    }

    pub fn digest(&self, data: &[u8]) -> Vec<u8> {
        let mut h = self.init();
        h.update(data);
        h.finalize()
    }

    pub fn output_len(&self) -> usize {
        match self {
            HashAlg::Sha1 => 20,
            HashAlg::Sha256 => 32,
            HashAlg::Md5 => 16,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn sha256_known_answer() {
        let digest = HashAlg::Sha256.digest(b"");
        assert_eq!(
            hex::encode(digest),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b85"
        );
    }

    #[test]
    fn streaming_matches_oneshot() {
        let mut h = HashAlg::Sha1.init();
        h.update(b"foo");
        h.update(b"bar");
        let streamed = h.finalize();
        let oneshot = HashAlg::Sha1.digest(b"foobar");
        assert_eq!(streamed, oneshot);
    }
}
