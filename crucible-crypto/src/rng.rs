// Abstract RNG capability: fill a buffer with cryptographic random bytes, and
// draw a uniform integer in [0, n] by rejection sampling. The core (ObjId generation, MIME
// boundary seeding, nonce generation) consumes this trait rather than a concrete RNG so tests
// can substitute a deterministic source; `OsRng` is the only provider shipped here.

use rand::RngCore;

pub trait Rng: Send + Sync {
    fn fill_bytes(&self, buf: &mut [u8]);

    /// Draw a uniform value in `[0, n]` inclusive, by masking to the smallest `2^k - 1 >= n`
    /// and re-drawing on out-of-range results,.
    fn below_or_eq(&self, n: u64) -> u64 {
        if n == 0 {
            return 0;
        }
        let bits = 64 - n.leading_zeros();
        let mask: u64 = if bits >= 64 { u64::MAX } else { (1u64 << bits) - 1 };
        loop {
            let mut buf = [0u8; 8];
            self.fill_bytes(&mut buf);
            let v = u64::from_le_bytes(buf) & mask;
            if v <= n {
                return v;
            }
        }
    }

    fn random_u128(&self) -> u128 {
        let mut buf = [0u8; 16];
        self.fill_bytes(&mut buf);
        u128::from_be_bytes(buf)
    }
}

#[derive(Clone, Copy, Default)]
pub struct OsRng;

impl Rng for OsRng {
    fn fill_bytes(&self, buf: &mut [u8]) {
        rand::rngs::OsRng.fill_bytes(buf);
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn below_or_eq_is_bounded() {
        let rng = OsRng;
        for _ in 0..1000 {
            let v = rng.below_or_eq(7);
            assert!(v <= 7);
        }
        assert_eq!(rng.below_or_eq(0), 0);
    }
}
