//! Hash/check split of a mer and its exact inverse.
//!
//! A mer of `mer_bits` bits is stored as a bucket number (`hash`, `table_bits`
//! wide) plus the low `mer_bits - table_bits` bits (`check`). Both maps are
//! XOR-linear, so `hash(a ^ b) == hash(a) ^ hash(b)`.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::bits::low_mask;
use crate::index::IndexError;

/// Widest mer that fits the 64-bit code.
pub const MAX_MER_SIZE: u32 = 32;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BitCodec {
    mer_bits: u32,
    table_bits: u32,
    shift1: u32,
    shift2: u32,
    mask1: u64,
    mask2: u64,
}

impl BitCodec {
    /// Codec for mers of `mer_size` bases hashed into `2^table_bits` buckets.
    pub fn new(mer_size: u32, table_bits: u32) -> Result<Self, IndexError> {
        if mer_size == 0 || mer_size > MAX_MER_SIZE {
            return Err(IndexError::Config(format!(
                "mer size {mer_size} bases does not fit a 64-bit code (1..={MAX_MER_SIZE})"
            )));
        }
        let mer_bits = 2 * mer_size;
        if table_bits == 0 || table_bits >= mer_bits {
            return Err(IndexError::Config(format!(
                "table of {table_bits} bits cannot split a {mer_bits}-bit mer"
            )));
        }
        let shift1 = mer_bits - table_bits;
        let shift2 = shift1 / 2;
        Ok(Self {
            mer_bits,
            table_bits,
            shift1,
            shift2,
            mask1: low_mask(table_bits),
            mask2: low_mask(shift1),
        })
    }

    #[inline]
    pub fn mer_bits(&self) -> u32 {
        self.mer_bits
    }

    #[inline]
    pub fn table_bits(&self) -> u32 {
        self.table_bits
    }

    /// Width of the check field.
    #[inline]
    pub fn check_width(&self) -> u32 {
        self.shift1
    }

    #[inline]
    pub fn shifts(&self) -> (u32, u32) {
        (self.shift1, self.shift2)
    }

    #[inline]
    pub fn masks(&self) -> (u64, u64) {
        (self.mask1, self.mask2)
    }

    #[inline]
    pub fn hash(&self, m: u64) -> u64 {
        ((m >> self.shift1) ^ (m >> self.shift2) ^ m) & self.mask1
    }

    #[inline]
    pub fn check(&self, m: u64) -> u64 {
        m & self.mask2
    }

    /// Recover the mer from its bucket and check value.
    ///
    /// Bit `i` of the hash is `m[i + s1] ^ m[i + s2] ^ m[i]`, so every stride
    /// of `s1 - s2` bits above the check can be solved from bits already
    /// known. Small checks need many strides, hence the loop.
    pub fn rebuild(&self, h: u64, c: u64) -> u64 {
        let sha = self.shift1 - self.shift2;
        let msk = low_mask(sha);

        let mut mer = c;
        let mut shf = self.shift2;
        let mut shg = 0;
        let mut shh = self.shift1;

        loop {
            mer |= (((h >> shg) ^ (mer >> shg) ^ (mer >> shf)) & msk) << shh;

            shf += sha;
            shg += sha;
            shh += sha;
            if shf >= self.mer_bits || shh >= 64 {
                break;
            }
        }

        mer & low_mask(self.mer_bits)
    }

    /// Check `rebuild(hash(m), check(m)) == m` on boundary mers and `samples`
    /// random ones. Meant for configuration selection and tests only.
    pub fn validate(&self, samples: usize, seed: u64) -> Result<(), IndexError> {
        let full = low_mask(self.mer_bits);
        let boundary = [0, full, self.mask2, full & !self.mask2]
            .into_iter()
            .chain((0..self.mer_bits).map(|b| 1u64 << b));

        let mut rng = StdRng::seed_from_u64(seed);
        let random = (0..samples).map(move |_| rng.gen_range(0..=full));

        for m in boundary.chain(random) {
            let r = self.rebuild(self.hash(m), self.check(m));
            if r != m {
                return Err(IndexError::Config(format!(
                    "hash/check split does not invert: mer {m:#x} rebuilt as {r:#x} \
                     (shift1={}, shift2={}, table bits={})",
                    self.shift1, self.shift2, self.table_bits
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_geometry_inverts() {
        for k in 1..=MAX_MER_SIZE {
            for t in 1..(2 * k) {
                let c = BitCodec::new(k, t).unwrap();
                c.validate(256, k as u64 * 1000 + t as u64).unwrap();
            }
        }
    }

    #[test]
    fn exhaustive_small_mers() {
        let c = BitCodec::new(4, 5).unwrap();
        for m in 0..256u64 {
            assert_eq!(c.rebuild(c.hash(m), c.check(m)), m);
            assert!(c.hash(m) < 32);
        }
    }

    #[test]
    fn hash_is_xor_linear() {
        let c = BitCodec::new(12, 9).unwrap();
        let (a, b) = (0x00AB_CDEFu64, 0x0012_3456u64);
        assert_eq!(c.hash(a ^ b), c.hash(a) ^ c.hash(b));
        assert_eq!(c.check(a ^ b), c.check(a) ^ c.check(b));
    }

    #[test]
    fn rejects_bad_geometry() {
        assert!(BitCodec::new(0, 1).is_err());
        assert!(BitCodec::new(33, 20).is_err());
        assert!(BitCodec::new(4, 8).is_err());
        assert!(BitCodec::new(4, 0).is_err());
    }
}
