//! Bit-packed word buffers: every variable-width field lives at an explicit
//! `(bit offset, bit width)` inside an owned `Vec<u64>`.

use crate::index::IndexError;

/// Mask of the low `width` bits. `width` may be 0..=64.
#[inline]
pub const fn low_mask(width: u32) -> u64 {
    if width >= 64 { u64::MAX } else { (1u64 << width) - 1 }
}

/// Number of bits needed to store any value in `0..=n`, never less than one.
#[inline]
pub const fn bits_for(n: u64) -> u32 {
    let b = 64 - n.leading_zeros();
    if b == 0 { 1 } else { b }
}

/// Words needed to hold `n` fields of `width` bits.
#[inline]
pub fn words_for(n: u64, width: u32) -> Result<usize, IndexError> {
    n.checked_mul(width as u64)
        .map(|bits| bits.div_ceil(64))
        .and_then(|w| usize::try_from(w).ok())
        .ok_or_else(|| IndexError::Resource(format!("{n} fields of {width} bits overflow")))
}

/// Allocate `n` zeroed words, reporting allocation failure instead of aborting.
pub(crate) fn zeroed_words(n: usize) -> Result<Vec<u64>, IndexError> {
    let mut v = Vec::new();
    v.try_reserve_exact(n)
        .map_err(|e| IndexError::Resource(format!("allocating {n} words: {e}")))?;
    v.resize(n, 0);
    Ok(v)
}

/// Growable array of packed bits.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PackedWords {
    words: Vec<u64>,
}

impl PackedWords {
    /// Zeroed buffer holding `n` fields of `width` bits.
    pub fn for_fields(n: u64, width: u32) -> Result<Self, IndexError> {
        Ok(Self {
            words: zeroed_words(words_for(n, width)?)?,
        })
    }

    /// Wrap words read back from disk.
    pub fn from_words(words: Vec<u64>) -> Self {
        Self { words }
    }

    #[inline]
    pub fn words(&self) -> &[u64] {
        &self.words
    }

    #[inline]
    pub fn capacity_bits(&self) -> u64 {
        self.words.len() as u64 * 64
    }

    /// Grow (zero-filled) so that at least `bits` are addressable; grows to
    /// `max(needed, 2 * current)` words so repeated growth stays linear.
    pub fn grow_to_bits(&mut self, bits: u64) -> Result<(), IndexError> {
        let needed = words_for(bits, 1)?;
        if needed <= self.words.len() {
            return Ok(());
        }
        let target = needed.max(self.words.len().saturating_mul(2));
        let extra = target - self.words.len();
        self.words
            .try_reserve_exact(extra)
            .map_err(|e| IndexError::Resource(format!("growing to {target} words: {e}")))?;
        self.words.resize(target, 0);
        Ok(())
    }

    /// Drop words past the first `bits` bits.
    pub fn truncate_to_bits(&mut self, bits: u64) {
        let keep = bits.div_ceil(64) as usize;
        self.words.truncate(keep);
        self.words.shrink_to_fit();
    }

    /// Read the `width`-bit field starting at bit `pos`.
    #[inline]
    pub fn get(&self, pos: u64, width: u32) -> u64 {
        debug_assert!(width <= 64);
        if width == 0 {
            return 0;
        }
        let w = (pos / 64) as usize;
        let off = (pos % 64) as u32;
        let lo = self.words[w] >> off;
        if off + width <= 64 {
            lo & low_mask(width)
        } else {
            let hi = self.words[w + 1] << (64 - off);
            (lo | hi) & low_mask(width)
        }
    }

    /// Write the low `width` bits of `value` at bit `pos`.
    #[inline]
    pub fn set(&mut self, pos: u64, width: u32, value: u64) {
        debug_assert!(width <= 64);
        if width == 0 {
            return;
        }
        let value = value & low_mask(width);
        let w = (pos / 64) as usize;
        let off = (pos % 64) as u32;
        if off + width <= 64 {
            let m = low_mask(width) << off;
            self.words[w] = (self.words[w] & !m) | (value << off);
        } else {
            let lo_bits = 64 - off;
            self.words[w] = (self.words[w] & low_mask(off)) | (value << off);
            let hi_bits = width - lo_bits;
            self.words[w + 1] = (self.words[w + 1] & !low_mask(hi_bits)) | (value >> lo_bits);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fields_straddle_word_boundaries() {
        let mut p = PackedWords::for_fields(10, 13).unwrap();
        for i in 0..10u64 {
            p.set(i * 13, 13, 0x1000 | i * 37);
        }
        for i in 0..10u64 {
            assert_eq!(p.get(i * 13, 13), 0x1000 | i * 37);
        }
    }

    #[test]
    fn full_width_fields() {
        let mut p = PackedWords::for_fields(3, 64).unwrap();
        p.set(0, 1, 1);
        p.set(1, 64, u64::MAX - 5);
        p.set(65, 3, 0b101);
        assert_eq!(p.get(0, 1), 1);
        assert_eq!(p.get(1, 64), u64::MAX - 5);
        assert_eq!(p.get(65, 3), 0b101);
    }

    #[test]
    fn set_does_not_clobber_neighbours() {
        let mut p = PackedWords::for_fields(1, 128).unwrap();
        p.set(0, 64, u64::MAX);
        p.set(64, 64, u64::MAX);
        p.set(60, 8, 0);
        assert_eq!(p.get(52, 8), 0xFF);
        assert_eq!(p.get(60, 8), 0);
        assert_eq!(p.get(68, 8), 0xFF);
    }

    #[test]
    fn growth_keeps_contents() {
        let mut p = PackedWords::default();
        p.grow_to_bits(10).unwrap();
        p.set(3, 7, 0x55);
        p.grow_to_bits(1000).unwrap();
        assert!(p.capacity_bits() >= 1000);
        assert_eq!(p.get(3, 7), 0x55);
    }

    #[test]
    fn widths() {
        assert_eq!(bits_for(0), 1);
        assert_eq!(bits_for(1), 1);
        assert_eq!(bits_for(2), 2);
        assert_eq!(bits_for(255), 8);
        assert_eq!(bits_for(256), 9);
        assert_eq!(low_mask(0), 0);
        assert_eq!(low_mask(64), u64::MAX);
    }
}
