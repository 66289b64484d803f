//! Mer encoding: 2-bit mapping, reverse complement, canonicalization and
//! base-substitution distance.
//!
//! Conventions
//! - Codes are **LSB-aligned**: a mer of `k` bases occupies the lower `2k` bits,
//!   first base in the highest pair.
//! - `k` is at most 32 so every mer fits one `u64`.

/// 256-entry LUT: ASCII → 2-bit (A=0, C=1, G=2, T/U=3), 0xFF for ambiguous.
pub static MAP_LUT: [u8; 256] = {
    const X: u8 = 0xFF;
    let mut t = [X; 256];
    t[b'A' as usize] = 0;
    t[b'a' as usize] = 0;
    t[b'C' as usize] = 1;
    t[b'c' as usize] = 1;
    t[b'G' as usize] = 2;
    t[b'g' as usize] = 2;
    t[b'T' as usize] = 3;
    t[b't' as usize] = 3;
    t[b'U' as usize] = 3;
    t[b'u' as usize] = 3;
    t
};

const BASES: [u8; 4] = *b"ACGT";

/// Every other bit set; selects the low bit of each 2-bit base.
const LOW_BASE_BITS: u64 = 0x5555_5555_5555_5555;

/// 2-bit encoding via LUT: A=00, C=01, G=10, T=11. `None` if ambiguous.
#[inline]
pub fn map_base(b: u8) -> Option<u8> {
    let v = MAP_LUT[b as usize];
    if v <= 3 { Some(v) } else { None }
}

/// Mask covering the `2k` bits of a `k`-base mer.
#[inline]
pub fn mer_mask(k: usize) -> u64 {
    if k >= 32 { u64::MAX } else { (1u64 << (2 * k)) - 1 }
}

/// Encode a mer window to an LSB-aligned `u64`. None if `k>32` or ambiguous.
#[inline]
pub fn encode_kmer(window: &[u8]) -> Option<u64> {
    let k = window.len();
    if k == 0 || k > 32 {
        return None;
    }
    let mut code: u64 = 0;
    for &b in window {
        let v = map_base(b)? as u64;
        code = (code << 2) | v;
    }
    Some(code)
}

/// Decode an LSB-aligned code of `k` bases back to ASCII.
pub fn decode_kmer(code: u64, k: usize) -> String {
    debug_assert!(k <= 32);
    (0..k)
        .rev()
        .map(|i| BASES[((code >> (2 * i)) & 0b11) as usize] as char)
        .collect()
}

/// Reverse-complement an LSB-aligned code (lower `2k` bits used).
#[inline]
pub fn revcomp(code: u64, k: usize) -> u64 {
    debug_assert!(k <= 32);
    let mut rc: u64 = 0;
    for i in 0..k {
        let base = (code >> (i * 2)) & 0b11;
        let comp = base ^ 0b11;
        let shift = (k - 1 - i) * 2;
        rc |= comp << shift;
    }
    rc
}

/// Canonical form: the smaller of a mer and its reverse complement.
#[inline]
pub fn canonical(code: u64, k: usize) -> u64 {
    let rc = revcomp(code, k);
    if code <= rc { code } else { rc }
}

/// Number of base positions at which two `k`-base mers differ.
#[inline]
pub fn base_mismatches(a: u64, b: u64, k: usize) -> u32 {
    let x = (a ^ b) & mer_mask(k);
    ((x | (x >> 1)) & LOW_BASE_BITS).count_ones()
}
