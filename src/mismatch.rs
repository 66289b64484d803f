//! Approximate lookup by precomputed substitution patterns.
//!
//! A substitution at base `i` XORs the mer with `x << 2i` for `x` in 1..=3.
//! Since the hash is XOR-linear, a mer within `n` substitutions of the query
//! `q` lives in bucket `hash(q) ^ hash(e)` for one of the patterns `e`. The
//! matcher keeps the distinct `hash(e)` values so a query probes each
//! candidate bucket once.

use crate::codec::BitCodec;
use crate::index::IndexError;

/// Ceiling on the number of enumerated substitution patterns.
pub const MAX_ERROR_PATTERNS: u64 = 1 << 24;

#[derive(Clone, Debug)]
pub struct MismatchMatcher {
    max_mismatches: u32,
    patterns: u64,
    hashed_errors: Vec<u64>,
    cost: f64,
}

impl MismatchMatcher {
    /// Enumerate every pattern of up to `max_mismatches` substituted bases.
    ///
    /// `approx_distinct` only feeds the cost estimate: the expected number of
    /// entries a query scans.
    pub fn new(
        codec: &BitCodec,
        mer_size: u32,
        max_mismatches: u32,
        approx_distinct: u64,
    ) -> Result<Self, IndexError> {
        if max_mismatches > mer_size {
            return Err(IndexError::Config(format!(
                "{max_mismatches} mismatches exceed the mer size {mer_size}"
            )));
        }
        let patterns = pattern_count(mer_size, max_mismatches);
        if patterns > MAX_ERROR_PATTERNS {
            return Err(IndexError::Config(format!(
                "{max_mismatches} mismatches over {mer_size} bases need {patterns} patterns \
                 (limit {MAX_ERROR_PATTERNS})"
            )));
        }

        let mut hashed_errors = Vec::with_capacity(patterns as usize);
        enumerate(codec, mer_size, 0, max_mismatches, 0, &mut hashed_errors);
        hashed_errors.sort_unstable();
        hashed_errors.dedup();

        let per_bucket = approx_distinct as f64 / (1u64 << codec.table_bits()) as f64;
        let cost = hashed_errors.len() as f64 * per_bucket;

        Ok(Self {
            max_mismatches,
            patterns,
            hashed_errors,
            cost,
        })
    }

    #[inline]
    pub fn max_mismatches(&self) -> u32 {
        self.max_mismatches
    }

    /// Substitution patterns enumerated, including the empty one.
    #[inline]
    pub fn patterns(&self) -> u64 {
        self.patterns
    }

    /// Distinct bucket offsets probed per query.
    #[inline]
    pub fn hashed_errors(&self) -> &[u64] {
        &self.hashed_errors
    }

    /// Expected entries scanned per query.
    #[inline]
    pub fn cost(&self) -> f64 {
        self.cost
    }
}

/// `sum_{i=0..=n} C(k, i) * 3^i`, saturating.
fn pattern_count(k: u32, n: u32) -> u64 {
    let mut total = 0u64;
    let mut choose = 1u64;
    let mut pow3 = 1u64;
    for i in 0..=n {
        total = total.saturating_add(choose.saturating_mul(pow3));
        choose = choose.saturating_mul((k - i) as u64) / (i as u64 + 1);
        pow3 = pow3.saturating_mul(3);
    }
    total
}

fn enumerate(codec: &BitCodec, k: u32, from: u32, left: u32, pattern: u64, out: &mut Vec<u64>) {
    out.push(codec.hash(pattern));
    if left == 0 {
        return;
    }
    for base in from..k {
        for x in 1..=3u64 {
            enumerate(codec, k, base + 1, left - 1, pattern | (x << (2 * base)), out);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counts_patterns() {
        assert_eq!(pattern_count(4, 0), 1);
        assert_eq!(pattern_count(4, 1), 1 + 12);
        assert_eq!(pattern_count(4, 2), 1 + 12 + 6 * 9);
        assert_eq!(pattern_count(32, 3), 1 + 96 + 496 * 9 + 4960 * 27);
    }

    #[test]
    fn enumerates_every_pattern() {
        let codec = BitCodec::new(5, 4).unwrap();
        let m = MismatchMatcher::new(&codec, 5, 2, 100).unwrap();
        assert_eq!(m.patterns(), 1 + 15 + 10 * 9);
        assert!(m.hashed_errors().contains(&0));
        assert!(m.hashed_errors().len() <= 16);
        assert!(m.cost() > 0.0);
    }

    #[test]
    fn rejects_oversized_budgets() {
        let codec = BitCodec::new(32, 24).unwrap();
        assert!(MismatchMatcher::new(&codec, 32, 8, 1).is_err());
        assert!(MismatchMatcher::new(&codec, 4, 5, 1).is_err());
    }
}
