//! Construction-time collaborators: the mer stream, membership filters and
//! multiplicity counts, with simple in-memory implementations.

use std::collections::{HashMap, HashSet};

use crate::encode::{MAP_LUT, mer_mask};
use crate::index::IndexError;

/// One mer occurrence.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct MerHit {
    pub mer: u64,
    pub position: u64,
}

/// Forward-only stream of mer occurrences.
///
/// The builder walks the stream once per pass and calls [`rewind`] before
/// each one, so sources that cannot replay must fail there.
///
/// [`rewind`]: MerSource::rewind
pub trait MerSource {
    fn next_hit(&mut self) -> Option<MerHit>;

    /// Restart at the first occurrence.
    fn rewind(&mut self) -> Result<(), IndexError>;

    /// Estimated number of occurrences; sizes the table.
    fn approximate_mers(&self) -> u64;
}

/// Set membership used to mask out or restrict mers.
pub trait MerFilter {
    fn contains(&self, mer: u64) -> bool;

    /// Whether the set holds canonical mers, so queries must canonicalize.
    fn canonical(&self) -> bool {
        false
    }
}

/// Observed multiplicity of a mer.
pub trait MerCounts {
    fn count(&self, mer: u64) -> u64;

    fn canonical(&self) -> bool {
        false
    }
}

impl MerFilter for HashSet<u64> {
    fn contains(&self, mer: u64) -> bool {
        HashSet::contains(self, &mer)
    }
}

impl MerCounts for HashMap<u64, u64> {
    fn count(&self, mer: u64) -> u64 {
        self.get(&mer).copied().unwrap_or(0)
    }
}

/// Marks a filter or count table as holding canonical mers.
#[derive(Clone, Debug, Default)]
pub struct Canonical<T>(pub T);

impl<T: MerFilter> MerFilter for Canonical<T> {
    fn contains(&self, mer: u64) -> bool {
        self.0.contains(mer)
    }
    fn canonical(&self) -> bool {
        true
    }
}

impl<T: MerCounts> MerCounts for Canonical<T> {
    fn count(&self, mer: u64) -> u64 {
        self.0.count(mer)
    }
    fn canonical(&self) -> bool {
        true
    }
}

/// Replayable in-memory list of hits.
#[derive(Clone, Debug, Default)]
pub struct MerList {
    hits: Vec<MerHit>,
    cursor: usize,
}

impl MerList {
    pub fn new(hits: Vec<MerHit>) -> Self {
        Self { hits, cursor: 0 }
    }

    pub fn from_pairs<I: IntoIterator<Item = (u64, u64)>>(pairs: I) -> Self {
        Self::new(
            pairs
                .into_iter()
                .map(|(mer, position)| MerHit { mer, position })
                .collect(),
        )
    }
}

impl MerSource for MerList {
    fn next_hit(&mut self) -> Option<MerHit> {
        let h = self.hits.get(self.cursor).copied();
        self.cursor += h.is_some() as usize;
        h
    }

    fn rewind(&mut self) -> Result<(), IndexError> {
        self.cursor = 0;
        Ok(())
    }

    fn approximate_mers(&self) -> u64 {
        self.hits.len() as u64
    }
}

/// Rolling extraction of forward mers from a base sequence. Ambiguous bases
/// reset the window; the position is the offset of the mer's first base.
#[derive(Clone, Debug)]
pub struct SequenceMers<'a> {
    seq: &'a [u8],
    k: usize,
    mask: u64,
    i: usize,
    fwd: u64,
    len: usize,
}

impl<'a> SequenceMers<'a> {
    pub fn new(seq: &'a [u8], k: usize) -> Result<Self, IndexError> {
        if k == 0 || k > 32 {
            return Err(IndexError::Config(format!("mer size {k} must be 1..=32")));
        }
        Ok(Self {
            seq,
            k,
            mask: mer_mask(k),
            i: 0,
            fwd: 0,
            len: 0,
        })
    }
}

impl MerSource for SequenceMers<'_> {
    fn next_hit(&mut self) -> Option<MerHit> {
        while self.i < self.seq.len() {
            let v_raw = MAP_LUT[self.seq[self.i] as usize];
            self.i += 1;
            if v_raw > 3 {
                // ambiguous: reset
                self.fwd = 0;
                self.len = 0;
                continue;
            }
            self.fwd = ((self.fwd << 2) | v_raw as u64) & self.mask;
            self.len += 1;
            if self.len >= self.k {
                return Some(MerHit {
                    mer: self.fwd,
                    position: (self.i - self.k) as u64,
                });
            }
        }
        None
    }

    fn rewind(&mut self) -> Result<(), IndexError> {
        self.i = 0;
        self.fwd = 0;
        self.len = 0;
        Ok(())
    }

    fn approximate_mers(&self) -> u64 {
        (self.seq.len() + 1).saturating_sub(self.k) as u64
    }
}
