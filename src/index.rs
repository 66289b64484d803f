//! PositionDb: query-time API over a built or loaded table.

use std::path::Path;

use thiserror::Error;

use crate::builder::{BuildConfig, Builder};
use crate::codec::BitCodec;
use crate::encode::base_mismatches;
use crate::mismatch::MismatchMatcher;
use crate::source::MerSource;
use crate::table::{BucketTable, FieldWidths, TableLayout};

#[derive(Debug, Error)]
/// Errors returned by PositionDb.
pub enum IndexError {
    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    /// Malformed or inconsistent saved state.
    #[error("Invalid posdb file: {0}")]
    Format(String),
    /// Unusable configuration.
    #[error("Configuration error: {0}")]
    Config(String),
    /// Allocation failure or counter overflow.
    #[error("Resource error: {0}")]
    Resource(String),
    /// The mer source replayed differently between passes.
    #[error("Mer source changed between passes: {0}")]
    SourceMismatch(String),
    /// Append to a position list that is no longer the last one.
    #[error("Position list at field {0} is sealed")]
    SealedRange(u64),
    /// The table was loaded without its data.
    #[error("Table data not loaded")]
    NotLoaded,
}

/// Cardinalities recorded with a table.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Counters {
    /// Sampled mers that passed the filters.
    pub mers: u64,
    /// Fields used in the position store (list lengths plus positions).
    pub positions: u64,
    pub distinct: u64,
    /// Mers with a single position.
    pub unique: u64,
    pub entries: u64,
    /// Entries in the largest bucket.
    pub max_entries: u64,
}

/// Mer → positions index with exact and bounded-mismatch lookup.
///
/// Readers take `&self` and may run concurrently; `filter`, `set_count` and
/// reloading take `&mut self`.
#[derive(Debug)]
pub struct PositionDb {
    mer_size: u32,
    mer_skip: u32,
    max_mismatch: u32,
    table: BucketTable,
    counters: Counters,
    matcher: Option<MismatchMatcher>,
}

impl PositionDb {
    pub(crate) fn from_table(
        mer_size: u32,
        mer_skip: u32,
        max_mismatch: u32,
        table: BucketTable,
        counters: Counters,
    ) -> Self {
        Self {
            mer_size,
            mer_skip,
            max_mismatch,
            table,
            counters,
            matcher: None,
        }
    }

    /// Build from a stream with no filters; see [`Builder`] for the rest.
    pub fn build<S: MerSource + ?Sized>(source: &mut S, cfg: BuildConfig) -> Result<Self, IndexError> {
        Builder::new(cfg).build(source)
    }

    /// Load a saved table. With `load_data == false` only the configuration
    /// is read; lookups then report nothing.
    pub fn open(path: &Path, load_data: bool) -> Result<Self, IndexError> {
        let db = crate::io::read_state(path, load_data)?;
        Ok(db)
    }

    /// Load a saved table, requiring the given mer size and skip, and make it
    /// ready for `max_mismatch` errors.
    pub fn open_expecting(
        path: &Path,
        mer_size: u32,
        mer_skip: u32,
        max_mismatch: u32,
        load_data: bool,
    ) -> Result<Self, IndexError> {
        let mut db = Self::open(path, load_data)?;
        if db.mer_size != mer_size || db.mer_skip != mer_skip {
            return Err(IndexError::Config(format!(
                "{} holds k={} skip={}, expected k={mer_size} skip={mer_skip}",
                path.display(),
                db.mer_size,
                db.mer_skip
            )));
        }
        if max_mismatch > 0 {
            db.set_up_mismatch_matcher(max_mismatch, db.counters.distinct)?;
        }
        Ok(db)
    }

    // ---- geometry ----

    #[inline]
    pub fn mer_size(&self) -> u32 {
        self.mer_size
    }
    #[inline]
    pub fn mer_skip(&self) -> u32 {
        self.mer_skip
    }
    #[inline]
    pub fn max_mismatch(&self) -> u32 {
        self.max_mismatch
    }
    #[inline]
    pub fn table_bits(&self) -> u32 {
        self.table.codec().table_bits()
    }
    #[inline]
    pub fn widths(&self) -> FieldWidths {
        self.table.widths()
    }
    #[inline]
    pub fn layout(&self) -> TableLayout {
        self.table.layout()
    }
    #[inline]
    pub fn counters(&self) -> Counters {
        self.counters
    }
    #[inline]
    pub fn codec(&self) -> &BitCodec {
        self.table.codec()
    }
    /// Whether bucket data is present.
    #[inline]
    pub fn is_loaded(&self) -> bool {
        self.table.is_loaded()
    }

    pub(crate) fn table(&self) -> &BucketTable {
        &self.table
    }

    /// Matcher prepared by the build, `open_expecting` or
    /// `set_up_mismatch_matcher`, if any.
    pub fn mismatch_matcher(&self) -> Option<&MismatchMatcher> {
        self.matcher.as_ref()
    }

    // ---- exact lookup ----

    /// Positions of `mer` in `out` (cleared first). Returns the number found,
    /// or `None` when the mer is absent.
    pub fn get_exact_into(&self, mer: u64, out: &mut Vec<u64>) -> Option<u64> {
        out.clear();
        let entry = self.table.lookup_exact(mer)?;
        self.table.append_positions(&entry, out);
        Some(out.len() as u64)
    }

    /// Positions of `mer`, or `None` when absent.
    pub fn get_exact(&self, mer: u64) -> Option<Vec<u64>> {
        let mut out = Vec::new();
        self.get_exact_into(mer, &mut out)?;
        Some(out)
    }

    pub fn exists_exact(&self, mer: u64) -> bool {
        self.table.lookup_exact(mer).is_some()
    }

    /// Stored multiplicity of `mer`; 0 when absent.
    pub fn count_exact(&self, mer: u64) -> u64 {
        self.table.lookup_exact(mer).map_or(0, |e| e.count)
    }

    // ---- approximate lookup ----

    /// Prepare lookups with up to `n` substitutions. Returns the expected
    /// number of entries scanned per query.
    pub fn set_up_mismatch_matcher(&mut self, n: u32, approx_distinct: u64) -> Result<f64, IndexError> {
        let m = MismatchMatcher::new(self.table.codec(), self.mer_size, n, approx_distinct)?;
        let cost = m.cost();
        self.max_mismatch = n;
        self.matcher = Some(m);
        Ok(cost)
    }

    /// Union of the positions of every stored mer within `max_mismatches`
    /// base substitutions of `mer`, the mer itself included, into `out`
    /// (sorted, no duplicates). Returns false when nothing qualifies.
    ///
    /// Budgets above the mer size are clamped to it. Errors only when the
    /// substitution patterns exceed [`MAX_ERROR_PATTERNS`].
    ///
    /// [`MAX_ERROR_PATTERNS`]: crate::mismatch::MAX_ERROR_PATTERNS
    pub fn get_up_to_n_mismatches_into(
        &self,
        mer: u64,
        max_mismatches: u32,
        out: &mut Vec<u64>,
    ) -> Result<bool, IndexError> {
        out.clear();
        let max_mismatches = max_mismatches.min(self.mer_size);
        let transient;
        let matcher = match &self.matcher {
            Some(m) if m.max_mismatches() >= max_mismatches => m,
            _ => {
                transient = MismatchMatcher::new(
                    self.table.codec(),
                    self.mer_size,
                    max_mismatches,
                    self.counters.distinct,
                )?;
                &transient
            }
        };

        let codec = self.table.codec();
        let k = self.mer_size as usize;
        let mer = mer & crate::bits::low_mask(codec.mer_bits());
        let h = codec.hash(mer);
        for &he in matcher.hashed_errors() {
            let b = h ^ he;
            for entry in self.table.entries_in(b) {
                let candidate = codec.rebuild(b, entry.check);
                if base_mismatches(candidate, mer, k) <= max_mismatches {
                    self.table.append_positions(&entry, out);
                }
            }
        }
        out.sort_unstable();
        out.dedup();
        Ok(!out.is_empty())
    }

    /// Owned variant of [`get_up_to_n_mismatches_into`].
    ///
    /// [`get_up_to_n_mismatches_into`]: PositionDb::get_up_to_n_mismatches_into
    pub fn get_up_to_n_mismatches(
        &self,
        mer: u64,
        max_mismatches: u32,
    ) -> Result<Option<Vec<u64>>, IndexError> {
        let mut out = Vec::new();
        Ok(self
            .get_up_to_n_mismatches_into(mer, max_mismatches, &mut out)?
            .then_some(out))
    }

    // ---- mutation ----

    /// Keep only positions in `[lo, hi]`. Mers left without positions stay
    /// in the table but are reported absent.
    pub fn filter(&mut self, lo: u64, hi: u64) {
        self.table.filter(lo, hi);
    }

    /// Overwrite the stored multiplicity of `mer` (clamped to the size
    /// width). Returns false when the mer is absent.
    pub fn set_count(&mut self, mer: u64, count: u64) -> bool {
        self.table.set_count(mer, count)
    }

    // ---- persistence ----

    /// Write the table to `path`.
    pub fn save_state(&self, path: &Path) -> Result<(), IndexError> {
        crate::io::write_state(self, path)
    }

    /// Replace this table with the one saved at `path`. On error `self` is
    /// left untouched.
    pub fn load_state(&mut self, path: &Path, verbose: bool, load_data: bool) -> Result<(), IndexError> {
        let db = crate::io::read_state(path, load_data)?;
        if verbose {
            tracing::info!(
                "[posdb] loaded {}: k={} table bits={} {} distinct mers",
                path.display(),
                db.mer_size,
                db.table_bits(),
                db.counters.distinct
            );
        }
        *self = db;
        Ok(())
    }

    /// Human-readable dump of geometry and counters.
    pub fn print_state<W: std::io::Write>(&self, w: &mut W) -> std::io::Result<()> {
        crate::io::print_state(self, w)
    }
}
