//! Builder: multi-pass construction of a [`PositionDb`] from a mer stream.
//!
//! Passes run in order over the (rewound) source:
//! 1. counting: per-bucket totals of sampled mers that pass the filters;
//! 2. insertion: every passing mer lands in its pre-sized bucket slot;
//! 3. finalize: buckets are sorted (in parallel) and repacked into entries.

use std::fmt;

use tracing::{debug, info, warn};

use crate::bits::{bits_for, low_mask};
use crate::codec::{BitCodec, MAX_MER_SIZE};
use crate::encode::canonical;
use crate::index::{Counters, IndexError, PositionDb};
use crate::source::{MerCounts, MerFilter, MerSource};
use crate::table::{BucketTable, FieldWidths, TableLayout};

/// Largest hash table considered when sizing automatically.
pub const MAX_TABLE_BITS: u32 = 32;

/// Random mers checked when validating a chosen geometry.
const VALIDATE_SAMPLES: usize = 4096;

/// Build-time configuration.
#[derive(Clone, Debug)]
pub struct BuildConfig {
    mer_size: u32,
    mer_skip: u32,
    max_mismatch: u32,
    min_count: u64,
    max_count: u64,
    max_memory_mb: u64,
    table_bits: Option<u32>,
    layout: TableLayout,
    threads: Option<usize>,
    verbose: bool,
}

impl BuildConfig {
    /// Defaults for mers of `mer_size` bases: no skip, no mismatch support,
    /// no count thresholds, no memory budget.
    pub fn new(mer_size: u32) -> Self {
        Self {
            mer_size,
            mer_skip: 0,
            max_mismatch: 0,
            min_count: 0,
            max_count: u64::MAX,
            max_memory_mb: 0,
            table_bits: None,
            layout: TableLayout::Packed,
            threads: None,
            verbose: false,
        }
    }
    /// Mers skipped after each sampled one.
    pub fn mer_skip(mut self, n: u32) -> Self {
        self.mer_skip = n;
        self
    }
    /// Mismatch budget the table should answer without extra setup.
    pub fn max_mismatch(mut self, n: u32) -> Self {
        self.max_mismatch = n;
        self
    }
    /// Drop mers whose count is below `n` (needs a count source).
    pub fn min_count(mut self, n: u64) -> Self {
        self.min_count = n;
        self
    }
    /// Drop mers whose count is above `n` (needs a count source).
    pub fn max_count(mut self, n: u64) -> Self {
        self.max_count = n;
        self
    }
    /// Memory budget in MiB used to size the table; 0 picks the smallest.
    pub fn max_memory_mb(mut self, mb: u64) -> Self {
        self.max_memory_mb = mb;
        self
    }
    /// Force the hash table to `2^bits` buckets.
    pub fn table_bits(mut self, bits: u32) -> Self {
        self.table_bits = Some(bits);
        self
    }
    /// Header encoding.
    pub fn layout(mut self, layout: TableLayout) -> Self {
        self.layout = layout;
        self
    }
    /// Fix the number of threads used by rayon while finalizing.
    pub fn threads(mut self, n: usize) -> Self {
        self.threads = Some(n);
        self
    }
    /// Report progress at `info` instead of `debug`.
    pub fn verbose(mut self, yes: bool) -> Self {
        self.verbose = yes;
        self
    }

    pub fn mer_size_in_bases(&self) -> u32 {
        self.mer_size
    }

    fn validate(&self) -> Result<(), IndexError> {
        if self.mer_size == 0 || self.mer_size > MAX_MER_SIZE {
            return Err(IndexError::Config(format!(
                "mer size {} needs {} bits; at most {} bases fit",
                self.mer_size,
                2 * self.mer_size,
                MAX_MER_SIZE
            )));
        }
        if self.max_mismatch > self.mer_size {
            return Err(IndexError::Config(format!(
                "{} mismatches exceed the mer size {}",
                self.max_mismatch, self.mer_size
            )));
        }
        if self.min_count > self.max_count {
            return Err(IndexError::Config(format!(
                "min count {} above max count {}",
                self.min_count, self.max_count
            )));
        }
        Ok(())
    }
}

/// Multi-pass table construction with optional mask/only filters and counts.
pub struct Builder<'a> {
    cfg: BuildConfig,
    mask: Option<&'a dyn MerFilter>,
    only: Option<&'a dyn MerFilter>,
    counts: Option<&'a dyn MerCounts>,
}

impl<'a> Builder<'a> {
    pub fn new(cfg: BuildConfig) -> Self {
        Self {
            cfg,
            mask: None,
            only: None,
            counts: None,
        }
    }
    /// Exclude mers in `f`.
    pub fn mask(mut self, f: &'a dyn MerFilter) -> Self {
        self.mask = Some(f);
        self
    }
    /// Keep only mers in `f`.
    pub fn only(mut self, f: &'a dyn MerFilter) -> Self {
        self.only = Some(f);
        self
    }
    /// Count source for the min/max thresholds.
    pub fn counts(mut self, c: &'a dyn MerCounts) -> Self {
        self.counts = Some(c);
        self
    }

    /// Run every pass over `source`. No partially built table escapes on error.
    pub fn build<S: MerSource + ?Sized>(&self, source: &mut S) -> Result<PositionDb, IndexError> {
        let cfg = &self.cfg;
        cfg.validate()?;
        let verbose = cfg.verbose;
        let mer_bits = 2 * cfg.mer_size;
        let stride = cfg.mer_skip as u64 + 1;

        // ---- configuration ----
        let approx = source.approximate_mers().div_ceil(stride);
        let table_bits = match cfg.table_bits {
            Some(t) => t,
            None => choose_table_bits(mer_bits, approx, cfg.max_memory_mb, cfg.layout),
        };
        let codec = BitCodec::new(cfg.mer_size, table_bits)?;
        codec.validate(VALIDATE_SAMPLES, table_bits as u64)?;
        note(
            verbose,
            format_args!(
                "[posdb] k={} skip={} table bits={} check bits={} (~{approx} mers)",
                cfg.mer_size,
                cfg.mer_skip,
                table_bits,
                codec.check_width()
            ),
        );
        if self.counts.is_none() && (cfg.min_count > 0 || cfg.max_count < u64::MAX) {
            warn!("count thresholds set without a count source; ignoring them");
        }

        let mut table = BucketTable::new(codec, cfg.layout)?;

        // ---- counting pass ----
        let mut mers = 0u64;
        let mut max_position = 0u64;
        self.for_each_sampled(source, |mer, position| {
            table.count(mer)?;
            mers += 1;
            max_position = max_position.max(position);
            Ok(())
        })?;
        note(verbose, format_args!("[posdb] counted {mers} mers"));

        let widths = FieldWidths::for_counts(codec.check_width(), mers, max_position);
        if cfg.layout == TableLayout::FullWidth && mers > u32::MAX as u64 {
            return Err(IndexError::Config(format!(
                "{mers} mers overflow a full-width header"
            )));
        }

        // ---- allocation + insertion pass ----
        table.allocate(widths.posn)?;
        self.for_each_sampled(source, |mer, position| table.insert(mer, position))?;
        note(verbose, format_args!("[posdb] inserted {mers} mers"));

        // ---- finalize ----
        let stats = table.finalize(widths, cfg.threads)?;
        note(
            verbose,
            format_args!(
                "[posdb] {} distinct, {} unique, largest bucket {}, {} position fields",
                stats.distinct, stats.unique, stats.max_entries, stats.position_fields
            ),
        );

        let counters = Counters {
            mers,
            positions: stats.position_fields,
            distinct: stats.distinct,
            unique: stats.unique,
            entries: stats.distinct,
            max_entries: stats.max_entries,
        };
        let mut db = PositionDb::from_table(cfg.mer_size, cfg.mer_skip, cfg.max_mismatch, table, counters);
        if cfg.max_mismatch > 0 {
            let cost = db.set_up_mismatch_matcher(cfg.max_mismatch, stats.distinct)?;
            note(
                verbose,
                format_args!("[posdb] mismatch matcher for {} errors, cost {cost:.2}", cfg.max_mismatch),
            );
        }
        Ok(db)
    }

    /// Rewind `source` and feed every sampled mer that passes the filters.
    fn for_each_sampled<S, F>(&self, source: &mut S, mut f: F) -> Result<(), IndexError>
    where
        S: MerSource + ?Sized,
        F: FnMut(u64, u64) -> Result<(), IndexError>,
    {
        source.rewind()?;
        let stride = self.cfg.mer_skip as u64 + 1;
        let mask = low_mask(2 * self.cfg.mer_size);
        let mut seen = 0u64;
        while let Some(hit) = source.next_hit() {
            let take = seen % stride == 0;
            seen += 1;
            if !take {
                continue;
            }
            let mer = hit.mer & mask;
            if self.admits(mer) {
                f(mer, hit.position)?;
            }
        }
        Ok(())
    }

    fn admits(&self, mer: u64) -> bool {
        let k = self.cfg.mer_size as usize;
        if let Some(mask) = self.mask {
            let key = if mask.canonical() { canonical(mer, k) } else { mer };
            if mask.contains(key) {
                return false;
            }
        }
        if let Some(only) = self.only {
            let key = if only.canonical() { canonical(mer, k) } else { mer };
            if !only.contains(key) {
                return false;
            }
        }
        if let Some(counts) = self.counts {
            let key = if counts.canonical() { canonical(mer, k) } else { mer };
            let c = counts.count(key);
            if c < self.cfg.min_count || c > self.cfg.max_count {
                return false;
            }
        }
        true
    }
}

/// Estimated bits for a table of `2^t` buckets holding `n` mers: header,
/// bucket counters, the counting area and the final entries, which coexist
/// while finalizing.
pub fn estimate_bits(mer_bits: u32, t: u32, n: u64, layout: TableLayout) -> u128 {
    let w = FieldWidths::for_counts(mer_bits - t, n, n);
    let buckets = 1u128 << t;
    let header_width = match layout {
        TableLayout::Packed => w.hash,
        TableLayout::FullWidth => 32,
    };
    let n = n as u128;
    (buckets + 1) * header_width as u128
        + buckets * 32
        + n * (w.chck + w.posn) as u128
        + n * w.entry_bits() as u128
        + n * w.store_width() as u128
}

/// Table width for `approx` mers. Without a budget the smallest estimate
/// wins; with one, the widest table up to one bucket per mer that fits.
pub fn choose_table_bits(mer_bits: u32, approx: u64, max_memory_mb: u64, layout: TableLayout) -> u32 {
    let max_t = (mer_bits - 1).min(MAX_TABLE_BITS);
    let smallest = (1..=max_t)
        .min_by_key(|&t| estimate_bits(mer_bits, t, approx, layout))
        .unwrap_or(1);
    if max_memory_mb == 0 {
        return smallest;
    }
    let budget = max_memory_mb as u128 * 8 * 1024 * 1024;
    let widest = max_t.min(bits_for(approx));
    match (1..=widest)
        .rev()
        .find(|&t| estimate_bits(mer_bits, t, approx, layout) <= budget)
    {
        Some(t) => t,
        None => {
            warn!(
                "no table fits {max_memory_mb} MiB for ~{approx} mers; using {smallest} bits"
            );
            smallest
        }
    }
}

fn note(verbose: bool, args: fmt::Arguments<'_>) {
    if verbose {
        info!("{args}");
    } else {
        debug!("{args}");
    }
}
