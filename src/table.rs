//! Bucketed hash table over bit-packed entries.
//!
//! Layout after finalization:
//! - `bucket_sizes[b]`: entries in bucket `b`.
//! - header: `2^t + 1` entry offsets (bit-packed or full-width `u32`).
//! - pool: entries of `chck + 1 + pptr + size` bits, check-ascending within
//!   each bucket: `[check | indirect flag | position or pointer | count]`.
//! - positions: lists for mers seen more than once.
//!
//! During construction a counting area of `(check, position)` slots, sized
//! exactly by the counting pass, receives every sampled mer before
//! `finalize` sorts and repacks it.

use std::ops::Range;

use rayon::prelude::*;

use crate::bits::{PackedWords, bits_for, low_mask};
use crate::codec::BitCodec;
use crate::index::IndexError;
use crate::positions::{PositionStore, RangeHandle};
use crate::radix::radix_sort_pairs_u64;

/// Buckets sorted per parallel batch during finalization.
const FINALIZE_CHUNK: u64 = 1 << 14;

/// Encoding of the hash-table header.
#[repr(u8)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum TableLayout {
    /// Offsets packed at the hash width.
    #[default]
    Packed = 0,
    /// One `u32` per offset; faster, larger, limited to `u32::MAX` entries.
    FullWidth = 1,
}

impl TableLayout {
    pub(crate) fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(TableLayout::Packed),
            1 => Some(TableLayout::FullWidth),
            _ => None,
        }
    }
}

/// Bit widths of the stored fields.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FieldWidths {
    /// Header offsets.
    pub hash: u32,
    /// Check value.
    pub chck: u32,
    /// A single position.
    pub posn: u32,
    /// Inline position or pointer into the position store.
    pub pptr: u32,
    /// Per-entry count and list lengths.
    pub size: u32,
}

impl FieldWidths {
    #[inline]
    pub fn entry_bits(&self) -> u32 {
        self.chck + 1 + self.pptr + self.size
    }

    /// Field width of the position store.
    #[inline]
    pub fn store_width(&self) -> u32 {
        self.posn.max(self.size)
    }

    /// Widths for a table of up to `mers` sampled mers with positions up to
    /// `max_position`. Pointer and size widths take the worst case so the
    /// entry layout is fixed before repacking starts.
    pub fn for_counts(chck: u32, mers: u64, max_position: u64) -> Self {
        let posn = bits_for(max_position);
        Self {
            hash: bits_for(mers),
            chck,
            posn,
            pptr: posn.max(bits_for(mers.saturating_mul(2))),
            size: bits_for(mers),
        }
    }
}

/// Where an entry's positions live.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PositionRef {
    /// The mer occurs once; the position is stored in the entry.
    Inline(u64),
    /// The mer repeats; its list is in the position store.
    Indirect(RangeHandle),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Entry {
    pub check: u64,
    pub positions: PositionRef,
    /// Stored multiplicity. Zero marks an entry emptied by a range filter.
    pub count: u64,
}

/// Totals produced by `finalize`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RepackStats {
    pub distinct: u64,
    pub unique: u64,
    pub max_entries: u64,
    pub position_fields: u64,
}

#[derive(Clone, Debug)]
pub(crate) enum HashHeader {
    Packed { width: u32, bits: PackedWords },
    Full(Vec<u32>),
}

impl HashHeader {
    fn new(layout: TableLayout, n: u64, width: u32) -> Result<Self, IndexError> {
        Ok(match layout {
            TableLayout::Packed => HashHeader::Packed {
                width,
                bits: PackedWords::for_fields(n, width)?,
            },
            TableLayout::FullWidth => {
                let n = usize::try_from(n)
                    .map_err(|_| IndexError::Resource(format!("{n} header slots")))?;
                let mut v = Vec::new();
                v.try_reserve_exact(n)
                    .map_err(|e| IndexError::Resource(format!("allocating header: {e}")))?;
                v.resize(n, 0);
                HashHeader::Full(v)
            }
        })
    }

    #[inline]
    fn get(&self, i: u64) -> u64 {
        match self {
            HashHeader::Packed { width, bits } => bits.get(i * *width as u64, *width),
            HashHeader::Full(v) => v[i as usize] as u64,
        }
    }

    #[inline]
    fn set(&mut self, i: u64, value: u64) {
        match self {
            HashHeader::Packed { width, bits } => bits.set(i * *width as u64, *width, value),
            HashHeader::Full(v) => v[i as usize] = value as u32,
        }
    }
}

/// Build-time staging of `(check, position)` slots, grouped by bucket.
#[derive(Debug)]
struct CountingArea {
    offsets: Vec<u64>,
    fill: Vec<u32>,
    slots: PackedWords,
    chck: u32,
    posn: u32,
}

impl CountingArea {
    #[inline]
    fn slot_bits(&self) -> u64 {
        (self.chck + self.posn) as u64
    }

    /// Checks and positions of bucket `b`, sorted by check.
    fn sorted_bucket(&self, b: usize) -> (Vec<u64>, Vec<u64>) {
        let (start, end) = (self.offsets[b], self.offsets[b + 1]);
        let n = (end - start) as usize;
        let mut checks = Vec::with_capacity(n);
        let mut posns = Vec::with_capacity(n);
        for s in start..end {
            let at = s * self.slot_bits();
            checks.push(self.slots.get(at, self.chck));
            posns.push(self.slots.get(at + self.chck as u64, self.posn));
        }
        radix_sort_pairs_u64(&mut checks, &mut posns, self.chck);
        (checks, posns)
    }
}

#[derive(Debug)]
pub struct BucketTable {
    codec: BitCodec,
    layout: TableLayout,
    widths: FieldWidths,
    bucket_sizes: Vec<u32>,
    header: HashHeader,
    pool: PackedWords,
    entries: u64,
    positions: PositionStore,
    counting: Option<CountingArea>,
    loaded: bool,
}

impl BucketTable {
    /// Empty table ready for the counting pass.
    pub fn new(codec: BitCodec, layout: TableLayout) -> Result<Self, IndexError> {
        let n = 1usize << codec.table_bits();
        let mut bucket_sizes = Vec::new();
        bucket_sizes
            .try_reserve_exact(n)
            .map_err(|e| IndexError::Resource(format!("allocating {n} bucket counters: {e}")))?;
        bucket_sizes.resize(n, 0);
        Ok(Self {
            codec,
            layout,
            widths: FieldWidths {
                chck: codec.check_width(),
                ..FieldWidths::default()
            },
            bucket_sizes,
            header: HashHeader::Full(Vec::new()),
            pool: PackedWords::default(),
            entries: 0,
            positions: PositionStore::default(),
            counting: None,
            loaded: false,
        })
    }

    /// Table restored from saved buffers.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn from_parts(
        codec: BitCodec,
        layout: TableLayout,
        widths: FieldWidths,
        bucket_sizes: Vec<u32>,
        header: HashHeader,
        pool: PackedWords,
        entries: u64,
        positions: PositionStore,
        loaded: bool,
    ) -> Self {
        Self {
            codec,
            layout,
            widths,
            bucket_sizes,
            header,
            pool,
            entries,
            positions,
            counting: None,
            loaded,
        }
    }

    // ---- accessors ----

    #[inline]
    pub fn codec(&self) -> &BitCodec {
        &self.codec
    }

    #[inline]
    pub fn layout(&self) -> TableLayout {
        self.layout
    }

    #[inline]
    pub fn widths(&self) -> FieldWidths {
        self.widths
    }

    #[inline]
    pub fn num_buckets(&self) -> u64 {
        1u64 << self.codec.table_bits()
    }

    #[inline]
    pub fn num_entries(&self) -> u64 {
        self.entries
    }

    /// Whether bucket data is present (false after a header-only load).
    #[inline]
    pub fn is_loaded(&self) -> bool {
        self.loaded
    }

    pub fn bucket_sizes(&self) -> &[u32] {
        &self.bucket_sizes
    }

    pub(crate) fn header(&self) -> &HashHeader {
        &self.header
    }

    pub(crate) fn pool(&self) -> &PackedWords {
        &self.pool
    }

    pub(crate) fn positions(&self) -> &PositionStore {
        &self.positions
    }

    /// Structural checks on restored buffers: header offsets agree with the
    /// bucket sizes, checks ascend within each bucket and every list lies
    /// inside the position store.
    pub(crate) fn verify(&self) -> Result<(), IndexError> {
        let bad = |msg: String| Err(IndexError::Format(msg));
        let buckets = self.num_buckets();
        let mut offset = 0u64;
        for b in 0..buckets {
            if self.header.get(b) != offset {
                return bad(format!("header offset of bucket {b} disagrees with bucket sizes"));
            }
            offset += self.bucket_sizes[b as usize] as u64;
        }
        if offset != self.entries || self.header.get(buckets) != self.entries {
            return bad(format!("header ends at {offset}, table has {} entries", self.entries));
        }

        let fields = self.positions.len_fields();
        for b in 0..buckets {
            let mut prev: Option<u64> = None;
            for e in self.header.get(b)..self.header.get(b + 1) {
                let entry = self.entry(e);
                if prev.is_some_and(|p| p >= entry.check) {
                    return bad(format!("checks out of order in bucket {b}"));
                }
                prev = Some(entry.check);
                if let PositionRef::Indirect(h) = entry.positions {
                    if h.index() >= fields {
                        return bad(format!("entry {e} points past the position store"));
                    }
                    let len = self.positions.len_of(h);
                    let end = h.index().checked_add(1).and_then(|s| s.checked_add(len));
                    if end.is_none_or(|end| end > fields) {
                        return bad(format!("list of entry {e} runs past the position store"));
                    }
                    if len == 0 && entry.count > 0 {
                        return bad(format!("entry {e} has count {} but no positions", entry.count));
                    }
                }
            }
        }
        Ok(())
    }

    // ---- construction ----

    /// Counting pass: one more mer bound for its bucket.
    pub fn count(&mut self, mer: u64) -> Result<(), IndexError> {
        let h = self.codec.hash(mer) as usize;
        self.bucket_sizes[h] = self.bucket_sizes[h]
            .checked_add(1)
            .ok_or_else(|| IndexError::Resource(format!("bucket {h} exceeds u32 entries")))?;
        Ok(())
    }

    /// Size the counting area from the counts, for positions of `posn` bits.
    pub fn allocate(&mut self, posn: u32) -> Result<(), IndexError> {
        let n = self.bucket_sizes.len();
        let mut offsets = Vec::new();
        offsets
            .try_reserve_exact(n + 1)
            .map_err(|e| IndexError::Resource(format!("allocating bucket offsets: {e}")))?;
        let mut total = 0u64;
        offsets.push(0);
        for &s in &self.bucket_sizes {
            total += s as u64;
            offsets.push(total);
        }
        let chck = self.widths.chck;
        let slots = PackedWords::for_fields(total, chck + posn)?;
        let mut fill = Vec::new();
        fill.try_reserve_exact(n)
            .map_err(|e| IndexError::Resource(format!("allocating bucket cursors: {e}")))?;
        fill.resize(n, 0);
        self.counting = Some(CountingArea {
            offsets,
            fill,
            slots,
            chck,
            posn,
        });
        Ok(())
    }

    /// Place one occurrence of `mer`. Repeats of a mer are merged into one
    /// entry when its bucket is repacked.
    pub fn insert(&mut self, mer: u64, position: u64) -> Result<(), IndexError> {
        let h = self.codec.hash(mer) as usize;
        let c = self.codec.check(mer);
        let area = self
            .counting
            .as_mut()
            .ok_or_else(|| IndexError::Config("insert before allocate".into()))?;
        if position > low_mask(area.posn) {
            return Err(IndexError::SourceMismatch(format!(
                "position {position} was not seen by the counting pass"
            )));
        }
        let slot = area.offsets[h] + area.fill[h] as u64;
        if slot >= area.offsets[h + 1] {
            return Err(IndexError::SourceMismatch(format!(
                "bucket {h} received more mers than counted"
            )));
        }
        area.fill[h] += 1;
        let at = slot * area.slot_bits();
        area.slots.set(at, area.chck, c);
        area.slots.set(at + area.chck as u64, area.posn, position);
        Ok(())
    }

    /// Sort and repack every bucket into the final entry layout.
    pub fn finalize(
        &mut self,
        mut widths: FieldWidths,
        threads: Option<usize>,
    ) -> Result<RepackStats, IndexError> {
        let area = self
            .counting
            .take()
            .ok_or_else(|| IndexError::Config("finalize before allocate".into()))?;
        if let Some(b) = (0..self.bucket_sizes.len()).find(|&b| area.fill[b] != self.bucket_sizes[b]) {
            return Err(IndexError::SourceMismatch(format!(
                "bucket {b} counted {} mers but received {}",
                self.bucket_sizes[b], area.fill[b]
            )));
        }
        widths.chck = self.widths.chck;
        widths.posn = area.posn;

        let pool = match threads {
            Some(n) => Some(
                rayon::ThreadPoolBuilder::new()
                    .num_threads(n)
                    .build()
                    .map_err(|e| IndexError::Resource(format!("thread pool: {e}")))?,
            ),
            None => None,
        };

        let buckets = self.num_buckets();
        let entry_bits = widths.entry_bits() as u64;
        self.header = HashHeader::new(self.layout, buckets + 1, widths.hash)?;
        self.pool = PackedWords::default();
        self.positions = PositionStore::new(widths.store_width());
        self.widths = widths;
        self.entries = 0;

        let mut stats = RepackStats::default();
        let mut lo = 0u64;
        while lo < buckets {
            let hi = (lo + FINALIZE_CHUNK).min(buckets);
            let sort = || -> Vec<(Vec<u64>, Vec<u64>)> {
                (lo as usize..hi as usize)
                    .into_par_iter()
                    .map(|b| area.sorted_bucket(b))
                    .collect()
            };
            let sorted = match &pool {
                Some(p) => p.install(sort),
                None => sort(),
            };

            for (b, (checks, posns)) in (lo..hi).zip(sorted) {
                self.header.set(b, self.entries);
                let before = self.entries;
                let mut i = 0;
                while i < checks.len() {
                    let mut j = i + 1;
                    while j < checks.len() && checks[j] == checks[i] {
                        j += 1;
                    }
                    let run = &posns[i..j];
                    let positions = if run.len() == 1 {
                        stats.unique += 1;
                        PositionRef::Inline(run[0])
                    } else {
                        PositionRef::Indirect(self.positions.push_range(run)?)
                    };
                    self.pool.grow_to_bits((self.entries + 1) * entry_bits)?;
                    self.write_entry(
                        self.entries,
                        &Entry {
                            check: checks[i],
                            positions,
                            count: run.len() as u64,
                        },
                    );
                    self.entries += 1;
                    i = j;
                }
                let in_bucket = self.entries - before;
                self.bucket_sizes[b as usize] = in_bucket as u32;
                stats.max_entries = stats.max_entries.max(in_bucket);
            }
            lo = hi;
        }
        self.header.set(buckets, self.entries);
        self.pool.truncate_to_bits(self.entries * entry_bits);
        self.positions.shrink_to_fit();
        self.loaded = true;

        stats.distinct = self.entries;
        stats.position_fields = self.positions.len_fields();
        Ok(stats)
    }

    // ---- entries ----

    #[inline]
    fn entry_base(&self, e: u64) -> u64 {
        e * self.widths.entry_bits() as u64
    }

    /// Decode entry `e` of the pool.
    pub fn entry(&self, e: u64) -> Entry {
        let w = self.widths;
        let base = self.entry_base(e);
        let check = self.pool.get(base, w.chck);
        let indirect = self.pool.get(base + w.chck as u64, 1) == 1;
        let ptr = self.pool.get(base + w.chck as u64 + 1, w.pptr);
        let count = self.pool.get(base + (w.chck + 1 + w.pptr) as u64, w.size);
        Entry {
            check,
            positions: if indirect {
                PositionRef::Indirect(RangeHandle(ptr))
            } else {
                PositionRef::Inline(ptr)
            },
            count,
        }
    }

    fn write_entry(&mut self, e: u64, entry: &Entry) {
        let w = self.widths;
        let base = self.entry_base(e);
        let (flag, ptr) = match entry.positions {
            PositionRef::Inline(p) => (0, p),
            PositionRef::Indirect(h) => (1, h.0),
        };
        self.pool.set(base, w.chck, entry.check);
        self.pool.set(base + w.chck as u64, 1, flag);
        self.pool.set(base + w.chck as u64 + 1, w.pptr, ptr);
        self.set_count_field(e, entry.count);
    }

    #[inline]
    fn set_count_field(&mut self, e: u64, count: u64) {
        let w = self.widths;
        let at = self.entry_base(e) + (w.chck + 1 + w.pptr) as u64;
        self.pool.set(at, w.size, count);
    }

    /// Pool indices of bucket `b`'s entries.
    #[inline]
    pub fn bucket_range(&self, b: u64) -> Range<u64> {
        if !self.loaded {
            return 0..0;
        }
        self.header.get(b)..self.header.get(b + 1)
    }

    /// Binary search for the pool index holding `mer`, including emptied
    /// entries. Bits above the mer width are ignored.
    fn find(&self, mer: u64) -> Option<u64> {
        let mer = mer & low_mask(self.codec.mer_bits());
        let h = self.codec.hash(mer);
        let c = self.codec.check(mer);
        let Range { mut start, mut end } = self.bucket_range(h);
        let chck = self.widths.chck;
        while start < end {
            let mid = start + (end - start) / 2;
            let mc = self.pool.get(self.entry_base(mid), chck);
            if mc < c {
                start = mid + 1;
            } else if mc > c {
                end = mid;
            } else {
                return Some(mid);
            }
        }
        None
    }

    /// Live entry for `mer`; entries emptied by `filter` are absent.
    pub fn lookup_exact(&self, mer: u64) -> Option<Entry> {
        let e = self.entry(self.find(mer)?);
        (e.count > 0).then_some(e)
    }

    /// Append the positions of `entry` to `out`.
    pub fn append_positions(&self, entry: &Entry, out: &mut Vec<u64>) {
        match entry.positions {
            PositionRef::Inline(p) => out.push(p),
            PositionRef::Indirect(h) => out.extend(self.positions.iter(h)),
        }
    }

    /// Overwrite the multiplicity of `mer`, clamped to `1..=` the size
    /// width's maximum; a stored mer never drops to the emptied marker.
    /// Returns false, changing nothing, when the mer is absent.
    pub fn set_count(&mut self, mer: u64, count: u64) -> bool {
        let Some(e) = self.find(mer) else {
            return false;
        };
        if self.entry(e).count == 0 {
            return false;
        }
        let clamped = count.clamp(1, low_mask(self.widths.size));
        self.set_count_field(e, clamped);
        true
    }

    /// Keep only positions in `[lo, hi]`. Every live entry's count is reset
    /// to the number of positions it keeps, discarding `set_count`
    /// overrides. Entries left without positions stay in their bucket slot
    /// with count zero.
    pub fn filter(&mut self, lo: u64, hi: u64) {
        if !self.loaded {
            return;
        }
        for e in 0..self.entries {
            let entry = self.entry(e);
            if entry.count == 0 {
                continue;
            }
            match entry.positions {
                PositionRef::Inline(p) => {
                    self.set_count_field(e, (lo..=hi).contains(&p) as u64);
                }
                PositionRef::Indirect(h) => {
                    let kept = self.positions.retain_in(h, lo, hi);
                    self.set_count_field(e, kept);
                }
            }
        }
    }

    /// Live entries of bucket `b`.
    pub fn entries_in(&self, b: u64) -> impl Iterator<Item = Entry> + '_ {
        self.bucket_range(b)
            .map(move |e| self.entry(e))
            .filter(|e| e.count > 0)
    }
}
