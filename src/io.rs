//! On-disk posdb format v1: configuration header followed by four raw
//! buffers. All integers are little-endian.
//!
//! ```text
//! u32 magic, u32 version
//! u32 mer_size, mer_skip, max_mismatch, table_bits
//! u8 layout, u8 x3 reserved
//! u32 hash, chck, posn, pptr, size widths
//! u64 mers, positions, distinct, unique, entries, max_entries
//! u32 x 2^t                       bucket sizes
//! u64 x words(2^t + 1, hash)      packed header  | u32 x (2^t + 1) full-width header
//! u64 x words(entries, entry)     entry pool
//! u64 x words(positions, store)   position store
//! ```
//!
//! The header is validated before any buffer is read; a failed load never
//! touches the destination table.

use byteorder::{LittleEndian as LE, ReadBytesExt, WriteBytesExt};
use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;

use crate::bits::{PackedWords, bits_for, words_for, zeroed_words};
use crate::builder::MAX_TABLE_BITS;
use crate::codec::{BitCodec, MAX_MER_SIZE};
use crate::index::{Counters, IndexError, PositionDb};
use crate::positions::PositionStore;
use crate::table::{BucketTable, FieldWidths, HashHeader, TableLayout};

pub const POSDB_MAGIC: u32 = 0x50_53_44_42; // "PSDB"
pub const POSDB_VERSION: u32 = 1;

/// Size of the fixed header on disk.
pub const HEADER_BYTES: u64 = 6 * 4 + 4 + 5 * 4 + 6 * 8;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FileHeader {
    pub magic: u32,
    pub version: u32,
    pub mer_size: u32,
    pub mer_skip: u32,
    pub max_mismatch: u32,
    pub table_bits: u32,
    pub layout_u8: u8,
    pub reserved0: u8,
    pub reserved1: u16,
    pub widths: FieldWidths,
    pub counters: Counters,
}

impl FileHeader {
    fn for_db(db: &PositionDb) -> Self {
        FileHeader {
            magic: POSDB_MAGIC,
            version: POSDB_VERSION,
            mer_size: db.mer_size(),
            mer_skip: db.mer_skip(),
            max_mismatch: db.max_mismatch(),
            table_bits: db.table_bits(),
            layout_u8: db.layout() as u8,
            reserved0: 0,
            reserved1: 0,
            widths: db.widths(),
            counters: db.counters(),
        }
    }

    pub fn write_to<W: Write>(&self, w: &mut W) -> std::io::Result<()> {
        w.write_u32::<LE>(self.magic)?;
        w.write_u32::<LE>(self.version)?;
        w.write_u32::<LE>(self.mer_size)?;
        w.write_u32::<LE>(self.mer_skip)?;
        w.write_u32::<LE>(self.max_mismatch)?;
        w.write_u32::<LE>(self.table_bits)?;
        w.write_u8(self.layout_u8)?;
        w.write_u8(self.reserved0)?;
        w.write_u16::<LE>(self.reserved1)?;
        let fw = &self.widths;
        for width in [fw.hash, fw.chck, fw.posn, fw.pptr, fw.size] {
            w.write_u32::<LE>(width)?;
        }
        let c = &self.counters;
        for n in [c.mers, c.positions, c.distinct, c.unique, c.entries, c.max_entries] {
            w.write_u64::<LE>(n)?;
        }
        Ok(())
    }

    pub fn read_from<R: Read>(r: &mut R) -> std::io::Result<Self> {
        let magic = r.read_u32::<LE>()?;
        let version = r.read_u32::<LE>()?;
        let mer_size = r.read_u32::<LE>()?;
        let mer_skip = r.read_u32::<LE>()?;
        let max_mismatch = r.read_u32::<LE>()?;
        let table_bits = r.read_u32::<LE>()?;
        let layout_u8 = r.read_u8()?;
        let reserved0 = r.read_u8()?;
        let reserved1 = r.read_u16::<LE>()?;
        let widths = FieldWidths {
            hash: r.read_u32::<LE>()?,
            chck: r.read_u32::<LE>()?,
            posn: r.read_u32::<LE>()?,
            pptr: r.read_u32::<LE>()?,
            size: r.read_u32::<LE>()?,
        };
        let counters = Counters {
            mers: r.read_u64::<LE>()?,
            positions: r.read_u64::<LE>()?,
            distinct: r.read_u64::<LE>()?,
            unique: r.read_u64::<LE>()?,
            entries: r.read_u64::<LE>()?,
            max_entries: r.read_u64::<LE>()?,
        };
        Ok(FileHeader {
            magic,
            version,
            mer_size,
            mer_skip,
            max_mismatch,
            table_bits,
            layout_u8,
            reserved0,
            reserved1,
            widths,
            counters,
        })
    }

    /// Reject internally inconsistent configurations.
    pub fn validate(&self) -> Result<(BitCodec, TableLayout), IndexError> {
        let bad = |msg: String| Err(IndexError::Format(msg));
        if self.magic != POSDB_MAGIC {
            return bad("bad magic".into());
        }
        if self.version != POSDB_VERSION {
            return bad(format!("unsupported version {}", self.version));
        }
        if self.mer_size == 0 || self.mer_size > MAX_MER_SIZE {
            return bad(format!("mer size {} out of range", self.mer_size));
        }
        let Some(layout) = TableLayout::from_u8(self.layout_u8) else {
            return bad(format!("unknown layout {}", self.layout_u8));
        };
        if self.max_mismatch > self.mer_size {
            return bad(format!("{} mismatches exceed mer size", self.max_mismatch));
        }
        if self.table_bits > MAX_TABLE_BITS {
            return bad(format!("table of {} bits is too large", self.table_bits));
        }
        let codec = BitCodec::new(self.mer_size, self.table_bits)
            .map_err(|e| IndexError::Format(e.to_string()))?;

        let w = &self.widths;
        if w.chck != codec.check_width() {
            return bad(format!(
                "check width {} does not match {}-bit mers in a {}-bit table",
                w.chck,
                codec.mer_bits(),
                self.table_bits
            ));
        }
        for (name, v) in [("hash", w.hash), ("position", w.posn), ("pointer", w.pptr), ("size", w.size)] {
            if v == 0 || v > 64 {
                return bad(format!("{name} width {v} out of range"));
            }
        }
        if w.pptr < w.posn {
            return bad("pointer width narrower than position width".into());
        }

        let c = &self.counters;
        if c.entries != c.distinct {
            return bad(format!("{} entries for {} distinct mers", c.entries, c.distinct));
        }
        if c.unique > c.distinct || c.distinct > c.mers || c.max_entries > c.entries {
            return bad("inconsistent counters".into());
        }
        if bits_for(c.entries) > w.hash {
            return bad(format!("{} entries do not fit {}-bit offsets", c.entries, w.hash));
        }
        if layout == TableLayout::FullWidth && c.entries > u32::MAX as u64 {
            return bad(format!("{} entries overflow a full-width header", c.entries));
        }
        if c.positions > 0 && bits_for(c.positions - 1) > w.pptr {
            return bad(format!("{} position fields do not fit {}-bit pointers", c.positions, w.pptr));
        }
        Ok((codec, layout))
    }
}

// ---------------- save / load ----------------

pub(crate) fn write_state(db: &PositionDb, path: &Path) -> Result<(), IndexError> {
    if !db.is_loaded() {
        return Err(IndexError::NotLoaded);
    }
    let header = FileHeader::for_db(db);
    let table = db.table();
    let w = header.widths;
    let c = header.counters;
    let buckets = table.num_buckets();

    let file = File::create(path)?;
    let mut out = BufWriter::new(file);
    header.write_to(&mut out)?;

    for &s in table.bucket_sizes() {
        out.write_u32::<LE>(s)?;
    }
    match table.header() {
        HashHeader::Packed { bits, .. } => {
            write_words(&mut out, bits.words(), words_for(buckets + 1, w.hash)?)?
        }
        HashHeader::Full(v) => {
            for &o in v {
                out.write_u32::<LE>(o)?;
            }
        }
    }
    write_words(&mut out, table.pool().words(), words_for(c.entries, w.entry_bits())?)?;
    write_words(
        &mut out,
        table.positions().words(),
        words_for(c.positions, w.store_width())?,
    )?;
    out.flush()?;
    Ok(())
}

fn write_words<W: Write>(out: &mut W, words: &[u64], n: usize) -> Result<(), IndexError> {
    if words.len() < n {
        return Err(IndexError::Format(format!(
            "buffer holds {} words, layout needs {n}",
            words.len()
        )));
    }
    for &word in &words[..n] {
        out.write_u64::<LE>(word)?;
    }
    Ok(())
}

pub(crate) fn read_state(path: &Path, load_data: bool) -> Result<PositionDb, IndexError> {
    let file = File::open(path)?;
    let file_len = file.metadata()?.len();
    let mut r = BufReader::new(file);
    let header = FileHeader::read_from(&mut r).map_err(|e| match e.kind() {
        std::io::ErrorKind::UnexpectedEof => IndexError::Format("truncated header".into()),
        _ => IndexError::Io(e),
    })?;
    let (codec, layout) = header.validate()?;
    let w = header.widths;
    let c = header.counters;

    let table = if load_data {
        let expected = expected_len(&header, layout)?;
        if file_len != expected {
            return Err(IndexError::Format(format!(
                "file is {file_len} bytes, header describes {expected}"
            )));
        }
        let buckets = 1u64 << header.table_bits;
        let bucket_sizes = read_u32s(&mut r, buckets)?;
        let total: u64 = bucket_sizes.iter().map(|&s| s as u64).sum();
        if total != c.entries {
            return Err(IndexError::Format(format!(
                "bucket sizes sum to {total}, header says {} entries",
                c.entries
            )));
        }
        let hash_header = match layout {
            TableLayout::Packed => HashHeader::Packed {
                width: w.hash,
                bits: PackedWords::from_words(read_u64s(&mut r, words_for(buckets + 1, w.hash)?)?),
            },
            TableLayout::FullWidth => HashHeader::Full(read_u32s(&mut r, buckets + 1)?),
        };
        let pool = PackedWords::from_words(read_u64s(&mut r, words_for(c.entries, w.entry_bits())?)?);
        let store_words = read_u64s(&mut r, words_for(c.positions, w.store_width())?)?;
        let positions = PositionStore::from_parts(w.store_width(), c.positions, store_words)?;

        let table = BucketTable::from_parts(
            codec,
            layout,
            w,
            bucket_sizes,
            hash_header,
            pool,
            c.entries,
            positions,
            true,
        );
        table.verify()?;
        table
    } else {
        BucketTable::from_parts(
            codec,
            layout,
            w,
            Vec::new(),
            HashHeader::Full(Vec::new()),
            PackedWords::default(),
            c.entries,
            PositionStore::new(w.store_width()),
            false,
        )
    };

    let mut db = PositionDb::from_table(
        header.mer_size,
        header.mer_skip,
        header.max_mismatch,
        table,
        c,
    );
    if load_data && header.max_mismatch > 0 {
        db.set_up_mismatch_matcher(header.max_mismatch, c.distinct)?;
    }
    Ok(db)
}

/// Bytes of a complete file with this header.
fn expected_len(header: &FileHeader, layout: TableLayout) -> Result<u64, IndexError> {
    let w = header.widths;
    let c = header.counters;
    let buckets = 1u64 << header.table_bits;
    let header_bytes = match layout {
        TableLayout::Packed => 8 * words_for(buckets + 1, w.hash)? as u64,
        TableLayout::FullWidth => 4 * (buckets + 1),
    };
    let pool = words_for(c.entries, w.entry_bits())? as u64;
    let store = words_for(c.positions, w.store_width())? as u64;
    [4 * buckets, header_bytes, pool.saturating_mul(8), store.saturating_mul(8)]
        .into_iter()
        .try_fold(HEADER_BYTES, u64::checked_add)
        .ok_or_else(|| IndexError::Format("header describes an impossibly large file".into()))
}

fn read_u32s<R: Read>(r: &mut R, n: u64) -> Result<Vec<u32>, IndexError> {
    let n = usize::try_from(n).map_err(|_| IndexError::Format(format!("{n} values")))?;
    let mut v = Vec::new();
    v.try_reserve_exact(n)
        .map_err(|e| IndexError::Resource(format!("allocating {n} values: {e}")))?;
    v.resize(n, 0);
    r.read_u32_into::<LE>(&mut v)?;
    Ok(v)
}

fn read_u64s<R: Read>(r: &mut R, n: usize) -> Result<Vec<u64>, IndexError> {
    let mut v = zeroed_words(n)?;
    r.read_u64_into::<LE>(&mut v)?;
    Ok(v)
}

// ---------------- printing ----------------

pub(crate) fn print_state<W: Write>(db: &PositionDb, out: &mut W) -> std::io::Result<()> {
    let codec = db.codec();
    let (shift1, shift2) = codec.shifts();
    let (mask1, mask2) = codec.masks();
    let w = db.widths();
    let c = db.counters();

    writeln!(out, "merSizeInBases:     {}", db.mer_size())?;
    writeln!(out, "merSizeInBits:      {}", codec.mer_bits())?;
    writeln!(out, "merSkipInBases:     {}", db.mer_skip())?;
    writeln!(out, "maxMismatch:        {}", db.max_mismatch())?;
    writeln!(out, "tableSizeInBits:    {}", db.table_bits())?;
    writeln!(out, "tableSizeInEntries: {}", 1u64 << db.table_bits())?;
    writeln!(out, "layout:             {:?}", db.layout())?;
    writeln!(out, "hashWidth:          {}", w.hash)?;
    writeln!(out, "chckWidth:          {}", w.chck)?;
    writeln!(out, "posnWidth:          {}", w.posn)?;
    writeln!(out, "pptrWidth:          {}", w.pptr)?;
    writeln!(out, "sizeWidth:          {}", w.size)?;
    writeln!(out, "entryWidth:         {}", w.entry_bits())?;
    writeln!(out, "shift1:             {shift1}")?;
    writeln!(out, "shift2:             {shift2}")?;
    writeln!(out, "mask1:              {mask1:#018x}")?;
    writeln!(out, "mask2:              {mask2:#018x}")?;
    writeln!(out, "numberOfMers:       {}", c.mers)?;
    writeln!(out, "numberOfPositions:  {}", c.positions)?;
    writeln!(out, "numberOfDistinct:   {}", c.distinct)?;
    writeln!(out, "numberOfUnique:     {}", c.unique)?;
    writeln!(out, "numberOfEntries:    {}", c.entries)?;
    writeln!(out, "maximumEntries:     {}", c.max_entries)?;
    writeln!(out, "dataLoaded:         {}", db.is_loaded())?;
    if let Some(m) = db.mismatch_matcher() {
        writeln!(
            out,
            "mismatchPatterns:   {} ({} buckets probed, cost {:.3})",
            m.patterns(),
            m.hashed_errors().len(),
            m.cost()
        )?;
    }
    Ok(())
}
