//! Bit-packed mer → position index with exact and bounded-mismatch lookup.
//!
//! Mers (up to 32 bases, 2 bits per base) are split by a reversible hash into
//! a bucket number and a check value; only the check is stored. Entries are
//! packed at the minimum bit widths the input needs:
//! - single occurrences keep their position inline;
//! - repeats point into a shared position store;
//! - a per-entry count can be rewritten after construction.
//!
//! Tables are built in passes over a replayable [`MerSource`], queried from
//! any number of threads through `&PositionDb`, and saved in a flat
//! little-endian format (see `io` for the layout).
//!
//! ```no_run
//! use kira_posdb::{BuildConfig, PositionDb, SequenceMers, encode_kmer};
//!
//! let mut mers = SequenceMers::new(b"ACGTACGTTTTT", 4)?;
//! let db = PositionDb::build(&mut mers, BuildConfig::new(4).max_mismatch(1))?;
//! let acgt = encode_kmer(b"ACGT").unwrap();
//! assert_eq!(db.get_exact(acgt), Some(vec![0, 4]));
//! # Ok::<(), kira_posdb::IndexError>(())
//! ```

pub mod bits;
mod builder;
pub mod codec;
pub mod encode;
mod index;
mod io;
pub mod mismatch;
pub mod positions;
mod radix;
pub mod source;
pub mod table;

pub use builder::{BuildConfig, Builder, MAX_TABLE_BITS, choose_table_bits, estimate_bits};
pub use codec::{BitCodec, MAX_MER_SIZE};
pub use encode::{base_mismatches, canonical, decode_kmer, encode_kmer, revcomp};
pub use index::{Counters, IndexError, PositionDb};
pub use io::{FileHeader, HEADER_BYTES, POSDB_MAGIC, POSDB_VERSION};
pub use mismatch::MismatchMatcher;
pub use positions::{PositionStore, RangeHandle};
pub use source::{Canonical, MerCounts, MerFilter, MerHit, MerList, MerSource, SequenceMers};
pub use table::{Entry, FieldWidths, PositionRef, TableLayout};
