//! Append-only store of position lists.
//!
//! Each list is a length field followed by its positions, all fields of one
//! uniform width. A list is addressed by the field index of its length.

use crate::bits::{PackedWords, low_mask};
use crate::index::IndexError;

/// Field index of a position list's length slot.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct RangeHandle(pub(crate) u64);

impl RangeHandle {
    #[inline]
    pub fn index(self) -> u64 {
        self.0
    }
}

#[derive(Clone, Debug, Default)]
pub struct PositionStore {
    width: u32,
    len: u64,
    data: PackedWords,
}

impl PositionStore {
    /// Empty store whose fields are `width` bits.
    pub fn new(width: u32) -> Self {
        Self {
            width,
            len: 0,
            data: PackedWords::default(),
        }
    }

    /// Store restored from `len` fields packed in `words`.
    pub(crate) fn from_parts(width: u32, len: u64, words: Vec<u64>) -> Result<Self, IndexError> {
        let data = PackedWords::from_words(words);
        let need = len
            .checked_mul(width as u64)
            .ok_or_else(|| IndexError::Format("position store size overflows".into()))?;
        if need > data.capacity_bits() {
            return Err(IndexError::Format(format!(
                "position store holds {} bits, header needs {need}",
                data.capacity_bits()
            )));
        }
        Ok(Self { width, len, data })
    }

    #[inline]
    pub fn width(&self) -> u32 {
        self.width
    }

    /// Fields in use (lengths plus positions).
    #[inline]
    pub fn len_fields(&self) -> u64 {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub(crate) fn words(&self) -> &[u64] {
        self.data.words()
    }

    /// Make room for `additional` more fields.
    pub fn reserve(&mut self, additional: u64) -> Result<(), IndexError> {
        let fields = self
            .len
            .checked_add(additional)
            .ok_or_else(|| IndexError::Resource("position store length overflows".into()))?;
        let bits = fields
            .checked_mul(self.width as u64)
            .ok_or_else(|| IndexError::Resource("position store size overflows".into()))?;
        self.data.grow_to_bits(bits)
    }

    /// Release capacity past the used fields.
    pub fn shrink_to_fit(&mut self) {
        self.data.truncate_to_bits(self.len * self.width as u64);
    }

    #[inline]
    fn field(&self, i: u64) -> u64 {
        debug_assert!(i < self.len);
        self.data.get(i * self.width as u64, self.width)
    }

    #[inline]
    fn set_field(&mut self, i: u64, v: u64) {
        self.data.set(i * self.width as u64, self.width, v);
    }

    /// Open a new, empty list at the end of the store.
    pub fn begin_range(&mut self) -> Result<RangeHandle, IndexError> {
        self.reserve(1)?;
        let h = RangeHandle(self.len);
        self.len += 1;
        self.set_field(h.0, 0);
        Ok(h)
    }

    /// Append one position to `handle`, which must be the last list.
    pub fn append(&mut self, handle: RangeHandle, position: u64) -> Result<(), IndexError> {
        let n = self.len_of(handle);
        if handle.0 + 1 + n != self.len {
            return Err(IndexError::SealedRange(handle.0));
        }
        if position > low_mask(self.width) || n + 1 > low_mask(self.width) {
            return Err(IndexError::Resource(format!(
                "position {position} or list length {} exceeds {} bits",
                n + 1,
                self.width
            )));
        }
        self.reserve(1)?;
        let at = self.len;
        self.len += 1;
        self.set_field(at, position);
        self.set_field(handle.0, n + 1);
        Ok(())
    }

    /// Store a complete list.
    pub fn push_range(&mut self, positions: &[u64]) -> Result<RangeHandle, IndexError> {
        self.reserve(positions.len() as u64 + 1)?;
        let h = self.begin_range()?;
        for &p in positions {
            self.append(h, p)?;
        }
        Ok(h)
    }

    /// Number of positions in a list.
    #[inline]
    pub fn len_of(&self, handle: RangeHandle) -> u64 {
        self.field(handle.0)
    }

    /// Positions of a list, in insertion order.
    pub fn iter(&self, handle: RangeHandle) -> impl Iterator<Item = u64> + '_ {
        let start = handle.0 + 1;
        let end = start + self.len_of(handle);
        (start..end).map(move |i| self.field(i))
    }

    /// Keep only positions in `[lo, hi]`, compacting in place. Returns the
    /// number kept; freed slots stay allocated to the list.
    pub fn retain_in(&mut self, handle: RangeHandle, lo: u64, hi: u64) -> u64 {
        let start = handle.0 + 1;
        let n = self.len_of(handle);
        let mut kept = 0;
        for i in start..start + n {
            let p = self.field(i);
            if (lo..=hi).contains(&p) {
                self.set_field(start + kept, p);
                kept += 1;
            }
        }
        self.set_field(handle.0, kept);
        kept
    }
}
