//! Compact sorted integer set with adaptive element width.
//!
//! [`IntSet`] stores unique `i64` values in ascending order inside a single
//! contiguous buffer, packed little-endian at the narrowest width that fits
//! every stored value (2, 4, or 8 bytes per element).
//!
//! ## Buffer Layout
//!
//! ```text
//! [encoding: I16|I32|I64] [len: u32] [elem 0][elem 1]...[elem len-1]
//! ```
//!
//! Elements are fixed-width little-endian two's-complement integers.
//! Inserting a value that does not fit the current width **upgrades** the
//! whole buffer to the wider encoding; removal never downgrades.
//!
//! ## Key invariants
//!
//! - Elements are strictly increasing (sorted, no duplicates).
//! - `encoding` is the smallest width fitting every stored value, except
//!   that a remove may leave the encoding wider than strictly required.
//! - An upgrade-triggering value lies strictly outside the stored range,
//!   so it is prepended (negative) or appended (non-negative), never
//!   inserted in the middle.

use std::fmt;

use rand::Rng;

/// Size of the conceptual on-wire header: encoding tag plus element count,
/// both 32-bit.
pub const HEADER_SIZE: usize = 8;

// ---------------------------------------------------------------------------
// Encoding
// ---------------------------------------------------------------------------

/// Element width of the packed buffer.
///
/// Variants are ordered, so upgrades compare with `<`:
/// `I16 < I32 < I64`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum Encoding {
    /// 2 bytes per element.
    I16,
    /// 4 bytes per element.
    I32,
    /// 8 bytes per element.
    I64,
}

impl Encoding {
    /// Element width in bytes.
    #[inline]
    pub fn width(self) -> usize {
        match self {
            Encoding::I16 => 2,
            Encoding::I32 => 4,
            Encoding::I64 => 8,
        }
    }

    /// The narrowest encoding that can represent `v`.
    fn for_value(v: i64) -> Self {
        if v < i32::MIN as i64 || v > i32::MAX as i64 {
            Encoding::I64
        } else if v < i16::MIN as i64 || v > i16::MAX as i64 {
            Encoding::I32
        } else {
            Encoding::I16
        }
    }
}

// ---------------------------------------------------------------------------
// IntSet
// ---------------------------------------------------------------------------

/// Sorted unique set of `i64` values, packed at adaptive width.
#[derive(Clone)]
pub struct IntSet {
    encoding: Encoding,
    len: u32,
    data: Vec<u8>,
}

impl IntSet {
    /// Create an empty set with the narrowest encoding.
    pub fn new() -> Self {
        Self {
            encoding: Encoding::I16,
            len: 0,
            data: Vec::new(),
        }
    }

    /// Number of stored values.
    #[inline]
    pub fn len(&self) -> usize {
        self.len as usize
    }

    /// True if no values are stored.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Current element encoding.
    #[inline]
    pub fn encoding(&self) -> Encoding {
        self.encoding
    }

    /// Total byte size of the set: header plus packed elements.
    #[inline]
    pub fn byte_size(&self) -> usize {
        HEADER_SIZE + self.data.len()
    }

    /// Value at position `pos`, or `None` when out of range.
    pub fn get(&self, pos: usize) -> Option<i64> {
        if pos < self.len() {
            Some(self.get_at(pos))
        } else {
            None
        }
    }

    /// True if `value` is a member of the set.
    pub fn contains(&self, value: i64) -> bool {
        Encoding::for_value(value) <= self.encoding && self.search(value).is_ok()
    }

    /// A uniformly random member, or `None` when the set is empty.
    pub fn random<R: Rng>(&self, rng: &mut R) -> Option<i64> {
        if self.is_empty() {
            return None;
        }
        Some(self.get_at(rng.gen_range(0..self.len())))
    }

    /// Iterate members in ascending order.
    pub fn iter(&self) -> impl Iterator<Item = i64> + '_ {
        (0..self.len()).map(move |i| self.get_at(i))
    }

    /// Insert `value`. Returns `true` if it was inserted, `false` if it was
    /// already present.
    ///
    /// A value wider than the current encoding upgrades the buffer first;
    /// such a value is always new (it lies outside the representable range
    /// of every stored element), so the upgrade path cannot see duplicates.
    pub fn add(&mut self, value: i64) -> bool {
        if Encoding::for_value(value) > self.encoding {
            self.upgrade_and_add(value);
            return true;
        }
        match self.search(value) {
            Ok(_) => false,
            Err(pos) => {
                let w = self.encoding.width();
                let old_end = self.len() * w;
                self.data.resize(old_end + w, 0);
                let start = pos * w;
                if start < old_end {
                    self.data.copy_within(start..old_end, start + w);
                }
                self.set_at(pos, value);
                self.len += 1;
                true
            }
        }
    }

    /// Remove `value`. Returns `true` if it was present.
    ///
    /// The encoding is never downgraded, even when the removed value was
    /// the only one requiring the current width.
    pub fn remove(&mut self, value: i64) -> bool {
        if Encoding::for_value(value) > self.encoding {
            return false;
        }
        match self.search(value) {
            Err(_) => false,
            Ok(pos) => {
                let w = self.encoding.width();
                let start = pos * w;
                let end = self.len() * w;
                self.data.copy_within(start + w..end, start);
                self.data.truncate(end - w);
                self.len -= 1;
                true
            }
        }
    }

    // -- internals ----------------------------------------------------------

    /// Binary search over the packed buffer.
    ///
    /// `Ok(pos)` when `value` is stored at `pos`; `Err(pos)` with the
    /// insertion position otherwise. Three fast paths run before the
    /// bisection: empty set, value above the last element, value below the
    /// first.
    fn search(&self, value: i64) -> Result<usize, usize> {
        let len = self.len();
        if len == 0 {
            return Err(0);
        }
        if value > self.get_at(len - 1) {
            return Err(len);
        }
        if value < self.get_at(0) {
            return Err(0);
        }

        let mut min: isize = 0;
        let mut max: isize = len as isize - 1;
        while max >= min {
            let mid = ((min + max) >> 1) as usize;
            let cur = self.get_at(mid);
            if value > cur {
                min = mid as isize + 1;
            } else if value < cur {
                max = mid as isize - 1;
            } else {
                return Ok(mid);
            }
        }
        Err(min as usize)
    }

    /// Upgrade to the encoding required by `value` and insert it at the
    /// front (negative) or back (non-negative).
    fn upgrade_and_add(&mut self, value: i64) {
        let curenc = self.encoding;
        let newenc = Encoding::for_value(value);
        let len = self.len();
        let prepend = usize::from(value < 0);

        let mut data = vec![0u8; (len + 1) * newenc.width()];
        for i in 0..len {
            let v = read_at(&self.data, i, curenc);
            write_at(&mut data, i + prepend, newenc, v);
        }
        if prepend == 1 {
            write_at(&mut data, 0, newenc, value);
        } else {
            write_at(&mut data, len, newenc, value);
        }

        self.encoding = newenc;
        self.data = data;
        self.len += 1;
    }

    #[inline]
    fn get_at(&self, pos: usize) -> i64 {
        read_at(&self.data, pos, self.encoding)
    }

    #[inline]
    fn set_at(&mut self, pos: usize, value: i64) {
        write_at(&mut self.data, pos, self.encoding, value);
    }
}

impl Default for IntSet {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for IntSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.iter()).finish()
    }
}

/// Read the sign-extended element at `pos` from a buffer packed at `enc`.
fn read_at(data: &[u8], pos: usize, enc: Encoding) -> i64 {
    let off = pos * enc.width();
    match enc {
        Encoding::I16 => i16::from_le_bytes([data[off], data[off + 1]]) as i64,
        Encoding::I32 => {
            i32::from_le_bytes([data[off], data[off + 1], data[off + 2], data[off + 3]]) as i64
        }
        Encoding::I64 => i64::from_le_bytes([
            data[off],
            data[off + 1],
            data[off + 2],
            data[off + 3],
            data[off + 4],
            data[off + 5],
            data[off + 6],
            data[off + 7],
        ]),
    }
}

/// Write `value` little-endian at `pos` into a buffer packed at `enc`.
///
/// `value` must fit `enc`; the narrowing casts are exact by construction.
fn write_at(data: &mut [u8], pos: usize, enc: Encoding, value: i64) {
    let off = pos * enc.width();
    match enc {
        Encoding::I16 => data[off..off + 2].copy_from_slice(&(value as i16).to_le_bytes()),
        Encoding::I32 => data[off..off + 4].copy_from_slice(&(value as i32).to_le_bytes()),
        Encoding::I64 => data[off..off + 8].copy_from_slice(&value.to_le_bytes()),
    }
}

// ============================================================================
// Tests
// ============================================================================
