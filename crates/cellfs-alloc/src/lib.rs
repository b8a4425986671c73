#![forbid(unsafe_code)]
//! Bitmap-backed free-space allocation.
//!
//! A [`Bitset`] provides raw word-level bit manipulation; a
//! [`BitmapAllocator`] layers the allocation contract on top: first-fit
//! `allocate`, targeted `try_allocate_at` (used by extent coalescing),
//! double-free detection, and a cached free count that always equals the
//! population count of the bit array.
//!
//! Bit convention, matching the on-disk bitmap regions: **1 = free**.
//! The on-disk region is the source of truth at load time; the cached
//! counter is derived by popcount and maintained incrementally after that.

use cellfs_error::{CellError, Result};
use cellfs_types::ParseError;
use tracing::warn;

const WORD_BITS: u32 = u64::BITS;

/// Fixed-size bit set over `u64` words.
///
/// The word width is an implementation detail; serialization is defined as
/// the little-endian byte image of the words, so the on-disk format does not
/// depend on it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bitset {
    words: Vec<u64>,
    nbits: u32,
}

impl Bitset {
    /// A bit set with all `nbits` bits clear.
    #[must_use]
    pub fn new_clear(nbits: u32) -> Self {
        let nwords = nbits.div_ceil(WORD_BITS) as usize;
        Self {
            words: vec![0; nwords],
            nbits,
        }
    }

    /// A bit set with all `nbits` bits set.
    #[must_use]
    pub fn new_set(nbits: u32) -> Self {
        let mut bits = Self::new_clear(nbits);
        for word in &mut bits.words {
            *word = u64::MAX;
        }
        bits.mask_tail();
        bits
    }

    /// Load from a little-endian byte image. Extra bytes beyond `nbits` are
    /// ignored; missing bytes are an error.
    pub fn from_bytes(bytes: &[u8], nbits: u32) -> std::result::Result<Self, ParseError> {
        let needed = (nbits.div_ceil(8)) as usize;
        if bytes.len() < needed {
            return Err(ParseError::InsufficientData {
                needed,
                offset: 0,
                actual: bytes.len(),
            });
        }
        let mut bits = Self::new_clear(nbits);
        for (w, word) in bits.words.iter_mut().enumerate() {
            let mut raw = [0_u8; 8];
            let start = w * 8;
            let end = (start + 8).min(needed);
            raw[..end - start].copy_from_slice(&bytes[start..end]);
            *word = u64::from_le_bytes(raw);
        }
        bits.mask_tail();
        Ok(bits)
    }

    /// Serialize the little-endian byte image into `out`, zero-filling the
    /// remainder. `out` must hold at least `ceil(nbits / 8)` bytes.
    pub fn write_bytes(&self, out: &mut [u8]) -> std::result::Result<(), ParseError> {
        let needed = (self.nbits.div_ceil(8)) as usize;
        if out.len() < needed {
            return Err(ParseError::InsufficientData {
                needed,
                offset: 0,
                actual: out.len(),
            });
        }
        out.fill(0);
        for (w, word) in self.words.iter().enumerate() {
            let raw = word.to_le_bytes();
            let start = w * 8;
            let end = (start + 8).min(needed);
            out[start..end].copy_from_slice(&raw[..end - start]);
        }
        Ok(())
    }

    /// Clear any bits in the last word beyond `nbits` so popcount and scans
    /// stay exact.
    fn mask_tail(&mut self) {
        let tail = self.nbits % WORD_BITS;
        if tail != 0 {
            if let Some(last) = self.words.last_mut() {
                *last &= (1_u64 << tail) - 1;
            }
        }
    }

    #[must_use]
    pub fn nbits(&self) -> u32 {
        self.nbits
    }

    #[must_use]
    pub fn get(&self, idx: u32) -> bool {
        if idx >= self.nbits {
            return false;
        }
        let word = self.words[(idx / WORD_BITS) as usize];
        (word >> (idx % WORD_BITS)) & 1 == 1
    }

    pub fn set(&mut self, idx: u32) {
        if idx < self.nbits {
            self.words[(idx / WORD_BITS) as usize] |= 1_u64 << (idx % WORD_BITS);
        }
    }

    pub fn clear(&mut self, idx: u32) {
        if idx < self.nbits {
            self.words[(idx / WORD_BITS) as usize] &= !(1_u64 << (idx % WORD_BITS));
        }
    }

    /// Index of the lowest set bit, or `None` if every bit is clear.
    #[must_use]
    pub fn first_set(&self) -> Option<u32> {
        for (w, word) in self.words.iter().enumerate() {
            if *word != 0 {
                let idx = u32::try_from(w).ok()? * WORD_BITS + word.trailing_zeros();
                return (idx < self.nbits).then_some(idx);
            }
        }
        None
    }

    /// Number of set bits.
    #[must_use]
    pub fn count_ones(&self) -> u32 {
        self.words.iter().map(|w| w.count_ones()).sum()
    }
}

/// First-fit bitmap allocator over a run of indexes (inodes or blocks).
///
/// Set bits are free. `count_free()` always equals the popcount of the
/// underlying bit set.
#[derive(Debug, Clone)]
pub struct BitmapAllocator {
    bits: Bitset,
    free: u32,
    /// Label used in contract-violation reports ("inode" or "block").
    map: &'static str,
}

impl BitmapAllocator {
    /// An allocator with every index free.
    #[must_use]
    pub fn new_all_free(nbits: u32, map: &'static str) -> Self {
        Self {
            bits: Bitset::new_set(nbits),
            free: nbits,
            map,
        }
    }

    /// Load from an on-disk bitmap region. The free count is derived by
    /// popcount; the region is the source of truth.
    pub fn from_bytes(
        bytes: &[u8],
        nbits: u32,
        map: &'static str,
    ) -> std::result::Result<Self, ParseError> {
        let bits = Bitset::from_bytes(bytes, nbits)?;
        let free = bits.count_ones();
        Ok(Self { bits, free, map })
    }

    /// Serialize the bit array into an on-disk region buffer.
    pub fn write_bytes(&self, out: &mut [u8]) -> std::result::Result<(), ParseError> {
        self.bits.write_bytes(out)
    }

    /// Allocate the lowest free index.
    pub fn allocate(&mut self) -> Result<u32> {
        let Some(idx) = self.bits.first_set() else {
            return Err(CellError::NoSpace);
        };
        self.bits.clear(idx);
        self.free -= 1;
        Ok(idx)
    }

    /// Claim a specific index if it is free. Returns `false` (without
    /// mutating) when the index is already in use or out of range.
    pub fn try_allocate_at(&mut self, idx: u32) -> bool {
        if !self.bits.get(idx) {
            return false;
        }
        self.bits.clear(idx);
        self.free -= 1;
        true
    }

    /// Release an index. Freeing an index that is already free is a caller
    /// contract violation and is reported, not ignored.
    pub fn free(&mut self, idx: u32) -> Result<()> {
        if idx >= self.bits.nbits() {
            return Err(CellError::Corrupt {
                block: 0,
                detail: format!("{} free index {idx} out of range", self.map),
            });
        }
        if self.bits.get(idx) {
            warn!(map = self.map, index = idx, "double free detected");
            return Err(CellError::DoubleFree {
                index: idx,
                map: self.map,
            });
        }
        self.bits.set(idx);
        self.free += 1;
        Ok(())
    }

    #[must_use]
    pub fn is_free(&self, idx: u32) -> bool {
        self.bits.get(idx)
    }

    /// Cached free count; invariant: equals `popcount()`.
    #[must_use]
    pub fn count_free(&self) -> u32 {
        self.free
    }

    /// Free count recomputed from the bit array (test/repair aid).
    #[must_use]
    pub fn popcount(&self) -> u32 {
        self.bits.count_ones()
    }

    #[must_use]
    pub fn nbits(&self) -> u32 {
        self.bits.nbits()
    }
}
