#![forbid(unsafe_code)]
//! Core newtypes, on-disk constants, and byte-level parse helpers.
//!
//! Everything in this crate is shared vocabulary: the fixed geometry of the
//! on-disk format, unit-carrying wrappers that keep logical blocks, physical
//! blocks, and inode numbers from being mixed, and the little-endian codec
//! helpers the `cellfs-ondisk` structures are built from.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

// ── On-disk geometry ────────────────────────────────────────────────────────

/// Fixed block size of a cellfs image, in bytes.
pub const BLOCK_SIZE: u32 = 4096;

/// Magic number identifying a cellfs image, stored in the superblock.
pub const CELLFS_MAGIC: u32 = 0x00DE_ADCE;

/// The superblock always lives in block 0.
pub const SUPERBLOCK_BLOCK: BlockNumber = BlockNumber(0);

/// On-disk size of one inode record, in bytes.
pub const INODE_SIZE: usize = 72;

/// Inode records packed into one inode-store block.
pub const INODES_PER_BLOCK: u32 = BLOCK_SIZE / INODE_SIZE as u32;

/// Bytes of symlink target that fit inline in the inode record.
pub const INLINE_DATA_LEN: usize = 32;

/// On-disk size of one extent slot, in bytes.
pub const EXTENT_SLOT_SIZE: usize = 16;

/// Header bytes of an extent index block (`nr_files` + `nr_extents`).
pub const EXTENT_INDEX_HEADER: usize = 8;

/// Maximum number of extents in one extent index block.
pub const MAX_EXTENTS: usize = (BLOCK_SIZE as usize - EXTENT_INDEX_HEADER) / EXTENT_SLOT_SIZE;

/// Maximum number of physical blocks covered by a single extent.
pub const MAX_BLOCKS_PER_EXTENT: u32 = 8;

/// Largest file a single extent index can address, in bytes.
pub const MAX_FILESIZE: u64 =
    MAX_BLOCKS_PER_EXTENT as u64 * BLOCK_SIZE as u64 * MAX_EXTENTS as u64;

/// Maximum filename length in a directory entry, in bytes.
pub const FILENAME_LEN: usize = 255;

/// On-disk size of one directory entry (inode + block count + name + pad).
pub const DIR_ENTRY_SIZE: usize = 264;

/// Header bytes of a directory block (`nr_files`).
pub const DIR_BLOCK_HEADER: usize = 4;

/// Directory entries packed into one directory block.
pub const FILES_PER_BLOCK: usize = (BLOCK_SIZE as usize - DIR_BLOCK_HEADER) / DIR_ENTRY_SIZE;

/// Maximum number of entries a single directory can hold.
pub const MAX_SUBFILES: u64 =
    FILES_PER_BLOCK as u64 * MAX_BLOCKS_PER_EXTENT as u64 * MAX_EXTENTS as u64;

// ── POSIX file mode constants ───────────────────────────────────────────────

/// File type mask (upper 4 bits of mode).
pub const S_IFMT: u32 = 0o170_000;
/// Directory.
pub const S_IFDIR: u32 = 0o040_000;
/// Regular file.
pub const S_IFREG: u32 = 0o100_000;
/// Symbolic link.
pub const S_IFLNK: u32 = 0o120_000;

// ── Unit-carrying newtypes ──────────────────────────────────────────────────

/// Physical block number on the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BlockNumber(pub u32);

/// Logical block index within a file (byte offset / [`BLOCK_SIZE`]).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct LogicalBlock(pub u32);

/// Inode number (0-indexed into the inode store).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct InodeNumber(pub u32);

impl InodeNumber {
    /// The root directory is always inode 0.
    pub const ROOT: Self = Self(0);
}

impl BlockNumber {
    /// Byte offset of this block on the device, `None` on overflow.
    #[must_use]
    pub fn to_byte_offset(self) -> Option<u64> {
        u64::from(self.0).checked_mul(u64::from(BLOCK_SIZE))
    }

    /// Add a block count, returning `None` on overflow.
    #[must_use]
    pub fn checked_add(self, count: u32) -> Option<Self> {
        self.0.checked_add(count).map(Self)
    }
}

impl LogicalBlock {
    /// Logical block containing the given byte offset (truncating).
    #[must_use]
    pub fn containing(byte_offset: u64) -> Option<Self> {
        u32::try_from(byte_offset / u64::from(BLOCK_SIZE)).ok().map(Self)
    }

    /// Byte offset of the start of this logical block.
    #[must_use]
    pub fn byte_offset(self) -> u64 {
        u64::from(self.0) * u64::from(BLOCK_SIZE)
    }
}

impl fmt::Display for BlockNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for LogicalBlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for InodeNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ── Parse errors ────────────────────────────────────────────────────────────

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("insufficient data: need {needed} bytes at offset {offset}, got {actual}")]
    InsufficientData {
        needed: usize,
        offset: usize,
        actual: usize,
    },
    #[error("invalid magic: expected {expected:#x}, got {actual:#x}")]
    InvalidMagic { expected: u32, actual: u32 },
    #[error("invalid field: {field} ({reason})")]
    InvalidField {
        field: &'static str,
        reason: &'static str,
    },
    #[error("integer conversion failed: {field}")]
    IntegerConversion { field: &'static str },
}

// ── Byte-level codec helpers ────────────────────────────────────────────────

#[inline]
pub fn ensure_slice(data: &[u8], offset: usize, len: usize) -> Result<&[u8], ParseError> {
    let Some(end) = offset.checked_add(len) else {
        return Err(ParseError::InvalidField {
            field: "offset",
            reason: "overflow",
        });
    };

    if end > data.len() {
        return Err(ParseError::InsufficientData {
            needed: len,
            offset,
            actual: data.len().saturating_sub(offset),
        });
    }

    Ok(&data[offset..end])
}

#[inline]
pub fn read_le_u32(data: &[u8], offset: usize) -> Result<u32, ParseError> {
    let bytes = ensure_slice(data, offset, 4)?;
    Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

#[inline]
pub fn write_le_u32(data: &mut [u8], offset: usize, value: u32) -> Result<(), ParseError> {
    let end = offset.checked_add(4).ok_or(ParseError::InvalidField {
        field: "offset",
        reason: "overflow",
    })?;
    let dst = data
        .get_mut(offset..end)
        .ok_or(ParseError::InsufficientData {
            needed: 4,
            offset,
            actual: 0,
        })?;
    dst.copy_from_slice(&value.to_le_bytes());
    Ok(())
}

#[inline]
pub fn read_fixed<const N: usize>(data: &[u8], offset: usize) -> Result<[u8; N], ParseError> {
    let bytes = ensure_slice(data, offset, N)?;
    let mut out = [0_u8; N];
    out.copy_from_slice(bytes);
    Ok(out)
}

/// Length of a NUL-padded byte field up to the first NUL.
#[must_use]
pub fn nul_padded_len(bytes: &[u8]) -> usize {
    bytes.iter().position(|b| *b == 0).unwrap_or(bytes.len())
}

/// Narrow a `u64` to `u32` with an explicit error path.
pub fn u64_to_u32(value: u64, field: &'static str) -> Result<u32, ParseError> {
    u32::try_from(value).map_err(|_| ParseError::IntegerConversion { field })
}

/// Blocks needed to hold `bytes` bytes (ceiling division).
#[must_use]
pub fn blocks_for_bytes(bytes: u64) -> u64 {
    bytes.div_ceil(u64::from(BLOCK_SIZE))
}

/// Blocks needed to hold `bits` bitmap bits (one block = `BLOCK_SIZE * 8` bits).
#[must_use]
pub fn blocks_for_bits(bits: u64) -> u64 {
    bits.div_ceil(u64::from(BLOCK_SIZE) * 8)
}
