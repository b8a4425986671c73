#![forbid(unsafe_code)]
//! On-disk structure codecs.
//!
//! Byte-level parsing and serialization for every structure the format
//! defines: the superblock, the region layout derived from it, packed inode
//! records, extent index blocks, and directory blocks. All integers are
//! 32-bit little-endian. Parsing validates structural invariants (magic,
//! region geometry, extent ordering, slot counts) and reports violations as
//! [`ParseError`]; callers that know the block number translate these into
//! corruption errors.
//!
//! Image layout, starting at block 0:
//!
//! ```text
//! +---------------+
//! |  superblock   |  1 block
//! +---------------+
//! |  inode store  |  nr_istore_blocks blocks
//! +---------------+
//! | ifree bitmap  |  nr_ifree_blocks blocks
//! +---------------+
//! | bfree bitmap  |  nr_bfree_blocks blocks
//! +---------------+
//! |  data blocks  |  rest of the device
//! +---------------+
//! ```

use cellfs_types::{
    BLOCK_SIZE, BlockNumber, CELLFS_MAGIC, DIR_BLOCK_HEADER, DIR_ENTRY_SIZE, EXTENT_INDEX_HEADER,
    EXTENT_SLOT_SIZE, FILENAME_LEN, FILES_PER_BLOCK, INLINE_DATA_LEN, INODE_SIZE,
    INODES_PER_BLOCK, InodeNumber, LogicalBlock, MAX_BLOCKS_PER_EXTENT, MAX_EXTENTS, ParseError,
    blocks_for_bits, blocks_for_bytes, nul_padded_len, read_fixed, read_le_u32, u64_to_u32,
    write_le_u32,
};
use serde::{Deserialize, Serialize};

// ── Superblock ──────────────────────────────────────────────────────────────

/// On-disk superblock fields, block 0.
///
/// The two free counters are caches; the bitmap regions are the source of
/// truth at mount time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Superblock {
    pub magic: u32,
    pub nr_blocks: u32,
    pub nr_inodes: u32,
    pub nr_istore_blocks: u32,
    pub nr_ifree_blocks: u32,
    pub nr_bfree_blocks: u32,
    pub nr_free_inodes: u32,
    pub nr_free_blocks: u32,
}

impl Superblock {
    /// Parse a superblock from a block-sized buffer, validating magic and
    /// region geometry.
    pub fn parse_block(block: &[u8]) -> Result<Self, ParseError> {
        if block.len() < BLOCK_SIZE as usize {
            return Err(ParseError::InsufficientData {
                needed: BLOCK_SIZE as usize,
                offset: 0,
                actual: block.len(),
            });
        }

        let magic = read_le_u32(block, 0x00)?;
        if magic != CELLFS_MAGIC {
            return Err(ParseError::InvalidMagic {
                expected: CELLFS_MAGIC,
                actual: magic,
            });
        }

        let sb = Self {
            magic,
            nr_blocks: read_le_u32(block, 0x04)?,
            nr_inodes: read_le_u32(block, 0x08)?,
            nr_istore_blocks: read_le_u32(block, 0x0C)?,
            nr_ifree_blocks: read_le_u32(block, 0x10)?,
            nr_bfree_blocks: read_le_u32(block, 0x14)?,
            nr_free_inodes: read_le_u32(block, 0x18)?,
            nr_free_blocks: read_le_u32(block, 0x1C)?,
        };
        sb.validate()?;
        Ok(sb)
    }

    /// Serialize into a zero-padded block-sized buffer.
    pub fn write_block(&self, block: &mut [u8]) -> Result<(), ParseError> {
        if block.len() < BLOCK_SIZE as usize {
            return Err(ParseError::InsufficientData {
                needed: BLOCK_SIZE as usize,
                offset: 0,
                actual: block.len(),
            });
        }
        block[..BLOCK_SIZE as usize].fill(0);
        write_le_u32(block, 0x00, self.magic)?;
        write_le_u32(block, 0x04, self.nr_blocks)?;
        write_le_u32(block, 0x08, self.nr_inodes)?;
        write_le_u32(block, 0x0C, self.nr_istore_blocks)?;
        write_le_u32(block, 0x10, self.nr_ifree_blocks)?;
        write_le_u32(block, 0x14, self.nr_bfree_blocks)?;
        write_le_u32(block, 0x18, self.nr_free_inodes)?;
        write_le_u32(block, 0x1C, self.nr_free_blocks)?;
        Ok(())
    }

    /// Validate region geometry against the declared totals.
    pub fn validate(&self) -> Result<(), ParseError> {
        let meta = 1_u64
            + u64::from(self.nr_istore_blocks)
            + u64::from(self.nr_ifree_blocks)
            + u64::from(self.nr_bfree_blocks);
        if meta > u64::from(self.nr_blocks) {
            return Err(ParseError::InvalidField {
                field: "nr_blocks",
                reason: "metadata regions exceed device size",
            });
        }

        let layout = Layout::for_geometry(self.nr_blocks, self.nr_inodes)?;
        if layout.nr_istore_blocks != self.nr_istore_blocks {
            return Err(ParseError::InvalidField {
                field: "nr_istore_blocks",
                reason: "does not match inode count",
            });
        }
        if layout.nr_ifree_blocks != self.nr_ifree_blocks {
            return Err(ParseError::InvalidField {
                field: "nr_ifree_blocks",
                reason: "does not match inode count",
            });
        }
        if layout.nr_bfree_blocks != self.nr_bfree_blocks {
            return Err(ParseError::InvalidField {
                field: "nr_bfree_blocks",
                reason: "does not match block count",
            });
        }
        if self.nr_free_inodes > self.nr_inodes {
            return Err(ParseError::InvalidField {
                field: "nr_free_inodes",
                reason: "exceeds nr_inodes",
            });
        }
        if self.nr_free_blocks > self.nr_blocks {
            return Err(ParseError::InvalidField {
                field: "nr_free_blocks",
                reason: "exceeds nr_blocks",
            });
        }
        Ok(())
    }

    /// Region layout described by this superblock.
    pub fn layout(&self) -> Result<Layout, ParseError> {
        Layout::for_geometry(self.nr_blocks, self.nr_inodes)
    }
}

// ── Region layout ───────────────────────────────────────────────────────────

/// Derived region geometry of an image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Layout {
    pub nr_blocks: u32,
    pub nr_inodes: u32,
    pub nr_istore_blocks: u32,
    pub nr_ifree_blocks: u32,
    pub nr_bfree_blocks: u32,
}

impl Layout {
    /// Compute the layout for a device of `nr_blocks` blocks holding
    /// `nr_inodes` inodes.
    pub fn for_geometry(nr_blocks: u32, nr_inodes: u32) -> Result<Self, ParseError> {
        if nr_inodes == 0 {
            return Err(ParseError::InvalidField {
                field: "nr_inodes",
                reason: "must be non-zero",
            });
        }

        let nr_istore_blocks = u64_to_u32(
            blocks_for_bytes(u64::from(nr_inodes) * INODE_SIZE as u64),
            "nr_istore_blocks",
        )?;
        let nr_ifree_blocks = u64_to_u32(blocks_for_bits(u64::from(nr_inodes)), "nr_ifree_blocks")?;
        let nr_bfree_blocks = u64_to_u32(blocks_for_bits(u64::from(nr_blocks)), "nr_bfree_blocks")?;

        let layout = Self {
            nr_blocks,
            nr_inodes,
            nr_istore_blocks,
            nr_ifree_blocks,
            nr_bfree_blocks,
        };
        if u64::from(layout.data_start().0) > u64::from(nr_blocks) {
            return Err(ParseError::InvalidField {
                field: "nr_blocks",
                reason: "too small for metadata regions",
            });
        }
        Ok(layout)
    }

    /// First block of the inode store.
    #[must_use]
    pub fn istore_start(&self) -> BlockNumber {
        BlockNumber(1)
    }

    /// First block of the inode free bitmap.
    #[must_use]
    pub fn ifree_start(&self) -> BlockNumber {
        BlockNumber(1 + self.nr_istore_blocks)
    }

    /// First block of the block free bitmap.
    #[must_use]
    pub fn bfree_start(&self) -> BlockNumber {
        BlockNumber(1 + self.nr_istore_blocks + self.nr_ifree_blocks)
    }

    /// First data block.
    #[must_use]
    pub fn data_start(&self) -> BlockNumber {
        BlockNumber(1 + self.nr_istore_blocks + self.nr_ifree_blocks + self.nr_bfree_blocks)
    }

    /// Number of data blocks.
    #[must_use]
    pub fn nr_data_blocks(&self) -> u32 {
        self.nr_blocks - self.data_start().0
    }

    /// Inode-store location of an inode record: (block, byte offset).
    pub fn inode_location(&self, ino: InodeNumber) -> Result<(BlockNumber, usize), ParseError> {
        if ino.0 >= self.nr_inodes {
            return Err(ParseError::InvalidField {
                field: "inode_number",
                reason: "out of range",
            });
        }
        let block = self.istore_start().0 + ino.0 / INODES_PER_BLOCK;
        let offset = (ino.0 % INODES_PER_BLOCK) as usize * INODE_SIZE;
        Ok((BlockNumber(block), offset))
    }
}

// ── Inode records ───────────────────────────────────────────────────────────

/// On-disk inode record (72 bytes, packed [`INODES_PER_BLOCK`] per block).
///
/// `ei_block == 0` means the file has no extent index yet; block 0 is the
/// superblock, so 0 can never be a valid index block.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiskInode {
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub size: u32,
    pub ctime: u32,
    pub atime: u32,
    pub mtime: u32,
    pub nr_blocks: u32,
    pub nlink: u32,
    pub ei_block: u32,
    pub inline: [u8; INLINE_DATA_LEN],
}

impl DiskInode {
    /// A zeroed (free) inode record.
    #[must_use]
    pub fn zeroed() -> Self {
        Self {
            mode: 0,
            uid: 0,
            gid: 0,
            size: 0,
            ctime: 0,
            atime: 0,
            mtime: 0,
            nr_blocks: 0,
            nlink: 0,
            ei_block: 0,
            inline: [0; INLINE_DATA_LEN],
        }
    }

    /// Parse one record at `offset` within an inode-store block.
    pub fn parse_at(block: &[u8], offset: usize) -> Result<Self, ParseError> {
        Ok(Self {
            mode: read_le_u32(block, offset)?,
            uid: read_le_u32(block, offset + 4)?,
            gid: read_le_u32(block, offset + 8)?,
            size: read_le_u32(block, offset + 12)?,
            ctime: read_le_u32(block, offset + 16)?,
            atime: read_le_u32(block, offset + 20)?,
            mtime: read_le_u32(block, offset + 24)?,
            nr_blocks: read_le_u32(block, offset + 28)?,
            nlink: read_le_u32(block, offset + 32)?,
            ei_block: read_le_u32(block, offset + 36)?,
            inline: read_fixed::<INLINE_DATA_LEN>(block, offset + 40)?,
        })
    }

    /// Serialize one record at `offset` within an inode-store block.
    pub fn write_at(&self, block: &mut [u8], offset: usize) -> Result<(), ParseError> {
        let end = offset.checked_add(INODE_SIZE).ok_or(ParseError::InvalidField {
            field: "offset",
            reason: "overflow",
        })?;
        if end > block.len() {
            return Err(ParseError::InsufficientData {
                needed: INODE_SIZE,
                offset,
                actual: block.len().saturating_sub(offset),
            });
        }
        write_le_u32(block, offset, self.mode)?;
        write_le_u32(block, offset + 4, self.uid)?;
        write_le_u32(block, offset + 8, self.gid)?;
        write_le_u32(block, offset + 12, self.size)?;
        write_le_u32(block, offset + 16, self.ctime)?;
        write_le_u32(block, offset + 20, self.atime)?;
        write_le_u32(block, offset + 24, self.mtime)?;
        write_le_u32(block, offset + 28, self.nr_blocks)?;
        write_le_u32(block, offset + 32, self.nlink)?;
        write_le_u32(block, offset + 36, self.ei_block)?;
        block[offset + 40..end].copy_from_slice(&self.inline);
        Ok(())
    }
}

// ── Extent index ────────────────────────────────────────────────────────────

/// One extent: a contiguous run of physical blocks backing a contiguous run
/// of logical blocks.
///
/// `nr_files` is directory-only metadata (live entries in the directory
/// blocks this extent addresses); it stays 0 for regular file extents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Extent {
    pub logical_start: LogicalBlock,
    pub len: u32,
    pub phys_start: BlockNumber,
    pub nr_files: u32,
}

impl Extent {
    /// One past the last logical block covered by this extent.
    #[must_use]
    pub fn logical_end(&self) -> u32 {
        self.logical_start.0 + self.len
    }

    /// Whether this extent covers the given logical block.
    #[must_use]
    pub fn covers(&self, logical: LogicalBlock) -> bool {
        self.logical_start.0 <= logical.0 && logical.0 < self.logical_end()
    }

    /// Physical block backing `logical`, which must be covered.
    #[must_use]
    pub fn resolve(&self, logical: LogicalBlock) -> BlockNumber {
        BlockNumber(self.phys_start.0 + (logical.0 - self.logical_start.0))
    }

    fn parse_at(block: &[u8], offset: usize) -> Result<Self, ParseError> {
        Ok(Self {
            logical_start: LogicalBlock(read_le_u32(block, offset)?),
            len: read_le_u32(block, offset + 4)?,
            phys_start: BlockNumber(read_le_u32(block, offset + 8)?),
            nr_files: read_le_u32(block, offset + 12)?,
        })
    }

    fn write_at(&self, block: &mut [u8], offset: usize) -> Result<(), ParseError> {
        write_le_u32(block, offset, self.logical_start.0)?;
        write_le_u32(block, offset + 4, self.len)?;
        write_le_u32(block, offset + 8, self.phys_start.0)?;
        write_le_u32(block, offset + 12, self.nr_files)?;
        Ok(())
    }
}

/// In-memory mirror of an extent index block.
///
/// Invariant: extents are sorted by strictly increasing `logical_start` with
/// no overlap, every `len` is in `1..=MAX_BLOCKS_PER_EXTENT`, and there are
/// at most [`MAX_EXTENTS`] of them. `nr_files` is the directory-wide live
/// entry count (0 for regular files).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtentIndex {
    pub nr_files: u32,
    pub extents: Vec<Extent>,
}

impl ExtentIndex {
    /// An index with no extents.
    #[must_use]
    pub fn empty() -> Self {
        Self {
            nr_files: 0,
            extents: Vec::new(),
        }
    }

    /// Parse an extent index from a block-sized buffer, validating the
    /// sorted/non-overlapping invariant.
    pub fn parse_block(block: &[u8]) -> Result<Self, ParseError> {
        let nr_files = read_le_u32(block, 0)?;
        let nr_extents = read_le_u32(block, 4)? as usize;
        if nr_extents > MAX_EXTENTS {
            return Err(ParseError::InvalidField {
                field: "nr_extents",
                reason: "exceeds extent index capacity",
            });
        }

        let mut extents = Vec::with_capacity(nr_extents);
        let mut prev_end = 0_u32;
        for i in 0..nr_extents {
            let extent = Extent::parse_at(block, EXTENT_INDEX_HEADER + i * EXTENT_SLOT_SIZE)?;
            if extent.len == 0 || extent.len > MAX_BLOCKS_PER_EXTENT {
                return Err(ParseError::InvalidField {
                    field: "extent_len",
                    reason: "outside 1..=MAX_BLOCKS_PER_EXTENT",
                });
            }
            if extent.phys_start.0 == 0 {
                return Err(ParseError::InvalidField {
                    field: "extent_phys_start",
                    reason: "extent cannot start at block 0",
                });
            }
            if i > 0 && extent.logical_start.0 < prev_end {
                return Err(ParseError::InvalidField {
                    field: "extent_logical_start",
                    reason: "extents out of order or overlapping",
                });
            }
            let max_logical = (MAX_EXTENTS as u32) * MAX_BLOCKS_PER_EXTENT;
            let Some(end) = extent.logical_start.0.checked_add(extent.len) else {
                return Err(ParseError::InvalidField {
                    field: "extent_logical_start",
                    reason: "logical range overflows u32",
                });
            };
            if end > max_logical {
                return Err(ParseError::InvalidField {
                    field: "extent_logical_start",
                    reason: "logical range exceeds maximum file size",
                });
            }
            prev_end = end;
            extents.push(extent);
        }

        Ok(Self { nr_files, extents })
    }

    /// Serialize into a zero-padded block-sized buffer.
    pub fn write_block(&self, block: &mut [u8]) -> Result<(), ParseError> {
        if self.extents.len() > MAX_EXTENTS {
            return Err(ParseError::InvalidField {
                field: "nr_extents",
                reason: "exceeds extent index capacity",
            });
        }
        if block.len() < BLOCK_SIZE as usize {
            return Err(ParseError::InsufficientData {
                needed: BLOCK_SIZE as usize,
                offset: 0,
                actual: block.len(),
            });
        }
        block[..BLOCK_SIZE as usize].fill(0);
        write_le_u32(block, 0, self.nr_files)?;
        write_le_u32(block, 4, u64_to_u32(self.extents.len() as u64, "nr_extents")?)?;
        for (i, extent) in self.extents.iter().enumerate() {
            extent.write_at(block, EXTENT_INDEX_HEADER + i * EXTENT_SLOT_SIZE)?;
        }
        Ok(())
    }
}

// ── Directory blocks ────────────────────────────────────────────────────────

/// One directory entry: a name bound to an inode number.
///
/// `block_count` is retained on disk but always written as 0 by the engine;
/// see DESIGN.md.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirEntry {
    pub inode: InodeNumber,
    pub block_count: u32,
    pub name: Vec<u8>,
}

impl DirEntry {
    #[must_use]
    pub fn new(inode: InodeNumber, name: Vec<u8>) -> Self {
        Self {
            inode,
            block_count: 0,
            name,
        }
    }

    fn parse_at(block: &[u8], offset: usize) -> Result<Self, ParseError> {
        let inode = InodeNumber(read_le_u32(block, offset)?);
        let block_count = read_le_u32(block, offset + 4)?;
        let raw = read_fixed::<FILENAME_LEN>(block, offset + 8)?;
        let name = raw[..nul_padded_len(&raw)].to_vec();
        if name.is_empty() {
            return Err(ParseError::InvalidField {
                field: "dir_entry_name",
                reason: "live entry has empty name",
            });
        }
        Ok(Self {
            inode,
            block_count,
            name,
        })
    }

    fn write_at(&self, block: &mut [u8], offset: usize) -> Result<(), ParseError> {
        if self.name.is_empty() || self.name.len() > FILENAME_LEN {
            return Err(ParseError::InvalidField {
                field: "dir_entry_name",
                reason: "length outside 1..=255",
            });
        }
        let end = offset
            .checked_add(DIR_ENTRY_SIZE)
            .ok_or(ParseError::InvalidField {
                field: "offset",
                reason: "overflow",
            })?;
        if end > block.len() {
            return Err(ParseError::InsufficientData {
                needed: DIR_ENTRY_SIZE,
                offset,
                actual: block.len().saturating_sub(offset),
            });
        }
        write_le_u32(block, offset, self.inode.0)?;
        write_le_u32(block, offset + 4, self.block_count)?;
        block[offset + 8..end].fill(0);
        block[offset + 8..offset + 8 + self.name.len()].copy_from_slice(&self.name);
        Ok(())
    }
}

/// In-memory mirror of one directory block.
///
/// Entries `0..nr_files` are live; slots past that are ignored on disk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirBlock {
    pub entries: Vec<DirEntry>,
}

impl DirBlock {
    /// A directory block with no entries.
    #[must_use]
    pub fn empty() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    /// Parse a directory block from a block-sized buffer.
    pub fn parse_block(block: &[u8]) -> Result<Self, ParseError> {
        let nr_files = read_le_u32(block, 0)? as usize;
        if nr_files > FILES_PER_BLOCK {
            return Err(ParseError::InvalidField {
                field: "nr_files",
                reason: "exceeds directory block capacity",
            });
        }
        let mut entries = Vec::with_capacity(nr_files);
        for i in 0..nr_files {
            entries.push(DirEntry::parse_at(
                block,
                DIR_BLOCK_HEADER + i * DIR_ENTRY_SIZE,
            )?);
        }
        Ok(Self { entries })
    }

    /// Serialize into a zero-padded block-sized buffer.
    pub fn write_block(&self, block: &mut [u8]) -> Result<(), ParseError> {
        if self.entries.len() > FILES_PER_BLOCK {
            return Err(ParseError::InvalidField {
                field: "nr_files",
                reason: "exceeds directory block capacity",
            });
        }
        if block.len() < BLOCK_SIZE as usize {
            return Err(ParseError::InsufficientData {
                needed: BLOCK_SIZE as usize,
                offset: 0,
                actual: block.len(),
            });
        }
        block[..BLOCK_SIZE as usize].fill(0);
        write_le_u32(block, 0, u64_to_u32(self.entries.len() as u64, "nr_files")?)?;
        for (i, entry) in self.entries.iter().enumerate() {
            entry.write_at(block, DIR_BLOCK_HEADER + i * DIR_ENTRY_SIZE)?;
        }
        Ok(())
    }
}
