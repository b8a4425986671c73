#![forbid(unsafe_code)]
//! Extent mapping: logical block to physical block resolution.
//!
//! Resolves file logical offsets to physical block addresses over an
//! [`ExtentIndex`], grows the mapping on writes (coalescing sequential
//! growth into existing extents where physically possible), and shrinks it
//! on truncation. A logical block with no backing extent is a *hole*; holes
//! are not errors at this level. The read path zero-fills them and the
//! write path grows over them.
//!
//! The index invariant maintained by every operation here: extents sorted by
//! strictly increasing `logical_start`, pairwise non-overlapping, each
//! covering `1..=MAX_BLOCKS_PER_EXTENT` blocks.

use cellfs_alloc::BitmapAllocator;
use cellfs_error::{CellError, Result};
use cellfs_ondisk::{Extent, ExtentIndex};
use cellfs_types::{BlockNumber, LogicalBlock, MAX_BLOCKS_PER_EXTENT, MAX_EXTENTS};
use tracing::debug;

/// Highest addressable logical block + 1 (`MAX_FILESIZE / BLOCK_SIZE`).
const MAX_LOGICAL: u32 = MAX_EXTENTS as u32 * MAX_BLOCKS_PER_EXTENT;

/// Result of [`map_or_grow`]: the backing physical block, and whether the
/// index was mutated to produce it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Mapping {
    pub block: BlockNumber,
    pub grew: bool,
}

/// Resolve `logical` to its physical block, or `None` for a hole.
///
/// Binary search over the sorted extent array: callers on the read path
/// treat `None` as sparse-zero or end-of-data; the write path grows.
#[must_use]
pub fn search(index: &ExtentIndex, logical: LogicalBlock) -> Option<BlockNumber> {
    let slot = index
        .extents
        .partition_point(|e| e.logical_end() <= logical.0);
    let extent = index.extents.get(slot)?;
    extent.covers(logical).then(|| extent.resolve(logical))
}

/// Total number of logical blocks backed by extents (holes excluded).
#[must_use]
pub fn covered_blocks(index: &ExtentIndex) -> u32 {
    index.extents.iter().map(|e| e.len).sum()
}

/// One past the highest logical block covered by any extent (0 when empty).
#[must_use]
pub fn logical_end(index: &ExtentIndex) -> u32 {
    index.extents.last().map_or(0, Extent::logical_end)
}

/// Resolve `logical`, growing the index over a hole.
///
/// Growth order:
/// 1. Coalesce: if the last extent ends exactly at `logical`, has room, and
///    the physical block right after its run is free, claim that block and
///    extend the extent by one.
/// 2. Otherwise allocate one block first-fit and insert a new single-block
///    extent at the sorted position.
/// 3. A full index fails with `FileTooLarge` before anything is allocated,
///    leaving the index unchanged.
pub fn map_or_grow(
    index: &mut ExtentIndex,
    logical: LogicalBlock,
    blocks: &mut BitmapAllocator,
) -> Result<Mapping> {
    if let Some(block) = search(index, logical) {
        return Ok(Mapping { block, grew: false });
    }

    if logical.0 >= MAX_LOGICAL {
        return Err(CellError::FileTooLarge);
    }

    // Coalesce with the tail extent when growth is both logically and
    // physically contiguous.
    if let Some(last) = index.extents.last_mut() {
        if last.logical_end() == logical.0 && last.len < MAX_BLOCKS_PER_EXTENT {
            let candidate = last.phys_start.0 + last.len;
            if blocks.try_allocate_at(candidate) {
                last.len += 1;
                debug!(logical = logical.0, block = candidate, "extent coalesced");
                return Ok(Mapping {
                    block: BlockNumber(candidate),
                    grew: true,
                });
            }
        }
    }

    if index.extents.len() >= MAX_EXTENTS {
        return Err(CellError::FileTooLarge);
    }

    let phys = BlockNumber(blocks.allocate()?);
    let slot = index
        .extents
        .partition_point(|e| e.logical_end() <= logical.0);
    index.extents.insert(
        slot,
        Extent {
            logical_start: logical,
            len: 1,
            phys_start: phys,
            nr_files: 0,
        },
    );
    debug!(logical = logical.0, block = phys.0, "extent appended");
    Ok(Mapping {
        block: phys,
        grew: true,
    })
}

/// Shrink the index so it covers no logical block at or past `keep_blocks`,
/// returning freed physical blocks to the allocator.
///
/// Removing the last block of an extent removes the extent entry itself,
/// keeping the array dense and sorted. Returns the number of blocks freed.
pub fn truncate(
    index: &mut ExtentIndex,
    keep_blocks: u32,
    blocks: &mut BitmapAllocator,
) -> Result<u32> {
    let mut freed = 0_u32;

    while let Some(last) = index.extents.last_mut() {
        if last.logical_end() <= keep_blocks {
            break;
        }

        if last.logical_start.0 >= keep_blocks {
            // Entire extent is past the cut point.
            let extent = *last;
            for offset in 0..extent.len {
                blocks.free(extent.phys_start.0 + offset)?;
            }
            freed += extent.len;
            index.extents.pop();
        } else {
            // Trailing part of a straddling extent.
            let excess = last.logical_end() - keep_blocks;
            let keep_len = last.len - excess;
            for offset in keep_len..last.len {
                blocks.free(last.phys_start.0 + offset)?;
            }
            last.len = keep_len;
            freed += excess;
        }
    }

    if freed > 0 {
        debug!(keep_blocks, freed, "extent index truncated");
    }
    Ok(freed)
}
