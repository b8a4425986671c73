#![forbid(unsafe_code)]
//! Block I/O layer.
//!
//! Provides the [`BlockDevice`] trait the rest of the engine is written
//! against, plus two implementations: [`FileBlockDevice`] for image files
//! (pread/pwrite, no shared seek position) and [`MemBlockDevice`], a sparse
//! in-memory device used by tests and by image-building tools.
//!
//! All I/O is whole-block: `read_block` returns exactly one block,
//! `write_block` requires exactly one block. Partial transfers, out-of-range
//! block numbers, and size mismatches are errors.

use cellfs_error::{CellError, Result};
use cellfs_types::{BLOCK_SIZE, BlockNumber};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::Path;
use std::sync::Arc;

/// Owned block buffer.
///
/// Invariant: length == [`BLOCK_SIZE`] for buffers produced by a device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockBuf {
    bytes: Vec<u8>,
}

impl BlockBuf {
    #[must_use]
    pub fn new(bytes: Vec<u8>) -> Self {
        Self { bytes }
    }

    /// A zero-filled block.
    #[must_use]
    pub fn zeroed() -> Self {
        Self {
            bytes: vec![0_u8; BLOCK_SIZE as usize],
        }
    }

    #[must_use]
    pub fn as_slice(&self) -> &[u8] {
        &self.bytes
    }

    #[must_use]
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.bytes
    }

    #[must_use]
    pub fn into_inner(self) -> Vec<u8> {
        self.bytes
    }
}

/// Block-addressed I/O interface.
///
/// The engine treats reads and writes as synchronous scoped operations; a
/// whole-block write is the publication point readers may observe.
pub trait BlockDevice: Send + Sync {
    /// Read a block by number.
    fn read_block(&self, block: BlockNumber) -> Result<BlockBuf>;

    /// Write a block by number. `data.len()` MUST equal `block_size()`.
    fn write_block(&self, block: BlockNumber, data: &[u8]) -> Result<()>;

    /// Device block size in bytes.
    fn block_size(&self) -> u32;

    /// Total number of blocks.
    fn block_count(&self) -> u32;

    /// Flush pending writes to stable storage.
    fn sync(&self) -> Result<()>;
}

fn check_range(block: BlockNumber, block_count: u32) -> Result<u64> {
    if block.0 >= block_count {
        return Err(CellError::Corrupt {
            block: block.0,
            detail: format!("block out of range (device has {block_count} blocks)"),
        });
    }
    block.to_byte_offset().ok_or(CellError::Corrupt {
        block: block.0,
        detail: "block byte offset overflows u64".to_owned(),
    })
}

fn check_write_len(block: BlockNumber, len: usize) -> Result<()> {
    if len != BLOCK_SIZE as usize {
        return Err(CellError::Corrupt {
            block: block.0,
            detail: format!("write_block size mismatch: got={len} expected={BLOCK_SIZE}"),
        });
    }
    Ok(())
}

/// File-backed block device using `pread`/`pwrite` style I/O.
///
/// Uses `std::os::unix::fs::FileExt`, which is thread-safe and does not
/// require a shared seek position. Falls back to read-only when the image
/// cannot be opened for writing.
#[derive(Debug, Clone)]
pub struct FileBlockDevice {
    file: Arc<File>,
    block_count: u32,
    writable: bool,
}

impl FileBlockDevice {
    /// Open an existing image file. Its length must be block-aligned.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let (file, writable) = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path.as_ref())
            .map(|file| (file, true))
            .or_else(|_| {
                OpenOptions::new()
                    .read(true)
                    .open(path.as_ref())
                    .map(|file| (file, false))
            })?;
        let len = file.metadata()?.len();
        let block_count = Self::block_count_for_len(len)?;
        Ok(Self {
            file: Arc::new(file),
            block_count,
            writable,
        })
    }

    /// Create (or truncate) an image file sized to `block_count` blocks.
    pub fn create(path: impl AsRef<Path>, block_count: u32) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path.as_ref())?;
        file.set_len(u64::from(block_count) * u64::from(BLOCK_SIZE))?;
        Ok(Self {
            file: Arc::new(file),
            block_count,
            writable: true,
        })
    }

    fn block_count_for_len(len: u64) -> Result<u32> {
        let block_size = u64::from(BLOCK_SIZE);
        if len % block_size != 0 {
            return Err(CellError::Corrupt {
                block: 0,
                detail: format!("image length {len} is not a multiple of {BLOCK_SIZE}"),
            });
        }
        u32::try_from(len / block_size).map_err(|_| CellError::Corrupt {
            block: 0,
            detail: "image block count exceeds u32".to_owned(),
        })
    }

    #[must_use]
    pub fn writable(&self) -> bool {
        self.writable
    }
}

impl BlockDevice for FileBlockDevice {
    fn read_block(&self, block: BlockNumber) -> Result<BlockBuf> {
        let offset = check_range(block, self.block_count)?;
        let mut buf = vec![0_u8; BLOCK_SIZE as usize];
        self.file.read_exact_at(&mut buf, offset)?;
        Ok(BlockBuf::new(buf))
    }

    fn write_block(&self, block: BlockNumber, data: &[u8]) -> Result<()> {
        check_write_len(block, data.len())?;
        let offset = check_range(block, self.block_count)?;
        if !self.writable {
            return Err(CellError::ReadOnly);
        }
        self.file.write_all_at(data, offset)?;
        Ok(())
    }

    fn block_size(&self) -> u32 {
        BLOCK_SIZE
    }

    fn block_count(&self) -> u32 {
        self.block_count
    }

    fn sync(&self) -> Result<()> {
        self.file.sync_all()?;
        Ok(())
    }
}

/// Sparse in-memory block device.
///
/// Unwritten blocks read as zeros. Used by tests throughout the workspace
/// and by the CLI when assembling an image before writing it out.
#[derive(Debug)]
pub struct MemBlockDevice {
    blocks: Mutex<HashMap<u32, Vec<u8>>>,
    block_count: u32,
}

impl MemBlockDevice {
    #[must_use]
    pub fn new(block_count: u32) -> Self {
        Self {
            blocks: Mutex::new(HashMap::new()),
            block_count,
        }
    }
}

impl BlockDevice for MemBlockDevice {
    fn read_block(&self, block: BlockNumber) -> Result<BlockBuf> {
        check_range(block, self.block_count)?;
        let blocks = self.blocks.lock();
        Ok(blocks
            .get(&block.0)
            .map_or_else(BlockBuf::zeroed, |data| BlockBuf::new(data.clone())))
    }

    fn write_block(&self, block: BlockNumber, data: &[u8]) -> Result<()> {
        check_write_len(block, data.len())?;
        check_range(block, self.block_count)?;
        self.blocks.lock().insert(block.0, data.to_vec());
        Ok(())
    }

    fn block_size(&self) -> u32 {
        BLOCK_SIZE
    }

    fn block_count(&self) -> u32 {
        self.block_count
    }

    fn sync(&self) -> Result<()> {
        Ok(())
    }
}
