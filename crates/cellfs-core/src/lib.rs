#![forbid(unsafe_code)]
//! The cellfs storage engine.
//!
//! [`CellFs`] composes the component crates into the interface a host
//! filesystem layer drives: format/mount/sync lifecycle on the superblock,
//! per-inode CRUD (create, read-at-offset, write-at-offset, truncate,
//! remove) backed by extent search and growth, and directory
//! lookup/add/remove/list backed by the directory codec.
//!
//! ## Locking
//!
//! Two levels, always acquired in this order:
//!
//! 1. the per-inode `RwLock` (write for mutations, read for reads), so a
//!    file's extent/data mutations are serialized and readers never observe
//!    a torn update; whole-block device writes are the publication points;
//! 2. the superblock `Mutex`, guarding both bitmap allocators and the
//!    cached free counters.
//!
//! No operation holds two inode locks, and the superblock lock is only ever
//! taken inside an inode lock, so lock ordering is acyclic.

use cellfs_alloc::BitmapAllocator;
use cellfs_block::{BlockBuf, BlockDevice};
use cellfs_error::{CellError, Result};
use cellfs_inode::{FileKind, InodePayload, new_inode, payload_of, read_inode, unix_now,
    write_inode};
use cellfs_ondisk::{DirBlock, DirEntry, DiskInode, Extent, ExtentIndex, Layout, Superblock};
use cellfs_types::{
    BLOCK_SIZE, BlockNumber, CELLFS_MAGIC, InodeNumber, LogicalBlock, MAX_FILESIZE, ParseError,
    SUPERBLOCK_BLOCK,
};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// The root directory inode.
pub const ROOT_INO: InodeNumber = InodeNumber::ROOT;

const ROOT_PERM: u32 = 0o755;
const SYMLINK_PERM: u32 = 0o777;

fn corrupt(block: u32, err: &ParseError) -> CellError {
    CellError::Corrupt {
        block,
        detail: err.to_string(),
    }
}

// ── Superblock state ────────────────────────────────────────────────────────

/// In-memory mirror of the superblock plus the two allocators it owns.
struct SbState {
    sb: Superblock,
    layout: Layout,
    ifree: BitmapAllocator,
    bfree: BitmapAllocator,
}

impl SbState {
    /// Re-derive the cached free counters from the allocators so they always
    /// equal the bitmap popcounts.
    fn refresh_counters(&mut self) {
        self.sb.nr_free_inodes = self.ifree.count_free();
        self.sb.nr_free_blocks = self.bfree.count_free();
    }
}

/// Filesystem-wide geometry and free-space summary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FsInfo {
    pub nr_blocks: u32,
    pub nr_inodes: u32,
    pub nr_istore_blocks: u32,
    pub nr_ifree_blocks: u32,
    pub nr_bfree_blocks: u32,
    pub nr_free_inodes: u32,
    pub nr_free_blocks: u32,
}

/// Metadata view of one inode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct InodeAttr {
    pub ino: InodeNumber,
    pub kind: FileKind,
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub size: u64,
    pub nr_blocks: u32,
    pub nlink: u32,
    pub ctime: u32,
    pub atime: u32,
    pub mtime: u32,
}

/// One entry yielded by [`CellFs::dir_list`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirEntryInfo {
    pub inode: InodeNumber,
    pub block_count: u32,
    pub name: Vec<u8>,
}

impl DirEntryInfo {
    /// Lossy UTF-8 view of the name for display purposes.
    #[must_use]
    pub fn name_str(&self) -> String {
        String::from_utf8_lossy(&self.name).into_owned()
    }
}

// ── Engine ──────────────────────────────────────────────────────────────────

/// The storage engine over one block device.
pub struct CellFs {
    dev: Arc<dyn BlockDevice>,
    state: Mutex<SbState>,
    inode_locks: Mutex<HashMap<u32, Arc<RwLock<()>>>>,
}

impl std::fmt::Debug for CellFs {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CellFs")
            .field("block_count", &self.dev.block_count())
            .finish_non_exhaustive()
    }
}

impl CellFs {
    // ── Lifecycle ───────────────────────────────────────────────────────

    /// Write a fresh filesystem onto the device: superblock, zeroed inode
    /// store, all-free bitmaps (metadata blocks claimed), and an empty root
    /// directory inode.
    pub fn format(dev: &dyn BlockDevice, nr_inodes: u32) -> Result<()> {
        if dev.block_size() != BLOCK_SIZE {
            return Err(CellError::Corrupt {
                block: 0,
                detail: format!("device block size {} != {BLOCK_SIZE}", dev.block_size()),
            });
        }
        let nr_blocks = dev.block_count();
        let layout =
            Layout::for_geometry(nr_blocks, nr_inodes).map_err(|err| corrupt(0, &err))?;
        if layout.nr_data_blocks() == 0 {
            return Err(CellError::Corrupt {
                block: 0,
                detail: "device has no room for data blocks".to_owned(),
            });
        }

        // Inode 0 is the root directory; every metadata block is in use.
        let mut ifree = BitmapAllocator::new_all_free(nr_inodes, "inode");
        let root = ifree.allocate()?;
        debug_assert_eq!(root, ROOT_INO.0);
        let mut bfree = BitmapAllocator::new_all_free(nr_blocks, "block");
        for block in 0..layout.data_start().0 {
            if !bfree.try_allocate_at(block) {
                return Err(CellError::Corrupt {
                    block,
                    detail: "metadata block claimed twice during format".to_owned(),
                });
            }
        }

        // Zero the inode store, then drop in the root record.
        let zero = BlockBuf::zeroed();
        for i in 0..layout.nr_istore_blocks {
            dev.write_block(BlockNumber(layout.istore_start().0 + i), zero.as_slice())?;
        }
        let root_inode = new_inode(FileKind::Directory, ROOT_PERM, 0, 0);
        write_inode(dev, &layout, ROOT_INO, &root_inode)?;

        write_bitmap_region(dev, layout.ifree_start(), layout.nr_ifree_blocks, &ifree)?;
        write_bitmap_region(dev, layout.bfree_start(), layout.nr_bfree_blocks, &bfree)?;

        let sb = Superblock {
            magic: CELLFS_MAGIC,
            nr_blocks,
            nr_inodes,
            nr_istore_blocks: layout.nr_istore_blocks,
            nr_ifree_blocks: layout.nr_ifree_blocks,
            nr_bfree_blocks: layout.nr_bfree_blocks,
            nr_free_inodes: ifree.count_free(),
            nr_free_blocks: bfree.count_free(),
        };
        let mut block = BlockBuf::zeroed();
        sb.write_block(block.as_mut_slice())
            .map_err(|err| corrupt(0, &err))?;
        dev.write_block(SUPERBLOCK_BLOCK, block.as_slice())?;
        dev.sync()?;

        info!(
            nr_blocks,
            nr_inodes,
            nr_free_blocks = sb.nr_free_blocks,
            "formatted cellfs image"
        );
        Ok(())
    }

    /// Mount the device: validate the superblock, load both bitmaps, and
    /// derive the free counters by popcount (the regions are the source of
    /// truth; stored counters that disagree are logged and overridden).
    pub fn mount(dev: Arc<dyn BlockDevice>) -> Result<Self> {
        if dev.block_size() != BLOCK_SIZE {
            return Err(CellError::Corrupt {
                block: 0,
                detail: format!("device block size {} != {BLOCK_SIZE}", dev.block_size()),
            });
        }

        let raw = dev.read_block(SUPERBLOCK_BLOCK)?;
        let mut sb = Superblock::parse_block(raw.as_slice()).map_err(|err| corrupt(0, &err))?;
        if sb.nr_blocks > dev.block_count() {
            return Err(CellError::Corrupt {
                block: 0,
                detail: format!(
                    "superblock claims {} blocks but device has {}",
                    sb.nr_blocks,
                    dev.block_count()
                ),
            });
        }
        let layout = sb.layout().map_err(|err| corrupt(0, &err))?;

        let ifree_bytes =
            read_bitmap_region(dev.as_ref(), layout.ifree_start(), layout.nr_ifree_blocks)?;
        let ifree = BitmapAllocator::from_bytes(&ifree_bytes, sb.nr_inodes, "inode")
            .map_err(|err| corrupt(layout.ifree_start().0, &err))?;
        let bfree_bytes =
            read_bitmap_region(dev.as_ref(), layout.bfree_start(), layout.nr_bfree_blocks)?;
        let bfree = BitmapAllocator::from_bytes(&bfree_bytes, sb.nr_blocks, "block")
            .map_err(|err| corrupt(layout.bfree_start().0, &err))?;

        if sb.nr_free_inodes != ifree.count_free() || sb.nr_free_blocks != bfree.count_free() {
            warn!(
                stored_free_inodes = sb.nr_free_inodes,
                derived_free_inodes = ifree.count_free(),
                stored_free_blocks = sb.nr_free_blocks,
                derived_free_blocks = bfree.count_free(),
                "superblock free counters disagree with bitmaps; using bitmap popcounts"
            );
        }
        sb.nr_free_inodes = ifree.count_free();
        sb.nr_free_blocks = bfree.count_free();

        info!(
            nr_blocks = sb.nr_blocks,
            nr_inodes = sb.nr_inodes,
            nr_free_blocks = sb.nr_free_blocks,
            nr_free_inodes = sb.nr_free_inodes,
            "mounted cellfs image"
        );
        Ok(Self {
            dev,
            state: Mutex::new(SbState {
                sb,
                layout,
                ifree,
                bfree,
            }),
            inode_locks: Mutex::new(HashMap::new()),
        })
    }

    /// Write the superblock and both bitmap regions back to the device.
    pub fn sync(&self) -> Result<()> {
        let mut state = self.state.lock();
        state.refresh_counters();

        write_bitmap_region(
            self.dev.as_ref(),
            state.layout.ifree_start(),
            state.layout.nr_ifree_blocks,
            &state.ifree,
        )?;
        write_bitmap_region(
            self.dev.as_ref(),
            state.layout.bfree_start(),
            state.layout.nr_bfree_blocks,
            &state.bfree,
        )?;

        let mut block = BlockBuf::zeroed();
        state
            .sb
            .write_block(block.as_mut_slice())
            .map_err(|err| corrupt(0, &err))?;
        self.dev.write_block(SUPERBLOCK_BLOCK, block.as_slice())?;
        drop(state);
        self.dev.sync()?;
        debug!("superblock and bitmaps synced");
        Ok(())
    }

    /// Unmount is sync: the engine keeps no other volatile state.
    pub fn unmount(&self) -> Result<()> {
        self.sync()
    }

    /// Current geometry and free-space counters.
    pub fn info(&self) -> FsInfo {
        let mut state = self.state.lock();
        state.refresh_counters();
        FsInfo {
            nr_blocks: state.sb.nr_blocks,
            nr_inodes: state.sb.nr_inodes,
            nr_istore_blocks: state.sb.nr_istore_blocks,
            nr_ifree_blocks: state.sb.nr_ifree_blocks,
            nr_bfree_blocks: state.sb.nr_bfree_blocks,
            nr_free_inodes: state.sb.nr_free_inodes,
            nr_free_blocks: state.sb.nr_free_blocks,
        }
    }

    // ── Allocation ──────────────────────────────────────────────────────

    /// Allocate the lowest free inode number.
    pub fn allocate_inode(&self) -> Result<InodeNumber> {
        let mut state = self.state.lock();
        let ino = state.ifree.allocate().map(InodeNumber)?;
        state.refresh_counters();
        Ok(ino)
    }

    /// Release an inode number. Double frees are reported.
    pub fn free_inode(&self, ino: InodeNumber) -> Result<()> {
        let mut state = self.state.lock();
        state.ifree.free(ino.0)?;
        state.refresh_counters();
        Ok(())
    }

    /// Allocate the lowest free block.
    pub fn allocate_block(&self) -> Result<BlockNumber> {
        let mut state = self.state.lock();
        let block = state.bfree.allocate().map(BlockNumber)?;
        state.refresh_counters();
        Ok(block)
    }

    /// Release a block. Double frees are reported.
    pub fn free_block(&self, block: BlockNumber) -> Result<()> {
        let mut state = self.state.lock();
        state.bfree.free(block.0)?;
        state.refresh_counters();
        Ok(())
    }

    // ── Inode CRUD ──────────────────────────────────────────────────────

    /// Create a fresh inode of the given kind and return its number.
    pub fn create(&self, kind: FileKind, perm: u32, uid: u32, gid: u32) -> Result<InodeNumber> {
        let ino = self.allocate_inode()?;
        let layout = self.layout();
        let inode = new_inode(kind, perm, uid, gid);
        if let Err(err) = write_inode(self.dev.as_ref(), &layout, ino, &inode) {
            // Roll the allocation back so a failed create leaves no trace.
            let _ = self.free_inode(ino);
            return Err(err);
        }
        debug!(ino = ino.0, ?kind, "inode created");
        Ok(ino)
    }

    /// Metadata of a live inode.
    pub fn stat(&self, ino: InodeNumber) -> Result<InodeAttr> {
        let lock = self.lock_for(ino);
        let _guard = lock.read();
        let inode = self.load_live(ino)?;
        let kind = self.kind_of(ino, &inode)?;
        Ok(InodeAttr {
            ino,
            kind,
            mode: inode.mode,
            uid: inode.uid,
            gid: inode.gid,
            size: u64::from(inode.size),
            nr_blocks: inode.nr_blocks,
            nlink: inode.nlink,
            ctime: inode.ctime,
            atime: inode.atime,
            mtime: inode.mtime,
        })
    }

    /// Read up to `buf.len()` bytes at `offset`. Holes and unwritten tails
    /// read as zeros up to the file size; reads at or past EOF return 0.
    pub fn read_at(&self, ino: InodeNumber, offset: u64, buf: &mut [u8]) -> Result<usize> {
        let lock = self.lock_for(ino);
        let _guard = lock.read();
        let inode = self.load_live(ino)?;
        if self.kind_of(ino, &inode)? == FileKind::Directory {
            return Err(CellError::IsDirectory);
        }
        self.read_payload(&inode, offset, buf)
    }

    /// Write `data` at `offset`, growing the extent mapping as needed.
    ///
    /// Returns the number of bytes written. A write that cannot make any
    /// progress fails; one that runs out of space or extent slots midway
    /// returns the short count with the already-written prefix durable.
    pub fn write_at(&self, ino: InodeNumber, offset: u64, data: &[u8]) -> Result<usize> {
        let lock = self.lock_for(ino);
        let _guard = lock.write();
        let mut inode = self.load_live(ino)?;
        match self.kind_of(ino, &inode)? {
            FileKind::Regular => {}
            FileKind::Directory => return Err(CellError::IsDirectory),
            FileKind::Symlink => {
                return Err(CellError::Invalid("not a regular file".to_owned()));
            }
        }
        self.write_payload(ino, &mut inode, offset, data)
    }

    /// Collect an inode's extents in logical order (empty for inline or
    /// dataless files). Diagnostic surface for tools and tests.
    pub fn extents_of(&self, ino: InodeNumber) -> Result<Vec<Extent>> {
        let lock = self.lock_for(ino);
        let _guard = lock.read();
        let inode = self.load_live(ino)?;
        match payload_of(&inode) {
            InodePayload::Extents(at) => Ok(self.load_index(at)?.extents),
            InodePayload::Empty | InodePayload::Inline(_) => Ok(Vec::new()),
        }
    }

    /// Set the file size, shrinking or sparsely extending the mapping.
    pub fn truncate(&self, ino: InodeNumber, new_size: u64) -> Result<()> {
        let lock = self.lock_for(ino);
        let _guard = lock.write();
        let mut inode = self.load_live(ino)?;
        match self.kind_of(ino, &inode)? {
            FileKind::Regular => {}
            FileKind::Directory => return Err(CellError::IsDirectory),
            FileKind::Symlink => {
                return Err(CellError::Invalid("not a regular file".to_owned()));
            }
        }
        if new_size > MAX_FILESIZE {
            return Err(CellError::FileTooLarge);
        }

        let keep_blocks = u32::try_from(new_size.div_ceil(u64::from(BLOCK_SIZE)))
            .map_err(|_| CellError::FileTooLarge)?;
        if let InodePayload::Extents(at) = payload_of(&inode) {
            let mut index = self.load_index(at)?;
            {
                let mut state = self.state.lock();
                cellfs_extent::truncate(&mut index, keep_blocks, &mut state.bfree)?;
                state.refresh_counters();
            }
            if new_size == 0 {
                debug_assert!(index.extents.is_empty());
                self.free_block(at)?;
                inode.ei_block = 0;
            } else {
                self.write_index(at, &index)?;
            }
            inode.nr_blocks = cellfs_extent::covered_blocks(&index);
        }

        inode.size = u32::try_from(new_size).map_err(|_| CellError::FileTooLarge)?;
        let now = unix_now();
        inode.mtime = now;
        inode.ctime = now;
        write_inode(self.dev.as_ref(), &self.layout(), ino, &inode)?;
        debug!(ino = ino.0, new_size, "inode truncated");
        Ok(())
    }

    /// Destroy an inode: free its data blocks and extent index, zero its
    /// record, and release its number. The host signals this when the link
    /// count reaches zero and no open references remain.
    pub fn remove(&self, ino: InodeNumber) -> Result<()> {
        let lock = self.lock_for(ino);
        let _guard = lock.write();
        let inode = self.load_live(ino)?;

        if let InodePayload::Extents(at) = payload_of(&inode) {
            let mut index = self.load_index(at)?;
            {
                let mut state = self.state.lock();
                cellfs_extent::truncate(&mut index, 0, &mut state.bfree)?;
                state.refresh_counters();
            }
            self.free_block(at)?;
        }

        write_inode(self.dev.as_ref(), &self.layout(), ino, &DiskInode::zeroed())?;
        self.free_inode(ino)?;
        debug!(ino = ino.0, "inode removed");
        Ok(())
    }

    // ── Symlinks ────────────────────────────────────────────────────────

    /// Create a symlink inode. Targets of at most 32 bytes are stored
    /// inline in the inode record; longer targets spill into extent-backed
    /// overflow blocks.
    pub fn symlink_create(&self, target: &[u8], uid: u32, gid: u32) -> Result<InodeNumber> {
        if target.is_empty() {
            return Err(CellError::Invalid("empty symlink target".to_owned()));
        }
        if target.len() as u64 > MAX_FILESIZE {
            return Err(CellError::FileTooLarge);
        }

        let ino = self.create(FileKind::Symlink, SYMLINK_PERM, uid, gid)?;
        let lock = self.lock_for(ino);
        let _guard = lock.write();
        let mut inode = self.load_live(ino)?;

        if target.len() <= inode.inline.len() {
            inode.inline[..target.len()].copy_from_slice(target);
            inode.size = u32::try_from(target.len()).map_err(|_| CellError::FileTooLarge)?;
            write_inode(self.dev.as_ref(), &self.layout(), ino, &inode)?;
            return Ok(ino);
        }

        match self.write_payload(ino, &mut inode, 0, target) {
            Ok(written) if written == target.len() => Ok(ino),
            Ok(_) => {
                drop(_guard);
                let _ = self.remove(ino);
                Err(CellError::NoSpace)
            }
            Err(err) => {
                drop(_guard);
                let _ = self.remove(ino);
                Err(err)
            }
        }
    }

    /// Read a symlink's target.
    pub fn symlink_target(&self, ino: InodeNumber) -> Result<Vec<u8>> {
        let lock = self.lock_for(ino);
        let _guard = lock.read();
        let inode = self.load_live(ino)?;
        if self.kind_of(ino, &inode)? != FileKind::Symlink {
            return Err(CellError::Invalid("not a symbolic link".to_owned()));
        }

        match payload_of(&inode) {
            InodePayload::Inline(bytes) => Ok(bytes),
            InodePayload::Empty => Ok(Vec::new()),
            InodePayload::Extents(_) => {
                let mut target = vec![0_u8; inode.size as usize];
                let read = self.read_payload(&inode, 0, &mut target)?;
                target.truncate(read);
                Ok(target)
            }
        }
    }

    // ── Directories ─────────────────────────────────────────────────────

    /// Resolve `name` in a directory to an inode number.
    pub fn dir_lookup(&self, dir: InodeNumber, name: &[u8]) -> Result<InodeNumber> {
        cellfs_dir::validate_name(name)?;
        let lock = self.lock_for(dir);
        let _guard = lock.read();
        let (_, index) = self.load_dir(dir)?;
        let Some(index) = index else {
            return Err(not_found(name));
        };

        for extent in &index.extents {
            for off in 0..extent.len {
                let phys = BlockNumber(extent.phys_start.0 + off);
                let block = self.load_dir_block(phys)?;
                if let Some(slot) = cellfs_dir::find(&block, name) {
                    return Ok(block.entries[slot].inode);
                }
            }
        }
        Err(not_found(name))
    }

    /// Insert an entry binding `name` to `ino`.
    ///
    /// The name is validated before anything is touched; duplicates are
    /// rejected. When every existing directory block is full, one more block
    /// is grown through the extent index and initialized empty before the
    /// insertion; a directory at full capacity fails with `DirFull`.
    pub fn dir_add_entry(&self, dir: InodeNumber, name: &[u8], ino: InodeNumber) -> Result<()> {
        cellfs_dir::validate_name(name)?;
        let lock = self.lock_for(dir);
        let _guard = lock.write();
        let (mut inode, index) = self.load_dir(dir)?;

        // First write into an empty directory allocates its extent index.
        let (index_block, mut index, fresh_index) = match (index, inode.ei_block) {
            (Some(index), at) if at != 0 => (BlockNumber(at), index, false),
            _ => (self.allocate_block()?, ExtentIndex::empty(), true),
        };
        if fresh_index {
            inode.ei_block = index_block.0;
        }

        let outcome = self.dir_insert(dir, &mut inode, index_block, &mut index, name, ino);
        if outcome.is_err() && fresh_index {
            // Nothing was persisted; hand the unused index block back.
            let _ = self.free_block(index_block);
        }
        outcome
    }

    /// Remove the entry named `name`.
    pub fn dir_remove_entry(&self, dir: InodeNumber, name: &[u8]) -> Result<()> {
        cellfs_dir::validate_name(name)?;
        let lock = self.lock_for(dir);
        let _guard = lock.write();
        let (mut inode, index) = self.load_dir(dir)?;
        let Some(mut index) = index else {
            return Err(not_found(name));
        };
        let InodePayload::Extents(index_block) = payload_of(&inode) else {
            return Err(not_found(name));
        };

        for eidx in 0..index.extents.len() {
            let extent = index.extents[eidx];
            for off in 0..extent.len {
                let phys = BlockNumber(extent.phys_start.0 + off);
                let mut block = self.load_dir_block(phys)?;
                if cellfs_dir::remove(&mut block, name).is_some() {
                    self.store_dir_block(phys, &block)?;
                    index.extents[eidx].nr_files -= 1;
                    index.nr_files -= 1;
                    self.write_index(index_block, &index)?;
                    inode.mtime = unix_now();
                    write_inode(self.dev.as_ref(), &self.layout(), dir, &inode)?;
                    debug!(dir = dir.0, name = %String::from_utf8_lossy(name), "entry removed");
                    return Ok(());
                }
            }
        }
        Err(not_found(name))
    }

    /// Whether the directory holds no entries.
    pub fn dir_is_empty(&self, dir: InodeNumber) -> Result<bool> {
        let lock = self.lock_for(dir);
        let _guard = lock.read();
        let (_, index) = self.load_dir(dir)?;
        Ok(index.map_or(true, |index| index.nr_files == 0))
    }

    /// Lazily iterate a directory's entries, block by block.
    ///
    /// The iterator is finite and restartable only by calling `dir_list`
    /// again; entries removed or added after the call may or may not be
    /// observed, but no torn block is ever seen.
    pub fn dir_list(&self, dir: InodeNumber) -> Result<DirIter> {
        let lock = self.lock_for(dir);
        let _guard = lock.read();
        let (_, index) = self.load_dir(dir)?;
        Ok(DirIter {
            dev: Arc::clone(&self.dev),
            extents: index.map(|index| index.extents).unwrap_or_default(),
            extent_idx: 0,
            block_off: 0,
            pending: Vec::new(),
            failed: false,
        })
    }

    // ── Internal helpers ────────────────────────────────────────────────

    fn layout(&self) -> Layout {
        self.state.lock().layout
    }

    fn lock_for(&self, ino: InodeNumber) -> Arc<RwLock<()>> {
        let mut locks = self.inode_locks.lock();
        Arc::clone(
            locks
                .entry(ino.0)
                .or_insert_with(|| Arc::new(RwLock::new(()))),
        )
    }

    /// Read an inode record and require it to be live (allocated).
    fn load_live(&self, ino: InodeNumber) -> Result<DiskInode> {
        let inode = read_inode(self.dev.as_ref(), &self.layout(), ino)?;
        if inode.mode == 0 {
            return Err(CellError::NotFound(format!("inode {ino}")));
        }
        Ok(inode)
    }

    fn kind_of(&self, ino: InodeNumber, inode: &DiskInode) -> Result<FileKind> {
        FileKind::from_mode(inode.mode).ok_or_else(|| CellError::Corrupt {
            block: self.layout().istore_start().0,
            detail: format!("inode {ino} has unknown file type {:#o}", inode.mode),
        })
    }

    fn load_index(&self, at: BlockNumber) -> Result<ExtentIndex> {
        let raw = self.dev.read_block(at)?;
        ExtentIndex::parse_block(raw.as_slice()).map_err(|err| corrupt(at.0, &err))
    }

    fn write_index(&self, at: BlockNumber, index: &ExtentIndex) -> Result<()> {
        let mut block = BlockBuf::zeroed();
        index
            .write_block(block.as_mut_slice())
            .map_err(|err| corrupt(at.0, &err))?;
        self.dev.write_block(at, block.as_slice())
    }

    fn load_dir_block(&self, at: BlockNumber) -> Result<DirBlock> {
        let raw = self.dev.read_block(at)?;
        DirBlock::parse_block(raw.as_slice()).map_err(|err| corrupt(at.0, &err))
    }

    fn store_dir_block(&self, at: BlockNumber, block: &DirBlock) -> Result<()> {
        let mut buf = BlockBuf::zeroed();
        block
            .write_block(buf.as_mut_slice())
            .map_err(|err| corrupt(at.0, &err))?;
        self.dev.write_block(at, buf.as_slice())
    }

    /// Load a directory inode and its extent index (if it has one).
    fn load_dir(&self, dir: InodeNumber) -> Result<(DiskInode, Option<ExtentIndex>)> {
        let inode = self.load_live(dir)?;
        if self.kind_of(dir, &inode)? != FileKind::Directory {
            return Err(CellError::NotDirectory);
        }
        match payload_of(&inode) {
            InodePayload::Extents(at) => {
                let index = self.load_index(at)?;
                Ok((inode, Some(index)))
            }
            InodePayload::Empty => Ok((inode, None)),
            InodePayload::Inline(_) => Err(CellError::Corrupt {
                block: 0,
                detail: format!("directory inode {dir} has inline payload"),
            }),
        }
    }

    /// Read extent-backed (or inline) data for `inode`.
    fn read_payload(&self, inode: &DiskInode, offset: u64, buf: &mut [u8]) -> Result<usize> {
        let size = u64::from(inode.size);
        if offset >= size || buf.is_empty() {
            return Ok(0);
        }
        let len = usize::try_from((size - offset).min(buf.len() as u64))
            .map_err(|_| CellError::FileTooLarge)?;

        match payload_of(inode) {
            InodePayload::Inline(bytes) => {
                let start = usize::try_from(offset).map_err(|_| CellError::FileTooLarge)?;
                buf[..len].copy_from_slice(&bytes[start..start + len]);
                Ok(len)
            }
            InodePayload::Empty => {
                buf[..len].fill(0);
                Ok(len)
            }
            InodePayload::Extents(at) => {
                let index = self.load_index(at)?;
                let mut done = 0_usize;
                while done < len {
                    let pos = offset + done as u64;
                    let Some(logical) = LogicalBlock::containing(pos) else {
                        break;
                    };
                    let in_block = usize::try_from(pos % u64::from(BLOCK_SIZE))
                        .map_err(|_| CellError::FileTooLarge)?;
                    let chunk = (BLOCK_SIZE as usize - in_block).min(len - done);

                    match cellfs_extent::search(&index, logical) {
                        Some(phys) => {
                            let raw = self.dev.read_block(phys)?;
                            buf[done..done + chunk]
                                .copy_from_slice(&raw.as_slice()[in_block..in_block + chunk]);
                        }
                        // Hole: sparse-zero.
                        None => buf[done..done + chunk].fill(0),
                    }
                    done += chunk;
                }
                Ok(done)
            }
        }
    }

    /// Write extent-backed data for `inode`, growing the mapping and
    /// persisting the index and the record.
    fn write_payload(
        &self,
        ino: InodeNumber,
        inode: &mut DiskInode,
        offset: u64,
        data: &[u8],
    ) -> Result<usize> {
        if data.is_empty() {
            return Ok(0);
        }
        let end = offset
            .checked_add(data.len() as u64)
            .ok_or(CellError::FileTooLarge)?;
        if end > MAX_FILESIZE {
            return Err(CellError::FileTooLarge);
        }

        // The write path is extent-backed by definition; a fresh inode (or a
        // fresh long symlink, whose inline area is unused) gets its index
        // block here.
        let (index_block, mut index, fresh_index) = if inode.ei_block == 0 {
            (self.allocate_block()?, ExtentIndex::empty(), true)
        } else {
            let at = BlockNumber(inode.ei_block);
            (at, self.load_index(at)?, false)
        };

        let mut written = 0_usize;
        let mut grow_error = None;
        while written < data.len() {
            let pos = offset + written as u64;
            let Some(logical) = LogicalBlock::containing(pos) else {
                grow_error = Some(CellError::FileTooLarge);
                break;
            };
            let in_block = usize::try_from(pos % u64::from(BLOCK_SIZE))
                .map_err(|_| CellError::FileTooLarge)?;
            let chunk = (BLOCK_SIZE as usize - in_block).min(data.len() - written);

            let mapping = {
                let mut state = self.state.lock();
                let mapping = cellfs_extent::map_or_grow(&mut index, logical, &mut state.bfree);
                state.refresh_counters();
                mapping
            };
            let mapping = match mapping {
                Ok(mapping) => mapping,
                Err(err) => {
                    grow_error = Some(err);
                    break;
                }
            };

            // Freshly grown blocks start from zeros; partial writes into
            // existing blocks are read-modify-written. Full-block writes
            // skip the read.
            let mut block = if chunk == BLOCK_SIZE as usize || mapping.grew {
                BlockBuf::zeroed()
            } else {
                self.dev.read_block(mapping.block)?
            };
            block.as_mut_slice()[in_block..in_block + chunk]
                .copy_from_slice(&data[written..written + chunk]);
            self.dev.write_block(mapping.block, block.as_slice())?;
            written += chunk;
        }

        if written == 0 {
            if fresh_index {
                // Nothing durable happened; release the unused index block.
                let _ = self.free_block(index_block);
            }
            return Err(grow_error.unwrap_or(CellError::NoSpace));
        }

        self.write_index(index_block, &index)?;
        if fresh_index {
            inode.ei_block = index_block.0;
        }
        let new_end = u32::try_from(offset + written as u64).map_err(|_| CellError::FileTooLarge)?;
        inode.size = inode.size.max(new_end);
        inode.nr_blocks = cellfs_extent::covered_blocks(&index);
        inode.mtime = unix_now();
        write_inode(self.dev.as_ref(), &self.layout(), ino, inode)?;

        if let Some(err) = grow_error {
            debug!(ino = ino.0, written, %err, "short write");
        }
        Ok(written)
    }

    /// Insert an entry into a directory whose index is loaded, growing a new
    /// directory block when every existing one is full.
    fn dir_insert(
        &self,
        dir: InodeNumber,
        inode: &mut DiskInode,
        index_block: BlockNumber,
        index: &mut ExtentIndex,
        name: &[u8],
        ino: InodeNumber,
    ) -> Result<()> {
        // One pass: reject duplicates anywhere, remember the first open slot.
        let mut open_slot: Option<(usize, BlockNumber, DirBlock)> = None;
        for (eidx, extent) in index.extents.iter().enumerate() {
            for off in 0..extent.len {
                let phys = BlockNumber(extent.phys_start.0 + off);
                let block = self.load_dir_block(phys)?;
                if cellfs_dir::find(&block, name).is_some() {
                    return Err(CellError::Exists(
                        String::from_utf8_lossy(name).into_owned(),
                    ));
                }
                if open_slot.is_none() && !cellfs_dir::is_full(&block) {
                    open_slot = Some((eidx, phys, block));
                }
            }
        }

        let (eidx, phys, mut block) = match open_slot {
            Some(slot) => slot,
            None => {
                // Grow the directory by one block, initialized empty.
                let next_logical = LogicalBlock(cellfs_extent::logical_end(index));
                let mapping = {
                    let mut state = self.state.lock();
                    let mapping =
                        cellfs_extent::map_or_grow(index, next_logical, &mut state.bfree);
                    state.refresh_counters();
                    mapping
                };
                let mapping = match mapping {
                    Ok(mapping) => mapping,
                    // An exhausted extent index means the directory is at
                    // capacity; out-of-space stays out-of-space.
                    Err(CellError::FileTooLarge) => return Err(CellError::DirFull),
                    Err(err) => return Err(err),
                };
                let eidx = index
                    .extents
                    .iter()
                    .position(|e| e.covers(next_logical))
                    .ok_or(CellError::Corrupt {
                        block: index_block.0,
                        detail: "grown extent does not cover its logical block".to_owned(),
                    })?;
                self.store_dir_block(mapping.block, &DirBlock::empty())?;
                inode.size = cellfs_extent::logical_end(index) * BLOCK_SIZE;
                inode.nr_blocks = cellfs_extent::covered_blocks(index);
                (eidx, mapping.block, DirBlock::empty())
            }
        };

        cellfs_dir::push(&mut block, DirEntry::new(ino, name.to_vec()))?;
        self.store_dir_block(phys, &block)?;
        index.extents[eidx].nr_files += 1;
        index.nr_files += 1;
        self.write_index(index_block, index)?;
        inode.mtime = unix_now();
        write_inode(self.dev.as_ref(), &self.layout(), dir, inode)?;
        debug!(
            dir = dir.0,
            ino = ino.0,
            name = %String::from_utf8_lossy(name),
            "entry added"
        );
        Ok(())
    }
}

fn not_found(name: &[u8]) -> CellError {
    CellError::NotFound(String::from_utf8_lossy(name).into_owned())
}

// ── Directory iteration ─────────────────────────────────────────────────────

/// Lazy directory entry iterator returned by [`CellFs::dir_list`].
pub struct DirIter {
    dev: Arc<dyn BlockDevice>,
    extents: Vec<Extent>,
    extent_idx: usize,
    block_off: u32,
    pending: Vec<DirEntryInfo>,
    failed: bool,
}

impl DirIter {
    /// Load the next directory block's entries into `pending`.
    fn refill(&mut self) -> Result<bool> {
        while self.extent_idx < self.extents.len() {
            let extent = self.extents[self.extent_idx];
            if self.block_off >= extent.len {
                self.extent_idx += 1;
                self.block_off = 0;
                continue;
            }
            let phys = BlockNumber(extent.phys_start.0 + self.block_off);
            self.block_off += 1;

            let raw = self.dev.read_block(phys)?;
            let block =
                DirBlock::parse_block(raw.as_slice()).map_err(|err| corrupt(phys.0, &err))?;
            if block.entries.is_empty() {
                continue;
            }
            self.pending = block
                .entries
                .into_iter()
                .rev()
                .map(|entry| DirEntryInfo {
                    inode: entry.inode,
                    block_count: entry.block_count,
                    name: entry.name,
                })
                .collect();
            return Ok(true);
        }
        Ok(false)
    }
}

impl Iterator for DirIter {
    type Item = Result<DirEntryInfo>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        if self.pending.is_empty() {
            match self.refill() {
                Ok(true) => {}
                Ok(false) => return None,
                Err(err) => {
                    self.failed = true;
                    return Some(Err(err));
                }
            }
        }
        self.pending.pop().map(Ok)
    }
}

// ── Bitmap region I/O ───────────────────────────────────────────────────────

fn read_bitmap_region(
    dev: &dyn BlockDevice,
    start: BlockNumber,
    nr_region_blocks: u32,
) -> Result<Vec<u8>> {
    let mut bytes = Vec::with_capacity(nr_region_blocks as usize * BLOCK_SIZE as usize);
    for i in 0..nr_region_blocks {
        let raw = dev.read_block(BlockNumber(start.0 + i))?;
        bytes.extend_from_slice(raw.as_slice());
    }
    Ok(bytes)
}

fn write_bitmap_region(
    dev: &dyn BlockDevice,
    start: BlockNumber,
    nr_region_blocks: u32,
    alloc: &BitmapAllocator,
) -> Result<()> {
    let mut bytes = vec![0_u8; nr_region_blocks as usize * BLOCK_SIZE as usize];
    alloc
        .write_bytes(&mut bytes)
        .map_err(|err| corrupt(start.0, &err))?;
    for (i, chunk) in bytes.chunks_exact(BLOCK_SIZE as usize).enumerate() {
        let i = u32::try_from(i).map_err(|_| CellError::Corrupt {
            block: start.0,
            detail: "bitmap region block index overflow".to_owned(),
        })?;
        dev.write_block(BlockNumber(start.0 + i), chunk)?;
    }
    Ok(())
}
