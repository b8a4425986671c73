#![forbid(unsafe_code)]
//! Inode table management.
//!
//! Reads and writes packed inode records through the [`cellfs_block`]
//! device, and provides the in-memory view of a record's payload: a tagged
//! [`InodePayload`] instead of raw `ei_block`/inline-bytes field poking.
//! Timestamps are 32-bit Unix seconds, set by the engine on create and
//! mutation.

use cellfs_block::BlockDevice;
use cellfs_error::{CellError, Result};
use cellfs_ondisk::{DiskInode, Layout};
use cellfs_types::{
    BlockNumber, INLINE_DATA_LEN, InodeNumber, S_IFDIR, S_IFLNK, S_IFMT, S_IFREG,
};
use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

/// File type of an inode, derived from the mode bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FileKind {
    Regular,
    Directory,
    Symlink,
}

impl FileKind {
    /// Decode from mode bits; unknown file types are corruption.
    pub fn from_mode(mode: u32) -> Option<Self> {
        match mode & S_IFMT {
            S_IFREG => Some(Self::Regular),
            S_IFDIR => Some(Self::Directory),
            S_IFLNK => Some(Self::Symlink),
            _ => None,
        }
    }

    /// The file-type bits for this kind.
    #[must_use]
    pub fn mode_bits(self) -> u32 {
        match self {
            Self::Regular => S_IFREG,
            Self::Directory => S_IFDIR,
            Self::Symlink => S_IFLNK,
        }
    }
}

/// Where an inode's data lives.
///
/// Short symlink targets are stored inline in the record itself; everything
/// else goes through an extent index block. `ei_block == 0` on disk decodes
/// to `Empty` (the superblock occupies block 0, so 0 is never a valid index
/// block).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InodePayload {
    /// No data blocks yet.
    Empty,
    /// Symlink target stored in the inode record (≤ 32 bytes).
    Inline(Vec<u8>),
    /// Extent index block holding the file's extents.
    Extents(BlockNumber),
}

/// Decode the payload view of a record.
#[must_use]
pub fn payload_of(inode: &DiskInode) -> InodePayload {
    let kind = FileKind::from_mode(inode.mode);
    if matches!(kind, Some(FileKind::Symlink)) && inode.size as usize <= INLINE_DATA_LEN {
        let len = inode.size as usize;
        return InodePayload::Inline(inode.inline[..len].to_vec());
    }
    if inode.ei_block == 0 {
        InodePayload::Empty
    } else {
        InodePayload::Extents(BlockNumber(inode.ei_block))
    }
}

/// Current time as 32-bit Unix seconds (saturating past 2106).
#[must_use]
pub fn unix_now() -> u32 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| u32::try_from(d.as_secs()).unwrap_or(u32::MAX))
}

/// Build a fresh record for a newly created inode.
#[must_use]
pub fn new_inode(kind: FileKind, perm: u32, uid: u32, gid: u32) -> DiskInode {
    let now = unix_now();
    let mut inode = DiskInode::zeroed();
    inode.mode = kind.mode_bits() | (perm & !S_IFMT);
    inode.uid = uid;
    inode.gid = gid;
    inode.ctime = now;
    inode.atime = now;
    inode.mtime = now;
    inode.nlink = match kind {
        FileKind::Directory => 2,
        FileKind::Regular | FileKind::Symlink => 1,
    };
    inode
}

/// Read one inode record from the inode store.
pub fn read_inode(
    dev: &dyn BlockDevice,
    layout: &Layout,
    ino: InodeNumber,
) -> Result<DiskInode> {
    let (block, offset) = layout
        .inode_location(ino)
        .map_err(|err| CellError::Corrupt {
            block: layout.istore_start().0,
            detail: format!("inode {ino}: {err}"),
        })?;
    let buf = dev.read_block(block)?;
    DiskInode::parse_at(buf.as_slice(), offset).map_err(|err| CellError::Corrupt {
        block: block.0,
        detail: format!("inode {ino}: {err}"),
    })
}

/// Write one inode record into the inode store (read-modify-write of the
/// containing block).
pub fn write_inode(
    dev: &dyn BlockDevice,
    layout: &Layout,
    ino: InodeNumber,
    inode: &DiskInode,
) -> Result<()> {
    let (block, offset) = layout
        .inode_location(ino)
        .map_err(|err| CellError::Corrupt {
            block: layout.istore_start().0,
            detail: format!("inode {ino}: {err}"),
        })?;
    let mut buf = dev.read_block(block)?;
    inode
        .write_at(buf.as_mut_slice(), offset)
        .map_err(|err| CellError::Corrupt {
            block: block.0,
            detail: format!("inode {ino}: {err}"),
        })?;
    dev.write_block(block, buf.as_slice())
}
