#![forbid(unsafe_code)]
//! Directory entry management, one block at a time.
//!
//! A directory's data blocks are fixed-capacity entry arrays; this crate
//! provides the operations on a single [`DirBlock`]: name validation,
//! lookup, insertion, and removal. Walking a directory's blocks through its
//! extent index is the engine's job (`cellfs-core`).
//!
//! Removal policy: **compact-by-swap**. The removed slot is overwritten by
//! the block's last live entry and the live count drops by one, so entries
//! `0..nr_files` are always live and scans never see removed entries. The
//! trade-off: listing order is not stable across removals.

use cellfs_error::{CellError, Result};
use cellfs_ondisk::{DirBlock, DirEntry};
use cellfs_types::{FILENAME_LEN, FILES_PER_BLOCK};

/// Validate a directory entry name before any mutation.
///
/// Over-long names are `NameTooLong`; empty names or names containing NUL
/// or `/` are invalid.
pub fn validate_name(name: &[u8]) -> Result<()> {
    if name.len() > FILENAME_LEN {
        return Err(CellError::NameTooLong);
    }
    if name.is_empty() || name.iter().any(|b| *b == 0 || *b == b'/') {
        return Err(CellError::Invalid(
            "name is empty or contains a reserved byte".to_owned(),
        ));
    }
    Ok(())
}

/// Slot index of the entry named `name`, if present.
#[must_use]
pub fn find(block: &DirBlock, name: &[u8]) -> Option<usize> {
    block.entries.iter().position(|e| e.name == name)
}

/// Whether the block has no open slot left.
#[must_use]
pub fn is_full(block: &DirBlock) -> bool {
    block.entries.len() >= FILES_PER_BLOCK
}

/// Insert an entry at the first open slot.
///
/// The caller has already validated the name and checked for duplicates
/// across the whole directory; a full block is still rejected here.
pub fn push(block: &mut DirBlock, entry: DirEntry) -> Result<()> {
    if is_full(block) {
        return Err(CellError::DirFull);
    }
    block.entries.push(entry);
    Ok(())
}

/// Remove the entry named `name` by compact-by-swap, returning it.
pub fn remove(block: &mut DirBlock, name: &[u8]) -> Option<DirEntry> {
    let slot = find(block, name)?;
    Some(block.entries.swap_remove(slot))
}

#[cfg(test)]
mod tests {
    use super::*;
    use cellfs_types::InodeNumber;

    fn entry(ino: u32, name: &[u8]) -> DirEntry {
        DirEntry::new(InodeNumber(ino), name.to_vec())
    }

    #[test]
    fn validate_name_boundaries() {
        assert!(validate_name(b"a").is_ok());
        assert!(validate_name(&vec![b'x'; FILENAME_LEN]).is_ok());
        assert!(matches!(
            validate_name(&vec![b'x'; FILENAME_LEN + 1]),
            Err(CellError::NameTooLong)
        ));
        assert!(matches!(validate_name(b""), Err(CellError::Invalid(_))));
        assert!(matches!(
            validate_name(b"a/b"),
            Err(CellError::Invalid(_))
        ));
        assert!(matches!(
            validate_name(b"a\0b"),
            Err(CellError::Invalid(_))
        ));
    }

    #[test]
    fn push_then_find() {
        let mut block = DirBlock::empty();
        push(&mut block, entry(3, b"alpha")).unwrap();
        push(&mut block, entry(4, b"beta")).unwrap();
        assert_eq!(find(&block, b"alpha"), Some(0));
        assert_eq!(find(&block, b"beta"), Some(1));
        assert_eq!(find(&block, b"gamma"), None);
    }

    #[test]
    fn push_rejects_full_block() {
        let mut block = DirBlock::empty();
        for i in 0..FILES_PER_BLOCK {
            let i = u32::try_from(i).unwrap();
            push(&mut block, entry(i, format!("f{i}").as_bytes())).unwrap();
        }
        assert!(is_full(&block));
        let err = push(&mut block, entry(99, b"overflow")).unwrap_err();
        assert!(matches!(err, CellError::DirFull));
        assert_eq!(block.entries.len(), FILES_PER_BLOCK);
    }

    #[test]
    fn remove_compacts_by_swap() {
        let mut block = DirBlock::empty();
        push(&mut block, entry(1, b"a")).unwrap();
        push(&mut block, entry(2, b"b")).unwrap();
        push(&mut block, entry(3, b"c")).unwrap();

        let removed = remove(&mut block, b"a").unwrap();
        assert_eq!(removed.inode, InodeNumber(1));
        // Last live entry moved into the vacated slot.
        assert_eq!(block.entries.len(), 2);
        assert_eq!(block.entries[0].name, b"c".to_vec());
        assert_eq!(find(&block, b"a"), None);
        assert_eq!(find(&block, b"b"), Some(1));
    }

    #[test]
    fn remove_missing_name_is_none() {
        let mut block = DirBlock::empty();
        push(&mut block, entry(1, b"a")).unwrap();
        assert!(remove(&mut block, b"zzz").is_none());
        assert_eq!(block.entries.len(), 1);
    }

    #[test]
    fn removed_entries_never_resurface() {
        let mut block = DirBlock::empty();
        for i in 0..5_u32 {
            push(&mut block, entry(i, format!("f{i}").as_bytes())).unwrap();
        }
        remove(&mut block, b"f2").unwrap();
        remove(&mut block, b"f0").unwrap();

        let names: Vec<&[u8]> = block.entries.iter().map(|e| e.name.as_slice()).collect();
        assert_eq!(names.len(), 3);
        assert!(!names.contains(&b"f0".as_slice()));
        assert!(!names.contains(&b"f2".as_slice()));
    }
}
