#![forbid(unsafe_code)]
//! End-to-end engine tests over an in-memory device, plus a file-backed
//! round trip.

use cellfs_block::{BlockDevice, FileBlockDevice, MemBlockDevice};
use cellfs_core::{CellFs, ROOT_INO};
use cellfs_error::CellError;
use cellfs_inode::FileKind;
use cellfs_types::{BLOCK_SIZE, InodeNumber, MAX_EXTENTS};
use std::sync::Arc;

fn fresh_fs(nr_blocks: u32, nr_inodes: u32) -> CellFs {
    let dev = Arc::new(MemBlockDevice::new(nr_blocks));
    CellFs::format(dev.as_ref(), nr_inodes).unwrap();
    CellFs::mount(dev).unwrap()
}

fn create_file(fs: &CellFs) -> InodeNumber {
    fs.create(FileKind::Regular, 0o644, 0, 0).unwrap()
}

// ── Format / mount lifecycle ────────────────────────────────────────────────

#[test]
fn format_mount_round_trip_preserves_fields() {
    let dev = Arc::new(MemBlockDevice::new(1024));
    CellFs::format(dev.as_ref(), 64).unwrap();

    let fs = CellFs::mount(Arc::clone(&dev) as Arc<dyn BlockDevice>).unwrap();
    let info = fs.info();
    assert_eq!(
        (info.nr_blocks, info.nr_inodes),
        (1024, 64),
        "geometry survives the round trip"
    );
    // Fresh image: only the root inode and the metadata blocks are in use.
    assert_eq!(info.nr_free_inodes, 63);
    assert_eq!(info.nr_free_blocks, 1019);

    // A second mount of the same device sees the same superblock.
    drop(fs);
    let fs = CellFs::mount(dev).unwrap();
    assert_eq!(fs.info(), info);
}

#[test]
fn sync_persists_allocations_across_remount() {
    let dev = Arc::new(MemBlockDevice::new(1024));
    CellFs::format(dev.as_ref(), 64).unwrap();

    let fs = CellFs::mount(Arc::clone(&dev) as Arc<dyn BlockDevice>).unwrap();
    let ino = create_file(&fs);
    fs.write_at(ino, 0, &[0xAB; 9000]).unwrap();
    fs.dir_add_entry(ROOT_INO, b"victim", ino).unwrap();
    fs.unmount().unwrap();

    let fs = CellFs::mount(dev).unwrap();
    assert_eq!(fs.dir_lookup(ROOT_INO, b"victim").unwrap(), ino);
    let mut buf = vec![0_u8; 9000];
    assert_eq!(fs.read_at(ino, 0, &mut buf).unwrap(), 9000);
    assert!(buf.iter().all(|b| *b == 0xAB));
    // Counters equal the persisted bitmap popcounts: the file's index block
    // plus 3 data blocks, and the root directory's index plus 1 dir block.
    assert_eq!(fs.info().nr_free_blocks, 1019 - 6);
}

// ── File data path ──────────────────────────────────────────────────────────

#[test]
fn sequential_20000_byte_write_uses_five_blocks_one_extent() {
    let fs = fresh_fs(1024, 64);
    let ino = create_file(&fs);

    // Write 20000 bytes in uneven sequential chunks.
    let payload: Vec<u8> = (0..20000_u32).map(|i| (i % 251) as u8).collect();
    let mut offset = 0_usize;
    for chunk in payload.chunks(3000) {
        let written = fs.write_at(ino, offset as u64, chunk).unwrap();
        assert_eq!(written, chunk.len());
        offset += written;
    }

    let attr = fs.stat(ino).unwrap();
    assert_eq!(attr.size, 20000);
    assert_eq!(attr.nr_blocks, 5, "ceil(20000 / 4096) data blocks");
    let extents = fs.extents_of(ino).unwrap();
    assert_eq!(extents.len(), 1, "5 blocks coalesce into one extent");
    assert_eq!(extents[0].len, 5);

    let mut back = vec![0_u8; 20000];
    assert_eq!(fs.read_at(ino, 0, &mut back).unwrap(), 20000);
    assert_eq!(back, payload);
}

#[test]
fn sequential_writes_never_exceed_ceil_n_over_8_extents() {
    let fs = fresh_fs(1024, 64);
    let ino = create_file(&fs);

    let block = vec![0x5A_u8; BLOCK_SIZE as usize];
    for logical in 0..20_u64 {
        fs.write_at(ino, logical * u64::from(BLOCK_SIZE), &block)
            .unwrap();
    }
    let extents = fs.extents_of(ino).unwrap();
    assert_eq!(extents.len(), 3, "ceil(20 / 8)");
    assert_eq!(fs.stat(ino).unwrap().nr_blocks, 20);
}

#[test]
fn sparse_write_reads_zero_filled_holes() {
    let fs = fresh_fs(1024, 64);
    let ino = create_file(&fs);

    fs.write_at(ino, 10000, b"tail").unwrap();
    let attr = fs.stat(ino).unwrap();
    assert_eq!(attr.size, 10004);
    assert_eq!(attr.nr_blocks, 1, "only the written block is backed");

    let mut buf = vec![0xFF_u8; 10004];
    assert_eq!(fs.read_at(ino, 0, &mut buf).unwrap(), 10004);
    assert!(buf[..10000].iter().all(|b| *b == 0), "hole reads as zeros");
    assert_eq!(&buf[10000..], b"tail");

    // Reads at and past EOF return 0 bytes.
    assert_eq!(fs.read_at(ino, 10004, &mut buf).unwrap(), 0);
    assert_eq!(fs.read_at(ino, 20000, &mut buf).unwrap(), 0);
}

#[test]
fn overwrite_in_place_does_not_grow_the_mapping() {
    let fs = fresh_fs(1024, 64);
    let ino = create_file(&fs);

    fs.write_at(ino, 0, &[1_u8; 8192]).unwrap();
    let free_after_first = fs.info().nr_free_blocks;
    fs.write_at(ino, 100, &[2_u8; 50]).unwrap();
    assert_eq!(fs.info().nr_free_blocks, free_after_first);

    let mut buf = [0_u8; 8192];
    fs.read_at(ino, 0, &mut buf).unwrap();
    assert_eq!(buf[99], 1);
    assert_eq!(buf[100], 2);
    assert_eq!(buf[149], 2);
    assert_eq!(buf[150], 1);
}

#[test]
fn write_past_max_filesize_is_rejected_up_front() {
    let fs = fresh_fs(1024, 64);
    let ino = create_file(&fs);
    let err = fs
        .write_at(ino, cellfs_types::MAX_FILESIZE - 1, &[0_u8; 2])
        .unwrap_err();
    assert!(matches!(err, CellError::FileTooLarge));
    assert_eq!(fs.stat(ino).unwrap().size, 0, "nothing was written");
}

#[test]
fn full_extent_index_fails_without_mutating_it() {
    let fs = fresh_fs(1024, 64);
    let ino = create_file(&fs);

    // Sparse one-block writes: never adjacent, so never coalesced.
    for i in 0..MAX_EXTENTS as u64 {
        fs.write_at(ino, i * 2 * u64::from(BLOCK_SIZE), &[7_u8; 1])
            .unwrap();
    }
    assert_eq!(fs.extents_of(ino).unwrap().len(), MAX_EXTENTS);

    let before = fs.extents_of(ino).unwrap();
    let free_before = fs.info().nr_free_blocks;
    // A hole that needs a new extent cannot be filled any more.
    let err = fs.write_at(ino, u64::from(BLOCK_SIZE), &[7_u8; 1]).unwrap_err();
    assert!(matches!(err, CellError::FileTooLarge));
    assert_eq!(fs.extents_of(ino).unwrap(), before);
    assert_eq!(fs.info().nr_free_blocks, free_before);
}

#[test]
fn out_of_space_write_is_short_and_definitive() {
    // 16 blocks: 1 sb + 1 istore + 1 ifree + 1 bfree leaves 12 data blocks.
    let fs = fresh_fs(16, 8);
    let ino = create_file(&fs);

    // 20 blocks requested; 1 goes to the extent index, 11 can hold data.
    let want = 20 * BLOCK_SIZE as usize;
    let written = fs.write_at(ino, 0, &vec![9_u8; want]).unwrap();
    assert_eq!(written, 11 * BLOCK_SIZE as usize);
    assert_eq!(fs.info().nr_free_blocks, 0);

    // Allocation failure is definitive until something frees space.
    let err = fs.write_at(ino, written as u64, &[9_u8; 1]).unwrap_err();
    assert!(matches!(err, CellError::NoSpace));
    assert_eq!(fs.info().nr_free_blocks, 0);

    let err = fs.allocate_block().unwrap_err();
    assert!(matches!(err, CellError::NoSpace));
    assert_eq!(fs.info().nr_free_blocks, 0);
}

// ── Truncate / remove ───────────────────────────────────────────────────────

#[test]
fn truncate_shrinks_and_returns_blocks() {
    let fs = fresh_fs(1024, 64);
    let ino = create_file(&fs);
    fs.write_at(ino, 0, &vec![3_u8; 20000]).unwrap();
    let free_before = fs.info().nr_free_blocks;

    fs.truncate(ino, 5000).unwrap();
    let attr = fs.stat(ino).unwrap();
    assert_eq!(attr.size, 5000);
    assert_eq!(attr.nr_blocks, 2);
    assert_eq!(fs.info().nr_free_blocks, free_before + 3);

    // Data below the cut survives; reads stop at the new size.
    let mut buf = vec![0_u8; 20000];
    assert_eq!(fs.read_at(ino, 0, &mut buf).unwrap(), 5000);
    assert!(buf[..5000].iter().all(|b| *b == 3));
}

#[test]
fn truncate_to_zero_frees_the_extent_index_too() {
    let fs = fresh_fs(1024, 64);
    let free_at_start = fs.info().nr_free_blocks;
    let ino = create_file(&fs);
    fs.write_at(ino, 0, &vec![3_u8; 20000]).unwrap();

    fs.truncate(ino, 0).unwrap();
    assert_eq!(fs.stat(ino).unwrap().size, 0);
    assert_eq!(fs.stat(ino).unwrap().nr_blocks, 0);
    assert_eq!(fs.info().nr_free_blocks, free_at_start);
    assert!(fs.extents_of(ino).unwrap().is_empty());

    // The file is still writable afterwards.
    fs.write_at(ino, 0, b"again").unwrap();
    assert_eq!(fs.stat(ino).unwrap().size, 5);
}

#[test]
fn truncate_extend_leaves_a_hole() {
    let fs = fresh_fs(1024, 64);
    let ino = create_file(&fs);
    fs.write_at(ino, 0, b"head").unwrap();

    fs.truncate(ino, 9000).unwrap();
    let attr = fs.stat(ino).unwrap();
    assert_eq!(attr.size, 9000);
    assert_eq!(attr.nr_blocks, 1, "extension allocates nothing");

    let mut buf = vec![0xFF_u8; 9000];
    assert_eq!(fs.read_at(ino, 0, &mut buf).unwrap(), 9000);
    assert_eq!(&buf[..4], b"head");
    assert!(buf[4..].iter().all(|b| *b == 0));
}

#[test]
fn remove_releases_inode_and_blocks() {
    let fs = fresh_fs(1024, 64);
    let info_before = fs.info();
    let ino = create_file(&fs);
    fs.write_at(ino, 0, &vec![1_u8; 12345]).unwrap();

    fs.remove(ino).unwrap();
    assert!(matches!(fs.stat(ino), Err(CellError::NotFound(_))));
    assert_eq!(fs.info(), info_before, "all resources returned");

    // The inode number is recycled by the next create.
    let again = create_file(&fs);
    assert_eq!(again, ino);
}

// ── Symlinks ────────────────────────────────────────────────────────────────

#[test]
fn short_symlink_is_inline_and_costs_no_blocks() {
    let fs = fresh_fs(1024, 64);
    let free_before = fs.info().nr_free_blocks;

    let ino = fs.symlink_create(b"/etc/hosts", 0, 0).unwrap();
    assert_eq!(fs.symlink_target(ino).unwrap(), b"/etc/hosts".to_vec());
    assert_eq!(fs.stat(ino).unwrap().kind, FileKind::Symlink);
    assert_eq!(fs.info().nr_free_blocks, free_before, "inline target");

    // 32 bytes is the inline boundary.
    let edge = vec![b'x'; 32];
    let ino = fs.symlink_create(&edge, 0, 0).unwrap();
    assert_eq!(fs.symlink_target(ino).unwrap(), edge);
    assert_eq!(fs.info().nr_free_blocks, free_before);
}

#[test]
fn long_symlink_spills_into_a_data_block() {
    let fs = fresh_fs(1024, 64);
    let free_before = fs.info().nr_free_blocks;

    let target: Vec<u8> = (0..300_u32).map(|i| b'a' + (i % 26) as u8).collect();
    let ino = fs.symlink_create(&target, 0, 0).unwrap();
    assert_eq!(fs.symlink_target(ino).unwrap(), target);
    // Index block + one data block.
    assert_eq!(fs.info().nr_free_blocks, free_before - 2);
}

#[test]
fn symlink_target_of_non_symlink_is_invalid() {
    let fs = fresh_fs(1024, 64);
    let ino = create_file(&fs);
    assert!(matches!(
        fs.symlink_target(ino),
        Err(CellError::Invalid(_))
    ));
}

// ── Directories ─────────────────────────────────────────────────────────────

#[test]
fn add_then_lookup_then_remove() {
    let fs = fresh_fs(1024, 64);
    let ino = create_file(&fs);

    fs.dir_add_entry(ROOT_INO, b"hello.txt", ino).unwrap();
    assert_eq!(fs.dir_lookup(ROOT_INO, b"hello.txt").unwrap(), ino);
    assert!(!fs.dir_is_empty(ROOT_INO).unwrap());

    fs.dir_remove_entry(ROOT_INO, b"hello.txt").unwrap();
    assert!(matches!(
        fs.dir_lookup(ROOT_INO, b"hello.txt"),
        Err(CellError::NotFound(_))
    ));
    assert!(fs.dir_is_empty(ROOT_INO).unwrap());
}

#[test]
fn duplicate_entry_is_rejected() {
    let fs = fresh_fs(1024, 64);
    let a = create_file(&fs);
    let b = create_file(&fs);

    fs.dir_add_entry(ROOT_INO, b"same", a).unwrap();
    let err = fs.dir_add_entry(ROOT_INO, b"same", b).unwrap_err();
    assert!(matches!(err, CellError::Exists(_)));
    // The original binding is untouched.
    assert_eq!(fs.dir_lookup(ROOT_INO, b"same").unwrap(), a);
}

#[test]
fn oversized_name_is_rejected_without_mutation() {
    let fs = fresh_fs(1024, 64);
    let ino = create_file(&fs);
    let long = vec![b'n'; 256];

    let err = fs.dir_add_entry(ROOT_INO, &long, ino).unwrap_err();
    assert!(matches!(err, CellError::NameTooLong));
    assert!(fs.dir_is_empty(ROOT_INO).unwrap(), "nr_files unchanged");
    assert_eq!(fs.stat(ROOT_INO).unwrap().nr_blocks, 0);

    // Lookups and removals reject the name the same way.
    assert!(matches!(
        fs.dir_lookup(ROOT_INO, &long),
        Err(CellError::NameTooLong)
    ));
    assert!(matches!(
        fs.dir_remove_entry(ROOT_INO, &long),
        Err(CellError::NameTooLong)
    ));
}

#[test]
fn directory_spills_into_additional_blocks() {
    let fs = fresh_fs(1024, 64);

    // 15 entries fill the first directory block; the 16th grows a second.
    let inos: Vec<InodeNumber> = (0..20)
        .map(|i| {
            let ino = create_file(&fs);
            fs.dir_add_entry(ROOT_INO, format!("file-{i:02}").as_bytes(), ino)
                .unwrap();
            ino
        })
        .collect();

    let attr = fs.stat(ROOT_INO).unwrap();
    assert_eq!(attr.nr_blocks, 2);
    assert_eq!(attr.size, u64::from(2 * BLOCK_SIZE));

    // Every entry resolves, wherever it landed.
    for (i, ino) in inos.iter().enumerate() {
        assert_eq!(
            fs.dir_lookup(ROOT_INO, format!("file-{i:02}").as_bytes())
                .unwrap(),
            *ino
        );
    }

    let listed: Vec<String> = fs
        .dir_list(ROOT_INO)
        .unwrap()
        .map(|entry| entry.unwrap().name_str())
        .collect();
    assert_eq!(listed.len(), 20);

    // Removal from the first block never hides entries in later blocks.
    fs.dir_remove_entry(ROOT_INO, b"file-03").unwrap();
    let listed: Vec<String> = fs
        .dir_list(ROOT_INO)
        .unwrap()
        .map(|entry| entry.unwrap().name_str())
        .collect();
    assert_eq!(listed.len(), 19);
    assert!(!listed.contains(&"file-03".to_owned()));
    assert!(listed.contains(&"file-19".to_owned()));
}

#[test]
fn dir_list_is_restartable_from_the_start() {
    let fs = fresh_fs(1024, 64);
    for i in 0..5 {
        let ino = create_file(&fs);
        fs.dir_add_entry(ROOT_INO, format!("e{i}").as_bytes(), ino)
            .unwrap();
    }

    let first: Vec<String> = fs
        .dir_list(ROOT_INO)
        .unwrap()
        .map(|e| e.unwrap().name_str())
        .collect();
    let second: Vec<String> = fs
        .dir_list(ROOT_INO)
        .unwrap()
        .map(|e| e.unwrap().name_str())
        .collect();
    assert_eq!(first, second);
    assert_eq!(first.len(), 5);
}

#[test]
fn dir_operations_reject_non_directories() {
    let fs = fresh_fs(1024, 64);
    let file = create_file(&fs);
    let other = create_file(&fs);

    assert!(matches!(
        fs.dir_add_entry(file, b"x", other),
        Err(CellError::NotDirectory)
    ));
    assert!(matches!(
        fs.dir_lookup(file, b"x"),
        Err(CellError::NotDirectory)
    ));
    assert!(matches!(fs.read_at(ROOT_INO, 0, &mut [0; 4]), Err(CellError::IsDirectory)));
    assert!(matches!(
        fs.write_at(ROOT_INO, 0, b"no"),
        Err(CellError::IsDirectory)
    ));
}

#[test]
fn nested_directories_work_end_to_end() {
    let fs = fresh_fs(1024, 64);
    let subdir = fs.create(FileKind::Directory, 0o755, 0, 0).unwrap();
    fs.dir_add_entry(ROOT_INO, b"sub", subdir).unwrap();

    let file = create_file(&fs);
    fs.dir_add_entry(subdir, b"deep.txt", file).unwrap();
    fs.write_at(file, 0, b"payload").unwrap();

    let found_dir = fs.dir_lookup(ROOT_INO, b"sub").unwrap();
    let found_file = fs.dir_lookup(found_dir, b"deep.txt").unwrap();
    let mut buf = [0_u8; 7];
    fs.read_at(found_file, 0, &mut buf).unwrap();
    assert_eq!(&buf, b"payload");
}

// ── Concurrency smoke test ──────────────────────────────────────────────────

#[test]
fn concurrent_writers_and_readers_stay_consistent() {
    let fs = Arc::new(fresh_fs(1024, 64));

    let files: Vec<InodeNumber> = (0..4).map(|_| create_file(&fs)).collect();
    let mut handles = Vec::new();
    for (t, ino) in files.iter().copied().enumerate() {
        let fs = Arc::clone(&fs);
        handles.push(std::thread::spawn(move || {
            let fill = u8::try_from(t + 1).unwrap();
            for round in 0..10_u64 {
                fs.write_at(ino, round * 1000, &[fill; 1000]).unwrap();
                let mut buf = [0_u8; 500];
                let read = fs.read_at(ino, round * 1000, &mut buf).unwrap();
                assert_eq!(read, 500);
                assert!(buf.iter().all(|b| *b == fill));
            }
        }));
    }
    for handle in handles {
        handle.join().unwrap();
    }

    for (t, ino) in files.iter().copied().enumerate() {
        let fill = u8::try_from(t + 1).unwrap();
        let mut buf = vec![0_u8; 10000];
        assert_eq!(fs.read_at(ino, 0, &mut buf).unwrap(), 10000);
        assert!(buf.iter().all(|b| *b == fill), "file {t} intact");
    }
}

// ── File-backed device round trip ───────────────────────────────────────────

#[test]
fn file_backed_image_round_trips_across_processes() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("cell.img");

    {
        let dev = FileBlockDevice::create(&path, 256).unwrap();
        CellFs::format(&dev, 32).unwrap();
        let fs = CellFs::mount(Arc::new(dev)).unwrap();
        let ino = fs.create(FileKind::Regular, 0o644, 1000, 1000).unwrap();
        fs.dir_add_entry(ROOT_INO, b"persisted", ino).unwrap();
        fs.write_at(ino, 0, b"still here after reopen").unwrap();
        fs.unmount().unwrap();
    }

    let dev = FileBlockDevice::open(&path).unwrap();
    let fs = CellFs::mount(Arc::new(dev)).unwrap();
    let ino = fs.dir_lookup(ROOT_INO, b"persisted").unwrap();
    let mut buf = vec![0_u8; 64];
    let read = fs.read_at(ino, 0, &mut buf).unwrap();
    assert_eq!(&buf[..read], b"still here after reopen");
    let attr = fs.stat(ino).unwrap();
    assert_eq!(attr.uid, 1000);
}
