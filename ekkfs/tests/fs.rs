mod common;

use common::{
    INODES, LBA, RamDisk, TOTAL, capture_warnings, clock, pattern, remount, setup, warnings,
};
use ekkfs::layout::{ENTRY_COUNT, HEADER_SIZE, InodeFlag, SuperBlock};
use ekkfs::{BLOCK_SIZE, BlockDevice, DataBlock, Error, Filesystem, MAX_FILE_SIZE, crc32};
use enumflags2::BitFlags;

fn write_file(fs: &mut Filesystem<RamDisk>, name: &str, data: &[u8]) -> usize {
    fs.create(name, 1, BitFlags::empty()).unwrap();
    let mut file = fs.open(name).unwrap();
    fs.write(&mut file, data, 1).unwrap()
}

fn read_file(fs: &mut Filesystem<RamDisk>, name: &str) -> Vec<u8> {
    let mut file = fs.open(name).unwrap();
    let mut buf = vec![0; fs.stat(name).unwrap().size as usize + 16];
    let len = fs.read(&mut file, &mut buf).unwrap();
    buf.truncate(len);
    buf
}

#[test]
fn crc_known_vector() {
    assert_eq!(0xCBF4_3926, crc32(b"123456789"));
    assert_eq!(0, crc32(b""));
}

#[test]
fn format_mount_statfs() {
    let disk = RamDisk::new(2048 + 10000);
    let mut fs = Filesystem::new(disk.clone(), clock);
    fs.format(2048, 10000, 64).unwrap();
    assert!(!fs.is_mounted());

    fs.mount(2048).unwrap();
    let sb = fs.superblock();
    assert_eq!(16, { sb.data_start });
    assert_eq!(1, { sb.mount_count });
    assert!(sb.is_valid());

    let statfs = fs.statfs().unwrap();
    assert_eq!(10000, statfs.total_blocks);
    assert_eq!(9984, statfs.free_blocks);
    assert_eq!(64, statfs.total_inodes);
    assert_eq!(0, statfs.used_inodes);

    fs.unmount().unwrap();
    assert_eq!(Err(Error::NotMounted), fs.statfs());
    fs.mount(2048).unwrap();
    assert_eq!(2, { fs.superblock().mount_count });
    assert_eq!(9984, fs.statfs().unwrap().free_blocks);
}

#[test]
fn format_rejects_bad_layout() {
    let disk = RamDisk::new(16);
    let mut fs = Filesystem::new(disk, clock);
    assert_eq!(Err(Error::Invalid), fs.format(0, 8, 64));
    assert_eq!(Err(Error::Invalid), fs.format(0, 1024, 0));
    // 65 个位图块
    assert_eq!(Err(Error::Invalid), fs.format(0, 64 * 4096 + 64, 64));
}

#[test]
fn format_large_partition() {
    // 64 MiB 镜像去掉前 2048 块后需要 32 个位图块
    let total = 64 * 2048 - 2048;
    let disk = RamDisk::new(total as usize);
    let mut fs = Filesystem::new(disk.clone(), clock);
    fs.format(0, total, 256).unwrap();
    fs.mount(0).unwrap();

    let sb = fs.superblock();
    assert_eq!(32, sb.bitmap_blocks());
    let free = fs.statfs().unwrap().free_blocks;
    assert_eq!(sb.data_blocks(), free);

    let data = pattern(2 * BLOCK_SIZE);
    write_file(&mut fs, "big-disk", &data);
    assert_eq!(free - 2, fs.statfs().unwrap().free_blocks);
    fs.unmount().unwrap();

    let mut fs = Filesystem::new(disk, clock);
    fs.mount(0).unwrap();
    assert_eq!(free - 2, fs.statfs().unwrap().free_blocks);
    assert_eq!(data, read_file(&mut fs, "big-disk"));
}

/// 改写超级块的某些字段并重新计算 CRC，模拟布局异常但校验和正确的镜像
fn restamp(disk: &RamDisk, sb: &SuperBlock, edit: impl FnOnce(&mut SuperBlock)) {
    let mut sb = *sb;
    edit(&mut sb);
    sb.stamp();
    let mut block = DataBlock::zeroed();
    *block.get_mut::<SuperBlock>(0) = sb;
    disk.write_block(LBA as usize, &block[..]).unwrap();
}

#[test]
fn mount_rejects_bad_layout() {
    let (disk, mut fs) = setup();
    let sb = fs.superblock();
    fs.unmount().unwrap();
    drop(fs);

    let shrink_journal = |sb: &mut SuperBlock| sb.data_start = sb.journal_start + 2;
    let huge_bitmap = |sb: &mut SuperBlock| {
        sb.journal_start = sb.bitmap_start + 65;
        sb.data_start = sb.journal_start + 4;
        sb.total_blocks = sb.data_start + 100;
        sb.free_blocks = 100;
    };
    let short_bitmap = |sb: &mut SuperBlock| sb.total_blocks = sb.data_start + 5000;
    let inodes_overflow = |sb: &mut SuperBlock| sb.inode_count = 1000;
    let edits: [&dyn Fn(&mut SuperBlock); 4] =
        [&shrink_journal, &huge_bitmap, &short_bitmap, &inodes_overflow];

    for edit in edits {
        restamp(&disk, &sb, edit);
        let mut fs = Filesystem::new(disk.clone(), clock);
        assert_eq!(Err(Error::Corrupt), fs.mount(LBA));
    }

    // 原样写回后可以挂载
    restamp(&disk, &sb, |_| {});
    remount(&disk);
}

#[test]
fn operations_need_mount() {
    let disk = RamDisk::new((LBA + TOTAL) as usize);
    let mut fs = Filesystem::new(disk, clock);
    assert_eq!(Err(Error::NotMounted), fs.create("a", 0, BitFlags::empty()));
    assert_eq!(Err(Error::NotMounted), fs.open("a"));
    assert_eq!(Err(Error::NotMounted), fs.sync());
    assert_eq!(Err(Error::NotMounted), fs.tx_begin());
}

#[test]
fn create_validates_names() {
    let (_disk, mut fs) = setup();
    assert!(fs.create("fifteen-bytes-x", 0, BitFlags::empty()).is_ok());
    assert_eq!(
        Err(Error::NameTooLong),
        fs.create("sixteen-bytes-xx", 0, BitFlags::empty())
    );
    assert_eq!(Err(Error::Invalid), fs.create("", 0, BitFlags::empty()));
    assert_eq!(Err(Error::Invalid), fs.create("a\0b", 0, BitFlags::empty()));
    assert_eq!(
        Err(Error::Exists),
        fs.create("fifteen-bytes-x", 3, BitFlags::empty())
    );

    let stat = fs.stat("fifteen-bytes-x").unwrap();
    assert_eq!("fifteen-bytes-x", stat.name.as_str());
    assert_eq!(0, stat.size);
    assert!(stat.flags.contains(InodeFlag::Used));
}

#[test]
fn inode_exhaustion() {
    let disk = RamDisk::new(256);
    let mut fs = Filesystem::new(disk, clock);
    fs.format(0, 256, 8).unwrap();
    fs.mount(0).unwrap();
    for i in 0..8 {
        fs.create(&format!("f{i}"), 1, BitFlags::empty()).unwrap();
    }
    assert_eq!(Err(Error::NoInodes), fs.create("f8", 1, BitFlags::empty()));

    fs.delete("f3", 1).unwrap();
    assert_eq!(Ok(3), fs.create("f8", 1, BitFlags::empty()));
}

#[test]
fn write_then_read() {
    let (_disk, mut fs) = setup();
    let data = b"Hello, EKKFS!";
    assert_eq!(data.len(), write_file(&mut fs, "hello", data));
    assert_eq!(data.to_vec(), read_file(&mut fs, "hello"));
    assert_eq!(data.len() as u32, fs.stat("hello").unwrap().size);

    // 读到末尾
    let mut file = fs.open("hello").unwrap();
    file.seek(data.len() as u32);
    assert_eq!(Ok(0), fs.read(&mut file, &mut [0; 8]));
    fs.close(file).unwrap();
}

#[test]
fn overwrite_in_place() {
    let (_disk, mut fs) = setup();
    write_file(&mut fs, "over", &pattern(1000));
    let free = fs.statfs().unwrap().free_blocks;

    let mut file = fs.open("over").unwrap();
    file.seek(500);
    fs.write(&mut file, &[0xAA; 20], 1).unwrap();

    let mut expected = pattern(1000);
    expected[500..520].fill(0xAA);
    assert_eq!(expected, read_file(&mut fs, "over"));
    assert_eq!(free, fs.statfs().unwrap().free_blocks);
}

#[test]
fn direct_to_indirect_boundary() {
    let (_disk, mut fs) = setup();
    let free = fs.statfs().unwrap().free_blocks;
    let data = pattern(4 * BLOCK_SIZE + 100);
    assert_eq!(data.len(), write_file(&mut fs, "large", &data));
    assert_eq!(data, read_file(&mut fs, "large"));

    let stat = fs.stat("large").unwrap();
    assert_eq!(5, stat.blocks);
    // 5 个数据块加 1 个间接块
    assert_eq!(free - 6, fs.statfs().unwrap().free_blocks);
}

#[test]
fn holes_read_zero() {
    let (_disk, mut fs) = setup();
    fs.create("sparse", 1, BitFlags::empty()).unwrap();
    let free = fs.statfs().unwrap().free_blocks;

    let mut file = fs.open("sparse").unwrap();
    file.seek(3000);
    fs.write(&mut file, b"0123456789", 1).unwrap();
    // 间接块与第 5 个逻辑块
    assert_eq!(free - 2, fs.statfs().unwrap().free_blocks);

    let content = read_file(&mut fs, "sparse");
    assert_eq!(3010, content.len());
    assert!(content[..3000].iter().all(|&b| b == 0));
    assert_eq!(b"0123456789", &content[3000..]);
    assert_eq!(free - 2, fs.statfs().unwrap().free_blocks);
}

#[test]
fn max_file_size() {
    let (_disk, mut fs) = setup();
    let data = pattern(MAX_FILE_SIZE as usize + 10);
    assert_eq!(MAX_FILE_SIZE as usize, write_file(&mut fs, "max", &data));
    assert_eq!(MAX_FILE_SIZE, fs.stat("max").unwrap().size);

    let mut file = fs.open("max").unwrap();
    file.seek(MAX_FILE_SIZE);
    assert_eq!(Err(Error::Invalid), fs.write(&mut file, b"x", 1));
    assert_eq!(data[..MAX_FILE_SIZE as usize], read_file(&mut fs, "max")[..]);
}

#[test]
fn full_disk_partial_write() {
    let disk = RamDisk::new(64);
    let mut fs = Filesystem::new(disk.clone(), clock);
    fs.format(0, 64, 8).unwrap();
    fs.mount(0).unwrap();
    assert_eq!(57, fs.statfs().unwrap().free_blocks);

    // 56 个数据块加 1 个间接块
    let data = pattern(30000);
    assert_eq!(56 * BLOCK_SIZE, write_file(&mut fs, "big", &data));
    assert_eq!(0, fs.statfs().unwrap().free_blocks);
    assert_eq!((56 * BLOCK_SIZE) as u32, fs.stat("big").unwrap().size);

    fs.create("small", 1, BitFlags::empty()).unwrap();
    let mut file = fs.open("small").unwrap();
    assert_eq!(Err(Error::Full), fs.write(&mut file, b"x", 1));

    fs.unmount().unwrap();
    fs.mount(0).unwrap();
    assert_eq!(0, fs.statfs().unwrap().free_blocks);
    assert_eq!(data[..56 * BLOCK_SIZE], read_file(&mut fs, "big")[..]);

    fs.delete("big", 1).unwrap();
    assert_eq!(57, fs.statfs().unwrap().free_blocks);
}

#[test]
fn permissions() {
    let (_disk, mut fs) = setup();
    fs.create("mine", 5, BitFlags::empty()).unwrap();
    fs.create("sys", 5, InodeFlag::System.into()).unwrap();

    let mut file = fs.open("mine").unwrap();
    assert_eq!(Err(Error::Permission), fs.write(&mut file, b"x", 6));
    assert_eq!(Ok(1), fs.write(&mut file, b"x", 5));
    assert_eq!(Ok(1), fs.write(&mut file, b"y", 0));

    assert_eq!(Err(Error::Permission), fs.delete("mine", 6));
    fs.delete("mine", 5).unwrap();
    assert_eq!(Err(Error::NotFound), fs.stat("mine"));

    assert_eq!(Err(Error::Permission), fs.delete("sys", 5));
    fs.delete("sys", 0).unwrap();
    assert_eq!(Err(Error::NotFound), fs.delete("sys", 0));
}

#[test]
fn rename_keeps_contents() {
    let (disk, mut fs) = setup();
    write_file(&mut fs, "old.txt", b"payload");
    write_file(&mut fs, "taken", b"");

    assert_eq!(Err(Error::Exists), fs.rename("old.txt", "taken", 1));
    assert_eq!(Err(Error::Permission), fs.rename("old.txt", "new.txt", 2));
    assert_eq!(Err(Error::NameTooLong), fs.rename("old.txt", "sixteen-bytes-xx", 1));
    assert_eq!(Err(Error::NotFound), fs.rename("nope", "new.txt", 1));

    let inode = fs.stat("old.txt").unwrap().inode;
    fs.rename("old.txt", "new.txt", 1).unwrap();
    assert_eq!(Err(Error::NotFound), fs.stat("old.txt"));

    let mut fs = remount(&disk);
    let stat = fs.stat("new.txt").unwrap();
    assert_eq!(inode, stat.inode);
    assert_eq!(b"payload".to_vec(), read_file(&mut fs, "new.txt"));
}

#[test]
fn delete_releases_blocks() {
    let (_disk, mut fs) = setup();
    let free = fs.statfs().unwrap().free_blocks;
    write_file(&mut fs, "temp", &pattern(20 * BLOCK_SIZE));
    assert!(fs.statfs().unwrap().free_blocks < free);

    fs.delete("temp", 1).unwrap();
    assert_eq!(free, fs.statfs().unwrap().free_blocks);
    assert_eq!(Err(Error::NotFound), fs.open("temp"));
}

#[test]
fn stale_handle() {
    let (_disk, mut fs) = setup();
    write_file(&mut fs, "gone", b"abc");
    let mut file = fs.open("gone").unwrap();
    fs.delete("gone", 1).unwrap();
    assert_eq!(Err(Error::NotFound), fs.read(&mut file, &mut [0; 4]));
    assert_eq!(Err(Error::NotFound), fs.write(&mut file, b"d", 1));
}

#[test]
fn many_files() {
    let (_disk, mut fs) = setup();
    for i in 0..50 {
        let name = format!("file{i:02}");
        write_file(&mut fs, &name, name.as_bytes());
    }
    fs.delete("file07", 1).unwrap();

    let mut names = Vec::new();
    let count = fs.list(|entry| names.push(entry.name.to_string())).unwrap();
    assert_eq!(49, count);
    assert!(!names.iter().any(|name| name == "file07"));
    assert_eq!(49, fs.statfs().unwrap().used_inodes);

    for name in &names {
        assert_eq!(name.as_bytes(), read_file(&mut fs, name));
    }

    let entry = fs.entry_at(7).unwrap().unwrap();
    assert_eq!(8, entry.inode);
    assert_eq!("file08", entry.name.as_str());
    assert_eq!(None, fs.entry_at(50).unwrap());
}

#[test]
fn persists_across_mounts() {
    let (disk, mut fs) = setup();
    let data = pattern(3 * BLOCK_SIZE + 7);
    write_file(&mut fs, "persist", &data);
    let free = fs.statfs().unwrap().free_blocks;
    fs.unmount().unwrap();
    drop(fs);

    let mut fs = remount(&disk);
    assert_eq!(data, read_file(&mut fs, "persist"));
    assert_eq!(free, fs.statfs().unwrap().free_blocks);
}

#[test]
fn write_through_without_unmount() {
    let (disk, mut fs) = setup();
    write_file(&mut fs, "wt", b"durable");
    drop(fs);

    let mut fs = remount(&disk);
    assert_eq!(b"durable".to_vec(), read_file(&mut fs, "wt"));
}

#[test]
fn cache_hits() {
    let (_disk, mut fs) = setup();
    write_file(&mut fs, "cached", &pattern(100));

    let before = fs.cache_stats();
    for _ in 0..5 {
        assert_eq!(pattern(100), read_file(&mut fs, "cached"));
    }
    let after = fs.cache_stats();
    assert!(after.hits - before.hits >= 4);
    assert!(after.misses - before.misses <= 1);
}

#[test]
fn device_errors_surface() {
    let (disk, mut fs) = setup();
    fs.create("f", 1, BitFlags::empty()).unwrap();
    let mut file = fs.open("f").unwrap();

    disk.fail_writes(true);
    let err = fs.write(&mut file, b"data", 1).unwrap_err();
    assert!(matches!(err, Error::Io(_)));
    assert_eq!(-1, err.code());
    disk.fail_writes(false);
}

#[test]
fn transaction_errors() {
    let (_disk, mut fs) = setup();
    assert_eq!(Err(Error::Invalid), fs.tx_commit());
    assert_eq!(Err(Error::Invalid), fs.tx_abort());

    let seq = fs.tx_begin().unwrap();
    assert_eq!(Err(Error::Invalid), fs.tx_begin());
    let state = fs.journal_state();
    assert!(state.tx_active);
    assert_eq!(seq, state.tx_start_seq);

    fs.tx_commit().unwrap();
    let state = fs.journal_state();
    assert!(!state.tx_active);
    assert_eq!(seq + 1, state.sequence);
}

#[test]
fn committed_transaction_survives_crash() {
    let (disk, mut fs) = setup();
    fs.tx_begin().unwrap();
    let data = pattern(700);
    write_file(&mut fs, "log", &data);
    fs.tx_commit().unwrap();
    drop(fs);

    let mut fs = remount(&disk);
    assert!(!fs.journal_state().tx_active);
    assert_eq!(data, read_file(&mut fs, "log"));
}

#[test]
fn uncommitted_transaction_rolled_back() {
    let (disk, mut fs) = setup();
    write_file(&mut fs, "keep", b"kept");
    let free = fs.statfs().unwrap().free_blocks;

    fs.tx_begin().unwrap();
    write_file(&mut fs, "tmp", &pattern(3000));
    assert!(fs.statfs().unwrap().free_blocks < free);
    drop(fs);

    let mut fs = remount(&disk);
    let state = fs.journal_state();
    assert!(!state.tx_active);
    assert!(state.head < ENTRY_COUNT as u32 && state.tail < ENTRY_COUNT as u32);
    assert_eq!(Err(Error::NotFound), fs.stat("tmp"));
    assert_eq!(free, fs.statfs().unwrap().free_blocks);
    assert_eq!(b"kept".to_vec(), read_file(&mut fs, "keep"));

    // 回收的块可以再次分配
    let data = pattern(3000);
    write_file(&mut fs, "again", &data);
    assert_eq!(data, read_file(&mut fs, "again"));
}

#[test]
fn rollback_scrubs_appended_blocks() {
    let (disk, mut fs) = setup();
    let head = pattern(2 * BLOCK_SIZE);
    write_file(&mut fs, "grow", &head);
    let free = fs.statfs().unwrap().free_blocks;

    fs.tx_begin().unwrap();
    let mut file = fs.open("grow").unwrap();
    file.seek(head.len() as u32);
    fs.write(&mut file, &pattern(4 * BLOCK_SIZE), 1).unwrap();
    drop(fs);

    let mut fs = remount(&disk);
    assert_eq!(free, fs.statfs().unwrap().free_blocks);
    // 大小不回滚，新追加的部分成为空洞
    let content = read_file(&mut fs, "grow");
    assert_eq!(head, content[..head.len()]);
    assert!(content[head.len()..].iter().all(|&b| b == 0));
}

#[test]
fn rollback_recounts_free_blocks() {
    capture_warnings();
    let (disk, mut fs) = setup();
    write_file(&mut fs, "keep", &pattern(BLOCK_SIZE));
    let free = fs.statfs().unwrap().free_blocks;

    fs.tx_begin().unwrap();
    write_file(&mut fs, "tmp", &pattern(6 * BLOCK_SIZE));
    drop(fs);

    let fs = remount(&disk);
    assert_eq!(free, { fs.superblock().free_blocks });
    assert!(
        !warnings().iter().any(|line| line.contains("disagrees with bitmap")),
        "{:?}",
        warnings()
    );
}

#[test]
fn abort_undoes_transaction() {
    let (_disk, mut fs) = setup();
    let free = fs.statfs().unwrap().free_blocks;
    let seq = fs.tx_begin().unwrap();
    write_file(&mut fs, "aborted", &pattern(1000));
    fs.tx_abort().unwrap();

    assert_eq!(Err(Error::NotFound), fs.stat("aborted"));
    assert_eq!(free, fs.statfs().unwrap().free_blocks);
    let state = fs.journal_state();
    assert!(!state.tx_active);
    assert_eq!(seq + 1, state.sequence);
}

#[test]
fn journal_overflow_keeps_ring_valid() {
    let (disk, mut fs) = setup();
    fs.tx_begin().unwrap();
    let data = pattern(70 * BLOCK_SIZE);
    write_file(&mut fs, "huge", &data);
    fs.tx_commit().unwrap();

    let state = fs.journal_state();
    assert!(state.head < ENTRY_COUNT as u32 && state.tail < ENTRY_COUNT as u32);
    assert_eq!((state.head + 1) % ENTRY_COUNT as u32, state.tail);
    drop(fs);

    let mut fs = remount(&disk);
    assert_eq!(data, read_file(&mut fs, "huge"));
}

#[test]
fn corrupt_journal_header_reinitialized() {
    let (disk, mut fs) = setup();
    let journal_start = fs.superblock().journal_start;
    fs.unmount().unwrap();
    drop(fs);

    disk.flip((LBA + journal_start) as usize, 4);
    let fs = remount(&disk);
    let state = fs.journal_state();
    assert_eq!((0, 0, 1), (state.head, state.tail, state.sequence));
    assert!(!state.tx_active);
}

#[test]
fn journal_reinit_clears_first_block_entries() {
    let (disk, mut fs) = setup();
    let journal_start = fs.superblock().journal_start;
    fs.tx_begin().unwrap();
    write_file(&mut fs, "logged", &pattern(3 * BLOCK_SIZE));
    fs.tx_commit().unwrap();
    fs.unmount().unwrap();
    drop(fs);

    let lba = (LBA + journal_start) as usize;
    assert!(disk.block(lba)[HEADER_SIZE..].iter().any(|&b| b != 0));

    disk.flip(lba, 4);
    let fs = remount(&disk);
    assert_eq!(0, fs.journal_state().head);
    assert!(disk.block(lba)[HEADER_SIZE..].iter().all(|&b| b == 0));
    for block in 1..4 {
        assert!(disk.block(lba + block).iter().all(|&b| b == 0));
    }
}

#[test]
fn unmount_leaves_device_consistent() {
    let (disk, mut fs) = setup();
    write_file(&mut fs, "a", b"1");
    fs.unmount().unwrap();
    let sb_block = disk.block(LBA as usize);
    assert_eq!(b"SFKE", &sb_block[..4]);
    assert!(fs.into_device().block(LBA as usize) == sb_block);
}
