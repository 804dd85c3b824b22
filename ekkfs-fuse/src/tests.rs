use std::fs;

use block_dev::BlockDevice;
use block_dev::mbr::{self, PART_TYPE_EKKFS};
use ekkfs::Filesystem;

use super::*;

const IMAGE_SIZE: u64 = 4 * 1024 * 1024;

fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 7 + i / 251) as u8).collect()
}

fn read_all(fs: &mut Filesystem<BlockFile>, name: &str) -> Vec<u8> {
    let mut file = fs.open(name).unwrap();
    let mut buf = vec![0; fs.stat(name).unwrap().size as usize];
    let mut read = 0;
    while read < buf.len() {
        let len = fs.read(&mut file, &mut buf[read..]).unwrap();
        assert_ne!(0, len);
        read += len;
    }
    buf
}

#[test]
fn pack_dir_and_read_back() {
    let src = tempfile::tempdir().unwrap();
    fs::write(src.path().join("hello.txt"), b"hello ekkfs").unwrap();
    fs::write(src.path().join("big.bin"), pattern(10_000)).unwrap();
    fs::write(src.path().join("much-too-long-name.txt"), b"skipped").unwrap();
    fs::create_dir(src.path().join("nested")).unwrap();

    let mut efs = create_image(tempfile::tempfile().unwrap(), IMAGE_SIZE, 64).unwrap();
    let packed = pack_dir(&mut efs, src.path()).unwrap();
    assert_eq!(vec!["big.bin", "hello.txt"], packed);
    let image = finish(efs).unwrap();

    let mut efs = open_image(image).unwrap();
    assert_eq!(b"hello ekkfs".to_vec(), read_all(&mut efs, "hello.txt"));
    assert_eq!(pattern(10_000), read_all(&mut efs, "big.bin"));

    let stat = efs.stat("big.bin").unwrap();
    assert_eq!(OWNER, stat.owner);
    assert_eq!(Err(ekkfs::Error::NotFound), efs.stat("nested"));
    assert_eq!(2, efs.statfs().unwrap().used_inodes);
}

#[test]
fn mbr_has_one_ekkfs_partition() {
    let efs = create_image(tempfile::tempfile().unwrap(), IMAGE_SIZE, 64).unwrap();
    let dev = BlockFile::new(finish(efs).unwrap());

    let parts = mbr::read_partitions(&dev).unwrap();
    assert_eq!(PART_TYPE_EKKFS, parts[0].kind);
    assert_eq!(PARTITION_START, parts[0].lba_start);
    assert_eq!(
        (IMAGE_SIZE / BLOCK_SIZE as u64) as u32 - PARTITION_START,
        parts[0].sector_count
    );
    assert!(parts[1..].iter().all(|p| !p.is_valid()));

    // 分区外的最后一块也能读到
    let mut buf = [0u8; BLOCK_SIZE];
    let last = (IMAGE_SIZE / BLOCK_SIZE as u64) as usize - 1;
    dev.read_block(last, &mut buf).unwrap();
}

#[test]
fn image_too_small() {
    let size = PARTITION_START as u64 * BLOCK_SIZE as u64;
    assert!(matches!(
        create_image(tempfile::tempfile().unwrap(), size, 64),
        Err(PackError::TooSmall(s)) if s == size
    ));
}

#[test]
fn default_size_image() {
    let size = DEFAULT_SIZE_MIB * 1024 * 1024;
    let mut efs = create_image(tempfile::tempfile().unwrap(), size, ekkfs::DEFAULT_INODES).unwrap();
    pack_file(&mut efs, "boot.cfg", b"core=3").unwrap();
    let statfs = efs.statfs().unwrap();
    assert_eq!(size / BLOCK_SIZE as u64 - PARTITION_START as u64, statfs.total_blocks as u64);
    assert_eq!(ekkfs::DEFAULT_INODES, statfs.total_inodes);

    let mut efs = open_image(finish(efs).unwrap()).unwrap();
    assert_eq!(b"core=3".to_vec(), read_all(&mut efs, "boot.cfg"));
}

#[test]
fn image_too_large() {
    let size = (PARTITION_START as u64 + MAX_PARTITION_BLOCKS + 1) * BLOCK_SIZE as u64;
    assert!(matches!(
        create_image(tempfile::tempfile().unwrap(), size, 64),
        Err(PackError::TooLarge(s)) if s == size
    ));
}

#[test]
fn pack_file_twice() {
    let mut efs = create_image(tempfile::tempfile().unwrap(), IMAGE_SIZE, 64).unwrap();
    pack_file(&mut efs, "boot.cfg", b"a=1").unwrap();
    assert!(matches!(
        pack_file(&mut efs, "boot.cfg", b"a=2"),
        Err(PackError::Fs(ekkfs::Error::Exists))
    ));
    assert_eq!(b"a=1".to_vec(), read_all(&mut efs, "boot.cfg"));
}

#[test]
fn read_past_end_of_image() {
    let dev = BlockFile::new(tempfile::tempfile().unwrap());
    let mut buf = [0u8; BLOCK_SIZE];
    assert_eq!(Err(DevError::Data), dev.read_block(3, &mut buf));
}
