//! 各模块测试共用的内存盘与辅助函数

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use block_dev::mbr::{self, PARTITION_COUNT, Partition};
use block_dev::{BLOCK_SIZE, BlockDevice, DevError};
use ekkfs::Filesystem;
use enumflags2::BitFlags;

/// 克隆体共享同一份数据
#[derive(Clone)]
pub struct RamDisk(Arc<Mutex<Vec<u8>>>);

impl RamDisk {
    pub fn new(blocks: usize) -> Self {
        Self(Arc::new(Mutex::new(vec![0; blocks * BLOCK_SIZE])))
    }
}

impl BlockDevice for RamDisk {
    fn read_block(&self, block_id: usize, buf: &mut [u8]) -> Result<(), DevError> {
        let data = self.0.lock().unwrap();
        let src = data
            .get(block_id * BLOCK_SIZE..(block_id + 1) * BLOCK_SIZE)
            .ok_or(DevError::Data)?;
        buf.copy_from_slice(src);
        Ok(())
    }

    fn write_block(&self, block_id: usize, buf: &[u8]) -> Result<(), DevError> {
        let mut data = self.0.lock().unwrap();
        let dst = data
            .get_mut(block_id * BLOCK_SIZE..(block_id + 1) * BLOCK_SIZE)
            .ok_or(DevError::Data)?;
        dst.copy_from_slice(buf);
        Ok(())
    }
}

pub fn clock() -> u64 {
    static NOW: AtomicU64 = AtomicU64::new(5_000_000);
    NOW.fetch_add(250, Ordering::Relaxed)
}

const LBA: u32 = 16;
const TOTAL: u32 = 512;
const INODES: u32 = 32;

/// 格式化并挂载的小文件系统
pub fn mounted() -> (RamDisk, Filesystem<RamDisk>) {
    let disk = RamDisk::new((LBA + TOTAL) as usize);
    let mut fs = Filesystem::new(disk.clone(), clock);
    fs.format(LBA, TOTAL, INODES).unwrap();
    fs.mount(LBA).unwrap();
    (disk, fs)
}

pub fn remount(disk: &RamDisk) -> Filesystem<RamDisk> {
    let mut fs = Filesystem::new(disk.clone(), clock);
    fs.mount(LBA).unwrap();
    fs
}

/// 只写了分区表的空盘，大小刚好容纳所有分区
pub fn partitioned(parts: &[Partition; PARTITION_COUNT]) -> RamDisk {
    let blocks = parts
        .iter()
        .map(|p| (p.lba_start + p.sector_count) as usize)
        .max()
        .unwrap_or(0)
        .max(1);
    let disk = RamDisk::new(blocks);
    mbr::write_partitions(&disk, parts).unwrap();
    disk
}

pub fn write_file(fs: &mut Filesystem<RamDisk>, name: &str, data: &[u8]) {
    fs.create(name, 0, BitFlags::empty()).unwrap();
    let mut file = fs.open(name).unwrap();
    assert_eq!(data.len(), fs.write(&mut file, data, 0).unwrap());
}

pub fn read_file(fs: &mut Filesystem<RamDisk>, name: &str) -> Vec<u8> {
    let mut file = fs.open(name).unwrap();
    let mut data = Vec::new();
    let mut chunk = [0; BLOCK_SIZE];
    loop {
        match fs.read(&mut file, &mut chunk).unwrap() {
            0 => break data,
            n => data.extend_from_slice(&chunk[..n]),
        }
    }
}
