#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Once};
use std::thread::{self, ThreadId};

use ekkfs::{BLOCK_SIZE, BlockDevice, DevError, Filesystem};
use log::{Level, LevelFilter, Log, Metadata, Record};

/// 内存中的块设备，克隆体共享同一份数据，用来模拟断电后重新挂载
#[derive(Clone)]
pub struct RamDisk {
    data: Arc<Mutex<Vec<u8>>>,
    fail_writes: Arc<AtomicBool>,
}

impl RamDisk {
    pub fn new(blocks: usize) -> Self {
        Self {
            data: Arc::new(Mutex::new(vec![0; blocks * BLOCK_SIZE])),
            fail_writes: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    pub fn block(&self, lba: usize) -> Vec<u8> {
        let data = self.data.lock().unwrap();
        data[lba * BLOCK_SIZE..(lba + 1) * BLOCK_SIZE].to_vec()
    }

    pub fn flip(&self, lba: usize, offset: usize) {
        let mut data = self.data.lock().unwrap();
        data[lba * BLOCK_SIZE + offset] ^= 0xFF;
    }
}

impl BlockDevice for RamDisk {
    fn read_block(&self, block_id: usize, buf: &mut [u8]) -> Result<(), DevError> {
        let data = self.data.lock().unwrap();
        let range = block_id * BLOCK_SIZE..(block_id + 1) * BLOCK_SIZE;
        let src = data.get(range).ok_or(DevError::Data)?;
        buf.copy_from_slice(src);
        Ok(())
    }

    fn write_block(&self, block_id: usize, buf: &[u8]) -> Result<(), DevError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(DevError::Data);
        }
        let mut data = self.data.lock().unwrap();
        let range = block_id * BLOCK_SIZE..(block_id + 1) * BLOCK_SIZE;
        let dst = data.get_mut(range).ok_or(DevError::Data)?;
        dst.copy_from_slice(buf);
        Ok(())
    }
}

pub fn clock() -> u64 {
    static NOW: AtomicU64 = AtomicU64::new(1_000_000);
    NOW.fetch_add(1_000, Ordering::Relaxed)
}

pub const LBA: u32 = 64;
pub const TOTAL: u32 = 1024;
pub const INODES: u32 = 64;

/// 格式化并挂载一个小分区
pub fn setup() -> (RamDisk, Filesystem<RamDisk>) {
    let disk = RamDisk::new((LBA + TOTAL) as usize);
    let mut fs = Filesystem::new(disk.clone(), clock);
    fs.format(LBA, TOTAL, INODES).unwrap();
    fs.mount(LBA).unwrap();
    (disk, fs)
}

/// 丢弃旧实例（不卸载）后在同一块盘上重新挂载
pub fn remount(disk: &RamDisk) -> Filesystem<RamDisk> {
    let mut fs = Filesystem::new(disk.clone(), clock);
    fs.mount(LBA).unwrap();
    fs
}

pub fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 7 + i / 251) as u8).collect()
}

/// 记下 warn 及以上的日志，按线程区分，测试并行时互不干扰
struct Capture;

static WARNINGS: Mutex<Vec<(ThreadId, String)>> = Mutex::new(Vec::new());

impl Log for Capture {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= Level::Warn
    }

    fn log(&self, record: &Record) {
        if self.enabled(record.metadata()) {
            let line = record.args().to_string();
            WARNINGS.lock().unwrap().push((thread::current().id(), line));
        }
    }

    fn flush(&self) {}
}

pub fn capture_warnings() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        log::set_logger(&Capture).unwrap();
        log::set_max_level(LevelFilter::Warn);
    });
}

/// 当前线程至今记下的告警
pub fn warnings() -> Vec<String> {
    let id = thread::current().id();
    WARNINGS
        .lock()
        .unwrap()
        .iter()
        .filter(|(thread, _)| *thread == id)
        .map(|(_, line)| line.clone())
        .collect()
}
