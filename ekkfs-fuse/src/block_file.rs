use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};
use std::sync::{Mutex, MutexGuard};

use block_dev::{BLOCK_SIZE, BlockDevice, DevError};

/// 把宿主机上的镜像文件当作块设备
#[derive(Debug)]
pub struct BlockFile {
    inner: Mutex<File>,
}

impl BlockFile {
    pub fn new(fd: File) -> Self {
        Self {
            inner: Mutex::new(fd),
        }
    }

    pub fn into_inner(self) -> File {
        self.inner.into_inner().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// 定位到 `block_id` 块的开头
    fn seek_to(&self, block_id: usize) -> Result<MutexGuard<'_, File>, DevError> {
        let mut file = self.inner.lock().map_err(|_| DevError::NotReady)?;
        file.seek(SeekFrom::Start((block_id * BLOCK_SIZE) as u64))
            .map_err(|err| {
                log::error!("seek to block {block_id}: {err}");
                DevError::Command
            })?;
        Ok(file)
    }
}

impl BlockDevice for BlockFile {
    fn read_block(&self, block_id: usize, buf: &mut [u8]) -> Result<(), DevError> {
        self.read_blocks(block_id, &mut buf[..BLOCK_SIZE])
    }

    fn write_block(&self, block_id: usize, buf: &[u8]) -> Result<(), DevError> {
        self.write_blocks(block_id, &buf[..BLOCK_SIZE])
    }

    fn read_blocks(&self, start: usize, buf: &mut [u8]) -> Result<(), DevError> {
        self.seek_to(start)?.read_exact(buf).map_err(|err| {
            log::error!("read {} blocks at {start}: {err}", buf.len() / BLOCK_SIZE);
            DevError::Data
        })
    }

    fn write_blocks(&self, start: usize, buf: &[u8]) -> Result<(), DevError> {
        self.seek_to(start)?.write_all(buf).map_err(|err| {
            log::error!("write {} blocks at {start}: {err}", buf.len() / BLOCK_SIZE);
            DevError::Data
        })
    }
}
