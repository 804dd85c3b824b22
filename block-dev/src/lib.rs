//! # 块设备接口层
//!
//! 块设备是以**块**为单位存储数据的设备，例如 SD 卡、eMMC、镜像文件等；
//! [`BlockDevice`] 就是对读写块设备的抽象，
//! 实现了此特质的类型称为**块设备驱动**。
//!
//! 块号一律为设备上的绝对 LBA，分区内的相对块号由上层换算。

#![cfg_attr(not(test), no_std)]

mod error;
pub mod mbr;

use core::any::Any;

pub use self::error::DevError;

/// 扇区大小，读写总以此为单位
pub const BLOCK_SIZE: usize = 512;

/// 块设备驱动特质
///
/// 所有操作都是同步的，本层不做重试。
pub trait BlockDevice: Send + Sync + Any {
    fn read_block(&self, block_id: usize, buf: &mut [u8]) -> Result<(), DevError>;

    fn write_block(&self, block_id: usize, buf: &[u8]) -> Result<(), DevError>;

    /// 连续读取 `buf.len() / BLOCK_SIZE` 个块
    fn read_blocks(&self, start: usize, buf: &mut [u8]) -> Result<(), DevError> {
        for (i, chunk) in buf.chunks_exact_mut(BLOCK_SIZE).enumerate() {
            self.read_block(start + i, chunk)?;
        }
        Ok(())
    }

    /// 连续写入 `buf.len() / BLOCK_SIZE` 个块
    fn write_blocks(&self, start: usize, buf: &[u8]) -> Result<(), DevError> {
        for (i, chunk) in buf.chunks_exact(BLOCK_SIZE).enumerate() {
            self.write_block(start + i, chunk)?;
        }
        Ok(())
    }
}
