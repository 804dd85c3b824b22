use core::mem;

use super::Plain;
use super::bytes_of;
use super::{INODES_PER_BLOCK, MAX_BITMAP_BLOCKS};
use crate::crc32;
use crate::{BLOCK_BITS, BLOCK_SIZE, JOURNAL_BLOCKS, MAGIC, VERSION};

/// 超级块：
/// - 提供文件系统合法性校验；
/// - 定位其它连续区域；
/// - 记录空闲块数与挂载信息
#[derive(Debug, Clone, Copy)]
#[repr(C, packed)]
pub struct SuperBlock {
    /// 魔数："EKFS"
    pub magic: u32,
    pub version: u32,
    pub block_size: u32,
    /// 分区占据块数
    pub total_blocks: u32,
    pub inode_count: u32,
    pub inode_start: u32,
    pub bitmap_start: u32,
    pub journal_start: u32,
    pub data_start: u32,
    pub free_blocks: u32,
    /// 上次挂载时间（微秒）
    pub mount_time: u64,
    pub mount_count: u32,
    /// 此前所有字段的 CRC32
    pub crc32: u32,
    _reserved: [u8; 456],
}

unsafe impl Plain for SuperBlock {}

const _: () = assert!(mem::size_of::<SuperBlock>() == BLOCK_SIZE);

impl SuperBlock {
    pub const fn zeroed() -> Self {
        Self {
            magic: 0,
            version: 0,
            block_size: 0,
            total_blocks: 0,
            inode_count: 0,
            inode_start: 0,
            bitmap_start: 0,
            journal_start: 0,
            data_start: 0,
            free_blocks: 0,
            mount_time: 0,
            mount_count: 0,
            crc32: 0,
            _reserved: [0; 456],
        }
    }

    pub fn init(
        &mut self,
        total_blocks: u32,
        inode_count: u32,
        inode_blocks: u32,
        bitmap_blocks: u32,
        journal_blocks: u32,
    ) {
        let inode_start = 1;
        let bitmap_start = inode_start + inode_blocks;
        let journal_start = bitmap_start + bitmap_blocks;
        let data_start = journal_start + journal_blocks;

        *self = Self {
            magic: MAGIC,
            version: VERSION,
            block_size: BLOCK_SIZE as u32,
            total_blocks,
            inode_count,
            inode_start,
            bitmap_start,
            journal_start,
            data_start,
            free_blocks: total_blocks - data_start,
            ..Self::zeroed()
        };
        self.stamp();
    }

    /// 重新计算 CRC
    pub fn stamp(&mut self) {
        self.crc32 = self.checksum();
    }

    pub fn checksum(&self) -> u32 {
        crc32(&bytes_of(self)[..mem::offset_of!(SuperBlock, crc32)])
    }

    /// 魔数、版本、块大小与 CRC 均正确
    pub fn is_valid(&self) -> bool {
        self.magic == MAGIC
            && self.version == VERSION
            && self.block_size == BLOCK_SIZE as u32
            && self.crc32 == self.checksum()
    }

    /// 各区域按序排列且都落在分区内；inode 表放得下 `inode_count` 个 inode，
    /// 位图不超过 [`MAX_BITMAP_BLOCKS`] 块且覆盖全部数据块，日志区恰为
    /// [`JOURNAL_BLOCKS`] 块
    pub fn is_layout_sane(&self) -> bool {
        let ordered = 0 < self.inode_start
            && self.inode_start < self.bitmap_start
            && self.bitmap_start < self.journal_start
            && self.journal_start < self.data_start
            && self.data_start < self.total_blocks;
        if !ordered {
            return false;
        }

        let inode_blocks = self.inode_count.div_ceil(INODES_PER_BLOCK as u32);
        let bitmap_blocks = self.bitmap_blocks() as usize;
        self.inode_count > 0
            && self.inode_start + inode_blocks <= self.bitmap_start
            && bitmap_blocks <= MAX_BITMAP_BLOCKS
            && bitmap_blocks * BLOCK_BITS >= self.data_blocks() as usize
            && self.journal_blocks() == JOURNAL_BLOCKS
            && self.free_blocks <= self.data_blocks()
    }

    #[inline]
    pub fn data_blocks(&self) -> u32 {
        self.total_blocks - self.data_start
    }

    #[inline]
    pub fn bitmap_blocks(&self) -> u32 {
        self.journal_start - self.bitmap_start
    }

    #[inline]
    pub fn journal_blocks(&self) -> u32 {
        self.data_start - self.journal_start
    }
}
