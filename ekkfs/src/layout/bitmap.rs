//! 空闲块位图
//!
//! 每个数据块一位，1 表示已分配。挂载时整体读入内存，同步时写回。
//! 第 `i` 位对应数据块 `data_start + i`，元数据块一律视为已分配。

use block_dev::BlockDevice;

use super::SuperBlock;
use crate::block_cache::BlockCache;
use crate::{BLOCK_BITS, BLOCK_SIZE, DataBlock, Error, Result};

/// 支持的位图块数上限
pub const MAX_BITMAP_BLOCKS: usize = 64;

#[derive(Debug)]
pub struct Bitmap {
    bits: [u8; MAX_BITMAP_BLOCKS * BLOCK_SIZE],
    /// 位图的起始块
    start: u32,
    /// 位图占用块数
    blocks: u32,
    data_start: u32,
    total_blocks: u32,
}

impl Bitmap {
    pub const fn new() -> Self {
        Self {
            bits: [0; MAX_BITMAP_BLOCKS * BLOCK_SIZE],
            start: 0,
            blocks: 0,
            data_start: 0,
            total_blocks: 0,
        }
    }

    /// 按超级块设定几何参数并清空，位图放不进内存时返回 [`Error::Invalid`]
    pub fn configure(&mut self, sb: &SuperBlock) -> Result<()> {
        let blocks = sb.bitmap_blocks();
        if blocks as usize > MAX_BITMAP_BLOCKS
            || (blocks as usize) * BLOCK_BITS < sb.data_blocks() as usize
        {
            return Err(Error::Invalid);
        }

        self.bits.fill(0);
        self.start = sb.bitmap_start;
        self.blocks = blocks;
        self.data_start = sb.data_start;
        self.total_blocks = sb.total_blocks;
        Ok(())
    }

    pub fn load<D: BlockDevice>(&mut self, cache: &mut BlockCache<D>) -> Result<()> {
        let start = self.start;
        let mut block = DataBlock::zeroed();
        for (i, chunk) in self.in_use_chunks_mut().enumerate() {
            cache.read(start + i as u32, &mut block)?;
            chunk.copy_from_slice(&block[..]);
        }
        Ok(())
    }

    pub fn save<D: BlockDevice>(&self, cache: &mut BlockCache<D>) -> Result<()> {
        for i in 0..self.blocks {
            self.store(cache, i)?;
        }
        Ok(())
    }

    /// 只写回包含 `block` 这一位的那个位图块
    pub fn save_bit<D: BlockDevice>(&self, cache: &mut BlockCache<D>, block: u32) -> Result<()> {
        match self.position(block) {
            Some((byte, _)) => self.store(cache, (byte / BLOCK_SIZE) as u32),
            None => Ok(()),
        }
    }

    /// 元数据块与越界块返回 `true`
    pub fn get(&self, block: u32) -> bool {
        match self.position(block) {
            Some((byte, bit)) => self.bits[byte] & (1 << bit) != 0,
            None => true,
        }
    }

    /// 元数据块与越界块被忽略
    pub fn set(&mut self, block: u32, used: bool) {
        if let Some((byte, bit)) = self.position(block) {
            if used {
                self.bits[byte] |= 1 << bit;
            } else {
                self.bits[byte] &= !(1 << bit);
            }
        }
    }

    /// 分配编号最小的空闲数据块
    pub fn alloc(&mut self) -> Option<u32> {
        let data_blocks = self.data_blocks();
        let (byte, bit) = self.bits[..data_blocks.div_ceil(8)]
            .iter()
            .enumerate()
            .find_map(|(byte, &bits)| (bits != 0xFF).then_some((byte, bits.trailing_ones())))?;

        // 最后一个字节可能有不对应数据块的高位
        if byte * 8 + bit as usize >= data_blocks {
            return None;
        }

        self.bits[byte] |= 1 << bit;
        Some(self.data_start + (byte * 8) as u32 + bit)
    }

    /// 返回是否真的清除了一位
    pub fn free(&mut self, block: u32) -> bool {
        let was_used = self.position(block).is_some() && self.get(block);
        self.set(block, false);
        was_used
    }

    /// 已分配的数据块数
    pub fn count_used(&self) -> u32 {
        let data_blocks = self.data_blocks();
        let full = data_blocks / 8;
        let whole: u32 = self.bits[..full].iter().map(|b| b.count_ones()).sum();
        let rest = match data_blocks % 8 {
            0 => 0,
            tail => (self.bits[full] & ((1u8 << tail) - 1)).count_ones(),
        };
        whole + rest
    }

    #[inline]
    fn data_blocks(&self) -> usize {
        (self.total_blocks - self.data_start) as usize
    }

    /// 数据块对应的（字节下标, 位下标）
    fn position(&self, block: u32) -> Option<(usize, u32)> {
        (self.data_start..self.total_blocks)
            .contains(&block)
            .then(|| {
                let index = (block - self.data_start) as usize;
                (index / 8, index as u32 % 8)
            })
    }

    fn in_use_chunks_mut(&mut self) -> impl Iterator<Item = &mut [u8]> {
        self.bits[..self.blocks as usize * BLOCK_SIZE].chunks_exact_mut(BLOCK_SIZE)
    }

    fn store<D: BlockDevice>(&self, cache: &mut BlockCache<D>, index: u32) -> Result<()> {
        let offset = index as usize * BLOCK_SIZE;
        let mut block = DataBlock::zeroed();
        block.copy_from_slice(&self.bits[offset..offset + BLOCK_SIZE]);
        cache.write(self.start + index, &block)?;
        Ok(())
    }
}

impl Default for Bitmap {
    fn default() -> Self {
        Self::new()
    }
}
