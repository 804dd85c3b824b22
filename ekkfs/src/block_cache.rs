//! # 块缓存层
//!
//! 块设备读写速度一般慢于内存读写速度，因此我们在内存中开辟固定数量的缓冲槽，
//! 把最近访问的块留在内存里。缓存以分区内的相对块号为键，
//! 访问设备时加上分区起点换算成绝对 LBA。
//!
//! 写操作**直写**：先写设备，成功后缓存槽才记为干净。
//! 槽位用尽时踢走最久未访问的块。

use block_dev::{BlockDevice, DevError};

use crate::DataBlock;

/// 块缓存个数的上限
pub const CACHE_CAPACITY: usize = 16;

const EMPTY: u32 = u32::MAX;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u32,
    pub misses: u32,
}

/// 内存中的块缓存
#[derive(Debug, Clone, Copy)]
struct Slot {
    /// 对应的块号，[`EMPTY`] 表示空槽
    block: u32,
    /// 最近一次访问时的全局计数
    last_access: u32,
    /// 是否为脏块
    dirty: bool,
    /// 缓存的数据
    data: DataBlock,
}

impl Slot {
    const EMPTY: Self = Self {
        block: EMPTY,
        last_access: 0,
        dirty: false,
        data: DataBlock::zeroed(),
    };

    #[inline]
    fn is_empty(&self) -> bool {
        self.block == EMPTY
    }
}

/// 全相联块缓存，同时持有底层块设备
pub struct BlockCache<D> {
    dev: D,
    /// 分区起始 LBA
    start: u32,
    slots: [Slot; CACHE_CAPACITY],
    clock: u32,
    stats: CacheStats,
}

impl<D: BlockDevice> BlockCache<D> {
    pub fn new(dev: D) -> Self {
        Self {
            dev,
            start: 0,
            slots: [Slot::EMPTY; CACHE_CAPACITY],
            clock: 0,
            stats: CacheStats::default(),
        }
    }

    #[inline]
    pub fn device(&self) -> &D {
        &self.dev
    }

    pub fn into_device(self) -> D {
        self.dev
    }

    /// 切换到新的分区并丢弃全部缓存内容
    pub fn reset(&mut self, start: u32) {
        self.start = start;
        self.slots = [Slot::EMPTY; CACHE_CAPACITY];
        self.clock = 0;
        self.stats = CacheStats::default();
    }

    #[inline]
    pub fn stats(&self) -> CacheStats {
        self.stats
    }

    pub fn read(&mut self, block: u32, buf: &mut DataBlock) -> Result<(), DevError> {
        if let Some(index) = self.find(block) {
            self.touch(index);
            *buf = self.slots[index].data;
            return Ok(());
        }

        let index = self.victim();
        self.evict(index)?;
        self.read_raw(block, buf)?;
        self.slots[index] = Slot {
            block,
            dirty: false,
            data: *buf,
            ..Slot::EMPTY
        };
        self.touch(index);
        Ok(())
    }

    /// 直写：设备写失败时返回错误，缓存槽保存新数据但不会记为干净
    pub fn write(&mut self, block: u32, data: &DataBlock) -> Result<(), DevError> {
        let index = match self.find(block) {
            Some(index) => index,
            None => {
                let index = self.victim();
                self.evict(index)?;
                index
            }
        };

        let result = self.write_raw(block, data);
        self.slots[index] = Slot {
            block,
            dirty: result.is_err(),
            data: *data,
            ..Slot::EMPTY
        };
        self.touch(index);
        result
    }

    /// 写回所有脏块
    pub fn flush(&mut self) -> Result<(), DevError> {
        (0..CACHE_CAPACITY).try_for_each(|index| self.write_back(index))
    }

    /// 写回后清空所有槽
    pub fn invalidate(&mut self) -> Result<(), DevError> {
        self.flush()?;
        self.slots.iter_mut().for_each(|slot| *slot = Slot::EMPTY);
        Ok(())
    }

    /// 查找命中的槽，同时计入命中/缺失
    fn find(&mut self, block: u32) -> Option<usize> {
        let found = self.slots.iter().position(|slot| slot.block == block);
        match found {
            Some(_) => self.stats.hits += 1,
            None => self.stats.misses += 1,
        }
        found
    }

    // 块缓存调度策略：优先空槽，否则踢走计数最小者，同计数取下标最小者
    fn victim(&self) -> usize {
        self.slots
            .iter()
            .position(Slot::is_empty)
            .or_else(|| {
                self.slots
                    .iter()
                    .enumerate()
                    .min_by_key(|(_, slot)| slot.last_access)
                    .map(|(index, _)| index)
            })
            .unwrap_or(0)
    }

    fn touch(&mut self, index: usize) {
        self.clock = self.clock.wrapping_add(1);
        self.slots[index].last_access = self.clock;
    }

    fn evict(&mut self, index: usize) -> Result<(), DevError> {
        self.write_back(index)?;
        self.slots[index] = Slot::EMPTY;
        Ok(())
    }

    fn write_back(&mut self, index: usize) -> Result<(), DevError> {
        let slot = &self.slots[index];
        if slot.is_empty() || !slot.dirty {
            return Ok(());
        }
        self.write_raw(slot.block, &slot.data)?;
        self.slots[index].dirty = false;
        Ok(())
    }

    #[inline]
    fn read_raw(&self, block: u32, buf: &mut DataBlock) -> Result<(), DevError> {
        self.dev
            .read_block((self.start + block) as usize, &mut buf[..])
    }

    #[inline]
    fn write_raw(&self, block: u32, data: &DataBlock) -> Result<(), DevError> {
        self.dev.write_block((self.start + block) as usize, &data[..])
    }
}
