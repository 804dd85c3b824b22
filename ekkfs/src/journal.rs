//! # 日志层
//!
//! 日志区是一个由 [`ENTRY_COUNT`] 条日志项组成的环，头部记录 `head`/`tail`、
//! 单调序号与当前是否处于事务中。事务内的每次块分配与释放都会留下一条日志项，
//! 崩溃后挂载时据此撤销未提交事务的效果。
//!
//! 缓存是直写的，提交过的修改早已落盘，因此恢复只需要撤销、不需要重做。

use block_dev::BlockDevice;

use crate::block_cache::BlockCache;
use crate::layout::{ENTRY_COUNT, EntryKind, JournalEntry, JournalHeader};
use crate::{DataBlock, Error, Result};

/// 日志头部的快照
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JournalState {
    pub head: u32,
    pub tail: u32,
    pub sequence: u32,
    pub tx_active: bool,
    pub tx_start_seq: u32,
}

#[derive(Debug)]
pub struct Journal {
    header: JournalHeader,
    /// 日志区起始块
    start: u32,
}

impl Journal {
    pub const fn new() -> Self {
        Self {
            header: JournalHeader::new(),
            start: 0,
        }
    }

    pub fn state(&self) -> JournalState {
        let h = self.header;
        JournalState {
            head: h.head,
            tail: h.tail,
            sequence: h.sequence,
            tx_active: h.tx_active != 0,
            tx_start_seq: h.tx_start_seq,
        }
    }

    #[inline]
    pub fn is_active(&self) -> bool {
        self.header.tx_active != 0
    }

    /// 清零整个日志区（含首块头部之后的日志项）并写入全新的头部
    pub fn init<D: BlockDevice>(
        &mut self,
        cache: &mut BlockCache<D>,
        start: u32,
        blocks: u32,
    ) -> Result<()> {
        self.start = start;
        let zero = DataBlock::zeroed();
        for i in 1..blocks {
            cache.write(start + i, &zero)?;
        }

        let mut header = JournalHeader::new();
        header.stamp();
        let mut first = DataBlock::zeroed();
        *first.get_mut(0) = header;
        cache.write(start, &first)?;
        self.header = header;
        Ok(())
    }

    /// 读入头部；魔数、CRC 或下标不合法时返回 `false`
    pub fn load<D: BlockDevice>(&mut self, cache: &mut BlockCache<D>, start: u32) -> Result<bool> {
        self.start = start;
        let mut block = DataBlock::zeroed();
        cache.read(start, &mut block)?;
        let header = *block.get::<JournalHeader>(0);
        if !header.is_valid() {
            return Ok(false);
        }
        self.header = header;
        Ok(true)
    }

    /// 追加一条日志项。
    ///
    /// 事务中使用事务起始序号，否则使用当前序号并在之后递增。
    /// 环满时先推进 `tail`，丢弃最旧的一项。
    /// 任何一次写盘失败都不会改动内存中的头部。
    pub fn log<D: BlockDevice>(
        &mut self,
        cache: &mut BlockCache<D>,
        mut entry: JournalEntry,
        now_us: u64,
    ) -> Result<()> {
        let mut header = self.header;
        let active = header.tx_active != 0;
        entry.sequence = if active {
            header.tx_start_seq
        } else {
            header.sequence
        };
        entry.timestamp = (now_us / 1_000_000) as u32;
        entry.stamp();

        let head = header.head as usize;
        let next = (head + 1) % ENTRY_COUNT;
        if next == header.tail as usize {
            let dropped = self.read_entry(cache, next)?;
            if active && dropped.is_valid() && dropped.sequence >= header.tx_start_seq {
                log::warn!("journal overflow drops an entry of the open transaction");
            }
            header.tail = ((next + 1) % ENTRY_COUNT) as u32;
        }

        self.write_entry(cache, head, &entry)?;
        header.head = next as u32;
        if !active {
            header.sequence = header.sequence.wrapping_add(1);
        }
        header.stamp();
        self.write_header(cache, &header)?;
        self.header = header;
        Ok(())
    }

    /// 开启事务，返回事务起始序号
    pub fn begin<D: BlockDevice>(&mut self, cache: &mut BlockCache<D>) -> Result<u32> {
        if self.is_active() {
            return Err(Error::Invalid);
        }
        let mut header = self.header;
        header.tx_active = 1;
        header.tx_start_seq = header.sequence;
        header.stamp();
        self.write_header(cache, &header)?;
        self.header = header;
        Ok(header.tx_start_seq)
    }

    /// 写入提交标记并结束事务
    pub fn commit<D: BlockDevice>(&mut self, cache: &mut BlockCache<D>, now_us: u64) -> Result<()> {
        if !self.is_active() {
            return Err(Error::Invalid);
        }
        self.log(cache, JournalEntry::new(EntryKind::Commit, 0, 0, 0, 0), now_us)?;
        self.finish(cache)
    }

    /// 结束事务：序号递增，清除事务标记
    pub fn finish<D: BlockDevice>(&mut self, cache: &mut BlockCache<D>) -> Result<()> {
        let mut header = self.header;
        header.sequence = header.sequence.wrapping_add(1);
        header.tx_active = 0;
        header.stamp();
        self.write_header(cache, &header)?;
        self.header = header;
        Ok(())
    }

    /// 收集当前事务写下的日志项（按写入顺序），返回条数。
    /// CRC 不符的项被跳过。
    pub fn pending<D: BlockDevice>(
        &self,
        cache: &mut BlockCache<D>,
        out: &mut [JournalEntry; ENTRY_COUNT],
    ) -> Result<usize> {
        let h = self.header;
        let mut count = 0;
        let mut pos = h.tail as usize;
        while pos != h.head as usize {
            let entry = self.read_entry(cache, pos)?;
            if !entry.is_valid() {
                log::warn!("journal entry {pos} fails its checksum, skipped");
            } else if entry.sequence >= h.tx_start_seq {
                out[count] = entry;
                count += 1;
            }
            pos = (pos + 1) % ENTRY_COUNT;
        }
        Ok(count)
    }

    pub fn read_entry<D: BlockDevice>(
        &self,
        cache: &mut BlockCache<D>,
        index: usize,
    ) -> Result<JournalEntry> {
        let (block_index, offset) = JournalEntry::location(index);
        let mut block = DataBlock::zeroed();
        cache.read(self.start + block_index, &mut block)?;
        Ok(*block.get::<JournalEntry>(offset))
    }

    fn write_entry<D: BlockDevice>(
        &self,
        cache: &mut BlockCache<D>,
        index: usize,
        entry: &JournalEntry,
    ) -> Result<()> {
        let (block_index, offset) = JournalEntry::location(index);
        let block_id = self.start + block_index;
        let mut block = DataBlock::zeroed();
        cache.read(block_id, &mut block)?;
        *block.get_mut(offset) = *entry;
        cache.write(block_id, &block)?;
        Ok(())
    }

    fn write_header<D: BlockDevice>(
        &self,
        cache: &mut BlockCache<D>,
        header: &JournalHeader,
    ) -> Result<()> {
        let mut block = DataBlock::zeroed();
        cache.read(self.start, &mut block)?;
        *block.get_mut(0) = *header;
        cache.write(self.start, &block)?;
        Ok(())
    }
}

impl Default for Journal {
    fn default() -> Self {
        Self::new()
    }
}
