//! # 磁盘块管理器层
//!
//! 构建出磁盘的布局并使用：格式化、挂载、同步，inode 表的读写，
//! 数据块的分配与回收，以及事务的开启、提交与回滚。

use block_dev::BlockDevice;
use enumflags2::BitFlags;

use crate::block_cache::{BlockCache, CacheStats};
use crate::journal::{Journal, JournalState};
use crate::layout::*;
use crate::{BLOCK_BITS, DataBlock, Error, JOURNAL_BLOCKS, Result};

/// 返回当前时间（微秒）
pub type TimeSource = fn() -> u64;

/// 一个分区上的 EKKFS 实例。
///
/// 由唯一的拥有者持有，没有全局状态；所有磁盘访问都经过内部的块缓存。
pub struct Filesystem<D> {
    cache: BlockCache<D>,
    sb: SuperBlock,
    bitmap: Bitmap,
    journal: Journal,
    mounted: bool,
    now: TimeSource,
}

impl<D: BlockDevice> Filesystem<D> {
    pub fn new(dev: D, now: TimeSource) -> Self {
        Self {
            cache: BlockCache::new(dev),
            sb: SuperBlock::zeroed(),
            bitmap: Bitmap::new(),
            journal: Journal::new(),
            mounted: false,
            now,
        }
    }

    /// 在以 `lba` 起始、共 `total_blocks` 块的分区上建立空文件系统。
    ///
    /// 完成后仍处于未挂载状态。
    pub fn format(&mut self, lba: u32, total_blocks: u32, inode_count: u32) -> Result<()> {
        if self.mounted || inode_count == 0 {
            return Err(Error::Invalid);
        }

        let inode_blocks = inode_count.div_ceil(INODES_PER_BLOCK as u32);
        let estimate = total_blocks
            .checked_sub(1 + inode_blocks + JOURNAL_BLOCKS)
            .filter(|&blocks| blocks > 0)
            .ok_or(Error::Invalid)?;
        let bitmap_blocks = estimate.div_ceil(BLOCK_BITS as u32);
        if bitmap_blocks as usize > MAX_BITMAP_BLOCKS {
            return Err(Error::Invalid);
        }
        let data_start = 1 + inode_blocks + bitmap_blocks + JOURNAL_BLOCKS;
        if data_start >= total_blocks {
            return Err(Error::Invalid);
        }

        self.cache.reset(lba);
        let zero = DataBlock::zeroed();
        for block in 0..data_start {
            self.cache.write(block, &zero)?;
        }

        let mut sb = SuperBlock::zeroed();
        sb.init(
            total_blocks,
            inode_count,
            inode_blocks,
            bitmap_blocks,
            JOURNAL_BLOCKS,
        );
        self.sb = sb;
        self.bitmap.configure(&sb)?;
        self.write_super()?;
        self.journal
            .init(&mut self.cache, sb.journal_start, JOURNAL_BLOCKS)?;
        self.cache.flush()?;

        log::info!(
            "ekkfs: formatted {total_blocks} blocks at lba {lba}, {inode_count} inodes, data from {data_start}"
        );
        Ok(())
    }

    /// 挂载 `lba` 处的文件系统，必要时回滚未完成的事务
    pub fn mount(&mut self, lba: u32) -> Result<()> {
        if self.mounted {
            return Err(Error::Invalid);
        }

        self.cache.reset(lba);
        let mut block = DataBlock::zeroed();
        self.cache.read(0, &mut block)?;
        let sb = *block.get::<SuperBlock>(0);
        if !sb.is_valid() {
            log::warn!("ekkfs: no valid superblock at lba {lba}");
            return Err(Error::Corrupt);
        }
        if !sb.is_layout_sane() {
            log::warn!("ekkfs: superblock layout is inconsistent");
            return Err(Error::Corrupt);
        }

        self.sb = sb;
        self.bitmap.configure(&sb)?;
        self.bitmap.load(&mut self.cache)?;

        if let Err(err) = self.recover() {
            log::error!("ekkfs: journal recovery failed: {err:?}");
        }

        let used = self.bitmap.count_used();
        let free = self.sb.data_blocks() - used;
        if self.sb.free_blocks != free {
            log::warn!(
                "ekkfs: free block count {} disagrees with bitmap, using {free}",
                { self.sb.free_blocks }
            );
            self.sb.free_blocks = free;
        }

        self.sb.mount_count = self.sb.mount_count.wrapping_add(1);
        self.sb.mount_time = (self.now)();
        self.write_super()?;
        self.mounted = true;

        log::info!(
            "ekkfs: mounted at lba {lba}, {free} of {} data blocks free",
            self.sb.data_blocks()
        );
        Ok(())
    }

    pub fn unmount(&mut self) -> Result<()> {
        self.ensure_mounted()?;
        if self.journal.is_active() {
            log::warn!("ekkfs: unmounting with an open transaction");
        }
        self.sync()?;
        self.cache.invalidate()?;
        self.mounted = false;
        Ok(())
    }

    /// 写回缓存、位图与超级块
    pub fn sync(&mut self) -> Result<()> {
        self.ensure_mounted()?;
        self.cache.flush()?;
        self.bitmap.save(&mut self.cache)?;
        self.write_super()
    }

    #[inline]
    pub fn is_mounted(&self) -> bool {
        self.mounted
    }

    #[inline]
    pub fn superblock(&self) -> SuperBlock {
        self.sb
    }

    #[inline]
    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }

    #[inline]
    pub fn journal_state(&self) -> JournalState {
        self.journal.state()
    }

    #[inline]
    pub fn device(&self) -> &D {
        self.cache.device()
    }

    pub fn into_device(self) -> D {
        self.cache.into_device()
    }

    /* 事务 */

    /// 开启事务，返回事务起始序号。
    ///
    /// 开启前先同步一次，保证回滚时面对的磁盘状态就是事务开始时的状态。
    pub fn tx_begin(&mut self) -> Result<u32> {
        self.ensure_mounted()?;
        if self.journal.is_active() {
            return Err(Error::Invalid);
        }
        self.sync()?;
        self.journal.begin(&mut self.cache)
    }

    pub fn tx_commit(&mut self) -> Result<()> {
        self.ensure_mounted()?;
        self.journal.commit(&mut self.cache, (self.now)())?;
        self.sync()
    }

    /// 撤销当前事务内的块分配、块释放与 inode 创建
    pub fn tx_abort(&mut self) -> Result<()> {
        self.ensure_mounted()?;
        if !self.journal.is_active() {
            return Err(Error::Invalid);
        }
        self.rollback()?;
        self.journal.finish(&mut self.cache)
    }

    fn recover(&mut self) -> Result<()> {
        if !self.journal.load(&mut self.cache, self.sb.journal_start)? {
            log::warn!("ekkfs: journal header invalid, reinitializing");
            return self.journal.init(
                &mut self.cache,
                self.sb.journal_start,
                self.sb.journal_blocks(),
            );
        }
        if !self.journal.is_active() {
            return Ok(());
        }

        log::warn!("ekkfs: rolling back an interrupted transaction");
        self.rollback()?;
        self.journal.finish(&mut self.cache)
    }

    /// 逆序撤销当前事务的日志项，按位图重算空闲块数，随后写回位图与超级块
    fn rollback(&mut self) -> Result<()> {
        let mut entries = [JournalEntry::default(); ENTRY_COUNT];
        let count = self.journal.pending(&mut self.cache, &mut entries)?;

        for entry in entries[..count].iter().rev() {
            let (inode, block) = (entry.inode, entry.block);
            match entry.kind() {
                Some(EntryKind::AllocBlock) => {
                    self.bitmap.free(block);
                    self.scrub_pointer(inode, block)?;
                }
                Some(EntryKind::FreeBlock) => {
                    if self.is_data_block(block) && !self.bitmap.get(block) {
                        self.bitmap.set(block, true);
                    }
                }
                Some(EntryKind::Create) if inode < self.sb.inode_count => {
                    self.write_inode(inode, &DiskInode::empty())?;
                }
                _ => {}
            }
        }

        // 崩溃后磁盘上的空闲块数停在事务开始之前，以位图为准
        self.sb.free_blocks = self.sb.data_blocks() - self.bitmap.count_used();
        log::debug!("ekkfs: rolled back {count} journal entries");
        self.bitmap.save(&mut self.cache)?;
        self.write_super()
    }

    /// 清除 inode 中等于 `block` 的块指针（含间接块内的槽位）
    fn scrub_pointer(&mut self, index: u32, block: u32) -> Result<()> {
        if index >= self.sb.inode_count {
            return Ok(());
        }
        let mut inode = self.read_inode(index)?;
        if !inode.is_used() {
            return Ok(());
        }

        let mut changed = false;
        let mut direct = inode.direct;
        for ptr in direct.iter_mut().filter(|ptr| **ptr == block) {
            *ptr = 0;
            changed = true;
        }
        inode.direct = direct;

        let indirect = inode.indirect;
        if indirect == block {
            inode.indirect = 0;
            changed = true;
        } else if self.is_data_block(indirect) {
            let mut table = self.read_block(indirect)?;
            let slots = table.get_mut::<IndirectBlock>(0);
            let mut hit = false;
            for ptr in slots.iter_mut().filter(|ptr| **ptr == block) {
                *ptr = 0;
                hit = true;
            }
            if hit {
                self.write_block(indirect, &table)?;
            }
        }

        if changed {
            self.write_inode(index, &inode)?;
        }
        Ok(())
    }

    /* inode 表 */

    pub(crate) fn ensure_mounted(&self) -> Result<()> {
        if self.mounted {
            Ok(())
        } else {
            Err(Error::NotMounted)
        }
    }

    /// 通过编号获取 inode 在磁盘上的位置：**块号**以及**块内偏移**
    fn inode_pos(&self, index: u32) -> Result<(u32, usize)> {
        if index >= self.sb.inode_count {
            return Err(Error::Invalid);
        }
        let block = self.sb.inode_start + index / INODES_PER_BLOCK as u32;
        let offset = index as usize % INODES_PER_BLOCK * INODE_SIZE;
        Ok((block, offset))
    }

    pub(crate) fn read_inode(&mut self, index: u32) -> Result<DiskInode> {
        let (block_id, offset) = self.inode_pos(index)?;
        let block = self.read_block(block_id)?;
        Ok(*block.get::<DiskInode>(offset))
    }

    pub(crate) fn write_inode(&mut self, index: u32, inode: &DiskInode) -> Result<()> {
        let (block_id, offset) = self.inode_pos(index)?;
        let mut block = self.read_block(block_id)?;
        *block.get_mut::<DiskInode>(offset) = *inode;
        self.write_block(block_id, &block)
    }

    /// 依次访问每个 inode，`f` 返回 `true` 时停止并返回该 inode 的编号
    pub(crate) fn scan_inodes(
        &mut self,
        mut f: impl FnMut(u32, &DiskInode) -> bool,
    ) -> Result<Option<u32>> {
        let count = self.sb.inode_count;
        let blocks = count.div_ceil(INODES_PER_BLOCK as u32);
        for i in 0..blocks {
            let block = self.read_block(self.sb.inode_start + i)?;
            for slot in 0..INODES_PER_BLOCK as u32 {
                let index = i * INODES_PER_BLOCK as u32 + slot;
                if index >= count {
                    break;
                }
                if f(index, block.get(slot as usize * INODE_SIZE)) {
                    return Ok(Some(index));
                }
            }
        }
        Ok(None)
    }

    /// 第一个未使用的 inode
    pub(crate) fn alloc_inode(&mut self) -> Result<u32> {
        self.scan_inodes(|_, inode| !inode.is_used())?
            .ok_or(Error::NoInodes)
    }

    /// 按名字查找已使用的 inode
    pub(crate) fn lookup(&mut self, name: &str) -> Result<(u32, DiskInode)> {
        let mut found = DiskInode::empty();
        let index = self
            .scan_inodes(|_, inode| {
                let hit = inode.is_used() && inode.name_eq(name);
                if hit {
                    found = *inode;
                }
                hit
            })?
            .ok_or(Error::NotFound)?;
        Ok((index, found))
    }

    /// 新建 inode，事务中记录一条 `Create` 日志
    pub(crate) fn init_inode(
        &mut self,
        index: u32,
        name: &str,
        owner: u16,
        flags: BitFlags<InodeFlag>,
    ) -> Result<()> {
        if self.journal.is_active() {
            self.log(EntryKind::Create, index, 0, 0, 0)?;
        }
        let mut inode = DiskInode::empty();
        inode.init(name, owner, flags, (self.now)());
        self.write_inode(index, &inode)
    }

    /* 数据块 */

    /// 时间来源给出的当前时间（微秒）
    #[inline]
    pub fn now(&self) -> u64 {
        (self.now)()
    }

    pub(crate) fn read_block(&mut self, block: u32) -> Result<DataBlock> {
        let mut data = DataBlock::zeroed();
        self.cache.read(block, &mut data)?;
        Ok(data)
    }

    pub(crate) fn write_block(&mut self, block: u32, data: &DataBlock) -> Result<()> {
        self.cache.write(block, data)?;
        Ok(())
    }

    #[inline]
    fn is_data_block(&self, block: u32) -> bool {
        (self.sb.data_start..self.sb.total_blocks).contains(&block)
    }

    /// 为 inode `owner` 分配一个数据块
    pub(crate) fn alloc_block(&mut self, owner: u32) -> Result<u32> {
        let block = self.bitmap.alloc().ok_or(Error::Full)?;
        if self.journal.is_active() {
            if let Err(err) = self.log(EntryKind::AllocBlock, owner, block, 0, block) {
                self.bitmap.set(block, false);
                return Err(err);
            }
        }
        self.sb.free_blocks = self.sb.free_blocks.saturating_sub(1);
        self.bitmap.save_bit(&mut self.cache, block)?;
        Ok(block)
    }

    /// 元数据块与未分配的块被忽略
    pub(crate) fn free_block(&mut self, owner: u32, block: u32) -> Result<()> {
        if !self.is_data_block(block) || !self.bitmap.get(block) {
            return Ok(());
        }
        if self.journal.is_active() {
            self.log(EntryKind::FreeBlock, owner, block, block, 0)?;
        }
        self.bitmap.free(block);
        self.sb.free_blocks += 1;
        self.bitmap.save_bit(&mut self.cache, block)
    }

    /// 将文件内第 `index` 个逻辑块映射为块号。
    ///
    /// 返回（块号, 是否新分配）。块号 0 表示空洞，只在 `create` 为假时出现；
    /// 为真时按需分配数据块与间接块。
    pub(crate) fn map_block(
        &mut self,
        ino: u32,
        inode: &mut DiskInode,
        index: usize,
        create: bool,
    ) -> Result<(u32, bool)> {
        if index < DIRECT_COUNT {
            let mut direct = inode.direct;
            if direct[index] != 0 || !create {
                return Ok((direct[index], false));
            }
            direct[index] = self.alloc_block(ino)?;
            inode.direct = direct;
            return Ok((direct[index], true));
        }

        let slot = index - DIRECT_COUNT;
        if slot >= INDIRECT_COUNT {
            return Err(Error::Invalid);
        }

        let indirect = inode.indirect;
        if indirect == 0 {
            if !create {
                return Ok((0, false));
            }
            let indirect = self.alloc_block(ino)?;
            let mut table = DataBlock::zeroed();
            let result = self.alloc_block(ino);
            if let Ok(block) = result {
                table.get_mut::<IndirectBlock>(0)[slot] = block;
            }
            self.write_block(indirect, &table)?;
            inode.indirect = indirect;
            return result.map(|block| (block, true));
        }

        let mut table = self.read_block(indirect)?;
        let current = table.get::<IndirectBlock>(0)[slot];
        if current != 0 || !create {
            return Ok((current, false));
        }
        let block = self.alloc_block(ino)?;
        table.get_mut::<IndirectBlock>(0)[slot] = block;
        self.write_block(indirect, &table)?;
        Ok((block, true))
    }

    /// 释放 inode 占有的所有数据块：直接块，间接块所指的块，最后是间接块本身
    pub(crate) fn release_blocks(&mut self, ino: u32, inode: &DiskInode) -> Result<()> {
        let direct = inode.direct;
        for block in direct.into_iter().filter(|&block| block != 0) {
            self.free_block(ino, block)?;
        }

        let indirect = inode.indirect;
        if indirect != 0 {
            let table = self.read_block(indirect)?;
            let slots = *table.get::<IndirectBlock>(0);
            for block in slots.into_iter().filter(|&block| block != 0) {
                self.free_block(ino, block)?;
            }
            self.free_block(ino, indirect)?;
        }
        Ok(())
    }

    pub(crate) fn used_inodes(&mut self) -> Result<u32> {
        let mut used = 0;
        self.scan_inodes(|_, inode| {
            used += inode.is_used() as u32;
            false
        })?;
        Ok(used)
    }

    fn log(&mut self, kind: EntryKind, inode: u32, block: u32, old: u32, new: u32) -> Result<()> {
        let entry = JournalEntry::new(kind, inode, block, old, new);
        self.journal.log(&mut self.cache, entry, (self.now)())
    }

    fn write_super(&mut self) -> Result<()> {
        self.sb.stamp();
        let mut block = DataBlock::zeroed();
        *block.get_mut::<SuperBlock>(0) = self.sb;
        self.write_block(0, &block)
    }
}

impl<D> core::fmt::Debug for Filesystem<D> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Filesystem")
            .field("mounted", &self.mounted)
            .field("free_blocks", &{ self.sb.free_blocks })
            .field("journal", &self.journal.state())
            .finish_non_exhaustive()
    }
}
