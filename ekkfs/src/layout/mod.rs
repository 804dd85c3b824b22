//! # 磁盘数据结构层
//!
//! 分区内的块布局（相对块号）：
//!
//! ```text
//! | 0          | 1 .. I      | .. B        | .. J         | ..          |
//! | SuperBlock | DiskInode[] | Bitmap      | Journal      | Data        |
//! ```
//!
//! 所有结构均为小端、紧凑排列。

mod bitmap;
mod inode;
mod journal;
mod super_block;

use core::mem;
use core::ops::{Deref, DerefMut};
use core::slice;

use crate::BLOCK_SIZE;

pub use self::{
    bitmap::{Bitmap, MAX_BITMAP_BLOCKS},
    inode::{
        DIRECT_COUNT, DiskInode, INDIRECT_COUNT, INODE_SIZE, INODES_PER_BLOCK, IndirectBlock,
        InodeFlag, MAX_FILE_BLOCKS,
    },
    journal::{
        ENTRIES_FIRST_BLOCK, ENTRIES_PER_BLOCK, ENTRY_COUNT, EntryKind, HEADER_SIZE,
        JOURNAL_MAGIC, JournalEntry, JournalHeader,
    },
    super_block::SuperBlock,
};

/// 可以直接按字节解释的磁盘结构。
///
/// # Safety
///
/// 实现者必须没有填充字节，且任意位模式都是合法值。
pub unsafe trait Plain: Sized {}

unsafe impl Plain for [u8; BLOCK_SIZE] {}

pub(crate) fn bytes_of<T: Plain>(value: &T) -> &[u8] {
    unsafe { slice::from_raw_parts((value as *const T).cast(), mem::size_of::<T>()) }
}

/// 一个块的数据，16 字节对齐，便于按 `u32` 数组解释
#[derive(Clone, Copy, PartialEq, Eq)]
#[repr(C, align(16))]
pub struct DataBlock([u8; BLOCK_SIZE]);

impl DataBlock {
    pub const fn zeroed() -> Self {
        Self([0; BLOCK_SIZE])
    }

    pub fn get<T: Plain>(&self, offset: usize) -> &T {
        assert!(mem::size_of::<T>() + offset <= BLOCK_SIZE);
        assert_eq!(offset % mem::align_of::<T>(), 0);
        let addr = self.0[offset..].as_ptr().cast();
        unsafe { &*addr }
    }

    pub fn get_mut<T: Plain>(&mut self, offset: usize) -> &mut T {
        assert!(mem::size_of::<T>() + offset <= BLOCK_SIZE);
        assert_eq!(offset % mem::align_of::<T>(), 0);
        let addr = self.0[offset..].as_mut_ptr().cast();
        unsafe { &mut *addr }
    }

    #[inline]
    pub fn map<T: Plain, V>(&self, offset: usize, f: impl FnOnce(&T) -> V) -> V {
        f(self.get(offset))
    }

    #[inline]
    pub fn map_mut<T: Plain, V>(&mut self, offset: usize, f: impl FnOnce(&mut T) -> V) -> V {
        f(self.get_mut(offset))
    }
}

impl Default for DataBlock {
    fn default() -> Self {
        Self::zeroed()
    }
}

impl Deref for DataBlock {
    type Target = [u8; BLOCK_SIZE];

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl DerefMut for DataBlock {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.0
    }
}

impl core::fmt::Debug for DataBlock {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("DataBlock").finish_non_exhaustive()
    }
}
