#![cfg_attr(not(test), no_std)]

/* ekkfs 的整体架构，自上而下 */

// 文件层：创建、打开、读写、删除、列举
mod vfs;

// 磁盘块管理器层：格式化、挂载、同步，inode 表与块映射
mod efs;

// 日志层：循环日志与事务回滚
mod journal;

// 磁盘数据结构层：表示磁盘文件系统的数据结构
pub mod layout;

// 块缓存层：内存上的磁盘块数据缓存
mod block_cache;

mod crc;
mod error;

pub use block_dev::{BlockDevice, DevError};

pub use self::{
    block_cache::{BlockCache, CacheStats},
    crc::crc32,
    efs::{Filesystem, TimeSource},
    error::{Error, Result},
    journal::JournalState,
    layout::{DataBlock, InodeFlag},
    vfs::{DirEntry, FileHandle, FileName, MAX_FILE_SIZE, Stat, StatFs},
};

pub const MAGIC: u32 = 0x454B_4653;
pub const VERSION: u32 = 1;
pub const BLOCK_SIZE: usize = block_dev::BLOCK_SIZE;
pub const BLOCK_BITS: usize = BLOCK_SIZE * 8;

/// 文件名最大字节数（不含结尾的 NUL）
pub const MAX_NAME_LEN: usize = 15;
pub const DEFAULT_INODES: u32 = 256;
/// 日志区占用的块数
pub const JOURNAL_BLOCKS: u32 = 4;
