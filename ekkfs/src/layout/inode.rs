//! 索引节点
//!
//! 每个 inode 64 字节，一块容纳 8 个。数据块经由
//! - 直接索引：`direct` 中的 [`DIRECT_COUNT`] 个块编号；
//! - 一级间接索引：`indirect` 指向的数据块，整块连续存储 [`INDIRECT_COUNT`] 个块编号
//!
//! 定位。编号为 0 表示空洞，读出全零。

use core::mem;

use enumflags2::{BitFlags, bitflags};

use super::Plain;
use crate::{BLOCK_SIZE, MAX_NAME_LEN};

/// 直接索引块可编号数量
pub const DIRECT_COUNT: usize = 4;
/// 间接索引块的编号容量
pub const INDIRECT_COUNT: usize = BLOCK_SIZE / 4;
/// 单个文件最多占用的数据块数
pub const MAX_FILE_BLOCKS: usize = DIRECT_COUNT + INDIRECT_COUNT;

pub const INODE_SIZE: usize = mem::size_of::<DiskInode>();
pub const INODES_PER_BLOCK: usize = BLOCK_SIZE / INODE_SIZE;

/// 间接索引块
pub type IndirectBlock = [u32; INDIRECT_COUNT];

unsafe impl Plain for IndirectBlock {}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[bitflags]
#[repr(u16)]
pub enum InodeFlag {
    /// 已被使用
    Used = 0b0001,
    /// 系统文件，只有系统（属主 0）可以删除
    System = 0b0010,
    Log = 0b0100,
    Module = 0b1000,
}

#[derive(Debug, Clone, Copy)]
#[repr(C, packed)]
pub struct DiskInode {
    flags: u16,
    /// 属主模块 ID，0 为系统
    pub owner: u16,
    pub size: u32,
    /// 创建时间（微秒）
    pub created: u64,
    /// 修改时间（微秒）
    pub modified: u64,
    /// 文件内容的 CRC，保留未用
    pub crc32: u32,
    pub direct: [u32; DIRECT_COUNT],
    pub indirect: u32,
    /// 以 NUL 填充
    name: [u8; MAX_NAME_LEN + 1],
}

unsafe impl Plain for DiskInode {}

const _: () = assert!(INODE_SIZE == 64);

impl DiskInode {
    pub const fn empty() -> Self {
        Self {
            flags: 0,
            owner: 0,
            size: 0,
            created: 0,
            modified: 0,
            crc32: 0,
            direct: [0; DIRECT_COUNT],
            indirect: 0,
            name: [0; MAX_NAME_LEN + 1],
        }
    }

    /// `name` 的长度由调用者保证不超过 [`MAX_NAME_LEN`]
    pub fn init(&mut self, name: &str, owner: u16, flags: BitFlags<InodeFlag>, now: u64) {
        *self = Self {
            flags: (flags | InodeFlag::Used).bits(),
            owner,
            created: now,
            modified: now,
            ..Self::empty()
        };
        self.set_name(name);
    }

    /// 同 [`DiskInode::init`]，长度由调用者保证
    pub fn set_name(&mut self, name: &str) {
        let mut stored = [0; MAX_NAME_LEN + 1];
        stored[..name.len()].copy_from_slice(name.as_bytes());
        self.name = stored;
    }

    /// 未知位会被忽略
    #[inline]
    pub fn flags(&self) -> BitFlags<InodeFlag> {
        BitFlags::from_bits_truncate(self.flags)
    }

    #[inline]
    pub fn is_used(&self) -> bool {
        self.flags().contains(InodeFlag::Used)
    }

    #[inline]
    pub fn name_bytes(&self) -> [u8; MAX_NAME_LEN + 1] {
        self.name
    }

    pub fn name_eq(&self, name: &str) -> bool {
        let stored = self.name;
        let len = stored.iter().position(|&b| b == 0).unwrap_or(stored.len());
        &stored[..len] == name.as_bytes()
    }

    /// 文件占用的逻辑块数（含空洞）
    #[inline]
    pub fn block_count(&self) -> usize {
        (self.size as usize).div_ceil(BLOCK_SIZE)
    }
}

impl Default for DiskInode {
    fn default() -> Self {
        Self::empty()
    }
}
