//! 日志区的磁盘结构
//!
//! 日志区共 [`JOURNAL_BLOCKS`](crate::JOURNAL_BLOCKS) 块，首块开头是 64 字节的
//! [`JournalHeader`]，其后放 [`ENTRIES_FIRST_BLOCK`] 条日志项；其余各块放满
//! [`ENTRIES_PER_BLOCK`] 条。日志项按线性下标组成环。

use core::mem;

use super::{Plain, bytes_of};
use crate::{BLOCK_SIZE, JOURNAL_BLOCKS, crc32};

pub const JOURNAL_MAGIC: u32 = 0x4A52_4E4C;

pub const HEADER_SIZE: usize = mem::size_of::<JournalHeader>();
const ENTRY_SIZE: usize = mem::size_of::<JournalEntry>();

pub const ENTRIES_FIRST_BLOCK: usize = (BLOCK_SIZE - HEADER_SIZE) / ENTRY_SIZE;
pub const ENTRIES_PER_BLOCK: usize = BLOCK_SIZE / ENTRY_SIZE;
/// 环的容量
pub const ENTRY_COUNT: usize = ENTRIES_FIRST_BLOCK + (JOURNAL_BLOCKS as usize - 1) * ENTRIES_PER_BLOCK;

const _: () = assert!(HEADER_SIZE == 64 && ENTRY_SIZE == 32 && ENTRY_COUNT == 62);

#[derive(Debug, Clone, Copy)]
#[repr(C, packed)]
pub struct JournalHeader {
    pub magic: u32,
    /// 下一条日志项的写入位置
    pub head: u32,
    /// 最旧的有效日志项
    pub tail: u32,
    /// 单调递增的序号
    pub sequence: u32,
    pub tx_active: u32,
    /// 当前事务开始时的序号
    pub tx_start_seq: u32,
    _reserved: [u32; 2],
    pub crc32: u32,
    _padding: [u8; 28],
}

unsafe impl Plain for JournalHeader {}

impl JournalHeader {
    pub const fn new() -> Self {
        Self {
            magic: JOURNAL_MAGIC,
            head: 0,
            tail: 0,
            sequence: 1,
            tx_active: 0,
            tx_start_seq: 0,
            _reserved: [0; 2],
            crc32: 0,
            _padding: [0; 28],
        }
    }

    pub fn stamp(&mut self) {
        self.crc32 = self.checksum();
    }

    pub fn checksum(&self) -> u32 {
        crc32(&bytes_of(self)[..mem::offset_of!(JournalHeader, crc32)])
    }

    pub fn is_valid(&self) -> bool {
        let (head, tail) = (self.head as usize, self.tail as usize);
        self.magic == JOURNAL_MAGIC
            && self.crc32 == self.checksum()
            && head < ENTRY_COUNT
            && tail < ENTRY_COUNT
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.head == self.tail
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum EntryKind {
    NoOp = 0,
    /// 事务内创建了 inode
    Create = 1,
    Delete = 2,
    Write = 3,
    Truncate = 4,
    AllocBlock = 5,
    FreeBlock = 6,
    Commit = 7,
}

impl EntryKind {
    pub fn from_raw(raw: u32) -> Option<Self> {
        use EntryKind::*;
        [
            NoOp, Create, Delete, Write, Truncate, AllocBlock, FreeBlock, Commit,
        ]
        .into_iter()
        .find(|kind| *kind as u32 == raw)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[repr(C, packed)]
pub struct JournalEntry {
    pub sequence: u32,
    pub kind: u32,
    /// 相关 inode，无则为 0
    pub inode: u32,
    /// 相关块号，无则为 0
    pub block: u32,
    pub old_value: u32,
    pub new_value: u32,
    /// 秒
    pub timestamp: u32,
    pub crc32: u32,
}

unsafe impl Plain for JournalEntry {}

impl JournalEntry {
    pub fn new(kind: EntryKind, inode: u32, block: u32, old_value: u32, new_value: u32) -> Self {
        Self {
            kind: kind as u32,
            inode,
            block,
            old_value,
            new_value,
            ..Default::default()
        }
    }

    pub fn stamp(&mut self) {
        self.crc32 = self.checksum();
    }

    pub fn checksum(&self) -> u32 {
        crc32(&bytes_of(self)[..mem::offset_of!(JournalEntry, crc32)])
    }

    pub fn is_valid(&self) -> bool {
        self.crc32 == self.checksum()
    }

    #[inline]
    pub fn kind(&self) -> Option<EntryKind> {
        EntryKind::from_raw(self.kind)
    }

    /// 日志项在日志区内的位置：（块下标, 块内偏移）
    pub fn location(index: usize) -> (u32, usize) {
        debug_assert!(index < ENTRY_COUNT);
        if index < ENTRIES_FIRST_BLOCK {
            (0, HEADER_SIZE + index * ENTRY_SIZE)
        } else {
            let rest = index - ENTRIES_FIRST_BLOCK;
            (
                1 + (rest / ENTRIES_PER_BLOCK) as u32,
                rest % ENTRIES_PER_BLOCK * ENTRY_SIZE,
            )
        }
    }
}
