//! MBR 分区表
//!
//! 位于设备第 0 块：446 字节引导代码，4 个 16 字节分区项，以 0xAA55 结尾。

use core::mem;
use core::ptr;

use crate::{BLOCK_SIZE, BlockDevice, DevError};

pub const SIGNATURE: u16 = 0xAA55;

/// 空分区项
pub const PART_TYPE_EMPTY: u8 = 0x00;
/// EKKFS 专用分区类型
pub const PART_TYPE_EKKFS: u8 = 0xEE;
pub const PART_TYPE_LINUX: u8 = 0x83;

pub const PARTITION_COUNT: usize = 4;

#[derive(Debug, Clone, Copy)]
#[repr(C, packed)]
struct PartitionEntry {
    /// 0x80 为可引导
    status: u8,
    _chs_first: [u8; 3],
    kind: u8,
    _chs_last: [u8; 3],
    lba_start: u32,
    sector_count: u32,
}

#[repr(C, packed)]
struct Mbr {
    _bootcode: [u8; 446],
    partitions: [PartitionEntry; PARTITION_COUNT],
    signature: u16,
}

const _: () = assert!(mem::size_of::<Mbr>() == BLOCK_SIZE);

/// 解析后的分区项
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Partition {
    pub status: u8,
    pub kind: u8,
    pub lba_start: u32,
    pub sector_count: u32,
}

impl Partition {
    pub const fn new(kind: u8, lba_start: u32, sector_count: u32) -> Self {
        Self {
            status: 0,
            kind,
            lba_start,
            sector_count,
        }
    }

    #[inline]
    pub fn is_valid(&self) -> bool {
        self.kind != PART_TYPE_EMPTY
    }
}

/// 读出第 0 块并返回全部 4 个分区项，签名不符时返回 [`DevError::Data`]
pub fn read_partitions(dev: &dyn BlockDevice) -> Result<[Partition; PARTITION_COUNT], DevError> {
    let mut buf = [0u8; BLOCK_SIZE];
    dev.read_block(0, &mut buf)?;
    parse(&buf)
}

pub fn parse(buf: &[u8; BLOCK_SIZE]) -> Result<[Partition; PARTITION_COUNT], DevError> {
    // 对齐为 1，按字节读出即可
    let mbr: Mbr = unsafe { ptr::read_unaligned(buf.as_ptr().cast()) };
    let signature = mbr.signature;
    if signature != SIGNATURE {
        log::warn!("bad MBR signature {signature:#06x}");
        return Err(DevError::Data);
    }

    let partitions = mbr.partitions.map(|entry| Partition {
        status: entry.status,
        kind: entry.kind,
        lba_start: entry.lba_start,
        sector_count: entry.sector_count,
    });
    for (i, part) in partitions.iter().enumerate().filter(|(_, p)| p.is_valid()) {
        log::debug!(
            "partition {i}: type={:#04x} start={} count={}",
            part.kind,
            part.lba_start,
            part.sector_count
        );
    }

    Ok(partitions)
}

/// 查找 EKKFS 分区：优先类型 0xEE，其次是类型为 0x83 的第二个分区
pub fn find_ekkfs_partition(dev: &dyn BlockDevice) -> Result<Option<Partition>, DevError> {
    let parts = read_partitions(dev)?;
    Ok(select_ekkfs(&parts))
}

pub fn select_ekkfs(parts: &[Partition; PARTITION_COUNT]) -> Option<Partition> {
    parts
        .iter()
        .find(|p| p.is_valid() && p.kind == PART_TYPE_EKKFS)
        .or_else(|| Some(&parts[1]).filter(|p| p.kind == PART_TYPE_LINUX))
        .copied()
}

/// 写入只含分区表的 MBR，引导代码全零
pub fn write_partitions(
    dev: &dyn BlockDevice,
    parts: &[Partition; PARTITION_COUNT],
) -> Result<(), DevError> {
    let mbr = Mbr {
        _bootcode: [0; 446],
        partitions: parts.map(|p| PartitionEntry {
            status: p.status,
            _chs_first: [0xFE, 0xFF, 0xFF],
            kind: p.kind,
            _chs_last: [0xFE, 0xFF, 0xFF],
            lba_start: p.lba_start,
            sector_count: p.sector_count,
        }),
        signature: SIGNATURE,
    };
    let mut buf = [0u8; BLOCK_SIZE];
    unsafe { ptr::write_unaligned(buf.as_mut_ptr().cast(), mbr) };
    dev.write_block(0, &buf)
}
