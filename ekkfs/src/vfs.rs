//! # 文件层
//!
//! 平坦命名空间上的文件操作。文件由名字定位，打开后得到只在调用方保存的
//! [`FileHandle`]，关闭不产生任何磁盘效果。

use core::fmt;

use block_dev::BlockDevice;
use enumflags2::BitFlags;

use crate::layout::{DiskInode, InodeFlag, MAX_FILE_BLOCKS};
use crate::{BLOCK_SIZE, DataBlock, Error, Filesystem, MAX_NAME_LEN, Result};

/// 单个文件的最大字节数
pub const MAX_FILE_SIZE: u32 = (MAX_FILE_BLOCKS * BLOCK_SIZE) as u32;

/// 已打开文件的句柄
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileHandle {
    inode: u32,
    pos: u32,
    flags: BitFlags<InodeFlag>,
}

impl FileHandle {
    #[inline]
    pub fn inode(&self) -> u32 {
        self.inode
    }

    #[inline]
    pub fn pos(&self) -> u32 {
        self.pos
    }

    #[inline]
    pub fn flags(&self) -> BitFlags<InodeFlag> {
        self.flags
    }

    /// 不检查是否越过文件末尾，之后的写入会留下空洞
    #[inline]
    pub fn seek(&mut self, pos: u32) {
        self.pos = pos;
    }
}

/// 定长的文件名，以 NUL 填充
#[derive(Clone, Copy, Default, PartialEq, Eq)]
pub struct FileName([u8; MAX_NAME_LEN + 1]);

impl FileName {
    pub fn as_bytes(&self) -> &[u8] {
        let len = self.0.iter().position(|&b| b == 0).unwrap_or(MAX_NAME_LEN);
        &self.0[..len]
    }

    /// 非 UTF-8 的名字显示为空串
    pub fn as_str(&self) -> &str {
        core::str::from_utf8(self.as_bytes()).unwrap_or_default()
    }
}

impl From<&DiskInode> for FileName {
    fn from(inode: &DiskInode) -> Self {
        Self(inode.name_bytes())
    }
}

impl fmt::Debug for FileName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.as_str())
    }
}

impl fmt::Display for FileName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Stat {
    pub inode: u32,
    pub name: FileName,
    pub size: u32,
    pub owner: u16,
    pub flags: BitFlags<InodeFlag>,
    pub created: u64,
    pub modified: u64,
    /// 占用的逻辑块数
    pub blocks: u32,
}

impl Stat {
    fn new(index: u32, inode: &DiskInode) -> Self {
        Self {
            inode: index,
            name: FileName::from(inode),
            size: inode.size,
            owner: inode.owner,
            flags: inode.flags(),
            created: inode.created,
            modified: inode.modified,
            blocks: inode.block_count() as u32,
        }
    }
}

/// [`Filesystem::list`] 逐个交给回调的目录项
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DirEntry {
    pub inode: u32,
    pub name: FileName,
    pub size: u32,
    pub owner: u16,
}

impl DirEntry {
    fn new(index: u32, inode: &DiskInode) -> Self {
        Self {
            inode: index,
            name: FileName::from(inode),
            size: inode.size,
            owner: inode.owner,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatFs {
    pub block_size: u32,
    pub total_blocks: u32,
    pub free_blocks: u32,
    pub total_inodes: u32,
    pub used_inodes: u32,
}

fn check_name(name: &str) -> Result<()> {
    if name.len() > MAX_NAME_LEN {
        Err(Error::NameTooLong)
    } else if name.is_empty() || name.contains('\0') {
        Err(Error::Invalid)
    } else {
        Ok(())
    }
}

impl<D: BlockDevice> Filesystem<D> {
    /// 新建空文件，返回其 inode 编号
    pub fn create(&mut self, name: &str, owner: u16, flags: BitFlags<InodeFlag>) -> Result<u32> {
        self.ensure_mounted()?;
        check_name(name)?;
        match self.lookup(name) {
            Ok(_) => return Err(Error::Exists),
            Err(Error::NotFound) => {}
            Err(err) => return Err(err),
        }

        let index = self.alloc_inode()?;
        self.init_inode(index, name, owner, flags)?;
        log::debug!("ekkfs: created {name:?} as inode {index}, owner {owner}");
        Ok(index)
    }

    /// 删除文件并回收其数据块。
    ///
    /// 属主本人或系统（`requester` 为 0）可以删除；系统文件只有系统可以删除。
    pub fn delete(&mut self, name: &str, requester: u16) -> Result<()> {
        self.ensure_mounted()?;
        let (index, inode) = self.lookup(name)?;
        let owner = inode.owner;
        if requester != 0 && (owner != requester || inode.flags().contains(InodeFlag::System)) {
            return Err(Error::Permission);
        }

        self.release_blocks(index, &inode)?;
        self.write_inode(index, &DiskInode::empty())?;
        log::debug!("ekkfs: deleted {name:?} (inode {index})");
        Ok(())
    }

    /// 改名，权限规则同 [`Filesystem::delete`]。`to` 已存在时返回 [`Error::Exists`]
    pub fn rename(&mut self, from: &str, to: &str, requester: u16) -> Result<()> {
        self.ensure_mounted()?;
        check_name(to)?;
        let (index, mut inode) = self.lookup(from)?;
        let owner = inode.owner;
        if requester != 0 && (owner != requester || inode.flags().contains(InodeFlag::System)) {
            return Err(Error::Permission);
        }
        match self.lookup(to) {
            Ok(_) => return Err(Error::Exists),
            Err(Error::NotFound) => {}
            Err(err) => return Err(err),
        }

        inode.set_name(to);
        inode.modified = self.now();
        self.write_inode(index, &inode)
    }

    pub fn open(&mut self, name: &str) -> Result<FileHandle> {
        self.ensure_mounted()?;
        let (index, inode) = self.lookup(name)?;
        Ok(FileHandle {
            inode: index,
            pos: 0,
            flags: inode.flags(),
        })
    }

    /// 句柄只存在于调用方，关闭没有磁盘效果
    pub fn close(&mut self, _handle: FileHandle) -> Result<()> {
        self.ensure_mounted()
    }

    /// 从当前位置读取，返回读到的字节数；到达文件末尾时返回 0。
    ///
    /// 空洞读出全零且不会分配数据块。
    pub fn read(&mut self, handle: &mut FileHandle, buf: &mut [u8]) -> Result<usize> {
        self.ensure_mounted()?;
        let mut inode = self.used_inode(handle.inode)?;

        let size = inode.size;
        if handle.pos >= size {
            return Ok(0);
        }
        let len = buf.len().min((size - handle.pos) as usize);

        let mut done = 0;
        while done < len {
            let pos = handle.pos as usize;
            let offset = pos % BLOCK_SIZE;
            let chunk = (BLOCK_SIZE - offset).min(len - done);
            let dst = &mut buf[done..done + chunk];

            let (block, _) = self.map_block(handle.inode, &mut inode, pos / BLOCK_SIZE, false)?;
            if block == 0 {
                dst.fill(0);
            } else {
                let data = self.read_block(block)?;
                dst.copy_from_slice(&data[offset..offset + chunk]);
            }

            done += chunk;
            handle.pos += chunk as u32;
        }
        Ok(done)
    }

    /// 从当前位置写入，按需分配数据块，返回写入的字节数。
    ///
    /// 空间不足或到达文件大小上限时写入部分数据并返回已写入的字节数；
    /// 一个字节都没写成时返回 [`Error::Full`]。当前位置已在上限处时返回 [`Error::Invalid`]。
    pub fn write(&mut self, handle: &mut FileHandle, buf: &[u8], requester: u16) -> Result<usize> {
        self.ensure_mounted()?;
        let ino = handle.inode;
        let mut inode = self.used_inode(ino)?;
        let owner = inode.owner;
        if requester != 0 && owner != requester {
            return Err(Error::Permission);
        }
        if buf.is_empty() {
            return Ok(0);
        }
        if handle.pos >= MAX_FILE_SIZE {
            return Err(Error::Invalid);
        }

        let len = buf.len().min((MAX_FILE_SIZE - handle.pos) as usize);
        let mut done = 0;
        let mut stopped = None;
        while done < len {
            let pos = handle.pos as usize;
            let offset = pos % BLOCK_SIZE;
            let chunk = (BLOCK_SIZE - offset).min(len - done);

            let (block, fresh) = match self.map_block(ino, &mut inode, pos / BLOCK_SIZE, true) {
                Ok(mapped) => mapped,
                Err(Error::Full) => {
                    stopped = Some(Error::Full);
                    break;
                }
                Err(err) => return Err(err),
            };

            let mut data = if fresh {
                DataBlock::zeroed()
            } else {
                self.read_block(block)?
            };
            data[offset..offset + chunk].copy_from_slice(&buf[done..done + chunk]);
            self.write_block(block, &data)?;

            done += chunk;
            handle.pos += chunk as u32;
        }

        if handle.pos > inode.size {
            inode.size = handle.pos;
        }
        inode.modified = self.now();
        self.write_inode(ino, &inode)?;

        match stopped {
            Some(err) if done == 0 => Err(err),
            Some(_) => {
                log::warn!("ekkfs: short write to inode {ino}, {done} of {} bytes", buf.len());
                Ok(done)
            }
            None => Ok(done),
        }
    }

    pub fn stat(&mut self, name: &str) -> Result<Stat> {
        self.ensure_mounted()?;
        let (index, inode) = self.lookup(name)?;
        Ok(Stat::new(index, &inode))
    }

    /// 对每个已使用的 inode 调用 `f`，返回文件个数
    pub fn list(&mut self, mut f: impl FnMut(&DirEntry)) -> Result<u32> {
        self.ensure_mounted()?;
        let mut count = 0;
        self.scan_inodes(|index, inode| {
            if inode.is_used() {
                f(&DirEntry::new(index, inode));
                count += 1;
            }
            false
        })?;
        Ok(count)
    }

    /// 从 inode 编号 `start` 起找到第一个已使用的 inode
    pub fn entry_at(&mut self, start: u32) -> Result<Option<DirEntry>> {
        self.ensure_mounted()?;
        let mut entry = None;
        self.scan_inodes(|index, inode| {
            let hit = index >= start && inode.is_used();
            if hit {
                entry = Some(DirEntry::new(index, inode));
            }
            hit
        })?;
        Ok(entry)
    }

    pub fn statfs(&mut self) -> Result<StatFs> {
        self.ensure_mounted()?;
        let sb = self.superblock();
        Ok(StatFs {
            block_size: BLOCK_SIZE as u32,
            total_blocks: sb.total_blocks,
            free_blocks: sb.free_blocks,
            total_inodes: sb.inode_count,
            used_inodes: self.used_inodes()?,
        })
    }

    fn used_inode(&mut self, index: u32) -> Result<DiskInode> {
        let inode = self.read_inode(index)?;
        if inode.is_used() {
            Ok(inode)
        } else {
            Err(Error::NotFound)
        }
    }
}
