//! 服务端打开文件表
//!
//! 客户端只拿到表项编号，文件位置保存在服务端。
//! 表项属于打开它的模块，模块 0（系统）可以使用任意表项。

use derive_more::{Display, From, Into};
use ekkfs::{Error, FileHandle, Result};
use ipc::ModuleId;

pub const MAX_OPEN_FILES: usize = 16;

/// 打开文件表中的编号
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, From, Into)]
pub struct Handle(pub u32);

#[derive(Debug, Clone, Copy)]
struct Slot {
    file: FileHandle,
    owner: ModuleId,
}

#[derive(Debug)]
pub struct HandleTable {
    slots: [Option<Slot>; MAX_OPEN_FILES],
}

impl HandleTable {
    pub const fn new() -> Self {
        Self {
            slots: [None; MAX_OPEN_FILES],
        }
    }

    /// 表满时返回 [`Error::Full`]
    pub fn alloc(&mut self, file: FileHandle, owner: ModuleId) -> Result<Handle> {
        let (index, slot) = self
            .slots
            .iter_mut()
            .enumerate()
            .find(|(_, slot)| slot.is_none())
            .ok_or(Error::Full)?;
        *slot = Some(Slot { file, owner });
        Ok(Handle(index as u32))
    }

    /// 编号越界、表项空闲或不属于 `requester` 时返回 [`Error::Invalid`]
    pub fn get_mut(&mut self, handle: Handle, requester: ModuleId) -> Result<&mut FileHandle> {
        self.slot(handle, requester)?
            .as_mut()
            .map(|slot| &mut slot.file)
            .ok_or(Error::Invalid)
    }

    pub fn free(&mut self, handle: Handle, requester: ModuleId) -> Result<FileHandle> {
        self.slot(handle, requester)?
            .take()
            .map(|slot| slot.file)
            .ok_or(Error::Invalid)
    }

    /// 关闭 `owner` 打开的所有文件，返回关闭的个数
    pub fn release_owner(&mut self, owner: ModuleId) -> usize {
        let mut count = 0;
        for slot in &mut self.slots {
            if slot.is_some_and(|used| used.owner == owner) {
                *slot = None;
                count += 1;
            }
        }
        count
    }

    pub fn open_count(&self) -> usize {
        self.slots.iter().flatten().count()
    }

    fn slot(&mut self, handle: Handle, requester: ModuleId) -> Result<&mut Option<Slot>> {
        let slot = self.slots.get_mut(handle.0 as usize).ok_or(Error::Invalid)?;
        if requester != ModuleId::SYSTEM && slot.is_some_and(|used| used.owner != requester) {
            return Err(Error::Invalid);
        }
        Ok(slot)
    }
}

impl Default for HandleTable {
    fn default() -> Self {
        Self::new()
    }
}
