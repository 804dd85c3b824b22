//! 建在 EKKFS 上的键值存储
//!
//! 每个命名空间对应一个文件 `kv_<ns>.dat`：开头是 64 字节的头部，其后是
//! [`KV_SLOTS`] 个 32 字节的槽位。键按 djb2 哈希线性探测；删除留下墓碑，
//! 探测时越过墓碑，插入时复用遇到的第一个墓碑。
//!
//! | 头部 | 偏移 | 槽位 | 偏移 |
//! |------|-----:|------|-----:|
//! | magic `"EKKV"` | 0 | key[15]，NUL 结尾 | 0 |
//! | version | 4 | state | 15 |
//! | entry_count | 8 | value_len | 16 |
//! | slots | 12 | value[14] | 17 |
//! | owner | 16 | | |
//! | created | 20 | | |
//! | modified | 28 | | |
//! | namespace[16] | 36 | | |
//! | crc32 | 52 | | |

use arrayvec::ArrayString;
use block_dev::BlockDevice;
use ekkfs::{Error, FileHandle, Filesystem, MAX_NAME_LEN, Result, crc32};
use ipc::ModuleId;

use crate::protocol::{read_u32, write_u32};

pub const KV_MAGIC: u32 = 0x454B_4B56;
const KV_VERSION: u32 = 1;

/// 同时打开的命名空间数
pub const MAX_KV_HANDLES: usize = 4;
/// 每个命名空间的槽位数
pub const KV_SLOTS: u32 = 256;
pub const KV_MAX_KEY_LEN: usize = 14;
pub const KV_MAX_VALUE_LEN: usize = 14;
pub const MAX_NAMESPACE_LEN: usize = 12;
/// 文件名里只放得下命名空间的前 8 字节
const NAMESPACE_IN_NAME: usize = MAX_NAME_LEN - "kv_.dat".len();

const HEADER_SIZE: usize = 64;
const SLOT_SIZE: usize = 32;
const CRC_OFFSET: usize = 52;

type FileName = ArrayString<MAX_NAME_LEN>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Header {
    entry_count: u32,
    slots: u32,
    owner: u8,
    created: u64,
    modified: u64,
    namespace: [u8; 16],
}

impl Header {
    fn new(namespace: &str, owner: u8, now: u64) -> Self {
        let mut name = [0; 16];
        name[..namespace.len()].copy_from_slice(namespace.as_bytes());
        Self {
            entry_count: 0,
            slots: KV_SLOTS,
            owner,
            created: now,
            modified: now,
            namespace: name,
        }
    }

    fn namespace_eq(&self, namespace: &str) -> bool {
        let len = self.namespace.iter().position(|&b| b == 0).unwrap_or(16);
        &self.namespace[..len] == namespace.as_bytes()
    }

    fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut raw = [0u8; HEADER_SIZE];
        write_u32(&mut raw, 0, KV_MAGIC);
        write_u32(&mut raw, 4, KV_VERSION);
        write_u32(&mut raw, 8, self.entry_count);
        write_u32(&mut raw, 12, self.slots);
        raw[16] = self.owner;
        raw[20..28].copy_from_slice(&self.created.to_le_bytes());
        raw[28..36].copy_from_slice(&self.modified.to_le_bytes());
        raw[36..52].copy_from_slice(&self.namespace);
        let crc = crc32(&raw[..CRC_OFFSET]);
        write_u32(&mut raw, CRC_OFFSET, crc);
        raw
    }

    /// 魔数、版本、CRC 不对或计数不合理时返回 [`Error::Corrupt`]
    fn decode(raw: &[u8; HEADER_SIZE]) -> Result<Self> {
        if read_u32(raw, 0) != KV_MAGIC
            || read_u32(raw, 4) != KV_VERSION
            || read_u32(raw, CRC_OFFSET) != crc32(&raw[..CRC_OFFSET])
        {
            return Err(Error::Corrupt);
        }
        let header = Self {
            entry_count: read_u32(raw, 8),
            slots: read_u32(raw, 12),
            owner: raw[16],
            created: u64_at(raw, 20),
            modified: u64_at(raw, 28),
            namespace: {
                let mut name = [0; 16];
                name.copy_from_slice(&raw[36..52]);
                name
            },
        };
        if header.slots == 0 || header.entry_count > header.slots {
            return Err(Error::Corrupt);
        }
        Ok(header)
    }

    fn file_size(&self) -> u64 {
        HEADER_SIZE as u64 + u64::from(self.slots) * SLOT_SIZE as u64
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SlotState {
    Free,
    Used,
    Deleted,
}

#[derive(Debug, Clone, Copy)]
struct Slot {
    state: SlotState,
    key: [u8; KV_MAX_KEY_LEN + 1],
    value_len: u8,
    value: [u8; KV_MAX_VALUE_LEN],
}

impl Slot {
    fn used(key: &str, value: &[u8]) -> Self {
        let mut slot = Self {
            state: SlotState::Used,
            key: [0; KV_MAX_KEY_LEN + 1],
            value_len: value.len() as u8,
            value: [0; KV_MAX_VALUE_LEN],
        };
        slot.key[..key.len()].copy_from_slice(key.as_bytes());
        slot.value[..value.len()].copy_from_slice(value);
        slot
    }

    fn holds(&self, key: &str) -> bool {
        let len = self.key.iter().position(|&b| b == 0).unwrap_or(self.key.len());
        self.state == SlotState::Used && &self.key[..len] == key.as_bytes()
    }

    fn value(&self) -> &[u8] {
        &self.value[..(self.value_len as usize).min(KV_MAX_VALUE_LEN)]
    }

    fn encode(&self) -> [u8; SLOT_SIZE] {
        let mut raw = [0u8; SLOT_SIZE];
        raw[..15].copy_from_slice(&self.key);
        raw[15] = match self.state {
            SlotState::Free => 0,
            SlotState::Used => 1,
            SlotState::Deleted => 2,
        };
        raw[16] = self.value_len;
        raw[17..31].copy_from_slice(&self.value);
        raw
    }

    /// 未知的状态字节按空槽处理
    fn decode(raw: &[u8; SLOT_SIZE]) -> Self {
        let mut key = [0; KV_MAX_KEY_LEN + 1];
        key.copy_from_slice(&raw[..15]);
        let mut value = [0; KV_MAX_VALUE_LEN];
        value.copy_from_slice(&raw[17..31]);
        Self {
            state: match raw[15] {
                1 => SlotState::Used,
                2 => SlotState::Deleted,
                _ => SlotState::Free,
            },
            key,
            value_len: raw[16],
            value,
        }
    }
}

/// 按键查找槽位的结果
enum Lookup {
    Found(u32),
    /// 键不存在；可用于插入的槽位（第一个墓碑或空槽）
    Vacant(Option<u32>),
}

#[derive(Debug, Clone, Copy)]
struct Store {
    file: FileHandle,
    name: FileName,
    header: Header,
    owner: ModuleId,
}

impl Store {
    fn read_slot<D: BlockDevice>(&self, fs: &mut Filesystem<D>, index: u32) -> Result<Slot> {
        let mut file = self.file;
        file.seek(slot_offset(index));
        let mut raw = [0u8; SLOT_SIZE];
        if fs.read(&mut file, &mut raw)? != SLOT_SIZE {
            return Err(Error::Corrupt);
        }
        Ok(Slot::decode(&raw))
    }

    fn write_slot<D: BlockDevice>(
        &self,
        fs: &mut Filesystem<D>,
        index: u32,
        slot: &Slot,
    ) -> Result<()> {
        write_at(fs, self.file, slot_offset(index), &slot.encode())
    }

    /// 修改时间取当前时间，随后立即落盘
    fn save_header<D: BlockDevice>(&mut self, fs: &mut Filesystem<D>) -> Result<()> {
        self.header.modified = fs.now();
        write_at(fs, self.file, 0, &self.header.encode())
    }

    fn find<D: BlockDevice>(&self, fs: &mut Filesystem<D>, key: &str) -> Result<Lookup> {
        let slots = self.header.slots;
        let start = djb2(key) % slots;
        let mut tombstone = None;
        for step in 0..slots {
            let index = (start + step) % slots;
            let slot = self.read_slot(fs, index)?;
            match slot.state {
                SlotState::Free => return Ok(Lookup::Vacant(tombstone.or(Some(index)))),
                SlotState::Deleted => {
                    tombstone.get_or_insert(index);
                }
                SlotState::Used if slot.holds(key) => return Ok(Lookup::Found(index)),
                SlotState::Used => {}
            }
        }
        Ok(Lookup::Vacant(tombstone))
    }
}

/// 服务端打开的键值存储表。表项属于打开它的模块，模块 0（系统）可以使用任意表项
#[derive(Debug)]
pub struct KvTable {
    stores: [Option<Store>; MAX_KV_HANDLES],
}

impl KvTable {
    pub const fn new() -> Self {
        Self {
            stores: [None; MAX_KV_HANDLES],
        }
    }

    /// 打开（必要时创建）命名空间，返回句柄。
    ///
    /// 命名空间已被打开，或与另一个命名空间落到同一个文件上时返回 [`Error::Exists`]。
    pub fn open<D: BlockDevice>(
        &mut self,
        fs: &mut Filesystem<D>,
        namespace: &str,
        owner: ModuleId,
    ) -> Result<u32> {
        if namespace.is_empty()
            || namespace.len() > MAX_NAMESPACE_LEN
            || namespace.contains('\0')
        {
            return Err(Error::Invalid);
        }
        if self.stores.iter().flatten().any(|store| store.header.namespace_eq(namespace)) {
            return Err(Error::Exists);
        }
        let index = self
            .stores
            .iter()
            .position(Option::is_none)
            .ok_or(Error::Full)?;

        let name = file_name(namespace);
        let store = match fs.stat(&name) {
            Ok(stat) => {
                let file = fs.open(&name)?;
                let mut raw = [0u8; HEADER_SIZE];
                let mut cursor = file;
                if fs.read(&mut cursor, &mut raw)? != HEADER_SIZE {
                    return Err(Error::Corrupt);
                }
                let header = Header::decode(&raw)?;
                if u64::from(stat.size) < header.file_size() {
                    return Err(Error::Corrupt);
                }
                if !header.namespace_eq(namespace) {
                    log::warn!("kv: {name} already holds another namespace");
                    return Err(Error::Exists);
                }
                Store { file, name, header, owner }
            }
            Err(Error::NotFound) => {
                fs.create(&name, u16::from(owner.0), Default::default())?;
                let file = fs.open(&name)?;
                let header = Header::new(namespace, owner.0, fs.now());
                write_at(fs, file, 0, &header.encode())?;
                // 只写最后一个槽位，中间留作空洞，读出全零即空槽
                write_at(fs, file, slot_offset(header.slots - 1), &[0; SLOT_SIZE])?;
                log::info!("kv: created {name} for module {owner}");
                Store { file, name, header, owner }
            }
            Err(err) => return Err(err),
        };

        self.stores[index] = Some(store);
        Ok(index as u32)
    }

    pub fn close(&mut self, handle: u32, requester: ModuleId) -> Result<()> {
        let slot = self.slot(handle, requester)?;
        slot.take().map(|_| ()).ok_or(Error::Invalid)
    }

    /// 把值拷进 `out`（放不下的部分截掉），返回值的完整长度
    pub fn get<D: BlockDevice>(
        &mut self,
        fs: &mut Filesystem<D>,
        handle: u32,
        requester: ModuleId,
        key: &str,
        out: &mut [u8],
    ) -> Result<usize> {
        check_key(key)?;
        let store = *self.store(handle, requester)?;
        let Lookup::Found(index) = store.find(fs, key)? else {
            return Err(Error::NotFound);
        };
        let slot = store.read_slot(fs, index)?;
        let value = slot.value();
        let len = value.len().min(out.len());
        out[..len].copy_from_slice(&value[..len]);
        Ok(value.len())
    }

    /// 插入或覆盖。所有槽位都有效时返回 [`Error::Full`]
    pub fn put<D: BlockDevice>(
        &mut self,
        fs: &mut Filesystem<D>,
        handle: u32,
        requester: ModuleId,
        key: &str,
        value: &[u8],
    ) -> Result<()> {
        check_key(key)?;
        if value.len() > KV_MAX_VALUE_LEN {
            return Err(Error::Invalid);
        }
        let store = self.store(handle, requester)?;
        let slot = Slot::used(key, value);
        match store.find(fs, key)? {
            Lookup::Found(index) => store.write_slot(fs, index, &slot)?,
            Lookup::Vacant(Some(index)) if store.header.entry_count < store.header.slots => {
                store.write_slot(fs, index, &slot)?;
                store.header.entry_count += 1;
            }
            Lookup::Vacant(_) => return Err(Error::Full),
        }
        store.save_header(fs)
    }

    /// 槽位改为墓碑
    pub fn delete<D: BlockDevice>(
        &mut self,
        fs: &mut Filesystem<D>,
        handle: u32,
        requester: ModuleId,
        key: &str,
    ) -> Result<()> {
        check_key(key)?;
        let store = self.store(handle, requester)?;
        let Lookup::Found(index) = store.find(fs, key)? else {
            return Err(Error::NotFound);
        };
        let mut slot = store.read_slot(fs, index)?;
        slot.state = SlotState::Deleted;
        store.write_slot(fs, index, &slot)?;
        store.header.entry_count = store.header.entry_count.saturating_sub(1);
        store.save_header(fs)
    }

    pub fn count(&mut self, handle: u32, requester: ModuleId) -> Result<u32> {
        Ok(self.store(handle, requester)?.header.entry_count)
    }

    /// 句柄对应的文件名
    pub fn file_name(&mut self, handle: u32, requester: ModuleId) -> Result<&str> {
        Ok(self.store(handle, requester)?.name.as_str())
    }

    /// 关闭 `owner` 打开的全部命名空间，返回关闭的个数
    pub fn release_owner(&mut self, owner: ModuleId) -> usize {
        let mut count = 0;
        for slot in &mut self.stores {
            if slot.is_some_and(|store| store.owner == owner) {
                *slot = None;
                count += 1;
            }
        }
        count
    }

    pub fn open_count(&self) -> usize {
        self.stores.iter().flatten().count()
    }

    fn store(&mut self, handle: u32, requester: ModuleId) -> Result<&mut Store> {
        self.slot(handle, requester)?.as_mut().ok_or(Error::Invalid)
    }

    fn slot(&mut self, handle: u32, requester: ModuleId) -> Result<&mut Option<Store>> {
        let slot = self.stores.get_mut(handle as usize).ok_or(Error::Invalid)?;
        if requester != ModuleId::SYSTEM && slot.is_some_and(|store| store.owner != requester) {
            return Err(Error::Invalid);
        }
        Ok(slot)
    }
}

impl Default for KvTable {
    fn default() -> Self {
        Self::new()
    }
}

/// `kv_<ns>.dat`，命名空间超出 8 字节的部分被截掉
fn file_name(namespace: &str) -> FileName {
    let mut end = namespace.len().min(NAMESPACE_IN_NAME);
    while !namespace.is_char_boundary(end) {
        end -= 1;
    }
    let mut name = FileName::new();
    // 截断后必定放得下
    let _ = name.try_push_str("kv_");
    let _ = name.try_push_str(&namespace[..end]);
    let _ = name.try_push_str(".dat");
    name
}

fn check_key(key: &str) -> Result<()> {
    if key.is_empty() || key.contains('\0') {
        return Err(Error::Invalid);
    }
    if key.len() > KV_MAX_KEY_LEN {
        return Err(Error::NameTooLong);
    }
    Ok(())
}

/// `hash * 33 + c`
fn djb2(key: &str) -> u32 {
    key.bytes()
        .fold(5381u32, |hash, c| hash.wrapping_mul(33).wrapping_add(c as u32))
}

#[inline]
fn slot_offset(index: u32) -> u32 {
    HEADER_SIZE as u32 + index * SLOT_SIZE as u32
}

fn u64_at(raw: &[u8], offset: usize) -> u64 {
    let mut word = [0; 8];
    word.copy_from_slice(&raw[offset..offset + 8]);
    u64::from_le_bytes(word)
}

/// 系统身份写入，文件的访问控制由句柄表负责
fn write_at<D: BlockDevice>(
    fs: &mut Filesystem<D>,
    mut file: FileHandle,
    pos: u32,
    data: &[u8],
) -> Result<()> {
    file.seek(pos);
    match fs.write(&mut file, data, 0)? {
        n if n == data.len() => Ok(()),
        _ => Err(Error::Full),
    }
}
