//! 文件服务的消息格式
//!
//! 请求与响应都恰好占满一帧的 64 字节负载，多字节字段为小端序。
//!
//! | 请求 | 偏移 | 响应 | 偏移 |
//! |------|-----:|------|-----:|
//! | cmd | 0 | status | 0 |
//! | sender | 1 | cmd | 1 |
//! | req_id | 2 | req_id | 2 |
//! | handle | 4 | result | 4 |
//! | offset | 8 | data[56] | 8 |
//! | length | 12 | | |
//! | data[48] | 16 | | |
//!
//! 键值存储的请求走同一种帧格式，消息类型为 [`MSG_DB_REQUEST`]。

use ekkfs::Error;
use ipc::MAX_PAYLOAD;

/// 请求消息的类型
pub const MSG_FS_REQUEST: u8 = 0x20;
/// 响应消息的类型
pub const MSG_FS_RESPONSE: u8 = 0x21;
/// 键值存储的请求消息
pub const MSG_DB_REQUEST: u8 = 0x30;
/// 键值存储的响应消息
pub const MSG_DB_RESPONSE: u8 = 0x31;

const REQUEST_HEADER: usize = 16;
const RESPONSE_HEADER: usize = 8;

/// 单次写请求最多携带的字节数
pub const WRITE_MAX: usize = MAX_PAYLOAD - REQUEST_HEADER;
/// 单次读请求最多返回的字节数
pub const READ_MAX: usize = MAX_PAYLOAD - RESPONSE_HEADER;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Command {
    Open = 1,
    Close = 2,
    Read = 3,
    Write = 4,
    /// 文件标志放在 `offset` 中
    Create = 5,
    Delete = 6,
    /// 从 `offset` 号 inode 起找下一个文件
    List = 7,
    Stat = 8,
    Seek = 9,
    Sync = 10,
    StatFs = 11,
}

impl TryFrom<u8> for Command {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Ok(match value {
            1 => Self::Open,
            2 => Self::Close,
            3 => Self::Read,
            4 => Self::Write,
            5 => Self::Create,
            6 => Self::Delete,
            7 => Self::List,
            8 => Self::Stat,
            9 => Self::Seek,
            10 => Self::Sync,
            11 => Self::StatFs,
            _ => return Err(Error::Invalid),
        })
    }
}

/// 键值存储的命令。键与命名空间都以 NUL 结尾放在 `data` 中
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum DbCommand {
    /// 返回句柄
    KvOpen = 0x40,
    KvClose = 0x41,
    /// `offset` 为接收缓冲的长度，返回值的完整长度
    KvGet = 0x42,
    /// `data` 为键、NUL、值，`offset` 为值的长度
    KvPut = 0x43,
    KvDelete = 0x44,
    KvCount = 0x45,
}

impl TryFrom<u8> for DbCommand {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Ok(match value {
            0x40 => Self::KvOpen,
            0x41 => Self::KvClose,
            0x42 => Self::KvGet,
            0x43 => Self::KvPut,
            0x44 => Self::KvDelete,
            0x45 => Self::KvCount,
            _ => return Err(Error::Invalid),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Request {
    pub cmd: u8,
    /// 发送方模块编号，服务端以消息帧上的发送方为准
    pub sender: u8,
    pub req_id: u16,
    /// 句柄编号或 inode 编号
    pub handle: u32,
    pub offset: u32,
    pub length: u32,
    /// 以 NUL 结尾的文件名，或写入的数据
    pub data: [u8; WRITE_MAX],
}

impl Request {
    pub const fn new(cmd: Command, req_id: u16) -> Self {
        Self {
            cmd: cmd as u8,
            sender: 0,
            req_id,
            handle: 0,
            offset: 0,
            length: 0,
            data: [0; WRITE_MAX],
        }
    }

    pub const fn db(cmd: DbCommand, req_id: u16) -> Self {
        Self {
            cmd: cmd as u8,
            ..Self::new(Command::Sync, req_id)
        }
    }

    /// 放入文件名，名字装不下（需要保留结尾的 NUL）时返回 [`Error::NameTooLong`]
    pub fn with_name(mut self, name: &str) -> Result<Self, Error> {
        if name.len() >= WRITE_MAX {
            return Err(Error::NameTooLong);
        }
        self.data = [0; WRITE_MAX];
        self.data[..name.len()].copy_from_slice(name.as_bytes());
        Ok(self)
    }

    /// 放入写入的数据，超出部分被截掉，`length` 设为实际放入的长度
    pub fn with_payload(mut self, payload: &[u8]) -> Self {
        let len = payload.len().min(WRITE_MAX);
        self.data[..len].copy_from_slice(&payload[..len]);
        self.length = len as u32;
        self
    }

    /// 放入一条键值对：键、NUL、值，`offset` 设为值的长度
    pub fn with_entry(mut self, key: &str, value: &[u8]) -> Result<Self, Error> {
        let end = key.len() + 1 + value.len();
        if end > WRITE_MAX {
            return Err(Error::Invalid);
        }
        self = self.with_name(key)?;
        self.data[key.len() + 1..end].copy_from_slice(value);
        self.offset = value.len() as u32;
        Ok(self)
    }

    pub fn with_handle(mut self, handle: u32) -> Self {
        self.handle = handle;
        self
    }

    pub fn with_offset(mut self, offset: u32) -> Self {
        self.offset = offset;
        self
    }

    pub fn with_length(mut self, length: u32) -> Self {
        self.length = length;
        self
    }

    pub fn command(&self) -> Result<Command, Error> {
        Command::try_from(self.cmd)
    }

    pub fn db_command(&self) -> Result<DbCommand, Error> {
        DbCommand::try_from(self.cmd)
    }

    /// `data` 中 NUL 之前的部分
    pub fn name(&self) -> Result<&str, Error> {
        let len = self.data.iter().position(|&b| b == 0).unwrap_or(WRITE_MAX);
        core::str::from_utf8(&self.data[..len]).map_err(|_| Error::Invalid)
    }

    /// 由 [`Request::with_entry`] 放入的键与值
    pub fn entry(&self) -> Result<(&str, &[u8]), Error> {
        let key = self.name()?;
        let start = key.len() + 1;
        let end = start + self.offset as usize;
        let value = self.data.get(start..end).ok_or(Error::Invalid)?;
        Ok((key, value))
    }

    /// 不足 64 字节的帧按补零处理，多出的部分被忽略
    pub fn decode(bytes: &[u8]) -> Self {
        let mut raw = [0u8; MAX_PAYLOAD];
        let len = bytes.len().min(MAX_PAYLOAD);
        raw[..len].copy_from_slice(&bytes[..len]);

        let mut data = [0; WRITE_MAX];
        data.copy_from_slice(&raw[REQUEST_HEADER..]);
        Self {
            cmd: raw[0],
            sender: raw[1],
            req_id: u16::from_le_bytes([raw[2], raw[3]]),
            handle: read_u32(&raw, 4),
            offset: read_u32(&raw, 8),
            length: read_u32(&raw, 12),
            data,
        }
    }

    pub fn encode(&self) -> [u8; MAX_PAYLOAD] {
        let mut raw = [0u8; MAX_PAYLOAD];
        raw[0] = self.cmd;
        raw[1] = self.sender;
        raw[2..4].copy_from_slice(&self.req_id.to_le_bytes());
        write_u32(&mut raw, 4, self.handle);
        write_u32(&mut raw, 8, self.offset);
        write_u32(&mut raw, 12, self.length);
        raw[REQUEST_HEADER..].copy_from_slice(&self.data);
        raw
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Response {
    /// 0 表示成功，否则为错误码的相反数
    pub status: u8,
    pub cmd: u8,
    pub req_id: u16,
    pub result: u32,
    pub data: [u8; READ_MAX],
}

impl Response {
    /// 回应 `req` 的空白成功响应
    pub const fn reply_to(req: &Request) -> Self {
        Self {
            status: 0,
            cmd: req.cmd,
            req_id: req.req_id,
            result: 0,
            data: [0; READ_MAX],
        }
    }

    pub fn set_error(&mut self, err: Error) {
        self.status = (-err.code()) as u8;
        self.result = 0;
    }

    /// 把状态字节还原为结果
    pub fn status(&self) -> Result<u32, Error> {
        match self.status {
            0 => Ok(self.result),
            status => Err(Error::from_code(-(status as i32)).unwrap_or(Error::Invalid)),
        }
    }

    pub fn u32_at(&self, offset: usize) -> u32 {
        read_u32(&self.data, offset)
    }

    pub fn decode(bytes: &[u8]) -> Self {
        let mut raw = [0u8; MAX_PAYLOAD];
        let len = bytes.len().min(MAX_PAYLOAD);
        raw[..len].copy_from_slice(&bytes[..len]);

        let mut data = [0; READ_MAX];
        data.copy_from_slice(&raw[RESPONSE_HEADER..]);
        Self {
            status: raw[0],
            cmd: raw[1],
            req_id: u16::from_le_bytes([raw[2], raw[3]]),
            result: read_u32(&raw, 4),
            data,
        }
    }

    pub fn encode(&self) -> [u8; MAX_PAYLOAD] {
        let mut raw = [0u8; MAX_PAYLOAD];
        raw[0] = self.status;
        raw[1] = self.cmd;
        raw[2..4].copy_from_slice(&self.req_id.to_le_bytes());
        write_u32(&mut raw, 4, self.result);
        raw[RESPONSE_HEADER..].copy_from_slice(&self.data);
        raw
    }
}

pub(crate) fn read_u32(buf: &[u8], offset: usize) -> u32 {
    let mut word = [0; 4];
    word.copy_from_slice(&buf[offset..offset + 4]);
    u32::from_le_bytes(word)
}

pub(crate) fn write_u32(buf: &mut [u8], offset: usize, value: u32) {
    buf[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
}
