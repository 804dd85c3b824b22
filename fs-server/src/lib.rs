//! # 文件系统服务
//!
//! EKKFS 只由一个核心（核心 3，模块 4）持有。其它核心把 [`Request`]
//! 装进类型为 [`MSG_FS_REQUEST`] 的消息帧发过来，[`FsServer`] 逐条处理，
//! 再以 [`MSG_FS_RESPONSE`] 回复给发送方所在的核心。
//!
//! 服务还在文件系统上维护两个系统文件：配置文件 `system.cfg` 与滚动日志 `system.log`。
//! 类型为 [`MSG_DB_REQUEST`] 的消息交给建在文件之上的键值存储 [`KvTable`]。

#![cfg_attr(not(test), no_std)]

mod config;
mod handles;
mod kv;
mod protocol;
mod server;
mod syslog;

#[cfg(test)]
mod tests;

pub use self::{
    config::{CONFIG_FILE, Config, MAX_ENTRIES, MAX_KEY_LEN, MAX_VALUE_LEN},
    handles::{Handle, HandleTable, MAX_OPEN_FILES},
    kv::{
        KV_MAGIC, KV_MAX_KEY_LEN, KV_MAX_VALUE_LEN, KV_SLOTS, KvTable, MAX_KV_HANDLES,
        MAX_NAMESPACE_LEN,
    },
    protocol::{
        Command, DbCommand, MSG_DB_REQUEST, MSG_DB_RESPONSE, MSG_FS_REQUEST, MSG_FS_RESPONSE,
        READ_MAX, Request, Response, WRITE_MAX,
    },
    server::{FS_CORE, FsServer},
    syslog::{LOG_FILE, SysLog},
};
