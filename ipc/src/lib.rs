//! # 核间通信
//!
//! 四个核心之间通过固定大小的帧交换消息：
//! 每个（发送核, 接收核）对各有一条单生产者单消费者的环形队列，
//! 广播即向其它每个核心的队列各投递一份。
//!
//! 队列与锁都建立在 [`atomic`] 中的 32 位原子原语之上。

#![cfg_attr(not(test), no_std)]

pub mod atomic;
mod error;
mod id;
mod queue;
mod ring;

pub use self::{
    atomic::{SpinGuard, SpinLock},
    error::{Error, Result},
    id::{CoreId, ModuleId},
    queue::{Callback, Envelope, QueueSet},
    ring::{Frame, Ring},
};

/// 核心数
pub const MAX_CORES: usize = 4;
/// 单帧负载的最大字节数
pub const MAX_PAYLOAD: usize = 64;
/// 每条队列的槽数，必须是 2 的幂
pub const QUEUE_DEPTH: usize = 64;

const _: () = assert!(QUEUE_DEPTH.is_power_of_two());
