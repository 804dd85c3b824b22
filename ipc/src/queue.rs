//! 消息队列集合
//!
//! `rings[dest][sender]` 是从核心 `sender` 到核心 `dest` 的队列，
//! 所以每条队列恰有一个生产核与一个消费核。接收方在各发送方的队列之间轮询，
//! 同一发送方发来的消息保持先进先出，不同发送方之间没有全局顺序。

use core::sync::atomic::{AtomicU32, Ordering};

use spin::Mutex;

use crate::ring::{Frame, Ring};
use crate::{CoreId, Error, MAX_PAYLOAD, ModuleId, Result};

/// 收到消息后的回调：（信封, 负载）
pub type Callback = fn(&Envelope, &[u8]);

/// 一帧消息的元数据
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Envelope {
    pub sender: ModuleId,
    pub kind: u8,
    /// 消息原长，可能大于实际拷贝到接收缓冲区的字节数
    pub len: usize,
}

pub struct QueueSet<const N: usize> {
    rings: [[Ring; N]; N],
    /// 每个接收核下一次优先查看的发送方
    cursors: [AtomicU32; N],
    callbacks: Mutex<[Option<Callback>; N]>,
}

impl<const N: usize> QueueSet<N> {
    pub const fn new() -> Self {
        Self {
            rings: [const { [const { Ring::new() }; N] }; N],
            cursors: [const { AtomicU32::new(0) }; N],
            callbacks: Mutex::new([None; N]),
        }
    }

    /// 由核心 `from` 发送。`dest` 为 [`ModuleId::BROADCAST`] 时投递给其它所有核心，
    /// 任一队列已满时返回 [`Error::NoMemory`]，其余队列照常投递。
    pub fn send(&self, from: CoreId, dest: ModuleId, kind: u8, payload: &[u8]) -> Result<()> {
        if payload.len() > MAX_PAYLOAD || from.index() >= N {
            return Err(Error::InvalidArg);
        }
        let frame = Frame::new(from.module().0, kind, payload);

        if dest.is_broadcast() {
            let mut delivered = true;
            for core in (0..N).filter(|&core| core != from.index()) {
                delivered &= self.rings[core][from.index()].push(&frame);
            }
            return if delivered {
                Ok(())
            } else {
                log::debug!("broadcast from core {from} hit a full queue");
                Err(Error::NoMemory)
            };
        }

        let dest = match dest.core() {
            Some(core) if core.index() < N => core,
            _ => return Err(Error::InvalidArg),
        };
        if self.rings[dest.index()][from.index()].push(&frame) {
            Ok(())
        } else {
            Err(Error::NoMemory)
        }
    }

    /// 核心 `core` 取出一帧，负载按 `buf` 的长度截断。没有消息时返回 [`Error::NotFound`]
    pub fn recv(&self, core: CoreId, buf: &mut [u8]) -> Result<Envelope> {
        let frame = self.pop(core)?;
        let data = frame.data();
        let len = data.len().min(buf.len());
        buf[..len].copy_from_slice(&data[..len]);
        Ok(Envelope {
            sender: ModuleId(frame.sender),
            kind: frame.kind,
            len: data.len(),
        })
    }

    pub fn set_callback(&self, core: CoreId, callback: Option<Callback>) {
        if let Some(slot) = self.callbacks.lock().get_mut(core.index()) {
            *slot = callback;
        }
    }

    /// 取尽 `core` 的所有消息并逐一交给回调，返回处理的帧数。
    /// 没有设置回调时不取出任何消息。
    pub fn poll(&self, core: CoreId) -> usize {
        let Some(callback) = self.callbacks.lock().get(core.index()).copied().flatten() else {
            return 0;
        };

        let mut count = 0;
        while let Ok(frame) = self.pop(core) {
            let envelope = Envelope {
                sender: ModuleId(frame.sender),
                kind: frame.kind,
                len: frame.len as usize,
            };
            callback(&envelope, frame.data());
            count += 1;
        }
        count
    }

    /// 发往 `core` 的待收消息总数
    pub fn count(&self, core: CoreId) -> usize {
        self.rings
            .get(core.index())
            .map_or(0, |rings| rings.iter().map(Ring::len).sum())
    }

    #[inline]
    pub fn has_message(&self, core: CoreId) -> bool {
        self.rings
            .get(core.index())
            .is_some_and(|rings| rings.iter().any(|ring| !ring.is_empty()))
    }

    fn pop(&self, core: CoreId) -> Result<Frame> {
        let rings = self.rings.get(core.index()).ok_or(Error::InvalidArg)?;
        let cursor = &self.cursors[core.index()];
        let start = cursor.load(Ordering::Relaxed) as usize;

        for i in 0..N {
            let sender = (start + i) % N;
            if let Some(frame) = rings[sender].pop() {
                cursor.store(((sender + 1) % N) as u32, Ordering::Relaxed);
                return Ok(frame);
            }
        }
        Err(Error::NotFound)
    }
}

impl<const N: usize> Default for QueueSet<N> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use super::*;
    use crate::{MAX_CORES, QUEUE_DEPTH};

    type Queues = QueueSet<MAX_CORES>;

    fn queues() -> Box<Queues> {
        Box::new(Queues::new())
    }

    #[test]
    fn core0_to_fs_module() {
        let q = queues();
        q.send(CoreId(0), ModuleId(4), 0x20, b"open").unwrap();
        assert!(q.has_message(CoreId(3)));
        assert!(!q.has_message(CoreId(0)));

        let mut buf = [0; 64];
        let env = q.recv(CoreId(3), &mut buf).unwrap();
        assert_eq!(ModuleId(1), env.sender);
        assert_eq!(0x20, env.kind);
        assert_eq!(b"open", &buf[..env.len]);
        assert_eq!(Err(Error::NotFound), q.recv(CoreId(3), &mut buf));
    }

    #[test]
    fn rejects_bad_arguments() {
        let q = queues();
        assert_eq!(
            Err(Error::InvalidArg),
            q.send(CoreId(0), ModuleId(2), 0, &[0; MAX_PAYLOAD + 1])
        );
        assert_eq!(Err(Error::InvalidArg), q.send(CoreId(0), ModuleId(5), 0, b""));
        assert_eq!(Err(Error::InvalidArg), q.send(CoreId(4), ModuleId(1), 0, b""));
        assert!(q.send(CoreId(0), ModuleId(2), 0, &[0; MAX_PAYLOAD]).is_ok());
    }

    #[test]
    fn full_queue_then_fifo_drain() {
        let q = queues();
        for i in 0..QUEUE_DEPTH - 1 {
            q.send(CoreId(1), ModuleId(1), 0, &[i as u8]).unwrap();
        }
        assert_eq!(Err(Error::NoMemory), q.send(CoreId(1), ModuleId(1), 0, b"x"));
        // 其它发送方不受影响
        q.send(CoreId(2), ModuleId(1), 9, b"y").unwrap();
        assert_eq!(QUEUE_DEPTH, q.count(CoreId(0)));

        let mut buf = [0; 1];
        let mut from_core1 = Vec::new();
        while let Ok(env) = q.recv(CoreId(0), &mut buf) {
            if env.sender == ModuleId(2) {
                from_core1.push(buf[0]);
            }
        }
        let expected: Vec<u8> = (0..QUEUE_DEPTH as u8 - 1).collect();
        assert_eq!(expected, from_core1);
    }

    #[test]
    fn recv_truncates() {
        let q = queues();
        q.send(CoreId(2), ModuleId(1), 1, b"truncated payload").unwrap();
        let mut buf = [0; 4];
        let env = q.recv(CoreId(0), &mut buf).unwrap();
        assert_eq!(17, env.len);
        assert_eq!(b"trun", &buf);
    }

    #[test]
    fn broadcast_skips_sender() {
        let q = queues();
        q.send(CoreId(1), ModuleId::BROADCAST, 3, b"hi").unwrap();
        assert_eq!(0, q.count(CoreId(1)));
        for core in [0, 2, 3] {
            assert_eq!(1, q.count(CoreId(core)));
        }

        // 核心 0 的队列满了，其余核心仍收到
        for _ in 0..QUEUE_DEPTH - 2 {
            q.send(CoreId(1), ModuleId(1), 0, b"").unwrap();
        }
        assert_eq!(
            Err(Error::NoMemory),
            q.send(CoreId(1), ModuleId::BROADCAST, 3, b"again")
        );
        assert_eq!(2, q.count(CoreId(2)));
        assert_eq!(2, q.count(CoreId(3)));
    }

    #[test]
    fn round_robin_between_senders() {
        let q = queues();
        for _ in 0..2 {
            q.send(CoreId(1), ModuleId(1), 0, b"").unwrap();
            q.send(CoreId(2), ModuleId(1), 0, b"").unwrap();
        }
        let mut buf = [0u8; 0];
        let senders: Vec<u8> = (0..4)
            .map(|_| q.recv(CoreId(0), &mut buf).unwrap().sender.0)
            .collect();
        assert_eq!(vec![2, 3, 2, 3], senders);
    }

    static DELIVERED: AtomicUsize = AtomicUsize::new(0);

    fn on_message(env: &Envelope, data: &[u8]) {
        assert_eq!(env.len, data.len());
        DELIVERED.fetch_add(data.len(), Ordering::SeqCst);
    }

    #[test]
    fn poll_drains_through_callback() {
        let q = queues();
        q.send(CoreId(0), ModuleId(3), 0, b"abc").unwrap();
        q.send(CoreId(1), ModuleId(3), 0, b"de").unwrap();
        assert_eq!(0, q.poll(CoreId(2)));
        assert_eq!(2, q.count(CoreId(2)));

        q.set_callback(CoreId(2), Some(on_message));
        assert_eq!(2, q.poll(CoreId(2)));
        assert_eq!(5, DELIVERED.load(Ordering::SeqCst));
        assert!(!q.has_message(CoreId(2)));
    }
}
