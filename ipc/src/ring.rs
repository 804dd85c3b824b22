//! 单生产者单消费者环形队列
//!
//! 生产者先写槽位，再以 release 语义推进 `head`；
//! 消费者以 acquire 语义读取 `head`，取出槽位后再以 release 语义推进 `tail`。
//! `(head + 1) & MASK == tail` 为满，`head == tail` 为空，因此最多容纳
//! `QUEUE_DEPTH - 1` 帧。

use core::cell::UnsafeCell;
use core::sync::atomic::{AtomicU32, Ordering};

use crate::atomic::{load_acquire, store_release};
use crate::{MAX_PAYLOAD, QUEUE_DEPTH};

const MASK: u32 = QUEUE_DEPTH as u32 - 1;

/// 定长消息帧
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(C)]
pub struct Frame {
    /// 发送方模块编号
    pub sender: u8,
    /// 消息类型
    pub kind: u8,
    /// 负载长度
    pub len: u8,
    _reserved: u8,
    pub payload: [u8; MAX_PAYLOAD],
}

impl Frame {
    pub const EMPTY: Self = Self {
        sender: 0,
        kind: 0,
        len: 0,
        _reserved: 0,
        payload: [0; MAX_PAYLOAD],
    };

    /// `payload` 的长度由调用者保证不超过 [`MAX_PAYLOAD`]
    pub fn new(sender: u8, kind: u8, payload: &[u8]) -> Self {
        let mut frame = Self {
            sender,
            kind,
            len: payload.len() as u8,
            ..Self::EMPTY
        };
        frame.payload[..payload.len()].copy_from_slice(payload);
        frame
    }

    #[inline]
    pub fn data(&self) -> &[u8] {
        &self.payload[..self.len as usize]
    }
}

#[repr(C, align(64))]
struct Index(AtomicU32);

/// `head` 与 `tail` 各占一个缓存行
#[repr(C, align(64))]
pub struct Ring {
    head: Index,
    tail: Index,
    slots: UnsafeCell<[Frame; QUEUE_DEPTH]>,
}

// SAFETY: 每个槽位在任一时刻只属于生产者或消费者之一，由 head/tail 的 acquire/release 交接
unsafe impl Sync for Ring {}

impl Ring {
    pub const fn new() -> Self {
        Self {
            head: Index(AtomicU32::new(0)),
            tail: Index(AtomicU32::new(0)),
            slots: UnsafeCell::new([Frame::EMPTY; QUEUE_DEPTH]),
        }
    }

    /// 只能由唯一的生产者调用。满时返回 `false`
    pub fn push(&self, frame: &Frame) -> bool {
        let head = self.head.0.load(Ordering::Relaxed);
        let next = (head + 1) & MASK;
        if next == load_acquire(&self.tail.0) {
            return false;
        }

        // SAFETY: head 处的槽位此时只有生产者能访问
        unsafe {
            (*self.slots.get())[head as usize] = *frame;
        }
        store_release(&self.head.0, next);
        true
    }

    /// 只能由唯一的消费者调用
    pub fn pop(&self) -> Option<Frame> {
        let tail = self.tail.0.load(Ordering::Relaxed);
        if tail == load_acquire(&self.head.0) {
            return None;
        }

        // SAFETY: tail 处的槽位已由生产者发布，此时只有消费者能访问
        let frame = unsafe { (*self.slots.get())[tail as usize] };
        store_release(&self.tail.0, (tail + 1) & MASK);
        Some(frame)
    }

    pub fn len(&self) -> usize {
        let head = load_acquire(&self.head.0);
        let tail = load_acquire(&self.tail.0);
        (head.wrapping_sub(tail) & MASK) as usize
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[inline]
    pub fn is_full(&self) -> bool {
        self.len() == QUEUE_DEPTH - 1
    }
}

impl Default for Ring {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::thread;

    use super::*;

    #[test]
    fn fifo_until_full() {
        let ring = Ring::new();
        for i in 0..QUEUE_DEPTH - 1 {
            assert!(ring.push(&Frame::new(1, 0, &[i as u8])));
        }
        assert!(ring.is_full());
        assert!(!ring.push(&Frame::new(1, 0, b"overflow")));

        for i in 0..QUEUE_DEPTH - 1 {
            assert_eq!(Some(&[i as u8][..]), ring.pop().as_ref().map(Frame::data));
        }
        assert!(ring.is_empty());
        assert_eq!(None, ring.pop());
    }

    #[test]
    fn wraps_around() {
        let ring = Ring::new();
        for round in 0..3 * QUEUE_DEPTH {
            assert!(ring.push(&Frame::new(2, 7, &round.to_le_bytes())));
            let frame = ring.pop().unwrap();
            assert_eq!(&round.to_le_bytes()[..], frame.data());
            assert_eq!((2, 7), (frame.sender, frame.kind));
        }
    }

    #[test]
    fn producer_consumer_threads() {
        let ring = Arc::new(Ring::new());
        let producer = {
            let ring = ring.clone();
            thread::spawn(move || {
                for i in 0..10_000u32 {
                    let frame = Frame::new(1, 0, &i.to_le_bytes());
                    while !ring.push(&frame) {
                        std::hint::spin_loop();
                    }
                }
            })
        };

        let mut expected = 0u32;
        while expected < 10_000 {
            if let Some(frame) = ring.pop() {
                assert_eq!(&expected.to_le_bytes()[..], frame.data());
                expected += 1;
            }
        }
        producer.join().unwrap();
    }
}
