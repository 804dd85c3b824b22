//! 32 位原子原语
//!
//! 在 Cortex-A53 上这些操作会被编译为 `ldaxr`/`stlxr` 的独占访问循环。

use core::hint;
use core::ops::{Deref, DerefMut};
use core::sync::atomic::{AtomicBool, AtomicU32, Ordering, fence};

/// 完整的内存屏障
#[inline]
pub fn memory_barrier() {
    fence(Ordering::SeqCst);
}

/// 仅当 `*word == expected` 时写入 `desired`，返回是否写入
#[inline]
pub fn cas32(word: &AtomicU32, expected: u32, desired: u32) -> bool {
    word.compare_exchange(expected, desired, Ordering::AcqRel, Ordering::Acquire)
        .is_ok()
}

/// 返回加一后的值
#[inline]
pub fn atomic_inc(word: &AtomicU32) -> u32 {
    word.fetch_add(1, Ordering::AcqRel).wrapping_add(1)
}

/// 返回减一后的值
#[inline]
pub fn atomic_dec(word: &AtomicU32) -> u32 {
    word.fetch_sub(1, Ordering::AcqRel).wrapping_sub(1)
}

#[inline]
pub fn load_acquire(word: &AtomicU32) -> u32 {
    word.load(Ordering::Acquire)
}

#[inline]
pub fn store_release(word: &AtomicU32, value: u32) {
    word.store(value, Ordering::Release);
}

/// 自旋锁，只用于跨核共享的控制块
#[derive(Debug, Default)]
pub struct SpinLock {
    locked: AtomicBool,
}

impl SpinLock {
    pub const fn new() -> Self {
        Self {
            locked: AtomicBool::new(false),
        }
    }

    pub fn lock(&self) {
        while self
            .locked
            .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            // 持有期间只做普通读
            while self.locked.load(Ordering::Relaxed) {
                hint::spin_loop();
            }
        }
    }

    pub fn try_lock(&self) -> bool {
        self.locked
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    }

    pub fn unlock(&self) {
        self.locked.store(false, Ordering::Release);
    }

    #[inline]
    pub fn is_locked(&self) -> bool {
        self.locked.load(Ordering::Relaxed)
    }

    /// 加锁并返回守卫，守卫离开作用域时解锁
    pub fn guard<'a, T>(&'a self, data: &'a mut T) -> SpinGuard<'a, T> {
        self.lock();
        SpinGuard { lock: self, data }
    }
}

pub struct SpinGuard<'a, T> {
    lock: &'a SpinLock,
    data: &'a mut T,
}

impl<T> Deref for SpinGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        self.data
    }
}

impl<T> DerefMut for SpinGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.data
    }
}

impl<T> Drop for SpinGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.unlock();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::thread;

    use super::*;

    #[test]
    fn cas_mismatch_does_not_write() {
        let word = AtomicU32::new(5);
        assert!(!cas32(&word, 4, 9));
        assert_eq!(5, load_acquire(&word));
        assert!(cas32(&word, 5, 9));
        assert_eq!(9, load_acquire(&word));
    }

    #[test]
    fn inc_dec_return_new_value() {
        let word = AtomicU32::new(0);
        assert_eq!(1, atomic_inc(&word));
        assert_eq!(2, atomic_inc(&word));
        assert_eq!(1, atomic_dec(&word));
        store_release(&word, 0);
        assert_eq!(u32::MAX, atomic_dec(&word));
    }

    #[test]
    fn try_lock_fails_while_held() {
        let lock = SpinLock::new();
        assert!(lock.try_lock());
        assert!(!lock.try_lock());
        lock.unlock();
        assert!(!lock.is_locked());

        let mut value = 1;
        {
            let mut guard = lock.guard(&mut value);
            *guard += 1;
            assert!(lock.is_locked());
        }
        assert!(!lock.is_locked());
        assert_eq!(2, value);
    }

    #[test]
    fn lock_serializes_threads() {
        struct Shared {
            lock: SpinLock,
            counter: AtomicU32,
        }

        let shared = Arc::new(Shared {
            lock: SpinLock::new(),
            counter: AtomicU32::new(0),
        });
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let shared = shared.clone();
                thread::spawn(move || {
                    for _ in 0..1000 {
                        shared.lock.lock();
                        // 非原子的读改写，只有锁能保证结果正确
                        let value = shared.counter.load(Ordering::Relaxed);
                        shared.counter.store(value + 1, Ordering::Relaxed);
                        shared.lock.unlock();
                    }
                })
            })
            .collect();
        handles.into_iter().for_each(|h| h.join().unwrap());
        assert_eq!(4000, shared.counter.load(Ordering::Relaxed));
    }
}
