//! ARM 通用计时器
//!
//! CNTPCT_EL0 是一个自上电起单调递增的 64 位计数器，频率由固件写入 CNTFRQ_EL0，
//! 树莓派 3 上为 19.2 MHz。各核读到的是同一个计数器。

use core::arch::asm;
use core::sync::atomic::{AtomicU64, Ordering};

use crate::config::DEFAULT_TIMER_FREQ_HZ;

const MICROSECONDS: u64 = 1_000_000;

static BASE: AtomicU64 = AtomicU64::new(0);
static FREQ: AtomicU64 = AtomicU64::new(DEFAULT_TIMER_FREQ_HZ);

/// 由 0 号核调用一次，记下频率与起点
pub fn init() {
    let freq = frequency_register();
    if freq > 0 {
        FREQ.store(freq, Ordering::Relaxed);
    }
    BASE.store(counter(), Ordering::Release);
    log::info!("timer: {} Hz", FREQ.load(Ordering::Relaxed));
}

/// 读取 CNTPCT_EL0
#[inline]
pub fn counter() -> u64 {
    let count: u64;
    unsafe {
        asm!("isb", "mrs {}, cntpct_el0", out(reg) count, options(nomem, nostack));
    }
    count
}

fn frequency_register() -> u64 {
    let freq: u64;
    unsafe {
        asm!("mrs {}, cntfrq_el0", out(reg) freq, options(nomem, nostack, preserves_flags));
    }
    freq
}

/// 自 [`init`] 起经过的微秒数，也是文件系统的时间来源
pub fn time_us() -> u64 {
    let ticks = counter().wrapping_sub(BASE.load(Ordering::Acquire));
    let freq = FREQ.load(Ordering::Relaxed);
    // 先除后乘，避免 64 位乘法溢出
    ticks / freq * MICROSECONDS + ticks % freq * MICROSECONDS / freq
}
