//! Cortex-A53 上的寄存器访问、屏障与缓存维护

use core::arch::asm;

use ipc::CoreId;

/// DAIF 中的 I 位
const DAIF_IRQ: u64 = 1 << 7;

/// 当前核心号（MPIDR_EL1.Aff0）
#[inline]
pub fn core_id() -> CoreId {
    let mpidr: u64;
    unsafe {
        asm!("mrs {}, mpidr_el1", out(reg) mpidr, options(nomem, nostack, preserves_flags));
    }
    CoreId((mpidr & 0xFF) as u8)
}

/// 屏蔽 IRQ，返回屏蔽前 IRQ 是否开启
#[inline]
pub fn critical_enter() -> bool {
    let daif: u64;
    unsafe {
        asm!("mrs {}, daif", out(reg) daif, options(nomem, nostack, preserves_flags));
        asm!("msr daifset, #2", options(nomem, nostack, preserves_flags));
    }
    daif & DAIF_IRQ == 0
}

/// 仅当进入前 IRQ 是开启的才重新开启
#[inline]
pub fn critical_exit(irq_was_enabled: bool) {
    if irq_was_enabled {
        enable_irq();
    }
}

#[inline]
pub fn enable_irq() {
    unsafe {
        asm!("msr daifclr, #2", options(nomem, nostack, preserves_flags));
    }
}

#[inline]
pub fn dmb() {
    unsafe {
        asm!("dmb sy", options(nostack, preserves_flags));
    }
}

#[inline]
pub fn dsb() {
    unsafe {
        asm!("dsb sy", options(nostack, preserves_flags));
    }
}

#[inline]
pub fn sev() {
    unsafe {
        asm!("sev", options(nomem, nostack, preserves_flags));
    }
}

#[inline]
pub fn wfe() {
    unsafe {
        asm!("wfe", options(nomem, nostack, preserves_flags));
    }
}

/// 清理并失效 `addr` 所在的数据缓存行，让 MMU 未开启的核心也能看到
#[inline]
pub fn clean_dcache_line(addr: usize) {
    unsafe {
        asm!("dc civac, {}", in(reg) addr, options(nostack, preserves_flags));
    }
}

/// 设置异常向量表基址
pub fn set_vector_base(base: usize) {
    unsafe {
        asm!("msr vbar_el1, {}", "isb", in(reg) base, options(nomem, nostack));
    }
}

/// 忙等约 `n` 个循环
#[inline]
pub fn delay_cycles(n: u32) {
    for _ in 0..n {
        unsafe {
            asm!("nop", options(nomem, nostack, preserves_flags));
        }
    }
}

/// 停在 `wfe` 上，不再返回
pub fn park() -> ! {
    loop {
        wfe();
    }
}
