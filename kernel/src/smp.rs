//! 多核启动与核间中断
//!
//! 上电后 1~3 号核停在固件的自旋表里，等各自的释放槽被写入非零地址。
//! 0 号核把 `secondary_start` 写进槽里再 `sev`，从核就从那里进入本内核。

use core::sync::atomic::{AtomicU32, Ordering};

use ipc::atomic::{atomic_inc, load_acquire, store_release};
use ipc::{CoreId, Error, Result};
use spin::Mutex;

use crate::arch;
use crate::config::{MAX_CORES, RELEASE_SLOTS};
use crate::drivers::gic::{Gic, SgiFilter};
use crate::timer;
use crate::trap;

/// 通知对方去看消息队列
pub const IPI_MESSAGE: u8 = 0;
/// 让对方停机
pub const IPI_HALT: u8 = 1;

type EntryFn = fn(CoreId);

static READY: [AtomicU32; MAX_CORES] = [const { AtomicU32::new(0) }; MAX_CORES];
static ENTRIES: Mutex<[Option<EntryFn>; MAX_CORES]> = Mutex::new([None; MAX_CORES]);
static IPI_RECEIVED: [AtomicU32; MAX_CORES] = [const { AtomicU32::new(0) }; MAX_CORES];

unsafe extern "C" {
    fn secondary_start();
}

/// 0 号核自己总是就绪的
pub fn init() {
    store_release(&READY[0], 1);
}

pub fn is_core_ready(core: CoreId) -> bool {
    core.is_valid() && load_acquire(&READY[core.index()]) != 0
}

/// 释放 `core` 号从核，让它在完成本核初始化后执行 `entry`
pub fn start_core(core: CoreId, entry: EntryFn) -> Result<()> {
    if core.0 == 0 || !core.is_valid() || is_core_ready(core) {
        return Err(Error::InvalidArg);
    }
    ENTRIES.lock()[core.index()] = Some(entry);
    arch::dmb();

    let slot = RELEASE_SLOTS[core.index()];
    unsafe { (slot as *mut u64).write_volatile(secondary_start as usize as u64) };
    // 从核还没开 MMU 与缓存，直接读内存
    arch::dmb();
    arch::clean_dcache_line(slot);
    arch::dsb();
    arch::sev();

    log::debug!("smp: released core {core} via {slot:#x}");
    Ok(())
}

pub fn start_all_cores(entry: EntryFn) {
    for id in 1..MAX_CORES as u8 {
        if let Err(err) = start_core(CoreId(id), entry) {
            log::warn!("smp: core {id} not started: {err:?}");
        }
    }
}

/// 超时为 0 表示一直等
pub fn wait_core_ready(core: CoreId, timeout_us: u64) -> bool {
    if !core.is_valid() {
        return false;
    }
    let start = timer::time_us();
    while !is_core_ready(core) {
        if timeout_us != 0 && timer::time_us() - start >= timeout_us {
            return false;
        }
        core::hint::spin_loop();
    }
    true
}

/// 返回就绪的核心数（包括 0 号核）
pub fn wait_all_cores_ready(timeout_us: u64) -> usize {
    (0..MAX_CORES as u8)
        .map(CoreId)
        .filter(|&core| {
            let ready = wait_core_ready(core, timeout_us);
            if !ready {
                log::error!("smp: core {core} not ready after {timeout_us} us");
            }
            ready
        })
        .count()
}

pub fn send_ipi(target: CoreId, sgi: u8) {
    if !target.is_valid() {
        return;
    }
    Gic::new().send_sgi(SgiFilter::List, 1 << target.0, sgi);
}

/// 发给除自己以外的所有核心
pub fn send_ipi_all(sgi: u8) {
    Gic::new().send_sgi(SgiFilter::Others, 0, sgi);
}

pub fn handle_ipi(sgi: u32) {
    let core = arch::core_id();
    atomic_inc(&IPI_RECEIVED[core.index()]);
    match sgi as u8 {
        IPI_MESSAGE => {}
        IPI_HALT => {
            log::info!("smp: halt requested");
            arch::critical_enter();
            arch::park();
        }
        other => log::debug!("smp: unexpected SGI {other}"),
    }
}

pub fn ipi_count(core: CoreId) -> u32 {
    IPI_RECEIVED
        .get(core.index())
        .map_or(0, |count| count.load(Ordering::Relaxed))
}

/// 打开本核的 GIC CPU 接口，并放行核间中断
pub fn init_local_irq() {
    let mut gic = Gic::new();
    if !gic.is_ready() {
        log::warn!("smp: distributor not initialized, IRQs stay off");
        return;
    }
    gic.cpu_init();
    for sgi in [IPI_MESSAGE, IPI_HALT] {
        gic.set_priority(sgi as u32, 0x80);
        gic.enable_irq(sgi as u32);
    }
    arch::enable_irq();
}

/// 从核的 Rust 入口，由 `entry.S` 在降到 EL1 后调用
#[unsafe(no_mangle)]
extern "C" fn secondary_entry(core_id: usize) -> ! {
    let core = CoreId(core_id as u8);
    trap::init();
    init_local_irq();
    store_release(&READY[core.index()], 1);
    log::info!("smp: core {core} online");

    let entry = ENTRIES.lock()[core.index()];
    match entry {
        Some(entry) => entry(core),
        None => log::warn!("smp: core {core} released without an entry"),
    }
    arch::park()
}
