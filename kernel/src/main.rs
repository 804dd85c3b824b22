#![no_std]
#![no_main]

#[macro_use]
mod console;

mod arch;
mod config;
mod drivers;
mod fs;
mod lang_items;
mod logging;
mod ptr;
mod smp;
mod sync;
mod timer;
mod trap;

use core::arch::global_asm;
use core::slice;

use fs_server::FS_CORE;
use ipc::{CoreId, Envelope, ModuleId};

use crate::config::{CORE_READY_TIMEOUT_US, KERNEL_STACK_SIZE, MAX_CORES};
use crate::drivers::Gic;
use crate::fs::QUEUES;

global_asm!(include_str!("entry.S"));

unsafe extern "C" {
    fn sbss();
    fn ebss();
    fn boot_stack_lower_bound();
    fn boot_stack_top();
}

/// 开机完成后广播给其它核心，负载为就绪核数
const MSG_BOOT_DONE: u8 = 0x01;

fn clear_bss() {
    let start = sbss as usize;
    let len = ebss as usize - start;
    unsafe { slice::from_raw_parts_mut(start as *mut u8, len).fill(0) };
}

#[unsafe(no_mangle)]
extern "C" fn rust_main() -> ! {
    clear_bss();
    console::init();
    logging::init();
    log::info!("boot: core 0 at EL1");
    let (lower, top) = (boot_stack_lower_bound as usize, boot_stack_top as usize);
    debug_assert_eq!(top - lower, KERNEL_STACK_SIZE * MAX_CORES);
    log::debug!("boot: stacks {lower:#x}..{top:#x}");

    trap::init();
    timer::init();
    Gic::new().dist_init();
    smp::init();
    smp::init_local_irq();

    smp::start_all_cores(secondary_main);
    let ready = smp::wait_all_cores_ready(CORE_READY_TIMEOUT_US);
    log::info!("boot: {ready}/{MAX_CORES} cores ready");

    let core = arch::core_id();
    if smp::is_core_ready(FS_CORE) && fs::self_check(core) {
        log::info!("boot: filesystem online");
    } else {
        log::warn!("boot: running without filesystem");
    }

    if QUEUES
        .send(core, ModuleId::BROADCAST, MSG_BOOT_DONE, &[ready as u8])
        .is_ok()
    {
        smp::send_ipi_all(smp::IPI_MESSAGE);
    }

    idle(core)
}

/// 从核完成本核初始化后进入这里
fn secondary_main(core: CoreId) {
    if core == FS_CORE {
        fs::serve(core);
    }
    idle(core);
}

fn on_message(envelope: &Envelope, payload: &[u8]) {
    match envelope.kind {
        MSG_BOOT_DONE => log::info!(
            "boot done, {} cores ready, {} IPIs so far",
            payload.first().copied().unwrap_or(0),
            smp::ipi_count(arch::core_id())
        ),
        kind => log::info!(
            "message {kind:#04x} from module {}, {} bytes",
            envelope.sender,
            payload.len()
        ),
    }
}

/// 轮询消息，空闲时让出流水线
fn idle(core: CoreId) -> ! {
    QUEUES.set_callback(core, Some(on_message));
    loop {
        if QUEUES.poll(core) == 0 {
            core::hint::spin_loop();
        }
    }
}
