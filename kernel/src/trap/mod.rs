//! EL1 异常处理
//!
//! 向量表按（来源, 类型）分成 16 项，每项把类型号装进 x0 后跳到公共入口，
//! 公共入口保存调用者保存寄存器、ELR 与 SPSR，再调用 [`trap_handler`]。
//! 内核始终运行在 EL1h，没有用户态，只有 IRQ 会正常返回。

use core::arch::global_asm;

use crate::arch;
use crate::drivers::gic::{Gic, SGI_COUNT, SPURIOUS};
use crate::smp;

global_asm!(include_str!("vectors.S"));

unsafe extern "C" {
    fn __vectors();
}

/// 与 `vectors.S` 中装入 x0 的值一致
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(usize)]
enum Kind {
    Sync = 0,
    Irq = 1,
    Fiq = 2,
    SError = 3,
}

impl Kind {
    fn from_raw(raw: usize) -> Option<Self> {
        match raw {
            0 => Some(Self::Sync),
            1 => Some(Self::Irq),
            2 => Some(Self::Fiq),
            3 => Some(Self::SError),
            _ => None,
        }
    }
}

/// 每个核心各自设置
pub fn init() {
    arch::set_vector_base(__vectors as usize);
}

#[unsafe(no_mangle)]
extern "C" fn trap_handler(kind: usize, esr: u64, elr: u64, far: u64) {
    match Kind::from_raw(kind) {
        Some(Kind::Irq) => irq_handler(),
        Some(Kind::Fiq) => log::warn!("trap: unexpected FIQ at {elr:#x}"),
        Some(kind) => {
            // Exception Class
            let ec = (esr >> 26) & 0x3F;
            panic!(
                "Unhandled {kind:?} exception: EC = {ec:#x}, ESR = {esr:#x}, ELR = {elr:#x}, FAR = {far:#x}"
            );
        }
        None => panic!("Bad vector kind {kind}"),
    }
}

fn irq_handler() {
    let mut gic = Gic::new();
    let iar = gic.acknowledge();
    let irq = iar & 0x3FF;
    if irq == SPURIOUS {
        return;
    }

    if irq < SGI_COUNT as u32 {
        smp::handle_ipi(irq);
    } else {
        log::warn!("trap: unhandled IRQ {irq}");
    }
    gic.eoi(iar);
}
