//! GIC-400 通用中断控制器
//!
//! 分发器（GICD）全系统一个，由 0 号核初始化；CPU 接口（GICC）每核一个，各核自行初始化。
//!
//! Reference
//! - [GICv2 Architecture Specification](https://developer.arm.com/documentation/ihi0048/latest)

use core::sync::atomic::{AtomicBool, Ordering};

use crate::config::{GICC_BASE, GICD_BASE};

/* 分发器寄存器 */

const GICD_CTLR: usize = 0x000;
const GICD_TYPER: usize = 0x004;
const GICD_ISENABLER: usize = 0x100;
const GICD_ICENABLER: usize = 0x180;
const GICD_ISPENDR: usize = 0x200;
const GICD_ICPENDR: usize = 0x280;
const GICD_IPRIORITYR: usize = 0x400;
const GICD_ITARGETSR: usize = 0x800;
const GICD_ICFGR: usize = 0xC00;
const GICD_SGIR: usize = 0xF00;

/* CPU 接口寄存器 */

const GICC_CTLR: usize = 0x000;
const GICC_PMR: usize = 0x004;
const GICC_BPR: usize = 0x008;
const GICC_IAR: usize = 0x00C;
const GICC_EOIR: usize = 0x010;

const ENABLE: u32 = 1;
const DEFAULT_PRIORITY: u8 = 0xA0;
/// 前 32 个是每核私有的 SGI 与 PPI
pub const SPI_BASE: u32 = 32;
pub const SGI_COUNT: u8 = 16;
/// 没有待处理中断时 IAR 读到的值
pub const SPURIOUS: u32 = 1023;

/// 分发器已由 0 号核初始化
static DIST_READY: AtomicBool = AtomicBool::new(false);

/// SGIR 的目标过滤
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum SgiFilter {
    /// 发给 `targets` 指定的核
    List = 0,
    /// 发给除自己以外的所有核
    Others = 1,
    /// 只发给自己
    #[allow(dead_code)]
    SelfOnly = 2,
}

pub struct Gic {
    dist_base: usize,
    cpu_base: usize,
}

impl Gic {
    pub const fn new() -> Self {
        Self {
            dist_base: GICD_BASE,
            cpu_base: GICC_BASE,
        }
    }

    const fn dist(&self, offset: usize) -> *mut u32 {
        (self.dist_base + offset) as *mut u32
    }

    const fn cpu(&self, offset: usize) -> *mut u32 {
        (self.cpu_base + offset) as *mut u32
    }

    /// 每个中断号在寄存器组中占 `bits` 位，返回（寄存器地址, 位移）
    const fn locate(&self, bank: usize, irq: u32, bits: u32) -> (*mut u32, u32) {
        let per_reg = 32 / bits;
        let reg = self.dist(bank + (irq / per_reg) as usize * 4);
        (reg, (irq % per_reg) * bits)
    }

    pub fn num_irqs(&self) -> u32 {
        let typer = unsafe { self.dist(GICD_TYPER).read_volatile() };
        ((typer & 0x1F) + 1) * 32
    }

    /// 关闭分发器，清掉所有使能与挂起，统一优先级，SPI 全部发往 0 号核且为电平触发，再开启
    pub fn dist_init(&mut self) {
        let num_irqs = self.num_irqs();
        let write = |offset: usize, value: u32| unsafe { self.dist(offset).write_volatile(value) };

        write(GICD_CTLR, 0);
        for i in 0..(num_irqs / 32) as usize {
            write(GICD_ICENABLER + i * 4, u32::MAX);
            write(GICD_ICPENDR + i * 4, u32::MAX);
        }
        let priority = u32::from_ne_bytes([DEFAULT_PRIORITY; 4]);
        for i in 0..(num_irqs / 4) as usize {
            write(GICD_IPRIORITYR + i * 4, priority);
        }
        for i in (SPI_BASE / 4) as usize..(num_irqs / 4) as usize {
            write(GICD_ITARGETSR + i * 4, 0x0101_0101);
        }
        for i in (SPI_BASE / 16) as usize..(num_irqs / 16) as usize {
            write(GICD_ICFGR + i * 4, 0);
        }
        write(GICD_CTLR, ENABLE);

        DIST_READY.store(true, Ordering::Release);
        log::info!("gic: distributor up, {num_irqs} irqs");
    }

    /// 接受所有优先级，全部优先级位用于抢占
    pub fn cpu_init(&mut self) {
        unsafe {
            self.cpu(GICC_CTLR).write_volatile(0);
            self.cpu(GICC_PMR).write_volatile(0xFF);
            self.cpu(GICC_BPR).write_volatile(0);
            self.cpu(GICC_CTLR).write_volatile(ENABLE);
        }
    }

    pub fn is_ready(&self) -> bool {
        DIST_READY.load(Ordering::Acquire)
    }

    pub fn enable_irq(&mut self, irq: u32) {
        let (reg, shift) = self.locate(GICD_ISENABLER, irq, 1);
        unsafe { reg.write_volatile(1 << shift) }
    }

    #[allow(dead_code)]
    pub fn disable_irq(&mut self, irq: u32) {
        let (reg, shift) = self.locate(GICD_ICENABLER, irq, 1);
        unsafe { reg.write_volatile(1 << shift) }
    }

    pub fn set_priority(&mut self, irq: u32, priority: u8) {
        let (reg, shift) = self.locate(GICD_IPRIORITYR, irq, 8);
        unsafe {
            let value = reg.read_volatile() & !(0xFF << shift);
            reg.write_volatile(value | (priority as u32) << shift);
        }
    }

    /// `cpu_mask` 的第 n 位代表 n 号核
    #[allow(dead_code)]
    pub fn set_target(&mut self, irq: u32, cpu_mask: u8) {
        let (reg, shift) = self.locate(GICD_ITARGETSR, irq, 8);
        unsafe {
            let value = reg.read_volatile() & !(0xFF << shift);
            reg.write_volatile(value | (cpu_mask as u32) << shift);
        }
    }

    #[allow(dead_code)]
    pub fn is_pending(&self, irq: u32) -> bool {
        let (reg, shift) = self.locate(GICD_ISPENDR, irq, 1);
        unsafe { reg.read_volatile() & (1 << shift) != 0 }
    }

    /// 确认当前最高优先级的中断，返回 IAR 原值。
    /// SGI 的原值里还带着发送方核号，结束时要原样写回 [`Gic::eoi`]。
    pub fn acknowledge(&mut self) -> u32 {
        unsafe { self.cpu(GICC_IAR).read_volatile() }
    }

    /// 中断编号，[`SPURIOUS`] 表示没有
    #[allow(dead_code)]
    pub fn ack(&mut self) -> u32 {
        self.acknowledge() & 0x3FF
    }

    pub fn eoi(&mut self, iar: u32) {
        unsafe { self.cpu(GICC_EOIR).write_volatile(iar) }
    }

    pub fn send_sgi(&mut self, filter: SgiFilter, targets: u8, sgi: u8) {
        assert!(sgi < SGI_COUNT);
        let value = (filter as u32) << 24 | (targets as u32) << 16 | sgi as u32;
        unsafe { self.dist(GICD_SGIR).write_volatile(value) }
    }
}
