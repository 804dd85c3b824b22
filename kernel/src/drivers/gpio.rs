//! BCM2837 GPIO 功能选择与上下拉

use crate::arch::delay_cycles;
use crate::config::GPIO_BASE;

const GPFSEL0: usize = 0x00;
const GPPUD: usize = 0x94;
const GPPUDCLK0: usize = 0x98;

pub const PIN_COUNT: u32 = 54;

/// 引脚功能，编码见 BCM2835 外设手册 6.1
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum Function {
    Input = 0,
    Output = 1,
    Alt0 = 4,
    Alt1 = 5,
    Alt2 = 6,
    Alt3 = 7,
    Alt4 = 3,
    Alt5 = 2,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum Pull {
    None = 0,
    Down = 1,
    Up = 2,
}

pub struct Gpio {
    base_addr: usize,
}

impl Gpio {
    pub const fn new() -> Self {
        Self {
            base_addr: GPIO_BASE,
        }
    }

    const fn reg(&self, offset: usize) -> *mut u32 {
        (self.base_addr + offset) as *mut u32
    }

    /// 每个 GPFSEL 寄存器管 10 个引脚，每脚 3 位
    pub fn set_function(&mut self, pin: u32, func: Function) {
        assert!(pin < PIN_COUNT);
        let reg = self.reg(GPFSEL0 + (pin / 10) as usize * 4);
        let shift = (pin % 10) * 3;
        unsafe {
            let value = reg.read_volatile() & !(0b111 << shift);
            reg.write_volatile(value | (func as u32) << shift);
        }
    }

    pub fn set_functions(&mut self, pins: impl IntoIterator<Item = u32>, func: Function) {
        for pin in pins {
            self.set_function(pin, func);
        }
    }

    /// 上下拉要按手册的时序打进去：先写 GPPUD，等 150 周期，
    /// 再用 GPPUDCLK 选中引脚，等 150 周期，最后两者清零
    pub fn set_pull(&mut self, pins: impl IntoIterator<Item = u32>, pull: Pull) {
        let mut masks = [0u32; 2];
        for pin in pins {
            assert!(pin < PIN_COUNT);
            masks[(pin / 32) as usize] |= 1 << (pin % 32);
        }

        let pud = self.reg(GPPUD);
        unsafe {
            pud.write_volatile(pull as u32);
            delay_cycles(150);
            for (i, mask) in masks.into_iter().enumerate() {
                self.reg(GPPUDCLK0 + i * 4).write_volatile(mask);
            }
            delay_cycles(150);
            pud.write_volatile(0);
            for i in 0..masks.len() {
                self.reg(GPPUDCLK0 + i * 4).write_volatile(0);
            }
        }
    }
}
