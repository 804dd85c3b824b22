//! PL011 UART
//!
//! References
//! - [PrimeCell UART (PL011) TRM](https://developer.arm.com/documentation/ddi0183/latest)
//! - BCM2835 ARM Peripherals, chapter 13

use enumflags2::{BitFlags, bitflags};

use super::gpio::{Function, Gpio, Pull};
use crate::ptr::volatile::*;

/// GPIO 14/15 的 ALT0 是 UART0 的 TXD/RXD
const TX_PIN: u32 = 14;
const RX_PIN: u32 = 15;

/// Flag Register
#[rustfmt::skip]
#[bitflags]
#[repr(u32)]
#[derive(Debug, Clone, Copy)]
pub enum FR {
    BUSY          = 1 << 3,
    RX_FIFO_EMPTY = 1 << 4,
    TX_FIFO_FULL  = 1 << 5,
    RX_FIFO_FULL  = 1 << 6,
    TX_FIFO_EMPTY = 1 << 7,
}

/// Control Register
#[rustfmt::skip]
#[bitflags]
#[repr(u32)]
#[derive(Debug, Clone, Copy)]
pub enum CR {
    UART_ENABLE = 1 << 0,
    TX_ENABLE   = 1 << 8,
    RX_ENABLE   = 1 << 9,
}

/// Line Control Register
#[rustfmt::skip]
#[bitflags]
#[repr(u32)]
#[derive(Debug, Clone, Copy)]
pub enum LCRH {
    FIFO_ENABLE = 1 << 4,
    WLEN_LOW    = 1 << 5,
    WLEN_HIGH   = 1 << 6,
}

#[repr(C)]
struct Registers {
    /// data register
    dr: Volatile<u32>,
    /// receive status / error clear
    _rsrecr: Volatile<u32>,
    _reserved0: [Reserved<u32>; 4],
    /// flag register
    fr: ReadOnly<u32>,
    _reserved1: Reserved<u32>,
    /// IrDA, not used
    _ilpr: Volatile<u32>,
    /// integer baud rate divisor
    ibrd: Volatile<u32>,
    /// fractional baud rate divisor
    fbrd: Volatile<u32>,
    /// line control register
    lcrh: Volatile<u32>,
    /// control register
    cr: Volatile<u32>,
    /// interrupt FIFO level select
    _ifls: Volatile<u32>,
    /// interrupt mask set/clear
    imsc: Volatile<u32>,
    /// raw interrupt status
    _ris: ReadOnly<u32>,
    /// masked interrupt status
    _mis: ReadOnly<u32>,
    /// interrupt clear register
    icr: WriteOnly<u32>,
}

pub struct Pl011 {
    base_addr: usize,
}

impl Pl011 {
    pub const fn new(base_addr: usize) -> Self {
        Self { base_addr }
    }

    fn regs(&mut self) -> &mut Registers {
        unsafe { &mut *(self.base_addr as *mut Registers) }
    }

    fn flags(&mut self) -> BitFlags<FR> {
        BitFlags::from_bits_truncate(self.regs().fr.read())
    }

    /// 8N1，开启 FIFO，屏蔽全部中断
    pub fn init(&mut self, clock_hz: u32, baud_rate: u32) {
        let regs = self.regs();
        regs.cr.write(0);

        let mut gpio = Gpio::new();
        gpio.set_functions([TX_PIN, RX_PIN], Function::Alt0);
        gpio.set_pull([TX_PIN, RX_PIN], Pull::None);

        let regs = self.regs();
        regs.icr.write(0x7FF);
        // 分频系数以 1/64 为单位：clock / (16 * baud) * 64，四舍五入
        let divisor = (clock_hz * 8 / baud_rate + 1) / 2;
        regs.ibrd.write(divisor >> 6);
        regs.fbrd.write(divisor & 0x3F);
        regs.lcrh
            .write((LCRH::FIFO_ENABLE | LCRH::WLEN_LOW | LCRH::WLEN_HIGH).bits());
        regs.imsc.write(0);
        regs.cr
            .write((CR::UART_ENABLE | CR::TX_ENABLE | CR::RX_ENABLE).bits());
    }

    pub fn write(&mut self, ch: u8) {
        while self.flags().contains(FR::TX_FIFO_FULL) {
            core::hint::spin_loop();
        }
        self.regs().dr.write(ch as u32);
    }

    /// 等发送 FIFO 排空
    pub fn flush(&mut self) {
        while self.flags().contains(FR::BUSY) {
            core::hint::spin_loop();
        }
    }
}

impl core::fmt::Write for Pl011 {
    fn write_str(&mut self, s: &str) -> core::fmt::Result {
        for byte in s.bytes() {
            if byte == b'\n' {
                self.write(b'\r');
            }
            self.write(byte);
        }
        Ok(())
    }
}
