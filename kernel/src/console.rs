use core::fmt::{self, Write};

use spin::Mutex;

use crate::config::{UART_BAUD_RATE, UART_CLOCK_HZ, UART0_BASE};
use crate::drivers::uart::Pl011;

/// 四个核共用一个串口，一次输出持有一次锁，行与行之间不会交错
static UART: Mutex<Pl011> = Mutex::new(Pl011::new(UART0_BASE));

pub fn init() {
    UART.lock().init(UART_CLOCK_HZ, UART_BAUD_RATE);
}

pub fn print(args: fmt::Arguments) {
    // `Pl011` 的写入从不失败
    let _ = UART.lock().write_fmt(args);
}

pub fn flush() {
    UART.lock().flush();
}

/// panic 时锁可能正被本核持有，拿不到就直接写寄存器
pub fn print_unlocked(args: fmt::Arguments) {
    match UART.try_lock() {
        Some(mut uart) => {
            let _ = uart.write_fmt(args);
            uart.flush();
        }
        None => {
            let mut uart = Pl011::new(UART0_BASE);
            let _ = uart.write_fmt(args);
            uart.flush();
        }
    }
}

#[macro_export]
macro_rules! print {
    ($($arg:tt)*) => {
        $crate::console::print(format_args!($($arg)*))
    };
}

#[macro_export]
macro_rules! println {
    () => {
        $crate::print!("\n")
    };
    ($($arg:tt)*) => {
        $crate::console::print(format_args!("{}\n", format_args!($($arg)*)))
    };
}
