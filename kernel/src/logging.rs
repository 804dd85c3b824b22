//! 串口日志
//!
//! 每条记录一行：`[秒.微秒] [级别] [core N] 内容`，按级别着色。
//! 最大级别在编译时由环境变量 `LOG` 决定，默认 `info`。

use log::{Level, LevelFilter, Log, Metadata, Record};

use crate::{arch, console, timer};

struct UartLogger;

const fn color(level: Level) -> u8 {
    match level {
        Level::Error => 31,
        Level::Warn => 93,
        Level::Info => 34,
        Level::Debug => 32,
        Level::Trace => 90,
    }
}

impl Log for UartLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }

        let now = timer::time_us();
        println!(
            "\u{1B}[{}m[{:>5}.{:06}] [{:<5}] [core {}] {}\u{1B}[0m",
            color(record.level()),
            now / 1_000_000,
            now % 1_000_000,
            record.level(),
            arch::core_id(),
            record.args()
        );
    }

    fn flush(&self) {
        console::flush();
    }
}

pub fn init() {
    static LOGGER: UartLogger = UartLogger;
    // 只会在 0 号核上调用一次
    if log::set_logger(&LOGGER).is_err() {
        return;
    }

    let level = option_env!("LOG")
        .and_then(|s| s.parse().ok())
        .unwrap_or(LevelFilter::Info);
    log::set_max_level(level);
}
