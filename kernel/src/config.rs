//! Constants used in the kernel
//!
//! 地址均为 BCM2837 的 ARM 物理地址

/// 核心数
pub const MAX_CORES: usize = ipc::MAX_CORES;
/// 每个核的启动栈，须与 `entry.S` 中的 `STACK_SIZE` 一致
pub const KERNEL_STACK_SIZE: usize = 0x40000;

pub const PERIPHERAL_BASE: usize = 0x3F00_0000;
pub const GPIO_BASE: usize = PERIPHERAL_BASE + 0x20_0000;
pub const UART0_BASE: usize = PERIPHERAL_BASE + 0x20_1000;
pub const EMMC_BASE: usize = PERIPHERAL_BASE + 0x30_0000;

pub const GIC_BASE: usize = 0xFF84_0000;
pub const GICD_BASE: usize = GIC_BASE + 0x1000;
pub const GICC_BASE: usize = GIC_BASE + 0x2000;

/// 固件让从核在这些地址上自旋，写入非零地址即放行，下标为核号
pub const RELEASE_SLOTS: [usize; MAX_CORES] = [0xD8, 0xE0, 0xE8, 0xF0];

/// PL011 参考时钟，由固件设定
pub const UART_CLOCK_HZ: u32 = 48_000_000;
pub const UART_BAUD_RATE: u32 = 115_200;

/// EMMC 控制器的基准时钟
pub const EMMC_BASE_CLOCK_HZ: u32 = 41_666_666;
pub const SD_CLOCK_IDENT_HZ: u32 = 400_000;
pub const SD_CLOCK_DATA_HZ: u32 = 25_000_000;

/* SD 驱动的超时，单位为轮询次数 */

pub const SD_TIMEOUT_CMD: u32 = 1_000_000;
pub const SD_TIMEOUT_DATA: u32 = 5_000_000;
pub const SD_TIMEOUT_RESET: u32 = 100_000;

/// CNTFRQ_EL0 读出 0 时使用的计数频率
pub const DEFAULT_TIMER_FREQ_HZ: u64 = 19_200_000;

/// 等待从核就绪的超时
pub const CORE_READY_TIMEOUT_US: u64 = 1_000_000;
/// 等待文件系统核心就绪的超时
pub const FS_READY_TIMEOUT_US: u64 = 5_000_000;
