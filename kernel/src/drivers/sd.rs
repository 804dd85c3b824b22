//! BCM2837 EMMC 控制器上的 SD 卡驱动
//!
//! 只用轮询：每条命令发出后查询中断寄存器，直到完成位或错误位出现，或超过轮询次数。
//! 不做重试，错误原样交给上层。
//!
//! References
//! - SD Physical Layer Simplified Specification 4.10
//! - SD Host Controller Simplified Specification 3.00

use block_dev::{BLOCK_SIZE, BlockDevice, DevError};
use enumflags2::{BitFlags, bitflags};

use super::gpio::{Function, Gpio, Pull};
use crate::arch::delay_cycles;
use crate::config::{
    EMMC_BASE, EMMC_BASE_CLOCK_HZ, SD_CLOCK_DATA_HZ, SD_CLOCK_IDENT_HZ, SD_TIMEOUT_CMD,
    SD_TIMEOUT_DATA, SD_TIMEOUT_RESET,
};
use crate::ptr::volatile::*;
use crate::sync::UpCell;

/// GPIO 48..=53 的 ALT3 是 CLK、CMD、DAT0..3
const SD_PINS: core::ops::RangeInclusive<u32> = 48..=53;

/// 2.7 ~ 3.6 V
const OCR_VDD_27_36: u32 = 0x00FF_8000;
/// 主机支持大容量卡；在响应中则表示卡是 SDHC/SDXC
const OCR_HCS: u32 = 1 << 30;
/// 卡上电完成
const OCR_READY: u32 = 1 << 31;
const IF_COND_CHECK: u32 = 0x1AA;
const ACMD41_RETRIES: u32 = 100;
/// BLKSIZECNT 中块数只有 16 位
const MAX_BLOCKS_PER_TRANSFER: usize = 0xFFFF;

/// STATUS
#[rustfmt::skip]
#[bitflags]
#[repr(u32)]
#[derive(Debug, Clone, Copy)]
enum Status {
    CMD_INHIBIT = 1 << 0,
    DAT_INHIBIT = 1 << 1,
}

/// CONTROL1
#[rustfmt::skip]
#[bitflags]
#[repr(u32)]
#[derive(Debug, Clone, Copy)]
enum Control1 {
    CLK_INTLEN = 1 << 0,
    CLK_STABLE = 1 << 1,
    CLK_EN     = 1 << 2,
    SRST_HC    = 1 << 24,
}

/// INTERRUPT
#[rustfmt::skip]
#[bitflags]
#[repr(u32)]
#[derive(Debug, Clone, Copy)]
enum Interrupt {
    CMD_DONE  = 1 << 0,
    DATA_DONE = 1 << 1,
    WRITE_RDY = 1 << 4,
    READ_RDY  = 1 << 5,
    ERR       = 1 << 15,
    CTO_ERR   = 1 << 16,
    CCRC_ERR  = 1 << 17,
    CEND_ERR  = 1 << 18,
    CBAD_ERR  = 1 << 19,
    DTO_ERR   = 1 << 20,
    DCRC_ERR  = 1 << 21,
    DEND_ERR  = 1 << 22,
    ACMD_ERR  = 1 << 24,
}

impl Interrupt {
    fn errors() -> BitFlags<Self> {
        Self::ERR
            | Self::CTO_ERR
            | Self::CCRC_ERR
            | Self::CEND_ERR
            | Self::CBAD_ERR
            | Self::DTO_ERR
            | Self::DCRC_ERR
            | Self::DEND_ERR
            | Self::ACMD_ERR
    }
}

/* CMDTM */

const CMD_RSPNS_136: u32 = 1 << 16;
const CMD_RSPNS_48: u32 = 2 << 16;
const CMD_RSPNS_48B: u32 = 3 << 16;
const CMD_CRCCHK_EN: u32 = 1 << 19;
const CMD_IXCHK_EN: u32 = 1 << 20;
const CMD_ISDATA: u32 = 1 << 21;
const TM_BLKCNT_EN: u32 = 1 << 1;
const TM_AUTO_CMD12: u32 = 1 << 2;
const TM_DAT_DIR_READ: u32 = 1 << 4;
const TM_MULTI_BLOCK: u32 = 1 << 5;

/// CONTROL0：4 位数据线
const C0_HCTL_DWIDTH: u32 = 1 << 1;

#[repr(C)]
struct Registers {
    _arg2: Volatile<u32>,
    blksizecnt: Volatile<u32>,
    arg1: Volatile<u32>,
    cmdtm: Volatile<u32>,
    resp: [ReadOnly<u32>; 4],
    data: Volatile<u32>,
    status: ReadOnly<u32>,
    control0: Volatile<u32>,
    control1: Volatile<u32>,
    interrupt: Volatile<u32>,
    irpt_mask: Volatile<u32>,
    irpt_en: Volatile<u32>,
    _control2: Volatile<u32>,
}

/// SD 命令；应用命令（ACMD）之前要先发 CMD55
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Cmd {
    index: u32,
    app: bool,
}

impl Cmd {
    const GO_IDLE: Self = Self::new(0);
    const ALL_SEND_CID: Self = Self::new(2);
    const SEND_REL_ADDR: Self = Self::new(3);
    const SELECT_CARD: Self = Self::new(7);
    const SEND_IF_COND: Self = Self::new(8);
    const READ_SINGLE_BLOCK: Self = Self::new(17);
    const READ_MULTIPLE_BLOCK: Self = Self::new(18);
    const WRITE_SINGLE_BLOCK: Self = Self::new(24);
    const WRITE_MULTIPLE_BLOCK: Self = Self::new(25);
    const APP_CMD: Self = Self::new(55);
    const SET_BUS_WIDTH: Self = Self::app(6);
    const SEND_OP_COND: Self = Self::app(41);

    const fn new(index: u32) -> Self {
        Self { index, app: false }
    }

    const fn app(index: u32) -> Self {
        Self { index, app: true }
    }

    /// 命令号与响应类型
    fn cmdtm(self) -> u32 {
        let response = match self {
            Self::GO_IDLE => 0,
            Self::ALL_SEND_CID => CMD_RSPNS_136,
            // R3 不带 CRC 与命令号
            Self::SEND_OP_COND => CMD_RSPNS_48,
            Self::SELECT_CARD => CMD_RSPNS_48B | CMD_CRCCHK_EN | CMD_IXCHK_EN,
            _ => CMD_RSPNS_48 | CMD_CRCCHK_EN | CMD_IXCHK_EN,
        };
        self.index << 24 | response
    }
}

/// 初始化过程中得到的卡信息
#[derive(Debug, Default, Clone, Copy)]
pub struct CardInfo {
    pub rca: u32,
    pub ocr: u32,
    pub cid: [u32; 4],
    /// SDHC/SDXC 按块寻址，SDSC 按字节寻址
    pub sdhc: bool,
    pub wide_bus: bool,
}

pub struct SdCard {
    inner: UpCell<Emmc>,
}

struct Emmc {
    base_addr: usize,
    card: Option<CardInfo>,
}

impl SdCard {
    pub const fn new() -> Self {
        Self {
            inner: UpCell::new(Emmc {
                base_addr: EMMC_BASE,
                card: None,
            }),
        }
    }

    /// 配置引脚、复位控制器并完成卡的识别流程
    pub fn init(&self) -> Result<CardInfo, DevError> {
        self.inner.exclusive_access().init()
    }

    #[allow(dead_code)]
    pub fn is_initialized(&self) -> bool {
        self.inner.exclusive_access().card.is_some()
    }

    #[allow(dead_code)]
    pub fn info(&self) -> Option<CardInfo> {
        self.inner.exclusive_access().card
    }
}

impl BlockDevice for SdCard {
    fn read_block(&self, block_id: usize, buf: &mut [u8]) -> Result<(), DevError> {
        self.read_blocks(block_id, &mut buf[..BLOCK_SIZE])
    }

    fn write_block(&self, block_id: usize, buf: &[u8]) -> Result<(), DevError> {
        self.write_blocks(block_id, &buf[..BLOCK_SIZE])
    }

    fn read_blocks(&self, start: usize, buf: &mut [u8]) -> Result<(), DevError> {
        let mut emmc = self.inner.exclusive_access();
        for (i, chunk) in buf
            .chunks_mut(MAX_BLOCKS_PER_TRANSFER * BLOCK_SIZE)
            .enumerate()
        {
            emmc.read(start + i * MAX_BLOCKS_PER_TRANSFER, chunk)?;
        }
        Ok(())
    }

    fn write_blocks(&self, start: usize, buf: &[u8]) -> Result<(), DevError> {
        let mut emmc = self.inner.exclusive_access();
        for (i, chunk) in buf.chunks(MAX_BLOCKS_PER_TRANSFER * BLOCK_SIZE).enumerate() {
            emmc.write(start + i * MAX_BLOCKS_PER_TRANSFER, chunk)?;
        }
        Ok(())
    }
}

/// 轮询 `done` 至多 `limit` 次
fn poll(limit: u32, mut done: impl FnMut() -> bool) -> Result<(), DevError> {
    for _ in 0..limit {
        if done() {
            return Ok(());
        }
        delay_cycles(10);
    }
    Err(DevError::Timeout)
}

impl Emmc {
    fn regs(&mut self) -> &mut Registers {
        unsafe { &mut *(self.base_addr as *mut Registers) }
    }

    fn status(&mut self) -> BitFlags<Status> {
        BitFlags::from_bits_truncate(self.regs().status.read())
    }

    fn interrupt(&mut self) -> BitFlags<Interrupt> {
        BitFlags::from_bits_truncate(self.regs().interrupt.read())
    }

    fn control1(&mut self) -> BitFlags<Control1> {
        BitFlags::from_bits_truncate(self.regs().control1.read())
    }

    fn init(&mut self) -> Result<CardInfo, DevError> {
        self.card = None;

        let mut gpio = Gpio::new();
        gpio.set_functions(SD_PINS, Function::Alt3);
        // 卡上自带上拉
        gpio.set_pull(SD_PINS, Pull::None);

        self.reset()?;
        self.set_clock(SD_CLOCK_IDENT_HZ)?;

        let regs = self.regs();
        regs.irpt_en.write(u32::MAX);
        regs.irpt_mask.write(u32::MAX);
        regs.interrupt.write(u32::MAX);
        delay_cycles(1_000_000);

        let mut card = CardInfo::default();
        self.command(Cmd::GO_IDLE, 0, &card).map_err(|err| {
            log::warn!("sd: no card (CMD0 {err:?})");
            DevError::NotReady
        })?;

        // SDSC v1 卡不认 CMD8，继续即可
        match self.command(Cmd::SEND_IF_COND, IF_COND_CHECK, &card) {
            Ok(resp) if resp[0] & 0xFFF != IF_COND_CHECK => {
                log::error!("sd: CMD8 echo {:#x}", resp[0]);
                return Err(DevError::Unsupported);
            }
            Ok(_) => log::debug!("sd: v2.0 card"),
            Err(_) => log::debug!("sd: CMD8 rejected, assuming v1 card"),
        }

        let mut ready = false;
        for _ in 0..ACMD41_RETRIES {
            delay_cycles(100_000);
            let resp = self
                .command(Cmd::SEND_OP_COND, OCR_VDD_27_36 | OCR_HCS, &card)
                .map_err(|_| DevError::NotReady)?;
            if resp[0] & OCR_READY != 0 {
                card.ocr = resp[0];
                ready = true;
                break;
            }
        }
        if !ready {
            log::error!("sd: card never left busy state");
            return Err(DevError::Timeout);
        }
        card.sdhc = card.ocr & OCR_HCS != 0;

        card.cid = self.command(Cmd::ALL_SEND_CID, 0, &card)?;
        card.rca = self.command(Cmd::SEND_REL_ADDR, 0, &card)?[0] >> 16;

        self.set_clock(SD_CLOCK_DATA_HZ)?;
        self.command(Cmd::SELECT_CARD, card.rca << 16, &card)?;

        match self.command(Cmd::SET_BUS_WIDTH, 2, &card) {
            Ok(_) => {
                self.regs().control0.set_bits(C0_HCTL_DWIDTH);
                card.wide_bus = true;
            }
            Err(err) => log::warn!("sd: ACMD6 {err:?}, staying on 1-bit bus"),
        }

        log::info!(
            "sd: ready, ocr={:#010x} rca={:#06x} sdhc={} 4-bit={}",
            card.ocr,
            card.rca,
            card.sdhc,
            card.wide_bus
        );
        self.card = Some(card);
        Ok(card)
    }

    fn reset(&mut self) -> Result<(), DevError> {
        self.regs().control1.set_bits(Control1::SRST_HC as u32);
        poll(SD_TIMEOUT_RESET, || !self.control1().contains(Control1::SRST_HC)).inspect_err(
            |_| log::error!("sd: controller reset timed out"),
        )
    }

    /// 10 位分频系数：低 2 位在 7:6，高 8 位在 15:8，SD 时钟 = 基准 / (2 * 系数)
    fn set_clock(&mut self, freq_hz: u32) -> Result<(), DevError> {
        poll(SD_TIMEOUT_RESET, || {
            !self
                .status()
                .intersects(Status::CMD_INHIBIT | Status::DAT_INHIBIT)
        })?;

        self.regs().control1.clear_bits(Control1::CLK_EN as u32);
        delay_cycles(1000);

        let divisor = (EMMC_BASE_CLOCK_HZ / freq_hz).clamp(2, 2046) / 2;
        let bits = (divisor & 0x3) << 6 | (divisor >> 2 & 0xFF) << 8;
        self.regs().control1.modify(|v| v & !0xFFE0 | bits);
        delay_cycles(1000);

        self.regs().control1.set_bits(Control1::CLK_INTLEN as u32);
        poll(SD_TIMEOUT_RESET, || self.control1().contains(Control1::CLK_STABLE))
            .inspect_err(|_| log::error!("sd: clock not stable"))?;

        self.regs().control1.set_bits(Control1::CLK_EN as u32);
        delay_cycles(1000);
        log::debug!("sd: clock {freq_hz} Hz (divisor {})", divisor * 2);
        Ok(())
    }

    /// 等待命令完成；出错时清掉错误位
    fn wait_interrupt(&mut self, flag: Interrupt, limit: u32) -> Result<(), DevError> {
        let mut irpt = BitFlags::empty();
        poll(limit, || {
            irpt = self.interrupt();
            irpt.intersects(Interrupt::errors() | flag)
        })?;
        if irpt.intersects(Interrupt::errors()) {
            self.regs().interrupt.write(irpt.bits());
            log::debug!("sd: interrupt error {:#010x}", irpt.bits());
            return Err(match flag {
                Interrupt::CMD_DONE => DevError::Command,
                _ => DevError::Data,
            });
        }
        self.regs().interrupt.write(flag as u32);
        Ok(())
    }

    /// 发出不带数据的命令，返回四个响应字
    fn command(&mut self, cmd: Cmd, arg: u32, card: &CardInfo) -> Result<[u32; 4], DevError> {
        if cmd.app {
            self.command(Cmd::APP_CMD, card.rca << 16, card)?;
        }

        poll(SD_TIMEOUT_CMD, || !self.status().contains(Status::CMD_INHIBIT))
            .inspect_err(|_| log::debug!("sd: CMD{} inhibited", cmd.index))?;

        let regs = self.regs();
        regs.interrupt.write(u32::MAX);
        regs.arg1.write(arg);
        regs.cmdtm.write(cmd.cmdtm());
        self.wait_interrupt(Interrupt::CMD_DONE, SD_TIMEOUT_CMD)
            .inspect_err(|err| log::debug!("sd: CMD{} {err:?}", cmd.index))?;

        let regs = self.regs();
        Ok(core::array::from_fn(|i| regs.resp[i].read()))
    }

    /// SDSC 卡的地址以字节计
    fn address(&self, lba: usize) -> Result<u32, DevError> {
        let card = self.card.as_ref().ok_or(DevError::NotReady)?;
        let addr = if card.sdhc { lba } else { lba * BLOCK_SIZE };
        u32::try_from(addr).map_err(|_| DevError::Unsupported)
    }

    fn read(&mut self, lba: usize, buf: &mut [u8]) -> Result<(), DevError> {
        let blocks = buf.len() / BLOCK_SIZE;
        if blocks == 0 {
            return Ok(());
        }
        let addr = self.address(lba)?;
        let cmd = if blocks > 1 {
            Cmd::READ_MULTIPLE_BLOCK
        } else {
            Cmd::READ_SINGLE_BLOCK
        };
        self.start_transfer(cmd, addr, blocks, true)?;

        for block in buf.chunks_exact_mut(BLOCK_SIZE) {
            self.wait_interrupt(Interrupt::READ_RDY, SD_TIMEOUT_DATA)?;
            for word in block.chunks_exact_mut(4) {
                let value = self.regs().data.read();
                word.copy_from_slice(&value.to_le_bytes());
            }
        }
        self.wait_interrupt(Interrupt::DATA_DONE, SD_TIMEOUT_DATA)
            .inspect_err(|err| log::warn!("sd: read at LBA {lba} failed: {err:?}"))
    }

    fn write(&mut self, lba: usize, buf: &[u8]) -> Result<(), DevError> {
        let blocks = buf.len() / BLOCK_SIZE;
        if blocks == 0 {
            return Ok(());
        }
        let addr = self.address(lba)?;
        let cmd = if blocks > 1 {
            Cmd::WRITE_MULTIPLE_BLOCK
        } else {
            Cmd::WRITE_SINGLE_BLOCK
        };
        self.start_transfer(cmd, addr, blocks, false)?;

        for block in buf.chunks_exact(BLOCK_SIZE) {
            self.wait_interrupt(Interrupt::WRITE_RDY, SD_TIMEOUT_DATA)?;
            for word in block.chunks_exact(4) {
                let value = u32::from_le_bytes([word[0], word[1], word[2], word[3]]);
                self.regs().data.write(value);
            }
        }
        self.wait_interrupt(Interrupt::DATA_DONE, SD_TIMEOUT_DATA)
            .inspect_err(|err| log::warn!("sd: write at LBA {lba} failed: {err:?}"))
    }

    /// 发出数据命令；多块传输由控制器在结束时自动补发 CMD12
    fn start_transfer(
        &mut self,
        cmd: Cmd,
        addr: u32,
        blocks: usize,
        read: bool,
    ) -> Result<(), DevError> {
        poll(SD_TIMEOUT_CMD, || !self.status().contains(Status::DAT_INHIBIT))?;

        let mut cmdtm = cmd.cmdtm() | CMD_ISDATA;
        if read {
            cmdtm |= TM_DAT_DIR_READ;
        }
        if blocks > 1 {
            cmdtm |= TM_MULTI_BLOCK | TM_BLKCNT_EN | TM_AUTO_CMD12;
        }

        let regs = self.regs();
        regs.interrupt.write(u32::MAX);
        regs.blksizecnt
            .write((blocks as u32) << 16 | BLOCK_SIZE as u32);
        regs.arg1.write(addr);
        regs.cmdtm.write(cmdtm);
        self.wait_interrupt(Interrupt::CMD_DONE, SD_TIMEOUT_CMD)
    }
}
