//! 文件系统服务的启动与开机自检

use core::sync::atomic::AtomicU32;

use block_dev::DevError;
use ekkfs::Error;
use fs_server::{
    Command, DbCommand, FS_CORE, FsServer, MSG_DB_REQUEST, MSG_DB_RESPONSE, MSG_FS_REQUEST,
    MSG_FS_RESPONSE, Request, Response,
};
use ipc::atomic::load_acquire;
use ipc::{CoreId, MAX_PAYLOAD, QueueSet};
use spin::Once;

use crate::arch;
use crate::config::{FS_READY_TIMEOUT_US, MAX_CORES};
use crate::drivers::{CardInfo, SdCard};
use crate::smp::{self, IPI_MESSAGE};
use crate::timer;

/// 全部核心共用的消息队列
pub static QUEUES: QueueSet<MAX_CORES> = QueueSet::new();
/// 文件系统挂载完成后由服务核置 1
static FS_READY: AtomicU32 = AtomicU32::new(0);
static CARD: Once<CardInfo> = Once::new();

const SELF_CHECK_REQ_ID: u16 = 0xEC;
const BOOT_NAMESPACE: &str = "boot";
const BOOT_KEY: &str = "count";

pub fn is_ready() -> bool {
    load_acquire(&FS_READY) != 0
}

/// 在 [`FS_CORE`] 上初始化 SD 卡并挂载 EKKFS，之后一直提供服务
pub fn serve(core: CoreId) -> ! {
    let sd = SdCard::new();
    let info = match sd.init() {
        Ok(info) => *CARD.call_once(|| info),
        Err(err) => {
            log::error!("fs: SD card init failed: {err:?}");
            arch::park();
        }
    };
    log::info!(
        "fs: SD card rca {:#06x}, {}, {}-bit bus",
        info.rca,
        if info.sdhc { "SDHC" } else { "SDSC" },
        if info.wide_bus { 4 } else { 1 },
    );

    match FsServer::init(sd, timer::time_us, &FS_READY) {
        Ok(mut server) => server.run(&QUEUES, core),
        Err(err) => {
            log::error!("fs: mount failed: {err:?}");
            arch::park();
        }
    }
}

/// 从 `core` 向服务核发一次 StatFs，确认整条链路可用，随后记一次开机
pub fn self_check(core: CoreId) -> bool {
    if !wait_ready(FS_READY_TIMEOUT_US) {
        log::error!("fs: server not ready after {FS_READY_TIMEOUT_US} us");
        return false;
    }

    let req = Request::new(Command::StatFs, SELF_CHECK_REQ_ID);
    let Some(resp) = call(core, MSG_FS_REQUEST, req) else {
        log::error!("fs: self-check timed out");
        return false;
    };
    match resp.status() {
        Ok(_) => log::info!(
            "fs: {} of {} blocks free, {} of {} inodes used, block size {}",
            resp.u32_at(4),
            resp.u32_at(0),
            resp.u32_at(12),
            resp.u32_at(8),
            resp.u32_at(16),
        ),
        Err(err) => {
            log::error!("fs: self-check failed: {err:?}");
            return false;
        }
    }

    match count_boot(core) {
        Ok(boots) => log::info!("fs: boot #{boots}"),
        Err(err) => log::warn!("fs: boot counter unavailable: {err:?}"),
    }
    true
}

/// 开机次数存在 `boot` 命名空间的 `count` 键里
fn count_boot(core: CoreId) -> Result<u32, Error> {
    let open = Request::db(DbCommand::KvOpen, SELF_CHECK_REQ_ID).with_name(BOOT_NAMESPACE)?;
    let handle = db_call(core, open)?.result;

    let get = Request::db(DbCommand::KvGet, SELF_CHECK_REQ_ID)
        .with_handle(handle)
        .with_name(BOOT_KEY)?
        .with_offset(4);
    let boots = match db_call(core, get) {
        Ok(resp) if resp.result == 4 => resp.u32_at(0).wrapping_add(1),
        Ok(_) | Err(Error::NotFound) => 1,
        Err(err) => return Err(err),
    };

    let put = Request::db(DbCommand::KvPut, SELF_CHECK_REQ_ID)
        .with_handle(handle)
        .with_entry(BOOT_KEY, &boots.to_le_bytes())?;
    let saved = db_call(core, put);
    db_call(core, Request::db(DbCommand::KvClose, SELF_CHECK_REQ_ID).with_handle(handle))?;
    saved.map(|_| boots)
}

fn db_call(core: CoreId, req: Request) -> Result<Response, Error> {
    let resp = call(core, MSG_DB_REQUEST, req).ok_or(Error::Io(DevError::Timeout))?;
    resp.status()?;
    Ok(resp)
}

/// 发出一条请求并等待同一 `req_id` 的响应，超时返回 `None`
fn call(core: CoreId, kind: u8, mut req: Request) -> Option<Response> {
    req.sender = core.module().0;
    if let Err(err) = QUEUES.send(core, FS_CORE.module(), kind, &req.encode()) {
        log::error!("fs: request {:#04x} not sent: {err:?}", req.cmd);
        return None;
    }
    smp::send_ipi(FS_CORE, IPI_MESSAGE);
    let reply = if kind == MSG_DB_REQUEST {
        MSG_DB_RESPONSE
    } else {
        MSG_FS_RESPONSE
    };
    wait_response(core, reply, req.req_id, FS_READY_TIMEOUT_US)
}

fn wait_ready(timeout_us: u64) -> bool {
    let start = timer::time_us();
    while !is_ready() {
        if timer::time_us() - start >= timeout_us {
            return false;
        }
        core::hint::spin_loop();
    }
    true
}

/// 丢弃等待期间收到的其它消息
fn wait_response(core: CoreId, kind: u8, req_id: u16, timeout_us: u64) -> Option<Response> {
    let start = timer::time_us();
    let mut buf = [0u8; MAX_PAYLOAD];
    while timer::time_us() - start < timeout_us {
        let Ok(envelope) = QUEUES.recv(core, &mut buf) else {
            core::hint::spin_loop();
            continue;
        };
        if envelope.kind != kind {
            log::debug!(
                "fs: ignoring message {:#04x} from module {}",
                envelope.kind,
                envelope.sender
            );
            continue;
        }
        let resp = Response::decode(&buf[..envelope.len.min(MAX_PAYLOAD)]);
        if resp.req_id == req_id {
            return Some(resp);
        }
    }
    None
}
