use core::fmt;
use core::hint;
use core::sync::atomic::AtomicU32;

use block_dev::{BlockDevice, mbr};
use ekkfs::{DEFAULT_INODES, Error, Filesystem, InodeFlag, Result, TimeSource};
use enumflags2::BitFlags;
use ipc::atomic::store_release;
use ipc::{CoreId, MAX_PAYLOAD, ModuleId, QueueSet};
use log::Level;

use crate::config::Config;
use crate::handles::{Handle, HandleTable};
use crate::kv::KvTable;
use crate::protocol::{
    Command, DbCommand, MSG_DB_REQUEST, MSG_DB_RESPONSE, MSG_FS_REQUEST, MSG_FS_RESPONSE,
    READ_MAX, Request, Response, WRITE_MAX, write_u32,
};
use crate::syslog::{LOG_FILE, SysLog};

/// 持有文件系统的核心
pub const FS_CORE: CoreId = CoreId(3);

pub struct FsServer<D: BlockDevice> {
    fs: Filesystem<D>,
    handles: HandleTable,
    kv: KvTable,
    config: Config,
    syslog: Option<SysLog>,
    served: u32,
}

impl<D: BlockDevice> FsServer<D> {
    /// 在整块设备上找到 EKKFS 分区并挂载，随后启动服务，最后以 release 语义把 `ready` 置 1。
    ///
    /// 找不到 EKKFS 分区时，若第 1 号分区项有效则把它格式化为 EKKFS。
    pub fn init(dev: D, now: TimeSource, ready: &AtomicU32) -> Result<Self> {
        let parts = mbr::read_partitions(&dev)?;
        let mut fs = Filesystem::new(dev, now);

        let lba = match mbr::select_ekkfs(&parts) {
            Some(part) => {
                log::info!(
                    "fs-server: EKKFS partition at LBA {} ({} blocks)",
                    part.lba_start,
                    part.sector_count
                );
                part.lba_start
            }
            None if parts[1].is_valid() => {
                let part = parts[1];
                log::warn!(
                    "fs-server: no EKKFS partition, formatting partition 1 at LBA {} ({} blocks)",
                    part.lba_start,
                    part.sector_count
                );
                fs.format(part.lba_start, part.sector_count, DEFAULT_INODES)?;
                part.lba_start
            }
            None => {
                log::error!("fs-server: no usable partition");
                return Err(Error::NotFound);
            }
        };
        fs.mount(lba)?;

        let server = Self::new(fs)?;
        store_release(ready, 1);
        Ok(server)
    }

    /// 在已挂载的文件系统上启动服务：读入配置，打开系统日志。
    ///
    /// 日志打不开不影响服务，只是不再记录。
    pub fn new(mut fs: Filesystem<D>) -> Result<Self> {
        if !fs.is_mounted() {
            return Err(Error::NotMounted);
        }
        let config = Config::load(&mut fs)?;
        let syslog = SysLog::open(
            &mut fs,
            config.get_str("log.file", LOG_FILE),
            u32::try_from(config.get_int("log.max_size", 0)).unwrap_or(0),
            u8::try_from(config.get_int("log.rotations", 0)).unwrap_or(0),
        )
        .inspect_err(|err| log::warn!("fs-server: syslog unavailable: {err:?}"))
        .ok();

        let mut server = Self {
            fs,
            handles: HandleTable::new(),
            kv: KvTable::new(),
            config,
            syslog,
            served: 0,
        };
        let sb = server.fs.superblock();
        let (mount_count, free_blocks) = (sb.mount_count, sb.free_blocks);
        server.record(
            Level::Info,
            format_args!("mount #{}, {} blocks free", mount_count, free_blocks),
        );
        Ok(server)
    }

    /// 取出一条发往 `core` 的消息并处理，再回复到发送方所在的核心。
    /// 没有消息时返回 `false`。
    pub fn serve_once<const N: usize>(&mut self, queues: &QueueSet<N>, core: CoreId) -> bool {
        let mut buf = [0u8; MAX_PAYLOAD];
        let Ok(envelope) = queues.recv(core, &mut buf) else {
            return false;
        };
        let reply_kind = match envelope.kind {
            MSG_FS_REQUEST => MSG_FS_RESPONSE,
            MSG_DB_REQUEST => MSG_DB_RESPONSE,
            kind => {
                log::warn!(
                    "fs-server: dropping message type {kind:#04x} from module {}",
                    envelope.sender
                );
                return true;
            }
        };

        let req = Request::decode(&buf[..envelope.len.min(MAX_PAYLOAD)]);
        if req.sender != envelope.sender.0 {
            log::debug!(
                "fs-server: request claims module {}, sent by {}",
                req.sender,
                envelope.sender
            );
        }
        let resp = if envelope.kind == MSG_DB_REQUEST {
            self.handle_db(&req, envelope.sender)
        } else {
            self.handle(&req, envelope.sender)
        };
        if let Err(err) = queues.send(core, envelope.sender, reply_kind, &resp.encode()) {
            log::warn!("fs-server: reply to module {} lost: {err:?}", envelope.sender);
        }
        true
    }

    /// 服务循环，队列空闲时自旋等待
    pub fn run<const N: usize>(&mut self, queues: &QueueSet<N>, core: CoreId) -> ! {
        log::info!("fs-server: serving on core {core}");
        loop {
            if !self.serve_once(queues, core) {
                hint::spin_loop();
            }
        }
    }

    /// 处理一条请求。`sender` 决定句柄归属与文件权限，模块 0 代表系统
    pub fn handle(&mut self, req: &Request, sender: ModuleId) -> Response {
        let mut resp = Response::reply_to(req);
        match self.dispatch(req, sender, &mut resp) {
            Ok(result) => resp.result = result,
            Err(err) => {
                log::debug!("fs-server: cmd {} from module {sender}: {err:?}", req.cmd);
                resp.set_error(err);
            }
        }
        self.served = self.served.wrapping_add(1);
        resp
    }

    fn dispatch(&mut self, req: &Request, sender: ModuleId, resp: &mut Response) -> Result<u32> {
        let requester = u16::from(sender.0);
        match req.command()? {
            Command::Open => {
                let file = self.fs.open(req.name()?)?;
                Ok(self.handles.alloc(file, sender)?.into())
            }
            Command::Close => {
                let file = self.handles.free(Handle(req.handle), sender)?;
                self.fs.close(file)?;
                Ok(0)
            }
            Command::Read => {
                let len = (req.length as usize).min(READ_MAX);
                let file = self.handles.get_mut(Handle(req.handle), sender)?;
                let n = self.fs.read(file, &mut resp.data[..len])?;
                Ok(n as u32)
            }
            Command::Write => {
                let len = (req.length as usize).min(WRITE_MAX);
                let file = self.handles.get_mut(Handle(req.handle), sender)?;
                let n = self.fs.write(file, &req.data[..len], requester)?;
                Ok(n as u32)
            }
            Command::Create => {
                let name = req.name()?;
                let flags = BitFlags::<InodeFlag>::from_bits_truncate(req.offset as u16);
                let inode = self.fs.create(name, requester, flags)?;
                self.record(Level::Info, format_args!("module {sender} created {name}"));
                Ok(inode)
            }
            Command::Delete => {
                let name = req.name()?;
                self.fs.delete(name, requester)?;
                self.record(Level::Info, format_args!("module {sender} deleted {name}"));
                Ok(0)
            }
            Command::List => {
                let entry = self.fs.entry_at(req.offset)?.ok_or(Error::NotFound)?;
                let name = entry.name.as_bytes();
                resp.data[..name.len()].copy_from_slice(name);
                write_u32(&mut resp.data, 16, entry.size);
                resp.data[20..22].copy_from_slice(&entry.owner.to_le_bytes());
                Ok(entry.inode)
            }
            Command::Stat => {
                let stat = self.fs.stat(req.name()?)?;
                write_u32(&mut resp.data, 0, stat.inode);
                write_u32(&mut resp.data, 4, stat.size);
                resp.data[8..10].copy_from_slice(&stat.owner.to_le_bytes());
                resp.data[10..12].copy_from_slice(&stat.flags.bits().to_le_bytes());
                resp.data[12..20].copy_from_slice(&stat.created.to_le_bytes());
                resp.data[20..28].copy_from_slice(&stat.modified.to_le_bytes());
                write_u32(&mut resp.data, 28, stat.blocks);
                Ok(stat.size)
            }
            Command::Seek => {
                let file = self.handles.get_mut(Handle(req.handle), sender)?;
                file.seek(req.offset);
                Ok(req.offset)
            }
            Command::Sync => {
                self.fs.sync()?;
                Ok(0)
            }
            Command::StatFs => {
                let statfs = self.fs.statfs()?;
                write_u32(&mut resp.data, 0, statfs.total_blocks);
                write_u32(&mut resp.data, 4, statfs.free_blocks);
                write_u32(&mut resp.data, 8, statfs.total_inodes);
                write_u32(&mut resp.data, 12, statfs.used_inodes);
                write_u32(&mut resp.data, 16, statfs.block_size);
                Ok(statfs.free_blocks)
            }
        }
    }

    /// 处理一条键值存储请求，句柄归属规则与文件句柄相同
    pub fn handle_db(&mut self, req: &Request, sender: ModuleId) -> Response {
        let mut resp = Response::reply_to(req);
        match self.dispatch_db(req, sender, &mut resp) {
            Ok(result) => resp.result = result,
            Err(err) => {
                log::debug!("fs-server: kv cmd {:#04x} from module {sender}: {err:?}", req.cmd);
                resp.set_error(err);
            }
        }
        self.served = self.served.wrapping_add(1);
        resp
    }

    fn dispatch_db(&mut self, req: &Request, sender: ModuleId, resp: &mut Response) -> Result<u32> {
        let handle = req.handle;
        match req.db_command()? {
            DbCommand::KvOpen => {
                let namespace = req.name()?;
                let handle = self.kv.open(&mut self.fs, namespace, sender)?;
                self.record(Level::Info, format_args!("module {sender} opened kv {namespace}"));
                Ok(handle)
            }
            DbCommand::KvClose => {
                self.kv.close(handle, sender)?;
                Ok(0)
            }
            DbCommand::KvGet => {
                let len = (req.offset as usize).min(READ_MAX);
                let key = req.name()?;
                let n = self.kv.get(&mut self.fs, handle, sender, key, &mut resp.data[..len])?;
                Ok(n as u32)
            }
            DbCommand::KvPut => {
                let (key, value) = req.entry()?;
                self.kv.put(&mut self.fs, handle, sender, key, value)?;
                Ok(0)
            }
            DbCommand::KvDelete => {
                self.kv.delete(&mut self.fs, handle, sender, req.name()?)?;
                Ok(0)
            }
            DbCommand::KvCount => self.kv.count(handle, sender),
        }
    }

    /// 写一行系统日志，失败时只在控制台告警
    pub fn record(&mut self, level: Level, args: fmt::Arguments<'_>) {
        if let Some(syslog) = self.syslog.as_mut() {
            if let Err(err) = syslog.write(&mut self.fs, level, args) {
                log::warn!("fs-server: syslog write failed: {err:?}");
            }
        }
    }

    pub fn filesystem(&mut self) -> &mut Filesystem<D> {
        &mut self.fs
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn config_mut(&mut self) -> &mut Config {
        &mut self.config
    }

    pub fn save_config(&mut self) -> Result<()> {
        self.config.save(&mut self.fs)
    }

    pub fn syslog(&self) -> Option<&SysLog> {
        self.syslog.as_ref()
    }

    /// 已处理的请求数
    #[inline]
    pub fn served(&self) -> u32 {
        self.served
    }

    #[inline]
    pub fn open_files(&self) -> usize {
        self.handles.open_count()
    }

    #[inline]
    pub fn open_stores(&self) -> usize {
        self.kv.open_count()
    }

    /// 关闭 `owner` 的全部文件句柄与键值存储句柄，返回关闭的个数
    pub fn release_owner(&mut self, owner: ModuleId) -> usize {
        self.handles.release_owner(owner) + self.kv.release_owner(owner)
    }

    /// 卸载文件系统并交还块设备
    pub fn shutdown(mut self) -> Result<D> {
        let served = self.served;
        self.record(Level::Info, format_args!("shutdown after {} requests", served));
        self.fs.unmount()?;
        Ok(self.fs.into_device())
    }
}
