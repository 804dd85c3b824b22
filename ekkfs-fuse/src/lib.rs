//! 在宿主机上制作 EKKFS 镜像：写入 MBR，格式化分区，再把文件拷进去。
//! 做好的镜像可以直接写进 SD 卡。

mod block_file;
#[cfg(test)]
mod tests;

use std::fmt;
use std::fs::{self, File};
use std::io;
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

use block_dev::mbr::{self, PART_TYPE_EKKFS, PARTITION_COUNT, Partition};
use block_dev::{BLOCK_SIZE, DevError};
use ekkfs::layout::MAX_BITMAP_BLOCKS;
use ekkfs::{BLOCK_BITS, Filesystem, MAX_NAME_LEN};
use enumflags2::BitFlags;

pub use self::block_file::BlockFile;

/// EKKFS 分区的起始 LBA，前面留给 MBR 与固件对齐
pub const PARTITION_START: u32 = 2048;
/// 打包进镜像的文件都属于系统
pub const OWNER: u16 = 0;
/// 命令行不指定时的镜像大小
pub const DEFAULT_SIZE_MIB: u64 = 64;
/// 位图能覆盖的最大分区块数
pub const MAX_PARTITION_BLOCKS: u64 = (MAX_BITMAP_BLOCKS * BLOCK_BITS) as u64;

#[derive(Debug)]
pub enum PackError {
    Io(io::Error),
    Fs(ekkfs::Error),
    /// 镜像小到放不下分区
    TooSmall(u64),
    /// 分区超出位图能管理的范围
    TooLarge(u64),
}

impl From<io::Error> for PackError {
    fn from(err: io::Error) -> Self {
        Self::Io(err)
    }
}

impl From<ekkfs::Error> for PackError {
    fn from(err: ekkfs::Error) -> Self {
        Self::Fs(err)
    }
}

impl From<DevError> for PackError {
    fn from(err: DevError) -> Self {
        Self::Fs(err.into())
    }
}

impl fmt::Display for PackError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io(err) => write!(f, "{err}"),
            Self::Fs(err) => write!(f, "ekkfs: {err:?} ({})", err.code()),
            Self::TooSmall(size) => write!(f, "image of {size} bytes has no room for a partition"),
            Self::TooLarge(size) => write!(
                f,
                "image of {size} bytes exceeds the largest partition of {MAX_PARTITION_BLOCKS} blocks"
            ),
        }
    }
}

impl std::error::Error for PackError {}

pub type Result<T> = std::result::Result<T, PackError>;

/// 文件系统的时间来源：Unix 纪元以来的微秒数
pub fn now_us() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |elapsed| elapsed.as_micros() as u64)
}

/// 把 `fd` 截成 `size` 字节，写入只有一个 EKKFS 分区的 MBR，格式化并挂载
pub fn create_image(fd: File, size: u64, inodes: u32) -> Result<Filesystem<BlockFile>> {
    let total = size / BLOCK_SIZE as u64;
    if total <= PARTITION_START as u64 {
        return Err(PackError::TooSmall(size));
    }
    let sectors = total - PARTITION_START as u64;
    if sectors > MAX_PARTITION_BLOCKS {
        return Err(PackError::TooLarge(size));
    }
    let sectors = sectors as u32;
    fd.set_len(size)?;

    let dev = BlockFile::new(fd);
    let mut parts = [Partition::default(); PARTITION_COUNT];
    parts[0] = Partition::new(PART_TYPE_EKKFS, PARTITION_START, sectors);
    mbr::write_partitions(&dev, &parts)?;

    let mut fs = Filesystem::new(dev, now_us);
    fs.format(PARTITION_START, sectors, inodes)?;
    fs.mount(PARTITION_START)?;
    log::info!("formatted {sectors} blocks at LBA {PARTITION_START} with {inodes} inodes");
    Ok(fs)
}

/// 按 MBR 找到 EKKFS 分区并挂载
pub fn open_image(fd: File) -> Result<Filesystem<BlockFile>> {
    let dev = BlockFile::new(fd);
    let part = mbr::find_ekkfs_partition(&dev)?.ok_or(PackError::Fs(ekkfs::Error::NotFound))?;
    let mut fs = Filesystem::new(dev, now_us);
    fs.mount(part.lba_start)?;
    Ok(fs)
}

/// 新建文件 `name` 并写入 `data`
pub fn pack_file(fs: &mut Filesystem<BlockFile>, name: &str, data: &[u8]) -> Result<()> {
    fs.create(name, OWNER, BitFlags::empty())?;
    let mut file = fs.open(name)?;
    let mut written = 0;
    while written < data.len() {
        match fs.write(&mut file, &data[written..], OWNER)? {
            0 => return Err(ekkfs::Error::Full.into()),
            len => written += len,
        }
    }
    fs.close(file)?;
    log::debug!("packed {name:?}, {} bytes", data.len());
    Ok(())
}

/// 拷入 `dir` 下的所有普通文件，按名字排序；跳过名字超长的文件。
/// 返回拷入的文件名
pub fn pack_dir(fs: &mut Filesystem<BlockFile>, dir: &Path) -> Result<Vec<String>> {
    let mut names = fs::read_dir(dir)?
        .filter_map(|entry| {
            let entry = entry.ok()?;
            entry.file_type().ok()?.is_file().then(|| entry.file_name())
        })
        .filter_map(|name| match name.into_string() {
            Ok(name) => Some(name),
            Err(name) => {
                log::warn!("skip {name:?}: not UTF-8");
                None
            }
        })
        .collect::<Vec<_>>();
    names.sort();

    let mut packed = Vec::with_capacity(names.len());
    for name in names {
        if name.len() > MAX_NAME_LEN {
            log::warn!("skip {name:?}: longer than {MAX_NAME_LEN} bytes");
            continue;
        }
        let data = fs::read(dir.join(&name))?;
        pack_file(fs, &name, &data)?;
        packed.push(name);
    }
    Ok(packed)
}

/// 写回并卸载，之后镜像即可使用
pub fn finish(mut fs: Filesystem<BlockFile>) -> Result<File> {
    fs.sync()?;
    fs.unmount()?;
    Ok(fs.into_device().into_inner())
}
