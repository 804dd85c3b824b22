//! 保存在 EKKFS 上的滚动日志
//!
//! 每条记录占一行，形如 `[INFO ] message`。文件达到上限后依次改名为
//! `system.log.1`、`system.log.2` ……，最旧的一份被删除。

use core::fmt::{self, Write as _};

use arrayvec::ArrayString;
use block_dev::BlockDevice;
use ekkfs::{Error, FileHandle, Filesystem, InodeFlag, MAX_NAME_LEN, Result};
use log::{Level, LevelFilter};

pub const LOG_FILE: &str = "system.log";
pub const DEFAULT_MAX_SIZE: u32 = 4096;
pub const DEFAULT_ROTATIONS: u8 = 3;
/// 后缀只有一位数字
const MAX_ROTATIONS: u8 = 9;
const LINE_CAPACITY: usize = 256;
/// 为 `.N` 后缀留出的位置
const BASE_LEN: usize = MAX_NAME_LEN - 2;

type Name = ArrayString<MAX_NAME_LEN>;

#[derive(Debug)]
pub struct SysLog {
    name: Name,
    file: FileHandle,
    size: u32,
    max_size: u32,
    rotations: u8,
    level: LevelFilter,
}

impl SysLog {
    /// 打开（必要时创建）日志文件并定位到末尾。
    ///
    /// `name` 为空时使用 [`LOG_FILE`]，`max_size` 或 `rotations` 为 0 时使用默认值。
    pub fn open<D: BlockDevice>(
        fs: &mut Filesystem<D>,
        name: &str,
        max_size: u32,
        rotations: u8,
    ) -> Result<Self> {
        let name = if name.is_empty() { LOG_FILE } else { name };
        let name = Name::from(name).map_err(|_| Error::NameTooLong)?;

        let size = match fs.stat(name.as_str()) {
            Ok(stat) => stat.size,
            Err(Error::NotFound) => {
                fs.create(name.as_str(), 0, InodeFlag::Log.into())?;
                0
            }
            Err(err) => return Err(err),
        };
        let mut file = fs.open(name.as_str())?;
        file.seek(size);

        let syslog = Self {
            name,
            file,
            size,
            max_size: if max_size == 0 { DEFAULT_MAX_SIZE } else { max_size },
            rotations: match rotations {
                0 => DEFAULT_ROTATIONS,
                n => n.min(MAX_ROTATIONS),
            },
            level: LevelFilter::Info,
        };
        log::info!(
            "syslog: {} (size={}, max={}, rotations={})",
            syslog.name,
            syslog.size,
            syslog.max_size,
            syslog.rotations
        );
        Ok(syslog)
    }

    #[inline]
    pub fn name(&self) -> &str {
        self.name.as_str()
    }

    #[inline]
    pub fn size(&self) -> u32 {
        self.size
    }

    pub fn set_level(&mut self, level: LevelFilter) {
        self.level = level;
    }

    /// 追加一行，返回写入的字节数；低于当前级别的记录被丢弃并返回 0。
    /// 过长的消息被截断。
    pub fn write<D: BlockDevice>(
        &mut self,
        fs: &mut Filesystem<D>,
        level: Level,
        args: fmt::Arguments<'_>,
    ) -> Result<usize> {
        if level > self.level {
            return Ok(0);
        }
        if self.size >= self.max_size {
            self.rotate(fs)?;
        }

        let mut line = Truncate(ArrayString::<LINE_CAPACITY>::new());
        let _ = write!(line, "[{level:<5}] {args}");
        if line.0.remaining_capacity() == 0 {
            line.0.pop();
        }
        line.0.push('\n');

        let written = fs.write(&mut self.file, line.0.as_bytes(), 0)?;
        self.size = self.file.pos();
        Ok(written)
    }

    /// 立即滚动：当前文件改名为 `.1`，其余依次后移，最旧的被删除
    pub fn rotate<D: BlockDevice>(&mut self, fs: &mut Filesystem<D>) -> Result<()> {
        log::info!("syslog: rotating {}", self.name);

        ignore_missing(fs.delete(self.rotated(self.rotations).as_str(), 0))?;
        for i in (1..self.rotations).rev() {
            let from = self.rotated(i);
            let to = self.rotated(i + 1);
            ignore_missing(fs.rename(from.as_str(), to.as_str(), 0))?;
        }

        if self.size > 0 {
            fs.rename(self.name.as_str(), self.rotated(1).as_str(), 0)?;
            fs.create(self.name.as_str(), 0, InodeFlag::Log.into())?;
        }
        self.file = fs.open(self.name.as_str())?;
        self.size = 0;
        Ok(())
    }

    /// 第 `n` 份旧日志的文件名，基础名超长时截断
    fn rotated(&self, n: u8) -> Name {
        let mut name = Name::new();
        let mut base = ArrayString::<BASE_LEN>::new();
        push_truncated(&mut base, &self.name);
        // 截断后的基础名加两个字节必定放得下
        let _ = write!(name, "{base}.{n}");
        name
    }
}

/// 放不下的部分直接丢弃，从不报错
struct Truncate<const N: usize>(ArrayString<N>);

impl<const N: usize> fmt::Write for Truncate<N> {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        push_truncated(&mut self.0, s);
        Ok(())
    }
}

/// 尽量多地追加，在字符边界处截断
fn push_truncated<const N: usize>(buf: &mut ArrayString<N>, s: &str) {
    let mut end = s.len().min(buf.remaining_capacity());
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    buf.push_str(&s[..end]);
}

fn ignore_missing(result: Result<()>) -> Result<()> {
    match result {
        Err(Error::NotFound) => Ok(()),
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tests::{mounted, read_file};

    #[test]
    fn appends_with_level_prefix() {
        let (_, mut fs) = mounted();
        let mut syslog = SysLog::open(&mut fs, "", 0, 0).unwrap();
        assert_eq!(LOG_FILE, syslog.name());

        syslog.write(&mut fs, Level::Info, format_args!("mounted {}", 3)).unwrap();
        assert_eq!(0, syslog.write(&mut fs, Level::Debug, format_args!("hidden")).unwrap());
        syslog.write(&mut fs, Level::Error, format_args!("disk {}", "gone")).unwrap();

        let text = read_file(&mut fs, LOG_FILE);
        assert_eq!("[INFO ] mounted 3\n[ERROR] disk gone\n", String::from_utf8(text).unwrap());
        assert_eq!(36, syslog.size());

        syslog.set_level(LevelFilter::Debug);
        assert!(syslog.write(&mut fs, Level::Debug, format_args!("shown")).unwrap() > 0);
    }

    #[test]
    fn reopen_continues_at_end() {
        let (_, mut fs) = mounted();
        let mut syslog = SysLog::open(&mut fs, "boot.log", 0, 0).unwrap();
        syslog.write(&mut fs, Level::Warn, format_args!("first")).unwrap();

        let mut syslog = SysLog::open(&mut fs, "boot.log", 0, 0).unwrap();
        assert_eq!(14, syslog.size());
        syslog.write(&mut fs, Level::Warn, format_args!("second")).unwrap();
        assert_eq!(
            b"[WARN ] first\n[WARN ] second\n".to_vec(),
            read_file(&mut fs, "boot.log")
        );
    }

    #[test]
    fn long_lines_are_truncated() {
        let (_, mut fs) = mounted();
        let mut syslog = SysLog::open(&mut fs, "", 0, 0).unwrap();
        let long = "x".repeat(1000);
        let written = syslog.write(&mut fs, Level::Info, format_args!("{long}")).unwrap();
        assert_eq!(LINE_CAPACITY, written);
        assert_eq!(Some(&b'\n'), read_file(&mut fs, LOG_FILE).last());
    }

    #[test]
    fn truncation_keeps_whole_chars() {
        let (_, mut fs) = mounted();
        let mut syslog = SysLog::open(&mut fs, "", 0, 0).unwrap();
        let long = "ä".repeat(200);
        let written = syslog.write(&mut fs, Level::Info, format_args!("{long}")).unwrap();
        assert_eq!(LINE_CAPACITY - 1, written);

        let text = String::from_utf8(read_file(&mut fs, LOG_FILE)).unwrap();
        assert!(text.starts_with("[INFO ] ää"));
        assert!(text.ends_with("ä\n"));
    }

    #[test]
    fn rotation_keeps_newest_generations() {
        let (_, mut fs) = mounted();
        let mut syslog = SysLog::open(&mut fs, "", 64, 2).unwrap();

        // 每条 32 字节，两条写满一个文件
        for i in 0..7 {
            syslog
                .write(&mut fs, Level::Info, format_args!("entry {i:02} {}", "-".repeat(14)))
                .unwrap();
        }

        let current = String::from_utf8(read_file(&mut fs, LOG_FILE)).unwrap();
        let older = String::from_utf8(read_file(&mut fs, "system.log.1")).unwrap();
        let oldest = String::from_utf8(read_file(&mut fs, "system.log.2")).unwrap();
        assert!(current.contains("entry 06"));
        assert!(older.contains("entry 04") && older.contains("entry 05"));
        assert!(oldest.contains("entry 02") && oldest.contains("entry 03"));
        assert_eq!(Err(Error::NotFound), fs.stat("system.log.3"));
        assert_eq!(32, syslog.size());
    }

    #[test]
    fn rotated_names_fit() {
        let (_, mut fs) = mounted();
        let syslog = SysLog::open(&mut fs, "fifteen-chars.x", 0, 0).unwrap();
        assert_eq!("fifteen-chars.x", syslog.name());
        assert_eq!("fifteen-chars.3", syslog.rotated(3).as_str());
        assert_eq!(
            Err(Error::NameTooLong),
            SysLog::open(&mut fs, "sixteen-chars.xx", 0, 0).map(|_| ())
        );
    }
}
