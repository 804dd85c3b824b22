//! 配置文件 `system.cfg`
//!
//! 每行一条 `key=value`，`#` 开头的行是注释。键与值两侧的空格和制表符被去掉，
//! 格式不对或超长的行被跳过。

use core::fmt::Write as _;

use arrayvec::ArrayString;
use block_dev::BlockDevice;
use ekkfs::{DevError, Error, Filesystem, InodeFlag, Result};

pub const CONFIG_FILE: &str = "system.cfg";
pub const MAX_ENTRIES: usize = 32;
pub const MAX_KEY_LEN: usize = 31;
pub const MAX_VALUE_LEN: usize = 63;

/// 一行最长的合法内容：键、等号、值，再留出两侧空白的余量
const LINE_CAPACITY: usize = 128;
const CHUNK: usize = 512;
const FILE_CAPACITY: usize = MAX_ENTRIES * (MAX_KEY_LEN + MAX_VALUE_LEN + 2);

#[derive(Debug, Clone, Copy, Default)]
struct Entry {
    key: ArrayString<MAX_KEY_LEN>,
    value: ArrayString<MAX_VALUE_LEN>,
}

#[derive(Debug, Clone)]
pub struct Config {
    entries: [Entry; MAX_ENTRIES],
    len: usize,
}

impl Config {
    pub const fn new() -> Self {
        Self {
            entries: [Entry {
                key: ArrayString::new_const(),
                value: ArrayString::new_const(),
            }; MAX_ENTRIES],
            len: 0,
        }
    }

    /// 从文件系统读入，文件不存在时得到空配置
    pub fn load<D: BlockDevice>(fs: &mut Filesystem<D>) -> Result<Self> {
        let mut config = Self::new();
        let mut file = match fs.open(CONFIG_FILE) {
            Ok(file) => file,
            Err(Error::NotFound) => {
                log::info!("config: no {CONFIG_FILE}, using defaults");
                return Ok(config);
            }
            Err(err) => return Err(err),
        };

        let mut line = [0u8; LINE_CAPACITY];
        let mut line_len = 0;
        let mut overlong = false;
        let mut chunk = [0u8; CHUNK];
        loop {
            let n = fs.read(&mut file, &mut chunk)?;
            if n == 0 {
                break;
            }
            for &byte in &chunk[..n] {
                if byte == b'\n' {
                    if !overlong {
                        config.parse_line(&line[..line_len]);
                    }
                    line_len = 0;
                    overlong = false;
                } else if line_len < LINE_CAPACITY {
                    line[line_len] = byte;
                    line_len += 1;
                } else {
                    overlong = true;
                }
            }
        }
        if !overlong {
            config.parse_line(&line[..line_len]);
        }

        log::info!("config: loaded {} entries", config.len);
        Ok(config)
    }

    /// 整个文件重写一遍：删除旧文件，以系统文件重建后写入全部条目
    pub fn save<D: BlockDevice>(&self, fs: &mut Filesystem<D>) -> Result<()> {
        let mut text = [0u8; FILE_CAPACITY];
        let mut len = 0;
        for entry in self.entries() {
            let parts: [&[u8]; 4] = [entry.key.as_bytes(), b"=", entry.value.as_bytes(), b"\n"];
            for part in parts {
                text[len..len + part.len()].copy_from_slice(part);
                len += part.len();
            }
        }

        match fs.delete(CONFIG_FILE, 0) {
            Ok(()) | Err(Error::NotFound) => {}
            Err(err) => return Err(err),
        }
        fs.create(CONFIG_FILE, 0, InodeFlag::System.into())?;
        let mut file = fs.open(CONFIG_FILE)?;
        let written = fs.write(&mut file, &text[..len], 0)?;
        fs.close(file)?;

        if written != len {
            log::error!("config: wrote {written} of {len} bytes");
            return Err(Error::Io(DevError::Data));
        }
        log::debug!("config: saved {} entries", self.len);
        Ok(())
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries()
            .iter()
            .find(|entry| entry.key.as_str() == key)
            .map(|entry| entry.value.as_str())
    }

    pub fn get_str<'a>(&'a self, key: &str, default: &'a str) -> &'a str {
        self.get(key).unwrap_or(default)
    }

    /// 值按 `atoi` 的规则解析：跳过前导空白，可选正负号，读到第一个非数字为止
    pub fn get_int(&self, key: &str, default: i32) -> i32 {
        self.get(key).map_or(default, atoi)
    }

    /// 键为空或过长、值过长时返回 [`Error::Invalid`]，表满时返回 [`Error::Full`]
    pub fn set(&mut self, key: &str, value: &str) -> Result<()> {
        if key.is_empty() {
            return Err(Error::Invalid);
        }
        let key_text = ArrayString::from(key).map_err(|_| Error::Invalid)?;
        let value_text = ArrayString::from(value).map_err(|_| Error::Invalid)?;

        if let Some(entry) = self.entries[..self.len]
            .iter_mut()
            .find(|entry| entry.key.as_str() == key)
        {
            entry.value = value_text;
            return Ok(());
        }

        let slot = self.entries.get_mut(self.len).ok_or(Error::Full)?;
        *slot = Entry {
            key: key_text,
            value: value_text,
        };
        self.len += 1;
        Ok(())
    }

    pub fn set_int(&mut self, key: &str, value: i32) -> Result<()> {
        let mut text = ArrayString::<MAX_VALUE_LEN>::new();
        // i32 的十进制表示放得下
        let _ = write!(text, "{value}");
        self.set(key, text.as_str())
    }

    pub fn remove(&mut self, key: &str) -> bool {
        let Some(index) = self.entries().iter().position(|entry| entry.key.as_str() == key) else {
            return false;
        };
        self.entries.copy_within(index + 1..self.len, index);
        self.len -= 1;
        true
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries()
            .iter()
            .map(|entry| (entry.key.as_str(), entry.value.as_str()))
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    fn entries(&self) -> &[Entry] {
        &self.entries[..self.len]
    }

    fn parse_line(&mut self, line: &[u8]) {
        let line = trim(line);
        if line.is_empty() || line[0] == b'#' {
            return;
        }
        let Some(eq) = line.iter().position(|&b| b == b'=') else {
            return;
        };
        let (Ok(key), Ok(value)) = (
            core::str::from_utf8(trim(&line[..eq])),
            core::str::from_utf8(trim(&line[eq + 1..])),
        ) else {
            return;
        };

        match self.set(key, value) {
            Ok(()) => {}
            Err(Error::Full) => log::warn!("config: table full, dropping {key}"),
            Err(_) => log::debug!("config: skipping malformed line"),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::new()
    }
}

fn trim(bytes: &[u8]) -> &[u8] {
    let blank = |b: &u8| matches!(b, b' ' | b'\t' | b'\r');
    let start = bytes.iter().position(|b| !blank(b)).unwrap_or(bytes.len());
    let end = bytes.iter().rposition(|b| !blank(b)).map_or(start, |i| i + 1);
    &bytes[start..end]
}

fn atoi(s: &str) -> i32 {
    let s = s.trim_start();
    let (negative, digits) = match s.as_bytes().first() {
        Some(b'-') => (true, &s[1..]),
        Some(b'+') => (false, &s[1..]),
        _ => (false, s),
    };
    let value = digits
        .bytes()
        .take_while(u8::is_ascii_digit)
        .fold(0i32, |acc, d| acc.wrapping_mul(10).wrapping_add((d - b'0') as i32));
    if negative { value.wrapping_neg() } else { value }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tests::{mounted, write_file};

    #[test]
    fn parse_skips_comments_and_garbage() {
        let (_, mut fs) = mounted();
        write_file(
            &mut fs,
            CONFIG_FILE,
            b"# boot settings\n\n  hostname = ekk-node\t\r\nno equals sign\n=empty key\nport=8080\nlevel= -3x\n",
        );

        let config = Config::load(&mut fs).unwrap();
        assert_eq!(3, config.len());
        assert_eq!("ekk-node", config.get_str("hostname", ""));
        assert_eq!(8080, config.get_int("port", 0));
        assert_eq!(-3, config.get_int("level", 0));
        assert_eq!(7, config.get_int("missing", 7));
        assert_eq!("dflt", config.get_str("missing", "dflt"));
    }

    #[test]
    fn missing_file_is_empty() {
        let (_, mut fs) = mounted();
        assert!(Config::load(&mut fs).unwrap().is_empty());
    }

    #[test]
    fn overlong_lines_are_skipped() {
        let (_, mut fs) = mounted();
        let key = "k".repeat(MAX_KEY_LEN + 1);
        let value = "v".repeat(200);
        let text = format!("{key}=1\nshort={value}\nok=yes\nlast=1");
        write_file(&mut fs, CONFIG_FILE, text.as_bytes());

        let config = Config::load(&mut fs).unwrap();
        assert_eq!(vec![("ok", "yes"), ("last", "1")], config.iter().collect::<Vec<_>>());
    }

    #[test]
    fn set_limits() {
        let mut config = Config::new();
        assert_eq!(Err(Error::Invalid), config.set("", "x"));
        assert_eq!(Err(Error::Invalid), config.set(&"k".repeat(32), "x"));
        assert_eq!(Err(Error::Invalid), config.set("k", &"v".repeat(64)));
        config.set(&"k".repeat(31), &"v".repeat(63)).unwrap();

        for i in 1..MAX_ENTRIES {
            config.set_int(&format!("key{i}"), i as i32).unwrap();
        }
        assert_eq!(Err(Error::Full), config.set("one-more", "x"));
        // 已有的键仍可改写
        config.set_int("key5", -50).unwrap();
        assert_eq!(-50, config.get_int("key5", 0));

        assert!(config.remove("key5"));
        assert!(!config.remove("key5"));
        assert_eq!(MAX_ENTRIES - 1, config.len());
        assert_eq!(6, config.get_int("key6", 0));
    }

    #[test]
    fn save_then_load() {
        let (disk, mut fs) = mounted();
        let mut config = Config::new();
        config.set("name", "core three").unwrap();
        config.set_int("inodes", 256).unwrap();
        config.save(&mut fs).unwrap();

        let stat = fs.stat(CONFIG_FILE).unwrap();
        assert_eq!(0, stat.owner);
        assert!(stat.flags.contains(InodeFlag::System));
        // 系统文件只有系统能删
        assert_eq!(Err(Error::Permission), fs.delete(CONFIG_FILE, 2));

        config.set("name", "renamed").unwrap();
        config.save(&mut fs).unwrap();
        fs.unmount().unwrap();

        let mut fs = crate::tests::remount(&disk);
        let loaded = Config::load(&mut fs).unwrap();
        assert_eq!("renamed", loaded.get_str("name", ""));
        assert_eq!(256, loaded.get_int("inodes", 0));
        assert_eq!(2, loaded.len());
    }

    #[test]
    fn atoi_rules() {
        assert_eq!(42, atoi("  42"));
        assert_eq!(-17, atoi("-17abc"));
        assert_eq!(5, atoi("+5"));
        assert_eq!(0, atoi("abc"));
        assert_eq!(0, atoi(""));
    }
}
