use block_dev::DevError;

pub type Result<T> = core::result::Result<T, Error>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// 底层块设备出错，保留驱动给出的原因
    Io(DevError),
    /// 魔数、版本或 CRC 校验失败
    Corrupt,
    NotFound,
    Exists,
    /// 没有空闲数据块
    Full,
    NoInodes,
    /// 参数越界或布局不合法
    Invalid,
    NotMounted,
    NameTooLong,
    Permission,
}

impl From<DevError> for Error {
    fn from(err: DevError) -> Self {
        Self::Io(err)
    }
}

impl Error {
    /// 对外暴露的错误码，`0` 留给成功
    pub const fn code(self) -> i32 {
        match self {
            Self::Io(_) => -1,
            Self::Corrupt => -2,
            Self::NotFound => -3,
            Self::Exists => -4,
            Self::Full => -5,
            Self::NoInodes => -6,
            Self::Invalid => -7,
            Self::NotMounted => -8,
            Self::NameTooLong => -9,
            Self::Permission => -10,
        }
    }

    /// [`Error::code`] 的逆映射。设备错误的具体原因不在码里，还原为 [`DevError::Data`]
    pub const fn from_code(code: i32) -> Option<Self> {
        Some(match code {
            -1 => Self::Io(DevError::Data),
            -2 => Self::Corrupt,
            -3 => Self::NotFound,
            -4 => Self::Exists,
            -5 => Self::Full,
            -6 => Self::NoInodes,
            -7 => Self::Invalid,
            -8 => Self::NotMounted,
            -9 => Self::NameTooLong,
            -10 => Self::Permission,
            _ => return None,
        })
    }
}
