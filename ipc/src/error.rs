pub type Result<T> = core::result::Result<T, Error>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// 目标不存在或负载过长
    InvalidArg,
    /// 队列已满
    NoMemory,
    /// 没有待收的消息
    NotFound,
}

impl Error {
    pub const fn code(self) -> i32 {
        match self {
            Self::InvalidArg => -1,
            Self::NoMemory => -2,
            Self::NotFound => -5,
        }
    }
}
