/// 块设备驱动上报的错误
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DevError {
    /// 轮询超时
    Timeout,
    /// 命令阶段出错（CRC、索引、响应超时等）
    Command,
    /// 数据阶段出错，或读到的内容不合法
    Data,
    /// 设备未初始化或不存在
    NotReady,
    /// 设备不支持该操作
    Unsupported,
}

impl DevError {
    /// 驱动层的错误码
    pub const fn code(self) -> i32 {
        match self {
            Self::Timeout => -1,
            Self::Command => -2,
            Self::Data => -3,
            Self::NotReady => -4,
            Self::Unsupported => -5,
        }
    }
}
