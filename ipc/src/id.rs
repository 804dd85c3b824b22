use derive_more::{Display, From, Into};

use crate::MAX_CORES;

/// 物理核心编号，`0..MAX_CORES`
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, From, Into)]
pub struct CoreId(pub u8);

/// 模块编号：核心 `n` 上运行的模块为 `n + 1`，0 表示广播（作为发送方时表示系统）
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, From, Into)]
pub struct ModuleId(pub u8);

impl CoreId {
    #[inline]
    pub const fn module(self) -> ModuleId {
        ModuleId(self.0 + 1)
    }

    #[inline]
    pub const fn index(self) -> usize {
        self.0 as usize
    }

    #[inline]
    pub const fn is_valid(self) -> bool {
        (self.0 as usize) < MAX_CORES
    }
}

impl ModuleId {
    pub const BROADCAST: Self = Self(0);
    /// 作为请求方时，0 号代表系统本身
    pub const SYSTEM: Self = Self(0);

    #[inline]
    pub const fn is_broadcast(self) -> bool {
        self.0 == 0
    }

    /// 模块所在的核心，广播或越界时为 `None`
    pub const fn core(self) -> Option<CoreId> {
        if self.0 == 0 || self.0 as usize > MAX_CORES {
            None
        } else {
            Some(CoreId(self.0 - 1))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn module_core_mapping() {
        assert_eq!(ModuleId(1), CoreId(0).module());
        assert_eq!(Some(CoreId(3)), ModuleId(4).core());
        assert_eq!(None, ModuleId::BROADCAST.core());
        assert_eq!(None, ModuleId(5).core());
        assert_eq!(7u8, u8::from(ModuleId::from(7)));
    }
}
