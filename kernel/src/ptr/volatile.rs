//! 内存映射寄存器
//!
//! 寄存器块以 `#[repr(C)]` 结构体描述，字段类型决定了可做的访问。

use core::ops::{BitAnd, BitOr, Not};

/// 只读寄存器
#[repr(transparent)]
pub struct ReadOnly<T: Copy>(T);

/// 只写寄存器
#[repr(transparent)]
pub struct WriteOnly<T: Copy>(T);

/// 可读可写寄存器
#[repr(transparent)]
pub struct Volatile<T: Copy>(T);

/// 未使用的寄存器位置
#[repr(transparent)]
pub struct Reserved<T: Copy>(T);

impl<T: Copy> ReadOnly<T> {
    #[inline]
    pub fn read(&self) -> T {
        unsafe { core::ptr::read_volatile(&self.0) }
    }
}

impl<T: Copy> WriteOnly<T> {
    #[inline]
    pub fn write(&mut self, value: T) {
        unsafe { core::ptr::write_volatile(&mut self.0, value) }
    }
}

impl<T: Copy> Volatile<T> {
    #[inline]
    pub fn read(&self) -> T {
        unsafe { core::ptr::read_volatile(&self.0) }
    }

    #[inline]
    pub fn write(&mut self, value: T) {
        unsafe { core::ptr::write_volatile(&mut self.0, value) }
    }

    /// 读改写，中间不屏蔽其他访问者
    #[inline]
    pub fn modify(&mut self, f: impl FnOnce(T) -> T) {
        let value = f(self.read());
        self.write(value);
    }
}

impl<T> Volatile<T>
where
    T: Copy + BitAnd<Output = T> + BitOr<Output = T> + Not<Output = T>,
{
    #[inline]
    pub fn set_bits(&mut self, bits: T) {
        self.modify(|v| v | bits);
    }

    #[inline]
    pub fn clear_bits(&mut self, bits: T) {
        self.modify(|v| v & !bits);
    }
}
