use core::cell::UnsafeCell;
use core::cell::{RefCell, RefMut};
use core::ops::{Deref, DerefMut};

use crate::arch;
use crate::config::MAX_CORES;

/// 每个核心一个，只被所属核心访问
static INTERRUPT_GUARDS: [SafeCell<InterruptGuard>; MAX_CORES] =
    [const { SafeCell::new(InterruptGuard::new()) }; MAX_CORES];

/// 只在一个核心上使用的可变状态
///
/// 借用期间屏蔽本核 IRQ，中断处理程序不会看到改到一半的数据。
/// 它不防其他核心：跨核共享的数据要用自旋锁。
#[derive(Debug)]
pub struct UpCell<T> {
    inner: RefCell<T>,
}
unsafe impl<T> Sync for UpCell<T> {}

// `Option`是为了在释放时可以提前销毁`RefMut`，不受启用中断的影响
pub struct UpRefMut<'a, T>(Option<RefMut<'a, T>>);

impl<T> UpCell<T> {
    pub const fn new(value: T) -> Self {
        Self {
            inner: RefCell::new(value),
        }
    }

    /// Panic if the data has been borrowed.
    pub fn exclusive_access(&self) -> UpRefMut<'_, T> {
        local_guard().enter();
        UpRefMut(Some(self.inner.borrow_mut()))
    }
}

impl<T> Drop for UpRefMut<'_, T> {
    fn drop(&mut self) {
        self.0 = None;
        local_guard().exit();
    }
}

impl<T> Deref for UpRefMut<'_, T> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        // 只在 drop 中置空
        match self.0.as_deref() {
            Some(inner) => inner,
            None => unreachable!(),
        }
    }
}

impl<T> DerefMut for UpRefMut<'_, T> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        match self.0.as_deref_mut() {
            Some(inner) => inner,
            None => unreachable!(),
        }
    }
}

fn local_guard() -> &'static mut InterruptGuard {
    INTERRUPT_GUARDS[arch::core_id().index()].get_mut()
}

/// 中断守卫，负责本核 IRQ 的屏蔽与恢复
struct InterruptGuard {
    nested_level: usize,
    /// 屏蔽之前 IRQ 是否开启
    irq_before_shield: bool,
}

impl InterruptGuard {
    const fn new() -> Self {
        Self {
            nested_level: 0,
            irq_before_shield: false,
        }
    }

    fn enter(&mut self) {
        let irq = arch::critical_enter();
        if self.nested_level == 0 {
            self.irq_before_shield = irq;
        }
        self.nested_level += 1;
    }

    fn exit(&mut self) {
        self.nested_level -= 1;
        if self.nested_level == 0 {
            arch::critical_exit(self.irq_before_shield);
        }
    }
}

struct SafeCell<T>(UnsafeCell<T>);
unsafe impl<T> Sync for SafeCell<T> {}
impl<T> SafeCell<T> {
    const fn new(value: T) -> Self {
        Self(UnsafeCell::new(value))
    }
}
impl<T> SafeCell<T> {
    #[allow(clippy::mut_from_ref)]
    fn get_mut(&self) -> &mut T {
        unsafe { &mut *self.0.get() }
    }
}
