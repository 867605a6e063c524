//! 定时器句柄
//!
//! [`EventLoop::schedule`](super::EventLoop::schedule) 返回一个 [`TimerHandle`]，
//! 它把具体运行时的定时任务类型擦除为 `Box<dyn Cancel>`。

use std::fmt;

/// 可取消的定时任务。
///
/// 事件循环实现者为自己的定时任务类型实现此 trait。
pub trait Cancel {
    /// 尝试取消任务。
    ///
    /// 如果任务因此不会再运行，返回 `true`；如果任务已经运行过（或正在运行），
    /// 返回 `false`，此时取消是一个空操作。
    fn cancel(&self) -> bool;
}

/// 定时任务句柄。
///
/// 丢弃句柄不会取消任务；需要显式调用 [`TimerHandle::cancel`]。
pub struct TimerHandle {
    inner: Box<dyn Cancel>,
}

impl TimerHandle {
    /// 把一个具体的定时任务包装为句柄。
    pub fn new<C>(cancel: C) -> TimerHandle
    where
        C: Cancel + 'static,
    {
        TimerHandle {
            inner: Box::new(cancel),
        }
    }

    /// 取消定时任务，语义见 [`Cancel::cancel`]。
    pub fn cancel(self) -> bool {
        self.inner.cancel()
    }
}

impl fmt::Debug for TimerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TimerHandle").finish()
    }
}
