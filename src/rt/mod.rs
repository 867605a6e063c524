//! 运行时抽象组件模块
//!
//! 截止时间调度器和 keep-alive 状态机本身不创建任何线程，也不绑定具体的异步运行时。
//! 它们只依赖本模块中的 [`EventLoop`] trait：一个单线程、非阻塞的任务执行器，
//! 能够立即执行任务或在一段延迟之后执行任务，并且保证同一连接/请求的所有任务
//! 都运行在同一个线程上。
//!
//! 本模块的主要组件包括：
//!
//! - **[`EventLoop`]**：执行器 + 定时器 + 时钟的抽象。
//! - **[`TimerHandle`]**：`EventLoop::schedule` 返回的可取消句柄。
//! - **[`LocalEventLoop`]**：基于 tokio `LocalSet` 的默认实现。
//!
//! 通过实现 [`EventLoop`]，你可以把状态机接入任何单线程事件循环，
//! 或者在测试中注入一个虚拟时钟。

mod local;
mod timer;

pub use self::local::LocalEventLoop;
pub use self::timer::{Cancel, TimerHandle};

use std::time::{Duration, Instant};

/// 可以提交给 [`EventLoop`] 的任务。
///
/// 任务不要求 `Send`：它们总是运行在拥有连接的那个线程上。
pub type Task = Box<dyn FnOnce() + 'static>;

/// 单线程事件循环 trait。
///
/// 所有方法都必须是非阻塞的：`schedule` 只是登记一个未来的回调并立即返回。
///
/// # 示例
///
/// ```
/// # use std::time::Duration;
/// # use lifeline::rt::{EventLoop, LocalEventLoop};
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() {
/// let local = tokio::task::LocalSet::new();
/// local.run_until(async {
///     let event_loop = LocalEventLoop::new();
///     let handle = event_loop.schedule(Box::new(|| println!("fired")), Duration::from_secs(1));
///     assert!(handle.cancel());
/// }).await;
/// # }
/// ```
pub trait EventLoop {
    /// 尽快在事件循环线程上执行 `task`。
    fn execute(&self, task: Task);

    /// 在 `delay` 之后于事件循环线程上执行 `task`。
    ///
    /// `delay` 为零时任务在下一个 tick 运行，而不是在调用栈内同步运行。
    fn schedule(&self, task: Task, delay: Duration) -> TimerHandle;

    /// 当前线程是否就是事件循环线程。
    fn in_event_loop(&self) -> bool;

    /// 返回代表当前时间的 `Instant`。
    ///
    /// 默认实现直接调用 [`Instant::now()`]。
    /// 在测试场景中，可以覆盖此方法以返回模拟时间。
    fn now(&self) -> Instant {
        Instant::now()
    }
}
