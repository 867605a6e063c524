//! 基于 tokio 的事件循环实现
//!
//! `LocalEventLoop` 把任务通过 `tokio::task::spawn_local` 提交到当前正在运行的
//! `LocalSet` 中，定时任务则在 `tokio::time::sleep` 之后运行。由于任务不要求 `Send`，
//! 它必须在 `LocalSet` 的上下文中使用，否则 `spawn_local` 会 panic。

use std::cell::Cell;
use std::rc::Rc;
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};

use tokio::task::JoinHandle;

use super::{Cancel, EventLoop, Task, TimerHandle};

/// 运行在 tokio `LocalSet` 上的单线程事件循环。
///
/// 必须在将要运行它的线程上创建：[`EventLoop::in_event_loop`] 通过比较线程 ID 实现。
/// 时钟使用 `tokio::time::Instant`，因此在 `tokio::time::pause()` 下同样适用。
#[derive(Clone, Debug)]
pub struct LocalEventLoop {
    thread: ThreadId,
}

struct LocalTimer {
    join: JoinHandle<()>,
    fired: Rc<Cell<bool>>,
}

impl LocalEventLoop {
    /// 创建一个绑定到当前线程的事件循环。
    pub fn new() -> LocalEventLoop {
        LocalEventLoop {
            thread: thread::current().id(),
        }
    }
}

impl Default for LocalEventLoop {
    fn default() -> LocalEventLoop {
        LocalEventLoop::new()
    }
}

impl EventLoop for LocalEventLoop {
    fn execute(&self, task: Task) {
        // This will spawn into the currently running `LocalSet`.
        tokio::task::spawn_local(async move { task() });
    }

    fn schedule(&self, task: Task, delay: Duration) -> TimerHandle {
        let fired = Rc::new(Cell::new(false));
        let flag = fired.clone();
        let join = tokio::task::spawn_local(async move {
            tokio::time::sleep(delay).await;
            flag.set(true);
            task();
        });
        TimerHandle::new(LocalTimer { join, fired })
    }

    fn in_event_loop(&self) -> bool {
        thread::current().id() == self.thread
    }

    fn now(&self) -> Instant {
        tokio::time::Instant::now().into_std()
    }
}

impl Cancel for LocalTimer {
    fn cancel(&self) -> bool {
        if self.fired.get() {
            return false;
        }
        self.join.abort();
        true
    }
}
