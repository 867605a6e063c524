//! 两阶段完成信号。
//!
//! 截止时间调度器对外暴露两个相互独立的单次完成信号：
//! `when_timing_out`（超时任务运行**之前**完成）和 `when_timed_out`
//! （超时任务运行**之后**完成）。本模块实现了这两个信号所使用的类型。
//!
//! 信号建立在 `tokio::sync::watch` 之上：调度器持有唯一的 `Sender`，
//! 每个等待者订阅一个自己的 `Receiver`。这是整个 crate 中唯一允许跨线程观察的状态：
//! 信号可以在事件循环线程上完成，而在另一个线程上被等待。

use std::fmt;
use std::future::{Future, IntoFuture};
use std::pin::Pin;
use std::sync::Arc;

use tokio::sync::watch;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Outcome {
    Pending,
    Completed,
    Canceled,
}

/// 单次完成信号。
///
/// 克隆得到的句柄共享同一个信号：对其中任意一个的观察结果都相同。
/// 通过 `.await` 等待时：
///
/// - 正常超时完成后返回 `Ok(())`；
/// - 因非超时原因被提前结束（见
///   [`DeadlineScheduler::finish_now`](crate::DeadlineScheduler::finish_now)）
///   时返回 `Err(e)`，其中 `e.is_canceled()` 为 `true`；
/// - 调度器在结束之前被丢弃时同样视为取消。
#[derive(Clone)]
pub struct TimeoutSignal {
    tx: Arc<watch::Sender<Outcome>>,
}

impl TimeoutSignal {
    pub(crate) fn new() -> TimeoutSignal {
        let (tx, _rx) = watch::channel(Outcome::Pending);
        TimeoutSignal { tx: Arc::new(tx) }
    }

    /// 以"已完成"结束信号。只有第一次结束生效。
    pub(crate) fn complete(&self) -> bool {
        self.finish(Outcome::Completed)
    }

    /// 以"已取消"结束信号。只有第一次结束生效。
    pub(crate) fn cancel(&self) -> bool {
        self.finish(Outcome::Canceled)
    }

    fn finish(&self, outcome: Outcome) -> bool {
        self.tx.send_if_modified(|current| {
            if *current != Outcome::Pending {
                return false;
            }
            *current = outcome;
            true
        })
    }

    /// 信号是否已经结束（完成或取消）。
    pub fn is_done(&self) -> bool {
        self.load() != Outcome::Pending
    }

    /// 信号是否以"已完成"结束。
    pub fn is_completed(&self) -> bool {
        self.load() == Outcome::Completed
    }

    /// 信号是否以"已取消"结束。
    pub fn is_canceled(&self) -> bool {
        self.load() == Outcome::Canceled
    }

    /// 两个句柄是否指向同一个信号。
    pub fn ptr_eq(this: &TimeoutSignal, other: &TimeoutSignal) -> bool {
        Arc::ptr_eq(&this.tx, &other.tx)
    }

    fn load(&self) -> Outcome {
        *self.tx.borrow()
    }
}

impl IntoFuture for TimeoutSignal {
    type Output = crate::Result<()>;
    type IntoFuture = Pin<Box<dyn Future<Output = crate::Result<()>> + Send + 'static>>;

    fn into_future(self) -> Self::IntoFuture {
        // 等待者只持有 `Receiver`，不会让信号保持存活。
        let mut rx = self.tx.subscribe();
        drop(self);
        Box::pin(async move {
            let outcome = loop {
                let outcome = *rx.borrow_and_update();
                if outcome != Outcome::Pending {
                    break outcome;
                }
                if rx.changed().await.is_err() {
                    break *rx.borrow();
                }
            };
            match outcome {
                Outcome::Completed => Ok(()),
                // 调度器在结束之前被丢弃
                Outcome::Pending | Outcome::Canceled => Err(crate::Error::canceled()),
            }
        })
    }
}

impl fmt::Debug for TimeoutSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TimeoutSignal")
            .field("state", &self.load())
            .finish()
    }
}
