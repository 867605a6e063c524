//! 测试用的虚拟时钟事件循环。
//!
//! 时间只在调用 [`MockEventLoop::advance`] 时前进，到期的定时任务按截止时间
//! 顺序依次运行，因此可以精确断言"某个时刻之前没有触发"。

use std::cell::{Cell, RefCell};
use std::collections::{BTreeMap, VecDeque};
use std::rc::Rc;
use std::time::{Duration, Instant};

use crate::rt::{Cancel, EventLoop, Task, TimerHandle};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum TimerState {
    Pending,
    Fired,
    Canceled,
}

struct Entry {
    task: Task,
    state: Rc<Cell<TimerState>>,
}

struct Inner {
    origin: Instant,
    now: Instant,
    seq: u64,
    timers: BTreeMap<(Instant, u64), Entry>,
    ready: VecDeque<Task>,
}

pub(crate) struct MockEventLoop {
    inner: RefCell<Inner>,
    off_thread: Cell<bool>,
}

struct MockTimer {
    state: Rc<Cell<TimerState>>,
}

impl MockEventLoop {
    pub(crate) fn new() -> Rc<MockEventLoop> {
        let origin = Instant::now();
        Rc::new(MockEventLoop {
            inner: RefCell::new(Inner {
                origin,
                now: origin,
                seq: 0,
                timers: BTreeMap::new(),
                ready: VecDeque::new(),
            }),
            off_thread: Cell::new(false),
        })
    }

    /// 自创建以来经过的虚拟时间。
    pub(crate) fn elapsed(&self) -> Duration {
        let inner = self.inner.borrow();
        inner.now - inner.origin
    }

    /// 让 `in_event_loop` 返回 `false`，模拟从其他线程调用。
    pub(crate) fn set_off_thread(&self, off_thread: bool) {
        self.off_thread.set(off_thread);
    }

    /// 还未触发也未取消的定时任务数量。
    pub(crate) fn pending_timers(&self) -> usize {
        self.inner
            .borrow()
            .timers
            .values()
            .filter(|entry| entry.state.get() == TimerState::Pending)
            .count()
    }

    /// 运行所有立即任务，包括它们在运行中提交的新任务。
    pub(crate) fn run_pending(&self) {
        loop {
            let next = self.inner.borrow_mut().ready.pop_front();
            match next {
                Some(task) => task(),
                None => return,
            }
        }
    }

    /// 运行零延迟的定时任务和立即任务，不推进时间。
    pub(crate) fn tick(&self) {
        self.advance(Duration::ZERO);
    }

    /// 把虚拟时钟推进 `dur`，按截止时间顺序运行期间到期的所有任务。
    ///
    /// 每个任务运行时，时钟恰好停在它的截止时间上。
    pub(crate) fn advance(&self, dur: Duration) {
        let target = self.inner.borrow().now + dur;
        loop {
            self.run_pending();

            let due = {
                let mut inner = self.inner.borrow_mut();
                let key = match inner.timers.keys().next() {
                    Some(&key) if key.0 <= target => key,
                    _ => break,
                };
                inner.timers.remove(&key).map(|entry| (key.0, entry))
            };

            if let Some((deadline, entry)) = due {
                if entry.state.get() != TimerState::Pending {
                    continue;
                }
                {
                    let mut inner = self.inner.borrow_mut();
                    if deadline > inner.now {
                        inner.now = deadline;
                    }
                }
                entry.state.set(TimerState::Fired);
                (entry.task)();
            }
        }

        let mut inner = self.inner.borrow_mut();
        if target > inner.now {
            inner.now = target;
        }
    }
}

impl EventLoop for MockEventLoop {
    fn execute(&self, task: Task) {
        self.inner.borrow_mut().ready.push_back(task);
    }

    fn schedule(&self, task: Task, delay: Duration) -> TimerHandle {
        let state = Rc::new(Cell::new(TimerState::Pending));
        let mut inner = self.inner.borrow_mut();
        let deadline = inner.now + delay;
        inner.seq += 1;
        let seq = inner.seq;
        inner.timers.insert(
            (deadline, seq),
            Entry {
                task,
                state: state.clone(),
            },
        );
        TimerHandle::new(MockTimer { state })
    }

    fn in_event_loop(&self) -> bool {
        !self.off_thread.get()
    }

    fn now(&self) -> Instant {
        self.inner.borrow().now
    }
}

impl Cancel for MockTimer {
    fn cancel(&self) -> bool {
        if self.state.get() == TimerState::Pending {
            self.state.set(TimerState::Canceled);
            true
        } else {
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timers_fire_in_deadline_order() {
        let event_loop = MockEventLoop::new();
        let log = Rc::new(RefCell::new(Vec::new()));

        for (name, ms) in [("b", 20u64), ("a", 10), ("c", 20)] {
            let log = log.clone();
            let el = event_loop.clone();
            let _ = event_loop.schedule(
                Box::new(move || log.borrow_mut().push((name, el.elapsed()))),
                Duration::from_millis(ms),
            );
        }

        event_loop.advance(Duration::from_millis(15));
        assert_eq!(*log.borrow(), vec![("a", Duration::from_millis(10))]);

        event_loop.advance(Duration::from_millis(15));
        assert_eq!(
            *log.borrow(),
            vec![
                ("a", Duration::from_millis(10)),
                ("b", Duration::from_millis(20)),
                ("c", Duration::from_millis(20)),
            ]
        );
        assert_eq!(event_loop.elapsed(), Duration::from_millis(30));
    }

    #[test]
    fn off_thread_toggle() {
        let event_loop = MockEventLoop::new();
        assert!(event_loop.in_event_loop());
        event_loop.set_off_thread(true);
        assert!(!event_loop.in_event_loop());
        event_loop.set_off_thread(false);
        assert!(event_loop.in_event_loop());
    }

    #[test]
    fn canceled_timer_does_not_fire() {
        let event_loop = MockEventLoop::new();
        let fired = Rc::new(Cell::new(false));
        let flag = fired.clone();
        let handle = event_loop.schedule(Box::new(move || flag.set(true)), Duration::from_secs(1));

        assert_eq!(event_loop.pending_timers(), 1);
        assert!(handle.cancel());
        assert_eq!(event_loop.pending_timers(), 0);

        event_loop.advance(Duration::from_secs(2));
        assert!(!fired.get());
    }

    #[test]
    fn task_scheduled_while_firing_runs_in_same_advance() {
        let event_loop = MockEventLoop::new();
        let count = Rc::new(Cell::new(0));

        let el = event_loop.clone();
        let c = count.clone();
        let _ = event_loop.schedule(
            Box::new(move || {
                c.set(c.get() + 1);
                let c = c.clone();
                let _ = el.schedule(Box::new(move || c.set(c.get() + 1)), Duration::from_millis(5));
            }),
            Duration::from_millis(5),
        );

        event_loop.advance(Duration::from_millis(10));
        assert_eq!(count.get(), 2);
    }
}
