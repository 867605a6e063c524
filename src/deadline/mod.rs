//! 截止时间调度器
//!
//! [`DeadlineScheduler`] 为一个逻辑工作单元（通常是一次请求或响应）维护唯一一个
//! 可变、可取消的截止时间。它可以在事件循环确定之前就被创建并接受调整，
//! 这些调整会在 [`bind`](DeadlineScheduler::bind) 时按顺序重放。
//!
//! ## 状态
//!
//! ```text
//!            bind(timeout > 0)                   timer / timeout_now
//!   Init ───────────────────────▶ Scheduled ──────────────────────▶ TimedOut
//!     │                            │    ▲                               ▲
//!     │ bind(timeout <= 0)         │    │ set_timeout_nanos             │
//!     ▼                            ▼    │                               │
//!   Inactive ◀──────────────── clear_timeout                            │
//!     └────────────────────────── timeout_now ──────────────────────────┘
//! ```
//!
//! `TimedOut` 是终态，进入之后所有修改操作都是空操作。
//!
//! ## 两个完成信号
//!
//! 截止时间触发时，调度器按以下顺序执行：
//!
//! 1. 进入 `TimedOut`，取消仍在等待的定时器；
//! 2. 完成 [`when_timing_out`](DeadlineScheduler::when_timing_out)；
//! 3. 运行 [`TimeoutTask::run`]；
//! 4. 完成 [`when_timed_out`](DeadlineScheduler::when_timed_out)。
//!
//! 因此超时任务自己可以看到"正在超时、尚未结束"的中间状态，
//! 而只关心终态的观察者等待第二个信号即可。

mod pending;

use std::cell::RefCell;
use std::fmt;
use std::rc::{Rc, Weak};
use std::time::{Duration, Instant};

use self::pending::{PendingOp, PendingOps};
use crate::common::signal::TimeoutSignal;
use crate::common::time;
use crate::error::{Error, Result};
use crate::rt::{EventLoop, TimerHandle};

/// 截止时间的更新方式。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TimeoutMode {
    /// 新的截止时间 = 现在 + 给定值。值必须大于零。
    SetFromNow,
    /// 新的截止时间 = 开始时刻 + 给定值。零表示禁用超时，负数被拒绝。
    ///
    /// 开始时刻可能早已过去，此时截止时间已经到期，会在下一个 tick 触发。
    SetFromStart,
    /// 新的截止时间 = 当前截止时间 + 给定值，给定值可以为负。
    ///
    /// 对禁用的超时没有效果。
    Extend,
}

/// [`DeadlineScheduler`] 所处的状态。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum State {
    /// 已创建，尚未绑定到事件循环。
    Init,
    /// 有一个定时器正在等待。
    Scheduled,
    /// 超时被禁用或清除，没有定时器在等待。
    Inactive,
    /// 截止时间已经触发（或被强制触发），终态。
    TimedOut,
}

/// 截止时间到期时运行的任务。
pub trait TimeoutTask {
    /// 是否允许调度。
    ///
    /// 只在 [`DeadlineScheduler::bind`] 时调用一次。返回 `false` 时不会装载任何定时器，
    /// 之后所有操作都是空操作。
    fn can_schedule(&self) -> bool;

    /// 运行超时任务。在调度器的生命周期内最多调用一次。
    ///
    /// `cause` 是触发的原因：截止时间到期时 `cause.is_timeout()` 为 `true`，
    /// 通过 [`DeadlineScheduler::finish_now`] 提前结束时则是调用者给出的错误。
    fn run(&self, cause: &Error);
}

/// 单个可变截止时间的调度器。
///
/// `DeadlineScheduler` 是 `!Send` 的：它只能在拥有它的事件循环线程上使用。
/// 克隆得到的是同一个调度器的另一个句柄。
#[derive(Clone)]
pub struct DeadlineScheduler {
    shared: Rc<Shared>,
}

struct Shared {
    inner: RefCell<Inner>,
    timing_out: TimeoutSignal,
    timed_out: TimeoutSignal,
}

struct Inner {
    state: State,
    /// 距 `start` 的截止长度，`0` 表示禁用。绑定之前保存构造时的值。
    timeout: i64,
    start: Option<Instant>,
    pending: PendingOps,
    pending_finish: Option<Error>,
    event_loop: Option<Rc<dyn EventLoop>>,
    task: Option<Rc<dyn TimeoutTask>>,
    schedulable: bool,
    timer: Option<TimerHandle>,
    // 每次装载定时器都会递增，用来识别已经过期的定时器回调。
    generation: u64,
    cause: Option<Error>,
}

impl DeadlineScheduler {
    /// 创建一个尚未绑定的调度器。
    ///
    /// `timeout_nanos` 是绑定之前就已知的超时长度，可以为零（禁用）。
    /// 如果 `bind` 时给出的初始超时大于零，它会覆盖这个值。
    pub fn new(timeout_nanos: i64) -> DeadlineScheduler {
        DeadlineScheduler {
            shared: Rc::new(Shared {
                inner: RefCell::new(Inner {
                    state: State::Init,
                    timeout: timeout_nanos,
                    start: None,
                    pending: PendingOps::default(),
                    pending_finish: None,
                    event_loop: None,
                    task: None,
                    schedulable: false,
                    timer: None,
                    generation: 0,
                    cause: None,
                }),
                timing_out: TimeoutSignal::new(),
                timed_out: TimeoutSignal::new(),
            }),
        }
    }

    /// 把调度器绑定到事件循环和超时任务上。
    ///
    /// 绑定时刻成为开始时刻。绑定之前登记的调整按收到的顺序重放，
    /// `SET_FROM_NOW` 和 `SET_FROM_START` 都相对于绑定时刻计算。
    /// 之后如果超时大于零且 [`TimeoutTask::can_schedule`] 返回 `true`，
    /// 进入 `Scheduled`；否则进入 `Inactive`。
    ///
    /// 只有第一次调用生效，后续调用是空操作。
    pub fn bind(
        &self,
        event_loop: Rc<dyn EventLoop>,
        task: Rc<dyn TimeoutTask>,
        initial_timeout_nanos: i64,
    ) {
        if self.state() != State::Init {
            return;
        }
        debug_assert!(
            event_loop.in_event_loop(),
            "DeadlineScheduler::bind called outside of its event loop"
        );
        // 任务可能会查询调度器，询问时不能持有 `inner` 的借用。
        let schedulable = task.can_schedule();

        let finish = {
            let mut inner = self.shared.inner.borrow_mut();
            if inner.state != State::Init {
                return;
            }

            let base = if initial_timeout_nanos > 0 {
                initial_timeout_nanos
            } else {
                inner.timeout
            };
            let replayed = inner.pending.fold(base);
            inner.pending.clear();

            inner.start = Some(event_loop.now());
            inner.schedulable = schedulable;
            inner.event_loop = Some(event_loop);
            inner.task = Some(task);
            inner.timeout = replayed.timeout;

            if !schedulable {
                trace!("deadline bound, scheduling disabled");
                inner.state = State::Inactive;
                inner.pending_finish = None;
                return;
            }

            if replayed.armed {
                self.arm(&mut inner);
            } else {
                inner.state = State::Inactive;
            }
            trace!("deadline bound; timeout = {}ns", replayed.timeout);
            inner.pending_finish.take()
        };

        if let Some(cause) = finish {
            self.invoke(cause);
        }
    }

    /// 调整截止时间，语义见 [`TimeoutMode`]。
    ///
    /// 绑定之前的调整被登记下来，在绑定时重放。
    /// 已经超时之后调用没有任何效果。
    ///
    /// # 错误
    ///
    /// `SetFromNow` 的值不大于零，或 `SetFromStart` 的值小于零时返回错误，
    /// 并且不会改变任何状态。
    pub fn set_timeout_nanos(&self, mode: TimeoutMode, timeout_nanos: i64) -> Result<()> {
        match mode {
            TimeoutMode::SetFromNow if timeout_nanos <= 0 => {
                return Err(Error::new_invalid_timeout("SET_FROM_NOW", timeout_nanos, "> 0"));
            }
            TimeoutMode::SetFromStart if timeout_nanos < 0 => {
                return Err(Error::new_invalid_timeout(
                    "SET_FROM_START",
                    timeout_nanos,
                    ">= 0",
                ));
            }
            _ => (),
        }

        let mut inner = self.shared.inner.borrow_mut();
        match inner.state {
            State::TimedOut => return Ok(()),
            State::Init => {
                if mode != TimeoutMode::Extend || timeout_nanos != 0 {
                    inner
                        .pending
                        .push(PendingOp::Adjust(mode, timeout_nanos));
                }
                return Ok(());
            }
            State::Scheduled | State::Inactive => (),
        }
        if !inner.schedulable {
            return Ok(());
        }
        inner.debug_assert_in_event_loop();

        match mode {
            TimeoutMode::SetFromNow => {
                inner.cancel_timer();
                inner.timeout = inner.elapsed().saturating_add(timeout_nanos);
                self.arm(&mut inner);
            }
            TimeoutMode::SetFromStart if timeout_nanos == 0 => {
                inner.clear(false);
            }
            TimeoutMode::SetFromStart => {
                inner.cancel_timer();
                inner.timeout = timeout_nanos;
                self.arm(&mut inner);
            }
            TimeoutMode::Extend => {
                if inner.state != State::Scheduled || timeout_nanos == 0 {
                    return Ok(());
                }
                inner.cancel_timer();
                inner.timeout = pending::extend(inner.timeout, timeout_nanos);
                self.arm(&mut inner);
            }
        }
        trace!("deadline adjusted ({:?}); timeout = {}ns", mode, inner.timeout);
        Ok(())
    }

    /// 取消等待中的定时器并进入 `Inactive`。
    ///
    /// `keep_pending` 为 `false` 时超时长度被重置为零，绑定之前登记的调整也一并丢弃；
    /// 为 `true` 时保留超时长度和之前的调整。
    ///
    /// 绑定之前调用时，清除和其他调整一样按顺序登记，绑定之后调度器处于 `Inactive`，
    /// 除非之后又有 `SET_FROM_NOW`/`SET_FROM_START` 重新设置了截止时间。
    pub fn clear_timeout(&self, keep_pending: bool) {
        let mut inner = self.shared.inner.borrow_mut();
        match inner.state {
            State::TimedOut => (),
            State::Init => {
                inner.pending.push(PendingOp::Clear { keep: keep_pending });
            }
            State::Scheduled | State::Inactive => {
                if !inner.schedulable {
                    return;
                }
                inner.debug_assert_in_event_loop();
                inner.clear(keep_pending);
                trace!("deadline cleared");
            }
        }
    }

    /// 立即触发超时，不再等待定时器。
    ///
    /// 第一次生效时返回 `true`；已经超时（或已经登记过）时返回 `false`。
    /// 超时任务在整个生命周期内最多运行一次。
    ///
    /// 绑定之前调用时，触发被登记下来，在绑定并重放完调整之后执行。
    pub fn timeout_now(&self) -> bool {
        self.finish_now(Error::new_timeout())
    }

    /// 以给定的原因立即结束。
    ///
    /// 与 [`timeout_now`](Self::timeout_now) 相同，但超时任务收到的是 `cause`。
    /// 如果 `cause` 不是超时（[`Error::is_timeout`] 为 `false`），
    /// 两个完成信号都以取消结束。
    pub fn finish_now(&self, cause: Error) -> bool {
        {
            let mut inner = self.shared.inner.borrow_mut();
            match inner.state {
                State::TimedOut => return false,
                State::Init => {
                    if inner.pending_finish.is_some() {
                        return false;
                    }
                    inner.pending_finish = Some(cause);
                    return true;
                }
                State::Scheduled | State::Inactive => (),
            }
            if !inner.schedulable {
                return false;
            }
            inner.debug_assert_in_event_loop();
        }
        self.invoke(cause)
    }

    /// 截止时间触发、超时任务运行之前完成的信号。
    ///
    /// 每次调用返回的都是同一个信号的克隆。
    pub fn when_timing_out(&self) -> TimeoutSignal {
        self.shared.timing_out.clone()
    }

    /// 超时任务运行结束之后完成的信号。
    pub fn when_timed_out(&self) -> TimeoutSignal {
        self.shared.timed_out.clone()
    }

    /// 当前状态。
    pub fn state(&self) -> State {
        self.shared.inner.borrow().state
    }

    /// 当前的超时长度（相对开始时刻的纳秒数），`0` 表示禁用。
    ///
    /// 绑定之前返回把已登记的调整依次应用之后的结果。
    pub fn timeout_nanos(&self) -> i64 {
        let inner = self.shared.inner.borrow();
        if inner.state == State::Init {
            inner.pending.fold(inner.timeout).timeout
        } else {
            inner.timeout
        }
    }

    /// 开始时刻，即绑定的时刻。绑定之前为 `None`。
    pub fn start_time(&self) -> Option<Instant> {
        self.shared.inner.borrow().start
    }

    /// 距离截止时间还剩多久。只有 `Scheduled` 状态才有值。
    pub fn remaining(&self) -> Option<Duration> {
        let inner = self.shared.inner.borrow();
        if inner.state != State::Scheduled {
            return None;
        }
        Some(time::delay(inner.timeout.saturating_sub(inner.elapsed())))
    }

    /// 是否已经进入 `TimedOut`。
    pub fn is_finished(&self) -> bool {
        self.state() == State::TimedOut
    }

    /// 是否已经绑定。
    pub fn is_bound(&self) -> bool {
        self.state() != State::Init
    }

    /// 结束的原因。超时任务运行完毕之后才有值。
    ///
    /// 返回的错误只保留分类，不包含原因链。
    pub fn cause(&self) -> Option<Error> {
        self.shared
            .inner
            .borrow()
            .cause
            .as_ref()
            .map(Error::shallow_clone)
    }

    /// 按当前的 `timeout` 装载定时器并进入 `Scheduled`。
    ///
    /// 截止时间已经过去时使用零延迟，任务在下一个 tick 触发。
    fn arm(&self, inner: &mut Inner) {
        let event_loop = match inner.event_loop {
            Some(ref event_loop) => event_loop.clone(),
            None => return,
        };
        let remaining = inner.timeout.saturating_sub(inner.elapsed());

        inner.generation = inner.generation.wrapping_add(1);
        let generation = inner.generation;
        let shared = Rc::downgrade(&self.shared);
        let timer = event_loop.schedule(
            Box::new(move || on_timer(shared, generation)),
            time::delay(remaining),
        );
        inner.timer = Some(timer);
        inner.state = State::Scheduled;
    }

    /// 进入终态并运行超时任务。不能在持有 `inner` 借用时调用。
    fn invoke(&self, cause: Error) -> bool {
        let task = {
            let mut inner = self.shared.inner.borrow_mut();
            if inner.state == State::TimedOut {
                return false;
            }
            inner.state = State::TimedOut;
            inner.cancel_timer();
            inner.task.clone()
        };

        let is_timeout = cause.is_timeout();
        debug!("deadline finished; timeout = {}", is_timeout);
        if is_timeout {
            self.shared.timing_out.complete();
        } else {
            self.shared.timing_out.cancel();
        }

        // 任务可能重入调度器，此时 `inner` 不能处于借用状态。
        if let Some(task) = task {
            task.run(&cause);
        }

        self.shared.inner.borrow_mut().cause = Some(cause);
        if is_timeout {
            self.shared.timed_out.complete();
        } else {
            self.shared.timed_out.cancel();
        }
        true
    }
}

fn on_timer(shared: Weak<Shared>, generation: u64) {
    let shared = match shared.upgrade() {
        Some(shared) => shared,
        None => return,
    };
    {
        let mut inner = shared.inner.borrow_mut();
        if inner.state != State::Scheduled || inner.generation != generation {
            return;
        }
        // 定时器已经在运行，句柄不再需要取消。
        inner.timer = None;
    }
    trace!("deadline timer fired");
    DeadlineScheduler { shared }.invoke(Error::new_timeout());
}

impl Inner {
    fn elapsed(&self) -> i64 {
        match (self.event_loop.as_ref(), self.start) {
            (Some(event_loop), Some(start)) => time::elapsed_nanos(event_loop.now(), start),
            _ => 0,
        }
    }

    fn cancel_timer(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.cancel();
        }
    }

    fn clear(&mut self, keep_pending: bool) {
        self.cancel_timer();
        self.state = State::Inactive;
        if !keep_pending {
            self.timeout = 0;
        }
    }

    fn debug_assert_in_event_loop(&self) {
        debug_assert!(
            self.event_loop
                .as_ref()
                .map_or(true, |event_loop| event_loop.in_event_loop()),
            "DeadlineScheduler used outside of its event loop"
        );
    }
}

impl Drop for Shared {
    fn drop(&mut self) {
        self.inner.get_mut().cancel_timer();
    }
}

impl fmt::Debug for DeadlineScheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.shared.inner.borrow();
        f.debug_struct("DeadlineScheduler")
            .field("state", &inner.state)
            .field("timeout_nanos", &inner.timeout)
            .field("start", &inner.start)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    use crate::mock::MockEventLoop;

    const MS: i64 = 1_000_000;

    #[derive(Default)]
    struct CountingTask {
        disabled: bool,
        runs: Cell<usize>,
        last_timeout: Cell<Option<bool>>,
    }

    impl TimeoutTask for CountingTask {
        fn can_schedule(&self) -> bool {
            !self.disabled
        }

        fn run(&self, cause: &Error) {
            self.runs.set(self.runs.get() + 1);
            self.last_timeout.set(Some(cause.is_timeout()));
        }
    }

    fn ms(n: u64) -> Duration {
        Duration::from_millis(n)
    }

    fn bound(timeout_nanos: i64) -> (Rc<MockEventLoop>, Rc<CountingTask>, DeadlineScheduler) {
        let event_loop = MockEventLoop::new();
        let task = Rc::new(CountingTask::default());
        let scheduler = DeadlineScheduler::new(0);
        scheduler.bind(event_loop.clone(), task.clone(), timeout_nanos);
        (event_loop, task, scheduler)
    }

    #[test]
    fn fires_once_at_deadline() {
        let (event_loop, task, scheduler) = bound(1_000 * MS);
        assert_eq!(scheduler.state(), State::Scheduled);

        event_loop.advance(ms(999));
        assert_eq!(task.runs.get(), 0);

        event_loop.advance(ms(1));
        assert_eq!(task.runs.get(), 1);
        assert_eq!(task.last_timeout.get(), Some(true));
        assert!(scheduler.is_finished());
        assert!(scheduler.cause().unwrap().is_timeout());

        event_loop.advance(ms(5_000));
        assert_eq!(task.runs.get(), 1);
    }

    #[test]
    fn zero_timeout_binds_inactive() {
        let (event_loop, task, scheduler) = bound(0);
        assert_eq!(scheduler.state(), State::Inactive);
        assert_eq!(event_loop.pending_timers(), 0);

        event_loop.advance(ms(10_000));
        assert_eq!(task.runs.get(), 0);
    }

    #[test]
    fn pending_adjustments_replay_in_order() {
        let event_loop = MockEventLoop::new();
        let task = Rc::new(CountingTask::default());
        let scheduler = DeadlineScheduler::new(0);

        scheduler.set_timeout_nanos(TimeoutMode::Extend, 1_000 * MS).unwrap();
        scheduler.set_timeout_nanos(TimeoutMode::SetFromNow, 1_000 * MS).unwrap();
        scheduler.set_timeout_nanos(TimeoutMode::Extend, 500 * MS).unwrap();
        assert_eq!(scheduler.state(), State::Init);
        assert_eq!(scheduler.timeout_nanos(), 1_500 * MS);

        // 绑定前流逝的时间不计入
        event_loop.advance(ms(300));
        scheduler.bind(event_loop.clone(), task.clone(), 0);
        assert_eq!(scheduler.timeout_nanos(), 1_500 * MS);

        event_loop.advance(ms(1_499));
        assert_eq!(task.runs.get(), 0);
        event_loop.advance(ms(1));
        assert_eq!(task.runs.get(), 1);
    }

    #[test]
    fn initial_timeout_overrides_constructor_value() {
        let event_loop = MockEventLoop::new();
        let task = Rc::new(CountingTask::default());
        let scheduler = DeadlineScheduler::new(5_000 * MS);
        scheduler.set_timeout_nanos(TimeoutMode::Extend, 100 * MS).unwrap();
        assert_eq!(scheduler.timeout_nanos(), 5_100 * MS);

        scheduler.bind(event_loop.clone(), task, 200 * MS);
        assert_eq!(scheduler.timeout_nanos(), 300 * MS);
    }

    #[test]
    fn set_from_now_then_extend() {
        let (event_loop, _task, scheduler) = bound(1_000 * MS);
        event_loop.advance(ms(200));

        scheduler.set_timeout_nanos(TimeoutMode::SetFromNow, 1_000 * MS).unwrap();
        scheduler.set_timeout_nanos(TimeoutMode::Extend, 500 * MS).unwrap();

        assert_eq!(scheduler.timeout_nanos(), 1_700 * MS);
        assert_eq!(scheduler.remaining(), Some(ms(1_500)));
        assert_eq!(event_loop.pending_timers(), 1);
    }

    #[test]
    fn extend_can_shrink() {
        let (event_loop, task, scheduler) = bound(1_000 * MS);
        scheduler.set_timeout_nanos(TimeoutMode::Extend, -600 * MS).unwrap();
        assert_eq!(scheduler.timeout_nanos(), 400 * MS);

        event_loop.advance(ms(400));
        assert_eq!(task.runs.get(), 1);
    }

    #[test]
    fn extend_inactive_is_noop() {
        let (event_loop, task, scheduler) = bound(0);
        scheduler.set_timeout_nanos(TimeoutMode::Extend, 1_000 * MS).unwrap();
        assert_eq!(scheduler.timeout_nanos(), 0);
        assert_eq!(scheduler.state(), State::Inactive);

        let (_, _, cleared) = bound(1_000 * MS);
        cleared.clear_timeout(false);
        cleared.set_timeout_nanos(TimeoutMode::Extend, 1_000 * MS).unwrap();
        assert_eq!(cleared.timeout_nanos(), 0);

        event_loop.advance(ms(5_000));
        assert_eq!(task.runs.get(), 0);
    }

    #[test]
    fn set_from_start_in_the_past_fires_next_tick() {
        let (event_loop, task, scheduler) = bound(10_000 * MS);
        event_loop.advance(ms(500));

        scheduler.set_timeout_nanos(TimeoutMode::SetFromStart, 100 * MS).unwrap();
        assert_eq!(scheduler.state(), State::Scheduled);
        assert_eq!(task.runs.get(), 0);

        event_loop.tick();
        assert_eq!(task.runs.get(), 1);
    }

    #[test]
    fn set_from_start_zero_disables() {
        let (event_loop, task, scheduler) = bound(1_000 * MS);
        scheduler.set_timeout_nanos(TimeoutMode::SetFromStart, 0).unwrap();
        assert_eq!(scheduler.state(), State::Inactive);
        assert_eq!(scheduler.timeout_nanos(), 0);

        event_loop.advance(ms(2_000));
        assert_eq!(task.runs.get(), 0);
    }

    #[test]
    fn rejects_invalid_values() {
        let scheduler = DeadlineScheduler::new(0);
        let err = scheduler
            .set_timeout_nanos(TimeoutMode::SetFromNow, 0)
            .unwrap_err();
        assert!(err.is_invalid_argument());
        assert!(scheduler
            .set_timeout_nanos(TimeoutMode::SetFromNow, -1)
            .unwrap_err()
            .is_invalid_argument());
        assert!(scheduler
            .set_timeout_nanos(TimeoutMode::SetFromStart, -1)
            .unwrap_err()
            .is_invalid_argument());
        assert!(scheduler.set_timeout_nanos(TimeoutMode::SetFromStart, 0).is_ok());
        assert!(scheduler.set_timeout_nanos(TimeoutMode::Extend, -1).is_ok());
    }

    #[test]
    fn timeout_now_runs_task_once() {
        let (event_loop, task, scheduler) = bound(1_000 * MS);
        assert!(scheduler.timeout_now());
        assert!(!scheduler.timeout_now());
        assert_eq!(task.runs.get(), 1);
        assert_eq!(event_loop.pending_timers(), 0);

        event_loop.advance(ms(2_000));
        assert_eq!(task.runs.get(), 1);
    }

    #[test]
    fn timeout_now_on_inactive_scheduler() {
        let (_, task, scheduler) = bound(0);
        assert!(scheduler.timeout_now());
        assert_eq!(task.runs.get(), 1);
        assert!(scheduler.when_timed_out().is_completed());
    }

    #[test]
    fn timeout_now_before_bind_fires_at_bind() {
        let event_loop = MockEventLoop::new();
        let task = Rc::new(CountingTask::default());
        let scheduler = DeadlineScheduler::new(0);

        assert!(scheduler.timeout_now());
        assert!(!scheduler.timeout_now());
        assert_eq!(task.runs.get(), 0);

        scheduler.bind(event_loop, task.clone(), 1_000 * MS);
        assert_eq!(task.runs.get(), 1);
        assert!(scheduler.is_finished());
    }

    #[test]
    fn mutators_after_timeout_are_noops() {
        let (event_loop, _task, scheduler) = bound(100 * MS);
        event_loop.advance(ms(100));
        assert!(scheduler.is_finished());

        scheduler.set_timeout_nanos(TimeoutMode::SetFromNow, 1_000 * MS).unwrap();
        scheduler.set_timeout_nanos(TimeoutMode::Extend, 1_000 * MS).unwrap();
        scheduler.clear_timeout(false);
        assert_eq!(scheduler.state(), State::TimedOut);
        assert_eq!(event_loop.pending_timers(), 0);
    }

    #[test]
    fn clear_timeout_keep_pending_round_trip() {
        let event_loop = MockEventLoop::new();

        let kept_task = Rc::new(CountingTask::default());
        let kept = DeadlineScheduler::new(0);
        kept.set_timeout_nanos(TimeoutMode::SetFromNow, 300 * MS).unwrap();
        kept.clear_timeout(true);
        assert_eq!(kept.timeout_nanos(), 300 * MS);
        kept.bind(event_loop.clone(), kept_task.clone(), 0);
        assert_eq!(kept.state(), State::Inactive);
        assert_eq!(kept.timeout_nanos(), 300 * MS);
        assert_eq!(event_loop.pending_timers(), 0);

        event_loop.advance(ms(1_000));
        assert_eq!(kept_task.runs.get(), 0);

        // 清除之后仍然可以重新设置
        kept.set_timeout_nanos(TimeoutMode::SetFromNow, 50 * MS).unwrap();
        event_loop.advance(ms(50));
        assert_eq!(kept_task.runs.get(), 1);

        let discarded = DeadlineScheduler::new(0);
        discarded.set_timeout_nanos(TimeoutMode::SetFromNow, 300 * MS).unwrap();
        discarded.clear_timeout(false);
        discarded.bind(event_loop, Rc::new(CountingTask::default()), 1_000 * MS);
        assert_eq!(discarded.state(), State::Inactive);
        assert_eq!(discarded.timeout_nanos(), 0);
    }

    #[test]
    fn set_after_pending_clear_rearms() {
        let event_loop = MockEventLoop::new();
        let task = Rc::new(CountingTask::default());
        let scheduler = DeadlineScheduler::new(1_000 * MS);
        scheduler.clear_timeout(true);
        scheduler.set_timeout_nanos(TimeoutMode::Extend, 500 * MS).unwrap();
        scheduler.set_timeout_nanos(TimeoutMode::SetFromStart, 200 * MS).unwrap();

        scheduler.bind(event_loop.clone(), task.clone(), 0);
        assert_eq!(scheduler.state(), State::Scheduled);
        assert_eq!(scheduler.timeout_nanos(), 200 * MS);

        event_loop.advance(ms(200));
        assert_eq!(task.runs.get(), 1);
    }

    #[test]
    fn clear_timeout_after_bind() {
        let (event_loop, task, scheduler) = bound(1_000 * MS);
        scheduler.clear_timeout(true);
        assert_eq!(scheduler.state(), State::Inactive);
        assert_eq!(scheduler.timeout_nanos(), 1_000 * MS);
        assert_eq!(event_loop.pending_timers(), 0);

        // 重新装载
        scheduler.set_timeout_nanos(TimeoutMode::SetFromNow, 50 * MS).unwrap();
        event_loop.advance(ms(50));
        assert_eq!(task.runs.get(), 1);
    }

    #[test]
    fn cannot_schedule_makes_everything_noop() {
        let event_loop = MockEventLoop::new();
        let task = Rc::new(CountingTask {
            disabled: true,
            ..CountingTask::default()
        });
        let scheduler = DeadlineScheduler::new(0);
        scheduler.bind(event_loop.clone(), task.clone(), 1_000 * MS);

        assert_eq!(scheduler.state(), State::Inactive);
        scheduler.set_timeout_nanos(TimeoutMode::SetFromNow, 10 * MS).unwrap();
        assert!(!scheduler.timeout_now());
        assert_eq!(event_loop.pending_timers(), 0);
        assert_eq!(task.runs.get(), 0);
    }

    #[test]
    fn bind_twice_is_noop() {
        let (event_loop, task, scheduler) = bound(1_000 * MS);
        let start = scheduler.start_time();
        event_loop.advance(ms(100));

        scheduler.bind(event_loop.clone(), task, 10 * MS);
        assert_eq!(scheduler.start_time(), start);
        assert_eq!(scheduler.timeout_nanos(), 1_000 * MS);
        assert_eq!(event_loop.pending_timers(), 1);
    }

    struct QueryingTask {
        scheduler: RefCell<Option<DeadlineScheduler>>,
        seen: Cell<Option<State>>,
    }

    impl TimeoutTask for QueryingTask {
        fn can_schedule(&self) -> bool {
            if let Some(scheduler) = self.scheduler.borrow().as_ref() {
                self.seen.set(Some(scheduler.state()));
            }
            true
        }

        fn run(&self, _cause: &Error) {}
    }

    #[test]
    fn can_schedule_may_query_scheduler() {
        let event_loop = MockEventLoop::new();
        let scheduler = DeadlineScheduler::new(0);
        let task = Rc::new(QueryingTask {
            scheduler: RefCell::new(Some(scheduler.clone())),
            seen: Cell::new(None),
        });

        scheduler.bind(event_loop.clone(), task.clone(), 10 * MS);
        assert_eq!(task.seen.get(), Some(State::Init));
        assert_eq!(scheduler.state(), State::Scheduled);

        task.scheduler.borrow_mut().take();
    }

    #[cfg(debug_assertions)]
    #[test]
    #[should_panic(expected = "outside of its event loop")]
    fn bind_off_the_event_loop_panics() {
        let event_loop = MockEventLoop::new();
        event_loop.set_off_thread(true);
        let scheduler = DeadlineScheduler::new(0);
        scheduler.bind(event_loop, Rc::new(CountingTask::default()), 10 * MS);
    }

    #[cfg(debug_assertions)]
    #[test]
    #[should_panic(expected = "outside of its event loop")]
    fn adjusting_off_the_event_loop_panics() {
        let (event_loop, _task, scheduler) = bound(1_000 * MS);
        event_loop.set_off_thread(true);
        let _ = scheduler.set_timeout_nanos(TimeoutMode::SetFromNow, 10 * MS);
    }

    struct ObservingTask {
        timing_out: TimeoutSignal,
        timed_out: TimeoutSignal,
        seen: Cell<Option<(bool, bool)>>,
    }

    impl TimeoutTask for ObservingTask {
        fn can_schedule(&self) -> bool {
            true
        }

        fn run(&self, _cause: &Error) {
            self.seen
                .set(Some((self.timing_out.is_done(), self.timed_out.is_done())));
        }
    }

    #[test]
    fn task_sees_timing_out_but_not_timed_out() {
        let event_loop = MockEventLoop::new();
        let scheduler = DeadlineScheduler::new(0);
        let task = Rc::new(ObservingTask {
            timing_out: scheduler.when_timing_out(),
            timed_out: scheduler.when_timed_out(),
            seen: Cell::new(None),
        });
        assert!(TimeoutSignal::ptr_eq(
            &scheduler.when_timing_out(),
            &scheduler.when_timing_out()
        ));

        scheduler.bind(event_loop.clone(), task.clone(), 10 * MS);
        event_loop.advance(ms(10));

        assert_eq!(task.seen.get(), Some((true, false)));
        assert!(scheduler.when_timing_out().is_completed());
        assert!(scheduler.when_timed_out().is_completed());
    }

    #[test]
    fn finish_with_cancel_cause_cancels_signals() {
        let (_, task, scheduler) = bound(1_000 * MS);
        assert!(scheduler.finish_now(Error::canceled_with("response complete")));

        assert_eq!(task.last_timeout.get(), Some(false));
        assert!(scheduler.when_timing_out().is_canceled());
        assert!(scheduler.when_timed_out().is_canceled());
        assert!(scheduler.cause().unwrap().is_canceled());
    }

    struct ReentrantTask {
        scheduler: RefCell<Option<DeadlineScheduler>>,
        result: Cell<Option<bool>>,
    }

    impl TimeoutTask for ReentrantTask {
        fn can_schedule(&self) -> bool {
            true
        }

        fn run(&self, _cause: &Error) {
            if let Some(scheduler) = self.scheduler.borrow().as_ref() {
                scheduler
                    .set_timeout_nanos(TimeoutMode::SetFromNow, 1_000 * MS)
                    .unwrap();
                self.result.set(Some(scheduler.timeout_now()));
            }
        }
    }

    #[test]
    fn task_may_reenter_scheduler() {
        let event_loop = MockEventLoop::new();
        let scheduler = DeadlineScheduler::new(0);
        let task = Rc::new(ReentrantTask {
            scheduler: RefCell::new(Some(scheduler.clone())),
            result: Cell::new(None),
        });
        scheduler.bind(event_loop.clone(), task.clone(), 10 * MS);

        event_loop.advance(ms(10));
        assert_eq!(task.result.get(), Some(false));
        assert_eq!(event_loop.pending_timers(), 0);

        // 打破引用环
        task.scheduler.borrow_mut().take();
    }

    #[test]
    fn dropping_scheduler_cancels_timer() {
        let (event_loop, task, scheduler) = bound(1_000 * MS);
        drop(scheduler);
        assert_eq!(event_loop.pending_timers(), 0);

        event_loop.advance(ms(2_000));
        assert_eq!(task.runs.get(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn local_event_loop_completes_signals() {
        let local = tokio::task::LocalSet::new();
        local
            .run_until(async {
                let scheduler = DeadlineScheduler::new(0);
                let task = Rc::new(CountingTask::default());
                scheduler.bind(
                    Rc::new(crate::rt::LocalEventLoop::new()),
                    task.clone(),
                    250 * MS,
                );

                let start = tokio::time::Instant::now();
                scheduler.when_timed_out().await.unwrap();
                assert!(start.elapsed() >= ms(250));
                assert_eq!(task.runs.get(), 1);
            })
            .await;
    }
}
