//! 连接保活状态机
//!
//! [`KeepAlive`] 把连接的四个策略合并为一个"是否需要断开"的决定：
//!
//! - **空闲超时**：一段时间内既没有读也没有写、且没有正在处理的请求时关闭连接；
//! - **PING**：一段时间内没有 PING 活动时发送 PING，并在确认超时后关闭连接；
//! - **最长存活时间**：到期后无论是否有流量都进入 `Shutdown`，
//!   空闲的客户端连接会被直接关闭（见 [`Role`]）；
//! - **最大请求数**：处理的请求数达到上限后需要断开。
//!
//! # PING 状态
//!
//! ```text
//!            ping 定时器到期           写入完成            收到 ACK
//!   Idle ─────────────────▶ PingScheduled ───────▶ PendingPingAck ───────▶ Idle
//!     │                          │                       │
//!     │ 空闲超时                  │ 写入失败               │ ACK 超时
//!     ▼                          ▼                       ▼
//!   Shutdown ◀──────────────────────────────────────────────
//! ```
//!
//! 最长存活时间到期会从任意状态进入 `Shutdown`。`Shutdown` 是终态，
//! 只有在这个状态下才会通知连接关闭。
//!
//! # 定时器
//!
//! 空闲定时器和 PING 定时器不会在每次读写时重新装载。读写只更新最后一次活动的时间，
//! 定时器到期时再根据这个时间计算剩余的等待时间，不足则按剩余时间重新装载。
//! 因此定时器只可能晚于截止时间触发，不会提前。

mod config;

pub use self::config::{Config, Role};

use std::cell::RefCell;
use std::error::Error as StdError;
use std::fmt;
use std::rc::{Rc, Weak};
use std::time::{Duration, Instant};

use crate::common::time;
use crate::error::{Error, Result};
use crate::lifecycle::{ConnectionLifecycleRecorder, NoopRecorder};
use crate::rt::{EventLoop, TimerHandle};

/// PING 周期所处的状态。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PingState {
    /// 没有未完成的 PING。
    Idle,
    /// PING 正在写入，尚未完成。
    PingScheduled,
    /// PING 已经写出，等待确认。
    PendingPingAck,
    /// 连接需要关闭。终态。
    Shutdown,
}

/// 由连接的拥有者实现，供 [`KeepAlive`] 查询连接并对其执行操作。
///
/// 所有方法都在事件循环线程上调用，调用时 `KeepAlive` 不持有任何内部借用，
/// 因此实现中可以再调用 `KeepAlive` 的方法。
pub trait KeepAliveConnection {
    /// 现在关闭连接是否会中断正在处理的请求。
    fn has_requests_in_progress(&self) -> bool;

    /// 普通的读写是否取消正在进行的 PING 周期。
    fn ping_resets_previous_ping(&self) -> bool;

    /// 写出一个 PING 帧。
    ///
    /// 写入结束后必须通过 `completion` 报告结果；直接丢弃 `completion`
    /// 视为写入失败。
    fn write_ping(&self, completion: PingWriteCompletion);

    /// 关闭连接。
    fn close(&self);

    /// 连接是否仍然打开。
    ///
    /// 返回 `false` 之后所有定时任务都不再起作用。
    fn is_open(&self) -> bool {
        true
    }
}

/// 一次 PING 写入的完成通知。
///
/// 如果在 PING 写入完成之前连接上又发生了重置 PING 的读写，
/// 这个通知会被忽略。
pub struct PingWriteCompletion {
    callback: Option<Box<dyn FnOnce(Result<()>)>>,
}

impl PingWriteCompletion {
    fn new(callback: Box<dyn FnOnce(Result<()>)>) -> PingWriteCompletion {
        PingWriteCompletion {
            callback: Some(callback),
        }
    }

    /// PING 已经写出。
    pub fn succeeded(mut self) {
        self.finish(Ok(()));
    }

    /// PING 写入失败，连接将被关闭。不会重试。
    pub fn failed<E>(mut self, cause: E)
    where
        E: Into<Box<dyn StdError + Send + Sync>>,
    {
        self.finish(Err(Error::new_ping_write(Some(cause.into()))));
    }

    fn finish(&mut self, result: Result<()>) {
        if let Some(callback) = self.callback.take() {
            callback(result);
        }
    }
}

impl Drop for PingWriteCompletion {
    fn drop(&mut self) {
        self.finish(Err(Error::new_ping_write(None)));
    }
}

impl fmt::Debug for PingWriteCompletion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PingWriteCompletion")
            .field("done", &self.callback.is_none())
            .finish()
    }
}

/// 一个连接的保活状态。
///
/// 连接被接受时创建，调用 [`initialize`](KeepAlive::initialize) 开始计时，
/// 连接关闭时调用 [`destroy`](KeepAlive::destroy)。
/// 所有方法都必须在 `event_loop` 的线程上调用。
pub struct KeepAlive<C> {
    shared: Rc<Shared<C>>,
}

struct Shared<C> {
    inner: RefCell<Inner<C>>,
    event_loop: Rc<dyn EventLoop>,
    recorder: Rc<dyn ConnectionLifecycleRecorder>,
    policy: Policy,
}

/// 以纳秒表示的策略，`0` 表示禁用。
struct Policy {
    idle: i64,
    ping: i64,
    ping_ack: i64,
    max_age: i64,
    max_requests: u64,
    keep_alive_on_ping: bool,
    client: bool,
}

struct Inner<C> {
    conn: Option<Rc<C>>,
    state: PingState,
    initialized: bool,
    destroyed: bool,
    connection_start: Option<Instant>,
    last_activity: Instant,
    last_ping_activity: Instant,
    // 自上一次 PING 活动以来还没有发送过 PING。
    first_ping_idle: bool,
    max_age_exceeded: bool,
    requests: u64,
    idle_timer: Option<TimerHandle>,
    ping_timer: Option<TimerHandle>,
    age_timer: Option<TimerHandle>,
    ack_timer: Option<TimerHandle>,
    // 标识当前的 PING 周期，过期的写入通知和 ACK 定时器据此被忽略。
    ping_cycle: u64,
    cause: Option<Error>,
}

impl<C> KeepAlive<C>
where
    C: KeepAliveConnection + 'static,
{
    /// 使用给定配置创建保活状态，不记录连接生命周期。
    pub fn new(config: Config, event_loop: Rc<dyn EventLoop>) -> KeepAlive<C> {
        KeepAlive::with_recorder(config, event_loop, Rc::new(NoopRecorder))
    }

    /// 使用给定配置创建保活状态，连接的打开与关闭会报告给 `recorder`。
    pub fn with_recorder(
        config: Config,
        event_loop: Rc<dyn EventLoop>,
        recorder: Rc<dyn ConnectionLifecycleRecorder>,
    ) -> KeepAlive<C> {
        let now = event_loop.now();
        let policy = Policy {
            idle: config.idle_nanos(),
            ping: config.ping_nanos(),
            ping_ack: config.ping_ack_nanos(),
            max_age: config.max_age_nanos(),
            max_requests: config.max_requests(),
            keep_alive_on_ping: config.is_keep_alive_on_ping(),
            client: config.is_client(),
        };
        KeepAlive {
            shared: Rc::new(Shared {
                inner: RefCell::new(Inner {
                    conn: None,
                    state: PingState::Idle,
                    initialized: false,
                    destroyed: false,
                    connection_start: None,
                    last_activity: now,
                    last_ping_activity: now,
                    first_ping_idle: true,
                    max_age_exceeded: false,
                    requests: 0,
                    idle_timer: None,
                    ping_timer: None,
                    age_timer: None,
                    ack_timer: None,
                    ping_cycle: 0,
                    cause: None,
                }),
                event_loop,
                recorder,
                policy,
            }),
        }
    }

    /// 开始计时：装载空闲定时器、PING 定时器和最长存活时间定时器（各自启用时）。
    ///
    /// 只有第一次调用生效。如果在此之前已经调用过 [`destroy`](Self::destroy)，
    /// 不会装载任何定时器。
    pub fn initialize(&self, conn: Rc<C>) {
        {
            let mut inner = self.shared.inner.borrow_mut();
            if inner.initialized {
                return;
            }
            self.debug_assert_in_event_loop();
            inner.initialized = true;

            let now = self.now();
            inner.connection_start = Some(now);
            inner.last_activity = now;
            inner.last_ping_activity = now;
            inner.conn = Some(conn);

            let policy = &self.shared.policy;
            if policy.idle > 0 {
                inner.idle_timer = Some(self.schedule(policy.idle, Self::on_idle_timer));
            }
            if policy.ping > 0 {
                inner.ping_timer = Some(self.schedule(policy.ping, Self::on_ping_timer));
            }
            if policy.max_age > 0 {
                inner.age_timer = Some(self.schedule(policy.max_age, Self::on_max_age_timer));
            }
        }
        debug!("keep-alive initialized");
        self.shared.recorder.connection_opened();
    }

    /// 连接上发生了读或写。
    ///
    /// 更新最后一次活动的时间。如果连接的
    /// [`ping_resets_previous_ping`](KeepAliveConnection::ping_resets_previous_ping)
    /// 返回 `true`，同时取消正在进行的 PING 周期并回到 `Idle`。
    pub fn on_read_or_write(&self) {
        let conn = {
            let mut inner = self.shared.inner.borrow_mut();
            if inner.state == PingState::Shutdown {
                return;
            }
            self.debug_assert_in_event_loop();
            if self.shared.policy.idle > 0 {
                inner.last_activity = self.now();
            }
            inner.conn.clone()
        };

        let resets = conn.map_or(false, |conn| conn.ping_resets_previous_ping());
        if !resets {
            return;
        }

        let mut inner = self.shared.inner.borrow_mut();
        if inner.state == PingState::Shutdown {
            return;
        }
        if self.shared.policy.ping > 0 {
            inner.last_ping_activity = self.now();
            inner.first_ping_idle = true;
        }
        inner.state = PingState::Idle;
        inner.cancel_ping_cycle();
    }

    /// 连接上发送或收到了 PING（包括对我们的 PING 的确认）。
    ///
    /// 结束正在进行的 PING 周期并回到 `Idle`。启用了
    /// [`keep_alive_on_ping`](Config::keep_alive_on_ping) 时，
    /// 还会像读写一样重置空闲计时。
    pub fn on_ping(&self) {
        let mut inner = self.shared.inner.borrow_mut();
        if inner.state == PingState::Shutdown {
            return;
        }
        self.debug_assert_in_event_loop();

        let now = self.now();
        let policy = &self.shared.policy;
        if policy.keep_alive_on_ping && policy.idle > 0 {
            inner.last_activity = now;
        }
        if policy.ping > 0 {
            inner.last_ping_activity = now;
            inner.first_ping_idle = true;
        }
        if inner.state != PingState::Idle {
            trace!("keep-alive ping cycle finished in state {:?}", inner.state);
        }
        inner.state = PingState::Idle;
        inner.cancel_ping_cycle();
    }

    /// 已处理的请求数加一。未设置最大请求数时什么也不做。
    pub fn increase_num_requests(&self) {
        if self.shared.policy.max_requests == 0 {
            return;
        }
        let mut inner = self.shared.inner.borrow_mut();
        inner.requests = inner.requests.saturating_add(1);
    }

    /// 连接是否需要断开。
    ///
    /// 进入 `Shutdown`、超过最长存活时间或处理的请求数达到上限时返回 `true`。
    pub fn needs_disconnection(&self) -> bool {
        let inner = self.shared.inner.borrow();
        if inner.state == PingState::Shutdown || inner.max_age_exceeded {
            return true;
        }

        let policy = &self.shared.policy;
        if policy.max_requests > 0 && inner.requests >= policy.max_requests {
            return true;
        }
        match inner.connection_start {
            Some(start) if policy.max_age > 0 => {
                time::elapsed_nanos(self.now(), start) >= policy.max_age
            }
            _ => false,
        }
    }

    /// 是否已经进入 `Shutdown`。
    pub fn is_closing(&self) -> bool {
        self.state() == PingState::Shutdown
    }

    /// 是否正在等待 PING 确认。
    pub fn is_pending_ping_ack(&self) -> bool {
        self.state() == PingState::PendingPingAck
    }

    /// 当前的 PING 状态。
    pub fn state(&self) -> PingState {
        self.shared.inner.borrow().state
    }

    /// 已计数的请求数。
    pub fn requests_served(&self) -> u64 {
        self.shared.inner.borrow().requests
    }

    /// 进入 `Shutdown` 的原因。
    ///
    /// 空闲超时对应 [`Error::is_timeout`]，PING 未被确认对应
    /// [`Error::is_keep_alive`]，PING 写入失败对应 [`Error::is_ping_write`]。
    /// 因最长存活时间或 [`destroy`](Self::destroy) 而结束时为 `None`。
    pub fn shutdown_cause(&self) -> Option<Error> {
        self.shared
            .inner
            .borrow()
            .cause
            .as_ref()
            .map(Error::shallow_clone)
    }

    /// 取消所有定时器并进入 `Shutdown`，不会调用
    /// [`close`](KeepAliveConnection::close)。
    ///
    /// 可以在任何状态下调用，包括 `initialize` 之前；重复调用没有效果。
    /// 如果已经初始化，连接的存活时长会被报告给记录器，且只报告一次。
    pub fn destroy(&self) {
        let lifespan = {
            let mut inner = self.shared.inner.borrow_mut();
            if inner.destroyed {
                return;
            }
            inner.destroyed = true;
            let was_initialized = inner.initialized;
            inner.initialized = true;
            inner.state = PingState::Shutdown;
            inner.max_age_exceeded = true;
            inner.cancel_timers();
            inner.conn = None;

            if was_initialized {
                let now = self.now();
                inner
                    .connection_start
                    .map(|start| now.saturating_duration_since(start))
            } else {
                None
            }
        };

        if let Some(lifespan) = lifespan {
            debug!("keep-alive destroyed after {:?}", lifespan);
            self.shared.recorder.connection_closed(lifespan);
        }
    }

    fn on_idle_timer(&self) {
        let idle = self.shared.policy.idle;
        let conn = {
            let mut inner = self.shared.inner.borrow_mut();
            inner.idle_timer = None;
            if inner.state == PingState::Shutdown {
                return;
            }
            let next = idle.saturating_sub(time::elapsed_nanos(self.now(), inner.last_activity));
            if next > 0 {
                // 期间有读写
                inner.idle_timer = Some(self.schedule(next, Self::on_idle_timer));
                return;
            }
            match inner.conn.clone() {
                Some(conn) => conn,
                None => return,
            }
        };

        if !conn.is_open() {
            return;
        }
        let busy = conn.has_requests_in_progress();

        {
            let mut inner = self.shared.inner.borrow_mut();
            if inner.state == PingState::Shutdown {
                return;
            }
            if busy {
                trace!("idle timeout reached with requests in progress");
                inner.idle_timer = Some(self.schedule(idle, Self::on_idle_timer));
                return;
            }
            inner.shutdown(Error::new_timeout());
        }
        debug!("closing idle connection");
        conn.close();
    }

    fn on_ping_timer(&self) {
        let ping = self.shared.policy.ping;
        let conn = {
            let mut inner = self.shared.inner.borrow_mut();
            inner.ping_timer = None;
            if inner.state == PingState::Shutdown {
                return;
            }
            let next =
                ping.saturating_sub(time::elapsed_nanos(self.now(), inner.last_ping_activity));
            if next > 0 {
                inner.ping_timer = Some(self.schedule(next, Self::on_ping_timer));
                return;
            }
            match inner.conn.clone() {
                Some(conn) => conn,
                None => return,
            }
        };

        if !conn.is_open() {
            return;
        }
        let busy = conn.has_requests_in_progress();

        let completion = {
            let mut inner = self.shared.inner.borrow_mut();
            if inner.state == PingState::Shutdown {
                return;
            }
            inner.ping_timer = Some(self.schedule(ping, Self::on_ping_timer));
            if busy {
                trace!("keep-alive ping skipped, requests in progress");
                return;
            }
            if !inner.first_ping_idle {
                return;
            }
            inner.first_ping_idle = false;
            inner.state = PingState::PingScheduled;
            inner.ping_cycle = inner.ping_cycle.wrapping_add(1);
            self.ping_completion(inner.ping_cycle)
        };
        trace!("keep-alive interval reached, writing ping");
        conn.write_ping(completion);
    }

    fn on_max_age_timer(&self) {
        let conn = {
            let mut inner = self.shared.inner.borrow_mut();
            inner.age_timer = None;
            if inner.state == PingState::Shutdown {
                return;
            }
            match inner.conn.clone() {
                Some(conn) => conn,
                None => return,
            }
        };

        if !conn.is_open() {
            return;
        }
        let busy = conn.has_requests_in_progress();

        {
            let mut inner = self.shared.inner.borrow_mut();
            inner.max_age_exceeded = true;
            if inner.state == PingState::Shutdown {
                return;
            }
            inner.state = PingState::Shutdown;
            inner.cancel_timers();
        }
        debug!(
            "max connection age ({}ns) exceeded",
            self.shared.policy.max_age
        );
        // 服务端由协议层结束连接；客户端有请求在处理时由拥有者在请求结束后关闭。
        if self.shared.policy.client && !busy {
            conn.close();
        }
    }

    fn on_ping_write(&self, cycle: u64, result: Result<()>) {
        let conn = {
            let mut inner = self.shared.inner.borrow_mut();
            if inner.ping_cycle != cycle || inner.state != PingState::PingScheduled {
                return;
            }
            match result {
                Ok(()) => {
                    trace!("keep-alive ping written");
                    inner.state = PingState::PendingPingAck;
                    let shared = Rc::downgrade(&self.shared);
                    let timer = self.shared.event_loop.schedule(
                        Box::new(move || {
                            if let Some(shared) = shared.upgrade() {
                                KeepAlive { shared }.on_ack_timeout(cycle);
                            }
                        }),
                        time::delay(self.shared.policy.ping_ack),
                    );
                    inner.ack_timer = Some(timer);
                    return;
                }
                Err(err) => {
                    debug!("keep-alive ping write failed: {}", err);
                    inner.shutdown(err);
                    inner.conn.clone()
                }
            }
        };
        if let Some(conn) = conn {
            conn.close();
        }
    }

    fn on_ack_timeout(&self, cycle: u64) {
        let conn = {
            let mut inner = self.shared.inner.borrow_mut();
            if inner.ping_cycle != cycle || inner.state != PingState::PendingPingAck {
                return;
            }
            inner.ack_timer = None;
            match inner.conn.clone() {
                Some(conn) => conn,
                None => return,
            }
        };

        if !conn.is_open() {
            return;
        }

        {
            let mut inner = self.shared.inner.borrow_mut();
            if inner.ping_cycle != cycle || inner.state != PingState::PendingPingAck {
                return;
            }
            inner.shutdown(Error::new_keep_alive_timed_out());
        }
        debug!("keep-alive ping was not acknowledged, closing connection");
        conn.close();
    }

    fn ping_completion(&self, cycle: u64) -> PingWriteCompletion {
        let shared = Rc::downgrade(&self.shared);
        PingWriteCompletion::new(Box::new(move |result| {
            if let Some(shared) = shared.upgrade() {
                KeepAlive { shared }.on_ping_write(cycle, result);
            }
        }))
    }

    fn schedule(&self, nanos: i64, on_fire: fn(&KeepAlive<C>)) -> TimerHandle {
        let shared: Weak<Shared<C>> = Rc::downgrade(&self.shared);
        self.shared.event_loop.schedule(
            Box::new(move || {
                if let Some(shared) = shared.upgrade() {
                    on_fire(&KeepAlive { shared });
                }
            }),
            time::delay(nanos),
        )
    }

    fn now(&self) -> Instant {
        self.shared.event_loop.now()
    }

    fn debug_assert_in_event_loop(&self) {
        debug_assert!(
            self.shared.event_loop.in_event_loop(),
            "KeepAlive used outside of its event loop"
        );
    }
}

impl<C> Inner<C> {
    fn cancel_ping_cycle(&mut self) {
        if let Some(timer) = self.ack_timer.take() {
            timer.cancel();
        }
        self.ping_cycle = self.ping_cycle.wrapping_add(1);
    }

    fn cancel_timers(&mut self) {
        let timers = [
            self.idle_timer.take(),
            self.ping_timer.take(),
            self.age_timer.take(),
        ];
        for timer in timers.into_iter().flatten() {
            timer.cancel();
        }
        self.cancel_ping_cycle();
    }

    fn shutdown(&mut self, cause: Error) {
        self.state = PingState::Shutdown;
        self.cancel_timers();
        self.cause = Some(cause);
    }
}

impl<C> Clone for KeepAlive<C> {
    fn clone(&self) -> KeepAlive<C> {
        KeepAlive {
            shared: self.shared.clone(),
        }
    }
}

impl<C> Drop for Shared<C> {
    fn drop(&mut self) {
        self.inner.get_mut().cancel_timers();
    }
}

impl<C> fmt::Debug for KeepAlive<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.shared.inner.borrow();
        f.debug_struct("KeepAlive")
            .field("state", &inner.state)
            .field("initialized", &inner.initialized)
            .field("requests", &inner.requests)
            .field(
                "idle_timeout",
                &Duration::from_nanos(self.shared.policy.idle as u64),
            )
            .finish()
    }
}
