//! lifeline 错误与结果类型模块
//!
//! 本模块定义了 lifeline 的核心错误类型 [`Error`]。截止时间调度器与 keep-alive
//! 状态机中所有可观察的失败都被统一封装在 `Error` 类型中，
//! 包括非法的超时参数、截止时间到期、主动取消以及 PING 相关的失败。
//!
//! 用户代码通过 `Error` 上的各种 `is_*` 方法来判断错误类别，内部的 `Kind`
//! 枚举不对外暴露。
//!
//! 注意：状态机本身从不跨越事件循环边界抛出错误。唯一同步返回给调用者的错误是
//! 参数校验失败（见 [`Error::is_invalid_argument`]）；其余错误只作为
//! [`TimeoutTask::run`](crate::deadline::TimeoutTask::run) 的 `cause` 参数、
//! 或者作为完成信号的结果出现。

use std::error::Error as StdError;
use std::fmt;

/// lifeline 方法常用的 Result 类型别名。
pub type Result<T> = std::result::Result<T, Error>;

/// 类型擦除的错误原因。
type Cause = Box<dyn StdError + Send + Sync>;

/// 表示截止时间调度或连接保活过程中可能发生的错误。
///
/// # 格式化
///
/// `Display` 实现只会打印当前层级的错误详情，不包含 source 链。
/// 此类型的错误消息措辞是未指定的，**你不能依赖它**。
///
/// # Source
///
/// `Error` 可能由另一个错误引起，可以通过 `Error::source()` 获取，
/// 但不能依赖 source 的具体类型。
pub struct Error {
    // Box 使 Error 在栈上只占一个指针宽度。
    inner: Box<ErrorImpl>,
}

struct ErrorImpl {
    kind: Kind,
    cause: Option<Cause>,
}

/// 错误分类枚举。
#[derive(Debug)]
pub(super) enum Kind {
    /// 截止时间到期（或被强制触发）。
    Timeout,
    /// 操作被取消，并非因为超时。
    Canceled,
    /// keep-alive PING 在 ACK 超时时间内没有得到响应。
    KeepAlive,
    /// PING 帧写入失败。
    PingWrite,
    /// 调用者的错误用法。
    User(User),
}

#[derive(Debug)]
pub(super) enum User {
    /// `SET_FROM_NOW` 收到非正数，或 `SET_FROM_START` 收到负数。
    InvalidTimeout,
}

// Sentinel type to indicate the error was caused by a timeout.
#[derive(Debug)]
pub(super) struct TimedOut;

impl Error {
    /// 如果错误由超时引起，返回 `true`。
    ///
    /// 包括截止时间到期以及 PING ACK 超时。
    pub fn is_timeout(&self) -> bool {
        self.find_source::<TimedOut>().is_some()
    }

    /// 如果这是一次主动取消（而不是超时），返回 `true`。
    pub fn is_canceled(&self) -> bool {
        matches!(self.inner.kind, Kind::Canceled)
    }

    /// 如果调用者传入了不被接受的参数，返回 `true`。
    pub fn is_invalid_argument(&self) -> bool {
        matches!(self.inner.kind, Kind::User(User::InvalidTimeout))
    }

    /// 如果连接因 keep-alive PING 未被确认而判定为不健康，返回 `true`。
    pub fn is_keep_alive(&self) -> bool {
        matches!(self.inner.kind, Kind::KeepAlive)
    }

    /// 如果 PING 帧写入失败，返回 `true`。
    pub fn is_ping_write(&self) -> bool {
        matches!(self.inner.kind, Kind::PingWrite)
    }

    /// 创建一个表示"主动取消"的错误，不带原因。
    ///
    /// 传给 [`DeadlineScheduler::finish_now`](crate::DeadlineScheduler::finish_now)
    /// 时，两个完成信号都会以取消结束。
    pub fn canceled() -> Error {
        Error::new(Kind::Canceled)
    }

    /// 创建一个表示"主动取消"的错误，并附带底层原因。
    pub fn canceled_with<C: Into<Cause>>(cause: C) -> Error {
        Error::new(Kind::Canceled).with(cause)
    }

    pub(super) fn new(kind: Kind) -> Error {
        Error {
            inner: Box::new(ErrorImpl { kind, cause: None }),
        }
    }

    pub(super) fn with<C: Into<Cause>>(mut self, cause: C) -> Error {
        self.inner.cause = Some(cause.into());
        self
    }

    /// 在错误的 source 链中查找特定类型的错误。
    pub(crate) fn find_source<E: StdError + 'static>(&self) -> Option<&E> {
        let mut cause = self.source();
        while let Some(err) = cause {
            if let Some(typed) = err.downcast_ref() {
                return Some(typed);
            }
            cause = err.source();
        }

        // else
        None
    }

    /// 截止时间到期时传给超时任务的错误。
    pub(crate) fn new_timeout() -> Error {
        Error::new(Kind::Timeout).with(TimedOut)
    }

    pub(crate) fn new_invalid_timeout(mode: &'static str, nanos: i64, expected: &str) -> Error {
        Error::new(Kind::User(User::InvalidTimeout)).with(format!(
            "{}: timeoutNanos: {} (expected: {})",
            mode, nanos, expected
        ))
    }

    pub(crate) fn new_keep_alive_timed_out() -> Error {
        Error::new(Kind::KeepAlive).with(KeepAliveTimedOut)
    }

    pub(crate) fn new_ping_write(cause: Option<Cause>) -> Error {
        let err = Error::new(Kind::PingWrite);
        match cause {
            Some(cause) => err.with(cause),
            None => err,
        }
    }

    /// 复制错误的分类，丢弃原因链。
    ///
    /// 完成信号可能被任意多个观察者轮询，而 `Error` 不是 `Clone`，
    /// 因此每个观察者得到一个只保留分类的新错误。
    pub(crate) fn shallow_clone(&self) -> Error {
        match self.inner.kind {
            Kind::Timeout => Error::new_timeout(),
            Kind::Canceled => Error::canceled(),
            Kind::KeepAlive => Error::new_keep_alive_timed_out(),
            Kind::PingWrite => Error::new_ping_write(None),
            Kind::User(User::InvalidTimeout) => Error::new(Kind::User(User::InvalidTimeout)),
        }
    }

    fn description(&self) -> &str {
        match self.inner.kind {
            Kind::Timeout => "deadline exceeded",
            Kind::Canceled => "operation was canceled",
            Kind::KeepAlive => "keep-alive ping was not acknowledged",
            Kind::PingWrite => "error writing a keep-alive ping",
            Kind::User(User::InvalidTimeout) => "invalid timeout value",
        }
    }
}

impl fmt::Debug for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut f = f.debug_tuple("lifeline::Error");
        f.field(&self.inner.kind);
        if let Some(ref cause) = self.inner.cause {
            f.field(cause);
        }
        f.finish()
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.description())
    }
}

impl StdError for Error {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.inner
            .cause
            .as_ref()
            .map(|cause| &**cause as &(dyn StdError + 'static))
    }
}

// ===== impl TimedOut ====

impl fmt::Display for TimedOut {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("operation timed out")
    }
}

impl StdError for TimedOut {}

// ===== impl KeepAliveTimedOut ====

/// keep-alive PING 超时错误，其 source 为 `TimedOut`，
/// 因此 `Error::is_timeout()` 对它同样返回 `true`。
#[derive(Debug)]
pub(super) struct KeepAliveTimedOut;

impl fmt::Display for KeepAliveTimedOut {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("keep-alive timed out")
    }
}

impl StdError for KeepAliveTimedOut {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        Some(&TimedOut)
    }
}
