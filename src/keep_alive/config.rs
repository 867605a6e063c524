use std::time::Duration;

use crate::common::time;

/// 连接在协议中的角色。
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Role {
    /// 服务端：最长存活时间到期后只标记需要断开，由协议层在合适的时机
    /// （例如发送 GOAWAY 或 `Connection: close`）结束连接。
    #[default]
    Server,
    /// 客户端：最长存活时间到期且没有正在处理的请求时直接关闭连接。
    Client,
}

/// keep-alive 策略配置。
///
/// 所有选项彼此独立，默认全部禁用。传入 `None` 或 `Duration::ZERO` 表示禁用。
///
/// ```
/// # use std::time::Duration;
/// # use lifeline::keep_alive::Config;
/// let mut config = Config::new();
/// config
///     .idle_timeout(Duration::from_secs(10))
///     .ping_interval(Duration::from_secs(5))
///     .max_connection_age(Duration::from_secs(600))
///     .max_requests_per_connection(1_000);
/// ```
#[derive(Clone, Debug, Default)]
pub struct Config {
    idle_timeout: Option<Duration>,
    ping_interval: Option<Duration>,
    ping_ack_timeout: Option<Duration>,
    max_connection_age: Option<Duration>,
    max_requests_per_connection: u64,
    keep_alive_on_ping: bool,
    role: Role,
}

impl Config {
    /// 创建一个所有选项都禁用的配置。
    pub fn new() -> Config {
        Config::default()
    }

    /// 设置连接空闲超时。
    ///
    /// 连接在这段时间内既没有读也没有写，并且没有正在处理的请求时被关闭。
    ///
    /// 默认禁用。
    pub fn idle_timeout(&mut self, timeout: impl Into<Option<Duration>>) -> &mut Self {
        self.idle_timeout = non_zero(timeout.into());
        self
    }

    /// 设置发送 PING 的间隔。
    ///
    /// 连接在这段时间内没有 PING 活动时，发送一个 PING 并等待确认。
    ///
    /// 默认禁用。
    pub fn ping_interval(&mut self, interval: impl Into<Option<Duration>>) -> &mut Self {
        self.ping_interval = non_zero(interval.into());
        self
    }

    /// 设置等待 PING 确认的时间。
    ///
    /// 超过这段时间仍未收到确认，连接被判定为不健康并关闭。
    /// 未设置时使用 PING 间隔。
    pub fn ping_ack_timeout(&mut self, timeout: impl Into<Option<Duration>>) -> &mut Self {
        self.ping_ack_timeout = non_zero(timeout.into());
        self
    }

    /// 设置连接的最长存活时间。
    ///
    /// 到期之后无论是否有流量，连接都需要断开。
    ///
    /// 默认禁用。
    pub fn max_connection_age(&mut self, age: impl Into<Option<Duration>>) -> &mut Self {
        self.max_connection_age = non_zero(age.into());
        self
    }

    /// 设置单个连接最多处理的请求数，`0` 表示不限制。
    pub fn max_requests_per_connection(&mut self, max: u64) -> &mut Self {
        self.max_requests_per_connection = max;
        self
    }

    /// 收到对端的 PING 是否和普通的读写一样重置空闲计时。
    ///
    /// 默认为 `false`：只有 PING 往来的连接仍然会因空闲而关闭。
    pub fn keep_alive_on_ping(&mut self, enabled: bool) -> &mut Self {
        self.keep_alive_on_ping = enabled;
        self
    }

    /// 设置连接的角色，默认为 [`Role::Server`]。
    pub fn role(&mut self, role: Role) -> &mut Self {
        self.role = role;
        self
    }

    pub(super) fn is_client(&self) -> bool {
        self.role == Role::Client
    }

    pub(super) fn idle_nanos(&self) -> i64 {
        time::opt_nanos(self.idle_timeout)
    }

    pub(super) fn ping_nanos(&self) -> i64 {
        time::opt_nanos(self.ping_interval)
    }

    pub(super) fn ping_ack_nanos(&self) -> i64 {
        time::opt_nanos(self.ping_ack_timeout.or(self.ping_interval))
    }

    pub(super) fn max_age_nanos(&self) -> i64 {
        time::opt_nanos(self.max_connection_age)
    }

    pub(super) fn max_requests(&self) -> u64 {
        self.max_requests_per_connection
    }

    pub(super) fn is_keep_alive_on_ping(&self) -> bool {
        self.keep_alive_on_ping
    }
}

fn non_zero(dur: Option<Duration>) -> Option<Duration> {
    dur.filter(|dur| !dur.is_zero())
}
