//! 日志追踪（tracing）宏模块
//!
//! 本模块对 `tracing` crate 的日志宏进行了条件包装：
//!
//! 1. 当 `tracing` feature 启用时，宏会展开为实际的 `tracing::*` 调用
//! 2. 当 `tracing` feature 未启用时，宏展开为空操作（零成本抽象）
//!
//! 本模块通过 `#[macro_use]` 在 `lib.rs` 中最先被引入，使得截止时间调度器和
//! keep-alive 状态机可以直接使用 `trace!` 和 `debug!` 宏，
//! 而无需关心 `tracing` feature 是否启用。
//!
//! 注意：未启用 `tracing` 时宏体被完全丢弃，因此仅在日志中使用的变量
//! 应以下划线开头（如 `_err`），避免产生未使用变量的警告。

/// `debug!`：调试级别日志宏
///
/// 用于记录状态机的关键转换（例如连接因空闲被关闭、PING 写入失败）。
macro_rules! debug {
    ($($arg:tt)+) => {
        #[cfg(feature = "tracing")]
        {
            tracing::debug!($($arg)+);
        }
    }
}

/// `trace!`：追踪级别日志宏
///
/// 最细粒度的日志级别，用于记录定时器的每一次装载、取消与触发。
macro_rules! trace {
    ($($arg:tt)*) => {
        #[cfg(feature = "tracing")]
        {
            tracing::trace!($($arg)+);
        }
    }
}
