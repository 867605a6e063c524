//! 纳秒级时间运算。
//!
//! 截止时间以 `i64` 纳秒表示：正数是距 `start` 的长度，`0` 表示禁用。
//! 负数只会作为 `EXTEND` 的增量出现。所有加减法都是饱和运算，
//! 不会因为极端的输入而溢出或 panic。

use std::time::{Duration, Instant};

/// `Duration` 转换为纳秒，超出 `i64` 范围时饱和。
pub(crate) fn nanos(dur: Duration) -> i64 {
    i64::try_from(dur.as_nanos()).unwrap_or(i64::MAX)
}

/// 可选的时长转换为纳秒，`None` 与零都表示禁用，返回 `0`。
pub(crate) fn opt_nanos(dur: Option<Duration>) -> i64 {
    dur.map(nanos).unwrap_or(0)
}

/// `later - earlier` 的有符号纳秒数。
pub(crate) fn elapsed_nanos(later: Instant, earlier: Instant) -> i64 {
    if later >= earlier {
        nanos(later - earlier)
    } else {
        nanos(earlier - later).saturating_neg()
    }
}

/// 把纳秒数转换为定时器的延迟；已经过去的截止时间得到零延迟，
/// 也就是在下一个 tick 触发。
pub(crate) fn delay(nanos: i64) -> Duration {
    if nanos <= 0 {
        Duration::ZERO
    } else {
        Duration::from_nanos(nanos as u64)
    }
}
