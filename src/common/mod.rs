//! lifeline 公共工具模块（common）。
//!
//! 本模块汇集了截止时间调度器与 keep-alive 状态机共用的基础工具：
//! - 两阶段完成信号（`signal`）
//! - 纳秒级的饱和时间运算（`time`）
//!
//! 所有子模块均为 `pub(crate)` 可见性，仅供内部使用；
//! `TimeoutSignal` 通过 crate 根重新导出。

pub(crate) mod signal;
pub(crate) mod time;
