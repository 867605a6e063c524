//! 绑定之前登记的超时调整。
//!
//! 调整按收到的顺序保存，绑定时依次重放。`SET_FROM_NOW`/`SET_FROM_START`
//! 与 `EXTEND` 不满足交换律，所以不能折叠成一个累计值。

use smallvec::SmallVec;

use super::TimeoutMode;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(super) enum PendingOp {
    Adjust(TimeoutMode, i64),
    /// `clear_timeout(keep)`：停止计时。
    ///
    /// `keep` 为 `false` 时还会丢弃之前的调整并把超时长度归零；
    /// 为 `true` 时长度保留，之后的 `SET_FROM_*` 可以重新装载。
    Clear { keep: bool },
}

/// 重放的结果。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(super) struct Replayed {
    /// 超时长度，`0` 表示禁用。
    pub(super) timeout: i64,
    /// 绑定之后是否需要装载定时器。
    pub(super) armed: bool,
}

#[derive(Debug, Default)]
pub(super) struct PendingOps {
    ops: SmallVec<[PendingOp; 4]>,
}

impl PendingOps {
    pub(super) fn push(&mut self, op: PendingOp) {
        if op == (PendingOp::Clear { keep: false }) {
            self.ops.clear();
        }
        self.ops.push(op);
    }

    /// 以 `initial` 为起点依次应用所有调整。
    ///
    /// 绑定时刻即是 `start`，此时"从现在开始"与"从开始时刻开始"是同一个锚点。
    pub(super) fn fold(&self, initial: i64) -> Replayed {
        let initial = Replayed {
            timeout: initial.max(0),
            armed: initial > 0,
        };
        self.ops.iter().fold(initial, |state, op| apply(state, *op))
    }

    pub(super) fn clear(&mut self) {
        self.ops.clear();
    }
}

fn apply(state: Replayed, op: PendingOp) -> Replayed {
    match op {
        PendingOp::Clear { keep: false } => Replayed {
            timeout: 0,
            armed: false,
        },
        PendingOp::Clear { keep: true } => Replayed {
            armed: false,
            ..state
        },
        PendingOp::Adjust(TimeoutMode::SetFromNow, nanos)
        | PendingOp::Adjust(TimeoutMode::SetFromStart, nanos) => Replayed {
            timeout: nanos,
            armed: nanos > 0,
        },
        // 停止计时的超时不受 EXTEND 影响
        PendingOp::Adjust(TimeoutMode::Extend, _) if !state.armed => state,
        PendingOp::Adjust(TimeoutMode::Extend, delta) => Replayed {
            timeout: extend(state.timeout, delta),
            armed: true,
        },
    }
}

/// 禁用的超时不能被延长；缩短不会把超时变成禁用，最少剩下 1 纳秒。
pub(super) fn extend(timeout: i64, delta: i64) -> i64 {
    if timeout <= 0 {
        0
    } else {
        timeout.saturating_add(delta).max(1)
    }
}
