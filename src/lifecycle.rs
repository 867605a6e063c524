//! 连接生命周期记录
//!
//! [`KeepAlive`](crate::KeepAlive) 在连接初始化时通知
//! [`ConnectionLifecycleRecorder::connection_opened`]，在销毁时把连接存活的时长
//! 交给 [`ConnectionLifecycleRecorder::connection_closed`]。记录器只是一个接收端，
//! 不参与任何控制流。

use std::time::Duration;

/// 接收连接打开/关闭事件的记录器。
///
/// 实现者通常把时长写入某个指标系统。记录器由调用方持有并注入，
/// 没有任何进程级的全局状态。
pub trait ConnectionLifecycleRecorder {
    /// 连接已经初始化。
    fn connection_opened(&self) {}

    /// 连接已经关闭，`lifespan` 是从初始化到销毁的时长。
    ///
    /// 每个连接最多调用一次。
    fn connection_closed(&self, lifespan: Duration);
}

/// 丢弃所有事件的记录器。
#[derive(Clone, Copy, Debug, Default)]
pub struct NoopRecorder;

impl ConnectionLifecycleRecorder for NoopRecorder {
    fn connection_closed(&self, _lifespan: Duration) {}
}
