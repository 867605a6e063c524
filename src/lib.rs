#![deny(missing_docs)]
#![deny(missing_debug_implementations)]
#![cfg_attr(test, deny(rust_2018_idioms))]
#![cfg_attr(all(test, feature = "full"), deny(unreachable_pub))]
#![cfg_attr(all(test, feature = "full"), deny(warnings))]
#![cfg_attr(docsrs, feature(doc_cfg))]

//! # lifeline
//!
//! lifeline 是嵌入在异步 HTTP 客户端/服务端中的连接生命周期与截止时间调度引擎。
//!
//! - [`DeadlineScheduler`]：每个请求一个可变、可取消的截止时间，支持延长、
//!   重置、清除与立即触发，并提供"正在超时"和"已经超时"两个完成信号。
//! - [`KeepAlive`]：每个连接一个保活状态机，综合空闲超时、PING 探测、
//!   最长存活时间与最大请求数，决定连接何时需要关闭。
//! - [`ConnectionLifecycleRecorder`]：接收连接存活时长的记录器。
//!
//! 两个状态机都运行在单线程、非阻塞的事件循环上（见 [`rt::EventLoop`]），
//! 它们是 `!Send` 的，所有调用都必须发生在拥有它们的事件循环线程上。
//!
//! # Optional Features
//!
//! - `tracing`：通过 `tracing` crate 输出调试日志。
//! - `full`：启用所有特性。
//!
//! # 示例
//!
//! ```
//! use std::rc::Rc;
//! use lifeline::{DeadlineScheduler, Error, TimeoutMode, TimeoutTask};
//! use lifeline::rt::LocalEventLoop;
//!
//! struct CancelRequest;
//!
//! impl TimeoutTask for CancelRequest {
//!     fn can_schedule(&self) -> bool {
//!         true
//!     }
//!
//!     fn run(&self, cause: &Error) {
//!         println!("request aborted: {}", cause);
//!     }
//! }
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! # let local = tokio::task::LocalSet::new();
//! # local.run_until(async {
//! let scheduler = DeadlineScheduler::new(0);
//! // 事件循环确定之前就可以调整
//! scheduler.set_timeout_nanos(TimeoutMode::SetFromNow, 10_000_000).unwrap();
//!
//! scheduler.bind(Rc::new(LocalEventLoop::new()), Rc::new(CancelRequest), 0);
//! scheduler.when_timed_out().await.unwrap();
//! # }).await;
//! # }
//! ```

pub use crate::deadline::{DeadlineScheduler, TimeoutMode, TimeoutTask};
pub use crate::error::{Error, Result};
pub use crate::common::signal::TimeoutSignal;
pub use crate::keep_alive::{KeepAlive, KeepAliveConnection, PingState, PingWriteCompletion};
pub use crate::lifecycle::{ConnectionLifecycleRecorder, NoopRecorder};

#[macro_use]
mod trace;

mod common;
pub mod deadline;
mod error;
pub mod keep_alive;
pub mod lifecycle;
#[cfg(test)]
mod mock;
pub mod rt;
