//! 分发织网：同步的 [`Dispatch`] 组合链，以及与异步通道之间的队列桥。
//!
//! # 教案式注释
//!
//! ## 意图 (Why)
//! - 编组、过滤、广播都是纯内存变换，保持同步可以让组合链在任何线程上调用，
//!   也便于在锁内维持消息顺序；
//! - 真正的 I/O 发生在 [`crate::Channel`] 上，通过 [`AsyncDispatch`] 与
//!   [`AsyncReceive`] 两个工作任务与同步链解耦。
//!
//! ## 契约 (What)
//! - [`Dispatch::dispatch`] 按调用顺序处理消息，失败以 [`MessagingError`] 返回；
//! - [`AsyncSink`] / [`AsyncSource`] 描述异步端点，`receive` 返回 `None` 表示流结束。

mod broadcast;
mod end_of_stream;
mod marshalling;
mod queue;

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::MessagingError;

pub use broadcast::{
    BroadcastDispatch, HandlerKey, ListenerContract, ListenerFailure, ListenerNotificationError,
};
pub use end_of_stream::EndOfStreamFilter;
pub use marshalling::{ChannelMessageMarshallingDispatch, ChannelMessageUnmarshallingDispatch};
pub use queue::{AsyncDispatch, AsyncReceive};

/// 同步消息接收端。
pub trait Dispatch<T>: Send + Sync {
    fn dispatch(&self, message: T) -> Result<(), MessagingError>;
}

impl<T, D> Dispatch<T> for Arc<D>
where
    D: Dispatch<T> + ?Sized,
{
    fn dispatch(&self, message: T) -> Result<(), MessagingError> {
        (**self).dispatch(message)
    }
}

/// 以闭包实现 [`Dispatch`]，便于测试与一次性接线。
pub struct FnDispatch<F>(F);

impl<F> FnDispatch<F> {
    pub fn new(f: F) -> Self {
        Self(f)
    }
}

impl<T, F> Dispatch<T> for FnDispatch<F>
where
    F: Fn(T) -> Result<(), MessagingError> + Send + Sync,
{
    fn dispatch(&self, message: T) -> Result<(), MessagingError> {
        (self.0)(message)
    }
}

/// 异步消息接收端。
#[async_trait]
pub trait AsyncSink<T: Send + 'static>: Send + Sync {
    async fn send(&self, message: T) -> Result<(), MessagingError>;
}

/// 异步消息来源；`None` 表示不再有消息。
#[async_trait]
pub trait AsyncSource<T: Send + 'static>: Send + Sync {
    async fn receive(&self) -> Result<Option<T>, MessagingError>;
}
