#![doc = r#"
# spark-messaging

## 设计动机（Why）
- **定位**：为两个进程之间提供类型化的消息通道。多条逻辑通道共享同一个物理
  连接端点，建连与优雅停机对两端对称且无竞态。
- **架构角色**：本 crate 与传输无关，只定义消息模型、线协议、通道状态机与
  分发组合；TCP 实现位于 `spark-messaging-tcp`，进程内实现
  [`MemoryNetwork`](connection::MemoryNetwork) 用于测试与嵌入。

## 核心契约（What）
- [`MultiChannelConnector::listen`] 立即返回一个等待对端的 [`Channel`]，其地址
  形如 `channel:tcp://host:port!N`；对端以 [`MultiChannelConnector::connect`]
  连接该地址；
- 每个方向以唯一的 [`Message::EndOfStream`] 结束，两端结束顺序任意，物理连接
  恰好关闭一次；
- 错误统一为 [`MessagingError`]，附带稳定错误码与 [`ErrorKind`]。

## 实现策略（How）
- 通道 I/O 基于 Tokio；状态机转移表是纯函数
  （[`ChannelState`](connection::ChannelState)），由 `parking_lot::Mutex` 保护、
  `tokio::sync::Notify` 唤醒；
- 编组、过滤、广播是同步的 [`Dispatch`](dispatch::Dispatch) 组合链，通过
  [`AsyncDispatch`](dispatch::AsyncDispatch) 与 [`AsyncReceive`](dispatch::AsyncReceive)
  和异步通道相连；
- 远端错误以结构化数据传输，由 [`FailureRegistry`] 在接收方重建。

## 风险与考量（Trade-offs）
- 不提供确认、重传或跨通道排序，可靠性等同于底层字节流；
- 停机等待有固定上限（默认 120 秒），超时视为致命错误，不做重试。
"#]

pub mod address;
pub mod codec;
pub mod config;
pub mod connection;
pub mod dispatch;
pub mod error;
pub mod lifecycle;
pub mod message;

mod channel;
mod connector;
mod hub;

pub use address::{ChannelAddress, PhysicalAddress};
pub use channel::Channel;
pub use config::MessagingConfig;
pub use connector::MultiChannelConnector;
pub use error::{BoxError, ErrorKind, MessagingError, Result};
pub use hub::{MessageHub, MessageHubBuilder};
pub use lifecycle::{AsyncStoppable, CompositeStoppable, Stoppable};
pub use message::{
    ChannelKey, FailureRegistry, Message, MethodInvocation, Payload, RemoteError, RemoteFailure,
};
