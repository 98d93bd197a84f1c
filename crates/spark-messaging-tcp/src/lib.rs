#![doc = r#"
# spark-messaging-tcp

## 设计动机（Why）
- 为 `spark-messaging` 提供基于 Tokio 的 TCP 传输：监听端点、拨号端点与
  长度前缀分帧的消息连接；
- 消息层只依赖 `Connection`/`IncomingConnector`/`OutgoingConnector` 三个 trait，
  本 crate 是这些 trait 面向操作系统套接字的实现。

## 核心契约（What）
- 线上帧格式为 `u32` 大端长度 + 消息编码，超过 `max_frame_size` 的帧被拒绝；
- I/O 失败映射为带稳定错误码的 [`MessagingError::Transport`](spark_messaging::MessagingError::Transport)
  （`spark.messaging.tcp.{bind,accept,connect,read,write,shutdown,configure}_failed`）；
- [`start_connector`] 以一份 [`MessagingConfig`] 组装出可直接 `listen`/`connect`
  的 [`MultiChannelConnector`]。

## 实现策略（How）
- 读写半部分离，各由 `tokio::sync::Mutex` 串行化；
- 半关闭通过 `socket2::SockRef` 执行，与关闭通知一起唤醒阻塞的读者。

## 风险与考量（Trade-offs）
- 不提供 TLS、认证或重连；连接断开即视为对应方向的流结束。
"#]

mod connection;
mod error;
mod incoming;
mod outgoing;

use std::sync::Arc;

use spark_messaging::{MessagingConfig, MultiChannelConnector, Result};

pub use connection::TcpConnection;
pub use incoming::TcpIncomingConnector;
pub use outgoing::TcpOutgoingConnector;

/// 以 TCP 端点启动多路复用连接器，监听地址取自配置。
pub async fn start_connector(config: &MessagingConfig) -> Result<MultiChannelConnector> {
    MultiChannelConnector::start(
        Arc::new(TcpIncomingConnector::new(config)),
        Arc::new(TcpOutgoingConnector::new(config)),
        config,
    )
    .await
}
