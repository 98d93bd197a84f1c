//! 物理连接契约、延迟绑定连接与进程内传输。
//!
//! # 教案式注释
//!
//! ## 意图 (Why)
//! - 消息层只依赖“能收发 [`Message`] 的双工连接”这一最小能力，TCP、进程内管道
//!   等传输实现通过本模块的 trait 接入；
//! - 入站连接的第一条消息必须是 [`ConnectRequest`]，该约束在
//!   [`serve_connection`] 中集中实现，各传输实现无需重复。
//!
//! ## 契约 (What)
//! - [`Connection::receive`] 返回 `Ok(None)` 表示字节流已关闭；
//! - [`Connection::close`] 幂等；
//! - [`IncomingConnector::accept`] 返回实际绑定的物理地址，之后每个入站连接
//!   都交给 [`AcceptHandler`]。

mod deferred;
mod memory;
mod state;

use std::{fmt, sync::Arc};

use async_trait::async_trait;

use crate::{
    address::PhysicalAddress,
    error::{MessagingError, Result},
    message::{ConnectRequest, Message},
};

pub use deferred::DeferredConnection;
pub use memory::{MemoryConnection, MemoryIncomingConnector, MemoryNetwork};
pub use state::{ChannelState, ConnectStep, DispatchStep, ReceiveStep};

/// 双工消息连接。
#[async_trait]
pub trait Connection: Send + Sync + fmt::Debug {
    async fn send(&self, message: Message) -> Result<()>;

    async fn receive(&self) -> Result<Option<Message>>;

    async fn close(&self) -> Result<()>;

    /// 对端描述，仅用于日志。
    fn peer(&self) -> String;
}

/// 处理已完成握手的入站连接。
#[async_trait]
pub trait AcceptHandler: Send + Sync {
    async fn on_connection(
        &self,
        request: ConnectRequest,
        connection: Arc<dyn Connection>,
    ) -> Result<()>;
}

/// 接受入站连接的端点。
#[async_trait]
pub trait IncomingConnector: Send + Sync {
    async fn accept(&self, handler: Arc<dyn AcceptHandler>) -> Result<PhysicalAddress>;

    /// 停止接受新连接；已交给处理器的连接不受影响。
    async fn stop(&self) -> Result<()>;
}

/// 建立出站连接的端点。
#[async_trait]
pub trait OutgoingConnector: Send + Sync {
    async fn connect(&self, address: &PhysicalAddress) -> Result<Arc<dyn Connection>>;
}

/// 读取入站连接的第一条消息并交给处理器。
///
/// 第一条消息不是 `ConnectRequest`、连接提前关闭或处理器失败时，连接被关闭。
pub async fn serve_connection(connection: Arc<dyn Connection>, handler: Arc<dyn AcceptHandler>) {
    let peer = connection.peer();
    let request = match connection.receive().await {
        Ok(Some(Message::ConnectRequest(request))) => request,
        Ok(Some(other)) => {
            let err = MessagingError::UnexpectedMessage {
                expected: "ConnectRequest",
                actual: other.kind_name(),
            };
            tracing::warn!(peer = %peer, error.code = err.code(), error = %err, "rejecting incoming connection");
            close_quietly(connection.as_ref()).await;
            return;
        }
        Ok(None) => {
            tracing::warn!(peer = %peer, "incoming connection closed before sending a connect request");
            close_quietly(connection.as_ref()).await;
            return;
        }
        Err(err) => {
            tracing::warn!(peer = %peer, error.code = err.code(), error = %err, "failed to read connect request");
            close_quietly(connection.as_ref()).await;
            return;
        }
    };

    let destination = request.destination.to_string();
    if let Err(err) = handler.on_connection(request, Arc::clone(&connection)).await {
        tracing::error!(
            peer = %peer,
            address = %destination,
            error.code = err.code(),
            error = %err,
            "failed to handle incoming connection"
        );
        close_quietly(connection.as_ref()).await;
    }
}

pub(crate) async fn close_quietly(connection: &dyn Connection) {
    if let Err(err) = connection.close().await {
        tracing::debug!(peer = %connection.peer(), error = %err, "error while closing connection");
    }
}
