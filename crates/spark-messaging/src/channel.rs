use std::{
    fmt,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use tokio::runtime::Handle;

use crate::{
    address::ChannelAddress,
    connection::{ChannelState, Connection, DeferredConnection},
    dispatch::{AsyncSink, AsyncSource},
    error::{MessagingError, Result},
    lifecycle::{AsyncStoppable, Stoppable},
    message::Message,
};

struct ChannelInner {
    address: ChannelAddress,
    connection: DeferredConnection,
    stop_requested: AtomicBool,
    stop_timeout: Duration,
    runtime: Handle,
}

/// 调用方持有的逻辑通道句柄。
///
/// # 教案式注释
///
/// ## 意图 (Why)
/// - 将 [`DeferredConnection`] 的状态机包装成可克隆、可停止的句柄，
///   让调用方无需关心连接何时被绑定。
///
/// ## 契约 (What)
/// - `dispatch` / `receive` 在绑定前等待，绑定后按顺序生效；
/// - `request_stop` 立即返回，在后台发送一次 `EndOfStream`，重复调用无副作用；
/// - `stop` 发送 `EndOfStream`（若尚未发送）、丢弃剩余入站消息直到流结束，并等待
///   通道进入 `Stopped`；超过配置的停机时限返回
///   [`MessagingError::ShutdownTimeout`]，不做重试。
///
/// ## 注意事项 (Trade-offs)
/// - `stop` 会消费入站消息；若另有读者（如 [`crate::MessageHub`]）在读取同一通道，
///   应改用 [`Channel::stopped`] 等待。
#[derive(Clone)]
pub struct Channel {
    inner: Arc<ChannelInner>,
}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel")
            .field("address", &self.inner.address.to_string())
            .field("state", &self.state())
            .finish()
    }
}

impl Channel {
    pub(crate) fn new(address: ChannelAddress, stop_timeout: Duration, runtime: Handle) -> Self {
        let label = address.to_string();
        Self {
            inner: Arc::new(ChannelInner {
                address,
                connection: DeferredConnection::new(label),
                stop_requested: AtomicBool::new(false),
                stop_timeout,
                runtime,
            }),
        }
    }

    pub fn address(&self) -> &ChannelAddress {
        &self.inner.address
    }

    pub async fn dispatch(&self, message: Message) -> Result<()> {
        if message.is_end_of_stream() {
            self.inner.stop_requested.store(true, Ordering::Release);
        }
        self.inner.connection.dispatch(message).await
    }

    pub async fn receive(&self) -> Result<Option<Message>> {
        self.inner.connection.receive().await
    }

    pub fn state(&self) -> ChannelState {
        self.inner.connection.state()
    }

    /// 等待两个方向都结束。
    pub async fn stopped(&self) {
        self.inner.connection.stopped().await
    }

    pub(crate) async fn connect(&self, connection: Arc<dyn Connection>) -> Result<()> {
        self.inner.connection.connect(connection).await
    }

    pub(crate) async fn abort(&self) {
        self.inner.connection.abort().await
    }

    async fn end_outgoing_stream(&self) {
        match self.inner.connection.dispatch(Message::EndOfStream).await {
            Ok(()) => {}
            Err(MessagingError::InvalidState { state, .. }) => {
                tracing::debug!(channel = %self.inner.address, state = ?state, "outgoing stream already ended");
            }
            Err(err) => {
                tracing::debug!(
                    channel = %self.inner.address,
                    error.code = err.code(),
                    error = %err,
                    "failed to send end of stream"
                );
            }
        }
    }

    async fn drain(&self) {
        if !self.inner.stop_requested.swap(true, Ordering::AcqRel) {
            self.end_outgoing_stream().await;
        }
        loop {
            match self.receive().await {
                Ok(Some(message)) if message.is_end_of_stream() => {}
                Ok(Some(message)) => {
                    tracing::debug!(
                        channel = %self.inner.address,
                        message = message.kind_name(),
                        "discarding message received during shutdown"
                    );
                }
                Ok(None) => break,
                Err(err) => {
                    tracing::debug!(channel = %self.inner.address, error = %err, "receive failed during shutdown");
                    break;
                }
            }
        }
        self.stopped().await;
    }
}

#[async_trait]
impl AsyncSink<Message> for Channel {
    async fn send(&self, message: Message) -> Result<()> {
        self.dispatch(message).await
    }
}

#[async_trait]
impl AsyncSource<Message> for Channel {
    async fn receive(&self) -> Result<Option<Message>> {
        Channel::receive(self).await
    }
}

#[async_trait]
impl Stoppable for Channel {
    async fn stop(&self) -> Result<()> {
        let channel = self.clone();
        let mut job = self.inner.runtime.spawn(async move { channel.drain().await });
        match tokio::time::timeout(self.inner.stop_timeout, &mut job).await {
            Ok(joined) => joined.map_err(|err| MessagingError::Task(err.to_string())),
            Err(_) => {
                job.abort();
                self.abort().await;
                let err = MessagingError::ShutdownTimeout {
                    target: self.inner.address.to_string(),
                    timeout: self.inner.stop_timeout,
                };
                tracing::error!(channel = %self.inner.address, error.code = err.code(), "channel stop timed out");
                Err(err)
            }
        }
    }
}

impl AsyncStoppable for Channel {
    fn request_stop(&self) {
        if self.inner.stop_requested.swap(true, Ordering::AcqRel) {
            return;
        }
        let channel = self.clone();
        self.inner
            .runtime
            .spawn(async move { channel.end_outgoing_stream().await });
    }
}
