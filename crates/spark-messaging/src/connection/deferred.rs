use std::{fmt, pin::pin, sync::Arc};

use parking_lot::Mutex;
use tokio::sync::{Mutex as AsyncMutex, Notify};

use super::{
    ChannelState, Connection, ConnectStep, DispatchStep, ReceiveStep, close_quietly,
};
use crate::{
    error::{MessagingError, Result},
    message::Message,
};

struct Inner {
    state: ChannelState,
    connection: Option<Arc<dyn Connection>>,
    /// 因中止或发送故障进入收尾；此后的误用按丢弃处理。
    aborted: bool,
}

impl Inner {
    /// 切换状态；进入不再使用连接的状态时交出连接，由调用方在锁外关闭。
    fn transition(&mut self, next: ChannelState) -> Option<Arc<dyn Connection>> {
        self.state = next;
        if next.releases_connection() {
            self.connection.take()
        } else {
            None
        }
    }
}

enum Outgoing {
    Wait,
    Send {
        connection: Option<Arc<dyn Connection>>,
        released: Option<Arc<dyn Connection>>,
    },
    Discard,
    Reject(ChannelState),
}

enum Incoming {
    Wait,
    Read(Option<Arc<dyn Connection>>),
    Synthesized(Option<Arc<dyn Connection>>),
    Finished,
}

/// 先创建、后绑定物理连接的逻辑通道。
///
/// # 教案式注释
///
/// ## 意图 (Why)
/// - 监听方在对端连上之前就要把通道交给调用方，调用方可以立即 `dispatch`
///   与 `receive`；这两个操作在绑定前挂起等待，绑定后按原顺序继续，
///   不丢失也不重排消息；
/// - 两端关闭顺序任意：无论谁先发 `EndOfStream`，最终都收敛到
///   [`ChannelState::Stopped`]，且物理连接恰好关闭一次。
///
/// ## 逻辑 (How)
/// - 状态与连接放在 `parking_lot::Mutex` 中，决策由 [`ChannelState`] 的纯函数给出，
///   并在决策时刻写回，锁从不跨越 `.await`；
/// - 等待点使用 `Notify` 的 “先登记、再检查、后等待” 模式，避免错过唤醒；
/// - 发送与接收各由一把异步互斥锁串行化，保证同一方向上的消息顺序；
/// - 进入 `Stopped` 或 `GenerateIncomingEndOfStream` 的一方取走连接并负责关闭，
///   因此关闭只会发生一次。
///
/// ## 契约 (What)
/// - `connect`：仅在 `AwaitConnect` 时绑定；否则向传入连接发送 `EndOfStream` 并关闭它，
///   已绑定时返回 [`MessagingError::InvalidState`]；
/// - `dispatch`：本端 `EndOfStream` 之后再分发返回 `InvalidState`；中止后的消息被丢弃；
///   写入失败视为对端消失，不向调用方报错，后续接收得到一个合成的 `EndOfStream`；
/// - `receive`：读到 `EndOfStream`、流关闭或读取故障都交付一次 `EndOfStream`，
///   此后返回 `None`。
pub struct DeferredConnection {
    label: String,
    inner: Mutex<Inner>,
    changed: Notify,
    send_order: AsyncMutex<()>,
    receive_order: AsyncMutex<()>,
}

impl fmt::Debug for DeferredConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeferredConnection")
            .field("label", &self.label)
            .field("state", &self.state())
            .finish()
    }
}

impl DeferredConnection {
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            inner: Mutex::new(Inner {
                state: ChannelState::AwaitConnect,
                connection: None,
                aborted: false,
            }),
            changed: Notify::new(),
            send_order: AsyncMutex::new(()),
            receive_order: AsyncMutex::new(()),
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn state(&self) -> ChannelState {
        self.inner.lock().state
    }

    /// 绑定物理连接。
    pub async fn connect(&self, connection: Arc<dyn Connection>) -> Result<()> {
        let rejected = {
            let mut inner = self.inner.lock();
            match inner.state.on_connect() {
                ConnectStep::Bind => {
                    inner.state = ChannelState::Connected;
                    inner.connection = Some(Arc::clone(&connection));
                    None
                }
                ConnectStep::Reject => Some((inner.state, inner.aborted)),
            }
        };

        let Some((state, aborted)) = rejected else {
            tracing::debug!(channel = %self.label, peer = %connection.peer(), "channel connected");
            self.changed.notify_waiters();
            return Ok(());
        };

        tracing::warn!(
            channel = %self.label,
            peer = %connection.peer(),
            state = ?state,
            "discarding redundant connection"
        );
        if let Err(err) = connection.send(Message::EndOfStream).await {
            tracing::debug!(channel = %self.label, error = %err, "failed to end redundant connection");
        }
        close_quietly(connection.as_ref()).await;
        if aborted {
            Ok(())
        } else {
            Err(MessagingError::InvalidState {
                operation: "connect",
                state,
            })
        }
    }

    /// 发送一条消息；绑定前等待。
    pub async fn dispatch(&self, message: Message) -> Result<()> {
        let _order = self.send_order.lock().await;
        let end_of_stream = message.is_end_of_stream();
        loop {
            let mut changed = pin!(self.changed.notified());
            changed.as_mut().enable();

            let step = {
                let mut inner = self.inner.lock();
                match inner.state.on_dispatch(end_of_stream) {
                    DispatchStep::Wait => Outgoing::Wait,
                    DispatchStep::Send { next } => {
                        let connection = inner.connection.clone();
                        let released = inner.transition(next);
                        Outgoing::Send {
                            connection,
                            released,
                        }
                    }
                    DispatchStep::Discard => Outgoing::Discard,
                    DispatchStep::Reject if inner.aborted => Outgoing::Discard,
                    DispatchStep::Reject => Outgoing::Reject(inner.state),
                }
            };

            let (connection, released) = match step {
                Outgoing::Wait => {
                    changed.await;
                    continue;
                }
                Outgoing::Discard => {
                    tracing::debug!(
                        channel = %self.label,
                        message = message.kind_name(),
                        "discarding message for aborted channel"
                    );
                    return Ok(());
                }
                Outgoing::Reject(state) => {
                    return Err(MessagingError::InvalidState {
                        operation: "dispatch",
                        state,
                    });
                }
                Outgoing::Send {
                    connection,
                    released,
                } => (connection, released),
            };

            if end_of_stream {
                self.changed.notify_waiters();
            }
            let Some(connection) = connection else {
                return Ok(());
            };
            let sent = connection.send(message).await;
            self.finish(released).await;
            if let Err(err) = sent {
                self.on_send_failure(&err).await;
            }
            return Ok(());
        }
    }

    /// 接收下一条消息；`None` 表示入站方向已经结束。
    pub async fn receive(&self) -> Result<Option<Message>> {
        let _order = self.receive_order.lock().await;
        loop {
            let mut changed = pin!(self.changed.notified());
            changed.as_mut().enable();

            let step = {
                let mut inner = self.inner.lock();
                match inner.state.on_receive() {
                    ReceiveStep::Wait => Incoming::Wait,
                    ReceiveStep::Read => Incoming::Read(inner.connection.clone()),
                    ReceiveStep::Synthesize { next } => Incoming::Synthesized(inner.transition(next)),
                    ReceiveStep::Finished => Incoming::Finished,
                }
            };

            let connection = match step {
                Incoming::Wait => {
                    changed.await;
                    continue;
                }
                Incoming::Finished => return Ok(None),
                Incoming::Synthesized(released) => {
                    tracing::debug!(channel = %self.label, "delivering synthesized end of stream");
                    self.changed.notify_waiters();
                    self.finish(released).await;
                    return Ok(Some(Message::EndOfStream));
                }
                Incoming::Read(None) => return self.end_of_incoming_stream().await,
                Incoming::Read(Some(connection)) => connection,
            };

            match connection.receive().await {
                Ok(Some(message)) if !message.is_end_of_stream() => return Ok(Some(message)),
                Ok(Some(_)) | Ok(None) => {}
                Err(err) => tracing::debug!(
                    channel = %self.label,
                    error.code = err.code(),
                    error = %err,
                    "receive failed, treating as end of stream"
                ),
            }
            return self.end_of_incoming_stream().await;
        }
    }

    /// 强制进入收尾：挂起的接收得到 `EndOfStream`，挂起的发送被丢弃。
    pub async fn abort(&self) {
        let released = {
            let mut inner = self.inner.lock();
            if inner.state.is_stopped() {
                return;
            }
            inner.aborted = true;
            let next = inner.state.on_abort();
            inner.transition(next)
        };
        tracing::debug!(channel = %self.label, state = ?self.state(), "channel aborted");
        self.changed.notify_waiters();
        self.finish(released).await;
    }

    /// 等待进入 [`ChannelState::Stopped`]。
    pub async fn stopped(&self) {
        loop {
            let mut changed = pin!(self.changed.notified());
            changed.as_mut().enable();
            if self.state().is_stopped() {
                return;
            }
            changed.await;
        }
    }

    async fn end_of_incoming_stream(&self) -> Result<Option<Message>> {
        let released = {
            let mut inner = self.inner.lock();
            // 并发读者已交付过 EndOfStream。
            if matches!(
                inner.state,
                ChannelState::Stopped | ChannelState::AwaitOutgoingEndOfStream
            ) {
                return Ok(None);
            }
            let next = inner.state.on_end_of_stream_received();
            inner.transition(next)
        };
        tracing::debug!(channel = %self.label, state = ?self.state(), "incoming end of stream");
        self.changed.notify_waiters();
        self.finish(released).await;
        Ok(Some(Message::EndOfStream))
    }

    async fn on_send_failure(&self, err: &MessagingError) {
        let released = {
            let mut inner = self.inner.lock();
            inner.aborted = true;
            let next = inner.state.on_send_failure();
            inner.transition(next)
        };
        tracing::debug!(
            channel = %self.label,
            error.code = err.code(),
            error = %err,
            "send failed, generating incoming end of stream"
        );
        self.changed.notify_waiters();
        self.finish(released).await;
    }

    async fn finish(&self, released: Option<Arc<dyn Connection>>) {
        if let Some(connection) = released {
            tracing::debug!(channel = %self.label, peer = %connection.peer(), "closing connection");
            close_quietly(connection.as_ref()).await;
        }
    }
}
