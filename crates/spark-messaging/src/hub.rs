//! 在一条 [`Channel`] 上承载多条键控消息流。

use std::{
    collections::HashMap,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use parking_lot::RwLock;

use crate::{
    channel::Channel,
    config::MessagingConfig,
    dispatch::{
        AsyncDispatch, AsyncReceive, ChannelMessageMarshallingDispatch,
        ChannelMessageUnmarshallingDispatch, Dispatch, EndOfStreamFilter,
    },
    error::{MessagingError, Result},
    lifecycle::{AsyncStoppable, CompositeStoppable, Stoppable},
    message::{ChannelKey, ChannelMessage, ChannelTarget, Message},
};

type Handler = Arc<dyn Dispatch<Message>>;
type Outgoing = ChannelMessageMarshallingDispatch<Arc<AsyncDispatch<Message>>>;

/// 按通道键路由入站消息。
#[derive(Default)]
struct Routes {
    handlers: RwLock<HashMap<ChannelKey, Handler>>,
}

impl Routes {
    /// 入站流结束时通知所有处理器。
    fn end_of_stream(&self) {
        let handlers: Vec<(ChannelKey, Handler)> = self
            .handlers
            .read()
            .iter()
            .map(|(key, handler)| (key.clone(), Arc::clone(handler)))
            .collect();
        for (key, handler) in handlers {
            if let Err(err) = handler.dispatch(Message::EndOfStream) {
                tracing::warn!(channel_key = %key, error = %err, "handler rejected end of stream");
            }
        }
    }
}

impl Dispatch<Message> for Routes {
    fn dispatch(&self, message: Message) -> Result<()> {
        let (key, payload) = match message {
            Message::ChannelMessage(ChannelMessage {
                channel: ChannelTarget::Key(key),
                payload,
            }) => (key, payload),
            other => {
                tracing::warn!(message = other.kind_name(), "dropping message without channel key");
                return Ok(());
            }
        };
        let handler = self.handlers.read().get(&key).cloned();
        match handler {
            Some(handler) => handler.dispatch(*payload),
            None => {
                tracing::warn!(channel_key = %key, "dropping message for unregistered channel key");
                Ok(())
            }
        }
    }
}

/// 把发往某个键的消息包装为 `ChannelMessage`。
struct KeyedOutgoing {
    key: ChannelKey,
    outgoing: Arc<Outgoing>,
}

impl Dispatch<Message> for KeyedOutgoing {
    fn dispatch(&self, message: Message) -> Result<()> {
        self.outgoing
            .dispatch(Message::ChannelMessage(ChannelMessage::keyed(self.key.clone(), message)))
    }
}

struct ChannelStopped(Channel);

#[async_trait]
impl Stoppable for ChannelStopped {
    async fn stop(&self) -> Result<()> {
        self.0.stopped().await;
        Ok(())
    }
}

/// [`MessageHub`] 的构造器。
#[derive(Default)]
pub struct MessageHubBuilder {
    handlers: Vec<(ChannelKey, Handler)>,
}

impl MessageHubBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// 在开始接收之前登记处理器，避免首批消息因未登记而被丢弃。
    pub fn with_handler(mut self, key: ChannelKey, handler: Handler) -> Self {
        self.handlers.push((key, handler));
        self
    }

    /// 在给定通道上启动收发工作任务；必须在 Tokio 运行时中调用。
    pub fn start(self, channel: Channel, config: &MessagingConfig) -> MessageHub {
        let routes = Arc::new(Routes::default());
        routes.handlers.write().extend(self.handlers);

        let queue = Arc::new(AsyncDispatch::start(Arc::new(channel.clone())));
        let outgoing = Arc::new(ChannelMessageMarshallingDispatch::new(Arc::clone(&queue)));

        let on_end_of_stream = Arc::clone(&routes);
        let incoming = Arc::new(EndOfStreamFilter::new(Arc::clone(&routes), move || {
            on_end_of_stream.end_of_stream()
        }));
        let receive = Arc::new(AsyncReceive::start(
            Arc::new(channel.clone()),
            ChannelMessageUnmarshallingDispatch::new(Arc::clone(&incoming)),
        ));

        let stoppables = CompositeStoppable::new();
        stoppables
            .add(queue.clone())
            .add(incoming)
            .add(receive)
            .add(Arc::new(ChannelStopped(channel.clone())));

        tracing::debug!(channel = %channel.address(), "message hub started");
        MessageHub {
            channel,
            queue,
            outgoing,
            routes,
            stoppables,
            stop_requested: AtomicBool::new(false),
            stop_timeout: config.stop_timeout(),
        }
    }
}

/// 键控消息流的多路复用器。
///
/// # 教案式注释
///
/// ## 意图 (Why)
/// - 多个子系统（日志、进度、结果等）共享一条通道，各自以 [`ChannelKey`] 区分，
///   线上只为每个键传输一次键名。
///
/// ## 逻辑 (How)
/// - 出站：`KeyedOutgoing` → [`ChannelMessageMarshallingDispatch`] →
///   [`AsyncDispatch`] → [`Channel`]；
/// - 入站：[`AsyncReceive`] → [`ChannelMessageUnmarshallingDispatch`] →
///   [`EndOfStreamFilter`] → 按键路由；
/// - 所有部件登记在一个 [`CompositeStoppable`] 中统一停止。
///
/// ## 契约 (What)
/// - 同一个键上的消息按分发顺序送达；
/// - 未登记键的入站消息以 `warn` 记录后丢弃；
/// - 对端结束后每个处理器收到一条 `EndOfStream`；
/// - `stop` 发送本端 `EndOfStream`，等待对端结束与通道停止，受停机时限约束。
pub struct MessageHub {
    channel: Channel,
    queue: Arc<AsyncDispatch<Message>>,
    outgoing: Arc<Outgoing>,
    routes: Arc<Routes>,
    stoppables: CompositeStoppable,
    stop_requested: AtomicBool,
    stop_timeout: Duration,
}

impl MessageHub {
    pub fn builder() -> MessageHubBuilder {
        MessageHubBuilder::new()
    }

    pub fn channel(&self) -> &Channel {
        &self.channel
    }

    /// 返回发往 `key` 的分发端。
    pub fn outgoing(&self, key: ChannelKey) -> Arc<dyn Dispatch<Message>> {
        Arc::new(KeyedOutgoing {
            key,
            outgoing: Arc::clone(&self.outgoing),
        })
    }

    /// 登记或替换 `key` 的入站处理器。
    pub fn add_handler(&self, key: ChannelKey, handler: Handler) {
        self.routes.handlers.write().insert(key, handler);
    }
}

impl AsyncStoppable for MessageHub {
    fn request_stop(&self) {
        if self.stop_requested.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Err(err) = self.queue.dispatch(Message::EndOfStream) {
            tracing::debug!(channel = %self.channel.address(), error = %err, "outgoing queue already closed");
        }
        self.queue.request_stop();
    }
}

#[async_trait]
impl Stoppable for MessageHub {
    async fn stop(&self) -> Result<()> {
        self.request_stop();
        match tokio::time::timeout(self.stop_timeout, self.stoppables.stop()).await {
            Ok(result) => result,
            Err(_) => {
                self.channel.abort().await;
                Err(MessagingError::ShutdownTimeout {
                    target: format!("message hub on {}", self.channel.address()),
                    timeout: self.stop_timeout,
                })
            }
        }
    }
}
