//! 在一个监听端点上复用多条逻辑通道的连接器。

use std::{collections::HashMap, fmt, sync::Arc, time::Duration};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::runtime::Handle;

use crate::{
    address::{ChannelAddress, PhysicalAddress},
    channel::Channel,
    config::MessagingConfig,
    connection::{
        AcceptHandler, Connection, IncomingConnector, OutgoingConnector, close_quietly,
    },
    error::{MessagingError, Result},
    lifecycle::Stoppable,
    message::{ConnectRequest, Message},
};

#[derive(Default)]
struct Pending {
    next_sequence: u64,
    channels: HashMap<ChannelAddress, Channel>,
}

/// 等待对端连接的通道登记表；登记、认领与清空共用同一把锁。
#[derive(Default)]
struct PendingChannels {
    inner: Mutex<Pending>,
}

impl PendingChannels {
    fn register(&self, physical: &PhysicalAddress, stop_timeout: Duration, runtime: &Handle) -> Channel {
        let mut pending = self.inner.lock();
        let address = ChannelAddress::new(physical.clone(), pending.next_sequence);
        pending.next_sequence += 1;
        let channel = Channel::new(address.clone(), stop_timeout, runtime.clone());
        pending.channels.insert(address, channel.clone());
        channel
    }

    fn claim(&self, address: &ChannelAddress) -> Option<Channel> {
        self.inner.lock().channels.remove(address)
    }

    fn drain(&self) -> Vec<Channel> {
        self.inner.lock().channels.drain().map(|(_, channel)| channel).collect()
    }

    fn len(&self) -> usize {
        self.inner.lock().channels.len()
    }
}

/// 将入站连接按 `ConnectRequest.destination` 绑定到登记中的通道。
struct BindingHandler {
    pending: Arc<PendingChannels>,
}

#[async_trait]
impl AcceptHandler for BindingHandler {
    async fn on_connection(
        &self,
        request: ConnectRequest,
        connection: Arc<dyn Connection>,
    ) -> Result<()> {
        let Some(channel) = self.pending.claim(&request.destination) else {
            return Err(MessagingError::UnknownChannel {
                address: request.destination.to_string(),
            });
        };
        tracing::debug!(address = %request.destination, peer = %connection.peer(), "binding incoming connection");
        channel.connect(connection).await
    }
}

/// 多路复用连接器。
///
/// # 教案式注释
///
/// ## 意图 (Why)
/// - 监听方不必为每条逻辑通道开放一个端口：所有通道共享连接器的物理地址，
///   以 `!N` 后缀区分，对端在连接后第一条消息中声明要连接的通道。
///
/// ## 逻辑 (How)
/// - `listen` 在锁内分配单调递增的序号并登记通道，立即返回；
/// - 入站连接由 [`crate::connection::serve_connection`] 读出 `ConnectRequest`
///   后交给内部处理器，处理器在同一把锁内认领并移除登记，然后绑定；
/// - `connect` 建立物理连接、发送 `ConnectRequest` 并绑定到新通道。
///
/// ## 契约 (What)
/// - 登记与绑定一一对应，每条登记只会被认领一次；
/// - 未知的目标地址返回 [`MessagingError::UnknownChannel`]，连接被关闭，不重试；
/// - 停止时关闭监听端点，仍在等待的通道被中止。
pub struct MultiChannelConnector {
    incoming: Arc<dyn IncomingConnector>,
    outgoing: Arc<dyn OutgoingConnector>,
    local: PhysicalAddress,
    pending: Arc<PendingChannels>,
    stop_timeout: Duration,
    runtime: Handle,
}

impl fmt::Debug for MultiChannelConnector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MultiChannelConnector")
            .field("local", &self.local.to_string())
            .field("pending", &self.pending.len())
            .finish()
    }
}

impl MultiChannelConnector {
    /// 注册接入处理器并记录实际监听地址。
    pub async fn start(
        incoming: Arc<dyn IncomingConnector>,
        outgoing: Arc<dyn OutgoingConnector>,
        config: &MessagingConfig,
    ) -> Result<Self> {
        config.validate()?;
        let pending = Arc::new(PendingChannels::default());
        let local = incoming
            .accept(Arc::new(BindingHandler {
                pending: Arc::clone(&pending),
            }))
            .await?;
        tracing::info!(address = %local, "messaging connector started");
        Ok(Self {
            incoming,
            outgoing,
            local,
            pending,
            stop_timeout: config.stop_timeout(),
            runtime: Handle::current(),
        })
    }

    pub fn local_address(&self) -> &PhysicalAddress {
        &self.local
    }

    /// 创建一条等待对端连接的通道。
    pub fn listen(&self) -> Channel {
        let channel = self.pending.register(&self.local, self.stop_timeout, &self.runtime);
        tracing::debug!(address = %channel.address(), "channel awaiting connection");
        channel
    }

    /// 连接到对端登记的通道。
    pub async fn connect(&self, destination: &ChannelAddress) -> Result<Channel> {
        let connection = self.outgoing.connect(destination.physical()).await?;
        let request = ConnectRequest {
            destination: destination.clone(),
            source: None,
        };
        if let Err(err) = connection.send(Message::ConnectRequest(request)).await {
            close_quietly(connection.as_ref()).await;
            return Err(err);
        }
        let channel = Channel::new(destination.clone(), self.stop_timeout, self.runtime.clone());
        channel.connect(connection).await?;
        tracing::debug!(address = %destination, "channel connected to peer");
        Ok(channel)
    }

    /// 仍在等待对端连接的通道数量。
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }
}

#[async_trait]
impl Stoppable for MultiChannelConnector {
    async fn stop(&self) -> Result<()> {
        let stopped = self.incoming.stop().await;
        let abandoned = self.pending.drain();
        if !abandoned.is_empty() {
            tracing::debug!(address = %self.local, count = abandoned.len(), "aborting unclaimed channels");
        }
        for channel in abandoned {
            channel.abort().await;
        }
        stopped
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::MemoryNetwork;

    async fn connector(network: &MemoryNetwork, name: &str) -> MultiChannelConnector {
        MultiChannelConnector::start(
            Arc::new(network.listener(name)),
            Arc::new(network.clone()),
            &MessagingConfig::default(),
        )
        .await
        .expect("连接器启动")
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn listen_mints_increasing_addresses() {
        let network = MemoryNetwork::new();
        let connector = connector(&network, "server").await;
        let first = connector.listen();
        let second = connector.listen();
        assert_eq!(first.address().to_string(), "channel:memory://server!0");
        assert_eq!(second.address().to_string(), "channel:memory://server!1");
        assert_eq!(connector.pending_count(), 2);
    }

    #[tokio::test(flavor = "multi_thread")]
    #[tracing_test::traced_test]
    async fn unknown_destination_is_rejected_and_logged() {
        let network = MemoryNetwork::new();
        let server = connector(&network, "server").await;
        let client = connector(&network, "client").await;
        let registered = server.listen();

        let bogus = ChannelAddress::new(server.local_address().clone(), 41);
        let channel = client.connect(&bogus).await.expect("物理连接本身可以建立");
        assert_eq!(
            channel.receive().await.expect("读取"),
            Some(Message::EndOfStream),
            "监听方关闭连接后本端收到 EndOfStream"
        );
        assert!(logs_contain("no pending channel registered"));
        assert!(logs_contain("spark.messaging.protocol.unknown_channel"));
        assert_eq!(server.pending_count(), 1, "无关登记不受影响");
        assert_eq!(registered.state(), crate::connection::ChannelState::AwaitConnect);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn stop_aborts_unclaimed_channels() {
        let network = MemoryNetwork::new();
        let connector = connector(&network, "server").await;
        let channel = connector.listen();
        connector.stop().await.expect("停止");

        assert_eq!(connector.pending_count(), 0);
        assert_eq!(channel.receive().await.expect("读取"), Some(Message::EndOfStream));
        assert!(
            network
                .connect(&PhysicalAddress::memory("server"))
                .await
                .is_err(),
            "停止后不再接受连接"
        );
    }
}
