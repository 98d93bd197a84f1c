use crate::{
    connection::{SocketSettings, TcpConnection},
    error::{ACCEPT, BIND, map_io_error},
};
use async_trait::async_trait;
use parking_lot::Mutex;
use spark_messaging::{
    MessagingConfig, MessagingError, PhysicalAddress, Result,
    connection::{AcceptHandler, IncomingConnector, serve_connection},
};
use std::{sync::Arc, time::Duration};
use tokio::{net::TcpListener, task::JoinHandle};
use tracing::Instrument;

/// 接受失败（如文件描述符耗尽）后的退避时长。
const ACCEPT_BACKOFF: Duration = Duration::from_millis(50);

/// 基于 Tokio `TcpListener` 的入站端点。
///
/// # 教案式注释
///
/// ## 意图 (Why)
/// - 为 [`spark_messaging::MultiChannelConnector`] 提供“绑定 → 循环接受”的最小能力，
///   首条消息的解析交给 [`serve_connection`]，本类型只关心套接字。
///
/// ## 逻辑 (How)
/// - `accept` 按配置的 `bind_host`/`bind_port` 绑定，读取内核实际分配的地址后
///   启动接受循环任务；
/// - 每个接入的套接字在独立任务中完成握手，慢速对端不会阻塞接受循环；
/// - `stop` 终止接受循环并释放监听套接字。
///
/// ## 契约 (What)
/// - 同一实例只能 `accept` 一次，重复调用返回 [`MessagingError::InvalidConfiguration`]；
/// - 绑定失败以 `spark.messaging.tcp.bind_failed` 同步返回，不做重试；
/// - 已交给处理器的连接不受 `stop` 影响。
///
/// ## 注意事项 (Trade-offs)
/// - 接受失败以 `warn` 记录后固定退避 50ms 再继续，不区分错误类别。
#[derive(Debug)]
pub struct TcpIncomingConnector {
    host: String,
    port: u16,
    settings: SocketSettings,
    accept_loop: Mutex<Option<JoinHandle<()>>>,
}

impl TcpIncomingConnector {
    pub fn new(config: &MessagingConfig) -> Self {
        Self {
            host: config.bind_host.clone(),
            port: config.bind_port,
            settings: SocketSettings::from(config),
            accept_loop: Mutex::new(None),
        }
    }

    /// 接受循环是否仍在运行。
    pub fn is_accepting(&self) -> bool {
        self.accept_loop
            .lock()
            .as_ref()
            .is_some_and(|task| !task.is_finished())
    }
}

#[async_trait]
impl IncomingConnector for TcpIncomingConnector {
    async fn accept(&self, handler: Arc<dyn AcceptHandler>) -> Result<PhysicalAddress> {
        if self.accept_loop.lock().is_some() {
            return Err(MessagingError::InvalidConfiguration(
                "tcp incoming connector is already accepting".to_owned(),
            ));
        }
        let listener = TcpListener::bind((self.host.as_str(), self.port))
            .await
            .map_err(|err| map_io_error(BIND, err))?;
        let local = listener
            .local_addr()
            .map_err(|err| map_io_error(BIND, err))?;
        let address = PhysicalAddress::from(local);

        let task = tokio::spawn(
            accept_loop(listener, handler, self.settings)
                .instrument(tracing::debug_span!("tcp_accept", address = %address)),
        );
        let mut slot = self.accept_loop.lock();
        if slot.is_some() {
            task.abort();
            return Err(MessagingError::InvalidConfiguration(
                "tcp incoming connector is already accepting".to_owned(),
            ));
        }
        *slot = Some(task);
        tracing::debug!(address = %address, "tcp listener bound");
        Ok(address)
    }

    async fn stop(&self) -> Result<()> {
        let task = self.accept_loop.lock().take();
        if let Some(task) = task {
            task.abort();
            match task.await {
                Ok(()) => {}
                Err(err) if err.is_cancelled() => {}
                Err(err) => return Err(MessagingError::Task(err.to_string())),
            }
            tracing::debug!("tcp accept loop stopped");
        }
        Ok(())
    }
}

async fn accept_loop(listener: TcpListener, handler: Arc<dyn AcceptHandler>, settings: SocketSettings) {
    loop {
        match listener.accept().await {
            Ok((stream, peer)) => match TcpConnection::from_stream(stream, settings) {
                Ok(connection) => {
                    tracing::debug!(peer = %peer, "tcp connection accepted");
                    tokio::spawn(
                        serve_connection(Arc::new(connection), Arc::clone(&handler))
                            .in_current_span(),
                    );
                }
                Err(err) => {
                    tracing::warn!(peer = %peer, error.code = err.code(), error = %err, "failed to configure accepted socket");
                }
            },
            Err(err) => {
                let err = map_io_error(ACCEPT, err);
                tracing::warn!(error.code = err.code(), error = %err, "tcp accept failed");
                tokio::time::sleep(ACCEPT_BACKOFF).await;
            }
        }
    }
}
