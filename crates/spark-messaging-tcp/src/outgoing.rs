use crate::{
    connection::{SocketSettings, TcpConnection},
    error::{CONNECT, map_io_error},
};
use async_trait::async_trait;
use spark_messaging::{
    MessagingConfig, MessagingError, PhysicalAddress, Result,
    connection::{Connection, OutgoingConnector},
};
use std::sync::Arc;
use tokio::net::TcpStream;

/// 拨号到 `tcp://host:port` 的出站端点。
///
/// 对端不可达时返回 `spark.messaging.tcp.connect_failed`；非 `tcp` 地址返回
/// [`MessagingError::InvalidAddress`]。两者都不重试。
#[derive(Clone, Debug)]
pub struct TcpOutgoingConnector {
    settings: SocketSettings,
}

impl TcpOutgoingConnector {
    pub fn new(config: &MessagingConfig) -> Self {
        Self {
            settings: SocketSettings::from(config),
        }
    }
}

#[async_trait]
impl OutgoingConnector for TcpOutgoingConnector {
    async fn connect(&self, address: &PhysicalAddress) -> Result<Arc<dyn Connection>> {
        let Some((host, port)) = address.as_tcp() else {
            return Err(MessagingError::InvalidAddress {
                address: address.to_string(),
                reason: format!("tcp transport cannot reach `{}` addresses", address.scheme()),
            });
        };
        let stream = TcpStream::connect((host, port))
            .await
            .map_err(|err| map_io_error(CONNECT, err))?;
        let connection = TcpConnection::from_stream(stream, self.settings)?;
        tracing::debug!(address = %address, "tcp connection established");
        Ok(Arc::new(connection))
    }
}
