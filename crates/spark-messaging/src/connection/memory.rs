use std::{
    collections::HashMap,
    fmt, io,
    pin::pin,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{Mutex as AsyncMutex, Notify, mpsc};
use tracing::Instrument;

use super::{AcceptHandler, Connection, IncomingConnector, OutgoingConnector, serve_connection};
use crate::{
    address::PhysicalAddress,
    error::{MessagingError, Result},
    message::Message,
};

const CONNECT_FAILED: &str = "spark.messaging.memory.connect_failed";
const SEND_FAILED: &str = "spark.messaging.memory.send_failed";

/// 进程内的双工连接，两端各持一个。
///
/// 任一端关闭后，两端的 `send` 都会失败；对端在读完已送达的消息后收到 `None`。
pub struct MemoryConnection {
    label: String,
    outgoing: Mutex<Option<mpsc::UnboundedSender<Message>>>,
    incoming: AsyncMutex<mpsc::UnboundedReceiver<Message>>,
    closed: Arc<AtomicBool>,
    peer_closed: Arc<AtomicBool>,
    closing: Notify,
    close_calls: AtomicUsize,
}

impl fmt::Debug for MemoryConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryConnection")
            .field("label", &self.label)
            .field("closed", &self.closed.load(Ordering::Acquire))
            .finish()
    }
}

impl MemoryConnection {
    /// 创建一对互连的连接。
    pub fn pair(left: &str, right: &str) -> (Arc<Self>, Arc<Self>) {
        let (to_right, from_left) = mpsc::unbounded_channel();
        let (to_left, from_right) = mpsc::unbounded_channel();
        let left_closed = Arc::new(AtomicBool::new(false));
        let right_closed = Arc::new(AtomicBool::new(false));
        let (left_label, right_label) = (format!("{left}->{right}"), format!("{right}->{left}"));
        let left = Arc::new(Self {
            label: left_label,
            outgoing: Mutex::new(Some(to_right)),
            incoming: AsyncMutex::new(from_right),
            closed: Arc::clone(&left_closed),
            peer_closed: Arc::clone(&right_closed),
            closing: Notify::new(),
            close_calls: AtomicUsize::new(0),
        });
        let right = Arc::new(Self {
            label: right_label,
            outgoing: Mutex::new(Some(to_left)),
            incoming: AsyncMutex::new(from_left),
            closed: right_closed,
            peer_closed: left_closed,
            closing: Notify::new(),
            close_calls: AtomicUsize::new(0),
        });
        (left, right)
    }

    /// `close` 被调用的次数。
    pub fn close_count(&self) -> usize {
        self.close_calls.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

#[async_trait]
impl Connection for MemoryConnection {
    async fn send(&self, message: Message) -> Result<()> {
        if self.closed.load(Ordering::Acquire) || self.peer_closed.load(Ordering::Acquire) {
            return Err(broken_pipe());
        }
        match self.outgoing.lock().as_ref() {
            Some(sender) => sender.send(message).map_err(|_| broken_pipe()),
            None => Err(broken_pipe()),
        }
    }

    async fn receive(&self) -> Result<Option<Message>> {
        let mut incoming = self.incoming.lock().await;
        let mut closing = pin!(self.closing.notified());
        closing.as_mut().enable();
        if self.closed.load(Ordering::Acquire) {
            return Ok(None);
        }
        tokio::select! {
            message = incoming.recv() => Ok(message),
            _ = closing => Ok(None),
        }
    }

    async fn close(&self) -> Result<()> {
        self.close_calls.fetch_add(1, Ordering::SeqCst);
        self.closed.store(true, Ordering::Release);
        self.outgoing.lock().take();
        self.closing.notify_waiters();
        Ok(())
    }

    fn peer(&self) -> String {
        self.label.clone()
    }
}

fn broken_pipe() -> MessagingError {
    MessagingError::transport(
        SEND_FAILED,
        "memory send",
        io::Error::from(io::ErrorKind::BrokenPipe),
    )
}

/// 进程内网络：按名字登记监听端点。
#[derive(Clone, Default)]
pub struct MemoryNetwork {
    endpoints: Arc<Mutex<HashMap<String, Arc<dyn AcceptHandler>>>>,
}

impl fmt::Debug for MemoryNetwork {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryNetwork")
            .field("endpoints", &self.endpoints.lock().keys().cloned().collect::<Vec<_>>())
            .finish()
    }
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// 以 `memory://<name>` 监听的入站端点。
    pub fn listener(&self, name: impl Into<String>) -> MemoryIncomingConnector {
        MemoryIncomingConnector {
            network: self.clone(),
            name: name.into(),
        }
    }
}

#[async_trait]
impl OutgoingConnector for MemoryNetwork {
    async fn connect(&self, address: &PhysicalAddress) -> Result<Arc<dyn Connection>> {
        let PhysicalAddress::Memory { name } = address else {
            return Err(MessagingError::InvalidAddress {
                address: address.to_string(),
                reason: format!("memory transport cannot reach `{}` addresses", address.scheme()),
            });
        };
        let handler = self.endpoints.lock().get(name).cloned().ok_or_else(|| {
            MessagingError::transport(
                CONNECT_FAILED,
                "memory connect",
                io::Error::from(io::ErrorKind::ConnectionRefused),
            )
        })?;

        let (client, server) = MemoryConnection::pair("client", name);
        // 接入处理沿用调用方的 span，便于按请求关联日志。
        tokio::spawn(serve_connection(server, handler).instrument(tracing::Span::current()));
        Ok(client)
    }
}

/// [`MemoryNetwork`] 上的一个监听端点。
#[derive(Debug)]
pub struct MemoryIncomingConnector {
    network: MemoryNetwork,
    name: String,
}

#[async_trait]
impl IncomingConnector for MemoryIncomingConnector {
    async fn accept(&self, handler: Arc<dyn AcceptHandler>) -> Result<PhysicalAddress> {
        let address = PhysicalAddress::memory(self.name.clone());
        let mut endpoints = self.network.endpoints.lock();
        if endpoints.contains_key(&self.name) {
            return Err(MessagingError::InvalidAddress {
                address: address.to_string(),
                reason: "endpoint is already bound".to_owned(),
            });
        }
        endpoints.insert(self.name.clone(), handler);
        tracing::debug!(address = %address, "memory endpoint bound");
        Ok(address)
    }

    async fn stop(&self) -> Result<()> {
        self.network.endpoints.lock().remove(&self.name);
        Ok(())
    }
}
