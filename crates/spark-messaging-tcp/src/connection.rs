use crate::error::{CONFIGURE, READ, SHUTDOWN, WRITE, is_disconnect, map_io_error};
use async_trait::async_trait;
use bytes::BytesMut;
use socket2::SockRef;
use spark_messaging::{
    MessagingConfig, MessagingError, PhysicalAddress, Result,
    codec::{self, FRAME_HEADER_LEN},
    connection::Connection,
    message::Message,
};
use std::{
    fmt, io,
    net::{Shutdown as StdShutdown, SocketAddr},
    pin::pin,
    sync::atomic::{AtomicBool, Ordering},
};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{
        TcpStream,
        tcp::{OwnedReadHalf, OwnedWriteHalf},
    },
    sync::{Mutex as AsyncMutex, Notify},
};

/// 每条连接共用的套接字参数。
#[derive(Clone, Copy, Debug)]
pub(crate) struct SocketSettings {
    pub nodelay: bool,
    pub max_frame_size: usize,
}

impl From<&MessagingConfig> for SocketSettings {
    fn from(config: &MessagingConfig) -> Self {
        Self {
            nodelay: config.tcp_nodelay,
            max_frame_size: config.max_frame_size,
        }
    }
}

/// 以 `u32` 大端长度前缀分帧的 TCP 消息连接。
///
/// # 教案式注释
///
/// ## 意图 (Why)
/// - 消息层要求收发可以并发进行：接收任务长期阻塞在读上，而发送方随时写入，
///   因此把 `TcpStream` 拆成独立的读/写半部，各自由 `tokio::sync::Mutex` 串行化。
///
/// ## 逻辑 (How)
/// - `send`：先在锁外完成编码与帧长校验，再持写锁一次性写出整帧；
/// - `receive`：读 4 字节长度、校验上限、读帧体并解码；在帧边界读到 EOF 视为
///   流正常结束，帧内 EOF 视为读错误；
/// - `close`：以 `socket2` 对写方向执行半关闭，并唤醒阻塞中的读者。
///
/// ## 契约 (What)
/// - `close` 幂等，之后的 `send` 返回写错误，`receive` 返回 `Ok(None)`；
/// - 超过 `max_frame_size` 的帧在两个方向上都以
///   [`MessagingError::FrameTooLarge`] 拒绝。
///
/// ## 注意事项 (Trade-offs)
/// - 被 `close` 打断的读取会丢弃已读出的半帧，连接此后不可再读。
pub struct TcpConnection {
    reader: AsyncMutex<OwnedReadHalf>,
    writer: AsyncMutex<Option<OwnedWriteHalf>>,
    peer: SocketAddr,
    max_frame_size: usize,
    closed: AtomicBool,
    closing: Notify,
}

impl fmt::Debug for TcpConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TcpConnection")
            .field("peer", &self.peer)
            .field("closed", &self.closed.load(Ordering::Acquire))
            .finish()
    }
}

impl TcpConnection {
    pub(crate) fn from_stream(stream: TcpStream, settings: SocketSettings) -> Result<Self> {
        stream
            .set_nodelay(settings.nodelay)
            .map_err(|err| map_io_error(CONFIGURE, err))?;
        let peer = stream
            .peer_addr()
            .map_err(|err| map_io_error(CONFIGURE, err))?;
        let (reader, writer) = stream.into_split();
        Ok(Self {
            reader: AsyncMutex::new(reader),
            writer: AsyncMutex::new(Some(writer)),
            peer,
            max_frame_size: settings.max_frame_size,
            closed: AtomicBool::new(false),
            closing: Notify::new(),
        })
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

#[async_trait]
impl Connection for TcpConnection {
    async fn send(&self, message: Message) -> Result<()> {
        let frame = codec::encode_frame(&message, self.max_frame_size)?;
        let mut writer = self.writer.lock().await;
        let Some(writer) = writer.as_mut() else {
            return Err(map_io_error(WRITE, io::Error::from(io::ErrorKind::BrokenPipe)));
        };
        writer
            .write_all(&frame)
            .await
            .map_err(|err| map_io_error(WRITE, err))?;
        writer.flush().await.map_err(|err| map_io_error(WRITE, err))
    }

    async fn receive(&self) -> Result<Option<Message>> {
        let mut reader = self.reader.lock().await;
        let mut closing = pin!(self.closing.notified());
        closing.as_mut().enable();
        if self.closed.load(Ordering::Acquire) {
            return Ok(None);
        }
        tokio::select! {
            frame = read_frame(&mut reader, self.max_frame_size) => frame,
            _ = closing => Ok(None),
        }
    }

    async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.closing.notify_waiters();
        let writer = self.writer.lock().await.take();
        let Some(writer) = writer else {
            return Ok(());
        };
        match sync_shutdown(&writer, StdShutdown::Write) {
            Ok(()) => Ok(()),
            Err(err) if is_disconnect(&err) => {
                tracing::debug!(peer = %self.peer, error = %err, "peer already disconnected");
                Ok(())
            }
            Err(err) => Err(map_io_error(SHUTDOWN, err)),
        }
    }

    fn peer(&self) -> String {
        PhysicalAddress::from(self.peer).to_string()
    }
}

fn sync_shutdown(writer: &OwnedWriteHalf, direction: StdShutdown) -> io::Result<()> {
    let stream: &TcpStream = writer.as_ref();
    SockRef::from(stream).shutdown(direction)
}

/// 读取一帧；在帧边界遇到 EOF 时返回 `None`。
async fn read_frame(reader: &mut OwnedReadHalf, max_frame_size: usize) -> Result<Option<Message>> {
    let mut header = [0u8; FRAME_HEADER_LEN];
    let mut filled = 0;
    while filled < FRAME_HEADER_LEN {
        let read = reader
            .read(&mut header[filled..])
            .await
            .map_err(|err| map_io_error(READ, err))?;
        if read == 0 {
            if filled == 0 {
                return Ok(None);
            }
            return Err(map_io_error(
                READ,
                io::Error::new(io::ErrorKind::UnexpectedEof, "connection closed inside frame header"),
            ));
        }
        filled += read;
    }

    let length = u32::from_be_bytes(header) as usize;
    codec::check_frame_length(length, max_frame_size)?;
    let mut body = BytesMut::zeroed(length);
    reader
        .read_exact(&mut body)
        .await
        .map_err(|err| map_io_error(READ, err))?;
    codec::decode(body.freeze()).map(Some)
}
