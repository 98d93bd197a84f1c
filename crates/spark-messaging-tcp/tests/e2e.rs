//! 回环 TCP 上的端到端用例。
//!
//! # 教案级说明
//! - 与进程内网络的用例互补：这里验证真实套接字下的分帧、握手与半关闭；
//! - 所有端点绑定 `127.0.0.1:0`，由内核分配端口，避免并行用例互相冲突。

use std::{sync::Arc, time::Duration};

use anyhow::{Context, Result, anyhow};
use spark_messaging::{
    Channel, ChannelAddress, ChannelKey, Message, MessageHub, MessagingConfig, MessagingError,
    Payload, PhysicalAddress, Stoppable,
    connection::{ChannelState, OutgoingConnector},
    dispatch::{Dispatch, FnDispatch},
};
use spark_messaging_tcp::{TcpOutgoingConnector, start_connector};
use tokio::sync::mpsc;

const STEP: Duration = Duration::from_secs(5);

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("spark_messaging=debug,spark_messaging_tcp=debug")
        .with_test_writer()
        .try_init();
}

fn config() -> MessagingConfig {
    MessagingConfig::default().with_stop_timeout(STEP)
}

async fn next(channel: &Channel) -> Result<Option<Message>> {
    tokio::time::timeout(STEP, channel.receive())
        .await
        .map_err(|_| anyhow!("等待 {} 上的消息超时", channel.address()))?
        .map_err(Into::into)
}

#[tokio::test(flavor = "multi_thread")]
async fn listen_connect_exchange_and_stop() -> Result<()> {
    init_tracing();
    let server = start_connector(&config()).await?;
    let client = start_connector(&config()).await?;
    assert_eq!(server.local_address().scheme(), "tcp");

    let listening = server.listen();
    let rendered = listening.address().to_string();
    assert!(rendered.starts_with("channel:tcp://127.0.0.1:"), "地址格式: {rendered}");
    assert!(rendered.ends_with("!0"), "首个通道序号为 0: {rendered}");

    let destination: ChannelAddress = rendered.parse().context("地址可解析")?;
    let calling = client.connect(&destination).await?;
    for index in 0..8u8 {
        calling.dispatch(Message::from(Payload::new("seq", vec![index; 3]))).await?;
    }
    for index in 0..8u8 {
        assert_eq!(
            next(&listening).await?,
            Some(Message::from(Payload::new("seq", vec![index; 3])))
        );
    }

    listening.dispatch(Message::from(Payload::new("reply", &b"done"[..]))).await?;
    assert_eq!(
        next(&calling).await?,
        Some(Message::from(Payload::new("reply", &b"done"[..])))
    );

    let (left, right) = tokio::join!(calling.stop(), listening.stop());
    left?;
    right?;
    assert_eq!(calling.state(), ChannelState::Stopped);
    assert_eq!(listening.state(), ChannelState::Stopped);

    server.stop().await?;
    client.stop().await?;
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn unknown_channel_closes_the_connection() -> Result<()> {
    init_tracing();
    let server = start_connector(&config()).await?;
    let client = start_connector(&config()).await?;
    let _registered = server.listen();

    let bogus = ChannelAddress::new(server.local_address().clone(), 99);
    let channel = client.connect(&bogus).await?;
    assert_eq!(next(&channel).await?, Some(Message::EndOfStream), "监听方拒绝后连接被关闭");
    assert_eq!(next(&channel).await?, None);
    assert_eq!(server.pending_count(), 1);
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn unreachable_and_foreign_addresses_fail_synchronously() -> Result<()> {
    init_tracing();
    let outgoing = TcpOutgoingConnector::new(&config());

    // 先绑定再释放，得到一个几乎必然无人监听的端口。
    let port = {
        let probe = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
        probe.local_addr()?.port()
    };
    let err = outgoing
        .connect(&PhysicalAddress::tcp("127.0.0.1", port))
        .await
        .err()
        .context("无人监听时应失败")?;
    assert_eq!(err.code(), "spark.messaging.tcp.connect_failed");

    let err = outgoing
        .connect(&PhysicalAddress::memory("elsewhere"))
        .await
        .err()
        .context("协议不匹配时应失败")?;
    assert!(matches!(err, MessagingError::InvalidAddress { .. }));
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn hubs_multiplex_keyed_streams_over_tcp() -> Result<()> {
    init_tracing();
    let server = start_connector(&config()).await?;
    let client = start_connector(&config()).await?;

    let key = ChannelKey::new("progress").context("非空键")?;
    let (sender, mut received) = mpsc::unbounded_channel();
    let handler: Arc<dyn Dispatch<Message>> = Arc::new(FnDispatch::new(move |message: Message| {
        sender.send(message).map_err(|_| MessagingError::Stopped)
    }));

    let listening = server.listen();
    let calling = client.connect(listening.address()).await?;
    let receiving = MessageHub::builder()
        .with_handler(key.clone(), handler)
        .start(listening, &config());
    let sending = MessageHub::builder().start(calling, &config());

    let outgoing = sending.outgoing(key);
    for step in ["configure", "build", "test"] {
        outgoing.dispatch(Message::from(Payload::encode_json("step", &step)?))?;
    }

    for expected in ["configure", "build", "test"] {
        let message = tokio::time::timeout(STEP, received.recv())
            .await
            .context("等待键控消息")?
            .context("处理器已释放")?;
        let Message::Payload(payload) = message else {
            return Err(anyhow!("期望 Payload，收到 {}", message.kind_name()));
        };
        assert_eq!(payload.decode_json::<String>()?, expected);
    }

    let (left, right) = tokio::join!(sending.stop(), receiving.stop());
    left?;
    right?;
    server.stop().await?;
    client.stop().await?;
    Ok(())
}
