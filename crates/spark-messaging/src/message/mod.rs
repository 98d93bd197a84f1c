//! 线上传输的消息模型。
//!
//! 每个变体在线协议中占用一个判别字节，参见 [`crate::codec`]。

mod failure;

use std::fmt;

use bytes::Bytes;
use serde::{Serialize, de::DeserializeOwned};

use crate::{address::ChannelAddress, error::Result};

pub use failure::{FailureRegistry, Reconstruction, RemoteError, RemoteFailure};

/// 命名消息中心内一条键控流的非空字符串。
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChannelKey(String);

impl ChannelKey {
    /// 构造通道键；空串不是合法的键。
    pub fn new(key: impl Into<String>) -> Option<Self> {
        let key = key.into();
        (!key.is_empty()).then_some(Self(key))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ChannelKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// `ChannelMessage` 的寻址方式：驻留前使用键，驻留后使用紧凑 id。
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum ChannelTarget {
    Key(ChannelKey),
    Id(u32),
}

/// 建连握手：呼叫方在新连接上发送的第一条消息。
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConnectRequest {
    pub destination: ChannelAddress,
    pub source: Option<ChannelAddress>,
}

/// 声明 `key → id` 的绑定，总是先于该 id 的第一条 `ChannelMessage`。
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChannelMetaInfo {
    pub key: ChannelKey,
    pub id: u32,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChannelMessage {
    pub channel: ChannelTarget,
    pub payload: Box<Message>,
}

impl ChannelMessage {
    pub fn keyed(key: ChannelKey, payload: Message) -> Self {
        Self {
            channel: ChannelTarget::Key(key),
            payload: Box::new(payload),
        }
    }
}

/// 不透明的用户负载，`kind` 供接收方选择解码方式。
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Payload {
    pub kind: String,
    pub body: Bytes,
}

impl Payload {
    pub fn new(kind: impl Into<String>, body: impl Into<Bytes>) -> Self {
        Self {
            kind: kind.into(),
            body: body.into(),
        }
    }

    /// 以 JSON 编码任意 serde 值。
    pub fn encode_json<T: Serialize>(kind: impl Into<String>, value: &T) -> Result<Self> {
        Ok(Self::new(kind, serde_json::to_vec(value)?))
    }

    pub fn decode_json<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_slice(&self.body)?)
    }
}

/// 远端监听器上的一次方法调用，由 [`crate::dispatch::BroadcastDispatch`] 扇出。
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MethodInvocation {
    pub method: String,
    pub arguments: Bytes,
}

impl MethodInvocation {
    pub fn new(method: impl Into<String>, arguments: impl Into<Bytes>) -> Self {
        Self {
            method: method.into(),
            arguments: arguments.into(),
        }
    }
}

/// 线上消息。
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Message {
    /// 单个方向上的终止哨兵。
    EndOfStream,
    ConnectRequest(ConnectRequest),
    ChannelMetaInfo(ChannelMetaInfo),
    ChannelMessage(ChannelMessage),
    Payload(Payload),
    Failure(RemoteFailure),
    Invocation(MethodInvocation),
}

impl Message {
    pub fn is_end_of_stream(&self) -> bool {
        matches!(self, Self::EndOfStream)
    }

    /// 变体名，用于日志与 [`crate::MessagingError::UnexpectedMessage`]。
    pub fn kind_name(&self) -> &'static str {
        match self {
            Self::EndOfStream => "EndOfStream",
            Self::ConnectRequest(_) => "ConnectRequest",
            Self::ChannelMetaInfo(_) => "ChannelMetaInfo",
            Self::ChannelMessage(_) => "ChannelMessage",
            Self::Payload(_) => "Payload",
            Self::Failure(_) => "Failure",
            Self::Invocation(_) => "Invocation",
        }
    }
}

impl From<ConnectRequest> for Message {
    fn from(value: ConnectRequest) -> Self {
        Self::ConnectRequest(value)
    }
}

impl From<ChannelMetaInfo> for Message {
    fn from(value: ChannelMetaInfo) -> Self {
        Self::ChannelMetaInfo(value)
    }
}

impl From<ChannelMessage> for Message {
    fn from(value: ChannelMessage) -> Self {
        Self::ChannelMessage(value)
    }
}

impl From<Payload> for Message {
    fn from(value: Payload) -> Self {
        Self::Payload(value)
    }
}

impl From<RemoteFailure> for Message {
    fn from(value: RemoteFailure) -> Self {
        Self::Failure(value)
    }
}

impl From<MethodInvocation> for Message {
    fn from(value: MethodInvocation) -> Self {
        Self::Invocation(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Progress {
        done: u32,
        total: u32,
    }

    #[test]
    fn json_payload_keeps_kind_and_value() {
        let payload = Payload::encode_json("progress", &Progress { done: 3, total: 7 })
            .expect("可序列化的值应成功编码");
        assert_eq!(payload.kind, "progress");
        let decoded: Progress = payload.decode_json().expect("应能解码回原值");
        assert_eq!(decoded, Progress { done: 3, total: 7 });
    }

    #[test]
    fn empty_channel_key_is_rejected() {
        assert!(ChannelKey::new("").is_none());
        assert_eq!(ChannelKey::new("build").map(|k| k.to_string()).as_deref(), Some("build"));
    }
}
