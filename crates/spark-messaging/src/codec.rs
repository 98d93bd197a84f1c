//! 消息的二进制编码。
//!
//! # 教案式注释
//!
//! ## 契约 (What)
//! - 消息 = `u8` 判别字节 + 变体体；
//! - 字符串与字节串 = `u32` 大端长度 + 内容；
//! - 可选字段 = `u8` 存在标记（0/1）+ 内容；
//! - 嵌套消息 = `u32` 大端长度 + 完整消息编码；
//! - 帧（面向字节流传输）= `u32` 大端长度 + 消息编码，长度不得超过配置上限。
//!
//! ## 实现 (How)
//! - 解码基于 [`Bytes`] 游标，字节串字段以 `split_to` 零拷贝切出；
//! - 所有长度在读取前校验剩余字节，嵌套深度受 [`MAX_NESTING_DEPTH`] 约束，
//!   因此任意输入都只会得到 [`MessagingError::Decode`] 而不会 panic；
//! - 消息编码后多余的字节视为损坏。

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::{
    address::ChannelAddress,
    error::{MessagingError, Result},
    message::{
        ChannelKey, ChannelMessage, ChannelMetaInfo, ChannelTarget, ConnectRequest, Message,
        MethodInvocation, Payload, RemoteFailure,
    },
};

pub const TAG_END_OF_STREAM: u8 = 0;
pub const TAG_CONNECT_REQUEST: u8 = 1;
pub const TAG_CHANNEL_META_INFO: u8 = 2;
pub const TAG_CHANNEL_MESSAGE: u8 = 3;
pub const TAG_PAYLOAD: u8 = 4;
pub const TAG_FAILURE: u8 = 5;
pub const TAG_INVOCATION: u8 = 6;

/// 帧头长度。
pub const FRAME_HEADER_LEN: usize = 4;

/// 嵌套消息与原因链的最大深度。
pub const MAX_NESTING_DEPTH: usize = 32;

const TARGET_KEY: u8 = 0;
const TARGET_ID: u8 = 1;

/// 将消息追加编码到 `dst`。
pub fn encode(message: &Message, dst: &mut BytesMut) -> Result<()> {
    match message {
        Message::EndOfStream => dst.put_u8(TAG_END_OF_STREAM),
        Message::ConnectRequest(request) => {
            dst.put_u8(TAG_CONNECT_REQUEST);
            put_str(dst, &request.destination.to_string())?;
            match &request.source {
                Some(source) => {
                    dst.put_u8(1);
                    put_str(dst, &source.to_string())?;
                }
                None => dst.put_u8(0),
            }
        }
        Message::ChannelMetaInfo(info) => {
            dst.put_u8(TAG_CHANNEL_META_INFO);
            put_str(dst, info.key.as_str())?;
            dst.put_u32(info.id);
        }
        Message::ChannelMessage(channel_message) => {
            dst.put_u8(TAG_CHANNEL_MESSAGE);
            match &channel_message.channel {
                ChannelTarget::Key(key) => {
                    dst.put_u8(TARGET_KEY);
                    put_str(dst, key.as_str())?;
                }
                ChannelTarget::Id(id) => {
                    dst.put_u8(TARGET_ID);
                    dst.put_u32(*id);
                }
            }
            let mut nested = BytesMut::new();
            encode(&channel_message.payload, &mut nested)?;
            put_bytes(dst, &nested)?;
        }
        Message::Payload(payload) => {
            dst.put_u8(TAG_PAYLOAD);
            put_str(dst, &payload.kind)?;
            put_bytes(dst, &payload.body)?;
        }
        Message::Failure(failure) => {
            dst.put_u8(TAG_FAILURE);
            put_failure(dst, failure)?;
        }
        Message::Invocation(invocation) => {
            dst.put_u8(TAG_INVOCATION);
            put_str(dst, &invocation.method)?;
            put_bytes(dst, &invocation.arguments)?;
        }
    }
    Ok(())
}

/// 解码一条完整消息；`src` 必须恰好包含一条消息。
pub fn decode(src: Bytes) -> Result<Message> {
    let mut reader = Reader { src };
    let message = reader.message(0)?;
    if reader.src.has_remaining() {
        return Err(MessagingError::decode(format!(
            "{} trailing bytes after message",
            reader.src.remaining()
        )));
    }
    Ok(message)
}

/// 编码为带长度前缀的帧。
pub fn encode_frame(message: &Message, max_frame_size: usize) -> Result<Bytes> {
    let mut frame = BytesMut::with_capacity(64);
    frame.put_u32(0);
    encode(message, &mut frame)?;
    let length = frame.len() - FRAME_HEADER_LEN;
    check_frame_length(length, max_frame_size)?;
    frame[..FRAME_HEADER_LEN].copy_from_slice(&(length as u32).to_be_bytes());
    Ok(frame.freeze())
}

/// 校验帧体长度是否超过上限。
pub fn check_frame_length(length: usize, max_frame_size: usize) -> Result<()> {
    if length > max_frame_size || length > u32::MAX as usize {
        return Err(MessagingError::FrameTooLarge {
            length,
            limit: max_frame_size,
        });
    }
    Ok(())
}

fn put_len(dst: &mut BytesMut, length: usize) -> Result<()> {
    let length = u32::try_from(length).map_err(|_| MessagingError::FrameTooLarge {
        length,
        limit: u32::MAX as usize,
    })?;
    dst.put_u32(length);
    Ok(())
}

fn put_str(dst: &mut BytesMut, value: &str) -> Result<()> {
    put_bytes(dst, value.as_bytes())
}

fn put_bytes(dst: &mut BytesMut, value: &[u8]) -> Result<()> {
    put_len(dst, value.len())?;
    dst.put_slice(value);
    Ok(())
}

fn put_failure(dst: &mut BytesMut, failure: &RemoteFailure) -> Result<()> {
    put_str(dst, &failure.type_name)?;
    put_str(dst, &failure.message)?;
    put_len(dst, failure.frames.len())?;
    for frame in &failure.frames {
        put_str(dst, frame)?;
    }
    match &failure.serialized {
        Some(bytes) => {
            dst.put_u8(1);
            put_bytes(dst, bytes)?;
        }
        None => dst.put_u8(0),
    }
    match &failure.cause {
        Some(cause) => {
            dst.put_u8(1);
            put_failure(dst, cause)?;
        }
        None => dst.put_u8(0),
    }
    Ok(())
}

struct Reader {
    src: Bytes,
}

impl Reader {
    fn message(&mut self, depth: usize) -> Result<Message> {
        if depth > MAX_NESTING_DEPTH {
            return Err(MessagingError::decode("message nesting too deep"));
        }
        let tag = self.u8()?;
        let message = match tag {
            TAG_END_OF_STREAM => Message::EndOfStream,
            TAG_CONNECT_REQUEST => {
                let destination = self.channel_address()?;
                let source = if self.flag()? {
                    Some(self.channel_address()?)
                } else {
                    None
                };
                Message::ConnectRequest(ConnectRequest {
                    destination,
                    source,
                })
            }
            TAG_CHANNEL_META_INFO => {
                let key = self.channel_key()?;
                let id = self.u32()?;
                Message::ChannelMetaInfo(ChannelMetaInfo { key, id })
            }
            TAG_CHANNEL_MESSAGE => {
                let channel = match self.u8()? {
                    TARGET_KEY => ChannelTarget::Key(self.channel_key()?),
                    TARGET_ID => ChannelTarget::Id(self.u32()?),
                    other => {
                        return Err(MessagingError::decode(format!(
                            "unknown channel target flag {other}"
                        )));
                    }
                };
                let nested = self.bytes()?;
                let mut inner = Reader { src: nested };
                let payload = inner.message(depth + 1)?;
                if inner.src.has_remaining() {
                    return Err(MessagingError::decode("trailing bytes in nested message"));
                }
                Message::ChannelMessage(ChannelMessage {
                    channel,
                    payload: Box::new(payload),
                })
            }
            TAG_PAYLOAD => {
                let kind = self.string()?;
                let body = self.bytes()?;
                Message::Payload(Payload { kind, body })
            }
            TAG_FAILURE => Message::Failure(self.failure(depth)?),
            TAG_INVOCATION => {
                let method = self.string()?;
                let arguments = self.bytes()?;
                Message::Invocation(MethodInvocation { method, arguments })
            }
            other => return Err(MessagingError::decode(format!("unknown message tag {other}"))),
        };
        Ok(message)
    }

    fn failure(&mut self, depth: usize) -> Result<RemoteFailure> {
        if depth > MAX_NESTING_DEPTH {
            return Err(MessagingError::decode("failure cause chain too deep"));
        }
        let type_name = self.string()?;
        let message = self.string()?;
        let count = self.u32()? as usize;
        // 每帧至少占 4 字节长度前缀，先行校验以免恶意计数触发大额预分配。
        if count > self.src.remaining() / 4 {
            return Err(MessagingError::decode("frame count exceeds remaining input"));
        }
        let mut frames = Vec::with_capacity(count);
        for _ in 0..count {
            frames.push(self.string()?);
        }
        let serialized = if self.flag()? { Some(self.bytes()?) } else { None };
        let cause = if self.flag()? {
            Some(Box::new(self.failure(depth + 1)?))
        } else {
            None
        };
        Ok(RemoteFailure {
            type_name,
            message,
            frames,
            cause,
            serialized,
        })
    }

    fn need(&self, len: usize) -> Result<()> {
        if self.src.remaining() < len {
            return Err(MessagingError::decode(format!(
                "truncated input: need {len} bytes, have {}",
                self.src.remaining()
            )));
        }
        Ok(())
    }

    fn u8(&mut self) -> Result<u8> {
        self.need(1)?;
        Ok(self.src.get_u8())
    }

    fn u32(&mut self) -> Result<u32> {
        self.need(4)?;
        Ok(self.src.get_u32())
    }

    fn flag(&mut self) -> Result<bool> {
        match self.u8()? {
            0 => Ok(false),
            1 => Ok(true),
            other => Err(MessagingError::decode(format!("invalid presence flag {other}"))),
        }
    }

    fn bytes(&mut self) -> Result<Bytes> {
        let len = self.u32()? as usize;
        self.need(len)?;
        Ok(self.src.split_to(len))
    }

    fn string(&mut self) -> Result<String> {
        let raw = self.bytes()?;
        String::from_utf8(raw.to_vec())
            .map_err(|err| MessagingError::decode(format!("invalid utf-8: {err}")))
    }

    fn channel_key(&mut self) -> Result<ChannelKey> {
        ChannelKey::new(self.string()?).ok_or_else(|| MessagingError::decode("empty channel key"))
    }

    fn channel_address(&mut self) -> Result<ChannelAddress> {
        let raw = self.string()?;
        raw.parse()
            .map_err(|err: MessagingError| MessagingError::decode(err.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::PhysicalAddress;
    use proptest::prelude::*;

    fn encoded(message: &Message) -> Bytes {
        let mut dst = BytesMut::new();
        encode(message, &mut dst).expect("编码不应失败");
        dst.freeze()
    }

    #[test]
    fn end_of_stream_is_a_single_tag_byte() {
        assert_eq!(encoded(&Message::EndOfStream).as_ref(), &[TAG_END_OF_STREAM]);
    }

    #[test]
    fn connect_request_carries_channel_addresses() {
        let destination = ChannelAddress::new(PhysicalAddress::tcp("10.0.0.1", 4000), 7);
        let message = Message::from(ConnectRequest {
            destination: destination.clone(),
            source: None,
        });
        let decoded = decode(encoded(&message)).expect("应能解码");
        assert_eq!(decoded, message);
    }

    #[test]
    fn nested_channel_message_preserves_failure_chain() {
        let failure = RemoteFailure {
            type_name: "peer::Outer".into(),
            message: "outer".into(),
            frames: vec!["a".into(), "b".into()],
            cause: Some(Box::new(RemoteFailure {
                type_name: "peer::Inner".into(),
                message: "inner".into(),
                frames: Vec::new(),
                cause: None,
                serialized: Some(Bytes::from_static(b"{\"x\":1}")),
            })),
            serialized: None,
        };
        let message = Message::from(ChannelMessage {
            channel: ChannelTarget::Id(9),
            payload: Box::new(Message::Failure(failure)),
        });
        assert_eq!(decode(encoded(&message)).expect("应能解码"), message);
    }

    #[test]
    fn unknown_tag_and_trailing_bytes_are_rejected() {
        let err = decode(Bytes::from_static(&[42])).expect_err("未知判别字节");
        assert_eq!(err.code(), "spark.messaging.protocol.decode_failed");
        assert!(decode(Bytes::from_static(&[TAG_END_OF_STREAM, 0])).is_err());
    }

    #[test]
    fn truncated_length_prefix_is_rejected() {
        let mut bytes = encoded(&Message::from(Payload::new("k", Bytes::from_static(b"body")))).to_vec();
        bytes.truncate(bytes.len() - 1);
        assert!(decode(Bytes::from(bytes)).is_err());
    }

    #[test]
    fn frame_limit_is_enforced() {
        let message = Message::from(Payload::new("k", vec![0u8; 64]));
        let err = encode_frame(&message, 16).expect_err("超过帧上限");
        assert!(matches!(err, MessagingError::FrameTooLarge { limit: 16, .. }));
        let frame = encode_frame(&message, 1024).expect("上限内应成功");
        let declared = u32::from_be_bytes([frame[0], frame[1], frame[2], frame[3]]) as usize;
        assert_eq!(declared, frame.len() - FRAME_HEADER_LEN);
    }

    #[test]
    fn deep_nesting_is_rejected() {
        let mut message = Message::EndOfStream;
        for _ in 0..=MAX_NESTING_DEPTH + 1 {
            message = Message::from(ChannelMessage {
                channel: ChannelTarget::Id(0),
                payload: Box::new(message),
            });
        }
        assert!(decode(encoded(&message)).is_err());
    }

    proptest! {
        #[test]
        fn arbitrary_input_never_panics(input in proptest::collection::vec(any::<u8>(), 0..256)) {
            let _ = decode(Bytes::from(input));
        }

        #[test]
        fn payload_messages_survive_encoding(
            kind in "[a-z]{1,12}",
            body in proptest::collection::vec(any::<u8>(), 0..128),
            key in "[a-z]{1,8}",
        ) {
            let key = ChannelKey::new(key).expect("非空");
            let message = Message::from(ChannelMessage::keyed(key, Message::from(Payload::new(kind, body))));
            prop_assert_eq!(decode(encoded(&message)).expect("应能解码"), message);
        }
    }
}
