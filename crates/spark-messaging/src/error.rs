//! 消息层统一错误域。
//!
//! # 教案式说明
//! - **意图 (Why)**：建连、协议、分发、停机四类故障需要在同一枚举下表达，
//!   调用方才能以稳定错误码做告警聚合，而不是匹配人类可读文案。
//! - **契约 (What)**：每个变体都映射到 `spark.messaging.<域>.<原因>` 形式的
//!   [`MessagingError::code`]，并归入一个 [`ErrorKind`]；
//!   传输层 I/O 失败保留 `io::Error` 作为 `source()`。
//! - **实现 (How)**：基于 `thiserror` 派生 `Display`/`Error`，错误码与分类
//!   通过 `match` 集中维护，新增变体时编译器会强制补全。

use std::{io, time::Duration};

use crate::{connection::ChannelState, dispatch::ListenerNotificationError};

/// 可跨线程传递的动态错误。
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// 消息层操作的结果别名。
pub type Result<T, E = MessagingError> = std::result::Result<T, E>;

/// 错误的粗粒度分类，供调用方决定处置策略。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// 配置或地址无效，修正输入前重试没有意义。
    Configuration,
    /// 对端违反协议，例如未知通道地址。
    Protocol,
    /// 底层字节流建立或读写失败。
    Transport,
    /// 一个或多个监听器执行失败。
    Listener,
    /// 停机流程失败或超时。
    Shutdown,
    /// 调用方在错误的生命周期阶段使用了 API。
    Usage,
}

/// 消息层错误。
#[derive(Debug, thiserror::Error)]
pub enum MessagingError {
    #[error("invalid address `{address}`: {reason}")]
    InvalidAddress { address: String, reason: String },

    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),

    #[error("{operation}: {source}")]
    Transport {
        code: &'static str,
        operation: &'static str,
        #[source]
        source: io::Error,
    },

    #[error("no pending channel registered for `{address}`")]
    UnknownChannel { address: String },

    #[error("expected {expected}, received {actual}")]
    UnexpectedMessage {
        expected: &'static str,
        actual: &'static str,
    },

    #[error("channel id {id} was used before its meta info")]
    UnknownChannelId { id: u32 },

    #[error("cannot {operation} while channel is {state:?}")]
    InvalidState {
        operation: &'static str,
        state: ChannelState,
    },

    #[error("message dispatched after end of stream")]
    DispatchAfterEndOfStream,

    #[error("method `{method}` is not declared by listener `{listener}`")]
    UnknownMethod {
        listener: &'static str,
        method: String,
    },

    #[error(transparent)]
    ListenerNotification(#[from] ListenerNotificationError),

    #[error("frame of {length} bytes exceeds the limit of {limit} bytes")]
    FrameTooLarge { length: usize, limit: usize },

    #[error("malformed message: {0}")]
    Decode(String),

    #[error("payload serialization failed: {0}")]
    Payload(#[from] serde_json::Error),

    #[error("component already stopped")]
    Stopped,

    #[error("{target} did not stop within {timeout:?}")]
    ShutdownTimeout {
        target: String,
        timeout: Duration,
    },

    #[error("stop failed: {source}")]
    Stop {
        #[source]
        source: Box<MessagingError>,
        suppressed: usize,
    },

    #[error("background task failed: {0}")]
    Task(String),
}

impl MessagingError {
    /// 以稳定错误码包装一次传输层 I/O 失败。
    pub fn transport(code: &'static str, operation: &'static str, source: io::Error) -> Self {
        Self::Transport {
            code,
            operation,
            source,
        }
    }

    /// 返回稳定错误码。
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidAddress { .. } => "spark.messaging.config.invalid_address",
            Self::InvalidConfiguration(_) => "spark.messaging.config.invalid",
            Self::Transport { code, .. } => code,
            Self::UnknownChannel { .. } => "spark.messaging.protocol.unknown_channel",
            Self::UnexpectedMessage { .. } => "spark.messaging.protocol.unexpected_message",
            Self::UnknownChannelId { .. } => "spark.messaging.protocol.unknown_channel_id",
            Self::InvalidState { .. } => "spark.messaging.usage.invalid_state",
            Self::DispatchAfterEndOfStream => "spark.messaging.usage.after_end_of_stream",
            Self::UnknownMethod { .. } => "spark.messaging.usage.unknown_method",
            Self::ListenerNotification(_) => "spark.messaging.listener.notification_failed",
            Self::FrameTooLarge { .. } => "spark.messaging.protocol.frame_too_large",
            Self::Decode(_) => "spark.messaging.protocol.decode_failed",
            Self::Payload(_) => "spark.messaging.protocol.payload_failed",
            Self::Stopped => "spark.messaging.usage.stopped",
            Self::ShutdownTimeout { .. } => "spark.messaging.shutdown.timeout",
            Self::Stop { .. } => "spark.messaging.shutdown.failed",
            Self::Task(_) => "spark.messaging.shutdown.task_failed",
        }
    }

    /// 返回错误分类。
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidAddress { .. } | Self::InvalidConfiguration(_) => {
                ErrorKind::Configuration
            }
            Self::Transport { .. } => ErrorKind::Transport,
            Self::UnknownChannel { .. }
            | Self::UnexpectedMessage { .. }
            | Self::UnknownChannelId { .. }
            | Self::FrameTooLarge { .. }
            | Self::Decode(_)
            | Self::Payload(_) => ErrorKind::Protocol,
            Self::InvalidState { .. }
            | Self::DispatchAfterEndOfStream
            | Self::UnknownMethod { .. }
            | Self::Stopped => ErrorKind::Usage,
            Self::ListenerNotification(_) => ErrorKind::Listener,
            Self::ShutdownTimeout { .. } | Self::Stop { .. } | Self::Task(_) => {
                ErrorKind::Shutdown
            }
        }
    }

    pub(crate) fn decode(reason: impl Into<String>) -> Self {
        Self::Decode(reason.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transport_errors_keep_their_code_and_source() {
        let err = MessagingError::transport(
            "spark.messaging.tcp.connect_failed",
            "tcp connect",
            io::Error::from(io::ErrorKind::ConnectionRefused),
        );
        assert_eq!(err.code(), "spark.messaging.tcp.connect_failed");
        assert_eq!(err.kind(), ErrorKind::Transport);
        assert!(std::error::Error::source(&err).is_some(), "需保留 io::Error 链");
    }

    #[test]
    fn stop_wraps_first_failure() {
        let err = MessagingError::Stop {
            source: Box::new(MessagingError::Stopped),
            suppressed: 2,
        };
        assert_eq!(err.kind(), ErrorKind::Shutdown);
        assert_eq!(err.to_string(), "stop failed: component already stopped");
    }
}
