//! 逻辑通道的状态转移表。
//!
//! 转移函数是纯函数，只描述“下一步做什么”，由
//! [`super::DeferredConnection`] 在锁内执行；loom 模型与 fuzz 目标直接复用
//! 这些函数。

/// 逻辑通道的生命周期状态。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ChannelState {
    /// 尚未绑定物理连接。
    AwaitConnect,
    /// 双向均可传输。
    Connected,
    /// 本端已发出 `EndOfStream`，等待对端的 `EndOfStream`。
    AwaitIncomingEndOfStream,
    /// 已收到对端的 `EndOfStream`，等待本端发出 `EndOfStream`。
    AwaitOutgoingEndOfStream,
    /// 发送故障或被中止；下一次接收合成一个 `EndOfStream`。
    GenerateIncomingEndOfStream,
    /// 两个方向都已结束。
    Stopped,
}

/// `connect` 的决策。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectStep {
    Bind,
    /// 已有连接或正在停止，传入的连接应被终止并关闭。
    Reject,
}

/// `dispatch` 的决策。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DispatchStep {
    /// 等待绑定。
    Wait,
    /// 写入连接，并在决策时刻切换到 `next`。
    Send { next: ChannelState },
    /// 丢弃消息。
    Discard,
    /// 协议误用。
    Reject,
}

/// `receive` 的决策。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReceiveStep {
    Wait,
    /// 从连接读取下一条消息。
    Read,
    /// 不读连接，直接交付一个合成的 `EndOfStream` 并切换到 `next`。
    Synthesize { next: ChannelState },
    /// 入站方向已结束。
    Finished,
}

impl ChannelState {
    pub fn on_connect(self) -> ConnectStep {
        match self {
            Self::AwaitConnect => ConnectStep::Bind,
            _ => ConnectStep::Reject,
        }
    }

    pub fn on_dispatch(self, end_of_stream: bool) -> DispatchStep {
        match self {
            Self::AwaitConnect => DispatchStep::Wait,
            Self::Connected => DispatchStep::Send {
                next: if end_of_stream {
                    Self::AwaitIncomingEndOfStream
                } else {
                    Self::Connected
                },
            },
            Self::AwaitOutgoingEndOfStream => DispatchStep::Send {
                next: if end_of_stream {
                    Self::Stopped
                } else {
                    Self::AwaitOutgoingEndOfStream
                },
            },
            Self::GenerateIncomingEndOfStream => DispatchStep::Discard,
            Self::AwaitIncomingEndOfStream | Self::Stopped => DispatchStep::Reject,
        }
    }

    pub fn on_receive(self) -> ReceiveStep {
        match self {
            Self::AwaitConnect => ReceiveStep::Wait,
            Self::Connected | Self::AwaitIncomingEndOfStream => ReceiveStep::Read,
            Self::GenerateIncomingEndOfStream => ReceiveStep::Synthesize { next: Self::Stopped },
            Self::AwaitOutgoingEndOfStream | Self::Stopped => ReceiveStep::Finished,
        }
    }

    /// 读到 `EndOfStream`、流关闭或读取故障。
    pub fn on_end_of_stream_received(self) -> Self {
        match self {
            Self::Connected => Self::AwaitOutgoingEndOfStream,
            Self::AwaitIncomingEndOfStream | Self::GenerateIncomingEndOfStream => Self::Stopped,
            other => other,
        }
    }

    pub fn on_send_failure(self) -> Self {
        match self {
            Self::Connected | Self::AwaitIncomingEndOfStream => Self::GenerateIncomingEndOfStream,
            Self::AwaitOutgoingEndOfStream => Self::Stopped,
            other => other,
        }
    }

    pub fn on_abort(self) -> Self {
        match self {
            Self::AwaitConnect | Self::Connected | Self::AwaitIncomingEndOfStream => {
                Self::GenerateIncomingEndOfStream
            }
            Self::AwaitOutgoingEndOfStream => Self::Stopped,
            other => other,
        }
    }

    /// 处于该状态时连接不再被任何一方使用。
    pub fn releases_connection(self) -> bool {
        matches!(self, Self::Stopped | Self::GenerateIncomingEndOfStream)
    }

    pub fn is_stopped(self) -> bool {
        self == Self::Stopped
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use super::ChannelState::*;

    /// 依次发送与接收 `EndOfStream` 的两种顺序都必须收敛到 `Stopped`。
    #[test]
    fn both_end_of_stream_orders_reach_stopped() {
        let DispatchStep::Send { next } = Connected.on_dispatch(true) else {
            panic!("Connected 状态应允许发送");
        };
        assert_eq!(next, AwaitIncomingEndOfStream);
        assert_eq!(next.on_end_of_stream_received(), Stopped);

        let waiting = Connected.on_end_of_stream_received();
        assert_eq!(waiting, AwaitOutgoingEndOfStream);
        assert_eq!(waiting.on_dispatch(true), DispatchStep::Send { next: Stopped });
    }

    #[test]
    fn second_outgoing_end_of_stream_is_rejected() {
        assert_eq!(AwaitIncomingEndOfStream.on_dispatch(true), DispatchStep::Reject);
        assert_eq!(AwaitIncomingEndOfStream.on_dispatch(false), DispatchStep::Reject);
        assert_eq!(Stopped.on_dispatch(true), DispatchStep::Reject);
    }

    #[test]
    fn send_failure_synthesizes_incoming_end_of_stream() {
        let failed = Connected.on_send_failure();
        assert_eq!(failed, GenerateIncomingEndOfStream);
        assert_eq!(failed.on_dispatch(false), DispatchStep::Discard);
        assert_eq!(failed.on_receive(), ReceiveStep::Synthesize { next: Stopped });
        assert_eq!(AwaitOutgoingEndOfStream.on_send_failure(), Stopped);
    }

    #[test]
    fn only_unbound_channels_accept_a_connection() {
        for state in [Connected, AwaitIncomingEndOfStream, AwaitOutgoingEndOfStream, GenerateIncomingEndOfStream, Stopped] {
            assert_eq!(state.on_connect(), ConnectStep::Reject, "{state:?}");
        }
        assert_eq!(AwaitConnect.on_connect(), ConnectStep::Bind);
        assert_eq!(AwaitConnect.on_receive(), ReceiveStep::Wait);
        assert_eq!(AwaitConnect.on_dispatch(false), DispatchStep::Wait);
    }

    #[test]
    fn abort_never_leaves_a_reader_waiting() {
        for state in [AwaitConnect, Connected, AwaitIncomingEndOfStream, AwaitOutgoingEndOfStream] {
            let aborted = state.on_abort();
            assert!(aborted.releases_connection(), "{state:?}");
            assert_ne!(aborted.on_receive(), ReceiveStep::Wait);
            assert_ne!(aborted.on_receive(), ReceiveStep::Read);
        }
    }
}
