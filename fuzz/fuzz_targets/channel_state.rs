#![no_main]

use arbitrary::Arbitrary;
use libfuzzer_sys::fuzz_target;
use spark_messaging::connection::{ChannelState, ConnectStep, DispatchStep, ReceiveStep};

/// 通道上可能发生的事件。
///
/// - **Why**：建连、双向结束、发送失败与中止可以任意交错，转移表必须在所有序列下保持
///   “连接至多释放一次、`Stopped` 为吸收态”；
/// - **How**：按事件序列驱动纯函数转移表，并模拟 `DeferredConnection` 的释放判断。
#[derive(Clone, Copy, Debug, Arbitrary)]
enum Event {
    Connect,
    Dispatch { end_of_stream: bool },
    Receive,
    PeerEndOfStream,
    SendFailure,
    Abort,
}

fuzz_target!(|events: Vec<Event>| {
    let mut state = ChannelState::AwaitConnect;
    let mut holding = false;
    let mut releases = 0usize;

    for event in events {
        let before = state;
        let next = match event {
            Event::Connect => match state.on_connect() {
                ConnectStep::Bind => {
                    holding = true;
                    ChannelState::Connected
                }
                ConnectStep::Reject => state,
            },
            Event::Dispatch { end_of_stream } => match state.on_dispatch(end_of_stream) {
                DispatchStep::Send { next } => next,
                DispatchStep::Wait | DispatchStep::Discard | DispatchStep::Reject => state,
            },
            Event::Receive => match state.on_receive() {
                ReceiveStep::Synthesize { next } => next,
                ReceiveStep::Wait | ReceiveStep::Read | ReceiveStep::Finished => state,
            },
            Event::PeerEndOfStream if holding => state.on_end_of_stream_received(),
            Event::PeerEndOfStream => state,
            Event::SendFailure if holding => state.on_send_failure(),
            Event::SendFailure => state,
            Event::Abort => state.on_abort(),
        };

        if before.is_stopped() {
            assert!(next.is_stopped(), "Stopped 必须是吸收态: {event:?}");
        }
        if next.releases_connection() && holding {
            holding = false;
            releases += 1;
        }
        state = next;
    }
    assert!(releases <= 1, "连接至多释放一次");
});
