#![cfg(all(feature = "loom-model", any(loom, spark_loom)))]

use loom::{
    model,
    sync::{
        Arc, Mutex,
        atomic::{AtomicUsize, Ordering},
    },
    thread,
};
use spark_messaging::connection::{ChannelState, DispatchStep};

/// 以 loom 原语重现延迟连接的“锁内转移、锁外释放”骨架。
struct Slot {
    inner: Mutex<(ChannelState, Option<()>)>,
    closes: AtomicUsize,
}

impl Slot {
    fn connected() -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new((ChannelState::Connected, Some(()))),
            closes: AtomicUsize::new(0),
        })
    }

    fn apply(&self, next: impl FnOnce(ChannelState) -> Option<ChannelState>) {
        let released = {
            let mut guard = self.inner.lock().expect("loom 锁不会中毒");
            let Some(state) = next(guard.0) else {
                return;
            };
            guard.0 = state;
            if state.releases_connection() {
                guard.1.take()
            } else {
                None
            }
        };
        if released.is_some() {
            self.closes.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn state(&self) -> ChannelState {
        self.inner.lock().expect("loom 锁不会中毒").0
    }
}

fn send_end_of_stream(state: ChannelState) -> Option<ChannelState> {
    match state.on_dispatch(true) {
        DispatchStep::Send { next } => Some(next),
        _ => None,
    }
}

#[test]
fn crossing_end_of_stream_closes_exactly_once() {
    //
    // 教案级说明：两端同时结束是停机中最常见的交错。
    // - **Why**：本端发送 `EndOfStream` 与收到对端 `EndOfStream` 可能在任意顺序下完成，
    //   若释放判断不在同一把锁内，连接可能被关闭两次或永不关闭；
    // - **How**：一个线程执行发送侧转移，另一个线程执行接收侧转移，Loom 穷举调度；
    // - **What**：无论顺序如何，最终状态都是 `Stopped`，连接恰好释放一次。
    model(|| {
        let slot = Slot::connected();

        let sender = {
            let slot = Arc::clone(&slot);
            thread::spawn(move || slot.apply(send_end_of_stream))
        };
        let receiver = {
            let slot = Arc::clone(&slot);
            thread::spawn(move || slot.apply(|state| Some(state.on_end_of_stream_received())))
        };

        sender.join().expect("发送线程不应 panic");
        receiver.join().expect("接收线程不应 panic");
        assert_eq!(slot.state(), ChannelState::Stopped);
        assert_eq!(slot.closes.load(Ordering::SeqCst), 1, "连接必须恰好释放一次");
    });
}

#[test]
fn abort_racing_with_peer_end_of_stream_releases_once() {
    //
    // 教案级说明：中止可能与对端结束同时到达。
    // - **What**：中止先到时进入 `GenerateIncomingEndOfStream` 并立即释放，随后的对端结束
    //   只推进状态；对端结束先到时中止直接进入 `Stopped`。两种顺序都只释放一次。
    model(|| {
        let slot = Slot::connected();

        let aborter = {
            let slot = Arc::clone(&slot);
            thread::spawn(move || slot.apply(|state| Some(state.on_abort())))
        };
        let receiver = {
            let slot = Arc::clone(&slot);
            thread::spawn(move || slot.apply(|state| Some(state.on_end_of_stream_received())))
        };

        aborter.join().expect("中止线程不应 panic");
        receiver.join().expect("接收线程不应 panic");
        assert_eq!(slot.state(), ChannelState::Stopped);
        assert_eq!(slot.closes.load(Ordering::SeqCst), 1);
    });
}
