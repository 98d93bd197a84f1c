use std::pin::pin;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::Notify;

use super::Dispatch;
use crate::{error::MessagingError, lifecycle::Stoppable, message::Message};

type EndOfStreamAction = Box<dyn FnOnce() + Send>;

struct FilterState {
    terminal: bool,
    action: Option<EndOfStreamAction>,
}

/// 截获 `EndOfStream`：不再向下游转发，改为执行一次性动作并唤醒等待者。
///
/// # 教案式注释
///
/// ## 契约 (What)
/// - 非终止消息在锁内转发，因此与并发到达的 `EndOfStream` 之间有确定的先后；
/// - 收到 `EndOfStream` 后标记终止，动作在锁外执行且只执行一次；
/// - 终止之后的任何分发返回 [`MessagingError::DispatchAfterEndOfStream`]；
/// - [`Stoppable::stop`] 等待终止标记，本身不会制造终止。
pub struct EndOfStreamFilter<D> {
    downstream: D,
    state: Mutex<FilterState>,
    terminated: Notify,
}

impl<D> EndOfStreamFilter<D>
where
    D: Dispatch<Message>,
{
    pub fn new<F>(downstream: D, end_of_stream_action: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        Self {
            downstream,
            state: Mutex::new(FilterState {
                terminal: false,
                action: Some(Box::new(end_of_stream_action)),
            }),
            terminated: Notify::new(),
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.state.lock().terminal
    }

    /// 等待 `EndOfStream` 到达。
    pub async fn wait_for_end_of_stream(&self) {
        loop {
            let mut notified = pin!(self.terminated.notified());
            notified.as_mut().enable();
            if self.is_terminal() {
                return;
            }
            notified.await;
        }
    }
}

impl<D> Dispatch<Message> for EndOfStreamFilter<D>
where
    D: Dispatch<Message>,
{
    fn dispatch(&self, message: Message) -> Result<(), MessagingError> {
        let mut state = self.state.lock();
        if state.terminal {
            return Err(MessagingError::DispatchAfterEndOfStream);
        }
        if !message.is_end_of_stream() {
            return self.downstream.dispatch(message);
        }
        state.terminal = true;
        let action = state.action.take();
        drop(state);

        tracing::debug!("end of stream received");
        self.terminated.notify_waiters();
        if let Some(action) = action {
            action();
        }
        Ok(())
    }
}

#[async_trait]
impl<D> Stoppable for EndOfStreamFilter<D>
where
    D: Dispatch<Message>,
{
    async fn stop(&self) -> Result<(), MessagingError> {
        self.wait_for_end_of_stream().await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{dispatch::FnDispatch, message::Payload};
    use std::{
        sync::{
            Arc,
            atomic::{AtomicUsize, Ordering},
        },
        time::Duration,
    };

    fn counting_filter(
        forwarded: &Arc<AtomicUsize>,
        actions: &Arc<AtomicUsize>,
    ) -> EndOfStreamFilter<impl Dispatch<Message> + use<>> {
        let forwarded = Arc::clone(forwarded);
        let actions = Arc::clone(actions);
        EndOfStreamFilter::new(
            FnDispatch::new(move |message: Message| {
                assert!(!message.is_end_of_stream(), "终止消息不应被转发");
                forwarded.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }),
            move || {
                actions.fetch_add(1, Ordering::SeqCst);
            },
        )
    }

    #[test]
    fn end_of_stream_runs_action_once_and_blocks_further_dispatch() {
        let forwarded = Arc::new(AtomicUsize::new(0));
        let actions = Arc::new(AtomicUsize::new(0));
        let filter = counting_filter(&forwarded, &actions);

        filter
            .dispatch(Message::from(Payload::new("k", Vec::new())))
            .expect("终止前可转发");
        filter.dispatch(Message::EndOfStream).expect("首个终止消息");
        assert!(matches!(
            filter.dispatch(Message::EndOfStream),
            Err(MessagingError::DispatchAfterEndOfStream)
        ));
        assert!(filter.dispatch(Message::from(Payload::new("k", Vec::new()))).is_err());

        assert_eq!(forwarded.load(Ordering::SeqCst), 1);
        assert_eq!(actions.load(Ordering::SeqCst), 1);
        assert!(filter.is_terminal());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn stop_waits_for_end_of_stream() {
        let forwarded = Arc::new(AtomicUsize::new(0));
        let actions = Arc::new(AtomicUsize::new(0));
        let filter = Arc::new(counting_filter(&forwarded, &actions));

        let waiter = {
            let filter = Arc::clone(&filter);
            tokio::spawn(async move { filter.stop().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished(), "终止前 stop 必须保持等待");

        filter.dispatch(Message::EndOfStream).expect("终止消息");
        tokio::time::timeout(Duration::from_secs(5), waiter)
            .await
            .expect("终止后 stop 应返回")
            .expect("任务不应 panic")
            .expect("stop 不应失败");
    }
}
