use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::{sync::mpsc, task::JoinHandle};

use super::{AsyncSink, AsyncSource, Dispatch};
use crate::{
    error::MessagingError,
    lifecycle::{AsyncStoppable, Stoppable},
};

/// 同步分发到异步接收端的队列桥。
///
/// # 教案式注释
///
/// ## 意图 (Why)
/// - 同步的分发链不能在调用线程上等待网络写入；入队后立即返回，由工作任务
///   按入队顺序逐条交给 [`AsyncSink`]。
///
/// ## 契约 (What)
/// - `start` 必须在 Tokio 运行时上下文中调用；
/// - 接收端返回的错误被记录后丢弃，队列继续工作；
/// - `request_stop` 关闭入口，已入队的消息仍会被送达；`stop` 额外等待队列排空；
/// - 关闭后的 `dispatch` 返回 [`MessagingError::Stopped`]。
///
/// ## 注意事项 (Trade-offs)
/// - 队列无界，生产速度长期高于接收端时内存会持续增长。
pub struct AsyncDispatch<T> {
    sender: Mutex<Option<mpsc::UnboundedSender<T>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl<T: Send + 'static> AsyncDispatch<T> {
    pub fn start<S>(sink: Arc<S>) -> Self
    where
        S: AsyncSink<T> + ?Sized + 'static,
    {
        let (sender, mut receiver) = mpsc::unbounded_channel::<T>();
        let worker = tokio::spawn(async move {
            while let Some(message) = receiver.recv().await {
                if let Err(err) = sink.send(message).await {
                    tracing::error!(
                        error.code = err.code(),
                        error = %err,
                        "queued dispatch failed"
                    );
                }
            }
        });
        Self {
            sender: Mutex::new(Some(sender)),
            worker: Mutex::new(Some(worker)),
        }
    }
}

impl<T: Send + 'static> Dispatch<T> for AsyncDispatch<T> {
    fn dispatch(&self, message: T) -> Result<(), MessagingError> {
        match self.sender.lock().as_ref() {
            Some(sender) => sender.send(message).map_err(|_| MessagingError::Stopped),
            None => Err(MessagingError::Stopped),
        }
    }
}

#[async_trait]
impl<T: Send + 'static> Stoppable for AsyncDispatch<T> {
    async fn stop(&self) -> Result<(), MessagingError> {
        self.request_stop();
        let worker = self.worker.lock().take();
        if let Some(worker) = worker {
            worker
                .await
                .map_err(|err| MessagingError::Task(err.to_string()))?;
        }
        Ok(())
    }
}

impl<T: Send + 'static> AsyncStoppable for AsyncDispatch<T> {
    fn request_stop(&self) {
        self.sender.lock().take();
    }
}

/// 从异步来源持续拉取并同步分发，直到来源返回 `None`。
///
/// 分发失败被记录后继续拉取；来源本身出错时终止循环。
pub struct AsyncReceive {
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl AsyncReceive {
    pub fn start<T, S, D>(source: Arc<S>, target: D) -> Self
    where
        T: Send + 'static,
        S: AsyncSource<T> + ?Sized + 'static,
        D: Dispatch<T> + 'static,
    {
        let worker = tokio::spawn(async move {
            loop {
                match source.receive().await {
                    Ok(Some(message)) => {
                        if let Err(err) = target.dispatch(message) {
                            tracing::warn!(
                                error.code = err.code(),
                                error = %err,
                                "failed to dispatch received message"
                            );
                        }
                    }
                    Ok(None) => break,
                    Err(err) => {
                        tracing::error!(
                            error.code = err.code(),
                            error = %err,
                            "receive failed, stopping receive loop"
                        );
                        break;
                    }
                }
            }
        });
        Self {
            worker: Mutex::new(Some(worker)),
        }
    }

    pub fn is_finished(&self) -> bool {
        self.worker
            .lock()
            .as_ref()
            .is_none_or(JoinHandle::is_finished)
    }
}

#[async_trait]
impl Stoppable for AsyncReceive {
    async fn stop(&self) -> Result<(), MessagingError> {
        let worker = self.worker.lock().take();
        if let Some(worker) = worker {
            worker
                .await
                .map_err(|err| MessagingError::Task(err.to_string()))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::FnDispatch;
    use tokio::sync::Mutex as AsyncMutex;

    #[derive(Default)]
    struct Collect {
        items: AsyncMutex<Vec<u32>>,
    }

    #[async_trait]
    impl AsyncSink<u32> for Collect {
        async fn send(&self, message: u32) -> Result<(), MessagingError> {
            if message == 3 {
                return Err(MessagingError::Stopped);
            }
            self.items.lock().await.push(message);
            Ok(())
        }
    }

    struct Countdown {
        remaining: AsyncMutex<u32>,
    }

    #[async_trait]
    impl AsyncSource<u32> for Countdown {
        async fn receive(&self) -> Result<Option<u32>, MessagingError> {
            let mut remaining = self.remaining.lock().await;
            if *remaining == 0 {
                return Ok(None);
            }
            *remaining -= 1;
            Ok(Some(*remaining))
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn queue_preserves_order_and_survives_sink_errors() {
        let sink = Arc::new(Collect::default());
        let queue = AsyncDispatch::<u32>::start(Arc::clone(&sink));
        for value in 0..6 {
            queue.dispatch(value).expect("运行中应能入队");
        }
        queue.stop().await.expect("排空后停止");

        assert_eq!(*sink.items.lock().await, vec![0, 1, 2, 4, 5]);
        assert!(matches!(queue.dispatch(9), Err(MessagingError::Stopped)));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn receive_loop_drains_source_until_none() {
        let seen = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let receive = AsyncReceive::start(
            Arc::new(Countdown {
                remaining: AsyncMutex::new(3),
            }),
            FnDispatch::new(move |value: u32| {
                sink.lock().push(value);
                Ok(())
            }),
        );
        receive.stop().await.expect("来源结束后停止");
        assert!(receive.is_finished());
        assert_eq!(*seen.lock(), vec![2, 1, 0]);
    }
}
