//! 生命周期契约与聚合停机。

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::error::MessagingError;

/// 可停止的组件；`stop` 在组件静默后返回。
#[async_trait]
pub trait Stoppable: Send + Sync {
    async fn stop(&self) -> Result<(), MessagingError>;
}

/// 支持“只发起、不等待”停机的组件。
pub trait AsyncStoppable: Stoppable {
    /// 发起停机并立即返回；重复调用无副作用。
    fn request_stop(&self);
}

/// 依次停止一组组件。
///
/// # 教案式注释
///
/// ## 契约 (What)
/// - 每个元素的 `stop` 都会被调用，即使前面的元素失败；
/// - 返回第一个失败，包装为 [`MessagingError::Stop`]，`suppressed` 记录被
///   记录日志后丢弃的后续失败数量；
/// - 停止后集合被清空，再次 `stop` 直接成功。
///
/// ## 实现 (How)
/// - 停止前在锁内取走全部元素，逐个 `await` 时不持有锁，停止过程中新加入
///   的元素留给下一次 `stop`。
#[derive(Default)]
pub struct CompositeStoppable {
    elements: Mutex<Vec<Arc<dyn Stoppable>>>,
}

impl CompositeStoppable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, element: Arc<dyn Stoppable>) -> &Self {
        self.elements.lock().push(element);
        self
    }

    pub fn len(&self) -> usize {
        self.elements.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.elements.lock().is_empty()
    }
}

#[async_trait]
impl Stoppable for CompositeStoppable {
    async fn stop(&self) -> Result<(), MessagingError> {
        let elements = std::mem::take(&mut *self.elements.lock());
        let mut first: Option<MessagingError> = None;
        let mut suppressed = 0;
        for element in elements {
            let Err(err) = element.stop().await else {
                continue;
            };
            if first.is_none() {
                first = Some(err);
            } else {
                suppressed += 1;
                tracing::error!(
                    error.code = err.code(),
                    error = %err,
                    "suppressed failure while stopping composite"
                );
            }
        }
        match first {
            None => Ok(()),
            Some(source) => Err(MessagingError::Stop {
                source: Box::new(source),
                suppressed,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Probe {
        stops: AtomicUsize,
        fail_with: Option<fn() -> MessagingError>,
    }

    impl Probe {
        fn ok() -> Arc<Self> {
            Arc::new(Self {
                stops: AtomicUsize::new(0),
                fail_with: None,
            })
        }

        fn failing(fail_with: fn() -> MessagingError) -> Arc<Self> {
            Arc::new(Self {
                stops: AtomicUsize::new(0),
                fail_with: Some(fail_with),
            })
        }
    }

    #[async_trait]
    impl Stoppable for Probe {
        async fn stop(&self) -> Result<(), MessagingError> {
            self.stops.fetch_add(1, Ordering::SeqCst);
            self.fail_with.map_or(Ok(()), |make| Err(make()))
        }
    }

    #[tokio::test]
    async fn failing_first_element_does_not_skip_the_rest() {
        let first = Probe::failing(|| MessagingError::Stopped);
        let second = Probe::ok();
        let third = Probe::failing(|| MessagingError::Task("late".into()));

        let composite = CompositeStoppable::new();
        composite
            .add(first.clone())
            .add(second.clone())
            .add(third.clone());

        let err = composite.stop().await.expect_err("首个元素失败需上报");
        for probe in [&first, &second, &third] {
            assert_eq!(probe.stops.load(Ordering::SeqCst), 1, "每个元素都必须被停止");
        }
        match err {
            MessagingError::Stop { source, suppressed } => {
                assert!(matches!(*source, MessagingError::Stopped), "应包装第一个失败");
                assert_eq!(suppressed, 1);
            }
            other => panic!("意外的错误: {other:?}"),
        }

        assert!(composite.is_empty());
        composite.stop().await.expect("清空后再次停止应成功");
    }
}
