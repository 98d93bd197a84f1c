use std::{
    any::Any,
    fmt,
    marker::PhantomData,
    panic::{AssertUnwindSafe, catch_unwind},
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};

use parking_lot::Mutex;

use super::Dispatch;
use crate::{
    error::{BoxError, MessagingError},
    message::MethodInvocation,
};

/// 监听器接口的静态描述：接口名与其声明的方法集合。
///
/// 方法级注册只能绑定到 `METHODS` 中列出的名字，拼写错误在注册时即被拒绝。
pub trait ListenerContract: Send + Sync + 'static {
    const NAME: &'static str;
    const METHODS: &'static [&'static str];
}

/// 注册句柄，用于 [`BroadcastDispatch::remove`]。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct HandlerKey(u64);

/// 监听器回调可返回的包装错误。
#[derive(Debug, thiserror::Error)]
pub enum ListenerFailure {
    /// 由回调显式包装的错误，广播聚合时会被拆开，只保留内部错误。
    #[error(transparent)]
    Unchecked(BoxError),
    /// 回调 panic。
    #[error("listener panicked: {0}")]
    Panicked(String),
}

/// 一次广播中至少一个监听器失败。
#[derive(Debug)]
pub struct ListenerNotificationError {
    pub listener_type: &'static str,
    pub method: String,
    pub causes: Vec<BoxError>,
}

impl fmt::Display for ListenerNotificationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} listener(s) failed while handling {}.{}",
            self.causes.len(),
            self.listener_type,
            self.method
        )?;
        if let Some(first) = self.causes.first() {
            write!(f, ": {first}")?;
        }
        Ok(())
    }
}

impl std::error::Error for ListenerNotificationError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.causes
            .first()
            .map(|cause| cause.as_ref() as &(dyn std::error::Error + 'static))
    }
}

type MethodCallback = Box<dyn Fn(&MethodInvocation) -> Result<(), BoxError> + Send + Sync>;

enum Handler {
    Listener(Arc<dyn Dispatch<MethodInvocation>>),
    Method {
        method: &'static str,
        callback: MethodCallback,
    },
}

/// 将一次方法调用扇出给所有已注册的监听器。
///
/// # 教案式注释
///
/// ## 契约 (What)
/// - 整体监听器（`add_listener`）接收每一次调用；方法级回调只接收同名方法；
/// - `dispatch` 基于注册表快照执行，回调期间的增删不影响本轮；
/// - 每个处理者都会被尝试：失败与 panic 被收集，全部执行完毕后若有失败，
///   返回一个 [`ListenerNotificationError`]；
/// - 调用未在 `L::METHODS` 中声明的方法返回 [`MessagingError::UnknownMethod`]。
///
/// ## 注意事项 (Trade-offs)
/// - 回调在调用线程上同步执行，耗时回调会拖慢广播方；
/// - panic 以 `catch_unwind` 捕获，回调持有的状态可能处于中间态。
pub struct BroadcastDispatch<L: ListenerContract> {
    handlers: Mutex<Vec<(HandlerKey, Arc<Handler>)>>,
    next_key: AtomicU64,
    _contract: PhantomData<fn() -> L>,
}

impl<L: ListenerContract> Default for BroadcastDispatch<L> {
    fn default() -> Self {
        Self::new()
    }
}

impl<L: ListenerContract> BroadcastDispatch<L> {
    pub fn new() -> Self {
        Self {
            handlers: Mutex::new(Vec::new()),
            next_key: AtomicU64::new(0),
            _contract: PhantomData,
        }
    }

    pub fn add_listener(&self, listener: Arc<dyn Dispatch<MethodInvocation>>) -> HandlerKey {
        self.register(Handler::Listener(listener))
    }

    /// 注册单个方法的可失败回调。
    pub fn add_method_closure<F>(&self, method: &str, callback: F) -> Result<HandlerKey, MessagingError>
    where
        F: Fn(&MethodInvocation) -> Result<(), BoxError> + Send + Sync + 'static,
    {
        let method = Self::declared(method)?;
        Ok(self.register(Handler::Method {
            method,
            callback: Box::new(callback),
        }))
    }

    /// 注册单个方法的无返回值回调。
    pub fn add_method_action<F>(&self, method: &str, action: F) -> Result<HandlerKey, MessagingError>
    where
        F: Fn(&MethodInvocation) + Send + Sync + 'static,
    {
        self.add_method_closure(method, move |invocation| {
            action(invocation);
            Ok(())
        })
    }

    pub fn remove(&self, key: HandlerKey) -> bool {
        let mut handlers = self.handlers.lock();
        let before = handlers.len();
        handlers.retain(|(candidate, _)| *candidate != key);
        handlers.len() != before
    }

    pub fn len(&self) -> usize {
        self.handlers.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.lock().is_empty()
    }

    fn register(&self, handler: Handler) -> HandlerKey {
        let key = HandlerKey(self.next_key.fetch_add(1, Ordering::Relaxed));
        self.handlers.lock().push((key, Arc::new(handler)));
        key
    }

    fn declared(method: &str) -> Result<&'static str, MessagingError> {
        L::METHODS
            .iter()
            .copied()
            .find(|declared| *declared == method)
            .ok_or_else(|| MessagingError::UnknownMethod {
                listener: L::NAME,
                method: method.to_owned(),
            })
    }
}

impl<L: ListenerContract> Dispatch<MethodInvocation> for BroadcastDispatch<L> {
    fn dispatch(&self, invocation: MethodInvocation) -> Result<(), MessagingError> {
        let method = Self::declared(&invocation.method)?;
        let snapshot: Vec<Arc<Handler>> = self
            .handlers
            .lock()
            .iter()
            .map(|(_, handler)| Arc::clone(handler))
            .collect();

        let mut causes: Vec<BoxError> = Vec::new();
        for handler in snapshot {
            let outcome = catch_unwind(AssertUnwindSafe(|| match handler.as_ref() {
                Handler::Listener(listener) => listener
                    .dispatch(invocation.clone())
                    .map_err(|err| Box::new(err) as BoxError),
                Handler::Method {
                    method: bound,
                    callback,
                } if *bound == method => callback(&invocation),
                Handler::Method { .. } => Ok(()),
            }));
            match outcome {
                Ok(Ok(())) => {}
                Ok(Err(err)) => causes.push(unwrap_unchecked(err)),
                Err(panic) => causes.push(Box::new(ListenerFailure::Panicked(panic_message(&*panic)))),
            }
        }

        if causes.is_empty() {
            return Ok(());
        }
        tracing::debug!(
            listener = L::NAME,
            method,
            failures = causes.len(),
            "broadcast completed with listener failures"
        );
        Err(ListenerNotificationError {
            listener_type: L::NAME,
            method: method.to_owned(),
            causes,
        }
        .into())
    }
}

fn unwrap_unchecked(error: BoxError) -> BoxError {
    match error.downcast::<ListenerFailure>() {
        Ok(failure) => match *failure {
            ListenerFailure::Unchecked(inner) => inner,
            other => Box::new(other) as BoxError,
        },
        Err(error) => error,
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_owned()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_owned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::FnDispatch;
    use std::sync::atomic::AtomicUsize;

    struct BuildListener;

    impl ListenerContract for BuildListener {
        const NAME: &'static str = "BuildListener";
        const METHODS: &'static [&'static str] = &["started", "finished"];
    }

    fn counting(counter: &Arc<AtomicUsize>) -> Arc<dyn Dispatch<MethodInvocation>> {
        let counter = Arc::clone(counter);
        Arc::new(FnDispatch::new(move |_invocation: MethodInvocation| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }))
    }

    #[test]
    fn failing_middle_listener_does_not_stop_the_others() {
        let broadcast = BroadcastDispatch::<BuildListener>::new();
        let calls = Arc::new(AtomicUsize::new(0));
        broadcast.add_listener(counting(&calls));
        broadcast
            .add_method_closure("started", |_| Err("middle listener broke".into()))
            .expect("已声明的方法");
        broadcast.add_listener(counting(&calls));

        let err = broadcast
            .dispatch(MethodInvocation::new("started", Vec::new()))
            .expect_err("中间监听器失败需聚合上报");
        assert_eq!(calls.load(Ordering::SeqCst), 2, "首尾监听器都必须被调用");
        match err {
            MessagingError::ListenerNotification(notification) => {
                assert_eq!(notification.listener_type, "BuildListener");
                assert_eq!(notification.method, "started");
                assert_eq!(notification.causes.len(), 1);
                assert_eq!(notification.causes[0].to_string(), "middle listener broke");
            }
            other => panic!("意外的错误类型: {other:?}"),
        }
    }

    #[test]
    fn unchecked_wrapper_and_panics_are_reported_as_causes() {
        let broadcast = BroadcastDispatch::<BuildListener>::new();
        broadcast
            .add_method_closure("finished", |_| {
                Err(Box::new(ListenerFailure::Unchecked("wrapped".into())))
            })
            .expect("已声明的方法");
        broadcast
            .add_method_action("finished", |_| panic!("boom"))
            .expect("已声明的方法");

        let err = broadcast
            .dispatch(MethodInvocation::new("finished", Vec::new()))
            .expect_err("两个回调均失败");
        let MessagingError::ListenerNotification(notification) = err else {
            panic!("应返回聚合错误");
        };
        assert_eq!(notification.causes[0].to_string(), "wrapped");
        assert_eq!(notification.causes[1].to_string(), "listener panicked: boom");
    }

    #[test]
    fn method_callbacks_only_see_their_method() {
        let broadcast = BroadcastDispatch::<BuildListener>::new();
        let started = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&started);
        let key = broadcast
            .add_method_action("started", move |_| {
                seen.fetch_add(1, Ordering::SeqCst);
            })
            .expect("已声明的方法");

        broadcast
            .dispatch(MethodInvocation::new("finished", Vec::new()))
            .expect("无失败");
        broadcast
            .dispatch(MethodInvocation::new("started", Vec::new()))
            .expect("无失败");
        assert_eq!(started.load(Ordering::SeqCst), 1);

        assert!(broadcast.remove(key));
        assert!(!broadcast.remove(key), "重复移除应返回 false");
        assert!(broadcast.is_empty());
    }

    #[test]
    fn undeclared_methods_are_rejected() {
        let broadcast = BroadcastDispatch::<BuildListener>::new();
        let err = broadcast
            .add_method_action("aborted", |_| {})
            .expect_err("未声明的方法");
        assert_eq!(err.code(), "spark.messaging.usage.unknown_method");
        assert!(broadcast
            .dispatch(MethodInvocation::new("aborted", Vec::new()))
            .is_err());
    }
}
