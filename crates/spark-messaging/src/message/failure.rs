//! 错误的跨进程编组与重建。
//!
//! # 教案式注释
//!
//! ## 意图 (Why)
//! - 远端失败需要原样呈现给调用方：类型、文案、因果链与调用帧都不能在
//!   跨进程边界上丢失；
//! - 接收方未必认识发送方的错误类型，此时仍要给出可读的占位错误，而不是
//!   把整个消息当成协议错误丢弃。
//!
//! ## 契约 (What)
//! - [`RemoteFailure`] 是纯数据：类型名、文案、帧、可选的 JSON 原始字节与
//!   嵌套的原因；
//! - [`FailureRegistry::reconstruct`] 依次尝试：按类型名注册的 serde 解码器、
//!   按类型名注册的构造函数、`"类型: 文案"` 占位错误；
//!   原因链与帧在三种路径下都会被重新挂上。
//!
//! ## 注意事项 (Trade-offs)
//! - 类型名取自 `std::any::type_name`，不同编译版本之间不保证稳定；
//!   需要稳定名称时使用 [`FailureRegistry::register_constructor_named`]。

use std::{
    any::type_name,
    backtrace::{Backtrace, BacktraceStatus},
    collections::HashMap,
    error::Error,
    fmt,
};

use bytes::Bytes;
use serde::{Serialize, de::DeserializeOwned};

use crate::error::BoxError;

/// 无法得知具体类型的原因链节点所使用的类型名。
const OPAQUE_CAUSE: &str = "dyn std::error::Error";

/// 可上线传输的错误快照。
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RemoteFailure {
    pub type_name: String,
    pub message: String,
    pub frames: Vec<String>,
    pub cause: Option<Box<RemoteFailure>>,
    /// 错误自身的 JSON 表示；序列化失败时为空。
    pub serialized: Option<Bytes>,
}

impl RemoteFailure {
    /// 捕获一个可序列化错误，保留其原始字节以便对端精确重建。
    pub fn capture<E>(error: &E) -> Self
    where
        E: Error + Serialize + 'static,
    {
        let serialized = match serde_json::to_vec(error) {
            Ok(bytes) => Some(Bytes::from(bytes)),
            Err(err) => {
                tracing::debug!(
                    error.type_name = type_name::<E>(),
                    reason = %err,
                    "failure is not serializable, falling back to placeholder encoding"
                );
                None
            }
        };
        Self {
            type_name: type_name::<E>().to_owned(),
            message: error.to_string(),
            frames: capture_frames(),
            cause: error.source().map(|source| Box::new(Self::describe(source))),
            serialized,
        }
    }

    /// 捕获任意错误；不携带原始字节，对端只能经构造函数或占位路径重建。
    pub fn from_error<E>(error: &E) -> Self
    where
        E: Error + 'static,
    {
        let dynamic: &(dyn Error + 'static) = error;
        let mut failure = Self::describe(dynamic);
        if !dynamic.is::<RemoteError>() {
            failure.type_name = type_name::<E>().to_owned();
        }
        if failure.frames.is_empty() {
            failure.frames = capture_frames();
        }
        failure
    }

    /// 替换调用帧，供已自行采集栈信息的调用方使用。
    pub fn with_frames(mut self, frames: Vec<String>) -> Self {
        self.frames = frames;
        self
    }

    /// 原因链深度（不含自身）。
    pub fn depth(&self) -> usize {
        let mut depth = 0;
        let mut current = self.cause.as_deref();
        while let Some(cause) = current {
            depth += 1;
            current = cause.cause.as_deref();
        }
        depth
    }

    fn describe(error: &(dyn Error + 'static)) -> Self {
        // 转发已重建的远端错误时沿用其原始类型名与帧。
        if let Some(remote) = error.downcast_ref::<RemoteError>() {
            return Self {
                type_name: remote.type_name.clone(),
                message: remote.message.clone(),
                frames: remote.frames.clone(),
                cause: remote.cause.as_deref().map(|cause| Box::new(Self::describe(cause))),
                serialized: None,
            };
        }
        Self {
            type_name: cause_type_name(error).to_owned(),
            message: error.to_string(),
            frames: Vec::new(),
            cause: error.source().map(|source| Box::new(Self::describe(source))),
            serialized: None,
        }
    }
}

/// 原因链节点只能以 trait 对象访问，这里识别常见的具体类型。
fn cause_type_name(error: &(dyn Error + 'static)) -> &'static str {
    if error.is::<std::io::Error>() {
        type_name::<std::io::Error>()
    } else if error.is::<crate::error::MessagingError>() {
        type_name::<crate::error::MessagingError>()
    } else if error.is::<serde_json::Error>() {
        type_name::<serde_json::Error>()
    } else {
        OPAQUE_CAUSE
    }
}

fn capture_frames() -> Vec<String> {
    let backtrace = Backtrace::capture();
    if backtrace.status() != BacktraceStatus::Captured {
        return Vec::new();
    }
    backtrace
        .to_string()
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(str::to_owned)
        .collect()
}

/// 重建时实际走到的路径。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Reconstruction {
    /// 由注册的 serde 解码器从原始字节还原。
    Deserialized,
    /// 由注册的构造函数以文案重建。
    Constructed,
    /// 本地不认识该类型，仅保留类型名与文案。
    Placeholder,
}

/// 在本进程中重建出的远端错误。
#[derive(Debug)]
pub struct RemoteError {
    type_name: String,
    message: String,
    frames: Vec<String>,
    cause: Option<Box<RemoteError>>,
    native: Option<BoxError>,
    reconstruction: Reconstruction,
}

impl RemoteError {
    pub fn type_name(&self) -> &str {
        &self.type_name
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn frames(&self) -> &[String] {
        &self.frames
    }

    pub fn cause(&self) -> Option<&RemoteError> {
        self.cause.as_deref()
    }

    pub fn reconstruction(&self) -> Reconstruction {
        self.reconstruction
    }

    /// 重建成功时的原生错误。
    pub fn native(&self) -> Option<&(dyn Error + Send + Sync + 'static)> {
        self.native.as_deref()
    }

    pub fn downcast_ref<E: Error + 'static>(&self) -> Option<&E> {
        self.native.as_deref()?.downcast_ref::<E>()
    }
}

impl fmt::Display for RemoteError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.native {
            Some(native) => fmt::Display::fmt(native, f),
            None => write!(f, "{}: {}", self.type_name, self.message),
        }
    }
}

impl Error for RemoteError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        self.cause.as_deref().map(|cause| cause as &(dyn Error + 'static))
    }
}

type Decoder = Box<dyn Fn(&[u8]) -> Result<BoxError, serde_json::Error> + Send + Sync>;
type Constructor = Box<dyn Fn(String) -> BoxError + Send + Sync>;

/// 按类型名索引的错误重建表。
#[derive(Default)]
pub struct FailureRegistry {
    decoders: HashMap<String, Decoder>,
    constructors: HashMap<String, Constructor>,
}

impl fmt::Debug for FailureRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FailureRegistry")
            .field("decoders", &self.decoders.keys().collect::<Vec<_>>())
            .field("constructors", &self.constructors.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl FailureRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// 注册可从 JSON 原始字节还原的错误类型。
    pub fn register_serde<E>(&mut self) -> &mut Self
    where
        E: Error + DeserializeOwned + Send + Sync + 'static,
    {
        self.decoders.insert(
            type_name::<E>().to_owned(),
            Box::new(|bytes| {
                let error: E = serde_json::from_slice(bytes)?;
                Ok(Box::new(error) as BoxError)
            }),
        );
        self
    }

    /// 注册以文案重建错误的构造函数，键为 `E` 的类型名。
    pub fn register_constructor<E, F>(&mut self, constructor: F) -> &mut Self
    where
        E: Error + Send + Sync + 'static,
        F: Fn(String) -> E + Send + Sync + 'static,
    {
        self.constructors.insert(
            type_name::<E>().to_owned(),
            Box::new(move |message| Box::new(constructor(message)) as BoxError),
        );
        self
    }

    /// 以显式类型名注册构造函数。
    pub fn register_constructor_named<F>(&mut self, type_name: impl Into<String>, constructor: F) -> &mut Self
    where
        F: Fn(String) -> BoxError + Send + Sync + 'static,
    {
        self.constructors.insert(type_name.into(), Box::new(constructor));
        self
    }

    pub fn reconstruct(&self, failure: &RemoteFailure) -> RemoteError {
        let cause = failure
            .cause
            .as_deref()
            .map(|cause| Box::new(self.reconstruct(cause)));
        let (native, reconstruction) = self.native_for(failure);
        RemoteError {
            type_name: failure.type_name.clone(),
            message: failure.message.clone(),
            frames: failure.frames.clone(),
            cause,
            native,
            reconstruction,
        }
    }

    fn native_for(&self, failure: &RemoteFailure) -> (Option<BoxError>, Reconstruction) {
        if let (Some(decoder), Some(bytes)) =
            (self.decoders.get(&failure.type_name), failure.serialized.as_ref())
        {
            match decoder(bytes) {
                Ok(native) => return (Some(native), Reconstruction::Deserialized),
                Err(err) => tracing::debug!(
                    error.type_name = %failure.type_name,
                    reason = %err,
                    "registered decoder rejected failure bytes"
                ),
            }
        }
        if let Some(constructor) = self.constructors.get(&failure.type_name) {
            return (Some(constructor(failure.message.clone())), Reconstruction::Constructed);
        }
        (None, Reconstruction::Placeholder)
    }
}
