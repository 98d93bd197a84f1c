use std::time::Duration;

use serde::Deserialize;

use crate::error::{MessagingError, Result};

/// 默认停机等待上限：120 秒。
pub const DEFAULT_STOP_TIMEOUT: Duration = Duration::from_secs(120);

/// 默认单帧上限：16 MiB。
pub const DEFAULT_MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// 消息层运行参数。
///
/// # 教案式注释
///
/// ## 意图 (Why)
/// - 停机超时、帧上限与监听地址需要由宿主统一下发，避免散落在各连接器构造函数中；
/// - 支持从 TOML 片段加载，便于与宿主配置文件共存。
///
/// ## 契约 (What)
/// - 缺省字段取默认值：`stop_timeout_ms = 120000`、`max_frame_size = 16 MiB`、
///   `bind_host = "127.0.0.1"`、`bind_port = 0`（由内核分配）、`tcp_nodelay = true`；
/// - [`MessagingConfig::validate`] 拒绝零超时与零帧上限；
///   `from_toml_str` 在返回前执行校验。
///
/// ## 注意事项 (Trade-offs)
/// - 超时到期视为致命错误，不做重试或退避。
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MessagingConfig {
    pub stop_timeout_ms: u64,
    pub max_frame_size: usize,
    pub bind_host: String,
    pub bind_port: u16,
    pub tcp_nodelay: bool,
}

impl Default for MessagingConfig {
    fn default() -> Self {
        Self {
            stop_timeout_ms: DEFAULT_STOP_TIMEOUT.as_millis() as u64,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            bind_host: "127.0.0.1".to_owned(),
            bind_port: 0,
            tcp_nodelay: true,
        }
    }
}

impl MessagingConfig {
    /// 从 TOML 文本解析并校验配置。
    pub fn from_toml_str(source: &str) -> Result<Self> {
        let config: Self = toml::from_str(source)
            .map_err(|err| MessagingError::InvalidConfiguration(err.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.stop_timeout_ms == 0 {
            return Err(MessagingError::InvalidConfiguration(
                "stop_timeout_ms must be greater than zero".to_owned(),
            ));
        }
        if self.max_frame_size == 0 {
            return Err(MessagingError::InvalidConfiguration(
                "max_frame_size must be greater than zero".to_owned(),
            ));
        }
        if self.bind_host.trim().is_empty() {
            return Err(MessagingError::InvalidConfiguration(
                "bind_host must not be empty".to_owned(),
            ));
        }
        Ok(())
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_millis(self.stop_timeout_ms)
    }

    pub fn with_stop_timeout(mut self, timeout: Duration) -> Self {
        self.stop_timeout_ms = timeout.as_millis().min(u128::from(u64::MAX)) as u64;
        self
    }

    pub fn with_max_frame_size(mut self, limit: usize) -> Self {
        self.max_frame_size = limit;
        self
    }

    pub fn with_bind_host(mut self, host: impl Into<String>) -> Self {
        self.bind_host = host.into();
        self
    }

    pub fn with_bind_port(mut self, port: u16) -> Self {
        self.bind_port = port;
        self
    }

    pub fn with_tcp_nodelay(mut self, enabled: bool) -> Self {
        self.tcp_nodelay = enabled;
        self
    }
}
