//! 物理地址与通道地址。
//!
//! - 物理地址：`tcp://<host>:<port>`，或进程内传输使用的 `memory://<name>`；
//! - 通道地址：`channel:<物理地址>!<N>`，`N` 由持有该物理地址的连接器单调分配。
//!
//! 其它形式在解析时同步失败，返回 [`MessagingError::InvalidAddress`]。

use std::{fmt, net::SocketAddr, str::FromStr};

use crate::error::MessagingError;

const TCP_SCHEME: &str = "tcp://";
const MEMORY_SCHEME: &str = "memory://";
const CHANNEL_SCHEME: &str = "channel:";

/// 可直接建立字节流的端点。
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum PhysicalAddress {
    Tcp { host: String, port: u16 },
    Memory { name: String },
}

impl PhysicalAddress {
    pub fn tcp(host: impl Into<String>, port: u16) -> Self {
        Self::Tcp {
            host: host.into(),
            port,
        }
    }

    pub fn memory(name: impl Into<String>) -> Self {
        Self::Memory { name: name.into() }
    }

    /// 地址所属协议名，用于日志与错误提示。
    pub fn scheme(&self) -> &'static str {
        match self {
            Self::Tcp { .. } => "tcp",
            Self::Memory { .. } => "memory",
        }
    }

    /// 以 `host:port` 元组形式返回 TCP 端点；其它协议返回 `None`。
    pub fn as_tcp(&self) -> Option<(&str, u16)> {
        match self {
            Self::Tcp { host, port } => Some((host.as_str(), *port)),
            Self::Memory { .. } => None,
        }
    }
}

impl From<SocketAddr> for PhysicalAddress {
    fn from(addr: SocketAddr) -> Self {
        Self::Tcp {
            host: addr.ip().to_string(),
            port: addr.port(),
        }
    }
}

impl fmt::Display for PhysicalAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tcp { host, port } if host.contains(':') => {
                write!(f, "{TCP_SCHEME}[{host}]:{port}")
            }
            Self::Tcp { host, port } => write!(f, "{TCP_SCHEME}{host}:{port}"),
            Self::Memory { name } => write!(f, "{MEMORY_SCHEME}{name}"),
        }
    }
}

impl FromStr for PhysicalAddress {
    type Err = MessagingError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        if let Some(rest) = raw.strip_prefix(TCP_SCHEME) {
            let (host, port) = split_host_port(rest).ok_or_else(|| invalid(raw, "expected host:port"))?;
            let port = port
                .parse::<u16>()
                .map_err(|err| invalid(raw, &format!("bad port: {err}")))?;
            if host.is_empty() {
                return Err(invalid(raw, "empty host"));
            }
            return Ok(Self::tcp(host, port));
        }
        if let Some(name) = raw.strip_prefix(MEMORY_SCHEME) {
            if name.is_empty() || name.contains('!') {
                return Err(invalid(raw, "memory endpoint name must be non-empty and must not contain `!`"));
            }
            return Ok(Self::memory(name));
        }
        Err(invalid(raw, "unsupported scheme"))
    }
}

/// 物理连接上的一个逻辑通道。
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ChannelAddress {
    physical: PhysicalAddress,
    sequence: u64,
}

impl ChannelAddress {
    pub fn new(physical: PhysicalAddress, sequence: u64) -> Self {
        Self { physical, sequence }
    }

    /// 去掉 `!N` 后缀得到的物理地址。
    pub fn physical(&self) -> &PhysicalAddress {
        &self.physical
    }

    pub fn sequence(&self) -> u64 {
        self.sequence
    }
}

impl fmt::Display for ChannelAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{CHANNEL_SCHEME}{}!{}", self.physical, self.sequence)
    }
}

impl FromStr for ChannelAddress {
    type Err = MessagingError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let rest = raw
            .strip_prefix(CHANNEL_SCHEME)
            .ok_or_else(|| invalid(raw, "expected `channel:` scheme"))?;
        let (physical, sequence) = rest
            .rsplit_once('!')
            .ok_or_else(|| invalid(raw, "missing `!N` suffix"))?;
        let sequence = sequence
            .parse::<u64>()
            .map_err(|err| invalid(raw, &format!("bad sequence: {err}")))?;
        Ok(Self::new(physical.parse()?, sequence))
    }
}

fn split_host_port(rest: &str) -> Option<(&str, &str)> {
    if let Some(bracketed) = rest.strip_prefix('[') {
        let (host, tail) = bracketed.split_once(']')?;
        let port = tail.strip_prefix(':')?;
        return Some((host, port));
    }
    rest.rsplit_once(':')
}

fn invalid(address: &str, reason: &str) -> MessagingError {
    MessagingError::InvalidAddress {
        address: address.to_owned(),
        reason: reason.to_owned(),
    }
}
