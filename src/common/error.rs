use thiserror::Error;
use tokio::time::Instant;

use crate::dns::message::RCode;

#[derive(Error, Debug)]
pub enum DnsError {
    /// 缓存中暂无可用记录，轮询循环会继续等待
    #[error("record not found")]
    RecordNotFound,

    /// 协议层成功但请求的地址族没有任何地址
    #[error("empty response")]
    EmptyResponse,

    #[error("DNS response code: {rcode}")]
    ResponseCode { rcode: RCode, expire_at: Instant },

    /// 仅 UDP 后端内部使用，触发 TCP 重试
    #[error("truncated response")]
    Truncated,

    #[error("cancelled")]
    Cancelled,

    #[error("query timeout")]
    Timeout,

    #[error("transport error: {0}")]
    Transport(String),

    #[error("malformed message: {0}")]
    Malformed(String),

    #[error("unsupported: {0}")]
    Unsupported(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl DnsError {
    pub fn kind(&self) -> DnsErrorKind {
        match self {
            DnsError::RecordNotFound => DnsErrorKind::RecordNotFound,
            DnsError::EmptyResponse => DnsErrorKind::EmptyResponse,
            DnsError::ResponseCode { .. } => DnsErrorKind::ResponseCode,
            DnsError::Truncated => DnsErrorKind::Truncated,
            DnsError::Cancelled => DnsErrorKind::Cancelled,
            DnsError::Timeout => DnsErrorKind::Timeout,
            DnsError::Transport(_) => DnsErrorKind::Transport,
            DnsError::Malformed(_) => DnsErrorKind::Malformed,
            DnsError::Unsupported(_) => DnsErrorKind::Unsupported,
            DnsError::Io(_) => DnsErrorKind::Io,
        }
    }

    /// Convert an internal transport failure into the public taxonomy.
    pub fn transport(err: anyhow::Error) -> Self {
        if let Some(io_err) = err.downcast_ref::<std::io::Error>() {
            if io_err.kind() == std::io::ErrorKind::TimedOut {
                return DnsError::Timeout;
            }
        }
        DnsError::Transport(format!("{:#}", err))
    }
}

/// Lightweight error category for pattern matching without borrowing the error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DnsErrorKind {
    RecordNotFound,
    EmptyResponse,
    ResponseCode,
    Truncated,
    Cancelled,
    Timeout,
    Transport,
    Malformed,
    Unsupported,
    Io,
}
