/// 自定义错误类型
///
/// 使用 thiserror 定义转发核心的精确错误，调用者据此选择要回给客户端的错误页
use std::io;
use thiserror::Error;

/// HTTP Relay 的主要错误类型
#[derive(Error, Debug)]
pub enum RelayError {
    /// 请求头在上限内没有出现 CRLFCRLF 终止符
    #[error("Request headers exceed {limit} bytes without a terminator")]
    HeadersTooLarge { limit: usize },

    /// 对端在请求读取完成前关闭（`read` 为已读取的字节数）
    #[error("Unexpected EOF after {read} bytes")]
    UnexpectedEof { read: usize },

    /// 请求行少于三个 token
    #[error("Malformed request line: {0:?}")]
    MalformedRequestLine(String),

    /// 请求体比 Content-Length 声明的短
    #[error("Content-Length mismatch: expected {expected} bytes, got {received}")]
    ContentLengthMismatch { expected: u64, received: u64 },

    /// 后端连接或发送失败
    #[error("Backend {addr} unavailable: {source}")]
    BackendUnavailable {
        addr: String,
        #[source]
        source: io::Error,
    },

    /// 非法参数（如负数超时）
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// 非法状态（如重复启动）
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// I/O 错误
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Result 类型别名
pub type Result<T> = std::result::Result<T, RelayError>;

impl RelayError {
    /// 创建后端不可用错误
    pub fn backend_unavailable(addr: impl Into<String>, source: io::Error) -> Self {
        Self::BackendUnavailable {
            addr: addr.into(),
            source,
        }
    }

    /// 创建非法参数错误
    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }

    /// 创建非法状态错误
    pub fn invalid_state(msg: impl Into<String>) -> Self {
        Self::InvalidState(msg.into())
    }

    /// 请求本身违反协议（请求行错误、头过大）
    pub fn is_protocol_violation(&self) -> bool {
        matches!(
            self,
            Self::HeadersTooLarge { .. } | Self::MalformedRequestLine(_)
        )
    }

    /// 对端在请求边界处干净关闭（一个字节都没读到）
    pub fn is_clean_eof(&self) -> bool {
        matches!(self, Self::UnexpectedEof { read: 0 })
    }

    /// 检查是否为后端故障
    pub fn is_backend_fault(&self) -> bool {
        matches!(self, Self::BackendUnavailable { .. })
    }

    /// 检查是否为超时
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Io(e) if e.kind() == io::ErrorKind::TimedOut)
    }
}
