/// 请求分派策略
///
/// 根据解析出的请求头决定：缓冲后转发、原样转发、还是直接拒绝
use crate::header::{ParsedHeaders, MAX_BODY_SIZE};
use crate::response::ErrorPage;

/// 分派限制
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DispatchLimits {
    /// 允许缓冲转发的最大请求体
    pub max_body_size: u64,
    /// 拒绝超大请求体前是否先读掉声明的字节数
    pub discard_oversized: bool,
}

impl Default for DispatchLimits {
    fn default() -> Self {
        Self {
            max_body_size: MAX_BODY_SIZE,
            discard_oversized: true,
        }
    }
}

/// 一个请求的处理方式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// 头部加 `content_length` 字节请求体读入内存后一次性发给后端
    Buffered { content_length: u64 },
    /// 只转发头部，不读取请求体
    HeadersOnly,
    /// 请求体超过上限：按需丢弃后回 413
    TooLarge { content_length: u64, discard: bool },
    /// 回错误页并关闭连接
    Reject(ErrorPage),
}

/// 请求是否属于受支持的方法
pub fn is_supported_method(method: &str) -> bool {
    matches!(method, "GET" | "HEAD" | "POST" | "OPTIONS")
}

/// 决定一个请求的处理方式
///
/// 不受支持的方法一律 405，其余按 Content-Length 分支：
/// 大于上限为 413，大于 0 为缓冲转发；没有长度时 GET/HEAD/OPTIONS 原样转发，
/// POST 回 411。`Content-Length: 0` 视为只有头部。
pub fn classify(headers: &ParsedHeaders, limits: &DispatchLimits) -> Disposition {
    let method = headers.method();
    if !is_supported_method(method) {
        return Disposition::Reject(ErrorPage::MethodNotAllowed);
    }

    match headers.content_length() {
        Some(len) if len > limits.max_body_size => Disposition::TooLarge {
            content_length: len,
            discard: limits.discard_oversized,
        },
        Some(len) if len > 0 => Disposition::Buffered { content_length: len },
        Some(_) => Disposition::HeadersOnly,
        None if method == "POST" => Disposition::Reject(ErrorPage::LengthRequired),
        None => Disposition::HeadersOnly,
    }
}
