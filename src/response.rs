/// 固定错误响应
///
/// 拒绝请求时直接回给客户端的 HTTP 错误页，发送后连接即关闭
use std::fmt;

/// 405 响应中列出的受支持方法
pub const ALLOWED_METHODS: &str = "GET, HEAD, POST, OPTIONS";

/// 错误页种类
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorPage {
    /// 请求头过大或格式错误
    BadRequest,
    /// Content-Length 与实际请求体不符
    BodyMismatch,
    /// POST 没有 Content-Length
    LengthRequired,
    /// 不支持的方法
    MethodNotAllowed,
    /// 请求体超过上限
    PayloadTooLarge,
    /// 后端连接或发送失败
    BadGateway,
}

impl ErrorPage {
    pub fn status(self) -> u16 {
        match self {
            ErrorPage::BadRequest | ErrorPage::BodyMismatch => 400,
            ErrorPage::LengthRequired => 411,
            ErrorPage::MethodNotAllowed => 405,
            ErrorPage::PayloadTooLarge => 413,
            ErrorPage::BadGateway => 502,
        }
    }

    pub fn reason(self) -> &'static str {
        match self {
            ErrorPage::BadRequest | ErrorPage::BodyMismatch => "Bad Request",
            ErrorPage::LengthRequired => "Length Required",
            ErrorPage::MethodNotAllowed => "Method Not Allowed",
            ErrorPage::PayloadTooLarge => "Payload Too Large",
            ErrorPage::BadGateway => "Bad Gateway",
        }
    }

    fn message(self) -> &'static str {
        match self {
            ErrorPage::BadRequest => "The request headers are malformed or too large.",
            ErrorPage::BodyMismatch => {
                "The request body did not match the declared Content-Length."
            }
            ErrorPage::LengthRequired => "A POST request must declare a Content-Length.",
            ErrorPage::MethodNotAllowed => {
                "Only GET, HEAD, POST and OPTIONS requests are accepted."
            }
            // 保持页面总长为 240 字节
            ErrorPage::PayloadTooLarge => {
                "The request body exceeds the 100,000,000 byte limit accepted by this relay. \
                 The request was discarded and the connection was closed."
            }
            ErrorPage::BadGateway => "The backend server could not be reached.",
        }
    }

    /// HTML 正文
    pub fn body(self) -> String {
        format!(
            "<html><head><title>{code} {reason}</title></head><body><h1>{reason}</h1><p>{message}</p></body></html>",
            code = self.status(),
            reason = self.reason(),
            message = self.message(),
        )
    }

    /// 状态行加响应头（含结尾空行）
    pub fn head(self, body_len: usize) -> String {
        let mut head = format!(
            "HTTP/1.1 {} {}\r\nContent-Type: text/html; charset=utf-8\r\nContent-Length: {}\r\nConnection: Close\r\n",
            self.status(),
            self.reason(),
            body_len
        );
        if self == ErrorPage::MethodNotAllowed {
            head.push_str("Allow: ");
            head.push_str(ALLOWED_METHODS);
            head.push_str("\r\n");
        }
        head.push_str("\r\n");
        head
    }
}

impl fmt::Display for ErrorPage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.status(), self.reason())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn text(page: ErrorPage) -> String {
        let body = page.body();
        page.head(body.len()) + &body
    }

    #[test]
    fn test_status_lines() {
        assert!(text(ErrorPage::BadRequest).starts_with("HTTP/1.1 400 Bad Request\r\n"));
        assert!(text(ErrorPage::BodyMismatch).starts_with("HTTP/1.1 400 Bad Request\r\n"));
        assert!(text(ErrorPage::LengthRequired).starts_with("HTTP/1.1 411 Length Required\r\n"));
        assert!(text(ErrorPage::MethodNotAllowed)
            .starts_with("HTTP/1.1 405 Method Not Allowed\r\n"));
        assert!(text(ErrorPage::PayloadTooLarge).starts_with("HTTP/1.1 413 Payload Too Large\r\n"));
        assert!(text(ErrorPage::BadGateway).starts_with("HTTP/1.1 502 Bad Gateway\r\n"));
    }

    #[test]
    fn test_allow_header_only_on_405() {
        assert!(text(ErrorPage::MethodNotAllowed)
            .contains("\r\nAllow: GET, HEAD, POST, OPTIONS\r\n"));
        assert!(!text(ErrorPage::BadRequest).contains("Allow:"));
    }

    #[test]
    fn test_payload_too_large_length() {
        assert_eq!(ErrorPage::PayloadTooLarge.body().len(), 240);
        assert!(text(ErrorPage::PayloadTooLarge).contains("\r\nContent-Length: 240\r\n"));
    }

    #[test]
    fn test_content_length_matches_body() {
        for page in [
            ErrorPage::BadRequest,
            ErrorPage::BodyMismatch,
            ErrorPage::LengthRequired,
            ErrorPage::MethodNotAllowed,
            ErrorPage::PayloadTooLarge,
            ErrorPage::BadGateway,
        ] {
            let full = text(page);
            let (head, body) = full.split_once("\r\n\r\n").unwrap();
            assert!(head.contains(&format!("Content-Length: {}", body.len())));
            assert!(head.contains("Connection: Close"));
        }
    }
}
