/// HTTP 请求头读取模块
///
/// 逐字节读取一个请求的头部块（直到 CRLFCRLF），限制最大大小防止内存耗尽，
/// 并注入携带真实客户端地址的 `X-Forwarded-For` 头
use bytes::{BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::error::{RelayError, Result};

/// HTTP 请求头最大大小（1,000,000 字节）
pub const MAX_HEADER_SIZE: usize = 1_000_000;

/// 缓冲转发的请求体最大大小（100,000,000 字节）
pub const MAX_BODY_SIZE: u64 = 100_000_000;

/// 携带真实客户端地址的转发头
pub const FORWARDED_FOR: &str = "X-Forwarded-For";

/// 请求行中提取出的伪头（以下划线开头，客户端同名行会被忽略）
pub const METHOD_KEY: &str = "_Method";
pub const PATH_KEY: &str = "_Path";
pub const PROTOCOL_KEY: &str = "_Protocol";

const TERMINATOR: &[u8] = b"\r\n\r\n";
const CRLF: &[u8] = b"\r\n";

/// 保持插入顺序的请求头表，键区分大小写
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HeaderMap {
    entries: Vec<(String, String)>,
}

impl HeaderMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// 按原样（区分大小写）查找
    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.as_str())
    }

    /// 忽略大小写查找
    pub fn get_ignore_case(&self, name: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    /// 追加一个值，同名头的值用 "; " 连接
    pub fn append(&mut self, name: &str, value: &str) {
        match self.entries.iter_mut().find(|(key, _)| key == name) {
            Some((_, existing)) => {
                existing.push_str("; ");
                existing.push_str(value);
            }
            None => self.entries.push((name.to_string(), value.to_string())),
        }
    }

    /// 设置（覆盖）一个值
    pub fn set(&mut self, name: &str, value: &str) {
        match self.entries.iter_mut().find(|(key, _)| key == name) {
            Some((_, existing)) => *existing = value.to_string(),
            None => self.entries.push((name.to_string(), value.to_string())),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

/// 一个请求头部块的解析结果
#[derive(Debug, Clone)]
pub struct ParsedHeaders {
    headers: HeaderMap,
    raw: Bytes,
}

impl ParsedHeaders {
    /// 大写的请求方法
    pub fn method(&self) -> &str {
        self.headers.get(METHOD_KEY).unwrap_or_default()
    }

    pub fn path(&self) -> &str {
        self.headers.get(PATH_KEY).unwrap_or_default()
    }

    pub fn protocol(&self) -> &str {
        self.headers.get(PROTOCOL_KEY).unwrap_or_default()
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// 转发给后端的原始头部块（已注入转发头，包含结尾空行）
    pub fn raw(&self) -> &[u8] {
        &self.raw
    }

    pub fn into_raw(self) -> Bytes {
        self.raw
    }

    pub fn forwarded_for(&self) -> Option<&str> {
        self.headers.get(FORWARDED_FOR)
    }

    /// 解析 Content-Length；缺失或无法解析为非负整数时返回 None
    pub fn content_length(&self) -> Option<u64> {
        self.headers
            .get_ignore_case("Content-Length")
            .and_then(|v| v.trim().parse::<u64>().ok())
    }
}

/// 从流中读取一个请求的头部块
///
/// 每次读取一个字节，直到最后四个字节为 CRLFCRLF，或累计达到 `limit`。
/// 调用方应传入带缓冲的读取器（如 `BufReader`），未消费的字节会留在缓冲中
/// 供读取请求体或下一个请求使用。
pub async fn read_headers<R>(
    reader: &mut R,
    client_addr: &str,
    limit: usize,
) -> Result<ParsedHeaders>
where
    R: AsyncRead + Unpin,
{
    let mut block = Vec::with_capacity(1024);
    let mut byte = [0u8; 1];

    loop {
        let n = reader.read(&mut byte).await?;
        if n == 0 {
            return Err(RelayError::UnexpectedEof { read: block.len() });
        }
        block.push(byte[0]);

        if block.ends_with(TERMINATOR) {
            break;
        }
        if block.len() >= limit {
            return Err(RelayError::HeadersTooLarge { limit });
        }
    }

    parse_header_block(&block, client_addr)
}

/// 解析完整的头部块（必须以 CRLFCRLF 结尾）
///
/// 客户端自带的 `X-Forwarded-For` 行会从表和转发字节中同时去掉，
/// 然后在结尾空行之前注入真实地址。
pub fn parse_header_block(block: &[u8], client_addr: &str) -> Result<ParsedHeaders> {
    let body = block.strip_suffix(TERMINATOR).unwrap_or(block);
    let mut lines = split_crlf(body);

    let request_line = lines.next().unwrap_or_default();
    let request_text = String::from_utf8_lossy(request_line);
    let tokens: Vec<&str> = request_text.split(' ').filter(|t| !t.is_empty()).collect();
    if tokens.len() < 3 {
        return Err(RelayError::MalformedRequestLine(request_text.into_owned()));
    }

    let mut headers = HeaderMap::new();
    headers.set(METHOD_KEY, &tokens[0].to_ascii_uppercase());
    headers.set(PATH_KEY, &tokens[1..tokens.len() - 1].join(" "));
    headers.set(PROTOCOL_KEY, tokens[tokens.len() - 1]);

    let mut raw =
        BytesMut::with_capacity(block.len() + FORWARDED_FOR.len() + client_addr.len() + 4);
    raw.put_slice(request_line);
    raw.put_slice(CRLF);

    for line in lines {
        let text = String::from_utf8_lossy(line);
        if let Some((name, value)) = text.split_once(':') {
            if name.trim().eq_ignore_ascii_case(FORWARDED_FOR) {
                continue;
            }
            if !name.starts_with('_') {
                headers.append(name, value.trim_matches(|c| c == ' ' || c == '\t'));
            }
        }
        raw.put_slice(line);
        raw.put_slice(CRLF);
    }

    raw.put_slice(FORWARDED_FOR.as_bytes());
    raw.put_slice(b": ");
    raw.put_slice(client_addr.as_bytes());
    raw.put_slice(CRLF);
    raw.put_slice(CRLF);

    headers.set(FORWARDED_FOR, client_addr);

    Ok(ParsedHeaders {
        headers,
        raw: raw.freeze(),
    })
}

/// 按 CRLF 切分字节行
fn split_crlf(data: &[u8]) -> impl Iterator<Item = &[u8]> {
    let mut rest = Some(data);
    std::iter::from_fn(move || {
        let current = rest?;
        match current.windows(2).position(|w| w == CRLF) {
            Some(pos) => {
                rest = Some(&current[pos + 2..]);
                Some(&current[..pos])
            }
            None => {
                rest = None;
                Some(current)
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, BufReader};

    #[tokio::test]
    async fn test_read_simple_get() {
        let mut reader = BufReader::new(&b"GET /x HTTP/1.1\r\nHost: h\r\n\r\n"[..]);
        let parsed = read_headers(&mut reader, "10.0.0.7", MAX_HEADER_SIZE)
            .await
            .unwrap();

        assert_eq!(parsed.method(), "GET");
        assert_eq!(parsed.path(), "/x");
        assert_eq!(parsed.protocol(), "HTTP/1.1");
        assert_eq!(parsed.headers().get("Host"), Some("h"));
        assert_eq!(parsed.forwarded_for(), Some("10.0.0.7"));
        assert_eq!(
            parsed.raw(),
            &b"GET /x HTTP/1.1\r\nHost: h\r\nX-Forwarded-For: 10.0.0.7\r\n\r\n"[..]
        );
    }

    #[tokio::test]
    async fn test_leaves_body_in_reader() {
        let mut reader =
            BufReader::new(&b"POST /x HTTP/1.1\r\nContent-Length: 5\r\n\r\nhello"[..]);
        let parsed = read_headers(&mut reader, "1.2.3.4", MAX_HEADER_SIZE)
            .await
            .unwrap();
        assert_eq!(parsed.content_length(), Some(5));

        let mut rest = Vec::new();
        reader.read_to_end(&mut rest).await.unwrap();
        assert_eq!(rest, b"hello");
    }

    #[tokio::test]
    async fn test_headers_too_large() {
        let mut reader = tokio::io::repeat(b'a');
        let err = read_headers(&mut reader, "1.2.3.4", 64).await.unwrap_err();
        assert!(matches!(err, RelayError::HeadersTooLarge { limit: 64 }));
    }

    #[tokio::test]
    async fn test_eof_before_terminator() {
        let mut reader = &b"GET / HTTP/1.1\r\nHost"[..];
        let err = read_headers(&mut reader, "1.2.3.4", MAX_HEADER_SIZE)
            .await
            .unwrap_err();
        assert!(matches!(err, RelayError::UnexpectedEof { read: 20 }));

        let mut empty = &b""[..];
        let err = read_headers(&mut empty, "1.2.3.4", MAX_HEADER_SIZE)
            .await
            .unwrap_err();
        assert!(err.is_clean_eof());
    }

    #[test]
    fn test_malformed_request_line() {
        let err = parse_header_block(b"GET /\r\nHost: h\r\n\r\n", "1.2.3.4").unwrap_err();
        assert!(matches!(err, RelayError::MalformedRequestLine(_)));
    }

    #[test]
    fn test_method_uppercased_and_path_rejoined() {
        let parsed = parse_header_block(b"get /a b  c HTTP/1.0\r\n\r\n", "1.2.3.4").unwrap();
        assert_eq!(parsed.method(), "GET");
        assert_eq!(parsed.path(), "/a b c");
        assert_eq!(parsed.protocol(), "HTTP/1.0");
    }

    #[test]
    fn test_repeated_headers_concatenated() {
        let parsed = parse_header_block(
            b"GET / HTTP/1.1\r\nCookie: a=1\r\nAccept: */*\r\nCookie: b=2\r\n\r\n",
            "1.2.3.4",
        )
        .unwrap();
        assert_eq!(parsed.headers().get("Cookie"), Some("a=1; b=2"));
        // 键区分大小写
        assert_eq!(parsed.headers().get("cookie"), None);
        assert_eq!(parsed.headers().get_ignore_case("cookie"), Some("a=1; b=2"));
    }

    #[test]
    fn test_client_forwarded_for_is_overridden() {
        let parsed = parse_header_block(
            b"GET / HTTP/1.1\r\nx-forwarded-for: 6.6.6.6\r\nHost: h\r\n\r\n",
            "192.168.1.9",
        )
        .unwrap();
        assert_eq!(parsed.forwarded_for(), Some("192.168.1.9"));
        assert_eq!(parsed.headers().get("x-forwarded-for"), None);
        assert_eq!(
            parsed.raw(),
            &b"GET / HTTP/1.1\r\nHost: h\r\nX-Forwarded-For: 192.168.1.9\r\n\r\n"[..]
        );
    }

    #[test]
    fn test_other_x_headers_are_kept() {
        let parsed = parse_header_block(
            b"GET / HTTP/1.1\r\nX-Request-Id: 42\r\nX-Forwarded-Forward: no\r\n\r\n",
            "1.2.3.4",
        )
        .unwrap();
        assert_eq!(parsed.headers().get("X-Request-Id"), Some("42"));
        assert_eq!(parsed.headers().get("X-Forwarded-Forward"), Some("no"));
    }

    #[test]
    fn test_pseudo_header_lines_are_skipped() {
        let parsed = parse_header_block(
            b"GET / HTTP/1.1\r\n_Method: DELETE\r\nHost: h\r\n\r\n",
            "1.2.3.4",
        )
        .unwrap();
        assert_eq!(parsed.method(), "GET");
        assert_eq!(parsed.headers().get("Host"), Some("h"));
    }

    #[test]
    fn test_header_value_without_space() {
        let parsed =
            parse_header_block(b"GET / HTTP/1.1\r\nHost:h\r\nBare\r\n\r\n", "1.2.3.4").unwrap();
        assert_eq!(parsed.headers().get("Host"), Some("h"));
        assert_eq!(parsed.headers().get("Bare"), None);
    }

    #[test]
    fn test_content_length_variants() {
        let parse = |block: &[u8]| parse_header_block(block, "1.2.3.4").unwrap();

        assert_eq!(
            parse(b"POST / HTTP/1.1\r\ncontent-length: 12\r\n\r\n").content_length(),
            Some(12)
        );
        assert_eq!(
            parse(b"POST / HTTP/1.1\r\nContent-Length: abc\r\n\r\n").content_length(),
            None
        );
        assert_eq!(
            parse(b"POST / HTTP/1.1\r\nContent-Length: -5\r\n\r\n").content_length(),
            None
        );
        assert_eq!(parse(b"POST / HTTP/1.1\r\n\r\n").content_length(), None);
    }
}
