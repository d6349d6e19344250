/// I/O 辅助模块
///
/// 请求体的定长读取、超大请求体的分块丢弃、带空闲超时的读取端，以及批量写入
use bytes::{Bytes, BytesMut};
use std::future::Future;
use std::io::{self, IoSlice};
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt, ReadBuf};
use tokio::time::Sleep;

/// 丢弃时每块的最大大小，与请求头上限保持一致以限制临时内存
pub const DISCARD_CHUNK_SIZE: usize = crate::header::MAX_HEADER_SIZE;

/// 读取请求体时每次读取的块大小
const BODY_READ_CHUNK: usize = 64 * 1024;

/// 从流中丢弃恰好 `count` 个字节
///
/// 按不超过 `DISCARD_CHUNK_SIZE` 的块循环读取。流在读满之前结束时返回
/// `UnexpectedEof`，错误中不区分具体原因，调用方一律按对端意外关闭处理。
pub async fn discard_exact<R>(reader: &mut R, count: u64) -> io::Result<u64>
where
    R: AsyncRead + Unpin,
{
    let chunk = (count.min(DISCARD_CHUNK_SIZE as u64) as usize).max(1);
    let mut buf = vec![0u8; chunk];
    let mut remaining = count;

    while remaining > 0 {
        let want = remaining.min(chunk as u64) as usize;
        let n = reader.read(&mut buf[..want]).await?;
        if n == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!(
                    "stream ended after discarding {} of {} bytes",
                    count - remaining,
                    count
                ),
            ));
        }
        remaining -= n as u64;
    }

    Ok(count)
}

/// 向 `buf` 追加恰好 `count` 个字节
///
/// 返回实际读到的字节数；小于 `count` 说明流提前结束。
/// 缓冲区随数据到达逐块增长，声明的长度本身不会导致预先分配。
pub async fn read_body_into<R>(reader: &mut R, buf: &mut BytesMut, count: u64) -> io::Result<u64>
where
    R: AsyncRead + Unpin,
{
    let mut received = 0u64;

    while received < count {
        let want = (count - received).min(BODY_READ_CHUNK as u64) as usize;
        let start = buf.len();
        buf.resize(start + want, 0);
        let n = match reader.read(&mut buf[start..]).await {
            Ok(n) => n,
            Err(e) => {
                buf.truncate(start);
                return Err(e);
            }
        };
        buf.truncate(start + n);
        if n == 0 {
            break;
        }
        received += n as u64;
    }

    Ok(received)
}

/// 带空闲超时的读取端
///
/// 超时只计算等待数据的时间：每次读到数据后重新计时，调用方在两次读取之间
/// 处理数据的时间不计入。开启 tap 后读到的每个字节都会留一份副本，
/// 由调用方通过 [`take_tapped`](Self::take_tapped) 取走。
pub struct IdleTimeoutReader<R> {
    inner: R,
    idle_timeout: Option<Duration>,
    deadline: Option<Pin<Box<Sleep>>>,
    tap: Option<BytesMut>,
}

impl<R> IdleTimeoutReader<R> {
    /// `idle_timeout` 为 None 时无限等待
    pub fn new(inner: R, idle_timeout: Option<Duration>) -> Self {
        Self {
            inner,
            idle_timeout,
            deadline: None,
            tap: None,
        }
    }

    /// 保留读到的原始字节
    pub fn with_tap(mut self) -> Self {
        self.tap = Some(BytesMut::new());
        self
    }

    /// 取走上次调用以来读到的字节；未开启 tap 或没有新数据时返回 None
    pub fn take_tapped(&mut self) -> Option<Bytes> {
        self.tap
            .as_mut()
            .filter(|tap| !tap.is_empty())
            .map(|tap| tap.split().freeze())
    }
}

impl<R> AsyncRead for IdleTimeoutReader<R>
where
    R: AsyncRead + Unpin,
{
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = &mut *self;
        let before = buf.filled().len();

        match Pin::new(&mut this.inner).poll_read(cx, buf) {
            Poll::Ready(result) => {
                this.deadline = None;
                if result.is_ok() {
                    if let Some(tap) = this.tap.as_mut() {
                        tap.extend_from_slice(&buf.filled()[before..]);
                    }
                }
                Poll::Ready(result)
            }
            Poll::Pending => {
                let Some(limit) = this.idle_timeout else {
                    return Poll::Pending;
                };
                let deadline = this
                    .deadline
                    .get_or_insert_with(|| Box::pin(tokio::time::sleep(limit)));
                match deadline.as_mut().poll(cx) {
                    Poll::Ready(()) => {
                        this.deadline = None;
                        Poll::Ready(Err(io::Error::new(
                            io::ErrorKind::TimedOut,
                            format!("client idle for {:?}", limit),
                        )))
                    }
                    Poll::Pending => Poll::Pending,
                }
            }
        }
    }
}

/// 批量写入辅助函数 - 使用 write_vectored 减少系统调用
///
/// # 示例
/// ```rust
/// use http_relay::io_util::write_vectored_all;
///
/// # async fn example(stream: &mut tokio::net::TcpStream) -> std::io::Result<()> {
/// let head = b"HTTP/1.1 400 Bad Request\r\nContent-Length: 2\r\n\r\n";
/// write_vectored_all(stream, &[head, b"no"]).await?;
/// # Ok(())
/// # }
/// ```
pub async fn write_vectored_all<W>(writer: &mut W, bufs: &[&[u8]]) -> io::Result<()>
where
    W: AsyncWriteExt + Unpin,
{
    if bufs.is_empty() {
        return Ok(());
    }

    if bufs.len() == 1 {
        writer.write_all(bufs[0]).await?;
        return writer.flush().await;
    }

    // (缓冲区下标, 缓冲区内偏移)
    let mut index = 0;
    let mut offset = 0;

    loop {
        while index < bufs.len() && bufs[index].len() == offset {
            index += 1;
            offset = 0;
        }
        if index == bufs.len() {
            break;
        }

        let slices: Vec<IoSlice> = std::iter::once(IoSlice::new(&bufs[index][offset..]))
            .chain(bufs[index + 1..].iter().map(|b| IoSlice::new(b)))
            .collect();

        let mut n = match writer.write_vectored(&slices).await {
            Ok(0) => {
                return Err(io::Error::new(
                    io::ErrorKind::WriteZero,
                    "failed to write vectored data",
                ))
            }
            Ok(n) => n,
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        };

        // 前进到第一个未写完的缓冲区
        while index < bufs.len() && n > 0 {
            let left = bufs[index].len() - offset;
            if n >= left {
                n -= left;
                index += 1;
                offset = 0;
            } else {
                offset += n;
                n = 0;
            }
        }
    }

    writer.flush().await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_discard_exact_leaves_rest() {
        let data = b"0123456789tail";
        let mut reader = &data[..];
        let n = discard_exact(&mut reader, 10).await.unwrap();
        assert_eq!(n, 10);
        assert_eq!(reader, b"tail");
    }

    #[tokio::test]
    async fn test_discard_exact_short_stream() {
        let mut reader = &b"abc"[..];
        let err = discard_exact(&mut reader, 10).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }

    #[tokio::test]
    async fn test_discard_across_chunks() {
        // 超过一个块大小，需要多次循环
        let total = DISCARD_CHUNK_SIZE as u64 * 2 + 17;
        let mut reader = tokio::io::repeat(0).take(total + 3);
        assert_eq!(discard_exact(&mut reader, total).await.unwrap(), total);

        let mut rest = Vec::new();
        reader.read_to_end(&mut rest).await.unwrap();
        assert_eq!(rest.len(), 3);
    }

    #[tokio::test]
    async fn test_discard_zero() {
        let mut reader = &b"xyz"[..];
        assert_eq!(discard_exact(&mut reader, 0).await.unwrap(), 0);
        assert_eq!(reader, b"xyz");
    }

    #[tokio::test]
    async fn test_read_body_into_exact() {
        let mut reader = &b"helloworld"[..];
        let mut buf = BytesMut::from(&b"HEAD:"[..]);
        let n = read_body_into(&mut reader, &mut buf, 5).await.unwrap();
        assert_eq!(n, 5);
        assert_eq!(&buf[..], b"HEAD:hello");
        assert_eq!(reader, b"world");
    }

    #[tokio::test]
    async fn test_read_body_into_short() {
        let mut reader = &b"he"[..];
        let mut buf = BytesMut::new();
        let n = read_body_into(&mut reader, &mut buf, 5).await.unwrap();
        assert_eq!(n, 2);
        assert_eq!(&buf[..], b"he");
    }

    #[tokio::test]
    async fn test_read_body_from_fragmented_stream() {
        let (mut tx, mut rx) = tokio::io::duplex(8);
        let writer = tokio::spawn(async move {
            for chunk in [&b"ab"[..], b"cdef", b"ghij"] {
                tx.write_all(chunk).await.unwrap();
            }
        });

        let mut buf = BytesMut::new();
        let n = read_body_into(&mut rx, &mut buf, 10).await.unwrap();
        writer.await.unwrap();
        assert_eq!(n, 10);
        assert_eq!(&buf[..], b"abcdefghij");
    }

    #[tokio::test]
    async fn test_read_body_into_grows_with_data() {
        // 声明 100MB 但只到达 2 字节，缓冲区不应按声明长度分配
        let mut reader = &b"he"[..];
        let mut buf = BytesMut::new();
        let n = read_body_into(&mut reader, &mut buf, 100_000_000).await.unwrap();
        assert_eq!(n, 2);
        assert!(buf.capacity() <= 2 * BODY_READ_CHUNK);
    }

    #[tokio::test]
    async fn test_idle_timeout_resets_on_each_read() {
        let (mut tx, rx) = tokio::io::duplex(64);
        let writer = tokio::spawn(async move {
            // 总耗时超过空闲超时，但每次间隔都短于它
            for byte in b"0123456789" {
                tokio::time::sleep(Duration::from_millis(60)).await;
                tx.write_all(&[*byte]).await.unwrap();
            }
            tx
        });

        let mut reader = IdleTimeoutReader::new(rx, Some(Duration::from_millis(300)));
        let mut buf = [0u8; 10];
        reader.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"0123456789");
        drop(writer.await.unwrap());
    }

    #[tokio::test]
    async fn test_idle_timeout_expires() {
        let (_tx, rx) = tokio::io::duplex(64);
        let mut reader = IdleTimeoutReader::new(rx, Some(Duration::from_millis(50)));
        let mut buf = [0u8; 1];
        let err = reader.read(&mut buf).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::TimedOut);
    }

    #[tokio::test]
    async fn test_tap_keeps_raw_bytes() {
        let data = b"GET / HTTP/1.1\r\n\r\nnext";
        let reader = IdleTimeoutReader::new(&data[..], None).with_tap();
        let mut reader = tokio::io::BufReader::new(reader);

        let mut first = [0u8; 4];
        reader.read_exact(&mut first).await.unwrap();
        // BufReader 一次读入全部数据，tap 记录的是实际到达的字节
        assert_eq!(reader.get_mut().take_tapped().unwrap(), &data[..]);
        assert!(reader.get_mut().take_tapped().is_none());

        let mut untapped = IdleTimeoutReader::new(&data[..], None);
        let mut all = Vec::new();
        untapped.read_to_end(&mut all).await.unwrap();
        assert!(untapped.take_tapped().is_none());
    }

    #[tokio::test]
    async fn test_write_vectored_all() {
        let mut buffer = Vec::new();
        write_vectored_all(&mut buffer, &[b"Hello, ", b"", b"World", b"!"])
            .await
            .unwrap();
        assert_eq!(&buffer, b"Hello, World!");
    }

    #[tokio::test]
    async fn test_write_vectored_all_single_and_empty() {
        let mut buffer = Vec::new();
        write_vectored_all(&mut buffer, &[]).await.unwrap();
        assert!(buffer.is_empty());

        write_vectored_all(&mut buffer, &[b"Single buffer"]).await.unwrap();
        assert_eq!(&buffer, b"Single buffer");
    }

    #[tokio::test]
    async fn test_write_vectored_partial_writes() {
        // duplex 容量很小，强制多次部分写入
        let (mut tx, mut rx) = tokio::io::duplex(3);
        let reader = tokio::spawn(async move {
            let mut out = Vec::new();
            rx.read_to_end(&mut out).await.unwrap();
            out
        });

        write_vectored_all(&mut tx, &[b"abcde", b"fg", b"hijkl"])
            .await
            .unwrap();
        drop(tx);
        assert_eq!(reader.await.unwrap(), b"abcdefghijkl");
    }
}
