/// 转发会话
///
/// 一个入站连接对应一个 `Forwarder`：请求循环逐个读取客户端请求并决定如何转发，
/// 第一次需要发往后端时才建立后端连接，并启动后端到客户端的响应中继。
/// 两个任务共享同一个连接对，拆除由 `terminated` / `stopped` 标志和取消令牌保证只执行一次。
use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use socket2::{SockRef, TcpKeepalive};
use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, BufReader};
use tokio::net::TcpStream;
use tokio::sync::Mutex as AsyncMutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::capture::Capture;
use crate::connection::{close_with_linger, ConnectionPair, Role, StreamWriter};
use crate::dispatch::{classify, DispatchLimits, Disposition};
use crate::error::{RelayError, Result};
use crate::event::{EventReceiver, EventSender, ForwarderStatus};
use crate::header::{read_headers, ParsedHeaders, MAX_HEADER_SIZE};
use crate::io_util::{discard_exact, read_body_into, IdleTimeoutReader, DISCARD_CHUNK_SIZE};
use crate::relay::run_relay;
use crate::response::ErrorPage;

/// 读取端（客户端 socket 或后端 socket 的读半部）
pub type StreamReader = Box<dyn AsyncRead + Send + Unpin>;

/// 请求循环使用的客户端读取端
type ClientStream = BufReader<IdleTimeoutReader<StreamReader>>;

/// 关闭连接时等待缓冲数据发完的上限
pub const DEFAULT_LINGER: Duration = Duration::from_secs(1);

/// 后端连接超时
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// 后端 TCP keepalive 首次探测时间
const BACKEND_KEEPALIVE_TIME: Duration = Duration::from_secs(30);

/// 转发会话选项
#[derive(Debug, Clone)]
pub struct ForwarderOptions {
    /// 请求头块上限
    pub max_header_size: usize,
    /// 请求体分派限制
    pub limits: DispatchLimits,
    /// 后端连接超时
    pub connect_timeout: Duration,
    /// 关闭时的等待上限
    pub linger: Duration,
    /// 抓包目录（None 表示关闭抓包）
    pub capture_dir: Option<PathBuf>,
}

impl Default for ForwarderOptions {
    fn default() -> Self {
        Self {
            max_header_size: MAX_HEADER_SIZE,
            limits: DispatchLimits::default(),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            linger: DEFAULT_LINGER,
            capture_dir: None,
        }
    }
}

/// 请求循环的退出方式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LoopExit {
    /// 对端关闭或后端故障
    Gone(ForwarderStatus),
    /// 已回错误页，主动关闭
    Rejected(ErrorPage),
}

/// 请求循环与响应中继共享的状态
pub(crate) struct Shared {
    pub(crate) id: Uuid,
    pub(crate) pair: ConnectionPair,
    pub(crate) events: EventSender,
    pub(crate) cancel: CancellationToken,
    backend_addr: String,
    options: ForwarderOptions,
    capture: AsyncMutex<Option<Capture>>,
    rejection: Mutex<Option<ErrorPage>>,
    discarded: AtomicU64,
    terminated: AtomicBool,
    stopped: AtomicBool,
}

impl Shared {
    fn short_id(&self) -> String {
        self.id.simple().to_string()[..8].to_string()
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.terminated.load(Ordering::Acquire) || self.cancel.is_cancelled()
    }

    /// 写入抓包文件；出错时关闭抓包，不影响转发
    pub(crate) async fn record(&self, data: &[u8]) {
        let mut guard = self.capture.lock().await;
        if let Some(capture) = guard.as_mut() {
            if let Err(e) = capture.record(data).await {
                warn!(
                    "Forwarder {}: capture to {:?} failed, disabling: {}",
                    self.short_id(),
                    capture.path(),
                    e
                );
                *guard = None;
            }
        }
    }

    /// 因对端关闭或后端故障结束会话，只有第一次调用生效
    pub(crate) async fn terminate(&self, status: ForwarderStatus) {
        if self.terminated.swap(true, Ordering::AcqRel) {
            return;
        }
        info!(
            "Forwarder {}: {} ({} bytes transmitted)",
            self.short_id(),
            status,
            self.pair.bytes_transmitted()
        );
        self.events.status(status);
        self.cancel.cancel();
        self.close_streams().await;
    }

    /// 停止会话；重复调用为空操作，`UserClosed` 最多发出一次
    async fn stop(&self) {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        self.terminated.store(true, Ordering::Release);
        self.cancel.cancel();
        self.close_streams().await;
        debug!("Forwarder {}: stopped", self.short_id());
        self.events.status(ForwarderStatus::UserClosed);
    }

    /// 无法等待时（Drop）的停止
    fn stop_now(&self) {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        self.terminated.store(true, Ordering::Release);
        self.cancel.cancel();
        drop(self.pair.client().try_release());
        drop(self.pair.server().try_release());
        if let Ok(mut capture) = self.capture.try_lock() {
            capture.take();
        }
        self.events.status(ForwarderStatus::UserClosed);
    }

    /// 先在锁内摘下两端，再带超时地逐个关闭
    async fn close_streams(&self) {
        let detached = self.pair.detach_all().await;
        let linger = self.options.linger;
        let closing = detached
            .into_iter()
            .map(|(role, writer)| close_with_linger(role, writer, linger));
        for close in closing {
            close.await;
        }

        let mut guard = self.capture.lock().await;
        if let Some(mut capture) = guard.take() {
            let opened = capture.is_open();
            match capture.close().await {
                Ok(()) if opened => debug!(
                    "Forwarder {}: capture {:?} closed ({} bytes)",
                    self.short_id(),
                    capture.path(),
                    capture.bytes_written()
                ),
                Ok(()) => {}
                Err(e) => warn!(
                    "Forwarder {}: failed to close capture file: {}",
                    self.short_id(),
                    e
                ),
            }
        }
    }

    fn client_ip(&self) -> String {
        self.pair
            .client()
            .remote_addr()
            .map(|addr| addr.ip().to_string())
            .unwrap_or_else(|| "unknown".to_string())
    }
}

/// 一个客户端到后端的转发会话
pub struct Forwarder {
    shared: Arc<Shared>,
    client_reader: Mutex<Option<StreamReader>>,
    started: AtomicBool,
}

impl Forwarder {
    /// 为已接受的 TCP 连接创建会话
    pub fn new(
        stream: TcpStream,
        backend_addr: impl Into<String>,
        options: ForwarderOptions,
    ) -> io::Result<(Self, EventReceiver)> {
        let client_addr = stream.peer_addr()?;
        let (reader, writer) = stream.into_split();
        Ok(Self::from_parts(
            Box::new(reader),
            Box::new(writer),
            client_addr,
            backend_addr,
            options,
        ))
    }

    /// 使用任意读写端创建会话
    pub fn from_parts(
        reader: StreamReader,
        writer: StreamWriter,
        client_addr: SocketAddr,
        backend_addr: impl Into<String>,
        options: ForwarderOptions,
    ) -> (Self, EventReceiver) {
        let id = Uuid::new_v4();
        let (events, rx) = EventSender::channel();
        let capture = options
            .capture_dir
            .as_ref()
            .map(|dir| Capture::new(dir, id));

        let shared = Arc::new(Shared {
            id,
            pair: ConnectionPair::with_client(client_addr, writer),
            events,
            cancel: CancellationToken::new(),
            backend_addr: backend_addr.into(),
            options,
            capture: AsyncMutex::new(capture),
            rejection: Mutex::new(None),
            discarded: AtomicU64::new(0),
            terminated: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
        });

        let forwarder = Self {
            shared,
            client_reader: Mutex::new(Some(reader)),
            started: AtomicBool::new(false),
        };
        (forwarder, rx)
    }

    pub fn id(&self) -> Uuid {
        self.shared.id
    }

    pub fn client_addr(&self) -> Option<SocketAddr> {
        self.shared.pair.client().remote_addr()
    }

    pub fn backend_addr(&self) -> &str {
        &self.shared.backend_addr
    }

    /// 最近一次回给客户端的错误页
    pub fn rejection(&self) -> Option<ErrorPage> {
        *self.shared.rejection.lock()
    }

    /// 超大请求体被读取丢弃的字节数
    pub fn discarded_bytes(&self) -> u64 {
        self.shared.discarded.load(Ordering::Relaxed)
    }

    /// 两端累计收到的字节数
    pub fn bytes_transmitted(&self) -> u64 {
        self.shared.pair.bytes_transmitted()
    }

    /// 已启动且尚未结束
    pub fn is_running(&self) -> bool {
        self.started.load(Ordering::Acquire) && !self.shared.is_closed()
    }

    /// 启动请求循环
    ///
    /// `timeout_secs` 是客户端的空闲超时（每次读到数据后重新计时），同时限制单次向后端写入，
    /// 0 表示无限等待，负数为非法参数；
    /// 重复启动返回非法状态错误。必须在 tokio 运行时内调用。
    pub fn start(&self, timeout_secs: i64) -> Result<()> {
        if timeout_secs < 0 {
            return Err(RelayError::invalid_argument(format!(
                "timeout must not be negative (got {})",
                timeout_secs
            )));
        }
        if self.shared.stopped.load(Ordering::Acquire) {
            return Err(RelayError::invalid_state("forwarder has been stopped"));
        }
        if self.started.swap(true, Ordering::AcqRel) {
            return Err(RelayError::invalid_state("forwarder is already running"));
        }

        let reader = self
            .client_reader
            .lock()
            .take()
            .ok_or_else(|| RelayError::invalid_state("client stream already consumed"))?;

        let idle_timeout = match timeout_secs {
            0 => None,
            secs => Some(Duration::from_secs(secs as u64)),
        };

        debug!(
            "Forwarder {}: starting for {} -> {} (timeout: {:?})",
            self.shared.short_id(),
            self.shared.client_ip(),
            self.shared.backend_addr,
            idle_timeout
        );

        let shared = self.shared.clone();
        tokio::spawn(run_request_loop(shared, reader, idle_timeout));
        Ok(())
    }

    /// 停止会话：摘下两端、带超时关闭、关闭抓包文件并发出 `UserClosed`
    pub async fn stop(&self) {
        self.shared.stop().await;
    }
}

impl Drop for Forwarder {
    fn drop(&mut self) {
        // 后台任务看到取消后自行退出
        self.shared.stop_now();
    }
}

impl fmt::Display for Forwarder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Forwarder[{}] {} -> {} ({} bytes)",
            self.shared.short_id(),
            self.shared.client_ip(),
            self.shared.backend_addr,
            self.bytes_transmitted()
        )
    }
}

impl fmt::Debug for Forwarder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Forwarder")
            .field("id", &self.shared.id)
            .field("backend_addr", &self.shared.backend_addr)
            .field("pair", &self.shared.pair)
            .field("running", &self.is_running())
            .finish()
    }
}

/// 请求循环任务
async fn run_request_loop(
    shared: Arc<Shared>,
    reader: StreamReader,
    idle_timeout: Option<Duration>,
) {
    let mut client = IdleTimeoutReader::new(reader, idle_timeout);
    if shared.options.capture_dir.is_some() {
        client = client.with_tap();
    }
    let mut reader = BufReader::new(client);
    let cancel = shared.cancel.clone();

    let exit = tokio::select! {
        _ = cancel.cancelled() => {
            debug!("Forwarder {}: request loop cancelled", shared.short_id());
            return;
        }
        exit = process_requests(&shared, &mut reader, idle_timeout) => exit,
    };

    match exit {
        LoopExit::Gone(status) => shared.terminate(status).await,
        LoopExit::Rejected(page) => {
            info!(
                "Forwarder {}: rejected request from {} with {}",
                shared.short_id(),
                shared.client_ip(),
                page
            );
            shared.stop().await;
        }
    }
}

/// 把刚从客户端读到的原始字节写入抓包文件
async fn record_client(shared: &Shared, reader: &mut ClientStream) {
    if let Some(data) = reader.get_mut().take_tapped() {
        shared.record(&data).await;
    }
}

/// 依次处理同一连接上的请求，直到客户端关闭、出错或被拒绝
async fn process_requests(
    shared: &Arc<Shared>,
    reader: &mut ClientStream,
    write_timeout: Option<Duration>,
) -> LoopExit {
    let client_ip = shared.client_ip();
    let max_header_size = shared.options.max_header_size;

    loop {
        let result = read_headers(reader, &client_ip, max_header_size).await;
        record_client(shared, reader).await;
        let parsed = match result {
            Ok(parsed) => parsed,
            Err(e) if e.is_protocol_violation() => {
                warn!("Forwarder {}: {}", shared.short_id(), e);
                return reject(shared, ErrorPage::BadRequest).await;
            }
            Err(e) => {
                if !e.is_clean_eof() {
                    debug!("Forwarder {}: client read ended: {}", shared.short_id(), e);
                }
                return LoopExit::Gone(ForwarderStatus::ClientGone);
            }
        };

        let disposition = classify(&parsed, &shared.options.limits);
        debug!(
            "Forwarder {}: {} {} {} -> {:?}",
            shared.short_id(),
            parsed.method(),
            parsed.path(),
            parsed.protocol(),
            disposition
        );

        match disposition {
            Disposition::Reject(page) => return reject(shared, page).await,
            Disposition::TooLarge {
                content_length,
                discard,
            } => {
                if discard {
                    match drain_body(shared, reader, content_length).await {
                        Ok(drained) => {
                            shared.discarded.fetch_add(drained, Ordering::Relaxed);
                            shared.events.transferred(Role::Client, drained);
                        }
                        Err(e) => {
                            debug!(
                                "Forwarder {}: discarding oversized body failed: {}",
                                shared.short_id(),
                                e
                            );
                            return LoopExit::Gone(ForwarderStatus::ClientGone);
                        }
                    }
                }
                return reject(shared, ErrorPage::PayloadTooLarge).await;
            }
            Disposition::HeadersOnly => {
                let raw = parsed.into_raw();
                if let Err(exit) = forward(shared, raw, write_timeout).await {
                    return exit;
                }
            }
            Disposition::Buffered { content_length } => {
                let body = read_buffered(reader, parsed, content_length).await;
                record_client(shared, reader).await;
                let request = match body {
                    Ok(request) => request,
                    Err(e) if e.is_timeout() => {
                        debug!("Forwarder {}: client read ended: {}", shared.short_id(), e);
                        return LoopExit::Gone(ForwarderStatus::ClientGone);
                    }
                    Err(e) => {
                        warn!("Forwarder {}: {}", shared.short_id(), e);
                        return reject(shared, ErrorPage::BodyMismatch).await;
                    }
                };
                if let Err(exit) = forward(shared, request, write_timeout).await {
                    return exit;
                }
            }
        }
    }
}

/// 分块读掉超大请求体，每块读完就写入抓包，避免整段请求体积压在内存里
async fn drain_body(
    shared: &Shared,
    reader: &mut ClientStream,
    content_length: u64,
) -> io::Result<u64> {
    let mut remaining = content_length;
    while remaining > 0 {
        let step = remaining.min(DISCARD_CHUNK_SIZE as u64);
        let result = discard_exact(reader, step).await;
        record_client(shared, reader).await;
        remaining -= result?;
    }
    Ok(content_length)
}

/// 把头部块与恰好 `content_length` 字节的请求体拼成一个缓冲区
///
/// 请求体不足时返回 `ContentLengthMismatch`，客户端空闲超时原样返回 I/O 错误。
async fn read_buffered<R>(
    reader: &mut R,
    parsed: ParsedHeaders,
    content_length: u64,
) -> Result<Bytes>
where
    R: AsyncRead + Unpin,
{
    let head_len = parsed.raw().len();
    let mut request = BytesMut::from(parsed.raw());
    let received = match read_body_into(reader, &mut request, content_length).await {
        Ok(n) => n,
        Err(e) if e.kind() == io::ErrorKind::TimedOut => return Err(e.into()),
        // 读取中途出错与提前结束同样按长度不符处理
        Err(_) => (request.len() - head_len) as u64,
    };

    if received < content_length {
        return Err(RelayError::ContentLengthMismatch {
            expected: content_length,
            received,
        });
    }
    Ok(request.freeze())
}

/// 回错误页后结束请求循环
async fn reject(shared: &Shared, page: ErrorPage) -> LoopExit {
    send_error_page(shared, page).await;
    LoopExit::Rejected(page)
}

async fn send_error_page(shared: &Shared, page: ErrorPage) {
    *shared.rejection.lock() = Some(page);
    let body = page.body();
    let head = page.head(body.len());
    if let Err(e) = shared
        .pair
        .client()
        .send_vectored(&[head.as_bytes(), body.as_bytes()])
        .await
    {
        debug!(
            "Forwarder {}: failed to send {} to client: {}",
            shared.short_id(),
            page,
            e
        );
    }
}

/// 把一个完整请求发给后端，必要时先建立后端连接
async fn forward(
    shared: &Arc<Shared>,
    data: Bytes,
    write_timeout: Option<Duration>,
) -> std::result::Result<(), LoopExit> {
    if !shared.pair.server().is_attached() {
        if let Err(e) = connect_backend(shared).await {
            if !e.is_backend_fault() {
                // 连接期间会话已被停止，不再回错误页
                debug!("Forwarder {}: {}", shared.short_id(), e);
                return Err(LoopExit::Gone(ForwarderStatus::ServerUnavailable));
            }
            warn!("Forwarder {}: {}", shared.short_id(), e);
            send_error_page(shared, ErrorPage::BadGateway).await;
            return Err(LoopExit::Gone(ForwarderStatus::ServerUnavailable));
        }
    }

    let send = shared.pair.server().send(&data);
    let result = match write_timeout {
        None => send.await,
        Some(limit) => tokio::time::timeout(limit, send).await.unwrap_or_else(|_| {
            Err(io::Error::new(
                io::ErrorKind::TimedOut,
                "backend write timed out",
            ))
        }),
    };

    if let Err(e) = result {
        let err = RelayError::backend_unavailable(shared.backend_addr.clone(), e);
        warn!("Forwarder {}: {}", shared.short_id(), err);
        send_error_page(shared, ErrorPage::BadGateway).await;
        return Err(LoopExit::Gone(ForwarderStatus::ServerGone));
    }

    let len = data.len() as u64;
    shared.pair.client().add_received(len);
    shared.events.transferred(Role::Client, len);
    Ok(())
}

/// 连接后端，挂接写半部并启动响应中继
async fn connect_backend(shared: &Arc<Shared>) -> Result<()> {
    let addr = shared.backend_addr.as_str();
    let stream = tokio::time::timeout(shared.options.connect_timeout, TcpStream::connect(addr))
        .await
        .map_err(|_| {
            RelayError::backend_unavailable(
                addr,
                io::Error::new(io::ErrorKind::TimedOut, "connect timed out"),
            )
        })?
        .map_err(|e| RelayError::backend_unavailable(addr, e))?;

    if let Err(e) = stream.set_nodelay(true) {
        warn!("Failed to set TCP_NODELAY on backend connection: {}", e);
    }
    let keepalive = TcpKeepalive::new().with_time(BACKEND_KEEPALIVE_TIME);
    if let Err(e) = SockRef::from(&stream).set_tcp_keepalive(&keepalive) {
        debug!("Failed to enable keepalive on backend connection: {}", e);
    }
    if let Ok(peer) = stream.peer_addr() {
        shared.pair.server().set_remote_addr(peer);
    }

    let (reader, writer) = stream.into_split();
    shared.pair.server().attach(Box::new(writer)).await;
    if shared.is_closed() {
        drop(shared.pair.server().release().await);
        return Err(RelayError::invalid_state("forwarder closed while connecting"));
    }

    info!(
        "Forwarder {}: connected to backend {}",
        shared.short_id(),
        addr
    );
    shared.events.status(ForwarderStatus::Established);
    tokio::spawn(run_relay(shared.clone(), Role::Server, Box::new(reader)));
    Ok(())
}
