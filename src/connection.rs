/// 连接对
///
/// 一个转发会话的两个端点（客户端、后端）按槽位存放在同一个结构里，
/// 通过 `Role` 而不是互相引用来找到对端
use parking_lot::Mutex;
use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::ops::Index;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex as AsyncMutex;
use tracing::debug;

use crate::io_util::write_vectored_all;

/// 写入端（客户端 socket 或后端 socket 的写半部）
pub type StreamWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// 端点角色
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    Client,
    Server,
}

impl Role {
    /// 对端角色
    pub fn peer(self) -> Role {
        match self {
            Role::Client => Role::Server,
            Role::Server => Role::Client,
        }
    }

    fn slot(self) -> usize {
        match self {
            Role::Client => 0,
            Role::Server => 1,
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Client => write!(f, "client"),
            Role::Server => write!(f, "server"),
        }
    }
}

/// 一个端点
///
/// 读半部由各自的任务独占（请求循环读客户端，响应中继读后端），
/// 这里只保存共享的写半部。写半部为 `None` 表示已释放，之后的写入都会失败。
pub struct Connection {
    role: Role,
    remote_addr: Mutex<Option<SocketAddr>>,
    writer: AsyncMutex<Option<StreamWriter>>,
    attached: AtomicBool,
    received: AtomicU64,
}

impl Connection {
    fn new(role: Role, remote_addr: Option<SocketAddr>, writer: Option<StreamWriter>) -> Self {
        Self {
            role,
            remote_addr: Mutex::new(remote_addr),
            attached: AtomicBool::new(writer.is_some()),
            writer: AsyncMutex::new(writer),
            received: AtomicU64::new(0),
        }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    /// 该端点所连远端的地址
    pub fn remote_addr(&self) -> Option<SocketAddr> {
        *self.remote_addr.lock()
    }

    pub fn set_remote_addr(&self, addr: SocketAddr) {
        *self.remote_addr.lock() = Some(addr);
    }

    /// 挂接写半部
    pub async fn attach(&self, writer: StreamWriter) {
        let mut slot = self.writer.lock().await;
        *slot = Some(writer);
        self.attached.store(true, Ordering::Release);
    }

    /// 写半部是否仍然可用
    pub fn is_attached(&self) -> bool {
        self.attached.load(Ordering::Acquire)
    }

    /// 通过该端点发送数据；已释放时返回 `NotConnected`
    pub async fn send(&self, data: &[u8]) -> io::Result<()> {
        let mut slot = self.writer.lock().await;
        let writer = slot.as_mut().ok_or_else(|| self.not_connected())?;
        writer.write_all(data).await?;
        writer.flush().await
    }

    /// 批量发送多个缓冲区
    pub async fn send_vectored(&self, bufs: &[&[u8]]) -> io::Result<()> {
        let mut slot = self.writer.lock().await;
        let writer = slot.as_mut().ok_or_else(|| self.not_connected())?;
        write_vectored_all(writer, bufs).await
    }

    /// 取走写半部，之后该端点不可再写。重复调用返回 `None`
    pub async fn release(&self) -> Option<StreamWriter> {
        self.attached.store(false, Ordering::Release);
        self.writer.lock().await.take()
    }

    /// 非阻塞释放，用于 `Drop` 等无法等待的场合。锁被占用时返回 `None`，
    /// 此时写半部随持锁任务结束后的最后一个引用一起释放。
    pub fn try_release(&self) -> Option<StreamWriter> {
        self.attached.store(false, Ordering::Release);
        self.writer.try_lock().ok().and_then(|mut slot| slot.take())
    }

    /// 累加从该端点收到的字节数，返回新的累计值
    pub fn add_received(&self, bytes: u64) -> u64 {
        self.received.fetch_add(bytes, Ordering::Relaxed) + bytes
    }

    pub fn received(&self) -> u64 {
        self.received.load(Ordering::Relaxed)
    }

    fn not_connected(&self) -> io::Error {
        io::Error::new(
            io::ErrorKind::NotConnected,
            format!("{} connection already released", self.role),
        )
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("role", &self.role)
            .field("remote_addr", &self.remote_addr())
            .field("attached", &self.is_attached())
            .field("received", &self.received())
            .finish()
    }
}

/// 客户端、后端两个端点
#[derive(Debug)]
pub struct ConnectionPair {
    slots: [Connection; 2],
}

impl ConnectionPair {
    /// 创建连接对并挂接客户端写半部；后端在真正连接后才挂接
    pub fn with_client(client_addr: SocketAddr, writer: StreamWriter) -> Self {
        Self {
            slots: [
                Connection::new(Role::Client, Some(client_addr), Some(writer)),
                Connection::new(Role::Server, None, None),
            ],
        }
    }

    pub fn client(&self) -> &Connection {
        &self[Role::Client]
    }

    pub fn server(&self) -> &Connection {
        &self[Role::Server]
    }

    /// 给定端点的对端
    pub fn peer_of(&self, role: Role) -> &Connection {
        &self[role.peer()]
    }

    /// 两端累计收到的字节数之和
    pub fn bytes_transmitted(&self) -> u64 {
        self.slots.iter().map(Connection::received).sum()
    }

    /// 同时摘下两端的写半部
    ///
    /// 先把两个端点都标记为未挂接，再逐个取走，
    /// 这样中继任务不会看到只拆了一半的连接对。
    pub async fn detach_all(&self) -> Vec<(Role, StreamWriter)> {
        for conn in &self.slots {
            conn.attached.store(false, Ordering::Release);
        }
        let mut detached = Vec::with_capacity(2);
        for conn in &self.slots {
            if let Some(writer) = conn.release().await {
                detached.push((conn.role, writer));
            }
        }
        detached
    }
}

impl Index<Role> for ConnectionPair {
    type Output = Connection;

    fn index(&self, role: Role) -> &Connection {
        &self.slots[role.slot()]
    }
}

/// 关闭写半部：在 `linger` 内尽量把缓冲数据发完并发送 FIN，然后释放
pub async fn close_with_linger(role: Role, mut writer: StreamWriter, linger: Duration) {
    match tokio::time::timeout(linger, writer.shutdown()).await {
        Ok(Ok(())) => debug!("{} stream closed", role),
        Ok(Err(e)) => debug!("{} stream shutdown error: {}", role, e),
        Err(_) => debug!("{} stream shutdown timed out after {:?}", role, linger),
    }
}
