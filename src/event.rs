/// 转发会话事件
///
/// 生命周期通知和流量通知通过无界通道交给会话的所有者，
/// 发送方从不阻塞，接收方丢弃后事件直接被忽略
use std::fmt;
use tokio::sync::mpsc;

use crate::connection::Role;

/// 生命周期状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ForwarderStatus {
    /// 已连上后端
    Established,
    /// 客户端关闭或读取失败
    ClientGone,
    /// 后端关闭或读写失败
    ServerGone,
    /// 无法连接后端
    ServerUnavailable,
    /// 所有者主动停止
    UserClosed,
}

impl ForwarderStatus {
    /// 会话是否已经结束（`Established` 之外都是终止状态）
    pub fn is_terminal(self) -> bool {
        !matches!(self, ForwarderStatus::Established)
    }
}

impl fmt::Display for ForwarderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ForwarderStatus::Established => "established",
            ForwarderStatus::ClientGone => "client gone",
            ForwarderStatus::ServerGone => "server gone",
            ForwarderStatus::ServerUnavailable => "server unavailable",
            ForwarderStatus::UserClosed => "user closed",
        };
        f.write_str(s)
    }
}

/// 转发会话事件
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForwarderEvent {
    /// 从 `from` 端收到并成功转发（或按超大请求丢弃）的字节数
    Transferred { from: Role, bytes: u64 },
    /// 生命周期变化
    Status(ForwarderStatus),
}

pub type EventReceiver = mpsc::UnboundedReceiver<ForwarderEvent>;

/// 事件发送端
#[derive(Debug, Clone)]
pub struct EventSender {
    tx: mpsc::UnboundedSender<ForwarderEvent>,
}

impl EventSender {
    pub fn channel() -> (EventSender, EventReceiver) {
        let (tx, rx) = mpsc::unbounded_channel();
        (EventSender { tx }, rx)
    }

    pub fn transferred(&self, from: Role, bytes: u64) {
        let _ = self.tx.send(ForwarderEvent::Transferred { from, bytes });
    }

    pub fn status(&self, status: ForwarderStatus) {
        let _ = self.tx.send(ForwarderEvent::Status(status));
    }
}
