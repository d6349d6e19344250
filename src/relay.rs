/// 响应中继
///
/// 后端连接建立后启动，把后端发来的数据原样写回客户端，直到任一端关闭或会话被取消
use std::sync::Arc;
use tokio::io::AsyncReadExt;
use tracing::debug;

use crate::connection::Role;
use crate::event::ForwarderStatus;
use crate::forwarder::{Shared, StreamReader};

/// 中继缓冲区大小
pub const RELAY_BUFFER_SIZE: usize = 64 * 1024;

/// 某一端关闭时对应的终止状态
fn gone_status(role: Role) -> ForwarderStatus {
    match role {
        Role::Client => ForwarderStatus::ClientGone,
        Role::Server => ForwarderStatus::ServerGone,
    }
}

/// 从 `from` 端读取并写到它的对端，返回时会话已被终止或取消
pub(crate) async fn run_relay(shared: Arc<Shared>, from: Role, mut reader: StreamReader) {
    let to = from.peer();
    let mut buf = vec![0u8; RELAY_BUFFER_SIZE];
    let mut total = 0u64;

    loop {
        let n = tokio::select! {
            _ = shared.cancel.cancelled() => break,
            result = reader.read(&mut buf) => match result {
                Ok(0) => {
                    debug!("Relay {} -> {}: EOF after {} bytes", from, to, total);
                    shared.terminate(gone_status(from)).await;
                    break;
                }
                Ok(n) => n,
                Err(e) => {
                    debug!("Relay {} -> {}: read error: {}", from, to, e);
                    shared.terminate(gone_status(from)).await;
                    break;
                }
            },
        };

        shared.pair[from].add_received(n as u64);
        shared.record(&buf[..n]).await;

        // 写对端时也要响应取消，否则对端不读时 stop 会一直等写锁
        let sent = tokio::select! {
            _ = shared.cancel.cancelled() => break,
            result = shared.pair.peer_of(from).send(&buf[..n]) => result,
        };
        if let Err(e) = sent {
            debug!("Relay {} -> {}: write error: {}", from, to, e);
            shared.terminate(gone_status(to)).await;
            break;
        }

        total += n as u64;
        shared.events.transferred(from, n as u64);
    }

    debug!("Relay {} -> {} finished ({} bytes)", from, to, total);
}
