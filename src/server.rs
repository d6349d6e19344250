/// 中继监听器
///
/// 接受客户端连接，为每个连接创建并持有一个 `Forwarder`，消费它的事件更新统计，
/// 在会话结束时停止它
use anyhow::{Context, Result};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, OwnedSemaphorePermit, Semaphore};
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use crate::config::RelayConfig;
use crate::event::ForwarderEvent;
use crate::forwarder::Forwarder;
use crate::stats::{RelayStats, RelayStatsSnapshot};

/// 关闭时等待活动连接结束的上限
const SHUTDOWN_GRACE_PERIOD: Duration = Duration::from_secs(5);

/// 绑定 `listen_addr` 并运行中继，直到收到关闭信号或 Ctrl-C
pub async fn run_relay(
    config: RelayConfig,
    shutdown_rx: broadcast::Receiver<()>,
) -> Result<RelayStatsSnapshot> {
    info!(
        "Relay: Binding to {} (backend: {})",
        config.listen_addr, config.backend_addr
    );

    let listener = TcpListener::bind(&config.listen_addr)
        .await
        .with_context(|| format!("Failed to bind relay to {}", config.listen_addr))?;

    info!("Relay: Listening on {}", listener.local_addr()?);

    let stats = RelayStats::new();
    serve(listener, config, stats, shutdown_rx).await
}

/// 在已绑定的监听器上运行中继
pub async fn serve(
    listener: TcpListener,
    config: RelayConfig,
    stats: RelayStats,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<RelayStatsSnapshot> {
    let config = Arc::new(config);
    let connection_limiter = Arc::new(Semaphore::new(config.max_connections));
    let tracker = TaskTracker::new();
    let cancel = CancellationToken::new();

    info!(
        "Relay: Maximum concurrent connections: {}",
        config.max_connections
    );

    if let Some(interval) = config.stats_interval() {
        tracker.spawn(report_stats(stats.clone(), interval, cancel.clone()));
    }

    loop {
        tokio::select! {
            accept_result = listener.accept() => {
                match accept_result {
                    Ok((stream, peer_addr)) => {
                        if let Err(e) = stream.set_nodelay(true) {
                            warn!("Failed to set TCP_NODELAY: {}", e);
                        }

                        // 尝试获取连接许可
                        let permit = match connection_limiter.clone().try_acquire_owned() {
                            Ok(permit) => permit,
                            Err(_) => {
                                warn!(
                                    "Relay: Connection limit reached ({}), rejecting connection from {}",
                                    config.max_connections, peer_addr
                                );
                                drop(stream);
                                continue;
                            }
                        };

                        debug!("Relay: Accepted connection from {}", peer_addr);
                        tracker.spawn(handle_connection(
                            stream,
                            peer_addr,
                            config.clone(),
                            stats.clone(),
                            cancel.clone(),
                            permit,
                        ));
                    }
                    Err(e) => {
                        error!("Relay: Accept error: {}", e);
                        sleep(Duration::from_millis(100)).await;
                    }
                }
            }
            _ = shutdown_rx.recv() => {
                info!("Relay: Shutdown signal received");
                break;
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Relay: Ctrl-C received, shutting down");
                break;
            }
        }
    }

    drop(listener);
    cancel.cancel();
    tracker.close();
    if tokio::time::timeout(SHUTDOWN_GRACE_PERIOD, tracker.wait())
        .await
        .is_err()
    {
        warn!(
            "Relay: {} connection task(s) still running after {:?}",
            tracker.len(),
            SHUTDOWN_GRACE_PERIOD
        );
    }

    let snapshot = stats.snapshot();
    log_snapshot("final", &snapshot);
    Ok(snapshot)
}

/// 持有一个连接的转发会话直到它结束
async fn handle_connection(
    stream: TcpStream,
    peer_addr: SocketAddr,
    config: Arc<RelayConfig>,
    stats: RelayStats,
    cancel: CancellationToken,
    permit: OwnedSemaphorePermit,
) {
    // 持有 permit 直到任务结束，自动释放
    let _permit = permit;
    stats.connection_started();

    match Forwarder::new(stream, config.backend_addr.clone(), config.forwarder_options()) {
        Ok((forwarder, mut events)) => {
            if let Err(e) = forwarder.start(config.timeout_secs) {
                error!("Relay: Failed to start forwarder for {}: {}", peer_addr, e);
            } else {
                loop {
                    tokio::select! {
                        event = events.recv() => match event {
                            Some(event) => {
                                stats.record_event(&event);
                                if let ForwarderEvent::Status(status) = event {
                                    if status.is_terminal() {
                                        debug!("{}: {}", forwarder, status);
                                        break;
                                    }
                                }
                            }
                            None => break,
                        },
                        _ = cancel.cancelled() => {
                            debug!("{}: stopping for shutdown", forwarder);
                            break;
                        }
                    }
                }
            }

            forwarder.stop().await;
            while let Ok(event) = events.try_recv() {
                stats.record_event(&event);
            }
            if let Some(page) = forwarder.rejection() {
                stats.record_rejection(page);
            }
            stats.add_discarded(forwarder.discarded_bytes());
            info!(
                "Relay: Connection from {} closed ({} bytes transmitted)",
                peer_addr,
                forwarder.bytes_transmitted()
            );
        }
        Err(e) => {
            warn!("Relay: Dropping connection from {}: {}", peer_addr, e);
        }
    }

    stats.connection_ended();
}

/// 周期性输出统计
async fn report_stats(stats: RelayStats, interval: Duration, cancel: CancellationToken) {
    let mut ticker = tokio::time::interval(interval);
    // 第一次 tick 立即完成
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = ticker.tick() => log_snapshot("periodic", &stats.snapshot()),
            _ = cancel.cancelled() => break,
        }
    }
}

fn log_snapshot(label: &str, snapshot: &RelayStatsSnapshot) {
    info!(
        "Relay stats ({}): connections {}/{} active, {} bytes from clients, {} bytes from backend, \
         {} discarded, {} rejected, {} backend failures",
        label,
        snapshot.active_connections,
        snapshot.total_connections,
        snapshot.bytes_from_clients,
        snapshot.bytes_from_backend,
        snapshot.discarded_bytes,
        snapshot.total_rejected(),
        snapshot.backend_failures
    );
}
