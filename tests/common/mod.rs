//! Common utilities for integration tests
#![allow(dead_code)]

use http_relay::config::RelayConfig;
use http_relay::server;
use http_relay::stats::{RelayStats, RelayStatsSnapshot};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::timeout;

/// Default wait for anything the tests expect to happen
pub const WAIT: Duration = Duration::from_secs(5);

/// Canned backend reply
pub const BACKEND_REPLY: &[u8] = b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nok";

/// Find an address nothing is listening on
pub async fn unused_addr() -> String {
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("Failed to bind to random port");
    listener
        .local_addr()
        .expect("Failed to get local addr")
        .to_string()
}

/// A backend that records every complete request it receives and answers each
/// one with [`BACKEND_REPLY`]
pub struct MockBackend {
    pub addr: String,
    pub connections: Arc<AtomicUsize>,
    requests: mpsc::UnboundedReceiver<Vec<u8>>,
    handle: JoinHandle<()>,
}

impl MockBackend {
    pub async fn start() -> Self {
        Self::start_with(true).await
    }

    /// A backend that closes each connection right after its first reply
    pub async fn start_closing() -> Self {
        Self::start_with(false).await
    }

    async fn start_with(keep_alive: bool) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("Failed to bind mock backend");
        let addr = listener.local_addr().unwrap().to_string();
        let connections = Arc::new(AtomicUsize::new(0));
        let (tx, requests) = mpsc::unbounded_channel();

        let counter = connections.clone();
        let handle = tokio::spawn(async move {
            while let Ok((mut socket, _)) = listener.accept().await {
                counter.fetch_add(1, Ordering::SeqCst);
                let tx = tx.clone();
                tokio::spawn(async move {
                    while let Some(request) = read_request(&mut socket).await {
                        let _ = tx.send(request);
                        if socket.write_all(BACKEND_REPLY).await.is_err() || !keep_alive {
                            break;
                        }
                    }
                });
            }
        });

        Self {
            addr,
            connections,
            requests,
            handle,
        }
    }

    /// Wait for the next recorded request
    pub async fn next_request(&mut self) -> Vec<u8> {
        timeout(WAIT, self.requests.recv())
            .await
            .expect("Timed out waiting for backend request")
            .expect("Mock backend stopped")
    }

    /// Assert that no request arrives within `wait`
    pub async fn assert_no_request(&mut self, wait: Duration) {
        if let Ok(Some(request)) = timeout(wait, self.requests.recv()).await {
            panic!(
                "Backend unexpectedly received: {:?}",
                String::from_utf8_lossy(&request)
            );
        }
    }

    pub fn connection_count(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }
}

impl Drop for MockBackend {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

/// Position just past the first CRLFCRLF
fn header_end(data: &[u8]) -> Option<usize> {
    data.windows(4).position(|w| w == b"\r\n\r\n").map(|p| p + 4)
}

fn content_length(head: &[u8]) -> usize {
    String::from_utf8_lossy(head)
        .split("\r\n")
        .filter_map(|line| line.split_once(':'))
        .find(|(name, _)| name.trim().eq_ignore_ascii_case("content-length"))
        .and_then(|(_, value)| value.trim().parse().ok())
        .unwrap_or(0)
}

/// Read one request (headers plus Content-Length body) byte by byte
pub async fn read_request<R: AsyncRead + Unpin>(reader: &mut R) -> Option<Vec<u8>> {
    let mut data = Vec::new();
    let mut byte = [0u8; 1];
    while header_end(&data).is_none() {
        match reader.read(&mut byte).await {
            Ok(1) => data.push(byte[0]),
            _ => return None,
        }
    }
    let mut body = vec![0u8; content_length(&data)];
    reader.read_exact(&mut body).await.ok()?;
    data.extend_from_slice(&body);
    Some(data)
}

/// Read one response: status head and its Content-Length body
pub async fn read_response(stream: &mut TcpStream) -> (String, Vec<u8>) {
    let data = timeout(WAIT, read_request(stream))
        .await
        .expect("Timed out reading response")
        .expect("Connection closed before a full response");
    let split = header_end(&data).unwrap();
    (
        String::from_utf8_lossy(&data[..split]).into_owned(),
        data[split..].to_vec(),
    )
}

/// Read until the relay closes the connection
pub async fn read_to_close(stream: &mut TcpStream) -> Vec<u8> {
    let mut out = Vec::new();
    timeout(WAIT, stream.read_to_end(&mut out))
        .await
        .expect("Timed out waiting for close")
        .expect("Read failed");
    out
}

/// A relay running on a random port
pub struct TestRelay {
    pub addr: SocketAddr,
    pub stats: RelayStats,
    shutdown_tx: broadcast::Sender<()>,
    handle: JoinHandle<anyhow::Result<RelayStatsSnapshot>>,
}

impl TestRelay {
    pub async fn start(backend_addr: &str) -> Self {
        Self::start_with(backend_addr, |_| {}).await
    }

    pub async fn start_with(backend_addr: &str, customize: impl FnOnce(&mut RelayConfig)) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("Failed to bind relay");
        let addr = listener.local_addr().unwrap();

        let mut config = RelayConfig::new(addr.to_string(), backend_addr);
        config.connect_timeout_secs = 2;
        customize(&mut config);
        config.validate().expect("Invalid test configuration");

        let stats = RelayStats::new();
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let handle = tokio::spawn(server::serve(listener, config, stats.clone(), shutdown_rx));

        Self {
            addr,
            stats,
            shutdown_tx,
            handle,
        }
    }

    pub async fn connect(&self) -> TcpStream {
        TcpStream::connect(self.addr)
            .await
            .expect("Failed to connect to relay")
    }

    /// Stop the relay and return the final statistics
    pub async fn shutdown(self) -> RelayStatsSnapshot {
        let _ = self.shutdown_tx.send(());
        timeout(WAIT * 2, self.handle)
            .await
            .expect("Relay did not shut down")
            .expect("Relay task panicked")
            .expect("Relay returned an error")
    }

    /// Wait until the active connection count drops to zero
    pub async fn wait_idle(&self) {
        timeout(WAIT, async {
            while self.stats.snapshot().active_connections > 0 {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .expect("Connections did not finish");
    }
}
