/// HTTP Relay 库入口
///
/// 将核心模块导出为库，方便测试和复用
pub mod capture;
pub mod cli;
pub mod config;
pub mod connection;
pub mod dispatch;
pub mod error;
pub mod event;
pub mod forwarder;
pub mod header;
pub mod io_util;
pub mod relay;
pub mod response;
pub mod server;
pub mod stats;

// 重新导出常用类型
pub use config::{AppConfig, RelayConfig};
pub use connection::{ConnectionPair, Role};
pub use dispatch::{classify, DispatchLimits, Disposition};
pub use error::{RelayError, Result};
pub use event::{EventReceiver, ForwarderEvent, ForwarderStatus};
pub use forwarder::{Forwarder, ForwarderOptions};
pub use header::{read_headers, HeaderMap, ParsedHeaders, MAX_BODY_SIZE, MAX_HEADER_SIZE};
pub use io_util::{discard_exact, write_vectored_all, IdleTimeoutReader};
pub use response::ErrorPage;
pub use stats::{RelayStats, RelayStatsSnapshot};
