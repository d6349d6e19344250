// 配置管理模块 - 使用模块化设计

mod builder;
mod validator;

pub use builder::RelayConfigBuilder;
pub use validator::ConfigValidator;

use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::dispatch::DispatchLimits;
use crate::forwarder::{ForwarderOptions, DEFAULT_LINGER};
use crate::header::{MAX_BODY_SIZE, MAX_HEADER_SIZE};

/// 中继配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelayConfig {
    /// 监听地址（如 "0.0.0.0:8080"）
    pub listen_addr: String,
    /// 后端地址（如 "127.0.0.1:3000"）
    pub backend_addr: String,
    /// 客户端读取超时（秒），0 表示无限等待
    #[serde(default)]
    pub timeout_secs: i64,
    /// 后端连接超时（秒）
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    /// 拒绝超大请求体前是否先读掉
    #[serde(default = "default_discard_oversized")]
    pub discard_oversized: bool,
    /// 请求头块上限（字节）
    #[serde(default = "default_max_header_size")]
    pub max_header_size: usize,
    /// 可缓冲转发的请求体上限（字节）
    #[serde(default = "default_max_body_size")]
    pub max_body_size: u64,
    /// 最大并发连接数
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    /// 抓包目录（可选，支持 ~）
    #[serde(default)]
    pub capture_dir: Option<PathBuf>,
    /// 周期性统计日志间隔（秒），0 表示关闭
    #[serde(default)]
    pub stats_interval_secs: u64,
}

fn default_connect_timeout_secs() -> u64 {
    10
}

fn default_discard_oversized() -> bool {
    true
}

fn default_max_header_size() -> usize {
    MAX_HEADER_SIZE
}

fn default_max_body_size() -> u64 {
    MAX_BODY_SIZE
}

fn default_max_connections() -> usize {
    1000
}

impl RelayConfig {
    /// 使用默认值创建配置
    pub fn new(listen_addr: impl Into<String>, backend_addr: impl Into<String>) -> Self {
        Self {
            listen_addr: listen_addr.into(),
            backend_addr: backend_addr.into(),
            timeout_secs: 0,
            connect_timeout_secs: default_connect_timeout_secs(),
            discard_oversized: default_discard_oversized(),
            max_header_size: default_max_header_size(),
            max_body_size: default_max_body_size(),
            max_connections: default_max_connections(),
            capture_dir: None,
            stats_interval_secs: 0,
        }
    }

    /// 创建 Builder
    pub fn builder() -> RelayConfigBuilder {
        RelayConfigBuilder::new()
    }

    /// 验证配置
    pub fn validate(&self) -> anyhow::Result<()> {
        ConfigValidator::validate_relay_config(self)
    }

    /// 每个转发会话使用的选项
    pub fn forwarder_options(&self) -> ForwarderOptions {
        ForwarderOptions {
            max_header_size: self.max_header_size,
            limits: DispatchLimits {
                max_body_size: self.max_body_size,
                discard_oversized: self.discard_oversized,
            },
            connect_timeout: Duration::from_secs(self.connect_timeout_secs),
            linger: DEFAULT_LINGER,
            capture_dir: self.capture_dir.clone(),
        }
    }

    /// 周期性统计日志间隔
    pub fn stats_interval(&self) -> Option<Duration> {
        match self.stats_interval_secs {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        }
    }
}

/// 应用配置（配置文件的顶层结构）
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub relay: RelayConfig,
}

impl AppConfig {
    /// 从 TOML 文本解析并验证
    pub fn from_toml(content: &str) -> anyhow::Result<RelayConfig> {
        let wrapper: AppConfig =
            toml::from_str(content).context("Failed to parse relay configuration")?;
        let mut config = wrapper.relay;
        config.capture_dir = config.capture_dir.map(expand_tilde);
        config
            .validate()
            .context("Relay configuration validation failed")?;
        Ok(config)
    }

    /// 从文件加载中继配置
    pub fn load_relay_config(path: &str) -> anyhow::Result<RelayConfig> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read configuration file: {}", path))?;
        Self::from_toml(&content)
    }
}

/// 展开路径开头的 `~`
pub fn expand_tilde(path: PathBuf) -> PathBuf {
    match path.to_str() {
        Some(s) => PathBuf::from(shellexpand::tilde(s).as_ref()),
        None => path,
    }
}
