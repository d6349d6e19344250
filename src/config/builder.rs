use anyhow::{Context, Result};
use std::path::PathBuf;

use super::{validator::ConfigValidator, RelayConfig};

/// RelayConfig Builder
#[derive(Debug, Default)]
pub struct RelayConfigBuilder {
    listen_addr: Option<String>,
    backend_addr: Option<String>,
    timeout_secs: Option<i64>,
    connect_timeout_secs: Option<u64>,
    discard_oversized: Option<bool>,
    max_header_size: Option<usize>,
    max_body_size: Option<u64>,
    max_connections: Option<usize>,
    capture_dir: Option<PathBuf>,
    stats_interval_secs: Option<u64>,
}

impl RelayConfigBuilder {
    /// 创建新的 Builder
    pub fn new() -> Self {
        Self::default()
    }

    /// 以已有配置为起点（用于命令行覆盖配置文件）
    pub fn from_config(config: RelayConfig) -> Self {
        Self {
            listen_addr: Some(config.listen_addr),
            backend_addr: Some(config.backend_addr),
            timeout_secs: Some(config.timeout_secs),
            connect_timeout_secs: Some(config.connect_timeout_secs),
            discard_oversized: Some(config.discard_oversized),
            max_header_size: Some(config.max_header_size),
            max_body_size: Some(config.max_body_size),
            max_connections: Some(config.max_connections),
            capture_dir: config.capture_dir,
            stats_interval_secs: Some(config.stats_interval_secs),
        }
    }

    /// 设置监听地址
    pub fn listen_addr(mut self, addr: impl Into<String>) -> Self {
        self.listen_addr = Some(addr.into());
        self
    }

    /// 设置后端地址
    pub fn backend_addr(mut self, addr: impl Into<String>) -> Self {
        self.backend_addr = Some(addr.into());
        self
    }

    /// 设置客户端读取超时
    pub fn timeout_secs(mut self, secs: i64) -> Self {
        self.timeout_secs = Some(secs);
        self
    }

    /// 设置后端连接超时
    pub fn connect_timeout_secs(mut self, secs: u64) -> Self {
        self.connect_timeout_secs = Some(secs);
        self
    }

    /// 设置是否丢弃超大请求体
    pub fn discard_oversized(mut self, discard: bool) -> Self {
        self.discard_oversized = Some(discard);
        self
    }

    pub fn max_header_size(mut self, size: usize) -> Self {
        self.max_header_size = Some(size);
        self
    }

    pub fn max_body_size(mut self, size: u64) -> Self {
        self.max_body_size = Some(size);
        self
    }

    pub fn max_connections(mut self, max: usize) -> Self {
        self.max_connections = Some(max);
        self
    }

    /// 设置抓包目录
    pub fn capture_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.capture_dir = Some(dir.into());
        self
    }

    pub fn stats_interval_secs(mut self, secs: u64) -> Self {
        self.stats_interval_secs = Some(secs);
        self
    }

    /// 构建 RelayConfig 并验证
    pub fn build(self) -> Result<RelayConfig> {
        let mut config = RelayConfig::new(
            self.listen_addr.context("listen_addr is required")?,
            self.backend_addr.context("backend_addr is required")?,
        );
        if let Some(secs) = self.timeout_secs {
            config.timeout_secs = secs;
        }
        if let Some(secs) = self.connect_timeout_secs {
            config.connect_timeout_secs = secs;
        }
        if let Some(discard) = self.discard_oversized {
            config.discard_oversized = discard;
        }
        if let Some(size) = self.max_header_size {
            config.max_header_size = size;
        }
        if let Some(size) = self.max_body_size {
            config.max_body_size = size;
        }
        if let Some(max) = self.max_connections {
            config.max_connections = max;
        }
        config.capture_dir = self.capture_dir.map(super::expand_tilde);
        if let Some(secs) = self.stats_interval_secs {
            config.stats_interval_secs = secs;
        }

        // 验证配置
        ConfigValidator::validate_relay_config(&config)?;

        Ok(config)
    }
}
