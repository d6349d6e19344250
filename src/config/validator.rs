use anyhow::{bail, Result};
use tracing::warn;

use super::RelayConfig;

/// 配置验证器 - 负责所有配置验证逻辑
pub struct ConfigValidator;

impl ConfigValidator {
    /// 验证地址为 `host:port` 形式且端口有效
    pub fn validate_address(addr: &str, context: &str) -> Result<()> {
        let addr = addr.trim();
        if addr.is_empty() {
            bail!("{}: address cannot be empty", context);
        }
        let Some((host, port)) = addr.rsplit_once(':') else {
            bail!("{}: address '{}' must be in host:port form", context, addr);
        };
        if host.is_empty() {
            bail!("{}: host cannot be empty in '{}'", context, addr);
        }
        match port.parse::<u16>() {
            Ok(0) => bail!("{}: port cannot be 0", context),
            Ok(_) => Ok(()),
            Err(_) => bail!("{}: invalid port '{}' in '{}'", context, port, addr),
        }
    }

    /// 验证大小限制
    pub fn validate_limits(max_header_size: usize, max_body_size: u64) -> Result<()> {
        if max_header_size == 0 {
            bail!("max_header_size must be greater than 0");
        }
        if max_body_size == 0 {
            bail!("max_body_size must be greater than 0");
        }
        if max_header_size as u64 > max_body_size {
            bail!(
                "max_header_size ({}) cannot be greater than max_body_size ({})",
                max_header_size,
                max_body_size
            );
        }
        // 建议值检查
        if max_body_size > 1024 * 1024 * 1024 {
            warn!(
                "max_body_size is very large ({} bytes = {} MB), \
                 each buffered request is held in memory",
                max_body_size,
                max_body_size / (1024 * 1024)
            );
        }
        Ok(())
    }

    /// 验证中继配置
    pub fn validate_relay_config(config: &RelayConfig) -> Result<()> {
        Self::validate_address(&config.listen_addr, "listen_addr")?;
        Self::validate_address(&config.backend_addr, "backend_addr")?;

        if config.timeout_secs < 0 {
            bail!(
                "timeout_secs cannot be negative (current: {})",
                config.timeout_secs
            );
        }
        if config.connect_timeout_secs == 0 {
            bail!("connect_timeout_secs must be greater than 0");
        }

        Self::validate_limits(config.max_header_size, config.max_body_size)?;

        if config.max_connections == 0 {
            bail!("max_connections must be greater than 0");
        }

        if let Some(ref dir) = config.capture_dir {
            if dir.as_os_str().is_empty() {
                bail!("capture_dir cannot be empty");
            }
            if dir.exists() && !dir.is_dir() {
                bail!("capture_dir {:?} exists but is not a directory", dir);
            }
        }

        if config.listen_addr.trim() == config.backend_addr.trim() {
            warn!(
                "listen_addr and backend_addr are both {}, requests will loop back to the relay",
                config.listen_addr
            );
        }

        Ok(())
    }
}
