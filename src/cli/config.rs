use anyhow::{Context, Result};
use serde::Serialize;
use std::path::{Path, PathBuf};

use crate::config::{AppConfig, RelayConfig, RelayConfigBuilder};

/// 命令行对配置文件的覆盖项
#[derive(Debug, Default, Clone)]
pub struct RunOverrides {
    pub listen: Option<String>,
    pub backend: Option<String>,
    pub timeout: Option<i64>,
    pub capture_dir: Option<String>,
    pub no_discard: bool,
}

#[derive(Serialize)]
struct CheckResult {
    valid: bool,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    warnings: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
    details: serde_json::Value,
}

/// Expand path with tilde (~) and make it absolute
pub fn expand_path(path: &str) -> Result<String> {
    let expanded = shellexpand::tilde(path);
    let path_buf = PathBuf::from(expanded.as_ref());

    if path_buf.is_absolute() {
        Ok(expanded.into_owned())
    } else {
        // Convert relative path to absolute
        std::env::current_dir()
            .context("Failed to get current directory")?
            .join(&path_buf)
            .to_str()
            .map(|s| s.to_string())
            .ok_or_else(|| anyhow::anyhow!("Invalid path: {}", path))
    }
}

/// 合成运行配置：先读配置文件（如果有），再应用命令行覆盖
pub fn resolve_run_config(config: Option<&str>, overrides: &RunOverrides) -> Result<RelayConfig> {
    let mut builder = match config {
        Some(path) => {
            let config_path = expand_path(path)?;
            RelayConfigBuilder::from_config(AppConfig::load_relay_config(&config_path)?)
        }
        None => RelayConfigBuilder::new(),
    };

    if let Some(ref listen) = overrides.listen {
        builder = builder.listen_addr(listen.clone());
    }
    if let Some(ref backend) = overrides.backend {
        builder = builder.backend_addr(backend.clone());
    }
    if let Some(timeout) = overrides.timeout {
        builder = builder.timeout_secs(timeout);
    }
    if let Some(ref dir) = overrides.capture_dir {
        builder = builder.capture_dir(dir.clone());
    }
    if overrides.no_discard {
        builder = builder.discard_oversized(false);
    }

    builder
        .build()
        .context("Invalid relay configuration (use -c FILE or --listen/--backend)")
}

fn config_details(config: &RelayConfig) -> serde_json::Value {
    serde_json::json!({
        "listen_addr": config.listen_addr,
        "backend_addr": config.backend_addr,
        "timeout_secs": config.timeout_secs,
        "connect_timeout_secs": config.connect_timeout_secs,
        "discard_oversized": config.discard_oversized,
        "max_header_size": config.max_header_size,
        "max_body_size": config.max_body_size,
        "max_connections": config.max_connections,
        "capture_dir": config.capture_dir,
        "stats_interval_secs": config.stats_interval_secs,
    })
}

/// Check configuration file format
pub fn check_config(config_path: &str, format: &str) -> Result<()> {
    let path = Path::new(config_path);

    // Check if file exists
    if !path.exists() {
        if format == "json" {
            let result = CheckResult {
                valid: false,
                warnings: vec![],
                error: Some(format!("Configuration file not found: {}", config_path)),
                details: serde_json::json!({}),
            };
            println!("{}", serde_json::to_string_pretty(&result)?);
        } else {
            println!("✗ Configuration file not found: {}", config_path);
        }
        anyhow::bail!("Configuration file not found: {}", config_path);
    }

    if format == "text" {
        println!("Checking configuration file: {}\n", config_path);
    }

    match AppConfig::load_relay_config(config_path) {
        Ok(config) => {
            let mut warnings = Vec::new();
            if let Some(ref dir) = config.capture_dir {
                if !dir.exists() {
                    warnings.push(format!("Capture directory will be created: {:?}", dir));
                }
            }
            if config.timeout_secs == 0 {
                warnings.push("timeout_secs is 0, idle clients are never timed out".to_string());
            }

            if format == "json" {
                let result = CheckResult {
                    valid: true,
                    warnings,
                    error: None,
                    details: config_details(&config),
                };
                println!("{}", serde_json::to_string_pretty(&result)?);
            } else {
                println!("✓ Listen address: {}", config.listen_addr);
                println!("✓ Backend address: {}", config.backend_addr);
                println!("✓ Client timeout: {} s", config.timeout_secs);
                println!("✓ Connect timeout: {} s", config.connect_timeout_secs);
                println!("✓ Header limit: {} bytes", config.max_header_size);
                println!("✓ Body limit: {} bytes", config.max_body_size);
                println!("✓ Discard oversized bodies: {}", config.discard_oversized);
                println!("✓ Max connections: {}", config.max_connections);
                match config.capture_dir {
                    Some(ref dir) => println!("✓ Capture directory: {:?}", dir),
                    None => println!("✓ Capture: disabled"),
                }
                for warning in &warnings {
                    println!("⚠ Warning: {}", warning);
                }
                println!("\n✓ Relay configuration is valid!");
            }
            Ok(())
        }
        Err(e) => {
            if format == "json" {
                let result = CheckResult {
                    valid: false,
                    warnings: vec![],
                    error: Some(format!("{:#}", e)),
                    details: serde_json::json!({}),
                };
                println!("{}", serde_json::to_string_pretty(&result)?);
            } else {
                println!("✗ Configuration validation failed!");
                println!("\nError details:");
                println!("{:#}", e);

                // Provide hints for common issues
                println!("\nCommon issues:");
                println!("  1. Check TOML syntax (brackets, quotes, commas)");
                println!("  2. Ensure the [relay] section has listen_addr and backend_addr");
                println!("  3. Addresses must be in host:port form");
                println!("  4. timeout_secs cannot be negative");
            }

            Err(e)
        }
    }
}
