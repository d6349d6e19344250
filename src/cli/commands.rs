use anyhow::Result;
use tracing::info;

use crate::server;

use super::config::{check_config, expand_path, resolve_run_config, RunOverrides};
use super::template;

/// Execute CLI commands
pub async fn execute_command(cli: &super::Cli) -> Result<()> {
    use super::Commands;

    match &cli.command {
        Commands::Check { config, format } => {
            let config_path = expand_path(config)?;
            check_config(&config_path, format)?;
        }
        Commands::Template { output } => {
            template::generate_config_template(output.as_deref())?;
        }
        Commands::Run {
            config,
            listen,
            backend,
            timeout,
            capture_dir,
            no_discard,
        } => {
            let overrides = RunOverrides {
                listen: listen.clone(),
                backend: backend.clone(),
                timeout: *timeout,
                capture_dir: capture_dir.clone(),
                no_discard: *no_discard,
            };
            run_relay(config.as_deref(), &overrides).await?;
        }
    }

    Ok(())
}

/// Run the relay until Ctrl-C
async fn run_relay(config: Option<&str>, overrides: &RunOverrides) -> Result<()> {
    if let Some(path) = config {
        info!("Loading relay configuration from: {}", path);
    }
    let relay_config = resolve_run_config(config, overrides)?;

    // 发送端保持存活，由 Ctrl-C 结束
    let (_shutdown_tx, shutdown_rx) = tokio::sync::broadcast::channel(1);
    server::run_relay(relay_config, shutdown_rx).await?;

    Ok(())
}
