use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(name = "http-relay")]
#[command(author, version, about = "HTTP-aware TCP relay", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// 日志级别 (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info", global = true)]
    pub log_level: String,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// 运行中继
    Run {
        /// 配置文件路径（可选，命令行参数覆盖文件中的值）
        #[arg(short, long)]
        config: Option<String>,

        /// 监听地址
        #[arg(long, value_name = "ADDR")]
        listen: Option<String>,

        /// 后端地址
        #[arg(long, value_name = "ADDR")]
        backend: Option<String>,

        /// 客户端读取超时（秒），0 表示无限等待
        #[arg(long, value_name = "SECS", allow_negative_numbers = true)]
        timeout: Option<i64>,

        /// 抓包目录
        #[arg(long, value_name = "DIR")]
        capture_dir: Option<String>,

        /// 超大请求体不先读掉，直接回 413
        #[arg(long)]
        no_discard: bool,
    },
    /// 检查配置文件格式是否正确
    Check {
        /// 配置文件路径
        #[arg(short, long)]
        config: String,

        /// 输出格式 (text, json)
        #[arg(short, long, default_value = "text", value_parser = ["text", "json"])]
        format: String,
    },
    /// 生成示例配置文件
    Template {
        /// 输出文件路径（默认输出到标准输出）
        #[arg(short, long)]
        output: Option<String>,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_run_overrides() {
        let cli = Cli::parse_from([
            "http-relay",
            "run",
            "--listen",
            "127.0.0.1:8080",
            "--backend",
            "127.0.0.1:3000",
            "--timeout",
            "30",
            "--no-discard",
        ]);
        match cli.command {
            Commands::Run {
                config,
                listen,
                backend,
                timeout,
                capture_dir,
                no_discard,
            } => {
                assert!(config.is_none());
                assert_eq!(listen.as_deref(), Some("127.0.0.1:8080"));
                assert_eq!(backend.as_deref(), Some("127.0.0.1:3000"));
                assert_eq!(timeout, Some(30));
                assert!(capture_dir.is_none());
                assert!(no_discard);
            }
            other => panic!("unexpected command: {:?}", other),
        }
        assert_eq!(cli.log_level, "info");
    }

    #[test]
    fn test_parse_check_and_global_log_level() {
        let cli = Cli::parse_from([
            "http-relay",
            "check",
            "-c",
            "relay.toml",
            "--log-level",
            "debug",
        ]);
        assert_eq!(cli.log_level, "debug");
        assert!(matches!(
            cli.command,
            Commands::Check { ref config, ref format } if config == "relay.toml" && format == "text"
        ));
    }

    #[test]
    fn test_check_requires_config() {
        assert!(Cli::try_parse_from(["http-relay", "check"]).is_err());
    }
}
