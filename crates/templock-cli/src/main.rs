//! TempLock CLI
//!
//! 通过 BLE 房间码交换会话密钥，通过中继收发加密文件

mod commands;

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use templock_core::store::FileSecretStore;
use templock_core::{AppSettings, LogLevel};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "templock", version, about = "TempLock - 近距离安全文件共享")]
struct Cli {
    /// 中继服务器地址 (覆盖配置文件)
    #[arg(long, global = true)]
    relay: Option<String>,

    /// 日志级别 (error/warn/info/debug/trace)
    #[arg(long, global = true)]
    log_level: Option<LogLevel>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// 创建会话并广播，等待对端输入房间码
    Host {
        /// 复用已有的房间码，而不是在中继上新建会话
        #[arg(short, long)]
        session: Option<String>,
        /// 广播前先上传的文件
        #[arg(short, long = "file")]
        files: Vec<PathBuf>,
    },
    /// 扫描附近的设备并用房间码加入会话
    Join {
        /// 房间码 (不指定则在连接后输入)
        code: Option<String>,
        /// 扫描超时时间 (秒)
        #[arg(short, long)]
        timeout: Option<u64>,
    },
    /// 加密并上传文件
    Upload {
        /// 要上传的文件路径
        file: PathBuf,
    },
    /// 列出会话中的文件
    List,
    /// 下载并解密文件
    Download {
        /// 文件 ID
        id: String,
        /// 保存目录 (默认: 配置中的下载目录)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// 从中继删除文件
    Delete {
        /// 文件 ID
        id: String,
    },
    /// 查看中继上的会话日志
    Logs,
    /// 删除本地保存的会话
    Forget,
}

fn init_logging(level: LogLevel) {
    // 桥接 log crate（templock-core 使用）到 tracing
    let _ = tracing_log::LogTracer::init();

    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(level.filter_directive())),
        )
        .with_writer(std::io::stderr)
        .try_init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut settings = AppSettings::load();
    if let Some(relay) = cli.relay {
        settings.relay_url = relay;
    }

    let level = cli.log_level.unwrap_or(if settings.verbose {
        LogLevel::Debug
    } else {
        LogLevel::Info
    });
    init_logging(level);
    tracing::debug!("Using relay {}", settings.relay_url);

    let store = FileSecretStore::default_location()?;

    match cli.command {
        Commands::Host { session, files } => {
            commands::host(&settings, &store, session, &files).await
        }
        Commands::Join { code, timeout } => {
            if let Some(secs) = timeout {
                settings.scan_timeout_secs = secs;
            }
            commands::join(&settings, &store, code).await
        }
        Commands::Upload { file } => commands::upload(&settings, &store, &file).await,
        Commands::List => commands::list(&settings, &store).await,
        Commands::Download { id, output } => {
            let dir = output.unwrap_or_else(|| settings.download_dir.clone());
            commands::download(&settings, &store, &id, &dir).await
        }
        Commands::Delete { id } => commands::delete(&settings, &store, &id).await,
        Commands::Logs => commands::logs(&settings, &store).await,
        Commands::Forget => commands::forget(&store),
    }
}
