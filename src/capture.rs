/// 原始流量抓取
///
/// 每个转发会话一个文件，第一次有数据时才创建，两个方向的数据按到达顺序追加
use std::io;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::fs::{self, File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tracing::debug;
use uuid::Uuid;

/// 单个会话的抓包文件
#[derive(Debug)]
pub struct Capture {
    path: PathBuf,
    file: Option<File>,
    closed: bool,
    written: u64,
}

impl Capture {
    /// 在 `dir` 下为会话 `id` 准备抓包文件（此时不创建）
    pub fn new(dir: impl AsRef<Path>, id: Uuid) -> Self {
        let ts = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();
        Self {
            path: dir.as_ref().join(format!("{}-{}.cap", ts, id)),
            file: None,
            closed: false,
            written: 0,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// 文件是否已创建
    pub fn is_open(&self) -> bool {
        self.file.is_some()
    }

    pub fn bytes_written(&self) -> u64 {
        self.written
    }

    /// 追加一段数据；关闭后的写入被忽略
    pub async fn record(&mut self, data: &[u8]) -> io::Result<()> {
        if self.closed || data.is_empty() {
            return Ok(());
        }

        if self.file.is_none() {
            if let Some(parent) = self.path.parent() {
                fs::create_dir_all(parent).await?;
            }
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&self.path)
                .await?;
            debug!("Capture file created: {:?}", self.path);
            self.file = Some(file);
        }

        if let Some(file) = self.file.as_mut() {
            file.write_all(data).await?;
            self.written += data.len() as u64;
        }
        Ok(())
    }

    /// 刷新并关闭文件，重复调用无副作用
    pub async fn close(&mut self) -> io::Result<()> {
        self.closed = true;
        if let Some(mut file) = self.file.take() {
            file.flush().await?;
            file.sync_all().await?;
        }
        Ok(())
    }
}
