//! 基于会话的文件操作
//!
//! 目录由异步互斥锁保护，中继请求期间不持有锁，
//! 不同文件的下载可以并行。

use std::sync::Arc;

use log::{info, warn};
use tokio::sync::Mutex;

use crate::crypto::{open_file, seal_file};
use crate::error::Result;
use crate::session::Session;
use crate::transfer::{DownloadStart, FileCatalog, FileRecord, FileState, RelayClient, RelayError};

#[derive(Clone)]
pub struct FileService {
    relay: RelayClient,
    session: Session,
    catalog: Arc<Mutex<FileCatalog>>,
}

impl FileService {
    pub fn new(relay: RelayClient, session: Session) -> Self {
        Self {
            relay,
            session,
            catalog: Arc::new(Mutex::new(FileCatalog::new())),
        }
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn relay(&self) -> &RelayClient {
        &self.relay
    }

    pub fn catalog(&self) -> Arc<Mutex<FileCatalog>> {
        Arc::clone(&self.catalog)
    }

    pub async fn snapshot(&self) -> Vec<FileRecord> {
        self.catalog.lock().await.records().to_vec()
    }

    /// 拉取中继列表并合并到目录，返回文件数
    pub async fn refresh(&self) -> Result<usize> {
        let listing = self.relay.list(self.session.session_id()).await?;
        let mut catalog = self.catalog.lock().await;
        catalog.refresh(listing);
        Ok(catalog.len())
    }

    /// 加密并上传，返回中继分配的文件 ID
    pub async fn upload(&self, file_name: &str, plaintext: &[u8]) -> Result<String> {
        let (metadata, blob) = seal_file(file_name, plaintext, self.session.key())?;
        let response = self
            .relay
            .upload(self.session.session_id(), &metadata, blob.ciphertext_with_tag)
            .await?;
        let file_id = response
            .file_id
            .ok_or_else(|| RelayError::InvalidResponse("upload response without file_id".into()))?;

        info!("Uploaded {file_name} as {file_id}");
        self.catalog.lock().await.insert(file_id.clone(), metadata);
        Ok(file_id)
    }

    /// 下载并解密
    ///
    /// 已下载的文件直接返回缓存明文；正在下载的返回 `None`。
    /// 失败时记录回到 `Inactive`，错误只影响这一个文件。
    pub async fn download(&self, file_id: &str) -> Result<Option<Vec<u8>>> {
        let start = self.catalog.lock().await.start_download(file_id)?;
        let ticket = match start {
            DownloadStart::Started(ticket) => ticket,
            DownloadStart::Skipped(FileState::Downloaded) => {
                let catalog = self.catalog.lock().await;
                return Ok(catalog
                    .get(file_id)
                    .and_then(FileRecord::payload)
                    .map(<[u8]>::to_vec));
            }
            DownloadStart::Skipped(_) => return Ok(None),
        };

        let fetched = self
            .relay
            .download(self.session.session_id(), &ticket.id)
            .await
            .map_err(crate::Error::from)
            .and_then(|ciphertext| {
                open_file(&ciphertext, &ticket.metadata, self.session.key()).map_err(Into::into)
            });

        let mut catalog = self.catalog.lock().await;
        match fetched {
            Ok(plaintext) => {
                catalog.complete_download(&ticket.id, plaintext.clone())?;
                info!("Downloaded {}", ticket.metadata.file_name);
                Ok(Some(plaintext))
            }
            Err(e) => {
                warn!("Download of {} failed: {e}", ticket.id);
                if let Err(catalog_error) = catalog.fail_download(&ticket.id) {
                    warn!("{catalog_error}");
                }
                Err(e)
            }
        }
    }

    pub async fn delete(&self, file_id: &str) -> Result<()> {
        self.relay.delete(self.session.session_id(), file_id).await?;
        self.catalog.lock().await.remove(file_id);
        Ok(())
    }

    pub async fn logs(&self) -> Result<String> {
        Ok(self.relay.logs(self.session.session_id()).await?)
    }
}
