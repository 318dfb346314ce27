//! 中继 HTTP 客户端
//!
//! 中继只保存密文和元数据，不参与加解密。
//!
//! | 操作 | 请求 |
//! |---|---|
//! | 创建会话 | `POST /create-session` |
//! | 上传 | `POST /upload` (multipart: `metadata`, `file`, `session_id`) |
//! | 列表 | `GET /get-all/{session_id}` |
//! | 下载 | `GET /download/{session_id}/{file_id}` |
//! | 删除 | `DELETE /delete/{session_id}/{file_id}` |
//! | 日志 | `GET /logs/{session_id}` |

use std::time::Duration;

use log::{debug, info};
use reqwest::multipart::{Form, Part};
use reqwest::{Response, Url};
use serde::Deserialize;

use super::FileMetadata;
use super::protocol::{UploadResponse, parse_listing};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(300);

#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error("Relay unavailable: {0}")]
    Unavailable(#[from] reqwest::Error),

    #[error("Relay returned {status}: {message}")]
    ServerError { status: u16, message: String },

    #[error("Invalid relay URL: {0}")]
    InvalidUrl(String),

    #[error("Invalid relay response: {0}")]
    InvalidResponse(String),
}

#[derive(Deserialize)]
struct CreateSessionResponse {
    session_id: String,
}

#[derive(Deserialize)]
struct ErrorBody {
    error: String,
}

#[derive(Debug, Clone)]
pub struct RelayClient {
    http: reqwest::Client,
    base: Url,
}

impl RelayClient {
    pub fn new(base_url: &str) -> Result<Self, RelayError> {
        let base = Url::parse(base_url).map_err(|e| RelayError::InvalidUrl(format!("{base_url}: {e}")))?;
        if base.cannot_be_a_base() {
            return Err(RelayError::InvalidUrl(base_url.to_string()));
        }
        let http = reqwest::Client::builder().timeout(REQUEST_TIMEOUT).build()?;
        Ok(Self { http, base })
    }

    pub fn base_url(&self) -> &Url {
        &self.base
    }

    /// 拼接路径段，段内字符按需转义
    fn endpoint(&self, segments: &[&str]) -> Result<Url, RelayError> {
        let mut url = self.base.clone();
        url.path_segments_mut()
            .map_err(|()| RelayError::InvalidUrl(self.base.to_string()))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    /// 创建会话，返回服务器分配的房间码
    pub async fn create_session(&self) -> Result<String, RelayError> {
        let url = self.endpoint(&["create-session"])?;
        let response = check(self.http.post(url).send().await?).await?;
        let body: CreateSessionResponse = response
            .json()
            .await
            .map_err(|e| RelayError::InvalidResponse(e.to_string()))?;
        if body.session_id.is_empty() {
            return Err(RelayError::InvalidResponse("empty session_id".into()));
        }
        info!("Created relay session {}", body.session_id);
        Ok(body.session_id)
    }

    pub async fn upload(
        &self,
        session_id: &str,
        metadata: &FileMetadata,
        ciphertext: Vec<u8>,
    ) -> Result<UploadResponse, RelayError> {
        let url = self.endpoint(&["upload"])?;
        let metadata_json = serde_json::to_string(metadata)
            .map_err(|e| RelayError::InvalidResponse(e.to_string()))?;
        let size = ciphertext.len();

        let form = Form::new()
            .part("metadata", Part::text(metadata_json).mime_str("application/json")?)
            .part("file", Part::bytes(ciphertext).mime_str("application/octet-stream")?)
            .text("session_id", session_id.to_string());

        debug!("Uploading {} ({size} encrypted bytes)", metadata.file_name);
        let response = check(self.http.post(url).multipart(form).send().await?).await?;
        let body: UploadResponse = response
            .json()
            .await
            .map_err(|e| RelayError::InvalidResponse(e.to_string()))?;

        if !body.success {
            return Err(RelayError::ServerError {
                status: 200,
                message: body.message,
            });
        }
        Ok(body)
    }

    pub async fn list(&self, session_id: &str) -> Result<Vec<(String, FileMetadata)>, RelayError> {
        let url = self.endpoint(&["get-all", session_id])?;
        let body = check(self.http.get(url).send().await?).await?.text().await?;
        let entries = parse_listing(&body);
        debug!("Relay lists {} file(s) for {session_id}", entries.len());
        Ok(entries)
    }

    pub async fn download(&self, session_id: &str, file_id: &str) -> Result<Vec<u8>, RelayError> {
        let url = self.endpoint(&["download", session_id, file_id])?;
        let bytes = check(self.http.get(url).send().await?).await?.bytes().await?;
        debug!("Downloaded {file_id}: {} bytes", bytes.len());
        Ok(bytes.to_vec())
    }

    pub async fn delete(&self, session_id: &str, file_id: &str) -> Result<(), RelayError> {
        let url = self.endpoint(&["delete", session_id, file_id])?;
        check(self.http.delete(url).send().await?).await?;
        info!("Deleted {file_id} from relay");
        Ok(())
    }

    /// 会话的服务器端活动日志（纯文本）
    pub async fn logs(&self, session_id: &str) -> Result<String, RelayError> {
        let url = self.endpoint(&["logs", session_id])?;
        Ok(check(self.http.get(url).send().await?).await?.text().await?)
    }

    /// 连通性探测；任何 HTTP 响应都算可达
    pub async fn is_reachable(&self) -> bool {
        self.http.head(self.base.clone()).send().await.is_ok()
    }
}

/// 非 2xx 状态转换为 `ServerError`，优先使用 JSON 中的 `error` 字段
async fn check(response: Response) -> Result<Response, RelayError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let text = response.text().await.unwrap_or_default();
    let message = serde_json::from_str::<ErrorBody>(&text)
        .map(|b| b.error)
        .unwrap_or(text);
    Err(RelayError::ServerError {
        status: status.as_u16(),
        message,
    })
}
