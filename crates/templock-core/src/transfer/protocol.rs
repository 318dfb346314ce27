//! 中继服务器线格式
//!
//! 文件列表为纯文本，每行一个文件：
//!
//! ```text
//! <fileID>: <metadata JSON>
//! ```
//!
//! 在第一个 `:` 处切分，两侧去除空白。无法解析的行跳过并记录警告。

use log::warn;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::LazyLock;

use super::FileMetadata;

static LINE_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\s*([^:]*?)\s*:\s*(.*?)\s*$").unwrap());

/// 解析 `GET /get-all/{session}` 的响应体
pub fn parse_listing(body: &str) -> Vec<(String, FileMetadata)> {
    body.lines()
        .filter(|line| !line.trim().is_empty())
        .filter_map(|line| {
            let parsed = parse_line(line);
            if parsed.is_none() {
                warn!("Skipping malformed listing line: {line:?}");
            }
            parsed
        })
        .collect()
}

fn parse_line(line: &str) -> Option<(String, FileMetadata)> {
    let caps = LINE_PATTERN.captures(line)?;
    let id = caps.get(1)?.as_str();
    if id.is_empty() {
        return None;
    }
    let metadata = serde_json::from_str(caps.get(2)?.as_str()).ok()?;
    Some((id.to_string(), metadata))
}

/// 生成列表中的一行
pub fn format_listing_line(id: &str, metadata: &FileMetadata) -> Result<String, serde_json::Error> {
    Ok(format!("{id}: {}", serde_json::to_string(metadata)?))
}

/// `POST /upload` 的响应
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Default)]
pub struct UploadResponse {
    pub success: bool,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub file_id: Option<String>,
    #[serde(default)]
    pub download_url: Option<String>,
}
