//! 文件传输模块
//!
//! 包含:
//! - 中继服务器的线格式 ([`protocol`])
//! - 中继 HTTP 客户端 ([`relay`])
//! - 本地文件目录及下载状态 ([`catalog`])

pub mod catalog;
pub mod protocol;
pub mod relay;

pub use catalog::{CatalogError, DownloadStart, DownloadTicket, FileCatalog, FileRecord, FileState};
pub use protocol::{UploadResponse, format_listing_line, parse_listing};
pub use relay::{RelayClient, RelayError};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// 上传文件的元数据，作为 JSON 随文件一起存放在中继上
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct FileMetadata {
    pub file_name: String,
    pub file_size: u64,
    #[serde(with = "timestamp")]
    pub timestamp: DateTime<Utc>,
    /// 明文的 SHA-256，小写十六进制
    pub checksum: String,
    /// Base64 编码的 12 字节 AES-GCM IV
    pub iv: String,
}

impl FileMetadata {
    pub fn new(
        file_name: impl Into<String>,
        file_size: u64,
        checksum: impl Into<String>,
        iv: impl Into<String>,
    ) -> Self {
        Self {
            file_name: file_name.into(),
            file_size,
            timestamp: Utc::now(),
            checksum: checksum.into(),
            iv: iv.into(),
        }
    }
}

/// 时间戳写为 RFC 3339；读取时也接受数字形式的
/// "自 2001-01-01 UTC 起的秒数"（其他客户端的 Date 编码）
mod timestamp {
    use chrono::{DateTime, SecondsFormat, TimeDelta, Utc};
    use serde::{Deserialize, Deserializer, Serializer, de::Error as _};

    const REFERENCE_EPOCH_SECS: i64 = 978_307_200;

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Text(String),
        Seconds(f64),
    }

    pub fn serialize<S: Serializer>(value: &DateTime<Utc>, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&value.to_rfc3339_opts(SecondsFormat::Millis, true))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<DateTime<Utc>, D::Error> {
        match Raw::deserialize(d)? {
            Raw::Text(text) => DateTime::parse_from_rfc3339(&text)
                .map(|t| t.with_timezone(&Utc))
                .map_err(D::Error::custom),
            Raw::Seconds(secs) => from_reference_seconds(secs)
                .ok_or_else(|| D::Error::custom(format!("timestamp out of range: {secs}"))),
        }
    }

    #[allow(clippy::cast_possible_truncation)]
    fn from_reference_seconds(secs: f64) -> Option<DateTime<Utc>> {
        if !secs.is_finite() {
            return None;
        }
        let epoch = DateTime::<Utc>::from_timestamp(REFERENCE_EPOCH_SECS, 0)?;
        let millis = (secs * 1000.0).round() as i64;
        epoch.checked_add_signed(TimeDelta::try_milliseconds(millis)?)
    }
}
