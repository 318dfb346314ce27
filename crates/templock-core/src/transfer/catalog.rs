//! 本地文件目录
//!
//! 记录中继上当前会话的文件及其下载状态：
//!
//! ```text
//! Inactive --start--> Downloading --complete--> Downloaded
//!                          |
//!                          +------fail-------> Inactive
//! ```
//!
//! 刷新列表时，已存在的记录保留下载状态与明文。

use std::collections::{HashMap, HashSet};

use log::debug;

use super::FileMetadata;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileState {
    Inactive,
    Downloading,
    Downloaded,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FileRecord {
    pub id: String,
    pub metadata: FileMetadata,
    state: FileState,
    payload: Option<Vec<u8>>,
}

impl FileRecord {
    fn new(id: String, metadata: FileMetadata) -> Self {
        Self {
            id,
            metadata,
            state: FileState::Inactive,
            payload: None,
        }
    }

    pub fn state(&self) -> FileState {
        self.state
    }

    /// 仅在 `Downloaded` 状态下存在
    pub fn payload(&self) -> Option<&[u8]> {
        self.payload.as_deref()
    }
}

/// 开始下载时的快照，下载过程中不持有目录
#[derive(Debug, Clone, PartialEq)]
pub struct DownloadTicket {
    pub id: String,
    pub metadata: FileMetadata,
}

#[derive(Debug, Clone, PartialEq)]
pub enum DownloadStart {
    Started(DownloadTicket),
    /// 已在下载或已下载，保持原状态
    Skipped(FileState),
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CatalogError {
    #[error("Unknown file: {0}")]
    UnknownFile(String),

    #[error("File {id} is {state:?}, expected Downloading")]
    NotDownloading { id: String, state: FileState },
}

#[derive(Debug, Default)]
pub struct FileCatalog {
    records: Vec<FileRecord>,
}

impl FileCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> &[FileRecord] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn get(&self, id: &str) -> Option<&FileRecord> {
        self.records.iter().find(|r| r.id == id)
    }

    fn get_mut(&mut self, id: &str) -> Result<&mut FileRecord, CatalogError> {
        self.records
            .iter_mut()
            .find(|r| r.id == id)
            .ok_or_else(|| CatalogError::UnknownFile(id.to_string()))
    }

    /// 用服务器列表替换目录
    ///
    /// 列表中已知的 ID 保留状态与明文、更新元数据；新 ID 为 `Inactive`；
    /// 不在列表中的记录被移除。重复 ID 只保留第一条。
    pub fn refresh(&mut self, listing: Vec<(String, FileMetadata)>) {
        let mut previous: HashMap<String, FileRecord> = self
            .records
            .drain(..)
            .map(|r| (r.id.clone(), r))
            .collect();
        let mut seen = HashSet::new();

        for (id, metadata) in listing {
            if !seen.insert(id.clone()) {
                debug!("Ignoring duplicate listing entry {id}");
                continue;
            }
            let record = match previous.remove(&id) {
                Some(mut existing) => {
                    existing.metadata = metadata;
                    existing
                }
                None => FileRecord::new(id, metadata),
            };
            self.records.push(record);
        }

        if !previous.is_empty() {
            debug!("Dropped {} file(s) no longer on relay", previous.len());
        }
    }

    /// 上传成功后直接加入，已存在则只更新元数据
    pub fn insert(&mut self, id: impl Into<String>, metadata: FileMetadata) {
        let id = id.into();
        if let Some(existing) = self.records.iter_mut().find(|r| r.id == id) {
            existing.metadata = metadata;
        } else {
            self.records.push(FileRecord::new(id, metadata));
        }
    }

    pub fn remove(&mut self, id: &str) -> Option<FileRecord> {
        let index = self.records.iter().position(|r| r.id == id)?;
        Some(self.records.remove(index))
    }

    pub fn start_download(&mut self, id: &str) -> Result<DownloadStart, CatalogError> {
        let record = self.get_mut(id)?;
        match record.state {
            FileState::Inactive => {
                record.state = FileState::Downloading;
                Ok(DownloadStart::Started(DownloadTicket {
                    id: record.id.clone(),
                    metadata: record.metadata.clone(),
                }))
            }
            state => Ok(DownloadStart::Skipped(state)),
        }
    }

    pub fn complete_download(&mut self, id: &str, plaintext: Vec<u8>) -> Result<(), CatalogError> {
        let record = self.downloading(id)?;
        record.state = FileState::Downloaded;
        record.payload = Some(plaintext);
        Ok(())
    }

    pub fn fail_download(&mut self, id: &str) -> Result<(), CatalogError> {
        let record = self.downloading(id)?;
        record.state = FileState::Inactive;
        record.payload = None;
        Ok(())
    }

    fn downloading(&mut self, id: &str) -> Result<&mut FileRecord, CatalogError> {
        let record = self.get_mut(id)?;
        if record.state != FileState::Downloading {
            return Err(CatalogError::NotDownloading {
                id: id.to_string(),
                state: record.state,
            });
        }
        Ok(record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta(name: &str) -> FileMetadata {
        FileMetadata::new(name, 4, "00", "AAAAAAAAAAAAAAAA")
    }

    fn listing(ids: &[&str]) -> Vec<(String, FileMetadata)> {
        ids.iter().map(|id| ((*id).to_string(), meta(id))).collect()
    }

    #[test]
    fn test_refresh_preserves_download_state() {
        let mut catalog = FileCatalog::new();
        catalog.refresh(listing(&["a", "b"]));
        catalog.start_download("a").unwrap();
        catalog.complete_download("a", b"data".to_vec()).unwrap();

        catalog.refresh(listing(&["a", "c"]));
        let ids: Vec<_> = catalog.records().iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, ["a", "c"]);

        let a = catalog.get("a").unwrap();
        assert_eq!(a.state(), FileState::Downloaded);
        assert_eq!(a.payload(), Some(&b"data"[..]));
        assert_eq!(catalog.get("c").unwrap().state(), FileState::Inactive);
        assert!(catalog.get("b").is_none());
    }

    #[test]
    fn test_refresh_deduplicates() {
        let mut catalog = FileCatalog::new();
        catalog.refresh(listing(&["a", "a", "b"]));
        assert_eq!(catalog.len(), 2);
    }

    #[test]
    fn test_download_transitions() {
        let mut catalog = FileCatalog::new();
        catalog.refresh(listing(&["a"]));

        let DownloadStart::Started(ticket) = catalog.start_download("a").unwrap() else {
            panic!("expected download to start");
        };
        assert_eq!(ticket.id, "a");
        assert_eq!(
            catalog.start_download("a").unwrap(),
            DownloadStart::Skipped(FileState::Downloading)
        );

        catalog.fail_download("a").unwrap();
        assert_eq!(catalog.get("a").unwrap().state(), FileState::Inactive);

        catalog.start_download("a").unwrap();
        catalog.complete_download("a", vec![1]).unwrap();
        assert_eq!(
            catalog.start_download("a").unwrap(),
            DownloadStart::Skipped(FileState::Downloaded)
        );
    }

    #[test]
    fn test_invalid_transitions() {
        let mut catalog = FileCatalog::new();
        catalog.refresh(listing(&["a"]));
        assert!(matches!(
            catalog.complete_download("a", vec![]),
            Err(CatalogError::NotDownloading { .. })
        ));
        assert_eq!(
            catalog.start_download("missing").unwrap_err(),
            CatalogError::UnknownFile("missing".into())
        );
    }

    #[test]
    fn test_insert_and_remove() {
        let mut catalog = FileCatalog::new();
        catalog.insert("a", meta("first"));
        catalog.insert("a", meta("second"));
        assert_eq!(catalog.len(), 1);
        assert_eq!(catalog.get("a").unwrap().metadata.file_name, "second");

        assert!(catalog.remove("a").is_some());
        assert!(catalog.remove("a").is_none());
        assert!(catalog.is_empty());
    }
}
