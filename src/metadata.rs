//! 文件元数据网关：带过期时间的键值存储。

use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use std::io;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;
use tokio::fs;
use tracing::{debug, warn};

use crate::atomic::write_atomic;
use crate::storage::validate_key;

#[derive(Debug, Error)]
pub enum MetadataError {
    #[error("invalid metadata id")]
    InvalidId,
    #[error("metadata io error: {0}")]
    Io(#[from] io::Error),
    #[error("corrupt metadata record: {0}")]
    Decode(#[from] serde_json::Error),
}

/// 下载时使用的文件名、类型、可选密码与有效期。
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct FileMetadata {
    pub id: String,
    pub filename: String,
    pub content_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl FileMetadata {
    pub fn new(
        id: &str,
        filename: String,
        content_type: String,
        password: Option<String>,
        ttl: Duration,
    ) -> Self {
        let created_at = Utc::now();
        let ttl = TimeDelta::from_std(ttl).unwrap_or(TimeDelta::MAX);
        let expires_at = created_at
            .checked_add_signed(ttl)
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        Self {
            id: id.to_string(),
            filename,
            content_type,
            password,
            created_at,
            expires_at,
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

/// 元数据键值存储能力；`get` 对缺失与已过期条目一律返回 `None`。
#[async_trait]
pub trait MetadataStore: Send + Sync {
    async fn put(&self, metadata: &FileMetadata) -> Result<(), MetadataError>;

    async fn get(&self, id: &str) -> Result<Option<FileMetadata>, MetadataError>;

    async fn delete(&self, id: &str) -> Result<(), MetadataError>;

    /// 列出在 `now` 时已过期、尚未清理的条目 id。
    async fn expired(&self, now: DateTime<Utc>) -> Result<Vec<String>, MetadataError>;
}

/// 每个 id 一个 JSON 文件的元数据存储。
#[derive(Clone, Debug)]
pub struct FsMetadataStore {
    root: PathBuf,
}

impl FsMetadataStore {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    pub async fn ensure_root(&self) -> io::Result<()> {
        fs::create_dir_all(&self.root).await
    }

    fn entry_path(&self, id: &str) -> Result<PathBuf, MetadataError> {
        validate_key(id).map_err(|_| MetadataError::InvalidId)?;
        Ok(self.root.join(format!("{id}.json")))
    }

    async fn read_entry(&self, id: &str) -> Result<Option<FileMetadata>, MetadataError> {
        let bytes = match fs::read(self.entry_path(id)?).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        Ok(Some(serde_json::from_slice(&bytes)?))
    }
}

#[async_trait]
impl MetadataStore for FsMetadataStore {
    async fn put(&self, metadata: &FileMetadata) -> Result<(), MetadataError> {
        let path = self.entry_path(&metadata.id)?;
        write_atomic(&path, &serde_json::to_vec(metadata)?).await?;
        debug!(id = metadata.id, expires_at = %metadata.expires_at, "metadata stored");
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Option<FileMetadata>, MetadataError> {
        let Some(metadata) = self.read_entry(id).await? else {
            return Ok(None);
        };
        if metadata.is_expired(Utc::now()) {
            return Ok(None);
        }
        Ok(Some(metadata))
    }

    async fn delete(&self, id: &str) -> Result<(), MetadataError> {
        match fs::remove_file(self.entry_path(id)?).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    async fn expired(&self, now: DateTime<Utc>) -> Result<Vec<String>, MetadataError> {
        let mut dir = match fs::read_dir(&self.root).await {
            Ok(dir) => dir,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err.into()),
        };
        let mut expired = Vec::new();
        while let Some(entry) = dir.next_entry().await? {
            let name = entry.file_name().to_string_lossy().to_string();
            let Some(id) = name.strip_suffix(".json") else {
                continue;
            };
            if validate_key(id).is_err() {
                continue;
            }
            match self.read_entry(id).await {
                Ok(Some(metadata)) if metadata.is_expired(now) => expired.push(metadata.id),
                Ok(_) => {}
                Err(err) => warn!(id, error = %err, "unreadable metadata entry"),
            }
        }
        Ok(expired)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn make_store() -> (tempfile::TempDir, FsMetadataStore) {
        let temp = tempdir().expect("tempdir");
        let store = FsMetadataStore::new(temp.path().join("meta"));
        std::fs::create_dir_all(temp.path().join("meta")).expect("create meta dir");
        (temp, store)
    }

    fn sample(id: &str, ttl: Duration) -> FileMetadata {
        FileMetadata::new(
            id,
            "report.pdf".into(),
            "application/pdf".into(),
            Some("secret".into()),
            ttl,
        )
    }

    #[tokio::test]
    async fn put_then_get_returns_entry() {
        let (_temp, store) = make_store();
        let metadata = sample("abc", Duration::from_secs(60));
        store.put(&metadata).await.expect("put");
        let loaded = store.get("abc").await.expect("get");
        assert_eq!(loaded, Some(metadata));
        assert_eq!(store.get("missing").await.expect("get"), None);
    }

    #[tokio::test]
    async fn expired_entries_are_hidden_and_listed() {
        let (_temp, store) = make_store();
        store
            .put(&sample("old", Duration::ZERO))
            .await
            .expect("put old");
        store
            .put(&sample("fresh", Duration::from_secs(60)))
            .await
            .expect("put fresh");

        assert_eq!(store.get("old").await.expect("get"), None);
        let expired = store.expired(Utc::now()).await.expect("expired");
        assert_eq!(expired, vec!["old".to_string()]);
    }

    #[tokio::test]
    async fn delete_is_idempotent() {
        let (_temp, store) = make_store();
        store
            .put(&sample("abc", Duration::from_secs(60)))
            .await
            .expect("put");
        store.delete("abc").await.expect("delete");
        store.delete("abc").await.expect("delete again");
        assert_eq!(store.get("abc").await.expect("get"), None);
    }

    #[tokio::test]
    async fn invalid_ids_are_rejected() {
        let (_temp, store) = make_store();
        assert!(matches!(
            store.get("../escape").await,
            Err(MetadataError::InvalidId)
        ));
    }

    #[test]
    fn huge_ttl_saturates() {
        let metadata = sample("abc", Duration::from_secs(u64::MAX));
        assert_eq!(metadata.expires_at, DateTime::<Utc>::MAX_UTC);
        assert!(!metadata.is_expired(Utc::now()));
    }
}
