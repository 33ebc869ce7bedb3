//! 分片上传存储能力及其本地文件系统实现。
//!
//! 目录布局：
//! - `objects/<key>`：合并后的对象内容，`objects/<key>.json` 记录大小与 ETag；
//! - `uploads/<key>/<upload_id>/`：进行中的会话，包含 `session.json`、`<n>.part` 与 `<n>.etag`。

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures_util::stream::{BoxStream, StreamExt};
use serde::{Deserialize, Serialize};
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tokio::fs::{self, File};
use tokio::io::AsyncWriteExt;
use tokio_util::io::ReaderStream;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::atomic::{AtomicFile, write_atomic};
use crate::config::MAX_ID_LEN;
use crate::etag::{PartHasher, multipart_etag};
use crate::models::UploadedPart;

pub type ByteStream = BoxStream<'static, io::Result<Bytes>>;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("invalid object key")]
    InvalidKey,
    #[error("upload not found")]
    NoSuchUpload,
    #[error("no parts provided")]
    EmptyPartList,
    #[error("part {0} is missing")]
    MissingPart(u32),
    #[error("part {0} is listed more than once")]
    DuplicatePart(u32),
    #[error("etag mismatch for part {0}")]
    EtagMismatch(u32),
    #[error("storage io error: {0}")]
    Io(#[from] io::Error),
    #[error("corrupt storage record: {0}")]
    Decode(#[from] serde_json::Error),
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum SessionStatus {
    Created,
    Uploading,
    Completed,
    Aborted,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct MultipartSession {
    pub key: String,
    pub upload_id: String,
    pub status: SessionStatus,
    pub created_at: DateTime<Utc>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ObjectInfo {
    pub key: String,
    pub size: u64,
    pub etag: String,
    pub uploaded_at: DateTime<Utc>,
}

/// 读取到的对象：元信息加内容流。
pub struct StoredObject {
    pub info: ObjectInfo,
    pub body: ByteStream,
}

/// 对象存储的分片上传能力。`upload_id` 只在与其 `key` 配对时有效。
#[async_trait]
pub trait MultipartStorage: Send + Sync {
    async fn create_session(&self, key: &str) -> Result<MultipartSession, StorageError>;

    /// 校验 `(key, upload_id)` 是否为存活的会话。
    async fn resume_session(
        &self,
        key: &str,
        upload_id: &str,
    ) -> Result<MultipartSession, StorageError>;

    async fn put_part(
        &self,
        session: &MultipartSession,
        part_number: u32,
        body: ByteStream,
    ) -> Result<UploadedPart, StorageError>;

    /// 按顺序合并分片；调用方需按分片编号升序传入。
    async fn complete(
        &self,
        session: &MultipartSession,
        parts: &[UploadedPart],
    ) -> Result<ObjectInfo, StorageError>;

    async fn abort(&self, session: &MultipartSession) -> Result<(), StorageError>;

    async fn list_sessions(&self, key: &str) -> Result<Vec<MultipartSession>, StorageError>;

    /// 返回创建时间早于 `older_than` 的未完成会话。
    async fn stale_sessions(
        &self,
        older_than: Duration,
    ) -> Result<Vec<MultipartSession>, StorageError>;

    async fn get(&self, key: &str) -> Result<Option<StoredObject>, StorageError>;

    /// 删除对象及该 key 下所有未完成的会话，不存在时不报错。
    async fn delete(&self, key: &str) -> Result<(), StorageError>;
}

/// 校验对象 key，只允许字母、数字、`-` 与 `_`。
pub fn validate_key(key: &str) -> Result<(), StorageError> {
    let valid = !key.is_empty()
        && key.len() <= MAX_ID_LEN
        && key
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_');
    if valid {
        Ok(())
    } else {
        Err(StorageError::InvalidKey)
    }
}

#[derive(Clone, Debug)]
pub struct LocalStorage {
    root: PathBuf,
}

impl LocalStorage {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    pub async fn ensure_root(&self) -> io::Result<()> {
        fs::create_dir_all(self.objects_dir()).await?;
        fs::create_dir_all(self.uploads_dir()).await
    }

    fn objects_dir(&self) -> PathBuf {
        self.root.join("objects")
    }

    fn uploads_dir(&self) -> PathBuf {
        self.root.join("uploads")
    }

    fn object_path(&self, key: &str) -> PathBuf {
        self.objects_dir().join(key)
    }

    fn object_info_path(&self, key: &str) -> PathBuf {
        self.objects_dir().join(format!("{key}.json"))
    }

    fn session_dir(&self, key: &str, upload_id: &str) -> PathBuf {
        self.uploads_dir().join(key).join(upload_id)
    }

    async fn read_session(&self, dir: &Path) -> Result<MultipartSession, StorageError> {
        let bytes = match fs::read(dir.join("session.json")).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                return Err(StorageError::NoSuchUpload);
            }
            Err(err) => return Err(err.into()),
        };
        Ok(serde_json::from_slice(&bytes)?)
    }

    async fn write_session(&self, session: &MultipartSession) -> Result<(), StorageError> {
        let dir = self.session_dir(&session.key, &session.upload_id);
        let bytes = serde_json::to_vec(session)?;
        write_atomic(&dir.join("session.json"), &bytes)
            .await
            .map_err(not_found_as_no_such_upload)
    }

    /// 先写入终态再删除会话目录，删除中途失败时会话也不会被恢复。
    async fn finish_session(
        &self,
        session: &MultipartSession,
        status: SessionStatus,
    ) -> Result<(), StorageError> {
        let mut finished = session.clone();
        finished.status = status;
        match self.write_session(&finished).await {
            Ok(()) | Err(StorageError::NoSuchUpload) => {}
            Err(err) => return Err(err),
        }
        ignore_not_found(
            fs::remove_dir_all(self.session_dir(&session.key, &session.upload_id)).await,
        )?;
        // 目录非空时删除失败属正常情况。
        let _ = fs::remove_dir(self.uploads_dir().join(&session.key)).await;
        Ok(())
    }
}

fn part_path(dir: &Path, part_number: u32) -> PathBuf {
    dir.join(format!("{part_number}.part"))
}

fn etag_path(dir: &Path, part_number: u32) -> PathBuf {
    dir.join(format!("{part_number}.etag"))
}

fn ignore_not_found(result: io::Result<()>) -> io::Result<()> {
    match result {
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
        other => other,
    }
}

fn not_found_as_no_such_upload(err: io::Error) -> StorageError {
    if err.kind() == io::ErrorKind::NotFound {
        StorageError::NoSuchUpload
    } else {
        StorageError::Io(err)
    }
}

#[async_trait]
impl MultipartStorage for LocalStorage {
    async fn create_session(&self, key: &str) -> Result<MultipartSession, StorageError> {
        validate_key(key)?;
        let session = MultipartSession {
            key: key.to_string(),
            upload_id: Uuid::new_v4().to_string(),
            status: SessionStatus::Created,
            created_at: Utc::now(),
        };
        fs::create_dir_all(self.session_dir(key, &session.upload_id)).await?;
        self.write_session(&session).await?;
        info!(key, upload_id = session.upload_id, "multipart session created");
        Ok(session)
    }

    async fn resume_session(
        &self,
        key: &str,
        upload_id: &str,
    ) -> Result<MultipartSession, StorageError> {
        validate_key(key)?;
        if Uuid::parse_str(upload_id).is_err() {
            return Err(StorageError::NoSuchUpload);
        }
        let session = self.read_session(&self.session_dir(key, upload_id)).await?;
        if session.key != key || session.upload_id != upload_id {
            return Err(StorageError::NoSuchUpload);
        }
        // 终态会话的目录可能尚未删除干净，不允许继续使用。
        if matches!(
            session.status,
            SessionStatus::Completed | SessionStatus::Aborted
        ) {
            return Err(StorageError::NoSuchUpload);
        }
        Ok(session)
    }

    async fn put_part(
        &self,
        session: &MultipartSession,
        part_number: u32,
        mut body: ByteStream,
    ) -> Result<UploadedPart, StorageError> {
        let dir = self.session_dir(&session.key, &session.upload_id);
        let mut atomic = AtomicFile::new(&part_path(&dir, part_number))
            .await
            .map_err(not_found_as_no_such_upload)?;
        let write_result: io::Result<(u64, String)> = async {
            let mut hasher = PartHasher::new();
            let mut written: u64 = 0;
            while let Some(chunk) = body.next().await {
                let chunk = chunk?;
                if chunk.is_empty() {
                    continue;
                }
                hasher.update(&chunk);
                atomic.file_mut().write_all(&chunk).await?;
                written += chunk.len() as u64;
            }
            Ok((written, hasher.finish()))
        }
        .await;
        let (written, etag) = match write_result {
            Ok(value) => value,
            Err(err) => {
                atomic.cleanup().await;
                return Err(err.into());
            }
        };
        atomic.finalize().await.map_err(not_found_as_no_such_upload)?;
        write_atomic(&etag_path(&dir, part_number), etag.as_bytes())
            .await
            .map_err(not_found_as_no_such_upload)?;

        if session.status == SessionStatus::Created {
            let mut updated = session.clone();
            updated.status = SessionStatus::Uploading;
            self.write_session(&updated).await?;
        }

        debug!(
            key = session.key,
            upload_id = session.upload_id,
            part_number,
            bytes = written,
            "part stored"
        );
        Ok(UploadedPart { part_number, etag })
    }

    async fn complete(
        &self,
        session: &MultipartSession,
        parts: &[UploadedPart],
    ) -> Result<ObjectInfo, StorageError> {
        if parts.is_empty() {
            return Err(StorageError::EmptyPartList);
        }
        let dir = self.session_dir(&session.key, &session.upload_id);
        if fs::metadata(&dir).await.is_err() {
            return Err(StorageError::NoSuchUpload);
        }

        for (index, part) in parts.iter().enumerate() {
            let expected = index as u32 + 1;
            if part.part_number < expected {
                return Err(StorageError::DuplicatePart(part.part_number));
            }
            if part.part_number > expected {
                return Err(StorageError::MissingPart(expected));
            }
            let stored = match fs::read_to_string(etag_path(&dir, expected)).await {
                Ok(value) => value,
                Err(err) if err.kind() == io::ErrorKind::NotFound => {
                    return Err(StorageError::MissingPart(expected));
                }
                Err(err) => return Err(err.into()),
            };
            if stored.trim() != part.etag.trim_matches('"') {
                return Err(StorageError::EtagMismatch(expected));
            }
        }

        let target = self.object_path(&session.key);
        let mut atomic = AtomicFile::new(&target).await?;
        let merge_result: io::Result<u64> = async {
            let mut total_written: u64 = 0;
            for part in parts {
                let mut part_file = File::open(part_path(&dir, part.part_number)).await?;
                total_written += tokio::io::copy(&mut part_file, atomic.file_mut()).await?;
            }
            Ok(total_written)
        }
        .await;
        let size = match merge_result {
            Ok(value) => value,
            Err(err) => {
                atomic.cleanup().await;
                return Err(err.into());
            }
        };
        atomic.finalize().await?;

        let info = ObjectInfo {
            key: session.key.clone(),
            size,
            etag: multipart_etag(parts.iter().map(|part| part.etag.trim_matches('"'))),
            uploaded_at: Utc::now(),
        };
        write_atomic(
            &self.object_info_path(&session.key),
            &serde_json::to_vec(&info)?,
        )
        .await?;
        self.finish_session(session, SessionStatus::Completed)
            .await?;

        info!(
            key = session.key,
            upload_id = session.upload_id,
            parts = parts.len(),
            size,
            "multipart session completed"
        );
        Ok(info)
    }

    async fn abort(&self, session: &MultipartSession) -> Result<(), StorageError> {
        self.finish_session(session, SessionStatus::Aborted).await?;
        info!(
            key = session.key,
            upload_id = session.upload_id,
            "multipart session aborted"
        );
        Ok(())
    }

    async fn list_sessions(&self, key: &str) -> Result<Vec<MultipartSession>, StorageError> {
        validate_key(key)?;
        let mut dir = match fs::read_dir(self.uploads_dir().join(key)).await {
            Ok(dir) => dir,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err.into()),
        };
        let mut sessions = Vec::new();
        while let Some(entry) = dir.next_entry().await? {
            if !entry.file_type().await?.is_dir() {
                continue;
            }
            match self.read_session(&entry.path()).await {
                Ok(session) => sessions.push(session),
                Err(StorageError::NoSuchUpload) => continue,
                Err(err) => {
                    warn!(path = ?entry.path(), error = %err, "unreadable upload session");
                }
            }
        }
        sessions.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(sessions)
    }

    async fn stale_sessions(
        &self,
        older_than: Duration,
    ) -> Result<Vec<MultipartSession>, StorageError> {
        let mut dir = match fs::read_dir(self.uploads_dir()).await {
            Ok(dir) => dir,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err.into()),
        };
        let now = Utc::now();
        let mut stale = Vec::new();
        while let Some(entry) = dir.next_entry().await? {
            let key = entry.file_name().to_string_lossy().to_string();
            if validate_key(&key).is_err() {
                continue;
            }
            for session in self.list_sessions(&key).await? {
                let Ok(age) = (now - session.created_at).to_std() else {
                    continue;
                };
                if age >= older_than {
                    stale.push(session);
                }
            }
        }
        Ok(stale)
    }

    async fn get(&self, key: &str) -> Result<Option<StoredObject>, StorageError> {
        validate_key(key)?;
        let file = match File::open(self.object_path(key)).await {
            Ok(file) => file,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        let info_bytes = match fs::read(self.object_info_path(key)).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        let info: ObjectInfo = serde_json::from_slice(&info_bytes)?;
        Ok(Some(StoredObject {
            info,
            body: ReaderStream::new(file).boxed(),
        }))
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        validate_key(key)?;
        ignore_not_found(fs::remove_file(self.object_path(key)).await)?;
        ignore_not_found(fs::remove_file(self.object_info_path(key)).await)?;
        ignore_not_found(fs::remove_dir_all(self.uploads_dir().join(key)).await)?;
        debug!(key, "object deleted");
        Ok(())
    }
}

#[cfg(test)]
pub(crate) fn bytes_stream(data: &[u8]) -> ByteStream {
    let chunks: Vec<io::Result<Bytes>> = data
        .chunks(4)
        .map(|chunk| Ok(Bytes::copy_from_slice(chunk)))
        .collect();
    futures_util::stream::iter(chunks).boxed()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    async fn make_storage() -> (tempfile::TempDir, LocalStorage) {
        let temp = tempdir().expect("tempdir");
        let storage = LocalStorage::new(temp.path().join("data"));
        storage.ensure_root().await.expect("ensure root");
        (temp, storage)
    }

    async fn read_object(storage: &LocalStorage, key: &str) -> Vec<u8> {
        let object = storage
            .get(key)
            .await
            .expect("get object")
            .expect("object exists");
        let mut body = object.body;
        let mut out = Vec::new();
        while let Some(chunk) = body.next().await {
            out.extend_from_slice(&chunk.expect("chunk"));
        }
        out
    }

    #[tokio::test]
    async fn parts_are_assembled_in_part_number_order() {
        let (_temp, storage) = make_storage().await;
        let session = storage.create_session("abc").await.expect("create");
        assert_eq!(session.status, SessionStatus::Created);

        // 分片乱序到达。
        let second = storage
            .put_part(&session, 2, bytes_stream(b"world"))
            .await
            .expect("part 2");
        let first = storage
            .put_part(&session, 1, bytes_stream(b"hello "))
            .await
            .expect("part 1");

        let resumed = storage
            .resume_session("abc", &session.upload_id)
            .await
            .expect("resume");
        assert_eq!(resumed.status, SessionStatus::Uploading);

        let info = storage
            .complete(&resumed, &[first, second])
            .await
            .expect("complete");
        assert_eq!(info.size, 11);
        assert!(info.etag.ends_with("-2"));
        assert_eq!(read_object(&storage, "abc").await, b"hello world");
        assert!(storage.list_sessions("abc").await.expect("list").is_empty());
    }

    #[tokio::test]
    async fn resume_rejects_unknown_or_mismatched_upload() {
        let (_temp, storage) = make_storage().await;
        let session = storage.create_session("abc").await.expect("create");
        storage.create_session("other").await.expect("create other");

        let unknown = storage
            .resume_session("abc", &Uuid::new_v4().to_string())
            .await;
        assert!(matches!(unknown, Err(StorageError::NoSuchUpload)));
        let garbage = storage.resume_session("abc", "../other").await;
        assert!(matches!(garbage, Err(StorageError::NoSuchUpload)));
        let mismatched = storage
            .resume_session("other", &session.upload_id)
            .await;
        assert!(matches!(mismatched, Err(StorageError::NoSuchUpload)));
    }

    #[tokio::test]
    async fn complete_verifies_etags_and_contiguity() {
        let (_temp, storage) = make_storage().await;
        let session = storage.create_session("abc").await.expect("create");
        let first = storage
            .put_part(&session, 1, bytes_stream(b"one"))
            .await
            .expect("part 1");
        let third = storage
            .put_part(&session, 3, bytes_stream(b"three"))
            .await
            .expect("part 3");

        let gap = storage.complete(&session, &[first.clone(), third]).await;
        assert!(matches!(gap, Err(StorageError::MissingPart(2))));

        let duplicate = storage
            .complete(&session, &[first.clone(), first.clone()])
            .await;
        assert!(matches!(duplicate, Err(StorageError::DuplicatePart(1))));

        let tampered = UploadedPart {
            part_number: 1,
            etag: "deadbeef".into(),
        };
        let mismatch = storage.complete(&session, &[tampered]).await;
        assert!(matches!(mismatch, Err(StorageError::EtagMismatch(1))));

        let empty = storage.complete(&session, &[]).await;
        assert!(matches!(empty, Err(StorageError::EmptyPartList)));
        assert!(storage.get("abc").await.expect("get").is_none());
    }

    #[tokio::test]
    async fn completed_session_cannot_be_reused() {
        let (_temp, storage) = make_storage().await;
        let session = storage.create_session("abc").await.expect("create");
        let part = storage
            .put_part(&session, 1, bytes_stream(b"data"))
            .await
            .expect("part");
        storage
            .complete(&session, std::slice::from_ref(&part))
            .await
            .expect("complete");

        let again = storage.complete(&session, &[part]).await;
        assert!(matches!(again, Err(StorageError::NoSuchUpload)));
        let late_part = storage.put_part(&session, 2, bytes_stream(b"x")).await;
        assert!(matches!(late_part, Err(StorageError::NoSuchUpload)));
    }

    #[tokio::test]
    async fn delete_is_idempotent_and_drops_sessions() {
        let (_temp, storage) = make_storage().await;
        let session = storage.create_session("abc").await.expect("create");
        let part = storage
            .put_part(&session, 1, bytes_stream(b"data"))
            .await
            .expect("part");
        storage.complete(&session, &[part]).await.expect("complete");
        storage.create_session("abc").await.expect("second session");

        storage.delete("abc").await.expect("delete");
        storage.delete("abc").await.expect("delete again");
        assert!(storage.get("abc").await.expect("get").is_none());
        assert!(storage.list_sessions("abc").await.expect("list").is_empty());
    }

    #[tokio::test]
    async fn stale_sessions_respect_age() {
        let (_temp, storage) = make_storage().await;
        let session = storage.create_session("abc").await.expect("create");

        let none = storage
            .stale_sessions(Duration::from_secs(3600))
            .await
            .expect("stale");
        assert!(none.is_empty());

        let all = storage
            .stale_sessions(Duration::ZERO)
            .await
            .expect("stale");
        assert_eq!(all, vec![session]);
    }

    #[tokio::test]
    async fn leftover_terminal_session_is_not_resumed() {
        let (_temp, storage) = make_storage().await;
        let session = storage.create_session("abc").await.expect("create");
        let mut aborted = session.clone();
        aborted.status = SessionStatus::Aborted;
        storage.write_session(&aborted).await.expect("mark aborted");

        let resumed = storage
            .resume_session("abc", &session.upload_id)
            .await;
        assert!(matches!(resumed, Err(StorageError::NoSuchUpload)));

        storage.abort(&session).await.expect("abort");
        storage.abort(&session).await.expect("abort again");
        assert!(storage.list_sessions("abc").await.expect("list").is_empty());
    }

    #[test]
    fn keys_are_restricted() {
        assert!(validate_key("abc-DEF_123").is_ok());
        assert!(validate_key("").is_err());
        assert!(validate_key("../etc").is_err());
        assert!(validate_key("a.json").is_err());
        assert!(validate_key(&"a".repeat(MAX_ID_LEN + 1)).is_err());
    }
}
