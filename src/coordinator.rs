//! 上传会话协调器：创建、接收分片、完成与删除，字节存储委托给存储能力。

use axum_extra::headers::{Authorization, authorization::Basic};
use bytes::Bytes;
use futures_util::stream::{self, StreamExt};
use std::io;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::access::authorize;
use crate::config::{DEFAULT_LOCK_WAIT_TIMEOUT_SECS, MAX_PART_NUMBER};
use crate::error::ApiError;
use crate::metadata::{FileMetadata, MetadataStore};
use crate::models::{CreateFileRequest, UploadedPart};
use crate::storage::{
    ByteStream, MultipartStorage, ObjectInfo, SessionStatus, StoredObject, validate_key,
};

#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// 合并后对象的大小上限，0 表示不限制。
    pub max_object_size: u64,
    pub metadata_ttl: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadSession {
    pub id: String,
    pub storage_key: String,
    pub upload_id: String,
    pub status: SessionStatus,
}

pub struct UploadCoordinator {
    storage: Arc<dyn MultipartStorage>,
    metadata: Arc<dyn MetadataStore>,
    locks: crate::locking::LockManager,
    config: CoordinatorConfig,
}

fn validate_id(id: &str) -> Result<(), ApiError> {
    validate_key(id).map_err(|_| ApiError::BadRequest("invalid file id".into()))
}

fn lock_timeout() -> Duration {
    Duration::from_secs(DEFAULT_LOCK_WAIT_TIMEOUT_SECS)
}

/// 读取到第一个非空数据块为止；请求体为空时返回 `None`。
async fn non_empty_body(mut body: ByteStream) -> Result<Option<ByteStream>, ApiError> {
    while let Some(chunk) = body.next().await {
        let chunk: Bytes = chunk.map_err(|err| ApiError::BadRequest(err.to_string()))?;
        if !chunk.is_empty() {
            let head = stream::once(async move { Ok::<Bytes, io::Error>(chunk) });
            return Ok(Some(head.chain(body).boxed()));
        }
    }
    Ok(None)
}

impl UploadCoordinator {
    pub fn new(
        storage: Arc<dyn MultipartStorage>,
        metadata: Arc<dyn MetadataStore>,
        config: CoordinatorConfig,
    ) -> Self {
        Self {
            storage,
            metadata,
            locks: crate::locking::LockManager::new(),
            config,
        }
    }

    /// 写入元数据后开启存储会话；开启失败时回滚元数据。
    pub async fn create(
        &self,
        id: &str,
        request: CreateFileRequest,
    ) -> Result<UploadSession, ApiError> {
        validate_id(id)?;
        let filename = request.filename.trim().to_string();
        if filename.is_empty() {
            return Err(ApiError::BadRequest("filename is required".into()));
        }
        let content_type = request
            .content_type
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
            .unwrap_or_else(|| {
                mime_guess::from_path(&filename)
                    .first_or_octet_stream()
                    .essence_str()
                    .to_string()
            });
        let password = request.password.filter(|value| !value.is_empty());

        let _guard = self
            .locks
            .lock_with_timeout(id, lock_timeout())
            .await
            .map_err(|err| ApiError::Conflict(err.to_string()))?;

        if self.metadata.get(id).await?.is_some() {
            return Err(ApiError::Conflict("File already exists".into()));
        }
        // 元数据过期但尚未被清理时，旧对象不能被新 id 继承。
        self.storage.delete(id).await?;

        let metadata = FileMetadata::new(
            id,
            filename,
            content_type,
            password,
            self.config.metadata_ttl,
        );
        self.metadata.put(&metadata).await?;

        let session = match self.storage.create_session(id).await {
            Ok(session) => session,
            Err(err) => {
                warn!(id, error = %err, "storage session failed, rolling back metadata");
                if let Err(rollback) = self.metadata.delete(id).await {
                    warn!(id, error = %rollback, "metadata rollback failed");
                }
                return Err(err.into());
            }
        };

        info!(
            id,
            upload_id = session.upload_id,
            filename = metadata.filename,
            protected = metadata.password.is_some(),
            "upload created"
        );
        Ok(UploadSession {
            id: id.to_string(),
            storage_key: session.key,
            upload_id: session.upload_id,
            status: session.status,
        })
    }

    pub async fn upload_part(
        &self,
        id: &str,
        upload_id: &str,
        part_number: u32,
        body: ByteStream,
    ) -> Result<UploadedPart, ApiError> {
        validate_id(id)?;
        if part_number == 0 || part_number > MAX_PART_NUMBER {
            return Err(ApiError::BadRequest(format!(
                "partNumber must be between 1 and {MAX_PART_NUMBER}"
            )));
        }
        let Some(body) = non_empty_body(body).await? else {
            return Err(ApiError::BadRequest("No body provided".into()));
        };

        let session = self.storage.resume_session(id, upload_id).await?;
        let part = self.storage.put_part(&session, part_number, body).await?;
        Ok(part)
    }

    /// 完成上传；合并后超过大小上限时删除对象与元数据。
    pub async fn complete(
        &self,
        id: &str,
        upload_id: &str,
        mut parts: Vec<UploadedPart>,
    ) -> Result<ObjectInfo, ApiError> {
        validate_id(id)?;
        let _guard = self
            .locks
            .lock_with_timeout(&format!("{id}/{upload_id}"), lock_timeout())
            .await
            .map_err(|err| ApiError::Conflict(err.to_string()))?;

        let session = self.storage.resume_session(id, upload_id).await?;
        if self.metadata.get(id).await?.is_none() {
            return Err(ApiError::NotFound("Not found".into()));
        }

        parts.sort_by_key(|part| part.part_number);
        let info = self.storage.complete(&session, &parts).await?;

        let limit = self.config.max_object_size;
        if limit > 0 && info.size > limit {
            warn!(id, size = info.size, limit, "assembled object exceeds size cap");
            self.storage.delete(id).await?;
            self.metadata.delete(id).await?;
            return Err(ApiError::SizeExceeded {
                size: info.size,
                limit,
            });
        }

        info!(id, size = info.size, etag = info.etag, "upload completed");
        Ok(info)
    }

    /// 删除元数据、对象与未完成的会话；不存在时不报错。
    pub async fn delete(&self, id: &str) -> Result<(), ApiError> {
        validate_id(id)?;
        let _guard = self
            .locks
            .lock_with_timeout(id, lock_timeout())
            .await
            .map_err(|err| ApiError::Conflict(err.to_string()))?;
        self.metadata.delete(id).await?;
        self.storage.delete(id).await?;
        info!(id, "file deleted");
        Ok(())
    }

    /// 读取文件：元数据缺失返回 404，密码校验失败时不访问对象。
    pub async fn open(
        &self,
        id: &str,
        credentials: Option<&Authorization<Basic>>,
    ) -> Result<(FileMetadata, StoredObject), ApiError> {
        validate_id(id)?;
        let metadata = self
            .metadata
            .get(id)
            .await?
            .ok_or_else(|| ApiError::NotFound("Not found".into()))?;
        authorize(&metadata, credentials)?;
        let object = self
            .storage
            .get(id)
            .await?
            .ok_or_else(|| ApiError::NotFound("Not found".into()))?;
        Ok((metadata, object))
    }

    /// 清理已过期的文件（元数据与对象一起删除）。
    ///
    /// 与 `create` 共用 id 锁；取得锁后条目若已被重新创建则跳过。
    pub async fn sweep_expired(&self) -> Result<usize, ApiError> {
        let expired = self.metadata.expired(chrono::Utc::now()).await?;
        let mut removed = 0;
        for id in &expired {
            let _guard = match self.locks.lock_with_timeout(id, lock_timeout()).await {
                Ok(guard) => guard,
                Err(err) => {
                    warn!(id, error = %err, "expired file busy, retrying next sweep");
                    continue;
                }
            };
            if self.metadata.get(id).await?.is_some() {
                debug!(id, "expired entry was recreated, skipping");
                continue;
            }
            self.metadata.delete(id).await?;
            self.storage.delete(id).await?;
            info!(id, "expired file removed");
            removed += 1;
        }
        Ok(removed)
    }

    /// 中止超过存活时间仍未完成的会话。
    pub async fn abort_stale_sessions(&self, older_than: Duration) -> Result<usize, ApiError> {
        let stale = self.storage.stale_sessions(older_than).await?;
        for session in &stale {
            self.storage.abort(session).await?;
            info!(
                key = session.key,
                upload_id = session.upload_id,
                "stale upload session aborted"
            );
        }
        Ok(stale.len())
    }

    pub async fn prune_locks(&self) {
        self.locks.prune().await;
    }
}
