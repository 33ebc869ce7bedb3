//! `upload` 子命令：规划分片、并发上传、完成会话并输出下载地址。

use async_trait::async_trait;
use bytes::Bytes;
use std::io::SeekFrom;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::fs::{self, File};
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tracing::{info, warn};
use uuid::Uuid;

use crate::client::ClientError;
use crate::client::api::{ApiClient, CompletedUpload};
use crate::client::planner::{PartPlan, plan_parts};
use crate::client::pool::{PartUploader, PoolConfig, UploadProgress, upload_all};
use crate::client::retry::RetryPolicy;
use crate::config::{FailurePolicy, UploadArgs};
use crate::models::{CreateFileRequest, UploadedPart};

/// 上传成功后的结果。
#[derive(Debug, Clone)]
pub struct UploadReceipt {
    pub id: String,
    pub url: String,
    pub size: u64,
    pub etag: Option<String>,
}

/// 从本地文件读取分片并通过 HTTP 上传。
struct FilePartUploader {
    api: ApiClient,
    path: PathBuf,
    id: String,
    upload_id: String,
}

impl FilePartUploader {
    async fn read_part(&self, part: PartPlan) -> Result<Bytes, ClientError> {
        let length = usize::try_from(part.length)
            .map_err(|_| ClientError::Task(format!("part {} too large", part.part_number)))?;
        let mut file = File::open(&self.path).await?;
        file.seek(SeekFrom::Start(part.offset)).await?;
        let mut buffer = vec![0u8; length];
        file.read_exact(&mut buffer).await?;
        Ok(Bytes::from(buffer))
    }
}

#[async_trait]
impl PartUploader for FilePartUploader {
    async fn upload_part(&self, part: PartPlan) -> Result<UploadedPart, ClientError> {
        let body = self.read_part(part).await?;
        self.api
            .upload_part(&self.id, &self.upload_id, part.part_number, body)
            .await
    }
}

/// 执行上传并在标准输出打印文件 id 与下载地址。
pub async fn run(args: UploadArgs) -> Result<(), ClientError> {
    let receipt = upload_file(&args).await?;
    info!(size = receipt.size, etag = ?receipt.etag, "share ready");
    println!("{}", receipt.id);
    println!("{}", receipt.url);
    Ok(())
}

pub async fn upload_file(args: &UploadArgs) -> Result<UploadReceipt, ClientError> {
    let path = fs::canonicalize(&args.path).await?;
    let size = fs::metadata(&path).await?.len();
    let plan = plan_parts(size, args.part_size)?;
    let filename = path
        .file_name()
        .map(|name| name.to_string_lossy().to_string())
        .unwrap_or_else(|| "file".to_string());
    let content_type = mime_guess::from_path(&path)
        .first_or_octet_stream()
        .essence_str()
        .to_string();
    let password = args
        .password
        .as_deref()
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string);

    let api = ApiClient::new(&args.server)?;
    let id = Uuid::new_v4().simple().to_string();
    info!(
        id,
        filename,
        size,
        parts = plan.len(),
        protected = password.is_some(),
        "starting upload"
    );

    let mpu = api
        .create_upload(
            &id,
            &CreateFileRequest {
                filename,
                content_type: Some(content_type),
                password,
            },
        )
        .await?;

    let result = transfer(args, &api, &id, &mpu.upload_id, path, size, plan).await;
    let completed = match result {
        Ok(completed) => completed,
        Err(err) => {
            if args.on_failure == FailurePolicy::Delete {
                match api.delete_file(&id).await {
                    Ok(()) => info!(id, "remote upload removed after failure"),
                    Err(cleanup) => warn!(id, error = %cleanup, "remote cleanup failed"),
                }
            }
            return Err(err);
        }
    };

    info!(id, size = completed.size, "upload finished");
    Ok(UploadReceipt {
        url: api.download_url(&id),
        id,
        size: completed.size,
        etag: completed.etag,
    })
}

async fn transfer(
    args: &UploadArgs,
    api: &ApiClient,
    id: &str,
    upload_id: &str,
    path: PathBuf,
    size: u64,
    plan: Vec<PartPlan>,
) -> Result<CompletedUpload, ClientError> {
    let uploader = Arc::new(FilePartUploader {
        api: api.clone(),
        path,
        id: id.to_string(),
        upload_id: upload_id.to_string(),
    });
    let config = PoolConfig {
        concurrency: args.concurrency,
        retry: RetryPolicy {
            attempts: args.retries,
            delay: Duration::from_millis(args.retry_delay_ms),
        },
    };
    let progress = Arc::new(UploadProgress::new());
    let parts = upload_all(plan, uploader, config, progress.clone()).await?;
    let covered: u64 = parts
        .iter()
        .map(|part| part.byte_range.end - part.byte_range.start)
        .sum();
    if covered != size {
        return Err(ClientError::Task(format!(
            "uploaded parts cover {covered} of {size} bytes"
        )));
    }
    let snapshot = progress.snapshot();
    info!(id, parts = snapshot.parts, bytes = snapshot.bytes, "all parts uploaded");
    let parts = parts.iter().map(UploadedPart::from).collect();
    api.complete_upload(id, upload_id, parts).await
}
