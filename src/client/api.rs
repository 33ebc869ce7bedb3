//! 分享服务的 HTTP 接口封装。

use bytes::Bytes;
use reqwest::{Response, Url};
use serde::de::DeserializeOwned;

use crate::client::ClientError;
use crate::models::{
    CompleteUploadRequest, CompleteUploadResponse, CreateFileRequest, CreateFileResponse,
    ErrorResponse, MultipartInfo, SuccessResponse, UploadPartResponse, UploadedPart,
};

/// 完成上传后服务端返回的对象信息。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletedUpload {
    pub size: u64,
    pub etag: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ApiClient {
    http: reqwest::Client,
    base_url: String,
}

impl ApiClient {
    pub fn new(base_url: &str) -> Result<Self, ClientError> {
        let base_url = base_url.trim().trim_end_matches('/').to_string();
        let parsed =
            Url::parse(&base_url).map_err(|err| ClientError::InvalidUrl(err.to_string()))?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(ClientError::InvalidUrl(format!(
                "unsupported scheme {}",
                parsed.scheme()
            )));
        }
        Ok(Self {
            http: reqwest::Client::new(),
            base_url,
        })
    }

    pub fn download_url(&self, id: &str) -> String {
        format!("{}/{id}", self.base_url)
    }

    pub async fn create_upload(
        &self,
        id: &str,
        request: &CreateFileRequest,
    ) -> Result<MultipartInfo, ClientError> {
        let response = self
            .http
            .post(format!("{}/{id}/create", self.base_url))
            .json(request)
            .send()
            .await?;
        let body: CreateFileResponse = parse_json(response).await?;
        Ok(body.mpu)
    }

    pub async fn upload_part(
        &self,
        id: &str,
        upload_id: &str,
        part_number: u32,
        body: Bytes,
    ) -> Result<UploadedPart, ClientError> {
        let part_number = part_number.to_string();
        let response = self
            .http
            .put(format!("{}/{id}/upload", self.base_url))
            .query(&[("uploadId", upload_id), ("partNumber", part_number.as_str())])
            .body(body)
            .send()
            .await?;
        let body: UploadPartResponse = parse_json(response).await?;
        Ok(body.part)
    }

    pub async fn complete_upload(
        &self,
        id: &str,
        upload_id: &str,
        parts: Vec<UploadedPart>,
    ) -> Result<CompletedUpload, ClientError> {
        let response = self
            .http
            .post(format!("{}/{id}/complete", self.base_url))
            .query(&[("uploadId", upload_id)])
            .json(&CompleteUploadRequest { parts })
            .send()
            .await?;
        let etag = response
            .headers()
            .get(reqwest::header::ETAG)
            .and_then(|value| value.to_str().ok())
            .map(|value| value.trim_matches('"').to_string());
        let body: CompleteUploadResponse = parse_json(response).await?;
        Ok(CompletedUpload {
            size: body.size,
            etag,
        })
    }

    pub async fn delete_file(&self, id: &str) -> Result<(), ClientError> {
        let response = self
            .http
            .delete(format!("{}/{id}", self.base_url))
            .send()
            .await?;
        let _: SuccessResponse = parse_json(response).await?;
        Ok(())
    }
}

/// 成功时解析 JSON，失败时取出 `{success:false,error}` 中的错误信息。
async fn parse_json<T: DeserializeOwned>(response: Response) -> Result<T, ClientError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response.json().await?);
    }
    let text = response.text().await.unwrap_or_default();
    let message = serde_json::from_str::<ErrorResponse>(&text)
        .map(|body| body.error)
        .unwrap_or(text);
    Err(ClientError::Api {
        status: status.as_u16(),
        message,
    })
}
