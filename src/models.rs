//! 客户端与服务端共享的请求/响应结构。

use serde::{Deserialize, Serialize};

/// 单个分片上传后的凭据，完成上传时按分片编号提交。
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct UploadedPart {
    pub part_number: u32,
    pub etag: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default)]
#[serde(rename_all = "camelCase")]
pub struct CreateFileRequest {
    pub filename: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct MultipartInfo {
    pub key: String,
    pub upload_id: String,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct CreateFileResponse {
    pub mpu: MultipartInfo,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct UploadPartResponse {
    pub success: bool,
    pub part: UploadedPart,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct CompleteUploadRequest {
    pub parts: Vec<UploadedPart>,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct CompleteUploadResponse {
    pub success: bool,
    pub size: u64,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct SuccessResponse {
    pub success: bool,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ErrorResponse {
    pub success: bool,
    pub error: String,
}
