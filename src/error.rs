//! 统一的 API 错误类型与 JSON 错误响应。

use axum::http::{HeaderMap, HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Json as JsonResponse, Response};
use tracing::debug;

use crate::metadata::MetadataError;
use crate::models::ErrorResponse;
use crate::storage::StorageError;

#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    Conflict(String),
    NotFound(String),
    SizeExceeded { size: u64, limit: u64 },
    TooManyRequests(u64),
    Unauthorized(HeaderMap),
    Internal(String),
}

fn error_response(status: StatusCode, headers: HeaderMap, message: &str) -> Response {
    let body = ErrorResponse {
        success: false,
        error: message.to_string(),
    };
    (status, headers, JsonResponse(body)).into_response()
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            ApiError::BadRequest(msg) => {
                error_response(StatusCode::BAD_REQUEST, HeaderMap::new(), &msg)
            }
            // 与上传协议保持一致：重复创建按客户端错误处理。
            ApiError::Conflict(msg) => {
                error_response(StatusCode::BAD_REQUEST, HeaderMap::new(), &msg)
            }
            ApiError::NotFound(msg) => error_response(StatusCode::NOT_FOUND, HeaderMap::new(), &msg),
            ApiError::SizeExceeded { size, limit } => {
                debug!(size, limit, "object rejected by size cap");
                error_response(StatusCode::BAD_REQUEST, HeaderMap::new(), "File too large")
            }
            ApiError::TooManyRequests(retry_after) => {
                let mut headers = HeaderMap::new();
                if retry_after > 0
                    && let Ok(value) = HeaderValue::from_str(&retry_after.to_string())
                {
                    headers.insert(header::RETRY_AFTER, value);
                }
                error_response(StatusCode::TOO_MANY_REQUESTS, headers, "Rate limit exceeded")
            }
            ApiError::Unauthorized(headers) => {
                error_response(StatusCode::UNAUTHORIZED, headers, "Unauthorized")
            }
            ApiError::Internal(msg) => {
                error_response(StatusCode::INTERNAL_SERVER_ERROR, HeaderMap::new(), &msg)
            }
        }
    }
}

impl From<StorageError> for ApiError {
    fn from(error: StorageError) -> Self {
        match error {
            StorageError::Io(err) => ApiError::Internal(err.to_string()),
            StorageError::Decode(err) => ApiError::Internal(err.to_string()),
            other => ApiError::BadRequest(other.to_string()),
        }
    }
}

impl From<MetadataError> for ApiError {
    fn from(error: MetadataError) -> Self {
        ApiError::Internal(error.to_string())
    }
}
