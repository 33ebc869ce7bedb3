//! 分享接口处理器：创建上传、上传分片、完成、下载与删除。

use axum::body::Body as AxumBody;
use axum::extract::rejection::{JsonRejection, QueryRejection};
use axum::extract::{Extension, Json, Path, Query};
use axum::http::{HeaderMap, HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Json as JsonResponse, Response};
use axum_extra::headers::{Authorization, HeaderMapExt, authorization::Basic};
use futures_util::stream::StreamExt;
use httpdate::fmt_http_date;
use percent_encoding::{AsciiSet, NON_ALPHANUMERIC, utf8_percent_encode};
use serde::Deserialize;
use std::io;
use std::sync::Arc;
use std::time::SystemTime;
use tracing::{debug, info};

use crate::coordinator::UploadCoordinator;
use crate::error::ApiError;
use crate::etag::{if_none_match, quoted};
use crate::models::{
    CompleteUploadRequest, CompleteUploadResponse, CreateFileRequest, CreateFileResponse,
    MultipartInfo, SuccessResponse, UploadPartResponse,
};

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct PartQuery {
    upload_id: String,
    part_number: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct SessionQuery {
    upload_id: String,
}

fn header_value(value: &str) -> Result<HeaderValue, ApiError> {
    HeaderValue::from_str(value).map_err(|_| ApiError::Internal("failed to build header".into()))
}

/// RFC 5987 `attr-char` 之外的字节都需要百分号编码。
const FILENAME_ENCODE_SET: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'!')
    .remove(b'#')
    .remove(b'$')
    .remove(b'&')
    .remove(b'+')
    .remove(b'-')
    .remove(b'.')
    .remove(b'^')
    .remove(b'_')
    .remove(b'`')
    .remove(b'|')
    .remove(b'~');

/// 生成 `Content-Disposition`：`filename` 为 ASCII 回退名，`filename*` 保留原始 UTF-8 文件名。
fn content_disposition(filename: &str) -> String {
    let fallback: String = filename
        .chars()
        .map(|c| {
            if c == '"' || c == '\\' || c.is_control() || !c.is_ascii() {
                '_'
            } else {
                c
            }
        })
        .collect();
    let encoded = utf8_percent_encode(filename, FILENAME_ENCODE_SET);
    format!("attachment; filename=\"{fallback}\"; filename*=UTF-8''{encoded}")
}

/// 创建文件记录并开启分片上传会话。
pub async fn create_file(
    Path(id): Path<String>,
    Extension(coordinator): Extension<Arc<UploadCoordinator>>,
    payload: Result<Json<CreateFileRequest>, JsonRejection>,
) -> Result<JsonResponse<CreateFileResponse>, ApiError> {
    let Json(request) = payload.map_err(|err| ApiError::BadRequest(err.body_text()))?;
    let session = coordinator.create(&id, request).await?;
    debug!(id = session.id, status = ?session.status, "upload session opened");
    Ok(JsonResponse(CreateFileResponse {
        mpu: MultipartInfo {
            key: session.storage_key,
            upload_id: session.upload_id,
        },
    }))
}

/// 以流的方式接收一个分片。
pub async fn upload_part(
    Path(id): Path<String>,
    query: Result<Query<PartQuery>, QueryRejection>,
    Extension(coordinator): Extension<Arc<UploadCoordinator>>,
    body: AxumBody,
) -> Result<JsonResponse<UploadPartResponse>, ApiError> {
    let Query(query) = query.map_err(|err| ApiError::BadRequest(err.body_text()))?;
    let part_number = query
        .part_number
        .trim()
        .parse::<u32>()
        .map_err(|_| ApiError::BadRequest("partNumber must be a number".into()))?;
    let stream = body
        .into_data_stream()
        .map(|chunk| chunk.map_err(io::Error::other))
        .boxed();
    let part = coordinator
        .upload_part(&id, &query.upload_id, part_number, stream)
        .await?;
    debug!(id, part_number, "part accepted");
    Ok(JsonResponse(UploadPartResponse {
        success: true,
        part,
    }))
}

/// 按分片编号顺序合并分片，响应头携带对象 ETag。
pub async fn complete_upload(
    Path(id): Path<String>,
    query: Result<Query<SessionQuery>, QueryRejection>,
    Extension(coordinator): Extension<Arc<UploadCoordinator>>,
    payload: Result<Json<CompleteUploadRequest>, JsonRejection>,
) -> Result<Response, ApiError> {
    let Query(query) = query.map_err(|err| ApiError::BadRequest(err.body_text()))?;
    let Json(request) = payload.map_err(|err| ApiError::BadRequest(err.body_text()))?;
    let info = coordinator
        .complete(&id, &query.upload_id, request.parts)
        .await?;

    let mut headers = HeaderMap::new();
    headers.insert(header::ETAG, header_value(&quoted(&info.etag))?);
    Ok((
        StatusCode::OK,
        headers,
        JsonResponse(CompleteUploadResponse {
            success: true,
            size: info.size,
        }),
    )
        .into_response())
}

/// 取出 Basic 凭据；缺失或无法解析（如 Bearer）时视为未提供。
fn basic_credentials(headers: &HeaderMap) -> Option<Authorization<Basic>> {
    headers
        .typed_try_get::<Authorization<Basic>>()
        .ok()
        .flatten()
}

/// 下载文件；受保护文件需要 Basic 认证，支持 If-None-Match。
pub async fn download_file(
    Path(id): Path<String>,
    request_headers: HeaderMap,
    Extension(coordinator): Extension<Arc<UploadCoordinator>>,
) -> Result<Response, ApiError> {
    let credentials = basic_credentials(&request_headers);
    let (metadata, object) = coordinator.open(&id, credentials.as_ref()).await?;
    let etag = quoted(&object.info.etag);

    let mut response_headers = HeaderMap::new();
    response_headers.insert(header::ETAG, header_value(&etag)?);
    response_headers.insert(
        header::LAST_MODIFIED,
        header_value(&fmt_http_date(SystemTime::from(object.info.uploaded_at)))?,
    );

    if if_none_match(&request_headers, &object.info.etag) {
        debug!(id, "download not modified");
        return Ok((StatusCode::NOT_MODIFIED, response_headers).into_response());
    }

    response_headers.insert(header::CONTENT_TYPE, header_value(&metadata.content_type)?);
    response_headers.insert(
        header::CONTENT_DISPOSITION,
        header_value(&content_disposition(&metadata.filename))?,
    );
    response_headers.insert(
        header::CONTENT_LENGTH,
        header_value(&object.info.size.to_string())?,
    );
    info!(id, size = object.info.size, "download full file");
    Ok((
        StatusCode::OK,
        response_headers,
        AxumBody::from_stream(object.body),
    )
        .into_response())
}

/// 删除文件及其未完成的会话。
pub async fn delete_file(
    Path(id): Path<String>,
    Extension(coordinator): Extension<Arc<UploadCoordinator>>,
) -> Result<JsonResponse<SuccessResponse>, ApiError> {
    coordinator.delete(&id).await?;
    Ok(JsonResponse(SuccessResponse { success: true }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordinator::CoordinatorConfig;
    use crate::metadata::FsMetadataStore;
    use crate::models::UploadedPart;
    use crate::storage::LocalStorage;
    use http_body_util::BodyExt;
    use std::time::Duration;
    use tempfile::tempdir;

    async fn coordinator(temp: &tempfile::TempDir) -> Arc<UploadCoordinator> {
        let storage = Arc::new(LocalStorage::new(temp.path().join("storage")));
        storage.ensure_root().await.expect("storage root");
        let metadata = Arc::new(FsMetadataStore::new(temp.path().join("meta")));
        metadata.ensure_root().await.expect("meta root");
        Arc::new(UploadCoordinator::new(
            storage,
            metadata,
            CoordinatorConfig {
                max_object_size: 0,
                metadata_ttl: Duration::from_secs(3600),
            },
        ))
    }

    async fn create(coordinator: &Arc<UploadCoordinator>, id: &str, password: Option<&str>) -> String {
        let JsonResponse(response) = create_file(
            Path(id.to_string()),
            Extension(coordinator.clone()),
            Ok(Json(CreateFileRequest {
                filename: "report \"final\".pdf".into(),
                content_type: None,
                password: password.map(str::to_string),
            })),
        )
        .await
        .expect("create");
        assert_eq!(response.mpu.key, id);
        response.mpu.upload_id
    }

    async fn put_part(
        coordinator: &Arc<UploadCoordinator>,
        id: &str,
        upload_id: &str,
        part_number: &str,
        data: &'static [u8],
    ) -> Result<UploadedPart, ApiError> {
        let JsonResponse(response) = upload_part(
            Path(id.to_string()),
            Ok(Query(PartQuery {
                upload_id: upload_id.to_string(),
                part_number: part_number.to_string(),
            })),
            Extension(coordinator.clone()),
            AxumBody::from(data),
        )
        .await?;
        assert!(response.success);
        Ok(response.part)
    }

    #[tokio::test]
    async fn upload_and_download_through_handlers() {
        let temp = tempdir().expect("tempdir");
        let coordinator = coordinator(&temp).await;
        let upload_id = create(&coordinator, "doc", None).await;

        let second = put_part(&coordinator, "doc", &upload_id, "2", b"world")
            .await
            .expect("part 2");
        let first = put_part(&coordinator, "doc", &upload_id, "1", b"hello ")
            .await
            .expect("part 1");

        let response = complete_upload(
            Path("doc".to_string()),
            Ok(Query(SessionQuery {
                upload_id: upload_id.clone(),
            })),
            Extension(coordinator.clone()),
            Ok(Json(CompleteUploadRequest {
                parts: vec![second, first],
            })),
        )
        .await
        .expect("complete");
        assert_eq!(response.status(), StatusCode::OK);
        let etag = response
            .headers()
            .get(header::ETAG)
            .cloned()
            .expect("etag header");
        assert!(etag.to_str().expect("ascii").ends_with("-2\""));

        let response = download_file(
            Path("doc".to_string()),
            HeaderMap::new(),
            Extension(coordinator.clone()),
        )
        .await
        .expect("download");
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers().get(header::CONTENT_TYPE),
            Some(&HeaderValue::from_static("application/pdf"))
        );
        assert_eq!(
            response.headers().get(header::CONTENT_DISPOSITION),
            Some(&HeaderValue::from_static(
                "attachment; filename=\"report _final_.pdf\"; filename*=UTF-8''report%20%22final%22.pdf"
            ))
        );
        let body = response
            .into_body()
            .collect()
            .await
            .expect("collect")
            .to_bytes();
        assert_eq!(&body[..], b"hello world");

        let mut conditional = HeaderMap::new();
        conditional.insert(header::IF_NONE_MATCH, etag);
        let response = download_file(
            Path("doc".to_string()),
            conditional,
            Extension(coordinator.clone()),
        )
        .await
        .expect("conditional download");
        assert_eq!(response.status(), StatusCode::NOT_MODIFIED);
    }

    #[tokio::test]
    async fn non_numeric_part_number_is_rejected() {
        let temp = tempdir().expect("tempdir");
        let coordinator = coordinator(&temp).await;
        let upload_id = create(&coordinator, "doc", None).await;
        let result = put_part(&coordinator, "doc", &upload_id, "one", b"data").await;
        let Err(ApiError::BadRequest(message)) = result else {
            panic!("expected bad request");
        };
        assert_eq!(message, "partNumber must be a number");
    }

    #[tokio::test]
    async fn protected_download_requires_credentials() {
        let temp = tempdir().expect("tempdir");
        let coordinator = coordinator(&temp).await;
        let upload_id = create(&coordinator, "secret", Some("pw")).await;
        let part = put_part(&coordinator, "secret", &upload_id, "1", b"classified")
            .await
            .expect("part");
        coordinator
            .complete("secret", &upload_id, vec![part])
            .await
            .expect("complete");

        let denied = download_file(
            Path("secret".to_string()),
            HeaderMap::new(),
            Extension(coordinator.clone()),
        )
        .await;
        assert!(matches!(denied, Err(ApiError::Unauthorized(_))));

        let mut credentials = HeaderMap::new();
        credentials.typed_insert(Authorization::basic("user", "pw"));
        let allowed = download_file(
            Path("secret".to_string()),
            credentials,
            Extension(coordinator.clone()),
        )
        .await
        .expect("download");
        assert_eq!(allowed.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn non_basic_authorization_counts_as_missing() {
        let temp = tempdir().expect("tempdir");
        let coordinator = coordinator(&temp).await;
        for (id, password) in [("open", None), ("secret", Some("pw"))] {
            let upload_id = create(&coordinator, id, password).await;
            let part = put_part(&coordinator, id, &upload_id, "1", b"payload")
                .await
                .expect("part");
            coordinator
                .complete(id, &upload_id, vec![part])
                .await
                .expect("complete");
        }

        let bearer = || {
            let mut headers = HeaderMap::new();
            headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Bearer abc"));
            headers
        };

        let open = download_file(
            Path("open".to_string()),
            bearer(),
            Extension(coordinator.clone()),
        )
        .await
        .expect("open download");
        assert_eq!(open.status(), StatusCode::OK);

        let locked = download_file(
            Path("secret".to_string()),
            bearer(),
            Extension(coordinator.clone()),
        )
        .await;
        let Err(err) = locked else {
            panic!("expected unauthorized");
        };
        let response = err.into_response();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert!(response.headers().contains_key(header::WWW_AUTHENTICATE));
    }

    #[tokio::test]
    async fn delete_reports_success_for_unknown_id() {
        let temp = tempdir().expect("tempdir");
        let coordinator = coordinator(&temp).await;
        let JsonResponse(response) =
            delete_file(Path("missing".to_string()), Extension(coordinator))
                .await
                .expect("delete");
        assert!(response.success);
    }

    #[test]
    fn disposition_escapes_unsafe_characters() {
        assert_eq!(
            content_disposition("a\"b\\c\nd.txt"),
            "attachment; filename=\"a_b_c_d.txt\"; filename*=UTF-8''a%22b%5Cc%0Ad.txt"
        );
    }

    #[test]
    fn disposition_keeps_utf8_filename() {
        let value = content_disposition("名字 报告.txt");
        assert_eq!(
            value,
            "attachment; filename=\"__ __.txt\"; filename*=UTF-8''%E5%90%8D%E5%AD%97%20%E6%8A%A5%E5%91%8A.txt"
        );
        let encoded = value
            .split("filename*=UTF-8''")
            .nth(1)
            .expect("extended filename");
        let decoded = percent_encoding::percent_decode_str(encoded)
            .decode_utf8()
            .expect("utf8");
        assert_eq!(decoded, "名字 报告.txt");
        assert!(HeaderValue::from_str(&value).is_ok());
    }
}
