//! 下载访问控制：受密码保护的文件要求 Basic 认证。

use axum::http::{HeaderMap, HeaderValue, header};
use axum_extra::headers::{Authorization, authorization::Basic};
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::config::{AUTH_REALM, DOWNLOAD_USERNAME};
use crate::error::ApiError;
use crate::metadata::FileMetadata;

/// 校验下载凭据；未设置密码的文件无需认证。
pub fn authorize(
    metadata: &FileMetadata,
    credentials: Option<&Authorization<Basic>>,
) -> Result<(), ApiError> {
    let Some(expected) = metadata.password.as_deref() else {
        return Ok(());
    };

    if let Some(credentials) = credentials {
        let username_ok = secret_eq(credentials.username(), DOWNLOAD_USERNAME);
        let password_ok = secret_eq(credentials.password(), expected);
        if username_ok & password_ok {
            return Ok(());
        }
    }

    debug!(
        id = metadata.id,
        provided = credentials.is_some(),
        "download credentials rejected"
    );
    Err(ApiError::Unauthorized(challenge_headers()))
}

/// 比较两段秘密文本，耗时与首个差异位置及输入长度无关。
fn secret_eq(provided: &str, expected: &str) -> bool {
    let provided = Sha256::digest(provided.as_bytes());
    let expected = Sha256::digest(expected.as_bytes());
    let diff = provided
        .iter()
        .zip(expected.iter())
        .fold(0u8, |acc, (a, b)| acc | (a ^ b));
    std::hint::black_box(diff) == 0
}

fn challenge_headers() -> HeaderMap {
    let mut headers = HeaderMap::new();
    if let Ok(value) = HeaderValue::from_str(&format!(
        r#"Basic realm="{AUTH_REALM}", charset="UTF-8""#
    )) {
        headers.insert(header::WWW_AUTHENTICATE, value);
    }
    headers
}
