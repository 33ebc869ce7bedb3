//! ETag 计算与条件请求校验。

use axum::http::{HeaderMap, header};
use sha2::{Digest, Sha256};

/// 增量计算分片内容的 ETag（SHA-256 十六进制）。
#[derive(Default)]
pub struct PartHasher {
    inner: Sha256,
}

impl PartHasher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, chunk: &[u8]) {
        self.inner.update(chunk);
    }

    pub fn finish(self) -> String {
        hex::encode(self.inner.finalize())
    }
}

/// 由各分片 ETag 派生合并对象的 ETag，形如 `<digest>-<分片数>`。
pub fn multipart_etag<'a>(part_etags: impl IntoIterator<Item = &'a str>) -> String {
    let mut hasher = Sha256::new();
    let mut count = 0usize;
    for etag in part_etags {
        hasher.update(etag.as_bytes());
        count += 1;
    }
    format!("{}-{}", hex::encode(hasher.finalize()), count)
}

/// 生成响应头使用的强 ETag。
pub fn quoted(etag: &str) -> String {
    format!("\"{etag}\"")
}

/// 判断 If-None-Match 是否命中当前 ETag。
pub fn if_none_match(headers: &HeaderMap, current_etag: &str) -> bool {
    let Some(value) = headers
        .get(header::IF_NONE_MATCH)
        .and_then(|v| v.to_str().ok())
    else {
        return false;
    };
    value
        .split(',')
        .map(|item| item.trim())
        .map(|item| item.trim_start_matches("W/").trim_matches('"'))
        .any(|item| item == "*" || item == current_etag)
}
