//! 上传客户端：切分文件、并发上传分片并完成会话。

pub mod api;
pub mod planner;
pub mod pool;
pub mod retry;
pub mod upload;

use thiserror::Error;

use crate::client::planner::PlanError;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error(transparent)]
    Plan(#[from] PlanError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("server returned {status}: {message}")]
    Api { status: u16, message: String },
    #[error("invalid server url: {0}")]
    InvalidUrl(String),
    #[error("upload task failed: {0}")]
    Task(String),
}
