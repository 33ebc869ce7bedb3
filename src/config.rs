//! 命令行参数与服务端/客户端默认配置。

use clap::{Args, Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

pub const DEFAULT_PART_SIZE: u64 = 128 * 1024 * 1024;
pub const DEFAULT_MAX_OBJECT_SIZE: u64 = 128 * 1024 * 1024 * 1024;
pub const DEFAULT_METADATA_TTL_SECS: u64 = 7 * 24 * 60 * 60;
pub const DEFAULT_SESSION_TTL_SECS: u64 = 24 * 60 * 60;
pub const DEFAULT_UPLOAD_CONCURRENCY: usize = 20;
pub const DEFAULT_RETRY_ATTEMPTS: u32 = 3;
pub const DEFAULT_RATE_LIMIT_REQUESTS: u32 = 600;
pub const DEFAULT_RATE_LIMIT_WINDOW_SECS: u64 = 60;
pub const DEFAULT_SERVER_URL: &str = "http://127.0.0.1:5005";
pub const DEFAULT_LOCK_WAIT_TIMEOUT_SECS: u64 = 30;
/// 单个会话允许的最大分片编号（与 S3/R2 的限制一致）。
pub const MAX_PART_NUMBER: u32 = 10_000;
pub const MAX_ID_LEN: usize = 128;
/// 受密码保护文件的 Basic 认证用户名固定为 `user`。
pub const DOWNLOAD_USERNAME: &str = "user";
pub const AUTH_REALM: &str = "AxoShare";
pub const METADATA_PRUNE_INTERVAL_SECS: u64 = 300;
pub const SESSION_CLEAN_INTERVAL_SECS: u64 = 900;
pub const RATE_LIMIT_PRUNE_INTERVAL_SECS: u64 = 300;

/// AxoShare 命令行入口。
#[derive(Parser, Debug)]
#[command(
    name = "axo-share",
    version,
    about = "AxoShare multipart file sharing",
    after_help = "Basic auth can be added for files. The user name is always `user`."
)]
pub struct Cli {
    #[arg(short = 'd', long, global = true, help = "Output extra debugging information")]
    pub debug: bool,
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the AxoShare server
    Serve(ServeArgs),
    /// Upload a file and print its share URL
    Upload(UploadArgs),
}

/// 服务端参数，均可通过环境变量覆盖。
#[derive(Args, Debug, Clone)]
pub struct ServeArgs {
    #[arg(
        short = 's',
        long,
        env = "AXO_DATA_DIR",
        default_value = ".axo/share",
        help = "Data directory for objects, sessions and metadata"
    )]
    pub data_dir: PathBuf,
    #[arg(
        short = 'b',
        long,
        env = "AXO_BIND",
        default_value = "0.0.0.0",
        help = "Bind address"
    )]
    pub host: String,
    #[arg(
        short = 'p',
        long,
        env = "AXO_PORT",
        default_value_t = 5005,
        help = "Listen port"
    )]
    pub port: u16,
    #[arg(short = 'c', long, env = "AXO_TLS_CERT", requires = "tls_key", help = "TLS cert path")]
    pub tls_cert: Option<PathBuf>,
    #[arg(short = 'k', long, env = "AXO_TLS_KEY", requires = "tls_cert", help = "TLS key path")]
    pub tls_key: Option<PathBuf>,
    #[arg(long, env = "AXO_CORS_ORIGINS", help = "Comma separated CORS origins")]
    pub cors_origins: Option<String>,
    #[arg(
        long,
        env = "AXO_TRUST_FORWARDED_FOR",
        help = "Use x-forwarded-for as the client address (only behind a trusted proxy)"
    )]
    pub trust_forwarded_for: bool,
    #[arg(
        long,
        env = "AXO_MAX_OBJECT_SIZE",
        default_value_t = DEFAULT_MAX_OBJECT_SIZE,
        help = "Max assembled object size in bytes (0 to disable)"
    )]
    pub max_object_size: u64,
    #[arg(
        long,
        env = "AXO_METADATA_TTL_SECS",
        default_value_t = DEFAULT_METADATA_TTL_SECS,
        help = "Lifetime of a shared file in seconds"
    )]
    pub metadata_ttl_secs: u64,
    #[arg(
        long,
        env = "AXO_SESSION_TTL_SECS",
        default_value_t = DEFAULT_SESSION_TTL_SECS,
        help = "Abort unfinished upload sessions older than this (0 to disable)"
    )]
    pub session_ttl_secs: u64,
    #[arg(
        long,
        env = "AXO_RATE_LIMIT_REQUESTS",
        default_value_t = DEFAULT_RATE_LIMIT_REQUESTS,
        help = "Max create/upload/complete requests per client per window (0 to disable)"
    )]
    pub rate_limit_requests: u32,
    #[arg(
        long,
        env = "AXO_RATE_LIMIT_WINDOW_SECS",
        default_value_t = DEFAULT_RATE_LIMIT_WINDOW_SECS,
        help = "Rate limit window in seconds"
    )]
    pub rate_limit_window_secs: u64,
}

/// 上传失败后对远端会话的处理方式。
#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum FailurePolicy {
    /// Leave the remote session for the server-side sweep
    Abandon,
    /// Delete the file id (metadata and pending sessions) on the server
    Delete,
}

/// 客户端上传参数。
#[derive(Args, Debug, Clone)]
pub struct UploadArgs {
    #[arg(help = "Path to the file to upload")]
    pub path: PathBuf,
    #[arg(short = 'p', long, help = "Password to protect the file")]
    pub password: Option<String>,
    #[arg(
        long,
        env = "AXO_SERVER",
        default_value = DEFAULT_SERVER_URL,
        help = "AxoShare server base URL"
    )]
    pub server: String,
    #[arg(
        long,
        env = "AXO_PART_SIZE",
        default_value_t = DEFAULT_PART_SIZE,
        help = "Part size in bytes"
    )]
    pub part_size: u64,
    #[arg(
        long,
        env = "AXO_UPLOAD_CONCURRENCY",
        default_value_t = DEFAULT_UPLOAD_CONCURRENCY,
        help = "Parts uploaded in parallel"
    )]
    pub concurrency: usize,
    #[arg(
        long,
        env = "AXO_UPLOAD_RETRIES",
        default_value_t = DEFAULT_RETRY_ATTEMPTS,
        help = "Attempts per part before giving up"
    )]
    pub retries: u32,
    #[arg(
        long,
        env = "AXO_RETRY_DELAY_MS",
        default_value_t = 0,
        help = "Delay between attempts of a part in milliseconds"
    )]
    pub retry_delay_ms: u64,
    #[arg(
        long,
        value_enum,
        default_value_t = FailurePolicy::Abandon,
        help = "What to do with the remote session when the upload fails"
    )]
    pub on_failure: FailurePolicy,
}
