//! 按客户端 IP 的固定窗口限流，作用于创建/上传/完成接口。

use async_trait::async_trait;
use axum::body::Body as AxumBody;
use axum::extract::Extension;
use axum::http::Request;
use axum::middleware;
use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::warn;

use crate::error::ApiError;
use crate::http::{ClientIpPolicy, client_ip_from_request};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateDecision {
    Allowed,
    Limited { retry_after: u64 },
}

/// 配额校验能力。
#[async_trait]
pub trait RateLimiter: Send + Sync {
    async fn check(&self, identity: IpAddr) -> RateDecision;
}

#[derive(Debug)]
struct Window {
    started: Instant,
    count: u32,
}

#[derive(Debug)]
pub struct FixedWindowLimiter {
    max_requests: u32,
    window: Duration,
    windows: Mutex<HashMap<IpAddr, Window>>,
}

impl FixedWindowLimiter {
    /// `max_requests` 为 0 时不限流。
    pub fn new(max_requests: u32, window: Duration) -> Self {
        Self {
            max_requests,
            window,
            windows: Mutex::new(HashMap::new()),
        }
    }

    /// 清理已经结束的窗口。
    pub async fn prune(&self) {
        let mut windows = self.windows.lock().await;
        let now = Instant::now();
        windows.retain(|_, entry| now.duration_since(entry.started) <= self.window);
    }
}

#[async_trait]
impl RateLimiter for FixedWindowLimiter {
    async fn check(&self, identity: IpAddr) -> RateDecision {
        if self.max_requests == 0 {
            return RateDecision::Allowed;
        }

        let mut windows = self.windows.lock().await;
        let now = Instant::now();
        let entry = windows.entry(identity).or_insert(Window {
            started: now,
            count: 0,
        });

        if now.duration_since(entry.started) >= self.window {
            entry.started = now;
            entry.count = 0;
        }

        if entry.count >= self.max_requests {
            let reset_at = entry.started + self.window;
            let retry_after = reset_at.saturating_duration_since(now).as_secs().max(1);
            return RateDecision::Limited { retry_after };
        }

        entry.count += 1;
        RateDecision::Allowed
    }
}

/// 限流中间件：超出配额时直接返回 429，不触达元数据与存储。
pub async fn enforce_rate_limit(
    Extension(limiter): Extension<Arc<dyn RateLimiter>>,
    Extension(policy): Extension<ClientIpPolicy>,
    req: Request<AxumBody>,
    next: middleware::Next,
) -> Result<axum::response::Response, ApiError> {
    let identity =
        client_ip_from_request(&req, policy).unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED));
    match limiter.check(identity).await {
        RateDecision::Allowed => Ok(next.run(req).await),
        RateDecision::Limited { retry_after } => {
            warn!(client_ip = %identity, path = req.uri().path(), "rate limit exceeded");
            Err(ApiError::TooManyRequests(retry_after))
        }
    }
}
