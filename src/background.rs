//! 后台任务：过期文件清理、陈旧会话中止与内存表修剪。

use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::config::{
    METADATA_PRUNE_INTERVAL_SECS, RATE_LIMIT_PRUNE_INTERVAL_SECS, SESSION_CLEAN_INTERVAL_SECS,
};
use crate::coordinator::UploadCoordinator;
use crate::rate_limit::FixedWindowLimiter;

/// 启动后台任务；`session_ttl` 为 0 时不中止陈旧会话。
pub fn spawn_background_tasks(
    coordinator: Arc<UploadCoordinator>,
    limiter: Arc<FixedWindowLimiter>,
    session_ttl: Duration,
) {
    let sweeper = coordinator.clone();
    tokio::spawn(async move {
        let mut interval =
            tokio::time::interval(Duration::from_secs(METADATA_PRUNE_INTERVAL_SECS));
        loop {
            interval.tick().await;
            match sweeper.sweep_expired().await {
                Ok(0) => {}
                Ok(removed) => debug!(removed, "expired files swept"),
                Err(err) => warn!(error = ?err, "expired file sweep failed"),
            }
        }
    });

    if !session_ttl.is_zero() {
        let cleaner = coordinator.clone();
        tokio::spawn(async move {
            let mut interval =
                tokio::time::interval(Duration::from_secs(SESSION_CLEAN_INTERVAL_SECS));
            loop {
                interval.tick().await;
                if let Err(err) = cleaner.abort_stale_sessions(session_ttl).await {
                    warn!(error = ?err, "stale session cleanup failed");
                }
            }
        });
    }

    tokio::spawn(async move {
        let mut interval =
            tokio::time::interval(Duration::from_secs(RATE_LIMIT_PRUNE_INTERVAL_SECS));
        loop {
            interval.tick().await;
            limiter.prune().await;
            coordinator.prune_locks().await;
        }
    });
}
