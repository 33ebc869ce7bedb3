//! 有界并发的分片上传池。

use async_trait::async_trait;
use std::ops::Range;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::client::ClientError;
use crate::client::planner::PartPlan;
use crate::client::retry::{RetryPolicy, retry};
use crate::models::UploadedPart;

/// 上传单个分片的能力，由 HTTP 客户端或测试替身实现。
#[async_trait]
pub trait PartUploader: Send + Sync + 'static {
    async fn upload_part(&self, part: PartPlan) -> Result<UploadedPart, ClientError>;
}

#[derive(Debug, Clone, Copy)]
pub struct PoolConfig {
    pub concurrency: usize,
    pub retry: RetryPolicy,
}

/// 已完成的分片数与字节数，每个分片成功后恰好累加一次。
#[derive(Debug, Default)]
pub struct UploadProgress {
    parts: AtomicU64,
    bytes: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProgressSnapshot {
    pub parts: u64,
    pub bytes: u64,
}

impl UploadProgress {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, bytes: u64) -> ProgressSnapshot {
        ProgressSnapshot {
            parts: self.parts.fetch_add(1, Ordering::SeqCst) + 1,
            bytes: self.bytes.fetch_add(bytes, Ordering::SeqCst) + bytes,
        }
    }

    pub fn snapshot(&self) -> ProgressSnapshot {
        ProgressSnapshot {
            parts: self.parts.load(Ordering::SeqCst),
            bytes: self.bytes.load(Ordering::SeqCst),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartDescriptor {
    pub part_number: u32,
    pub byte_range: Range<u64>,
    pub etag: String,
}

impl From<&PartDescriptor> for UploadedPart {
    fn from(part: &PartDescriptor) -> Self {
        UploadedPart {
            part_number: part.part_number,
            etag: part.etag.clone(),
        }
    }
}

/// 以最多 `concurrency` 个并发上传全部分片；任一分片重试耗尽即停止调度并返回错误。
pub async fn upload_all<U: PartUploader>(
    plan: Vec<PartPlan>,
    uploader: Arc<U>,
    config: PoolConfig,
    progress: Arc<UploadProgress>,
) -> Result<Vec<PartDescriptor>, ClientError> {
    let total = plan.len();
    let semaphore = Arc::new(Semaphore::new(config.concurrency.max(1)));
    let failed = Arc::new(AtomicBool::new(false));
    let mut tasks: JoinSet<Result<PartDescriptor, ClientError>> = JoinSet::new();
    let mut completed = Vec::with_capacity(total);
    let mut first_error: Option<ClientError> = None;

    for part in plan {
        // 等待空闲名额时顺便收集已结束的任务，尽早发现失败。
        let permit = loop {
            tokio::select! {
                permit = semaphore.clone().acquire_owned() => {
                    break permit.map_err(|err| ClientError::Task(err.to_string()))?;
                }
                Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                    collect(joined, &mut completed, &mut first_error, &failed);
                }
            }
        };
        if failed.load(Ordering::SeqCst) {
            break;
        }

        let uploader = uploader.clone();
        let progress = progress.clone();
        let failed = failed.clone();
        let policy = config.retry;
        tasks.spawn(async move {
            let _permit = permit;
            let result = retry(policy, |attempt| {
                let uploader = uploader.clone();
                async move {
                    debug!(part_number = part.part_number, attempt, "uploading part");
                    uploader.upload_part(part).await
                }
            })
            .await;
            match result {
                Ok(uploaded) => {
                    let snapshot = progress.record(part.length);
                    info!(
                        part_number = part.part_number,
                        done = snapshot.parts,
                        total,
                        bytes = snapshot.bytes,
                        "part uploaded"
                    );
                    Ok(PartDescriptor {
                        part_number: part.part_number,
                        byte_range: part.byte_range(),
                        etag: uploaded.etag,
                    })
                }
                Err(err) => {
                    failed.store(true, Ordering::SeqCst);
                    warn!(part_number = part.part_number, error = %err, "part failed");
                    Err(err)
                }
            }
        });
    }

    while let Some(joined) = tasks.join_next().await {
        collect(joined, &mut completed, &mut first_error, &failed);
        if first_error.is_some() {
            tasks.abort_all();
        }
    }

    if let Some(err) = first_error {
        return Err(err);
    }
    completed.sort_by_key(|part| part.part_number);
    Ok(completed)
}

fn collect(
    joined: Result<Result<PartDescriptor, ClientError>, tokio::task::JoinError>,
    completed: &mut Vec<PartDescriptor>,
    first_error: &mut Option<ClientError>,
    failed: &AtomicBool,
) {
    let outcome = match joined {
        Ok(outcome) => outcome,
        // 主动中止的任务不算新的错误。
        Err(err) if err.is_cancelled() => return,
        Err(err) => Err(ClientError::Task(err.to_string())),
    };
    match outcome {
        Ok(part) => completed.push(part),
        Err(err) => {
            failed.store(true, Ordering::SeqCst);
            if first_error.is_none() {
                *first_error = Some(err);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::planner::plan_parts;
    use std::collections::HashMap;
    use std::sync::Mutex;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    /// 记录并发度的测试替身；`failures` 指定每个分片先失败的次数。
    #[derive(Default)]
    struct FakeUploader {
        in_flight: AtomicUsize,
        max_in_flight: AtomicUsize,
        calls: AtomicUsize,
        failures: Mutex<HashMap<u32, u32>>,
    }

    impl FakeUploader {
        fn failing(failures: &[(u32, u32)]) -> Self {
            Self {
                failures: Mutex::new(failures.iter().copied().collect()),
                ..Self::default()
            }
        }
    }

    #[async_trait]
    impl PartUploader for FakeUploader {
        async fn upload_part(&self, part: PartPlan) -> Result<UploadedPart, ClientError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(5)).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);

            let should_fail = {
                let mut failures = self.failures.lock().expect("failures lock");
                match failures.get_mut(&part.part_number) {
                    Some(remaining) if *remaining > 0 => {
                        *remaining -= 1;
                        true
                    }
                    _ => false,
                }
            };
            if should_fail {
                return Err(ClientError::Api {
                    status: 500,
                    message: format!("part {} failed", part.part_number),
                });
            }
            Ok(UploadedPart {
                part_number: part.part_number,
                etag: format!("etag-{}", part.part_number),
            })
        }
    }

    fn config(concurrency: usize, attempts: u32) -> PoolConfig {
        PoolConfig {
            concurrency,
            retry: RetryPolicy {
                attempts,
                delay: Duration::ZERO,
            },
        }
    }

    #[tokio::test]
    async fn respects_concurrency_limit() {
        let uploader = Arc::new(FakeUploader::default());
        let progress = Arc::new(UploadProgress::new());
        let plan = plan_parts(100, 10).expect("plan");
        let parts = upload_all(plan, uploader.clone(), config(3, 1), progress.clone())
            .await
            .expect("upload");

        assert!(uploader.max_in_flight.load(Ordering::SeqCst) <= 3);
        assert_eq!(
            parts.iter().map(|part| part.part_number).collect::<Vec<_>>(),
            (1..=10).collect::<Vec<_>>()
        );
        assert_eq!(parts[9].byte_range, 90..100);
        assert_eq!(parts[0].etag, "etag-1");
        assert_eq!(
            progress.snapshot(),
            ProgressSnapshot {
                parts: 10,
                bytes: 100
            }
        );
    }

    #[tokio::test]
    async fn transient_failures_are_retried() {
        let uploader = Arc::new(FakeUploader::failing(&[(2, 2), (4, 1)]));
        let progress = Arc::new(UploadProgress::new());
        let plan = plan_parts(50, 10).expect("plan");
        let parts = upload_all(plan, uploader.clone(), config(5, 3), progress.clone())
            .await
            .expect("upload");
        assert_eq!(parts.len(), 5);
        assert_eq!(uploader.calls.load(Ordering::SeqCst), 8);
        // 重试的分片也只计一次进度。
        assert_eq!(progress.snapshot().parts, 5);
    }

    #[tokio::test]
    async fn exhausted_retries_fail_the_upload() {
        let uploader = Arc::new(FakeUploader::failing(&[(3, 3)]));
        let progress = Arc::new(UploadProgress::new());
        let plan = plan_parts(50, 10).expect("plan");
        let result = upload_all(plan, uploader, config(5, 3), progress).await;
        assert!(matches!(result, Err(ClientError::Api { status: 500, .. })));
    }

    #[tokio::test]
    async fn failure_stops_scheduling_remaining_parts() {
        let uploader = Arc::new(FakeUploader::failing(&[(1, 3)]));
        let progress = Arc::new(UploadProgress::new());
        let plan = plan_parts(50, 10).expect("plan");
        let result = upload_all(plan, uploader.clone(), config(1, 3), progress.clone()).await;
        assert!(result.is_err());
        assert_eq!(uploader.calls.load(Ordering::SeqCst), 3);
        assert_eq!(progress.snapshot().parts, 0);
    }
}
