use crate::pfcommon::error::{AppError, Result};
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

/// 目前唯一定义的任务类型
pub const KIND_PERSIST_PRICE: &str = "persistPrice";

/// 默认重试次数
const DEFAULT_MAX_ATTEMPTS: u32 = 3;
/// 指数退避基数（毫秒）
const DEFAULT_BACKOFF_BASE_MS: u64 = 2000;
/// 失败记录保留条数
const FAILED_KEEP_LAST: isize = 100;
/// 队列空闲时的轮询间隔
const POLL_INTERVAL: Duration = Duration::from_millis(200);
/// 停机时排空队列的期限
const DRAIN_DEADLINE: Duration = Duration::from_secs(5);

/// 队列中的任务
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    pub kind: String,
    pub payload: Value,
    /// 当前是第几次尝试，从1开始
    pub attempt: u32,
    pub max_attempts: u32,
    pub backoff_base_ms: u64,
    pub enqueued_at: i64,
}

impl Job {
    /// 本次失败后的重试延迟: base * 2^(attempt-1)
    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.backoff_base_ms * 2u64.pow(self.attempt.saturating_sub(1)))
    }
}

/// 队列统计，健康检查用
#[derive(Debug, Clone, Serialize)]
pub struct QueueStats {
    pub waiting: i64,
    pub failed: i64,
    pub processed: u64,
}

/// 任务处理接口，按kind分发
pub trait JobHandler: Send + Sync {
    fn handle(&self, job: &Job) -> Result<()>;
}

/// 持久化任务队列
///
/// 任务以JSON形式存放在代理的列表上，进程重启不丢失。
/// 入队走内部通道，热路径上绝不挂起
pub struct JobQueue {
    name: String,
    redis_url: String,
    enqueue_tx: mpsc::UnboundedSender<Job>,
    processed: Arc<AtomicU64>,
}

impl JobQueue {
    /// 创建队列并启动入队泵任务
    pub fn new(redis_url: String, name: String) -> Arc<Self> {
        let (enqueue_tx, enqueue_rx) = mpsc::unbounded_channel();

        let queue = Arc::new(Self {
            name: name.clone(),
            redis_url: redis_url.clone(),
            enqueue_tx,
            processed: Arc::new(AtomicU64::new(0)),
        });

        tokio::spawn(run_enqueue_pump(redis_url, wait_key(&name), enqueue_rx));

        queue
    }

    /// 入队一个新任务（非阻塞）
    pub fn enqueue(&self, kind: &str, payload: Value) {
        let job = Job {
            id: uuid::Uuid::new_v4().to_string(),
            kind: kind.to_string(),
            payload,
            attempt: 1,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            backoff_base_ms: DEFAULT_BACKOFF_BASE_MS,
            enqueued_at: chrono::Utc::now().timestamp_millis(),
        };

        if self.enqueue_tx.send(job).is_err() {
            warn!(target: "queue", "入队泵已退出，任务被丢弃");
        }
    }

    /// 读取队列统计
    pub async fn stats(&self) -> QueueStats {
        let mut waiting = -1;
        let mut failed = -1;

        if let Ok(client) = redis::Client::open(self.redis_url.as_str()) {
            if let Ok(mut conn) = client.get_multiplexed_async_connection().await {
                waiting = conn.llen(wait_key(&self.name)).await.unwrap_or(-1);
                failed = conn.llen(failed_key(&self.name)).await.unwrap_or(-1);
            }
        }

        QueueStats {
            waiting,
            failed,
            processed: self.processed.load(Ordering::Relaxed),
        }
    }

    /// 启动消费任务
    ///
    /// shutdown信号到来后继续排空等待列表，直到列表为空或超过期限
    pub fn spawn_worker(
        self: &Arc<Self>,
        handler: Arc<dyn JobHandler>,
        mut shutdown: watch::Receiver<bool>,
    ) -> tokio::task::JoinHandle<()> {
        let redis_url = self.redis_url.clone();
        let name = self.name.clone();
        let processed = self.processed.clone();

        tokio::spawn(async move {
            let client = match redis::Client::open(redis_url.as_str()) {
                Ok(c) => c,
                Err(e) => {
                    error!(target: "queue", "Redis地址无效: {}", e);
                    return;
                }
            };

            info!(target: "queue", queue = %name, "持久化工作进程已启动");
            let mut drain_deadline: Option<tokio::time::Instant> = None;

            loop {
                if *shutdown.borrow() && drain_deadline.is_none() {
                    info!(target: "queue", queue = %name, "收到停机信号，开始排空队列");
                    drain_deadline = Some(tokio::time::Instant::now() + DRAIN_DEADLINE);
                }

                if let Some(deadline) = drain_deadline {
                    if tokio::time::Instant::now() >= deadline {
                        warn!(target: "queue", queue = %name, "排空超时，工作进程退出");
                        return;
                    }
                }

                let mut conn = match client.get_multiplexed_async_connection().await {
                    Ok(conn) => conn,
                    Err(e) => {
                        warn!(target: "queue", "队列连接失败: {}", e);
                        if drain_deadline.is_some() {
                            return;
                        }
                        tokio::select! {
                            _ = sleep(Duration::from_secs(1)) => {}
                            _ = shutdown.changed() => {}
                        }
                        continue;
                    }
                };

                loop {
                    if *shutdown.borrow() && drain_deadline.is_none() {
                        info!(target: "queue", queue = %name, "收到停机信号，开始排空队列");
                        drain_deadline = Some(tokio::time::Instant::now() + DRAIN_DEADLINE);
                    }

                    if let Some(deadline) = drain_deadline {
                        if tokio::time::Instant::now() >= deadline {
                            warn!(target: "queue", queue = %name, "排空超时，工作进程退出");
                            return;
                        }
                    }

                    let raw: Option<String> = match conn.rpop(wait_key(&name), None).await {
                        Ok(v) => v,
                        Err(e) => {
                            warn!(target: "queue", "读取队列失败: {}", e);
                            break;
                        }
                    };

                    let raw = match raw {
                        Some(raw) => raw,
                        None => {
                            // 队列已空
                            if drain_deadline.is_some() {
                                info!(target: "queue", queue = %name, "队列已排空，工作进程退出");
                                return;
                            }
                            tokio::select! {
                                _ = sleep(POLL_INTERVAL) => {}
                                _ = shutdown.changed() => {}
                            }
                            continue;
                        }
                    };

                    let job: Job = match serde_json::from_str(&raw) {
                        Ok(job) => job,
                        Err(e) => {
                            warn!(target: "queue", "任务反序列化失败，已丢弃: {}", e);
                            continue;
                        }
                    };

                    match handler.handle(&job) {
                        Ok(()) => {
                            processed.fetch_add(1, Ordering::Relaxed);
                            debug!(target: "queue", job_id = %job.id, kind = %job.kind, "任务完成");
                        }
                        Err(e) => {
                            handle_job_failure(&client, &name, job, e).await;
                        }
                    }
                }
            }
        })
    }
}

fn wait_key(name: &str) -> String {
    format!("queue:{}:wait", name)
}

fn failed_key(name: &str) -> String {
    format!("queue:{}:failed", name)
}

/// 任务失败处理：未到重试上限则延迟重新入队，否则记入失败列表
async fn handle_job_failure(client: &redis::Client, name: &str, mut job: Job, err: AppError) {
    if job.attempt < job.max_attempts {
        let delay = job.retry_delay();
        job.attempt += 1;
        warn!(
            target: "queue",
            job_id = %job.id,
            kind = %job.kind,
            attempt = job.attempt,
            delay_ms = delay.as_millis() as u64,
            "任务失败，稍后重试: {}", err
        );

        let client = client.clone();
        let wait = wait_key(name);
        tokio::spawn(async move {
            sleep(delay).await;
            if let Ok(mut conn) = client.get_multiplexed_async_connection().await {
                if let Ok(raw) = serde_json::to_string(&job) {
                    let _: std::result::Result<i64, _> = conn.lpush(&wait, raw).await;
                }
            }
        });
    } else {
        error!(
            target: "queue",
            job_id = %job.id,
            kind = %job.kind,
            attempts = job.attempt,
            "任务重试次数耗尽，记入失败列表: {}", err
        );

        if let Ok(mut conn) = client.get_multiplexed_async_connection().await {
            if let Ok(raw) = serde_json::to_string(&job) {
                let _: std::result::Result<i64, _> = conn.lpush(failed_key(name), raw).await;
                let _: std::result::Result<(), _> = conn.ltrim(failed_key(name), 0, FAILED_KEEP_LAST - 1).await;
            }
        }
    }
}

/// 入队泵：消费内部通道，写入等待列表
async fn run_enqueue_pump(redis_url: String, wait: String, mut rx: mpsc::UnboundedReceiver<Job>) {
    let client = match redis::Client::open(redis_url.as_str()) {
        Ok(c) => c,
        Err(e) => {
            error!(target: "queue", "Redis地址无效: {}", e);
            return;
        }
    };

    loop {
        let mut conn = match client.get_multiplexed_async_connection().await {
            Ok(conn) => conn,
            Err(e) => {
                warn!(target: "queue", "入队连接失败: {}", e);
                sleep(Duration::from_secs(1)).await;
                continue;
            }
        };

        while let Some(job) = rx.recv().await {
            let raw = match serde_json::to_string(&job) {
                Ok(raw) => raw,
                Err(e) => {
                    error!(target: "queue", "任务序列化失败: {}", e);
                    continue;
                }
            };

            if let Err(e) = conn.lpush::<_, _, i64>(&wait, raw).await {
                warn!(target: "queue", job_id = %job.id, "任务入队失败，已丢弃: {}", e);
                break;
            }
        }

        if rx.is_closed() && rx.is_empty() {
            info!(target: "queue", "入队通道已关闭，入队泵退出");
            return;
        }

        sleep(Duration::from_millis(500)).await;
    }
}

/// persistPrice任务的落地实现
///
/// 当前契约是幂等的结构化记录：同一 (symbol, ts) 重复投递写出相同的记录
pub struct PersistenceWorker;

impl JobHandler for PersistenceWorker {
    fn handle(&self, job: &Job) -> Result<()> {
        match job.kind.as_str() {
            KIND_PERSIST_PRICE => {
                let symbol = job
                    .payload
                    .get("symbol")
                    .and_then(|s| s.as_str())
                    .ok_or_else(|| AppError::QueueError("persistPrice任务缺少symbol字段".to_string()))?;
                let price = job
                    .payload
                    .get("price")
                    .and_then(|p| p.as_str())
                    .unwrap_or("");
                let ts = job.payload.get("ts").and_then(|t| t.as_i64()).unwrap_or(0);

                info!(
                    target: "persist",
                    symbol,
                    price,
                    ts,
                    "price event persisted"
                );
                Ok(())
            }
            other => Err(AppError::QueueError(format!("未知的任务类型: {}", other))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job_with_attempt(attempt: u32) -> Job {
        Job {
            id: "test".to_string(),
            kind: KIND_PERSIST_PRICE.to_string(),
            payload: serde_json::json!({"symbol": "BTCUSDT", "price": "1.0", "ts": 1700000000000i64}),
            attempt,
            max_attempts: 3,
            backoff_base_ms: 2000,
            enqueued_at: 0,
        }
    }

    #[test]
    fn test_retry_delay_exponential() {
        assert_eq!(job_with_attempt(1).retry_delay(), Duration::from_millis(2000));
        assert_eq!(job_with_attempt(2).retry_delay(), Duration::from_millis(4000));
        assert_eq!(job_with_attempt(3).retry_delay(), Duration::from_millis(8000));
    }

    #[test]
    fn test_persistence_worker_handles_persist_price() {
        let worker = PersistenceWorker;
        assert!(worker.handle(&job_with_attempt(1)).is_ok());
        // 重复投递同样成功（幂等）
        assert!(worker.handle(&job_with_attempt(1)).is_ok());
    }

    #[test]
    fn test_persistence_worker_rejects_unknown_kind() {
        let worker = PersistenceWorker;
        let mut job = job_with_attempt(1);
        job.kind = "unknown".to_string();
        assert!(worker.handle(&job).is_err());
    }

    #[test]
    fn test_persistence_worker_requires_symbol() {
        let worker = PersistenceWorker;
        let mut job = job_with_attempt(1);
        job.payload = serde_json::json!({"price": "1.0"});
        assert!(worker.handle(&job).is_err());
    }

    #[test]
    fn test_job_round_trip() {
        let job = job_with_attempt(2);
        let raw = serde_json::to_string(&job).unwrap();
        let decoded: Job = serde_json::from_str(&raw).unwrap();
        assert_eq!(decoded.id, job.id);
        assert_eq!(decoded.attempt, 2);
        assert_eq!(decoded.payload, job.payload);
    }
}
