//! Job queue: in-memory and Redis-backed variants behind one contract.
//!
//! Delivery is at-least-once; handlers must verify current store state
//! before mutating. A requeued job goes to the tail, so strict FIFO is
//! not guaranteed across retries. `claim` is the serialisation point
//! between concurrent workers.

use chrono::Utc;
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Mutex;
use thiserror::Error;
use uuid::Uuid;

/// Job types understood by the worker dispatch table.
pub const PLAN_PROTOCOL_JOB: &str = "plan_protocol_job";
pub const EXECUTE_STEP_JOB: &str = "execute_step_job";
pub const RUN_QUALITY_JOB: &str = "run_quality_job";
pub const OPEN_PR_JOB: &str = "open_pr_job";

pub const DEFAULT_QUEUE: &str = "default";
const DEFAULT_MAX_ATTEMPTS: u32 = 3;

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, QueueError>;

/// Job lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    InProgress,
    Finished,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::InProgress => "in_progress",
            Self::Finished => "finished",
            Self::Failed => "failed",
        }
    }
}

/// A unit of work owned by the queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub job_id: String,
    pub job_type: String,
    pub payload: Value,
    pub status: JobStatus,
    pub queue: String,
    pub created_at: i64,
    pub attempts: u32,
    pub max_attempts: u32,
    /// Epoch seconds; 0 means immediately claimable.
    pub next_run_at: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Job {
    fn new(job_type: &str, payload: Value, queue: Option<&str>) -> Self {
        Self {
            job_id: Uuid::now_v7().to_string(),
            job_type: job_type.to_string(),
            payload,
            status: JobStatus::Queued,
            queue: queue.unwrap_or(DEFAULT_QUEUE).to_string(),
            created_at: Utc::now().timestamp(),
            attempts: 0,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            next_run_at: 0,
            started_at: None,
            ended_at: None,
            result: None,
            error: None,
        }
    }

    /// Convenience accessor for the ids most handlers carry in payloads.
    pub fn payload_id(&self, key: &str) -> Option<i64> {
        self.payload.get(key).and_then(Value::as_i64)
    }
}

/// Per-queue counters for observers.
#[derive(Debug, Clone, Serialize)]
pub struct QueueStats {
    pub backend: &'static str,
    pub total: usize,
    pub queued: usize,
    pub in_progress: usize,
    pub queues: BTreeMap<String, usize>,
}

/// The queue contract shared by both implementations.
pub trait JobQueue: Send + Sync {
    /// Create and enqueue a new job.
    fn enqueue(&self, job_type: &str, payload: Value, queue: Option<&str>) -> Result<Job>;
    /// Pop the next runnable job, transitioning it to `in_progress`.
    /// Non-blocking; `None` when nothing is claimable.
    fn claim(&self, queue: Option<&str>) -> Result<Option<Job>>;
    /// Put a job back with a delay; it re-enters at the tail.
    fn requeue(&self, job: Job, delay_seconds: u64) -> Result<()>;
    /// Snapshot of jobs, optionally filtered by status.
    fn list(&self, status: Option<JobStatus>) -> Result<Vec<Job>>;
    fn stats(&self) -> Result<QueueStats>;
}

/// Mutex-protected in-memory queue; the default backend.
#[derive(Default)]
pub struct InMemoryQueue {
    jobs: Mutex<Vec<Job>>,
}

impl InMemoryQueue {
    pub fn new() -> Self {
        Self::default()
    }
}

impl JobQueue for InMemoryQueue {
    fn enqueue(&self, job_type: &str, payload: Value, queue: Option<&str>) -> Result<Job> {
        let job = Job::new(job_type, payload, queue);
        let mut jobs = self.jobs.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        jobs.push(job.clone());
        Ok(job)
    }

    fn claim(&self, queue: Option<&str>) -> Result<Option<Job>> {
        let now = Utc::now().timestamp();
        let mut jobs = self.jobs.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        let position = jobs.iter().position(|job| {
            job.status == JobStatus::Queued
                && job.next_run_at <= now
                && queue.map_or(true, |q| job.queue == q)
        });
        Ok(position.map(|idx| {
            let mut job = jobs.remove(idx);
            job.status = JobStatus::InProgress;
            job.started_at = Some(now);
            job
        }))
    }

    fn requeue(&self, mut job: Job, delay_seconds: u64) -> Result<()> {
        job.status = JobStatus::Queued;
        job.next_run_at = Utc::now().timestamp() + delay_seconds as i64;
        let mut jobs = self.jobs.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        jobs.push(job);
        Ok(())
    }

    fn list(&self, status: Option<JobStatus>) -> Result<Vec<Job>> {
        let jobs = self.jobs.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        Ok(jobs
            .iter()
            .filter(|job| status.map_or(true, |s| job.status == s))
            .cloned()
            .collect())
    }

    fn stats(&self) -> Result<QueueStats> {
        let jobs = self.jobs.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        let mut queues = BTreeMap::new();
        for job in jobs.iter() {
            *queues.entry(job.queue.clone()).or_insert(0) += 1;
        }
        Ok(QueueStats {
            backend: "in-memory",
            total: jobs.len(),
            queued: jobs.iter().filter(|j| j.status == JobStatus::Queued).count(),
            in_progress: jobs
                .iter()
                .filter(|j| j.status == JobStatus::InProgress)
                .count(),
            queues,
        })
    }
}

/// Redis-backed queue for multi-process deployments.
///
/// Jobs are serialized into a list per queue name; delayed jobs park in a
/// sorted set scored by `next_run_at` and migrate back on claim.
pub struct RedisQueue {
    client: redis::Client,
    runtime: tokio::runtime::Handle,
    known_queues: Mutex<Vec<String>>,
}

impl RedisQueue {
    pub fn new(redis_url: &str) -> Result<Self> {
        let client = redis::Client::open(redis_url)?;
        Ok(Self {
            client,
            runtime: tokio::runtime::Handle::current(),
            known_queues: Mutex::new(vec![DEFAULT_QUEUE.to_string()]),
        })
    }

    fn list_key(queue: &str) -> String {
        format!("flowd:queue:{queue}")
    }

    fn delayed_key(queue: &str) -> String {
        format!("flowd:delayed:{queue}")
    }

    fn remember_queue(&self, queue: &str) {
        let mut known = self
            .known_queues
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if !known.iter().any(|q| q == queue) {
            known.push(queue.to_string());
        }
    }

    fn queues(&self) -> Vec<String> {
        self.known_queues
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }

    fn block_on<F, T>(&self, fut: F) -> T
    where
        F: std::future::Future<Output = T> + Send,
        T: Send,
    {
        tokio::task::block_in_place(|| self.runtime.block_on(fut))
    }
}

impl JobQueue for RedisQueue {
    fn enqueue(&self, job_type: &str, payload: Value, queue: Option<&str>) -> Result<Job> {
        let job = Job::new(job_type, payload, queue);
        self.remember_queue(&job.queue);
        let serialized = serde_json::to_string(&job)?;
        let key = Self::list_key(&job.queue);
        let client = self.client.clone();
        self.block_on(async move {
            let mut conn = client.get_multiplexed_async_connection().await?;
            let _: () = conn.rpush(key, serialized).await?;
            Ok::<_, QueueError>(())
        })?;
        Ok(job)
    }

    fn claim(&self, queue: Option<&str>) -> Result<Option<Job>> {
        let now = Utc::now().timestamp();
        let queues = match queue {
            Some(q) => vec![q.to_string()],
            None => self.queues(),
        };
        let client = self.client.clone();
        self.block_on(async move {
            let mut conn = client.get_multiplexed_async_connection().await?;
            for name in queues {
                // Promote any due delayed jobs back onto the list first.
                let due: Vec<String> = conn
                    .zrangebyscore(Self::delayed_key(&name), 0, now)
                    .await?;
                for entry in due {
                    let _: () = conn
                        .zrem(Self::delayed_key(&name), &entry)
                        .await?;
                    let _: () = conn.rpush(Self::list_key(&name), &entry).await?;
                }

                let raw: Option<String> = conn.lpop(Self::list_key(&name), None).await?;
                if let Some(raw) = raw {
                    let mut job: Job = serde_json::from_str(&raw)?;
                    job.status = JobStatus::InProgress;
                    job.started_at = Some(now);
                    return Ok(Some(job));
                }
            }
            Ok::<_, QueueError>(None)
        })
    }

    fn requeue(&self, mut job: Job, delay_seconds: u64) -> Result<()> {
        job.status = JobStatus::Queued;
        job.next_run_at = Utc::now().timestamp() + delay_seconds as i64;
        self.remember_queue(&job.queue);
        let serialized = serde_json::to_string(&job)?;
        let delayed = Self::delayed_key(&job.queue);
        let list = Self::list_key(&job.queue);
        let score = job.next_run_at;
        let client = self.client.clone();
        self.block_on(async move {
            let mut conn = client.get_multiplexed_async_connection().await?;
            if delay_seconds == 0 {
                let _: () = conn.rpush(list, serialized).await?;
            } else {
                let _: () = conn.zadd(delayed, serialized, score).await?;
            }
            Ok::<_, QueueError>(())
        })
    }

    fn list(&self, status: Option<JobStatus>) -> Result<Vec<Job>> {
        // Only queued jobs are visible to the broker-backed listing;
        // in-progress jobs live in the claiming worker.
        if status.is_some_and(|s| s != JobStatus::Queued) {
            return Ok(Vec::new());
        }
        let queues = self.queues();
        let client = self.client.clone();
        self.block_on(async move {
            let mut conn = client.get_multiplexed_async_connection().await?;
            let mut jobs = Vec::new();
            for name in queues {
                let raw: Vec<String> = conn.lrange(Self::list_key(&name), 0, -1).await?;
                for entry in raw {
                    if let Ok(job) = serde_json::from_str::<Job>(&entry) {
                        jobs.push(job);
                    }
                }
                let delayed: Vec<String> =
                    conn.zrange(Self::delayed_key(&name), 0, -1).await?;
                for entry in delayed {
                    if let Ok(job) = serde_json::from_str::<Job>(&entry) {
                        jobs.push(job);
                    }
                }
            }
            Ok::<_, QueueError>(jobs)
        })
    }

    fn stats(&self) -> Result<QueueStats> {
        let queues = self.queues();
        let client = self.client.clone();
        self.block_on(async move {
            let mut conn = client.get_multiplexed_async_connection().await?;
            let mut per_queue = BTreeMap::new();
            let mut total = 0usize;
            for name in queues {
                let queued: usize = conn.llen(Self::list_key(&name)).await?;
                let delayed: usize = conn.zcard(Self::delayed_key(&name)).await?;
                total += queued + delayed;
                per_queue.insert(name, queued + delayed);
            }
            Ok::<_, QueueError>(QueueStats {
                backend: "redis",
                total,
                queued: total,
                in_progress: 0,
                queues: per_queue,
            })
        })
    }
}

/// Select the queue backend: Redis when a URL is configured, else
/// in-memory. A bad Redis URL falls back to in-memory so local
/// development keeps working.
pub fn create_queue(redis_url: Option<&str>) -> std::sync::Arc<dyn JobQueue> {
    if let Some(url) = redis_url {
        match RedisQueue::new(url) {
            Ok(queue) => return std::sync::Arc::new(queue),
            Err(e) => {
                tracing::warn!(error = %e, "redis unavailable; using in-memory queue");
            }
        }
    }
    std::sync::Arc::new(InMemoryQueue::new())
}
