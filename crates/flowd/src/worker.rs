//! Worker loop: drains the job queue and routes jobs to handlers.
//!
//! One cooperative task per process. Failed jobs retry with exponential
//! backoff capped at sixty seconds; exhausted jobs journal `job_failed`
//! and block the run. Shutdown is honoured between jobs only.

use std::sync::Arc;
use std::time::Duration;

use flow_core::events::EventKind;
use flow_core::types::ProtocolStatus;
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::executor::handle_execute_step;
use crate::git;
use crate::planner::handle_plan_protocol;
use crate::qa::handle_quality;
use crate::queue::{
    Job, EXECUTE_STEP_JOB, OPEN_PR_JOB, PLAN_PROTOCOL_JOB, RUN_QUALITY_JOB,
};
use crate::{AppContext, HandlerError, HandlerResult};

/// Sleep between polls when the queue is empty.
const POLL_INTERVAL: Duration = Duration::from_millis(500);
/// Backoff ceiling for retried jobs.
const MAX_BACKOFF_SECONDS: u64 = 60;

pub struct Worker {
    ctx: Arc<AppContext>,
    shutdown: CancellationToken,
}

impl Worker {
    pub fn new(ctx: Arc<AppContext>, shutdown: CancellationToken) -> Self {
        Self { ctx, shutdown }
    }

    /// Claim and process jobs until shutdown. In-flight handlers are
    /// never interrupted; cancellation takes effect between jobs.
    pub async fn run(&self) {
        info!("worker started");
        loop {
            if self.shutdown.is_cancelled() {
                break;
            }

            let claimed = match self.ctx.queue.claim(None) {
                Ok(job) => job,
                Err(e) => {
                    error!(error = %e, "queue claim failed");
                    None
                }
            };

            match claimed {
                Some(job) => process_job(&self.ctx, job).await,
                None => {
                    tokio::select! {
                        () = self.shutdown.cancelled() => break,
                        () = tokio::time::sleep(POLL_INTERVAL) => {}
                    }
                }
            }
        }
        info!("worker stopped");
    }
}

/// Process one claimed job: dispatch, then apply the retry/backoff
/// policy on failure.
pub async fn process_job(ctx: &AppContext, mut job: Job) {
    match dispatch(ctx, &job).await {
        Ok(()) => {
            ctx.metrics.inc_job(&job.job_type, "completed");
        }
        Err(e) => {
            job.attempts += 1;
            if job.attempts < job.max_attempts {
                let delay = backoff_seconds(job.attempts);
                warn!(
                    job_id = %job.job_id,
                    job_type = %job.job_type,
                    attempts = job.attempts,
                    delay,
                    error = %e,
                    "job failed; requeuing with backoff"
                );
                if let Err(requeue_err) = ctx.queue.requeue(job, delay) {
                    error!(error = %requeue_err, "failed to requeue job");
                }
            } else {
                error!(
                    job_id = %job.job_id,
                    job_type = %job.job_type,
                    error = %e,
                    "job failed permanently"
                );
                if let Some(protocol_run_id) = job.payload_id("protocol_run_id") {
                    let step_run_id = job.payload_id("step_run_id");
                    let _ = ctx
                        .storage
                        .append_event(
                            protocol_run_id,
                            step_run_id,
                            EventKind::JobFailed.as_str(),
                            &format!("{} failed: {e}", job.job_type),
                            Some(json!({"job_id": job.job_id, "attempts": job.attempts})),
                        )
                        .await;
                    let _ = ctx
                        .storage
                        .update_protocol_status(protocol_run_id, ProtocolStatus::Blocked)
                        .await;
                }
                ctx.metrics.inc_job(&job.job_type, "failed");
            }
        }
    }
}

/// Exponential backoff, capped: `min(60, 2^attempts)` seconds.
fn backoff_seconds(attempts: u32) -> u64 {
    2u64.saturating_pow(attempts.min(16)).min(MAX_BACKOFF_SECONDS)
}

/// Route a job to its handler by type. Unknown types journal an
/// `unknown_job` event and are dropped.
pub async fn dispatch(ctx: &AppContext, job: &Job) -> HandlerResult<()> {
    match job.job_type.as_str() {
        PLAN_PROTOCOL_JOB => {
            let protocol_run_id = job
                .payload_id("protocol_run_id")
                .ok_or(HandlerError::Payload("protocol_run_id"))?;
            handle_plan_protocol(ctx, protocol_run_id).await
        }
        EXECUTE_STEP_JOB => {
            let step_run_id = job
                .payload_id("step_run_id")
                .ok_or(HandlerError::Payload("step_run_id"))?;
            handle_execute_step(ctx, step_run_id).await
        }
        RUN_QUALITY_JOB => {
            let step_run_id = job
                .payload_id("step_run_id")
                .ok_or(HandlerError::Payload("step_run_id"))?;
            handle_quality(ctx, step_run_id).await
        }
        OPEN_PR_JOB => {
            let protocol_run_id = job
                .payload_id("protocol_run_id")
                .ok_or(HandlerError::Payload("protocol_run_id"))?;
            handle_open_pr(ctx, protocol_run_id).await
        }
        other => {
            let protocol_run_id = job.payload_id("protocol_run_id").unwrap_or(-1);
            ctx.storage
                .append_event(
                    protocol_run_id,
                    None,
                    EventKind::UnknownJob.as_str(),
                    &format!("Unhandled job type {other}"),
                    None,
                )
                .await?;
            Ok(())
        }
    }
}

/// Push the protocol branch and request a PR/MR through the host CLI.
pub async fn handle_open_pr(ctx: &AppContext, protocol_run_id: i64) -> HandlerResult<()> {
    let run = ctx.storage.get_protocol_run(protocol_run_id).await?;
    let project = ctx.storage.get_project(run.project_id).await?;

    let Some(repo_root) = git::local_repo_path(&project.git_url) else {
        ctx.storage
            .append_event(
                run.id,
                None,
                EventKind::OpenPrSkipped.as_str(),
                "Repo not available locally; cannot push or open PR/MR.",
                Some(json!({"git_url": project.git_url})),
            )
            .await?;
        return Ok(());
    };

    let worktree = git::ensure_worktree(&repo_root, &run.protocol_name, &run.base_branch)?;
    if git::push_and_open_pr(&worktree, &run.protocol_name, &run.base_branch) {
        ctx.storage
            .append_event(
                run.id,
                None,
                EventKind::OpenPr.as_str(),
                "Branch pushed and PR/MR requested.",
                Some(json!({"branch": run.protocol_name})),
            )
            .await?;
        if git::trigger_ci(project.ci_provider.as_deref(), &repo_root, &run.protocol_name) {
            ctx.storage
                .append_event(
                    run.id,
                    None,
                    EventKind::CiTriggered.as_str(),
                    "CI triggered after PR/MR request.",
                    Some(json!({"branch": run.protocol_name})),
                )
                .await?;
        }
    } else {
        ctx.storage
            .append_event(
                run.id,
                None,
                EventKind::OpenPrFailed.as_str(),
                "Failed to push branch or open PR/MR.",
                Some(json!({"branch": run.protocol_name})),
            )
            .await?;
        ctx.storage
            .update_protocol_status(run.id, ProtocolStatus::Blocked)
            .await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::JobStatus;
    use crate::storage::tests::{create_test_storage, TestStorage};
    use crate::storage::{NewProject, NewProtocolRun};
    use crate::testutil::test_context;

    async fn seed_run(ts: &TestStorage) -> i64 {
        let project = ts
            .storage
            .create_project(NewProject {
                name: "demo".to_string(),
                git_url: "/missing/repo".to_string(),
                base_branch: "main".to_string(),
                ..NewProject::default()
            })
            .await
            .unwrap();
        ts.storage
            .create_protocol_run(NewProtocolRun {
                project_id: project.id,
                protocol_name: "0001-demo".to_string(),
                status: ProtocolStatus::Running,
                base_branch: "main".to_string(),
                worktree_path: None,
                protocol_root: None,
                description: None,
                template_config: None,
                template_source: None,
            })
            .await
            .unwrap()
            .id
    }

    #[test]
    fn backoff_grows_and_caps_at_sixty() {
        assert_eq!(backoff_seconds(1), 2);
        assert_eq!(backoff_seconds(2), 4);
        assert_eq!(backoff_seconds(5), 32);
        assert_eq!(backoff_seconds(6), 60);
        assert_eq!(backoff_seconds(30), 60);
    }

    #[tokio::test]
    async fn unknown_job_type_journals_and_completes() {
        let ts = create_test_storage().await;
        let run_id = seed_run(&ts).await;
        let ctx = test_context(&ts).await;

        let job = ctx
            .queue
            .enqueue("mystery_job", json!({"protocol_run_id": run_id}), None)
            .unwrap();
        let job = {
            let claimed = ctx.queue.claim(None).unwrap().unwrap();
            assert_eq!(claimed.job_id, job.job_id);
            claimed
        };
        process_job(&ctx, job).await;

        let events = ts.storage.list_events(run_id).await.unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type, "unknown_job");
        assert!(events[0].message.contains("mystery_job"));
        // Nothing was requeued.
        assert!(ctx.queue.list(None).unwrap().is_empty());
    }

    #[tokio::test]
    async fn failed_job_is_requeued_with_backoff() {
        let ts = create_test_storage().await;
        let ctx = test_context(&ts).await;

        // Missing payload id makes the handler fail.
        ctx.queue
            .enqueue(EXECUTE_STEP_JOB, json!({}), None)
            .unwrap();
        let job = ctx.queue.claim(None).unwrap().unwrap();
        process_job(&ctx, job).await;

        let jobs = ctx.queue.list(Some(JobStatus::Queued)).unwrap();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].attempts, 1);
        // Delayed past now; not claimable yet.
        assert!(ctx.queue.claim(None).unwrap().is_none());
    }

    #[tokio::test]
    async fn exhausted_job_blocks_the_run_and_journals() {
        let ts = create_test_storage().await;
        let run_id = seed_run(&ts).await;
        let ctx = test_context(&ts).await;

        // Step id 999 does not exist, so the handler keeps failing.
        let mut job = ctx
            .queue
            .enqueue(
                EXECUTE_STEP_JOB,
                json!({"step_run_id": 999, "protocol_run_id": run_id}),
                None,
            )
            .unwrap();
        let _ = ctx.queue.claim(None).unwrap();
        job.attempts = job.max_attempts - 1;

        process_job(&ctx, job).await;

        let run = ts.storage.get_protocol_run(run_id).await.unwrap();
        assert_eq!(run.status, ProtocolStatus::Blocked);
        let events = ts.storage.list_events(run_id).await.unwrap();
        let failed = events.iter().find(|e| e.event_type == "job_failed").unwrap();
        assert!(failed.message.contains(EXECUTE_STEP_JOB));
    }

    #[tokio::test]
    async fn plan_job_round_trips_through_the_worker() {
        let ts = create_test_storage().await;
        let run_id = seed_run(&ts).await;
        let ctx = test_context(&ts).await;

        ctx.queue
            .enqueue(PLAN_PROTOCOL_JOB, json!({"protocol_run_id": run_id}), None)
            .unwrap();
        let job = ctx.queue.claim(None).unwrap().unwrap();
        process_job(&ctx, job).await;

        let run = ts.storage.get_protocol_run(run_id).await.unwrap();
        assert_eq!(run.status, ProtocolStatus::Planned);
    }

    #[tokio::test]
    async fn open_pr_without_local_repo_is_skipped() {
        let ts = create_test_storage().await;
        let run_id = seed_run(&ts).await;
        let ctx = test_context(&ts).await;

        handle_open_pr(&ctx, run_id).await.unwrap();

        let events = ts.storage.list_events(run_id).await.unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type, "open_pr_skipped");
    }

    #[tokio::test]
    async fn worker_run_honours_shutdown() {
        let ts = create_test_storage().await;
        let ctx = test_context(&ts).await;
        let shutdown = CancellationToken::new();
        let worker = Worker::new(ctx, shutdown.clone());

        let handle = tokio::spawn(async move { worker.run().await });
        shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .expect("worker did not stop")
            .unwrap();
    }
}
