use std::time::Duration;

use metrics::counter;
use serde::Serialize;
use time::OffsetDateTime;
use tokio::time::{Instant, sleep};
use tracing::{error, info};

use crate::{
    application::metrics::METRIC_ALERTS,
    application::repos::{JobQueue, RepoError},
    domain::entities::{JobRecord, NewRenderJob, RenderJobPayload},
};

const SOURCE: &str = "application::jobs::queue";

const DEFAULT_WAIT_POLL_INTERVAL: Duration = Duration::from_millis(50);

pub const DEFAULT_MAX_ATTEMPTS: i32 = 3;
pub const DEFAULT_QUEUE_DEPTH_ALERT: u64 = 500;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EnqueueOptions {
    pub max_attempts: i32,
    /// Waiting-job count above which enqueues are flagged.
    pub queue_depth_alert: u64,
}

impl Default for EnqueueOptions {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            queue_depth_alert: DEFAULT_QUEUE_DEPTH_ALERT,
        }
    }
}

/// Backlog observed at enqueue time. Deep queues are reported, never refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct QueueDepthStatus {
    pub depth: u64,
    pub threshold: u64,
    pub over_threshold: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EnqueuedJob {
    pub id: String,
    pub priority: i32,
    pub depth: QueueDepthStatus,
}

/// Submit a render job. `priority` defaults to the route's advisory priority.
pub async fn enqueue_render_job<Q>(
    queue: &Q,
    payload: RenderJobPayload,
    priority: Option<i32>,
    options: &EnqueueOptions,
) -> Result<EnqueuedJob, RepoError>
where
    Q: JobQueue + ?Sized,
{
    payload
        .validate()
        .map_err(|err| RepoError::InvalidInput {
            message: err.to_string(),
        })?;

    let depth = queue.counts().await?.depth();
    let status = QueueDepthStatus {
        depth,
        threshold: options.queue_depth_alert,
        over_threshold: depth > options.queue_depth_alert,
    };

    if status.over_threshold {
        counter!(METRIC_ALERTS, "alert" => "queue_backlog").increment(1);
        error!(
            target = SOURCE,
            op = "enqueue_render_job",
            result = "backlog",
            depth,
            threshold = options.queue_depth_alert,
            tenant_id = %payload.tenant_id,
            message_id = %payload.message_id,
            "Render queue depth above threshold; accepting job anyway"
        );
    }

    let priority = priority.unwrap_or_else(|| payload.route.default_priority());
    let route = payload.route;
    let job = NewRenderJob {
        payload,
        priority,
        max_attempts: options.max_attempts.max(1),
        run_at: OffsetDateTime::now_utc(),
    };

    let id = queue.enqueue(job).await?;
    info!(
        target = SOURCE,
        op = "enqueue_render_job",
        result = "ok",
        job_id = %id,
        route = route.as_str(),
        priority,
        depth,
        "Render job enqueued"
    );

    Ok(EnqueuedJob {
        id,
        priority,
        depth: status,
    })
}

/// Poll until the job reaches a finished state or `timeout` elapses.
///
/// Failed and dead-lettered jobs are returned as records; only a missing job
/// or the deadline produce an error.
pub async fn wait_for_job_completion<Q>(
    queue: &Q,
    job_id: &str,
    timeout: Duration,
) -> Result<JobRecord, RepoError>
where
    Q: JobQueue + ?Sized,
{
    let deadline = Instant::now() + timeout;

    loop {
        let job = queue.find(job_id).await?.ok_or(RepoError::NotFound)?;

        if job.state.is_finished() {
            return Ok(job);
        }

        if Instant::now() >= deadline {
            return Err(RepoError::Timeout);
        }

        sleep(DEFAULT_WAIT_POLL_INTERVAL).await;
    }
}
