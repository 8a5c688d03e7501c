//! Queue consumer that feeds the render processor.
//!
//! With Postgres configured, render jobs are apalis jobs: the monitor polls
//! `apalis.jobs`, counts attempts, and re-delivers failures until
//! `max_attempts`. Without a database, slot tasks drain the in-memory queue.
//! Worker concurrency is the pool ceiling either way. Outcomes map onto the
//! queue as follows:
//!
//! * `Created` / `SkippedDuplicate` complete the job.
//! * Terminal failures abort it with no further delivery.
//! * Retryable failures are deferred with exponential backoff and handed back
//!   for another delivery until the last attempt, after which the job is
//!   dead-lettered.

use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

use apalis::{
    layers::WorkerBuilderExt,
    prelude::{
        Attempt, Data, Error as ApalisError, Monitor, TaskId, WorkerBuilder, WorkerFactoryFn,
    },
};
use apalis_sql::{Config as ApalisSqlConfig, context::SqlContext, postgres::PostgresStorage};
use thiserror::Error;
use time::OffsetDateTime;
use tokio::{sync::watch, task::JoinHandle};
use tracing::{debug, error, info, warn};

use crate::application::metrics::{MetricsReporter, RenderMetrics};
use crate::application::render::{RenderJobProcessor, RenderOutcome};
use crate::application::repos::{JobQueue, RepoError};
use crate::domain::entities::{ClaimedJob, RenderJobPayload};
use crate::infra::{db::PostgresRepositories, memory::MemoryJobQueue};
use crate::util::lock::mutex_lock;

const SOURCE: &str = "application::jobs::worker";

/// `job_type` of render jobs in `apalis.jobs`.
pub const RENDER_JOB_TYPE: &str = "mailpress::RenderEmail";

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(500);
pub const DEFAULT_BACKOFF_BASE: Duration = Duration::from_secs(1);
pub const DEFAULT_LEASE_TIMEOUT: Duration = Duration::from_secs(600);

#[derive(Debug, Clone)]
pub struct WorkerSettings {
    /// Worker name; recorded as the lock owner of claimed jobs.
    pub name: String,
    /// Fetch interval of the apalis poller, and the fallback wake-up of the
    /// in-memory slots.
    pub poll_interval: Duration,
    /// Delay before the second delivery; doubles with every further attempt.
    pub backoff_base: Duration,
    /// How long a `Running` job may stay locked by a silent worker before it
    /// is handed out again.
    pub lease_timeout: Duration,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            name: "mailpress".to_owned(),
            poll_interval: DEFAULT_POLL_INTERVAL,
            backoff_base: DEFAULT_BACKOFF_BASE,
            lease_timeout: DEFAULT_LEASE_TIMEOUT,
        }
    }
}

/// Where render jobs come from.
#[derive(Clone)]
pub enum JobBackend {
    /// `apalis.jobs` on the shared pool, driven by an apalis monitor.
    Postgres(Arc<PostgresRepositories>),
    Memory(Arc<MemoryJobQueue>),
}

impl JobBackend {
    pub fn queue(&self) -> Arc<dyn JobQueue> {
        match self {
            JobBackend::Postgres(repositories) => repositories.clone() as Arc<dyn JobQueue>,
            JobBackend::Memory(queue) => queue.clone() as Arc<dyn JobQueue>,
        }
    }
}

/// What happened to a delivered job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobDisposition {
    Completed,
    Failed,
    Retrying { run_at: OffsetDateTime },
    DeadLettered,
}

struct Delivery {
    disposition: JobDisposition,
    error: Option<String>,
}

#[derive(Debug, Error)]
#[error("{0}")]
struct RenderJobError(String);

type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

#[derive(Default)]
struct WorkerRuntime {
    shutdown: Option<watch::Sender<bool>>,
    tasks: Vec<JoinHandle<()>>,
    reporter: Option<JoinHandle<()>>,
}

pub struct RenderWorker {
    backend: JobBackend,
    queue: Arc<dyn JobQueue>,
    processor: Arc<RenderJobProcessor>,
    reporter: Arc<MetricsReporter>,
    settings: WorkerSettings,
    runtime: Mutex<WorkerRuntime>,
}

impl RenderWorker {
    pub fn new(
        backend: JobBackend,
        processor: Arc<RenderJobProcessor>,
        reporter: Arc<MetricsReporter>,
        settings: WorkerSettings,
    ) -> Self {
        Self {
            queue: backend.queue(),
            backend,
            processor,
            reporter,
            settings,
            runtime: Mutex::new(WorkerRuntime::default()),
        }
    }

    /// Number of jobs processed at once; always the pool ceiling.
    pub fn concurrency(&self) -> usize {
        self.processor.pool().max_concurrency()
    }

    pub fn metrics(&self) -> &Arc<RenderMetrics> {
        self.processor.metrics()
    }

    pub fn reporter(&self) -> &Arc<MetricsReporter> {
        &self.reporter
    }

    pub fn queue(&self) -> &Arc<dyn JobQueue> {
        &self.queue
    }

    /// Pre-warm the pool, start consuming jobs and start the metrics
    /// reporter. Calling it again while running is a no-op.
    pub async fn initialize(self: &Arc<Self>) -> usize {
        if mutex_lock(&self.runtime, SOURCE, "initialize.check")
            .shutdown
            .is_some()
        {
            return 0;
        }

        let warmed = self.processor.pool().prewarm().await;

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let tasks = match &self.backend {
            JobBackend::Postgres(repositories) => {
                vec![self.spawn_monitor(repositories, shutdown_rx)]
            }
            JobBackend::Memory(queue) => (0..self.concurrency())
                .map(|slot| {
                    let worker = Arc::clone(self);
                    let queue = Arc::clone(queue);
                    let shutdown = shutdown_rx.clone();
                    tokio::spawn(async move { worker.run_slot(slot, queue, shutdown).await })
                })
                .collect(),
        };
        let reporter = Arc::clone(&self.reporter).spawn();

        let mut runtime = mutex_lock(&self.runtime, SOURCE, "initialize.commit");
        runtime.shutdown = Some(shutdown_tx);
        runtime.tasks = tasks;
        runtime.reporter = Some(reporter);

        info!(
            target = SOURCE,
            op = "initialize",
            concurrency = self.concurrency(),
            warmed,
            "Render worker started"
        );
        warmed
    }

    /// Stop taking jobs, let in-flight jobs finish, stop the reporter and
    /// close every renderer instance.
    pub async fn cleanup(&self) {
        let (shutdown, tasks, reporter) = {
            let mut runtime = mutex_lock(&self.runtime, SOURCE, "cleanup");
            (
                runtime.shutdown.take(),
                std::mem::take(&mut runtime.tasks),
                runtime.reporter.take(),
            )
        };

        if let Some(shutdown) = shutdown {
            let _ = shutdown.send(true);
        }

        for task in tasks {
            if let Err(err) = task.await {
                warn!(
                    target = SOURCE,
                    op = "cleanup",
                    result = "task_join_failed",
                    error = %err,
                    "Worker task ended abnormally"
                );
            }
        }

        if let Some(reporter) = reporter {
            reporter.abort();
            let _ = reporter.await;
        }

        let closed = self.processor.pool().cleanup().await;
        info!(
            target = SOURCE,
            op = "cleanup",
            closed_instances = closed,
            "Render worker stopped"
        );
    }

    fn spawn_monitor(
        self: &Arc<Self>,
        repositories: &PostgresRepositories,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        let config = ApalisSqlConfig::new(RENDER_JOB_TYPE)
            .set_poll_interval(self.settings.poll_interval)
            .set_reenqueue_orphaned_after(self.settings.lease_timeout);
        let storage: PostgresStorage<RenderJobPayload> =
            PostgresStorage::new_with_config(repositories.pool().clone(), config);

        let worker = WorkerBuilder::new(self.settings.name.clone())
            .concurrency(self.concurrency())
            .data(Arc::clone(self))
            .backend(storage)
            .build_fn(process_render_job);
        let monitor = Monitor::new().register(worker);

        tokio::spawn(async move {
            let signal = async move {
                let _ = shutdown.changed().await;
                Ok::<(), std::io::Error>(())
            };
            if let Err(err) = monitor.run_with_signal(signal).await {
                error!(
                    target = SOURCE,
                    op = "monitor",
                    result = "stopped",
                    error = %err,
                    "Job monitor stopped"
                );
            }
        })
    }

    async fn run_slot(
        &self,
        slot: usize,
        queue: Arc<MemoryJobQueue>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let worker_id = format!("{}-{slot}", self.settings.name);
        debug!(target = SOURCE, op = "run_slot", worker_id = %worker_id, "Slot started");

        while !*shutdown.borrow() {
            let idle = match self.run_once(&worker_id).await {
                Ok(Some(_)) => false,
                Ok(None) => true,
                Err(err) => {
                    warn!(
                        target = SOURCE,
                        op = "run_slot",
                        result = "claim_failed",
                        worker_id = %worker_id,
                        error = %err,
                        "Failed to claim next job"
                    );
                    true
                }
            };

            if idle {
                tokio::select! {
                    _ = queue.wait_for_work(self.settings.poll_interval) => {}
                    _ = shutdown.changed() => {}
                }
            }
        }

        debug!(target = SOURCE, op = "run_slot", worker_id = %worker_id, "Slot stopped");
    }

    /// Claim one job from the in-memory queue and handle it. `Ok(None)` means
    /// nothing was ready. Postgres deliveries only come from the monitor.
    pub async fn run_once(&self, worker_id: &str) -> Result<Option<JobDisposition>, RepoError> {
        let JobBackend::Memory(queue) = &self.backend else {
            return Err(RepoError::InvalidInput {
                message: "postgres jobs are delivered by the apalis monitor".to_owned(),
            });
        };
        let Some(job) = queue.claim_next(worker_id) else {
            return Ok(None);
        };

        let delivery = self.handle_job(&job).await;
        if let Err(err) = queue.settle(&job.id, delivery.disposition, delivery.error.as_deref()) {
            error!(
                target = SOURCE,
                op = "handle_job",
                result = "ack_failed",
                job_id = %job.id,
                disposition = ?delivery.disposition,
                error = %err,
                "Failed to record job result in the queue"
            );
        }
        Ok(Some(delivery.disposition))
    }

    async fn handle_job(&self, job: &ClaimedJob) -> Delivery {
        if job.attempt > job.max_attempts {
            self.metrics().record_dead_letter();
            error!(
                target = SOURCE,
                op = "handle_job",
                result = "dead_letter",
                job_id = %job.id,
                tenant_id = %job.payload.tenant_id,
                message_id = %job.payload.message_id,
                attempts = job.attempt,
                max_attempts = job.max_attempts,
                "Render job delivered past its attempt limit; not rendering"
            );
            return Delivery {
                disposition: JobDisposition::DeadLettered,
                error: Some(format!(
                    "delivery {} exceeds max_attempts {}",
                    job.attempt, job.max_attempts
                )),
            };
        }

        let attempt = self.metrics().begin_attempt(job.payload.route);
        let outcome = self.processor.process(&job.payload).await;
        attempt.finish(&outcome);

        let failure = match &outcome {
            RenderOutcome::Created { .. } | RenderOutcome::SkippedDuplicate { .. } => {
                return Delivery {
                    disposition: JobDisposition::Completed,
                    error: None,
                };
            }
            RenderOutcome::Failed(failure) => failure,
        };

        let disposition = if !failure.retryable {
            warn!(
                target = SOURCE,
                op = "handle_job",
                result = "failed",
                job_id = %job.id,
                kind = failure.kind.as_str(),
                attempt = job.attempt,
                "Render job failed permanently"
            );
            JobDisposition::Failed
        } else if job.is_last_attempt() {
            self.metrics().record_dead_letter();
            error!(
                target = SOURCE,
                op = "handle_job",
                result = "dead_letter",
                job_id = %job.id,
                tenant_id = %job.payload.tenant_id,
                message_id = %job.payload.message_id,
                kind = failure.kind.as_str(),
                attempts = job.attempt,
                error = %failure.message,
                "Render job exhausted its attempts"
            );
            JobDisposition::DeadLettered
        } else {
            let delay = backoff_delay(self.settings.backoff_base, job.attempt);
            let run_at = OffsetDateTime::now_utc() + delay;
            warn!(
                target = SOURCE,
                op = "handle_job",
                result = "retry",
                job_id = %job.id,
                kind = failure.kind.as_str(),
                attempt = job.attempt,
                max_attempts = job.max_attempts,
                delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                "Render job will be retried"
            );
            if let Err(err) = self.queue.defer(&job.id, run_at).await {
                warn!(
                    target = SOURCE,
                    op = "handle_job",
                    result = "defer_failed",
                    job_id = %job.id,
                    error = %err,
                    "Failed to push back the next delivery"
                );
            }
            JobDisposition::Retrying { run_at }
        };

        Delivery {
            disposition,
            error: Some(failure.message.clone()),
        }
    }
}

/// apalis entry point for render jobs.
///
/// Retryable failures return [`ApalisError::Failed`] so apalis delivers the
/// job again while attempts remain; everything that must not run again
/// returns [`ApalisError::Abort`].
pub async fn process_render_job(
    payload: RenderJobPayload,
    worker: Data<Arc<RenderWorker>>,
    task_id: TaskId,
    attempt: Attempt,
    context: SqlContext,
) -> Result<(), ApalisError> {
    let job = ClaimedJob {
        id: task_id.to_string(),
        payload,
        attempt: i32::try_from(attempt.current()).unwrap_or(i32::MAX),
        max_attempts: context.max_attempts(),
    };

    let delivery = worker.handle_job(&job).await;
    delivery_result(delivery.disposition, delivery.error)
}

fn delivery_result(
    disposition: JobDisposition,
    error: Option<String>,
) -> Result<(), ApalisError> {
    let cause = move || {
        let boxed: BoxError = Box::new(RenderJobError(error.unwrap_or_default()));
        Arc::new(boxed)
    };
    match disposition {
        JobDisposition::Completed => Ok(()),
        JobDisposition::Retrying { .. } => Err(ApalisError::Failed(cause())),
        JobDisposition::Failed | JobDisposition::DeadLettered => {
            Err(ApalisError::Abort(cause()))
        }
    }
}

/// `base * 2^(attempt - 1)`: 1s, 2s, 4s, … for a one-second base.
pub fn backoff_delay(base: Duration, attempt: i32) -> Duration {
    let exponent = attempt.saturating_sub(1).clamp(0, 16) as u32;
    base.saturating_mul(1u32 << exponent)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_per_attempt() {
        let base = Duration::from_secs(1);
        assert_eq!(backoff_delay(base, 1), Duration::from_secs(1));
        assert_eq!(backoff_delay(base, 2), Duration::from_secs(2));
        assert_eq!(backoff_delay(base, 3), Duration::from_secs(4));
    }

    #[test]
    fn backoff_is_bounded_for_odd_attempts() {
        let base = Duration::from_millis(10);
        assert_eq!(backoff_delay(base, 0), base);
        assert_eq!(backoff_delay(base, 100), base * 65_536);
    }

    #[test]
    fn only_retryable_outcomes_ask_apalis_for_another_delivery() {
        assert!(delivery_result(JobDisposition::Completed, None).is_ok());

        let retry = delivery_result(
            JobDisposition::Retrying {
                run_at: OffsetDateTime::now_utc(),
            },
            Some("render timed out".into()),
        );
        match retry {
            Err(ApalisError::Failed(err)) => assert_eq!(err.to_string(), "render timed out"),
            other => panic!("expected a retryable failure, got {other:?}"),
        }

        for disposition in [JobDisposition::Failed, JobDisposition::DeadLettered] {
            assert!(matches!(
                delivery_result(disposition, Some("bad payload".into())),
                Err(ApalisError::Abort(_))
            ));
        }
    }
}
