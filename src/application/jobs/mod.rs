mod queue;
mod worker;

pub use queue::{
    DEFAULT_MAX_ATTEMPTS, DEFAULT_QUEUE_DEPTH_ALERT, EnqueueOptions, EnqueuedJob,
    QueueDepthStatus, enqueue_render_job, wait_for_job_completion,
};
pub use worker::{
    DEFAULT_BACKOFF_BASE, DEFAULT_LEASE_TIMEOUT, DEFAULT_POLL_INTERVAL, JobBackend,
    JobDisposition, RENDER_JOB_TYPE, RenderWorker, WorkerSettings, backoff_delay,
    process_render_job,
};
