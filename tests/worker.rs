mod common;

use std::time::Duration;

use mailpress::{
    application::{
        jobs::{EnqueueOptions, JobDisposition, enqueue_render_job, wait_for_job_completion},
        render::RenderErrorKind,
        repos::JobQueue,
    },
    domain::types::JobState,
};
use time::OffsetDateTime;

use common::{FakeBehavior, Pipeline, payload, pool_config};

const WORKER_ID: &str = "test-0";

#[tokio::test]
async fn repeated_timeouts_end_in_the_dead_letter_state() {
    let behavior = FakeBehavior {
        render_delay: Duration::from_millis(600),
        ..FakeBehavior::default()
    };
    let pipeline = Pipeline::new(behavior, pool_config(1, 50));
    let worker = pipeline.worker();

    let job = enqueue_render_job(
        pipeline.queue.as_ref(),
        payload("never-renders"),
        None,
        &EnqueueOptions::default(),
    )
    .await
    .expect("enqueue");

    let mut dispositions = Vec::new();
    for _ in 0..3 {
        let disposition = worker
            .run_once(WORKER_ID)
            .await
            .expect("claim")
            .expect("job ready");
        dispositions.push(disposition);
    }

    assert!(matches!(dispositions[0], JobDisposition::Retrying { .. }));
    assert!(matches!(dispositions[1], JobDisposition::Retrying { .. }));
    assert_eq!(dispositions[2], JobDisposition::DeadLettered);
    assert!(worker.run_once(WORKER_ID).await.expect("claim").is_none());

    let record = pipeline
        .queue
        .find(&job.id)
        .await
        .expect("find")
        .expect("record exists");
    assert_eq!(record.state, JobState::Killed);
    assert_eq!(record.attempts, 3);
    assert!(record.last_error.is_some());

    let metrics = pipeline.metrics.snapshot();
    assert_eq!(metrics.dead_lettered, 1);
    assert_eq!(pipeline.metrics.failures_of(RenderErrorKind::RenderTimeout), 3);

    let counts = pipeline.queue.counts().await.expect("counts");
    assert_eq!(counts.dead_lettered, 1);
    assert_eq!(counts.waiting, 0);
}

#[tokio::test]
async fn terminal_failure_is_not_retried() {
    let pipeline = Pipeline::new(FakeBehavior::default(), pool_config(1, 50));
    let worker = pipeline.worker();
    let mut message = payload("no-body");
    message.html_body = None;

    let job = enqueue_render_job(
        pipeline.queue.as_ref(),
        message,
        None,
        &EnqueueOptions::default(),
    )
    .await
    .expect("enqueue");

    let disposition = worker.run_once(WORKER_ID).await.expect("claim");
    assert_eq!(disposition, Some(JobDisposition::Failed));
    assert!(worker.run_once(WORKER_ID).await.expect("claim").is_none());

    let record = pipeline
        .queue
        .find(&job.id)
        .await
        .expect("find")
        .expect("record exists");
    assert_eq!(record.state, JobState::Failed);
    assert_eq!(record.attempts, 1);
}

#[tokio::test]
async fn transient_failure_is_retried_until_it_succeeds() {
    let pipeline = Pipeline::new(
        FakeBehavior {
            crash: true,
            ..FakeBehavior::default()
        },
        pool_config(1, 50),
    );
    let worker = pipeline.worker();

    let job = enqueue_render_job(
        pipeline.queue.as_ref(),
        payload("flaky"),
        None,
        &EnqueueOptions::default(),
    )
    .await
    .expect("enqueue");

    let first = worker.run_once(WORKER_ID).await.expect("claim");
    assert!(matches!(first, Some(JobDisposition::Retrying { .. })));

    pipeline.engine.set_behavior(FakeBehavior::default());
    let second = worker.run_once(WORKER_ID).await.expect("claim");
    assert_eq!(second, Some(JobDisposition::Completed));

    let record = pipeline
        .queue
        .find(&job.id)
        .await
        .expect("find")
        .expect("record exists");
    assert_eq!(record.state, JobState::Done);
    assert_eq!(record.attempts, 2);
    assert_eq!(pipeline.documents.len(), 1);
}

#[tokio::test]
async fn running_worker_drains_the_queue_within_the_pool_ceiling() {
    let behavior = FakeBehavior {
        render_delay: Duration::from_millis(20),
        ..FakeBehavior::default()
    };
    let pipeline = Pipeline::new(behavior, pool_config(2, 3));
    let worker = pipeline.worker();
    assert_eq!(worker.concurrency(), 2);

    let mut ids = Vec::new();
    for index in 0..8 {
        let job = enqueue_render_job(
            pipeline.queue.as_ref(),
            payload(&format!("bulk-{index}")),
            None,
            &EnqueueOptions::default(),
        )
        .await
        .expect("enqueue");
        ids.push(job.id);
    }

    assert_eq!(worker.initialize().await, 1);

    for id in ids {
        let record = wait_for_job_completion(pipeline.queue.as_ref(), &id, Duration::from_secs(10))
            .await
            .expect("job finishes");
        assert_eq!(record.state, JobState::Done);
    }

    worker.cleanup().await;

    let counters = pipeline.engine.counters();
    assert!(counters.peak_contexts() <= 2);
    assert_eq!(counters.contexts_opened(), counters.contexts_closed());
    assert_eq!(counters.launched(), counters.closed());
    assert_eq!(pipeline.documents.len(), 8);

    let stats = pipeline.pool.stats();
    assert_eq!(stats.total, 0);
    assert_eq!(stats.contexts_acquired, 8);
    assert_eq!(stats.contexts_released, 8);
    assert_eq!(pipeline.metrics.in_flight(), 0);
}

#[tokio::test]
async fn cleanup_without_initialize_is_harmless() {
    let pipeline = Pipeline::new(FakeBehavior::default(), pool_config(1, 50));
    let worker = pipeline.worker();

    worker.cleanup().await;

    assert_eq!(pipeline.engine.counters().launched(), 0);
    assert_eq!(pipeline.pool.stats().total, 0);
}

#[tokio::test]
async fn delivery_past_the_attempt_limit_is_dead_lettered_without_rendering() {
    let pipeline = Pipeline::new(FakeBehavior::default(), pool_config(1, 50));
    let worker = pipeline.worker();

    let job = enqueue_render_job(
        pipeline.queue.as_ref(),
        payload("orphaned"),
        None,
        &EnqueueOptions {
            max_attempts: 1,
            ..EnqueueOptions::default()
        },
    )
    .await
    .expect("enqueue");

    // The only allowed delivery went to a worker that vanished mid-render.
    let lost = pipeline.queue.claim_next("lost-worker").expect("job ready");
    assert_eq!(lost.attempt, 1);
    pipeline
        .queue
        .settle(
            &job.id,
            JobDisposition::Retrying {
                run_at: OffsetDateTime::now_utc(),
            },
            Some("worker lost"),
        )
        .expect("hand back");

    let disposition = worker.run_once(WORKER_ID).await.expect("claim");
    assert_eq!(disposition, Some(JobDisposition::DeadLettered));
    assert!(worker.run_once(WORKER_ID).await.expect("claim").is_none());

    let record = pipeline
        .queue
        .find(&job.id)
        .await
        .expect("find")
        .expect("record exists");
    assert_eq!(record.state, JobState::Killed);
    assert_eq!(record.attempts, 2);
    assert_eq!(pipeline.engine.counters().renders(), 0);
    assert_eq!(pipeline.pool.stats().contexts_acquired, 0);
    assert!(pipeline.documents.is_empty());
    assert_eq!(pipeline.metrics.snapshot().dead_lettered, 1);
}
