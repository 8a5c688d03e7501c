mod common;

use std::{collections::HashSet, sync::OnceLock};

use mailpress::application::{
    jobs::{EnqueueOptions, enqueue_render_job},
    metrics::{Alert, AlertThresholds},
};
use metrics_util::debugging::{DebuggingRecorder, Snapshotter};
use serial_test::serial;

use common::{FakeBehavior, Pipeline, payload, pool_config};

fn snapshotter() -> &'static Snapshotter {
    static SNAPSHOTTER: OnceLock<Snapshotter> = OnceLock::new();
    SNAPSHOTTER.get_or_init(|| {
        let recorder = DebuggingRecorder::new();
        let snapshotter = recorder.snapshotter();
        recorder
            .install()
            .expect("debug metrics recorder should install once per test binary");
        snapshotter
    })
}

/// `name{label=value,...}` for every metric recorded so far.
fn recorded_keys() -> HashSet<String> {
    snapshotter()
        .snapshot()
        .into_vec()
        .into_iter()
        .map(|(composite_key, _, _, _)| {
            let key = composite_key.key();
            let labels: Vec<String> = key
                .labels()
                .map(|label| format!("{}={}", label.key(), label.value()))
                .collect();
            if labels.is_empty() {
                key.name().to_string()
            } else {
                format!("{}{{{}}}", key.name(), labels.join(","))
            }
        })
        .collect()
}

fn names(keys: &HashSet<String>) -> HashSet<String> {
    keys.iter()
        .map(|key| key.split('{').next().unwrap_or(key).to_string())
        .collect()
}

#[tokio::test]
#[serial]
async fn worker_paths_emit_expected_metric_keys() {
    snapshotter();
    let pipeline = Pipeline::new(FakeBehavior::default(), pool_config(1, 50));
    let worker = pipeline.worker();

    enqueue_render_job(
        pipeline.queue.as_ref(),
        payload("metrics-ok"),
        None,
        &EnqueueOptions::default(),
    )
    .await
    .expect("enqueue");
    worker.run_once("metrics-0").await.expect("claim");

    enqueue_render_job(
        pipeline.queue.as_ref(),
        payload("metrics-ok"),
        None,
        &EnqueueOptions::default(),
    )
    .await
    .expect("enqueue duplicate");
    worker.run_once("metrics-0").await.expect("claim");

    pipeline.engine.set_behavior(FakeBehavior {
        crash: true,
        ..FakeBehavior::default()
    });
    enqueue_render_job(
        pipeline.queue.as_ref(),
        payload("metrics-crash"),
        None,
        &EnqueueOptions {
            max_attempts: 1,
            ..EnqueueOptions::default()
        },
    )
    .await
    .expect("enqueue crash");
    worker.run_once("metrics-0").await.expect("claim");

    let keys = recorded_keys();
    for expected in [
        "mailpress_render_attempts_total{route=auto_no_attachments}",
        "mailpress_render_success_total{route=auto_no_attachments}",
        "mailpress_render_skipped_total{route=auto_no_attachments}",
        "mailpress_render_failure_total{route=auto_no_attachments,kind=renderer_crash}",
    ] {
        assert!(keys.contains(expected), "missing metric: {expected}");
    }

    let names = names(&keys);
    for expected in [
        "mailpress_render_dead_letter_total",
        "mailpress_sanitize_ms",
        "mailpress_render_ms",
        "mailpress_output_bytes",
    ] {
        assert!(names.contains(expected), "missing metric: {expected}");
    }

    let snapshot = pipeline.metrics.snapshot();
    let route = snapshot.routes["auto_no_attachments"];
    assert_eq!(route.attempts, 3);
    assert_eq!(route.succeeded, 1);
    assert_eq!(route.skipped, 1);
    assert_eq!(route.failed, 1);
    assert_eq!(snapshot.dead_lettered, 1);
    assert_eq!(snapshot.recent_attempts, 3);
}

#[tokio::test]
#[serial]
async fn reporter_publishes_gauges_and_backlog_alerts() {
    snapshotter();
    let pipeline = Pipeline::new(FakeBehavior::default(), pool_config(1, 50));
    let reporter = pipeline.reporter(AlertThresholds {
        queue_depth: 2,
        ..AlertThresholds::default()
    });

    for index in 0..3 {
        enqueue_render_job(
            pipeline.queue.as_ref(),
            payload(&format!("backlog-{index}")),
            None,
            &EnqueueOptions::default(),
        )
        .await
        .expect("enqueue");
    }

    let report = reporter.report_once().await;

    assert_eq!(report.metrics.queue_depth, 3);
    assert_eq!(report.queue.map(|counts| counts.waiting), Some(3));
    assert!(matches!(
        report.alerts.as_slice(),
        [Alert::QueueBacklog {
            depth: 3,
            threshold: 2
        }]
    ));
    assert!(reporter.last_report().is_some());

    let keys = recorded_keys();
    for expected in [
        "mailpress_queue_depth",
        "mailpress_in_flight",
        "mailpress_pool_instances{state=available}",
        "mailpress_pool_instances{state=in_use}",
        "mailpress_alerts_total{alert=queue_backlog}",
    ] {
        assert!(keys.contains(expected), "missing metric: {expected}");
    }
}

#[tokio::test]
#[serial]
async fn enqueue_over_threshold_is_flagged_but_accepted() {
    snapshotter();
    let pipeline = Pipeline::new(FakeBehavior::default(), pool_config(1, 50));
    let options = EnqueueOptions {
        queue_depth_alert: 1,
        ..EnqueueOptions::default()
    };

    let first = enqueue_render_job(pipeline.queue.as_ref(), payload("a"), None, &options)
        .await
        .expect("enqueue");
    let second = enqueue_render_job(pipeline.queue.as_ref(), payload("b"), None, &options)
        .await
        .expect("enqueue");
    let third = enqueue_render_job(pipeline.queue.as_ref(), payload("c"), None, &options)
        .await
        .expect("enqueue past threshold");

    assert!(!first.depth.over_threshold);
    assert!(!second.depth.over_threshold);
    assert!(third.depth.over_threshold);
    assert_eq!(third.depth.depth, 2);

    assert!(recorded_keys().contains("mailpress_alerts_total{alert=queue_backlog}"));
}
