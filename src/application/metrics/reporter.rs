use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

use metrics::{counter, gauge};
use serde::Serialize;
use time::OffsetDateTime;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::application::render::{PoolStats, RendererPool};
use crate::application::repos::JobQueue;
use crate::domain::entities::QueueCounts;
use crate::util::lock::mutex_lock;

use super::{
    Alert, AlertThresholds, METRIC_ALERTS, METRIC_IN_FLIGHT, METRIC_POOL_INSTANCES,
    METRIC_QUEUE_DEPTH, MetricsSnapshot, RenderMetrics,
};

const SOURCE: &str = "application::metrics::reporter";

/// Point-in-time view published on every reporter tick.
#[derive(Debug, Clone, Serialize)]
pub struct MetricsReport {
    #[serde(with = "time::serde::rfc3339")]
    pub generated_at: OffsetDateTime,
    pub pool: PoolStats,
    /// `None` when the queue could not be read this tick.
    pub queue: Option<QueueCounts>,
    pub metrics: MetricsSnapshot,
    pub alerts: Vec<Alert>,
}

/// Periodically refreshes the queue depth, publishes gauges and logs alerts.
pub struct MetricsReporter {
    metrics: Arc<RenderMetrics>,
    queue: Arc<dyn JobQueue>,
    pool: RendererPool,
    thresholds: AlertThresholds,
    interval: Duration,
    last: Mutex<Option<MetricsReport>>,
}

impl MetricsReporter {
    pub fn new(
        metrics: Arc<RenderMetrics>,
        queue: Arc<dyn JobQueue>,
        pool: RendererPool,
        thresholds: AlertThresholds,
        interval: Duration,
    ) -> Self {
        Self {
            metrics,
            queue,
            pool,
            thresholds,
            interval,
            last: Mutex::new(None),
        }
    }

    pub fn metrics(&self) -> &Arc<RenderMetrics> {
        &self.metrics
    }

    pub fn thresholds(&self) -> &AlertThresholds {
        &self.thresholds
    }

    /// Most recent report, if a tick has run.
    pub fn last_report(&self) -> Option<MetricsReport> {
        mutex_lock(&self.last, SOURCE, "last_report").clone()
    }

    pub async fn report_once(&self) -> MetricsReport {
        let queue = match self.queue.counts().await {
            Ok(counts) => {
                self.metrics.set_queue_depth(counts.depth());
                Some(counts)
            }
            Err(err) => {
                warn!(
                    target = SOURCE,
                    op = "report_once",
                    result = "queue_unavailable",
                    error = %err,
                    "Failed to read queue counts; keeping previous depth"
                );
                None
            }
        };

        let pool = self.pool.stats();
        let snapshot = self.metrics.snapshot();
        let alerts = self.metrics.evaluate_alerts(&self.thresholds);

        gauge!(METRIC_QUEUE_DEPTH).set(snapshot.queue_depth as f64);
        gauge!(METRIC_IN_FLIGHT).set(snapshot.in_flight as f64);
        gauge!(METRIC_POOL_INSTANCES, "state" => "available").set(pool.available as f64);
        gauge!(METRIC_POOL_INSTANCES, "state" => "in_use").set(pool.in_use as f64);

        for alert in &alerts {
            counter!(METRIC_ALERTS, "alert" => alert.name()).increment(1);
            log_alert(alert);
        }

        info!(
            target = SOURCE,
            op = "report_once",
            queue_depth = snapshot.queue_depth,
            in_flight = snapshot.in_flight,
            pool_total = pool.total,
            pool_in_use = pool.in_use,
            recent_attempts = snapshot.recent_attempts,
            recent_failure_rate = snapshot.recent_failure_rate.unwrap_or_default(),
            render_p95_ms = snapshot.render_ms.p95,
            dead_lettered = snapshot.dead_lettered,
            alerts = alerts.len(),
            "Render pipeline metrics"
        );

        let report = MetricsReport {
            generated_at: OffsetDateTime::now_utc(),
            pool,
            queue,
            metrics: snapshot,
            alerts,
        };
        *mutex_lock(&self.last, SOURCE, "store_report") = Some(report.clone());
        report
    }

    /// Run [`report_once`](Self::report_once) every interval until the handle
    /// is aborted.
    pub fn spawn(self: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(self.interval);
            interval.tick().await;
            loop {
                interval.tick().await;
                self.report_once().await;
            }
        })
    }
}

fn log_alert(alert: &Alert) {
    match alert {
        Alert::QueueBacklog { depth, threshold } => warn!(
            target = SOURCE,
            alert = alert.name(),
            depth,
            threshold,
            "Render queue backlog above threshold"
        ),
        Alert::FailureRate {
            rate,
            threshold,
            window,
        } => warn!(
            target = SOURCE,
            alert = alert.name(),
            rate,
            threshold,
            window,
            "Render failure rate above threshold"
        ),
        Alert::RenderLatency {
            p95_ms,
            ceiling_ms,
            samples,
        } => warn!(
            target = SOURCE,
            alert = alert.name(),
            p95_ms,
            ceiling_ms,
            samples,
            "Render p95 latency above ceiling"
        ),
    }
}
