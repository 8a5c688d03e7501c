//! In-process render metrics with rolling sample windows and alert rules.
//!
//! Counters are mirrored to the `metrics` facade as they change; gauges are
//! published by the [`MetricsReporter`] on every tick.

mod reporter;

use std::{
    collections::{BTreeMap, VecDeque},
    sync::{
        Arc, Mutex,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use metrics::{counter, histogram};
use serde::Serialize;

use crate::application::render::{RenderErrorKind, RenderOutcome};
use crate::domain::types::RenderRoute;
use crate::util::lock::mutex_lock;

pub use reporter::{MetricsReport, MetricsReporter};

const SOURCE: &str = "application::metrics";

pub const METRIC_RENDER_ATTEMPTS: &str = "mailpress_render_attempts_total";
pub const METRIC_RENDER_SUCCESS: &str = "mailpress_render_success_total";
pub const METRIC_RENDER_SKIPPED: &str = "mailpress_render_skipped_total";
pub const METRIC_RENDER_FAILURE: &str = "mailpress_render_failure_total";
pub const METRIC_DEAD_LETTER: &str = "mailpress_render_dead_letter_total";
pub const METRIC_SANITIZE_MS: &str = "mailpress_sanitize_ms";
pub const METRIC_RENDER_MS: &str = "mailpress_render_ms";
pub const METRIC_OUTPUT_BYTES: &str = "mailpress_output_bytes";
pub const METRIC_QUEUE_DEPTH: &str = "mailpress_queue_depth";
pub const METRIC_IN_FLIGHT: &str = "mailpress_in_flight";
pub const METRIC_POOL_INSTANCES: &str = "mailpress_pool_instances";
pub const METRIC_ALERTS: &str = "mailpress_alerts_total";

/// Bounds for the rolling sample windows.
///
/// Once a window grows past `cap` entries it is cut back to the most recent
/// `trim_to` entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SamplePolicy {
    pub cap: usize,
    pub trim_to: usize,
}

impl Default for SamplePolicy {
    fn default() -> Self {
        Self {
            cap: 100,
            trim_to: 50,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AlertThresholds {
    pub queue_depth: u64,
    pub failure_rate: f64,
    pub min_samples: usize,
    pub p95_render_ceiling: Duration,
}

impl Default for AlertThresholds {
    fn default() -> Self {
        Self {
            queue_depth: 500,
            failure_rate: 0.05,
            min_samples: 20,
            p95_render_ceiling: Duration::from_secs(6),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "alert", rename_all = "snake_case")]
pub enum Alert {
    QueueBacklog {
        depth: u64,
        threshold: u64,
    },
    FailureRate {
        rate: f64,
        threshold: f64,
        window: usize,
    },
    RenderLatency {
        p95_ms: f64,
        ceiling_ms: f64,
        samples: usize,
    },
}

impl Alert {
    pub fn name(&self) -> &'static str {
        match self {
            Alert::QueueBacklog { .. } => "queue_backlog",
            Alert::FailureRate { .. } => "failure_rate",
            Alert::RenderLatency { .. } => "render_latency",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RouteCounters {
    pub attempts: u64,
    pub succeeded: u64,
    pub skipped: u64,
    pub failed: u64,
}

/// Summary of one rolling window.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct SampleSummary {
    pub count: usize,
    pub p50: f64,
    pub p95: f64,
    pub max: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricsSnapshot {
    pub routes: BTreeMap<&'static str, RouteCounters>,
    pub failures_by_kind: BTreeMap<&'static str, u64>,
    pub dead_lettered: u64,
    pub queue_depth: u64,
    pub in_flight: u64,
    /// Failed share of the recent attempt window, `None` while empty.
    pub recent_failure_rate: Option<f64>,
    pub recent_attempts: usize,
    pub sanitize_ms: SampleSummary,
    pub render_ms: SampleSummary,
    pub output_bytes: SampleSummary,
}

#[derive(Debug)]
struct SampleWindow {
    values: VecDeque<f64>,
    policy: SamplePolicy,
}

impl SampleWindow {
    fn new(policy: SamplePolicy) -> Self {
        Self {
            values: VecDeque::with_capacity(policy.cap + 1),
            policy,
        }
    }

    fn push(&mut self, value: f64) {
        self.values.push_back(value);
        if self.values.len() > self.policy.cap {
            let excess = self.values.len() - self.policy.trim_to;
            self.values.drain(..excess);
        }
    }

    fn len(&self) -> usize {
        self.values.len()
    }

    fn sorted(&self) -> Vec<f64> {
        let mut values: Vec<f64> = self.values.iter().copied().collect();
        values.sort_by(f64::total_cmp);
        values
    }

    fn summary(&self) -> SampleSummary {
        let sorted = self.sorted();
        SampleSummary {
            count: sorted.len(),
            p50: percentile(&sorted, 0.50),
            p95: percentile(&sorted, 0.95),
            max: sorted.last().copied().unwrap_or_default(),
        }
    }
}

/// Nearest-rank percentile of an ascending slice. Empty input yields zero.
fn percentile(sorted: &[f64], quantile: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    let rank = (quantile * sorted.len() as f64).ceil() as usize;
    sorted[rank.clamp(1, sorted.len()) - 1]
}

#[derive(Debug)]
struct MetricsState {
    routes: BTreeMap<&'static str, RouteCounters>,
    failures_by_kind: BTreeMap<&'static str, u64>,
    dead_lettered: u64,
    /// 1.0 for a failed attempt, 0.0 otherwise.
    recent_outcomes: SampleWindow,
    sanitize_ms: SampleWindow,
    render_ms: SampleWindow,
    output_bytes: SampleWindow,
}

/// Shared render counters and rolling windows.
#[derive(Debug)]
pub struct RenderMetrics {
    state: Mutex<MetricsState>,
    in_flight: AtomicU64,
    queue_depth: AtomicU64,
}

impl Default for RenderMetrics {
    fn default() -> Self {
        Self::new(SamplePolicy::default())
    }
}

impl RenderMetrics {
    pub fn new(policy: SamplePolicy) -> Self {
        let routes = RenderRoute::ALL
            .into_iter()
            .map(|route| (route.as_str(), RouteCounters::default()))
            .collect();

        Self {
            state: Mutex::new(MetricsState {
                routes,
                failures_by_kind: BTreeMap::new(),
                dead_lettered: 0,
                recent_outcomes: SampleWindow::new(policy),
                sanitize_ms: SampleWindow::new(policy),
                render_ms: SampleWindow::new(policy),
                output_bytes: SampleWindow::new(policy),
            }),
            in_flight: AtomicU64::new(0),
            queue_depth: AtomicU64::new(0),
        }
    }

    /// Count an attempt for `route` and hold it as in flight until the
    /// returned guard is finished or dropped.
    pub fn begin_attempt(self: &Arc<Self>, route: RenderRoute) -> InFlightAttempt {
        {
            let mut state = mutex_lock(&self.state, SOURCE, "begin_attempt");
            state.routes.entry(route.as_str()).or_default().attempts += 1;
        }
        counter!(METRIC_RENDER_ATTEMPTS, "route" => route.as_str()).increment(1);
        self.in_flight.fetch_add(1, Ordering::Relaxed);

        InFlightAttempt {
            metrics: Arc::clone(self),
            route,
        }
    }

    fn record_outcome(&self, route: RenderRoute, outcome: &RenderOutcome) {
        let mut guard = mutex_lock(&self.state, SOURCE, "record_outcome");
        let state = &mut *guard;
        let counters = state.routes.entry(route.as_str()).or_default();
        let failed = match outcome {
            RenderOutcome::Created { .. } => {
                counters.succeeded += 1;
                counter!(METRIC_RENDER_SUCCESS, "route" => route.as_str()).increment(1);
                false
            }
            RenderOutcome::SkippedDuplicate { .. } => {
                counters.skipped += 1;
                counter!(METRIC_RENDER_SKIPPED, "route" => route.as_str()).increment(1);
                false
            }
            RenderOutcome::Failed(failure) => {
                counters.failed += 1;
                *state
                    .failures_by_kind
                    .entry(failure.kind.as_str())
                    .or_default() += 1;
                counter!(
                    METRIC_RENDER_FAILURE,
                    "route" => route.as_str(),
                    "kind" => failure.kind.as_str()
                )
                .increment(1);
                true
            }
        };
        state
            .recent_outcomes
            .push(if failed { 1.0 } else { 0.0 });
    }

    pub fn record_sanitize(&self, elapsed: Duration) {
        let ms = elapsed.as_secs_f64() * 1000.0;
        mutex_lock(&self.state, SOURCE, "record_sanitize")
            .sanitize_ms
            .push(ms);
        histogram!(METRIC_SANITIZE_MS).record(ms);
    }

    pub fn record_render(&self, elapsed: Duration) {
        let ms = elapsed.as_secs_f64() * 1000.0;
        mutex_lock(&self.state, SOURCE, "record_render")
            .render_ms
            .push(ms);
        histogram!(METRIC_RENDER_MS).record(ms);
    }

    pub fn record_output_size(&self, bytes: u64) {
        mutex_lock(&self.state, SOURCE, "record_output_size")
            .output_bytes
            .push(bytes as f64);
        histogram!(METRIC_OUTPUT_BYTES).record(bytes as f64);
    }

    pub fn record_dead_letter(&self) {
        mutex_lock(&self.state, SOURCE, "record_dead_letter").dead_lettered += 1;
        counter!(METRIC_DEAD_LETTER).increment(1);
    }

    pub fn set_queue_depth(&self, depth: u64) {
        self.queue_depth.store(depth, Ordering::Relaxed);
    }

    pub fn queue_depth(&self) -> u64 {
        self.queue_depth.load(Ordering::Relaxed)
    }

    pub fn in_flight(&self) -> u64 {
        self.in_flight.load(Ordering::Relaxed)
    }

    pub fn failures_of(&self, kind: RenderErrorKind) -> u64 {
        mutex_lock(&self.state, SOURCE, "failures_of")
            .failures_by_kind
            .get(kind.as_str())
            .copied()
            .unwrap_or_default()
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let state = mutex_lock(&self.state, SOURCE, "snapshot");
        let recent_attempts = state.recent_outcomes.len();
        let recent_failure_rate = (recent_attempts > 0).then(|| {
            state.recent_outcomes.values.iter().sum::<f64>() / recent_attempts as f64
        });

        MetricsSnapshot {
            routes: state.routes.clone(),
            failures_by_kind: state.failures_by_kind.clone(),
            dead_lettered: state.dead_lettered,
            queue_depth: self.queue_depth(),
            in_flight: self.in_flight(),
            recent_failure_rate,
            recent_attempts,
            sanitize_ms: state.sanitize_ms.summary(),
            render_ms: state.render_ms.summary(),
            output_bytes: state.output_bytes.summary(),
        }
    }

    /// Alert conditions that hold right now.
    pub fn evaluate_alerts(&self, thresholds: &AlertThresholds) -> Vec<Alert> {
        let snapshot = self.snapshot();
        let mut alerts = Vec::new();

        if snapshot.queue_depth > thresholds.queue_depth {
            alerts.push(Alert::QueueBacklog {
                depth: snapshot.queue_depth,
                threshold: thresholds.queue_depth,
            });
        }

        if snapshot.recent_attempts >= thresholds.min_samples
            && let Some(rate) = snapshot.recent_failure_rate
            && rate > thresholds.failure_rate
        {
            alerts.push(Alert::FailureRate {
                rate,
                threshold: thresholds.failure_rate,
                window: snapshot.recent_attempts,
            });
        }

        let ceiling_ms = thresholds.p95_render_ceiling.as_secs_f64() * 1000.0;
        if snapshot.render_ms.count >= thresholds.min_samples
            && snapshot.render_ms.p95 > ceiling_ms
        {
            alerts.push(Alert::RenderLatency {
                p95_ms: snapshot.render_ms.p95,
                ceiling_ms,
                samples: snapshot.render_ms.count,
            });
        }

        alerts
    }
}

/// One attempt counted as in flight.
///
/// Dropping the guard without [`finish`](Self::finish) (for example when the
/// worker task is aborted) still clears the in-flight count.
#[must_use = "finish the attempt to record its outcome"]
pub struct InFlightAttempt {
    metrics: Arc<RenderMetrics>,
    route: RenderRoute,
}

impl InFlightAttempt {
    pub fn finish(self, outcome: &RenderOutcome) {
        self.metrics.record_outcome(self.route, outcome);
    }
}

impl Drop for InFlightAttempt {
    fn drop(&mut self) {
        self.metrics.in_flight.fetch_sub(1, Ordering::Relaxed);
    }
}
