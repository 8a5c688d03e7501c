use std::sync::Once;

use metrics::{Unit, describe_counter, describe_gauge, describe_histogram};
use tracing_error::ErrorLayer;
use tracing_subscriber::{
    EnvFilter, fmt,
    layer::{Layer, SubscriberExt},
    util::SubscriberInitExt,
};

use crate::application::metrics::{
    METRIC_ALERTS, METRIC_DEAD_LETTER, METRIC_IN_FLIGHT, METRIC_OUTPUT_BYTES,
    METRIC_POOL_INSTANCES, METRIC_QUEUE_DEPTH, METRIC_RENDER_ATTEMPTS, METRIC_RENDER_FAILURE,
    METRIC_RENDER_MS, METRIC_RENDER_SKIPPED, METRIC_RENDER_SUCCESS, METRIC_SANITIZE_MS,
};
use crate::config::{LogFormat, LoggingSettings};

use super::error::InfraError;

static METRIC_DESCRIPTIONS: Once = Once::new();

/// Install a global tracing subscriber using the provided logging settings.
pub fn init(logging: &LoggingSettings) -> Result<(), InfraError> {
    describe_metrics();

    let env_filter = EnvFilter::builder()
        .with_default_directive(logging.level.into())
        .from_env_lossy();

    let fmt_layer = match logging.format {
        LogFormat::Json => fmt::layer()
            .json()
            .with_current_span(true)
            .with_span_list(true)
            .with_target(true)
            .boxed(),
        LogFormat::Compact => fmt::layer().compact().with_target(true).boxed(),
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(ErrorLayer::default())
        .with(fmt_layer)
        .try_init()
        .map_err(|err| {
            InfraError::telemetry(format!("failed to install tracing subscriber: {err}"))
        })
}

fn describe_metrics() {
    METRIC_DESCRIPTIONS.call_once(|| {
        describe_counter!(
            METRIC_RENDER_ATTEMPTS,
            Unit::Count,
            "Render attempts started, labelled by route."
        );
        describe_counter!(
            METRIC_RENDER_SUCCESS,
            Unit::Count,
            "Render attempts that stored a new document."
        );
        describe_counter!(
            METRIC_RENDER_SKIPPED,
            Unit::Count,
            "Render attempts skipped because the document already existed."
        );
        describe_counter!(
            METRIC_RENDER_FAILURE,
            Unit::Count,
            "Failed render attempts, labelled by route and error kind."
        );
        describe_counter!(
            METRIC_DEAD_LETTER,
            Unit::Count,
            "Jobs parked after exhausting their attempts."
        );
        describe_histogram!(
            METRIC_SANITIZE_MS,
            Unit::Milliseconds,
            "Time spent sanitizing the message body."
        );
        describe_histogram!(
            METRIC_RENDER_MS,
            Unit::Milliseconds,
            "Time spent producing the PDF, including waiting for a context."
        );
        describe_histogram!(
            METRIC_OUTPUT_BYTES,
            Unit::Bytes,
            "Size of every produced PDF."
        );
        describe_gauge!(
            METRIC_QUEUE_DEPTH,
            Unit::Count,
            "Jobs waiting or running at the last report."
        );
        describe_gauge!(
            METRIC_IN_FLIGHT,
            Unit::Count,
            "Render attempts currently executing."
        );
        describe_gauge!(
            METRIC_POOL_INSTANCES,
            Unit::Count,
            "Renderer instances, labelled by state (available or in_use)."
        );
        describe_counter!(
            METRIC_ALERTS,
            Unit::Count,
            "Alert conditions observed by the metrics reporter."
        );
    });
}
