//! Turns one job payload into a stored PDF.
//!
//! Order of operations: body check, idempotency check, sanitisation, render
//! inside a leased context, size check, persistence. A context is only leased
//! once the payload is known to be renderable and new, and it is always
//! handed back before this module returns.

use std::{
    any::Any,
    panic::AssertUnwindSafe,
    sync::Arc,
    time::{Duration, Instant},
};

use bytes::Bytes;
use futures::FutureExt;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use crate::application::metrics::RenderMetrics;
use crate::application::repos::{DocumentStore, RepoError};
use crate::domain::entities::{NewDocument, RenderJobPayload};
use crate::util::bytes::format_bytes;

use super::document::{DocumentBody, compose_document, document_title};
use super::engine::PdfOptions;
use super::pool::{ContextLease, RendererPool};
use super::sanitize::HtmlSanitizer;
use super::types::{RenderError, RenderFailure, RenderOutcome};

const SOURCE: &str = "application::render::processor";

pub const DEFAULT_MAX_OUTPUT_BYTES: u64 = 10 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessorSettings {
    pub max_output_bytes: u64,
}

impl Default for ProcessorSettings {
    fn default() -> Self {
        Self {
            max_output_bytes: DEFAULT_MAX_OUTPUT_BYTES,
        }
    }
}

pub struct RenderJobProcessor {
    pool: RendererPool,
    sanitizer: Arc<dyn HtmlSanitizer>,
    documents: Arc<dyn DocumentStore>,
    metrics: Arc<RenderMetrics>,
    settings: ProcessorSettings,
}

impl RenderJobProcessor {
    pub fn new(
        pool: RendererPool,
        sanitizer: Arc<dyn HtmlSanitizer>,
        documents: Arc<dyn DocumentStore>,
        metrics: Arc<RenderMetrics>,
        settings: ProcessorSettings,
    ) -> Self {
        Self {
            pool,
            sanitizer,
            documents,
            metrics,
            settings,
        }
    }

    pub fn pool(&self) -> &RendererPool {
        &self.pool
    }

    pub fn metrics(&self) -> &Arc<RenderMetrics> {
        &self.metrics
    }

    /// Process a payload. Never panics and never returns early without
    /// releasing a leased context; every failure is folded into
    /// [`RenderOutcome::Failed`].
    pub async fn process(&self, payload: &RenderJobPayload) -> RenderOutcome {
        let started_at = Instant::now();
        let outcome = match self.run(payload).await {
            Ok(outcome) => outcome,
            Err(err) => RenderOutcome::Failed(RenderFailure::from(err)),
        };

        match &outcome {
            RenderOutcome::Created {
                document_id,
                size_bytes,
            } => info!(
                target = SOURCE,
                op = "process",
                result = "created",
                tenant_id = %payload.tenant_id,
                message_id = %payload.message_id,
                route = payload.route.as_str(),
                document_id = %document_id,
                size = %format_bytes(*size_bytes),
                elapsed_ms = elapsed_ms(started_at),
                "Email rendered to PDF"
            ),
            RenderOutcome::SkippedDuplicate { document_id } => info!(
                target = SOURCE,
                op = "process",
                result = "skipped_duplicate",
                tenant_id = %payload.tenant_id,
                message_id = %payload.message_id,
                document_id = %document_id,
                "Document already exists; skipping render"
            ),
            RenderOutcome::Failed(failure) => warn!(
                target = SOURCE,
                op = "process",
                result = "failed",
                tenant_id = %payload.tenant_id,
                message_id = %payload.message_id,
                kind = failure.kind.as_str(),
                retryable = failure.retryable,
                error = %failure.message,
                elapsed_ms = elapsed_ms(started_at),
                "Email render failed"
            ),
        }

        outcome
    }

    async fn run(&self, payload: &RenderJobPayload) -> Result<RenderOutcome, RenderError> {
        if !payload.has_body() {
            return Err(RenderError::BodyMissing);
        }

        if let Some(document_id) = self
            .documents
            .find_existing(&payload.tenant_id, &payload.message_id)
            .await
            .map_err(persistence_failure)?
        {
            return Ok(RenderOutcome::SkippedDuplicate { document_id });
        }

        let sanitize_started = Instant::now();
        let body = match (payload.html(), payload.text()) {
            (Some(html), _) => DocumentBody::Html(self.sanitizer.sanitize(html)),
            (None, Some(text)) => DocumentBody::Plain(text.to_owned()),
            (None, None) => return Err(RenderError::BodyMissing),
        };
        self.metrics.record_sanitize(sanitize_started.elapsed());

        let document = compose_document(payload, &body)?;
        let options = PdfOptions {
            print_background: true,
            title: document_title(payload).to_owned(),
        };

        let render_started = Instant::now();
        let pdf = self.render(&document, &options).await?;
        self.metrics.record_render(render_started.elapsed());

        let size_bytes = pdf.len() as u64;
        self.metrics.record_output_size(size_bytes);
        if size_bytes > self.settings.max_output_bytes {
            return Err(RenderError::OutputTooLarge {
                size_bytes,
                limit_bytes: self.settings.max_output_bytes,
            });
        }

        self.persist(payload, Bytes::from(pdf), size_bytes).await
    }

    /// Lease a context, render, and hand the context back on every path,
    /// panics included.
    async fn render(&self, html: &str, options: &PdfOptions) -> Result<Vec<u8>, RenderError> {
        let mut lease = self.pool.acquire_context().await?;
        let operation_timeout = self.pool.config().operation_timeout();

        let result = AssertUnwindSafe(render_in(&mut lease, html, options, operation_timeout))
            .catch_unwind()
            .await
            .unwrap_or_else(|panic| {
                error!(
                    target = SOURCE,
                    op = "render",
                    result = "panic",
                    instance_id = ?lease.instance_id(),
                    "Renderer panicked mid-render"
                );
                Err(RenderError::RendererCrash(panic_message(panic.as_ref())))
            });

        if result.is_err() {
            lease.mark_failed();
        }
        self.pool.release_context(lease).await;
        result
    }

    async fn persist(
        &self,
        payload: &RenderJobPayload,
        pdf: Bytes,
        size_bytes: u64,
    ) -> Result<RenderOutcome, RenderError> {
        match self
            .documents
            .create_document(NewDocument::from_payload(payload, pdf))
            .await
        {
            Ok(stored) => Ok(RenderOutcome::Created {
                document_id: stored.id,
                size_bytes,
            }),
            Err(RepoError::Duplicate { constraint }) => {
                debug!(
                    target = SOURCE,
                    op = "persist",
                    result = "duplicate_race",
                    constraint = %constraint,
                    tenant_id = %payload.tenant_id,
                    message_id = %payload.message_id,
                    "Concurrent delivery stored the document first"
                );
                let winner = self
                    .documents
                    .find_existing(&payload.tenant_id, &payload.message_id)
                    .await
                    .map_err(persistence_failure)?;
                winner
                    .map(|document_id| RenderOutcome::SkippedDuplicate { document_id })
                    .ok_or_else(|| {
                        RenderError::PersistenceFailure(format!(
                            "unique constraint `{constraint}` hit but no document found"
                        ))
                    })
            }
            Err(err) => Err(persistence_failure(err)),
        }
    }
}

async fn render_in(
    lease: &mut ContextLease,
    html: &str,
    options: &PdfOptions,
    operation_timeout: Duration,
) -> Result<Vec<u8>, RenderError> {
    timeout(operation_timeout, lease.set_content(html))
        .await
        .map_err(|_| RenderError::RenderTimeout(operation_timeout))??;

    let pdf = timeout(operation_timeout, lease.render_pdf(options))
        .await
        .map_err(|_| RenderError::RenderTimeout(operation_timeout))??;
    Ok(pdf)
}

fn persistence_failure(err: RepoError) -> RenderError {
    RenderError::PersistenceFailure(err.to_string())
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        format!("panic: {message}")
    } else if let Some(message) = panic.downcast_ref::<String>() {
        format!("panic: {message}")
    } else {
        "panic with non-string payload".to_owned()
    }
}

fn elapsed_ms(started_at: Instant) -> u64 {
    u64::try_from(started_at.elapsed().as_millis()).unwrap_or(u64::MAX)
}
