#![allow(dead_code)]

use std::{
    sync::{
        Arc, Mutex,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use mailpress::{
    application::{
        jobs::{JobBackend, RenderWorker, WorkerSettings},
        metrics::{AlertThresholds, MetricsReporter, RenderMetrics},
        render::{
            AmmoniaSanitizer, ContextOptions, EngineError, PdfOptions, PoolConfig,
            ProcessorSettings, RenderJobProcessor, RendererEngine, RendererInstance,
            RendererPool, RenderingContext, Viewport,
        },
    },
    domain::{entities::RenderJobPayload, types::RenderRoute},
    infra::memory::{MemoryDocumentStore, MemoryJobQueue},
};
use time::macros::datetime;

pub const OPERATION_TIMEOUT: Duration = Duration::from_millis(200);

/// What the scripted renderer does on `render_pdf`.
#[derive(Debug, Clone)]
pub struct FakeBehavior {
    pub render_delay: Duration,
    pub output_size: usize,
    pub crash: bool,
    pub panic: bool,
    pub fail_launch: bool,
}

impl Default for FakeBehavior {
    fn default() -> Self {
        Self {
            render_delay: Duration::ZERO,
            output_size: 1024,
            crash: false,
            panic: false,
            fail_launch: false,
        }
    }
}

#[derive(Debug, Default)]
pub struct EngineCounters {
    pub launched: AtomicUsize,
    pub closed: AtomicUsize,
    pub contexts_opened: AtomicUsize,
    pub contexts_closed: AtomicUsize,
    pub renders: AtomicUsize,
    pub active_contexts: AtomicUsize,
    pub peak_contexts: AtomicUsize,
}

impl EngineCounters {
    pub fn launched(&self) -> usize {
        self.launched.load(Ordering::SeqCst)
    }

    pub fn closed(&self) -> usize {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn contexts_opened(&self) -> usize {
        self.contexts_opened.load(Ordering::SeqCst)
    }

    pub fn contexts_closed(&self) -> usize {
        self.contexts_closed.load(Ordering::SeqCst)
    }

    pub fn renders(&self) -> usize {
        self.renders.load(Ordering::SeqCst)
    }

    pub fn active_contexts(&self) -> usize {
        self.active_contexts.load(Ordering::SeqCst)
    }

    pub fn peak_contexts(&self) -> usize {
        self.peak_contexts.load(Ordering::SeqCst)
    }
}

/// In-process renderer that counts every launch, context and close.
#[derive(Debug, Default)]
pub struct FakeEngine {
    behavior: Arc<Mutex<FakeBehavior>>,
    counters: Arc<EngineCounters>,
    pages: Arc<Mutex<Vec<String>>>,
}

impl FakeEngine {
    pub fn new(behavior: FakeBehavior) -> Self {
        Self {
            behavior: Arc::new(Mutex::new(behavior)),
            ..Self::default()
        }
    }

    pub fn counters(&self) -> &EngineCounters {
        &self.counters
    }

    pub fn set_behavior(&self, behavior: FakeBehavior) {
        *self.behavior.lock().expect("behavior lock") = behavior;
    }

    /// HTML handed to `set_content`, in call order.
    pub fn pages(&self) -> Vec<String> {
        self.pages.lock().expect("pages lock").clone()
    }

    fn behavior(&self) -> FakeBehavior {
        self.behavior.lock().expect("behavior lock").clone()
    }
}

#[async_trait]
impl RendererEngine for FakeEngine {
    async fn launch(&self) -> Result<Box<dyn RendererInstance>, EngineError> {
        if self.behavior().fail_launch {
            return Err(EngineError::Launch("scripted launch failure".into()));
        }
        self.counters.launched.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(FakeInstance {
            behavior: Arc::clone(&self.behavior),
            counters: Arc::clone(&self.counters),
            pages: Arc::clone(&self.pages),
        }))
    }
}

struct FakeInstance {
    behavior: Arc<Mutex<FakeBehavior>>,
    counters: Arc<EngineCounters>,
    pages: Arc<Mutex<Vec<String>>>,
}

#[async_trait]
impl RendererInstance for FakeInstance {
    async fn new_context(
        &self,
        options: &ContextOptions,
    ) -> Result<Box<dyn RenderingContext>, EngineError> {
        assert!(options.block_remote_requests, "contexts must block remote requests");
        self.counters.contexts_opened.fetch_add(1, Ordering::SeqCst);
        let active = self.counters.active_contexts.fetch_add(1, Ordering::SeqCst) + 1;
        self.counters.peak_contexts.fetch_max(active, Ordering::SeqCst);
        Ok(Box::new(FakeContext {
            behavior: Arc::clone(&self.behavior),
            counters: Arc::clone(&self.counters),
            pages: Arc::clone(&self.pages),
            closed: false,
        }))
    }

    async fn close(&self) -> Result<(), EngineError> {
        self.counters.closed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

struct FakeContext {
    behavior: Arc<Mutex<FakeBehavior>>,
    counters: Arc<EngineCounters>,
    pages: Arc<Mutex<Vec<String>>>,
    closed: bool,
}

#[async_trait]
impl RenderingContext for FakeContext {
    async fn set_content(&mut self, html: &str) -> Result<(), EngineError> {
        self.pages.lock().expect("pages lock").push(html.to_owned());
        Ok(())
    }

    async fn render_pdf(&mut self, _options: &PdfOptions) -> Result<Vec<u8>, EngineError> {
        let behavior = self.behavior.lock().expect("behavior lock").clone();
        self.counters.renders.fetch_add(1, Ordering::SeqCst);

        if !behavior.render_delay.is_zero() {
            tokio::time::sleep(behavior.render_delay).await;
        }
        if behavior.panic {
            panic!("scripted renderer panic");
        }
        if behavior.crash {
            return Err(EngineError::Crashed("scripted crash".into()));
        }

        let mut pdf = b"%PDF-1.7\n".to_vec();
        pdf.resize(behavior.output_size.max(pdf.len()), b' ');
        Ok(pdf)
    }

    async fn close(&mut self) -> Result<(), EngineError> {
        if !self.closed {
            self.closed = true;
            self.counters.contexts_closed.fetch_add(1, Ordering::SeqCst);
            self.counters.active_contexts.fetch_sub(1, Ordering::SeqCst);
        }
        Ok(())
    }
}

pub fn pool_config(max_concurrency: usize, recycle_after: u32) -> PoolConfig {
    PoolConfig {
        max_concurrency,
        recycle_after,
        prewarm: 1,
        context: ContextOptions {
            viewport: Viewport {
                width: 800,
                height: 600,
            },
            block_remote_requests: true,
            operation_timeout: OPERATION_TIMEOUT,
        },
    }
}

pub fn payload(message_id: &str) -> RenderJobPayload {
    RenderJobPayload {
        tenant_id: "tenant-a".into(),
        message_id: message_id.into(),
        subject: "Quarterly report".into(),
        sender: "alice@example.com".into(),
        recipients: vec!["bob@example.com".into()],
        received_at: datetime!(2024-03-05 09:30 UTC),
        html_body: Some("<p>Hello <b>Bob</b></p>".into()),
        text_body: None,
        attachment_ids: Vec::new(),
        category_hint: None,
        tag_hints: Vec::new(),
        route: RenderRoute::AutoNoAttachments,
    }
}

/// Processor wired to a fake engine and the in-memory adapters.
pub struct Pipeline {
    pub engine: Arc<FakeEngine>,
    pub pool: RendererPool,
    pub documents: Arc<MemoryDocumentStore>,
    pub queue: Arc<MemoryJobQueue>,
    pub metrics: Arc<RenderMetrics>,
    pub processor: Arc<RenderJobProcessor>,
}

impl Pipeline {
    pub fn new(behavior: FakeBehavior, config: PoolConfig) -> Self {
        Self::with_settings(behavior, config, ProcessorSettings::default())
    }

    pub fn with_settings(
        behavior: FakeBehavior,
        config: PoolConfig,
        settings: ProcessorSettings,
    ) -> Self {
        let engine = Arc::new(FakeEngine::new(behavior));
        let pool = RendererPool::new(engine.clone(), config);
        let documents = Arc::new(MemoryDocumentStore::new());
        let metrics = Arc::new(RenderMetrics::default());
        let processor = Arc::new(RenderJobProcessor::new(
            pool.clone(),
            Arc::new(AmmoniaSanitizer::new()),
            documents.clone(),
            metrics.clone(),
            settings,
        ));

        Self {
            engine,
            pool,
            documents,
            queue: Arc::new(MemoryJobQueue::new()),
            metrics,
            processor,
        }
    }

    pub fn reporter(&self, thresholds: AlertThresholds) -> Arc<MetricsReporter> {
        Arc::new(MetricsReporter::new(
            self.metrics.clone(),
            self.queue.clone(),
            self.pool.clone(),
            thresholds,
            Duration::from_secs(60),
        ))
    }

    /// Worker with no backoff and a short poll interval.
    pub fn worker(&self) -> Arc<RenderWorker> {
        Arc::new(RenderWorker::new(
            JobBackend::Memory(self.queue.clone()),
            self.processor.clone(),
            self.reporter(AlertThresholds::default()),
            WorkerSettings {
                name: "test".into(),
                poll_interval: Duration::from_millis(10),
                backoff_base: Duration::ZERO,
                ..WorkerSettings::default()
            },
        ))
    }
}
