use std::{process, sync::Arc, time::Duration};

use mailpress::{
    application::{
        error::AppError,
        jobs::{JobBackend, RenderWorker, enqueue_render_job, wait_for_job_completion},
        metrics::{MetricsReporter, RenderMetrics},
        render::{AmmoniaSanitizer, RenderJobProcessor, RendererPool},
        repos::{DocumentStore, JobQueue},
    },
    config,
    domain::entities::RenderJobPayload,
    infra::{
        db::PostgresRepositories,
        error::InfraError,
        http::{self, HttpState},
        memory::{MemoryDocumentStore, MemoryJobQueue},
        renderer::{ChromiumEngine, ChromiumSettings},
        storage::DocumentStorage,
        telemetry,
    },
};
use tracing::{Dispatch, Level, dispatcher, error, info, warn};
use tracing_subscriber::fmt as tracing_fmt;

#[tokio::main]
async fn main() {
    if let Err(error) = run().await {
        report_application_error(&error);
        process::exit(1);
    }
}

fn report_application_error(error: &AppError) {
    if dispatcher::has_been_set() {
        error!(error = %error, "application error");
        return;
    }

    let subscriber = tracing_fmt().with_max_level(Level::ERROR).finish();
    let dispatch = Dispatch::new(subscriber);
    dispatcher::with_default(&dispatch, || {
        error!(error = %error, "application error");
    });
}

async fn run() -> Result<(), AppError> {
    let (cli_args, settings) = config::load_with_cli()
        .map_err(|err| AppError::unexpected(format!("failed to load configuration: {err}")))?;

    let command = cli_args
        .command
        .unwrap_or(config::Command::Serve(Box::<config::ServeArgs>::default()));

    telemetry::init(&settings.logging).map_err(AppError::from)?;

    match command {
        config::Command::Serve(_) => run_serve(settings).await,
        config::Command::Enqueue(args) => run_enqueue(settings, args).await,
        config::Command::Status(_) => run_status(settings).await,
    }
}

struct Backends {
    database: Option<PostgresRepositories>,
    jobs: JobBackend,
    documents: Arc<dyn DocumentStore>,
}

async fn init_backends(settings: &config::Settings) -> Result<Backends, AppError> {
    let storage = Arc::new(
        DocumentStorage::new(settings.storage.directory.clone()).map_err(InfraError::from)?,
    );

    let Some(database_url) = settings.database.url.as_ref() else {
        warn!(
            target = "mailpress::serve",
            "database url is not configured; using the in-memory queue"
        );
        return Ok(Backends {
            database: None,
            jobs: JobBackend::Memory(Arc::new(MemoryJobQueue::new())),
            documents: Arc::new(MemoryDocumentStore::with_storage(storage)),
        });
    };

    let repositories = connect_database(database_url, settings, storage).await?;
    Ok(Backends {
        database: Some(repositories.clone()),
        jobs: JobBackend::Postgres(Arc::new(repositories.clone())),
        documents: Arc::new(repositories),
    })
}

async fn connect_database(
    database_url: &str,
    settings: &config::Settings,
    storage: Arc<DocumentStorage>,
) -> Result<PostgresRepositories, AppError> {
    let pool = PostgresRepositories::connect(database_url, settings.database.max_connections.get())
        .await
        .map_err(InfraError::from)?;

    PostgresRepositories::run_migrations(&pool)
        .await
        .map_err(InfraError::from)?;

    Ok(PostgresRepositories::new(pool, storage))
}

async fn require_database(settings: &config::Settings) -> Result<PostgresRepositories, AppError> {
    let database_url = settings
        .database
        .url
        .as_ref()
        .ok_or_else(|| InfraError::configuration("database url is not configured"))?;

    let storage = Arc::new(
        DocumentStorage::new(settings.storage.directory.clone()).map_err(InfraError::from)?,
    );
    connect_database(database_url, settings, storage).await
}

async fn run_serve(settings: config::Settings) -> Result<(), AppError> {
    let backends = init_backends(&settings).await?;
    let queue = backends.jobs.queue();

    let engine = Arc::new(ChromiumEngine::new(ChromiumSettings {
        cli_path: settings.renderer.cli_path.clone(),
        scratch_dir: settings.renderer.scratch_dir.clone(),
        extra_args: settings.renderer.extra_args.clone(),
        window: settings.pool.viewport,
    }));
    let pool = RendererPool::new(engine, settings.pool.pool_config());
    let metrics = Arc::new(RenderMetrics::new(settings.metrics.sample_policy()));

    let processor = Arc::new(RenderJobProcessor::new(
        pool.clone(),
        Arc::new(AmmoniaSanitizer::new()),
        backends.documents.clone(),
        metrics.clone(),
        settings.processor.processor_settings(),
    ));
    let reporter = Arc::new(MetricsReporter::new(
        metrics,
        queue.clone(),
        pool.clone(),
        settings.metrics.alert_thresholds(&settings.jobs),
        settings.metrics.report_interval,
    ));
    let worker = Arc::new(RenderWorker::new(
        backends.jobs,
        processor,
        reporter.clone(),
        settings.jobs.worker_settings(),
    ));

    let warmed = worker.initialize().await;
    if warmed == 0 && settings.pool.prewarm > 0 {
        warn!(
            target = "mailpress::serve",
            cli_path = %settings.renderer.cli_path.display(),
            "no renderer instance could be pre-warmed; renders will retry launching lazily"
        );
    }

    let state = HttpState {
        database: backends.database,
        queue,
        pool,
        reporter,
    };
    let result = serve_http(&settings, state).await;

    worker.cleanup().await;
    info!(target = "mailpress::serve", "Shutdown complete");
    result
}

async fn serve_http(settings: &config::Settings, state: HttpState) -> Result<(), AppError> {
    let router = http::build_router(state);
    let listener = tokio::net::TcpListener::bind(settings.server.addr)
        .await
        .map_err(InfraError::from)?;

    info!(
        target = "mailpress::serve",
        addr = %settings.server.addr,
        "Listening for health and status requests"
    );

    axum::serve(listener, router.into_make_service())
        .with_graceful_shutdown(shutdown_signal(settings.server.graceful_shutdown))
        .await
        .map_err(|err| AppError::unexpected(format!("server error: {err}")))
}

async fn shutdown_signal(grace: Duration) {
    if let Err(err) = tokio::signal::ctrl_c().await {
        error!(
            target = "mailpress::serve",
            error = %err,
            "failed to listen for shutdown signal"
        );
        return;
    }

    info!(
        target = "mailpress::serve",
        grace_secs = grace.as_secs(),
        "Shutdown requested; draining in-flight requests"
    );
}

async fn run_enqueue(settings: config::Settings, args: config::EnqueueArgs) -> Result<(), AppError> {
    let repositories = require_database(&settings).await?;

    let raw = tokio::fs::read_to_string(&args.file)
        .await
        .map_err(InfraError::from)?;
    let payload: RenderJobPayload = serde_json::from_str(&raw).map_err(|err| {
        AppError::validation(format!(
            "`{}` is not a valid render payload: {err}",
            args.file.display()
        ))
    })?;

    let enqueued = enqueue_render_job(
        &repositories,
        payload,
        args.priority,
        &settings.jobs.enqueue_options(),
    )
    .await?;

    info!(
        target = "mailpress::enqueue",
        job_id = %enqueued.id,
        priority = enqueued.priority,
        depth = enqueued.depth.depth,
        "Render job enqueued"
    );

    let output = match args.wait {
        Some(seconds) => {
            let record =
                wait_for_job_completion(&repositories, &enqueued.id, Duration::from_secs(seconds))
                    .await?;
            serde_json::to_string_pretty(&record)
        }
        None => serde_json::to_string_pretty(&enqueued),
    }
    .map_err(|err| AppError::unexpected(err.to_string()))?;

    println!("{output}");
    Ok(())
}

async fn run_status(settings: config::Settings) -> Result<(), AppError> {
    let repositories = require_database(&settings).await?;
    let counts = repositories.counts().await?;

    let output =
        serde_json::to_string_pretty(&counts).map_err(|err| AppError::unexpected(err.to_string()))?;
    println!("{output}");
    Ok(())
}
