//! Configuration layer: typed settings with layered precedence (file → env → CLI).

use std::{
    net::SocketAddr,
    num::{NonZeroU32, NonZeroU64},
    path::PathBuf,
    str::FromStr,
    time::Duration,
};

use clap::{Args, Parser, Subcommand, ValueHint, builder::BoolishValueParser};
use config::{Config, Environment, File};
use serde::Deserialize;
use thiserror::Error;
use tracing::level_filters::LevelFilter;

use crate::application::{
    jobs::{EnqueueOptions, WorkerSettings},
    metrics::{AlertThresholds, SamplePolicy},
    render::{ContextOptions, PoolConfig, ProcessorSettings, Viewport},
};

const DEFAULT_CONFIG_BASENAME: &str = "config/default";
const LOCAL_CONFIG_BASENAME: &str = "mailpress";
const DEFAULT_HOST: &str = "127.0.0.1";
const DEFAULT_PORT: u16 = 3100;
const DEFAULT_GRACEFUL_SHUTDOWN_SECS: u64 = 30;
const DEFAULT_DB_MAX_CONNECTIONS: u32 = 8;
const DEFAULT_POOL_MAX_CONCURRENCY: u32 = 2;
const DEFAULT_POOL_RECYCLE_AFTER: u32 = 50;
const DEFAULT_POOL_PREWARM: u32 = 1;
const DEFAULT_OPERATION_TIMEOUT_MS: u64 = 8_000;
const DEFAULT_VIEWPORT_WIDTH: u32 = 800;
const DEFAULT_VIEWPORT_HEIGHT: u32 = 600;
const DEFAULT_RENDERER_CLI_PATH: &str = "chromium";
const DEFAULT_RENDERER_SCRATCH_DIR: &str = "mailpress-renderer";
const DEFAULT_JOB_MAX_ATTEMPTS: u32 = 3;
const DEFAULT_JOB_BACKOFF_BASE_MS: u64 = 1_000;
const DEFAULT_JOB_POLL_INTERVAL_MS: u64 = 500;
const DEFAULT_JOB_QUEUE_DEPTH_ALERT: u64 = 500;
const DEFAULT_JOB_LEASE_TIMEOUT_SECS: u64 = 600;
const DEFAULT_MAX_OUTPUT_BYTES: u64 = 10 * 1024 * 1024;
const DEFAULT_REPORT_INTERVAL_SECS: u64 = 30;
const DEFAULT_FAILURE_RATE_THRESHOLD: f64 = 0.05;
const DEFAULT_MIN_SAMPLES: u32 = 20;
const DEFAULT_P95_RENDER_CEILING_MS: u64 = 6_000;
const DEFAULT_SAMPLE_CAP: u32 = 100;
const DEFAULT_SAMPLE_TRIM_TO: u32 = 50;
const DEFAULT_STORAGE_DIR: &str = "documents";

/// Command-line arguments for the mailpress binary.
#[derive(Debug, Parser)]
#[command(
    name = "mailpress",
    version,
    about = "Render inbound email bodies into PDF documents"
)]
pub struct CliArgs {
    /// Optional path to a configuration file.
    #[arg(
        long = "config-file",
        env = "MAILPRESS_CONFIG_FILE",
        value_name = "PATH"
    )]
    pub config_file: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Debug, Subcommand, Clone)]
pub enum Command {
    /// Run the render worker and the health/status listener.
    Serve(Box<ServeArgs>),
    /// Submit a render job read from a JSON payload file.
    Enqueue(EnqueueArgs),
    /// Print queue counts as JSON.
    Status(StatusArgs),
}

#[derive(Debug, Args, Default, Clone)]
pub struct DatabaseOverride {
    /// Override the database connection URL.
    #[arg(long = "database-url", value_name = "URL")]
    pub database_url: Option<String>,
}

#[derive(Debug, Args, Default, Clone)]
pub struct ServeArgs {
    #[command(flatten)]
    pub overrides: ServeOverrides,
}

#[derive(Debug, Args, Default, Clone)]
pub struct ServeOverrides {
    #[command(flatten)]
    pub database: DatabaseOverride,

    /// Override the listener host.
    #[arg(long = "server-host", value_name = "HOST")]
    pub server_host: Option<String>,

    /// Override the listener port.
    #[arg(long = "server-port", value_name = "PORT")]
    pub server_port: Option<u16>,

    /// Override the base log level (trace|debug|info|warn|error).
    #[arg(long = "log-level", value_name = "LEVEL")]
    pub log_level: Option<String>,

    /// Toggle JSON logging.
    #[arg(
        long = "log-json",
        value_name = "BOOL",
        value_parser = BoolishValueParser::new()
    )]
    pub log_json: Option<bool>,

    /// Override the number of renderer instances (and worker slots).
    #[arg(long = "pool-max-concurrency", value_name = "COUNT")]
    pub pool_max_concurrency: Option<u32>,

    /// Override how many renders an instance serves before it is replaced.
    #[arg(long = "pool-recycle-after", value_name = "COUNT")]
    pub pool_recycle_after: Option<u32>,

    /// Override the renderer executable.
    #[arg(long = "renderer-cli-path", value_name = "PATH")]
    pub renderer_cli_path: Option<PathBuf>,

    /// Override the directory that holds renderer profiles.
    #[arg(long = "renderer-scratch-dir", value_name = "PATH")]
    pub renderer_scratch_dir: Option<PathBuf>,

    /// Override where rendered PDFs are written.
    #[arg(long = "storage-directory", value_name = "PATH")]
    pub storage_directory: Option<PathBuf>,

    /// Override the metrics report interval.
    #[arg(long = "metrics-report-interval-seconds", value_name = "SECONDS")]
    pub metrics_report_interval_seconds: Option<u64>,
}

#[derive(Debug, Args, Clone)]
pub struct EnqueueArgs {
    #[command(flatten)]
    pub database: DatabaseOverride,

    /// JSON file holding the render job payload.
    #[arg(value_name = "FILE", value_hint = ValueHint::FilePath)]
    pub file: PathBuf,

    /// Queue priority; higher values are claimed first.
    #[arg(long, value_name = "N", allow_negative_numbers = true)]
    pub priority: Option<i32>,

    /// Block until the job finishes or the timeout elapses.
    #[arg(long, value_name = "SECONDS")]
    pub wait: Option<u64>,
}

#[derive(Debug, Args, Default, Clone)]
pub struct StatusArgs {
    #[command(flatten)]
    pub database: DatabaseOverride,
}

/// Fully-resolved deployment settings after precedence resolution and validation.
#[derive(Debug, Clone)]
pub struct Settings {
    pub server: ServerSettings,
    pub logging: LoggingSettings,
    pub database: DatabaseSettings,
    pub pool: PoolSettings,
    pub renderer: RendererSettings,
    pub jobs: JobsSettings,
    pub processor: ProcessorLimits,
    pub metrics: MetricsSettings,
    pub storage: StorageSettings,
}

#[derive(Debug, Clone)]
pub struct ServerSettings {
    pub addr: SocketAddr,
    pub graceful_shutdown: Duration,
}

#[derive(Debug, Clone)]
pub struct LoggingSettings {
    pub level: LevelFilter,
    pub format: LogFormat,
}

#[derive(Debug, Clone, Copy)]
pub enum LogFormat {
    Json,
    Compact,
}

#[derive(Debug, Clone)]
pub struct DatabaseSettings {
    pub url: Option<String>,
    pub max_connections: NonZeroU32,
}

#[derive(Debug, Clone)]
pub struct PoolSettings {
    pub max_concurrency: NonZeroU32,
    pub recycle_after: NonZeroU32,
    /// Already clamped to `max_concurrency`.
    pub prewarm: u32,
    pub operation_timeout: Duration,
    pub viewport: Viewport,
}

#[derive(Debug, Clone)]
pub struct RendererSettings {
    pub cli_path: PathBuf,
    pub scratch_dir: PathBuf,
    pub extra_args: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct JobsSettings {
    pub max_attempts: NonZeroU32,
    pub backoff_base: Duration,
    pub poll_interval: Duration,
    pub queue_depth_alert: u64,
    pub lease_timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct ProcessorLimits {
    pub max_output_bytes: NonZeroU64,
}

#[derive(Debug, Clone)]
pub struct MetricsSettings {
    pub report_interval: Duration,
    pub failure_rate_threshold: f64,
    pub min_samples: u32,
    pub p95_render_ceiling: Duration,
    pub sample_cap: NonZeroU32,
    pub sample_trim_to: NonZeroU32,
}

#[derive(Debug, Clone)]
pub struct StorageSettings {
    pub directory: PathBuf,
}

impl PoolSettings {
    pub fn pool_config(&self) -> PoolConfig {
        PoolConfig {
            max_concurrency: self.max_concurrency.get() as usize,
            recycle_after: self.recycle_after.get(),
            prewarm: self.prewarm as usize,
            context: ContextOptions {
                viewport: self.viewport,
                block_remote_requests: true,
                operation_timeout: self.operation_timeout,
            },
        }
    }
}

impl JobsSettings {
    pub fn enqueue_options(&self) -> EnqueueOptions {
        EnqueueOptions {
            max_attempts: i32::try_from(self.max_attempts.get()).unwrap_or(i32::MAX),
            queue_depth_alert: self.queue_depth_alert,
        }
    }

    pub fn worker_settings(&self) -> WorkerSettings {
        WorkerSettings {
            poll_interval: self.poll_interval,
            backoff_base: self.backoff_base,
            lease_timeout: self.lease_timeout,
            ..WorkerSettings::default()
        }
    }
}

impl ProcessorLimits {
    pub fn processor_settings(&self) -> ProcessorSettings {
        ProcessorSettings {
            max_output_bytes: self.max_output_bytes.get(),
        }
    }
}

impl MetricsSettings {
    pub fn sample_policy(&self) -> SamplePolicy {
        SamplePolicy {
            cap: self.sample_cap.get() as usize,
            trim_to: self.sample_trim_to.get() as usize,
        }
    }

    pub fn alert_thresholds(&self, jobs: &JobsSettings) -> AlertThresholds {
        AlertThresholds {
            queue_depth: jobs.queue_depth_alert,
            failure_rate: self.failure_rate_threshold,
            min_samples: self.min_samples as usize,
            p95_render_ceiling: self.p95_render_ceiling,
        }
    }
}

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("failed to build configuration: {0}")]
    Build(#[from] config::ConfigError),
    #[error("invalid configuration for `{key}`: {reason}")]
    Invalid { key: &'static str, reason: String },
}

impl LoadError {
    fn invalid(key: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            key,
            reason: reason.into(),
        }
    }
}

/// Load settings using the configured precedence (file → environment → CLI).
pub fn load(cli: &CliArgs) -> Result<Settings, LoadError> {
    let mut builder = Config::builder()
        .add_source(File::with_name(DEFAULT_CONFIG_BASENAME).required(false))
        .add_source(File::with_name(LOCAL_CONFIG_BASENAME).required(false));

    if let Some(path) = cli.config_file.as_ref() {
        builder = builder.add_source(File::from(path.as_path()).required(true));
    }

    builder = builder.add_source(
        Environment::with_prefix("MAILPRESS")
            .separator("__")
            .list_separator(",")
            .with_list_parse_key("renderer.extra_args")
            .try_parsing(true),
    );

    let mut raw: RawSettings = builder.build()?.try_deserialize()?;

    match cli.command.as_ref() {
        Some(Command::Serve(args)) => raw.apply_serve_overrides(&args.overrides),
        Some(Command::Enqueue(args)) => raw.apply_database_override(&args.database),
        Some(Command::Status(args)) => raw.apply_database_override(&args.database),
        None => raw.apply_serve_overrides(&ServeOverrides::default()),
    }

    Settings::from_raw(raw)
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawSettings {
    server: RawServerSettings,
    logging: RawLoggingSettings,
    database: RawDatabaseSettings,
    pool: RawPoolSettings,
    renderer: RawRendererSettings,
    jobs: RawJobsSettings,
    processor: RawProcessorSettings,
    metrics: RawMetricsSettings,
    storage: RawStorageSettings,
}

impl RawSettings {
    fn apply_serve_overrides(&mut self, overrides: &ServeOverrides) {
        self.apply_database_override(&overrides.database);

        if let Some(host) = overrides.server_host.as_ref() {
            self.server.host = Some(host.clone());
        }
        if let Some(port) = overrides.server_port {
            self.server.port = Some(port);
        }
        if let Some(level) = overrides.log_level.as_ref() {
            self.logging.level = Some(level.clone());
        }
        if let Some(json) = overrides.log_json {
            self.logging.json = Some(json);
        }
        if let Some(value) = overrides.pool_max_concurrency {
            self.pool.max_concurrency = Some(value);
        }
        if let Some(value) = overrides.pool_recycle_after {
            self.pool.recycle_after_renders = Some(value);
        }
        if let Some(path) = overrides.renderer_cli_path.as_ref() {
            self.renderer.cli_path = Some(path.clone());
        }
        if let Some(dir) = overrides.renderer_scratch_dir.as_ref() {
            self.renderer.scratch_dir = Some(dir.clone());
        }
        if let Some(dir) = overrides.storage_directory.as_ref() {
            self.storage.directory = Some(dir.clone());
        }
        if let Some(seconds) = overrides.metrics_report_interval_seconds {
            self.metrics.report_interval_secs = Some(seconds);
        }
    }

    fn apply_database_override(&mut self, overrides: &DatabaseOverride) {
        if let Some(url) = overrides.database_url.as_ref() {
            self.database.url = Some(url.clone());
        }
    }
}

impl Settings {
    fn from_raw(raw: RawSettings) -> Result<Self, LoadError> {
        let RawSettings {
            server,
            logging,
            database,
            pool,
            renderer,
            jobs,
            processor,
            metrics,
            storage,
        } = raw;

        Ok(Self {
            server: build_server_settings(server)?,
            logging: build_logging_settings(logging)?,
            database: build_database_settings(database)?,
            pool: build_pool_settings(pool)?,
            renderer: build_renderer_settings(renderer)?,
            jobs: build_jobs_settings(jobs)?,
            processor: build_processor_settings(processor)?,
            metrics: build_metrics_settings(metrics)?,
            storage: build_storage_settings(storage)?,
        })
    }
}

fn build_server_settings(server: RawServerSettings) -> Result<ServerSettings, LoadError> {
    let host = server.host.unwrap_or_else(|| DEFAULT_HOST.to_string());
    let port = server.port.unwrap_or(DEFAULT_PORT);
    if port == 0 {
        return Err(LoadError::invalid(
            "server.port",
            "port must be greater than zero",
        ));
    }

    let addr = parse_socket_addr(&host, port)
        .map_err(|reason| LoadError::invalid("server.addr", reason))?;

    let graceful_secs = server
        .graceful_shutdown_seconds
        .unwrap_or(DEFAULT_GRACEFUL_SHUTDOWN_SECS);
    if graceful_secs == 0 {
        return Err(LoadError::invalid(
            "server.graceful_shutdown_seconds",
            "must be greater than zero",
        ));
    }

    Ok(ServerSettings {
        addr,
        graceful_shutdown: Duration::from_secs(graceful_secs),
    })
}

fn build_logging_settings(logging: RawLoggingSettings) -> Result<LoggingSettings, LoadError> {
    let level = match logging.level {
        Some(level) => LevelFilter::from_str(level.as_str()).map_err(|err| {
            LoadError::invalid("logging.level", format!("failed to parse: {err}"))
        })?,
        None => LevelFilter::INFO,
    };

    let format = if logging.json.unwrap_or(false) {
        LogFormat::Json
    } else {
        LogFormat::Compact
    };

    Ok(LoggingSettings { level, format })
}

fn build_database_settings(database: RawDatabaseSettings) -> Result<DatabaseSettings, LoadError> {
    let url = database.url.and_then(|value| {
        let trimmed = value.trim();
        (!trimmed.is_empty()).then(|| trimmed.to_string())
    });

    let max_connections = non_zero_u32(
        database
            .max_connections
            .unwrap_or(DEFAULT_DB_MAX_CONNECTIONS)
            .into(),
        "database.max_connections",
    )?;

    Ok(DatabaseSettings {
        url,
        max_connections,
    })
}

fn build_pool_settings(pool: RawPoolSettings) -> Result<PoolSettings, LoadError> {
    let max_concurrency = non_zero_u32(
        pool.max_concurrency
            .unwrap_or(DEFAULT_POOL_MAX_CONCURRENCY)
            .into(),
        "pool.max_concurrency",
    )?;
    let recycle_after = non_zero_u32(
        pool.recycle_after_renders
            .unwrap_or(DEFAULT_POOL_RECYCLE_AFTER)
            .into(),
        "pool.recycle_after_renders",
    )?;
    let prewarm = pool
        .prewarm_instances
        .unwrap_or(DEFAULT_POOL_PREWARM)
        .min(max_concurrency.get());

    let timeout_ms = pool
        .operation_timeout_ms
        .unwrap_or(DEFAULT_OPERATION_TIMEOUT_MS);
    if timeout_ms == 0 {
        return Err(LoadError::invalid(
            "pool.operation_timeout_ms",
            "must be greater than zero",
        ));
    }

    let width = non_zero_u32(
        pool.viewport_width.unwrap_or(DEFAULT_VIEWPORT_WIDTH).into(),
        "pool.viewport_width",
    )?;
    let height = non_zero_u32(
        pool.viewport_height
            .unwrap_or(DEFAULT_VIEWPORT_HEIGHT)
            .into(),
        "pool.viewport_height",
    )?;

    Ok(PoolSettings {
        max_concurrency,
        recycle_after,
        prewarm,
        operation_timeout: Duration::from_millis(timeout_ms),
        viewport: Viewport {
            width: width.get(),
            height: height.get(),
        },
    })
}

fn build_renderer_settings(renderer: RawRendererSettings) -> Result<RendererSettings, LoadError> {
    let cli_path = renderer
        .cli_path
        .unwrap_or_else(|| PathBuf::from(DEFAULT_RENDERER_CLI_PATH));
    if cli_path.as_os_str().is_empty() {
        return Err(LoadError::invalid(
            "renderer.cli_path",
            "path must not be empty",
        ));
    }

    let scratch_dir = renderer
        .scratch_dir
        .unwrap_or_else(|| std::env::temp_dir().join(DEFAULT_RENDERER_SCRATCH_DIR));
    if scratch_dir.as_os_str().is_empty() {
        return Err(LoadError::invalid(
            "renderer.scratch_dir",
            "path must not be empty",
        ));
    }

    let extra_args = renderer
        .extra_args
        .unwrap_or_default()
        .into_iter()
        .map(|arg| arg.trim().to_string())
        .filter(|arg| !arg.is_empty())
        .collect();

    Ok(RendererSettings {
        cli_path,
        scratch_dir,
        extra_args,
    })
}

fn build_jobs_settings(jobs: RawJobsSettings) -> Result<JobsSettings, LoadError> {
    let max_attempts = non_zero_u32(
        jobs.max_attempts.unwrap_or(DEFAULT_JOB_MAX_ATTEMPTS).into(),
        "jobs.max_attempts",
    )?;
    if max_attempts.get() > i32::MAX as u32 {
        return Err(LoadError::invalid(
            "jobs.max_attempts",
            "value exceeds supported range for i32",
        ));
    }

    let backoff_ms = jobs.backoff_base_ms.unwrap_or(DEFAULT_JOB_BACKOFF_BASE_MS);
    let poll_ms = jobs
        .poll_interval_ms
        .unwrap_or(DEFAULT_JOB_POLL_INTERVAL_MS);
    if poll_ms == 0 {
        return Err(LoadError::invalid(
            "jobs.poll_interval_ms",
            "must be greater than zero",
        ));
    }

    let lease_secs = jobs
        .lease_timeout_secs
        .unwrap_or(DEFAULT_JOB_LEASE_TIMEOUT_SECS);
    if lease_secs == 0 {
        return Err(LoadError::invalid(
            "jobs.lease_timeout_secs",
            "must be greater than zero",
        ));
    }

    Ok(JobsSettings {
        max_attempts,
        backoff_base: Duration::from_millis(backoff_ms),
        poll_interval: Duration::from_millis(poll_ms),
        queue_depth_alert: jobs
            .queue_depth_alert
            .unwrap_or(DEFAULT_JOB_QUEUE_DEPTH_ALERT),
        lease_timeout: Duration::from_secs(lease_secs),
    })
}

fn build_processor_settings(
    processor: RawProcessorSettings,
) -> Result<ProcessorLimits, LoadError> {
    let value = processor
        .max_output_bytes
        .unwrap_or(DEFAULT_MAX_OUTPUT_BYTES);
    let max_output_bytes = NonZeroU64::new(value).ok_or_else(|| {
        LoadError::invalid("processor.max_output_bytes", "must be greater than zero")
    })?;

    Ok(ProcessorLimits { max_output_bytes })
}

fn build_metrics_settings(metrics: RawMetricsSettings) -> Result<MetricsSettings, LoadError> {
    let interval_secs = metrics
        .report_interval_secs
        .unwrap_or(DEFAULT_REPORT_INTERVAL_SECS);
    if interval_secs == 0 {
        return Err(LoadError::invalid(
            "metrics.report_interval_secs",
            "must be greater than zero",
        ));
    }

    let failure_rate_threshold = metrics
        .failure_rate_threshold
        .unwrap_or(DEFAULT_FAILURE_RATE_THRESHOLD);
    if !(0.0..=1.0).contains(&failure_rate_threshold) {
        return Err(LoadError::invalid(
            "metrics.failure_rate_threshold",
            "must be between 0 and 1",
        ));
    }

    let ceiling_ms = metrics
        .p95_render_ceiling_ms
        .unwrap_or(DEFAULT_P95_RENDER_CEILING_MS);
    if ceiling_ms == 0 {
        return Err(LoadError::invalid(
            "metrics.p95_render_ceiling_ms",
            "must be greater than zero",
        ));
    }

    let sample_cap = non_zero_u32(
        metrics.sample_cap.unwrap_or(DEFAULT_SAMPLE_CAP).into(),
        "metrics.sample_cap",
    )?;
    let sample_trim_to = non_zero_u32(
        metrics.sample_trim_to.unwrap_or(DEFAULT_SAMPLE_TRIM_TO).into(),
        "metrics.sample_trim_to",
    )?;
    if sample_trim_to > sample_cap {
        return Err(LoadError::invalid(
            "metrics.sample_trim_to",
            "must not exceed metrics.sample_cap",
        ));
    }

    Ok(MetricsSettings {
        report_interval: Duration::from_secs(interval_secs),
        failure_rate_threshold,
        min_samples: metrics.min_samples.unwrap_or(DEFAULT_MIN_SAMPLES),
        p95_render_ceiling: Duration::from_millis(ceiling_ms),
        sample_cap,
        sample_trim_to,
    })
}

fn build_storage_settings(storage: RawStorageSettings) -> Result<StorageSettings, LoadError> {
    let directory = storage
        .directory
        .unwrap_or_else(|| PathBuf::from(DEFAULT_STORAGE_DIR));
    if directory.as_os_str().is_empty() {
        return Err(LoadError::invalid(
            "storage.directory",
            "path must not be empty",
        ));
    }

    Ok(StorageSettings { directory })
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawServerSettings {
    host: Option<String>,
    port: Option<u16>,
    graceful_shutdown_seconds: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawLoggingSettings {
    level: Option<String>,
    json: Option<bool>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawDatabaseSettings {
    url: Option<String>,
    max_connections: Option<u32>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawPoolSettings {
    max_concurrency: Option<u32>,
    recycle_after_renders: Option<u32>,
    prewarm_instances: Option<u32>,
    operation_timeout_ms: Option<u64>,
    viewport_width: Option<u32>,
    viewport_height: Option<u32>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawRendererSettings {
    cli_path: Option<PathBuf>,
    scratch_dir: Option<PathBuf>,
    extra_args: Option<Vec<String>>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawJobsSettings {
    max_attempts: Option<u32>,
    backoff_base_ms: Option<u64>,
    poll_interval_ms: Option<u64>,
    queue_depth_alert: Option<u64>,
    lease_timeout_secs: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawProcessorSettings {
    max_output_bytes: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawMetricsSettings {
    report_interval_secs: Option<u64>,
    failure_rate_threshold: Option<f64>,
    min_samples: Option<u32>,
    p95_render_ceiling_ms: Option<u64>,
    sample_cap: Option<u32>,
    sample_trim_to: Option<u32>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawStorageSettings {
    directory: Option<PathBuf>,
}

fn parse_socket_addr(host: &str, port: u16) -> Result<SocketAddr, String> {
    let candidate = format!("{host}:{port}");
    candidate
        .parse()
        .map_err(|err| format!("invalid address `{candidate}`: {err}"))
}

fn non_zero_u32(value: u64, key: &'static str) -> Result<NonZeroU32, LoadError> {
    if value == 0 {
        return Err(LoadError::invalid(key, "must be greater than zero"));
    }

    let value_u32: u32 = value
        .try_into()
        .map_err(|_| LoadError::invalid(key, "value exceeds supported range for u32"))?;

    NonZeroU32::new(value_u32).ok_or_else(|| LoadError::invalid(key, "must be greater than zero"))
}

/// Resolve configuration using the supplied CLI arguments, returning both for downstream use.
pub fn load_with_cli() -> Result<(CliArgs, Settings), LoadError> {
    let args = CliArgs::parse();
    let settings = load(&args)?;
    Ok((args, settings))
}
