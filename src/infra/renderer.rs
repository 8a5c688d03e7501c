//! Headless Chromium driven over the DevTools protocol.
//!
//! An instance is one long-lived browser process with a private profile
//! directory; every context is a tab inside it. Tabs pause each request in
//! the Fetch domain and fail anything that is not an inline `data:` URL.
//! Pages are loaded as base64 `data:` documents and printed with
//! `Page.printToPDF`. headless_chrome blocks the calling thread, so every
//! call runs on tokio's blocking pool.

use std::{
    ffi::OsStr,
    path::PathBuf,
    sync::{Arc, Mutex},
    time::{Duration, Instant},
};

use async_trait::async_trait;
use base64::{Engine as _, engine::general_purpose::STANDARD};
use headless_chrome::{
    Browser, LaunchOptions, Tab,
    browser::{
        tab::RequestPausedDecision,
        transport::{SessionId, Transport},
    },
    protocol::cdp::{
        Fetch::{FailRequest, events::RequestPausedEvent},
        Network::ErrorReason,
    },
    types::PrintToPdfOptions,
};
use lol_html::{RewriteStrSettings, element, html_content::ContentType, rewrite_str};
use tempfile::TempDir;
use tokio::{fs, task};
use tracing::{debug, info, warn};

use crate::application::render::{
    ContextOptions, DOCUMENT_CSP, EngineError, PdfOptions, RendererEngine, RendererInstance,
    RenderingContext, Viewport,
};
use crate::util::lock::mutex_lock;

const SOURCE: &str = "infra::renderer";

/// The DevTools connection is dropped after this long without events. Idle
/// pool instances must outlive it.
const IDLE_BROWSER_TIMEOUT: Duration = Duration::from_secs(24 * 60 * 60);

/// Chromium refuses navigation URLs longer than this.
pub const MAX_PAGE_URL_BYTES: usize = 2 * 1024 * 1024;

const DATA_URL_PREFIX: &str = "data:text/html;charset=utf-8;base64,";

/// Attributes that make the browser fetch something.
const FETCH_ATTRIBUTES: [&str; 6] = ["src", "srcset", "poster", "action", "background", "data"];

#[derive(Debug, Clone)]
pub struct ChromiumSettings {
    pub cli_path: PathBuf,
    /// Parent directory for per-instance profiles.
    pub scratch_dir: PathBuf,
    /// Extra browser flags, e.g. `--no-sandbox` in containers.
    pub extra_args: Vec<String>,
    /// Browser window size; pages lay out against it.
    pub window: Viewport,
}

#[derive(Debug, Clone)]
pub struct ChromiumEngine {
    settings: Arc<ChromiumSettings>,
}

impl ChromiumEngine {
    pub fn new(settings: ChromiumSettings) -> Self {
        Self {
            settings: Arc::new(settings),
        }
    }

    /// Start one browser process with a fresh profile.
    pub async fn launch_instance(&self) -> Result<ChromiumInstance, EngineError> {
        let started_at = Instant::now();
        fs::create_dir_all(&self.settings.scratch_dir)
            .await
            .map_err(|err| EngineError::Launch(format!("scratch dir unavailable: {err}")))?;

        let profile = tempfile::Builder::new()
            .prefix("instance-")
            .tempdir_in(&self.settings.scratch_dir)
            .map_err(|err| EngineError::Launch(format!("profile dir unavailable: {err}")))?;

        let settings = Arc::clone(&self.settings);
        let profile_path = profile.path().to_path_buf();
        let (browser, version) = blocking("renderer::launch", move || {
            let browser = start_browser(&settings, profile_path)?;
            let version = browser
                .get_version()
                .map(|version| version.product)
                .unwrap_or_default();
            Ok((browser, version))
        })
        .await?;

        info!(
            target = SOURCE,
            op = "renderer::launch",
            result = "ok",
            version = %version,
            pid = browser.get_process_id(),
            profile = %profile.path().display(),
            elapsed_ms = started_at.elapsed().as_millis() as u64,
            "Chromium instance ready"
        );

        Ok(ChromiumInstance {
            live: Mutex::new(Some(LiveBrowser { browser, profile })),
        })
    }
}

#[async_trait]
impl RendererEngine for ChromiumEngine {
    async fn launch(&self) -> Result<Box<dyn RendererInstance>, EngineError> {
        Ok(Box::new(self.launch_instance().await?))
    }
}

fn start_browser(settings: &ChromiumSettings, profile: PathBuf) -> Result<Browser, EngineError> {
    let args: Vec<&OsStr> = settings.extra_args.iter().map(OsStr::new).collect();
    let options = LaunchOptions::default_builder()
        .headless(true)
        .path(Some(settings.cli_path.clone()))
        .user_data_dir(Some(profile))
        .window_size(Some((settings.window.width, settings.window.height)))
        .idle_browser_timeout(IDLE_BROWSER_TIMEOUT)
        .args(args)
        .build()
        .map_err(|err| EngineError::Launch(err.to_string()))?;

    Browser::new(options).map_err(|err| {
        EngineError::Launch(format!(
            "cannot start `{}`: {err}",
            settings.cli_path.display()
        ))
    })
}

/// Run a blocking DevTools call off the async runtime.
async fn blocking<T, F>(op: &'static str, call: F) -> Result<T, EngineError>
where
    F: FnOnce() -> Result<T, EngineError> + Send + 'static,
    T: Send + 'static,
{
    task::spawn_blocking(call)
        .await
        .map_err(|err| EngineError::Crashed(format!("{op} did not complete: {err}")))?
}

fn crashed(err: impl std::fmt::Display) -> EngineError {
    EngineError::Crashed(err.to_string())
}

struct LiveBrowser {
    browser: Browser,
    profile: TempDir,
}

pub struct ChromiumInstance {
    /// `None` once closed.
    live: Mutex<Option<LiveBrowser>>,
}

impl ChromiumInstance {
    fn browser(&self) -> Result<Browser, EngineError> {
        mutex_lock(&self.live, SOURCE, "instance.browser")
            .as_ref()
            .map(|live| live.browser.clone())
            .ok_or_else(|| EngineError::Crashed("instance already closed".into()))
    }

    /// Pid of the browser process; `None` once closed.
    pub fn process_id(&self) -> Option<u32> {
        mutex_lock(&self.live, SOURCE, "instance.process_id")
            .as_ref()
            .and_then(|live| live.browser.get_process_id())
    }
}

#[async_trait]
impl RendererInstance for ChromiumInstance {
    async fn new_context(
        &self,
        options: &ContextOptions,
    ) -> Result<Box<dyn RenderingContext>, EngineError> {
        let browser = self.browser()?;
        let block_remote = options.block_remote_requests;
        let operation_timeout = options.operation_timeout;
        let tab = blocking("renderer::new_context", move || {
            open_tab(&browser, block_remote, operation_timeout)
        })
        .await?;

        Ok(Box::new(ChromiumContext {
            tab: Some(tab),
            options: options.clone(),
            loaded: false,
        }))
    }

    async fn close(&self) -> Result<(), EngineError> {
        let Some(LiveBrowser { browser, profile }) =
            mutex_lock(&self.live, SOURCE, "instance.close").take()
        else {
            return Ok(());
        };

        blocking("renderer::close", move || {
            drop(browser);
            profile
                .close()
                .map_err(|err| EngineError::Io(format!("failed to remove profile: {err}")))
        })
        .await
    }
}

fn open_tab(
    browser: &Browser,
    block_remote: bool,
    operation_timeout: Duration,
) -> Result<Arc<Tab>, EngineError> {
    let tab = browser.new_tab().map_err(crashed)?;
    tab.set_default_timeout(operation_timeout);
    if block_remote {
        tab.enable_fetch(None, None).map_err(crashed)?;
        tab.enable_request_interception(Arc::new(intercept_request))
            .map_err(crashed)?;
    }
    Ok(tab)
}

fn intercept_request(
    _transport: Arc<Transport>,
    _session: SessionId,
    event: RequestPausedEvent,
) -> RequestPausedDecision {
    let url = &event.params.request.url;
    if allows_request(url) {
        return RequestPausedDecision::Continue(None);
    }

    debug!(
        target = SOURCE,
        op = "renderer::intercept",
        result = "blocked",
        url = %url,
        "Remote request blocked"
    );
    RequestPausedDecision::Fail(FailRequest {
        request_id: event.params.request_id,
        error_reason: ErrorReason::BlockedByClient,
    })
}

/// Only inline `data:` resources may load.
fn allows_request(url: &str) -> bool {
    is_inline_data(url)
}

/// Encode a page as a `data:` URL the tab can navigate to.
fn page_data_url(html: &str) -> Result<String, EngineError> {
    let url = format!("{DATA_URL_PREFIX}{}", STANDARD.encode(html));
    if url.len() > MAX_PAGE_URL_BYTES {
        return Err(EngineError::Io(format!(
            "page encodes to {} bytes, above the {MAX_PAGE_URL_BYTES}-byte navigation limit",
            url.len()
        )));
    }
    Ok(url)
}

struct ChromiumContext {
    /// `None` once closed.
    tab: Option<Arc<Tab>>,
    options: ContextOptions,
    loaded: bool,
}

impl ChromiumContext {
    fn tab(&self) -> Result<Arc<Tab>, EngineError> {
        self.tab
            .clone()
            .ok_or_else(|| EngineError::Crashed("context already closed".into()))
    }
}

#[async_trait]
impl RenderingContext for ChromiumContext {
    async fn set_content(&mut self, html: &str) -> Result<(), EngineError> {
        let tab = self.tab()?;
        let page = if self.options.block_remote_requests {
            block_remote_requests(html)?
        } else {
            html.to_owned()
        };
        let url = page_data_url(&page)?;

        blocking("renderer::set_content", move || {
            tab.navigate_to(&url).map_err(crashed)?;
            tab.wait_until_navigated().map_err(crashed)?;
            Ok(())
        })
        .await?;
        self.loaded = true;
        Ok(())
    }

    async fn render_pdf(&mut self, options: &PdfOptions) -> Result<Vec<u8>, EngineError> {
        let started_at = Instant::now();
        let tab = self.tab()?;
        if !self.loaded {
            return Err(EngineError::Crashed(
                "render requested before content was set".into(),
            ));
        }

        let print_options = PrintToPdfOptions {
            print_background: Some(options.print_background),
            ..PrintToPdfOptions::default()
        };
        let pdf = blocking("renderer::render_pdf", move || {
            tab.print_to_pdf(Some(print_options)).map_err(crashed)
        })
        .await
        .inspect_err(|err| {
            warn!(
                target = SOURCE,
                op = "renderer::render_pdf",
                result = "error",
                elapsed_ms = started_at.elapsed().as_millis() as u64,
                error = %err,
                "Chromium failed to print"
            );
        })?;

        if !pdf.starts_with(b"%PDF") {
            return Err(EngineError::Crashed("renderer output is not a PDF".into()));
        }

        debug!(
            target = SOURCE,
            op = "renderer::render_pdf",
            result = "ok",
            title = %options.title,
            pdf_bytes = pdf.len(),
            elapsed_ms = started_at.elapsed().as_millis() as u64,
            "PDF printed"
        );
        Ok(pdf)
    }

    async fn close(&mut self) -> Result<(), EngineError> {
        self.loaded = false;
        match self.tab.take() {
            Some(tab) => {
                blocking("renderer::close_context", move || {
                    tab.close(true).map(|_| ()).map_err(crashed)
                })
                .await
            }
            None => Ok(()),
        }
    }
}

/// Strip every fetching attribute whose value is not an inline `data:` URL,
/// drop `<base>`, `<meta http-equiv=refresh>` and external stylesheet links,
/// and pin a restrictive Content-Security-Policy at the top of `<head>`.
pub fn block_remote_requests(html: &str) -> Result<String, EngineError> {
    let csp = format!(r#"<meta http-equiv="Content-Security-Policy" content="{DOCUMENT_CSP}">"#);

    rewrite_str(
        html,
        RewriteStrSettings {
            element_content_handlers: vec![
                element!("head", move |el| {
                    el.prepend(&csp, ContentType::Html);
                    Ok(())
                }),
                element!("base", |el| {
                    el.remove();
                    Ok(())
                }),
                element!("link", |el| {
                    el.remove();
                    Ok(())
                }),
                element!("meta[http-equiv]", |el| {
                    let refresh = el
                        .get_attribute("http-equiv")
                        .is_some_and(|value| value.eq_ignore_ascii_case("refresh"));
                    if refresh {
                        el.remove();
                    }
                    Ok(())
                }),
                element!("*", |el| {
                    let blocked: Vec<String> = el
                        .attributes()
                        .iter()
                        .filter(|attr| FETCH_ATTRIBUTES.contains(&attr.name().as_str()))
                        .filter(|attr| !is_inline_data(&attr.value()))
                        .map(|attr| attr.name())
                        .collect();
                    for name in blocked {
                        el.remove_attribute(&name);
                    }
                    Ok(())
                }),
            ],
            ..RewriteStrSettings::default()
        },
    )
    .map_err(|err| EngineError::Io(format!("failed to prepare page: {err}")))
}

fn is_inline_data(value: &str) -> bool {
    value
        .trim_start()
        .get(..5)
        .is_some_and(|scheme| scheme.eq_ignore_ascii_case("data:"))
}
