//! Contract for the HTML→PDF renderer engine.
//!
//! An engine launches heavyweight [`RendererInstance`]s (one live browser-like
//! process each). Every job renders inside its own short-lived
//! [`RenderingContext`] opened on exactly one instance. The pool in
//! [`super::pool`] decides when instances are started, reused and recycled;
//! implementations only have to honour the [`ContextOptions`] they are given.

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

#[derive(Debug, Error, Clone)]
pub enum EngineError {
    #[error("renderer failed to launch: {0}")]
    Launch(String),
    #[error("renderer process crashed: {0}")]
    Crashed(String),
    #[error("renderer operation timed out after {0:?}")]
    Timeout(Duration),
    #[error("renderer i/o failure: {0}")]
    Io(String),
}

/// Page size used for rendering, in CSS pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Viewport {
    pub width: u32,
    pub height: u32,
}

/// Settings applied to every context the pool opens.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContextOptions {
    pub viewport: Viewport,
    /// Abort every fetch that is not an inline `data:` URL.
    pub block_remote_requests: bool,
    /// Upper bound for any single operation on the context.
    pub operation_timeout: Duration,
}

/// Output options for [`RenderingContext::render_pdf`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PdfOptions {
    pub print_background: bool,
    /// Document title embedded in the PDF metadata.
    pub title: String,
}

#[async_trait]
pub trait RendererEngine: Send + Sync {
    async fn launch(&self) -> Result<Box<dyn RendererInstance>, EngineError>;
}

#[async_trait]
pub trait RendererInstance: Send + Sync {
    async fn new_context(
        &self,
        options: &ContextOptions,
    ) -> Result<Box<dyn RenderingContext>, EngineError>;

    async fn close(&self) -> Result<(), EngineError>;
}

#[async_trait]
pub trait RenderingContext: Send {
    async fn set_content(&mut self, html: &str) -> Result<(), EngineError>;

    async fn render_pdf(&mut self, options: &PdfOptions) -> Result<Vec<u8>, EngineError>;

    async fn close(&mut self) -> Result<(), EngineError>;
}
