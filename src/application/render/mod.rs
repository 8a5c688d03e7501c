//! Email → PDF rendering.
//!
//! [`RenderJobProcessor`] drives one payload through sanitisation, document
//! composition and a renderer context leased from the [`RendererPool`]. The
//! processor never touches the queue; the worker in
//! [`crate::application::jobs`] maps its [`RenderOutcome`] onto queue state.

mod document;
pub mod engine;
mod pool;
mod processor;
mod sanitize;
mod types;

pub use document::{DOCUMENT_CSP, DocumentBody, compose_document, document_title};
pub use engine::{
    ContextOptions, EngineError, PdfOptions, RendererEngine, RendererInstance, RenderingContext,
    Viewport,
};
pub use pool::{
    ContextLease, DEFAULT_PREWARM_INSTANCES, DEFAULT_RECYCLE_AFTER, PoolConfig, PoolError,
    PoolStats, RendererPool,
};
pub use processor::{DEFAULT_MAX_OUTPUT_BYTES, ProcessorSettings, RenderJobProcessor};
pub use sanitize::{AmmoniaSanitizer, HtmlSanitizer};
pub use types::{RenderError, RenderErrorKind, RenderFailure, RenderOutcome};
