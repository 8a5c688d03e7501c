use std::time::Duration;

use serde::Serialize;
use thiserror::Error;
use uuid::Uuid;

use crate::util::bytes::format_bytes;

use super::engine::EngineError;
use super::pool::PoolError;

/// Closed set of failure kinds the processor can report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RenderErrorKind {
    BodyMissing,
    OutputTooLarge,
    RenderTimeout,
    RendererCrash,
    PersistenceFailure,
    PoolExhausted,
}

impl RenderErrorKind {
    pub const ALL: [RenderErrorKind; 6] = [
        RenderErrorKind::BodyMissing,
        RenderErrorKind::OutputTooLarge,
        RenderErrorKind::RenderTimeout,
        RenderErrorKind::RendererCrash,
        RenderErrorKind::PersistenceFailure,
        RenderErrorKind::PoolExhausted,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            RenderErrorKind::BodyMissing => "body_missing",
            RenderErrorKind::OutputTooLarge => "output_too_large",
            RenderErrorKind::RenderTimeout => "render_timeout",
            RenderErrorKind::RendererCrash => "renderer_crash",
            RenderErrorKind::PersistenceFailure => "persistence_failure",
            RenderErrorKind::PoolExhausted => "pool_exhausted",
        }
    }

    /// Whether another delivery of the same job could succeed.
    ///
    /// Missing bodies and oversized output are properties of the email itself.
    pub fn is_retryable(self) -> bool {
        match self {
            RenderErrorKind::BodyMissing | RenderErrorKind::OutputTooLarge => false,
            RenderErrorKind::RenderTimeout
            | RenderErrorKind::RendererCrash
            | RenderErrorKind::PersistenceFailure
            | RenderErrorKind::PoolExhausted => true,
        }
    }
}

impl std::fmt::Display for RenderErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Error)]
pub enum RenderError {
    #[error("email has neither an HTML nor a plain-text body")]
    BodyMissing,
    #[error(
        "rendered PDF is {} which exceeds the {} limit",
        format_bytes(*size_bytes),
        format_bytes(*limit_bytes)
    )]
    OutputTooLarge { size_bytes: u64, limit_bytes: u64 },
    #[error("render timed out after {0:?}")]
    RenderTimeout(Duration),
    #[error("renderer crashed: {0}")]
    RendererCrash(String),
    #[error("document persistence failed: {0}")]
    PersistenceFailure(String),
    #[error("renderer pool exhausted: {0}")]
    PoolExhausted(String),
}

impl RenderError {
    pub fn kind(&self) -> RenderErrorKind {
        match self {
            RenderError::BodyMissing => RenderErrorKind::BodyMissing,
            RenderError::OutputTooLarge { .. } => RenderErrorKind::OutputTooLarge,
            RenderError::RenderTimeout(_) => RenderErrorKind::RenderTimeout,
            RenderError::RendererCrash(_) => RenderErrorKind::RendererCrash,
            RenderError::PersistenceFailure(_) => RenderErrorKind::PersistenceFailure,
            RenderError::PoolExhausted(_) => RenderErrorKind::PoolExhausted,
        }
    }

    pub fn retryable(&self) -> bool {
        self.kind().is_retryable()
    }
}

impl From<EngineError> for RenderError {
    fn from(err: EngineError) -> Self {
        match err {
            EngineError::Timeout(after) => RenderError::RenderTimeout(after),
            other => RenderError::RendererCrash(other.to_string()),
        }
    }
}

impl From<PoolError> for RenderError {
    fn from(err: PoolError) -> Self {
        match err {
            PoolError::Exhausted { .. } => RenderError::PoolExhausted(err.to_string()),
            PoolError::ShuttingDown => RenderError::RendererCrash(err.to_string()),
            PoolError::Engine(engine) => engine.into(),
        }
    }
}

/// Failure details handed to the worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RenderFailure {
    pub kind: RenderErrorKind,
    pub retryable: bool,
    pub message: String,
}

impl From<RenderError> for RenderFailure {
    fn from(err: RenderError) -> Self {
        Self {
            kind: err.kind(),
            retryable: err.retryable(),
            message: err.to_string(),
        }
    }
}

/// Result of processing one job payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum RenderOutcome {
    Created { document_id: Uuid, size_bytes: u64 },
    SkippedDuplicate { document_id: Uuid },
    Failed(RenderFailure),
}

impl RenderOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            RenderOutcome::Created { .. } => "created",
            RenderOutcome::SkippedDuplicate { .. } => "skipped_duplicate",
            RenderOutcome::Failed(_) => "failed",
        }
    }

    pub fn failure(&self) -> Option<&RenderFailure> {
        match self {
            RenderOutcome::Failed(failure) => Some(failure),
            _ => None,
        }
    }
}
