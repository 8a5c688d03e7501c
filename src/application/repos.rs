//! Repository traits describing the queue and persistence adapters.

use async_trait::async_trait;
use thiserror::Error;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::domain::entities::{JobRecord, NewDocument, NewRenderJob, QueueCounts, StoredDocument};

#[derive(Debug, Error)]
pub enum RepoError {
    #[error("persistence error: {0}")]
    Persistence(String),
    #[error("duplicate record violates unique constraint `{constraint}`")]
    Duplicate { constraint: String },
    #[error("resource not found")]
    NotFound,
    #[error("invalid input: {message}")]
    InvalidInput { message: String },
    #[error("database timeout")]
    Timeout,
}

impl RepoError {
    pub fn from_persistence(err: impl std::fmt::Display) -> Self {
        Self::Persistence(err.to_string())
    }
}

/// Queue holding render jobs.
///
/// Claiming and acknowledging deliveries belongs to the job runtime driving
/// the backend; this trait covers what producers and status readers need.
#[async_trait]
pub trait JobQueue: Send + Sync {
    async fn enqueue(&self, job: NewRenderJob) -> Result<String, RepoError>;

    /// Hold the job back until `run_at` before its next delivery.
    async fn defer(&self, id: &str, run_at: OffsetDateTime) -> Result<(), RepoError>;

    async fn find(&self, id: &str) -> Result<Option<JobRecord>, RepoError>;

    async fn counts(&self) -> Result<QueueCounts, RepoError>;
}

/// Storage for rendered documents, keyed for idempotency by tenant and message id.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    async fn find_existing(
        &self,
        tenant_id: &str,
        message_id: &str,
    ) -> Result<Option<Uuid>, RepoError>;

    /// Persist a document. A concurrent insert for the same key surfaces as
    /// [`RepoError::Duplicate`].
    async fn create_document(&self, document: NewDocument) -> Result<StoredDocument, RepoError>;
}
