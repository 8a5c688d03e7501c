//! Postgres-backed queue and document store.

mod documents;
mod jobs;
mod util;

pub use util::map_sqlx_error;

use std::sync::Arc;

use apalis_sql::postgres::PostgresStorage;
use sqlx::{
    postgres::{PgPool, PgPoolOptions},
    query,
};

use crate::infra::storage::DocumentStorage;

#[derive(Clone)]
pub struct PostgresRepositories {
    pool: Arc<PgPool>,
    storage: Arc<DocumentStorage>,
}

impl PostgresRepositories {
    pub fn new(pool: PgPool, storage: Arc<DocumentStorage>) -> Self {
        Self {
            pool: Arc::new(pool),
            storage,
        }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub fn storage(&self) -> &DocumentStorage {
        &self.storage
    }

    pub async fn connect(url: &str, max_connections: u32) -> Result<PgPool, sqlx::Error> {
        PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(url)
            .await
    }

    /// Apply the apalis job schema, then the document tables. Both share
    /// `_sqlx_migrations`, so each ignores the other's versions.
    pub async fn run_migrations(pool: &PgPool) -> Result<(), sqlx::Error> {
        let mut jobs = PostgresStorage::<()>::migrations();
        jobs.set_ignore_missing(true);
        jobs.run(pool).await?;

        let mut documents = sqlx::migrate!("./migrations");
        documents.set_ignore_missing(true);
        documents.run(pool).await.map_err(Into::into)
    }

    pub async fn health_check(&self) -> Result<(), sqlx::Error> {
        query("SELECT 1").execute(self.pool()).await.map(|_| ())
    }
}
