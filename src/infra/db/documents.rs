use async_trait::async_trait;
use tracing::warn;
use uuid::Uuid;

use crate::{
    application::repos::{DocumentStore, RepoError},
    domain::entities::{NewDocument, StoredDocument},
};

use super::{PostgresRepositories, map_sqlx_error};

const SOURCE: &str = "infra::db::documents";

#[async_trait]
impl DocumentStore for PostgresRepositories {
    async fn find_existing(
        &self,
        tenant_id: &str,
        message_id: &str,
    ) -> Result<Option<Uuid>, RepoError> {
        sqlx::query_scalar::<_, Uuid>(
            r#"
            SELECT id
              FROM documents
             WHERE tenant_id = $1
               AND message_id = $2
            "#,
        )
        .bind(tenant_id)
        .bind(message_id)
        .fetch_optional(self.pool())
        .await
        .map_err(map_sqlx_error)
    }

    async fn create_document(&self, document: NewDocument) -> Result<StoredDocument, RepoError> {
        let id = Uuid::new_v4();
        let stored = self
            .storage()
            .store_pdf(&document.tenant_id, id, &document.pdf)
            .await
            .map_err(RepoError::from_persistence)?;

        let inserted = sqlx::query_as::<_, (time::OffsetDateTime,)>(
            r#"
            INSERT INTO documents (
                id, tenant_id, message_id, title, sender, recipients, received_at, route,
                category_hint, tag_hints, attachment_ids, stored_path, checksum, size_bytes
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
            RETURNING created_at
            "#,
        )
        .bind(id)
        .bind(&document.tenant_id)
        .bind(&document.message_id)
        .bind(&document.title)
        .bind(&document.sender)
        .bind(&document.recipients)
        .bind(document.received_at)
        .bind(document.route.as_str())
        .bind(&document.category_hint)
        .bind(&document.tag_hints)
        .bind(&document.attachment_ids)
        .bind(&stored.stored_path)
        .bind(&stored.checksum)
        .bind(stored.size_bytes)
        .fetch_one(self.pool())
        .await
        .map_err(map_sqlx_error);

        match inserted {
            Ok((created_at,)) => Ok(StoredDocument {
                id,
                tenant_id: document.tenant_id,
                message_id: document.message_id,
                stored_path: stored.stored_path,
                checksum: stored.checksum,
                size_bytes: stored.size_bytes,
                created_at,
            }),
            Err(err) => {
                if let Err(cleanup) = self.storage().delete(&stored.stored_path).await {
                    warn!(
                        target = SOURCE,
                        op = "create_document",
                        result = "orphaned_file",
                        stored_path = %stored.stored_path,
                        error = %cleanup,
                        "Failed to remove PDF after rejected insert"
                    );
                }
                Err(err)
            }
        }
    }
}
