//! Read access to `document_imports` for the analyze worker.

use async_trait::async_trait;
use sqlx::{Pool, Postgres, Row};
use uuid::Uuid;

use handbook_core::{Document, DocumentSource, Error, Result};

/// PostgreSQL implementation of [`DocumentSource`].
#[derive(Clone)]
pub struct PgDocumentRepository {
    pool: Pool<Postgres>,
}

impl PgDocumentRepository {
    pub fn new(pool: Pool<Postgres>) -> Self {
        Self { pool }
    }

    /// Insert or replace a document. Used by fixtures; the product's import
    /// flow owns these rows in production.
    pub async fn upsert(&self, document: &Document) -> Result<()> {
        sqlx::query(
            "INSERT INTO document_imports (id, file_name, extracted_text, metadata)
             VALUES ($1, $2, $3, $4)
             ON CONFLICT (id) DO UPDATE
             SET file_name = EXCLUDED.file_name,
                 extracted_text = EXCLUDED.extracted_text,
                 metadata = EXCLUDED.metadata",
        )
        .bind(document.id)
        .bind(&document.file_name)
        .bind(&document.extracted_text)
        .bind(&document.metadata)
        .execute(&self.pool)
        .await
        .map_err(Error::Database)?;
        Ok(())
    }
}

#[async_trait]
impl DocumentSource for PgDocumentRepository {
    async fn get_document(&self, document_id: Uuid) -> Result<Option<Document>> {
        let row = sqlx::query(
            "SELECT id, file_name, extracted_text, metadata
             FROM document_imports WHERE id = $1",
        )
        .bind(document_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(Error::Database)?;

        match row {
            Some(row) => Ok(Some(Document {
                id: row.try_get("id")?,
                file_name: row.try_get("file_name")?,
                extracted_text: row.try_get("extracted_text")?,
                metadata: row.try_get("metadata")?,
            })),
            None => Ok(None),
        }
    }
}
