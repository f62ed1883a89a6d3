//! Queries for the documents table.

use sqlx::{Executor, Row, Sqlite};
use stowage_engine::{Document, DocumentKey, Fields, Timestamp};

/// A stored document row from the database.
#[derive(Debug)]
pub struct StoredDocument {
    pub collection: String,
    pub id: String,
    pub fields: String,
    pub version: i64,
    pub deleted: bool,
    #[allow(dead_code)]
    pub updated_at: i64,
}

impl<'r> sqlx::FromRow<'r, sqlx::sqlite::SqliteRow> for StoredDocument {
    fn from_row(row: &'r sqlx::sqlite::SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(StoredDocument {
            collection: row.try_get("collection")?,
            id: row.try_get("id")?,
            fields: row.try_get("fields")?,
            version: row.try_get("version")?,
            deleted: row.try_get("deleted")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

impl StoredDocument {
    /// Convert database row to an engine document.
    pub fn to_document(&self) -> Result<Document, serde_json::Error> {
        let fields: Fields = serde_json::from_str(&self.fields)?;
        Ok(Document {
            collection: self.collection.clone(),
            id: self.id.clone(),
            fields,
            version: self.version as u64,
            deleted: self.deleted,
        })
    }
}

/// Insert or replace a document, tombstones included.
pub async fn upsert_document<'e, E>(
    executor: E,
    document: &Document,
    now: Timestamp,
) -> Result<(), sqlx::Error>
where
    E: Executor<'e, Database = Sqlite>,
{
    let fields = serde_json::to_string(&document.fields)
        .map_err(|e| sqlx::Error::Encode(Box::new(e)))?;

    sqlx::query(
        r#"
        INSERT INTO documents (collection, id, fields, version, deleted, updated_at)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6)
        ON CONFLICT (collection, id) DO UPDATE SET
            fields = excluded.fields,
            version = excluded.version,
            deleted = excluded.deleted,
            updated_at = excluded.updated_at
        "#,
    )
    .bind(&document.collection)
    .bind(&document.id)
    .bind(fields)
    .bind(document.version as i64)
    .bind(document.deleted)
    .bind(now as i64)
    .execute(executor)
    .await?;

    Ok(())
}

/// Get a single document, live or tombstoned.
pub async fn get_document<'e, E>(
    executor: E,
    key: &DocumentKey,
) -> Result<Option<StoredDocument>, sqlx::Error>
where
    E: Executor<'e, Database = Sqlite>,
{
    sqlx::query_as::<_, StoredDocument>(
        r#"
        SELECT collection, id, fields, version, deleted, updated_at
        FROM documents
        WHERE collection = ?1 AND id = ?2
        "#,
    )
    .bind(&key.collection)
    .bind(&key.id)
    .fetch_optional(executor)
    .await
}

/// Get every document of a collection, tombstones included.
pub async fn get_collection<'e, E>(
    executor: E,
    collection: &str,
) -> Result<Vec<StoredDocument>, sqlx::Error>
where
    E: Executor<'e, Database = Sqlite>,
{
    sqlx::query_as::<_, StoredDocument>(
        r#"
        SELECT collection, id, fields, version, deleted, updated_at
        FROM documents
        WHERE collection = ?1
        ORDER BY id ASC
        "#,
    )
    .bind(collection)
    .fetch_all(executor)
    .await
}

/// Live document count per collection.
pub async fn count_live<'e, E>(executor: E) -> Result<Vec<(String, i64)>, sqlx::Error>
where
    E: Executor<'e, Database = Sqlite>,
{
    sqlx::query_as::<_, (String, i64)>(
        r#"
        SELECT collection, COUNT(*)
        FROM documents
        WHERE deleted = 0
        GROUP BY collection
        "#,
    )
    .fetch_all(executor)
    .await
}

/// Delete tombstones last written before `cutoff` that have nothing left to sync.
pub async fn purge_tombstones<'e, E>(executor: E, cutoff: Timestamp) -> Result<u64, sqlx::Error>
where
    E: Executor<'e, Database = Sqlite>,
{
    let result = sqlx::query(
        r#"
        DELETE FROM documents
        WHERE deleted = 1
          AND updated_at < ?1
          AND NOT EXISTS (
              SELECT 1 FROM sync_queue q
              WHERE q.collection = documents.collection AND q.id = documents.id
          )
          AND NOT EXISTS (
              SELECT 1 FROM dead_letters d
              WHERE d.collection = documents.collection AND d.id = documents.id
          )
        "#,
    )
    .bind(cutoff as i64)
    .execute(executor)
    .await?;

    Ok(result.rows_affected())
}
