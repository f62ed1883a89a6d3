//! Queries for the persisted sync queue and its dead letters.

use sqlx::{Executor, Sqlite};
use stowage_engine::{DeadLetter, DocumentKey, QueueItem};

/// Insert or replace the queued item for its key.
pub async fn save_item<'e, E>(executor: E, item: &QueueItem) -> Result<(), sqlx::Error>
where
    E: Executor<'e, Database = Sqlite>,
{
    let body = serde_json::to_string(item).map_err(|e| sqlx::Error::Encode(Box::new(e)))?;

    sqlx::query(
        r#"
        INSERT INTO sync_queue (collection, id, seq, enqueued_at, item)
        VALUES (?1, ?2, ?3, ?4, ?5)
        ON CONFLICT (collection, id) DO UPDATE SET
            seq = excluded.seq,
            enqueued_at = excluded.enqueued_at,
            item = excluded.item
        "#,
    )
    .bind(&item.key.collection)
    .bind(&item.key.id)
    .bind(item.seq as i64)
    .bind(item.enqueued_at as i64)
    .bind(body)
    .execute(executor)
    .await?;

    Ok(())
}

pub async fn delete_item<'e, E>(executor: E, key: &DocumentKey) -> Result<(), sqlx::Error>
where
    E: Executor<'e, Database = Sqlite>,
{
    sqlx::query("DELETE FROM sync_queue WHERE collection = ?1 AND id = ?2")
        .bind(&key.collection)
        .bind(&key.id)
        .execute(executor)
        .await?;
    Ok(())
}

/// Load queued items in drain order.
pub async fn load_items<'e, E>(executor: E) -> Result<Vec<String>, sqlx::Error>
where
    E: Executor<'e, Database = Sqlite>,
{
    sqlx::query_scalar::<_, String>("SELECT item FROM sync_queue ORDER BY enqueued_at, seq")
        .fetch_all(executor)
        .await
}

pub async fn save_dead_letter<'e, E>(executor: E, letter: &DeadLetter) -> Result<(), sqlx::Error>
where
    E: Executor<'e, Database = Sqlite>,
{
    let body = serde_json::to_string(letter).map_err(|e| sqlx::Error::Encode(Box::new(e)))?;

    sqlx::query(
        r#"
        INSERT INTO dead_letters (collection, id, failed_at, letter)
        VALUES (?1, ?2, ?3, ?4)
        ON CONFLICT (collection, id) DO UPDATE SET
            failed_at = excluded.failed_at,
            letter = excluded.letter
        "#,
    )
    .bind(&letter.item.key.collection)
    .bind(&letter.item.key.id)
    .bind(letter.failed_at as i64)
    .bind(body)
    .execute(executor)
    .await?;

    Ok(())
}

pub async fn delete_dead_letter<'e, E>(executor: E, key: &DocumentKey) -> Result<(), sqlx::Error>
where
    E: Executor<'e, Database = Sqlite>,
{
    sqlx::query("DELETE FROM dead_letters WHERE collection = ?1 AND id = ?2")
        .bind(&key.collection)
        .bind(&key.id)
        .execute(executor)
        .await?;
    Ok(())
}

pub async fn load_dead_letters<'e, E>(executor: E) -> Result<Vec<String>, sqlx::Error>
where
    E: Executor<'e, Database = Sqlite>,
{
    sqlx::query_scalar::<_, String>("SELECT letter FROM dead_letters ORDER BY failed_at")
        .fetch_all(executor)
        .await
}
