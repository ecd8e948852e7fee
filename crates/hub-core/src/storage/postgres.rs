//! PostgreSQL coordination store shared by every hub process.
//!
//! Queue claiming uses `FOR UPDATE SKIP LOCKED` so that concurrent claimers
//! on different hosts never block each other and never receive the same
//! item within one lease. A claim only pushes the item's `visible_at` into
//! the future; acknowledging deletes the row. Items whose lease lapses are
//! picked up again by the next claim without any sweeper.

use chrono::{DateTime, Utc};
use sqlx::{types::Json, PgPool};
use uuid::Uuid;

use super::{CoordinationStore, DeadLetterRecord, ItemId, QueueItem, StoreFuture};
use crate::{error::Result, models::Envelope};

const SCHEMA: &[&str] = &[
    r"
    CREATE TABLE IF NOT EXISTS hub_sorted_sets (
        set_key TEXT NOT NULL,
        member TEXT NOT NULL,
        score BIGINT NOT NULL,
        PRIMARY KEY (set_key, member)
    )
    ",
    r"
    CREATE INDEX IF NOT EXISTS idx_hub_sorted_sets_score
        ON hub_sorted_sets (set_key, score)
    ",
    r"
    CREATE TABLE IF NOT EXISTS hub_queue_items (
        id UUID PRIMARY KEY,
        queue TEXT NOT NULL,
        seq BIGSERIAL,
        body JSONB NOT NULL,
        visible_at BIGINT NOT NULL,
        enqueued_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
    )
    ",
    r"
    CREATE INDEX IF NOT EXISTS idx_hub_queue_items_visible
        ON hub_queue_items (queue, visible_at, seq)
    ",
    r"
    CREATE TABLE IF NOT EXISTS hub_dead_letters (
        id UUID PRIMARY KEY,
        service TEXT NOT NULL,
        envelope JSONB NOT NULL,
        last_error TEXT NOT NULL,
        attempts INTEGER NOT NULL,
        recorded_at TIMESTAMPTZ NOT NULL
    )
    ",
    r"
    CREATE INDEX IF NOT EXISTS idx_hub_dead_letters_service
        ON hub_dead_letters (service, recorded_at DESC)
    ",
];

/// PostgreSQL-backed [`CoordinationStore`].
#[derive(Debug, Clone)]
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    /// Wraps an existing connection pool.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Returns the underlying pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Creates the hub tables if they do not exist yet.
    ///
    /// # Errors
    ///
    /// Returns error if any DDL statement fails.
    pub async fn migrate(&self) -> Result<()> {
        for statement in SCHEMA {
            sqlx::query(*statement).execute(&self.pool).await?;
        }
        tracing::debug!(statements = SCHEMA.len(), "coordination schema applied");
        Ok(())
    }
}

type DeadLetterRow = (Uuid, String, Json<Envelope>, String, i32, DateTime<Utc>);

impl CoordinationStore for PostgresStore {
    fn upsert_member(&self, set: &str, member: &str, score: i64) -> StoreFuture<'_, ()> {
        let set = set.to_string();
        let member = member.to_string();
        Box::pin(async move {
            sqlx::query(
                r"
                INSERT INTO hub_sorted_sets (set_key, member, score)
                VALUES ($1, $2, $3)
                ON CONFLICT (set_key, member) DO UPDATE SET score = EXCLUDED.score
                ",
            )
            .bind(set)
            .bind(member)
            .bind(score)
            .execute(&self.pool)
            .await?;
            Ok(())
        })
    }

    fn range_by_score(&self, set: &str, min: i64, max: i64) -> StoreFuture<'_, Vec<String>> {
        let set = set.to_string();
        Box::pin(async move {
            let members = sqlx::query_scalar(
                r"
                SELECT member FROM hub_sorted_sets
                WHERE set_key = $1 AND score BETWEEN $2 AND $3
                ORDER BY score ASC, member ASC
                ",
            )
            .bind(set)
            .bind(min)
            .bind(max)
            .fetch_all(&self.pool)
            .await?;
            Ok(members)
        })
    }

    fn push_item(
        &self,
        queue: &str,
        envelope: &Envelope,
        visible_at_ms: i64,
    ) -> StoreFuture<'_, ItemId> {
        let queue = queue.to_string();
        let envelope = envelope.clone();
        Box::pin(async move {
            let id = ItemId::new();
            sqlx::query(
                r"
                INSERT INTO hub_queue_items (id, queue, body, visible_at)
                VALUES ($1, $2, $3, $4)
                ",
            )
            .bind(id.0)
            .bind(queue)
            .bind(Json(&envelope))
            .bind(visible_at_ms)
            .execute(&self.pool)
            .await?;
            Ok(id)
        })
    }

    fn claim_item(
        &self,
        queue: &str,
        now_ms: i64,
        lease_until_ms: i64,
    ) -> StoreFuture<'_, Option<QueueItem>> {
        let queue = queue.to_string();
        Box::pin(async move {
            let row: Option<(Uuid, Json<Envelope>, i64)> = sqlx::query_as(
                r"
                UPDATE hub_queue_items SET visible_at = $3
                WHERE id = (
                    SELECT id FROM hub_queue_items
                    WHERE queue = $1 AND visible_at <= $2
                    ORDER BY visible_at ASC, seq ASC
                    LIMIT 1
                    FOR UPDATE SKIP LOCKED
                )
                RETURNING id, body, visible_at
                ",
            )
            .bind(queue)
            .bind(now_ms)
            .bind(lease_until_ms)
            .fetch_optional(&self.pool)
            .await?;

            Ok(row.map(|(id, Json(envelope), visible_at_ms)| QueueItem {
                id: ItemId(id),
                envelope,
                visible_at_ms,
            }))
        })
    }

    fn ack_item(&self, queue: &str, id: ItemId) -> StoreFuture<'_, bool> {
        let queue = queue.to_string();
        Box::pin(async move {
            let result = sqlx::query("DELETE FROM hub_queue_items WHERE queue = $1 AND id = $2")
                .bind(queue)
                .bind(id.0)
                .execute(&self.pool)
                .await?;
            Ok(result.rows_affected() > 0)
        })
    }

    fn purge(&self, queue: &str) -> StoreFuture<'_, u64> {
        let queue = queue.to_string();
        Box::pin(async move {
            let result = sqlx::query("DELETE FROM hub_queue_items WHERE queue = $1")
                .bind(queue)
                .execute(&self.pool)
                .await?;
            Ok(result.rows_affected())
        })
    }

    fn count_items(&self, queue: &str) -> StoreFuture<'_, u64> {
        let queue = queue.to_string();
        Box::pin(async move {
            let count: i64 =
                sqlx::query_scalar("SELECT COUNT(*) FROM hub_queue_items WHERE queue = $1")
                    .bind(queue)
                    .fetch_one(&self.pool)
                    .await?;
            Ok(u64::try_from(count).unwrap_or(0))
        })
    }

    fn record_dead_letter(&self, record: DeadLetterRecord) -> StoreFuture<'_, ()> {
        Box::pin(async move {
            sqlx::query(
                r"
                INSERT INTO hub_dead_letters (
                    id, service, envelope, last_error, attempts, recorded_at
                ) VALUES ($1, $2, $3, $4, $5, $6)
                ON CONFLICT (id) DO NOTHING
                ",
            )
            .bind(record.id)
            .bind(&record.service)
            .bind(Json(&record.envelope))
            .bind(&record.last_error)
            .bind(i32::try_from(record.attempts).unwrap_or(i32::MAX))
            .bind(record.recorded_at)
            .execute(&self.pool)
            .await?;
            Ok(())
        })
    }

    fn list_dead_letters(
        &self,
        service: &str,
        limit: usize,
    ) -> StoreFuture<'_, Vec<DeadLetterRecord>> {
        let service = service.to_string();
        Box::pin(async move {
            let rows: Vec<DeadLetterRow> = sqlx::query_as(
                r"
                SELECT id, service, envelope, last_error, attempts, recorded_at
                FROM hub_dead_letters
                WHERE service = $1
                ORDER BY recorded_at DESC
                LIMIT $2
                ",
            )
            .bind(service)
            .bind(i64::try_from(limit).unwrap_or(i64::MAX))
            .fetch_all(&self.pool)
            .await?;

            Ok(rows
                .into_iter()
                .map(|(id, service, Json(envelope), last_error, attempts, recorded_at)| {
                    DeadLetterRecord {
                        id,
                        service,
                        envelope,
                        last_error,
                        attempts: u32::try_from(attempts).unwrap_or(0),
                        recorded_at,
                    }
                })
                .collect())
        })
    }

    fn health_check(&self) -> StoreFuture<'_, ()> {
        Box::pin(async move {
            let _: (i32,) = sqlx::query_as("SELECT 1").fetch_one(&self.pool).await?;
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn store_can_be_created_without_connecting() {
        let pool = PgPool::connect_lazy("postgresql://localhost/hub").unwrap();
        let store = PostgresStore::new(pool);
        assert_eq!(SCHEMA.len(), 6);
        let _ = store.pool();
    }
}
