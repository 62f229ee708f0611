//! Durable [`MessageQueue`] on the `message_queue` table.
//!
//! Rows move `ready → inflight` when claimed and are deleted on ack. A nack
//! with requeue re-inserts the row at the tail so one failing message cannot
//! hold back the rest; a nack without requeue moves it to `dead`. A consumer
//! that crashes mid-message leaves rows `inflight`;
//! [`SqliteQueue::recover_inflight`] returns those whose lease has expired.

use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde::Serialize;
use sqlx::{Row, SqlitePool};
use tokio::time::Instant;

use crate::error::{SyncError, SyncResult};

use super::{Delivery, MessageQueue};

/// Row counts per state for one named queue.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueDepth {
    pub ready: i64,
    pub inflight: i64,
    pub dead: i64,
}

pub struct SqliteQueue {
    pool: SqlitePool,
    queue: String,
    poll_interval: Duration,
}

impl SqliteQueue {
    pub fn new(pool: SqlitePool, queue: impl Into<String>, poll_interval: Duration) -> Self {
        Self {
            pool,
            queue: queue.into(),
            poll_interval,
        }
    }

    pub fn name(&self) -> &str {
        &self.queue
    }

    /// Return `inflight` rows claimed at least `lease` ago to `ready`.
    /// Rows held by a live consumer are younger than the lease and stay
    /// put. Returns the number recovered.
    pub async fn recover_inflight(&self, lease: Duration) -> SyncResult<u64> {
        let now = Utc::now().timestamp();
        let lease_secs = i64::try_from(lease.as_secs()).unwrap_or(i64::MAX);
        let result = sqlx::query(
            "UPDATE message_queue SET state = 'ready', updated_at = ? \
             WHERE queue = ? AND state = 'inflight' AND updated_at <= ?",
        )
        .bind(now)
        .bind(&self.queue)
        .bind(now.saturating_sub(lease_secs))
        .execute(&self.pool)
        .await?;

        let recovered = result.rows_affected();
        if recovered > 0 {
            tracing::info!(queue = %self.queue, recovered, "returned expired in-flight messages to ready");
        }
        Ok(recovered)
    }

    pub async fn depth(&self) -> SyncResult<QueueDepth> {
        queue_depth(&self.pool, &self.queue).await
    }

    async fn claim(&self) -> SyncResult<Option<Delivery>> {
        let row = sqlx::query(
            r#"
            UPDATE message_queue
            SET state = 'inflight', deliveries = deliveries + 1, updated_at = ?
            WHERE id = (
                SELECT id FROM message_queue
                WHERE queue = ? AND state = 'ready'
                ORDER BY id ASC
                LIMIT 1
            )
            RETURNING id, body, deliveries
            "#,
        )
        .bind(Utc::now().timestamp())
        .bind(&self.queue)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|r| Delivery {
            tag: r.get("id"),
            body: r.get("body"),
            redelivered: r.get::<i64, _>("deliveries") > 1,
        }))
    }
}

/// Depth of `queue` without constructing a [`SqliteQueue`].
pub async fn queue_depth(pool: &SqlitePool, queue: &str) -> SyncResult<QueueDepth> {
    let rows = sqlx::query(
        "SELECT state, COUNT(*) AS n FROM message_queue WHERE queue = ? GROUP BY state",
    )
    .bind(queue)
    .fetch_all(pool)
    .await?;

    let mut depth = QueueDepth::default();
    for row in rows {
        let state: String = row.get("state");
        let n: i64 = row.get("n");
        match state.as_str() {
            "ready" => depth.ready = n,
            "inflight" => depth.inflight = n,
            "dead" => depth.dead = n,
            other => tracing::warn!(queue, state = other, "unknown queue row state"),
        }
    }
    Ok(depth)
}

#[async_trait]
impl MessageQueue for SqliteQueue {
    async fn publish(&self, body: &[u8]) -> SyncResult<()> {
        let now = Utc::now().timestamp();
        sqlx::query(
            "INSERT INTO message_queue (queue, body, state, deliveries, enqueued_at, updated_at) \
             VALUES (?, ?, 'ready', 0, ?, ?)",
        )
        .bind(&self.queue)
        .bind(body)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn receive(&self, timeout: Duration) -> SyncResult<Option<Delivery>> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(delivery) = self.claim().await? {
                return Ok(Some(delivery));
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            tokio::time::sleep(self.poll_interval.min(deadline - now)).await;
        }
    }

    async fn ack(&self, delivery: &Delivery) -> SyncResult<()> {
        let result =
            sqlx::query("DELETE FROM message_queue WHERE id = ? AND queue = ? AND state = 'inflight'")
                .bind(delivery.tag)
                .bind(&self.queue)
                .execute(&self.pool)
                .await?;
        if result.rows_affected() == 0 {
            return Err(SyncError::Invalid(format!(
                "unknown delivery tag {}",
                delivery.tag
            )));
        }
        Ok(())
    }

    async fn nack(&self, delivery: &Delivery, requeue: bool) -> SyncResult<()> {
        let now = Utc::now().timestamp();
        let settled = if requeue {
            // A fresh id puts the row behind everything already waiting.
            let mut tx = self.pool.begin().await?;
            let inserted = sqlx::query(
                "INSERT INTO message_queue (queue, body, state, deliveries, enqueued_at, updated_at) \
                 SELECT queue, body, 'ready', deliveries, enqueued_at, ? FROM message_queue \
                 WHERE id = ? AND queue = ? AND state = 'inflight'",
            )
            .bind(now)
            .bind(delivery.tag)
            .bind(&self.queue)
            .execute(&mut *tx)
            .await?
            .rows_affected();
            if inserted > 0 {
                sqlx::query("DELETE FROM message_queue WHERE id = ?")
                    .bind(delivery.tag)
                    .execute(&mut *tx)
                    .await?;
            }
            tx.commit().await?;
            inserted
        } else {
            sqlx::query(
                "UPDATE message_queue SET state = 'dead', updated_at = ? \
                 WHERE id = ? AND queue = ? AND state = 'inflight'",
            )
            .bind(now)
            .bind(delivery.tag)
            .bind(&self.queue)
            .execute(&self.pool)
            .await?
            .rows_affected()
        };
        if settled == 0 {
            return Err(SyncError::Invalid(format!(
                "unknown delivery tag {}",
                delivery.tag
            )));
        }
        Ok(())
    }
}
