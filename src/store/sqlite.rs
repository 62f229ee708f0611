//! SQLite-backed [`BlockStore`] and [`CandidateStore`].
//!
//! Both wrap a [`SqlitePool`] against the schema created by
//! [`crate::migrate::apply_schema`] (`blocks`, `concepts`,
//! `concept_candidates`).

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::{Row, SqlitePool};

use crate::embedding::{blob_to_vec, vec_to_blob};
use crate::error::{SyncError, SyncResult};
use crate::models::{BlockNode, CandidateStatus, Concept, ConceptCandidate, VersionedBlock};

use super::{BlockStore, CandidateStore};

fn from_ts(ts: i64) -> DateTime<Utc> {
    DateTime::from_timestamp(ts, 0).unwrap_or_default()
}

const UPSERT_BLOCK: &str = r#"
    INSERT INTO blocks (id, text, hash, version, source_file, block_type, needs_reprocessing, last_updated)
    VALUES (?, ?, ?, ?, ?, ?, 1, ?)
    ON CONFLICT(id) DO UPDATE SET
        text = excluded.text,
        hash = excluded.hash,
        version = excluded.version,
        source_file = excluded.source_file,
        block_type = excluded.block_type,
        needs_reprocessing = 1,
        last_updated = excluded.last_updated
"#;

const UPSERT_BLOCK_GUARDED: &str = r#"
    INSERT INTO blocks (id, text, hash, version, source_file, block_type, needs_reprocessing, last_updated)
    VALUES (?, ?, ?, ?, ?, ?, 1, ?)
    ON CONFLICT(id) DO UPDATE SET
        text = excluded.text,
        hash = excluded.hash,
        version = excluded.version,
        source_file = excluded.source_file,
        block_type = excluded.block_type,
        needs_reprocessing = 1,
        last_updated = excluded.last_updated
    WHERE excluded.version >= blocks.version
"#;

const UPDATE_BLOCK: &str = r#"
    UPDATE blocks SET
        text = ?,
        hash = ?,
        version = ?,
        source_file = ?,
        block_type = ?,
        needs_reprocessing = 1,
        last_updated = ?
    WHERE id = ?
"#;

const UPDATE_BLOCK_GUARDED: &str = r#"
    UPDATE blocks SET
        text = ?,
        hash = ?,
        version = ?,
        source_file = ?,
        block_type = ?,
        needs_reprocessing = 1,
        last_updated = ?
    WHERE id = ? AND version <= ?
"#;

/// SQLite implementation of the graph collaborator.
pub struct SqliteBlockStore {
    pool: SqlitePool,
}

impl SqliteBlockStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Insert or overwrite a node. With `guarded`, an existing node holding
    /// a higher version is left alone and 0 rows are reported.
    async fn upsert(&self, block: &VersionedBlock, guarded: bool) -> SyncResult<u64> {
        let sql = if guarded {
            UPSERT_BLOCK_GUARDED
        } else {
            UPSERT_BLOCK
        };
        let result = sqlx::query(sql)
            .bind(&block.id)
            .bind(&block.text)
            .bind(&block.content_hash)
            .bind(block.version)
            .bind(block.source_file.display().to_string())
            .bind(block.block_type.as_str())
            .bind(Utc::now().timestamp())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    /// Overwrite an existing node. With `guarded`, only while its stored
    /// version is `<=` the block's.
    async fn update(&self, block: &VersionedBlock, guarded: bool) -> SyncResult<u64> {
        let sql = if guarded {
            UPDATE_BLOCK_GUARDED
        } else {
            UPDATE_BLOCK
        };
        let mut query = sqlx::query(sql)
            .bind(&block.text)
            .bind(&block.content_hash)
            .bind(block.version)
            .bind(block.source_file.display().to_string())
            .bind(block.block_type.as_str())
            .bind(Utc::now().timestamp())
            .bind(&block.id);
        if guarded {
            query = query.bind(block.version);
        }
        let result = query.execute(&self.pool).await?;
        Ok(result.rows_affected())
    }
}

#[async_trait]
impl BlockStore for SqliteBlockStore {
    async fn get_block(&self, id: &str) -> SyncResult<Option<BlockNode>> {
        let row = sqlx::query(
            "SELECT id, text, hash, version, source_file, needs_reprocessing, last_updated \
             FROM blocks WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|r| BlockNode {
            id: r.get("id"),
            text: r.get("text"),
            hash: r.get("hash"),
            version: r.get("version"),
            source_file: r.get("source_file"),
            needs_reprocessing: r.get::<i64, _>("needs_reprocessing") != 0,
            last_updated: from_ts(r.get("last_updated")),
        }))
    }

    async fn create_block(&self, block: &VersionedBlock) -> SyncResult<()> {
        self.upsert(block, false).await.map(|_| ())
    }

    async fn update_block(&self, block: &VersionedBlock) -> SyncResult<()> {
        if self.update(block, false).await? == 0 {
            return Err(SyncError::Invalid(format!(
                "cannot update missing block '{}'",
                block.id
            )));
        }
        Ok(())
    }

    async fn create_block_unless_stale(&self, block: &VersionedBlock) -> SyncResult<bool> {
        Ok(self.upsert(block, true).await? > 0)
    }

    async fn update_block_unless_stale(&self, block: &VersionedBlock) -> SyncResult<bool> {
        Ok(self.update(block, true).await? > 0)
    }

    async fn create_concepts(&self, concepts: &[Concept]) -> SyncResult<Vec<Concept>> {
        let mut tx = self.pool.begin().await?;

        for concept in concepts {
            sqlx::query(
                r#"
                INSERT INTO concepts (id, name, normalized_name, source_candidate_id, source_node_id, source_node_type, created_at)
                VALUES (?, ?, ?, ?, ?, ?, ?)
                ON CONFLICT(id) DO NOTHING
                "#,
            )
            .bind(&concept.id)
            .bind(&concept.name)
            .bind(&concept.normalized_name)
            .bind(&concept.source_candidate_id)
            .bind(&concept.source_node_id)
            .bind(&concept.source_node_type)
            .bind(concept.created_at.timestamp())
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(concepts.to_vec())
    }
}

/// SQLite implementation of the candidate store.
pub struct SqliteCandidateStore {
    pool: SqlitePool,
}

impl SqliteCandidateStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Insert a candidate. Used by the extraction pipeline and by tests;
    /// not part of the [`CandidateStore`] contract.
    pub async fn insert_candidate(&self, candidate: &ConceptCandidate) -> SyncResult<()> {
        let now = Utc::now().timestamp();
        sqlx::query(
            r#"
            INSERT INTO concept_candidates (id, text, normalized_text, embedding, source_node_id,
                                            source_node_type, status, concept_id, metadata_json,
                                            created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, '{}', ?, ?)
            "#,
        )
        .bind(&candidate.id)
        .bind(&candidate.text)
        .bind(&candidate.normalized_text)
        .bind(candidate.embedding.as_deref().map(vec_to_blob))
        .bind(&candidate.source_node_id)
        .bind(&candidate.source_node_type)
        .bind(candidate.status.as_str())
        .bind(&candidate.concept_id)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl CandidateStore for SqliteCandidateStore {
    async fn get_candidates_by_status(
        &self,
        status: CandidateStatus,
    ) -> SyncResult<Vec<ConceptCandidate>> {
        let rows = sqlx::query(
            r#"
            SELECT id, text, normalized_text, embedding, source_node_id, source_node_type, status, concept_id
            FROM concept_candidates
            WHERE status = ?
            ORDER BY created_at ASC, rowid ASC
            "#,
        )
        .bind(status.as_str())
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|r| -> SyncResult<ConceptCandidate> {
                let status_str: String = r.get("status");
                let status = status_str.parse::<CandidateStatus>().map_err(SyncError::Invalid)?;
                let embedding: Option<Vec<u8>> = r.get("embedding");
                Ok(ConceptCandidate {
                    id: r.get("id"),
                    text: r.get("text"),
                    normalized_text: r.get("normalized_text"),
                    embedding: embedding.map(|b| blob_to_vec(&b)),
                    source_node_id: r.get("source_node_id"),
                    source_node_type: r.get("source_node_type"),
                    status,
                    concept_id: r.get("concept_id"),
                })
            })
            .collect()
    }

    async fn update_status(
        &self,
        candidate_id: &str,
        new_status: CandidateStatus,
        metadata: &Value,
    ) -> SyncResult<()> {
        let concept_id = metadata
            .get("concept_id")
            .and_then(|v| v.as_str())
            .map(str::to_string);

        let result = sqlx::query(
            r#"
            UPDATE concept_candidates SET
                status = ?,
                concept_id = COALESCE(?, concept_id),
                metadata_json = ?,
                updated_at = ?
            WHERE id = ? AND status = 'pending'
            "#,
        )
        .bind(new_status.as_str())
        .bind(concept_id)
        .bind(metadata.to_string())
        .bind(Utc::now().timestamp())
        .bind(candidate_id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            let current: Option<String> =
                sqlx::query_scalar("SELECT status FROM concept_candidates WHERE id = ?")
                    .bind(candidate_id)
                    .fetch_optional(&self.pool)
                    .await?;
            return Err(SyncError::Invalid(match current {
                Some(status) => format!("candidate '{}' is already {}", candidate_id, status),
                None => format!("unknown candidate '{}'", candidate_id),
            }));
        }
        Ok(())
    }
}
