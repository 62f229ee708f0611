use sqlx::SqlitePool;

use crate::config::Config;
use crate::db;
use crate::error::SyncResult;

pub async fn run_migrations(config: &Config) -> SyncResult<()> {
    let pool = db::connect(config).await?;
    apply_schema(&pool).await?;
    pool.close().await;
    Ok(())
}

/// Create every table and index. Idempotent.
pub async fn apply_schema(pool: &SqlitePool) -> SyncResult<()> {
    // Graph block nodes
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS blocks (
            id TEXT PRIMARY KEY,
            text TEXT NOT NULL,
            hash TEXT NOT NULL,
            version INTEGER NOT NULL,
            source_file TEXT NOT NULL,
            block_type TEXT NOT NULL DEFAULT 'inline',
            needs_reprocessing INTEGER NOT NULL DEFAULT 1,
            last_updated INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Promoted concepts
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS concepts (
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            normalized_name TEXT NOT NULL,
            source_candidate_id TEXT NOT NULL,
            source_node_id TEXT NOT NULL,
            source_node_type TEXT NOT NULL,
            created_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Candidates awaiting or past a merge/promote decision
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS concept_candidates (
            id TEXT PRIMARY KEY,
            text TEXT NOT NULL,
            normalized_text TEXT NOT NULL,
            embedding BLOB,
            source_node_id TEXT NOT NULL,
            source_node_type TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'pending',
            concept_id TEXT,
            metadata_json TEXT NOT NULL DEFAULT '{}',
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Durable dirty-block queue
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS message_queue (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            queue TEXT NOT NULL,
            body BLOB NOT NULL,
            state TEXT NOT NULL DEFAULT 'ready',
            deliveries INTEGER NOT NULL DEFAULT 0,
            enqueued_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_candidates_status ON concept_candidates(status, created_at)",
    )
    .execute(pool)
    .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_queue_state ON message_queue(queue, state, id)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_blocks_source_file ON blocks(source_file)")
        .execute(pool)
        .await?;

    Ok(())
}
