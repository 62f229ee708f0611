//! Command implementations behind the `vsync` binary.
//!
//! Each `run_*` function opens its own database pool from the loaded
//! [`Config`], prints a short human-readable report to stdout (or JSON where
//! asked), and closes the pool.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use chrono::Utc;
use tokio::sync::watch;

use crate::block::{diff_blocks, extract_blocks};
use crate::config::Config;
use crate::consumer::DirtyBlockConsumer;
use crate::db;
use crate::message::messages_from_diff;
use crate::queue::sqlite::SqliteQueue;
use crate::queue::MessageQueue;
use crate::retry::RetryPolicy;
use crate::similarity::{DecisionAction, SimilarityIndex};
use crate::store::sqlite::{SqliteBlockStore, SqliteCandidateStore};
use crate::vault_sync::VaultSyncJob;

pub async fn run_sync(config: &Config, tier: Option<String>, dry_run: bool, json: bool) -> Result<()> {
    let pool = db::connect(config).await?;
    let store = Arc::new(SqliteBlockStore::new(pool.clone()));
    let job = VaultSyncJob::new(
        store,
        config.vault.clone(),
        RetryPolicy::from_config(&config.retry),
    )?
    .dry_run(dry_run);

    let stats = match tier {
        Some(tier) => {
            if !config.vault.tiers.contains(&tier) {
                bail!(
                    "Unknown tier: '{}'. Configured: {}",
                    tier,
                    config.vault.tiers.join(", ")
                );
            }
            job.run_tiers(&[tier]).await
        }
        None => job.run().await,
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&stats)?);
    } else {
        println!("sync {}{}", config.vault.root.display(), if dry_run { " (dry-run)" } else { "" });
        for tier in &stats.tiers {
            if !tier.present {
                println!("  {:<10} missing", tier.tier);
                continue;
            }
            let c = &tier.counts;
            println!(
                "  {:<10} files: {}  blocks: {}  new: {}  updated: {}  unchanged: {}  errors: {}",
                tier.tier,
                c.files_processed,
                c.blocks_processed,
                c.blocks_new,
                c.blocks_updated,
                c.blocks_unchanged,
                c.errors
            );
        }
        let t = &stats.totals;
        println!(
            "  total      files: {}  blocks: {}  new: {}  updated: {}  unchanged: {}  errors: {}",
            t.files_processed, t.blocks_processed, t.blocks_new, t.blocks_updated, t.blocks_unchanged, t.errors
        );
        for err in &stats.errors {
            println!("  error: {}", err);
        }
        println!("ok");
    }

    pool.close().await;
    Ok(())
}

/// Consume dirty-block messages until Ctrl-C or `max_messages` is reached.
pub async fn run_consume(config: &Config, max_messages: Option<u64>) -> Result<()> {
    let pool = db::connect(config).await?;
    let poll = Duration::from_millis(config.consumer.poll_interval_ms);
    let queue = Arc::new(SqliteQueue::new(pool.clone(), config.consumer.queue.clone(), poll));
    queue
        .recover_inflight(Duration::from_secs(config.consumer.lease_secs))
        .await?;

    let mut consumer = DirtyBlockConsumer::new(
        Arc::new(SqliteBlockStore::new(pool.clone())),
        queue,
        config.vault.root.clone(),
        RetryPolicy::from_config(&config.retry),
    )
    .with_poll_interval(poll)
    .with_max_messages(max_messages);

    let (stop_tx, stop_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("stop requested");
            let _ = stop_tx.send(true);
        }
    });

    let stats = consumer.run(stop_rx).await;
    println!("consume {}", config.consumer.queue);
    println!("  received: {}", stats.received);
    println!("  acked: {}", stats.acked);
    println!("  requeued: {}", stats.requeued);
    println!("  rejected: {}", stats.rejected);
    println!(
        "  created: {}  updated: {}  unchanged: {}  conflicts: {}  missing: {}",
        stats.created, stats.updated, stats.unchanged, stats.conflicts, stats.missing
    );

    pool.close().await;
    Ok(())
}

/// Enqueue change events for `file`, diffed against `previous` (or against
/// nothing, which reports every block as added).
pub async fn run_publish(config: &Config, file: &Path, previous: Option<PathBuf>) -> Result<()> {
    let path = if file.is_absolute() {
        file.to_path_buf()
    } else {
        config.vault.root.join(file)
    };
    let relative = path.strip_prefix(&config.vault.root).unwrap_or(&path).to_path_buf();

    let current = tokio::fs::read_to_string(&path)
        .await
        .with_context(|| format!("Failed to read {}", path.display()))?;
    let old_blocks = match &previous {
        Some(prev) => {
            let content = tokio::fs::read_to_string(prev)
                .await
                .with_context(|| format!("Failed to read {}", prev.display()))?;
            extract_blocks(&content, &relative)
        }
        None => Vec::new(),
    };
    let new_blocks = extract_blocks(&current, &relative);
    let diff = diff_blocks(&old_blocks, &new_blocks);

    let rel_str = relative.to_string_lossy();
    let messages = messages_from_diff(&rel_str, &diff, Utc::now().timestamp_millis());

    let pool = db::connect(config).await?;
    let queue = SqliteQueue::new(
        pool.clone(),
        config.consumer.queue.clone(),
        Duration::from_millis(config.consumer.poll_interval_ms),
    );
    let retry = RetryPolicy::from_config(&config.retry);
    for message in &messages {
        let body = message.to_bytes()?;
        retry.run("publish", || queue.publish(&body)).await?;
    }

    println!("publish {}", rel_str);
    println!("  added: {}", diff.added.len());
    println!("  modified: {}", diff.modified.len());
    println!("  deleted: {}", diff.deleted.len());
    println!("  enqueued: {}", messages.len());

    pool.close().await;
    Ok(())
}

/// Decide every pending concept candidate and commit the results.
pub async fn run_dedup(config: &Config, json: bool) -> Result<()> {
    let pool = db::connect(config).await?;
    let graph = SqliteBlockStore::new(pool.clone());
    let mut index = SimilarityIndex::new(
        Arc::new(SqliteCandidateStore::new(pool.clone())),
        config.similarity.clone(),
        RetryPolicy::from_config(&config.retry),
    );

    let (batch, commit) = index.run_pending(&graph).await?;

    if json {
        let report = serde_json::json!({ "batch": batch, "commit": commit });
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!("dedup");
        for r in &batch.results {
            let action = match r.decision.action {
                DecisionAction::Merge => "merge",
                DecisionAction::Promote => "promote",
            };
            println!(
                "  {:<8} {:<36} {:.3}  {}",
                action, r.candidate_id, r.decision.confidence, r.decision.reason
            );
        }
        println!("  processed: {}", batch.total_processed);
        println!("  merged: {}  promoted: {}", commit.merged, commit.promoted);
        if commit.skipped > 0 {
            println!("  skipped: {}", commit.skipped);
        }
        if let Some(err) = &batch.error {
            println!("  batch error: {}", err);
        }
        for err in &commit.errors {
            println!("  error: {}", err);
        }
        println!("ok");
    }

    pool.close().await;
    Ok(())
}

/// Print the blocks the parser extracts from `file`.
pub async fn run_inspect(file: &Path, json: bool) -> Result<()> {
    let content = tokio::fs::read_to_string(file)
        .await
        .with_context(|| format!("Failed to read {}", file.display()))?;
    let blocks = extract_blocks(&content, file);

    if json {
        println!("{}", serde_json::to_string_pretty(&blocks)?);
        return Ok(());
    }

    println!("{}: {} block(s)", file.display(), blocks.len());
    for block in &blocks {
        println!();
        println!("  id:      {}", block.id);
        println!("  type:    {}", block.block_type);
        println!("  version: {}", block.version);
        println!("  hash:    {}", block.content_hash);
        let preview: String = block.text.chars().take(120).collect();
        println!("  text:    {}", preview.replace('\n', " "));
    }
    Ok(())
}
