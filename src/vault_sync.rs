//! Full reconciliation sweep across the vault's tiers.
//!
//! [`VaultSyncJob::run`] walks every configured tier in order, extracts the
//! versioned blocks from each matching file, and reconciles them against
//! the graph with [`WritePolicy::VaultAuthoritative`]. Failures are
//! contained: an unreadable file or a block whose write exhausts its retries
//! is counted under `errors` and the sweep moves on.
//!
//! # Counters
//!
//! | Field | Meaning |
//! |-------|---------|
//! | `files_processed` | Files read and parsed, including ones with no blocks |
//! | `files_skipped` | Files read that carried no blocks |
//! | `blocks_processed` | Blocks attempted against the graph |
//! | `blocks_new` / `blocks_updated` / `blocks_unchanged` | Reconcile outcomes |
//! | `errors` | Failed files plus failed blocks |

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use globset::{Glob, GlobSet, GlobSetBuilder};
use serde::Serialize;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::block::extract_blocks;
use crate::config::VaultConfig;
use crate::error::{SyncError, SyncResult};
use crate::reconcile::{reconcile_block, BlockOutcome, WritePolicy};
use crate::retry::RetryPolicy;
use crate::store::BlockStore;

const DEFAULT_EXCLUDES: &[&str] = &["**/.git/**", "**/.obsidian/**", "**/.trash/**"];

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SyncCounts {
    pub files_processed: u64,
    pub files_skipped: u64,
    pub blocks_processed: u64,
    pub blocks_new: u64,
    pub blocks_updated: u64,
    pub blocks_unchanged: u64,
    pub errors: u64,
}

impl SyncCounts {
    pub fn absorb(&mut self, other: &SyncCounts) {
        self.files_processed += other.files_processed;
        self.files_skipped += other.files_skipped;
        self.blocks_processed += other.blocks_processed;
        self.blocks_new += other.blocks_new;
        self.blocks_updated += other.blocks_updated;
        self.blocks_unchanged += other.blocks_unchanged;
        self.errors += other.errors;
    }

    fn record(&mut self, outcome: BlockOutcome) {
        match outcome {
            BlockOutcome::Created => self.blocks_new += 1,
            BlockOutcome::Updated { .. } => self.blocks_updated += 1,
            BlockOutcome::Unchanged => self.blocks_unchanged += 1,
            // Unreachable under VaultAuthoritative; counted as unchanged
            // since nothing was written.
            BlockOutcome::VersionConflict { .. } => self.blocks_unchanged += 1,
        }
    }
}

/// Result of syncing one file.
#[derive(Debug, Clone, Default, Serialize)]
pub struct FileStats {
    pub path: PathBuf,
    pub counts: SyncCounts,
    pub errors: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct TierStats {
    pub tier: String,
    /// False when the tier directory does not exist.
    pub present: bool,
    pub counts: SyncCounts,
    pub errors: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct JobStats {
    pub tiers: Vec<TierStats>,
    pub totals: SyncCounts,
    pub errors: Vec<String>,
    pub started_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub dry_run: bool,
}

pub struct VaultSyncJob {
    store: Arc<dyn BlockStore>,
    vault: VaultConfig,
    retry: RetryPolicy,
    include: GlobSet,
    exclude: GlobSet,
    dry_run: bool,
}

impl VaultSyncJob {
    pub fn new(
        store: Arc<dyn BlockStore>,
        vault: VaultConfig,
        retry: RetryPolicy,
    ) -> SyncResult<Self> {
        let include = build_globset(&vault.include_globs)?;

        let mut excludes: Vec<String> = DEFAULT_EXCLUDES.iter().map(|s| s.to_string()).collect();
        excludes.extend(vault.exclude_globs.iter().cloned());
        let exclude = build_globset(&excludes)?;

        Ok(Self {
            store,
            vault,
            retry,
            include,
            exclude,
            dry_run: false,
        })
    }

    /// Parse and count without writing to the graph.
    pub fn dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    /// Sweep every configured tier.
    pub async fn run(&self) -> JobStats {
        let tiers = self.vault.tiers.clone();
        self.run_tiers(&tiers).await
    }

    /// Sweep the given tiers in order.
    pub async fn run_tiers(&self, tiers: &[String]) -> JobStats {
        let started_at = Utc::now();
        let clock = Instant::now();
        info!(
            root = %self.vault.root.display(),
            tiers = tiers.len(),
            dry_run = self.dry_run,
            "starting vault sync"
        );

        let mut totals = SyncCounts::default();
        let mut errors = Vec::new();
        let mut tier_stats = Vec::with_capacity(tiers.len());

        for tier in tiers {
            let stats = self.sync_tier(tier).await;
            totals.absorb(&stats.counts);
            errors.extend(stats.errors.iter().cloned());
            tier_stats.push(stats);
        }

        let duration_ms = clock.elapsed().as_millis() as u64;
        info!(
            files = totals.files_processed,
            blocks = totals.blocks_processed,
            new = totals.blocks_new,
            updated = totals.blocks_updated,
            unchanged = totals.blocks_unchanged,
            errors = totals.errors,
            duration_ms,
            "vault sync finished"
        );

        JobStats {
            tiers: tier_stats,
            totals,
            errors,
            started_at,
            duration_ms,
            dry_run: self.dry_run,
        }
    }

    pub async fn sync_tier(&self, tier: &str) -> TierStats {
        let mut stats = TierStats {
            tier: tier.to_string(),
            ..Default::default()
        };

        let tier_dir = self.vault.root.join(tier);
        if !tier_dir.is_dir() {
            warn!(tier, path = %tier_dir.display(), "tier directory missing, skipping");
            return stats;
        }
        stats.present = true;

        for path in self.collect_files(&tier_dir, &mut stats) {
            let file = self.sync_file(&path).await;
            stats.counts.absorb(&file.counts);
            stats.errors.extend(file.errors);
        }

        debug!(
            tier,
            files = stats.counts.files_processed,
            blocks = stats.counts.blocks_processed,
            errors = stats.counts.errors,
            "tier done"
        );
        stats
    }

    /// Sync one file. Never fails: problems are reported in the returned
    /// counters and error list.
    pub async fn sync_file(&self, path: &Path) -> FileStats {
        let relative = path
            .strip_prefix(&self.vault.root)
            .unwrap_or(path)
            .to_path_buf();
        let mut stats = FileStats {
            path: relative.clone(),
            ..Default::default()
        };

        let content = match tokio::fs::read_to_string(path).await {
            Ok(content) => content,
            Err(e) => {
                let err = SyncError::io(path, e);
                warn!(file = %relative.display(), error = %err, "failed to read file");
                stats.counts.errors += 1;
                stats.errors.push(err.to_string());
                return stats;
            }
        };

        stats.counts.files_processed += 1;
        let blocks = extract_blocks(&content, &relative);
        if blocks.is_empty() {
            stats.counts.files_skipped += 1;
            return stats;
        }

        for block in &blocks {
            stats.counts.blocks_processed += 1;
            if self.dry_run {
                continue;
            }
            match reconcile_block(
                self.store.as_ref(),
                &self.retry,
                block,
                WritePolicy::VaultAuthoritative,
            )
            .await
            {
                Ok(outcome) => stats.counts.record(outcome),
                Err(e) => {
                    warn!(
                        file = %relative.display(),
                        block_id = %block.id,
                        error = %e,
                        "failed to sync block"
                    );
                    stats.counts.errors += 1;
                    stats
                        .errors
                        .push(format!("{} [{}]: {}", relative.display(), block.id, e));
                }
            }
        }

        stats
    }

    /// Matching files under `dir`, sorted for deterministic order.
    fn collect_files(&self, dir: &Path, stats: &mut TierStats) -> Vec<PathBuf> {
        let mut files = Vec::new();
        for entry in WalkDir::new(dir) {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    warn!(tier = %stats.tier, error = %e, "failed to walk directory entry");
                    stats.counts.errors += 1;
                    stats.errors.push(e.to_string());
                    continue;
                }
            };
            if !entry.file_type().is_file() {
                continue;
            }

            let path = entry.path();
            let relative = path.strip_prefix(&self.vault.root).unwrap_or(path);
            let rel_str = relative.to_string_lossy();
            if self.exclude.is_match(rel_str.as_ref()) || !self.include.is_match(rel_str.as_ref()) {
                continue;
            }
            files.push(path.to_path_buf());
        }
        files.sort();
        files
    }
}

fn build_globset(patterns: &[String]) -> SyncResult<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        let glob = Glob::new(pattern)
            .map_err(|e| SyncError::Invalid(format!("bad glob '{}': {}", pattern, e)))?;
        builder.add(glob);
    }
    builder
        .build()
        .map_err(|e| SyncError::Invalid(format!("bad glob set: {}", e)))
}
