//! Compare one extracted block against its graph node and write if needed.
//!
//! Both sync paths funnel through [`reconcile_block`]; they differ only in
//! [`WritePolicy`]. The vault sweep runs [`WritePolicy::VaultAuthoritative`]
//! and writes the vault's version as-is, even when that lowers the stored
//! version. The dirty-block consumer runs [`WritePolicy::RejectStale`] and
//! refuses any write that would move a node to a lower version, because
//! individual change events may arrive late, twice, or out of order.

use serde::Serialize;
use tracing::{debug, info};

use crate::error::{SyncError, SyncResult};
use crate::models::VersionedBlock;
use crate::retry::RetryPolicy;
use crate::store::BlockStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WritePolicy {
    /// The vault is ground truth; no version arbitration.
    VaultAuthoritative,
    /// Skip writes whose vault version is below the stored version.
    RejectStale,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum BlockOutcome {
    Created,
    Updated { previous_version: i64 },
    Unchanged,
    /// The write was skipped because the graph already holds a newer
    /// version. Not a failure.
    VersionConflict { vault_version: i64, graph_version: i64 },
}

/// Apply `block` to the graph under `policy`. Every store call is retried
/// under `retry`.
///
/// Under [`WritePolicy::RejectStale`] the writes themselves carry the
/// version guard, so a newer version committed by another writer between
/// the read and the write is never overwritten.
pub async fn reconcile_block(
    store: &dyn BlockStore,
    retry: &RetryPolicy,
    block: &VersionedBlock,
    policy: WritePolicy,
) -> SyncResult<BlockOutcome> {
    let existing = retry
        .run("get_block", || store.get_block(&block.id))
        .await?;

    let Some(node) = existing else {
        match policy {
            WritePolicy::VaultAuthoritative => {
                retry
                    .run("create_block", || store.create_block(block))
                    .await?;
            }
            WritePolicy::RejectStale => {
                let written = retry
                    .run("create_block", || store.create_block_unless_stale(block))
                    .await?;
                if !written {
                    return refused(store, retry, block).await;
                }
            }
        }
        debug!(block_id = %block.id, version = block.version, "created block node");
        return Ok(BlockOutcome::Created);
    };

    if node.hash == block.content_hash {
        return Ok(BlockOutcome::Unchanged);
    }

    match policy {
        WritePolicy::VaultAuthoritative => {
            retry
                .run("update_block", || store.update_block(block))
                .await?;
        }
        WritePolicy::RejectStale => {
            if block.version < node.version {
                return Ok(conflict(block, node.version));
            }
            let written = retry
                .run("update_block", || store.update_block_unless_stale(block))
                .await?;
            if !written {
                return refused(store, retry, block).await;
            }
        }
    }
    debug!(
        block_id = %block.id,
        from = node.version,
        to = block.version,
        "updated block node"
    );
    Ok(BlockOutcome::Updated {
        previous_version: node.version,
    })
}

fn conflict(block: &VersionedBlock, graph_version: i64) -> BlockOutcome {
    info!(
        block_id = %block.id,
        vault_version = block.version,
        graph_version,
        "version conflict, keeping newer graph node"
    );
    BlockOutcome::VersionConflict {
        vault_version: block.version,
        graph_version,
    }
}

/// A guarded write was refused: another writer got there first with a
/// higher version. Re-read to report what the graph now holds.
async fn refused(
    store: &dyn BlockStore,
    retry: &RetryPolicy,
    block: &VersionedBlock,
) -> SyncResult<BlockOutcome> {
    match retry
        .run("get_block", || store.get_block(&block.id))
        .await?
    {
        Some(current) => Ok(conflict(block, current.version)),
        None => Err(SyncError::Invalid(format!(
            "block '{}' disappeared during a guarded write",
            block.id
        ))),
    }
}
