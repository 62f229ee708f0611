//! Storage collaborators for the sync and dedup engines.
//!
//! [`BlockStore`] is the graph: it holds block nodes and promoted concepts.
//! [`CandidateStore`] holds concept candidates awaiting a decision.
//! Both are narrow async traits with two adapters each:
//!
//! | Adapter | Purpose |
//! |---------|---------|
//! | [`memory::InMemoryBlockStore`] / [`memory::InMemoryCandidateStore`] | Tests and embedding, with fault injection |
//! | [`sqlite::SqliteBlockStore`] / [`sqlite::SqliteCandidateStore`] | Production, backed by the `vsync` database |
//!
//! Implementations must be `Send + Sync`. Callers wrap every call in
//! [`crate::retry::RetryPolicy`]; adapters report transient failures as
//! [`crate::error::SyncError::Unavailable`] or
//! [`crate::error::SyncError::Database`].

pub mod memory;
pub mod sqlite;

use async_trait::async_trait;
use serde_json::Value;

use crate::error::SyncResult;
use crate::models::{BlockNode, CandidateStatus, Concept, ConceptCandidate, VersionedBlock};

/// Graph collaborator consumed by the vault sweep, the dirty-block
/// consumer, and the concept promotion path.
#[async_trait]
pub trait BlockStore: Send + Sync {
    /// Fetch the node for a block id, if any.
    async fn get_block(&self, id: &str) -> SyncResult<Option<BlockNode>>;

    /// Create the node for a block. Merge-on-id: creating an existing id
    /// overwrites it.
    ///
    /// The node is stamped with the current time and flagged for
    /// downstream reprocessing.
    async fn create_block(&self, block: &VersionedBlock) -> SyncResult<()>;

    /// Overwrite text, hash, version, and source file of an existing node,
    /// refreshing `last_updated` and the reprocessing flag.
    async fn update_block(&self, block: &VersionedBlock) -> SyncResult<()>;

    /// Like [`create_block`](Self::create_block), but an existing node is
    /// only overwritten while its stored version is `<= block.version`.
    /// Check and write are one atomic step. Returns `false` when the write
    /// was refused.
    async fn create_block_unless_stale(&self, block: &VersionedBlock) -> SyncResult<bool>;

    /// Like [`update_block`](Self::update_block), but only while the stored
    /// version is `<= block.version`, checked atomically with the write.
    /// Returns `false` when the write was refused or the node is gone.
    async fn update_block_unless_stale(&self, block: &VersionedBlock) -> SyncResult<bool>;

    /// Persist promoted concepts, returning the ones stored.
    async fn create_concepts(&self, concepts: &[Concept]) -> SyncResult<Vec<Concept>>;
}

/// Backing store for concept candidates.
#[async_trait]
pub trait CandidateStore: Send + Sync {
    /// Candidates with the given status, in insertion order.
    async fn get_candidates_by_status(
        &self,
        status: CandidateStatus,
    ) -> SyncResult<Vec<ConceptCandidate>>;

    /// Move a pending candidate to `new_status`, attaching `metadata`.
    ///
    /// Fails with [`crate::error::SyncError::Invalid`] if the candidate is
    /// unknown or already terminal. A `"concept_id"` string in `metadata`
    /// is recorded as the candidate's concept.
    async fn update_status(
        &self,
        candidate_id: &str,
        new_status: CandidateStatus,
        metadata: &Value,
    ) -> SyncResult<()>;
}
