//! In-memory [`BlockStore`] and [`CandidateStore`] implementations.
//!
//! Uses `HashMap` and `Vec` behind `std::sync::RwLock`. Both stores can be
//! told to fail their next N calls with a transient error, which is how the
//! retry and redelivery paths are exercised in tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{PoisonError, RwLock};

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;

use crate::error::{SyncError, SyncResult};
use crate::models::{BlockNode, CandidateStatus, Concept, ConceptCandidate, VersionedBlock};

use super::{BlockStore, CandidateStore};

fn poisoned<T>(_: PoisonError<T>) -> SyncError {
    SyncError::Unavailable("in-memory store lock poisoned".to_string())
}

/// Counts down injected failures; returns an error while any remain.
#[derive(Default)]
struct FaultInjector {
    remaining: AtomicU32,
}

impl FaultInjector {
    fn arm(&self, n: u32) {
        self.remaining.store(n, Ordering::SeqCst);
    }

    fn check(&self, op: &str) -> SyncResult<()> {
        let hit = self
            .remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if hit {
            Err(SyncError::Unavailable(format!("injected failure in {}", op)))
        } else {
            Ok(())
        }
    }
}

/// In-memory graph store.
#[derive(Default)]
pub struct InMemoryBlockStore {
    blocks: RwLock<HashMap<String, BlockNode>>,
    concepts: RwLock<Vec<Concept>>,
    writes: AtomicU64,
    faults: FaultInjector,
}

impl InMemoryBlockStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a node directly, bypassing write accounting.
    pub fn insert_node(&self, node: BlockNode) {
        if let Ok(mut blocks) = self.blocks.write() {
            blocks.insert(node.id.clone(), node);
        }
    }

    pub fn node(&self, id: &str) -> Option<BlockNode> {
        self.blocks.read().ok().and_then(|b| b.get(id).cloned())
    }

    pub fn len(&self) -> usize {
        self.blocks.read().map(|b| b.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of successful block creates and updates.
    pub fn write_count(&self) -> u64 {
        self.writes.load(Ordering::SeqCst)
    }

    pub fn concepts(&self) -> Vec<Concept> {
        self.concepts.read().map(|c| c.clone()).unwrap_or_default()
    }

    /// Make the next `n` calls of any kind fail with a transient error.
    pub fn fail_next(&self, n: u32) {
        self.faults.arm(n);
    }

    fn to_node(block: &VersionedBlock) -> BlockNode {
        BlockNode {
            id: block.id.clone(),
            text: block.text.clone(),
            hash: block.content_hash.clone(),
            version: block.version,
            source_file: block.source_file.display().to_string(),
            needs_reprocessing: true,
            last_updated: Utc::now(),
        }
    }
}

#[async_trait]
impl BlockStore for InMemoryBlockStore {
    async fn get_block(&self, id: &str) -> SyncResult<Option<BlockNode>> {
        self.faults.check("get_block")?;
        let blocks = self.blocks.read().map_err(poisoned)?;
        Ok(blocks.get(id).cloned())
    }

    async fn create_block(&self, block: &VersionedBlock) -> SyncResult<()> {
        self.faults.check("create_block")?;
        let mut blocks = self.blocks.write().map_err(poisoned)?;
        blocks.insert(block.id.clone(), Self::to_node(block));
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn update_block(&self, block: &VersionedBlock) -> SyncResult<()> {
        self.faults.check("update_block")?;
        let mut blocks = self.blocks.write().map_err(poisoned)?;
        match blocks.get_mut(&block.id) {
            Some(node) => {
                *node = Self::to_node(block);
                self.writes.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
            None => Err(SyncError::Invalid(format!(
                "cannot update missing block '{}'",
                block.id
            ))),
        }
    }

    async fn create_block_unless_stale(&self, block: &VersionedBlock) -> SyncResult<bool> {
        self.faults.check("create_block_unless_stale")?;
        let mut blocks = self.blocks.write().map_err(poisoned)?;
        if blocks.get(&block.id).is_some_and(|n| n.version > block.version) {
            return Ok(false);
        }
        blocks.insert(block.id.clone(), Self::to_node(block));
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(true)
    }

    async fn update_block_unless_stale(&self, block: &VersionedBlock) -> SyncResult<bool> {
        self.faults.check("update_block_unless_stale")?;
        let mut blocks = self.blocks.write().map_err(poisoned)?;
        match blocks.get_mut(&block.id) {
            Some(node) if node.version <= block.version => {
                *node = Self::to_node(block);
                self.writes.fetch_add(1, Ordering::SeqCst);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn create_concepts(&self, concepts: &[Concept]) -> SyncResult<Vec<Concept>> {
        self.faults.check("create_concepts")?;
        let mut stored = self.concepts.write().map_err(poisoned)?;
        for concept in concepts {
            stored.retain(|c| c.id != concept.id);
            stored.push(concept.clone());
        }
        Ok(concepts.to_vec())
    }
}

struct StoredCandidate {
    candidate: ConceptCandidate,
    metadata: Value,
}

/// In-memory candidate store. Insertion order is preserved.
#[derive(Default)]
pub struct InMemoryCandidateStore {
    candidates: RwLock<Vec<StoredCandidate>>,
    faults: FaultInjector,
}

impl InMemoryCandidateStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, candidate: ConceptCandidate) {
        if let Ok(mut stored) = self.candidates.write() {
            stored.push(StoredCandidate {
                candidate,
                metadata: Value::Object(Default::default()),
            });
        }
    }

    pub fn get(&self, id: &str) -> Option<ConceptCandidate> {
        self.candidates.read().ok().and_then(|s| {
            s.iter()
                .find(|sc| sc.candidate.id == id)
                .map(|sc| sc.candidate.clone())
        })
    }

    pub fn metadata(&self, id: &str) -> Option<Value> {
        self.candidates.read().ok().and_then(|s| {
            s.iter()
                .find(|sc| sc.candidate.id == id)
                .map(|sc| sc.metadata.clone())
        })
    }

    /// Make the next `n` calls of any kind fail with a transient error.
    pub fn fail_next(&self, n: u32) {
        self.faults.arm(n);
    }
}

#[async_trait]
impl CandidateStore for InMemoryCandidateStore {
    async fn get_candidates_by_status(
        &self,
        status: CandidateStatus,
    ) -> SyncResult<Vec<ConceptCandidate>> {
        self.faults.check("get_candidates_by_status")?;
        let stored = self.candidates.read().map_err(poisoned)?;
        Ok(stored
            .iter()
            .filter(|sc| sc.candidate.status == status)
            .map(|sc| sc.candidate.clone())
            .collect())
    }

    async fn update_status(
        &self,
        candidate_id: &str,
        new_status: CandidateStatus,
        metadata: &Value,
    ) -> SyncResult<()> {
        self.faults.check("update_status")?;
        let mut stored = self.candidates.write().map_err(poisoned)?;
        let entry = stored
            .iter_mut()
            .find(|sc| sc.candidate.id == candidate_id)
            .ok_or_else(|| SyncError::Invalid(format!("unknown candidate '{}'", candidate_id)))?;

        if entry.candidate.status.is_terminal() {
            return Err(SyncError::Invalid(format!(
                "candidate '{}' is already {}",
                candidate_id, entry.candidate.status
            )));
        }

        entry.candidate.status = new_status;
        if let Some(concept_id) = metadata.get("concept_id").and_then(|v| v.as_str()) {
            entry.candidate.concept_id = Some(concept_id.to_string());
        }
        entry.metadata = metadata.clone();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::BlockType;
    use std::path::PathBuf;

    fn block(id: &str, version: i64) -> VersionedBlock {
        VersionedBlock {
            id: id.to_string(),
            text: "text".to_string(),
            version,
            content_hash: "hash".to_string(),
            source_file: PathBuf::from("tier1/a.md"),
            block_type: BlockType::Inline,
        }
    }

    #[tokio::test]
    async fn test_injected_failures_count_down() {
        let store = InMemoryBlockStore::new();
        store.fail_next(2);
        assert!(store.get_block("a").await.is_err());
        assert!(store.create_block(&block("a", 1)).await.is_err());
        assert!(store.create_block(&block("a", 1)).await.is_ok());
        assert_eq!(store.write_count(), 1);
        assert_eq!(store.node("a").unwrap().version, 1);
    }

    #[tokio::test]
    async fn test_update_missing_block_is_invalid() {
        let store = InMemoryBlockStore::new();
        let err = store.update_block(&block("ghost", 1)).await.unwrap_err();
        assert!(matches!(err, SyncError::Invalid(_)));
    }

    #[tokio::test]
    async fn test_guarded_writes_refuse_lower_versions() {
        let store = InMemoryBlockStore::new();
        store.create_block(&block("a", 5)).await.unwrap();

        assert!(!store.update_block_unless_stale(&block("a", 4)).await.unwrap());
        assert!(!store.create_block_unless_stale(&block("a", 4)).await.unwrap());
        assert_eq!(store.node("a").unwrap().version, 5);
        assert_eq!(store.write_count(), 1);

        assert!(store.update_block_unless_stale(&block("a", 5)).await.unwrap());
        assert!(store.create_block_unless_stale(&block("a", 6)).await.unwrap());
        assert_eq!(store.node("a").unwrap().version, 6);
        assert!(!store.update_block_unless_stale(&block("ghost", 1)).await.unwrap());
    }

    #[tokio::test]
    async fn test_terminal_status_is_final() {
        let store = InMemoryCandidateStore::new();
        store.insert(ConceptCandidate {
            id: "c1".to_string(),
            text: "Rust".to_string(),
            normalized_text: "rust".to_string(),
            embedding: None,
            source_node_id: "blk_1".to_string(),
            source_node_type: "block".to_string(),
            status: CandidateStatus::Pending,
            concept_id: None,
        });

        let meta = serde_json::json!({ "concept_id": "concept_1" });
        store
            .update_status("c1", CandidateStatus::Promoted, &meta)
            .await
            .unwrap();
        assert_eq!(store.get("c1").unwrap().concept_id.as_deref(), Some("concept_1"));

        let again = store
            .update_status("c1", CandidateStatus::Merged, &Value::Null)
            .await;
        assert!(matches!(again, Err(SyncError::Invalid(_))));
        assert_eq!(store.get("c1").unwrap().status, CandidateStatus::Promoted);
    }
}
