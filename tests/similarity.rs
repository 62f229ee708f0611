use std::sync::Arc;

use vault_sync::config::SimilarityConfig;
use vault_sync::models::{CandidateStatus, ConceptCandidate};
use vault_sync::retry::RetryPolicy;
use vault_sync::similarity::{DecisionAction, SimilarityIndex};
use vault_sync::store::memory::{InMemoryBlockStore, InMemoryCandidateStore};
use vault_sync::store::CandidateStore;

/// Unit vector whose cosine similarity with `[1, 0]` is `s`.
fn at(s: f32) -> Vec<f32> {
    vec![s, (1.0 - s * s).sqrt()]
}

fn candidate(id: &str, text: &str, embedding: Option<Vec<f32>>, status: CandidateStatus) -> ConceptCandidate {
    ConceptCandidate {
        id: id.to_string(),
        text: text.to_string(),
        normalized_text: text.to_lowercase(),
        embedding,
        source_node_id: format!("blk_{}", id),
        source_node_type: "block".to_string(),
        status,
        concept_id: match status {
            CandidateStatus::Promoted => Some(format!("concept_{}", id)),
            _ => None,
        },
    }
}

fn config() -> SimilarityConfig {
    SimilarityConfig {
        threshold: 0.9,
        top_k: 5,
        dims: 2,
        include_statuses: vec![CandidateStatus::Promoted, CandidateStatus::Pending],
    }
}

fn index(store: &Arc<InMemoryCandidateStore>) -> SimilarityIndex {
    SimilarityIndex::new(store.clone(), config(), RetryPolicy::immediate(1))
}

fn seeded_store() -> Arc<InMemoryCandidateStore> {
    let store = Arc::new(InMemoryCandidateStore::new());
    store.insert(candidate(
        "existing",
        "Machine Learning",
        Some(vec![1.0, 0.0]),
        CandidateStatus::Promoted,
    ));
    store
}

#[tokio::test]
async fn test_high_similarity_merges() {
    let store = seeded_store();
    let mut index = index(&store);
    assert_eq!(index.build_index(false).await.unwrap(), 1);

    let newcomer = candidate("new", "machine learning", Some(at(0.95)), CandidateStatus::Pending);
    let decision = index.decide(&newcomer);

    assert_eq!(decision.action, DecisionAction::Merge);
    assert!((decision.confidence - 0.95).abs() < 1e-3);
    assert!(decision.reason.contains("Machine Learning"));
    let best = decision.best_match().unwrap();
    assert_eq!(best.matched_candidate_id, "existing");
    assert_eq!(best.matched_concept_id.as_deref(), Some("concept_existing"));
}

#[tokio::test]
async fn test_low_similarity_promotes_with_reason() {
    let store = seeded_store();
    let mut index = index(&store);
    index.build_index(false).await.unwrap();

    let newcomer = candidate("new", "Deep Sea Fishing", Some(at(0.7)), CandidateStatus::Pending);
    let decision = index.decide(&newcomer);

    assert_eq!(decision.action, DecisionAction::Promote);
    assert!(decision.reason.contains("0.700"), "reason: {}", decision.reason);
    assert!(decision.reason.contains("0.9"), "reason: {}", decision.reason);
    assert!((decision.confidence - 0.3).abs() < 1e-3);
    assert_eq!(decision.matches.len(), 1);
}

#[tokio::test]
async fn test_no_matches_promotes_with_full_confidence() {
    let store = Arc::new(InMemoryCandidateStore::new());
    let mut index = index(&store);
    assert_eq!(index.build_index(false).await.unwrap(), 0);
    assert!(index.is_built());

    let decision = index.decide(&candidate("solo", "Solo", Some(at(1.0)), CandidateStatus::Pending));
    assert_eq!(decision.action, DecisionAction::Promote);
    assert_eq!(decision.confidence, 1.0);
    assert_eq!(decision.reason, "no similar candidates found");
}

#[tokio::test]
async fn test_unbuilt_index_and_missing_embedding_return_nothing() {
    let store = seeded_store();
    let mut index = index(&store);

    let query = candidate("query", "Query", Some(vec![1.0, 0.0]), CandidateStatus::Pending);
    assert!(index.find_similar(&query, 5).unwrap().is_empty());

    index.build_index(false).await.unwrap();
    let bare = candidate("bare", "Bare", None, CandidateStatus::Pending);
    assert!(index.find_similar(&bare, 5).unwrap().is_empty());
    assert_eq!(index.decide(&bare).action, DecisionAction::Promote);
}

#[tokio::test]
async fn test_search_failure_fails_safe_to_promote() {
    let store = seeded_store();
    let mut index = index(&store);
    index.build_index(false).await.unwrap();

    let wrong_dims = candidate("odd", "Odd", Some(vec![1.0, 0.0, 0.0]), CandidateStatus::Pending);
    assert!(index.find_similar(&wrong_dims, 5).is_err());

    let decision = index.decide(&wrong_dims);
    assert_eq!(decision.action, DecisionAction::Promote);
    assert_eq!(decision.confidence, 0.0);
    assert!(decision.reason.contains("similarity search failed"));
}

#[tokio::test]
async fn test_tie_goes_to_earliest_inserted() {
    let store = Arc::new(InMemoryCandidateStore::new());
    store.insert(candidate("first", "Rust", Some(vec![1.0, 0.0]), CandidateStatus::Promoted));
    store.insert(candidate("second", "Rust lang", Some(vec![1.0, 0.0]), CandidateStatus::Promoted));
    let mut index = index(&store);
    index.build_index(false).await.unwrap();

    let decision = index.decide(&candidate("q", "rust", Some(vec![1.0, 0.0]), CandidateStatus::Pending));
    assert_eq!(decision.action, DecisionAction::Merge);
    assert_eq!(decision.best_match().unwrap().matched_candidate_id, "first");
}

#[tokio::test]
async fn test_build_is_idempotent_unless_forced() {
    let store = seeded_store();
    store.insert(candidate("p1", "Pending One", Some(at(0.1)), CandidateStatus::Pending));
    store.insert(candidate("m1", "Merged One", Some(at(0.2)), CandidateStatus::Merged));
    store.insert(candidate("noemb", "No Embedding", None, CandidateStatus::Pending));
    let mut index = index(&store);

    assert_eq!(index.build_index(false).await.unwrap(), 2);
    assert_eq!(index.build_index(false).await.unwrap(), 0);
    assert_eq!(index.build_index(true).await.unwrap(), 2);
    assert_eq!(index.len(), 2);
}

#[tokio::test]
async fn test_batch_counts_add_up() {
    let store = seeded_store();
    let batch: Vec<ConceptCandidate> = [
        ("c1", 0.99),
        ("c2", 0.5),
        ("c3", 0.92),
        ("c4", 0.0),
    ]
    .iter()
    .map(|(id, s)| candidate(id, id, Some(at(*s)), CandidateStatus::Pending))
    .collect();
    for c in &batch {
        store.insert(c.clone());
    }

    let mut index = index(&store);
    let result = index.process_batch(&batch).await;

    assert!(result.success);
    assert_eq!(result.results.len(), batch.len());
    assert_eq!(result.total_processed, batch.len());
    assert_eq!(result.merged_count + result.promoted_count, result.total_processed);
    assert_eq!(result.merged_count, 2);
    let ids: Vec<&str> = result.results.iter().map(|r| r.candidate_id.as_str()).collect();
    assert_eq!(ids, vec!["c1", "c2", "c3", "c4"]);
}

#[tokio::test]
async fn test_rebuild_failure_promotes_whole_batch() {
    let store = seeded_store();
    let batch = vec![
        candidate("a", "A", Some(at(0.99)), CandidateStatus::Pending),
        candidate("b", "B", Some(at(0.98)), CandidateStatus::Pending),
    ];
    store.fail_next(1);

    let mut index = index(&store);
    let result = index.process_batch(&batch).await;

    assert!(!result.success);
    assert!(result.error.is_some());
    assert_eq!(result.total_processed, 2);
    assert_eq!(result.results.len(), 2);
    assert_eq!(result.promoted_count, 2);
    for r in &result.results {
        assert_eq!(r.decision.action, DecisionAction::Promote);
        assert_eq!(r.decision.confidence, 0.0);
    }
}

#[tokio::test]
async fn test_near_duplicates_in_one_batch_promote_once() {
    let store = Arc::new(InMemoryCandidateStore::new());
    let batch = vec![
        candidate("p1", "Graph Databases", Some(vec![1.0, 0.0]), CandidateStatus::Pending),
        candidate("p2", "graph databases", Some(at(0.97)), CandidateStatus::Pending),
    ];
    for c in &batch {
        store.insert(c.clone());
    }

    let mut index = index(&store);
    let result = index.process_batch(&batch).await;
    assert_eq!(result.results[0].decision.action, DecisionAction::Promote);
    assert_eq!(result.results[1].decision.action, DecisionAction::Merge);
    assert_eq!(
        result.results[1].decision.best_match().unwrap().matched_candidate_id,
        "p1"
    );
}

#[tokio::test]
async fn test_commit_creates_concepts_and_marks_candidates() {
    let store = seeded_store();
    let batch = vec![
        candidate("dup", "machine learning", Some(at(0.96)), CandidateStatus::Pending),
        candidate("fresh", "Quantum Computing", Some(at(0.2)), CandidateStatus::Pending),
        candidate("fresh2", "quantum computing", Some(at(0.2)), CandidateStatus::Pending),
    ];
    for c in &batch {
        store.insert(c.clone());
    }
    let graph = InMemoryBlockStore::new();

    let mut index = index(&store);
    let result = index.process_batch(&batch).await;
    let commit = index.commit_batch(&result, &graph).await;

    assert_eq!(commit.promoted, 1);
    assert_eq!(commit.merged, 2);
    assert!(commit.errors.is_empty());

    let concepts = graph.concepts();
    assert_eq!(concepts.len(), 1);
    assert_eq!(concepts[0].name, "Quantum Computing");
    assert_eq!(concepts[0].source_candidate_id, "fresh");

    let fresh = store.get("fresh").unwrap();
    assert_eq!(fresh.status, CandidateStatus::Promoted);
    assert_eq!(fresh.concept_id.as_deref(), Some(concepts[0].id.as_str()));

    assert_eq!(store.get("dup").unwrap().status, CandidateStatus::Merged);
    let dup_meta = store.metadata("dup").unwrap();
    assert_eq!(dup_meta["matched_candidate_id"], "existing");
    assert_eq!(dup_meta["matched_concept_id"], "concept_existing");

    // Merged into a candidate promoted in the same batch.
    let fresh2_meta = store.metadata("fresh2").unwrap();
    assert_eq!(fresh2_meta["matched_candidate_id"], "fresh");
    assert_eq!(fresh2_meta["matched_concept_id"], concepts[0].id.as_str());

    // A second commit of the same decisions touches nothing.
    let again = index.commit_batch(&result, &graph).await;
    assert_eq!(again.skipped, 3);
    assert_eq!(again.promoted + again.merged, 0);
    assert_eq!(graph.concepts().len(), 1);
}

#[tokio::test]
async fn test_run_pending_end_to_end() {
    let store = seeded_store();
    store.insert(candidate("dup", "ML", Some(at(0.93)), CandidateStatus::Pending));
    store.insert(candidate("new", "Compilers", Some(at(0.3)), CandidateStatus::Pending));
    let graph = InMemoryBlockStore::new();

    let mut index = index(&store);
    let (batch, commit) = index.run_pending(&graph).await.unwrap();
    assert_eq!(batch.total_processed, 2);
    assert_eq!(commit.merged, 1);
    assert_eq!(commit.promoted, 1);

    let pending = store
        .get_candidates_by_status(CandidateStatus::Pending)
        .await
        .unwrap();
    assert!(pending.is_empty());
}
