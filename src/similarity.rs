//! Concept deduplication: nearest-neighbor search over candidate
//! embeddings and the merge/promote decision.
//!
//! # Lifecycle
//!
//! A [`SimilarityIndex`] starts `Uninitialized`. [`SimilarityIndex::build_index`]
//! loads every candidate whose status is listed in
//! [`SimilarityConfig::include_statuses`] and replaces the index wholesale.
//! Queries against an unbuilt index return no matches.
//!
//! Building and deciding both take the index by reference, and building
//! needs `&mut`, so a rebuild can never interleave with a query on the same
//! instance. Share one across tasks behind a `tokio::sync::Mutex`.
//!
//! # Decision
//!
//! Only the best match matters. At or above the threshold the candidate is
//! merged into it; below, or with no match at all, the candidate is
//! promoted. A failed search also promotes (with confidence `0.0`), so a
//! candidate is never dropped.
//!
//! # Backend
//!
//! [`CosineIndex`] is an HNSW graph (`hnsw_rs`) under cosine distance. The
//! graph only proposes neighbors: each one is re-scored with the exact
//! cosine similarity, clamped to `[0, 1]`, and ranked by score then
//! insertion order, so merges are deterministic.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use hnsw_rs::prelude::*;
use serde::Serialize;
use serde_json::json;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::SimilarityConfig;
use crate::embedding::cosine_similarity;
use crate::error::{SyncError, SyncResult};
use crate::models::{CandidateStatus, Concept, ConceptCandidate, SimilarityMatch};
use crate::retry::RetryPolicy;
use crate::store::{BlockStore, CandidateStore};

const HNSW_MAX_CONNECTIONS: usize = 16;
const HNSW_EF_CONSTRUCTION: usize = 200;
const HNSW_MIN_EF_SEARCH: usize = 64;

/// `1 - cos`, with zero vectors at distance 1.
#[derive(Clone, Copy, Default)]
struct CosineDistance;

impl Distance<f32> for CosineDistance {
    fn eval(&self, a: &[f32], b: &[f32]) -> f32 {
        (1.0 - cosine_similarity(a, b)).clamp(0.0, 2.0)
    }
}

struct IndexEntry {
    candidate_id: String,
    concept_id: Option<String>,
    text: String,
    vector: Vec<f32>,
}

/// Approximate nearest-neighbor index over candidate embeddings with a
/// fixed dimensionality. The HNSW point id of an entry is its position in
/// insertion order.
pub struct CosineIndex {
    dims: usize,
    entries: Vec<IndexEntry>,
    hnsw: Hnsw<'static, f32, CosineDistance>,
}

impl CosineIndex {
    pub fn with_capacity(dims: usize, capacity: usize) -> Self {
        let max_elements = capacity.max(1);
        let max_layer = 16.min((max_elements as f32).ln().trunc() as usize).max(1);
        Self {
            dims,
            entries: Vec::with_capacity(capacity),
            hnsw: Hnsw::new(
                HNSW_MAX_CONNECTIONS,
                max_elements,
                max_layer,
                HNSW_EF_CONSTRUCTION,
                CosineDistance,
            ),
        }
    }

    pub fn dims(&self) -> usize {
        self.dims
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Add a candidate's embedding. Returns false, without inserting, if
    /// the candidate has no embedding or its dimensionality is wrong.
    pub fn insert(&mut self, candidate: &ConceptCandidate) -> bool {
        match &candidate.embedding {
            Some(vector) if vector.len() == self.dims => {
                let idx = self.entries.len();
                self.hnsw.insert((&vector[..], idx));
                self.entries.push(IndexEntry {
                    candidate_id: candidate.id.clone(),
                    concept_id: candidate.concept_id.clone(),
                    text: candidate.text.clone(),
                    vector: vector.clone(),
                });
                true
            }
            _ => false,
        }
    }

    /// Up to `k` nearest entries, best first. `exclude` names an entry
    /// that must not appear in the results.
    pub fn search(&self, query: &[f32], k: usize, exclude: Option<&str>) -> Vec<SimilarityMatch> {
        if self.entries.is_empty() || k == 0 || query.len() != self.dims {
            return Vec::new();
        }

        // Over-fetch so the excluded entry and tied scores still leave k
        // candidates after re-ranking.
        let fetch = k
            .saturating_add(usize::from(exclude.is_some()))
            .saturating_mul(4)
            .min(self.entries.len());
        let ef = fetch.max(HNSW_MIN_EF_SEARCH);

        let mut scored: Vec<(f32, usize)> = self
            .hnsw
            .search(query, fetch, ef)
            .into_iter()
            .map(|n| n.d_id)
            .filter(|&idx| idx < self.entries.len())
            .filter(|&idx| exclude != Some(self.entries[idx].candidate_id.as_str()))
            .map(|idx| (self.score(query, idx), idx))
            .collect();

        scored.sort_by(|a, b| b.0.total_cmp(&a.0).then_with(|| a.1.cmp(&b.1)));
        scored.dedup_by_key(|(_, idx)| *idx);
        scored.truncate(k);
        self.to_matches(scored)
    }

    fn score(&self, query: &[f32], idx: usize) -> f32 {
        cosine_similarity(query, &self.entries[idx].vector).clamp(0.0, 1.0)
    }

    fn to_matches(&self, scored: Vec<(f32, usize)>) -> Vec<SimilarityMatch> {
        scored
            .into_iter()
            .map(|(score, idx)| {
                let e = &self.entries[idx];
                SimilarityMatch {
                    matched_candidate_id: e.candidate_id.clone(),
                    matched_concept_id: e.concept_id.clone(),
                    similarity_score: score,
                    matched_text: e.text.clone(),
                }
            })
            .collect()
    }

    /// Exhaustive scan with the same ranking as [`search`](Self::search).
    #[cfg(test)]
    fn exact_search(&self, query: &[f32], k: usize, exclude: Option<&str>) -> Vec<SimilarityMatch> {
        let mut scored: Vec<(f32, usize)> = (0..self.entries.len())
            .filter(|&idx| exclude != Some(self.entries[idx].candidate_id.as_str()))
            .map(|idx| (self.score(query, idx), idx))
            .collect();
        scored.sort_by(|a, b| b.0.total_cmp(&a.0).then_with(|| a.1.cmp(&b.1)));
        scored.truncate(k);
        self.to_matches(scored)
    }
}

enum IndexState {
    Uninitialized,
    Built(CosineIndex),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DecisionAction {
    Merge,
    Promote,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Decision {
    pub action: DecisionAction,
    pub confidence: f32,
    pub reason: String,
    pub matches: Vec<SimilarityMatch>,
}

impl Decision {
    fn promote(confidence: f32, reason: impl Into<String>, matches: Vec<SimilarityMatch>) -> Self {
        Self {
            action: DecisionAction::Promote,
            confidence,
            reason: reason.into(),
            matches,
        }
    }

    /// The match a merge decision points at.
    pub fn best_match(&self) -> Option<&SimilarityMatch> {
        self.matches.first()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CandidateDecision {
    pub candidate_id: String,
    pub decision: Decision,
}

#[derive(Debug, Clone, Serialize)]
pub struct BatchResult {
    pub results: Vec<CandidateDecision>,
    pub merged_count: usize,
    pub promoted_count: usize,
    pub total_processed: usize,
    #[serde(serialize_with = "serialize_millis")]
    pub processing_time: Duration,
    pub success: bool,
    pub error: Option<String>,
}

fn serialize_millis<S: serde::Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_u64(d.as_millis() as u64)
}

/// Outcome of writing a batch's decisions back to the stores.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CommitStats {
    pub merged: usize,
    pub promoted: usize,
    /// Decisions for candidates that were unknown or no longer pending.
    pub skipped: usize,
    pub errors: Vec<String>,
}

pub struct SimilarityIndex {
    store: Arc<dyn CandidateStore>,
    config: SimilarityConfig,
    retry: RetryPolicy,
    state: IndexState,
}

impl SimilarityIndex {
    pub fn new(store: Arc<dyn CandidateStore>, config: SimilarityConfig, retry: RetryPolicy) -> Self {
        Self {
            store,
            config,
            retry,
            state: IndexState::Uninitialized,
        }
    }

    pub fn is_built(&self) -> bool {
        matches!(self.state, IndexState::Built(_))
    }

    /// Number of vectors in the index; zero when unbuilt.
    pub fn len(&self) -> usize {
        match &self.state {
            IndexState::Built(index) => index.len(),
            IndexState::Uninitialized => 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Load candidates and replace the index. Returns the number of vectors
    /// inserted. Without `force`, an already-built index is left alone and
    /// 0 is returned.
    pub async fn build_index(&mut self, force: bool) -> SyncResult<usize> {
        if self.is_built() && !force {
            return Ok(0);
        }

        let mut loaded = Vec::new();
        for &status in &self.config.include_statuses {
            let store = &self.store;
            let batch = self
                .retry
                .run("get_candidates_by_status", || {
                    store.get_candidates_by_status(status)
                })
                .await?;
            loaded.extend(batch);
        }

        let mut seen = HashSet::new();
        let mut index = CosineIndex::with_capacity(self.config.dims, loaded.len());
        let mut skipped = 0usize;
        for candidate in &loaded {
            if !seen.insert(candidate.id.as_str()) {
                continue;
            }
            if index.insert(candidate) {
                continue;
            }
            skipped += 1;
            match &candidate.embedding {
                None => debug!(candidate_id = %candidate.id, "candidate has no embedding"),
                Some(v) => warn!(
                    candidate_id = %candidate.id,
                    dims = v.len(),
                    expected = self.config.dims,
                    "embedding dimensionality mismatch, not indexed"
                ),
            }
        }

        let added = index.len();
        info!(added, skipped, "similarity index built");
        self.state = IndexState::Built(index);
        Ok(added)
    }

    /// Up to `k` matches for `candidate`, best first, never including the
    /// candidate itself.
    pub fn find_similar(
        &self,
        candidate: &ConceptCandidate,
        k: usize,
    ) -> SyncResult<Vec<SimilarityMatch>> {
        let IndexState::Built(index) = &self.state else {
            return Ok(Vec::new());
        };
        let Some(query) = &candidate.embedding else {
            return Ok(Vec::new());
        };
        if query.len() != index.dims() {
            return Err(SyncError::Index(format!(
                "candidate '{}' has {} dimensions, index has {}",
                candidate.id,
                query.len(),
                index.dims()
            )));
        }
        Ok(index.search(query, k, Some(&candidate.id)))
    }

    pub fn decide(&self, candidate: &ConceptCandidate) -> Decision {
        self.decide_excluding(candidate, &HashSet::new())
    }

    /// Like [`decide`](Self::decide), ignoring matches whose candidate id
    /// is in `excluded`.
    fn decide_excluding(&self, candidate: &ConceptCandidate, excluded: &HashSet<String>) -> Decision {
        let k = self.config.top_k + excluded.len();
        let mut matches = match self.find_similar(candidate, k) {
            Ok(matches) => matches,
            Err(e) => {
                warn!(candidate_id = %candidate.id, error = %e, "similarity search failed, promoting");
                return Decision::promote(0.0, format!("similarity search failed: {}", e), Vec::new());
            }
        };
        matches.retain(|m| !excluded.contains(&m.matched_candidate_id));
        matches.truncate(self.config.top_k);

        let Some(best) = matches.first() else {
            return Decision::promote(1.0, "no similar candidates found", matches);
        };

        let score = best.similarity_score;
        if score >= self.config.threshold {
            Decision {
                action: DecisionAction::Merge,
                confidence: score,
                reason: format!(
                    "matches '{}' with similarity {:.3}",
                    best.matched_text, score
                ),
                matches,
            }
        } else {
            let reason = format!(
                "best match similarity {:.3} is below threshold {}",
                score, self.config.threshold
            );
            Decision::promote(1.0 - score, reason, matches)
        }
    }

    /// Rebuild the index once, then decide every candidate in order.
    ///
    /// Within a batch a candidate may only merge into another member of the
    /// same batch if that member was decided earlier and promoted. Two
    /// near-duplicate newcomers therefore yield one promotion and one merge
    /// instead of merging into each other.
    ///
    /// If the rebuild fails, every candidate is fail-safe promoted and the
    /// result is marked unsuccessful.
    pub async fn process_batch(&mut self, candidates: &[ConceptCandidate]) -> BatchResult {
        let clock = Instant::now();
        let mut results = Vec::with_capacity(candidates.len());
        let mut error = None;

        match self.build_index(true).await {
            Ok(_) => {
                let mut excluded: HashSet<String> =
                    candidates.iter().map(|c| c.id.clone()).collect();
                for candidate in candidates {
                    excluded.remove(&candidate.id);
                    let decision = self.decide_excluding(candidate, &excluded);
                    if decision.action == DecisionAction::Merge {
                        // Merged members are not valid merge targets.
                        excluded.insert(candidate.id.clone());
                    }
                    debug!(
                        candidate_id = %candidate.id,
                        action = ?decision.action,
                        confidence = decision.confidence,
                        "candidate decided"
                    );
                    results.push(CandidateDecision {
                        candidate_id: candidate.id.clone(),
                        decision,
                    });
                }
            }
            Err(e) => {
                warn!(error = %e, batch = candidates.len(), "index rebuild failed, promoting batch");
                let reason = format!("index rebuild failed: {}", e);
                results.extend(candidates.iter().map(|c| CandidateDecision {
                    candidate_id: c.id.clone(),
                    decision: Decision::promote(0.0, reason.clone(), Vec::new()),
                }));
                error = Some(e.to_string());
            }
        }

        let merged_count = results
            .iter()
            .filter(|r| r.decision.action == DecisionAction::Merge)
            .count();
        let promoted_count = results.len() - merged_count;

        BatchResult {
            total_processed: results.len(),
            results,
            merged_count,
            promoted_count,
            processing_time: clock.elapsed(),
            success: error.is_none(),
            error,
        }
    }

    /// Persist a batch's decisions.
    ///
    /// Promotions go first: each promoted candidate becomes a [`Concept`]
    /// in `graph` and is marked promoted with the new concept id. Merged
    /// candidates are then marked merged, recording the match they merged
    /// into. Decisions for candidates that are no longer pending in the
    /// store are skipped, so committing the same batch twice is harmless.
    pub async fn commit_batch(&self, batch: &BatchResult, graph: &dyn BlockStore) -> CommitStats {
        let mut stats = CommitStats::default();
        let store = &self.store;
        let pending = match self
            .retry
            .run("get_candidates_by_status", || {
                store.get_candidates_by_status(CandidateStatus::Pending)
            })
            .await
        {
            Ok(pending) => pending,
            Err(e) => {
                warn!(error = %e, "failed to load pending candidates, nothing committed");
                stats.errors.push(format!("get_candidates_by_status: {}", e));
                return stats;
            }
        };
        let by_id: HashMap<&str, &ConceptCandidate> =
            pending.iter().map(|c| (c.id.as_str(), c)).collect();

        let mut promotions = Vec::new();
        let mut merges = Vec::new();
        for result in &batch.results {
            let Some(&candidate) = by_id.get(result.candidate_id.as_str()) else {
                stats.skipped += 1;
                continue;
            };
            match result.decision.action {
                DecisionAction::Promote => promotions.push((candidate, &result.decision)),
                DecisionAction::Merge => merges.push((candidate, &result.decision)),
            }
        }

        let now = Utc::now();
        let concepts: Vec<Concept> = promotions
            .iter()
            .map(|(c, _)| Concept {
                id: Uuid::new_v4().to_string(),
                name: c.text.clone(),
                normalized_name: c.normalized_text.clone(),
                source_candidate_id: c.id.clone(),
                source_node_id: c.source_node_id.clone(),
                source_node_type: c.source_node_type.clone(),
                created_at: now,
            })
            .collect();

        let mut concept_of: HashMap<String, String> = HashMap::new();
        if !concepts.is_empty() {
            match self
                .retry
                .run("create_concepts", || graph.create_concepts(&concepts))
                .await
            {
                Ok(_) => {
                    for (concept, (candidate, decision)) in concepts.iter().zip(&promotions) {
                        let metadata = json!({
                            "concept_id": concept.id,
                            "confidence": decision.confidence,
                            "reason": decision.reason,
                        });
                        match self.set_status(&candidate.id, CandidateStatus::Promoted, &metadata).await {
                            Ok(()) => {
                                stats.promoted += 1;
                                concept_of.insert(candidate.id.clone(), concept.id.clone());
                            }
                            Err(e) => stats.errors.push(format!("{}: {}", candidate.id, e)),
                        }
                    }
                }
                Err(e) => {
                    warn!(count = concepts.len(), error = %e, "failed to create concepts");
                    stats.errors.push(format!("create_concepts: {}", e));
                }
            }
        }

        for (candidate, decision) in merges {
            let Some(best) = decision.best_match() else {
                stats.skipped += 1;
                continue;
            };
            let matched_concept_id = best
                .matched_concept_id
                .clone()
                .or_else(|| concept_of.get(&best.matched_candidate_id).cloned());
            let metadata = json!({
                "matched_candidate_id": best.matched_candidate_id,
                "matched_concept_id": matched_concept_id,
                "similarity_score": best.similarity_score,
                "reason": decision.reason,
            });
            match self.set_status(&candidate.id, CandidateStatus::Merged, &metadata).await {
                Ok(()) => stats.merged += 1,
                Err(e) => stats.errors.push(format!("{}: {}", candidate.id, e)),
            }
        }

        info!(
            merged = stats.merged,
            promoted = stats.promoted,
            skipped = stats.skipped,
            errors = stats.errors.len(),
            "batch committed"
        );
        stats
    }

    /// Decide and commit every pending candidate.
    pub async fn run_pending(&mut self, graph: &dyn BlockStore) -> SyncResult<(BatchResult, CommitStats)> {
        let store = self.store.clone();
        let pending = self
            .retry
            .run("get_candidates_by_status", || {
                store.get_candidates_by_status(CandidateStatus::Pending)
            })
            .await?;

        let batch = self.process_batch(&pending).await;
        let commit = self.commit_batch(&batch, graph).await;
        Ok((batch, commit))
    }

    async fn set_status(
        &self,
        candidate_id: &str,
        status: CandidateStatus,
        metadata: &serde_json::Value,
    ) -> SyncResult<()> {
        self.retry
            .run("update_status", || {
                self.store.update_status(candidate_id, status, metadata)
            })
            .await
    }
}
