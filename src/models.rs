//! Core data models used throughout vault-sync.
//!
//! Blocks flow from vault files through [`crate::block`] into the graph as
//! [`BlockNode`]s. Concept candidates flow from the extraction pipeline
//! through [`crate::similarity`] into the graph as [`Concept`]s.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Whether a block annotates one paragraph or a whole document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BlockType {
    Inline,
    #[serde(rename = "file")]
    FileLevel,
}

impl BlockType {
    pub fn as_str(&self) -> &'static str {
        match self {
            BlockType::Inline => "inline",
            BlockType::FileLevel => "file",
        }
    }
}

impl fmt::Display for BlockType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BlockType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "inline" => Ok(BlockType::Inline),
            "file" | "file-level" => Ok(BlockType::FileLevel),
            other => Err(format!("unknown block type: '{}'", other)),
        }
    }
}

/// A block as extracted from a document on one parse pass.
///
/// Never persisted on its own; the graph node keyed by `id` is the durable
/// entity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VersionedBlock {
    pub id: String,
    /// Visible text with metadata markers stripped.
    pub text: String,
    /// Author-declared revision, always >= 1.
    pub version: i64,
    /// SHA-256 hex of the whitespace-normalized text.
    pub content_hash: String,
    pub source_file: PathBuf,
    pub block_type: BlockType,
}

/// A block as stored in the graph.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BlockNode {
    pub id: String,
    pub text: String,
    pub hash: String,
    pub version: i64,
    pub source_file: String,
    pub needs_reprocessing: bool,
    pub last_updated: DateTime<Utc>,
}

/// Lifecycle of a concept candidate. Transitions are one-way:
/// `Pending -> Merged` or `Pending -> Promoted`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CandidateStatus {
    Pending,
    Merged,
    Promoted,
}

impl CandidateStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CandidateStatus::Pending => "pending",
            CandidateStatus::Merged => "merged",
            CandidateStatus::Promoted => "promoted",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, CandidateStatus::Pending)
    }
}

impl fmt::Display for CandidateStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CandidateStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(CandidateStatus::Pending),
            "merged" => Ok(CandidateStatus::Merged),
            "promoted" => Ok(CandidateStatus::Promoted),
            other => Err(format!("unknown candidate status: '{}'", other)),
        }
    }
}

/// An extracted text fragment awaiting a merge/promote decision.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConceptCandidate {
    pub id: String,
    pub text: String,
    pub normalized_text: String,
    pub embedding: Option<Vec<f32>>,
    pub source_node_id: String,
    pub source_node_type: String,
    pub status: CandidateStatus,
    /// Graph concept this candidate became, once promoted.
    pub concept_id: Option<String>,
}

/// One hit from a similarity query. Ephemeral.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SimilarityMatch {
    pub matched_candidate_id: String,
    pub matched_concept_id: Option<String>,
    /// Cosine similarity clamped to `[0, 1]`.
    pub similarity_score: f32,
    pub matched_text: String,
}

/// A first-class concept node in the graph.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Concept {
    pub id: String,
    pub name: String,
    pub normalized_name: String,
    pub source_candidate_id: String,
    pub source_node_id: String,
    pub source_node_type: String,
    pub created_at: DateTime<Utc>,
}
