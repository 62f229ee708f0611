//! Dirty-block change notifications.
//!
//! A [`DirtyBlockMessage`] is a JSON body on the change queue:
//!
//! ```json
//! {
//!   "aclarai_id": "blk_abc123",
//!   "file_path": "tier1/conversation.md",
//!   "change_type": "modified",
//!   "timestamp": 1718000000000,
//!   "version": 3,
//!   "block_type": "inline",
//!   "old_version": 2, "new_version": 3,
//!   "old_hash": "…", "new_hash": "…"
//! }
//! ```
//!
//! Only `aclarai_id`, `file_path`, and `change_type` are required. The rest
//! is advisory: the consumer re-reads the file before deciding anything.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::block::BlockDiff;
use crate::error::{SyncError, SyncResult};
use crate::models::BlockType;

const REQUIRED_FIELDS: &[&str] = &["aclarai_id", "file_path", "change_type"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeType {
    Added,
    Modified,
    Deleted,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirtyBlockMessage {
    #[serde(rename = "aclarai_id")]
    pub block_id: String,
    pub file_path: String,
    pub change_type: ChangeType,
    /// Epoch milliseconds at which the producer observed the change.
    #[serde(default)]
    pub timestamp: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub block_type: Option<BlockType>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub old_version: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub new_version: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub old_hash: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub new_hash: Option<String>,
}

impl DirtyBlockMessage {
    /// Decode and validate a queue body.
    ///
    /// Any failure is [`SyncError::MalformedMessage`]: the body will never
    /// become valid on redelivery.
    pub fn parse(body: &[u8]) -> SyncResult<Self> {
        let value: Value = serde_json::from_slice(body)
            .map_err(|e| SyncError::MalformedMessage(format!("invalid JSON: {}", e)))?;

        let obj = value
            .as_object()
            .ok_or_else(|| SyncError::MalformedMessage("body is not a JSON object".into()))?;

        for field in REQUIRED_FIELDS {
            match obj.get(*field) {
                Some(Value::String(s)) if !s.trim().is_empty() => {}
                Some(Value::String(_)) => {
                    return Err(SyncError::MalformedMessage(format!(
                        "required field '{}' is empty",
                        field
                    )))
                }
                Some(_) => {
                    return Err(SyncError::MalformedMessage(format!(
                        "required field '{}' must be a string",
                        field
                    )))
                }
                None => {
                    return Err(SyncError::MalformedMessage(format!(
                        "missing required field '{}'",
                        field
                    )))
                }
            }
        }

        serde_json::from_value(value).map_err(|e| SyncError::MalformedMessage(e.to_string()))
    }

    pub fn to_bytes(&self) -> SyncResult<Vec<u8>> {
        serde_json::to_vec(self).map_err(|e| SyncError::Invalid(e.to_string()))
    }
}

/// Build one message per changed block in `diff`.
///
/// `file_path` is recorded as given; the consumer resolves relative paths
/// against the vault root.
pub fn messages_from_diff(
    file_path: &str,
    diff: &BlockDiff,
    timestamp_ms: i64,
) -> Vec<DirtyBlockMessage> {
    let base = |block_id: &str, change_type: ChangeType| DirtyBlockMessage {
        block_id: block_id.to_string(),
        file_path: file_path.to_string(),
        change_type,
        timestamp: timestamp_ms,
        version: None,
        block_type: None,
        old_version: None,
        new_version: None,
        old_hash: None,
        new_hash: None,
    };

    let mut messages = Vec::with_capacity(diff.added.len() + diff.modified.len() + diff.deleted.len());

    for block in &diff.added {
        messages.push(DirtyBlockMessage {
            version: Some(block.version),
            block_type: Some(block.block_type),
            new_version: Some(block.version),
            new_hash: Some(block.content_hash.clone()),
            ..base(&block.id, ChangeType::Added)
        });
    }

    for m in &diff.modified {
        messages.push(DirtyBlockMessage {
            version: Some(m.new_version),
            block_type: Some(m.block_type),
            old_version: Some(m.old_version),
            new_version: Some(m.new_version),
            old_hash: Some(m.old_hash.clone()),
            new_hash: Some(m.new_hash.clone()),
            ..base(&m.id, ChangeType::Modified)
        });
    }

    for block in &diff.deleted {
        messages.push(DirtyBlockMessage {
            version: Some(block.version),
            block_type: Some(block.block_type),
            old_version: Some(block.version),
            old_hash: Some(block.content_hash.clone()),
            ..base(&block.id, ChangeType::Deleted)
        });
    }

    messages
}
