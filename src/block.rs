//! Versioned block extraction and content hashing.
//!
//! A vault document annotates its paragraphs with marker comments:
//!
//! ```text
//! Alice: we should ship on Friday.
//! <!-- aclarai:id=blk_a1 ver=2 -->
//! ^blk_a1
//!
//! ...rest of the document...
//! <!-- aclarai:id=file_conv1 ver=1 -->
//! ```
//!
//! The marker keyword (`id=`, `ver=`) is matched case-insensitively and may
//! carry a namespace prefix (`aclarai:id=`). Identifier and version values are
//! taken verbatim. Markers live inside `<!-- -->` or `%% %%` comments.
//!
//! A marker followed by nothing but whitespace (at most
//! [`FILE_LEVEL_TRAILING_LIMIT`] bytes of it) closes the document and yields a
//! [`BlockType::FileLevel`] block whose text is everything above the marker
//! line. Any other marker yields a [`BlockType::Inline`] block whose text is
//! the paragraph line it annotates.
//!
//! The scan is a single forward pass over lines; each marker then looks
//! backwards over the already-scanned lines for its text.

use std::collections::{HashMap, HashSet};
use std::path::Path;

use serde::Serialize;
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::models::{BlockType, VersionedBlock};

/// Maximum trailing whitespace (in bytes) after a marker for it to still
/// count as the document's closing, file-level marker.
pub const FILE_LEVEL_TRAILING_LIMIT: usize = 32;

/// Comment delimiters that may carry a marker.
const COMMENT_DELIMITERS: &[(&str, &str)] = &[("<!--", "-->"), ("%%", "%%")];

/// `%%` also shows up in ordinary prose, so it only delimits a comment when
/// padded with whitespace on the inside: `%% id=x %%`.
fn needs_padding(open: &str) -> bool {
    open == "%%"
}

/// A marker found within a single line. Offsets are relative to the line.
#[derive(Debug)]
struct MarkerSpan {
    start: usize,
    end: usize,
    id: String,
    version: Option<String>,
}

#[derive(Debug)]
struct ScannedLine {
    /// Byte offset of the first character after this line's newline.
    end: usize,
    markers: Vec<MarkerSpan>,
    /// Line content with marker comments removed and trailing whitespace trimmed.
    visible: String,
}

impl ScannedLine {
    fn is_anchor(&self) -> bool {
        is_anchor_line(&self.visible)
    }

    /// Whether this line carries paragraph text a marker can annotate.
    fn has_text(&self) -> bool {
        !self.visible.trim().is_empty() && !self.is_anchor()
    }
}

/// Extract all versioned blocks from a document's raw content.
///
/// Returns an empty list for documents with no markers. Markers with an
/// unparseable or non-positive `ver=` are logged and skipped; they never
/// abort the rest of the document.
pub fn extract_blocks(content: &str, source_file: &Path) -> Vec<VersionedBlock> {
    let lines = scan_lines(content);
    let mut blocks = Vec::new();

    for (line_idx, line) in lines.iter().enumerate() {
        let line_start = if line_idx == 0 { 0 } else { lines[line_idx - 1].end };

        for marker in &line.markers {
            let version = match marker.version.as_deref() {
                None => 1,
                Some(raw) => match raw.parse::<i64>() {
                    Ok(v) if v >= 1 => v,
                    _ => {
                        warn!(
                            block_id = %marker.id,
                            file = %source_file.display(),
                            version = raw,
                            "skipping marker with malformed version"
                        );
                        continue;
                    }
                },
            };

            let rest = &content[line_start + marker.end..];
            let file_level =
                rest.trim().is_empty() && rest.len() <= FILE_LEVEL_TRAILING_LIMIT;

            let (text, block_type) = if file_level {
                (file_level_text(&lines[..line_idx]), BlockType::FileLevel)
            } else {
                match inline_text(&lines, line_idx, marker) {
                    Some(text) => (text, BlockType::Inline),
                    None => {
                        debug!(
                            block_id = %marker.id,
                            file = %source_file.display(),
                            "skipping inline marker with no text above it"
                        );
                        continue;
                    }
                }
            };

            blocks.push(VersionedBlock {
                id: marker.id.clone(),
                content_hash: compute_content_hash(&text),
                text,
                version,
                source_file: source_file.to_path_buf(),
                block_type,
            });
        }
    }

    blocks
}

/// Collapse every run of whitespace to one space and trim both ends.
pub fn normalize_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// SHA-256 hex digest of the whitespace-normalized text.
///
/// Texts that differ only in whitespace layout hash identically.
pub fn compute_content_hash(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(normalize_whitespace(text).as_bytes());
    format!("{:x}", hasher.finalize())
}

/// A block present in both snapshots whose version or hash changed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BlockModification {
    pub id: String,
    pub block_type: BlockType,
    pub old_version: i64,
    pub new_version: i64,
    pub old_hash: String,
    pub new_hash: String,
}

/// Differences between two parses of the same document, keyed by block id.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BlockDiff {
    pub added: Vec<VersionedBlock>,
    pub modified: Vec<BlockModification>,
    pub deleted: Vec<VersionedBlock>,
}

impl BlockDiff {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.modified.is_empty() && self.deleted.is_empty()
    }
}

/// Compare two block lists by id.
///
/// `added` and `modified` follow the order of `new`; `deleted` follows the
/// order of `old`.
pub fn diff_blocks(old: &[VersionedBlock], new: &[VersionedBlock]) -> BlockDiff {
    let old_by_id: HashMap<&str, &VersionedBlock> =
        old.iter().map(|b| (b.id.as_str(), b)).collect();
    let new_ids: HashSet<&str> = new.iter().map(|b| b.id.as_str()).collect();

    let mut diff = BlockDiff::default();

    for block in new {
        match old_by_id.get(block.id.as_str()) {
            None => diff.added.push(block.clone()),
            Some(prev) => {
                if prev.version != block.version || prev.content_hash != block.content_hash {
                    diff.modified.push(BlockModification {
                        id: block.id.clone(),
                        block_type: block.block_type,
                        old_version: prev.version,
                        new_version: block.version,
                        old_hash: prev.content_hash.clone(),
                        new_hash: block.content_hash.clone(),
                    });
                }
            }
        }
    }

    for block in old {
        if !new_ids.contains(block.id.as_str()) {
            diff.deleted.push(block.clone());
        }
    }

    diff
}

fn scan_lines(content: &str) -> Vec<ScannedLine> {
    let mut lines = Vec::new();
    let mut offset = 0;

    for raw in content.split_inclusive('\n') {
        offset += raw.len();
        let line = raw.trim_end_matches(['\n', '\r']);
        let markers = scan_line_markers(line);

        let mut visible = String::with_capacity(line.len());
        let mut cursor = 0;
        for m in &markers {
            visible.push_str(&line[cursor..m.start]);
            cursor = m.end;
        }
        visible.push_str(&line[cursor..]);
        let visible = visible.trim_end().to_string();

        lines.push(ScannedLine {
            end: offset,
            markers,
            visible,
        });
    }

    lines
}

fn scan_line_markers(line: &str) -> Vec<MarkerSpan> {
    let mut markers = Vec::new();
    let mut pos = 0;

    while pos < line.len() {
        let next_open = COMMENT_DELIMITERS
            .iter()
            .filter_map(|(open, close)| line[pos..].find(open).map(|i| (pos + i, *open, *close)))
            .min_by_key(|(i, _, _)| *i);

        let Some((open_at, open, close)) = next_open else {
            break;
        };
        let body_start = open_at + open.len();
        let padded = needs_padding(open);
        if padded && !line[body_start..].starts_with(char::is_whitespace) {
            pos = body_start;
            continue;
        }
        let Some(body_end) = find_close(line, body_start, close, padded) else {
            break;
        };
        let end = body_end + close.len();

        if let Some((id, version)) = parse_marker_body(&line[body_start..body_end]) {
            markers.push(MarkerSpan {
                start: open_at,
                end,
                id,
                version,
            });
        }
        pos = end;
    }

    markers
}

/// Byte offset of the first `close` at or after `from`. A padded closer
/// must follow whitespace.
fn find_close(line: &str, from: usize, close: &str, padded: bool) -> Option<usize> {
    let mut search = from;
    while let Some(rel) = line[search..].find(close) {
        let at = search + rel;
        if !padded || line[..at].ends_with(char::is_whitespace) {
            return Some(at);
        }
        search = at + close.len();
    }
    None
}

/// Parse `[ns:]id=<ID> [[ns:]ver=<N>]` out of a comment body.
fn parse_marker_body(body: &str) -> Option<(String, Option<String>)> {
    let mut id = None;
    let mut version = None;

    for token in body.split_whitespace() {
        let Some((key, value)) = token.split_once('=') else {
            continue;
        };
        let key = key.rsplit(':').next().unwrap_or(key);
        if key.eq_ignore_ascii_case("id") && id.is_none() {
            id = Some(value);
        } else if key.eq_ignore_ascii_case("ver") && version.is_none() {
            version = Some(value.to_string());
        }
    }

    id.filter(|v| !v.is_empty())
        .map(|id| (id.to_string(), version))
}

fn is_anchor_line(text: &str) -> bool {
    let t = text.trim();
    t.len() > 1 && t.starts_with('^') && !t[1..].chars().any(char::is_whitespace)
}

/// Text for an inline marker: text sharing the marker's line, else the
/// nearest line above that carries paragraph text. Anchor lines and
/// marker-only lines are skipped.
fn inline_text(lines: &[ScannedLine], line_idx: usize, marker: &MarkerSpan) -> Option<String> {
    let own = &lines[line_idx];
    if own.has_text() && own.markers.first().map(|m| m.start) == Some(marker.start) {
        return Some(own.visible.trim().to_string());
    }

    lines[..line_idx]
        .iter()
        .rev()
        .find(|l| l.has_text())
        .map(|l| l.visible.trim().to_string())
}

fn file_level_text(lines: &[ScannedLine]) -> String {
    let kept: Vec<&str> = lines
        .iter()
        .filter(|l| !l.is_anchor())
        .filter(|l| l.markers.is_empty() || !l.visible.trim().is_empty())
        .map(|l| l.visible.as_str())
        .collect();
    kept.join("\n").trim().to_string()
}
