use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

use crate::models::CandidateStatus;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    pub vault: VaultConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub consumer: ConsumerConfig,
    #[serde(default)]
    pub similarity: SimilarityConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct VaultConfig {
    pub root: PathBuf,
    /// Sub-directories of `root`, swept in this order.
    #[serde(default = "default_tiers")]
    pub tiers: Vec<String>,
    #[serde(default = "default_include_globs")]
    pub include_globs: Vec<String>,
    #[serde(default)]
    pub exclude_globs: Vec<String>,
}

fn default_tiers() -> Vec<String> {
    vec!["tier1".to_string(), "tier2".to_string(), "tier3".to_string()]
}

fn default_include_globs() -> Vec<String> {
    vec!["**/*.md".to_string()]
}

impl VaultConfig {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            tiers: default_tiers(),
            include_globs: default_include_globs(),
            exclude_globs: Vec::new(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetryConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
        }
    }
}

fn default_max_attempts() -> u32 {
    3
}
fn default_base_delay_ms() -> u64 {
    200
}
fn default_max_delay_ms() -> u64 {
    5000
}

#[derive(Debug, Deserialize, Clone)]
pub struct ConsumerConfig {
    #[serde(default = "default_queue")]
    pub queue: String,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// In-flight messages older than this are treated as abandoned by a
    /// crashed consumer and redelivered at startup.
    #[serde(default = "default_lease_secs")]
    pub lease_secs: u64,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            queue: default_queue(),
            poll_interval_ms: default_poll_interval_ms(),
            lease_secs: default_lease_secs(),
        }
    }
}

fn default_queue() -> String {
    "dirty_blocks".to_string()
}
fn default_poll_interval_ms() -> u64 {
    500
}
fn default_lease_secs() -> u64 {
    300
}

#[derive(Debug, Deserialize, Clone)]
pub struct SimilarityConfig {
    /// Best-match score at or above which a candidate is merged.
    #[serde(default = "default_threshold")]
    pub threshold: f32,
    #[serde(default = "default_top_k")]
    pub top_k: usize,
    #[serde(default = "default_dims")]
    pub dims: usize,
    /// Candidate statuses loaded into the index on rebuild.
    #[serde(default = "default_include_statuses")]
    pub include_statuses: Vec<CandidateStatus>,
}

impl Default for SimilarityConfig {
    fn default() -> Self {
        Self {
            threshold: default_threshold(),
            top_k: default_top_k(),
            dims: default_dims(),
            include_statuses: default_include_statuses(),
        }
    }
}

fn default_threshold() -> f32 {
    0.9
}
fn default_top_k() -> usize {
    5
}
fn default_dims() -> usize {
    384
}
fn default_include_statuses() -> Vec<CandidateStatus> {
    vec![CandidateStatus::Promoted, CandidateStatus::Pending]
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    parse_config(&content)
}

pub fn parse_config(content: &str) -> Result<Config> {
    let config: Config = toml::from_str(content).with_context(|| "Failed to parse config file")?;

    if config.vault.tiers.is_empty() {
        anyhow::bail!("vault.tiers must name at least one tier");
    }

    if config.retry.max_attempts == 0 {
        anyhow::bail!("retry.max_attempts must be >= 1");
    }
    if config.retry.base_delay_ms > config.retry.max_delay_ms {
        anyhow::bail!("retry.base_delay_ms must be <= retry.max_delay_ms");
    }

    if config.consumer.poll_interval_ms == 0 {
        anyhow::bail!("consumer.poll_interval_ms must be > 0");
    }

    if !(0.0..=1.0).contains(&config.similarity.threshold) {
        anyhow::bail!("similarity.threshold must be in [0.0, 1.0]");
    }
    if config.similarity.top_k == 0 {
        anyhow::bail!("similarity.top_k must be >= 1");
    }
    if config.similarity.dims == 0 {
        anyhow::bail!("similarity.dims must be > 0");
    }
    if config
        .similarity
        .include_statuses
        .contains(&CandidateStatus::Merged)
    {
        anyhow::bail!("similarity.include_statuses may not contain 'merged'");
    }

    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
[db]
path = "./data/vault.sqlite"

[vault]
root = "./vault"
"#;

    #[test]
    fn test_minimal_config_defaults() {
        let cfg = parse_config(MINIMAL).unwrap();
        assert_eq!(cfg.vault.tiers, vec!["tier1", "tier2", "tier3"]);
        assert_eq!(cfg.vault.include_globs, vec!["**/*.md"]);
        assert_eq!(cfg.retry.max_attempts, 3);
        assert_eq!(cfg.consumer.queue, "dirty_blocks");
        assert_eq!(cfg.consumer.lease_secs, 300);
        assert!((cfg.similarity.threshold - 0.9).abs() < f32::EPSILON);
        assert_eq!(
            cfg.similarity.include_statuses,
            vec![CandidateStatus::Promoted, CandidateStatus::Pending]
        );
    }

    #[test]
    fn test_rejects_out_of_range_threshold() {
        let content = format!("{}\n[similarity]\nthreshold = 1.5\n", MINIMAL);
        let err = parse_config(&content).unwrap_err();
        assert!(err.to_string().contains("similarity.threshold"));
    }

    #[test]
    fn test_rejects_merged_inclusion() {
        let content = format!(
            "{}\n[similarity]\ninclude_statuses = [\"pending\", \"merged\"]\n",
            MINIMAL
        );
        assert!(parse_config(&content).is_err());
    }

    #[test]
    fn test_rejects_zero_attempts() {
        let content = format!("{}\n[retry]\nmax_attempts = 0\n", MINIMAL);
        assert!(parse_config(&content).is_err());
    }
}
