//! # vault-sync
//!
//! Keeps a graph of versioned text blocks in step with a Markdown vault,
//! and deduplicates extracted concept candidates by embedding similarity.
//!
//! Blocks are paragraphs (or whole documents) tagged in the source file
//! with an HTML or Obsidian comment carrying an id and an author-declared
//! version:
//!
//! ```text
//! Alice proposed moving the launch to May.
//! <!-- aclarai:id=blk_7f3a ver=2 -->
//! ^blk_7f3a
//! ```
//!
//! ## Architecture
//!
//! ```text
//!                  ┌────────────────┐
//!   vault/*.md ──▶ │ extract_blocks │
//!                  └──────┬─────────┘
//!            full sweep   │   change events
//!        ┌────────────────┴─────────────────┐
//!        ▼                                  ▼
//! ┌──────────────┐                 ┌────────────────────┐
//! │ VaultSyncJob │                 │ DirtyBlockConsumer │◀── queue
//! │ vault wins   │                 │ rejects stale      │
//! └──────┬───────┘                 └─────────┬──────────┘
//!        └──────────────┬────────────────────┘
//!                       ▼
//!                ┌─────────────┐      ┌─────────────────┐
//!                │  BlockStore │◀─────│ SimilarityIndex │◀── candidates
//!                │   (graph)   │      │ merge / promote │
//!                └─────────────┘      └─────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! vsync init                    # create database
//! vsync sync                    # sweep every tier
//! vsync publish tier1/chat.md   # enqueue change events for one file
//! vsync consume                 # apply queued change events
//! vsync dedup                   # merge or promote pending candidates
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`block`] | Marker scanning, content hashing, block diffs |
//! | [`models`] | Core data types |
//! | [`message`] | Dirty-block message wire format |
//! | [`store`] | Graph and candidate store traits and adapters |
//! | [`queue`] | At-least-once message queue trait and adapters |
//! | [`reconcile`] | Compare-then-write step shared by both sync paths |
//! | [`retry`] | Bounded exponential backoff |
//! | [`vault_sync`] | Full vault sweep |
//! | [`consumer`] | Reactive dirty-block consumer |
//! | [`similarity`] | Concept dedup index and decisions |
//! | [`embedding`] | Vector utilities |
//! | [`commands`] | CLI command implementations |
//! | [`config`] | TOML configuration parsing |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema migrations |
//! | [`stats`] | Database statistics |
//! | [`error`] | Error taxonomy |

pub mod block;
pub mod commands;
pub mod config;
pub mod consumer;
pub mod db;
pub mod embedding;
pub mod error;
pub mod message;
pub mod migrate;
pub mod models;
pub mod queue;
pub mod reconcile;
pub mod retry;
pub mod similarity;
pub mod stats;
pub mod store;
pub mod vault_sync;
