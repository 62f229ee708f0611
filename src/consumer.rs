//! Reactive dirty-block consumer.
//!
//! Pulls one [`DirtyBlockMessage`] at a time from a [`MessageQueue`],
//! re-reads the named file, and reconciles the single block the message
//! refers to with [`WritePolicy::RejectStale`].
//!
//! ```text
//! Idle ──run──▶ Consuming ──receive──▶ Processing ──ack/nack──▶ Consuming
//!   │               │
//!   └────stop───────┴──────────────────────────────────────────▶ Stopped
//! ```
//!
//! The stop signal is checked between messages only; a message being
//! processed is always settled before the loop exits.
//!
//! | Situation | Queue action |
//! |-----------|--------------|
//! | Missing required fields, bad JSON, unreadable encoding | nack, no requeue |
//! | Permanent read failure (permission denied, path is a directory) | nack, no requeue |
//! | `deleted` change | ack |
//! | File or block gone | ack |
//! | Created / updated / unchanged / version conflict | ack |
//! | Graph retries exhausted, transient I/O | nack, requeue |

use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::block::extract_blocks;
use crate::error::SyncError;
use crate::message::{ChangeType, DirtyBlockMessage};
use crate::queue::{Delivery, MessageQueue};
use crate::reconcile::{reconcile_block, BlockOutcome, WritePolicy};
use crate::retry::RetryPolicy;
use crate::store::BlockStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumerState {
    Idle,
    Consuming,
    Processing,
    Stopped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckReason {
    Applied(BlockOutcome),
    Deleted,
    FileMissing,
    BlockMissing,
}

/// What to do with a processed message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageOutcome {
    Ack(AckReason),
    /// Leave for redelivery.
    Requeue(String),
    /// Permanently failed; dead-letter.
    Reject(String),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ConsumerStats {
    pub received: u64,
    pub acked: u64,
    pub requeued: u64,
    pub rejected: u64,
    pub created: u64,
    pub updated: u64,
    pub unchanged: u64,
    pub conflicts: u64,
    /// Acked because the file or block no longer exists.
    pub missing: u64,
}

impl ConsumerStats {
    fn record(&mut self, outcome: &MessageOutcome) {
        match outcome {
            MessageOutcome::Ack(reason) => {
                self.acked += 1;
                match reason {
                    AckReason::Applied(BlockOutcome::Created) => self.created += 1,
                    AckReason::Applied(BlockOutcome::Updated { .. }) => self.updated += 1,
                    AckReason::Applied(BlockOutcome::Unchanged) => self.unchanged += 1,
                    AckReason::Applied(BlockOutcome::VersionConflict { .. }) => {
                        self.conflicts += 1
                    }
                    AckReason::FileMissing | AckReason::BlockMissing => self.missing += 1,
                    AckReason::Deleted => {}
                }
            }
            MessageOutcome::Requeue(_) => self.requeued += 1,
            MessageOutcome::Reject(_) => self.rejected += 1,
        }
    }
}

pub struct DirtyBlockConsumer {
    store: Arc<dyn BlockStore>,
    queue: Arc<dyn MessageQueue>,
    vault_root: PathBuf,
    retry: RetryPolicy,
    poll_interval: Duration,
    max_messages: Option<u64>,
    state: ConsumerState,
    stats: ConsumerStats,
}

impl DirtyBlockConsumer {
    pub fn new(
        store: Arc<dyn BlockStore>,
        queue: Arc<dyn MessageQueue>,
        vault_root: impl Into<PathBuf>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            store,
            queue,
            vault_root: vault_root.into(),
            retry,
            poll_interval: Duration::from_millis(500),
            max_messages: None,
            state: ConsumerState::Idle,
            stats: ConsumerStats::default(),
        }
    }

    /// How long one receive waits before the stop signal is rechecked.
    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// Stop after settling this many messages.
    pub fn with_max_messages(mut self, max_messages: Option<u64>) -> Self {
        self.max_messages = max_messages;
        self
    }

    pub fn state(&self) -> ConsumerState {
        self.state
    }

    pub fn stats(&self) -> ConsumerStats {
        self.stats
    }

    /// Move to `Stopped` without consuming. A stopped consumer's
    /// [`run`](Self::run) and [`drain`](Self::drain) return immediately. To
    /// stop a running loop, send `true` on its watch channel.
    pub fn stop(&mut self) {
        self.state = ConsumerState::Stopped;
    }

    /// Consume until `stop` becomes true, the queue fails, or the message
    /// limit is reached.
    pub async fn run(&mut self, stop: watch::Receiver<bool>) -> ConsumerStats {
        if self.state == ConsumerState::Stopped {
            return self.stats;
        }
        self.state = ConsumerState::Consuming;
        info!(vault = %self.vault_root.display(), "dirty-block consumer started");

        loop {
            if *stop.borrow() || self.limit_reached() {
                break;
            }

            let delivery = match self.queue.receive(self.poll_interval).await {
                Ok(Some(delivery)) => delivery,
                Ok(None) => continue,
                Err(e) if e.is_transient() => {
                    warn!(error = %e, "queue receive failed, retrying");
                    tokio::time::sleep(self.poll_interval).await;
                    continue;
                }
                Err(e) => {
                    error!(error = %e, "queue receive failed, stopping consumer");
                    break;
                }
            };

            self.handle_delivery(&delivery).await;
        }

        self.state = ConsumerState::Stopped;
        info!(
            received = self.stats.received,
            acked = self.stats.acked,
            requeued = self.stats.requeued,
            rejected = self.stats.rejected,
            "dirty-block consumer stopped"
        );
        self.stats
    }

    /// Process messages until the queue is empty, then return. Stops early
    /// at the first requeued message so a persistent failure cannot spin.
    pub async fn drain(&mut self) -> ConsumerStats {
        if self.state == ConsumerState::Stopped {
            return self.stats;
        }
        self.state = ConsumerState::Consuming;
        while !self.limit_reached() {
            match self.queue.receive(Duration::ZERO).await {
                Ok(Some(delivery)) => {
                    if let MessageOutcome::Requeue(_) = self.handle_delivery(&delivery).await {
                        break;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    warn!(error = %e, "queue receive failed during drain");
                    break;
                }
            }
        }
        self.state = ConsumerState::Idle;
        self.stats
    }

    /// Process one delivery and settle it on the queue.
    pub async fn handle_delivery(&mut self, delivery: &Delivery) -> MessageOutcome {
        self.state = ConsumerState::Processing;
        self.stats.received += 1;

        let outcome = self.process_message(&delivery.body).await;
        let settled = match &outcome {
            MessageOutcome::Ack(_) => self.queue.ack(delivery).await,
            MessageOutcome::Requeue(reason) => {
                warn!(tag = delivery.tag, reason = %reason, "message left for redelivery");
                self.queue.nack(delivery, true).await
            }
            MessageOutcome::Reject(reason) => {
                error!(tag = delivery.tag, reason = %reason, "message rejected");
                self.queue.nack(delivery, false).await
            }
        };
        if let Err(e) = settled {
            error!(tag = delivery.tag, error = %e, "failed to settle message");
        }

        self.stats.record(&outcome);
        self.state = ConsumerState::Consuming;
        outcome
    }

    /// Decide what a message body means for the graph, writing if needed.
    /// Does not touch the queue.
    pub async fn process_message(&self, body: &[u8]) -> MessageOutcome {
        let message = match DirtyBlockMessage::parse(body) {
            Ok(message) => message,
            Err(e) => return MessageOutcome::Reject(e.to_string()),
        };

        if message.change_type == ChangeType::Deleted {
            debug!(block_id = %message.block_id, "ignoring deleted block");
            return MessageOutcome::Ack(AckReason::Deleted);
        }

        let path = self.resolve(&message.file_path);
        let content = match tokio::fs::read_to_string(&path).await {
            Ok(content) => content,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                info!(
                    block_id = %message.block_id,
                    file = %message.file_path,
                    "file no longer exists, acknowledging"
                );
                return MessageOutcome::Ack(AckReason::FileMissing);
            }
            Err(e) if is_transient_io(e.kind()) => {
                return MessageOutcome::Requeue(SyncError::io(&path, e).to_string());
            }
            Err(e) => return MessageOutcome::Reject(SyncError::io(&path, e).to_string()),
        };

        let source_file = path
            .strip_prefix(&self.vault_root)
            .map(Path::to_path_buf)
            .unwrap_or_else(|_| PathBuf::from(&message.file_path));
        let Some(block) = extract_blocks(&content, &source_file)
            .into_iter()
            .find(|b| b.id == message.block_id)
        else {
            info!(
                block_id = %message.block_id,
                file = %message.file_path,
                "block no longer in file, acknowledging"
            );
            return MessageOutcome::Ack(AckReason::BlockMissing);
        };

        match reconcile_block(
            self.store.as_ref(),
            &self.retry,
            &block,
            WritePolicy::RejectStale,
        )
        .await
        {
            Ok(outcome) => MessageOutcome::Ack(AckReason::Applied(outcome)),
            Err(e @ SyncError::RetriesExhausted { .. }) => MessageOutcome::Requeue(e.to_string()),
            Err(e) if e.is_transient() => MessageOutcome::Requeue(e.to_string()),
            Err(e) => MessageOutcome::Reject(e.to_string()),
        }
    }

    fn resolve(&self, file_path: &str) -> PathBuf {
        let path = Path::new(file_path);
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.vault_root.join(path)
        }
    }

    fn limit_reached(&self) -> bool {
        self.max_messages
            .is_some_and(|max| self.stats.received >= max)
    }
}

/// Read failures worth another attempt. Anything else will fail the same
/// way on redelivery.
fn is_transient_io(kind: ErrorKind) -> bool {
    matches!(
        kind,
        ErrorKind::Interrupted | ErrorKind::TimedOut | ErrorKind::WouldBlock
    )
}
