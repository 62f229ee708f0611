//! At-least-once message queue abstraction for dirty-block notifications.
//!
//! A received [`Delivery`] stays unacknowledged until the consumer either
//! [`ack`](MessageQueue::ack)s it or [`nack`](MessageQueue::nack)s it. A
//! nack with `requeue = true` makes the message available again; with
//! `requeue = false` the message is dead-lettered and never redelivered.
//!
//! | Adapter | Durability |
//! |---------|------------|
//! | [`memory::InMemoryQueue`] | Process lifetime only |
//! | [`sqlite::SqliteQueue`] | Durable table in the `vsync` database |

pub mod memory;
pub mod sqlite;

use std::time::Duration;

use async_trait::async_trait;

use crate::error::SyncResult;

/// One delivery of a queued message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    /// Opaque handle used to ack or nack this delivery.
    pub tag: i64,
    pub body: Vec<u8>,
    /// True when the message was delivered before and not acknowledged.
    pub redelivered: bool,
}

#[async_trait]
pub trait MessageQueue: Send + Sync {
    /// Enqueue a message persistently.
    async fn publish(&self, body: &[u8]) -> SyncResult<()>;

    /// Wait up to `timeout` for the next message.
    async fn receive(&self, timeout: Duration) -> SyncResult<Option<Delivery>>;

    async fn ack(&self, delivery: &Delivery) -> SyncResult<()>;

    async fn nack(&self, delivery: &Delivery, requeue: bool) -> SyncResult<()>;
}
