//! In-process [`MessageQueue`] with redelivery and a dead-letter list.

use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;
use tokio::time::Instant;

use crate::error::{SyncError, SyncResult};

use super::{Delivery, MessageQueue};

struct Queued {
    body: Vec<u8>,
    deliveries: u32,
}

#[derive(Default)]
struct QueueState {
    ready: VecDeque<Queued>,
    unacked: HashMap<i64, Queued>,
    dead: Vec<Vec<u8>>,
    next_tag: i64,
}

fn poisoned<T>(_: PoisonError<T>) -> SyncError {
    SyncError::Queue("in-memory queue lock poisoned".to_string())
}

#[derive(Default)]
pub struct InMemoryQueue {
    state: Mutex<QueueState>,
    notify: Notify,
}

impl InMemoryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Messages waiting to be delivered.
    pub fn ready_len(&self) -> usize {
        self.state.lock().map(|s| s.ready.len()).unwrap_or(0)
    }

    /// Messages delivered but neither acked nor nacked.
    pub fn unacked_len(&self) -> usize {
        self.state.lock().map(|s| s.unacked.len()).unwrap_or(0)
    }

    /// Bodies of messages nacked without requeue.
    pub fn dead_letters(&self) -> Vec<Vec<u8>> {
        self.state.lock().map(|s| s.dead.clone()).unwrap_or_default()
    }

    fn try_pop(&self) -> SyncResult<Option<Delivery>> {
        let mut state = self.state.lock().map_err(poisoned)?;
        let Some(mut queued) = state.ready.pop_front() else {
            return Ok(None);
        };
        let tag = state.next_tag;
        state.next_tag += 1;

        let delivery = Delivery {
            tag,
            body: queued.body.clone(),
            redelivered: queued.deliveries > 0,
        };
        queued.deliveries += 1;
        state.unacked.insert(tag, queued);
        Ok(Some(delivery))
    }

    fn settle(&self, tag: i64) -> SyncResult<Queued> {
        let mut state = self.state.lock().map_err(poisoned)?;
        state
            .unacked
            .remove(&tag)
            .ok_or_else(|| SyncError::Invalid(format!("unknown delivery tag {}", tag)))
    }
}

#[async_trait]
impl MessageQueue for InMemoryQueue {
    async fn publish(&self, body: &[u8]) -> SyncResult<()> {
        {
            let mut state = self.state.lock().map_err(poisoned)?;
            state.ready.push_back(Queued {
                body: body.to_vec(),
                deliveries: 0,
            });
        }
        self.notify.notify_one();
        Ok(())
    }

    async fn receive(&self, timeout: Duration) -> SyncResult<Option<Delivery>> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(delivery) = self.try_pop()? {
                return Ok(Some(delivery));
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            // A timeout here just means one last look before giving up.
            let _ = tokio::time::timeout(deadline - now, self.notify.notified()).await;
        }
    }

    async fn ack(&self, delivery: &Delivery) -> SyncResult<()> {
        self.settle(delivery.tag).map(|_| ())
    }

    async fn nack(&self, delivery: &Delivery, requeue: bool) -> SyncResult<()> {
        let queued = self.settle(delivery.tag)?;
        {
            let mut state = self.state.lock().map_err(poisoned)?;
            if requeue {
                state.ready.push_back(queued);
            } else {
                state.dead.push(queued.body);
            }
        }
        if requeue {
            self.notify.notify_one();
        }
        Ok(())
    }
}
