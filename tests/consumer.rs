use std::fs;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::json;
use tempfile::TempDir;
use tokio::sync::watch;

use vault_sync::block::compute_content_hash;
use vault_sync::consumer::{AckReason, ConsumerState, DirtyBlockConsumer, MessageOutcome};
use vault_sync::models::BlockNode;
use vault_sync::queue::memory::InMemoryQueue;
use vault_sync::queue::MessageQueue;
use vault_sync::reconcile::BlockOutcome;
use vault_sync::retry::RetryPolicy;
use vault_sync::store::memory::InMemoryBlockStore;

struct Harness {
    vault: TempDir,
    store: Arc<InMemoryBlockStore>,
    queue: Arc<InMemoryQueue>,
    consumer: DirtyBlockConsumer,
}

fn harness(content: &str) -> Harness {
    let vault = TempDir::new().unwrap();
    fs::create_dir_all(vault.path().join("tier1")).unwrap();
    fs::write(vault.path().join("tier1/conv.md"), content).unwrap();

    let store = Arc::new(InMemoryBlockStore::new());
    let queue = Arc::new(InMemoryQueue::new());
    let consumer = DirtyBlockConsumer::new(
        store.clone(),
        queue.clone(),
        vault.path(),
        RetryPolicy::immediate(2),
    )
    .with_poll_interval(Duration::from_millis(10));

    Harness {
        vault,
        store,
        queue,
        consumer,
    }
}

fn message(block_id: &str, change_type: &str) -> Vec<u8> {
    json!({
        "aclarai_id": block_id,
        "file_path": "tier1/conv.md",
        "change_type": change_type,
        "timestamp": 1718000000000i64,
    })
    .to_string()
    .into_bytes()
}

fn node(id: &str, text: &str, version: i64) -> BlockNode {
    BlockNode {
        id: id.to_string(),
        text: text.to_string(),
        hash: compute_content_hash(text),
        version,
        source_file: "tier1/conv.md".to_string(),
        needs_reprocessing: false,
        last_updated: Utc::now(),
    }
}

async fn deliver(h: &mut Harness, body: &[u8]) -> MessageOutcome {
    h.queue.publish(body).await.unwrap();
    let delivery = h.queue.receive(Duration::ZERO).await.unwrap().unwrap();
    h.consumer.handle_delivery(&delivery).await
}

#[tokio::test]
async fn test_stale_message_is_acked_without_write() {
    let mut h = harness("Older text.\n<!-- id=blk_x ver=3 -->\n^blk_x\n");
    h.store.insert_node(node("blk_x", "Newer text.", 5));

    let outcome = deliver(&mut h, &message("blk_x", "modified")).await;
    assert_eq!(
        outcome,
        MessageOutcome::Ack(AckReason::Applied(BlockOutcome::VersionConflict {
            vault_version: 3,
            graph_version: 5,
        }))
    );

    let stored = h.store.node("blk_x").unwrap();
    assert_eq!(stored.version, 5);
    assert_eq!(stored.text, "Newer text.");
    assert_eq!(stored.hash, compute_content_hash("Newer text."));
    assert_eq!(h.store.write_count(), 0);
    assert_eq!(h.queue.unacked_len(), 0);
    assert_eq!(h.queue.ready_len(), 0);
    assert_eq!(h.consumer.stats().conflicts, 1);
}

#[tokio::test]
async fn test_new_block_is_created_with_vault_version_and_hash() {
    let mut h = harness("Fresh idea.\n<!-- id=blk_new ver=4 -->\n^blk_new\n");

    let outcome = deliver(&mut h, &message("blk_new", "added")).await;
    assert_eq!(outcome, MessageOutcome::Ack(AckReason::Applied(BlockOutcome::Created)));

    let stored = h.store.node("blk_new").unwrap();
    assert_eq!(stored.version, 4);
    assert_eq!(stored.hash, compute_content_hash("Fresh idea."));
    assert_eq!(stored.source_file, "tier1/conv.md");
}

#[tokio::test]
async fn test_same_message_twice_writes_once() {
    let mut h = harness("Repeat me.\n<!-- id=blk_r ver=1 -->\n^blk_r\n");

    let first = deliver(&mut h, &message("blk_r", "added")).await;
    let second = deliver(&mut h, &message("blk_r", "added")).await;

    assert_eq!(first, MessageOutcome::Ack(AckReason::Applied(BlockOutcome::Created)));
    assert_eq!(second, MessageOutcome::Ack(AckReason::Applied(BlockOutcome::Unchanged)));
    assert_eq!(h.store.write_count(), 1);
}

#[tokio::test]
async fn test_newer_version_updates_node() {
    let mut h = harness("Revised wording.\n<!-- id=blk_u ver=2 -->\n^blk_u\n");
    h.store.insert_node(node("blk_u", "Original wording.", 1));

    let outcome = deliver(&mut h, &message("blk_u", "modified")).await;
    assert_eq!(
        outcome,
        MessageOutcome::Ack(AckReason::Applied(BlockOutcome::Updated {
            previous_version: 1
        }))
    );
    let stored = h.store.node("blk_u").unwrap();
    assert_eq!(stored.version, 2);
    assert_eq!(stored.text, "Revised wording.");
    assert!(stored.needs_reprocessing);
}

#[tokio::test]
async fn test_malformed_message_is_dead_lettered() {
    let mut h = harness("x\n");
    let body = br#"{"file_path":"tier1/conv.md","change_type":"added"}"#;

    let outcome = deliver(&mut h, body).await;
    assert!(matches!(outcome, MessageOutcome::Reject(_)));
    assert_eq!(h.queue.dead_letters(), vec![body.to_vec()]);
    assert!(h.queue.receive(Duration::ZERO).await.unwrap().is_none());
    assert_eq!(h.consumer.stats().rejected, 1);
}

#[tokio::test]
async fn test_deleted_change_is_acked_without_reading() {
    let mut h = harness("Still here.\n<!-- id=blk_d ver=1 -->\n^blk_d\n");
    let outcome = deliver(&mut h, &message("blk_d", "deleted")).await;
    assert_eq!(outcome, MessageOutcome::Ack(AckReason::Deleted));
    assert!(h.store.is_empty());
}

#[tokio::test]
async fn test_missing_file_and_block_are_acked() {
    let mut h = harness("Only block.\n<!-- id=blk_o ver=1 -->\n^blk_o\n");

    let missing_block = deliver(&mut h, &message("blk_gone", "modified")).await;
    assert_eq!(missing_block, MessageOutcome::Ack(AckReason::BlockMissing));

    fs::remove_file(h.vault.path().join("tier1/conv.md")).unwrap();
    let missing_file = deliver(&mut h, &message("blk_o", "modified")).await;
    assert_eq!(missing_file, MessageOutcome::Ack(AckReason::FileMissing));

    assert_eq!(h.consumer.stats().missing, 2);
    assert_eq!(h.queue.ready_len(), 0);
}

#[tokio::test]
async fn test_absolute_path_is_accepted() {
    let mut h = harness("Absolute.\n<!-- id=blk_abs ver=1 -->\n^blk_abs\n");
    let abs = h.vault.path().join("tier1/conv.md");
    let body = json!({
        "aclarai_id": "blk_abs",
        "file_path": abs.display().to_string(),
        "change_type": "added",
    })
    .to_string();

    let outcome = deliver(&mut h, body.as_bytes()).await;
    assert_eq!(outcome, MessageOutcome::Ack(AckReason::Applied(BlockOutcome::Created)));
    assert_eq!(h.store.node("blk_abs").unwrap().source_file, "tier1/conv.md");
}

#[tokio::test]
async fn test_exhausted_retries_leave_message_for_redelivery() {
    let mut h = harness("Flaky.\n<!-- id=blk_f ver=1 -->\n^blk_f\n");
    h.store.fail_next(2);

    let outcome = deliver(&mut h, &message("blk_f", "added")).await;
    assert!(matches!(outcome, MessageOutcome::Requeue(_)));
    assert_eq!(h.queue.ready_len(), 1);
    assert!(h.store.is_empty());

    let redelivered = h.queue.receive(Duration::ZERO).await.unwrap().unwrap();
    assert!(redelivered.redelivered);
    let outcome = h.consumer.handle_delivery(&redelivered).await;
    assert_eq!(outcome, MessageOutcome::Ack(AckReason::Applied(BlockOutcome::Created)));

    let stats = h.consumer.stats();
    assert_eq!(stats.received, 2);
    assert_eq!(stats.requeued, 1);
    assert_eq!(stats.acked, 1);
}

#[tokio::test]
async fn test_out_of_order_delivery_keeps_highest_version() {
    let h = harness("");
    let path = h.vault.path().join("tier1/conv.md");

    // v2 arrives and is applied first.
    fs::write(&path, "Second draft.\n<!-- id=blk_o ver=2 -->\n^blk_o\n").unwrap();
    let applied = h.consumer.process_message(&message("blk_o", "modified")).await;
    assert_eq!(applied, MessageOutcome::Ack(AckReason::Applied(BlockOutcome::Created)));

    // A late v1 event, with the file momentarily reverted.
    fs::write(&path, "First draft.\n<!-- id=blk_o ver=1 -->\n^blk_o\n").unwrap();
    let stale = h.consumer.process_message(&message("blk_o", "modified")).await;
    assert!(matches!(
        stale,
        MessageOutcome::Ack(AckReason::Applied(BlockOutcome::VersionConflict { .. }))
    ));
    assert_eq!(h.store.node("blk_o").unwrap().text, "Second draft.");
}

#[tokio::test]
async fn test_run_stops_after_max_messages() {
    let h = harness("A.\n<!-- id=a ver=1 -->\n^a\nB.\n<!-- id=b ver=1 -->\n^b\nC.\n<!-- id=c ver=1 -->\n^c\n");
    for id in ["a", "b", "c"] {
        h.queue.publish(&message(id, "added")).await.unwrap();
    }
    let mut consumer = h.consumer.with_max_messages(Some(2));
    let (_stop_tx, stop_rx) = watch::channel(false);

    let stats = consumer.run(stop_rx).await;
    assert_eq!(stats.received, 2);
    assert_eq!(stats.created, 2);
    assert_eq!(consumer.state(), ConsumerState::Stopped);
    assert_eq!(h.queue.ready_len(), 1);
}

#[tokio::test]
async fn test_stop_signal_ends_loop() {
    let h = harness("Late.\n<!-- id=late ver=1 -->\n^late\n");
    let queue = h.queue.clone();
    let store = h.store.clone();
    let mut consumer = h.consumer;
    let (stop_tx, stop_rx) = watch::channel(false);

    let task = tokio::spawn(async move {
        let stats = consumer.run(stop_rx).await;
        (stats, consumer.state())
    });

    queue.publish(&message("late", "added")).await.unwrap();
    for _ in 0..200 {
        if store.node("late").is_some() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    stop_tx.send(true).unwrap();

    let (stats, state) = task.await.unwrap();
    assert_eq!(stats.created, 1);
    assert_eq!(state, ConsumerState::Stopped);
    drop(h.vault);
}

#[tokio::test]
async fn test_stopped_consumer_does_not_consume() {
    let mut h = harness("A.\n<!-- id=a ver=1 -->\n^a\n");
    h.queue.publish(&message("a", "added")).await.unwrap();
    h.consumer.stop();

    let (_stop_tx, stop_rx) = watch::channel(false);
    let stats = h.consumer.run(stop_rx).await;
    assert_eq!(stats.received, 0);
    assert_eq!(h.queue.ready_len(), 1);
}

#[tokio::test]
async fn test_stopped_consumer_does_not_drain() {
    let mut h = harness("A.\n<!-- id=a ver=1 -->\n^a\n");
    h.queue.publish(&message("a", "added")).await.unwrap();
    h.consumer.stop();

    let stats = h.consumer.drain().await;
    assert_eq!(stats.received, 0);
    assert_eq!(h.consumer.state(), ConsumerState::Stopped);
    assert_eq!(h.queue.ready_len(), 1);
    assert!(h.store.is_empty());
}

#[tokio::test]
async fn test_unreadable_path_is_dead_lettered() {
    let mut h = harness("x\n");
    let body = json!({
        "aclarai_id": "blk_dir",
        "file_path": "tier1",
        "change_type": "modified",
    })
    .to_string();

    let outcome = deliver(&mut h, body.as_bytes()).await;
    assert!(matches!(outcome, MessageOutcome::Reject(_)));
    assert_eq!(h.queue.ready_len(), 0);
    assert_eq!(h.queue.dead_letters(), vec![body.into_bytes()]);
    assert_eq!(h.consumer.stats().rejected, 1);
}

#[tokio::test]
async fn test_drain_processes_until_empty() {
    let mut h = harness("A.\n<!-- id=a ver=1 -->\n^a\nB.\n<!-- id=b ver=1 -->\n^b\n");
    h.queue.publish(&message("a", "added")).await.unwrap();
    h.queue.publish(&message("b", "added")).await.unwrap();
    h.queue.publish(b"garbage").await.unwrap();

    let stats = h.consumer.drain().await;
    assert_eq!(stats.received, 3);
    assert_eq!(stats.created, 2);
    assert_eq!(stats.rejected, 1);
    assert_eq!(h.consumer.state(), ConsumerState::Idle);
}
