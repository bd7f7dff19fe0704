//! Crash / Restart Tests
//!
//! These tests simulate a hard kill by aborting the coordinator task with
//! no graceful shutdown, then restart the store over the same directory and
//! assert what recovery rebuilds. Data the test expects to survive is made
//! durable with an explicit `sync_now` first (in production the 5ms group
//! commit timer does this); anything not synced is fair game for loss.

use bytes::Bytes;
use tempfile::TempDir;
use tokio::task::JoinHandle;

use queuehouse_core::MessageId;
use queuehouse_store::{MessageStore, StoreConfig};

fn test_config(dir: &TempDir) -> StoreConfig {
    StoreConfig {
        directory: dir.path().to_path_buf(),
        segment_max_size: 32 * 1024,
        sync_interval_ms: 1,
        ..Default::default()
    }
}

async fn start(dir: &TempDir) -> (MessageStore, JoinHandle<()>) {
    MessageStore::start(test_config(dir)).await.unwrap()
}

/// Hard kill: abort the coordinator mid-flight and drop the handle.
async fn crash(store: MessageStore, task: JoinHandle<()>) {
    drop(store);
    task.abort();
    let _ = task.await;
}

#[tokio::test]
async fn test_persistent_messages_survive_restart() {
    let dir = TempDir::new().unwrap();
    let (store, task) = start(&dir).await;

    let msgs: Vec<(MessageId, Bytes)> = ["a", "b", "c"]
        .iter()
        .map(|p| (MessageId::random(), Bytes::from(p.as_bytes())))
        .collect();
    for (id, payload) in &msgs {
        store
            .publish("q", *id, payload.clone(), true, false)
            .await
            .unwrap();
    }
    store.sync_now().await.unwrap();
    crash(store, task).await;

    let (store, _task) = start(&dir).await;
    for (id, payload) in &msgs {
        let delivery = store.deliver("q").await.unwrap().unwrap();
        assert_eq!(delivery.msg_id, *id);
        assert_eq!(delivery.payload, *payload);
    }
    assert!(store.deliver("q").await.unwrap().is_none());
    store.stop().await.unwrap();
}

#[tokio::test]
async fn test_transient_messages_dropped_on_restart() {
    let dir = TempDir::new().unwrap();
    let (store, task) = start(&dir).await;

    let (a, pa) = (MessageId::random(), Bytes::from_static(b"keep-a"));
    let (t, pt) = (MessageId::random(), Bytes::from_static(b"lose-t"));
    let (b, pb) = (MessageId::random(), Bytes::from_static(b"keep-b"));
    store.publish("q", a, pa.clone(), true, false).await.unwrap();
    store.publish("q", t, pt, false, false).await.unwrap();
    store.publish("q", b, pb.clone(), true, false).await.unwrap();
    store.sync_now().await.unwrap();
    crash(store, task).await;

    let (store, _task) = start(&dir).await;
    assert_eq!(store.length("q").await.unwrap(), 2);

    let d = store.deliver("q").await.unwrap().unwrap();
    assert_eq!(d.msg_id, a);
    assert_eq!(d.payload, pa);
    let d = store.deliver("q").await.unwrap().unwrap();
    assert_eq!(d.msg_id, b);
    assert_eq!(d.payload, pb);
    assert!(store.deliver("q").await.unwrap().is_none());

    store.stop().await.unwrap();
}

#[tokio::test]
async fn test_tx_commit_reply_implies_durability() {
    let dir = TempDir::new().unwrap();
    let (store, task) = start(&dir).await;

    let (a, pa) = (MessageId::random(), Bytes::from_static(b"tx-a"));
    let (b, pb) = (MessageId::random(), Bytes::from_static(b"tx-b"));
    store.tx_publish(a, pa.clone(), true).await.unwrap();
    store.tx_publish(b, pb.clone(), true).await.unwrap();

    // The commit reply only arrives after the records are fsynced, so a
    // crash immediately afterwards must not lose them.
    store.tx_commit("q", vec![a, b], vec![]).await.unwrap();
    crash(store, task).await;

    let (store, _task) = start(&dir).await;
    let d = store.deliver("q").await.unwrap().unwrap();
    assert_eq!(d.msg_id, a);
    assert_eq!(d.payload, pa);
    let d = store.deliver("q").await.unwrap().unwrap();
    assert_eq!(d.msg_id, b);
    assert_eq!(d.payload, pb);
    assert!(store.deliver("q").await.unwrap().is_none());

    store.stop().await.unwrap();
}

#[tokio::test]
async fn test_uncommitted_tx_publish_vanishes() {
    let dir = TempDir::new().unwrap();
    let (store, task) = start(&dir).await;

    let x = MessageId::random();
    store
        .tx_publish(x, Bytes::from_static(b"never committed"), true)
        .await
        .unwrap();
    store.sync_now().await.unwrap();
    crash(store, task).await;

    // The record is on disk but no queue row references it: recovery drops
    // it and the segment reports zero valid bytes.
    let (store, _task) = start(&dir).await;
    let stats = store.segment_summaries().await.unwrap();
    assert_eq!(stats.iter().map(|s| s.valid_bytes).sum::<u64>(), 0);

    store.stop().await.unwrap();
}

#[tokio::test]
async fn test_delivered_but_unacked_entries_come_back() {
    let dir = TempDir::new().unwrap();
    let (store, task) = start(&dir).await;

    let (id, payload) = (MessageId::random(), Bytes::from_static(b"redeliver me"));
    store
        .publish("q", id, payload.clone(), true, false)
        .await
        .unwrap();
    let first = store.deliver("q").await.unwrap().unwrap();
    assert!(!first.redelivered);
    store.sync_now().await.unwrap();
    crash(store, task).await;

    // Delivered but never acked: the row survives and is handed out again,
    // flagged as a redelivery.
    let (store, _task) = start(&dir).await;
    let again = store.deliver("q").await.unwrap().unwrap();
    assert_eq!(again.msg_id, id);
    assert_eq!(again.payload, payload);
    assert!(again.redelivered);

    store.stop().await.unwrap();
}

#[tokio::test]
async fn test_acked_entries_do_not_come_back() {
    let dir = TempDir::new().unwrap();
    let (store, task) = start(&dir).await;

    let (a, pa) = (MessageId::random(), Bytes::from_static(b"acked"));
    let (b, pb) = (MessageId::random(), Bytes::from_static(b"pending"));
    store.publish("q", a, pa, true, false).await.unwrap();
    store.publish("q", b, pb.clone(), true, false).await.unwrap();

    let d = store.deliver("q").await.unwrap().unwrap();
    store.ack("q", vec![(d.msg_id, d.seq)]).await.unwrap();
    store.sync_now().await.unwrap();
    crash(store, task).await;

    let (store, _task) = start(&dir).await;
    assert_eq!(store.length("q").await.unwrap(), 1);
    let d = store.deliver("q").await.unwrap().unwrap();
    assert_eq!(d.msg_id, b);
    assert_eq!(d.payload, pb);
    assert!(store.deliver("q").await.unwrap().is_none());

    store.stop().await.unwrap();
}

#[tokio::test]
async fn test_transient_queue_dropped_on_restart() {
    let dir = TempDir::new().unwrap();
    let (store, task) = start(&dir).await;

    store.declare_queue("scratch", false).await.unwrap();
    store.declare_queue("kept", true).await.unwrap();
    for i in 0..3 {
        let id = MessageId::random();
        let payload = Bytes::from(format!("m{}", i));
        store
            .publish("scratch", id, payload.clone(), true, false)
            .await
            .unwrap();
    }
    let id = MessageId::random();
    store
        .publish("kept", id, Bytes::from_static(b"still here"), true, false)
        .await
        .unwrap();
    store.sync_now().await.unwrap();
    crash(store, task).await;

    let (store, _task) = start(&dir).await;
    assert_eq!(store.length("scratch").await.unwrap(), 0);
    assert!(store.deliver("scratch").await.unwrap().is_none());
    assert_eq!(store.length("kept").await.unwrap(), 1);
    let d = store.deliver("kept").await.unwrap().unwrap();
    assert_eq!(d.msg_id, id);

    store.stop().await.unwrap();
}

#[tokio::test]
async fn test_restart_resumes_appending_to_tail_segment() {
    let dir = TempDir::new().unwrap();
    let (store, task) = start(&dir).await;

    let (a, pa) = (MessageId::random(), Bytes::from_static(b"before"));
    store.publish("q", a, pa.clone(), true, false).await.unwrap();
    store.sync_now().await.unwrap();
    crash(store, task).await;

    // Publish more after the restart; old and new records interleave in
    // the same segment without clobbering each other.
    let (store, task) = start(&dir).await;
    let (b, pb) = (MessageId::random(), Bytes::from_static(b"after"));
    store.publish("q", b, pb.clone(), true, false).await.unwrap();
    store.sync_now().await.unwrap();
    crash(store, task).await;

    let (store, _task) = start(&dir).await;
    let stats = store.segment_summaries().await.unwrap();
    assert_eq!(stats.len(), 1);

    let d = store.deliver("q").await.unwrap().unwrap();
    assert_eq!((d.msg_id, d.payload), (a, pa));
    let d = store.deliver("q").await.unwrap().unwrap();
    assert_eq!((d.msg_id, d.payload), (b, pb));

    store.stop().await.unwrap();
}
