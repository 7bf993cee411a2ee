/// Sync engine integration tests
/// Outgoing retries, incoming merges, index parity and the background loop

extern crate parley_core;

use chrono::{TimeZone, Utc};
use parley_core::clock::{Clock, ManualClock};
use parley_core::conversation_index::ConversationIndex;
use parley_core::error::ChatError;
use parley_core::local_store::LocalStore;
use parley_core::message_log::MessageLog;
use parley_core::messenger_types::{DeliveryState, Message, Payload};
use parley_core::presence::StaticPresence;
use parley_core::sync_engine::{SyncConfig, SyncEngine, SyncEvent};
use parley_core::transport::{Ack, ConnectionState, MemoryTransport};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::watch;

const CONV: &str = "dm:me:you";

struct Harness {
    engine: SyncEngine,
    transport: Arc<MemoryTransport>,
    clock: Arc<ManualClock>,
}

fn harness_on(store: LocalStore, transport: MemoryTransport) -> Harness {
    let transport = Arc::new(transport);
    let clock = Arc::new(ManualClock::new(
        Utc.timestamp_opt(1_700_000_000, 0).unwrap(),
    ));
    let engine = SyncEngine::new(
        MessageLog::new(store.clone()),
        ConversationIndex::new(store, "me"),
        transport.clone(),
        Arc::new(StaticPresence::new()),
        clock.clone(),
        SyncConfig::default(),
    );
    Harness {
        engine,
        transport,
        clock,
    }
}

fn harness(transport: MemoryTransport) -> Harness {
    harness_on(LocalStore::in_memory(), transport)
}

impl Harness {
    fn local(&self, text: &str) -> Message {
        self.clock.advance(chrono::Duration::seconds(1));
        Message::new_local(CONV, "me", Payload::text(text), self.clock.now())
    }

    fn remote(&self, text: &str, sequence: u64) -> Message {
        self.clock.advance(chrono::Duration::seconds(1));
        let mut m = Message::new_local(CONV, "you", Payload::text(text), self.clock.now());
        m.sequence = sequence;
        m
    }

    fn state_of(&self, id: &str) -> DeliveryState {
        self.engine.log().find(id).unwrap().unwrap().delivery_state
    }
}

fn drain(rx: &mut tokio::sync::broadcast::Receiver<SyncEvent>) -> Vec<SyncEvent> {
    let mut out = Vec::new();
    while let Ok(e) = rx.try_recv() {
        out.push(e);
    }
    out
}

async fn eventually<F: Fn() -> bool>(check: F) {
    for _ in 0..200 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not reached");
}

// ─── outgoing ────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_send_is_optimistic_then_acknowledged() {
    let h = harness(MemoryTransport::new());
    let mut events = h.engine.subscribe();

    let stored = h.engine.enqueue_outgoing(h.local("hi")).await.unwrap();
    assert_eq!(stored.sequence, 1);
    assert_eq!(stored.delivery_state, DeliveryState::Sent);

    let events = drain(&mut events);
    assert!(matches!(&events[0], SyncEvent::MessageStored { message } if message.delivery_state == DeliveryState::Pending));
    assert!(events.iter().any(|e| matches!(
        e,
        SyncEvent::DeliveryStateChanged { state: DeliveryState::Sent, .. }
    )));
    assert_eq!(h.engine.attempts(&stored.id).await, None);
}

#[tokio::test(start_paused = true)]
async fn test_three_failures_keep_message_and_fourth_retry_still_sends() {
    let h = harness(MemoryTransport::new());
    h.transport.fail_next(3, "timeout");
    let mut events = h.engine.subscribe();

    let stored = h.engine.enqueue_outgoing(h.local("persist me")).await.unwrap();
    assert_eq!(stored.delivery_state, DeliveryState::Failed);
    assert_eq!(h.transport.attempts_for(&stored.id), 1);

    // Retries at +1s and +3s fail too
    tokio::time::sleep(Duration::from_millis(3500)).await;
    assert_eq!(h.transport.attempts_for(&stored.id), 3);
    assert_eq!(h.state_of(&stored.id), DeliveryState::Failed);
    assert_eq!(h.engine.attempts(&stored.id).await, Some(3));

    let failures: Vec<(u32, bool)> = drain(&mut events)
        .into_iter()
        .filter_map(|e| match e {
            SyncEvent::DeliveryFailed {
                attempts, visible, ..
            } => Some((attempts, visible)),
            _ => None,
        })
        .collect();
    assert_eq!(failures, vec![(1, false), (2, false), (3, true)]);

    // Fourth attempt at +7s succeeds
    tokio::time::sleep(Duration::from_secs(4)).await;
    assert_eq!(h.transport.attempts_for(&stored.id), 4);
    assert_eq!(h.state_of(&stored.id), DeliveryState::Sent);
    assert_eq!(h.engine.log().latest(CONV, 10).await.unwrap().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_cancel_retry_stops_timer_until_user_retries() {
    let h = harness(MemoryTransport::new());
    h.transport.fail_next(1, "timeout");

    let stored = h.engine.enqueue_outgoing(h.local("x")).await.unwrap();
    assert!(h.engine.cancel_retry(&stored.id).await.unwrap());
    assert!(!h.engine.cancel_retry(&stored.id).await.unwrap());

    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(h.transport.attempts_for(&stored.id), 1);
    assert_eq!(h.state_of(&stored.id), DeliveryState::Failed);

    h.engine.retry_message(&stored.id).await.unwrap();
    assert_eq!(h.transport.attempts_for(&stored.id), 2);
    assert_eq!(h.state_of(&stored.id), DeliveryState::Sent);
}

#[tokio::test(start_paused = true)]
async fn test_cancel_conversation_stops_all_its_retries() {
    let h = harness(MemoryTransport::new());
    h.transport.fail_next(2, "timeout");
    let a = h.engine.enqueue_outgoing(h.local("a")).await.unwrap();
    let b = h.engine.enqueue_outgoing(h.local("b")).await.unwrap();

    assert_eq!(h.engine.cancel_conversation(CONV).await.unwrap(), 2);
    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(h.transport.sent().len(), 2);
    assert_eq!(h.state_of(&a.id), DeliveryState::Failed);
    assert_eq!(h.state_of(&b.id), DeliveryState::Failed);
}

#[tokio::test]
async fn test_offline_parks_then_flushes_on_reconnect() {
    let h = harness(MemoryTransport::loopback());
    h.transport.set_connection(ConnectionState::Offline);

    let stored = h.engine.enqueue_outgoing(h.local("later")).await.unwrap();
    assert_eq!(stored.delivery_state, DeliveryState::Pending);
    assert_eq!(h.transport.attempts_for(&stored.id), 0);

    h.transport.set_connection(ConnectionState::Online);
    h.engine
        .on_connection_change(ConnectionState::Online)
        .await
        .unwrap();
    assert_eq!(h.state_of(&stored.id), DeliveryState::Delivered);
}

#[tokio::test]
async fn test_late_failure_never_regresses_delivered() {
    let h = harness(MemoryTransport::loopback());
    let stored = h.engine.enqueue_outgoing(h.local("done")).await.unwrap();
    assert_eq!(stored.delivery_state, DeliveryState::Delivered);

    h.engine
        .on_transport_failure(&stored.id, "late timeout")
        .await
        .unwrap();
    h.engine.on_transport_ack(&stored.id, Ack::Sent).await.unwrap();
    assert!(h
        .engine
        .log()
        .set_delivery_state(&stored.id, DeliveryState::Pending)
        .await
        .unwrap()
        .is_none());
    assert_eq!(h.state_of(&stored.id), DeliveryState::Delivered);
}

#[tokio::test]
async fn test_resume_after_restart_sends_unsettled() {
    let dir = TempDir::new().unwrap();
    let id = {
        let offline = MemoryTransport::new();
        offline.set_connection(ConnectionState::Offline);
        let h = harness_on(LocalStore::open(dir.path()).unwrap(), offline);
        let stored = h.engine.enqueue_outgoing(h.local("survive")).await.unwrap();
        assert_eq!(stored.delivery_state, DeliveryState::Pending);
        stored.id
    };

    let h = harness_on(LocalStore::open(dir.path()).unwrap(), MemoryTransport::new());
    assert_eq!(h.engine.resume().await.unwrap(), 1);
    assert_eq!(h.state_of(&id), DeliveryState::Sent);
}

// ─── incoming ────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_duplicate_incoming_after_local_send_keeps_two_messages() {
    let h = harness(MemoryTransport::new());
    let a = h.engine.enqueue_outgoing(h.local("A")).await.unwrap();
    let b = h.remote("B", 2);

    let first = h.engine.on_incoming(b.clone()).await.unwrap();
    let again = h.engine.on_incoming(b.clone()).await.unwrap();
    assert_eq!(first.sequence, 2);
    assert_eq!(again.sequence, 2);

    let all = h.engine.log().latest(CONV, 10).await.unwrap();
    assert_eq!(all.len(), 2);
    assert_eq!(all[0].id, a.id);
    assert_eq!(all[1].id, b.id);

    let summary = h.engine.index().get(CONV).unwrap().unwrap();
    assert_eq!(summary.last_message_id.as_deref(), Some(b.id.as_str()));
    assert_eq!(summary.unread_count, 1);
}

#[tokio::test]
async fn test_echo_of_local_send_is_not_duplicated() {
    let h = harness(MemoryTransport::new());
    let a = h.engine.enqueue_outgoing(h.local("A")).await.unwrap();
    let b = h.engine.enqueue_outgoing(h.local("B")).await.unwrap();

    let mut echo = b.clone();
    echo.delivery_state = DeliveryState::Delivered;
    let merged = h.engine.on_incoming(echo).await.unwrap();
    assert_eq!(merged.id, b.id);
    assert_eq!(merged.sequence, 2);

    let all = h.engine.log().latest(CONV, 10).await.unwrap();
    assert_eq!(all.len(), 2);
    assert_eq!(all[0].id, a.id);
    assert_eq!(all[1].id, b.id);

    let summary = h.engine.index().get(CONV).unwrap().unwrap();
    assert_eq!(summary.last_message_id.as_deref(), Some(b.id.as_str()));
    assert_eq!(summary.unread_count, 0);
}

#[tokio::test]
async fn test_out_of_range_remote_sequence_leaves_log_usable() {
    let h = harness(MemoryTransport::new());
    for seq in [u64::MAX, u64::MAX - 1] {
        let err = h.engine.on_incoming(h.remote("far", seq)).await.unwrap_err();
        assert!(matches!(err, ChatError::OutOfRange(_)));
    }
    let stored = h.engine.enqueue_outgoing(h.local("still fine")).await.unwrap();
    assert_eq!(stored.sequence, 1);
    assert_eq!(h.engine.on_incoming(h.remote("next", 2)).await.unwrap().sequence, 2);
}

#[tokio::test]
async fn test_incoming_is_ordered_by_sequence_not_arrival() {
    let h = harness(MemoryTransport::new());
    for seq in [3, 1, 2] {
        h.engine.on_incoming(h.remote(&format!("m{}", seq), seq)).await.unwrap();
    }
    let seqs: Vec<u64> = h
        .engine
        .log()
        .get(CONV, 1, 10)
        .await
        .unwrap()
        .iter()
        .map(|m| m.sequence)
        .collect();
    assert_eq!(seqs, vec![1, 2, 3]);
    assert_eq!(h.engine.index().get(CONV).unwrap().unwrap().unread_count, 3);
}

#[tokio::test]
async fn test_conflicting_redelivery_keeps_first_and_reports() {
    let h = harness(MemoryTransport::new());
    let mut events = h.engine.subscribe();
    let original = h.remote("original", 1);
    h.engine.on_incoming(original.clone()).await.unwrap();

    let mut tampered = original.clone();
    tampered.payload = Payload::text("edited");
    let err = h.engine.on_incoming(tampered).await.unwrap_err();
    assert!(matches!(err, ChatError::Conflict { .. }));

    let kept = h.engine.log().find(&original.id).unwrap().unwrap();
    assert_eq!(kept.payload, Payload::text("original"));
    assert!(drain(&mut events)
        .iter()
        .any(|e| matches!(e, SyncEvent::ConflictDetected { message_id, .. } if *message_id == original.id)));
}

#[tokio::test]
async fn test_malformed_incoming_rejected() {
    let h = harness(MemoryTransport::new());
    let mut m = h.remote("x", 1);
    m.author_id.clear();
    assert!(matches!(
        h.engine.on_incoming(m).await,
        Err(ChatError::Corrupt { .. })
    ));
    assert!(h.engine.log().load(CONV).unwrap().is_none());
}

#[tokio::test]
async fn test_open_conversation_reads_incoming() {
    let h = harness(MemoryTransport::new());
    h.engine.on_incoming(h.remote("one", 1)).await.unwrap();
    let summary = h.engine.open_conversation(CONV).await.unwrap();
    assert_eq!(summary.unread_count, 0);
    assert_eq!(summary.read_through, 1);

    h.engine.on_incoming(h.remote("two", 2)).await.unwrap();
    assert_eq!(h.engine.index().get(CONV).unwrap().unwrap().unread_count, 0);

    h.engine.close_conversation().await;
    h.engine.on_incoming(h.remote("three", 3)).await.unwrap();
    assert_eq!(h.engine.index().get(CONV).unwrap().unwrap().unread_count, 1);
}

#[tokio::test]
async fn test_open_unknown_conversation_is_not_found() {
    let h = harness(MemoryTransport::new());
    h.engine.on_incoming(h.remote("one", 1)).await.unwrap();
    h.engine.open_conversation(CONV).await.unwrap();

    let err = h.engine.open_conversation("dm:me:nobody").await.unwrap_err();
    assert!(matches!(err, ChatError::NotFound(_)));
    assert_eq!(h.engine.open_conversation_id().await.as_deref(), Some(CONV));
    assert!(h.engine.index().get("dm:me:nobody").unwrap().is_none());
}

// ─── index parity ────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_rebuilt_index_matches_incremental() {
    let h = harness(MemoryTransport::new());
    h.engine.enqueue_outgoing(h.local("a")).await.unwrap();
    h.engine.on_incoming(h.remote("b", 2)).await.unwrap();
    h.engine.on_incoming(h.remote("c", 2)).await.unwrap();
    h.engine.open_conversation(CONV).await.unwrap();
    h.engine.close_conversation().await;
    h.engine.on_incoming(h.remote("d", 9)).await.unwrap();

    let mut other = h.remote("elsewhere", 1);
    other.conversation_id = "dm:me:zoe".to_string();
    h.engine.on_incoming(other).await.unwrap();

    let incremental = h.engine.index().list().unwrap();
    let rebuilt = h.engine.index().rebuild_from(h.engine.log()).await.unwrap();
    assert_eq!(incremental, rebuilt);
    assert_eq!(h.engine.index().list().unwrap(), rebuilt);
}

// ─── concurrency ─────────────────────────────────────────────────────────────

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_interleaved_conversations_keep_independent_counters() {
    let store = LocalStore::in_memory();
    let log = MessageLog::new(store);
    let now = Utc::now();

    let mut tasks = Vec::new();
    for i in 0..40 {
        let log = log.clone();
        let conv = if i % 2 == 0 { "dm:a:me" } else { "dm:b:me" };
        tasks.push(tokio::spawn(async move {
            let m = Message::new_local(conv, "me", Payload::text(format!("{}", i)), now);
            log.append(conv, m).await.unwrap()
        }));
    }
    for t in tasks {
        t.await.unwrap();
    }

    for conv in ["dm:a:me", "dm:b:me"] {
        let seqs: Vec<u64> = log
            .get(conv, 1, 100)
            .await
            .unwrap()
            .iter()
            .map(|m| m.sequence)
            .collect();
        assert_eq!(seqs, (1..=20).collect::<Vec<u64>>());
    }
}

// ─── background loop ─────────────────────────────────────────────────────────

#[tokio::test]
async fn test_run_loop_merges_transport_input_and_flushes() {
    let h = harness(MemoryTransport::new());
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let engine = h.engine.clone();
    let handle = tokio::spawn(async move { engine.run(shutdown_rx).await });

    // An out-of-range sequence is logged and dropped without stopping the loop
    h.transport.deliver(h.remote("too far", u64::MAX));
    let incoming = h.remote("via transport", 1);
    h.transport.deliver(incoming.clone());
    eventually(|| h.engine.log().find(&incoming.id).unwrap().is_some()).await;

    let (_tx, rx2) = watch::channel(false);
    assert!(matches!(
        h.engine.run(rx2).await,
        Err(ChatError::InvalidTransition(_))
    ));

    h.transport.set_connection(ConnectionState::Offline);
    let parked = h.engine.enqueue_outgoing(h.local("queued")).await.unwrap();
    assert_eq!(parked.delivery_state, DeliveryState::Pending);
    h.transport.set_connection(ConnectionState::Online);
    eventually(|| h.state_of(&parked.id) == DeliveryState::Sent).await;

    shutdown_tx.send(true).unwrap();
    handle.await.unwrap().unwrap();
}
