//! End-to-end tests for the sync engine.
//!
//! Drives real `SyncClient` instances over a `LocalHub` and the in-memory
//! (or filesystem) backend: broadcast convergence, schema negotiation,
//! debounced persistence, failure recovery, and restart-from-disk.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tabula_store::{
    Migration, MigrationSequence, Record, RecordId, RecordScope, SerializedSchema, Store,
    StoreSchema, schema::SCHEMA_FORMAT_VERSION,
};
use tabula_sync::{
    BroadcastMessage, CancelToken, ClientStatus, DocumentChannel, DocumentId, FsBackend, LocalHub,
    MemoryBackend, ReloadReason, SessionEvent, SessionId, SessionSnapshot, StorageBackend,
    SyncClient, SyncConfig,
};
use tempfile::TempDir;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::time::timeout;

const DOC: &str = "board-1";

fn doc_id() -> DocumentId {
    DocumentId::new(DOC)
}

/// Schema with a `doc` sequence of `version` no-op migrations, so two
/// builds can disagree only about versions, not lineage.
fn schema_v(version: u32) -> Arc<StoreSchema> {
    let mut schema = StoreSchema::new();
    schema.register_type("shape", RecordScope::Document);
    schema.register_type("camera", RecordScope::Session);
    let migrations = (1..=version)
        .map(|v| Migration::new(v, "noop", |_| {}))
        .collect();
    schema.add_sequence(MigrationSequence::new("doc", migrations));
    Arc::new(schema)
}

fn stamp_at(version: u32) -> SerializedSchema {
    SerializedSchema {
        schema_version: SCHEMA_FORMAT_VERSION,
        sequences: BTreeMap::from([("doc".to_string(), version)]),
    }
}

fn fast_config() -> SyncConfig {
    SyncConfig {
        debounce: Duration::from_millis(20),
        retry_delay: Duration::from_millis(60),
        min_uptime_for_reload: Duration::ZERO,
        session_retention: 10,
    }
}

fn shape(id: &str, x: i64) -> Record {
    Record::new(id, "shape", json!({ "x": x }))
}

/// One simulated editor instance.
struct Session {
    store: Arc<Store>,
    client: SyncClient,
    events: UnboundedReceiver<SessionEvent>,
}

fn open_session(
    hub: &LocalHub,
    backend: Arc<dyn StorageBackend>,
    schema: Arc<StoreSchema>,
    config: SyncConfig,
) -> Session {
    let store = Arc::new(Store::new(schema));
    let channel: Arc<dyn DocumentChannel> = Arc::new(hub.open(&doc_id()));
    let (client, events) = SyncClient::new(doc_id(), Arc::clone(&store), backend, channel, config);
    Session {
        store,
        client,
        events,
    }
}

async fn next_event(events: &mut UnboundedReceiver<SessionEvent>) -> SessionEvent {
    timeout(Duration::from_secs(3), events.recv())
        .await
        .expect("timed out waiting for session event")
        .expect("event channel closed")
}

async fn expect_loaded(session: &mut Session) {
    let event = next_event(&mut session.events).await;
    assert!(matches!(event, SessionEvent::Loaded), "got {event:?}");
}

/// Poll until `condition` holds or a deadline passes.
async fn wait_until(what: &str, mut condition: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(3);
    while !condition() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for {what}"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

// ============================================================================
// Broadcast and persistence
// ============================================================================

#[tokio::test]
async fn test_edit_reaches_peer_and_durable_store() {
    let hub = LocalHub::new();
    let backend = Arc::new(MemoryBackend::new());

    let mut a = open_session(&hub, backend.clone(), schema_v(3), fast_config());
    expect_loaded(&mut a).await;
    let mut b = open_session(&hub, backend.clone(), schema_v(3), fast_config());
    expect_loaded(&mut b).await;

    let observer = hub.open(&doc_id());
    let mut observed = observer.subscribe();

    a.store.put([shape("r1", 7)]);

    // the diff goes out immediately, before any debounce elapses
    let message = timeout(Duration::from_secs(1), observed.recv())
        .await
        .expect("no broadcast observed")
        .unwrap();
    match message {
        BroadcastMessage::Diff {
            document_id,
            changes,
            ..
        } => {
            assert_eq!(document_id, doc_id());
            assert!(changes.added.contains_key(&RecordId::new("r1")));
        }
        other => panic!("expected diff message, got {other:?}"),
    }

    wait_until("peer to apply the diff", || {
        b.store.get(&RecordId::new("r1")).is_some()
    })
    .await;
    wait_until("durable store to contain r1", || {
        backend
            .stored(&doc_id())
            .is_some_and(|s| s.records.contains_key(&RecordId::new("r1")))
    })
    .await;
}

#[tokio::test]
async fn test_equal_schema_instances_converge() {
    let hub = LocalHub::new();
    let backend = Arc::new(MemoryBackend::new());

    let mut a = open_session(&hub, backend.clone(), schema_v(2), fast_config());
    expect_loaded(&mut a).await;
    let mut b = open_session(&hub, backend.clone(), schema_v(2), fast_config());
    expect_loaded(&mut b).await;

    // disjoint ids per instance, interleaved edits
    for i in 0..10 {
        a.store.put([shape(&format!("a{i}"), i)]);
        b.store.put([shape(&format!("b{i}"), i)]);
    }
    a.store.remove(&[RecordId::new("a0")]);
    b.store.put([shape("b3", 99)]);

    wait_until("stores to converge", || {
        let left = a.store.records_in_scope(RecordScope::Document);
        let right = b.store.records_in_scope(RecordScope::Document);
        !left.is_empty() && left == right
    })
    .await;

    let converged = a.store.records_in_scope(RecordScope::Document);
    assert!(!converged.contains_key(&RecordId::new("a0")));
    assert_eq!(converged[&RecordId::new("b3")].data["x"], json!(99));

    // a stale announce makes both instances supersede whatever interleaving
    // of early writes reached storage with a snapshot of the converged state
    let nudge = hub.open(&doc_id());
    nudge.publish(BroadcastMessage::Announce { schema: stamp_at(1) });

    wait_until("durable store to match", || {
        backend.stored(&doc_id()).is_some_and(|s| s.records == converged)
    })
    .await;
}

#[tokio::test]
async fn test_rapid_edits_are_debounced_into_few_writes() {
    let hub = LocalHub::new();
    let backend = Arc::new(MemoryBackend::new());

    let mut a = open_session(&hub, backend.clone(), schema_v(1), fast_config());
    expect_loaded(&mut a).await;

    // burst of edits inside one debounce window
    for i in 0..20 {
        a.store.put([shape("r1", i)]);
    }

    wait_until("burst to persist", || {
        backend
            .stored(&doc_id())
            .is_some_and(|s| s.records.get(&RecordId::new("r1")).is_some_and(|r| r.data["x"] == json!(19)))
    })
    .await;

    // first write is the initial full snapshot; the burst squashes into at
    // most a couple of follow-ups rather than one write per edit
    let writes = backend.snapshot_write_count() + backend.diff_write_count();
    assert!(writes <= 3, "expected a debounced handful of writes, got {writes}");
}

// ============================================================================
// Schema negotiation
// ============================================================================

#[tokio::test]
async fn test_older_instance_requests_reload_exactly_once() {
    let hub = LocalHub::new();
    let backend = Arc::new(MemoryBackend::new());

    let mut newer = open_session(&hub, backend.clone(), schema_v(2), fast_config());
    expect_loaded(&mut newer).await;
    let mut older = open_session(&hub, backend.clone(), schema_v(1), fast_config());

    // older announces v1; newer answers with its v2 announce; older reloads
    let reload = timeout(Duration::from_secs(3), async {
        loop {
            match older.events.recv().await.expect("event channel closed") {
                SessionEvent::ReloadRequired(reason) => break reason,
                SessionEvent::Loaded => continue,
                other => panic!("unexpected event {other:?}"),
            }
        }
    })
    .await
    .expect("no reload requested");
    assert_eq!(reload, ReloadReason::NewerSchemaInPeer);
    assert_eq!(older.client.status(), ClientStatus::AwaitingReload);

    let observer = hub.open(&doc_id());
    let mut observed = observer.subscribe();

    // more traffic from the newer peer must not trigger a second reload,
    // and the stale instance must not broadcast edits made after the fact
    newer.store.put([shape("n1", 1)]);
    older.store.put([shape("o1", 1)]);
    tokio::time::sleep(Duration::from_millis(100)).await;

    let stale_stamp = stamp_at(1);
    while let Ok(message) = observed.try_recv() {
        assert_ne!(
            message.schema(),
            &stale_stamp,
            "stale instance broadcast after reload was requested"
        );
    }
    // a Loaded that raced the reload may still be queued; nothing else may be
    while let Ok(event) = older.events.try_recv() {
        assert!(matches!(event, SessionEvent::Loaded), "got {event:?}");
    }

    // and it must not have persisted over the newer instance's data
    wait_until("newer instance's write", || {
        backend
            .stored(&doc_id())
            .is_some_and(|s| s.records.contains_key(&RecordId::new("n1")))
    })
    .await;
    assert!(
        !backend
            .stored(&doc_id())
            .unwrap()
            .records
            .contains_key(&RecordId::new("o1"))
    );
}

#[tokio::test]
async fn test_young_instance_halts_instead_of_reloading() {
    let hub = LocalHub::new();
    let backend = Arc::new(MemoryBackend::new());

    let mut newer = open_session(&hub, backend.clone(), schema_v(2), fast_config());
    expect_loaded(&mut newer).await;

    // an instance seeing a newer peer within its startup window treats the
    // situation as a downgrade loop
    let config = SyncConfig {
        min_uptime_for_reload: Duration::from_secs(60),
        ..fast_config()
    };
    let mut young = open_session(&hub, backend.clone(), schema_v(1), config);

    let event = timeout(Duration::from_secs(3), async {
        loop {
            match young.events.recv().await.expect("event channel closed") {
                SessionEvent::Loaded => continue,
                other => break other,
            }
        }
    })
    .await
    .expect("no mismatch surfaced");
    match event {
        SessionEvent::FatalSchemaMismatch { local, remote } => {
            assert_eq!(local, stamp_at(1));
            assert_eq!(remote, stamp_at(2));
        }
        other => panic!("expected fatal mismatch, got {other:?}"),
    }
    assert_eq!(young.client.status(), ClientStatus::Halted);
    // no reload may follow a halt; a Loaded that raced the halt is fine
    while let Ok(event) = young.events.try_recv() {
        assert!(matches!(event, SessionEvent::Loaded), "got {event:?}");
    }
}

#[tokio::test]
async fn test_divergent_lineage_is_fatal() {
    let hub = LocalHub::new();
    let backend = Arc::new(MemoryBackend::new());

    let mut a = open_session(&hub, backend.clone(), schema_v(1), fast_config());
    expect_loaded(&mut a).await;

    let mut other_lineage = StoreSchema::new();
    other_lineage.register_type("shape", RecordScope::Document);
    other_lineage.add_sequence(MigrationSequence::new("fork", vec![]));
    let mut b = open_session(&hub, backend.clone(), Arc::new(other_lineage), fast_config());
    expect_loaded(&mut b).await;

    // each side sees the other's announce as incompatible
    wait_until("a to halt", || a.client.status() == ClientStatus::Halted).await;
    let event = next_event(&mut a.events).await;
    assert!(matches!(event, SessionEvent::FatalSchemaMismatch { .. }));
}

#[tokio::test]
async fn test_seeing_stale_peer_schedules_full_rewrite() {
    let hub = LocalHub::new();
    let backend = Arc::new(MemoryBackend::new());

    let mut newer = open_session(&hub, backend.clone(), schema_v(2), fast_config());
    expect_loaded(&mut newer).await;
    let before = backend.snapshot_write_count();

    // the stale peer's announce alone must provoke a superseding snapshot
    let stale = hub.open(&doc_id());
    stale.publish(BroadcastMessage::Announce { schema: stamp_at(1) });

    wait_until("superseding full write", || {
        backend.snapshot_write_count() > before
    })
    .await;
}

// ============================================================================
// Startup: load, migrate, prune
// ============================================================================

#[tokio::test]
async fn test_startup_migrates_persisted_snapshot_forward() {
    let hub = LocalHub::new();
    let backend = Arc::new(MemoryBackend::new());

    // persisted by a v1 build, including a session-scope row from some
    // other instance's write
    let mut records = BTreeMap::new();
    records.insert(RecordId::new("r1"), shape("r1", 3));
    records.insert(
        RecordId::new("cam"),
        Record::new("cam", "camera", json!({ "zoom": 2 })),
    );
    backend.seed_document(&doc_id(), records, stamp_at(1));

    // current build is v2: the v2 migration scales x by 10
    let mut schema = StoreSchema::new();
    schema.register_type("shape", RecordScope::Document);
    schema.register_type("camera", RecordScope::Session);
    schema.add_sequence(MigrationSequence::new(
        "doc",
        vec![
            Migration::new(1, "noop", |_| {}),
            Migration::new(2, "scale_up", |records| {
                for record in records.values_mut() {
                    if let Some(x) = record.data["x"].as_i64() {
                        record.data["x"] = json!(x * 10);
                    }
                }
            }),
        ],
    ));

    let mut session = open_session(&hub, backend.clone(), Arc::new(schema), fast_config());
    expect_loaded(&mut session).await;

    assert_eq!(
        session.store.get(&RecordId::new("r1")).unwrap().data["x"],
        json!(30)
    );
    // the stray session-scope row is not merged into document state
    assert!(session.store.get(&RecordId::new("cam")).is_none());
}

#[tokio::test]
async fn test_newer_persisted_snapshot_fails_load() {
    let hub = LocalHub::new();
    let backend = Arc::new(MemoryBackend::new());
    backend.seed_document(&doc_id(), BTreeMap::new(), stamp_at(9));

    let mut session = open_session(&hub, backend.clone(), schema_v(1), fast_config());

    let event = next_event(&mut session.events).await;
    assert!(
        matches!(event, SessionEvent::LoadFailed(_)),
        "got {event:?}"
    );
    // migration failure is fatal but not a storage failure: no reload, no
    // announce, no Loaded
    assert!(session.events.try_recv().is_err());
}

#[tokio::test]
async fn test_failed_load_never_overwrites_newer_snapshot() {
    let hub = LocalHub::new();
    let backend = Arc::new(MemoryBackend::new());

    // a doc@9 build persisted this; a doc@1 build cannot migrate it
    let mut records = BTreeMap::new();
    records.insert(RecordId::new("precious"), shape("precious", 1));
    backend.seed_document(&doc_id(), records, stamp_at(9));

    let mut session = open_session(&hub, backend.clone(), schema_v(1), fast_config());
    let event = next_event(&mut session.events).await;
    assert!(matches!(event, SessionEvent::LoadFailed(_)), "got {event:?}");
    assert_eq!(session.client.status(), ClientStatus::Halted);

    let observer = hub.open(&doc_id());
    let mut observed = observer.subscribe();

    // edits after the failed load must neither persist nor broadcast
    session.store.put([shape("r1", 1)]);
    tokio::time::sleep(Duration::from_millis(100)).await;

    let stored = backend.stored(&doc_id()).unwrap();
    assert_eq!(stored.schema, stamp_at(9));
    assert!(stored.records.contains_key(&RecordId::new("precious")));
    assert!(!stored.records.contains_key(&RecordId::new("r1")));
    assert!(observed.try_recv().is_err());
}

#[tokio::test]
async fn test_unreadable_storage_requests_restart() {
    let hub = LocalHub::new();
    let backend = Arc::new(MemoryBackend::new());
    backend.set_unavailable(true);

    let mut session = open_session(&hub, backend.clone(), schema_v(1), fast_config());

    let first = next_event(&mut session.events).await;
    assert!(matches!(first, SessionEvent::LoadFailed(_)), "got {first:?}");
    let second = next_event(&mut session.events).await;
    assert!(
        matches!(
            second,
            SessionEvent::ReloadRequired(ReloadReason::StorageFailure)
        ),
        "got {second:?}"
    );
    assert_eq!(session.client.status(), ClientStatus::AwaitingReload);
}

#[tokio::test]
async fn test_old_session_snapshots_are_pruned_at_startup() {
    let hub = LocalHub::new();
    let backend = Arc::new(MemoryBackend::new());
    backend.seed_document(&doc_id(), BTreeMap::new(), stamp_at(1));
    for i in 0..12u64 {
        backend.seed_session(
            &doc_id(),
            SessionSnapshot {
                session_id: SessionId::new(format!("s{i}")),
                records: vec![],
                updated_at_ms: i,
            },
        );
    }

    let mut session = open_session(&hub, backend.clone(), schema_v(1), fast_config());
    expect_loaded(&mut session).await;

    let sessions = backend.list_sessions(&doc_id()).await.unwrap();
    let ids: Vec<_> = sessions.iter().map(|s| s.session_id.clone()).collect();
    assert!(!ids.contains(&SessionId::new("s0")));
    assert!(!ids.contains(&SessionId::new("s1")));
    assert!(ids.contains(&SessionId::new("s11")));
}

// ============================================================================
// Session scope
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_session_records_never_leave_the_instance() {
    let hub = LocalHub::new();
    let backend = Arc::new(MemoryBackend::new());

    let mut a = open_session(&hub, backend.clone(), schema_v(1), fast_config());
    expect_loaded(&mut a).await;
    let mut b = open_session(&hub, backend.clone(), schema_v(1), fast_config());
    expect_loaded(&mut b).await;

    let observer = hub.open(&doc_id());
    let mut observed = observer.subscribe();

    a.store
        .put([Record::new("cam", "camera", json!({ "zoom": 3 }))]);

    // the session edit still schedules a write, which refreshes the
    // instance's session snapshot
    wait_until("session snapshot to be written", || {
        futures_block(backend.list_sessions(&doc_id()))
            .unwrap()
            .iter()
            .any(|s| {
                s.session_id == *a.client.session_id()
                    && s.records.iter().any(|r| r.type_name == "camera")
            })
    })
    .await;

    // but nothing was broadcast and nothing reached the shared record table
    assert!(observed.try_recv().is_err());
    assert!(b.store.get(&RecordId::new("cam")).is_none());
    let stored = backend.stored(&doc_id()).unwrap();
    assert!(!stored.records.contains_key(&RecordId::new("cam")));
}

/// Resolve a short backend future from sync polling code.
fn futures_block<F: std::future::Future>(future: F) -> F::Output {
    tokio::task::block_in_place(|| tokio::runtime::Handle::current().block_on(future))
}

// ============================================================================
// Write failure and recovery
// ============================================================================

#[tokio::test]
async fn test_write_failure_recovers_with_full_snapshot() {
    let hub = LocalHub::new();
    let backend = Arc::new(MemoryBackend::new());

    let mut a = open_session(&hub, backend.clone(), schema_v(1), fast_config());
    expect_loaded(&mut a).await;

    // settle the initial full snapshot so the next write is incremental
    a.store.put([shape("r0", 0)]);
    wait_until("initial snapshot", || backend.snapshot_write_count() >= 1).await;

    backend.fail_next_writes(1);
    a.store.put([shape("r1", 1)]);

    let event = next_event(&mut a.events).await;
    assert!(matches!(event, SessionEvent::WriteFailed(_)), "got {event:?}");
    let event = next_event(&mut a.events).await;
    assert!(
        matches!(
            event,
            SessionEvent::ReloadRequired(ReloadReason::StorageFailure)
        ),
        "got {event:?}"
    );

    // recovery after the retry delay is a full snapshot matching memory,
    // never a partial incremental patch
    wait_until("full-resync retry", || {
        backend
            .stored(&doc_id())
            .is_some_and(|s| s.records == a.store.records_in_scope(RecordScope::Document))
    })
    .await;
    assert_eq!(backend.diff_write_count(), 0);
    assert!(backend.snapshot_write_count() >= 2);
}

#[tokio::test]
async fn test_repeated_write_failures_report_reload_once() {
    let hub = LocalHub::new();
    let backend = Arc::new(MemoryBackend::new());

    let mut a = open_session(&hub, backend.clone(), schema_v(1), fast_config());
    expect_loaded(&mut a).await;

    a.store.put([shape("r0", 0)]);
    wait_until("initial snapshot", || backend.snapshot_write_count() >= 1).await;

    // two consecutive failures: the incremental write and its first retry
    backend.fail_next_writes(2);
    a.store.put([shape("r1", 1)]);

    wait_until("recovery after the retries", || {
        backend
            .stored(&doc_id())
            .is_some_and(|s| s.records.contains_key(&RecordId::new("r1")))
    })
    .await;

    // every failed attempt is reported, but the restart request only once
    let mut write_failures = 0;
    let mut reloads = 0;
    while let Ok(event) = a.events.try_recv() {
        match event {
            SessionEvent::WriteFailed(_) => write_failures += 1,
            SessionEvent::ReloadRequired(ReloadReason::StorageFailure) => reloads += 1,
            other => panic!("unexpected event {other:?}"),
        }
    }
    assert_eq!(write_failures, 2);
    assert_eq!(reloads, 1);
}

// ============================================================================
// Restart from disk
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_document_survives_restart_on_fs_backend() {
    let dir = TempDir::new().unwrap();
    let backend: Arc<dyn StorageBackend> = Arc::new(FsBackend::new(dir.path()));

    {
        let hub = LocalHub::new();
        let mut session = open_session(&hub, Arc::clone(&backend), schema_v(1), fast_config());
        expect_loaded(&mut session).await;
        session.store.put([shape("r1", 5), shape("r2", 6)]);
        session.store.remove(&[RecordId::new("r2")]);

        let cancel = CancelToken::new();
        wait_until("edits to reach disk", || {
            futures_block(backend.load(&doc_id(), &cancel))
                .unwrap()
                .is_some_and(|s| {
                    s.records.contains_key(&RecordId::new("r1"))
                        && !s.records.contains_key(&RecordId::new("r2"))
                })
        })
        .await;
    }

    // a fresh instance on the same directory recovers the document
    let hub = LocalHub::new();
    let mut reopened = open_session(&hub, backend, schema_v(1), fast_config());
    expect_loaded(&mut reopened).await;
    assert_eq!(
        reopened.store.get(&RecordId::new("r1")).unwrap().data["x"],
        json!(5)
    );
    assert!(reopened.store.get(&RecordId::new("r2")).is_none());
}
