//! The synchronization client: one per open editing session.
//!
//! Owns the persistence scheduler, consumes the store's change feed, drives
//! the broadcast channel, and runs the schema-negotiation protocol. Created
//! once per session, disposed on close; owner-facing outcomes (loaded, load
//! failed, write failed, reload required, fatal mismatch) arrive on the
//! event channel returned by the constructor.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use tabula_store::{
    ChangeSubscription, ListenFilter, MigrationError, RecordScope, RecordsDiff, SchemaOrdering,
    ScopeFilter, SerializedSchema, SourceFilter, Store,
};
use thiserror::Error;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use web_time::Instant;

use crate::channel::DocumentChannel;
use crate::ids::{DocumentId, SessionId};
use crate::messages::BroadcastMessage;
use crate::scheduler::{ClientStatus, PersistenceState, SyncConfig, WriteMode};
use crate::storage::{CancelToken, SessionSnapshot, StorageBackend, StorageError};

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("storage unreadable: {0}")]
    Storage(#[from] StorageError),
    #[error("persisted snapshot cannot be migrated: {0}")]
    Migration(#[from] MigrationError),
}

#[derive(Debug, Error)]
pub enum WriteError {
    #[error("storage write failed: {0}")]
    Storage(#[from] StorageError),
}

/// Why the owner is being asked to restart the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReloadReason {
    /// A peer announced a newer schema; a restart picks up the newer build's
    /// state without this instance clobbering it.
    NewerSchemaInPeer,
    /// The durable store could not be read or written; partial in-memory
    /// state cannot be trusted against it, so a clean restart is the only
    /// safe recovery.
    StorageFailure,
}

/// Owner-facing session outcomes.
#[derive(Debug)]
pub enum SessionEvent {
    /// Startup finished: persisted state (if any) is loaded and migrated,
    /// presence announced.
    Loaded,
    /// Startup failed. Sent at most once; the session will not announce or
    /// persist afterwards.
    LoadFailed(LoadError),
    /// A persistence attempt failed. The client keeps retrying on the long
    /// delay, but the failure is never silent: unpersisted edits are real
    /// data at risk.
    WriteFailed(WriteError),
    /// The owner should restart this session from durable state. Sent at
    /// most once per reason.
    ReloadRequired(ReloadReason),
    /// Local schema is behind a peer's but the session just started,
    /// indicating an unexpected downgrade (or a divergent lineage).
    /// Auto-reloading would loop; a blocking error is required instead.
    FatalSchemaMismatch {
        local: SerializedSchema,
        remote: SerializedSchema,
    },
}

struct ClientInner {
    weak: Weak<ClientInner>,
    document_id: DocumentId,
    session_id: SessionId,
    config: SyncConfig,
    store: Arc<Store>,
    storage: Arc<dyn StorageBackend>,
    channel: Arc<dyn DocumentChannel>,
    state: Mutex<PersistenceState>,
    events: UnboundedSender<SessionEvent>,
    cancel: CancelToken,
    started_at: Instant,
    disposed: AtomicBool,
    // latches ReloadRequired(StorageFailure) to a single emission
    storage_reload_sent: AtomicBool,
    timer_task: Mutex<Option<JoinHandle<()>>>,
}

/// One editing session's synchronization client.
///
/// Dropping (or calling [`close`]) disposes the client: store subscriptions
/// are released, background tasks aborted, the broadcast handle closed, and
/// any in-flight storage transaction cancelled before it commits.
///
/// [`close`]: SyncClient::close
pub struct SyncClient {
    inner: Arc<ClientInner>,
    _subscriptions: Vec<ChangeSubscription>,
    startup_task: Option<JoinHandle<()>>,
    receive_task: Option<JoinHandle<()>>,
}

impl SyncClient {
    /// Open a client for one document. Must be called inside a tokio
    /// runtime; the startup sequence and the receive loop run as spawned
    /// tasks.
    pub fn new(
        document_id: DocumentId,
        store: Arc<Store>,
        storage: Arc<dyn StorageBackend>,
        channel: Arc<dyn DocumentChannel>,
        config: SyncConfig,
    ) -> (Self, UnboundedReceiver<SessionEvent>) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let inner = Arc::new_cyclic(|weak| ClientInner {
            weak: weak.clone(),
            document_id,
            session_id: SessionId::generate(),
            config,
            store: Arc::clone(&store),
            storage,
            channel,
            state: Mutex::new(PersistenceState::new()),
            events: events_tx,
            cancel: CancelToken::new(),
            started_at: Instant::now(),
            disposed: AtomicBool::new(false),
            storage_reload_sent: AtomicBool::new(false),
            timer_task: Mutex::new(None),
        });

        // Store subscriptions hold Weak back-references so the client and
        // the store never form a strong cycle across open/close cycles.
        let document_sub = {
            let weak = Arc::downgrade(&inner);
            store.listen(
                ListenFilter::new(SourceFilter::User, ScopeFilter::Document),
                move |change| {
                    if let Some(inner) = weak.upgrade() {
                        inner.on_local_document_change(&change.changes);
                    }
                },
            )
        };
        let session_sub = {
            let weak = Arc::downgrade(&inner);
            store.listen(
                ListenFilter::new(SourceFilter::User, ScopeFilter::Session),
                move |_change| {
                    if let Some(inner) = weak.upgrade() {
                        inner.on_local_session_change();
                    }
                },
            )
        };

        let startup_task = tokio::spawn({
            let inner = Arc::clone(&inner);
            async move { inner.run_startup().await }
        });
        let receiver = inner.channel.subscribe();
        let receive_task = tokio::spawn({
            let inner = Arc::clone(&inner);
            async move { inner.run_receive(receiver).await }
        });

        (
            Self {
                inner,
                _subscriptions: vec![document_sub, session_sub],
                startup_task: Some(startup_task),
                receive_task: Some(receive_task),
            },
            events_rx,
        )
    }

    pub fn document_id(&self) -> &DocumentId {
        &self.inner.document_id
    }

    pub fn session_id(&self) -> &SessionId {
        &self.inner.session_id
    }

    pub fn status(&self) -> ClientStatus {
        self.inner.state().status()
    }

    pub fn is_disposed(&self) -> bool {
        self.inner.disposed.load(Ordering::SeqCst)
    }

    /// Dispose the client. Idempotent; also happens on drop.
    pub fn close(&mut self) {
        if self.inner.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        debug!(document = %self.inner.document_id, "closing sync client");
        self.inner.cancel.cancel();
        if let Some(task) = self.startup_task.take() {
            task.abort();
        }
        if let Some(task) = self.receive_task.take() {
            task.abort();
        }
        if let Some(task) = self
            .inner
            .timer_task
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        {
            task.abort();
        }
        self._subscriptions.clear();
        self.inner.channel.close();
    }
}

impl Drop for SyncClient {
    fn drop(&mut self) {
        self.close();
    }
}

impl ClientInner {
    fn state(&self) -> MutexGuard<'_, PersistenceState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }

    fn emit(&self, event: SessionEvent) {
        // the owner dropping the receiver is not our problem
        let _ = self.events.send(event);
    }

    // ========================================================================
    // Startup
    // ========================================================================

    /// Load, migrate, merge, announce. Every await re-checks disposal via
    /// the cancel token; a disposed client aborts with nothing committed.
    async fn run_startup(self: Arc<Self>) {
        // opportunistic housekeeping; never blocks startup
        if let Err(err) = self
            .storage
            .prune_sessions(
                &self.document_id,
                self.config.session_retention,
                &self.cancel,
            )
            .await
        {
            debug!(error = %err, "session prune failed, continuing");
        }

        match self.storage.load(&self.document_id, &self.cancel).await {
            Ok(None) => {
                debug!(document = %self.document_id, "no persisted state, starting empty");
            }
            Ok(Some(snapshot)) => {
                let schema = self.store.schema();
                match schema.migrate_records(snapshot.records, &snapshot.schema) {
                    Ok(records) => {
                        // Session-scope rows belong to some other instance's
                        // snapshot; only document state is recovered here.
                        let document_records = records.into_values().filter(|record| {
                            schema
                                .scope_of(&record.type_name)
                                .unwrap_or(RecordScope::Document)
                                == RecordScope::Document
                        });
                        self.store.load_initial(document_records);
                    }
                    Err(err) => {
                        error!(error = %err, "persisted snapshot cannot be migrated");
                        // the persisted state may belong to a newer build;
                        // edits from this one must never persist or broadcast
                        // over it
                        self.state().halt();
                        self.emit(SessionEvent::LoadFailed(err.into()));
                        return;
                    }
                }
            }
            Err(StorageError::Cancelled) => return,
            Err(err) => {
                error!(error = %err, "failed to load persisted snapshot");
                self.emit(SessionEvent::LoadFailed(err.into()));
                // stop persisting until the owner restarts us against a
                // store we can actually read
                self.state().request_reload();
                self.storage_reload_sent.store(true, Ordering::SeqCst);
                self.emit(SessionEvent::ReloadRequired(ReloadReason::StorageFailure));
                return;
            }
        }

        if self.is_disposed() {
            return;
        }
        // Existing peers learn our schema before any real edit occurs, so
        // staleness in either direction is detected immediately.
        self.channel.publish(BroadcastMessage::Announce {
            schema: self.store.serialized_schema(),
        });
        info!(document = %self.document_id, session = %self.session_id, "session loaded");
        self.emit(SessionEvent::Loaded);
    }

    // ========================================================================
    // Change feed
    // ========================================================================

    fn on_local_document_change(&self, changes: &RecordsDiff) {
        if self.is_disposed() {
            return;
        }
        {
            let mut state = self.state();
            if state.status() != ClientStatus::Running {
                return;
            }
            state.enqueue_diff(changes.clone());
        }
        self.channel.publish(BroadcastMessage::Diff {
            document_id: self.document_id.clone(),
            changes: changes.clone(),
            schema: self.store.serialized_schema(),
        });
        self.schedule_persist();
    }

    fn on_local_session_change(&self) {
        if self.is_disposed() {
            return;
        }
        self.state().enqueue_session_change();
        self.schedule_persist();
    }

    // ========================================================================
    // Peer messages
    // ========================================================================

    async fn run_receive(self: Arc<Self>, mut receiver: UnboundedReceiver<BroadcastMessage>) {
        while let Some(message) = receiver.recv().await {
            if self.is_disposed() {
                break;
            }
            self.on_message(message);
        }
    }

    fn on_message(&self, message: BroadcastMessage) {
        let local = self.store.serialized_schema();
        match local.compare(message.schema()) {
            SchemaOrdering::Behind => {
                if self.started_at.elapsed() < self.config.min_uptime_for_reload {
                    // A newer peer this early in life usually means a
                    // downgraded build is still open somewhere; reloading
                    // would loop forever.
                    self.halt_with_mismatch(local, message.schema().clone());
                } else if self.state().request_reload() {
                    info!(
                        local = %local,
                        remote = %message.schema(),
                        "peer has a newer schema, requesting session restart"
                    );
                    self.emit(SessionEvent::ReloadRequired(ReloadReason::NewerSchemaInPeer));
                }
            }
            SchemaOrdering::Incompatible => {
                // a divergent lineage can never be fixed by restarting
                self.halt_with_mismatch(local, message.schema().clone());
            }
            SchemaOrdering::Ahead => {
                debug!(remote = %message.schema(), "peer is behind, announcing current schema");
                self.channel
                    .publish(BroadcastMessage::Announce { schema: local });
                // the stale peer may have written stale rows already;
                // supersede them wholesale on the next write
                self.state().request_full_write();
                self.schedule_persist();
            }
            SchemaOrdering::Equal => {
                if let BroadcastMessage::Diff {
                    document_id,
                    changes,
                    ..
                } = message
                {
                    if document_id != self.document_id {
                        return;
                    }
                    let observed = self.store.merge_remote(&changes);
                    if !observed.is_empty() {
                        if let Err(err) = self.store.check_integrity() {
                            warn!(error = %err, "store inconsistent after remote diff");
                            self.store.mark_possibly_corrupted();
                        }
                    }
                }
            }
        }
    }

    fn halt_with_mismatch(&self, local: SerializedSchema, remote: SerializedSchema) {
        if self.state().halt() {
            error!(%local, %remote, "unresolvable schema mismatch, halting session");
            self.emit(SessionEvent::FatalSchemaMismatch { local, remote });
        }
    }

    // ========================================================================
    // Persistence
    // ========================================================================

    /// Arm the debounce (or retry) timer. Idempotent while a timer is
    /// pending.
    fn schedule_persist(&self) {
        if self.is_disposed() {
            return;
        }
        let delay = {
            let mut state = self.state();
            if !state.arm_timer() {
                return;
            }
            state.next_delay(&self.config)
        };
        let weak = self.weak.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let Some(inner) = weak.upgrade() else {
                return;
            };
            if inner.is_disposed() {
                return;
            }
            inner.state().timer_fired();
            inner.persist_if_needed().await;
        });
        *self.timer_task.lock().unwrap_or_else(|e| e.into_inner()) = Some(handle);
    }

    async fn persist_if_needed(&self) {
        if self.store.is_possibly_corrupted() {
            // suspended until the owner intervenes; retrying would persist
            // state we already know is invalid
            return;
        }
        // begin_write also refuses while another write is in flight, after a
        // reload was requested, or when nothing is queued
        let Some(mode) = self.state().begin_write() else {
            return;
        };
        self.do_persist(mode).await;
    }

    async fn do_persist(&self, mode: WriteMode) {
        let schema = self.store.serialized_schema();
        let session = self.session_snapshot();
        let result = match mode {
            WriteMode::Full => {
                let records = self.store.records_in_scope(RecordScope::Document);
                debug!(records = records.len(), "writing full snapshot");
                self.storage
                    .write_snapshot(
                        &self.document_id,
                        &records,
                        &schema,
                        Some(&session),
                        &self.cancel,
                    )
                    .await
            }
            WriteMode::Incremental(diff) => {
                debug!(changes = diff.len(), "writing incremental diff");
                // an empty diff still refreshes the schema stamp and the
                // session snapshot
                self.storage
                    .write_diff(
                        &self.document_id,
                        &diff,
                        &schema,
                        Some(&session),
                        &self.cancel,
                    )
                    .await
            }
        };

        match result {
            Ok(()) => {
                let has_work = {
                    let mut state = self.state();
                    state.finish_write(true);
                    state.has_work()
                };
                // catch anything queued while the write was in flight
                if has_work {
                    self.schedule_persist();
                }
            }
            Err(StorageError::Cancelled) => {
                // disposal raced the write; nothing committed, nothing to
                // surface
                self.state().finish_write(false);
            }
            Err(err) => {
                self.state().finish_write(false);
                warn!(error = %err, "persistence failed, switching to full-resync retries");
                self.emit(SessionEvent::WriteFailed(err.into()));
                if !self.storage_reload_sent.swap(true, Ordering::SeqCst) {
                    self.emit(SessionEvent::ReloadRequired(ReloadReason::StorageFailure));
                }
                // keep retrying on the long delay in case storage heals
                // before the owner acts
                self.schedule_persist();
            }
        }
    }

    fn session_snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            session_id: self.session_id.clone(),
            records: self
                .store
                .records_in_scope(RecordScope::Session)
                .into_values()
                .collect(),
            updated_at_ms: now_ms(),
        }
    }
}

fn now_ms() -> u64 {
    web_time::SystemTime::now()
        .duration_since(web_time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
