//! In-memory record store with a filtered change feed.
//!
//! The store is the single source of truth for one open document in one
//! instance. Every mutation computes the diff it actually caused and pushes
//! it to listeners, filtered by change source (user vs. remote) and record
//! scope, so the sync layer can react without polling.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, RwLock, Weak};

use thiserror::Error;
use tracing::warn;

use crate::diff::RecordsDiff;
use crate::record::{Record, RecordId, RecordScope};
use crate::schema::{SerializedSchema, StoreSchema};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("record not found: {0}")]
    RecordNotFound(RecordId),
    #[error("unknown record type: {0}")]
    UnknownType(String),
    #[error("record {id} failed validation: {reason}")]
    InvalidRecord { id: RecordId, reason: String },
}

/// Who caused a batch of changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeSource {
    /// A local call to `put`/`update`/`remove`.
    User,
    /// A peer diff or a loaded snapshot being merged in.
    Remote,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SourceFilter {
    User,
    Remote,
    #[default]
    All,
}

impl SourceFilter {
    fn matches(self, source: ChangeSource) -> bool {
        match self {
            SourceFilter::All => true,
            SourceFilter::User => source == ChangeSource::User,
            SourceFilter::Remote => source == ChangeSource::Remote,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ScopeFilter {
    Document,
    Session,
    #[default]
    All,
}

/// What a listener wants to hear about.
#[derive(Debug, Clone, Copy, Default)]
pub struct ListenFilter {
    pub source: SourceFilter,
    pub scope: ScopeFilter,
}

impl ListenFilter {
    pub fn new(source: SourceFilter, scope: ScopeFilter) -> Self {
        Self { source, scope }
    }
}

/// One dispatched batch: the (scope-filtered) diff and who caused it.
#[derive(Debug, Clone)]
pub struct ChangeSet {
    pub changes: RecordsDiff,
    pub source: ChangeSource,
}

type ListenerFn = Arc<dyn Fn(&ChangeSet) + Send + Sync>;
type ListenerTable = RwLock<Vec<(usize, ListenFilter, ListenerFn)>>;

/// Listener handle that unsubscribes automatically when dropped.
///
/// Follows the disposer pattern: hold this value to keep receiving changes,
/// drop it to unsubscribe.
pub struct ChangeSubscription {
    listeners: Weak<ListenerTable>,
    id: usize,
}

impl Drop for ChangeSubscription {
    fn drop(&mut self) {
        if let Some(listeners) = self.listeners.upgrade() {
            // try_write so a Drop during panic unwinding cannot deadlock
            // against a dispatch holding the read lock
            if let Ok(mut guard) = listeners.try_write() {
                guard.retain(|(id, _, _)| *id != self.id);
            }
        }
    }
}

/// Reactive record map for one open document.
pub struct Store {
    schema: Arc<StoreSchema>,
    records: RwLock<BTreeMap<RecordId, Record>>,
    listeners: Arc<ListenerTable>,
    next_listener_id: AtomicUsize,
    possibly_corrupted: AtomicBool,
}

impl Store {
    pub fn new(schema: Arc<StoreSchema>) -> Self {
        Self {
            schema,
            records: RwLock::new(BTreeMap::new()),
            listeners: Arc::new(RwLock::new(Vec::new())),
            next_listener_id: AtomicUsize::new(0),
            possibly_corrupted: AtomicBool::new(false),
        }
    }

    pub fn schema(&self) -> Arc<StoreSchema> {
        Arc::clone(&self.schema)
    }

    pub fn serialized_schema(&self) -> SerializedSchema {
        self.schema.serialized()
    }

    // ========================================================================
    // Mutations (user source)
    // ========================================================================

    /// Insert or replace records. Records identical to what is already held
    /// produce no change.
    pub fn put(&self, records: impl IntoIterator<Item = Record>) {
        let mut diff = RecordsDiff::default();
        {
            let mut map = self.records.write().unwrap_or_else(|e| e.into_inner());
            for record in records {
                upsert(&mut map, &mut diff, &record);
            }
        }
        self.dispatch(diff, ChangeSource::User);
    }

    /// Remove records by id. Absent ids are ignored.
    pub fn remove(&self, ids: &[RecordId]) {
        let mut diff = RecordsDiff::default();
        {
            let mut map = self.records.write().unwrap_or_else(|e| e.into_inner());
            for id in ids {
                if let Some(prev) = map.remove(id) {
                    diff.removed.insert(id.clone(), prev);
                }
            }
        }
        self.dispatch(diff, ChangeSource::User);
    }

    /// Transform one record in place.
    pub fn update(
        &self,
        id: &RecordId,
        f: impl FnOnce(Record) -> Record,
    ) -> Result<(), StoreError> {
        let mut diff = RecordsDiff::default();
        {
            let mut map = self.records.write().unwrap_or_else(|e| e.into_inner());
            let prev = map
                .get(id)
                .cloned()
                .ok_or_else(|| StoreError::RecordNotFound(id.clone()))?;
            let next = f(prev.clone());
            if next != prev {
                diff.updated.insert(id.clone(), (prev, next.clone()));
                map.insert(id.clone(), next);
            }
        }
        self.dispatch(diff, ChangeSource::User);
        Ok(())
    }

    // ========================================================================
    // Mutations (remote source)
    // ========================================================================

    /// Merge a diff received from a peer. Tolerant of divergence: adds
    /// upsert, updates write the incoming current value whatever we hold,
    /// removes of absent ids do nothing.
    ///
    /// Returns the diff that actually changed the map. Re-applying the same
    /// incoming diff therefore observes nothing and dispatches nothing.
    pub fn merge_remote(&self, diff: &RecordsDiff) -> RecordsDiff {
        let mut observed = RecordsDiff::default();
        {
            let mut map = self.records.write().unwrap_or_else(|e| e.into_inner());
            for record in diff.added.values() {
                upsert(&mut map, &mut observed, record);
            }
            for (_, current) in diff.updated.values() {
                upsert(&mut map, &mut observed, current);
            }
            for id in diff.removed.keys() {
                if let Some(prev) = map.remove(id) {
                    observed.removed.insert(id.clone(), prev);
                }
            }
        }
        self.dispatch(observed.clone(), ChangeSource::Remote);
        observed
    }

    /// Merge records recovered from storage at startup. Dispatched as a
    /// remote change so it is neither re-broadcast nor queued as a user edit.
    pub fn load_initial(&self, records: impl IntoIterator<Item = Record>) {
        let mut observed = RecordsDiff::default();
        {
            let mut map = self.records.write().unwrap_or_else(|e| e.into_inner());
            for record in records {
                upsert(&mut map, &mut observed, &record);
            }
        }
        self.dispatch(observed, ChangeSource::Remote);
    }

    // ========================================================================
    // Reads
    // ========================================================================

    pub fn get(&self, id: &RecordId) -> Option<Record> {
        self.records
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(id)
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.records.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// All records whose type has the given scope, id-ordered.
    pub fn records_in_scope(&self, scope: RecordScope) -> BTreeMap<RecordId, Record> {
        self.records
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .filter(|(_, r)| {
                self.schema
                    .scope_of(&r.type_name)
                    .unwrap_or(RecordScope::Document)
                    == scope
            })
            .map(|(id, r)| (id.clone(), r.clone()))
            .collect()
    }

    // ========================================================================
    // Integrity
    // ========================================================================

    /// Verify every held record against the schema: known type, validator
    /// passes.
    pub fn check_integrity(&self) -> Result<(), StoreError> {
        let map = self.records.read().unwrap_or_else(|e| e.into_inner());
        for record in map.values() {
            if self.schema.scope_of(&record.type_name).is_none() {
                return Err(StoreError::UnknownType(record.type_name.clone()));
            }
            self.schema
                .validate(record)
                .map_err(|reason| StoreError::InvalidRecord {
                    id: record.id.clone(),
                    reason,
                })?;
        }
        Ok(())
    }

    /// Flag the store as suspect after a failed integrity check. Sticky;
    /// persistence stops touching durable state while the flag is set.
    pub fn mark_possibly_corrupted(&self) {
        if !self.possibly_corrupted.swap(true, Ordering::SeqCst) {
            warn!("store flagged as possibly corrupted, suspending persistence");
        }
    }

    pub fn is_possibly_corrupted(&self) -> bool {
        self.possibly_corrupted.load(Ordering::SeqCst)
    }

    // ========================================================================
    // Change feed
    // ========================================================================

    /// Subscribe to changes matching `filter`. The diff each listener sees is
    /// already narrowed to the subscribed scope. Returns a handle that
    /// unsubscribes on drop.
    pub fn listen(
        &self,
        filter: ListenFilter,
        callback: impl Fn(&ChangeSet) + Send + Sync + 'static,
    ) -> ChangeSubscription {
        let id = self.next_listener_id.fetch_add(1, Ordering::Relaxed);
        self.listeners
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push((id, filter, Arc::new(callback)));
        ChangeSubscription {
            listeners: Arc::downgrade(&self.listeners),
            id,
        }
    }

    fn dispatch(&self, changes: RecordsDiff, source: ChangeSource) {
        if changes.is_empty() {
            return;
        }
        // Clone the listener list so a callback can subscribe or mutate the
        // store without deadlocking.
        let listeners: Vec<(ListenFilter, ListenerFn)> = self
            .listeners
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .map(|(_, filter, cb)| (*filter, Arc::clone(cb)))
            .collect();

        for (filter, callback) in listeners {
            if !filter.source.matches(source) {
                continue;
            }
            let scoped = match filter.scope {
                ScopeFilter::All => changes.clone(),
                ScopeFilter::Document => {
                    changes.filter_scope(&self.schema, RecordScope::Document)
                }
                ScopeFilter::Session => changes.filter_scope(&self.schema, RecordScope::Session),
            };
            if scoped.is_empty() {
                continue;
            }
            callback(&ChangeSet {
                changes: scoped,
                source,
            });
        }
    }
}

fn upsert(map: &mut BTreeMap<RecordId, Record>, observed: &mut RecordsDiff, record: &Record) {
    match map.get(&record.id) {
        Some(prev) if prev == record => {}
        Some(prev) => {
            observed
                .updated
                .insert(record.id.clone(), (prev.clone(), record.clone()));
            map.insert(record.id.clone(), record.clone());
        }
        None => {
            observed.added.insert(record.id.clone(), record.clone());
            map.insert(record.id.clone(), record.clone());
        }
    }
}
