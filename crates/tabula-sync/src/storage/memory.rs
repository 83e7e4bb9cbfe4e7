//! In-memory storage backend for tests and the soak harness.
//!
//! Behaves like a real backend (side index, atomic commits, session tables)
//! and adds failure injection so retry and full-resync paths can be driven
//! deterministically.

use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use tabula_store::{Record, RecordId, RecordsDiff, SerializedSchema};

use super::{CancelToken, Result, SessionSnapshot, StorageBackend, StorageError, StoredSnapshot};
use crate::ids::{DocumentId, SessionId};

#[derive(Clone)]
struct StoredDocument {
    records: BTreeMap<RecordId, Record>,
    schema: SerializedSchema,
    sessions: BTreeMap<SessionId, SessionSnapshot>,
}

/// Storage backend holding everything in process memory.
#[derive(Default)]
pub struct MemoryBackend {
    documents: Mutex<HashMap<DocumentId, StoredDocument>>,
    unavailable: AtomicBool,
    fail_writes_remaining: AtomicUsize,
    snapshot_writes: AtomicUsize,
    diff_writes: AtomicUsize,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    // ========================================================================
    // Test knobs
    // ========================================================================

    /// Make every operation fail until cleared.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Make the next `n` write attempts fail, then recover.
    pub fn fail_next_writes(&self, n: usize) {
        self.fail_writes_remaining.store(n, Ordering::SeqCst);
    }

    /// Committed full-snapshot writes so far.
    pub fn snapshot_write_count(&self) -> usize {
        self.snapshot_writes.load(Ordering::SeqCst)
    }

    /// Committed incremental writes so far.
    pub fn diff_write_count(&self) -> usize {
        self.diff_writes.load(Ordering::SeqCst)
    }

    /// Current durable state of a document, if any.
    pub fn stored(&self, document_id: &DocumentId) -> Option<StoredSnapshot> {
        let documents = self.documents.lock().unwrap_or_else(|e| e.into_inner());
        documents.get(document_id).map(|doc| StoredSnapshot {
            records: doc.records.clone(),
            schema: doc.schema.clone(),
        })
    }

    /// Pre-load a document snapshot, as if an earlier run had written it.
    pub fn seed_document(
        &self,
        document_id: &DocumentId,
        records: BTreeMap<RecordId, Record>,
        schema: SerializedSchema,
    ) {
        let mut documents = self.documents.lock().unwrap_or_else(|e| e.into_inner());
        let doc = documents
            .entry(document_id.clone())
            .or_insert_with(|| StoredDocument {
                records: BTreeMap::new(),
                schema: schema.clone(),
                sessions: BTreeMap::new(),
            });
        doc.records = records;
        doc.schema = schema;
    }

    /// Pre-load a session snapshot for a document.
    pub fn seed_session(&self, document_id: &DocumentId, session: SessionSnapshot) {
        let mut documents = self.documents.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(doc) = documents.get_mut(document_id) {
            doc.sessions.insert(session.session_id.clone(), session);
        }
    }

    // ========================================================================
    // Internals
    // ========================================================================

    fn check_available(&self) -> Result<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StorageError::Unavailable(
                "backend marked unavailable".to_string(),
            ));
        }
        Ok(())
    }

    fn take_injected_write_failure(&self) -> Result<()> {
        let remaining = self.fail_writes_remaining.load(Ordering::SeqCst);
        if remaining > 0 {
            self.fail_writes_remaining
                .store(remaining - 1, Ordering::SeqCst);
            return Err(StorageError::Unavailable(
                "injected write failure".to_string(),
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl StorageBackend for MemoryBackend {
    async fn load(
        &self,
        document_id: &DocumentId,
        cancel: &CancelToken,
    ) -> Result<Option<StoredSnapshot>> {
        cancel.check()?;
        self.check_available()?;
        Ok(self.stored(document_id))
    }

    async fn write_diff(
        &self,
        document_id: &DocumentId,
        diff: &RecordsDiff,
        schema: &SerializedSchema,
        session: Option<&SessionSnapshot>,
        cancel: &CancelToken,
    ) -> Result<()> {
        cancel.check()?;
        self.check_available()?;
        self.take_injected_write_failure()?;

        let mut documents = self.documents.lock().unwrap_or_else(|e| e.into_inner());
        cancel.check()?;
        let doc = documents
            .entry(document_id.clone())
            .or_insert_with(|| StoredDocument {
                records: BTreeMap::new(),
                schema: schema.clone(),
                sessions: BTreeMap::new(),
            });
        diff.apply_to(&mut doc.records);
        doc.schema = schema.clone();
        if let Some(session) = session {
            doc.sessions
                .insert(session.session_id.clone(), session.clone());
        }
        self.diff_writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn write_snapshot(
        &self,
        document_id: &DocumentId,
        records: &BTreeMap<RecordId, Record>,
        schema: &SerializedSchema,
        session: Option<&SessionSnapshot>,
        cancel: &CancelToken,
    ) -> Result<()> {
        cancel.check()?;
        self.check_available()?;
        self.take_injected_write_failure()?;

        let mut documents = self.documents.lock().unwrap_or_else(|e| e.into_inner());
        cancel.check()?;
        let doc = documents
            .entry(document_id.clone())
            .or_insert_with(|| StoredDocument {
                records: BTreeMap::new(),
                schema: schema.clone(),
                sessions: BTreeMap::new(),
            });
        doc.records = records.clone();
        doc.schema = schema.clone();
        if let Some(session) = session {
            doc.sessions
                .insert(session.session_id.clone(), session.clone());
        }
        self.snapshot_writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn list_documents(&self) -> Result<Vec<DocumentId>> {
        self.check_available()?;
        let documents = self.documents.lock().unwrap_or_else(|e| e.into_inner());
        let mut ids: Vec<DocumentId> = documents.keys().cloned().collect();
        ids.sort();
        Ok(ids)
    }

    async fn list_sessions(&self, document_id: &DocumentId) -> Result<Vec<SessionSnapshot>> {
        self.check_available()?;
        let documents = self.documents.lock().unwrap_or_else(|e| e.into_inner());
        let mut sessions: Vec<SessionSnapshot> = documents
            .get(document_id)
            .map(|doc| doc.sessions.values().cloned().collect())
            .unwrap_or_default();
        sessions.sort_by(|a, b| {
            b.updated_at_ms
                .cmp(&a.updated_at_ms)
                .then_with(|| a.session_id.cmp(&b.session_id))
        });
        Ok(sessions)
    }

    async fn prune_sessions(
        &self,
        document_id: &DocumentId,
        keep: usize,
        cancel: &CancelToken,
    ) -> Result<()> {
        cancel.check()?;
        self.check_available()?;
        let mut documents = self.documents.lock().unwrap_or_else(|e| e.into_inner());
        let Some(doc) = documents.get_mut(document_id) else {
            return Ok(());
        };
        if doc.sessions.len() <= keep {
            return Ok(());
        }
        let mut sessions: Vec<SessionSnapshot> = doc.sessions.values().cloned().collect();
        sessions.sort_by(|a, b| b.updated_at_ms.cmp(&a.updated_at_ms));
        sessions.truncate(keep);
        doc.sessions = sessions
            .into_iter()
            .map(|s| (s.session_id.clone(), s))
            .collect();
        Ok(())
    }
}
